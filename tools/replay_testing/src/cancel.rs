use crate::errors::ReplayError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes Ctrl-C into this token, so the orchestrator tears down the current
    /// launch graph instead of the harness dying with children still running.
    /// Only one handler can be installed per process.
    pub fn install_ctrlc_handler(&self) -> Result<(), ReplayError> {
        let flag = Arc::clone(&self.flag);
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .map_err(|e| ReplayError::Process(format!("install Ctrl-C handler: {e}")))
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
