use crate::errors::ReplayError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// When set, stdout and stderr are appended to this file instead of captured.
    pub log_path: Option<PathBuf>,
}

impl ProcessRequest {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Self::default()
        }
    }

    pub fn display_command(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ReplayError>;

    fn sleep(&self, duration: Duration) -> Result<(), ReplayError> {
        self.sleep_until(self.now() + duration)
    }
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, ReplayError>;
    fn wait(&self, handle: u64) -> Result<ProcessOutput, ReplayError>;
    /// Returns the output once the process has exited, `None` while it is still running.
    fn try_wait(&self, handle: u64) -> Result<Option<ProcessOutput>, ReplayError>;
    /// Asks the process group to shut down cleanly. Valid after the leader exited.
    fn interrupt(&self, handle: u64) -> Result<(), ReplayError>;
    fn kill(&self, handle: u64) -> Result<(), ReplayError>;

    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, ReplayError> {
        let handle = self.spawn(request)?;
        self.wait(handle)
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, ReplayError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ReplayError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), ReplayError>;
    fn remove_file(&self, path: &Path) -> Result<(), ReplayError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait Terminal: Send + Sync {
    fn stdout_is_tty(&self) -> bool;
    fn write_line(&self, line: &str) -> Result<(), ReplayError>;
    fn draw(&self, frame: &str) -> Result<(), ReplayError>;
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, ReplayError> {
    mutex
        .lock()
        .map_err(|_| ReplayError::Process("process table lock poisoned".to_string()))
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ReplayError> {
        let now = SystemTime::now();
        if let Ok(duration) = deadline.duration_since(now) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ReplayError> {
        std::fs::read_to_string(path)
            .map_err(|e| ReplayError::Io(format!("{}: {e}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ReplayError> {
        std::fs::write(path, contents).map_err(|e| ReplayError::Io(e.to_string()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), ReplayError> {
        std::fs::create_dir_all(path).map_err(|e| ReplayError::Io(e.to_string()))
    }

    fn remove_file(&self, path: &Path) -> Result<(), ReplayError> {
        std::fs::remove_file(path).map_err(|e| ReplayError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[derive(Default)]
struct ProcessState {
    next_handle: u64,
    children: HashMap<u64, std::process::Child>,
    /// Process group of every spawned handle, kept after the leader is reaped so
    /// teardown can still reach whatever the leader left behind.
    groups: HashMap<u64, u32>,
}

pub struct ProductionProcessRunner {
    state: Mutex<ProcessState>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
        }
    }

    fn take_child(&self, handle: u64) -> Result<std::process::Child, ReplayError> {
        lock(&self.state)?
            .children
            .remove(&handle)
            .ok_or_else(|| ReplayError::Process(format!("unknown handle {handle}")))
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn output_from(output: std::process::Output) -> ProcessOutput {
    ProcessOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> Result<(), ReplayError> {
    let pid = pgid as libc::pid_t;
    // Children are spawned as process group leaders, so -pid reaches the whole launch subtree.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(ReplayError::Process(format!("signal {signal} to {pid}: {err}")));
        }
    }
    Ok(())
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, ReplayError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(log_path) = &request.log_path {
            if let Some(parent) = log_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| ReplayError::Io(e.to_string()))?;
            }
            let log = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .map_err(|e| ReplayError::Io(e.to_string()))?;
            let log_err = log.try_clone().map_err(|e| ReplayError::Io(e.to_string()))?;
            cmd.stdin(std::process::Stdio::null())
                .stdout(log)
                .stderr(log_err);
        } else {
            cmd.stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped());
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .map_err(|e| ReplayError::Process(format!("{}: {e}", request.program)))?;
        let mut state = lock(&self.state)?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.groups.insert(handle, child.id());
        state.children.insert(handle, child);
        Ok(handle)
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, ReplayError> {
        let child = self.take_child(handle)?;
        let output = child
            .wait_with_output()
            .map_err(|e| ReplayError::Process(e.to_string()))?;
        Ok(output_from(output))
    }

    fn try_wait(&self, handle: u64) -> Result<Option<ProcessOutput>, ReplayError> {
        let exited = {
            let mut state = lock(&self.state)?;
            let child = state
                .children
                .get_mut(&handle)
                .ok_or_else(|| ReplayError::Process(format!("unknown handle {handle}")))?;
            child
                .try_wait()
                .map_err(|e| ReplayError::Process(e.to_string()))?
                .is_some()
        };
        if !exited {
            return Ok(None);
        }
        self.wait(handle).map(Some)
    }

    fn interrupt(&self, handle: u64) -> Result<(), ReplayError> {
        let pgid = *lock(&self.state)?
            .groups
            .get(&handle)
            .ok_or_else(|| ReplayError::Process(format!("unknown handle {handle}")))?;
        #[cfg(unix)]
        {
            signal_group(pgid, libc::SIGINT)
        }
        #[cfg(not(unix))]
        {
            let _ = pgid;
            Ok(())
        }
    }

    fn kill(&self, handle: u64) -> Result<(), ReplayError> {
        let mut child = self.take_child(handle)?;
        #[cfg(unix)]
        signal_group(child.id(), libc::SIGKILL)?;
        #[cfg(not(unix))]
        child
            .kill()
            .map_err(|e| ReplayError::Process(e.to_string()))?;
        child
            .wait()
            .map(|_| ())
            .map_err(|e| ReplayError::Process(e.to_string()))
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn stdout_is_tty(&self) -> bool {
        std::io::IsTerminal::is_terminal(&std::io::stdout())
    }

    fn write_line(&self, line: &str) -> Result<(), ReplayError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| ReplayError::Io(e.to_string()))
    }

    fn draw(&self, frame: &str) -> Result<(), ReplayError> {
        self.write_line(frame)
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), ReplayError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        *self.now.lock().expect("clock lock") = deadline;
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    pub fn created_dirs(&self) -> Vec<PathBuf> {
        self.dirs.lock().expect("dirs lock").clone()
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ReplayError> {
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| ReplayError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), ReplayError> {
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), ReplayError> {
        self.dirs
            .lock()
            .expect("dirs lock")
            .push(path.to_path_buf());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<(), ReplayError> {
        self.files.lock().expect("files lock").remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    pub is_tty: bool,
    writes: Arc<Mutex<Vec<String>>>,
    draws: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn new(is_tty: bool) -> Self {
        Self {
            is_tty,
            ..Self::default()
        }
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }

    pub fn drawn_frames(&self) -> Vec<String> {
        self.draws.lock().expect("draw lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn stdout_is_tty(&self) -> bool {
        self.is_tty
    }

    fn write_line(&self, line: &str) -> Result<(), ReplayError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }

    fn draw(&self, frame: &str) -> Result<(), ReplayError> {
        self.draws
            .lock()
            .expect("draw lock")
            .push(frame.to_string());
        Ok(())
    }
}

/// Queue-driven process double. `wait` and `try_wait` both pop the next queued
/// response; `try_wait` reports a still-running process when the queue is empty.
#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    responses: Arc<Mutex<Vec<Result<ProcessOutput, ReplayError>>>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    waits: Arc<Mutex<Vec<u64>>>,
    interrupts: Arc<Mutex<Vec<u64>>>,
    kills: Arc<Mutex<Vec<u64>>>,
    next_handle: Arc<Mutex<u64>>,
}

impl FakeProcessRunner {
    pub fn push_response(&self, output: Result<ProcessOutput, ReplayError>) {
        self.responses.lock().expect("responses lock").push(output);
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn waits(&self) -> Vec<u64> {
        self.waits.lock().expect("waits lock").clone()
    }

    pub fn interrupts(&self) -> Vec<u64> {
        self.interrupts.lock().expect("interrupts lock").clone()
    }

    pub fn kills(&self) -> Vec<u64> {
        self.kills.lock().expect("kills lock").clone()
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, ReplayError> {
        self.spawned.lock().expect("spawned lock").push(request);
        let mut next = self.next_handle.lock().expect("next lock");
        let handle = *next;
        *next += 1;
        Ok(handle)
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, ReplayError> {
        self.waits.lock().expect("waits lock").push(handle);
        let mut responses = self.responses.lock().expect("responses lock");
        if responses.is_empty() {
            return Err(ReplayError::Process("no fake response queued".to_string()));
        }
        responses.remove(0)
    }

    fn try_wait(&self, handle: u64) -> Result<Option<ProcessOutput>, ReplayError> {
        let mut responses = self.responses.lock().expect("responses lock");
        if responses.is_empty() {
            return Ok(None);
        }
        self.waits.lock().expect("waits lock").push(handle);
        responses.remove(0).map(Some)
    }

    fn interrupt(&self, handle: u64) -> Result<(), ReplayError> {
        self.interrupts
            .lock()
            .expect("interrupts lock")
            .push(handle);
        Ok(())
    }

    fn kill(&self, handle: u64) -> Result<(), ReplayError> {
        self.kills.lock().expect("kills lock").push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_runner_records_requests_and_pops_responses_in_order() {
        let runner = FakeProcessRunner::default();
        runner.push_response(Ok(ProcessOutput {
            exit_code: 0,
            stdout: "first".to_string(),
            stderr: String::new(),
        }));
        let out = runner
            .run(ProcessRequest::new("echo", vec!["first".to_string()]))
            .expect("run");
        assert_eq!(out.stdout, "first");
        assert_eq!(runner.spawned()[0].program, "echo");
        assert!(runner.try_wait(0).expect("try_wait").is_none());
    }

    #[test]
    fn fake_clock_advances_on_sleep() {
        let clock = FakeClock::default();
        clock.sleep(Duration::from_secs(5)).expect("sleep");
        assert_eq!(
            clock.now(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(5)
        );
        assert_eq!(clock.sleeps().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn production_runner_captures_output_and_reports_exit() {
        let runner = ProductionProcessRunner::new();
        let out = runner
            .run(ProcessRequest::new(
                "sh",
                vec!["-c".to_string(), "echo hi; exit 3".to_string()],
            ))
            .expect("run sh");
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[cfg(unix)]
    #[test]
    fn production_runner_interrupts_long_running_process() {
        let runner = ProductionProcessRunner::new();
        let handle = runner
            .spawn(ProcessRequest::new("sleep", vec!["30".to_string()]))
            .expect("spawn sleep");
        assert!(runner.try_wait(handle).expect("poll").is_none());
        runner.interrupt(handle).expect("interrupt");
        let out = runner.wait(handle).expect("wait");
        assert_ne!(out.exit_code, 0);
    }

    #[cfg(unix)]
    #[test]
    fn production_runner_can_signal_the_group_of_a_reaped_leader() {
        let runner = ProductionProcessRunner::new();
        let handle = runner
            .spawn(ProcessRequest::new("sh", vec!["-c".to_string(), "exit 0".to_string()]))
            .expect("spawn sh");
        let out = runner.wait(handle).expect("wait");
        assert_eq!(out.exit_code, 0);
        runner.interrupt(handle).expect("interrupt after exit");
        assert!(runner.interrupt(99).is_err());
    }

    #[test]
    fn display_command_joins_program_and_args() {
        let request = ProcessRequest::new("ros2", vec!["bag".to_string(), "play".to_string()]);
        assert_eq!(request.display_command(), "ros2 bag play");
    }
}
