use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("recording error: {0}")]
    Recording(String),
    #[error("fixture unavailable: {0}")]
    FixtureUnavailable(String),
    #[error("missing required topic(s): {}", .0.join(", "))]
    MissingRequiredTopic(Vec<String>),
    #[error("run failed for param `{param}`: {reason}")]
    RunFailed { param: String, reason: String },
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("assertion `{assertion}` failed in {test}: {message}")]
    AssertionFailure {
        test: String,
        assertion: String,
        message: String,
    },
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl From<mcap::McapError> for ReplayError {
    fn from(value: mcap::McapError) -> Self {
        Self::Recording(value.to_string())
    }
}
