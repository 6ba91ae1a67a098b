use thiserror::Error;

#[derive(Debug, Error)]
pub enum DvrError {
    #[error("bad time format: {input:?} (use today/tomorrow/YYYY-MM-DD and 20:00 or 8:00 pm)")]
    BadTimeFormat { input: String },

    #[error("bad duration format: {input:?} (use 02:05:00, 125, or 2h5m)")]
    BadDurationFormat { input: String },

    #[error("start time {start_at} is in the past; choose a future time")]
    PastStartTime { start_at: String },

    #[error("scheduler timed out after {timeout_secs}s: {command}")]
    SchedulerTimeout { command: String, timeout_secs: u64 },

    #[error("scheduler failed (code={code:?}): {stderr}")]
    SchedulerNonZeroExit {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("scheduler output could not be parsed: {reason}")]
    SchedulerUnparseable { reason: String, raw: String },

    #[error("could not recover capture invocation from task command: {command_line}")]
    InvocationUnrecoverable { command_line: String },

    #[error("failed to launch capture engine {program}: {source}")]
    EngineLaunchFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("invalid settings at {path}: {reason}")]
    InvalidSettings { path: String, reason: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, DvrError>;
