use std::io;
use thiserror::Error;
use warp::http::StatusCode;

#[derive(Error, Debug)]
pub enum LazycommError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

/// Outcome of a failed script invocation.
///
/// The display text of each variant is the plain-text body sent to the
/// HTTP client, so keep the messages stable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("script not found: {script}")]
    NotFound { script: String },

    #[error("script disabled: {script}")]
    Disabled { script: String },

    #[error("failed to create pipe {stream}: {script}")]
    PipeCreationFailed {
        script: String,
        stream: &'static str,
    },

    #[error("failed to execute script: {script}")]
    StartFailed { script: String, reason: String },

    #[error("{0}")]
    ResponseMalformed(MalformedResponse),

    #[error("{0}")]
    ResponseTruncated(TruncatedFrame),

    #[error("script exited with exit code {code}. stderr was logged")]
    ScriptExitedNonZero { code: i32 },

    #[error("script exited without sending a response")]
    NoResponse,

    #[error("script timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("failed to serialize {what} for script")]
    EncodeFailed { what: &'static str },
}

/// Which part of the marker line or header frame was unusable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedResponse {
    #[error("invalid respond command sent by script")]
    MissingFields,

    #[error("invalid {0} sent by script ({0} should be an integer)")]
    NotAnInteger(&'static str),

    #[error("invalid {0} sent by script ({0} should not be negative)")]
    Negative(&'static str),

    #[error("invalid status code sent by script (status code should be between 100 and 999)")]
    StatusOutOfRange,

    #[error("failed to parse json headers from script")]
    HeadersNotJson,

    #[error("invalid header sent by script")]
    InvalidHeader,
}

/// The frame that ended before its declared length.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncatedFrame {
    #[error("failed to read headers from script")]
    Headers,

    #[error("failed to read body from script")]
    Body,
}

impl BridgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::NotFound { .. } => StatusCode::NOT_FOUND,
            BridgeError::Disabled { .. } => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::NotFound { .. } => "not_found",
            BridgeError::Disabled { .. } => "disabled",
            BridgeError::PipeCreationFailed { .. } => "pipe_creation_failed",
            BridgeError::StartFailed { .. } => "start_failed",
            BridgeError::ResponseMalformed(_) => "response_malformed",
            BridgeError::ResponseTruncated(_) => "response_truncated",
            BridgeError::ScriptExitedNonZero { .. } => "exited_non_zero",
            BridgeError::NoResponse => "no_response",
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::EncodeFailed { .. } => "encode_failed",
        }
    }
}

impl From<MalformedResponse> for BridgeError {
    fn from(err: MalformedResponse) -> Self {
        BridgeError::ResponseMalformed(err)
    }
}

impl From<TruncatedFrame> for BridgeError {
    fn from(err: TruncatedFrame) -> Self {
        BridgeError::ResponseTruncated(err)
    }
}

pub type Result<T> = std::result::Result<T, LazycommError>;

impl warp::reject::Reject for LazycommError {}
