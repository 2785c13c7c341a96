use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire code for malformed caller input
pub const INCORRECT_PARAMETERS: &str = "ussd_plugin_incorrect_parameters";
/// Wire code for every failure that happens while executing a request
pub const EXECUTION_FAILURE: &str = "ussd_plugin_ussd_execution_failure";

/// Errors surfaced to the caller of the relay
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UssdError {
    /// Malformed request; reported before any platform call
    #[error("{0}")]
    InvalidParameters(String),

    /// Carrier or radio refused the request (`USSD_ERROR_SERVICE_UNAVAIL`)
    #[error("USSD_ERROR_SERVICE_UNAVAIL")]
    ServiceUnavailable,

    /// The platform reported a failed execution
    #[error("{0}")]
    ExecutionFailed(String),

    /// The platform failed with a code we do not recognize
    #[error("unknown error")]
    UnknownExecutionError,

    /// No activity could take the dial request
    #[error("dialer unavailable: {0}")]
    DialerUnavailable(String),

    /// Failure talking to the platform backend itself
    #[error("platform error: {0}")]
    Platform(String),
}

/// Result type alias for relay operations
pub type UssdResult<T> = Result<T, UssdError>;

impl UssdError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }

    /// Wire code reported alongside the message
    pub fn kind(&self) -> &'static str {
        match self {
            UssdError::InvalidParameters(_) => INCORRECT_PARAMETERS,
            _ => EXECUTION_FAILURE,
        }
    }

    /// The (kind, message) pair handed to the host
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<anyhow::Error> for UssdError {
    fn from(err: anyhow::Error) -> Self {
        UssdError::Platform(format!("{:#}", err))
    }
}

/// Serialized form of an error on the host bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}
