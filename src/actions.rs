use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use ussd_relay::{ErrorPayload, MethodCall, MethodOutcome};

/// One line read from the host
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    /// A method call
    Method {
        id: u64,
        method: String,
        #[serde(default)]
        arguments: Value,
    },
    /// A message on the reply channel. The key must be present, `null` is
    /// a valid message.
    Message {
        id: u64,
        #[serde(deserialize_with = "present")]
        message: Option<String>,
    },
}

/// Like the default `Option` handling, minus treating a missing key as `None`
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Option::<String>::deserialize(deserializer)
}

impl Inbound {
    pub fn into_call(self) -> Option<(u64, MethodCall)> {
        match self {
            Inbound::Method {
                id,
                method,
                arguments,
            } => Some((id, MethodCall::new(method, arguments))),
            Inbound::Message { .. } => None,
        }
    }
}

/// One line written to the host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Result {
        id: u64,
        result: Value,
    },
    Error {
        id: u64,
        error: ErrorPayload,
    },
    NotImplemented {
        id: u64,
        #[serde(rename = "notImplemented")]
        not_implemented: bool,
    },
    /// Pushed on the reply channel without a request
    Push { message: String },
}

impl Outbound {
    /// `None` when the outcome produces no line at all
    pub fn from_outcome(id: u64, outcome: MethodOutcome) -> Option<Self> {
        match outcome {
            MethodOutcome::Success(result) => Some(Outbound::Result { id, result }),
            MethodOutcome::Error(error) => Some(Outbound::Error { id, error }),
            MethodOutcome::NotImplemented => Some(Outbound::NotImplemented {
                id,
                not_implemented: true,
            }),
            MethodOutcome::PermissionRequested => None,
        }
    }
}

/// Actions that can be dispatched through the bridge loop
#[derive(Debug, Clone)]
pub enum Action {
    /// A line arrived from the host
    Inbound(Inbound),
    /// A line could not be decoded
    Error(String),
    /// The host closed stdin
    Quit,
}
