use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{UssdError, UssdResult};

/// A method invocation coming from the host application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }
}

/// Execution strategy requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Always go through the dialer
    Basic,
    /// Single-shot platform API when available
    Advanced,
    /// Interactive menu session
    Multisession,
}

impl Mode {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "sendUssd" => Some(Mode::Basic),
            "sendAdvancedUssd" => Some(Mode::Advanced),
            "multisessionUssd" => Some(Mode::Multisession),
            _ => None,
        }
    }
}

/// Which SIM line originates a request.
///
/// `-1` on the wire means the default line; any other value is a zero-based
/// slot index that every strategy passes through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SimTarget {
    #[default]
    Default,
    Slot(u32),
}

impl SimTarget {
    pub fn from_subscription_id(id: i32) -> UssdResult<Self> {
        match id {
            -1 => Ok(SimTarget::Default),
            n if n >= 0 => Ok(SimTarget::Slot(n as u32)),
            _ => Err(UssdError::invalid(
                "Incorrect parameter value: `subscriptionId` must be >= -1",
            )),
        }
    }

    /// Concrete slot for paths that cannot express "default"
    pub fn slot_or_first(&self) -> u32 {
        match self {
            SimTarget::Default => 0,
            SimTarget::Slot(n) => *n,
        }
    }
}

/// A validated USSD request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UssdRequest {
    pub code: String,
    pub sim: SimTarget,
    pub mode: Mode,
}

/// Everything the dispatcher knows how to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginRequest {
    Send(UssdRequest),
    CancelMultisession,
}

impl PluginRequest {
    /// Decode and validate a method call.
    ///
    /// Returns `Ok(None)` for methods this plugin does not implement.
    pub fn parse(call: &MethodCall) -> UssdResult<Option<Self>> {
        if call.method == "multisessionUssdCancel" {
            return Ok(Some(PluginRequest::CancelMultisession));
        }
        let Some(mode) = Mode::from_method(&call.method) else {
            return Ok(None);
        };

        let subscription_id = call
            .arguments
            .get("subscriptionId")
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| {
                UssdError::invalid("Incorrect parameter type: `subscriptionId` must be an int")
            })?;
        let sim = SimTarget::from_subscription_id(subscription_id)?;

        let code = call
            .arguments
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| UssdError::invalid("Incorrect parameter type: `code` must be a String"))?;
        if code.is_empty() {
            return Err(UssdError::invalid(
                "Incorrect parameter value: `code` must not be an empty string",
            ));
        }

        Ok(Some(PluginRequest::Send(UssdRequest {
            code: code.to_string(),
            sim,
            mode,
        })))
    }
}
