use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{UssdError, UssdResult};
use crate::platform::{
    Telephony, UssdResponseCallback, USSD_ERROR_SERVICE_UNAVAIL, USSD_RETURN_FAILURE,
};
use crate::request::SimTarget;

/// Wraps the platform's callback-style USSD call into a single future
pub struct SingleShotAdapter {
    telephony: Arc<dyn Telephony>,
}

impl SingleShotAdapter {
    pub fn new(telephony: Arc<dyn Telephony>) -> Self {
        Self { telephony }
    }

    /// Send `code` once and wait for the carrier's answer.
    ///
    /// No retry and no timeout beyond what the platform enforces.
    pub async fn send(&self, code: &str, target: SimTarget) -> UssdResult<String> {
        let (callback, response) = UssdResponseCallback::channel();
        self.telephony
            .send_ussd_request(code, target, callback)
            .await?;

        match response.await {
            Ok(Ok(text)) => {
                debug!("Single-shot USSD {} answered", code);
                Ok(text)
            }
            Ok(Err(failure_code)) => {
                warn!("Single-shot USSD {} failed with code {}", code, failure_code);
                Err(failure_from_code(failure_code))
            }
            Err(_) => {
                warn!("Single-shot USSD {} callback dropped unresolved", code);
                Err(UssdError::UnknownExecutionError)
            }
        }
    }
}

/// Map a platform failure code onto the error taxonomy
pub fn failure_from_code(failure_code: i32) -> UssdError {
    match failure_code {
        USSD_ERROR_SERVICE_UNAVAIL => UssdError::ServiceUnavailable,
        USSD_RETURN_FAILURE => UssdError::execution("USSD_RETURN_FAILURE"),
        _ => UssdError::UnknownExecutionError,
    }
}
