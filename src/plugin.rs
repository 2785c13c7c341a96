use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::dialer::FallbackDialer;
use crate::error::{ErrorPayload, UssdResult};
use crate::platform::{request_if_missing, Permission, Platform};
use crate::request::{MethodCall, Mode, PluginRequest, UssdRequest};
use crate::session::{ReplyChannel, ReplyOutcome, SessionManager, SessionState};
use crate::single_shot::SingleShotAdapter;

/// How a method call ended
#[derive(Debug, Clone, PartialEq)]
pub enum MethodOutcome {
    Success(Value),
    Error(ErrorPayload),
    NotImplemented,
    /// A permission prompt was raised; nothing will be delivered and the
    /// caller has to retry once it is granted
    PermissionRequested,
}

/// Validates method calls and routes them to a strategy
pub struct UssdPlugin {
    platform: Platform,
    single_shot: SingleShotAdapter,
    dialer: FallbackDialer,
    sessions: SessionManager,
}

impl UssdPlugin {
    pub fn new(platform: Platform, channel: Arc<dyn ReplyChannel>) -> Self {
        Self {
            single_shot: SingleShotAdapter::new(platform.telephony.clone()),
            dialer: FallbackDialer::new(
                platform.permissions.clone(),
                platform.dialer.clone(),
                platform.accounts.clone(),
            ),
            sessions: SessionManager::new(platform.driver.clone(), channel),
            platform,
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.sessions.state()
    }

    pub async fn handle(&self, call: &MethodCall) -> MethodOutcome {
        match self.dispatch(call).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("{} failed: {}", call.method, e);
                MethodOutcome::Error(e.to_payload())
            }
        }
    }

    /// Reply-channel handler; `None` means no response is produced
    pub async fn on_message(&self, message: Option<&str>) -> Option<Option<String>> {
        self.sessions.reply(message).await.map(ReplyOutcome::into_text)
    }

    pub async fn cancel_multisession(&self) {
        self.sessions.cancel().await;
    }

    async fn dispatch(&self, call: &MethodCall) -> UssdResult<MethodOutcome> {
        let Some(request) = PluginRequest::parse(call)? else {
            return Ok(MethodOutcome::NotImplemented);
        };

        match request {
            PluginRequest::CancelMultisession => {
                self.sessions.cancel().await;
                Ok(MethodOutcome::Success(Value::Null))
            }
            PluginRequest::Send(request) => match request.mode {
                Mode::Basic => self.send_basic(&request).await,
                Mode::Advanced => self.send_advanced(&request).await,
                Mode::Multisession => self.send_multisession(&request).await,
            },
        }
    }

    async fn send_basic(&self, request: &UssdRequest) -> UssdResult<MethodOutcome> {
        let info = self.platform.telephony.platform_info().await?;
        self.dialer.dial(&request.code, request.sim, &info).await?;
        Ok(MethodOutcome::Success(Value::Null))
    }

    async fn send_advanced(&self, request: &UssdRequest) -> UssdResult<MethodOutcome> {
        let info = self.platform.telephony.platform_info().await?;
        if !info.supports_single_shot() {
            info!("Single-shot USSD unavailable (sdk {}), dialing", info.sdk_int);
            self.dialer.dial(&request.code, request.sim, &info).await?;
            return Ok(MethodOutcome::Success(Value::Null));
        }

        request_if_missing(self.platform.permissions.as_ref(), Permission::CallPhone).await?;
        let text = self.single_shot.send(&request.code, request.sim).await?;
        Ok(MethodOutcome::Success(Value::String(text)))
    }

    async fn send_multisession(&self, request: &UssdRequest) -> UssdResult<MethodOutcome> {
        for permission in [Permission::CallPhone, Permission::ReadPhoneState] {
            if !request_if_missing(self.platform.permissions.as_ref(), permission).await? {
                info!("{} missing, multisession deferred", permission.as_str());
                return Ok(MethodOutcome::PermissionRequested);
            }
        }

        let info = self.platform.telephony.platform_info().await?;
        if !info.supports_interactive() {
            info!("Interactive USSD unavailable (sdk {}), dialing", info.sdk_int);
            self.dialer.dial(&request.code, request.sim, &info).await?;
            return Ok(MethodOutcome::Success(Value::Null));
        }

        let prompt = self
            .sessions
            .start(&request.code, request.sim.slot_or_first())
            .await?;
        Ok(MethodOutcome::Success(prompt.map(Value::String).unwrap_or(Value::Null)))
    }
}
