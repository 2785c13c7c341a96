//! Collaborators the relay drives but does not own: the permission
//! subsystem, the telephony service, the on-screen session driver, the
//! activity launcher and telecom account enumeration.

pub mod adb;
#[cfg(test)]
pub(crate) mod fake;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::UssdResult;
use crate::request::SimTarget;

/// First SDK level with a programmatic single-shot USSD call
pub const SDK_SINGLE_SHOT: u32 = 26;
/// First SDK level with runtime permissions, telecom accounts and the
/// accessibility-driven session flow
pub const SDK_INTERACTIVE: u32 = 23;

/// Platform failure code: the request was sent but the network failed it
pub const USSD_RETURN_FAILURE: i32 = -1;
/// Platform failure code: the USSD service is not available
pub const USSD_ERROR_SERVICE_UNAVAIL: i32 = -2;

/// Runtime permissions the relay needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    CallPhone,
    ReadPhoneState,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::CallPhone => "android.permission.CALL_PHONE",
            Permission::ReadPhoneState => "android.permission.READ_PHONE_STATE",
        }
    }
}

/// Capabilities of the device we are talking to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub sdk_int: u32,
    /// False on devices without a radio; the dialer then falls back to VIEW
    pub telephony_enabled: bool,
    /// Whether the backend can issue a single-shot USSD request at all
    pub programmatic_ussd: bool,
}

impl PlatformInfo {
    pub fn supports_single_shot(&self) -> bool {
        self.programmatic_ussd && self.sdk_int >= SDK_SINGLE_SHOT
    }

    pub fn supports_interactive(&self) -> bool {
        self.sdk_int >= SDK_INTERACTIVE
    }

    pub fn supports_phone_accounts(&self) -> bool {
        self.sdk_int >= SDK_INTERACTIVE
    }
}

/// Snapshot of the text a system dialog showed at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub captured_at: DateTime<Utc>,
    text: Result<Vec<String>, String>,
}

impl SessionEvent {
    pub fn new(text: Vec<String>) -> Self {
        Self {
            captured_at: Utc::now(),
            text: Ok(text),
        }
    }

    /// An event whose text could not be read
    pub fn unreadable(reason: impl Into<String>) -> Self {
        Self {
            captured_at: Utc::now(),
            text: Err(reason.into()),
        }
    }

    /// All text fragments, if extraction succeeded
    pub fn texts(&self) -> Result<&[String], &str> {
        self.text.as_deref().map_err(String::as_str)
    }

    /// The first non-empty text fragment.
    ///
    /// Extraction failures count as "no text".
    pub fn prompt(&self) -> Option<String> {
        match &self.text {
            Ok(texts) => texts
                .first()
                .filter(|t| !t.trim().is_empty())
                .cloned(),
            Err(reason) => {
                debug!("Screen text unreadable, treating as empty: {}", reason);
                None
            }
        }
    }
}

/// What the session driver pushes while a dialog is up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenUpdate {
    /// A new screen awaiting a reply
    Screen(SessionEvent),
    /// The session ended with this final message
    Over(String),
}

/// Single-resolution callback for a single-shot USSD request.
///
/// Both completion methods consume the callback, so it settles at most once.
/// Dropping it unresolved is reported to the waiter as an unknown failure.
#[derive(Debug)]
pub struct UssdResponseCallback {
    tx: oneshot::Sender<Result<String, i32>>,
}

impl UssdResponseCallback {
    pub fn channel() -> (Self, oneshot::Receiver<Result<String, i32>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn on_response(self, response: impl Into<String>) {
        let _ = self.tx.send(Ok(response.into()));
    }

    pub fn on_failure(self, failure_code: i32) {
        let _ = self.tx.send(Err(failure_code));
    }
}

/// Identifies a call-capable telecom account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneAccountHandle {
    pub component: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentAction {
    Call,
    View,
}

impl IntentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentAction::Call => "android.intent.action.CALL",
            IntentAction::View => "android.intent.action.VIEW",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtraValue {
    Bool(bool),
    Int(i32),
    Account(PhoneAccountHandle),
}

pub const FLAG_ACTIVITY_NEW_TASK: u32 = 0x1000_0000;

/// A dial-style activity request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialIntent {
    pub action: IntentAction,
    pub data: String,
    pub flags: u32,
    pub extras: Vec<(String, ExtraValue)>,
}

impl DialIntent {
    pub fn extra(&self, key: &str) -> Option<&ExtraValue> {
        self.extras.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

#[async_trait]
pub trait Permissions: Send + Sync {
    async fn is_granted(&self, permission: Permission) -> UssdResult<bool>;
    async fn should_show_rationale(&self, permission: Permission) -> UssdResult<bool>;
    /// Fire a permission prompt; the decision is not awaited
    async fn request(&self, permission: Permission) -> UssdResult<()>;
}

#[async_trait]
pub trait Telephony: Send + Sync {
    async fn platform_info(&self) -> UssdResult<PlatformInfo>;

    /// Issue one USSD request. The outcome arrives through `callback`;
    /// an `Err` here means the request could not be issued at all.
    async fn send_ussd_request(
        &self,
        code: &str,
        target: SimTarget,
        callback: UssdResponseCallback,
    ) -> UssdResult<()>;
}

#[async_trait]
pub trait SessionDriver: Send + Sync {
    /// Open the USSD dialog on `slot` and push every screen into `updates`
    /// until the session is over.
    async fn invoke(
        &self,
        code: &str,
        slot: u32,
        updates: mpsc::UnboundedSender<ScreenUpdate>,
    ) -> UssdResult<()>;

    /// Type `text` into the dialog that produced `event`
    async fn send_reply(&self, text: &str, event: &SessionEvent) -> UssdResult<()>;

    /// Close the dialog that produced `event`
    async fn cancel(&self, event: &SessionEvent);
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn start_activity(&self, intent: &DialIntent) -> UssdResult<()>;
}

#[async_trait]
pub trait TelecomAccounts: Send + Sync {
    async fn call_capable_accounts(&self) -> UssdResult<Vec<PhoneAccountHandle>>;
}

/// The full set of collaborators handed to the plugin
#[derive(Clone)]
pub struct Platform {
    pub permissions: Arc<dyn Permissions>,
    pub telephony: Arc<dyn Telephony>,
    pub driver: Arc<dyn SessionDriver>,
    pub dialer: Arc<dyn Dialer>,
    pub accounts: Arc<dyn TelecomAccounts>,
}

impl Platform {
    /// Build from a backend that implements every collaborator
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: Permissions + Telephony + SessionDriver + Dialer + TelecomAccounts + 'static,
    {
        Self {
            permissions: backend.clone(),
            telephony: backend.clone(),
            driver: backend.clone(),
            dialer: backend.clone(),
            accounts: backend,
        }
    }
}

/// Prompt for `permission` when it is missing and no rationale is due.
///
/// Returns whether the permission is currently granted.
pub async fn request_if_missing(
    permissions: &dyn Permissions,
    permission: Permission,
) -> UssdResult<bool> {
    if permissions.is_granted(permission).await? {
        return Ok(true);
    }
    if !permissions.should_show_rationale(permission).await? {
        info!("Requesting {}", permission.as_str());
        permissions.request(permission).await?;
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_first_text() {
        let ev = SessionEvent::new(vec!["Enter PIN:".into(), "Send".into()]);
        assert_eq!(ev.prompt().as_deref(), Some("Enter PIN:"));
    }

    #[test]
    fn test_prompt_empty_is_none() {
        assert_eq!(SessionEvent::new(vec![]).prompt(), None);
        assert_eq!(SessionEvent::new(vec!["  ".into()]).prompt(), None);
    }

    #[test]
    fn test_prompt_unreadable_is_none() {
        let ev = SessionEvent::unreadable("node recycled");
        assert_eq!(ev.prompt(), None);
        assert_eq!(ev.texts(), Err("node recycled"));
    }

    #[test]
    fn test_capability_gates() {
        let info = PlatformInfo {
            sdk_int: 25,
            telephony_enabled: true,
            programmatic_ussd: true,
        };
        assert!(!info.supports_single_shot());
        assert!(info.supports_interactive());

        let info = PlatformInfo {
            sdk_int: 30,
            telephony_enabled: true,
            programmatic_ussd: false,
        };
        assert!(!info.supports_single_shot());

        let info = PlatformInfo {
            sdk_int: 22,
            telephony_enabled: true,
            programmatic_ussd: true,
        };
        assert!(!info.supports_interactive());
        assert!(!info.supports_phone_accounts());
    }

    #[tokio::test]
    async fn test_callback_settles_once() {
        let (callback, rx) = UssdResponseCallback::channel();
        callback.on_response("Balance: 10");
        assert_eq!(rx.await.unwrap(), Ok("Balance: 10".to_string()));

        let (callback, rx) = UssdResponseCallback::channel();
        drop(callback);
        assert!(rx.await.is_err());
    }
}
