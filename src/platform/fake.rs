//! Scriptable in-memory platform used by the unit tests

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::*;
use crate::error::UssdError;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    RequestPermission(Permission),
    SendUssd { code: String, target: SimTarget },
    Invoke { code: String, slot: u32 },
    Reply(String),
    Cancel,
    StartActivity(DialIntent),
    Accounts,
}

/// How the fake telephony service answers a single-shot request
#[derive(Debug, Clone)]
pub enum SingleShot {
    Respond(String),
    Fail(i32),
    /// Drop the callback without resolving it
    Drop,
    /// Refuse to issue the request
    Refuse,
}

pub struct FakePlatform {
    pub info: Mutex<PlatformInfo>,
    pub granted: Mutex<HashSet<Permission>>,
    pub rationale: Mutex<bool>,
    pub single_shot: Mutex<SingleShot>,
    pub dial_error: Mutex<Option<String>>,
    pub reply_error: Mutex<Option<String>>,
    pub accounts: Mutex<Vec<PhoneAccountHandle>>,
    /// Pushed as soon as the dialog is invoked
    pub on_invoke: Mutex<Vec<ScreenUpdate>>,
    /// One entry popped and pushed per reply
    pub on_reply: Mutex<VecDeque<ScreenUpdate>>,
    calls: Mutex<Vec<Call>>,
    updates: Mutex<Option<mpsc::UnboundedSender<ScreenUpdate>>>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(PlatformInfo {
                sdk_int: 30,
                telephony_enabled: true,
                programmatic_ussd: true,
            }),
            granted: Mutex::new(HashSet::from([
                Permission::CallPhone,
                Permission::ReadPhoneState,
            ])),
            rationale: Mutex::new(false),
            single_shot: Mutex::new(SingleShot::Respond("OK".into())),
            dial_error: Mutex::new(None),
            reply_error: Mutex::new(None),
            accounts: Mutex::new(Vec::new()),
            on_invoke: Mutex::new(Vec::new()),
            on_reply: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            updates: Mutex::new(None),
        })
    }

    pub fn platform(self: &Arc<Self>) -> Platform {
        Platform::from_backend(self.clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_sdk(&self, sdk_int: u32) {
        self.info.lock().unwrap().sdk_int = sdk_int;
    }

    pub fn revoke(&self, permission: Permission) {
        self.granted.lock().unwrap().remove(&permission);
    }

    pub fn script_invoke(&self, update: ScreenUpdate) {
        self.on_invoke.lock().unwrap().push(update);
    }

    pub fn script_reply(&self, update: ScreenUpdate) {
        self.on_reply.lock().unwrap().push_back(update);
    }

    /// Push an unsolicited update into the live session
    pub fn push(&self, update: ScreenUpdate) -> bool {
        match self.updates.lock().unwrap().as_ref() {
            Some(tx) => tx.send(update).is_ok(),
            None => false,
        }
    }

    /// Close the live update stream without an `Over`
    pub fn hang_up(&self) {
        self.updates.lock().unwrap().take();
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

pub fn screen(text: &str) -> ScreenUpdate {
    ScreenUpdate::Screen(SessionEvent::new(vec![text.to_string()]))
}

#[async_trait]
impl Permissions for FakePlatform {
    async fn is_granted(&self, permission: Permission) -> UssdResult<bool> {
        Ok(self.granted.lock().unwrap().contains(&permission))
    }

    async fn should_show_rationale(&self, _permission: Permission) -> UssdResult<bool> {
        Ok(*self.rationale.lock().unwrap())
    }

    async fn request(&self, permission: Permission) -> UssdResult<()> {
        self.record(Call::RequestPermission(permission));
        Ok(())
    }
}

#[async_trait]
impl Telephony for FakePlatform {
    async fn platform_info(&self) -> UssdResult<PlatformInfo> {
        Ok(*self.info.lock().unwrap())
    }

    async fn send_ussd_request(
        &self,
        code: &str,
        target: SimTarget,
        callback: UssdResponseCallback,
    ) -> UssdResult<()> {
        self.record(Call::SendUssd {
            code: code.to_string(),
            target,
        });
        let behaviour = self.single_shot.lock().unwrap().clone();
        match behaviour {
            SingleShot::Respond(text) => {
                // Settle from another task, like a platform callback thread
                tokio::spawn(async move { callback.on_response(text) });
            }
            SingleShot::Fail(code) => {
                tokio::spawn(async move { callback.on_failure(code) });
            }
            SingleShot::Drop => drop(callback),
            SingleShot::Refuse => return Err(UssdError::Platform("radio off".into())),
        }
        Ok(())
    }
}

#[async_trait]
impl SessionDriver for FakePlatform {
    async fn invoke(
        &self,
        code: &str,
        slot: u32,
        updates: mpsc::UnboundedSender<ScreenUpdate>,
    ) -> UssdResult<()> {
        self.record(Call::Invoke {
            code: code.to_string(),
            slot,
        });
        for update in self.on_invoke.lock().unwrap().drain(..) {
            let _ = updates.send(update);
        }
        *self.updates.lock().unwrap() = Some(updates);
        Ok(())
    }

    async fn send_reply(&self, text: &str, _event: &SessionEvent) -> UssdResult<()> {
        self.record(Call::Reply(text.to_string()));
        let scripted = self.on_reply.lock().unwrap().pop_front();
        let pushed = scripted.map(|update| self.push(update)).unwrap_or(false);
        let error = self.reply_error.lock().unwrap().clone();
        match error {
            Some(err) => {
                if pushed {
                    // Let the pump deliver the screen before failing
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                Err(UssdError::Platform(err))
            }
            None => Ok(()),
        }
    }

    async fn cancel(&self, _event: &SessionEvent) {
        self.record(Call::Cancel);
    }
}

#[async_trait]
impl Dialer for FakePlatform {
    async fn start_activity(&self, intent: &DialIntent) -> UssdResult<()> {
        self.record(Call::StartActivity(intent.clone()));
        match self.dial_error.lock().unwrap().clone() {
            Some(err) => Err(UssdError::DialerUnavailable(err)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TelecomAccounts for FakePlatform {
    async fn call_capable_accounts(&self) -> UssdResult<Vec<PhoneAccountHandle>> {
        self.record(Call::Accounts);
        Ok(self.accounts.lock().unwrap().clone())
    }
}
