use std::sync::Arc;

use tracing::{info, warn};

use crate::error::UssdResult;
use crate::platform::{
    request_if_missing, DialIntent, Dialer, ExtraValue, IntentAction, Permission, Permissions,
    PhoneAccountHandle, PlatformInfo, TelecomAccounts, FLAG_ACTIVITY_NEW_TASK,
};
use crate::request::SimTarget;

/// Extra keys various vendors' dialers read to pick a SIM slot
pub const SIM_SLOT_EXTRAS: [&str; 16] = [
    "extra_asus_dial_use_dualsim",
    "com.android.phone.extra.slot",
    "slot",
    "simslot",
    "sim_slot",
    "subscription",
    "Subscription",
    "phone",
    "com.android.phone.DialingMode",
    "simSlot",
    "slot_id",
    "simId",
    "simnum",
    "phone_type",
    "slotId",
    "slotIdx",
];

pub const EXTRA_PHONE_ACCOUNT_HANDLE: &str = "android.telecom.extra.PHONE_ACCOUNT_HANDLE";

/// Turn a USSD code into a `tel:` URI with `#` escaped
pub fn ussd_uri(code: &str) -> String {
    let number = code.replace('#', "%23");
    if number.starts_with("tel:") {
        number
    } else {
        format!("tel:{}", number)
    }
}

/// Build the dial request for `code`.
///
/// `accounts` is only consulted for an explicit slot; an index past the end
/// of the list leaves the account extra out.
pub fn build_intent(
    code: &str,
    sim: SimTarget,
    telephony_enabled: bool,
    accounts: &[PhoneAccountHandle],
) -> DialIntent {
    let mut intent = DialIntent {
        action: if telephony_enabled {
            IntentAction::Call
        } else {
            IntentAction::View
        },
        data: ussd_uri(code),
        flags: FLAG_ACTIVITY_NEW_TASK,
        extras: Vec::new(),
    };

    if let SimTarget::Slot(slot) = sim {
        let slot = slot as i32;
        intent
            .extras
            .push(("com.android.phone.force.slot".into(), ExtraValue::Bool(true)));
        intent.extras.push(("Cdma_Supp".into(), ExtraValue::Bool(true)));
        for key in SIM_SLOT_EXTRAS {
            intent.extras.push((key.to_string(), ExtraValue::Int(slot)));
        }
        match accounts.get(slot as usize) {
            Some(account) => intent.extras.push((
                EXTRA_PHONE_ACCOUNT_HANDLE.to_string(),
                ExtraValue::Account(account.clone()),
            )),
            None if !accounts.is_empty() => {
                warn!(
                    "No phone account at index {} ({} known)",
                    slot,
                    accounts.len()
                );
            }
            None => {}
        }
    }

    intent
}

/// Last-resort strategy: hand the code to the system dialer.
///
/// Fire-and-forget; the carrier's answer only shows up in the dialer UI.
pub struct FallbackDialer {
    permissions: Arc<dyn Permissions>,
    dialer: Arc<dyn Dialer>,
    accounts: Arc<dyn TelecomAccounts>,
}

impl FallbackDialer {
    pub fn new(
        permissions: Arc<dyn Permissions>,
        dialer: Arc<dyn Dialer>,
        accounts: Arc<dyn TelecomAccounts>,
    ) -> Self {
        Self {
            permissions,
            dialer,
            accounts,
        }
    }

    pub async fn dial(&self, code: &str, sim: SimTarget, info: &PlatformInfo) -> UssdResult<()> {
        request_if_missing(self.permissions.as_ref(), Permission::CallPhone).await?;

        let accounts = match sim {
            SimTarget::Slot(_) if info.supports_phone_accounts() => {
                request_if_missing(self.permissions.as_ref(), Permission::ReadPhoneState).await?;
                self.accounts.call_capable_accounts().await?
            }
            _ => Vec::new(),
        };

        let intent = build_intent(code, sim, info.telephony_enabled, &accounts);
        info!("Dialing {} via {}", intent.data, intent.action.as_str());
        self.dialer.start_activity(&intent).await
    }
}
