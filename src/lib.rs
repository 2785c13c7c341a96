//! Send USSD codes to a carrier and relay the answers.
//!
//! Three strategies sit behind [`UssdPlugin`]: a fire-and-forget dial
//! ([`dialer`]), a single-shot platform request ([`single_shot`]) and an
//! interactive menu session that follows the on-screen dialog
//! ([`session`]). Everything the relay needs from the device is a trait in
//! [`platform`].

pub mod config;
pub mod dialer;
pub mod error;
pub mod platform;
pub mod plugin;
pub mod request;
pub mod session;
pub mod single_shot;

pub use error::{ErrorPayload, UssdError, UssdResult};
pub use plugin::{MethodOutcome, UssdPlugin};
pub use request::{MethodCall, Mode, SimTarget, UssdRequest};
pub use session::{ReplyChannel, ReplyOutcome, SessionManager, SessionState};
