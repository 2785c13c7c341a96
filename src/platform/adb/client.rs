use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::heuristics::{self, DialogScreen, Point, ScreenInference};
use crate::config::RelayConfig;
use crate::dialer::build_intent;
use crate::error::{UssdError, UssdResult};
use crate::platform::{
    DialIntent, Dialer, ExtraValue, Permission, Permissions, PhoneAccountHandle, PlatformInfo,
    ScreenUpdate, SessionDriver, SessionEvent, TelecomAccounts, Telephony, UssdResponseCallback,
    USSD_ERROR_SERVICE_UNAVAIL,
};
use crate::request::SimTarget;

const KEYCODE_BACK: u32 = 4;
const KEYCODE_ENTER: u32 = 66;

/// Client for the adb command line
#[derive(Debug, Clone)]
pub struct AdbShell {
    /// Path to adb binary
    adb_path: String,
    serial: Option<String>,
}

impl AdbShell {
    pub fn new(adb_path: impl Into<String>, serial: Option<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
            serial,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.adb_path);
        if let Some(serial) = &self.serial {
            cmd.args(["-s", serial]);
        }
        cmd
    }

    /// Check if the device is attached and online
    pub async fn is_device_ready(&self) -> bool {
        self.command()
            .arg("get-state")
            .stderr(Stdio::null())
            .output()
            .await
            .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "device")
            .unwrap_or(false)
    }

    /// Run a command in the device shell and return its stdout
    pub async fn shell(&self, args: &[&str]) -> Result<String> {
        let output = self
            .command()
            .arg("shell")
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to execute adb shell {}", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "adb shell {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Dump the current UI hierarchy as XML
    pub async fn dump_screen(&self) -> Result<String> {
        let output = self
            .command()
            .args(["exec-out", "uiautomator", "dump", "/dev/tty"])
            .output()
            .await
            .context("Failed to dump UI hierarchy")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("uiautomator dump failed: {}", stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Classify whatever the USSD dialog currently shows
    pub async fn screen(&self) -> Result<DialogScreen> {
        let dump = self.dump_screen().await?;
        Ok(ScreenInference::analyze(&dump))
    }

    pub async fn tap(&self, point: Point) -> Result<()> {
        self.shell(&["input", "tap", &point.x.to_string(), &point.y.to_string()])
            .await?;
        Ok(())
    }

    pub async fn key(&self, keycode: u32) -> Result<()> {
        self.shell(&["input", "keyevent", &keycode.to_string()]).await?;
        Ok(())
    }

    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.shell(&["input", "text", &input_text_arg(text)]).await?;
        Ok(())
    }

    pub async fn start_intent(&self, intent: &DialIntent) -> Result<()> {
        let args = am_start_args(intent);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self
            .shell(&args)
            .await
            .context("Failed to start dial activity")?;

        if heuristics::am_start_failed(&stdout) {
            anyhow::bail!("am start refused the intent: {}", stdout.trim());
        }
        Ok(())
    }
}

/// Quote for the device's `sh`, which re-parses everything after `adb shell`
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// `input text` reads `%s` as a space
fn input_text_arg(text: &str) -> String {
    quote(&text.replace(' ', "%s"))
}

fn am_start_args(intent: &DialIntent) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "am".into(),
        "start".into(),
        "-a".into(),
        intent.action.as_str().into(),
        "-d".into(),
        quote(&intent.data),
        "-f".into(),
        format!("0x{:08x}", intent.flags),
    ];
    for (key, value) in &intent.extras {
        match value {
            ExtraValue::Bool(b) => args.extend(["--ez".to_string(), quote(key), b.to_string()]),
            ExtraValue::Int(n) => args.extend(["--ei".to_string(), quote(key), n.to_string()]),
            ExtraValue::Account(account) => {
                debug!("Skipping {} ({}): not expressible through am", key, account.id)
            }
        }
    }
    args
}

/// `gsm.current.phone-type` lists one type per slot; 0 means no radio
fn telephony_enabled(phone_types: &str) -> bool {
    let types: Vec<&str> = phone_types
        .trim()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    types.is_empty() || types.iter().any(|t| *t != "0")
}

/// Android device reached over adb.
///
/// Sessions are followed by sampling the UI hierarchy; only screens whose
/// text changed, or that follow a reply, are pushed.
pub struct AdbClient {
    shell: AdbShell,
    /// Package whose runtime permissions we inspect
    package: String,
    poll_interval: Duration,
    dialog_timeout: Duration,
    watcher: Mutex<Option<CancellationToken>>,
    reply_pending: Arc<AtomicBool>,
}

impl AdbClient {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            shell: AdbShell::new(config.adb_path.clone(), config.serial.clone()),
            package: config.package.clone(),
            poll_interval: config.poll_interval(),
            dialog_timeout: config.dialog_timeout(),
            watcher: Mutex::new(None),
            reply_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shell(&self) -> &AdbShell {
        &self.shell
    }

    fn replace_watcher(&self, token: Option<CancellationToken>) {
        let mut guard = self.watcher.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = std::mem::replace(&mut *guard, token) {
            old.cancel();
        }
    }
}

#[async_trait]
impl Permissions for AdbClient {
    async fn is_granted(&self, permission: Permission) -> UssdResult<bool> {
        let dumpsys = self.shell.shell(&["dumpsys", "package", &self.package]).await?;
        Ok(heuristics::permission_granted(&dumpsys, permission.as_str()))
    }

    async fn should_show_rationale(&self, _permission: Permission) -> UssdResult<bool> {
        Ok(false)
    }

    async fn request(&self, permission: Permission) -> UssdResult<()> {
        self.shell
            .shell(&["pm", "grant", &self.package, permission.as_str()])
            .await?;
        info!("Granted {} to {}", permission.as_str(), self.package);
        Ok(())
    }
}

#[async_trait]
impl Telephony for AdbClient {
    async fn platform_info(&self) -> UssdResult<PlatformInfo> {
        let sdk = self.shell.shell(&["getprop", "ro.build.version.sdk"]).await?;
        let sdk_int = sdk
            .trim()
            .parse::<u32>()
            .with_context(|| format!("Unexpected SDK level {:?}", sdk.trim()))?;
        let phone_types = self
            .shell
            .shell(&["getprop", "gsm.current.phone-type"])
            .await?;

        Ok(PlatformInfo {
            sdk_int,
            telephony_enabled: telephony_enabled(&phone_types),
            programmatic_ussd: false,
        })
    }

    async fn send_ussd_request(
        &self,
        code: &str,
        target: SimTarget,
        callback: UssdResponseCallback,
    ) -> UssdResult<()> {
        debug!("Single-shot USSD {} on {:?} is not reachable over adb", code, target);
        callback.on_failure(USSD_ERROR_SERVICE_UNAVAIL);
        Ok(())
    }
}

#[async_trait]
impl Dialer for AdbClient {
    async fn start_activity(&self, intent: &DialIntent) -> UssdResult<()> {
        self.shell
            .start_intent(intent)
            .await
            .map_err(|e| UssdError::DialerUnavailable(format!("{:#}", e)))
    }
}

#[async_trait]
impl TelecomAccounts for AdbClient {
    async fn call_capable_accounts(&self) -> UssdResult<Vec<PhoneAccountHandle>> {
        let dumpsys = self.shell.shell(&["dumpsys", "telecom"]).await?;
        Ok(heuristics::parse_phone_accounts(&dumpsys))
    }
}

#[async_trait]
impl SessionDriver for AdbClient {
    async fn invoke(
        &self,
        code: &str,
        slot: u32,
        updates: mpsc::UnboundedSender<ScreenUpdate>,
    ) -> UssdResult<()> {
        let intent = build_intent(code, SimTarget::Slot(slot), true, &[]);
        self.start_activity(&intent).await?;

        let stop = CancellationToken::new();
        self.replace_watcher(Some(stop.clone()));
        self.reply_pending.store(false, Ordering::SeqCst);
        tokio::spawn(watch_dialog(
            self.shell.clone(),
            updates,
            stop,
            self.reply_pending.clone(),
            self.poll_interval,
            self.dialog_timeout,
        ));
        Ok(())
    }

    async fn send_reply(&self, text: &str, event: &SessionEvent) -> UssdResult<()> {
        match self.shell.screen().await? {
            DialogScreen::Prompt { input, send, .. } => {
                if let Some(point) = input {
                    self.shell.tap(point).await?;
                }
                self.shell.type_text(text).await?;
                self.reply_pending.store(true, Ordering::SeqCst);
                match send {
                    Some(point) => self.shell.tap(point).await?,
                    None => self.shell.key(KEYCODE_ENTER).await?,
                }
                debug!("Reply submitted to screen from {}", event.captured_at);
                Ok(())
            }
            other => Err(UssdError::Platform(format!(
                "no USSD prompt on screen ({:?})",
                other
            ))),
        }
    }

    async fn cancel(&self, event: &SessionEvent) {
        self.replace_watcher(None);
        let result = match self.shell.screen().await {
            Ok(DialogScreen::Prompt {
                cancel: Some(point),
                ..
            }) => self.shell.tap(point).await,
            Ok(DialogScreen::Absent) => Ok(()),
            _ => self.shell.key(KEYCODE_BACK).await,
        };
        if let Err(e) = result {
            warn!("Could not close USSD dialog from {}: {:#}", event.captured_at, e);
        }
    }
}

/// What the watcher does after one dialog sample
#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchStep {
    /// Nothing new; sample again
    Wait,
    /// A screen the relay has not reported yet
    Emit(Vec<String>),
    /// The session ended with a message; dismiss the dialog and stop
    Finish {
        message: String,
        dismiss: Option<Point>,
    },
    /// Stop without an `Over`
    Stop,
}

/// Per-session watcher state, fed one sample at a time
#[derive(Debug)]
struct DialogWatch {
    timeout: Duration,
    last_dialog: Instant,
    seen_dialog: bool,
    last_prompt: Option<Vec<String>>,
    /// Set once the previous prompt went away, so an identical menu still counts
    left_prompt: bool,
}

impl DialogWatch {
    fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            timeout,
            last_dialog: now,
            seen_dialog: false,
            last_prompt: None,
            left_prompt: false,
        }
    }

    fn timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_dialog) >= self.timeout
    }

    fn observe(&mut self, screen: DialogScreen, reply_pending: bool, now: Instant) -> WatchStep {
        match screen {
            DialogScreen::Absent => {
                if self.seen_dialog && !reply_pending {
                    info!("USSD dialog closed outside the relay");
                    return WatchStep::Stop;
                }
                if self.timed_out(now) {
                    warn!("No USSD dialog for {:?}, giving up", self.timeout);
                    return WatchStep::Stop;
                }
                if self.seen_dialog {
                    self.left_prompt = true;
                }
                WatchStep::Wait
            }
            DialogScreen::Busy => {
                self.seen_dialog = true;
                self.last_dialog = now;
                self.left_prompt = true;
                WatchStep::Wait
            }
            DialogScreen::Prompt { texts, .. } => {
                self.seen_dialog = true;
                self.last_dialog = now;
                if !self.left_prompt && self.last_prompt.as_ref() == Some(&texts) {
                    return WatchStep::Wait;
                }
                self.left_prompt = false;
                self.last_prompt = Some(texts.clone());
                WatchStep::Emit(texts)
            }
            DialogScreen::Final { texts, dismiss } => WatchStep::Finish {
                message: texts.join("\n"),
                dismiss,
            },
        }
    }

    /// A sample that could not be taken still counts against the timeout
    fn sample_failed(&self, now: Instant) -> WatchStep {
        if self.timed_out(now) {
            warn!("No USSD dialog for {:?}, giving up", self.timeout);
            WatchStep::Stop
        } else {
            WatchStep::Wait
        }
    }
}

/// Sample the dialog until the session ends, the relay stops listening,
/// or no dialog shows up for `timeout`
async fn watch_dialog(
    shell: AdbShell,
    updates: mpsc::UnboundedSender<ScreenUpdate>,
    stop: CancellationToken,
    reply_pending: Arc<AtomicBool>,
    interval: Duration,
    timeout: Duration,
) {
    let mut watch = DialogWatch::new(Instant::now(), timeout);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = updates.closed() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let step = match shell.screen().await {
            Ok(screen) => watch.observe(
                screen,
                reply_pending.load(Ordering::SeqCst),
                Instant::now(),
            ),
            Err(e) => {
                debug!("Dialog sample failed: {:#}", e);
                watch.sample_failed(Instant::now())
            }
        };

        match step {
            WatchStep::Wait => {}
            WatchStep::Emit(texts) => {
                reply_pending.store(false, Ordering::SeqCst);
                let _ = updates.send(ScreenUpdate::Screen(SessionEvent::new(texts)));
            }
            WatchStep::Finish { message, dismiss } => {
                let _ = updates.send(ScreenUpdate::Over(message));
                let dismissed = match dismiss {
                    Some(point) => shell.tap(point).await,
                    None => shell.key(KEYCODE_BACK).await,
                };
                if let Err(e) = dismissed {
                    warn!("Could not dismiss final USSD dialog: {:#}", e);
                }
                break;
            }
            WatchStep::Stop => break,
        }
    }

    debug!("Dialog watcher stopped");
}
