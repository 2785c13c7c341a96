use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::platform::PhoneAccountHandle;

/// Package that owns the USSD dialogs
pub const DIALOG_PACKAGE: &str = "com.android.phone";

/// Screen coordinate to tap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// What the phone dialog currently shows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogScreen {
    /// No USSD dialog on screen
    Absent,
    /// The request is still running
    Busy,
    /// The carrier is waiting for an answer
    Prompt {
        texts: Vec<String>,
        input: Option<Point>,
        send: Option<Point>,
        cancel: Option<Point>,
    },
    /// The session ended with a message
    Final {
        texts: Vec<String>,
        dismiss: Option<Point>,
    },
}

#[derive(Debug, Default, Clone)]
struct Node {
    text: String,
    class: String,
    package: String,
    resource_id: String,
    center: Option<Point>,
}

/// Compiled patterns for reading `uiautomator dump` output
static RE_NODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<node\b[^>]*>").unwrap());

static RE_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"([\w-]+)="([^"]*)""#).unwrap());

static RE_BOUNDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(-?\d+),(-?\d+)\]\[(-?\d+),(-?\d+)\]").unwrap());

static RE_SEND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(send|reply|answer|respond|ok)\s*$").unwrap());

static RE_CANCEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(cancel|dismiss|close)\s*$").unwrap());

static RE_PHONE_ACCOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"ComponentInfo\{([^}]+)\}, ([^,\s]+), UserHandle").unwrap()
});

static RE_AM_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(Error( type \d+)?:|Exception occurred)").unwrap());

/// Engine for inferring dialog state from a UI hierarchy dump
pub struct ScreenInference;

impl ScreenInference {
    pub fn analyze(dump: &str) -> DialogScreen {
        let nodes: Vec<Node> = RE_NODE
            .find_iter(dump)
            .map(|m| parse_node(m.as_str()))
            .filter(|n| n.package == DIALOG_PACKAGE)
            .collect();

        if nodes.is_empty() {
            return DialogScreen::Absent;
        }

        let is_button = |n: &Node| n.class.ends_with("Button");
        let is_input = |n: &Node| n.class.ends_with("EditText");

        let mut texts: Vec<(bool, String)> = nodes
            .iter()
            .filter(|n| !is_button(n) && !is_input(n) && !n.text.trim().is_empty())
            .map(|n| (n.resource_id == "android:id/message", n.text.clone()))
            .collect();
        // The dialog message first, then anything else in document order
        texts.sort_by_key(|(is_message, _)| !is_message);
        let texts: Vec<String> = texts.into_iter().map(|(_, t)| t).collect();

        let button = |re: &Regex| {
            nodes
                .iter()
                .filter(|n| is_button(n) && re.is_match(&n.text))
                .find_map(|n| n.center)
        };

        // Priority order: Prompt > Busy > Final. Carrier text is never
        // inspected, a menu may say anything.
        if let Some(input) = nodes.iter().find(|n| is_input(n)) {
            return DialogScreen::Prompt {
                texts,
                input: input.center,
                send: button(&*RE_SEND),
                cancel: button(&*RE_CANCEL),
            };
        }

        if nodes.iter().any(|n| n.class.ends_with("ProgressBar")) {
            return DialogScreen::Busy;
        }

        let dismiss = button(&*RE_SEND)
            .or_else(|| button(&*RE_CANCEL))
            .or_else(|| nodes.iter().filter(|n| is_button(n)).find_map(|n| n.center));
        DialogScreen::Final { texts, dismiss }
    }
}

fn parse_node(tag: &str) -> Node {
    let mut node = Node::default();
    for cap in RE_ATTR.captures_iter(tag) {
        let value = unescape(&cap[2]);
        match &cap[1] {
            "text" => node.text = value,
            "class" => node.class = value,
            "package" => node.package = value,
            "resource-id" => node.resource_id = value,
            "bounds" => node.center = parse_center(&value),
            _ => {}
        }
    }
    node
}

fn parse_center(bounds: &str) -> Option<Point> {
    let cap = RE_BOUNDS.captures(bounds)?;
    let n = |i: usize| cap[i].parse::<i32>().ok();
    let (left, top, right, bottom) = (n(1)?, n(2)?, n(3)?, n(4)?);
    Some(Point {
        x: (left + right) / 2,
        y: (top + bottom) / 2,
    })
}

fn unescape(raw: &str) -> String {
    raw.replace("&#10;", "\n")
        .replace("&#13;", "\r")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Whether `dumpsys package` output lists `permission` as granted
pub fn permission_granted(dumpsys: &str, permission: &str) -> bool {
    let needle = format!("{}: granted=true", permission);
    dumpsys.lines().any(|line| line.trim_start().starts_with(&needle))
}

/// Call-capable accounts listed by `dumpsys telecom`, in order, deduplicated
pub fn parse_phone_accounts(dumpsys: &str) -> Vec<PhoneAccountHandle> {
    let mut accounts: Vec<PhoneAccountHandle> = Vec::new();
    for cap in RE_PHONE_ACCOUNT.captures_iter(dumpsys) {
        let account = PhoneAccountHandle {
            component: cap[1].to_string(),
            id: cap[2].to_string(),
        };
        if !accounts.contains(&account) {
            accounts.push(account);
        }
    }
    accounts
}

/// Whether `am start` reported a failure on stdout
pub fn am_start_failed(output: &str) -> bool {
    RE_AM_ERROR.is_match(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(text: &str, class: &str, rid: &str, bounds: &str) -> String {
        format!(
            r#"<node index="0" text="{}" resource-id="{}" class="{}" package="com.android.phone" content-desc="" bounds="{}" />"#,
            text, rid, class, bounds
        )
    }

    fn hierarchy(nodes: &[String]) -> String {
        format!(
            r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?><hierarchy rotation="0"><node index="0" text="" class="android.widget.FrameLayout" package="com.android.launcher3" bounds="[0,0][1080,2340]">{}</node></hierarchy>"#,
            nodes.join("")
        )
    }

    #[test]
    fn test_detect_absent() {
        let dump = hierarchy(&[]);
        assert_eq!(ScreenInference::analyze(&dump), DialogScreen::Absent);
        assert_eq!(ScreenInference::analyze(""), DialogScreen::Absent);
    }

    #[test]
    fn test_detect_busy() {
        let dump = hierarchy(&[
            node("", "android.widget.ProgressBar", "", "[100,1000][200,1100]"),
            node("USSD code running…", "android.widget.TextView", "android:id/message", "[220,1000][900,1100]"),
        ]);
        assert_eq!(ScreenInference::analyze(&dump), DialogScreen::Busy);
    }

    #[test]
    fn test_menu_with_input_is_prompt() {
        let dump = hierarchy(&[
            node("1. Airtime Loading&#10;2. Balance", "android.widget.TextView", "android:id/message", "[60,800][1020,1000]"),
            node("", "android.widget.EditText", "com.android.phone:id/input_field", "[60,1000][1020,1100]"),
            node("Send", "android.widget.Button", "android:id/button1", "[750,1150][1000,1250]"),
        ]);
        match ScreenInference::analyze(&dump) {
            DialogScreen::Prompt { texts, send, .. } => {
                assert_eq!(texts, vec!["1. Airtime Loading\n2. Balance".to_string()]);
                assert_eq!(send, Some(Point { x: 875, y: 1200 }));
            }
            other => panic!("expected prompt, got {:?}", other),
        }
    }

    #[test]
    fn test_final_wording_is_not_busy() {
        let dump = hierarchy(&[
            node("Please wait for an SMS confirmation", "android.widget.TextView", "android:id/message", "[60,800][1020,1000]"),
            node("OK", "android.widget.Button", "android:id/button1", "[800,1100][1000,1200]"),
        ]);
        assert_eq!(
            ScreenInference::analyze(&dump),
            DialogScreen::Final {
                texts: vec!["Please wait for an SMS confirmation".to_string()],
                dismiss: Some(Point { x: 900, y: 1150 }),
            }
        );
    }

    #[test]
    fn test_detect_prompt() {
        let dump = hierarchy(&[
            node("1. Balance&#10;2. Bundles", "android.widget.TextView", "android:id/message", "[60,800][1020,1000]"),
            node("", "android.widget.EditText", "com.android.phone:id/input_field", "[60,1000][1020,1100]"),
            node("Cancel", "android.widget.Button", "android:id/button2", "[500,1150][700,1250]"),
            node("Send", "android.widget.Button", "android:id/button1", "[750,1150][1000,1250]"),
        ]);
        match ScreenInference::analyze(&dump) {
            DialogScreen::Prompt {
                texts,
                input,
                send,
                cancel,
            } => {
                assert_eq!(texts, vec!["1. Balance\n2. Bundles".to_string()]);
                assert_eq!(input, Some(Point { x: 540, y: 1050 }));
                assert_eq!(send, Some(Point { x: 875, y: 1200 }));
                assert_eq!(cancel, Some(Point { x: 600, y: 1200 }));
            }
            other => panic!("expected prompt, got {:?}", other),
        }
    }

    #[test]
    fn test_message_sorted_first() {
        let dump = hierarchy(&[
            node("Carrier", "android.widget.TextView", "android:id/alertTitle", "[0,0][10,10]"),
            node("Enter PIN:", "android.widget.TextView", "android:id/message", "[0,10][10,20]"),
            node("", "android.widget.EditText", "", "[0,20][10,30]"),
        ]);
        match ScreenInference::analyze(&dump) {
            DialogScreen::Prompt { texts, .. } => {
                assert_eq!(texts, vec!["Enter PIN:".to_string(), "Carrier".to_string()])
            }
            other => panic!("expected prompt, got {:?}", other),
        }
    }

    #[test]
    fn test_detect_final() {
        let dump = hierarchy(&[
            node("Your balance is 4.20 &amp; valid until 01/12", "android.widget.TextView", "android:id/message", "[60,800][1020,1000]"),
            node("OK", "android.widget.Button", "android:id/button1", "[800,1100][1000,1200]"),
        ]);
        assert_eq!(
            ScreenInference::analyze(&dump),
            DialogScreen::Final {
                texts: vec!["Your balance is 4.20 & valid until 01/12".to_string()],
                dismiss: Some(Point { x: 900, y: 1150 }),
            }
        );
    }

    #[test]
    fn test_permission_granted() {
        let dumpsys = "    runtime permissions:\n      android.permission.CALL_PHONE: granted=true\n      android.permission.READ_PHONE_STATE: granted=false\n";
        assert!(permission_granted(dumpsys, "android.permission.CALL_PHONE"));
        assert!(!permission_granted(dumpsys, "android.permission.READ_PHONE_STATE"));
        assert!(!permission_granted("", "android.permission.CALL_PHONE"));
    }

    #[test]
    fn test_parse_phone_accounts() {
        let dumpsys = "\
  [PhoneAccount: ComponentInfo{com.android.phone/com.android.services.telephony.TelephonyConnectionService}, 8901410321111851072, UserHandle{0} Capabilities: CallProvider]
  [PhoneAccount: ComponentInfo{com.android.phone/com.android.services.telephony.TelephonyConnectionService}, 8944110068256270054, UserHandle{0} Capabilities: CallProvider]
  [PhoneAccount: ComponentInfo{com.android.phone/com.android.services.telephony.TelephonyConnectionService}, 8901410321111851072, UserHandle{0} Capabilities: CallProvider]";
        let accounts = parse_phone_accounts(dumpsys);
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].id, "8901410321111851072");
        assert_eq!(accounts[1].id, "8944110068256270054");
        assert!(accounts[0].component.starts_with("com.android.phone/"));
    }

    #[test]
    fn test_am_start_failed() {
        assert!(am_start_failed(
            "Starting: Intent { act=android.intent.action.CALL }\nError: Activity not started, unable to resolve Intent"
        ));
        assert!(!am_start_failed(
            "Starting: Intent { act=android.intent.action.CALL dat=tel:xxxxx flg=0x10000000 }"
        ));
    }
}
