//! GDB Machine Interface (MI) Type Definitions

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Outcome class of a command.
///
/// The first five mirror the `^` result classes GDB emits; `Timeout` is only
/// ever produced locally when no result record arrived in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandStatus {
    Done,
    Running,
    Connected,
    Error,
    Exit,
    Timeout,
}

impl CommandStatus {
    /// Map the keyword following `^` to a status
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "done" => Some(CommandStatus::Done),
            "running" => Some(CommandStatus::Running),
            "connected" => Some(CommandStatus::Connected),
            "error" => Some(CommandStatus::Error),
            "exit" => Some(CommandStatus::Exit),
            _ => None,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandStatus::Done => "done",
            CommandStatus::Running => "running",
            CommandStatus::Connected => "connected",
            CommandStatus::Error => "error",
            CommandStatus::Exit => "exit",
            CommandStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// GDB/MI value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MiValue {
    String(String),
    List(Vec<MiValue>),
    Tuple(MiTuple),
}

/// Insertion-ordered `name=value` pairs
pub type MiTuple = IndexMap<String, MiValue>;

impl MiValue {
    pub fn empty_tuple() -> Self {
        MiValue::Tuple(MiTuple::new())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MiValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&MiTuple> {
        match self {
            MiValue::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[MiValue]> {
        match self {
            MiValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Look up a field when this value is a tuple
    pub fn get(&self, key: &str) -> Option<&MiValue> {
        self.as_tuple()?.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Numeric fields arrive as quoted strings (`line="12"`)
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get_str(key)?.parse().ok()
    }

    /// Every value stored under `key`.
    ///
    /// A list (including one produced by folding repeated keys) yields its
    /// items, any other value yields itself, a missing key yields nothing.
    pub fn get_all(&self, key: &str) -> Vec<&MiValue> {
        match self.get(key) {
            Some(MiValue::List(items)) => items.iter().collect(),
            Some(value) => vec![value],
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MiValue::String(_) => 0,
            MiValue::List(l) => l.len(),
            MiValue::Tuple(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Store `value` under `name`, folding a repeated name into a list.
///
/// The first occurrence keeps its position in the tuple; later ones are
/// appended to the list that replaces it.
pub fn insert_coalescing(tuple: &mut MiTuple, name: String, value: MiValue) {
    match tuple.get_mut(&name) {
        Some(MiValue::List(items)) => items.push(value),
        Some(existing) => {
            let first = std::mem::replace(existing, MiValue::List(Vec::new()));
            *existing = MiValue::List(vec![first, value]);
        }
        None => {
            tuple.insert(name, value);
        }
    }
}

/// Result of one issued command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub raw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<MiValue>,
}

impl CommandResult {
    pub fn new(status: CommandStatus, raw: impl Into<String>, payload: Option<MiValue>) -> Self {
        Self {
            status,
            raw: raw.into(),
            payload,
        }
    }

    /// A result produced locally rather than read from GDB; the message is
    /// exposed under `msg` like a real `^error` record.
    pub fn synthesized(status: CommandStatus, message: &str) -> Self {
        let mut payload = MiTuple::new();
        payload.insert("msg".to_string(), MiValue::String(message.to_string()));
        Self::new(status, message, Some(MiValue::Tuple(payload)))
    }

    pub fn timeout() -> Self {
        Self::synthesized(CommandStatus::Timeout, "GDB timed out")
    }

    pub fn exited() -> Self {
        Self::synthesized(CommandStatus::Exit, "GDB session has exited")
    }

    /// Rejection issued locally when the target is executing in sync mode
    pub fn target_running() -> Self {
        Self::synthesized(
            CommandStatus::Running,
            "Not possible while the target is running",
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            CommandStatus::Done | CommandStatus::Running | CommandStatus::Connected
        )
    }

    pub fn field(&self, key: &str) -> Option<&MiValue> {
        self.payload.as_ref()?.get(key)
    }

    /// `msg` of an error record
    pub fn message(&self) -> Option<&str> {
        self.field("msg")?.as_str()
    }

    /// `value` of an expression evaluation
    pub fn value(&self) -> Option<&str> {
        self.field("value")?.as_str()
    }

    /// Breakpoint reported by `-break-insert`
    pub fn breakpoint_info(&self) -> Option<BreakpointInfo> {
        BreakpointInfo::from_value(self.field("bkpt")?)
    }

    /// Frames reported by `-stack-list-frames`
    pub fn frames(&self) -> Vec<Frame> {
        let Some(stack) = self.field("stack") else {
            return Vec::new();
        };
        // `[frame={..},frame={..}]`: every item is a one-entry tuple
        stack
            .as_list()
            .unwrap_or(&[])
            .iter()
            .map(|item| item.get("frame").unwrap_or(item))
            .filter_map(Frame::from_value)
            .collect()
    }

    /// `name`/`value` pairs reported by `-stack-list-locals 1`
    pub fn locals(&self) -> Vec<Local> {
        let Some(locals) = self.field("locals") else {
            return Vec::new();
        };
        locals
            .as_list()
            .unwrap_or(&[])
            .iter()
            .filter_map(|item| {
                Some(Local {
                    name: item.get_str("name")?.to_string(),
                    value: item.get_str("value").map(str::to_string),
                })
            })
            .collect()
    }
}

/// Local variable from a stack listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Local {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Asynchronous record: `*` execution events and `=` notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GdbEvent {
    pub name: String,
    pub payload: MiValue,
}

impl GdbEvent {
    pub fn new(name: impl Into<String>, payload: MiValue) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.name == "stopped"
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.payload.get_str("reason").map(StopReason::from)
    }

    pub fn frame(&self) -> Option<Frame> {
        Frame::from_value(self.payload.get("frame")?)
    }
}

/// Stop reason types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    BreakpointHit,
    WatchpointTrigger,
    FunctionFinished,
    LocationReached,
    EndSteppingRange,
    ExitedSignalled,
    Exited,
    ExitedNormally,
    SignalReceived,
    Unknown(String),
}

impl From<&str> for StopReason {
    fn from(s: &str) -> Self {
        match s {
            "breakpoint-hit" => StopReason::BreakpointHit,
            "watchpoint-trigger" => StopReason::WatchpointTrigger,
            "function-finished" => StopReason::FunctionFinished,
            "location-reached" => StopReason::LocationReached,
            "end-stepping-range" => StopReason::EndSteppingRange,
            "exited-signalled" => StopReason::ExitedSignalled,
            "exited" => StopReason::Exited,
            "exited-normally" => StopReason::ExitedNormally,
            "signal-received" => StopReason::SignalReceived,
            other => StopReason::Unknown(other.to_string()),
        }
    }
}

/// Frame information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default)]
    pub level: Option<u32>,
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default)]
    pub func: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

impl Frame {
    pub fn from_value(value: &MiValue) -> Option<Self> {
        value.as_tuple()?;
        Some(Frame {
            level: value.get_u32("level"),
            addr: value.get_str("addr").map(str::to_string),
            func: value.get_str("func").map(str::to_string),
            file: value.get_str("file").map(str::to_string),
            fullname: value.get_str("fullname").map(str::to_string),
            line: value.get_u32("line"),
        })
    }

    /// Source position usable for navigation, when GDB knows both parts
    pub fn location(&self) -> Option<(PathBuf, u32)> {
        let path = self.fullname.as_deref().filter(|p| !p.is_empty())?;
        Some((PathBuf::from(path), self.line?))
    }
}

/// Source breakpoint as the IDE models it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Breakpoint {
    pub file: PathBuf,
    pub line: u32,
}

impl Breakpoint {
    pub fn new(file: impl Into<PathBuf>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// Quoted `"<file>:<line>"` argument, always with forward slashes
    pub fn location_arg(&self) -> String {
        format!(
            "\"{}:{}\"",
            self.file.to_string_lossy().replace('\\', "/"),
            self.line
        )
    }

    pub fn matches(&self, file: &Path, line: u32) -> bool {
        self.line == line && self.file == file
    }
}

/// Breakpoint as GDB reports it in a `bkpt={...}` tuple
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakpointInfo {
    pub number: String,
    #[serde(rename = "type")]
    pub breakpoint_type: String,
    pub disposition: String,
    pub enabled: bool,
    #[serde(default)]
    pub addr: Option<String>,
    #[serde(default)]
    pub func: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub times: u32,
    #[serde(default)]
    pub original_location: Option<String>,
}

impl BreakpointInfo {
    pub fn from_value(value: &MiValue) -> Option<Self> {
        Some(BreakpointInfo {
            number: value.get_str("number")?.to_string(),
            breakpoint_type: value.get_str("type").unwrap_or_default().to_string(),
            disposition: value.get_str("disp").unwrap_or_default().to_string(),
            enabled: value.get_str("enabled").map(|s| s == "y").unwrap_or(true),
            addr: value.get_str("addr").map(str::to_string),
            func: value.get_str("func").map(str::to_string),
            file: value.get_str("file").map(str::to_string),
            fullname: value.get_str("fullname").map(str::to_string),
            line: value.get_u32("line"),
            times: value.get_u32("times").unwrap_or(0),
            original_location: value.get_str("original-location").map(str::to_string),
        })
    }
}

/// Lifecycle of a debug session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Ready,
    Running,
    Stopped,
    Exited,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// What subscribers of a session receive
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum SessionEvent {
    /// `*` execution state change
    Exec(GdbEvent),
    /// `=` notification
    Notify(GdbEvent),
    /// `~` console stream
    Console(String),
    /// `&` log stream, also carries `^error` messages
    Log(String),
    /// `@` output of the debugged program
    Target(String),
    /// Every raw line read from GDB, plus local notices
    Output(String),
    /// A command line as written to GDB
    CommandSent(String),
    Exited,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(pairs: &[(&str, MiValue)]) -> MiValue {
        let mut t = MiTuple::new();
        for (k, v) in pairs {
            insert_coalescing(&mut t, k.to_string(), v.clone());
        }
        MiValue::Tuple(t)
    }

    fn s(v: &str) -> MiValue {
        MiValue::String(v.to_string())
    }

    #[test]
    fn test_repeated_key_folds_into_list_at_first_position() {
        let v = tuple(&[("a", s("1")), ("b", s("x")), ("a", s("2")), ("a", s("3"))]);
        let t = v.as_tuple().unwrap();
        assert_eq!(t.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(
            t.get("a"),
            Some(&MiValue::List(vec![s("1"), s("2"), s("3")]))
        );
        assert_eq!(v.get_all("a").len(), 3);
        assert_eq!(v.get_all("b"), vec![&s("x")]);
        assert!(v.get_all("c").is_empty());
    }

    #[test]
    fn test_breakpoint_location_uses_forward_slashes() {
        let bp = Breakpoint::new("C:\\proj\\top.vhd", 42);
        assert_eq!(bp.location_arg(), "\"C:/proj/top.vhd:42\"");
        assert_eq!(Breakpoint::new("/proj/a.vhd", 7).location_arg(), "\"/proj/a.vhd:7\"");
    }

    #[test]
    fn test_synthesized_results_expose_message() {
        let r = CommandResult::timeout();
        assert_eq!(r.status, CommandStatus::Timeout);
        assert_eq!(r.message(), Some("GDB timed out"));
        assert!(!r.is_success());
        assert_eq!(CommandResult::target_running().status, CommandStatus::Running);
    }

    #[test]
    fn test_frame_location_requires_fullname_and_line() {
        let frame = Frame::from_value(&tuple(&[("fullname", s("/x/y.vhd")), ("line", s("10"))])).unwrap();
        assert_eq!(frame.location(), Some((PathBuf::from("/x/y.vhd"), 10)));

        let no_line = Frame::from_value(&tuple(&[("fullname", s("/x/y.vhd"))])).unwrap();
        assert_eq!(no_line.location(), None);

        let bad_line = Frame::from_value(&tuple(&[("fullname", s("/x/y.vhd")), ("line", s("??"))])).unwrap();
        assert_eq!(bad_line.location(), None);
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(StopReason::from("breakpoint-hit"), StopReason::BreakpointHit);
        assert_eq!(
            StopReason::from("vfork"),
            StopReason::Unknown("vfork".to_string())
        );
    }

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&CommandResult::exited()).unwrap();
        assert!(json.contains("\"status\":\"exit\""));
    }
}
