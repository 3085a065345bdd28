//! Chrome Trace Event output model.
//!
//! The viewer-facing document is a flat array of event objects, each with a
//! phase tag and a handful of optional fields. Rather than a type hierarchy,
//! every event is one struct with a closed [`Phase`] tag; which optional
//! fields are populated depends on the phase. Absent fields are omitted from
//! the serialized output entirely (the viewer treats `null` and missing
//! differently, and only missing is valid).
//!
//! For the event format itself, see
//! <https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU/preview>

use std::collections::BTreeMap;

use serde::Serialize;

/// Event argument values are either strings or integers in this document.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArgValue {
    Str(String),
    Int(i64),
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Str(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<u64> for ArgValue {
    fn from(value: u64) -> Self {
        ArgValue::Int(value as i64)
    }
}

/// Key-value pairs that appear in the event box at the bottom of the UI.
pub type Args = BTreeMap<String, ArgValue>;

/// Event phase codes understood by the trace viewer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// Start of a span.
    #[serde(rename = "B")]
    Begin,
    /// End of a span.
    #[serde(rename = "E")]
    End,
    /// A standalone point-in-time event.
    #[serde(rename = "i")]
    Instant,
    /// Naming/ordering metadata with no timestamp.
    #[serde(rename = "M")]
    Metadata,
}

/// A single trace event.
///
/// Timestamps are microseconds (the viewer's unit). Events are constructed
/// with nanosecond timestamps and converted exactly once when they enter the
/// output sequence; see [`crate::events::EventList`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    /// Name of the event, as displayed in the viewer.
    pub name: String,
    pub ph: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Args>,
    /// Timestamp in µs. Metadata events carry none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,
    /// Pid in the viewer's sense: a real outer-namespace pid or a pseudo pid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tid: Option<i64>,
    /// Instant event scope ('g' global, 'p' process, 't' thread).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<char>,
}

pub const PROCESS_NAME: &str = "process_name";
pub const THREAD_NAME: &str = "thread_name";
pub const PROCESS_LABELS: &str = "process_labels";
pub const PROCESS_SORT_INDEX: &str = "process_sort_index";
pub const THREAD_SORT_INDEX: &str = "thread_sort_index";

impl Event {
    fn new(name: impl Into<String>, ph: Phase) -> Self {
        Event {
            name: name.into(),
            ph,
            args: None,
            ts: None,
            pid: None,
            tid: None,
            s: None,
        }
    }

    /// An event that starts a span. `ts` is in nanoseconds.
    pub fn begin(name: impl Into<String>, ts: u64, args: Option<Args>) -> Self {
        Event {
            ts: Some(ts as f64),
            args,
            ..Event::new(name, Phase::Begin)
        }
    }

    /// An event that ends a span. `ts` is in nanoseconds.
    pub fn end(name: impl Into<String>, ts: u64, args: Option<Args>) -> Self {
        Event {
            ts: Some(ts as f64),
            args,
            ..Event::new(name, Phase::End)
        }
    }

    /// A standalone event, process-scoped. `ts` is in nanoseconds.
    pub fn instant(name: impl Into<String>, pid: i64, tid: i64, ts: u64, args: Args) -> Self {
        Event {
            ts: Some(ts as f64),
            pid: Some(pid),
            tid: Some(tid),
            args: Some(args),
            s: Some('p'),
            ..Event::new(name, Phase::Instant)
        }
    }

    fn metadata(name: &'static str, pid: i64, tid: Option<i64>, key: &str, value: ArgValue) -> Self {
        let mut args = Args::new();
        args.insert(key.to_string(), value);
        Event {
            pid: Some(pid),
            tid,
            args: Some(args),
            ..Event::new(name, Phase::Metadata)
        }
    }

    /// Metadata associating a pid with a process name.
    pub fn process_name(pid: i64, process_name: &str) -> Self {
        Event::metadata(PROCESS_NAME, pid, None, "name", process_name.into())
    }

    /// Metadata associating a (pid, tid) pair with a thread name.
    pub fn thread_name(pid: i64, tid: i64, thread_name: &str) -> Self {
        Event::metadata(THREAD_NAME, pid, Some(tid), "name", thread_name.into())
    }

    /// Metadata associating a label with a process.
    pub fn process_labels(pid: i64, label: &str) -> Self {
        Event::metadata(PROCESS_LABELS, pid, None, "labels", label.into())
    }

    /// Metadata fixing the position of a process in the viewer's track list.
    pub fn process_sort_index(pid: i64, index: i64) -> Self {
        Event::metadata(PROCESS_SORT_INDEX, pid, None, "sort_index", index.into())
    }

    /// Metadata fixing the position of a thread within its process.
    pub fn thread_sort_index(pid: i64, tid: i64, index: i64) -> Self {
        Event::metadata(THREAD_SORT_INDEX, pid, Some(tid), "sort_index", index.into())
    }

    pub fn is_thread_name(&self) -> bool {
        self.ph == Phase::Metadata && self.name == THREAD_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_fields_are_omitted() {
        let ev = Event::process_name(42, "sshd");
        let json = serde_json::to_value(&ev).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("ts"));
        assert!(!obj.contains_key("tid"));
        assert!(!obj.contains_key("s"));
        assert_eq!(obj["ph"], "M");
        assert_eq!(obj["pid"], 42);
        assert_eq!(obj["args"]["name"], "sshd");
    }

    #[test]
    fn test_instant_scope_code() {
        let mut args = Args::new();
        args.insert("cpu".to_string(), 3i64.into());
        let ev = Event::instant("thread_exit", 10, 11, 2_000, args);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["ph"], "i");
        assert_eq!(json["s"], "p");
        assert_eq!(json["args"]["cpu"], 3);
    }

    #[test]
    fn test_arg_values_serialize_untagged() {
        assert_eq!(serde_json::to_value(ArgValue::Int(5)).unwrap(), 5);
        assert_eq!(serde_json::to_value(ArgValue::Str("S".into())).unwrap(), "S");
    }
}
