//! Parses the output of `perf script` (run with `--show-task-events
//! --fields pid,tid,cpu,time,event,trace --ns`).
//!
//! You might wonder, why parse text? `perf` has a built-in scripting
//! interface, but it omits events this tool requires — in particular the
//! PERF_RECORD_COMM events providing process/thread hierarchy and names.
//!
//! Lines that match nothing here are logged and dropped; the engine never
//! sees them.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{error, warn};

/// All possible typed records.
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    Sched(SchedRecord),
    Comm(CommRecord),
    Fork(ForkRecord),
    Exit(ExitRecord),
}

/// A scheduling event (`sched:sched_*` tracepoint output).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchedRecord {
    /// Tracepoint name, e.g. `sched_switch`.
    pub rec_type: String,
    /// Pid as seen from outside the namespace.
    pub opid: i64,
    /// Tid as seen from outside the namespace.
    pub otid: i64,
    pub cpu: i64,
    /// Timestamp in ns.
    pub ts: u64,
    /// The tracepoint's `key=value` payload, untyped.
    pub args: HashMap<String, String>,
}

/// A process/thread naming record, covering the tasks already running when
/// the recording started (and exec renames during it).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommRecord {
    pub name: String,
    pub pid: i64,
    pub tid: i64,
}

/// A process or thread creation during the recording.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ForkRecord {
    pub pid: i64,
    pub tid: i64,
    pub ppid: i64,
    pub ptid: i64,
    pub opid: i64,
    pub otid: i64,
    pub cpu: i64,
    pub ts: u64,
}

/// A thread or process ending during the recording.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExitRecord {
    pub pid: i64,
    pub tid: i64,
    pub opid: i64,
    pub otid: i64,
    pub cpu: i64,
    pub ts: u64,
}

// A sched record line, consuming the entire line. eg:
//
// 1234/1234  [002] 3376096.441959680:  sched:sched_waking: comm=kworker/2:1 ...
// ^^^^ ^^^^   ^^^  ^^^^^^^ ^^^^^^^^^         ^^^^^^^^^^^^ ^^^^^^^^^^^^^^^^^^^^^
// opid otid   cpu  ts secs  ts nsecs             type          other stuff
static SCHED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ *([\d-]+)/([\d-]+) +\[0*(\d+)\] +(\d+)\.(\d+): +sched:(\w+): (.*)$")
        .expect("invalid sched record regex")
});

// Any PERF_RECORD_* line, consuming the entire line. eg:
//
//  6802/6802  [004] 926991.760617747: PERF_RECORD_COMM exec: ifconfig:6802/6802
//  ^^^^ ^^^^   ^^^  ^^^^^^ ^^^^^^^^^              ^^^^ ^^^^^^^^^^^^^^^^^^^^^^^^
//  opid otid   cpu  ts sec  ts nsec               type         other stuff
static PERF_RECORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ *([\d-]+)/([\d-]+) +\[0*(\d+)\] +(\d+)\.(\d+): PERF_RECORD_([A-Z]+)(.*)$")
        .expect("invalid perf record regex")
});

// Unusual output for sched:sched_switch from at least one perf build that
// reports no version number:
//
// sched:sched_switch: dev 0 ts:6450 [120] S ==> swapper/3:0 [120]
//                     ^^^^^^^^ ^^^^  ^^^  ^     ^^^^^^^^^ ^  ^^^
//                     prev_comm pid  prio state next_comm pid prio
//
// The state can be compound, e.g. "D|W".
static WEIRD_SCHED_SWITCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?):(\d+) \[(\d+)\] (\S+) ==> (.*):(\d+) \[(\d+)\]$")
        .expect("invalid fallback sched_switch regex")
});

// Unusual output for sched:sched_wakeup, same perf build:
//
// sched:sched_wakeup: db_writer:3736 [120] success=1 CPU:003
//                     ^^^^^^^^^ ^^^^  ^^^                ^^^
//                      comm     pid   prio               cpu
static WEIRD_SCHED_WAKEUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?):(\d+) \[(\d+)\] .*? CPU:(\d+)$").expect("invalid fallback wakeup regex")
});

// The specifics of a PERF_RECORD_COMM, eg:
//                                                          input is this bit
//                                                      |----------------------|
//  6802/6802  [004] 926991.760617747: PERF_RECORD_COMM exec: ifconfig:6802/6802
//                                                            ^^^^^^^^ ^^^^ ^^^^
//                                                 process/thread name  pid  tid
static COMM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?: exec)?: (.*):(\d+)/(\d+)$").expect("invalid comm regex"));

// The shared payload of PERF_RECORD_FORK and PERF_RECORD_EXIT, eg:
//
//  PERF_RECORD_FORK(6780:6781):(6780:6780)
//                   ^^^^ ^^^^   ^^^^ ^^^^
//                   pid  tid    ppid ptid
static FORK_EXIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d+):(\d+)\):\((\d+):(\d+)\)").expect("invalid fork regex"));

/// Parse a line into a structured record if possible.
pub fn parse(line: &str) -> Option<Record> {
    // Try the most common case first: a sched record.
    if let Some(caps) = SCHED_RE.captures(line) {
        return SchedRecord::parse(&caps).map(Record::Sched);
    }

    // If that fails, try a PERF_RECORD_* match.
    let Some(caps) = PERF_RECORD_RE.captures(line) else {
        warn!("ignoring unknown record: {}", line.trim_end());
        return None;
    };

    let opid: i64 = caps[1].parse().ok()?;
    let otid: i64 = caps[2].parse().ok()?;
    let cpu: i64 = caps[3].parse().ok()?;
    let secs: u64 = caps[4].parse().ok()?;
    let nsecs: u64 = caps[5].parse().ok()?;
    let ts = secs * 1_000_000_000 + nsecs;
    let rest = &caps[7];
    match &caps[6] {
        "COMM" => CommRecord::parse(rest).map(Record::Comm),
        "FORK" => {
            // Timestamp-zero fork entries describe pre-existing tasks; the
            // COMM records carry more information for those.
            if ts > 0 {
                ForkRecord::parse(rest, opid, otid, cpu, ts).map(Record::Fork)
            } else {
                None
            }
        }
        "EXIT" => ExitRecord::parse(rest, opid, otid, cpu, ts).map(Record::Exit),
        _ => {
            warn!("ignoring unknown PERF_RECORD_* entry: {}", line.trim_end());
            None
        }
    }
}

impl SchedRecord {
    fn parse(caps: &regex::Captures<'_>) -> Option<SchedRecord> {
        let opid: i64 = caps[1].parse().ok()?;
        let otid: i64 = caps[2].parse().ok()?;
        let cpu: i64 = caps[3].parse().ok()?;
        let secs: u64 = caps[4].parse().ok()?;
        let nsecs: u64 = caps[5].parse().ok()?;
        let ts = secs * 1_000_000_000 + nsecs;
        let rec_type = caps[6].to_string();
        let raw_args = &caps[7];

        // Convert the args (eg "key1=val1 key2=val2 [ns]") into a map,
        // skipping anything that isn't exactly key=value (the "==>" between
        // the halves of a sched_switch, the "[ns]" unit tags).
        let mut args: HashMap<String, String> = HashMap::new();
        for token in raw_args.split_whitespace() {
            let parts: Vec<&str> = token.split('=').collect();
            if let [key, value] = parts[..] {
                args.insert(key.to_string(), value.to_string());
            }
        }

        // At least one perf build emits positional output instead of
        // key=value pairs; recover the fields from the known shapes. It is
        // fine for this to be slower, since it shouldn't really happen.
        if rec_type == "sched_switch" && !args.contains_key("prev_comm") {
            if let Some(m) = WEIRD_SCHED_SWITCH_RE.captures(raw_args) {
                args = HashMap::from([
                    ("prev_comm".to_string(), m[1].to_string()),
                    ("prev_pid".to_string(), m[2].to_string()),
                    ("prev_prio".to_string(), m[3].to_string()),
                    ("prev_state".to_string(), m[4].to_string()),
                    ("next_comm".to_string(), m[5].to_string()),
                    ("next_pid".to_string(), m[6].to_string()),
                    ("next_prio".to_string(), m[7].to_string()),
                ]);
            }
        } else if rec_type == "sched_wakeup" && !args.contains_key("pid") {
            if let Some(m) = WEIRD_SCHED_WAKEUP_RE.captures(raw_args) {
                args = HashMap::from([
                    ("comm".to_string(), m[1].to_string()),
                    ("pid".to_string(), m[2].to_string()),
                    ("prio".to_string(), m[3].to_string()),
                    ("target_cpu".to_string(), m[4].to_string()),
                ]);
            }
        }

        Some(SchedRecord {
            rec_type,
            opid,
            otid,
            cpu,
            ts,
            args,
        })
    }
}

impl CommRecord {
    fn parse(rest: &str) -> Option<CommRecord> {
        let Some(caps) = COMM_RE.captures(rest) else {
            error!("PERF_RECORD_COMM failed to match: {rest}");
            return None;
        };
        Some(CommRecord {
            name: caps[1].to_string(),
            pid: caps[2].parse().ok()?,
            tid: caps[3].parse().ok()?,
        })
    }
}

impl ForkRecord {
    fn parse(rest: &str, opid: i64, otid: i64, cpu: i64, ts: u64) -> Option<ForkRecord> {
        let Some(caps) = FORK_EXIT_RE.captures(rest) else {
            error!("PERF_RECORD_FORK failed to match: {rest}");
            return None;
        };
        Some(ForkRecord {
            pid: caps[1].parse().ok()?,
            tid: caps[2].parse().ok()?,
            ppid: caps[3].parse().ok()?,
            ptid: caps[4].parse().ok()?,
            opid,
            otid,
            cpu,
            ts,
        })
    }
}

impl ExitRecord {
    fn parse(rest: &str, opid: i64, otid: i64, cpu: i64, ts: u64) -> Option<ExitRecord> {
        // Almost identical to a FORK record; only the first pair matters.
        let Some(caps) = FORK_EXIT_RE.captures(rest) else {
            error!("PERF_RECORD_EXIT failed to match: {rest}");
            return None;
        };
        Some(ExitRecord {
            pid: caps[1].parse().ok()?,
            tid: caps[2].parse().ok()?,
            opid,
            otid,
            cpu,
            ts,
        })
    }
}
