//! Parses the process-table metadata file (`perf-mdata.txt`) bundled with a
//! recording.
//!
//! The file carries `# key: value` header pairs describing the capture,
//! `## ` comments, and two snapshots of `/proc/<pid>/stat` lines (one taken
//! before the recording, one after). The stat format is documented in
//! proc(5); the only subtlety is that the program name may itself contain
//! spaces and parentheses, so it is matched greedily between the first `(`
//! and the last `)`.
//!
//! The per-pid data feeds exactly one decision downstream: whether a pid is
//! a kernel thread, via the PF_KTHREAD flag bit.

use std::collections::HashMap;
use std::io::BufRead;
use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;

// From linux/sched.h; set in /proc/<pid>/stat flags for kernel threads.
const PF_KTHREAD: u64 = 0x0020_0000;

// Roughly parse out a line of /proc/<pid>/stat.
static STAT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+) \((.*)\) (\w) ([\d -]+)$").expect("invalid proc stat regex")
});

/// The fields of `/proc/<pid>/stat` this tool actually consumes. The line
/// carries some fifty; everything after `flags` is parsed and discarded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProcStat {
    pub pid: i64,
    /// Program name, truncated by the kernel to 16 bytes.
    pub comm: String,
    /// Run state, e.g. R for running, S for sleeping.
    pub state: String,
    pub ppid: i64,
    pub flags: u64,
}

/// Snapshot of the traced system's process table.
#[derive(Debug, Default)]
pub struct ProcTable {
    procs: HashMap<i64, ProcStat>,
}

impl ProcTable {
    /// Whether `pid` is a kernel thread. Pids with no snapshot data are not.
    pub fn is_kernel(&self, pid: i64) -> bool {
        self.procs
            .get(&pid)
            .is_some_and(|p| p.flags & PF_KTHREAD != 0)
    }

    pub fn get(&self, pid: i64) -> Option<&ProcStat> {
        self.procs.get(&pid)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }
}

/// Parse the metadata file into its `# key: value` pairs and the process
/// table. There are two sets of stat lines (one per snapshot); keeping
/// whichever comes later prefers fresher data. A process that started and
/// exited entirely within the recording appears in neither snapshot, which
/// just means some diagnostic value is lost.
pub fn parse_mdata<R: BufRead>(input: R) -> Result<(HashMap<String, String>, ProcTable)> {
    let mut mdata = HashMap::new();
    let mut table = ProcTable::default();
    for line in input.lines() {
        let line = line.context("reading metadata file")?;
        if line.trim().is_empty() || line.starts_with("## ") {
            continue;
        }
        if let Some(pair) = line.strip_prefix("# ") {
            if let Some((key, value)) = pair.split_once(':') {
                mdata.insert(key.to_string(), value.trim().to_string());
            }
            continue;
        }
        let stat = parse_stat_line(&line)?;
        table.procs.insert(stat.pid, stat);
    }
    Ok((mdata, table))
}

fn parse_stat_line(line: &str) -> Result<ProcStat> {
    let Some(caps) = STAT_RE.captures(line) else {
        bail!("malformed process stat line: {line}");
    };
    let pid: i64 = caps[1].parse()?;
    let comm = caps[2].to_string();
    let state = caps[3].to_string();
    let rest: Vec<i64> = caps[4]
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .with_context(|| format!("non-numeric stat field for pid {pid}"))?;
    // After comm and state the fields are: ppid pgrp session tty_nr tpgid
    // flags ...
    if rest.len() < 6 {
        bail!("truncated process stat line for pid {pid}");
    }
    Ok(ProcStat {
        pid,
        comm,
        state,
        ppid: rest[0],
        flags: rest[5] as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // Program name parsing is the only non-trivial part of the stat format.
    #[test]
    fn test_comm_parsing() {
        for (line, expected_comm) in [
            ("42 (foo) S 1 -2 3 4 5 6", "foo"),
            ("42 (foo with spaces) S 1 -2 3 4 5 6", "foo with spaces"),
            ("42 ((foo)) S 1 -2 3 4 5 6", "(foo)"),
            ("42 (foo with )random)() S 1 -2 3 4 5 6", "foo with )random)("),
        ] {
            let stat = parse_stat_line(line).unwrap();
            assert_eq!(stat.comm, expected_comm, "line: {line}");
        }
    }

    #[test]
    fn test_kernel_thread_classification() {
        let input = "\
## before
1 (init) S 0 1 1 0 -1 4202752 7 8 9
2 (kthreadd) S 0 0 0 0 -1 2129984 7 8 9
";
        let (_, table) = parse_mdata(Cursor::new(input)).unwrap();
        assert!(!table.is_kernel(1));
        assert!(table.is_kernel(2));
        // No data for this pid at all.
        assert!(!table.is_kernel(999));
    }

    #[test]
    fn test_metadata_pairs_and_snapshots() {
        let input = "\
## System performance data
# date: Tue Jul 18 16:10:18 UTC 2023
# perf-sched-cmd: perf sched record --mmap-pages 8M sleep 10 --aio
## before
10 (svc) S 1 10 10 0 -1 4202752 7 8 9
## after
10 (svc) R 1 10 10 0 -1 4202752 7 8 9
";
        let (mdata, table) = parse_mdata(Cursor::new(input)).unwrap();
        assert_eq!(mdata["date"], "Tue Jul 18 16:10:18 UTC 2023");
        assert_eq!(
            mdata["perf-sched-cmd"],
            "perf sched record --mmap-pages 8M sleep 10 --aio"
        );
        // The later snapshot wins.
        assert_eq!(table.get(10).unwrap().state, "R");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_malformed_stat_line_is_fatal() {
        assert!(parse_mdata(Cursor::new("gibberish here\n")).is_err());
        assert!(parse_mdata(Cursor::new("42 (truncated) S 1 2\n")).is_err());
    }
}
