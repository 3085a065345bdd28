//! The engine that turns scheduling records into trace events.
//!
//! This is a single pass over the record stream, accumulating everything of
//! interest in memory, followed by a bounded finalization sequence. Two
//! things make it more than a straight translation:
//!
//! - The recording is made from inside a pid namespace, but the pid data in
//!   scheduling events is from the root namespace. Identity has to be
//!   reconstructed as the stream goes by, and events that arrive before
//!   their thread's identity is known are buffered and replayed later
//!   ([`crate::events::EventList`]).
//!
//! - Beyond the real per-thread tracks, the output carries synthetic tracks:
//!   per-CPU occupancy, a long-wait track for threads that sat runnable past
//!   a threshold, and a kernel aggregate for threads that never presented a
//!   user-visible identity. Those are materialized at finalization, since
//!   their pseudo pids can only be chosen once every real pid has been seen.
//!
//! Threads on scheduling classes that emit no runtime statistics are
//! inferred after the fact: the absence of stat samples is itself the
//! signal, and such threads get their identity from backup mappings drained
//! at end of stream, plus a marker on their display name.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::warn;

use crate::events::EventList;
use crate::perf_script::{Record, SchedRecord};
use crate::pid_map::PidMapper;
use crate::spans::SpanTracker;
use crate::stats::StatsAccumulator;
use crate::trace_event::{ArgValue, Args, Event};

/// Track id for the long-wait track: a number that, when negated, is bigger
/// than any possible CPU index.
pub const WAIT_TRACK_ID: i64 = -1_000_000;

/// Span names for the two states a thread track alternates between.
const RUNNING_TASK: &str = "Running";
const WAITING_TASK: &str = "Waiting";

/// Statefully determine whether a timestamp falls in the requested window.
/// The window is anchored at the first positive timestamp seen.
#[derive(Debug)]
struct TimeWindow {
    delay_ns: u64,
    end_ns: Option<u64>,
    start_ts: Option<u64>,
}

impl TimeWindow {
    fn new(skip_seconds: f64, duration_seconds: f64) -> Self {
        let delay_ns = (skip_seconds * 1e9) as u64;
        let end_ns = (duration_seconds > 0.0).then(|| (duration_seconds * 1e9) as u64 + delay_ns);
        TimeWindow {
            delay_ns,
            end_ns,
            start_ts: None,
        }
    }

    fn include(&mut self, ts: u64) -> bool {
        let Some(start) = self.start_ts else {
            if ts > 0 {
                self.start_ts = Some(ts);
            }
            return true;
        };
        let elapsed = ts.saturating_sub(start);
        elapsed >= self.delay_ns && self.end_ns.is_none_or(|end| elapsed <= end)
    }
}

pub struct Engine<K> {
    wait_threshold_ms: f64,
    is_kernel: K,
    ids: PidMapper,
    events: EventList,
    spans: SpanTracker,
    stats: StatsAccumulator,
    window: TimeWindow,
    /// Inner id -> timestamp of its (first) wakeup since it last ran.
    waiting_since: HashMap<i64, u64>,
    /// Inner ids currently marked runnable, per CPU; used to coalesce
    /// repeated wakeups into one waiting span.
    waiting: HashMap<i64, HashSet<i64>>,
}

impl<K: Fn(i64) -> bool> Engine<K> {
    /// `is_kernel` classifies outer pids as kernel threads; it is consulted
    /// both during the stream (to keep kernel threads out of the backup
    /// mappings) and at finalization (to group them under the kernel track).
    pub fn new(skip_seconds: f64, duration_seconds: f64, wait_threshold_ms: f64, is_kernel: K) -> Self {
        Engine {
            wait_threshold_ms,
            is_kernel,
            ids: PidMapper::new(),
            events: EventList::new(),
            spans: SpanTracker::new(),
            stats: StatsAccumulator::new(),
            window: TimeWindow::new(skip_seconds, duration_seconds),
            waiting_since: HashMap::new(),
            waiting: HashMap::new(),
        }
    }

    /// Run the whole pipeline over an already-parsed record stream.
    pub fn process<I: IntoIterator<Item = Record>>(mut self, records: I) -> Vec<Event> {
        for record in records {
            self.handle_record(record);
        }
        self.finish()
    }

    /// Dispatch a single record.
    pub fn handle_record(&mut self, record: Record) {
        match record {
            Record::Sched(rec) => {
                if !self.window.include(rec.ts) {
                    return;
                }
                match rec.rec_type.as_str() {
                    "sched_switch" => self.sched_switch(&rec),
                    "sched_wakeup" => self.sched_wakeup(&rec),
                    "sched_stat_runtime" => self.sched_stat_runtime(&rec),
                    _ => {}
                }
            }
            Record::Comm(rec) => {
                self.events.append(Event::thread_name(rec.pid, rec.tid, &rec.name));
                if rec.pid == rec.tid {
                    self.events.append(Event::process_name(rec.pid, &rec.name));
                }
            }
            Record::Fork(rec) => {
                let mut args = Args::new();
                args.insert("pid".to_string(), rec.pid.into());
                args.insert("tid".to_string(), rec.tid.into());
                args.insert("parent tid".to_string(), rec.ptid.into());
                args.insert("cpu".to_string(), rec.cpu.into());
                let name = if rec.pid == rec.ppid {
                    "thread_spawn"
                } else {
                    args.insert("parent pid".to_string(), rec.ppid.into());
                    "process fork"
                };
                self.events
                    .append(Event::instant(name, rec.opid, rec.otid, rec.ts, args));
            }
            Record::Exit(rec) => {
                let mut args = Args::new();
                args.insert("pid".to_string(), rec.pid.into());
                args.insert("tid".to_string(), rec.tid.into());
                args.insert("cpu".to_string(), rec.cpu.into());
                self.events
                    .append(Event::instant("thread_exit", rec.opid, rec.otid, rec.ts, args));
            }
        }
    }

    /// Handle a wakeup: open a waiting span unless the thread is already
    /// marked runnable on this CPU. Kernel threads (rcuop especially, and
    /// sometimes ktimersoftd) can be woken more than once before they get
    /// scheduled; those collapse into a single wakeup.
    fn sched_wakeup(&mut self, rec: &SchedRecord) {
        let (Some(inner), Some(prio)) = (int_arg(rec, "pid"), int_arg(rec, "prio")) else {
            warn!("dropping sched_wakeup with missing fields at ts {}", rec.ts);
            return;
        };
        let runnable = self.waiting.entry(rec.cpu).or_default();
        if runnable.insert(inner) {
            let mut args = Args::new();
            args.insert("prio".to_string(), prio.into());
            self.track_span(inner, Event::begin(WAITING_TASK, rec.ts, Some(args)));
            self.waiting_since.insert(inner, rec.ts);
        }
        if let Some(comm) = rec.args.get("comm") {
            self.ids.record_name(inner, comm);
        }
    }

    /// Handle the central transition: one thread leaves a CPU, another takes
    /// it. Both the per-thread tracks and the per-CPU virtual track get a
    /// close/open pair, and the departing thread's span is annotated with
    /// whatever runtime accounting can be reconstructed.
    fn sched_switch(&mut self, rec: &SchedRecord) {
        let (Some(prev_pid), Some(next_pid), Some(next_prio)) = (
            int_arg(rec, "prev_pid"),
            int_arg(rec, "next_pid"),
            int_arg(rec, "next_prio"),
        ) else {
            warn!("dropping sched_switch with missing fields at ts {}", rec.ts);
            return;
        };
        let prev_state = rec.args.get("prev_state").map(String::as_str).unwrap_or("");
        let (cpu, ts) = (rec.cpu, rec.ts);

        // Timing accounting for the thread that just stopped, attached to
        // its closing span (and mirrored on the CPU track below).
        let mut end_args = self.stats.reconcile(prev_pid, next_pid, cpu, ts);
        end_args.insert("end_state".to_string(), expand_state(prev_state).into());

        self.track_span(prev_pid, Event::end(RUNNING_TASK, ts, Some(end_args.clone())));

        // The incoming thread stops waiting and starts running.
        self.track_span(next_pid, Event::end(WAITING_TASK, ts, None));
        if let Some(runnable) = self.waiting.get_mut(&cpu) {
            runnable.remove(&next_pid);
        }
        let mut begin_args = Args::new();
        begin_args.insert("prio".to_string(), next_prio.into());
        self.track_span(next_pid, Event::begin(RUNNING_TASK, ts, Some(begin_args)));

        // Mirror both transitions on the per-CPU virtual track. The idle
        // thread never appears there.
        if prev_pid != 0 {
            self.track_span(-cpu, Event::end(prev_pid.to_string(), ts, Some(end_args)));
        }
        if next_pid != 0 {
            self.track_span(-cpu, Event::begin(next_pid.to_string(), ts, None));
        }

        // If the incoming thread sat runnable long enough, give it an entry
        // on the long-wait track covering the whole wait.
        if let Some(since) = self.waiting_since.remove(&next_pid) {
            let waited_ms = ts.saturating_sub(since) as f64 / 1e6;
            if waited_ms >= self.wait_threshold_ms {
                self.track_span(WAIT_TRACK_ID, Event::begin(next_pid.to_string(), since, None));
                self.track_span(WAIT_TRACK_ID, Event::end(next_pid.to_string(), ts, None));
            }
        }

        // The record's own pid/tid describe the departing thread, so keep a
        // tentative identity for it in case no direct evidence ever shows
        // up. Kernel threads have no user-visible identity worth keeping.
        if prev_pid != 0 && !(self.is_kernel)(prev_pid) {
            self.ids.backup(prev_pid, rec.opid, rec.otid);
        }
        if let Some(comm) = rec.args.get("prev_comm") {
            self.ids.record_name(prev_pid, comm);
        }
        if let Some(comm) = rec.args.get("next_comm") {
            self.ids.record_name(next_pid, comm);
        }
    }

    /// A runtime-stat record is the best evidence of a thread's real
    /// identity: it carries both the inner id and the outer pair.
    fn sched_stat_runtime(&mut self, rec: &SchedRecord) {
        let Some(inner) = int_arg(rec, "pid") else {
            warn!("dropping sched_stat_runtime with missing fields at ts {}", rec.ts);
            return;
        };
        self.events
            .resolve_mapping(inner, rec.opid, rec.otid, &mut self.ids);
        let runtime = uint_arg(rec, "runtime").unwrap_or(0);
        let vruntime = uint_arg(rec, "vruntime").unwrap_or(0);
        self.stats.sample(rec.cpu, rec.ts, inner, runtime, vruntime);
    }

    /// Feed a span event through the tracker and emit the completed pair.
    fn track_span(&mut self, track: i64, event: Event) {
        if let Some((begin, end)) = self.spans.add(track, event) {
            self.events.append_by_inner(track, begin, &mut self.ids);
            self.events.append_by_inner(track, end, &mut self.ids);
        }
    }

    /// Run the finalization sequence and return the output event list.
    pub fn finish(mut self) -> Vec<Event> {
        // First promote the backup identities. Any thread resolved this way
        // went the whole recording without a runtime-stat sample, which
        // marks it as round-robin scheduled.
        let mut rr_inferred = HashSet::new();
        for (inner, opid, otid) in self.ids.drain_backups() {
            self.events.resolve_mapping(inner, opid, otid, &mut self.ids);
            rr_inferred.insert(inner);
        }

        self.tidy_thread_names(&rr_inferred);
        self.add_kernel_and_cpu_events();
        self.add_sort_index();

        self.events.into_events()
    }

    /// Make thread names unambiguous by appending the inner id (and the
    /// scheduling-class marker where it was inferred).
    fn tidy_thread_names(&mut self, rr_inferred: &HashSet<i64>) {
        let ids = &self.ids;
        self.events.for_each_thread_name(|ev| {
            let (Some(pid), Some(tid)) = (ev.pid, ev.tid) else {
                return;
            };
            let Some(inner) = ids.lookup_inner(pid, tid) else {
                return;
            };
            if let Some(args) = ev.args.as_mut() {
                if let Some(ArgValue::Str(name)) = args.get_mut("name") {
                    if rr_inferred.contains(&inner) {
                        name.push_str(" [𝗥𝗥]");
                    }
                    name.push_str(&format!(" #{inner}"));
                }
            }
        });
    }

    /// Group threads without user-visible identity into a 𝘬𝘦𝘳𝘯𝘦𝘭
    /// pseudo-process, and the per-CPU and long-wait tracks into a 𝘊𝘗𝘜𝘴 one.
    ///
    /// The kernel grouping is deliberately vague: it is expected to be
    /// kernel threads, but scheduling events for threads outside the
    /// namespace (the container runtime itself, say) are indistinguishable
    /// and land there too.
    fn add_kernel_and_cpu_events(&mut self) {
        let cpu_pid = self.ids.allocate_pseudo_id();
        self.events.append(Event::process_name(cpu_pid, "𝘊𝘗𝘜𝘴"));
        self.events
            .append(Event::process_labels(cpu_pid, "(Virtual process representing CPU usage)"));
        let kernel_pid = self.ids.allocate_pseudo_id();
        self.events.append(Event::process_name(kernel_pid, "𝘬𝘦𝘳𝘯𝘦𝘭"));
        self.events.append(Event::process_labels(
            kernel_pid,
            "(Virtual process for kernel and unknown threads)",
        ));

        // Kernel threads that did resolve to an outer pid still belong on
        // the kernel track; relocate their process-level events. This could
        // not happen during the stream, because the kernel pseudo-pid is
        // only known once every real pid has been observed.
        let kernel_opids: HashSet<i64> = self
            .ids
            .observed_opids()
            .filter(|&pid| (self.is_kernel)(pid))
            .collect();
        self.events.for_each_event(|ev| {
            if ev.pid == ev.tid && ev.pid.is_some_and(|pid| kernel_opids.contains(&pid)) {
                ev.pid = Some(kernel_pid);
            }
        });

        // Everything still pending never got an identity: virtual-track
        // spans (negative keys) and threads with no name/mapping records.
        for (track, parked) in self.events.take_pending() {
            if track < 0 {
                let cpu = -track;
                let name = if track == WAIT_TRACK_ID {
                    format!("𝘞𝘢𝘪𝘵𝘪𝘯𝘨 ≥ {:.1} 𝘮𝘴", self.wait_threshold_ms.trunc())
                } else {
                    format!("𝘊𝘗𝘜 {cpu}")
                };
                self.events.append(Event::thread_name(cpu_pid, cpu, &name));
                for mut ev in parked {
                    ev.pid = Some(cpu_pid);
                    ev.tid = Some(cpu);
                    // Virtual-track spans were named by raw inner id; give
                    // them a human-readable name now that comms are known.
                    let inner: i64 = ev.name.parse().unwrap_or_default();
                    let comm = self.ids.name(inner).unwrap_or("<unknown>");
                    ev.name = format!("{comm} #{inner}");
                    self.events.append_converted(ev);
                }
            } else {
                let name = if track == 0 {
                    // Keep the idle thread at the top of the kernel track.
                    self.events.append(Event::thread_sort_index(kernel_pid, 0, -1));
                    "𝘪𝘥𝘭𝘦".to_string()
                } else {
                    format!("{} #{track}", self.ids.name(track).unwrap_or("<unknown>"))
                };
                self.events.append(Event::thread_name(kernel_pid, track, &name));
                for mut ev in parked {
                    ev.pid = Some(kernel_pid);
                    ev.tid = Some(track);
                    if track == 0 {
                        ev.name = "𝘪𝘥𝘭𝘦".to_string();
                    }
                    self.events.append_converted(ev);
                }
            }
        }
    }

    /// Emit sort indices that bring the busiest processes to the top, with
    /// the pseudo-processes pinned above everything.
    fn add_sort_index(&mut self) {
        let mut opid_runtime: BTreeMap<i64, u64> = BTreeMap::new();
        for (inner, runtime) in self.stats.runtime_totals() {
            let pid = match self.ids.lookup_outer(inner) {
                Some((opid, _)) => opid,
                None => inner,
            };
            *opid_runtime.entry(pid).or_default() += runtime;
        }

        let mut max_runtime: u64 = 0;
        for (&opid, &runtime) in &opid_runtime {
            self.events
                .append(Event::process_sort_index(opid, -(runtime as i64)));
            max_runtime = max_runtime.max(runtime);
        }

        let pin = -(max_runtime as i64 + 1);
        for pid in self.ids.pseudo_opids() {
            self.events.append(Event::process_sort_index(pid, pin));
        }
    }
}

fn int_arg(rec: &SchedRecord, key: &str) -> Option<i64> {
    rec.args.get(key)?.parse().ok()
}

fn uint_arg(rec: &SchedRecord, key: &str) -> Option<u64> {
    rec.args.get(key)?.parse().ok()
}

/// Translate a kernel short state code into a self-describing comment.
/// (Codes per <https://perfetto.dev/docs/data-sources/cpu-scheduling>.)
fn expand_state(state: &str) -> String {
    let expanded = match state {
        "R" => "Runnable",
        "R+" => "Runnable (Preempted)",
        "S" => "Sleeping",
        "D" => "Uninterruptible Sleep",
        "T" => "Stopped",
        "t" => "Traced",
        "X" => "Exit (Dead)",
        "Z" => "Exit (Zombie)",
        "x" => "Task Dead",
        "I" => "Idle",
        "K" => "Wake Kill",
        "W" => "Waking",
        "P" => "Parked",
        "N" => "No Load",
        _ => "Unknown",
    };
    format!("{state} [{expanded}]")
}
