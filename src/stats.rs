//! Scheduler runtime statistics.
//!
//! Tracks the last runtime-stat sample seen per CPU and the cumulative
//! runtime per inner id. At switch time, [`StatsAccumulator::reconcile`]
//! decides whether the sample actually covers the run interval that just
//! ended; when it does not (non-CFS scheduling classes emit no periodic
//! stats) the runtime degrades to a wall-clock estimate.

use std::collections::{BTreeMap, HashMap};

use crate::trace_event::Args;

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    ts: u64,
    inner: i64,
    runtime: u64,
    vruntime: u64,
}

#[derive(Debug, Default)]
pub struct StatsAccumulator {
    /// Most recent runtime-stat sample per CPU; overwritten unconditionally.
    cpu_samples: HashMap<i64, CpuSample>,
    /// Cumulative runtime per inner id, for final ordering. Sorted so the
    /// sort-index pass is deterministic.
    runtime: BTreeMap<i64, u64>,
    /// Timestamp at which each inner id last started running.
    run_start: HashMap<i64, u64>,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a runtime-stat sample for `cpu`. Most recent wins.
    pub fn sample(&mut self, cpu: i64, ts: u64, inner: i64, runtime: u64, vruntime: u64) {
        self.cpu_samples.insert(
            cpu,
            CpuSample {
                ts,
                inner,
                runtime,
                vruntime,
            },
        );
    }

    /// A thread's run on `cpu` just ended at `ts` and another starts. Update
    /// the cumulative runtimes and return whatever timing arguments can be
    /// pieced together for the span that ended: the precise sampled values
    /// when the last sample on this CPU covers the interval, otherwise a
    /// wall-clock estimate. Always records `ts` as the start-of-run for
    /// `starting`.
    pub fn reconcile(&mut self, stopped: i64, starting: i64, cpu: i64, ts: u64) -> Args {
        let mut args = Args::new();
        if let Some(&started) = self.run_start.get(&stopped) {
            let (sample_ts, sample_inner, runtime, vruntime) = self
                .cpu_samples
                .get(&cpu)
                .map(|s| (s.ts, s.inner, s.runtime, s.vruntime))
                .unwrap_or((0, 0, 0, 0));
            if sample_inner == stopped && sample_ts >= started {
                args.insert("CFS runtime (ns)".to_string(), runtime.into());
                args.insert("CFS vruntime (ns)".to_string(), vruntime.into());
                *self.runtime.entry(stopped).or_default() += runtime;
            } else {
                // No sample for this run interval; proxy a best guess.
                let approx = ts.saturating_sub(started);
                *self.runtime.entry(stopped).or_default() += approx;
                args.insert("Non-CFS runtime (ns)".to_string(), approx.into());
            }
        }
        self.run_start.insert(starting, ts);
        args
    }

    /// Cumulative runtime per inner id, in inner-id order.
    pub fn runtime_totals(&self) -> impl Iterator<Item = (i64, u64)> + '_ {
        self.runtime.iter().map(|(&inner, &total)| (inner, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace_event::ArgValue;

    #[test]
    fn test_covering_sample_is_exact() {
        let mut stats = StatsAccumulator::new();
        // Thread 5 starts running at ts=100.
        stats.reconcile(0, 5, 2, 100);
        stats.sample(2, 150, 5, 40, 9000);
        let args = stats.reconcile(5, 7, 2, 200);
        assert_eq!(args.get("CFS runtime (ns)"), Some(&ArgValue::Int(40)));
        assert_eq!(args.get("CFS vruntime (ns)"), Some(&ArgValue::Int(9000)));
        assert_eq!(stats.runtime_totals().collect::<Vec<_>>(), vec![(5, 40)]);
    }

    #[test]
    fn test_stale_sample_degrades_to_estimate() {
        let mut stats = StatsAccumulator::new();
        // Sample predates the run interval.
        stats.sample(2, 50, 5, 40, 9000);
        stats.reconcile(0, 5, 2, 100);
        let args = stats.reconcile(5, 7, 2, 230);
        assert_eq!(args.get("Non-CFS runtime (ns)"), Some(&ArgValue::Int(130)));
        assert!(!args.contains_key("CFS runtime (ns)"));
        assert_eq!(stats.runtime_totals().collect::<Vec<_>>(), vec![(5, 130)]);
    }

    #[test]
    fn test_sample_for_other_thread_degrades() {
        let mut stats = StatsAccumulator::new();
        stats.reconcile(0, 5, 2, 100);
        stats.sample(2, 150, 9, 40, 9000);
        let args = stats.reconcile(5, 7, 2, 200);
        assert_eq!(args.get("Non-CFS runtime (ns)"), Some(&ArgValue::Int(100)));
    }

    #[test]
    fn test_unknown_run_start_yields_no_args() {
        let mut stats = StatsAccumulator::new();
        let args = stats.reconcile(5, 7, 2, 200);
        assert!(args.is_empty());
        // But the incoming thread's start was still recorded.
        let args = stats.reconcile(7, 5, 2, 260);
        assert_eq!(args.get("Non-CFS runtime (ns)"), Some(&ArgValue::Int(60)));
    }
}
