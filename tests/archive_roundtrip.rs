//! Front-end tests: recording archives in, JSON-ready event lists out.

use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

use schedtrace::input::{convert, ConvertOptions};
use schedtrace::trace_event::Phase;

const MDATA: &str = "\
## System performance data
# date: Tue Jul 18 16:10:18 UTC 2023
# perf-sched-cmd: perf sched record --mmap-pages 8M sleep 10 --aio
## before
1000 (worker) S 1 1000 1000 0 -1 4202752 7 8 9
77 (kworker/0:1) S 2 0 0 0 -1 2129984 7 8 9
";

const PERF_DATA: &str = "\
    0/0     [000]     0.000000000: PERF_RECORD_COMM: worker:1000/1005
 1000/1005  [002]     1.000000000:               sched:sched_stat_runtime: comm=worker pid=5 runtime=1000 [ns] vruntime=2000 [ns]
 1000/1005  [002]     1.100000000:                     sched:sched_wakeup: comm=worker pid=5 prio=120 target_cpu=002
 1000/1005  [002]     1.200000000:                     sched:sched_switch: prev_comm=swapper/2 prev_pid=0 prev_prio=120 prev_state=R ==> next_comm=worker next_pid=5 next_prio=120
 1000/1005  [002]     1.230000000:               sched:sched_stat_runtime: comm=worker pid=5 runtime=30000000 [ns] vruntime=5000000 [ns]
 1000/1005  [002]     1.250000000:                     sched:sched_switch: prev_comm=worker prev_pid=5 prev_prio=120 prev_state=S ==> next_comm=swapper/2 next_pid=0 next_prio=120
something perf never wrote
";

fn tar_bytes(members: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents.as_bytes())
            .expect("appending tar member");
    }
    builder.into_inner().expect("finishing tar")
}

fn write_archive(dir: &Path, name: &str, bytes: &[u8], gzip: bool) -> std::path::PathBuf {
    let path = dir.join(name);
    if gzip {
        let file = std::fs::File::create(&path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(bytes).unwrap();
        enc.finish().unwrap();
    } else {
        std::fs::write(&path, bytes).unwrap();
    }
    path
}

fn assert_converts(path: &Path) {
    let events = convert(path, &ConvertOptions::default()).expect("conversion failed");

    // The worker thread ran 50ms on CPU 2; one Running span with µs
    // timestamps, carrying the exact runtime sample.
    let running: Vec<_> = events
        .iter()
        .filter(|ev| ev.name == "Running" && matches!(ev.ph, Phase::Begin | Phase::End))
        .collect();
    assert_eq!(running.len(), 2, "events: {events:#?}");
    assert_eq!(running[0].ts, Some(1_200_000.0));
    assert_eq!(running[0].pid, Some(1000));
    assert_eq!(running[0].tid, Some(1005));
    assert_eq!(running[1].ts, Some(1_250_000.0));
    let args = running[1].args.as_ref().unwrap();
    assert!(args.contains_key("CFS runtime (ns)"));

    // The 100ms wait crosses the default 3ms threshold.
    assert!(events
        .iter()
        .any(|ev| ev.ph == Phase::Begin && ev.tid == Some(1_000_000)));

    // And the document round-trips through serde_json with no nulls.
    let json = serde_json::to_string(&events).unwrap();
    assert!(!json.contains("null"));
}

#[test]
fn test_plain_tar_archive() {
    let dir = TempDir::new().unwrap();
    let bytes = tar_bytes(&[("perf-mdata.txt", MDATA), ("perf.data.txt", PERF_DATA)]);
    let path = write_archive(dir.path(), "recording.tar", &bytes, false);
    assert_converts(&path);
}

#[test]
fn test_gzipped_tar_archive() {
    let dir = TempDir::new().unwrap();
    let bytes = tar_bytes(&[("perf-mdata.txt", MDATA), ("perf.data.txt", PERF_DATA)]);
    let path = write_archive(dir.path(), "recording.tar.gz", &bytes, true);
    assert_converts(&path);
}

#[test]
fn test_mdata_must_precede_perf_data() {
    let dir = TempDir::new().unwrap();
    let bytes = tar_bytes(&[("perf.data.txt", PERF_DATA), ("perf-mdata.txt", MDATA)]);
    let path = write_archive(dir.path(), "bad-order.tar", &bytes, false);
    let err = convert(&path, &ConvertOptions::default()).unwrap_err();
    assert!(err.to_string().contains("perf-mdata.txt"), "{err}");
}

#[test]
fn test_missing_perf_data_is_fatal() {
    let dir = TempDir::new().unwrap();
    let bytes = tar_bytes(&[("perf-mdata.txt", MDATA)]);
    let path = write_archive(dir.path(), "incomplete.tar", &bytes, false);
    let err = convert(&path, &ConvertOptions::default()).unwrap_err();
    assert!(err.to_string().contains("perf.data.txt"), "{err}");
}
