//! Archive front-end: opens a recording bundle and streams it through the
//! engine.
//!
//! A recording is a tar archive (optionally gzip-compressed) with exactly
//! two members, in this order:
//!   - `perf-mdata.txt`, the capture metadata and process-table snapshots
//!   - `perf.data.txt`, the text output of `perf script`
//!
//! The metadata must be fully read before the perf data starts streaming;
//! without it no thread can be classified, so an ill-ordered archive is
//! treated as corruption.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use tracing::debug;

use crate::engine::Engine;
use crate::perf_script;
use crate::proc_stat::{parse_mdata, ProcTable};
use crate::trace_event::Event;

const MDATA_MEMBER: &str = "perf-mdata.txt";
const DATA_MEMBER: &str = "perf.data.txt";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Conversion parameters, straight from the command line.
#[derive(Clone, Copy, Debug)]
pub struct ConvertOptions {
    /// Seconds of data to skip from the start of the recording.
    pub skip: f64,
    /// Seconds of data to process; 0 means unbounded.
    pub duration: f64,
    /// Minimum wait (ms) for a thread to appear on the long-wait track.
    pub wait: f64,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        ConvertOptions {
            skip: 0.0,
            duration: 0.0,
            wait: 3.0,
        }
    }
}

/// Convert a recording bundle into the output event list.
pub fn convert(path: &Path, opts: &ConvertOptions) -> Result<Vec<Event>> {
    let mut archive = open_archive(path)?;
    let mut proc_table: Option<ProcTable> = None;
    let mut result: Option<Vec<Event>> = None;

    for entry in archive.entries().context("reading archive")? {
        let entry = entry.context("reading archive entry")?;
        let name = entry
            .path()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        match name.as_deref() {
            Some(MDATA_MEMBER) => {
                let (mdata, table) = parse_mdata(BufReader::new(entry))
                    .with_context(|| format!("parsing {MDATA_MEMBER}"))?;
                if let Some(system) = mdata.get("system") {
                    debug!("recording system: {system}");
                }
                debug!("process table entries: {}", table.len());
                proc_table = Some(table);
            }
            Some(DATA_MEMBER) => {
                let Some(table) = proc_table.as_ref() else {
                    bail!("{MDATA_MEMBER} not early enough - possible corruption?");
                };
                let mut engine = Engine::new(opts.skip, opts.duration, opts.wait, |pid| {
                    table.is_kernel(pid)
                });
                for line in BufReader::new(entry).lines() {
                    let line = line.with_context(|| format!("reading {DATA_MEMBER}"))?;
                    if let Some(record) = perf_script::parse(&line) {
                        engine.handle_record(record);
                    }
                }
                result = Some(engine.finish());
            }
            _ => {}
        }
    }

    result.ok_or_else(|| anyhow::anyhow!("{DATA_MEMBER} missing from archive - possible corruption?"))
}

/// Open the bundle as a tar stream, decompressing transparently when the
/// file starts with the gzip magic.
fn open_archive(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let mut file =
        File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic).context("reading file header")?;
    file.seek(SeekFrom::Start(0))?;
    let reader: Box<dyn Read> = if n == 2 && magic == GZIP_MAGIC {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(tar::Archive::new(reader))
}
