//! schedtrace library - turn `perf sched` recordings into Chrome Trace
//! Event documents.
//!
//! The interesting work happens in [`engine`], which reconstructs thread
//! identity and span structure from a single pass over the recorded event
//! stream; the other modules are its collaborators (parsers, the output
//! model, and the archive front-end).

pub mod engine;
pub mod events;
pub mod input;
pub mod perf_script;
pub mod pid_map;
pub mod proc_stat;
pub mod spans;
pub mod stats;
pub mod trace_event;

pub use engine::Engine;
pub use trace_event::Event;
