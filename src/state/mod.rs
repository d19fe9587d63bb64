//! Persisted execution state for resuming epics.
//!
//! A run keeps an [`ExecutionRecord`] next to its manifest and rewrites it
//! whenever a task changes state. A later `--resume` run reads it back and
//! treats the recorded `Completed` tasks as already done.

mod record;

pub use record::{ExecutionRecord, TaskEntry, STATUS_FILENAME};
