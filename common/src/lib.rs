//! Tipos y piezas compartidas entre supervisor, worker y cliente.

pub mod blocking;
pub mod catalog;
pub mod client;
pub mod engine;
pub mod error;
pub mod input;
pub mod job;
pub mod partition_ids;
pub mod report;
pub mod retry;
pub mod segment;
pub mod shuffle;
pub mod subtask;
pub mod task;

pub use error::{IngestError, Result};
pub use job::{IngestionSpec, JobId, JobInfo, JobStatus};
pub use segment::{DataSegment, Interval, SegmentId};
pub use task::{SpecId, TaskId, TaskKind, TaskState, TaskStatusCode};
