//! Supervisor de ingesta paralela por lotes: runner de tareas, fases del
//! supervisor, compactación y la API HTTP.

pub mod allocator;
pub mod compaction;
pub mod config;
pub mod handlers;
pub mod job;
pub mod killer;
pub mod local_client;
pub mod runner;
pub mod state;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use job::{IngestEnv, IngestionJob, JobOutcome};
pub use state::AppState;
