//! Compactación: re-ingesta los segmentos en uso de un intervalo.
//!
//! La tarea corre un supervisor interno en el mismo runner. Las sub-tareas
//! direccionan el id de la compactación y el runner resuelve
//! compactación -> tarea interna -> supervisor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};

use common::job::{
    CompactionRequest, GranularitySpec, IngestionSpec, InputSource, LockGranularity,
};
use common::report::IngestionReport;
use common::{DataSegment, IngestError, Interval, Result, SegmentId, TaskId, TaskKind, TaskState};

use crate::allocator::AllocationPlan;
use crate::job::{new_version, IngestEnv};
use crate::runner::{Task, TaskRunner};
use crate::supervisor::SupervisorTask;

pub struct CompactionTask {
    id: TaskId,
    request: CompactionRequest,
    runner: TaskRunner,
    env: IngestEnv,
    inner: Mutex<Option<Arc<SupervisorTask>>>,
}

impl CompactionTask {
    pub fn new(id: &str, request: CompactionRequest, runner: TaskRunner, env: IngestEnv) -> Self {
        Self {
            id: id.to_string(),
            request,
            runner,
            env,
            inner: Mutex::new(None),
        }
    }

    fn inner_id(&self) -> TaskId {
        format!("{}_supervisor", self.id)
    }

    pub fn report(&self) -> IngestionReport {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.as_ref().map(|task| task.report()))
            .unwrap_or_else(|| IngestionReport::new(&self.id))
    }

    fn ingestion_spec(&self, segments: &[DataSegment]) -> IngestionSpec {
        let schema = self.request.schema.clone();
        let mut tuning = self.request.tuning.clone().unwrap_or_default();
        tuning.lock_granularity = self.request.lock_granularity;

        IngestionSpec {
            datasource: self.request.datasource.clone(),
            schema,
            granularity: GranularitySpec {
                segment_granularity: self.request.segment_granularity,
                intervals: Some(vec![self.request.interval]),
            },
            input: InputSource::Segments {
                files: segments.iter().map(|s| PathBuf::from(&s.path)).collect(),
            },
            tuning,
        }
    }

    fn allocation_plan(&self, segments: &[DataSegment]) -> AllocationPlan {
        let newest = segments.iter().map(|s| s.id.version.as_str()).max();
        match self.request.lock_granularity {
            LockGranularity::TimeChunk => AllocationPlan::time_chunk(version_after(newest)),
            LockGranularity::Segment => {
                let mut plan = AllocationPlan::segment_lock(version_after(newest));
                let mut versions: HashMap<Interval, String> = HashMap::new();
                let mut used: HashMap<Interval, u32> = HashMap::new();
                for segment in segments {
                    let id = &segment.id;
                    let version = versions.entry(id.interval).or_default();
                    if id.version > *version {
                        *version = id.version.clone();
                    }
                    let last = used.entry(id.interval).or_default();
                    *last = (*last).max(id.partition_num);
                }
                plan.version_overrides = versions;
                plan.used_partitions = used;
                plan
            }
        }
    }
}

/// Versión nueva, siempre mayor que `existing`.
fn version_after(existing: Option<&str>) -> String {
    let now = new_version();
    match existing {
        Some(v) if v >= now.as_str() => format!("{v}.1"),
        _ => now,
    }
}

#[async_trait]
impl Task for CompactionTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn group_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Compaction
    }

    async fn is_ready(&self) -> Result<bool> {
        if self.request.datasource.trim().is_empty() {
            return Err(IngestError::InvalidSpec("datasource vacío".to_string()));
        }
        Ok(true)
    }

    async fn run(&self) -> Result<()> {
        let request = &self.request;
        let segments = self
            .env
            .catalog
            .fetch_used_segments(&request.datasource, &[request.interval])?;
        info!(
            task_id = %self.id,
            datasource = %request.datasource,
            intervalo = %request.interval,
            segmentos = segments.len(),
            lock = ?request.lock_granularity,
            "Compactando"
        );

        let inner_id = self.inner_id();
        let inner = Arc::new(SupervisorTask::new(
            &inner_id,
            &self.id,
            self.ingestion_spec(&segments),
            self.allocation_plan(&segments),
            self.runner.clone(),
            self.env.clone(),
        ));
        if let Ok(mut slot) = self.inner.lock() {
            *slot = Some(inner.clone());
        }
        self.runner.submit(inner)?;

        // si la compactación muere, el supervisor interno muere con ella
        let runner = self.runner.clone();
        let to_cancel = inner_id.clone();
        self.runner.on_complete(&self.id, move |_| {
            if let Err(e) = runner.cancel(&to_cancel) {
                warn!(task_id = %to_cancel, "No se pudo cancelar la tarea interna: {e}");
            }
        })?;

        match self.runner.wait(&inner_id, self.env.job_timeout).await? {
            TaskState::Succeeded => {
                let replaced: Vec<SegmentId> = segments.into_iter().map(|s| s.id).collect();
                self.env.catalog.mark_unused(&replaced)?;
                info!(task_id = %self.id, reemplazados = replaced.len(), "Compactación terminada");
                Ok(())
            }
            TaskState::Cancelled => Err(IngestError::Cancelled { attempts: 1 }),
            TaskState::Failed { message } => Err(IngestError::InnerTaskFailed {
                task_id: inner_id,
                message,
            }),
            other => Err(IngestError::InnerTaskFailed {
                task_id: inner_id,
                message: format!("estado inesperado {other:?}"),
            }),
        }
    }

    fn current_inner_task(&self) -> Option<TaskId> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.as_ref().map(|task| task.id().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_siempre_crece() {
        let future = "2999-01-01T00:00:00.000Z";
        assert_eq!(version_after(Some(future)), "2999-01-01T00:00:00.000Z.1");
        assert!(version_after(Some("2000-01-01T00:00:00.000Z")).as_str() > "2000-01-01T00:00:00.000Z");
        assert!(!version_after(None).is_empty());
    }
}
