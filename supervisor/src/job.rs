//! Un job de ingesta o compactación con su propio runner.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use common::catalog::{InMemorySegmentCatalog, SegmentCatalog};
use common::job::{CompactionRequest, IngestionSpec, JobId};
use common::report::{IngestionReport, IngestionState};
use common::shuffle::IntermediaryDataStore;
use common::{IngestError, Result, TaskState, TaskStatusCode};

use crate::allocator::AllocationPlan;
use crate::compaction::CompactionTask;
use crate::config::SupervisorConfig;
use crate::killer::{KillerConfig, TaskKiller};
use crate::local_client::LocalClientConfig;
use crate::runner::{Task, TaskRunner};
use crate::supervisor::SupervisorTask;

/// Timeout de un job cuando el entorno no dice otra cosa.
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Dependencias compartidas por todas las tareas de un job.
#[derive(Clone)]
pub struct IngestEnv {
    pub catalog: Arc<dyn SegmentCatalog>,
    pub store: Arc<IntermediaryDataStore>,
    pub work_dir: PathBuf,
    pub segment_dir: PathBuf,
    pub client: LocalClientConfig,
    /// `None` = sin inyección de fallas de tareas.
    pub killer: Option<KillerConfig>,
    pub job_timeout: Duration,
}

impl IngestEnv {
    pub fn from_config(config: &SupervisorConfig, catalog: Arc<dyn SegmentCatalog>) -> Self {
        let killer = (config.task_kill_rate > 0.0).then(|| KillerConfig {
            rate: config.task_kill_rate,
            interval: config.kill_interval,
        });
        Self {
            catalog,
            store: Arc::new(IntermediaryDataStore::new(config.shuffle_dir.clone())),
            work_dir: config.work_dir.clone(),
            segment_dir: config.segment_dir.clone(),
            client: LocalClientConfig {
                api_failure_rate: config.api_failure_rate,
                retry: config.client_retry.clone(),
            },
            killer,
            job_timeout: config.job_timeout,
        }
    }

    /// Todo bajo `root` y catálogo en memoria.
    pub fn local(root: &Path) -> Self {
        Self {
            catalog: Arc::new(InMemorySegmentCatalog::new()),
            store: Arc::new(IntermediaryDataStore::new(root.join("shuffle"))),
            work_dir: root.join("work"),
            segment_dir: root.join("segments"),
            client: LocalClientConfig::default(),
            killer: None,
            job_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }
}

/// Versión de los segmentos que crea un job: el instante de arranque.
pub fn new_version() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub status: TaskStatusCode,
    pub report: IngestionReport,
}

enum RootTask {
    Ingest(Arc<SupervisorTask>),
    Compact(Arc<CompactionTask>),
}

impl RootTask {
    fn task(&self) -> Arc<dyn Task> {
        match self {
            RootTask::Ingest(t) => t.clone(),
            RootTask::Compact(t) => t.clone(),
        }
    }

    fn report(&self) -> IngestionReport {
        match self {
            RootTask::Ingest(t) => t.report(),
            RootTask::Compact(t) => t.report(),
        }
    }
}

pub struct IngestionJob {
    id: JobId,
    runner: TaskRunner,
    root: RootTask,
    env: IngestEnv,
}

impl IngestionJob {
    pub fn ingest(id: &str, spec: IngestionSpec, env: IngestEnv) -> Self {
        let runner = TaskRunner::new(id, spec.tuning.max_num_concurrent_sub_tasks + 2);
        let plan = AllocationPlan::time_chunk(new_version());
        let task = SupervisorTask::new(id, id, spec, plan, runner.clone(), env.clone());
        Self {
            id: id.to_string(),
            runner,
            root: RootTask::Ingest(Arc::new(task)),
            env,
        }
    }

    pub fn compact(id: &str, request: CompactionRequest, env: IngestEnv) -> Self {
        let slots = request
            .tuning
            .as_ref()
            .map_or(1, |t| t.max_num_concurrent_sub_tasks);
        let runner = TaskRunner::new(id, slots + 2);
        let task = CompactionTask::new(id, request, runner.clone(), env.clone());
        Self {
            id: id.to_string(),
            runner,
            root: RootTask::Compact(Arc::new(task)),
            env,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// Registra la tarea raíz, la limpieza del shuffle y el killer si está configurado.
    pub fn start(&self) -> Result<()> {
        self.runner.submit(self.root.task())?;

        let store = self.env.store.clone();
        let job_id = self.id.clone();
        self.runner.on_complete(&self.id, move |_| {
            if let Err(e) = store.delete_partitions(&job_id) {
                warn!(job_id = %job_id, "No se pudo borrar el shuffle del job: {e}");
            }
        })?;

        if let Some(config) = self.env.killer {
            TaskKiller::new(self.runner.clone(), config).spawn();
        }
        info!(job_id = %self.id, "Job arrancado");
        Ok(())
    }

    /// Espera el final del job (con el timeout del entorno) y apaga el runner.
    pub async fn wait(&self) -> JobOutcome {
        let state = match self.runner.wait(&self.id, self.env.job_timeout).await {
            Ok(state) => state,
            Err(IngestError::Timeout(_)) => {
                error!(job_id = %self.id, "Timeout del job, cancelando");
                let _ = self.runner.cancel(&self.id);
                TaskState::Failed {
                    message: format!(
                        "el job no terminó en {}s",
                        self.env.job_timeout.as_secs()
                    ),
                }
            }
            Err(e) => TaskState::Failed {
                message: e.to_string(),
            },
        };
        self.runner.shutdown();

        let status = state.status_code().unwrap_or(TaskStatusCode::Failed(format!(
            "estado no terminal {state:?}"
        )));
        let mut report = self.root.report();
        match &status {
            TaskStatusCode::Success => {}
            TaskStatusCode::Failed(message) => {
                report.state = IngestionState::Failed;
                report.error_msg.get_or_insert_with(|| message.clone());
            }
            TaskStatusCode::Cancelled => {
                report.state = IngestionState::Failed;
                report.error_msg.get_or_insert_with(|| "job cancelado".to_string());
            }
        }
        info!(job_id = %self.id, estado = ?status, "Job terminado");
        JobOutcome { status, report }
    }

    pub async fn run(self) -> Result<JobOutcome> {
        self.start()?;
        Ok(self.wait().await)
    }
}
