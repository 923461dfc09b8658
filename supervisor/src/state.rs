// supervisor/src/state.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use common::catalog::SegmentCatalog;
use common::{IngestError, JobId, JobInfo, JobStatus, Result};

use crate::config::SupervisorConfig;
use crate::job::IngestEnv;
use crate::runner::TaskRunner;

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<Mutex<HashMap<JobId, JobEntry>>>,
    pub catalog: Arc<dyn SegmentCatalog>,
    pub config: Arc<SupervisorConfig>,
}

/// Un job visto desde la API: su info pública y el runner donde corre.
/// El runner se suelta cuando el job termina.
#[derive(Clone)]
pub struct JobEntry {
    pub info: JobInfo,
    pub runner: Option<TaskRunner>,
}

impl AppState {
    pub fn new(config: SupervisorConfig, catalog: Arc<dyn SegmentCatalog>) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            catalog,
            config: Arc::new(config),
        }
    }

    /// Entorno con el que corre cada job nuevo.
    pub fn env(&self) -> IngestEnv {
        IngestEnv::from_config(&self.config, self.catalog.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<JobId, JobEntry>>> {
        self.jobs
            .lock()
            .map_err(|_| IngestError::Internal("tabla de jobs envenenada".to_string()))
    }

    /// Da de alta un job en `ACCEPTED`.
    pub fn register_job(&self, id: &str, datasource: &str, runner: TaskRunner) -> Result<JobInfo> {
        let info = JobInfo {
            id: id.to_string(),
            datasource: datasource.to_string(),
            status: JobStatus::Accepted,
            submitted_at: Utc::now(),
            finished_at: None,
            report: None,
            error: None,
        };
        let mut jobs = self.lock()?;
        if jobs.contains_key(id) {
            return Err(IngestError::DuplicateTaskId(id.to_string()));
        }
        jobs.insert(
            id.to_string(),
            JobEntry {
                info: info.clone(),
                runner: Some(runner),
            },
        );
        Ok(info)
    }

    pub fn job(&self, id: &str) -> Option<JobInfo> {
        self.lock().ok()?.get(id).map(|entry| entry.info.clone())
    }

    pub fn update_job<F>(&self, id: &str, update: F)
    where
        F: FnOnce(&mut JobInfo),
    {
        if let Ok(mut jobs) = self.lock() {
            if let Some(entry) = jobs.get_mut(id) {
                update(&mut entry.info);
            }
        }
    }

    /// Última actualización de un job terminado: suelta su runner, con todas
    /// las tareas y reportes que guarda.
    pub fn finish_job<F>(&self, id: &str, update: F)
    where
        F: FnOnce(&mut JobInfo),
    {
        if let Ok(mut jobs) = self.lock() {
            if let Some(entry) = jobs.get_mut(id) {
                update(&mut entry.info);
                entry.runner = None;
            }
        }
    }

    /// Runner donde vive el supervisor `supervisor_id`.
    /// El id del supervisor raíz de cada job es el id del job; los supervisores
    /// internos (compactación) se buscan en los runners de todos los jobs.
    pub fn runner_for(&self, supervisor_id: &str) -> Result<TaskRunner> {
        let jobs = self.lock()?;
        if let Some(runner) = jobs.get(supervisor_id).and_then(|e| e.runner.as_ref()) {
            return Ok(runner.clone());
        }
        jobs.values()
            .filter_map(|entry| entry.runner.as_ref())
            .find(|runner| runner.status(supervisor_id).is_some())
            .cloned()
            .ok_or_else(|| IngestError::SupervisorNotFound(supervisor_id.to_string()))
    }
}
