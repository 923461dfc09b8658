//! Configuración del proceso supervisor: defaults + variables `INGEST_*`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use common::retry::RetryPolicy;
use common::{IngestError, Result};

use crate::killer::DEFAULT_KILL_INTERVAL;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub bind_addr: SocketAddr,
    pub work_dir: PathBuf,
    pub shuffle_dir: PathBuf,
    pub segment_dir: PathBuf,
    /// Probabilidad de matar una sub-tarea en cada tick del killer (0 = apagado).
    pub task_kill_rate: f64,
    pub kill_interval: Duration,
    /// Probabilidad de perder la respuesta de una llamada al supervisor.
    pub api_failure_rate: f64,
    pub client_retry: RetryPolicy,
    pub job_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            work_dir: PathBuf::from("/tmp/ingest/work"),
            shuffle_dir: PathBuf::from("/tmp/ingest/shuffle"),
            segment_dir: PathBuf::from("/tmp/ingest/segments"),
            task_kill_rate: 0.0,
            kill_interval: DEFAULT_KILL_INTERVAL,
            api_failure_rate: 0.0,
            client_retry: RetryPolicy::new(2, 5)
                .with_backoff(Duration::from_millis(10), Duration::from_millis(200))
                .with_message("Llamada al supervisor fallida"),
            job_timeout: Duration::from_secs(60 * 60),
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Igual que `from_env` pero con una fuente de variables inyectable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("INGEST_BIND_ADDR") {
            config.bind_addr = parse("INGEST_BIND_ADDR", &raw)?;
        }
        if let Some(raw) = lookup("INGEST_WORK_DIR") {
            config.work_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("INGEST_SHUFFLE_DIR") {
            config.shuffle_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("INGEST_SEGMENT_DIR") {
            config.segment_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("INGEST_TASK_KILL_RATE") {
            config.task_kill_rate = rate("INGEST_TASK_KILL_RATE", &raw)?;
        }
        if let Some(raw) = lookup("INGEST_KILL_INTERVAL_MS") {
            config.kill_interval = Duration::from_millis(parse("INGEST_KILL_INTERVAL_MS", &raw)?);
        }
        if let Some(raw) = lookup("INGEST_API_FAILURE_RATE") {
            config.api_failure_rate = rate("INGEST_API_FAILURE_RATE", &raw)?;
        }
        if let Some(raw) = lookup("INGEST_API_MAX_TRIES") {
            let max_tries: u32 = parse("INGEST_API_MAX_TRIES", &raw)?;
            if max_tries == 0 {
                return Err(IngestError::Config("INGEST_API_MAX_TRIES debe ser > 0".to_string()));
            }
            config.client_retry.max_tries = max_tries;
        }
        if let Some(raw) = lookup("INGEST_JOB_TIMEOUT_SECS") {
            config.job_timeout = Duration::from_secs(parse("INGEST_JOB_TIMEOUT_SECS", &raw)?);
        }

        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| IngestError::Config(format!("valor inválido para {key}: [{raw}]")))
}

fn rate(key: &str, raw: &str) -> Result<f64> {
    let value: f64 = parse(key, raw)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(IngestError::Config(format!("{key} debe estar en [0, 1], llegó {value}")));
    }
    Ok(value)
}
