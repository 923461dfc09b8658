//! Cliente en proceso de una sub-tarea hacia su supervisor.
//!
//! Resuelve el supervisor a través del runner y pasa cada llamada por el
//! executor de reintentos. Puede inyectar respuestas perdidas: la llamada se
//! procesa en el supervisor pero la sub-tarea ve un fallo transitorio.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::debug;

use common::client::{AllocationLedger, SupervisorTaskClient};
use common::report::{ReportAck, SubTaskReport};
use common::retry::{retry, RetryPolicy};
use common::{IngestError, Result, SegmentId, TaskId};

use crate::runner::{SupervisorEndpoint, TaskRunner};

/// Máximo de fallas inyectadas por llamada.
const MAX_INJECTED_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct LocalClientConfig {
    /// Probabilidad de perder la respuesta de cada intento.
    pub api_failure_rate: f64,
    pub retry: RetryPolicy,
}

impl Default for LocalClientConfig {
    fn default() -> Self {
        Self {
            api_failure_rate: 0.0,
            retry: RetryPolicy::new(2, 5)
                .with_backoff(Duration::from_millis(10), Duration::from_millis(200))
                .with_message("Llamada al supervisor fallida"),
        }
    }
}

pub struct LocalSupervisorClient {
    runner: TaskRunner,
    supervisor_id: TaskId,
    config: LocalClientConfig,
    ledger: AllocationLedger,
}

impl LocalSupervisorClient {
    pub fn new(runner: TaskRunner, supervisor_id: &str, config: LocalClientConfig) -> Self {
        Self {
            runner,
            supervisor_id: supervisor_id.to_string(),
            config,
            ledger: AllocationLedger::new(),
        }
    }

    fn endpoint(&self) -> Result<Arc<dyn SupervisorEndpoint>> {
        self.runner.find_supervisor(&self.supervisor_id)
    }

    /// Corre `call` con reintentos. Después de que el supervisor procesó la
    /// llamada puede simular que la respuesta se perdió (nunca en el último intento).
    async fn call<T, F>(&self, what: &str, call: F) -> Result<T>
    where
        T: Send,
        F: Fn(&dyn SupervisorEndpoint) -> Result<T> + Send + Sync,
    {
        let endpoint = self.endpoint()?;
        let injected = AtomicU32::new(0);
        let max_tries = self.config.retry.max_tries;

        retry(
            &self.config.retry,
            |n_try| {
                let result = call(endpoint.as_ref()).and_then(|value| {
                    if self.should_inject(n_try, max_tries, &injected) {
                        debug!(supervisor = %self.supervisor_id, llamada = what, "Respuesta perdida (inyectada)");
                        Err(IngestError::Transient(format!(
                            "se perdió la respuesta de {what} (inyectada)"
                        )))
                    } else {
                        Ok(value)
                    }
                });
                std::future::ready(result)
            },
            IngestError::is_transient,
        )
        .await
    }

    fn should_inject(&self, n_try: u32, max_tries: u32, injected: &AtomicU32) -> bool {
        let rate = self.config.api_failure_rate;
        if rate <= 0.0 || n_try >= max_tries || injected.load(Ordering::SeqCst) >= MAX_INJECTED_FAILURES {
            return false;
        }
        if rand::thread_rng().gen_bool(rate.min(1.0)) {
            injected.fetch_add(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl SupervisorTaskClient for LocalSupervisorClient {
    async fn allocate_segment(&self, timestamp: DateTime<Utc>) -> Result<SegmentId> {
        self.call("allocate_segment", |ep| ep.allocate_segment(timestamp))
            .await
    }

    async fn allocate_segment_for_sequence(
        &self,
        timestamp: DateTime<Utc>,
        sequence_name: &str,
        previous_segment_id: Option<&str>,
    ) -> Result<SegmentId> {
        self.call("allocate_segment", |ep| {
            let id = ep.allocate_segment_for_sequence(timestamp, sequence_name, previous_segment_id)?;
            self.ledger.verify(sequence_name, previous_segment_id, &id)?;
            Ok(id)
        })
        .await
    }

    async fn report(&self, report: SubTaskReport) -> Result<ReportAck> {
        self.call("report", |ep| ep.report(report.clone())).await
    }
}
