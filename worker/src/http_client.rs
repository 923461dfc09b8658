//! Cliente HTTP de una sub-tarea hacia su supervisor.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::client::{AllocateRequest, AllocationLedger, SupervisorTaskClient};
use common::report::{ReportAck, SubTaskReport};
use common::retry::{retry, RetryPolicy};
use common::{IngestError, Result, SegmentId, TaskId};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    /// Ver [`IngestError::code`].
    #[serde(default)]
    code: Option<String>,
}

/// Qué se le pidió al supervisor; decide cómo leer un 404 o un 409.
#[derive(Debug, Clone, Copy)]
enum Call<'a> {
    Allocate,
    Report { task_id: &'a str },
}

pub struct HttpSupervisorClient {
    http: Client,
    base_url: String,
    supervisor_id: TaskId,
    retry: RetryPolicy,
    ledger: AllocationLedger,
}

impl HttpSupervisorClient {
    pub fn new(base_url: &str, supervisor_id: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| IngestError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            supervisor_id: supervisor_id.to_string(),
            retry: RetryPolicy::new(2, 10).with_message("Llamada HTTP al supervisor fallida"),
            ledger: AllocationLedger::new(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api/v1/supervisors/{}/{}",
            self.base_url, self.supervisor_id, path
        )
    }

    /// POST con reintentos: errores de conexión, timeouts y 5xx son transitorios.
    async fn post<B, T>(&self, call: Call<'_>, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        retry(
            &self.retry,
            |n_try| {
                let url = url.as_str();
                async move {
                    debug!(url, intento = n_try, "POST al supervisor");
                    self.post_once(call, url, body).await
                }
            },
            IngestError::is_transient,
        )
        .await
    }

    async fn post_once<B, T>(&self, call: Call<'_>, url: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| IngestError::Transient(format!("POST {url}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| IngestError::Http(format!("respuesta ilegible de {url}: {e}")));
        }

        let body = response.json::<ErrorBody>().await.unwrap_or(ErrorBody {
            error: status.to_string(),
            code: None,
        });
        Err(self.error_for_status(call, status, body))
    }

    fn error_for_status(&self, call: Call<'_>, status: StatusCode, body: ErrorBody) -> IngestError {
        let ErrorBody { error: message, code } = body;
        match (status, call) {
            (s, _) if s.is_server_error() => IngestError::Transient(message),
            (StatusCode::NOT_FOUND, Call::Report { task_id })
                if code.as_deref() == Some("UNKNOWN_TASK") =>
            {
                IngestError::UnknownTask(task_id.to_string())
            }
            (StatusCode::NOT_FOUND, _) => {
                IngestError::SupervisorNotFound(self.supervisor_id.clone())
            }
            (StatusCode::CONFLICT, Call::Report { task_id }) => IngestError::ConflictingReport {
                task_id: task_id.to_string(),
            },
            (StatusCode::CONFLICT, Call::Allocate) => IngestError::AllocationConflict(message),
            _ => IngestError::Http(format!("{status}: {message}")),
        }
    }
}

#[async_trait]
impl SupervisorTaskClient for HttpSupervisorClient {
    async fn allocate_segment(&self, timestamp: DateTime<Utc>) -> Result<SegmentId> {
        let request = AllocateRequest {
            timestamp,
            sequence_name: None,
            previous_segment_id: None,
        };
        self.post(Call::Allocate, "segments/allocate", &request).await
    }

    async fn allocate_segment_for_sequence(
        &self,
        timestamp: DateTime<Utc>,
        sequence_name: &str,
        previous_segment_id: Option<&str>,
    ) -> Result<SegmentId> {
        let request = AllocateRequest {
            timestamp,
            sequence_name: Some(sequence_name.to_string()),
            previous_segment_id: previous_segment_id.map(str::to_string),
        };
        let id: SegmentId = self
            .post(Call::Allocate, "segments/allocate", &request)
            .await?;
        self.ledger.verify(sequence_name, previous_segment_id, &id)?;
        Ok(id)
    }

    async fn report(&self, report: SubTaskReport) -> Result<ReportAck> {
        let call = Call::Report {
            task_id: &report.task_id,
        };
        self.post(call, "reports", &report).await
    }
}
