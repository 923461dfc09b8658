use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{IngestError, Result};
use crate::report::{ReportAck, SubTaskReport};
use crate::segment::SegmentId;

/// Lo que una sub-tarea puede pedirle a su supervisor.
///
/// Las implementaciones reintentan internamente los fallos transitorios.
#[async_trait]
pub trait SupervisorTaskClient: Send + Sync {
    /// Asignación sin clave de idempotencia: cada llamada puede dar un id nuevo.
    async fn allocate_segment(&self, timestamp: DateTime<Utc>) -> Result<SegmentId>;

    /// Asignación idempotente por `(sequence_name, previous_segment_id)`.
    async fn allocate_segment_for_sequence(
        &self,
        timestamp: DateTime<Utc>,
        sequence_name: &str,
        previous_segment_id: Option<&str>,
    ) -> Result<SegmentId>;

    /// Entrega al-menos-una-vez del resultado de la sub-tarea.
    async fn report(&self, report: SubTaskReport) -> Result<ReportAck>;
}

/// Cuerpo del pedido de asignación por HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateRequest {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sequence_name: Option<String>,
    #[serde(default)]
    pub previous_segment_id: Option<String>,
}

/// Primer id observado por clave de asignación. Cualquier respuesta posterior
/// para la misma clave tiene que ser idéntica.
#[derive(Debug, Default)]
pub struct AllocationLedger {
    seen: Mutex<HashMap<(String, Option<String>), SegmentId>>,
}

impl AllocationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verify(
        &self,
        sequence_name: &str,
        previous_segment_id: Option<&str>,
        allocated: &SegmentId,
    ) -> Result<()> {
        let key = (
            sequence_name.to_string(),
            previous_segment_id.map(str::to_string),
        );
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| IngestError::Internal("ledger de asignaciones envenenado".into()))?;
        match seen.get(&key) {
            Some(expected) if expected != allocated => {
                error!(
                    sequence = sequence_name,
                    esperado = %expected,
                    recibido = %allocated,
                    "Asignación no idempotente"
                );
                Err(IngestError::IdempotencyViolation {
                    sequence_name: sequence_name.to_string(),
                    previous_segment_id: key.1,
                    expected: Box::new(expected.clone()),
                    actual: Box::new(allocated.clone()),
                })
            }
            Some(_) => Ok(()),
            None => {
                seen.insert(key, allocated.clone());
                Ok(())
            }
        }
    }
}
