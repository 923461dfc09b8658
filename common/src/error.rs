use thiserror::Error;

use crate::segment::{Interval, SegmentId};
use crate::task::{SpecId, TaskId};

pub type Result<T> = std::result::Result<T, IngestError>;

/// Errores del núcleo de ingesta.
///
/// Sólo `Transient` se reintenta; el resto es fatal para quien lo recibe.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Fallo pasajero de transporte o de disponibilidad de un worker.
    #[error("fallo transitorio: {0}")]
    Transient(String),

    /// La asignación idempotente devolvió dos ids distintos para la misma clave.
    #[error(
        "la asignación de segmentos no es idempotente para la secuencia [{sequence_name}] \
         (previo={previous_segment_id:?}): antes [{expected}], ahora [{actual}]"
    )]
    IdempotencyViolation {
        sequence_name: String,
        previous_segment_id: Option<String>,
        expected: Box<SegmentId>,
        actual: Box<SegmentId>,
    },

    #[error("id de tarea duplicado [{0}]")]
    DuplicateTaskId(TaskId),

    /// El supervisor rechazó la asignación por un conflicto de consistencia.
    #[error("conflicto en la asignación de segmentos: {0}")]
    AllocationConflict(String),

    #[error("la sub-tarea [{task_id}] ya había reportado un resultado distinto")]
    ConflictingReport { task_id: TaskId },

    #[error(
        "no existe la partición del supervisor [{supervisor_id}] producida por [{sub_task_id}] \
         para el intervalo [{interval}] bucket [{bucket_id}]"
    )]
    MissingPartition {
        supervisor_id: TaskId,
        sub_task_id: TaskId,
        interval: Interval,
        bucket_id: u32,
    },

    #[error("no se encontró el supervisor [{0}]")]
    SupervisorNotFound(TaskId),

    #[error("la tarea [{task_id}] es de tipo [{kind}] y no es un supervisor")]
    NotASupervisor { task_id: TaskId, kind: String },

    #[error("el supervisor [{supervisor_id}] no asigna segmentos en la fase [{phase}]")]
    AllocationNotSupported { supervisor_id: TaskId, phase: String },

    #[error("tarea desconocida [{0}]")]
    UnknownTask(TaskId),

    #[error("partition id [{0}] fuera de [0, 65536)")]
    PartitionIdOutOfRange(i64),

    #[error("operación cancelada tras {attempts} intento(s)")]
    Cancelled { attempts: u32 },

    #[error("timeout esperando la tarea [{0}]")]
    Timeout(TaskId),

    #[error("la sub-tarea [{task_id}] del spec [{spec_id}] falló: {message}")]
    SubTaskFailed {
        spec_id: SpecId,
        task_id: TaskId,
        message: String,
    },

    #[error("la tarea interna [{task_id}] falló: {message}")]
    InnerTaskFailed { task_id: TaskId, message: String },

    #[error("se superó el máximo de parse exceptions ({max}): {unparseable} filas no parseables")]
    TooManyParseExceptions { max: u64, unparseable: u64 },

    #[error("spec inválido: {0}")]
    InvalidSpec(String),

    #[error("configuración inválida: {0}")]
    Config(String),

    #[error("error de I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("error de serialización: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("error HTTP: {0}")]
    Http(String),

    /// Estado interno inutilizable (p.ej. un lock envenenado). No se reintenta.
    #[error("error interno: {0}")]
    Internal(String),
}

impl IngestError {
    /// Indica si vale la pena reintentar la operación que produjo el error.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Transient(_))
    }

    /// Violaciones de protocolo: nunca se reintentan y se reportan en el acto.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            IngestError::IdempotencyViolation { .. }
                | IngestError::DuplicateTaskId(_)
                | IngestError::ConflictingReport { .. }
                | IngestError::AllocationConflict(_)
        )
    }

    /// Código estable que viaja en el cuerpo de error de la API HTTP.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Transient(_) => "TRANSIENT",
            IngestError::IdempotencyViolation { .. } => "IDEMPOTENCY_VIOLATION",
            IngestError::DuplicateTaskId(_) => "DUPLICATE_TASK_ID",
            IngestError::AllocationConflict(_) => "ALLOCATION_CONFLICT",
            IngestError::ConflictingReport { .. } => "CONFLICTING_REPORT",
            IngestError::MissingPartition { .. } => "MISSING_PARTITION",
            IngestError::SupervisorNotFound(_) => "SUPERVISOR_NOT_FOUND",
            IngestError::NotASupervisor { .. } => "NOT_A_SUPERVISOR",
            IngestError::AllocationNotSupported { .. } => "ALLOCATION_NOT_SUPPORTED",
            IngestError::UnknownTask(_) => "UNKNOWN_TASK",
            IngestError::PartitionIdOutOfRange(_) => "PARTITION_ID_OUT_OF_RANGE",
            IngestError::Cancelled { .. } => "CANCELLED",
            IngestError::Timeout(_) => "TIMEOUT",
            IngestError::SubTaskFailed { .. } => "SUB_TASK_FAILED",
            IngestError::InnerTaskFailed { .. } => "INNER_TASK_FAILED",
            IngestError::TooManyParseExceptions { .. } => "TOO_MANY_PARSE_EXCEPTIONS",
            IngestError::InvalidSpec(_) => "INVALID_SPEC",
            IngestError::Config(_) => "CONFIG",
            IngestError::Io(_) => "IO",
            IngestError::Serialization(_) => "SERIALIZATION",
            IngestError::Http(_) => "HTTP",
            IngestError::Internal(_) => "INTERNAL",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled { .. })
    }
}

impl From<csv::Error> for IngestError {
    fn from(err: csv::Error) -> Self {
        IngestError::InvalidSpec(err.to_string())
    }
}

impl From<glob::PatternError> for IngestError {
    fn from(err: glob::PatternError) -> Self {
        IngestError::InvalidSpec(format!("patrón de entrada inválido: {err}"))
    }
}
