use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::{GranularitySpec, IngestionSchema, InputSplit, TaskContext, TuningConfig};
use crate::segment::Interval;
use crate::shuffle::PartitionLocation;

pub type TaskId = String;
pub type SpecId = String;

/* --------- Tipos de tarea --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Supervisor,
    SinglePhase,
    PartialCardinality,
    PartialGenerate,
    PartialMerge,
    Compaction,
}

impl TaskKind {
    /// Prefijo usado al armar ids de tarea.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Supervisor => "index_parallel",
            TaskKind::SinglePhase => "single_phase_sub_task",
            TaskKind::PartialCardinality => "partial_dimension_cardinality",
            TaskKind::PartialGenerate => "partial_index_generate",
            TaskKind::PartialMerge => "partial_index_merge",
            TaskKind::Compaction => "compact",
        }
    }

    pub fn is_sub_task(self) -> bool {
        !matches!(self, TaskKind::Supervisor | TaskKind::Compaction)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/* --------- Estado de una tarea en el runner --------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Submitted,
    Running,
    Succeeded,
    Failed { message: String },
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed { .. } | TaskState::Cancelled
        )
    }

    /// Código de resultado para los estados terminales.
    pub fn status_code(&self) -> Option<TaskStatusCode> {
        match self {
            TaskState::Succeeded => Some(TaskStatusCode::Success),
            TaskState::Failed { message } => Some(TaskStatusCode::Failed(message.clone())),
            TaskState::Cancelled => Some(TaskStatusCode::Cancelled),
            TaskState::Submitted | TaskState::Running => None,
        }
    }
}

/// Resultado visible en el borde de submission de tareas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatusCode {
    Success,
    Failed(String),
    Cancelled,
}

impl TaskStatusCode {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatusCode::Success)
    }
}

/* --------- Specs de sub-tareas --------- */

/// Descripción inmutable de una unidad de trabajo. Un spec puede ejecutarse
/// varias veces (un task id por intento).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTaskSpec {
    pub id: SpecId,
    pub kind: SubTaskKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SubTaskKind {
    SinglePhase {
        split: InputSplit,
    },
    PartialCardinality {
        split: InputSplit,
        partition_dimensions: Vec<String>,
    },
    PartialGenerate {
        split: InputSplit,
        buckets: BucketSpec,
    },
    PartialMerge {
        interval: Interval,
        bucket_id: u32,
        locations: Vec<PartitionLocation>,
    },
}

impl SubTaskKind {
    pub fn task_kind(&self) -> TaskKind {
        match self {
            SubTaskKind::SinglePhase { .. } => TaskKind::SinglePhase,
            SubTaskKind::PartialCardinality { .. } => TaskKind::PartialCardinality,
            SubTaskKind::PartialGenerate { .. } => TaskKind::PartialGenerate,
            SubTaskKind::PartialMerge { .. } => TaskKind::PartialMerge,
        }
    }
}

/// Cantidad de buckets por intervalo para el particionado por hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketSpec {
    pub partition_dimensions: Vec<String>,
    /// Se usa para los intervalos que no aparecen en `by_interval`.
    pub default_num_shards: Option<u32>,
    #[serde(default)]
    pub by_interval: BTreeMap<Interval, u32>,
}

impl BucketSpec {
    pub fn num_shards(&self, interval: &Interval) -> u32 {
        self.by_interval
            .get(interval)
            .copied()
            .or(self.default_num_shards)
            .unwrap_or(1)
            .max(1)
    }
}

/* --------- Descriptor serializado --------- */

/// Lo que necesita un worker para ejecutar un intento de un spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTaskDescriptor {
    pub id: TaskId,
    /// Id del supervisor al que la sub-tarea le habla.
    pub group_id: TaskId,
    pub spec: SubTaskSpec,
    pub attempt: u32,
    pub datasource: String,
    pub schema: IngestionSchema,
    pub granularity: GranularitySpec,
    pub tuning: TuningConfig,
    #[serde(default)]
    pub context: TaskContext,
}

impl SubTaskDescriptor {
    pub fn kind(&self) -> TaskKind {
        self.spec.kind.task_kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estados_terminales() {
        assert!(!TaskState::Submitted.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert_eq!(
            TaskState::Failed { message: "boom".into() }.status_code(),
            Some(TaskStatusCode::Failed("boom".into()))
        );
    }

    #[test]
    fn estado_y_codigo_en_json() {
        let json = serde_json::to_value(TaskState::Failed { message: "x".into() }).unwrap();
        assert_eq!(json["state"], "FAILED");
        let code = serde_json::to_value(TaskStatusCode::Cancelled).unwrap();
        assert_eq!(code["status"], "CANCELLED");
    }

    #[test]
    fn buckets_por_intervalo_con_default() {
        let day: Interval = "2020-01-01/P1D".parse().unwrap();
        let other: Interval = "2020-01-02/P1D".parse().unwrap();
        let mut buckets = BucketSpec {
            partition_dimensions: vec!["dim".into()],
            default_num_shards: None,
            by_interval: BTreeMap::from([(day, 3)]),
        };
        assert_eq!(buckets.num_shards(&day), 3);
        assert_eq!(buckets.num_shards(&other), 1);
        buckets.default_num_shards = Some(2);
        assert_eq!(buckets.num_shards(&other), 2);
    }
}
