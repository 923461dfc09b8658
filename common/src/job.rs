use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::report::IngestionReport;
use crate::segment::{Granularity, Interval};

pub type JobId = String;

/* --------- Spec de ingesta que manda el cliente --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionSpec {
    pub datasource: String,
    pub schema: IngestionSchema,
    #[serde(default)]
    pub granularity: GranularitySpec,
    pub input: InputSource,
    #[serde(default)]
    pub tuning: TuningConfig,
}

impl IngestionSpec {
    pub fn validate(&self) -> Result<()> {
        if self.datasource.trim().is_empty() {
            return Err(IngestError::InvalidSpec("datasource vacío".to_string()));
        }
        if self.schema.columns.is_empty() {
            return Err(IngestError::InvalidSpec("el schema no tiene columnas".to_string()));
        }
        if !self.schema.columns.contains(&self.schema.timestamp.column) {
            return Err(IngestError::InvalidSpec(format!(
                "la columna de timestamp [{}] no está entre las columnas",
                self.schema.timestamp.column
            )));
        }
        if self.tuning.max_num_concurrent_sub_tasks == 0 {
            return Err(IngestError::InvalidSpec(
                "max_num_concurrent_sub_tasks debe ser > 0".to_string(),
            ));
        }
        if let PartitionsSpec::Hashed {
            num_shards,
            target_rows_per_segment,
            ..
        } = &self.tuning.partitions_spec
        {
            if num_shards.is_none() && *target_rows_per_segment == 0 {
                return Err(IngestError::InvalidSpec(
                    "hashed sin num_shards necesita target_rows_per_segment > 0".to_string(),
                ));
            }
            if *num_shards == Some(0) {
                return Err(IngestError::InvalidSpec("num_shards debe ser > 0".to_string()));
            }
        }
        Ok(())
    }
}

/// Qué columnas tiene la entrada y cómo convertirlas en filas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionSchema {
    /// Columnas del CSV, en orden.
    pub columns: Vec<String>,
    pub timestamp: TimestampSpec,
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampSpec {
    pub column: String,
    #[serde(default)]
    pub format: TimestampFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampFormat {
    /// ISO 8601 o millis desde epoch, lo que parsee.
    #[default]
    Auto,
    Iso,
    Millis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MetricSpec {
    /// Cuenta filas (antes del rollup).
    Count { name: String },
    /// Suma un campo entero.
    LongSum { name: String, field: String },
}

impl MetricSpec {
    pub fn name(&self) -> &str {
        match self {
            MetricSpec::Count { name } | MetricSpec::LongSum { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GranularitySpec {
    #[serde(default)]
    pub segment_granularity: Granularity,
    /// Si viene, las filas fuera de estos intervalos se descartan (thrownAway).
    #[serde(default)]
    pub intervals: Option<Vec<Interval>>,
}

/* --------- Fuentes de entrada --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum InputSource {
    /// Un split por cada archivo que haga match con `filter` dentro de `base_dir`.
    Local { base_dir: PathBuf, filter: String },
    /// Datos CSV en línea, un único split.
    Inline { data: String },
    /// Archivos de segmentos ya publicados (JSON lines), un split por archivo.
    Segments { files: Vec<PathBuf> },
}

/// Porción de la entrada que procesa una sub-tarea.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum InputSplit {
    File { path: PathBuf },
    Inline { data: String },
    SegmentFile { path: PathBuf },
}

impl InputSplit {
    /// Nombre corto para armar ids de spec.
    pub fn label(&self) -> String {
        match self {
            InputSplit::File { path } | InputSplit::SegmentFile { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string_lossy().to_string()),
            InputSplit::Inline { .. } => "inline".to_string(),
        }
    }
}

/* --------- Tuning --------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PartitionsSpec {
    /// Una sola fase: cada sub-tarea publica sus propios segmentos.
    Dynamic {
        #[serde(default = "default_max_rows_per_segment")]
        max_rows_per_segment: u64,
    },
    /// Multi-fase con shuffle: generate -> merge, particionando por hash.
    Hashed {
        #[serde(default)]
        num_shards: Option<u32>,
        #[serde(default)]
        partition_dimensions: Vec<String>,
        #[serde(default = "default_target_rows_per_segment")]
        target_rows_per_segment: u64,
    },
}

impl PartitionsSpec {
    pub fn is_multi_phase(&self) -> bool {
        matches!(self, PartitionsSpec::Hashed { .. })
    }
}

impl Default for PartitionsSpec {
    fn default() -> Self {
        PartitionsSpec::Dynamic {
            max_rows_per_segment: default_max_rows_per_segment(),
        }
    }
}

fn default_max_rows_per_segment() -> u64 {
    5_000_000
}

fn default_target_rows_per_segment() -> u64 {
    5_000_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockGranularity {
    #[default]
    TimeChunk,
    Segment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TuningConfig {
    pub partitions_spec: PartitionsSpec,
    pub max_num_concurrent_sub_tasks: usize,
    /// Reintentos por spec después del primer intento.
    pub max_num_retries: u32,
    /// `None` = sin límite.
    pub max_parse_exceptions: Option<u64>,
    pub max_saved_parse_exceptions: usize,
    pub use_lineage_based_segment_allocation: bool,
    pub lock_granularity: LockGranularity,
    #[serde(with = "duration_secs")]
    pub sub_task_timeout: Duration,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            partitions_spec: PartitionsSpec::default(),
            max_num_concurrent_sub_tasks: 1,
            max_num_retries: 3,
            max_parse_exceptions: None,
            max_saved_parse_exceptions: 0,
            use_lineage_based_segment_allocation: true,
            lock_granularity: LockGranularity::TimeChunk,
            sub_task_timeout: Duration::from_secs(20 * 60),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/* --------- Estado de un job visto desde la API --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Accepted,
    Running,
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: JobId,
    pub datasource: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Sólo cuando el job terminó.
    pub report: Option<IngestionReport>,
    pub error: Option<String>,
}

/// Pedido de compactación de un intervalo de un datasource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionRequest {
    pub datasource: String,
    pub interval: Interval,
    #[serde(default)]
    pub lock_granularity: LockGranularity,
    /// Granularidad de los segmentos compactados.
    #[serde(default)]
    pub segment_granularity: Granularity,
    #[serde(default)]
    pub tuning: Option<TuningConfig>,
    /// Schema de los segmentos (columnas = dimensiones + métricas).
    pub schema: IngestionSchema,
}

/// Parámetros de contexto que viajan con cada descriptor de sub-tarea.
pub type TaskContext = BTreeMap<String, serde_json::Value>;
