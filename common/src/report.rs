use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::segment::{DataSegment, Interval};
use crate::shuffle::PartitionLocation;
use crate::task::{SpecId, TaskId};

/// Nombres de fase usados como clave en el reporte del job.
pub const DETERMINE_PARTITIONS: &str = "determinePartitions";
pub const BUILD_SEGMENTS: &str = "buildSegments";

/* --------- Estadísticas de filas --------- */

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowIngestionTotals {
    pub processed: u64,
    pub processed_bytes: u64,
    pub processed_with_error: u64,
    pub thrown_away: u64,
    pub unparseable: u64,
}

impl RowIngestionTotals {
    pub fn merge(&mut self, other: &RowIngestionTotals) {
        self.processed += other.processed;
        self.processed_bytes += other.processed_bytes;
        self.processed_with_error += other.processed_with_error;
        self.thrown_away += other.thrown_away;
        self.unparseable += other.unparseable;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseExceptionReport {
    /// Línea cruda que no se pudo parsear.
    pub input: String,
    pub error_type: String,
    pub details: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/* --------- Reporte de una sub-tarea --------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTaskReport {
    pub task_id: TaskId,
    pub spec_id: SpecId,
    pub row_stats: RowIngestionTotals,
    #[serde(default)]
    pub parse_exceptions: Vec<ParseExceptionReport>,
    pub payload: ReportPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ReportPayload {
    /// Segmentos finales (fase única o merge).
    PushedSegments { segments: Vec<DataSegment> },
    /// Particiones intermedias empujadas al shuffle (generate).
    GeneratedPartitions { locations: Vec<PartitionLocation> },
    /// Hashes de las claves de partición vistas por intervalo (cardinalidad).
    DimensionCardinality {
        key_hashes_by_interval: BTreeMap<Interval, Vec<u64>>,
    },
}

impl ReportPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            ReportPayload::PushedSegments { .. } => "pushedSegments",
            ReportPayload::GeneratedPartitions { .. } => "generatedPartitions",
            ReportPayload::DimensionCardinality { .. } => "dimensionCardinality",
        }
    }
}

/// Respuesta del supervisor a un `report`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportAck {
    Accepted,
    /// Reporte idéntico a uno ya recibido: no se vuelve a contar.
    Duplicate,
    /// El reporte viene de un intento que ya no es el vivo para su spec.
    Stale,
}

/* --------- Reporte del job --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionState {
    NotStarted,
    DeterminePartitions,
    BuildSegments,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionReport {
    pub task_id: TaskId,
    pub state: IngestionState,
    /// fase -> totales
    pub row_stats: BTreeMap<String, RowIngestionTotals>,
    /// fase -> muestras de parse exceptions
    pub unparseable_events: BTreeMap<String, Vec<ParseExceptionReport>>,
    pub segments: Vec<DataSegment>,
    pub error_msg: Option<String>,
}

impl IngestionReport {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            state: IngestionState::NotStarted,
            row_stats: BTreeMap::new(),
            unparseable_events: BTreeMap::new(),
            segments: Vec::new(),
            error_msg: None,
        }
    }

    /// Suma las estadísticas de un reporte bajo `phase`, guardando a lo sumo
    /// `max_saved` muestras de parse exceptions por fase.
    pub fn accumulate(&mut self, phase: &str, report: &SubTaskReport, max_saved: usize) {
        self.row_stats
            .entry(phase.to_string())
            .or_default()
            .merge(&report.row_stats);

        let samples = self.unparseable_events.entry(phase.to_string()).or_default();
        let room = max_saved.saturating_sub(samples.len());
        samples.extend(report.parse_exceptions.iter().take(room).cloned());
    }

    pub fn totals(&self, phase: &str) -> Option<&RowIngestionTotals> {
        self.row_stats.get(phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(task: &str, processed: u64, samples: usize) -> SubTaskReport {
        SubTaskReport {
            task_id: task.into(),
            spec_id: format!("spec_{task}"),
            row_stats: RowIngestionTotals {
                processed,
                unparseable: samples as u64,
                ..Default::default()
            },
            parse_exceptions: (0..samples)
                .map(|i| ParseExceptionReport {
                    input: format!("fila rota {i}"),
                    error_type: "unparseable".into(),
                    details: vec!["timestamp inválido".into()],
                    timestamp: Utc::now(),
                })
                .collect(),
            payload: ReportPayload::PushedSegments { segments: vec![] },
        }
    }

    #[test]
    fn accumulate_suma_por_fase_y_limita_muestras() {
        let mut job = IngestionReport::new("sup");
        job.accumulate(BUILD_SEGMENTS, &report("a", 2, 3), 4);
        job.accumulate(BUILD_SEGMENTS, &report("b", 1, 3), 4);
        job.accumulate(DETERMINE_PARTITIONS, &report("c", 3, 0), 4);

        let build = job.totals(BUILD_SEGMENTS).unwrap();
        assert_eq!(build.processed, 3);
        assert_eq!(build.unparseable, 6);
        assert_eq!(job.unparseable_events[BUILD_SEGMENTS].len(), 4);
        assert_eq!(job.totals(DETERMINE_PARTITIONS).unwrap().processed, 3);
    }

    #[test]
    fn reporte_con_payload_tagueado() {
        let json = serde_json::to_value(report("a", 1, 0)).unwrap();
        assert_eq!(json["payload"]["type"], "pushedSegments");
        assert_eq!(json["rowStats"]["processed"], 1);
    }
}
