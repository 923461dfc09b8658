//! Asignación de identificadores de segmento de un supervisor.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use common::partition_ids::{self, PartitionGeneration};
use common::segment::Granularity;
use common::{Interval, Result, SegmentId};

/// Cómo asigna ids un supervisor: versión y generación de partition ids.
#[derive(Debug, Clone)]
pub struct AllocationPlan {
    pub version: String,
    pub generation: PartitionGeneration,
    /// Versión fija por intervalo (lock por segmento: se conserva la existente).
    pub version_overrides: HashMap<Interval, String>,
    /// Último partition id ya ocupado por intervalo antes de empezar.
    pub used_partitions: HashMap<Interval, u32>,
}

impl AllocationPlan {
    /// Lock por time chunk: versión nueva y partition ids de generación raíz.
    pub fn time_chunk(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            generation: PartitionGeneration::Root,
            version_overrides: HashMap::new(),
            used_partitions: HashMap::new(),
        }
    }

    /// Lock por segmento: se mantiene la versión y se usan ids no raíz.
    pub fn segment_lock(version: impl Into<String>) -> Self {
        Self {
            generation: PartitionGeneration::NonRoot,
            ..Self::time_chunk(version)
        }
    }
}

#[derive(Debug)]
pub struct SegmentAllocator {
    datasource: String,
    granularity: Granularity,
    plan: AllocationPlan,
    by_sequence: HashMap<(String, Option<String>), SegmentId>,
    last_partition: HashMap<Interval, u32>,
}

impl SegmentAllocator {
    pub fn new(datasource: &str, granularity: Granularity, plan: AllocationPlan) -> Self {
        let last_partition = plan
            .used_partitions
            .iter()
            .filter(|(_, id)| partition_ids::classify(**id as i64).ok() == Some(plan.generation))
            .map(|(interval, id)| (*interval, *id))
            .collect();
        Self {
            datasource: datasource.to_string(),
            granularity,
            plan,
            by_sequence: HashMap::new(),
            last_partition,
        }
    }

    /// Asignación sin clave: siempre un id nuevo.
    pub fn allocate(&mut self, timestamp: DateTime<Utc>) -> Result<SegmentId> {
        let interval = self.granularity.bucket(timestamp);
        self.next_id(interval)
    }

    /// Asignación idempotente: la misma `(secuencia, previo)` devuelve siempre el mismo id.
    pub fn allocate_for_sequence(
        &mut self,
        timestamp: DateTime<Utc>,
        sequence_name: &str,
        previous_segment_id: Option<&str>,
    ) -> Result<SegmentId> {
        let key = (
            sequence_name.to_string(),
            previous_segment_id.map(str::to_string),
        );
        if let Some(existing) = self.by_sequence.get(&key) {
            return Ok(existing.clone());
        }
        let interval = self.granularity.bucket(timestamp);
        let id = self.next_id(interval)?;
        debug!(
            sequence = sequence_name,
            previo = ?previous_segment_id,
            segmento = %id,
            "Segmento asignado"
        );
        self.by_sequence.insert(key, id.clone());
        Ok(id)
    }

    fn next_id(&mut self, interval: Interval) -> Result<SegmentId> {
        let last = self.last_partition.get(&interval).copied();
        let partition = partition_ids::next_in_generation(self.plan.generation, last)?;
        self.last_partition.insert(interval, partition);

        let version = self
            .plan
            .version_overrides
            .get(&interval)
            .unwrap_or(&self.plan.version);
        Ok(SegmentId::new(&self.datasource, interval, version, partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::segment::parse_instant;
    use common::IngestError;

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_instant(raw).unwrap()
    }

    #[test]
    fn misma_clave_mismo_id() {
        let mut alloc =
            SegmentAllocator::new("wiki", Granularity::Day, AllocationPlan::time_chunk("v1"));
        let a = alloc.allocate_for_sequence(ts("2020-01-01T01:00:00Z"), "seq", None).unwrap();
        let again = alloc.allocate_for_sequence(ts("2020-01-01T05:00:00Z"), "seq", None).unwrap();
        assert_eq!(a, again);
        assert_eq!(a.partition_num, 0);

        let next = alloc
            .allocate_for_sequence(ts("2020-01-01T01:00:00Z"), "seq", Some(&a.to_string()))
            .unwrap();
        assert_eq!(next.partition_num, 1);

        let other_seq = alloc.allocate_for_sequence(ts("2020-01-01T01:00:00Z"), "otra", None).unwrap();
        assert_eq!(other_seq.partition_num, 2);
    }

    #[test]
    fn particiones_por_intervalo() {
        let mut alloc =
            SegmentAllocator::new("wiki", Granularity::Day, AllocationPlan::time_chunk("v1"));
        assert_eq!(alloc.allocate(ts("2020-01-01")).unwrap().partition_num, 0);
        assert_eq!(alloc.allocate(ts("2020-01-02")).unwrap().partition_num, 0);
        assert_eq!(alloc.allocate(ts("2020-01-01")).unwrap().partition_num, 1);
    }

    #[test]
    fn lock_por_segmento_usa_ids_no_raiz_y_version_existente() {
        let day: Interval = "2020-01-01/P1D".parse().unwrap();
        let mut plan = AllocationPlan::segment_lock("v2");
        plan.version_overrides.insert(day, "v1".to_string());
        plan.used_partitions.insert(day, 3);
        let mut alloc = SegmentAllocator::new("wiki", Granularity::Day, plan);

        let id = alloc.allocate_for_sequence(ts("2020-01-01"), "seq", None).unwrap();
        assert_eq!(id.partition_num, 32_768);
        assert_eq!(id.version, "v1");
        assert_eq!(alloc.allocate(ts("2020-01-02")).unwrap().version, "v2");
    }

    #[test]
    fn generacion_llena_es_error() {
        let day: Interval = "2020-01-01/P1D".parse().unwrap();
        let mut plan = AllocationPlan::time_chunk("v1");
        plan.used_partitions.insert(day, 32_767);
        let mut alloc = SegmentAllocator::new("wiki", Granularity::Day, plan);
        assert!(matches!(
            alloc.allocate(ts("2020-01-01")),
            Err(IngestError::PartitionIdOutOfRange(32_768))
        ));
    }
}
