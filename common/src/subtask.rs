//! Cuerpos de las sub-tareas.
//!
//! Cada sub-tarea lee su parte, habla con el supervisor a través de un
//! [`SupervisorTaskClient`] y termina con un único `report`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::client::SupervisorTaskClient;
use crate::engine::{
    chunk_rows, group_by_interval, hash_key, hash_partition, partition_key, read_rows_jsonl,
    rollup, write_rows_jsonl,
};
use crate::error::Result;
use crate::input::{read_rows, InputRow, RowBatch};
use crate::job::{InputSplit, PartitionsSpec};
use crate::report::{ReportAck, ReportPayload, RowIngestionTotals, SubTaskReport};
use crate::segment::{DataSegment, Interval, SegmentId};
use crate::blocking::BlockingWork;
use crate::shuffle::{
    IntermediaryDataStore, LocalShuffleClient, PartitionLocation, ShuffleClient,
};
use crate::task::{BucketSpec, SubTaskDescriptor, SubTaskKind};

/// Nombre del archivo de filas dentro de cada partición intermedia.
pub const ROWS_FILE: &str = "rows.jsonl";

/// Dependencias de una sub-tarea en ejecución.
#[derive(Clone)]
pub struct SubTaskToolbox {
    pub client: Arc<dyn SupervisorTaskClient>,
    pub shuffle: Arc<dyn ShuffleClient>,
    /// Cada sub-tarea trabaja bajo `work_dir/<task_id>`.
    pub work_dir: PathBuf,
    pub segment_dir: PathBuf,
    /// Trabajo de disco en vuelo; hay que drenarlo antes de borrar `task_dir`.
    pub blocking: BlockingWork,
}

impl SubTaskToolbox {
    /// Toolbox con shuffle local: el trabajo del shuffle y el de la sub-tarea
    /// comparten el mismo [`BlockingWork`].
    pub fn new(
        client: Arc<dyn SupervisorTaskClient>,
        store: Arc<IntermediaryDataStore>,
        work_dir: PathBuf,
        segment_dir: PathBuf,
    ) -> Self {
        let blocking = BlockingWork::new();
        Self {
            client,
            shuffle: Arc::new(LocalShuffleClient::with_blocking(store, blocking.clone())),
            work_dir,
            segment_dir,
            blocking,
        }
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.work_dir.join(task_id)
    }
}

/// Ejecuta la sub-tarea y reporta su resultado al supervisor.
pub async fn run_sub_task(
    descriptor: &SubTaskDescriptor,
    toolbox: &SubTaskToolbox,
) -> Result<ReportAck> {
    info!(
        task_id = %descriptor.id,
        spec_id = %descriptor.spec.id,
        tipo = %descriptor.kind(),
        intento = descriptor.attempt,
        "Ejecutando sub-tarea"
    );

    let (totals, parse_exceptions, payload) = match &descriptor.spec.kind {
        SubTaskKind::SinglePhase { split } => single_phase(descriptor, split, toolbox).await?,
        SubTaskKind::PartialCardinality {
            split,
            partition_dimensions,
        } => cardinality(descriptor, split, partition_dimensions, toolbox).await?,
        SubTaskKind::PartialGenerate { split, buckets } => {
            generate(descriptor, split, buckets, toolbox).await?
        }
        SubTaskKind::PartialMerge {
            interval,
            bucket_id,
            locations,
        } => merge(descriptor, interval, *bucket_id, locations, toolbox).await?,
    };

    let report = SubTaskReport {
        task_id: descriptor.id.clone(),
        spec_id: descriptor.spec.id.clone(),
        row_stats: totals,
        parse_exceptions,
        payload,
    };
    debug!(task_id = %descriptor.id, tipo = report.payload.type_name(), "Enviando reporte");
    toolbox.client.report(report).await
}

type Outcome = (
    RowIngestionTotals,
    Vec<crate::report::ParseExceptionReport>,
    ReportPayload,
);

async fn read_split(
    descriptor: &SubTaskDescriptor,
    split: &InputSplit,
    toolbox: &SubTaskToolbox,
) -> Result<RowBatch> {
    let split = split.clone();
    let schema = descriptor.schema.clone();
    let granularity = descriptor.granularity.clone();
    let tuning = descriptor.tuning.clone();
    toolbox
        .blocking
        .run(move || read_rows(&split, &schema, &granularity, &tuning))
        .await
}

async fn write_segment(
    descriptor: &SubTaskDescriptor,
    toolbox: &SubTaskToolbox,
    id: SegmentId,
    rows: Vec<InputRow>,
) -> Result<DataSegment> {
    let path = toolbox
        .segment_dir
        .join(&descriptor.datasource)
        .join(format!("{id}.json"));
    let num_rows = rows.len() as u64;
    let target = path.clone();
    toolbox
        .blocking
        .run(move || Ok(write_rows_jsonl(&target, &rows)?))
        .await?;

    Ok(DataSegment {
        id,
        num_rows,
        dimensions: descriptor.schema.dimensions.clone(),
        metrics: descriptor
            .schema
            .metrics
            .iter()
            .map(|m| m.name().to_string())
            .collect(),
        path: path.to_string_lossy().to_string(),
    })
}

/* =========================
   Fase única
   ========================= */

async fn single_phase(
    descriptor: &SubTaskDescriptor,
    split: &InputSplit,
    toolbox: &SubTaskToolbox,
) -> Result<Outcome> {
    let batch = read_split(descriptor, split, toolbox).await?;
    let max_rows = match &descriptor.tuning.partitions_spec {
        PartitionsSpec::Dynamic {
            max_rows_per_segment,
        } => *max_rows_per_segment,
        PartitionsSpec::Hashed {
            target_rows_per_segment,
            ..
        } => *target_rows_per_segment,
    };

    // mismo nombre en todos los intentos del spec: los reintentos reciben los mismos ids
    let sequence_name = format!("{}_{}", descriptor.group_id, descriptor.spec.id);
    let mut previous: Option<String> = None;
    let mut segments = Vec::new();

    let groups = group_by_interval(batch.rows, descriptor.granularity.segment_granularity);
    for (interval, rows) in groups {
        for chunk in chunk_rows(rollup(rows), max_rows) {
            let id = if descriptor.tuning.use_lineage_based_segment_allocation {
                toolbox
                    .client
                    .allocate_segment_for_sequence(
                        interval.start,
                        &sequence_name,
                        previous.as_deref(),
                    )
                    .await?
            } else {
                toolbox.client.allocate_segment(interval.start).await?
            };
            previous = Some(id.to_string());
            segments.push(write_segment(descriptor, toolbox, id, chunk).await?);
        }
    }

    Ok((
        batch.totals,
        batch.parse_exceptions,
        ReportPayload::PushedSegments { segments },
    ))
}

/* =========================
   Cardinalidad de las claves de partición
   ========================= */

async fn cardinality(
    descriptor: &SubTaskDescriptor,
    split: &InputSplit,
    partition_dimensions: &[String],
    toolbox: &SubTaskToolbox,
) -> Result<Outcome> {
    let batch = read_split(descriptor, split, toolbox).await?;

    let mut key_hashes_by_interval: BTreeMap<Interval, Vec<u64>> = BTreeMap::new();
    for (interval, rows) in group_by_interval(batch.rows, descriptor.granularity.segment_granularity)
    {
        let hashes: BTreeSet<u64> = rows
            .iter()
            .map(|row| hash_key(&partition_key(row, partition_dimensions)))
            .collect();
        key_hashes_by_interval.insert(interval, hashes.into_iter().collect());
    }

    Ok((
        batch.totals,
        batch.parse_exceptions,
        ReportPayload::DimensionCardinality {
            key_hashes_by_interval,
        },
    ))
}

/* =========================
   Generate: filas -> particiones intermedias
   ========================= */

async fn generate(
    descriptor: &SubTaskDescriptor,
    split: &InputSplit,
    buckets: &BucketSpec,
    toolbox: &SubTaskToolbox,
) -> Result<Outcome> {
    let batch = read_split(descriptor, split, toolbox).await?;
    let partitions_dir = toolbox.task_dir(&descriptor.id).join("partitions");

    let mut locations = Vec::new();
    for (interval, rows) in group_by_interval(batch.rows, descriptor.granularity.segment_granularity)
    {
        let num_shards = buckets.num_shards(&interval);
        let partitioned = hash_partition(rollup(rows), &buckets.partition_dimensions, num_shards);
        for (bucket_id, rows) in partitioned {
            let dir = partitions_dir
                .join(interval.path_key())
                .join(bucket_id.to_string());
            let file = dir.join(ROWS_FILE);
            toolbox
                .blocking
                .run(move || Ok(write_rows_jsonl(&file, &rows)?))
                .await?;

            let location = PartitionLocation {
                sub_task_id: descriptor.id.clone(),
                interval,
                bucket_id,
            };
            toolbox
                .shuffle
                .push(&descriptor.group_id, &location, &dir)
                .await?;
            locations.push(location);
        }
    }

    Ok((
        batch.totals,
        batch.parse_exceptions,
        ReportPayload::GeneratedPartitions { locations },
    ))
}

/* =========================
   Merge: particiones intermedias -> segmento final
   ========================= */

async fn merge(
    descriptor: &SubTaskDescriptor,
    interval: &Interval,
    bucket_id: u32,
    locations: &[PartitionLocation],
    toolbox: &SubTaskToolbox,
) -> Result<Outcome> {
    let fetch_dir = toolbox
        .task_dir(&descriptor.id)
        .join("fetched")
        .join(interval.path_key())
        .join(bucket_id.to_string());

    let mut rows = Vec::new();
    for location in locations {
        let unzipped = toolbox
            .shuffle
            .fetch(&descriptor.group_id, location, &fetch_dir)
            .await?;
        let file = unzipped.join(ROWS_FILE);
        rows.extend(
            toolbox
                .blocking
                .run(move || Ok(read_rows_jsonl(&file)?))
                .await?,
        );
    }
    debug!(
        task_id = %descriptor.id,
        particiones = locations.len(),
        filas = rows.len(),
        "Particiones intermedias combinadas"
    );

    let rows = rollup(rows);
    let mut segments = Vec::new();
    if !rows.is_empty() {
        let sequence_name = format!("{}_{}_{}", descriptor.group_id, interval, bucket_id);
        let id = toolbox
            .client
            .allocate_segment_for_sequence(interval.start, &sequence_name, None)
            .await?;
        segments.push(write_segment(descriptor, toolbox, id, rows).await?);
    }

    Ok((
        RowIngestionTotals::default(),
        Vec::new(),
        ReportPayload::PushedSegments { segments },
    ))
}

/// Borra el directorio de trabajo de una sub-tarea, si existe.
pub fn remove_task_dir(dir: &Path) {
    if dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            tracing::warn!("No se pudo borrar {}: {e}", dir.display());
        }
    }
}
