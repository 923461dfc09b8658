//! Supervisor de un job de ingesta.
//!
//! Arma los specs de cada fase, los manda al runner con reintentos por spec y
//! atiende las llamadas de sus sub-tareas (asignación de segmentos y reportes).
//! Sólo los reportes de intentos que terminaron `SUCCEEDED` se suman al reporte
//! del job.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use common::input;
use common::job::{IngestionSpec, PartitionsSpec};
use common::partition_ids::PartitionGeneration;
use common::report::{
    IngestionReport, IngestionState, ReportAck, ReportPayload, SubTaskReport, BUILD_SEGMENTS,
    DETERMINE_PARTITIONS,
};
use common::shuffle::PartitionLocation;
use common::subtask::{remove_task_dir, run_sub_task, SubTaskToolbox};
use common::task::{BucketSpec, SubTaskDescriptor, SubTaskKind, SubTaskSpec};
use common::{
    DataSegment, IngestError, Interval, Result, SegmentId, SpecId, TaskId, TaskKind, TaskState,
};

use crate::allocator::{AllocationPlan, SegmentAllocator};
use crate::job::IngestEnv;
use crate::local_client::LocalSupervisorClient;
use crate::runner::{SupervisorEndpoint, Task, TaskRunner};

/// Margen para que una sub-tarea cancelada por timeout publique su resultado.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    DeterminePartitions,
    PartialSegmentGeneration,
    PartialSegmentMerge,
    SinglePhase,
    Done,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::NotStarted => "notStarted",
            Phase::DeterminePartitions => "partialDimensionCardinality",
            Phase::PartialSegmentGeneration => "partialSegmentGeneration",
            Phase::PartialSegmentMerge => "partialSegmentMerge",
            Phase::SinglePhase => "singlePhase",
            Phase::Done => "done",
        }
    }

    /// Clave bajo la que se suman las estadísticas de la fase.
    fn report_key(self) -> &'static str {
        match self {
            Phase::DeterminePartitions => DETERMINE_PARTITIONS,
            _ => BUILD_SEGMENTS,
        }
    }

    fn allows_allocation(self) -> bool {
        matches!(self, Phase::SinglePhase | Phase::PartialSegmentMerge)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| IngestError::Internal("estado del supervisor envenenado".to_string()))
}

/* ===================== Estado compartido ===================== */

/// Todo lo que comparten el cuerpo del supervisor, sus fases y las llamadas
/// de las sub-tareas.
pub struct SupervisorCore {
    /// Id con el que lo direccionan las sub-tareas (el de la compactación si es interno).
    rpc_id: TaskId,
    spec: IngestionSpec,
    runner: TaskRunner,
    env: IngestEnv,
    generation: PartitionGeneration,
    phase: Mutex<Phase>,
    allocator: Mutex<SegmentAllocator>,
    /// task id -> reporte recibido
    reports: Mutex<HashMap<TaskId, SubTaskReport>>,
    /// spec id -> último intento lanzado; sólo ese puede reportar.
    live_attempts: Mutex<HashMap<SpecId, TaskId>>,
    job_report: Mutex<IngestionReport>,
}

impl SupervisorCore {
    pub fn phase(&self) -> Phase {
        self.phase.lock().map(|p| *p).unwrap_or(Phase::Done)
    }

    pub(crate) fn enter_phase(&self, phase: Phase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
        let state = match phase {
            Phase::DeterminePartitions => Some(IngestionState::DeterminePartitions),
            Phase::PartialSegmentGeneration | Phase::PartialSegmentMerge | Phase::SinglePhase => {
                Some(IngestionState::BuildSegments)
            }
            Phase::NotStarted | Phase::Done => None,
        };
        if let (Some(state), Ok(mut report)) = (state, self.job_report.lock()) {
            report.state = state;
        }
        info!(supervisor = %self.rpc_id, fase = phase.name(), "Entrando en fase");
    }

    fn check_allocation(&self) -> Result<()> {
        let phase = self.phase();
        if phase.allows_allocation() {
            Ok(())
        } else {
            Err(IngestError::AllocationNotSupported {
                supervisor_id: self.rpc_id.clone(),
                phase: phase.name().to_string(),
            })
        }
    }

    fn report_snapshot(&self) -> IngestionReport {
        self.job_report
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|_| IngestionReport::new(&self.rpc_id))
    }

    /* ---------- fases ---------- */

    async fn run_phases(self: &Arc<Self>) -> Result<Vec<DataSegment>> {
        let splits = input::splits(&self.spec.input)?;
        info!(supervisor = %self.rpc_id, splits = splits.len(), "Entrada particionada");

        match &self.spec.tuning.partitions_spec {
            PartitionsSpec::Dynamic { .. } => {
                let specs = splits
                    .into_iter()
                    .enumerate()
                    .map(|(i, split)| SubTaskSpec {
                        id: format!("single_{i}"),
                        kind: SubTaskKind::SinglePhase { split },
                    })
                    .collect();
                let reports = self.run_phase(Phase::SinglePhase, specs).await?;
                Ok(pushed_segments(reports))
            }
            PartitionsSpec::Hashed {
                num_shards,
                partition_dimensions,
                target_rows_per_segment,
            } => {
                let buckets = match num_shards {
                    Some(n) => BucketSpec {
                        partition_dimensions: partition_dimensions.clone(),
                        default_num_shards: Some(*n),
                        by_interval: BTreeMap::new(),
                    },
                    None => {
                        let specs = splits
                            .iter()
                            .enumerate()
                            .map(|(i, split)| SubTaskSpec {
                                id: format!("cardinality_{i}"),
                                kind: SubTaskKind::PartialCardinality {
                                    split: split.clone(),
                                    partition_dimensions: partition_dimensions.clone(),
                                },
                            })
                            .collect();
                        let reports = self.run_phase(Phase::DeterminePartitions, specs).await?;
                        let by_interval = shards_from_cardinality(&reports, *target_rows_per_segment);
                        info!(supervisor = %self.rpc_id, shards = ?by_interval, "Shards por intervalo");
                        BucketSpec {
                            partition_dimensions: partition_dimensions.clone(),
                            default_num_shards: None,
                            by_interval,
                        }
                    }
                };

                let specs = splits
                    .into_iter()
                    .enumerate()
                    .map(|(i, split)| SubTaskSpec {
                        id: format!("generate_{i}"),
                        kind: SubTaskKind::PartialGenerate {
                            split,
                            buckets: buckets.clone(),
                        },
                    })
                    .collect();
                let generated = self.run_phase(Phase::PartialSegmentGeneration, specs).await?;

                let reports = self
                    .run_phase(Phase::PartialSegmentMerge, merge_specs(&generated))
                    .await?;
                Ok(pushed_segments(reports))
            }
        }
    }

    /// Corre todos los specs de una fase con a lo sumo
    /// `max_num_concurrent_sub_tasks` en vuelo. Ante la primera falla
    /// definitiva cancela lo que siga vivo.
    async fn run_phase(
        self: &Arc<Self>,
        phase: Phase,
        specs: Vec<SubTaskSpec>,
    ) -> Result<Vec<SubTaskReport>> {
        self.enter_phase(phase);
        info!(supervisor = %self.rpc_id, fase = phase.name(), specs = specs.len(), "Lanzando specs");

        let limit = Arc::new(Semaphore::new(
            self.spec.tuning.max_num_concurrent_sub_tasks.max(1),
        ));
        let mut set = JoinSet::new();
        for spec in specs {
            let this = self.clone();
            let limit = limit.clone();
            set.spawn(async move {
                let _permit = limit
                    .acquire_owned()
                    .await
                    .map_err(|_| IngestError::Internal("semáforo de fase cerrado".to_string()))?;
                this.run_spec(phase, spec).await
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(IngestError::Internal(format!("el seguimiento de un spec terminó mal: {e}")))
            });
            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(supervisor = %self.rpc_id, fase = phase.name(), "Fase fallida: {e}");
                    set.abort_all();
                    self.cancel_live_sub_tasks();
                    return Err(e);
                }
            }
        }
        reports.sort_by(|a, b| a.spec_id.cmp(&b.spec_id));
        Ok(reports)
    }

    fn cancel_live_sub_tasks(&self) {
        for task_id in self.runner.active_sub_tasks(&self.rpc_id) {
            if let Err(e) = self.runner.cancel(&task_id) {
                warn!(task_id = %task_id, "No se pudo cancelar la sub-tarea: {e}");
            }
        }
    }

    /// Intentos de un spec hasta `max_num_retries + 1`. Cada intento es una
    /// tarea nueva con su propio id.
    async fn run_spec(self: Arc<Self>, phase: Phase, spec: SubTaskSpec) -> Result<SubTaskReport> {
        let max_attempts = self.spec.tuning.max_num_retries + 1;
        let timeout = self.spec.tuning.sub_task_timeout;
        let mut last_task = TaskId::new();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let descriptor = self.descriptor(&spec, attempt);
            let task_id = descriptor.id.clone();
            let work_dir = self.env.work_dir.join(&task_id);

            self.mark_live(&spec.id, &task_id)?;
            self.runner.submit(Arc::new(self.sub_task(descriptor)))?;
            self.runner
                .on_complete(&task_id, move |_| remove_task_dir(&work_dir))?;

            let state = self.await_attempt(&task_id, timeout).await?;

            last_error = match state {
                TaskState::Succeeded => match self.reported(&task_id)? {
                    Some(report) => {
                        lock(&self.job_report)?.accumulate(
                            phase.report_key(),
                            &report,
                            self.spec.tuning.max_saved_parse_exceptions,
                        );
                        debug!(task_id = %task_id, spec_id = %spec.id, "Spec resuelto");
                        return Ok(report);
                    }
                    None => "terminó sin reportar".to_string(),
                },
                TaskState::Failed { message } => message,
                TaskState::Cancelled => "la sub-tarea fue cancelada".to_string(),
                other => format!("estado inesperado {other:?}"),
            };
            last_task = task_id;

            if attempt < max_attempts {
                warn!(
                    spec_id = %spec.id,
                    task_id = %last_task,
                    intento = attempt,
                    "Intento fallido, se reintenta: {last_error}"
                );
            }
        }

        Err(IngestError::SubTaskFailed {
            spec_id: spec.id,
            task_id: last_task,
            message: last_error,
        })
    }

    /// Espera el resultado de un intento. Si vence `timeout` lo cancela y
    /// espera a que termine de verdad: nunca quedan dos intentos del mismo spec
    /// corriendo a la vez.
    async fn await_attempt(&self, task_id: &str, timeout: Duration) -> Result<TaskState> {
        match self.runner.wait(task_id, timeout).await {
            Err(IngestError::Timeout(_)) => {}
            other => return other,
        }
        warn!(task_id, "Timeout de la sub-tarea, cancelando");
        self.runner.cancel(task_id)?;
        match self.runner.wait(task_id, CANCEL_GRACE).await {
            Ok(TaskState::Cancelled) => Ok(TaskState::Failed {
                message: format!("timeout tras {}s", timeout.as_secs()),
            }),
            // terminó justo en el límite: su resultado vale
            Ok(state) => Ok(state),
            Err(IngestError::Timeout(_)) => {
                error!(task_id, "La sub-tarea no respondió a la cancelación");
                Err(IngestError::Timeout(task_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn mark_live(&self, spec_id: &str, task_id: &str) -> Result<()> {
        lock(&self.live_attempts)?.insert(spec_id.to_string(), task_id.to_string());
        Ok(())
    }

    fn descriptor(&self, spec: &SubTaskSpec, attempt: u32) -> SubTaskDescriptor {
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!(
            "{}_{}_{}_{}_{}",
            spec.kind.task_kind().as_str(),
            self.spec.datasource,
            spec.id,
            attempt,
            suffix.get(..8).unwrap_or(suffix.as_str())
        );
        SubTaskDescriptor {
            id,
            group_id: self.rpc_id.clone(),
            spec: spec.clone(),
            attempt,
            datasource: self.spec.datasource.clone(),
            schema: self.spec.schema.clone(),
            granularity: self.spec.granularity.clone(),
            tuning: self.spec.tuning.clone(),
            context: Default::default(),
        }
    }

    fn sub_task(&self, descriptor: SubTaskDescriptor) -> SubTask {
        let client = LocalSupervisorClient::new(
            self.runner.clone(),
            &self.rpc_id,
            self.env.client.clone(),
        );
        SubTask {
            descriptor,
            toolbox: SubTaskToolbox::new(
                Arc::new(client),
                self.env.store.clone(),
                self.env.work_dir.clone(),
                self.env.segment_dir.clone(),
            ),
        }
    }

    fn reported(&self, task_id: &str) -> Result<Option<SubTaskReport>> {
        Ok(lock(&self.reports)?.get(task_id).cloned())
    }

    /* ---------- publicación ---------- */

    fn publish(&self, mut segments: Vec<DataSegment>) -> Result<Vec<DataSegment>> {
        if self.generation == PartitionGeneration::NonRoot {
            let mut per_interval: HashMap<Interval, i16> = HashMap::new();
            for segment in &segments {
                *per_interval.entry(segment.id.interval).or_default() += 1;
            }
            for segment in &mut segments {
                segment.id.atomic_update_group_size =
                    per_interval.get(&segment.id.interval).copied().unwrap_or(1);
            }
        }
        segments.sort_by(|a, b| {
            (a.id.interval, a.id.partition_num).cmp(&(b.id.interval, b.id.partition_num))
        });

        self.env.catalog.publish(&segments)?;
        info!(supervisor = %self.rpc_id, segmentos = segments.len(), "Segmentos publicados");
        Ok(segments)
    }
}

impl SupervisorEndpoint for SupervisorCore {
    fn supervisor_id(&self) -> &str {
        &self.rpc_id
    }

    fn allocate_segment(&self, timestamp: DateTime<Utc>) -> Result<SegmentId> {
        self.check_allocation()?;
        lock(&self.allocator)?.allocate(timestamp)
    }

    fn allocate_segment_for_sequence(
        &self,
        timestamp: DateTime<Utc>,
        sequence_name: &str,
        previous_segment_id: Option<&str>,
    ) -> Result<SegmentId> {
        self.check_allocation()?;
        lock(&self.allocator)?.allocate_for_sequence(timestamp, sequence_name, previous_segment_id)
    }

    fn report(&self, report: SubTaskReport) -> Result<ReportAck> {
        let mut reports = lock(&self.reports)?;
        if let Some(existing) = reports.get(&report.task_id) {
            return if *existing == report {
                debug!(task_id = %report.task_id, "Reporte duplicado, ya contado");
                Ok(ReportAck::Duplicate)
            } else {
                Err(IngestError::ConflictingReport {
                    task_id: report.task_id,
                })
            };
        }

        let Some(state) = self.runner.status(&report.task_id) else {
            warn!(task_id = %report.task_id, "Reporte de una tarea desconocida");
            return Err(IngestError::UnknownTask(report.task_id));
        };
        let is_live = lock(&self.live_attempts)?
            .get(&report.spec_id)
            .is_some_and(|live| *live == report.task_id);
        if !is_live || state.is_terminal() {
            warn!(
                task_id = %report.task_id,
                spec_id = %report.spec_id,
                "Reporte de un intento que ya no es el vivo, se ignora"
            );
            return Ok(ReportAck::Stale);
        }

        debug!(
            task_id = %report.task_id,
            tipo = report.payload.type_name(),
            "Reporte recibido"
        );
        reports.insert(report.task_id.clone(), report);
        Ok(ReportAck::Accepted)
    }
}

/* ===================== Tarea supervisor ===================== */

pub struct SupervisorTask {
    id: TaskId,
    core: Arc<SupervisorCore>,
}

impl SupervisorTask {
    /// `rpc_id` es el id con el que lo buscan sus sub-tareas: el propio `id`,
    /// o el de la compactación que lo envuelve.
    pub fn new(
        id: &str,
        rpc_id: &str,
        spec: IngestionSpec,
        plan: AllocationPlan,
        runner: TaskRunner,
        env: IngestEnv,
    ) -> Self {
        let generation = plan.generation;
        let allocator = SegmentAllocator::new(
            &spec.datasource,
            spec.granularity.segment_granularity,
            plan,
        );
        Self {
            id: id.to_string(),
            core: Arc::new(SupervisorCore {
                rpc_id: rpc_id.to_string(),
                spec,
                runner,
                env,
                generation,
                phase: Mutex::new(Phase::NotStarted),
                allocator: Mutex::new(allocator),
                reports: Mutex::new(HashMap::new()),
                live_attempts: Mutex::new(HashMap::new()),
                job_report: Mutex::new(IngestionReport::new(rpc_id)),
            }),
        }
    }

    pub fn core(&self) -> &Arc<SupervisorCore> {
        &self.core
    }

    /// Reporte del job tal como está ahora.
    pub fn report(&self) -> IngestionReport {
        self.core.report_snapshot()
    }
}

#[async_trait]
impl Task for SupervisorTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn group_id(&self) -> &str {
        &self.core.rpc_id
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Supervisor
    }

    async fn is_ready(&self) -> Result<bool> {
        self.core.spec.validate()?;
        Ok(true)
    }

    async fn run(&self) -> Result<()> {
        let core = &self.core;
        info!(supervisor = %core.rpc_id, datasource = %core.spec.datasource, "Supervisor arrancando");

        let outcome = match core.run_phases().await {
            Ok(segments) => core.publish(segments),
            Err(e) => Err(e),
        };
        core.enter_phase(Phase::Done);

        let mut report = lock(&core.job_report)?;
        match outcome {
            Ok(segments) => {
                report.state = IngestionState::Completed;
                report.segments = segments;
                info!(supervisor = %core.rpc_id, "Supervisor terminado");
                Ok(())
            }
            Err(e) => {
                report.state = IngestionState::Failed;
                report.error_msg = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn endpoint(&self) -> Option<Arc<dyn SupervisorEndpoint>> {
        Some(self.core.clone())
    }
}

/* ===================== Sub-tarea en el runner ===================== */

/// Un intento de un spec corriendo en proceso.
struct SubTask {
    descriptor: SubTaskDescriptor,
    toolbox: SubTaskToolbox,
}

#[async_trait]
impl Task for SubTask {
    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn group_id(&self) -> &str {
        &self.descriptor.group_id
    }

    fn kind(&self) -> TaskKind {
        self.descriptor.kind()
    }

    fn spec_id(&self) -> Option<&str> {
        Some(&self.descriptor.spec.id)
    }

    async fn run(&self) -> Result<()> {
        let ack = run_sub_task(&self.descriptor, &self.toolbox).await?;
        debug!(task_id = %self.descriptor.id, ack = ?ack, "Sub-tarea terminada");
        Ok(())
    }

    async fn settle(&self) {
        self.toolbox.blocking.drain().await;
    }
}

/* ===================== Helpers de fases ===================== */

fn pushed_segments(reports: Vec<SubTaskReport>) -> Vec<DataSegment> {
    reports
        .into_iter()
        .flat_map(|r| match r.payload {
            ReportPayload::PushedSegments { segments } => segments,
            _ => Vec::new(),
        })
        .collect()
}

/// Une los hashes de todas las sub-tareas y calcula
/// `ceil(cardinalidad / target)` shards por intervalo (mínimo 1).
fn shards_from_cardinality(
    reports: &[SubTaskReport],
    target_rows_per_segment: u64,
) -> BTreeMap<Interval, u32> {
    let mut union: BTreeMap<Interval, HashSet<u64>> = BTreeMap::new();
    for report in reports {
        if let ReportPayload::DimensionCardinality {
            key_hashes_by_interval,
        } = &report.payload
        {
            for (interval, hashes) in key_hashes_by_interval {
                union.entry(*interval).or_default().extend(hashes);
            }
        }
    }

    let target = target_rows_per_segment.max(1);
    union
        .into_iter()
        .map(|(interval, keys)| {
            let shards = (keys.len() as u64).div_ceil(target).max(1);
            (interval, u32::try_from(shards).unwrap_or(u32::MAX))
        })
        .collect()
}

/// Un spec de merge por cada (intervalo, bucket) que produjo el generate.
fn merge_specs(reports: &[SubTaskReport]) -> Vec<SubTaskSpec> {
    let mut by_key: BTreeMap<(Interval, u32), Vec<PartitionLocation>> = BTreeMap::new();
    for report in reports {
        if let ReportPayload::GeneratedPartitions { locations } = &report.payload {
            for location in locations {
                by_key
                    .entry((location.interval, location.bucket_id))
                    .or_default()
                    .push(location.clone());
            }
        }
    }

    by_key
        .into_iter()
        .map(|((interval, bucket_id), locations)| SubTaskSpec {
            id: format!("merge_{}_{bucket_id}", interval.path_key()),
            kind: SubTaskKind::PartialMerge {
                interval,
                bucket_id,
                locations,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::{wait_until_running, Behavior, TestTask};
    use common::report::RowIngestionTotals;

    fn interval(raw: &str) -> Interval {
        raw.parse().unwrap()
    }

    fn report(task: &str, spec: &str, payload: ReportPayload) -> SubTaskReport {
        SubTaskReport {
            task_id: task.into(),
            spec_id: spec.into(),
            row_stats: RowIngestionTotals {
                processed: 1,
                ..Default::default()
            },
            parse_exceptions: vec![],
            payload,
        }
    }

    fn spec() -> IngestionSpec {
        serde_json::from_value(serde_json::json!({
            "datasource": "wiki",
            "schema": {
                "columns": ["ts", "dim"],
                "timestamp": {"column": "ts"},
                "dimensions": ["dim"]
            },
            "input": {"type": "inline", "data": "2020-01-01,a"}
        }))
        .unwrap()
    }

    fn supervisor(runner: &TaskRunner, root: &std::path::Path) -> SupervisorTask {
        SupervisorTask::new(
            "sup",
            "sup",
            spec(),
            AllocationPlan::time_chunk("v1"),
            runner.clone(),
            IngestEnv::local(root),
        )
    }

    #[test]
    fn shards_por_cardinalidad() {
        let day1 = interval("2020-01-01/P1D");
        let day2 = interval("2020-01-02/P1D");
        let reports = vec![
            report(
                "a",
                "cardinality_0",
                ReportPayload::DimensionCardinality {
                    key_hashes_by_interval: BTreeMap::from([(day1, vec![1, 2, 3]), (day2, vec![9])]),
                },
            ),
            report(
                "b",
                "cardinality_1",
                ReportPayload::DimensionCardinality {
                    key_hashes_by_interval: BTreeMap::from([(day1, vec![3, 4, 5])]),
                },
            ),
        ];
        let shards = shards_from_cardinality(&reports, 2);
        // 5 claves distintas / 2 -> 3
        assert_eq!(shards[&day1], 3);
        assert_eq!(shards[&day2], 1);
    }

    #[test]
    fn merge_agrupa_por_intervalo_y_bucket() {
        let day = interval("2020-01-01/P1D");
        let loc = |sub: &str, bucket| PartitionLocation {
            sub_task_id: sub.into(),
            interval: day,
            bucket_id: bucket,
        };
        let reports = vec![
            report(
                "a",
                "generate_0",
                ReportPayload::GeneratedPartitions {
                    locations: vec![loc("a", 0), loc("a", 1)],
                },
            ),
            report(
                "b",
                "generate_1",
                ReportPayload::GeneratedPartitions {
                    locations: vec![loc("b", 1)],
                },
            ),
        ];
        let specs = merge_specs(&reports);
        assert_eq!(specs.len(), 2);
        match &specs[1].kind {
            SubTaskKind::PartialMerge {
                bucket_id,
                locations,
                ..
            } => {
                assert_eq!(*bucket_id, 1);
                assert_eq!(locations.len(), 2);
            }
            other => panic!("spec inesperado: {other:?}"),
        }
        assert!(specs[0].id.starts_with("merge_20200101T000000.000Z"));
    }

    #[tokio::test(start_paused = true)]
    async fn reporte_exactamente_una_vez_y_conflicto() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TaskRunner::new("test", 4);
        let sup = supervisor(&runner, dir.path());
        let endpoint = sup.core().clone();

        // intento vivo del spec "spec_vivo"
        endpoint.mark_live("spec_vivo", "vivo").unwrap();
        runner
            .submit(Arc::new(TestTask::new("vivo", Behavior::Forever)))
            .unwrap();
        wait_until_running(&runner, "vivo").await;

        let first = report("vivo", "spec_vivo", ReportPayload::PushedSegments { segments: vec![] });
        assert_eq!(endpoint.report(first.clone()).unwrap(), ReportAck::Accepted);
        assert_eq!(endpoint.report(first.clone()).unwrap(), ReportAck::Duplicate);

        let mut different = first;
        different.row_stats.processed = 7;
        assert!(matches!(
            endpoint.report(different),
            Err(IngestError::ConflictingReport { .. })
        ));
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn reporte_de_intento_viejo_se_ignora() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TaskRunner::new("test", 4);
        let sup = supervisor(&runner, dir.path());
        let endpoint = sup.core().clone();

        endpoint.mark_live("spec_viejo", "viejo").unwrap();
        runner
            .submit(Arc::new(TestTask::new("viejo", Behavior::Forever)))
            .unwrap();
        wait_until_running(&runner, "viejo").await;
        runner.cancel("viejo").unwrap();
        runner.wait("viejo", Duration::from_secs(1)).await.unwrap();

        let stale = report("viejo", "spec_viejo", ReportPayload::PushedSegments { segments: vec![] });
        assert_eq!(endpoint.report(stale).unwrap(), ReportAck::Stale);
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn reporte_de_tarea_desconocida_se_rechaza() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TaskRunner::new("test", 1);
        let sup = supervisor(&runner, dir.path());
        let endpoint = sup.core().clone();

        let external = report("externa", "spec_x", ReportPayload::PushedSegments { segments: vec![] });
        assert!(matches!(
            endpoint.report(external),
            Err(IngestError::UnknownTask(id)) if id == "externa"
        ));
        // nada quedó guardado para sumar
        assert_eq!(endpoint.reported("externa").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn solo_reporta_el_ultimo_intento_del_spec() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TaskRunner::new("test", 4);
        let sup = supervisor(&runner, dir.path());
        let endpoint = sup.core().clone();

        // dos intentos del mismo spec todavía corriendo
        for id in ["intento_1", "intento_2"] {
            let mut task = TestTask::new(id, Behavior::Forever);
            task.spec = Some("spec_x".to_string());
            endpoint.mark_live("spec_x", id).unwrap();
            runner.submit(Arc::new(task)).unwrap();
            wait_until_running(&runner, id).await;
        }

        let payload = || ReportPayload::PushedSegments { segments: vec![] };
        assert_eq!(
            endpoint.report(report("intento_1", "spec_x", payload())).unwrap(),
            ReportAck::Stale
        );
        assert_eq!(
            endpoint.report(report("intento_2", "spec_x", payload())).unwrap(),
            ReportAck::Accepted
        );
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn intento_que_termina_en_el_limite_cuenta() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TaskRunner::new("test", 1);
        let sup = supervisor(&runner, dir.path());

        // el cuerpo ya terminó bien, pero el cierre se come el timeout
        let mut task = TestTask::new("justo", Behavior::Succeed);
        task.settle_for = Some(Duration::from_millis(200));
        runner.submit(Arc::new(task)).unwrap();

        let state = sup
            .core()
            .await_attempt("justo", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(state, TaskState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn intento_que_no_termina_tras_cancelar_no_se_reintenta_encima() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TaskRunner::new("test", 1);
        let sup = supervisor(&runner, dir.path());

        let mut task = TestTask::new("lenta", Behavior::Forever);
        task.settle_for = Some(CANCEL_GRACE * 2);
        runner.submit(Arc::new(task)).unwrap();

        let err = sup
            .core()
            .await_attempt("lenta", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Timeout(id) if id == "lenta"));
        // sigue ocupando su slot: el spec no lanza otro intento
        assert_eq!(runner.status("lenta"), Some(TaskState::Running));
        runner.shutdown();
    }

    #[test]
    fn asignacion_solo_en_fases_que_publican() {
        let dir = tempfile::tempdir().unwrap();
        let runner = TaskRunner::new("test", 1);
        let sup = supervisor(&runner, dir.path());
        let core = sup.core();
        let ts = common::segment::parse_instant("2020-01-01").unwrap();

        assert!(matches!(
            core.allocate_segment(ts),
            Err(IngestError::AllocationNotSupported { .. })
        ));
        core.enter_phase(Phase::PartialSegmentGeneration);
        assert!(core.allocate_segment_for_sequence(ts, "seq", None).is_err());

        core.enter_phase(Phase::PartialSegmentMerge);
        let id = core.allocate_segment_for_sequence(ts, "seq", None).unwrap();
        assert_eq!(id, core.allocate_segment_for_sequence(ts, "seq", None).unwrap());
        assert_eq!(sup.report().state, IngestionState::BuildSegments);
    }
}
