//! Runner de tareas de un job.
//!
//! Cada tarea tiene un registro con su estado publicado en un `watch`. El
//! registro se crea en `SUBMITTED` al hacer `submit`; el handle de ejecución se
//! le engancha después, bajo el mismo lock, cuando la tarea consigue un slot.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::{AbortHandle, JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::report::{ReportAck, SubTaskReport};
use common::{IngestError, Result, SegmentId, SpecId, TaskId, TaskKind, TaskState};

/// Máxima profundidad del recorrido compactación -> tarea interna -> supervisor.
const MAX_LOOKUP_DEPTH: usize = 8;

/* --------- Contratos --------- */

/// Unidad de trabajo que ejecuta el runner.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Supervisor (o compactación) al que pertenece la tarea.
    fn group_id(&self) -> &str;

    fn kind(&self) -> TaskKind;

    fn spec_id(&self) -> Option<&str> {
        None
    }

    /// Si devuelve `false` o falla, la tarea termina en `FAILED` sin llegar a `RUNNING`.
    async fn is_ready(&self) -> Result<bool> {
        Ok(true)
    }

    async fn run(&self) -> Result<()>;

    /// Espera el trabajo que el cuerpo dejó fuera de su future (p.ej. en
    /// `spawn_blocking`). Corre siempre, también tras abortar, y antes de los
    /// callbacks de limpieza.
    async fn settle(&self) {}

    /// Superficie RPC, sólo para tareas de tipo supervisor.
    fn endpoint(&self) -> Option<Arc<dyn SupervisorEndpoint>> {
        None
    }

    /// Tarea que la envuelve delega en esta (p.ej. compactación -> supervisor).
    fn current_inner_task(&self) -> Option<TaskId> {
        None
    }
}

/// Lo que un supervisor atiende de sus sub-tareas.
pub trait SupervisorEndpoint: Send + Sync {
    fn supervisor_id(&self) -> &str;

    fn allocate_segment(&self, timestamp: DateTime<Utc>) -> Result<SegmentId>;

    fn allocate_segment_for_sequence(
        &self,
        timestamp: DateTime<Utc>,
        sequence_name: &str,
        previous_segment_id: Option<&str>,
    ) -> Result<SegmentId>;

    fn report(&self, report: SubTaskReport) -> Result<ReportAck>;
}

type Cleanup = Box<dyn FnOnce(&TaskState) + Send>;

struct TaskRecord {
    task: Arc<dyn Task>,
    state_tx: watch::Sender<TaskState>,
    /// Cubre la cancelación antes de que arranque el cuerpo.
    cancel: CancellationToken,
    /// Handle del cuerpo, presente sólo mientras corre.
    abort: Option<AbortHandle>,
    cleanups: Vec<Cleanup>,
    submitted_at: DateTime<Utc>,
}

impl TaskRecord {
    fn state(&self) -> TaskState {
        self.state_tx.borrow().clone()
    }
}

/// Foto del estado de una tarea.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub group_id: TaskId,
    pub kind: TaskKind,
    pub spec_id: Option<SpecId>,
    pub state: TaskState,
    pub submitted_at: DateTime<Utc>,
}

struct RunnerInner {
    name: String,
    slots: Arc<Semaphore>,
    records: Mutex<HashMap<TaskId, TaskRecord>>,
    /// Specs a los que ya se les mató un intento.
    killed_specs: Mutex<HashSet<SpecId>>,
    shutdown: CancellationToken,
}

/// Handle clonable al runner de un job.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl TaskRunner {
    pub fn new(name: impl Into<String>, slots: usize) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                name: name.into(),
                slots: Arc::new(Semaphore::new(slots.max(1))),
                records: Mutex::new(HashMap::new()),
                killed_specs: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Token que se dispara con `shutdown`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /* ---------- submit ---------- */

    /// Registra la tarea en `SUBMITTED` y la encola por un slot.
    /// Un id repetido es un error fatal.
    pub fn submit(&self, task: Arc<dyn Task>) -> Result<()> {
        let id = task.id().to_string();
        let cancel = {
            let mut records = self.inner.lock_records()?;
            if records.contains_key(&id) {
                return Err(IngestError::DuplicateTaskId(id));
            }
            let (state_tx, _) = watch::channel(TaskState::Submitted);
            let cancel = self.inner.shutdown.child_token();
            records.insert(
                id.clone(),
                TaskRecord {
                    task: task.clone(),
                    state_tx,
                    cancel: cancel.clone(),
                    abort: None,
                    cleanups: Vec::new(),
                    submitted_at: Utc::now(),
                },
            );
            cancel
        };

        debug!(runner = %self.inner.name, task_id = %id, tipo = %task.kind(), "Tarea encolada");
        tokio::spawn(drive(self.inner.clone(), task, cancel));
        Ok(())
    }

    /* ---------- consultas ---------- */

    pub fn status(&self, task_id: &str) -> Option<TaskState> {
        self.inner
            .lock_records()
            .ok()?
            .get(task_id)
            .map(TaskRecord::state)
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let Ok(records) = self.inner.lock_records() else {
            return Vec::new();
        };
        let mut out: Vec<TaskSnapshot> = records
            .iter()
            .map(|(id, record)| TaskSnapshot {
                id: id.clone(),
                group_id: record.task.group_id().to_string(),
                kind: record.task.kind(),
                spec_id: record.task.spec_id().map(str::to_string),
                state: record.state(),
                submitted_at: record.submitted_at,
            })
            .collect();
        out.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Intento no terminal más reciente del spec, si hay.
    pub fn running_task_for_spec(&self, spec_id: &str) -> Option<TaskId> {
        let records = self.inner.lock_records().ok()?;
        records
            .iter()
            .filter(|(_, r)| r.task.spec_id() == Some(spec_id) && !r.state().is_terminal())
            .max_by(|(a_id, a), (b_id, b)| {
                a.submitted_at.cmp(&b.submitted_at).then(a_id.cmp(b_id))
            })
            .map(|(id, _)| id.clone())
    }

    pub fn tasks_of_kind(&self, kind: TaskKind) -> Vec<TaskId> {
        let Ok(records) = self.inner.lock_records() else {
            return Vec::new();
        };
        let mut out: Vec<TaskId> = records
            .iter()
            .filter(|(_, r)| r.task.kind() == kind)
            .map(|(id, _)| id.clone())
            .collect();
        out.sort();
        out
    }

    /// Sub-tareas no terminales de un grupo.
    pub fn active_sub_tasks(&self, group_id: &str) -> Vec<TaskId> {
        let Ok(records) = self.inner.lock_records() else {
            return Vec::new();
        };
        records
            .iter()
            .filter(|(_, r)| {
                r.task.kind().is_sub_task()
                    && r.task.group_id() == group_id
                    && !r.state().is_terminal()
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Resuelve el supervisor que atiende a `task_id`, siguiendo la cadena de
    /// tareas internas de las compactaciones.
    pub fn find_supervisor(&self, task_id: &str) -> Result<Arc<dyn SupervisorEndpoint>> {
        let records = self.inner.lock_records()?;
        let mut current = task_id.to_string();
        for _ in 0..MAX_LOOKUP_DEPTH {
            let record = records
                .get(&current)
                .ok_or_else(|| IngestError::SupervisorNotFound(task_id.to_string()))?;
            match record.task.kind() {
                TaskKind::Supervisor => {
                    return record
                        .task
                        .endpoint()
                        .ok_or_else(|| IngestError::SupervisorNotFound(task_id.to_string()));
                }
                TaskKind::Compaction => match record.task.current_inner_task() {
                    Some(inner) => current = inner,
                    None => return Err(IngestError::SupervisorNotFound(task_id.to_string())),
                },
                other => {
                    return Err(IngestError::NotASupervisor {
                        task_id: current,
                        kind: other.to_string(),
                    })
                }
            }
        }
        Err(IngestError::SupervisorNotFound(task_id.to_string()))
    }

    /* ---------- espera, cancelación y limpieza ---------- */

    /// Espera a que la tarea termine. `CANCELLED` es un resultado normal.
    pub async fn wait(&self, task_id: &str, timeout: Duration) -> Result<TaskState> {
        let mut rx = {
            let records = self.inner.lock_records()?;
            records
                .get(task_id)
                .ok_or_else(|| IngestError::UnknownTask(task_id.to_string()))?
                .state_tx
                .subscribe()
        };
        let outcome = match tokio::time::timeout(timeout, rx.wait_for(TaskState::is_terminal)).await
        {
            Ok(Ok(state)) => Ok(state.clone()),
            Ok(Err(_)) => Err(IngestError::UnknownTask(task_id.to_string())),
            Err(_) => Err(IngestError::Timeout(task_id.to_string())),
        };
        outcome
    }

    /// Cancela la tarea. Devuelve `false` si ya había terminado.
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        let records = self.inner.lock_records()?;
        let record = records
            .get(task_id)
            .ok_or_else(|| IngestError::UnknownTask(task_id.to_string()))?;
        if record.state().is_terminal() {
            return Ok(false);
        }
        record.cancel.cancel();
        if let Some(abort) = &record.abort {
            abort.abort();
        }
        info!(runner = %self.inner.name, task_id, "Cancelando tarea");
        Ok(true)
    }

    /// Registra un callback que corre una sola vez cuando la tarea termina,
    /// sea cual sea el resultado. Si ya terminó, corre en el acto.
    pub fn on_complete<F>(&self, task_id: &str, cleanup: F) -> Result<()>
    where
        F: FnOnce(&TaskState) + Send + 'static,
    {
        let finished = {
            let mut records = self.inner.lock_records()?;
            let record = records
                .get_mut(task_id)
                .ok_or_else(|| IngestError::UnknownTask(task_id.to_string()))?;
            let state = record.state();
            if state.is_terminal() {
                Some(state)
            } else {
                record.cleanups.push(Box::new(cleanup));
                return Ok(());
            }
        };
        if let Some(state) = finished {
            cleanup(&state);
        }
        Ok(())
    }

    /// Registra el spec como ya matado. `false` si ya lo estaba.
    pub fn mark_spec_killed(&self, spec_id: &str) -> bool {
        self.inner
            .killed_specs
            .lock()
            .map(|mut killed| killed.insert(spec_id.to_string()))
            .unwrap_or(false)
    }

    pub fn was_spec_killed(&self, spec_id: &str) -> bool {
        self.inner
            .killed_specs
            .lock()
            .map(|killed| killed.contains(spec_id))
            .unwrap_or(false)
    }

    /// Cancela todo lo que siga vivo y frena los loops de fondo.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Ok(records) = self.inner.lock_records() {
            for record in records.values() {
                if let Some(abort) = &record.abort {
                    abort.abort();
                }
            }
        }
        info!(runner = %self.inner.name, "Runner detenido");
    }
}

impl RunnerInner {
    fn lock_records(&self) -> Result<MutexGuard<'_, HashMap<TaskId, TaskRecord>>> {
        self.records
            .lock()
            .map_err(|_| IngestError::Internal("registro de tareas envenenado".to_string()))
    }

    /// Corre los callbacks de limpieza y después publica el resultado, una
    /// única vez. Un callback registrado mientras tanto también corre antes de
    /// que los que esperan vean el estado terminal.
    fn finish(&self, task_id: &str, outcome: TaskState) {
        loop {
            let cleanups = {
                let Ok(mut records) = self.lock_records() else {
                    return;
                };
                let Some(record) = records.get_mut(task_id) else {
                    return;
                };
                if record.state().is_terminal() {
                    return;
                }
                let cleanups = std::mem::take(&mut record.cleanups);
                if cleanups.is_empty() {
                    record.state_tx.send_replace(outcome.clone());
                    record.abort = None;
                    break;
                }
                cleanups
            };
            for cleanup in cleanups {
                cleanup(&outcome);
            }
        }

        match &outcome {
            TaskState::Failed { message } => {
                warn!(runner = %self.name, task_id, "Tarea FAILED: {message}")
            }
            other => info!(runner = %self.name, task_id, estado = ?other, "Tarea terminada"),
        }
    }
}

/// Ciclo de vida de una tarea: slot -> readiness -> cuerpo -> resultado.
async fn drive(inner: Arc<RunnerInner>, task: Arc<dyn Task>, cancel: CancellationToken) {
    let id = task.id().to_string();

    let permit = tokio::select! {
        permit = inner.slots.clone().acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => {
                inner.finish(&id, TaskState::Failed { message: "el runner está cerrado".to_string() });
                return;
            }
        },
        _ = cancel.cancelled() => {
            inner.finish(&id, TaskState::Cancelled);
            return;
        }
    };

    let ready = tokio::select! {
        ready = task.is_ready() => ready,
        _ = cancel.cancelled() => {
            drop(permit);
            inner.finish(&id, TaskState::Cancelled);
            return;
        }
    };
    let not_ready = match ready {
        Ok(true) => None,
        Ok(false) => Some("la tarea no está lista para correr".to_string()),
        Err(e) => Some(format!("falló el chequeo de readiness: {e}")),
    };
    if let Some(message) = not_ready {
        drop(permit);
        inner.finish(&id, TaskState::Failed { message });
        return;
    }

    let handle = {
        let Ok(mut records) = inner.lock_records() else {
            return;
        };
        let Some(record) = records.get_mut(&id) else {
            return;
        };
        if record.cancel.is_cancelled() {
            drop(records);
            drop(permit);
            inner.finish(&id, TaskState::Cancelled);
            return;
        }
        let body = task.clone();
        let handle = tokio::spawn(async move { body.run().await });
        record.abort = Some(handle.abort_handle());
        record.state_tx.send_replace(TaskState::Running);
        handle
    };
    info!(runner = %inner.name, task_id = %id, tipo = %task.kind(), "Tarea RUNNING");

    let outcome = match handle.await {
        Ok(Ok(())) => TaskState::Succeeded,
        Ok(Err(e)) if e.is_cancelled() => TaskState::Cancelled,
        Ok(Err(e)) => TaskState::Failed {
            message: e.to_string(),
        },
        Err(join) => join_outcome(join),
    };
    task.settle().await;
    // el slot se libera antes de publicar el resultado
    drop(permit);
    inner.finish(&id, outcome);
}

fn join_outcome(join: JoinError) -> TaskState {
    if join.is_cancelled() {
        return TaskState::Cancelled;
    }
    TaskState::Failed {
        message: format!("panic en la tarea: {}", panic_message(join.into_panic())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "sin mensaje".to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Clone, Copy)]
    pub(crate) enum Behavior {
        Succeed,
        Fail,
        Panic,
        Forever,
    }

    pub(crate) struct TestTask {
        pub id: String,
        pub kind: TaskKind,
        pub spec: Option<String>,
        pub ready: bool,
        pub behavior: Behavior,
        pub ran: AtomicBool,
        pub inner: Option<TaskId>,
        /// Lo que tarda `settle`, aun después de abortar el cuerpo.
        pub settle_for: Option<Duration>,
        pub settled: AtomicBool,
    }

    impl TestTask {
        pub fn new(id: &str, behavior: Behavior) -> Self {
            Self {
                id: id.to_string(),
                kind: TaskKind::SinglePhase,
                spec: Some(format!("spec_{id}")),
                ready: true,
                behavior,
                ran: AtomicBool::new(false),
                inner: None,
                settle_for: None,
                settled: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Task for TestTask {
        fn id(&self) -> &str {
            &self.id
        }
        fn group_id(&self) -> &str {
            "grupo"
        }
        fn kind(&self) -> TaskKind {
            self.kind
        }
        fn spec_id(&self) -> Option<&str> {
            self.spec.as_deref()
        }
        async fn is_ready(&self) -> Result<bool> {
            Ok(self.ready)
        }
        async fn run(&self) -> Result<()> {
            self.ran.store(true, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => Err(IngestError::Transient("falló a propósito".into())),
                Behavior::Panic => panic!("boom"),
                Behavior::Forever => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }
        async fn settle(&self) {
            if let Some(delay) = self.settle_for {
                tokio::time::sleep(delay).await;
            }
            self.settled.store(true, Ordering::SeqCst);
        }
        fn current_inner_task(&self) -> Option<TaskId> {
            self.inner.clone()
        }
    }

    pub(crate) async fn wait_until_running(runner: &TaskRunner, id: &str) {
        for _ in 0..1_000 {
            if runner.status(id) == Some(TaskState::Running) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("la tarea {id} nunca llegó a RUNNING");
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn id_duplicado_se_rechaza() {
        let runner = TaskRunner::new("test", 2);
        runner.submit(Arc::new(TestTask::new("t1", Behavior::Succeed))).unwrap();
        let err = runner
            .submit(Arc::new(TestTask::new("t1", Behavior::Succeed)))
            .unwrap_err();
        assert!(matches!(err, IngestError::DuplicateTaskId(id) if id == "t1"));
        assert_eq!(runner.wait("t1", WAIT).await.unwrap(), TaskState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelar_libera_el_slot_para_la_siguiente() {
        let runner = TaskRunner::new("test", 1);
        runner.submit(Arc::new(TestTask::new("larga", Behavior::Forever))).unwrap();
        runner.submit(Arc::new(TestTask::new("encolada", Behavior::Succeed))).unwrap();

        wait_until_running(&runner, "larga").await;
        assert_eq!(runner.status("encolada"), Some(TaskState::Submitted));

        assert!(runner.cancel("larga").unwrap());
        assert_eq!(runner.wait("larga", WAIT).await.unwrap(), TaskState::Cancelled);
        assert_eq!(runner.wait("encolada", WAIT).await.unwrap(), TaskState::Succeeded);
        // cancelar algo terminado no cambia nada
        assert!(!runner.cancel("larga").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelar_antes_de_tener_slot() {
        let runner = TaskRunner::new("test", 1);
        let queued = Arc::new(TestTask::new("encolada", Behavior::Succeed));
        runner.submit(Arc::new(TestTask::new("larga", Behavior::Forever))).unwrap();
        runner.submit(queued.clone()).unwrap();
        wait_until_running(&runner, "larga").await;

        runner.cancel("encolada").unwrap();
        assert_eq!(runner.wait("encolada", WAIT).await.unwrap(), TaskState::Cancelled);
        assert!(!queued.ran.load(Ordering::SeqCst));
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_fallida_va_directo_a_failed() {
        let runner = TaskRunner::new("test", 1);
        let mut task = TestTask::new("no_lista", Behavior::Succeed);
        task.ready = false;
        let task = Arc::new(task);
        runner.submit(task.clone()).unwrap();

        let state = runner.wait("no_lista", WAIT).await.unwrap();
        assert!(matches!(state, TaskState::Failed { .. }));
        assert!(!task.ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn panic_y_error_terminan_en_failed() {
        let runner = TaskRunner::new("test", 2);
        runner.submit(Arc::new(TestTask::new("panic", Behavior::Panic))).unwrap();
        runner.submit(Arc::new(TestTask::new("error", Behavior::Fail))).unwrap();

        match runner.wait("panic", WAIT).await.unwrap() {
            TaskState::Failed { message } => assert!(message.contains("boom"), "{message}"),
            other => panic!("estado inesperado: {other:?}"),
        }
        match runner.wait("error", WAIT).await.unwrap() {
            TaskState::Failed { message } => assert!(message.contains("falló a propósito")),
            other => panic!("estado inesperado: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_corre_exactamente_una_vez() {
        let runner = TaskRunner::new("test", 1);
        let calls = Arc::new(AtomicU32::new(0));
        runner.submit(Arc::new(TestTask::new("t", Behavior::Forever))).unwrap();

        let counter = calls.clone();
        runner
            .on_complete("t", move |state| {
                assert_eq!(*state, TaskState::Cancelled);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        wait_until_running(&runner, "t").await;
        runner.cancel("t").unwrap();
        runner.cancel("t").unwrap();
        runner.wait("t", WAIT).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // registrado después de terminar: corre en el acto, una vez
        let counter = calls.clone();
        runner
            .on_complete("t", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn limpieza_espera_el_trabajo_colgado_de_una_tarea_abortada() {
        let runner = TaskRunner::new("test", 1);
        let mut task = TestTask::new("colgada", Behavior::Forever);
        task.settle_for = Some(Duration::from_millis(200));
        let task = Arc::new(task);
        runner.submit(task.clone()).unwrap();

        let seen = Arc::new(AtomicBool::new(false));
        let (body, saw) = (task.clone(), seen.clone());
        runner
            .on_complete("colgada", move |_| {
                saw.store(body.settled.load(Ordering::SeqCst), Ordering::SeqCst);
            })
            .unwrap();

        wait_until_running(&runner, "colgada").await;
        runner.cancel("colgada").unwrap();
        assert_eq!(runner.wait("colgada", WAIT).await.unwrap(), TaskState::Cancelled);
        assert!(seen.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_con_timeout() {
        let runner = TaskRunner::new("test", 1);
        runner.submit(Arc::new(TestTask::new("t", Behavior::Forever))).unwrap();
        let err = runner.wait("t", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, IngestError::Timeout(_)));
        assert!(matches!(
            runner.wait("nadie", WAIT).await.unwrap_err(),
            IngestError::UnknownTask(_)
        ));
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn intento_vivo_por_spec_y_por_tipo() {
        let runner = TaskRunner::new("test", 2);
        runner.submit(Arc::new(TestTask::new("a", Behavior::Forever))).unwrap();
        runner.submit(Arc::new(TestTask::new("b", Behavior::Succeed))).unwrap();
        runner.wait("b", WAIT).await.unwrap();

        assert_eq!(runner.running_task_for_spec("spec_a"), Some("a".to_string()));
        assert_eq!(runner.running_task_for_spec("spec_b"), None);
        assert_eq!(runner.tasks_of_kind(TaskKind::SinglePhase), vec!["a", "b"]);
        assert_eq!(runner.snapshot().len(), 2);
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn busqueda_de_supervisor_sigue_la_tarea_interna() {
        let runner = TaskRunner::new("test", 4);
        let mut compaction = TestTask::new("compact", Behavior::Forever);
        compaction.kind = TaskKind::Compaction;
        compaction.inner = Some("sub".to_string());
        runner.submit(Arc::new(compaction)).unwrap();
        runner.submit(Arc::new(TestTask::new("sub", Behavior::Forever))).unwrap();

        // la interna no es supervisor
        match runner.find_supervisor("compact") {
            Err(IngestError::NotASupervisor { task_id, .. }) => assert_eq!(task_id, "sub"),
            other => panic!("resultado inesperado: {:?}", other.err()),
        }
        assert!(matches!(
            runner.find_supervisor("desconocida"),
            Err(IngestError::SupervisorNotFound(_))
        ));
        runner.shutdown();
    }
}
