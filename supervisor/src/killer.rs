//! Inyección de fallas: mata sub-tareas en ejecución para simular workers caídos.

use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use common::TaskState;

use crate::runner::TaskRunner;

pub const DEFAULT_KILL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct KillerConfig {
    /// Probabilidad de matar cada sub-tarea candidata en cada tick.
    pub rate: f64,
    pub interval: Duration,
}

impl KillerConfig {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            interval: DEFAULT_KILL_INTERVAL,
        }
    }
}

pub struct TaskKiller {
    runner: TaskRunner,
    config: KillerConfig,
}

impl TaskKiller {
    pub fn new(runner: TaskRunner, config: KillerConfig) -> Self {
        Self { runner, config }
    }

    /// Arranca el loop de fondo; termina con el `shutdown` del runner.
    pub fn spawn(self) -> JoinHandle<()> {
        let shutdown = self.runner.shutdown_token();
        tokio::spawn(async move {
            debug!(runner = self.runner.name(), rate = self.config.rate, "Killer de tareas activo");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.interval) => {}
                    _ = shutdown.cancelled() => break,
                }
                self.tick();
            }
        })
    }

    /// Una pasada: cada sub-tarea en `RUNNING` cuyo spec nunca fue matado puede
    /// morir con probabilidad `rate`. Devuelve cuántas mató.
    pub fn tick(&self) -> usize {
        let mut killed = 0;
        for snapshot in self.runner.snapshot() {
            if !snapshot.kind.is_sub_task() || snapshot.state != TaskState::Running {
                continue;
            }
            let Some(spec_id) = snapshot.spec_id else {
                continue;
            };
            if self.runner.was_spec_killed(&spec_id) {
                continue;
            }
            if !rand::thread_rng().gen_bool(self.config.rate.clamp(0.0, 1.0)) {
                continue;
            }
            if !self.runner.mark_spec_killed(&spec_id) {
                continue;
            }
            warn!(task_id = %snapshot.id, spec_id = %spec_id, "Matando sub-tarea (falla inyectada)");
            if let Ok(true) = self.runner.cancel(&snapshot.id) {
                killed += 1;
            }
        }
        killed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::{wait_until_running, Behavior, TestTask};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn mata_a_lo_sumo_una_vez_por_spec() {
        let runner = TaskRunner::new("test", 4);
        let killer = TaskKiller::new(runner.clone(), KillerConfig::new(1.0));

        let first = TestTask::new("intento_1", Behavior::Forever);
        runner.submit(Arc::new(first)).unwrap();
        wait_until_running(&runner, "intento_1").await;
        assert_eq!(killer.tick(), 1);
        assert_eq!(
            runner.wait("intento_1", Duration::from_secs(1)).await.unwrap(),
            TaskState::Cancelled
        );

        // segundo intento del mismo spec: no se vuelve a matar
        let mut second = TestTask::new("intento_2", Behavior::Forever);
        second.spec = Some("spec_intento_1".to_string());
        runner.submit(Arc::new(second)).unwrap();
        wait_until_running(&runner, "intento_2").await;
        assert_eq!(killer.tick(), 0);
        assert_eq!(runner.status("intento_2"), Some(TaskState::Running));
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn no_toca_supervisores_ni_con_rate_cero() {
        let runner = TaskRunner::new("test", 4);
        let mut supervisor = TestTask::new("sup", Behavior::Forever);
        supervisor.kind = common::TaskKind::Supervisor;
        runner.submit(Arc::new(supervisor)).unwrap();
        runner.submit(Arc::new(TestTask::new("sub", Behavior::Forever))).unwrap();
        wait_until_running(&runner, "sup").await;
        wait_until_running(&runner, "sub").await;

        assert_eq!(TaskKiller::new(runner.clone(), KillerConfig::new(0.0)).tick(), 0);
        assert_eq!(TaskKiller::new(runner.clone(), KillerConfig::new(1.0)).tick(), 1);
        assert_eq!(runner.status("sup"), Some(TaskState::Running));
        runner.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn el_loop_termina_con_el_shutdown() {
        let runner = TaskRunner::new("test", 1);
        let handle = TaskKiller::new(runner.clone(), KillerConfig::new(0.5)).spawn();
        tokio::time::sleep(Duration::from_millis(350)).await;
        runner.shutdown();
        handle.await.unwrap();
    }
}
