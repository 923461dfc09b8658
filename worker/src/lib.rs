//! Proceso worker: ejecuta una sub-tarea descrita en un archivo JSON y le
//! habla a su supervisor por HTTP.

pub mod http_client;

use std::path::Path;
use std::time::Duration;

use tracing::{error, info, warn};

use common::subtask::{remove_task_dir, run_sub_task, SubTaskToolbox};
use common::task::SubTaskDescriptor;
use common::{IngestError, Result, TaskStatusCode};

pub use http_client::HttpSupervisorClient;

/// Lee el descriptor de la sub-tarea.
pub fn load_descriptor(path: &Path) -> Result<SubTaskDescriptor> {
    let raw = std::fs::read_to_string(path)?;
    let descriptor: SubTaskDescriptor = serde_json::from_str(&raw)?;
    if descriptor.id.trim().is_empty() || descriptor.group_id.trim().is_empty() {
        return Err(IngestError::InvalidSpec(
            "el descriptor necesita id y groupId".to_string(),
        ));
    }
    Ok(descriptor)
}

/// Corre la sub-tarea hasta el final o hasta `timeout`. El directorio de
/// trabajo de la tarea se borra siempre.
pub async fn execute(
    descriptor: &SubTaskDescriptor,
    toolbox: &SubTaskToolbox,
    timeout: Duration,
) -> TaskStatusCode {
    let task_dir = toolbox.task_dir(&descriptor.id);
    let outcome = tokio::time::timeout(timeout, run_sub_task(descriptor, toolbox)).await;
    // lo que quedó en el pool bloqueante podría recrear el directorio
    toolbox.blocking.drain().await;
    remove_task_dir(&task_dir);

    match outcome {
        Ok(Ok(ack)) => {
            info!(task_id = %descriptor.id, ?ack, "Sub-tarea terminada");
            TaskStatusCode::Success
        }
        Ok(Err(e)) if e.is_cancelled() => {
            warn!(task_id = %descriptor.id, "Sub-tarea cancelada: {e}");
            TaskStatusCode::Cancelled
        }
        Ok(Err(e)) => {
            error!(task_id = %descriptor.id, "Sub-tarea fallida: {e}");
            TaskStatusCode::Failed(e.to_string())
        }
        Err(_) => {
            warn!(task_id = %descriptor.id, ?timeout, "Sub-tarea cortada por timeout");
            TaskStatusCode::Cancelled
        }
    }
}

/// Código de salida del proceso.
pub fn exit_code(status: &TaskStatusCode) -> i32 {
    match status {
        TaskStatusCode::Success => 0,
        TaskStatusCode::Failed(_) => 1,
        TaskStatusCode::Cancelled => 2,
    }
}
