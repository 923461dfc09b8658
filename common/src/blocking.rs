//! Trabajo bloqueante de una sub-tarea.
//!
//! Abortar el future de una sub-tarea no corta lo que ya está corriendo en
//! `spawn_blocking`. Todo ese trabajo pasa por un [`BlockingWork`] para que
//! quien limpia el directorio de la tarea pueda esperar a que termine.

use std::io;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Default)]
pub struct BlockingWork {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl BlockingWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Corre `f` en el pool bloqueante. Después de [`drain`](Self::drain) no
    /// arranca nada nuevo.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.cancel.is_cancelled() || self.tracker.is_closed() {
            return Err(IngestError::Cancelled { attempts: 1 });
        }
        self.tracker
            .spawn_blocking(f)
            .await
            .map_err(|e| IngestError::Io(io::Error::other(e.to_string())))?
    }

    /// Corta el trabajo pendiente y espera a que termine el que ya arrancó.
    pub async fn drain(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}
