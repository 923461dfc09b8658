//! Almacén intermedio del shuffle.
//!
//! Las sub-tareas generate empujan una partición empaquetada (tar.gz) por
//! (supervisor, sub-tarea productora, intervalo, bucket). Las sub-tareas merge
//! la buscan, la copian a su directorio de trabajo y la desempaquetan.
//!
//! Layout: `<root>/<supervisor>/<intervalo>/<bucket>/<sub_task>.tar.gz`.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::blocking::BlockingWork;
use crate::error::{IngestError, Result};
use crate::segment::Interval;
use crate::task::TaskId;

const ARCHIVE_EXT: &str = "tar.gz";

/// Referencia a una partición intermedia.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionLocation {
    pub sub_task_id: TaskId,
    pub interval: Interval,
    pub bucket_id: u32,
}

/* =========================
   Almacén en disco
   ========================= */

#[derive(Debug, Clone)]
pub struct IntermediaryDataStore {
    root: PathBuf,
}

impl IntermediaryDataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, supervisor_id: &str, interval: &Interval, bucket_id: u32) -> PathBuf {
        self.root
            .join(supervisor_id)
            .join(interval.path_key())
            .join(bucket_id.to_string())
    }

    pub fn partition_path(&self, supervisor_id: &str, location: &PartitionLocation) -> PathBuf {
        self.bucket_dir(supervisor_id, &location.interval, location.bucket_id)
            .join(format!("{}.{ARCHIVE_EXT}", location.sub_task_id))
    }

    /// Empaqueta `source_dir` y lo publica bajo la clave de `location`.
    ///
    /// El archivo se escribe en un temporal del mismo directorio y después se
    /// renombra encima de la clave, así un fetch concurrente nunca ve un archivo
    /// a medio escribir.
    pub fn push(
        &self,
        supervisor_id: &str,
        location: &PartitionLocation,
        source_dir: &Path,
    ) -> Result<PathBuf> {
        let dest = self.partition_path(supervisor_id, location);
        let dir = dest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        {
            let encoder = GzEncoder::new(tmp.as_file_mut(), Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.append_dir_all(".", source_dir)?;
            let file = builder.into_inner()?.finish()?;
            file.flush()?;
            file.sync_all()?;
        }
        tmp.persist(&dest).map_err(|e| IngestError::Io(e.error))?;

        debug!(
            supervisor = supervisor_id,
            sub_task = %location.sub_task_id,
            interval = %location.interval,
            bucket = location.bucket_id,
            "Partición publicada en {}",
            dest.display()
        );
        Ok(dest)
    }

    /// Ruta del archivo publicado, o `MissingPartition` si no existe.
    pub fn find(&self, supervisor_id: &str, location: &PartitionLocation) -> Result<PathBuf> {
        let path = self.partition_path(supervisor_id, location);
        if path.is_file() {
            Ok(path)
        } else {
            Err(IngestError::MissingPartition {
                supervisor_id: supervisor_id.to_string(),
                sub_task_id: location.sub_task_id.clone(),
                interval: location.interval,
                bucket_id: location.bucket_id,
            })
        }
    }

    /// Copia la partición a `partition_dir` y la desempaqueta.
    ///
    /// Deja el contenido en `partition_dir/unzipped_<sub_task>` y devuelve esa
    /// ruta. El archivo descargado (`temp_<sub_task>`) se borra siempre; si el
    /// desempaquetado falla también se borra el directorio a medio llenar.
    pub fn fetch(
        &self,
        supervisor_id: &str,
        location: &PartitionLocation,
        partition_dir: &Path,
    ) -> Result<PathBuf> {
        let source = self.find(supervisor_id, location)?;
        fs::create_dir_all(partition_dir)?;

        let downloaded = partition_dir.join(format!("temp_{}", location.sub_task_id));
        let unzipped = partition_dir.join(format!("unzipped_{}", location.sub_task_id));

        let copy = NamedTempFile::new_in(partition_dir)?;
        {
            let mut reader = File::open(&source)?;
            let mut writer = copy.as_file();
            io::copy(&mut reader, &mut writer)?;
            writer.sync_all()?;
        }
        copy.persist(&downloaded).map_err(|e| IngestError::Io(e.error))?;

        let unpacked = unpack(&downloaded, &unzipped);
        if let Err(e) = fs::remove_file(&downloaded) {
            warn!("No se pudo borrar {}: {e}", downloaded.display());
        }
        match unpacked {
            Ok(()) => Ok(unzipped),
            Err(e) => {
                if unzipped.exists() {
                    let _ = fs::remove_dir_all(&unzipped);
                }
                Err(e)
            }
        }
    }

    /// Borra todo lo que empujaron las sub-tareas de un supervisor.
    pub fn delete_partitions(&self, supervisor_id: &str) -> Result<()> {
        let dir = self.root.join(supervisor_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(supervisor = supervisor_id, "Datos de shuffle eliminados");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    archive.unpack(dest)?;
    Ok(())
}

/* =========================
   Cliente de shuffle
   ========================= */

#[async_trait]
pub trait ShuffleClient: Send + Sync {
    async fn push(
        &self,
        supervisor_id: &str,
        location: &PartitionLocation,
        source_dir: &Path,
    ) -> Result<()>;

    /// Devuelve el directorio con el contenido desempaquetado.
    async fn fetch(
        &self,
        supervisor_id: &str,
        location: &PartitionLocation,
        partition_dir: &Path,
    ) -> Result<PathBuf>;
}

/// Cliente sobre un almacén en un filesystem compartido.
#[derive(Debug, Clone)]
pub struct LocalShuffleClient {
    store: Arc<IntermediaryDataStore>,
    blocking: BlockingWork,
}

impl LocalShuffleClient {
    pub fn new(store: Arc<IntermediaryDataStore>) -> Self {
        Self::with_blocking(store, BlockingWork::new())
    }

    /// El empaquetado y el desempaquetado corren dentro de `blocking`.
    pub fn with_blocking(store: Arc<IntermediaryDataStore>, blocking: BlockingWork) -> Self {
        Self { store, blocking }
    }
}

#[async_trait]
impl ShuffleClient for LocalShuffleClient {
    async fn push(
        &self,
        supervisor_id: &str,
        location: &PartitionLocation,
        source_dir: &Path,
    ) -> Result<()> {
        let store = self.store.clone();
        let supervisor_id = supervisor_id.to_string();
        let location = location.clone();
        let source_dir = source_dir.to_path_buf();
        self.blocking
            .run(move || store.push(&supervisor_id, &location, &source_dir))
            .await?;
        Ok(())
    }

    async fn fetch(
        &self,
        supervisor_id: &str,
        location: &PartitionLocation,
        partition_dir: &Path,
    ) -> Result<PathBuf> {
        let store = self.store.clone();
        let supervisor_id = supervisor_id.to_string();
        let location = location.clone();
        let partition_dir = partition_dir.to_path_buf();
        self.blocking
            .run(move || store.fetch(&supervisor_id, &location, &partition_dir))
            .await
    }
}
