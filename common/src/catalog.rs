//! Borde con el catálogo de metadatos de segmentos.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::info;

use crate::error::{IngestError, Result};
use crate::segment::{DataSegment, Interval, SegmentId};

pub trait SegmentCatalog: Send + Sync {
    /// Segmentos en uso del datasource que se solapan con alguno de `intervals`.
    fn fetch_used_segments(
        &self,
        datasource: &str,
        intervals: &[Interval],
    ) -> Result<Vec<DataSegment>>;

    fn fetch_segment(
        &self,
        datasource: &str,
        id: &SegmentId,
        include_unused: bool,
    ) -> Result<Option<DataSegment>>;

    fn publish(&self, segments: &[DataSegment]) -> Result<()>;

    fn mark_unused(&self, ids: &[SegmentId]) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    segment: DataSegment,
    used: bool,
}

/// Catálogo en memoria, indexado por el id textual del segmento.
#[derive(Debug, Default)]
pub struct InMemorySegmentCatalog {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl InMemorySegmentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| IngestError::Internal("catálogo de segmentos envenenado".into()))
    }
}

impl SegmentCatalog for InMemorySegmentCatalog {
    fn fetch_used_segments(
        &self,
        datasource: &str,
        intervals: &[Interval],
    ) -> Result<Vec<DataSegment>> {
        let entries = self.lock()?;
        Ok(entries
            .values()
            .filter(|e| e.used && e.segment.id.datasource == datasource)
            .filter(|e| intervals.is_empty() || intervals.iter().any(|i| i.overlaps(&e.segment.id.interval)))
            .map(|e| e.segment.clone())
            .collect())
    }

    fn fetch_segment(
        &self,
        datasource: &str,
        id: &SegmentId,
        include_unused: bool,
    ) -> Result<Option<DataSegment>> {
        if id.datasource != datasource {
            return Ok(None);
        }
        let entries = self.lock()?;
        Ok(entries
            .get(&id.to_string())
            .filter(|e| e.used || include_unused)
            .map(|e| e.segment.clone()))
    }

    fn publish(&self, segments: &[DataSegment]) -> Result<()> {
        let mut entries = self.lock()?;
        for segment in segments {
            entries.insert(
                segment.id.to_string(),
                Entry {
                    segment: segment.clone(),
                    used: true,
                },
            );
        }
        info!(segmentos = segments.len(), "Segmentos publicados en el catálogo");
        Ok(())
    }

    fn mark_unused(&self, ids: &[SegmentId]) -> Result<()> {
        let mut entries = self.lock()?;
        for id in ids {
            if let Some(entry) = entries.get_mut(&id.to_string()) {
                entry.used = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(ds: &str, interval: &str, partition: u32) -> DataSegment {
        DataSegment {
            id: SegmentId::new(ds, interval.parse().unwrap(), "v1", partition),
            num_rows: 1,
            dimensions: vec![],
            metrics: vec![],
            path: String::new(),
        }
    }

    #[test]
    fn filtra_por_datasource_intervalo_y_uso() {
        let catalog = InMemorySegmentCatalog::new();
        let a0 = segment("wiki", "2020-01-01/P1D", 0);
        let a1 = segment("wiki", "2020-01-01/P1D", 1);
        let b = segment("wiki", "2020-01-02/P1D", 0);
        let other = segment("otro", "2020-01-01/P1D", 0);
        catalog
            .publish(&[a0.clone(), a1.clone(), b.clone(), other])
            .unwrap();

        let day: Interval = "2020-01-01/P1D".parse().unwrap();
        assert_eq!(catalog.fetch_used_segments("wiki", &[day]).unwrap().len(), 2);
        assert_eq!(catalog.fetch_used_segments("wiki", &[]).unwrap().len(), 3);

        catalog.mark_unused(&[a1.id.clone()]).unwrap();
        assert_eq!(catalog.fetch_used_segments("wiki", &[day]).unwrap(), vec![a0]);
        assert!(catalog.fetch_segment("wiki", &a1.id, false).unwrap().is_none());
        assert_eq!(catalog.fetch_segment("wiki", &a1.id, true).unwrap(), Some(a1));
        assert!(catalog.fetch_segment("otro", &b.id, true).unwrap().is_none());
    }
}
