//! Espacio de partition ids.
//!
//! Los segmentos de generación raíz usan `[0, 32768)`. Los de generación no raíz
//! (los que salen de un lock por segmento, p.ej. una compactación) usan
//! `[32768, 65536)`. Los rangos no se solapan, así que ambos conviven en el mismo
//! intervalo.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

pub const ROOT_GEN_START_PARTITION_ID: u32 = 0;
/// Exclusivo.
pub const ROOT_GEN_END_PARTITION_ID: u32 = 32_768;
pub const NON_ROOT_GEN_START_PARTITION_ID: u32 = 32_768;
/// Exclusivo.
pub const NON_ROOT_GEN_END_PARTITION_ID: u32 = 65_536;

pub const UNKNOWN_ATOMIC_UPDATE_GROUP_SIZE: i16 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionGeneration {
    Root,
    NonRoot,
}

impl PartitionGeneration {
    pub fn range(self) -> Range<u32> {
        match self {
            PartitionGeneration::Root => ROOT_GEN_START_PARTITION_ID..ROOT_GEN_END_PARTITION_ID,
            PartitionGeneration::NonRoot => {
                NON_ROOT_GEN_START_PARTITION_ID..NON_ROOT_GEN_END_PARTITION_ID
            }
        }
    }

    pub fn first_id(self) -> u32 {
        self.range().start
    }
}

pub fn is_root_generation(id: i64) -> bool {
    (ROOT_GEN_START_PARTITION_ID as i64..ROOT_GEN_END_PARTITION_ID as i64).contains(&id)
}

pub fn is_non_root_generation(id: i64) -> bool {
    (NON_ROOT_GEN_START_PARTITION_ID as i64..NON_ROOT_GEN_END_PARTITION_ID as i64).contains(&id)
}

/// Clasifica un id. Fuera de `[0, 65536)` es un error de programación.
pub fn classify(id: i64) -> Result<PartitionGeneration> {
    if is_root_generation(id) {
        Ok(PartitionGeneration::Root)
    } else if is_non_root_generation(id) {
        Ok(PartitionGeneration::NonRoot)
    } else {
        Err(IngestError::PartitionIdOutOfRange(id))
    }
}

/// Siguiente id libre de una generación dado el último usado en ella.
///
/// Falla si `last` no pertenece a la generación o si la generación está llena.
pub fn next_in_generation(generation: PartitionGeneration, last: Option<u32>) -> Result<u32> {
    let range = generation.range();
    let next = match last {
        None => range.start,
        Some(last) => {
            if classify(last as i64)? != generation {
                return Err(IngestError::PartitionIdOutOfRange(last as i64));
            }
            last + 1
        }
    };
    if range.contains(&next) {
        Ok(next)
    } else {
        Err(IngestError::PartitionIdOutOfRange(next as i64))
    }
}
