use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

use crate::input::InputRow;
use crate::segment::{Granularity, Interval};

/* =========================
   Agrupado por intervalo y rollup
   ========================= */

/// Reparte las filas en los intervalos de la granularidad de segmento.
pub fn group_by_interval(
    rows: Vec<InputRow>,
    granularity: Granularity,
) -> BTreeMap<Interval, Vec<InputRow>> {
    let mut out: BTreeMap<Interval, Vec<InputRow>> = BTreeMap::new();
    for row in rows {
        out.entry(granularity.bucket(row.timestamp)).or_default().push(row);
    }
    out
}

/// Combina las filas con igual timestamp y dimensiones sumando sus métricas.
/// El resultado queda ordenado por (timestamp, dimensiones).
pub fn rollup(rows: Vec<InputRow>) -> Vec<InputRow> {
    let mut acc: BTreeMap<(DateTime<Utc>, BTreeMap<String, String>), BTreeMap<String, i64>> =
        BTreeMap::new();
    for row in rows {
        let metrics = acc.entry((row.timestamp, row.dimensions)).or_default();
        for (name, value) in row.metrics {
            *metrics.entry(name).or_insert(0) += value;
        }
    }
    acc.into_iter()
        .map(|((timestamp, dimensions), metrics)| InputRow {
            timestamp,
            dimensions,
            metrics,
        })
        .collect()
}

/// Corta las filas en tramos de a lo sumo `max_rows` (mínimo 1 por tramo).
pub fn chunk_rows(rows: Vec<InputRow>, max_rows: u64) -> Vec<Vec<InputRow>> {
    let size = usize::try_from(max_rows.max(1)).unwrap_or(usize::MAX);
    let mut out = Vec::new();
    let mut iter = rows.into_iter().peekable();
    while iter.peek().is_some() {
        out.push(iter.by_ref().take(size).collect());
    }
    out
}

/* =========================
   Particionado por hash
   ========================= */

/// Clave de partición: valores de `dims` (o de todas las dimensiones si viene vacío).
pub fn partition_key(row: &InputRow, dims: &[String]) -> String {
    let values: Vec<&str> = if dims.is_empty() {
        row.dimensions.values().map(String::as_str).collect()
    } else {
        dims.iter()
            .map(|d| row.dimensions.get(d).map(String::as_str).unwrap_or_default())
            .collect()
    };
    values.join("\u{1}")
}

pub fn hash_key(key: &str) -> u64 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    h.finish()
}

fn hash_key_to_bucket(key: &str, num_buckets: u32) -> u32 {
    (hash_key(key) % num_buckets.max(1) as u64) as u32
}

/// Reparte filas en `num_buckets` según `hash(clave) % num_buckets`.
/// Sólo aparecen los buckets que recibieron al menos una fila.
pub fn hash_partition(
    rows: Vec<InputRow>,
    dims: &[String],
    num_buckets: u32,
) -> BTreeMap<u32, Vec<InputRow>> {
    let mut out: BTreeMap<u32, Vec<InputRow>> = BTreeMap::new();
    for row in rows {
        let bucket = hash_key_to_bucket(&partition_key(&row, dims), num_buckets);
        out.entry(bucket).or_default().push(row);
    }
    out
}

/* =========================
   Filas en JSONL
   ========================= */

/// Escribe una fila por línea. El archivo se reemplaza de forma atómica:
/// quien lo lea ve la versión vieja o la nueva completa.
pub fn write_rows_jsonl(path: &Path, rows: &[InputRow]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        for row in rows {
            serde_json::to_writer(&mut writer, row)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn read_rows_jsonl(path: &Path) -> io::Result<Vec<InputRow>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::parse_instant;

    fn row(ts: &str, page: &str, added: i64) -> InputRow {
        InputRow {
            timestamp: parse_instant(ts).unwrap(),
            dimensions: BTreeMap::from([("page".to_string(), page.to_string())]),
            metrics: BTreeMap::from([("added".to_string(), added)]),
        }
    }

    #[test]
    fn rollup_suma_metricas_de_filas_iguales() {
        let out = rollup(vec![
            row("2020-01-01T01:00:00Z", "b", 1),
            row("2020-01-01T01:00:00Z", "a", 2),
            row("2020-01-01T01:00:00Z", "a", 5),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].dimensions["page"], "a");
        assert_eq!(out[0].metrics["added"], 7);
        assert_eq!(out[1].metrics["added"], 1);
    }

    #[test]
    fn group_by_interval_usa_la_granularidad() {
        let groups = group_by_interval(
            vec![
                row("2020-01-01T01:00:00Z", "a", 1),
                row("2020-01-02T01:00:00Z", "a", 1),
                row("2020-01-01T23:00:00Z", "b", 1),
            ],
            Granularity::Day,
        );
        let day: Interval = "2020-01-01/P1D".parse().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&day].len(), 2);
    }

    #[test]
    fn chunk_rows_respeta_el_maximo() {
        let rows: Vec<_> = (0..5).map(|i| row("2020-01-01", &i.to_string(), 1)).collect();
        let chunks = chunk_rows(rows, 2);
        assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert!(chunk_rows(vec![], 2).is_empty());
    }

    #[test]
    fn hash_partition_es_determinista_y_en_rango() {
        let rows: Vec<_> = ["a", "b", "c", "a", "xyz"]
            .iter()
            .map(|p| row("2020-01-01", p, 1))
            .collect();
        let dims = vec!["page".to_string()];
        let parts = hash_partition(rows.clone(), &dims, 3);
        assert!(parts.keys().all(|b| *b < 3));
        assert_eq!(parts.values().map(Vec::len).sum::<usize>(), 5);

        // misma clave, mismo bucket
        let bucket_of_a = parts
            .iter()
            .find(|(_, rows)| rows.iter().any(|r| r.dimensions["page"] == "a"))
            .map(|(b, _)| *b)
            .unwrap();
        assert_eq!(
            parts[&bucket_of_a]
                .iter()
                .filter(|r| r.dimensions["page"] == "a")
                .count(),
            2
        );
        assert_eq!(hash_partition(rows, &dims, 3), parts);
    }

    #[test]
    fn jsonl_escribe_y_lee_filas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("rows.jsonl");
        let rows = vec![row("2020-01-01", "a", 1), row("2020-01-01", "b", 2)];
        write_rows_jsonl(&path, &rows).unwrap();
        assert_eq!(read_rows_jsonl(&path).unwrap(), rows);

        // reescribir reemplaza el contenido completo
        write_rows_jsonl(&path, &rows[..1]).unwrap();
        assert_eq!(read_rows_jsonl(&path).unwrap().len(), 1);
    }
}
