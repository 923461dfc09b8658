//! Lectura de la entrada de una sub-tarea: split -> filas + estadísticas.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::job::{
    GranularitySpec, IngestionSchema, InputSource, InputSplit, MetricSpec, TimestampFormat,
    TuningConfig,
};
use crate::report::{ParseExceptionReport, RowIngestionTotals};
use crate::segment::parse_instant;

/// Fila ya parseada. También es el formato de cada línea de un segmento.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRow {
    pub timestamp: DateTime<Utc>,
    pub dimensions: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, i64>,
}

/// Filas aceptadas de un split junto con lo que se contó al leerlo.
#[derive(Debug, Default)]
pub struct RowBatch {
    pub rows: Vec<InputRow>,
    pub totals: RowIngestionTotals,
    pub parse_exceptions: Vec<ParseExceptionReport>,
}

/// Divide la fuente en splits, uno por sub-tarea.
pub fn splits(source: &InputSource) -> Result<Vec<InputSplit>> {
    match source {
        InputSource::Local { base_dir, filter } => {
            let pattern = base_dir.join(filter);
            let mut files: Vec<_> = glob::glob(&pattern.to_string_lossy())?
                .filter_map(|entry| entry.ok())
                .filter(|path| path.is_file())
                .collect();
            files.sort();
            debug!(patron = %pattern.display(), archivos = files.len(), "Splits locales");
            Ok(files.into_iter().map(|path| InputSplit::File { path }).collect())
        }
        InputSource::Inline { data } => Ok(vec![InputSplit::Inline { data: data.clone() }]),
        InputSource::Segments { files } => Ok(files
            .iter()
            .map(|path| InputSplit::SegmentFile { path: path.clone() })
            .collect()),
    }
}

/// Lee un split completo aplicando el schema, el filtro de intervalos y los
/// límites de parse exceptions del tuning.
pub fn read_rows(
    split: &InputSplit,
    schema: &IngestionSchema,
    granularity: &GranularitySpec,
    tuning: &TuningConfig,
) -> Result<RowBatch> {
    let parsed = match split {
        InputSplit::File { path } => parse_csv(File::open(path)?, schema),
        InputSplit::Inline { data } => parse_csv(data.as_bytes(), schema),
        InputSplit::SegmentFile { path } => parse_segment_file(File::open(path)?)?,
    };

    let mut batch = RowBatch::default();
    for (raw, outcome) in parsed {
        batch.totals.processed_bytes += raw.len() as u64 + 1;
        match outcome {
            Err(details) => {
                batch.totals.unparseable += 1;
                if batch.parse_exceptions.len() < tuning.max_saved_parse_exceptions {
                    batch.parse_exceptions.push(ParseExceptionReport {
                        input: raw,
                        error_type: "unparseable".to_string(),
                        details: vec![details],
                        timestamp: Utc::now(),
                    });
                }
                if let Some(max) = tuning.max_parse_exceptions {
                    if batch.totals.unparseable > max {
                        return Err(IngestError::TooManyParseExceptions {
                            max,
                            unparseable: batch.totals.unparseable,
                        });
                    }
                }
            }
            Ok((row, with_error)) => {
                let wanted = granularity
                    .intervals
                    .as_ref()
                    .map_or(true, |intervals| intervals.iter().any(|i| i.contains(row.timestamp)));
                if !wanted {
                    batch.totals.thrown_away += 1;
                    continue;
                }
                if with_error {
                    batch.totals.processed_with_error += 1;
                } else {
                    batch.totals.processed += 1;
                }
                batch.rows.push(row);
            }
        }
    }
    Ok(batch)
}

type ParsedLine = (String, std::result::Result<(InputRow, bool), String>);

fn parse_csv<R: Read>(reader: R, schema: &IngestionSchema) -> Vec<ParsedLine> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut out = Vec::new();
    for (idx, record) in csv_reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                out.push((String::new(), Err(e.to_string())));
                continue;
            }
        };
        let values: Vec<&str> = record.iter().collect();
        // encabezado opcional en la primera línea
        if idx == 0 && values == schema.columns.iter().map(String::as_str).collect::<Vec<_>>() {
            continue;
        }
        let raw = values.join(",");
        out.push((raw, parse_values(&values, schema)));
    }
    out
}

/// `Ok((fila, con_error))`: con_error indica que alguna métrica no se pudo leer.
fn parse_values(
    values: &[&str],
    schema: &IngestionSchema,
) -> std::result::Result<(InputRow, bool), String> {
    if values.len() != schema.columns.len() {
        return Err(format!(
            "se esperaban {} columnas y llegaron {}",
            schema.columns.len(),
            values.len()
        ));
    }
    let by_column: BTreeMap<&str, &str> = schema
        .columns
        .iter()
        .map(String::as_str)
        .zip(values.iter().copied())
        .collect();

    let raw_ts = by_column
        .get(schema.timestamp.column.as_str())
        .copied()
        .unwrap_or_default();
    let timestamp = parse_timestamp(raw_ts, schema.timestamp.format)?;

    let dimensions = schema
        .dimensions
        .iter()
        .map(|dim| {
            let value = by_column.get(dim.as_str()).copied().unwrap_or_default();
            (dim.clone(), value.to_string())
        })
        .collect();

    let mut with_error = false;
    let mut metrics = BTreeMap::new();
    for metric in &schema.metrics {
        let value = match metric {
            MetricSpec::Count { .. } => 1,
            MetricSpec::LongSum { field, .. } => {
                match by_column.get(field.as_str()).copied().unwrap_or_default() {
                    "" => 0,
                    raw => raw.parse::<i64>().unwrap_or_else(|_| {
                        with_error = true;
                        0
                    }),
                }
            }
        };
        metrics.insert(metric.name().to_string(), value);
    }

    Ok((
        InputRow {
            timestamp,
            dimensions,
            metrics,
        },
        with_error,
    ))
}

pub fn parse_timestamp(
    raw: &str,
    format: TimestampFormat,
) -> std::result::Result<DateTime<Utc>, String> {
    let from_millis = |millis: i64| {
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| format!("millis fuera de rango: {millis}"))
    };
    match format {
        TimestampFormat::Millis => {
            let millis = raw
                .parse::<i64>()
                .map_err(|_| format!("timestamp en millis inválido: [{raw}]"))?;
            from_millis(millis)
        }
        TimestampFormat::Iso => parse_instant(raw).map_err(|e| e.to_string()),
        TimestampFormat::Auto => match raw.parse::<i64>() {
            Ok(millis) => from_millis(millis),
            Err(_) => parse_instant(raw).map_err(|e| e.to_string()),
        },
    }
}

/// Los segmentos ya traen filas con rollup; las métricas se leen por nombre.
fn parse_segment_file(file: File) -> Result<Vec<ParsedLine>> {
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<InputRow>(&line)
            .map(|row| (row, false))
            .map_err(|e| e.to_string());
        out.push((line, parsed));
    }
    Ok(out)
}
