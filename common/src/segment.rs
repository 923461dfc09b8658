use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, Months, NaiveDate, NaiveDateTime,
    SecondsFormat, TimeZone, Timelike, Utc,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{IngestError, Result};
use crate::partition_ids::{self, PartitionGeneration, UNKNOWN_ATOMIC_UPDATE_GROUP_SIZE};

/* --------- Intervalos de tiempo --------- */

/// Intervalo semiabierto `[start, end)` en UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(IngestError::InvalidSpec(format!(
                "intervalo vacío o invertido: {start} / {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Forma compacta usable como nombre de directorio.
    pub fn path_key(&self) -> String {
        format!(
            "{}_{}",
            self.start.format("%Y%m%dT%H%M%S%.3fZ"),
            self.end.format("%Y%m%dT%H%M%S%.3fZ")
        )
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.start.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.end.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

impl FromStr for Interval {
    type Err = IngestError;

    /// Acepta `inicio/fin` o `inicio/periodo` (`P1D`, `PT1H`, `P1M`, `P1Y`).
    fn from_str(s: &str) -> Result<Self> {
        let (left, right) = s
            .split_once('/')
            .ok_or_else(|| IngestError::InvalidSpec(format!("intervalo sin '/': {s}")))?;
        let start = parse_instant(left)?;
        let end = if right.starts_with('P') {
            add_period(start, right)?
        } else {
            parse_instant(right)?
        };
        Interval::new(start, end)
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Parsea un instante: RFC 3339, fecha-hora sin zona (se asume UTC) o fecha sola.
pub fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(IngestError::InvalidSpec(format!("instante inválido: {raw}")))
}

fn add_period(start: DateTime<Utc>, period: &str) -> Result<DateTime<Utc>> {
    let invalid = || IngestError::InvalidSpec(format!("periodo no soportado: {period}"));
    let body = period.strip_prefix('P').ok_or_else(invalid)?;
    if body.len() < 2 || !body.is_ascii() {
        return Err(invalid());
    }

    let (amount, unit, time_part) = match body.strip_prefix('T') {
        Some(time) => (&time[..time.len().saturating_sub(1)], time.chars().last(), true),
        None => (&body[..body.len().saturating_sub(1)], body.chars().last(), false),
    };
    let amount: u32 = amount.parse().map_err(|_| invalid())?;

    let end = match (time_part, unit) {
        (true, Some('H')) => start.checked_add_signed(ChronoDuration::hours(amount as i64)),
        (true, Some('M')) => start.checked_add_signed(ChronoDuration::minutes(amount as i64)),
        (false, Some('D')) => start.checked_add_signed(ChronoDuration::days(amount as i64)),
        (false, Some('W')) => start.checked_add_signed(ChronoDuration::weeks(amount as i64)),
        (false, Some('M')) => start.checked_add_months(Months::new(amount)),
        (false, Some('Y')) => start.checked_add_months(Months::new(amount * 12)),
        _ => None,
    };
    end.ok_or_else(invalid)
}

/* --------- Granularidad de segmentos --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    Hour,
    #[default]
    Day,
    Month,
    Year,
}

impl Granularity {
    /// Intervalo de esta granularidad que contiene a `ts`.
    pub fn bucket(self, ts: DateTime<Utc>) -> Interval {
        let day_start = |y: i32, m: u32, d: u32| {
            Utc.with_ymd_and_hms(y, m, d, 0, 0, 0)
                .single()
                .unwrap_or(ts)
        };
        let (start, end) = match self {
            Granularity::Hour => {
                let start = Utc
                    .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0)
                    .single()
                    .unwrap_or(ts);
                (start, start + ChronoDuration::hours(1))
            }
            Granularity::Day => {
                let start = day_start(ts.year(), ts.month(), ts.day());
                (start, start + ChronoDuration::days(1))
            }
            Granularity::Month => {
                let start = day_start(ts.year(), ts.month(), 1);
                (start, start.checked_add_months(Months::new(1)).unwrap_or(start))
            }
            Granularity::Year => {
                let start = day_start(ts.year(), 1, 1);
                (start, start.checked_add_months(Months::new(12)).unwrap_or(start))
            }
        };
        Interval { start, end }
    }
}

/* --------- Identificadores de segmento --------- */

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentId {
    pub datasource: String,
    pub interval: Interval,
    pub version: String,
    pub partition_num: u32,
    /// -1 mientras no se conozca el tamaño del grupo de actualización atómica.
    #[serde(default = "unknown_atomic_update_group_size")]
    pub atomic_update_group_size: i16,
}

fn unknown_atomic_update_group_size() -> i16 {
    UNKNOWN_ATOMIC_UPDATE_GROUP_SIZE
}

impl SegmentId {
    pub fn new(datasource: &str, interval: Interval, version: &str, partition_num: u32) -> Self {
        Self {
            datasource: datasource.to_string(),
            interval,
            version: version.to_string(),
            partition_num,
            atomic_update_group_size: UNKNOWN_ATOMIC_UPDATE_GROUP_SIZE,
        }
    }

    pub fn generation(&self) -> Result<PartitionGeneration> {
        partition_ids::classify(self.partition_num as i64)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.datasource,
            self.interval.start.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.interval.end.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.version
        )?;
        if self.partition_num != 0 {
            write!(f, "_{}", self.partition_num)?;
        }
        Ok(())
    }
}

/// Segmento publicado: id + metadatos + ruta al archivo con las filas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSegment {
    pub id: SegmentId,
    pub num_rows: u64,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub path: String,
}
