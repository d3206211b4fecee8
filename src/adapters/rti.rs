//! RTI recording parser.
//!
//! An RTI recording is an SQLite database (`.dat`). Every table with an
//! `rti_json_sample` column holds the samples of one topic, one JSON object
//! per row carrying a `"timestamp": {"sec": .., "nanosec": ..}` member plus
//! the sample fields. Rows without a JSON timestamp fall back to the
//! `SampleInfo_reception_timestamp` column (nanoseconds) when the table has
//! one. Channels are named `<table>/<field>`.
//!
//! The same rows exported as JSON lines are read as a single unnamed table.
//! Numeric top-level fields become channels; strings, booleans, arrays and
//! nested objects cannot be plotted and are skipped.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Value};

use super::types::{Source, SourceAdapter, SourceFormat};
use crate::dataset::{Dataset, DatasetBuilder};
use crate::error::LoadFailure;
use crate::units::UnitTag;

const TIMESTAMP_FIELD: &str = "timestamp";
const SAMPLE_COLUMN: &str = "rti_json_sample";
const RECEPTION_COLUMN: &str = "SampleInfo_reception_timestamp";
const SQLITE_MAGIC: &[u8] = b"SQLite format 3\0";

/// Timestamp of one row, kept as integer parts to avoid precision loss
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct RowTime {
    sec: i64,
    nanosec: i64,
}

impl RowTime {
    fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let sec = obj.get("sec").and_then(json_integer)?;
        let nanosec = obj.get("nanosec").and_then(json_integer).unwrap_or(0);
        Some(Self { sec, nanosec })
    }

    fn from_nanos(nanos: i64) -> Self {
        Self {
            sec: nanos.div_euclid(1_000_000_000),
            nanosec: nanos.rem_euclid(1_000_000_000),
        }
    }

    fn seconds_since(&self, origin: &RowTime) -> f64 {
        (self.sec - origin.sec) as f64 + (self.nanosec - origin.nanosec) as f64 * 1e-9
    }

    fn unix_seconds(&self) -> f64 {
        self.sec as f64 + self.nanosec as f64 * 1e-9
    }
}

fn json_integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().map(|f| f.trunc() as i64))
}

/// Quote an SQLite identifier
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Rows of one table (`None` for JSON lines)
#[derive(Debug, Default)]
struct RowGroup {
    table: Option<String>,
    rows: Vec<(RowTime, Map<String, Value>)>,
    skipped: usize,
}

impl RowGroup {
    fn new(table: Option<String>) -> Self {
        Self {
            table,
            ..Self::default()
        }
    }

    fn push(&mut self, mut fields: Map<String, Value>, reception_nanos: Option<i64>) {
        let time = fields
            .remove(TIMESTAMP_FIELD)
            .as_ref()
            .and_then(RowTime::from_json)
            .or_else(|| reception_nanos.map(RowTime::from_nanos));
        match time {
            Some(time) => self.rows.push((time, fields)),
            None => self.skipped += 1,
        }
    }

    fn channel_name(&self, field: &str) -> String {
        match &self.table {
            Some(table) => format!("{}/{}", table, field),
            None => field.to_string(),
        }
    }
}

/// RTI recording source adapter
#[derive(Clone, Copy, Debug, Default)]
pub struct RtiRecording;

impl RtiRecording {
    /// Detect an SQLite database or JSON lines
    pub fn detect_bytes(data: &[u8]) -> bool {
        data.starts_with(SQLITE_MAGIC)
            || data
                .iter()
                .find(|b| !b.is_ascii_whitespace())
                .is_some_and(|&b| b == b'{')
    }

    /// Parse JSON lines into one row group
    fn parse_lines(text: &str) -> Result<RowGroup, LoadFailure> {
        let mut group = RowGroup::new(None);
        let stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
        for (index, value) in stream.enumerate() {
            let Value::Object(fields) = value? else {
                return Err(LoadFailure::format(format!(
                    "row {}: expected a JSON object",
                    index + 1
                )));
            };
            group.push(fields, None);
        }
        Ok(group)
    }

    /// Names of the tables holding RTI samples, and whether each one has a
    /// reception timestamp column
    fn sample_tables(conn: &Connection) -> Result<Vec<(String, bool)>, LoadFailure> {
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = Vec::new();
        for name in names {
            let mut info = conn.prepare(&format!("PRAGMA table_info({})", quote_identifier(&name)))?;
            let columns = info
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<Vec<_>, _>>()?;
            if columns.iter().any(|c| c == SAMPLE_COLUMN) {
                tables.push((name, columns.iter().any(|c| c == RECEPTION_COLUMN)));
            }
        }
        Ok(tables)
    }

    /// Read every sample table of a recording database
    fn read_database(path: &Path) -> Result<Vec<RowGroup>, LoadFailure> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let mut groups = Vec::new();
        for (table, has_reception) in Self::sample_tables(&conn)? {
            let reception = if has_reception { RECEPTION_COLUMN } else { "NULL" };
            let sql = format!(
                "SELECT {}, {} FROM {}",
                SAMPLE_COLUMN,
                reception,
                quote_identifier(&table)
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut group = RowGroup::new(Some(table));
            while let Some(row) = rows.next()? {
                let value: Value = match row.get_ref(0)? {
                    ValueRef::Text(json) | ValueRef::Blob(json) => serde_json::from_slice(json)?,
                    _ => {
                        group.skipped += 1;
                        continue;
                    }
                };
                let reception_nanos = match row.get_ref(1)? {
                    ValueRef::Integer(nanos) => Some(nanos),
                    _ => None,
                };
                match value {
                    Value::Object(fields) => group.push(fields, reception_nanos),
                    _ => group.skipped += 1,
                }
            }
            tracing::debug!(
                "RTI table '{}': {} rows",
                group.table.as_deref().unwrap_or_default(),
                group.rows.len()
            );
            groups.push(group);
        }
        Ok(groups)
    }

    fn read_groups(source: &Source) -> Result<Vec<RowGroup>, LoadFailure> {
        if source.head(SQLITE_MAGIC.len())?.starts_with(SQLITE_MAGIC) {
            let path = source.path().ok_or_else(|| {
                LoadFailure::Unsupported("RTI databases can only be opened from a file".to_string())
            })?;
            return Self::read_database(path);
        }

        let bytes = source.read()?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|e| LoadFailure::format(format!("recording is not UTF-8: {}", e)))?;
        Ok(vec![Self::parse_lines(text)?])
    }
}

impl SourceAdapter for RtiRecording {
    fn name(&self) -> &'static str {
        "RTI"
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::Rti
    }

    fn detect(&self, _source: &Source, head: &[u8]) -> bool {
        Self::detect_bytes(head)
    }

    fn load(&self, source: &Source) -> Result<Dataset, LoadFailure> {
        let mut groups = Self::read_groups(source)?;

        let skipped: usize = groups.iter().map(|g| g.skipped).sum();
        if skipped > 0 {
            tracing::warn!("Skipped {} RTI rows without a timestamp", skipped);
        }
        // Rows are stored in reception order; sort by sample time (stable)
        for group in &mut groups {
            group.rows.sort_by_key(|(time, _)| *time);
        }
        let row_count: usize = groups.iter().map(|g| g.rows.len()).sum();

        let mut builder = DatasetBuilder::new(source.display_name(), SourceFormat::Rti, self.name());
        builder
            .meta("rows", row_count.to_string())
            .meta("skipped_rows", skipped.to_string());
        let tables: Vec<&str> = groups.iter().filter_map(|g| g.table.as_deref()).collect();
        if !tables.is_empty() {
            builder.meta("tables", tables.join(","));
        }

        let origin = groups.iter().filter_map(|g| g.rows.first().map(|(time, _)| *time)).min();
        let Some(origin) = origin else {
            return Ok(builder.finish());
        };
        builder.set_time_origin(origin.unix_seconds());

        let mut non_numeric: BTreeSet<String> = BTreeSet::new();
        for group in &groups {
            let mut names: Vec<String> = Vec::new();
            let mut series: HashMap<String, (Vec<f64>, Vec<f64>)> = HashMap::new();

            for (time, fields) in &group.rows {
                let t = time.seconds_since(&origin);
                for (key, value) in fields {
                    let Some(v) = value.as_f64() else {
                        if !value.is_null() {
                            non_numeric.insert(group.channel_name(key));
                        }
                        continue;
                    };
                    let (times, values) = series.entry(key.clone()).or_insert_with(|| {
                        names.push(key.clone());
                        (Vec::new(), Vec::new())
                    });
                    times.push(t);
                    values.push(v);
                }
            }

            for name in names {
                if let Some((times, values)) = series.remove(&name) {
                    builder.add_series(group.channel_name(&name), UnitTag::dimensionless(), times, values)?;
                }
            }
        }

        // A field that is numeric in some rows and not in others is still plotted
        non_numeric.retain(|name| !builder.contains(name));
        if !non_numeric.is_empty() {
            tracing::debug!("RTI fields not plottable: {:?}", non_numeric);
            builder.meta(
                "non_numeric_fields",
                non_numeric.into_iter().collect::<Vec<_>>().join(","),
            );
        }

        let dataset = builder.finish();
        tracing::info!(
            "Parsed RTI recording: {} channels, {} rows, {} table(s)",
            dataset.channel_count(),
            row_count,
            groups.len()
        );
        Ok(dataset)
    }
}
