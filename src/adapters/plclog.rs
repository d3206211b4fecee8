//! PLCLogger binary log (.plc) parser
//!
//! Format structure (all little-endian):
//! - Header: sample count (u32), data version (u32), start time (f64 OLE
//!   automation date, days since 1899-12-30)
//! - Sample offsets: `sample_count` x f32 seconds relative to the start time
//! - Channel count (u32), previous file name, next file name
//! - Per channel: name + `sample_count` x f32 values
//!
//! Strings are a u32 byte length followed by UTF-8 bytes. A long recording is
//! split over several files chained through the previous/next file names.
//! Any file of a series may be zipped; the first archive entry is the log.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use regex::Regex;
use zip::ZipArchive;

use super::types::{Source, SourceAdapter, SourceFormat};
use crate::dataset::{Dataset, DatasetBuilder};
use crate::error::LoadFailure;
use crate::units::{UnitRegistry, UnitTag};

/// Days between the OLE automation epoch (1899-12-30) and the Unix epoch
const OLE_UNIX_EPOCH_DAYS: f64 = 25569.0;
const SECONDS_PER_DAY: f64 = 86400.0;
/// Valid OLE automation date range (0100-01-01 .. 9999-12-31)
const OLE_DATE_MIN: f64 = -657_434.0;
const OLE_DATE_MAX: f64 = 2_958_465.0;
const HEADER_LEN: usize = 16;
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// One parsed PLCLogger file
#[derive(Clone, Debug)]
pub struct PlcSegment {
    pub version: u32,
    /// Start of the recording in Unix seconds
    pub start: f64,
    /// Sample times relative to `start`, seconds
    pub times: Vec<f64>,
    pub prev_file: String,
    pub next_file: String,
    pub channels: Vec<(String, Vec<f64>)>,
}

/// Bounds-checked little-endian cursor
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], LoadFailure> {
        let remaining = self.data.len() - self.offset;
        if len > remaining {
            return Err(LoadFailure::format(format!(
                "unexpected end of file reading {} at offset {} (need {}, have {})",
                what, self.offset, len, remaining
            )));
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    fn u32(&mut self, what: &str) -> Result<u32, LoadFailure> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self, what: &str) -> Result<f64, LoadFailure> {
        let b = self.take(8, what)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_le_bytes(raw))
    }

    fn f32_array(&mut self, count: usize, what: &str) -> Result<Vec<f64>, LoadFailure> {
        let len = count
            .checked_mul(4)
            .ok_or_else(|| LoadFailure::format(format!("{} count {} overflows", what, count)))?;
        let bytes = self.take(len, what)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
            .collect())
    }

    fn string(&mut self, what: &str) -> Result<String, LoadFailure> {
        let len = self.u32(what)? as usize;
        let bytes = self.take(len, what)?;
        Ok(String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string())
    }
}

/// PLCLogger source adapter
#[derive(Clone, Debug, Default)]
pub struct PlcLogger {
    follow_series: bool,
}

impl PlcLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also read the files chained after the opened one
    pub fn with_series(follow_series: bool) -> Self {
        Self { follow_series }
    }

    /// Detect if data starts with a plausible PLCLogger header
    pub fn detect_bytes(data: &[u8]) -> bool {
        if data.len() < HEADER_LEN {
            return false;
        }
        let mut reader = Reader::new(data);
        let (Ok(_count), Ok(version), Ok(start)) = (
            reader.u32("sample count"),
            reader.u32("version"),
            reader.f64("start time"),
        ) else {
            return false;
        };
        version <= u16::MAX as u32 && start.is_finite() && (OLE_DATE_MIN..=OLE_DATE_MAX).contains(&start)
    }

    /// Convert an OLE automation date to Unix seconds
    pub fn ole_to_unix(ole_days: f64) -> f64 {
        (ole_days - OLE_UNIX_EPOCH_DAYS) * SECONDS_PER_DAY
    }

    /// Parse a single PLCLogger file
    pub fn parse_segment(data: &[u8]) -> Result<PlcSegment, LoadFailure> {
        let mut reader = Reader::new(data);

        let sample_count = reader.u32("sample count")? as usize;
        let version = reader.u32("version")?;
        let start_ole = reader.f64("start time")?;
        if !start_ole.is_finite() || !(OLE_DATE_MIN..=OLE_DATE_MAX).contains(&start_ole) {
            return Err(LoadFailure::format(format!(
                "start time {} is not a valid OLE date",
                start_ole
            )));
        }

        // Validate before allocating: the time table alone must fit
        if sample_count.saturating_mul(4) > data.len().saturating_sub(HEADER_LEN) {
            return Err(LoadFailure::format(format!(
                "sample count {} exceeds file size {}",
                sample_count,
                data.len()
            )));
        }
        let times = reader.f32_array(sample_count, "sample times")?;

        let channel_count = reader.u32("channel count")? as usize;
        let prev_file = reader.string("previous file name")?;
        let next_file = reader.string("next file name")?;

        let mut channels = Vec::with_capacity(channel_count.min(4096));
        for i in 0..channel_count {
            let name = reader.string(&format!("channel {} name", i))?;
            let values = reader.f32_array(sample_count, &format!("channel '{}' values", name))?;
            channels.push((name, values));
        }

        if reader.offset != data.len() {
            tracing::warn!(
                "PLCLogger file has {} trailing bytes after {} channels",
                data.len() - reader.offset,
                channel_count
            );
        }

        Ok(PlcSegment {
            version,
            start: Self::ole_to_unix(start_ole),
            times,
            prev_file,
            next_file,
            channels,
        })
    }

    /// Parse a source that is either a raw PLCLogger file or a zip archive
    /// holding one
    fn read_segment(source: &Source) -> Result<PlcSegment, LoadFailure> {
        let bytes = source.read()?;
        if !bytes.starts_with(ZIP_MAGIC) {
            return Self::parse_segment(&bytes);
        }
        let mut archive = ZipArchive::new(Cursor::new(&bytes[..]))?;
        let mut entry = archive.by_index(0)?;
        tracing::debug!(
            "Reading PLCLogger entry '{}' from {}",
            entry.name(),
            source.display_name()
        );
        let mut data = Vec::with_capacity((entry.size() as usize).min(bytes.len().saturating_mul(16)));
        entry.read_to_end(&mut data)?;
        Self::parse_segment(&data)
    }

    /// Read the opened file and, if enabled, every file chained after it
    fn read_segments(&self, source: &Source) -> Result<Vec<PlcSegment>, LoadFailure> {
        let first = Self::read_segment(source)?;
        let mut segments = vec![first];

        let Some(dir) = source.path().and_then(Path::parent).filter(|_| self.follow_series) else {
            return Ok(segments);
        };

        let mut visited: HashSet<PathBuf> = source.path().map(Path::to_path_buf).into_iter().collect();
        loop {
            let last = &segments[segments.len() - 1];
            if last.next_file.is_empty() || last.next_file == last.prev_file {
                break;
            }
            let next_path = dir.join(&last.next_file);
            if !next_path.is_file() || !visited.insert(next_path.clone()) {
                break;
            }
            tracing::debug!("Following PLCLogger series to {}", next_path.display());
            let segment = Self::read_segment(&Source::file(&next_path))?;
            segments.push(segment);
        }
        Ok(segments)
    }

    /// Merge segments onto the first segment's time base
    ///
    /// Samples of later segments that do not advance past the merged data are
    /// dropped (the first occurrence of a timestamp wins). Channels missing
    /// from a segment are filled with NaN.
    fn assemble(&self, source: &Source, segments: Vec<PlcSegment>) -> Result<Dataset, LoadFailure> {
        let origin = segments[0].start;
        let mut names: Vec<String> = Vec::new();
        let mut columns: HashMap<String, Vec<f64>> = HashMap::new();
        let mut times: Vec<f64> = Vec::new();

        for segment in &segments {
            let offset = segment.start - origin;
            let first_new = match times.last() {
                Some(&last) => segment.times.partition_point(|&t| t + offset <= last),
                None => 0,
            };
            let kept = segment.times.len() - first_new;
            let filled = times.len();
            times.extend(segment.times[first_new..].iter().map(|&t| t + offset));

            for (name, values) in &segment.channels {
                let column = columns.entry(name.clone()).or_insert_with(|| {
                    names.push(name.clone());
                    Vec::with_capacity(times.len())
                });
                if column.len() > filled {
                    return Err(LoadFailure::Integrity(crate::error::DatasetError::DuplicateChannel(
                        name.clone(),
                    )));
                }
                column.resize(filled, f64::NAN);
                column.extend_from_slice(&values[first_new..]);
            }
            tracing::debug!("PLCLogger segment: {} of {} samples kept", kept, segment.times.len());
        }

        let unit_regex = Regex::new(r"^.*\[(?<unit>[^\]]*)\]\s*$").expect("Failed to compile regex");
        let first = &segments[0];
        let mut builder = DatasetBuilder::new(source.display_name(), SourceFormat::PlcLogger, self.name())
            .time_origin(origin);
        builder
            .meta("version", first.version.to_string())
            .meta("segments", segments.len().to_string());
        if !first.prev_file.is_empty() {
            builder.meta("prev_file", first.prev_file.clone());
        }
        if let Some(last) = segments.last().filter(|s| !s.next_file.is_empty()) {
            builder.meta("next_file", last.next_file.clone());
        }

        for name in names {
            let mut values = columns.remove(&name).unwrap_or_default();
            values.resize(times.len(), f64::NAN);
            let unit = unit_regex
                .captures(&name)
                .map(|c| UnitTag::new(c["unit"].trim()))
                .unwrap_or_else(UnitTag::dimensionless);
            if !unit.is_dimensionless() && UnitRegistry::standard().resolve(&unit).is_none() {
                tracing::warn!("Unknown unit '{}' on channel '{}'", unit, name);
            }
            builder.add_series(name, unit, times.clone(), values)?;
        }

        let dataset = builder.finish();
        tracing::info!(
            "Parsed PLCLogger log: {} channels, {} samples, {} file(s)",
            dataset.channel_count(),
            times.len(),
            segments.len()
        );
        Ok(dataset)
    }
}

impl SourceAdapter for PlcLogger {
    fn name(&self) -> &'static str {
        "PLCLogger"
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::PlcLogger
    }

    fn detect(&self, _source: &Source, head: &[u8]) -> bool {
        Self::detect_bytes(head)
    }

    fn load(&self, source: &Source) -> Result<Dataset, LoadFailure> {
        let segments = self.read_segments(source)?;
        self.assemble(source, segments)
    }
}

/// Encode a PLCLogger file (used to build fixtures)
#[cfg(test)]
pub(crate) fn encode(
    start_ole: f64,
    times: &[f32],
    prev: &str,
    next: &str,
    channels: &[(&str, Vec<f32>)],
) -> Vec<u8> {
    fn string(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }
    let mut out = Vec::new();
    out.extend_from_slice(&(times.len() as u32).to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&start_ole.to_le_bytes());
    for t in times {
        out.extend_from_slice(&t.to_le_bytes());
    }
    out.extend_from_slice(&(channels.len() as u32).to_le_bytes());
    string(&mut out, prev);
    string(&mut out, next);
    for (name, values) in channels {
        string(&mut out, name);
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatasetError;

    // 2024-01-01 00:00:00 UTC
    const START: f64 = 45292.0;

    fn zipped(entry: &str, data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file(entry, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap().into_inner()
    }

    fn sample_file() -> Vec<u8> {
        encode(
            START,
            &[0.0, 0.5, 1.0, 1.5],
            "",
            "",
            &[
                ("Oil temp [°C]", vec![80.0, 81.0, 82.5, 83.0]),
                ("Valve open", vec![0.0, 1.0, 1.0, 0.0]),
            ],
        )
    }

    #[test]
    fn test_ole_to_unix() {
        assert_eq!(PlcLogger::ole_to_unix(25569.0), 0.0);
        assert_eq!(PlcLogger::ole_to_unix(START), 1_704_067_200.0);
    }

    #[test]
    fn test_detect() {
        assert!(PlcLogger::detect_bytes(&sample_file()));
        assert!(!PlcLogger::detect_bytes(b"{\"timestamp\": {\"sec\": 1}}"));
        assert!(!PlcLogger::detect_bytes(&[0u8; 4]));
    }

    #[test]
    fn test_parse_plc_log() {
        let source = Source::memory("line3.plc", sample_file());
        let ds = PlcLogger::new().load(&source).unwrap();

        assert_eq!(ds.format(), SourceFormat::PlcLogger);
        assert_eq!(ds.adapter(), "PLCLogger");
        assert_eq!(ds.time_origin(), 1_704_067_200.0);
        assert_eq!(ds.channel_count(), 2);

        let oil = ds.channel("Oil temp [°C]").unwrap();
        assert_eq!(oil.unit().as_str(), "°C");
        assert_eq!(oil.timestamps(), &[0.0, 0.5, 1.0, 1.5]);
        assert_eq!(oil.samples(), &[80.0, 81.0, 82.5, 83.0]);

        let valve = ds.channel("Valve open").unwrap();
        assert!(valve.unit().is_dimensionless());
        assert_eq!(ds.meta().get("segments").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_truncated_file_fails() {
        let mut data = sample_file();
        data.truncate(data.len() - 3);
        let err = PlcLogger::parse_segment(&data).unwrap_err();
        assert!(err.to_string().contains("unexpected end of file"), "{}", err);
    }

    #[test]
    fn test_oversized_sample_count_fails() {
        let mut data = sample_file();
        data[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(PlcLogger::parse_segment(&data), Err(LoadFailure::Format(_))));
    }

    #[test]
    fn test_non_monotonic_times_are_integrity_errors() {
        let data = encode(START, &[0.0, 2.0, 1.0], "", "", &[("x", vec![1.0, 2.0, 3.0])]);
        let err = PlcLogger::new().load(&Source::memory("bad.plc", data)).unwrap_err();
        assert!(matches!(err, LoadFailure::Integrity(DatasetError::Channel(_))));
    }

    #[test]
    fn test_trailing_spaces_keep_names_apart() {
        let data = encode(
            START,
            &[0.0],
            "",
            "",
            &[("a", vec![1.0]), ("a ", vec![2.0]), ("b\0\0", vec![3.0])],
        );
        let ds = PlcLogger::new().load(&Source::memory("spaces.plc", data)).unwrap();
        assert_eq!(ds.channel_names().collect::<Vec<_>>(), vec!["a", "a ", "b"]);
        assert_eq!(ds.channel("a ").unwrap().samples(), &[2.0]);
    }

    #[test]
    fn test_zipped_file() {
        let data = zipped("line3.plc", &sample_file());
        let ds = PlcLogger::new().load(&Source::memory("line3.zip", data)).unwrap();
        assert_eq!(ds.channel_count(), 2);
        assert_eq!(ds.channel("Valve open").unwrap().samples(), &[0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_corrupt_zip_fails() {
        let mut data = zipped("line3.plc", &sample_file());
        data.truncate(40);
        let err = PlcLogger::new().load(&Source::memory("line3.plc", data)).unwrap_err();
        assert!(matches!(err, LoadFailure::Archive(_)), "{}", err);
    }

    #[test]
    fn test_duplicate_channel_names_fail() {
        let data = encode(START, &[0.0], "", "", &[("x", vec![1.0]), ("x", vec![2.0])]);
        let err = PlcLogger::new().load(&Source::memory("dup.plc", data)).unwrap_err();
        assert!(matches!(err, LoadFailure::Integrity(DatasetError::DuplicateChannel(_))));
    }

    #[test]
    fn test_follows_series() {
        let dir = std::env::temp_dir().join(format!("signal-browser-plc-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        // Second file starts 1 s later; its first sample overlaps the first file
        let one_s = 1.0 / SECONDS_PER_DAY;
        let first = encode(START, &[0.0, 1.0, 1.5], "", "b.plc", &[("x", vec![1.0, 2.0, 3.0])]);
        let second = encode(
            START + one_s,
            &[0.0, 1.0, 1.5],
            "a.plc",
            "a.plc",
            &[("x", vec![30.0, 4.0, 5.0]), ("y", vec![7.0, 8.0, 9.0])],
        );
        std::fs::write(dir.join("a.plc"), first).unwrap();
        std::fs::write(dir.join("b.plc"), second).unwrap();

        let ds = PlcLogger::with_series(true)
            .load(&Source::file(dir.join("a.plc")))
            .unwrap();
        let x = ds.channel("x").unwrap();
        assert_eq!(x.sample_count(), 5);
        assert_eq!(x.samples(), &[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!((x.timestamps()[4] - 2.5).abs() < 1e-4);

        let y = ds.channel("y").unwrap();
        assert!(y.samples()[0].is_nan());
        assert_eq!(&y.samples()[3..], &[8.0, 9.0]);
        assert_eq!(ds.meta().get("segments").map(String::as_str), Some("2"));

        let single = PlcLogger::new().load(&Source::file(dir.join("a.plc"))).unwrap();
        assert_eq!(single.channel("x").unwrap().sample_count(), 3);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_follows_zipped_series() {
        let dir = std::env::temp_dir().join(format!("signal-browser-plczip-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let one_s = 1.0 / SECONDS_PER_DAY;
        let first = encode(START, &[0.0, 0.5], "", "b.plc", &[("x", vec![1.0, 2.0])]);
        let second = encode(START + one_s, &[0.0, 0.5], "a.plc", "", &[("x", vec![3.0, 4.0])]);
        std::fs::write(dir.join("a.plc"), zipped("a.plc", &first)).unwrap();
        std::fs::write(dir.join("b.plc"), zipped("b.plc", &second)).unwrap();

        let ds = PlcLogger::with_series(true)
            .load(&Source::file(dir.join("a.plc")))
            .unwrap();
        assert_eq!(ds.channel("x").unwrap().samples(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(ds.meta().get("segments").map(String::as_str), Some("2"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
