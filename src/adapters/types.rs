use std::fs::File;
use std::io::{self, Read};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::dataset::Dataset;
use crate::error::LoadFailure;

/// Supported logged-signal formats
#[derive(AsRefStr, Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceFormat {
    #[strum(serialize = "TDM")]
    Tdm,
    #[strum(serialize = "PLCLogger")]
    PlcLogger,
    #[strum(serialize = "RTI")]
    Rti,
}

impl SourceFormat {
    /// Guess the format from a file extension (case-insensitive)
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "tdm" | "tdx" => Some(SourceFormat::Tdm),
            "plc" | "plclog" => Some(SourceFormat::PlcLogger),
            "dat" | "jsonl" | "ndjson" | "rti" => Some(SourceFormat::Rti),
            _ => None,
        }
    }
}

/// Where a dataset is loaded from
#[derive(Clone, Debug)]
pub enum Source {
    File(PathBuf),
    Memory { name: String, data: Arc<[u8]> },
}

impl Source {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Source::File(path.into())
    }

    pub fn memory(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        Source::Memory {
            name: name.into(),
            data: Arc::from(data),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Source::File(path) => Some(path),
            Source::Memory { .. } => None,
        }
    }

    /// Display name for the source (file name or the in-memory name)
    pub fn display_name(&self) -> String {
        match self {
            Source::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "Unknown".to_string()),
            Source::Memory { name, .. } => name.clone(),
        }
    }

    pub fn extension(&self) -> Option<String> {
        let name = match self {
            Source::File(path) => path.to_string_lossy().to_string(),
            Source::Memory { name, .. } => name.clone(),
        };
        Path::new(&name)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
    }

    /// Read the whole source. Files are memory-mapped.
    pub fn read(&self) -> io::Result<SourceBytes> {
        match self {
            Source::File(path) => {
                let file = File::open(path)?;
                if file.metadata()?.len() == 0 {
                    return Ok(SourceBytes::Owned(Arc::from(Vec::<u8>::new())));
                }
                // SAFETY: the mapping is read-only and dropped with the load;
                // log files are not expected to be truncated while being read.
                let map = unsafe { Mmap::map(&file)? };
                Ok(SourceBytes::Mapped(map))
            }
            Source::Memory { data, .. } => Ok(SourceBytes::Owned(data.clone())),
        }
    }

    /// Read at most `len` leading bytes (for format detection)
    pub fn head(&self, len: usize) -> io::Result<Vec<u8>> {
        match self {
            Source::File(path) => {
                let mut buf = Vec::with_capacity(len);
                File::open(path)?.take(len as u64).read_to_end(&mut buf)?;
                Ok(buf)
            }
            Source::Memory { data, .. } => Ok(data[..len.min(data.len())].to_vec()),
        }
    }
}

/// Bytes of a source, either mapped or owned
pub enum SourceBytes {
    Mapped(Mmap),
    Owned(Arc<[u8]>),
}

impl Deref for SourceBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            SourceBytes::Mapped(map) => &map[..],
            SourceBytes::Owned(data) => &data[..],
        }
    }
}

/// Trait for logged-signal source adapters
///
/// One implementation per format. The core only ever talks to adapters
/// through this trait (via [`super::AdapterRegistry`]).
pub trait SourceAdapter: Send + Sync {
    /// Short adapter name used in error reports
    fn name(&self) -> &'static str;

    fn format(&self) -> SourceFormat;

    /// Whether this adapter recognizes the source from its leading bytes
    fn detect(&self, source: &Source, head: &[u8]) -> bool;

    /// Produce a dataset whose channels satisfy the channel invariants
    fn load(&self, source: &Source) -> Result<Dataset, LoadFailure>;
}
