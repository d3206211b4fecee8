//! Error types shared across the crate.
//!
//! Every failure the core can report is one of the variants below. Loading
//! failures are always wrapped into [`LoadError`] so callers learn which
//! adapter failed and why, without the adapter having to remember its name.

use std::path::PathBuf;

use thiserror::Error;

use crate::units::UnitTag;

/// A value could not be converted or bound to a unit of another dimension.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("incompatible units: cannot convert '{from}' to '{to}'")]
pub struct IncompatibleUnitError {
    pub from: UnitTag,
    pub to: UnitTag,
}

/// A point lookup precedes every timestamp of a channel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OutOfRangeError {
    #[error("time {t} precedes the first sample at {first}")]
    BeforeFirstSample { t: f64, first: f64 },
    #[error("channel has no samples")]
    Empty,
}

/// Invalid cache, query or session parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("aggregation ratio must be greater than 1, got {0}")]
    AggregationRatio(usize),
    #[error("target point count must be greater than zero")]
    TargetPoints,
    #[error("point budget factor must be at least 1, got {0}")]
    PointBudgetFactor(usize),
    #[error("maximum channel count must be greater than zero")]
    MaxChannels,
    #[error("failed to read configuration {path}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("invalid configuration: {0}")]
    Parse(String),
}

/// A channel could not be constructed because its data breaks an invariant.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    #[error("channel '{name}': {timestamps} timestamps but {samples} samples")]
    LengthMismatch {
        name: String,
        timestamps: usize,
        samples: usize,
    },
    #[error("channel '{name}': timestamp at index {index} goes backwards ({previous} -> {current})")]
    NonMonotonic {
        name: String,
        index: usize,
        previous: f64,
        current: f64,
    },
    #[error("channel '{name}': timestamp at index {index} is not finite")]
    NonFiniteTimestamp { name: String, index: usize },
}

/// A dataset could not be assembled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DatasetError {
    #[error("duplicate channel name '{0}'")]
    DuplicateChannel(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// The underlying reason an adapter failed.
#[derive(Debug, Error)]
pub enum LoadFailure {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed data: {0}")]
    Format(String),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("zip archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("data integrity error: {0}")]
    Integrity(#[from] DatasetError),
    #[error("{0}")]
    Unsupported(String),
    #[error("load cancelled")]
    Cancelled,
}

impl LoadFailure {
    pub(crate) fn format(message: impl Into<String>) -> Self {
        LoadFailure::Format(message.into())
    }
}

impl From<ChannelError> for LoadFailure {
    fn from(value: ChannelError) -> Self {
        LoadFailure::Integrity(DatasetError::Channel(value))
    }
}

/// An adapter failed to produce a valid dataset.
///
/// Fatal to that load only; other open datasets are untouched.
#[derive(Debug, Error)]
#[error("{adapter} adapter failed to load '{source_name}': {cause}")]
pub struct LoadError {
    pub adapter: String,
    pub source_name: String,
    #[source]
    pub cause: LoadFailure,
}

impl LoadError {
    pub fn new(adapter: impl Into<String>, source_name: impl Into<String>, cause: LoadFailure) -> Self {
        Self {
            adapter: adapter.into(),
            source_name: source_name.into(),
            cause,
        }
    }
}

/// Errors from mutating the selection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SelectionError {
    #[error("channel '{0}' is already selected")]
    AlreadySelected(String),
    #[error("maximum of {0} channels reached")]
    LimitReached(usize),
    #[error("channel '{0}' is not selected")]
    NotSelected(String),
    #[error("new order must be a permutation of the current selection")]
    InvalidOrder,
    #[error(transparent)]
    IncompatibleUnit(#[from] IncompatibleUnitError),
}

/// Errors surfaced by [`crate::session::Session`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no open dataset with id {0}")]
    UnknownDataset(u64),
    #[error("dataset {dataset} has no channel '{channel}'")]
    UnknownChannel { dataset: u64, channel: String },
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Load(#[from] LoadError),
}
