//! Immutable, unit-tagged time series.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, OutOfRangeError};
use crate::units::UnitTag;

/// Identifies the dataset and adapter a channel was loaded by.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId {
    pub dataset: u64,
    pub adapter: String,
}

/// Descriptive metadata carried alongside the samples.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMeta {
    /// Format specific type name (e.g. the logger's data type)
    pub type_name: Option<String>,
    pub display_min: Option<f64>,
    pub display_max: Option<f64>,
}

/// A single logged sample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Sample {
    pub time: f64,
    pub value: f64,
}

/// One named time series.
///
/// Timestamps are finite and non-decreasing (ties are repeated logging at one
/// tick) and there is exactly one sample per timestamp. Both buffers are
/// shared, so cloning a channel is cheap and never copies samples.
#[derive(Clone)]
pub struct Channel {
    name: String,
    unit: UnitTag,
    timestamps: Arc<[f64]>,
    samples: Arc<[f64]>,
    source: SourceId,
    meta: ChannelMeta,
}

impl Channel {
    /// Validate and build a channel.
    pub fn new(
        name: impl Into<String>,
        unit: impl Into<UnitTag>,
        timestamps: Vec<f64>,
        samples: Vec<f64>,
    ) -> Result<Self, ChannelError> {
        let name = name.into();
        if timestamps.len() != samples.len() {
            return Err(ChannelError::LengthMismatch {
                name,
                timestamps: timestamps.len(),
                samples: samples.len(),
            });
        }
        for (index, &t) in timestamps.iter().enumerate() {
            if !t.is_finite() {
                return Err(ChannelError::NonFiniteTimestamp { name, index });
            }
            if index > 0 && t < timestamps[index - 1] {
                return Err(ChannelError::NonMonotonic {
                    name,
                    index,
                    previous: timestamps[index - 1],
                    current: t,
                });
            }
        }
        Ok(Self {
            name,
            unit: unit.into(),
            timestamps: timestamps.into(),
            samples: samples.into(),
            source: SourceId::default(),
            meta: ChannelMeta::default(),
        })
    }

    pub fn with_meta(mut self, meta: ChannelMeta) -> Self {
        self.meta = meta;
        self
    }

    pub(crate) fn with_source(mut self, source: SourceId) -> Self {
        self.source = source;
        self
    }

    pub(crate) fn set_source_dataset(&mut self, dataset: u64) {
        self.source.dataset = dataset;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &UnitTag {
        &self.unit
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn meta(&self) -> &ChannelMeta {
        &self.meta
    }

    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn sample_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// First and last timestamp, or `None` for an empty channel.
    pub fn time_range(&self) -> Option<(f64, f64)> {
        match (self.timestamps.first(), self.timestamps.last()) {
            (Some(&first), Some(&last)) => Some((first, last)),
            _ => None,
        }
    }

    /// The sample logged at or most recently before `t`.
    ///
    /// With repeated timestamps the last sample of that tick is returned.
    pub fn value_at_or_before(&self, t: f64) -> Result<Sample, OutOfRangeError> {
        let first = *self.timestamps.first().ok_or(OutOfRangeError::Empty)?;
        let index = self.timestamps.partition_point(|&x| x <= t);
        if index == 0 {
            return Err(OutOfRangeError::BeforeFirstSample { t, first });
        }
        Ok(Sample {
            time: self.timestamps[index - 1],
            value: self.samples[index - 1],
        })
    }

    /// Index range of samples whose timestamp lies in `[t0, t1]`.
    pub fn index_range(&self, t0: f64, t1: f64) -> Range<usize> {
        if self.timestamps.is_empty() || t1 < t0 || t0.is_nan() || t1.is_nan() {
            return 0..0;
        }
        let start = self.timestamps.partition_point(|&x| x < t0);
        let end = self.timestamps.partition_point(|&x| x <= t1);
        start..end.max(start)
    }

    /// A new channel restricted to `[t0, t1]` with its own buffers.
    pub fn slice(&self, t0: f64, t1: f64) -> Channel {
        let range = self.index_range(t0, t1);
        Channel {
            name: self.name.clone(),
            unit: self.unit.clone(),
            timestamps: self.timestamps[range.clone()].into(),
            samples: self.samples[range].into(),
            source: self.source.clone(),
            meta: self.meta.clone(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Sample> + '_ {
        self.timestamps
            .iter()
            .zip(self.samples.iter())
            .map(|(&time, &value)| Sample { time, value })
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("samples", &self.sample_count())
            .field("time_range", &self.time_range())
            .field("source", &self.source)
            .finish()
    }
}
