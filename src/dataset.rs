//! Datasets: channels loaded together from one source.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::adapters::SourceFormat;
use crate::channel::{Channel, SourceId};
use crate::error::DatasetError;

/// Dataset identifier, allocated by the session that publishes the dataset.
///
/// Unpublished datasets carry [`DatasetId::UNASSIGNED`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(pub u64);

impl DatasetId {
    pub const UNASSIGNED: DatasetId = DatasetId(0);
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reference to one channel of one open dataset.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelRef {
    pub dataset: DatasetId,
    pub channel: String,
}

impl ChannelRef {
    pub fn new(dataset: DatasetId, channel: impl Into<String>) -> Self {
        Self {
            dataset,
            channel: channel.into(),
        }
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dataset, self.channel)
    }
}

/// A collection of channels sharing one time base.
///
/// Channel timestamps are seconds relative to `time_origin` (Unix seconds).
/// Immutable once built; owns its channels.
#[derive(Clone, Debug)]
pub struct Dataset {
    id: DatasetId,
    name: String,
    format: SourceFormat,
    adapter: String,
    time_origin: f64,
    channels: Vec<Arc<Channel>>,
    index: HashMap<String, usize>,
    meta: BTreeMap<String, String>,
}

impl Dataset {
    pub fn id(&self) -> DatasetId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> SourceFormat {
        self.format
    }

    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    pub fn time_origin(&self) -> f64 {
        self.time_origin
    }

    pub fn meta(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    /// Channels in load order.
    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels.iter()
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.name())
    }

    pub fn channel(&self, name: &str) -> Option<&Arc<Channel>> {
        self.index.get(name).map(|&i| &self.channels[i])
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_ref(&self, name: &str) -> Option<ChannelRef> {
        self.index.contains_key(name).then(|| ChannelRef::new(self.id, name))
    }

    /// Union of all channel time ranges.
    pub fn time_range(&self) -> Option<(f64, f64)> {
        self.channels
            .iter()
            .filter_map(|c| c.time_range())
            .reduce(|(a0, a1), (b0, b1)| (a0.min(b0), a1.max(b1)))
    }

    pub fn total_samples(&self) -> usize {
        self.channels.iter().map(|c| c.sample_count()).sum()
    }

    /// Union of all channel time ranges in Unix seconds
    pub fn absolute_time_range(&self) -> Option<(f64, f64)> {
        self.time_range()
            .map(|(first, last)| (self.time_origin + first, self.time_origin + last))
    }

    /// Stamp the dataset and its channels with the id it is published under
    pub(crate) fn assign_id(&mut self, id: DatasetId) {
        self.id = id;
        for channel in &mut self.channels {
            Arc::make_mut(channel).set_source_dataset(id.0);
        }
    }
}

/// Incrementally assembles a [`Dataset`], enforcing unique channel names.
#[derive(Debug)]
pub struct DatasetBuilder {
    dataset: Dataset,
}

impl DatasetBuilder {
    pub fn new(name: impl Into<String>, format: SourceFormat, adapter: impl Into<String>) -> Self {
        Self {
            dataset: Dataset {
                id: DatasetId::UNASSIGNED,
                name: name.into(),
                format,
                adapter: adapter.into(),
                time_origin: 0.0,
                channels: Vec::new(),
                index: HashMap::new(),
                meta: BTreeMap::new(),
            },
        }
    }

    pub fn time_origin(mut self, origin: f64) -> Self {
        self.dataset.time_origin = origin;
        self
    }

    pub fn set_time_origin(&mut self, origin: f64) {
        self.dataset.time_origin = origin;
    }

    pub fn meta(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.dataset.meta.insert(key.into(), value.into());
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dataset.index.contains_key(name)
    }

    /// Add an already validated channel.
    pub fn add_channel(&mut self, channel: Channel) -> Result<&mut Self, DatasetError> {
        if self.contains(channel.name()) {
            return Err(DatasetError::DuplicateChannel(channel.name().to_string()));
        }
        let channel = channel.with_source(SourceId {
            dataset: self.dataset.id.0,
            adapter: self.dataset.adapter.clone(),
        });
        self.dataset
            .index
            .insert(channel.name().to_string(), self.dataset.channels.len());
        self.dataset.channels.push(Arc::new(channel));
        Ok(self)
    }

    /// Validate raw buffers and add them as a channel.
    pub fn add_series(
        &mut self,
        name: impl Into<String>,
        unit: impl Into<crate::units::UnitTag>,
        timestamps: Vec<f64>,
        samples: Vec<f64>,
    ) -> Result<&mut Self, DatasetError> {
        let channel = Channel::new(name, unit, timestamps, samples)?;
        self.add_channel(channel)
    }

    pub fn finish(self) -> Dataset {
        self.dataset
    }
}
