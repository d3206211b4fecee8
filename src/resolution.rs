//! Multi-resolution min/max/mean pyramid over one channel.
//!
//! Level 0 is the raw channel and is never copied. Level `k >= 1` groups
//! `ratio` buckets of level `k - 1` (or `ratio` raw samples for level 1), so
//! its nominal bucket width is `base_dt * ratio^k`. Tiers are built lazily,
//! bottom-up, at most once each.

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::Serialize;

use crate::channel::Channel;
use crate::error::ConfigurationError;

/// Aggregate of a contiguous run of samples.
///
/// `count` is the number of non-NaN samples covered; a bucket that only saw
/// NaN has NaN statistics and a count of zero.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Bucket {
    pub t_min: f64,
    pub t_max: f64,
    pub value_min: f64,
    pub value_max: f64,
    pub value_mean: f64,
    pub count: usize,
}

impl Bucket {
    /// A bucket holding a single raw sample
    pub fn raw(t: f64, value: f64) -> Self {
        Self {
            t_min: t,
            t_max: t,
            value_min: value,
            value_max: value,
            value_mean: value,
            count: usize::from(!value.is_nan()),
        }
    }

    /// Aggregate raw samples; `times` and `values` are non-empty and equally long
    fn from_samples(times: &[f64], values: &[f64]) -> Self {
        let mut acc = Accumulator::new(times[0], times[times.len() - 1]);
        for &v in values.iter().filter(|v| !v.is_nan()) {
            acc.add(v, v, v, 1);
        }
        acc.finish()
    }

    /// Aggregate consecutive buckets; `children` is non-empty
    pub fn merge(children: &[Bucket]) -> Self {
        let mut acc = Accumulator::new(children[0].t_min, children[children.len() - 1].t_max);
        for child in children.iter().filter(|c| c.count > 0) {
            acc.add(child.value_min, child.value_max, child.value_mean, child.count);
        }
        acc.finish()
    }

    /// Whether the bucket covers at least one non-NaN sample
    pub fn has_values(&self) -> bool {
        self.count > 0
    }
}

struct Accumulator {
    t_min: f64,
    t_max: f64,
    min: f64,
    max: f64,
    sum: f64,
    count: usize,
}

impl Accumulator {
    fn new(t_min: f64, t_max: f64) -> Self {
        Self {
            t_min,
            t_max,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            count: 0,
        }
    }

    fn add(&mut self, min: f64, max: f64, mean: f64, count: usize) {
        self.min = self.min.min(min);
        self.max = self.max.max(max);
        self.sum += mean * count as f64;
        self.count += count;
    }

    fn finish(self) -> Bucket {
        if self.count == 0 {
            return Bucket {
                t_min: self.t_min,
                t_max: self.t_max,
                value_min: f64::NAN,
                value_max: f64::NAN,
                value_mean: f64::NAN,
                count: 0,
            };
        }
        Bucket {
            t_min: self.t_min,
            t_max: self.t_max,
            value_min: self.min,
            value_max: self.max,
            value_mean: self.sum / self.count as f64,
            count: self.count,
        }
    }
}

/// One materialized level of the pyramid
#[derive(Clone, Debug)]
pub struct ResolutionTier {
    level: usize,
    bucket_width: f64,
    buckets: Vec<Bucket>,
}

impl ResolutionTier {
    pub fn level(&self) -> usize {
        self.level
    }

    /// Nominal time span of one bucket
    pub fn bucket_width(&self) -> f64 {
        self.bucket_width
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Buckets overlapping `[t0, t1]`, partially covered edge buckets included
    fn clip(&self, t0: f64, t1: f64) -> &[Bucket] {
        let start = self.buckets.partition_point(|b| b.t_max < t0);
        let end = self.buckets.partition_point(|b| b.t_min <= t1);
        &self.buckets[start..end.max(start)]
    }
}

/// Lazily built resolution pyramid for one channel.
///
/// Safe to share between threads: concurrent first callers of [`tier`]
/// block on the in-flight build and all observe the same tier.
///
/// [`tier`]: ResolutionCache::tier
pub struct ResolutionCache {
    channel: Arc<Channel>,
    ratio: usize,
    base_dt: f64,
    /// Slot `i` holds level `i + 1`
    tiers: Vec<OnceLock<ResolutionTier>>,
}

impl ResolutionCache {
    /// Create an empty cache; no tier is built until requested.
    pub fn new(channel: Arc<Channel>, ratio: usize) -> Result<Self, ConfigurationError> {
        if ratio <= 1 {
            return Err(ConfigurationError::AggregationRatio(ratio));
        }

        let n = channel.sample_count();
        let base_dt = match channel.time_range() {
            Some((first, last)) if n > 1 && last > first => (last - first) / (n - 1) as f64,
            _ => f64::MIN_POSITIVE,
        };

        let mut max_level = 0;
        let mut count = n;
        if n > 1 {
            while count > 1 {
                count = count.div_ceil(ratio);
                max_level += 1;
            }
        }

        Ok(Self {
            channel,
            ratio,
            base_dt,
            tiers: (0..max_level).map(|_| OnceLock::new()).collect(),
        })
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn ratio(&self) -> usize {
        self.ratio
    }

    /// Mean sampling interval of the raw channel
    pub fn base_dt(&self) -> f64 {
        self.base_dt
    }

    /// Coarsest level; the first one holding a single bucket (0 for channels
    /// with fewer than two samples)
    pub fn max_level(&self) -> usize {
        self.tiers.len()
    }

    pub fn bucket_width(&self, level: usize) -> f64 {
        self.base_dt * (self.ratio as f64).powi(level as i32)
    }

    /// Whether `level` has been materialized
    pub fn is_built(&self, level: usize) -> bool {
        level >= 1 && self.tiers.get(level - 1).is_some_and(|slot| slot.get().is_some())
    }

    /// The tier for `level`, building it and every finer tier first if needed.
    ///
    /// Returns `None` for level 0 (the raw channel) and above [`max_level`].
    ///
    /// [`max_level`]: ResolutionCache::max_level
    pub fn tier(&self, level: usize) -> Option<&ResolutionTier> {
        if level == 0 {
            return None;
        }
        let slot = self.tiers.get(level - 1)?;
        Some(slot.get_or_init(|| self.build_tier(level)))
    }

    fn build_tier(&self, level: usize) -> ResolutionTier {
        let buckets: Vec<Bucket> = if level == 1 {
            self.channel
                .timestamps()
                .chunks(self.ratio)
                .zip(self.channel.samples().chunks(self.ratio))
                .map(|(times, values)| Bucket::from_samples(times, values))
                .collect()
        } else {
            match self.tier(level - 1) {
                Some(finer) => finer.buckets.chunks(self.ratio).map(Bucket::merge).collect(),
                None => Vec::new(),
            }
        };

        tracing::debug!(
            "Built tier {} of '{}': {} buckets",
            level,
            self.channel.name(),
            buckets.len()
        );

        ResolutionTier {
            level,
            bucket_width: self.bucket_width(level),
            buckets,
        }
    }

    /// Build every tier up front
    pub fn build_all(&self) {
        self.tier(self.max_level());
    }

    /// Largest level whose bucket width does not exceed `time_per_pixel`.
    ///
    /// Falls back to level 0 when even tier 1 is too coarse.
    pub fn select_level(&self, time_per_pixel: f64) -> usize {
        if time_per_pixel.is_nan() {
            return 0;
        }
        let mut selected = 0;
        for level in 1..=self.max_level() {
            if self.bucket_width(level) <= time_per_pixel {
                selected = level;
            } else {
                break;
            }
        }
        selected
    }

    /// Buckets of `level` overlapping `[t0, t1]`.
    ///
    /// Level 0 yields one bucket per raw sample inside the window. Levels
    /// above [`max_level`](ResolutionCache::max_level) are clamped to it.
    pub fn points(&self, level: usize, t0: f64, t1: f64) -> Vec<Bucket> {
        if t0.is_nan() || t1.is_nan() || t1 < t0 {
            return Vec::new();
        }
        let level = level.min(self.max_level());
        match self.tier(level) {
            Some(tier) => tier.clip(t0, t1).to_vec(),
            None => {
                let range = self.channel.index_range(t0, t1);
                self.channel.timestamps()[range.clone()]
                    .iter()
                    .zip(&self.channel.samples()[range])
                    .map(|(&t, &v)| Bucket::raw(t, v))
                    .collect()
            }
        }
    }
}

impl fmt::Debug for ResolutionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let built: Vec<usize> = (1..=self.max_level()).filter(|&l| self.is_built(l)).collect();
        f.debug_struct("ResolutionCache")
            .field("channel", &self.channel.name())
            .field("ratio", &self.ratio)
            .field("max_level", &self.max_level())
            .field("built", &built)
            .finish()
    }
}
