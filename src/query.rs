//! View queries: "give me about N points representing `[t0, t1]`".
//!
//! The engine picks the coarsest tier whose buckets are no wider than one
//! pixel, clips it to the window and, when uneven sampling density still
//! leaves too many buckets, merges neighbours so the answer stays within
//! `point_budget_factor * target_points`.

use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::BrowserConfig;
use crate::resolution::{Bucket, ResolutionCache};

/// A closed time interval `[start, end]` in dataset seconds
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

impl TimeWindow {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn span(&self) -> f64 {
        self.end - self.start
    }

    /// Finite and strictly increasing
    pub fn is_valid(&self) -> bool {
        self.start.is_finite() && self.end.is_finite() && self.end > self.start
    }
}

impl From<(f64, f64)> for TimeWindow {
    fn from((start, end): (f64, f64)) -> Self {
        Self { start, end }
    }
}

/// A window plus the number of horizontal pixels it is drawn into
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewQuery {
    pub window: TimeWindow,
    pub target_points: usize,
}

impl ViewQuery {
    pub fn new(window: impl Into<TimeWindow>, target_points: usize) -> Self {
        Self {
            window: window.into(),
            target_points,
        }
    }

    /// Seconds covered by one output point
    pub fn time_per_pixel(&self) -> f64 {
        self.window.span() / self.target_points as f64
    }
}

/// Buckets representing one channel over a window
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QueryResult {
    /// Tier the buckets were taken from (0 = raw samples)
    pub level: usize,
    pub points: Vec<Bucket>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Answers view queries against resolution caches
#[derive(Clone, Copy, Debug)]
pub struct QueryEngine {
    point_budget_factor: usize,
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new(&BrowserConfig::default())
    }
}

impl QueryEngine {
    /// The budget factor is not capped; huge factors simply never merge.
    pub fn new(config: &BrowserConfig) -> Self {
        Self {
            point_budget_factor: config.point_budget_factor.max(1),
        }
    }

    pub fn point_budget_factor(&self) -> usize {
        self.point_budget_factor
    }

    /// Points for one channel. Invalid windows and a zero target give an
    /// empty result.
    pub fn query(&self, cache: &ResolutionCache, window: TimeWindow, target_points: usize) -> QueryResult {
        if target_points == 0 || !window.is_valid() {
            return QueryResult::default();
        }

        let view = ViewQuery::new(window, target_points);
        let level = cache.select_level(view.time_per_pixel());
        let mut points = cache.points(level, window.start, window.end);
        tracing::debug!(
            "Query '{}' [{}, {}] x{}: tier {}, {} buckets",
            cache.channel().name(),
            window.start,
            window.end,
            target_points,
            level,
            points.len()
        );

        if points.len() > self.point_budget_factor.saturating_mul(target_points) {
            points = merge_to_budget(&points, target_points);
        }
        QueryResult { level, points }
    }

    pub fn run(&self, cache: &ResolutionCache, view: &ViewQuery) -> QueryResult {
        self.query(cache, view.window, view.target_points)
    }

    /// Query several channels at once; each one picks its own tier.
    pub fn query_many(&self, caches: &[Arc<ResolutionCache>], view: &ViewQuery) -> Vec<QueryResult> {
        caches.par_iter().map(|cache| self.run(cache, view)).collect()
    }
}

/// Merge consecutive buckets so at most `target` remain
fn merge_to_budget(points: &[Bucket], target: usize) -> Vec<Bucket> {
    let group = points.len().div_ceil(target);
    points.chunks(group).map(Bucket::merge).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use rand::{Rng, SeedableRng};

    fn uniform_cache(n: usize, ratio: usize) -> ResolutionCache {
        let timestamps: Vec<f64> = (0..n).map(|i| i as f64 * 0.001).collect();
        let samples: Vec<f64> = (0..n).map(|i| ((i as f64) * 0.01).sin()).collect();
        let channel = Channel::new("sine", "V", timestamps, samples).unwrap();
        ResolutionCache::new(Arc::new(channel), ratio).unwrap()
    }

    fn assert_bounded(cache: &ResolutionCache, engine: &QueryEngine, rng: &mut impl Rng) {
        let (first, last) = cache.channel().time_range().unwrap();
        for target in [1, 10, 640, 2000] {
            let mut windows = vec![TimeWindow::new(first, last), TimeWindow::new(first - 5.0, last + 5.0)];
            for _ in 0..5 {
                let a = rng.gen_range(first..last);
                let b = rng.gen_range(a..=last);
                windows.push(TimeWindow::new(a, b));
            }
            for window in windows {
                let result = engine.query(cache, window, target);
                assert!(
                    result.len() <= 3 * target,
                    "{} samples, target {}: {} points",
                    cache.channel().sample_count(),
                    target,
                    result.len()
                );
            }
        }
    }

    #[test]
    fn test_point_bound_across_sizes() {
        let engine = QueryEngine::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        for n in [10, 100, 1_000, 10_000, 100_000, 1_000_000] {
            assert_bounded(&uniform_cache(n, 4), &engine, &mut rng);
        }
    }

    #[test]
    #[ignore = "slow: ten million samples"]
    fn test_point_bound_ten_million() {
        let engine = QueryEngine::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(12);
        assert_bounded(&uniform_cache(10_000_000, 4), &engine, &mut rng);
    }

    #[test]
    fn test_uneven_density_is_merged() {
        // A dense burst followed by a long sparse tail
        let mut timestamps: Vec<f64> = (0..1000).map(|i| i as f64 * 0.001).collect();
        timestamps.extend((1..=10).map(|i| i as f64 * 100.0));
        let mut samples = vec![0.0; 1010];
        samples[500] = 42.0;
        let channel = Channel::new("burst", "V", timestamps, samples).unwrap();
        let cache = ResolutionCache::new(Arc::new(channel), 4).unwrap();

        let result = QueryEngine::default().query(&cache, TimeWindow::new(0.0, 1000.0), 100);
        assert_eq!(result.level, 1);
        assert!(result.len() <= 100);
        let max = result.points.iter().map(|b| b.value_max).fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(max, 42.0);
        assert_eq!(result.points.iter().map(|b| b.count).sum::<usize>(), 1010);
    }

    #[test]
    fn test_zoomed_in_returns_raw_samples() {
        let cache = uniform_cache(10_000, 4);
        let result = QueryEngine::default().query(&cache, TimeWindow::new(0.9995, 1.1005), 2000);
        assert_eq!(result.level, 0);
        assert_eq!(result.len(), 101);
        assert!(result.points.iter().all(|b| b.t_min == b.t_max));
    }

    #[test]
    fn test_tier_follows_time_per_pixel() {
        let cache = uniform_cache(1_000_000, 4);
        let engine = QueryEngine::default();
        let full = TimeWindow::new(0.0, 999.999);

        // 1e6 samples over 1000 px: 1000 samples per pixel; 4^4 = 256 <= 1000 < 4^5
        let result = engine.query(&cache, full, 1000);
        assert_eq!(result.level, 4);
        // ~3900 tier-4 buckets exceed the budget and are merged by four
        assert!((900..=1000).contains(&result.len()), "{}", result.len());
    }

    #[test]
    fn test_invalid_queries_are_empty() {
        let cache = uniform_cache(100, 4);
        let engine = QueryEngine::default();
        assert!(engine.query(&cache, TimeWindow::new(0.05, 0.05), 10).is_empty());
        assert!(engine.query(&cache, TimeWindow::new(0.08, 0.02), 10).is_empty());
        assert!(engine.query(&cache, TimeWindow::new(f64::NAN, 1.0), 10).is_empty());
        assert!(engine.query(&cache, TimeWindow::new(0.0, f64::INFINITY), 10).is_empty());
        assert!(engine.query(&cache, TimeWindow::new(0.0, 0.1), 0).is_empty());
        // Entirely outside the channel
        assert!(engine.query(&cache, TimeWindow::new(5.0, 6.0), 10).is_empty());
    }

    #[test]
    fn test_huge_budgets_do_not_overflow() {
        let cache = uniform_cache(100, 4);
        let window = TimeWindow::new(0.0, 1.0);

        let result = QueryEngine::default().query(&cache, window, usize::MAX / 2 + 1);
        assert_eq!(result.level, 0);
        assert_eq!(result.len(), 100);

        let config = BrowserConfig::from_json_str(&format!(r#"{{"point_budget_factor": {}}}"#, usize::MAX)).unwrap();
        let engine = QueryEngine::new(&config);
        assert_eq!(engine.point_budget_factor(), usize::MAX);
        let result = engine.query(&cache, window, 10);
        assert!(result.len() <= 100);
        assert_eq!(result.points.iter().map(|b| b.count).sum::<usize>(), 100);
    }

    #[test]
    fn test_query_many_in_parallel() {
        let caches: Vec<Arc<ResolutionCache>> = [1_000, 50_000, 7]
            .into_iter()
            .map(|n| Arc::new(uniform_cache(n, 4)))
            .collect();
        let engine = QueryEngine::default();

        let zoomed = engine.query_many(&caches, &ViewQuery::new((0.0, 1.0), 2000));
        assert!(zoomed.iter().all(|r| r.level == 0));
        assert_eq!(zoomed.iter().map(QueryResult::len).collect::<Vec<_>>(), vec![1000, 1001, 7]);

        // Each channel picks its own tier
        let wide = engine.query_many(&caches, &ViewQuery::new((0.0, 49.999), 100));
        assert_eq!(wide[0].level, 4);
        assert_eq!(wide[1].level, 4);
        assert_eq!(wide[2].level, 2);
        assert!(wide.iter().all(|r| r.len() <= 300));
    }
}
