//! The browsing session: open datasets, their resolution caches, the
//! selection and background loads.
//!
//! There is no global "current dataset"; everything hangs off an explicit
//! [`Session`]. Datasets are immutable once published and shared as `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;

use rayon::prelude::*;
use serde::Serialize;

use crate::adapters::{AdapterRegistry, Source};
use crate::channel::Channel;
use crate::config::BrowserConfig;
use crate::dataset::{ChannelRef, Dataset, DatasetId};
use crate::error::{ConfigurationError, LoadError, LoadFailure, SessionError};
use crate::query::{QueryEngine, QueryResult, TimeWindow};
use crate::resolution::{Bucket, ResolutionCache};
use crate::selection::{Selection, TraceStyle};
use crate::state::{palette_color, LoadingState};
use crate::units::{UnitPreferences, UnitTag};

/// Handle for a background load
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadTicket(u64);

/// Outcome of a background load, reported by [`Session::poll_loads`]
#[derive(Debug)]
pub enum LoadEvent {
    Loaded { ticket: LoadTicket, dataset: DatasetId },
    Failed { ticket: LoadTicket, error: LoadError },
}

/// Result from a background loading thread
enum LoadResult {
    Success(Box<Dataset>),
    Error(LoadError),
}

struct PendingLoad {
    ticket: LoadTicket,
    name: String,
    receiver: Receiver<LoadResult>,
}

/// One selected channel's query answer, in its display unit
#[derive(Clone, Debug, Serialize)]
pub struct Trace {
    pub channel: ChannelRef,
    pub unit: UnitTag,
    pub style: TraceStyle,
    /// RGB of `style.color_index` in the configured palette
    pub color: [u8; 3],
    pub result: QueryResult,
}

/// Explicit owner of everything a browser has open
pub struct Session {
    config: BrowserConfig,
    registry: AdapterRegistry,
    engine: QueryEngine,
    datasets: BTreeMap<DatasetId, Arc<Dataset>>,
    caches: RwLock<HashMap<ChannelRef, Arc<ResolutionCache>>>,
    selection: Selection,
    preferences: Option<UnitPreferences>,
    pending: Vec<PendingLoad>,
    cancelled: Vec<LoadEvent>,
    next_ticket: u64,
    next_dataset: u64,
}

impl Session {
    pub fn new(config: BrowserConfig, registry: AdapterRegistry) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            engine: QueryEngine::new(&config),
            selection: Selection::new(config.max_channels),
            config,
            registry,
            datasets: BTreeMap::new(),
            caches: RwLock::new(HashMap::new()),
            preferences: None,
            pending: Vec::new(),
            cancelled: Vec::new(),
            next_ticket: 1,
            next_dataset: 1,
        })
    }

    /// Default policy with the built-in adapters
    pub fn with_defaults() -> Self {
        Self {
            config: BrowserConfig::default(),
            registry: AdapterRegistry::with_builtin_adapters(),
            engine: QueryEngine::default(),
            datasets: BTreeMap::new(),
            caches: RwLock::new(HashMap::new()),
            selection: Selection::default(),
            preferences: None,
            pending: Vec::new(),
            cancelled: Vec::new(),
            next_ticket: 1,
            next_dataset: 1,
        }
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut AdapterRegistry {
        &mut self.registry
    }

    /// Display units applied to newly selected channels
    pub fn set_unit_preferences(&mut self, preferences: Option<UnitPreferences>) {
        self.preferences = preferences;
    }

    // ========================================================================
    // Datasets
    // ========================================================================

    /// Load a source on the calling thread and publish it
    pub fn open(&mut self, source: &Source) -> Result<DatasetId, LoadError> {
        let dataset = self.registry.load(source)?;
        Ok(self.insert_dataset(dataset))
    }

    /// Publish an already built dataset under a fresh id
    pub fn insert_dataset(&mut self, mut dataset: Dataset) -> DatasetId {
        let id = DatasetId(self.next_dataset);
        self.next_dataset += 1;
        dataset.assign_id(id);
        tracing::info!(
            "Opened dataset {} '{}' ({}): {} channels",
            id,
            dataset.name(),
            dataset.format(),
            dataset.channel_count()
        );
        self.datasets.insert(id, Arc::new(dataset));
        id
    }

    /// Drop a dataset together with its caches and selected channels
    pub fn close(&mut self, id: DatasetId) -> Result<Arc<Dataset>, SessionError> {
        let dataset = self.datasets.remove(&id).ok_or(SessionError::UnknownDataset(id.0))?;
        self.caches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| key.dataset != id);
        let deselected = self.selection.clear_dataset(id);
        tracing::info!(
            "Closed dataset {} '{}' ({} selected channels dropped)",
            id,
            dataset.name(),
            deselected
        );
        Ok(dataset)
    }

    pub fn dataset(&self, id: DatasetId) -> Option<&Arc<Dataset>> {
        self.datasets.get(&id)
    }

    /// Open datasets in the order they were created
    pub fn datasets(&self) -> impl Iterator<Item = &Arc<Dataset>> {
        self.datasets.values()
    }

    pub fn channel(&self, channel: &ChannelRef) -> Result<&Arc<Channel>, SessionError> {
        let dataset = self
            .datasets
            .get(&channel.dataset)
            .ok_or(SessionError::UnknownDataset(channel.dataset.0))?;
        dataset
            .channel(&channel.channel)
            .ok_or_else(|| SessionError::UnknownChannel {
                dataset: channel.dataset.0,
                channel: channel.channel.clone(),
            })
    }

    /// Earliest and latest timestamp over all open datasets, in Unix
    /// seconds. Datasets with different time origins are aligned first.
    pub fn time_range(&self) -> Option<(f64, f64)> {
        self.datasets
            .values()
            .filter_map(|d| d.absolute_time_range())
            .reduce(|(a0, a1), (b0, b1)| (a0.min(b0), a1.max(b1)))
    }

    /// Each open dataset's range in its own dataset-relative seconds
    pub fn dataset_time_ranges(&self) -> Vec<(DatasetId, (f64, f64))> {
        self.datasets
            .iter()
            .filter_map(|(&id, d)| d.time_range().map(|range| (id, range)))
            .collect()
    }

    // ========================================================================
    // Background loading
    // ========================================================================

    /// Load a source on a worker thread; collect the outcome with
    /// [`poll_loads`](Session::poll_loads).
    pub fn start_loading(&mut self, source: Source) -> LoadTicket {
        let ticket = LoadTicket(self.next_ticket);
        self.next_ticket += 1;

        let (sender, receiver) = channel();
        let registry = self.registry.clone();
        let name = source.display_name();
        thread::spawn(move || {
            let result = match registry.load(&source) {
                Ok(dataset) => LoadResult::Success(Box::new(dataset)),
                Err(e) => LoadResult::Error(e),
            };
            // The receiver is gone when the load was cancelled
            let _ = sender.send(result);
        });

        tracing::debug!("Started background load {:?} of {}", ticket, name);
        self.pending.push(PendingLoad { ticket, name, receiver });
        ticket
    }

    /// Publish finished background loads. Every ticket is reported exactly
    /// once, cancelled ones with [`LoadFailure::Cancelled`].
    pub fn poll_loads(&mut self) -> Vec<LoadEvent> {
        let mut events = std::mem::take(&mut self.cancelled);
        let mut finished = Vec::new();

        for (index, load) in self.pending.iter().enumerate() {
            match load.receiver.try_recv() {
                Ok(result) => finished.push((index, Some(result))),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => finished.push((index, None)),
            }
        }

        let mut completed = Vec::new();
        for (index, result) in finished.into_iter().rev() {
            completed.push((self.pending.remove(index), result));
        }

        // Publish in ticket order so dataset ids follow submission order
        for (load, result) in completed.into_iter().rev() {
            let event = match result {
                Some(LoadResult::Success(dataset)) => LoadEvent::Loaded {
                    ticket: load.ticket,
                    dataset: self.insert_dataset(*dataset),
                },
                Some(LoadResult::Error(error)) => LoadEvent::Failed {
                    ticket: load.ticket,
                    error,
                },
                None => LoadEvent::Failed {
                    ticket: load.ticket,
                    error: LoadError::new(
                        "loader",
                        load.name,
                        LoadFailure::Io(std::io::Error::other("loading thread exited without a result")),
                    ),
                },
            };
            events.push(event);
        }
        events
    }

    /// Abandon a background load. The dataset it produces is discarded and
    /// the next [`poll_loads`](Session::poll_loads) reports the cancellation.
    pub fn cancel_load(&mut self, ticket: LoadTicket) -> bool {
        let Some(index) = self.pending.iter().position(|l| l.ticket == ticket) else {
            return false;
        };
        let load = self.pending.remove(index);
        tracing::info!("Cancelled loading {}", load.name);
        self.cancelled.push(LoadEvent::Failed {
            ticket,
            error: LoadError::new("loader", load.name, LoadFailure::Cancelled),
        });
        true
    }

    pub fn loading_state(&self) -> LoadingState {
        if self.pending.is_empty() {
            LoadingState::Idle
        } else {
            LoadingState::Loading(self.pending.iter().map(|l| l.name.clone()).collect())
        }
    }

    // ========================================================================
    // Caches and queries
    // ========================================================================

    /// The resolution cache of a channel, created on first use.
    ///
    /// The arena lock is only held for the lookup and the insert; tiers are
    /// built later, outside of it.
    pub fn cache(&self, channel: &ChannelRef) -> Result<Arc<ResolutionCache>, SessionError> {
        if let Some(cache) = self
            .caches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
        {
            return Ok(Arc::clone(cache));
        }

        let data = Arc::clone(self.channel(channel)?);
        let cache = Arc::new(ResolutionCache::new(data, self.config.aggregation_ratio)?);
        let mut caches = self.caches.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(caches.entry(channel.clone()).or_insert(cache)))
    }

    /// Query one channel in its native unit
    pub fn query(
        &self,
        channel: &ChannelRef,
        window: TimeWindow,
        target_points: usize,
    ) -> Result<QueryResult, SessionError> {
        let cache = self.cache(channel)?;
        Ok(self.engine.query(&cache, window, target_points))
    }

    /// Query every selected channel (in parallel) in its display unit
    pub fn query_selection(&self, window: TimeWindow, target_points: usize) -> Vec<Trace> {
        let jobs: Vec<_> = self
            .selection
            .iter()
            .filter_map(|entry| {
                let cache = match self.cache(&entry.channel) {
                    Ok(cache) => cache,
                    Err(e) => {
                        tracing::warn!("Skipping {}: {}", entry.channel, e);
                        return None;
                    }
                };
                let converter = match self.selection.converter(entry) {
                    Ok(converter) => converter,
                    Err(e) => {
                        tracing::warn!("Skipping {}: {}", entry.channel, e);
                        return None;
                    }
                };
                Some((entry, cache, converter))
            })
            .collect();

        let engine = self.engine;
        let colorblind = self.config.colorblind;
        jobs.into_par_iter()
            .map(|(entry, cache, converter)| {
                let mut result = engine.query(&cache, window, target_points);
                if !converter.is_identity() {
                    for bucket in &mut result.points {
                        convert_bucket(bucket, |v| converter.apply(v), converter.is_decreasing());
                    }
                }
                Trace {
                    channel: entry.channel.clone(),
                    unit: entry.effective_unit().clone(),
                    style: entry.style,
                    color: palette_color(entry.style.color_index, colorblind),
                    result,
                }
            })
            .collect()
    }

    // ========================================================================
    // Selection
    // ========================================================================

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn selection_mut(&mut self) -> &mut Selection {
        &mut self.selection
    }

    /// Add a channel of an open dataset to the selection
    pub fn select(&mut self, channel: &ChannelRef) -> Result<(), SessionError> {
        let native = self.channel(channel)?.unit().clone();
        let preferred = self
            .preferences
            .as_ref()
            .and_then(|p| p.preferred_unit(&native, self.selection.units()));
        self.selection.add(channel.clone(), native)?;
        if let Some(unit) = preferred {
            self.selection.set_display_unit(channel, Some(unit))?;
        }
        Ok(())
    }

    pub fn deselect(&mut self, channel: &ChannelRef) -> Result<(), SessionError> {
        self.selection.remove(channel)?;
        Ok(())
    }

    pub fn set_display_unit(&mut self, channel: &ChannelRef, unit: Option<UnitTag>) -> Result<(), SessionError> {
        self.selection.set_display_unit(channel, unit)?;
        Ok(())
    }
}

fn convert_bucket(bucket: &mut Bucket, convert: impl Fn(f64) -> f64, decreasing: bool) {
    let (min, max) = (convert(bucket.value_min), convert(bucket.value_max));
    bucket.value_mean = convert(bucket.value_mean);
    if decreasing {
        bucket.value_min = max;
        bucket.value_max = min;
    } else {
        bucket.value_min = min;
        bucket.value_max = max;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{plclog, SourceFormat};
    use crate::dataset::DatasetBuilder;
    use crate::error::SelectionError;
    use std::time::{Duration, Instant};

    fn engine_dataset() -> Dataset {
        let timestamps: Vec<f64> = (0..1000).map(|i| i as f64 * 0.1).collect();
        let mut builder = DatasetBuilder::new("bench", SourceFormat::PlcLogger, "memory");
        builder
            .add_series(
                "Oil temp [°C]",
                "°C",
                timestamps.clone(),
                (0..1000).map(|i| (i % 101) as f64).collect(),
            )
            .unwrap()
            .add_series("Speed", "km/h", timestamps, vec![50.0; 1000])
            .unwrap();
        builder.finish()
    }

    fn wait_for_events(session: &mut Session, count: usize) -> Vec<LoadEvent> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut events = Vec::new();
        while events.len() < count && Instant::now() < deadline {
            events.extend(session.poll_loads());
            thread::sleep(Duration::from_millis(5));
        }
        events
    }

    #[test]
    fn test_open_query_close() {
        let mut session = Session::with_defaults();
        let bytes = plclog::encode(45292.0, &[0.0, 0.5, 1.0], "", "", &[("Boost [kPa]", vec![100.0, 180.0, 120.0])]);
        let id = session.open(&Source::memory("run.plc", bytes)).unwrap();

        let boost = ChannelRef::new(id, "Boost [kPa]");
        assert_eq!(session.channel(&boost).unwrap().unit().as_str(), "kPa");
        let result = session.query(&boost, TimeWindow::new(0.0, 1.0), 100).unwrap();
        assert_eq!(result.level, 0);
        assert_eq!(result.points.iter().map(|b| b.value_max).collect::<Vec<_>>(), vec![100.0, 180.0, 120.0]);

        session.select(&boost).unwrap();
        assert_eq!(session.time_range(), Some((1_704_067_200.0, 1_704_067_201.0)));
        assert_eq!(session.dataset_time_ranges(), vec![(id, (0.0, 1.0))]);

        session.close(id).unwrap();
        assert!(session.selection().is_empty());
        assert!(session.caches.read().unwrap().is_empty());
        assert!(matches!(session.query(&boost, TimeWindow::new(0.0, 1.0), 10), Err(SessionError::UnknownDataset(_))));
        assert!(session.close(id).is_err());
        assert_eq!(session.time_range(), None);
    }

    #[test]
    fn test_time_range_aligns_origins() {
        let mut session = Session::with_defaults();
        // Second recording starts one day (86400 s) after the first
        let day_one = plclog::encode(45292.0, &[0.0, 10.0], "", "", &[("a", vec![1.0, 2.0])]);
        let day_two = plclog::encode(45293.0, &[5.0, 20.0], "", "", &[("b", vec![1.0, 2.0])]);
        let first = session.open(&Source::memory("day1.plc", day_one)).unwrap();
        let second = session.open(&Source::memory("day2.plc", day_two)).unwrap();

        assert_eq!(session.time_range(), Some((1_704_067_200.0, 1_704_067_200.0 + 86_420.0)));
        assert_eq!(
            session.dataset_time_ranges(),
            vec![(first, (0.0, 10.0)), (second, (5.0, 20.0))]
        );
    }

    #[test]
    fn test_dataset_ids_are_per_session() {
        let mut a = Session::with_defaults();
        let mut b = Session::with_defaults();
        let first = a.insert_dataset(engine_dataset());
        let second = a.insert_dataset(engine_dataset());
        assert_eq!(first, DatasetId(1));
        assert_eq!(second, DatasetId(2));
        assert_eq!(b.insert_dataset(engine_dataset()), DatasetId(1));

        let speed = a.channel(&ChannelRef::new(second, "Speed")).unwrap();
        assert_eq!(speed.source().dataset, 2);
    }

    #[test]
    fn test_cache_is_shared() {
        let mut session = Session::with_defaults();
        let id = session.insert_dataset(engine_dataset());
        let speed = ChannelRef::new(id, "Speed");
        let a = session.cache(&speed).unwrap();
        let b = session.cache(&speed).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        assert!(matches!(
            session.cache(&ChannelRef::new(id, "nope")),
            Err(SessionError::UnknownChannel { .. })
        ));
    }

    #[test]
    fn test_query_selection_converts_units() {
        let mut session = Session::with_defaults();
        let id = session.insert_dataset(engine_dataset());
        let oil = ChannelRef::new(id, "Oil temp [°C]");
        let speed = ChannelRef::new(id, "Speed");
        session.select(&oil).unwrap();
        session.select(&speed).unwrap();

        assert!(matches!(
            session.set_display_unit(&oil, Some("m".into())),
            Err(SessionError::Selection(SelectionError::IncompatibleUnit(_)))
        ));
        session.set_display_unit(&oil, Some("°F".into())).unwrap();

        let traces = session.query_selection(TimeWindow::new(0.0, 20.0), 2000);
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].channel, oil);
        assert_eq!(traces[0].unit.as_str(), "°F");
        // Samples 0..=100 °C
        let first = traces[0].result.points[0];
        assert!((first.value_mean - 32.0).abs() < 1e-9);
        let max = traces[0].result.points.iter().map(|b| b.value_max).fold(f64::MIN, f64::max);
        assert!((max - 212.0).abs() < 1e-9);
        assert_eq!(traces[1].unit.as_str(), "km/h");
        assert_eq!(traces[1].color, crate::state::CHART_COLORS[1]);
        assert!(traces[1].result.points.iter().all(|b| b.value_mean == 50.0));
    }

    #[test]
    fn test_colorblind_palette() {
        let config = BrowserConfig {
            colorblind: true,
            ..BrowserConfig::default()
        };
        let mut session = Session::new(config, AdapterRegistry::new()).unwrap();
        let id = session.insert_dataset(engine_dataset());
        session.select(&ChannelRef::new(id, "Oil temp [°C]")).unwrap();
        session.select(&ChannelRef::new(id, "Speed")).unwrap();

        let traces = session.query_selection(TimeWindow::new(0.0, 10.0), 100);
        assert_eq!(traces[0].color, crate::state::COLORBLIND_COLORS[0]);
        assert_eq!(traces[1].color, crate::state::COLORBLIND_COLORS[1]);
    }

    #[test]
    fn test_unit_preferences_apply_on_select() {
        let mut session = Session::with_defaults();
        let id = session.insert_dataset(engine_dataset());
        session.set_unit_preferences(Some(UnitPreferences {
            speed: crate::units::SpeedUnit::Mph,
            ..UnitPreferences::default()
        }));
        let speed = ChannelRef::new(id, "Speed");
        session.select(&speed).unwrap();
        assert_eq!(session.selection().get(&speed).unwrap().effective_unit().as_str(), "mph");
    }

    #[test]
    fn test_background_load() {
        let mut session = Session::with_defaults();
        let good = session.start_loading(Source::memory(
            "bus.jsonl",
            b"{\"timestamp\": {\"sec\": 1}, \"rpm\": 900}\n{\"timestamp\": {\"sec\": 2}, \"rpm\": 950}".to_vec(),
        ));
        let bad = session.start_loading(Source::memory("notes.txt", b"hello".to_vec()));
        assert!(session.loading_state().is_loading());

        let events = wait_for_events(&mut session, 2);
        assert_eq!(events.len(), 2);
        for event in events {
            match event {
                LoadEvent::Loaded { ticket, dataset } => {
                    assert_eq!(ticket, good);
                    assert!(session.dataset(dataset).unwrap().channel("rpm").is_some());
                }
                LoadEvent::Failed { ticket, error } => {
                    assert_eq!(ticket, bad);
                    assert_eq!(error.source_name, "notes.txt");
                }
            }
        }
        assert_eq!(session.loading_state(), LoadingState::Idle);
    }

    #[test]
    fn test_cancelled_load_is_discarded() {
        let mut session = Session::with_defaults();
        let ticket = session.start_loading(Source::memory(
            "bus.jsonl",
            b"{\"timestamp\": {\"sec\": 1}, \"rpm\": 900}".to_vec(),
        ));
        assert!(session.cancel_load(ticket));
        assert!(!session.cancel_load(ticket));
        assert_eq!(session.loading_state(), LoadingState::Idle);

        thread::sleep(Duration::from_millis(50));
        let events = session.poll_loads();
        assert_eq!(events.len(), 1);
        match &events[0] {
            LoadEvent::Failed { ticket: t, error } => {
                assert_eq!(*t, ticket);
                assert_eq!(error.source_name, "bus.jsonl");
                assert!(matches!(error.cause, LoadFailure::Cancelled));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(session.poll_loads().is_empty());
        assert_eq!(session.datasets().count(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = BrowserConfig {
            aggregation_ratio: 1,
            ..BrowserConfig::default()
        };
        assert!(Session::new(config, AdapterRegistry::new()).is_err());
    }
}
