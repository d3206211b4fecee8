use std::sync::Arc;

use super::plclog::PlcLogger;
use super::rti::RtiRecording;
use super::types::{Source, SourceAdapter, SourceFormat};
use crate::dataset::Dataset;
use crate::error::{LoadError, LoadFailure};

/// Number of leading bytes handed to [`SourceAdapter::detect`]
const DETECT_HEAD_LEN: usize = 64;

/// Adapter name reported when no adapter could be chosen
const AUTO_DETECT: &str = "auto-detect";

/// The set of adapters a session can load from.
///
/// Format dispatch happens only here: by file extension when an adapter for
/// that format is registered, otherwise by asking each adapter to recognize
/// the leading bytes. Failures are wrapped into [`LoadError`]; nothing is
/// retried.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    /// A registry without adapters
    pub fn new() -> Self {
        Self::default()
    }

    /// PLCLogger (following file series) and RTI
    pub fn with_builtin_adapters() -> Self {
        let mut registry = Self::new();
        registry.register(RtiRecording);
        registry.register(PlcLogger::with_series(true));
        registry
    }

    /// Add an adapter; later registrations for the same format take precedence
    pub fn register(&mut self, adapter: impl SourceAdapter + 'static) -> &mut Self {
        self.adapters.insert(0, Arc::new(adapter));
        self
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn SourceAdapter>> {
        self.adapters.iter()
    }

    pub fn find(&self, format: SourceFormat) -> Option<&Arc<dyn SourceAdapter>> {
        self.adapters.iter().find(|a| a.format() == format)
    }

    /// Pick the adapter for a source
    pub fn detect(&self, source: &Source) -> Result<&Arc<dyn SourceAdapter>, LoadError> {
        let name = source.display_name();
        let by_extension = source.extension().and_then(|e| SourceFormat::from_extension(&e));
        if let Some(adapter) = by_extension.and_then(|format| self.find(format)) {
            return Ok(adapter);
        }

        let head = source
            .head(DETECT_HEAD_LEN)
            .map_err(|e| LoadError::new(AUTO_DETECT, &name, LoadFailure::Io(e)))?;
        if let Some(adapter) = self.adapters.iter().find(|a| a.detect(source, &head)) {
            return Ok(adapter);
        }

        match by_extension {
            Some(format) => Err(LoadError::new(
                format.as_ref(),
                &name,
                LoadFailure::Unsupported(format!("no adapter registered for {} sources", format)),
            )),
            None => Err(LoadError::new(
                AUTO_DETECT,
                &name,
                LoadFailure::Unsupported("unrecognized source format".to_string()),
            )),
        }
    }

    /// Detect the format and load the source
    pub fn load(&self, source: &Source) -> Result<Dataset, LoadError> {
        let adapter = self.detect(source)?;
        Self::load_using(adapter.as_ref(), source)
    }

    /// Load with the adapter registered for `format`
    pub fn load_with(&self, format: SourceFormat, source: &Source) -> Result<Dataset, LoadError> {
        let adapter = self.find(format).ok_or_else(|| {
            LoadError::new(
                format.as_ref(),
                source.display_name(),
                LoadFailure::Unsupported(format!("no adapter registered for {} sources", format)),
            )
        })?;
        Self::load_using(adapter.as_ref(), source)
    }

    fn load_using(adapter: &dyn SourceAdapter, source: &Source) -> Result<Dataset, LoadError> {
        let name = source.display_name();
        tracing::debug!("Loading {} with the {} adapter", name, adapter.name());
        match adapter.load(source) {
            Ok(dataset) => {
                tracing::info!(
                    "Loaded {} ({}): {} channels, {} samples",
                    name,
                    adapter.name(),
                    dataset.channel_count(),
                    dataset.total_samples()
                );
                Ok(dataset)
            }
            Err(cause) => {
                tracing::warn!("{} adapter failed on {}: {}", adapter.name(), name, cause);
                Err(LoadError::new(adapter.name(), name, cause))
            }
        }
    }
}
