//! signal-browser - core of a browser for large logged-signal datasets
//!
//! Heterogeneous log formats are normalized into one model of named,
//! unit-tagged, time-indexed channels, and each channel gets a lazily built
//! min/max/mean resolution pyramid so that a window of millions of samples
//! can be answered with roughly one point per pixel.
//!
//! ## Module Structure
//!
//! - [`units`] - Unit tags, conversions, the unit registry and display preferences
//! - [`channel`] - Immutable time series
//! - [`dataset`] - Channels loaded together from one source
//! - [`adapters`] - Log format adapters and the registry that dispatches to them
//!   - `plclog` - PLCLogger binary files (plain or zipped)
//!   - `rti` - RTI recordings (SQLite databases or JSON lines)
//! - [`resolution`] - Resolution tiers and the per-channel cache
//! - [`query`] - View queries over resolution caches
//! - [`selection`] - Plotted channels, order, display units and change events
//! - [`session`] - Open datasets, cache arena and background loading
//! - [`config`] - Policy values
//! - [`state`] - Shared constants and loading state
//! - [`error`] - Error types

pub mod adapters;
pub mod channel;
pub mod config;
pub mod dataset;
pub mod error;
pub mod query;
pub mod resolution;
pub mod selection;
pub mod session;
pub mod state;
pub mod units;
