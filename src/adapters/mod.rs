//! Source adapters: one per logged-signal format.
//!
//! - [`plclog`] - PLCLogger binary files, plain or zipped (optionally a chained series)
//! - [`rti`] - RTI recording databases and their JSON-lines exports
//!
//! TDM files have a [`SourceFormat`] slot but no built-in adapter; a TDM
//! reader plugs in through [`AdapterRegistry::register`].

pub mod plclog;
pub mod registry;
pub mod rti;
pub mod types;

pub use plclog::PlcLogger;
pub use registry::AdapterRegistry;
pub use rti::RtiRecording;
pub use types::{Source, SourceAdapter, SourceBytes, SourceFormat};
