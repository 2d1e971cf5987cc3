//! Remote communication with Rohde & Schwarz oscilloscopes over VXI-11.

pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::{CliConfig, ScopeCommand};

pub use adapters::storage::LocalStorage;
pub use adapters::vxi11::{Vxi11Connector, Vxi11Instrument, Vxi11Options};
pub use config::ScopeConfig;
pub use core::{AcquisitionEngine, ConnectionSettings, ScopeConnection};
pub use domain::model::{ChannelSelection, Identity, ScopeModel, TESTED_MODELS};
pub use utils::error::{Result, ScopeError};

/// Package version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Connection to a scope over VXI-11.
pub type Vxi11Scope = ScopeConnection<Vxi11Connector>;
