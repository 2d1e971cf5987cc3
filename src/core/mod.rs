pub mod acquisition;
pub mod connection;
pub mod engine;
pub mod waveform;

pub use crate::domain::model::{ChannelSelection, RawAcquisition, ScopeModel};
pub use crate::domain::ports::{ConfigProvider, Connector, Instrument, Storage};
pub use crate::utils::error::Result;
pub use connection::{ConnectionSettings, ScopeConnection};
pub use engine::{AcquisitionEngine, AcquisitionReport};
