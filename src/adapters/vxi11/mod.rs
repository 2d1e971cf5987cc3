//! VXI-11 client: ONC RPC over TCP to the device core channel.

pub mod instrument;
pub mod portmap;
pub mod rpc;
pub mod xdr;

pub use instrument::{Vxi11Connector, Vxi11Instrument, Vxi11Options};
