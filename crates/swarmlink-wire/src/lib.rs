//! SwarmLink wire layer: byte transports for coordinator envelopes.
//!
//! ## Architecture
//!
//! - **TransportDevice**: the contract shared by every transport (start,
//!   stop, fire-and-forget send, inbound event channel)
//! - **NetworkDevice**: TCP listener and sender, routable across machines
//! - **LocalDevice**: Unix domain socket listener and sender, single machine
//! - **frame**: 4-byte big-endian length prefix + JSON envelope body
//! - **address**: endpoint naming and machine address discovery

pub mod address;
pub mod device;
pub mod error;
pub mod frame;
#[cfg(unix)]
pub mod ipc;
pub mod tcp;

pub use device::{open_devices, DeviceEvent, DevicePair, StartOutcome, TransportDevice};
pub use error::{WireError, WireResult};
#[cfg(unix)]
pub use ipc::LocalDevice;
pub use tcp::NetworkDevice;
