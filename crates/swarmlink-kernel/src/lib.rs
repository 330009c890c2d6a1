//! Core coordinator for SwarmLink.
//!
//! The kernel elects a Host per channel, keeps the peer roster, correlates
//! responses with their callbacks, queues sends while no Host is reachable,
//! and exposes a typed [`SwarmClient`] on top.

pub mod callbacks;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod state;
pub mod swarm;

pub use callbacks::{handler, Reply, ResponseHandler};
pub use coordinator::Coordinator;
pub use error::{CallbackError, KernelError, KernelResult};
pub use state::{CoordinatorEvent, CoordinatorStatus};
pub use swarm::{SwarmClient, SwarmEntry, SwarmEvent, SwarmPayload};
