//! Core types for SwarmLink, a brokerless peer coordination layer.
//!
//! This crate defines the data structures shared by the wire transports and
//! the coordinator kernel: identities, envelopes, roster records, the payload
//! serializer seam, and configuration. It contains no networking.

pub mod config;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod peer;
pub mod serializer;

pub use config::{CoordinatorConfig, TransportKind};
pub use envelope::{Acknowledgement, Envelope, EnvelopeKind};
pub use error::{SwarmError, SwarmResult};
pub use identity::{Identity, Role};
pub use peer::{Liveness, LivenessThresholds, PeerState, RemotePeer, Roster, SweepReport};
pub use serializer::{JsonSerializer, PayloadSerializer};
