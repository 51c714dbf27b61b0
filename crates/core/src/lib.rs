//! Deterministic discrete-event engine for protocol simulation.
//!
//! This crate provides the simulator core:
//!
//! - [`Network`]: node table, peer graph, clock, and the event engine
//! - [`Envelope`]: compact one- or many-destination message carrier
//! - [`Message`]: the delivery hook protocols implement
//! - [`LatencyModel`] / [`NodeLayout`]: pluggable latency and placement
//! - [`Protocol`]: the surface external runners drive
//!
//! # Architecture
//!
//! The engine is single-threaded and cooperative in simulated time:
//!
//! ```text
//! Protocol::init() → Network::send / register_task → Network::run_ms()
//!                         → Message::action() → more sends / tasks
//! ```
//!
//! All randomness flows through one seeded `ChaCha8Rng` owned by the
//! network. Given the same seed and parameters, two runs produce
//! identical delivery schedules, counters and protocol outcomes.

pub mod envelope;
mod event_queue;
pub mod latency;
pub mod layout;
pub mod message;
pub mod network;
pub mod node;
pub mod protocol;
pub mod registry;
mod task;

pub use envelope::Envelope;
pub use latency::{pseudo_random, DistanceLatency, FixedLatency, LatencyModel};
pub use layout::{NodeLayout, RandomLayout};
pub use message::Message;
pub use network::{Network, NetworkStats};
pub use node::{Node, NodeCore};
pub use protocol::Protocol;
pub use registry::{latency_by_name, layout_by_name, RegistryError};
