//! Foundation types for the meshsim discrete-event protocol simulator.
//!
//! This crate provides the types shared by the simulator core and the
//! protocols running on top of it:
//!
//! - [`NodeId`]: dense index of a node in the network's node table
//! - [`SignerSet`]: growable bitset of node ids
//! - [`Position`]: planar coordinates used by distance-based latency
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not
//! depend on any other workspace crate, making it the foundation layer.

mod bitset;
mod position;

pub use bitset::SignerSet;
pub use position::{Position, MAP_HEIGHT, MAP_WIDTH, MAX_DISTANCE};

/// Dense, non-negative node identity.
///
/// A node's id equals its index in the network's node table; peer lists
/// and signer sets reference nodes by id rather than by pointer.
pub type NodeId = usize;
