//! The delivery hook protocols implement.

use std::fmt;

use meshsim_types::NodeId;

use crate::network::Network;
use crate::node::Node;

/// A payload delivered to one or many destinations.
///
/// The engine shares a single message instance between all destinations
/// of one logical send (`Arc<dyn Message<N>>`), so implementations hold
/// immutable data. `action` runs once per delivery, in arrival-time
/// order, and may mutate node state, send further messages and register
/// tasks through the network handle.
pub trait Message<N: Node>: fmt::Debug {
    /// Wire size in bytes, charged to the sender once per destination
    /// at send time and to each receiver at delivery time.
    fn size(&self) -> usize;

    /// Deliver this message to `to`.
    fn action(&self, network: &mut Network<N>, from: NodeId, to: NodeId);
}
