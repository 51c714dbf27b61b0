//! Node identity and per-node accounting.

use meshsim_types::{NodeId, Position};
use rand_chacha::ChaCha8Rng;

use crate::layout::NodeLayout;

/// State every simulated node carries regardless of protocol.
///
/// Protocol node types embed a `NodeCore` and expose it through the
/// [`Node`] trait; the engine reads and updates it on every send,
/// delivery and task dispatch.
#[derive(Debug, Clone)]
pub struct NodeCore {
    /// Dense id, equal to the node's index in the network table.
    /// Assigned by [`Network::add_node`](crate::Network::add_node).
    pub id: NodeId,
    /// Location on the map, drawn from the layout at construction.
    pub position: Position,
    /// CPU heterogeneity factor. Protocols multiply their per-node
    /// compute costs (e.g. pairing time) by this ratio.
    pub speed_ratio: f64,
    /// Bytes handed to the network, counted once per destination.
    pub bytes_sent: u64,
    /// Bytes delivered to this node.
    pub bytes_received: u64,
    /// Logical messages sent, counted once per destination.
    pub msg_sent: u64,
    /// Envelope deliveries received.
    pub msg_received: u64,
    /// Simulated time at which the protocol declared this node done.
    pub done_at: Option<u64>,
    /// Dead nodes receive no deliveries and run no tasks.
    pub down: bool,
}

impl NodeCore {
    /// Create a core with position and speed drawn from `layout`.
    ///
    /// The id is a placeholder until the node is registered with
    /// [`Network::add_node`](crate::Network::add_node).
    pub fn new(rng: &mut ChaCha8Rng, layout: &dyn NodeLayout) -> Self {
        Self {
            id: NodeId::MAX,
            position: layout.position(rng),
            speed_ratio: layout.speed_ratio(rng),
            bytes_sent: 0,
            bytes_received: 0,
            msg_sent: 0,
            msg_received: 0,
            done_at: None,
            down: false,
        }
    }
}

/// Access to the engine-facing state of a protocol node.
pub trait Node: 'static {
    fn core(&self) -> &NodeCore;
    fn core_mut(&mut self) -> &mut NodeCore;
}
