//! The plug-in surface a protocol exposes to runners.

use crate::network::Network;
use crate::node::Node;

/// A protocol owns a network and knows how to populate it.
///
/// `init` creates the nodes, registers the periodic tasks and seeds the
/// first messages; after that a runner drives the simulation with
/// [`Network::run_ms`] and reads results off the nodes.
pub trait Protocol {
    type N: Node;

    /// Populate the network and register tasks.
    fn init(&mut self);

    /// The simulated network this protocol runs on.
    fn network(&mut self) -> &mut Network<Self::N>;
}
