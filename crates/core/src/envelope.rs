//! Compact carriers for in-flight messages.
//!
//! Envelopes dominate the simulator's working set: a single broadcast to
//! thousands of peers must not allocate per recipient. The
//! multi-destination variant therefore stores only
//! `(send_time, seed, dests)` and recomputes each arrival time on demand
//! from the seeded jitter stream, trading CPU for memory. Destinations
//! are pre-sorted by arrival time at send, so the cursor walks them in
//! delivery order and the head is always the next recipient.

use std::sync::Arc;

use meshsim_types::NodeId;

use crate::latency::pseudo_random;
use crate::message::Message;
use crate::network::Network;
use crate::node::Node;

/// An in-flight message plus routing metadata.
///
/// Envelopes due at the same millisecond are chained through `next`, so
/// the engine's bucket map holds one head per timestamp.
#[derive(Debug)]
pub enum Envelope<N: Node> {
    /// One recipient; the arrival time was resolved at send.
    Single {
        message: Arc<dyn Message<N>>,
        from: NodeId,
        to: NodeId,
        arrival: u64,
        next: Option<Box<Envelope<N>>>,
    },
    /// Many recipients; arrival times are recomputed lazily.
    Multi {
        message: Arc<dyn Message<N>>,
        from: NodeId,
        send_time: u64,
        seed: u64,
        /// Destinations in ascending arrival-time order.
        dests: Vec<NodeId>,
        /// Index of the next destination to deliver to.
        cursor: usize,
        next: Option<Box<Envelope<N>>>,
    },
}

impl<N: Node> Envelope<N> {
    pub fn single(message: Arc<dyn Message<N>>, from: NodeId, to: NodeId, arrival: u64) -> Self {
        Envelope::Single {
            message,
            from,
            to,
            arrival,
            next: None,
        }
    }

    /// Build a multi-destination envelope from the arrival-sorted
    /// `(arrival, dest)` list computed at send time. The times are
    /// discarded; only the destination order is retained.
    pub fn multi(
        message: Arc<dyn Message<N>>,
        from: NodeId,
        arrivals: &[(u64, NodeId)],
        send_time: u64,
        seed: u64,
    ) -> Self {
        debug_assert!(
            arrivals.windows(2).all(|w| w[0].0 <= w[1].0),
            "destinations must be sorted by arrival time"
        );
        Envelope::Multi {
            message,
            from,
            send_time,
            seed,
            dests: arrivals.iter().map(|&(_, dest)| dest).collect(),
            cursor: 0,
            next: None,
        }
    }

    pub fn message(&self) -> &Arc<dyn Message<N>> {
        match self {
            Envelope::Single { message, .. } | Envelope::Multi { message, .. } => message,
        }
    }

    pub fn from(&self) -> NodeId {
        match self {
            Envelope::Single { from, .. } | Envelope::Multi { from, .. } => *from,
        }
    }

    /// The recipient at the current cursor.
    pub fn next_dest(&self) -> NodeId {
        match self {
            Envelope::Single { to, .. } => *to,
            Envelope::Multi { dests, cursor, .. } => dests[*cursor],
        }
    }

    /// Arrival time of the recipient at the current cursor.
    ///
    /// For the multi variant this recomputes
    /// `send_time + latency(from, dest, pseudo_random(dest, seed))`,
    /// which is exactly the value the send path sorted by.
    pub fn next_arrival_time(&self, network: &Network<N>) -> u64 {
        match self {
            Envelope::Single { arrival, .. } => *arrival,
            Envelope::Multi {
                from,
                send_time,
                seed,
                dests,
                cursor,
                ..
            } => {
                let dest = dests[*cursor];
                let latency = network.latency_model().latency(
                    network.nodes[*from].core(),
                    network.nodes[dest].core(),
                    pseudo_random(dest, *seed),
                );
                send_time + latency
            }
        }
    }

    /// Advance the cursor past the recipient just served. No-op for the
    /// single variant, which is dropped after its one delivery.
    pub fn mark_read(&mut self) {
        if let Envelope::Multi { cursor, .. } = self {
            *cursor += 1;
        }
    }

    /// Whether the cursor still points at a live destination.
    pub fn has_next_reader(&self) -> bool {
        match self {
            Envelope::Single { .. } => false,
            Envelope::Multi { dests, cursor, .. } => *cursor < dests.len(),
        }
    }

    pub(crate) fn take_next(&mut self) -> Option<Box<Envelope<N>>> {
        match self {
            Envelope::Single { next, .. } | Envelope::Multi { next, .. } => next.take(),
        }
    }

    pub(crate) fn set_next(&mut self, chain: Option<Box<Envelope<N>>>) {
        match self {
            Envelope::Single { next, .. } | Envelope::Multi { next, .. } => *next = chain,
        }
    }
}
