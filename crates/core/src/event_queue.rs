//! Time-bucketed storage for in-flight envelopes.
//!
//! One bucket per millisecond, held in a `BTreeMap` so the engine can
//! promote its cursor straight to the earliest pending bucket when the
//! timeline is sparse. Within a bucket, envelopes form a singly linked
//! chain through their `next` pointer; insertion pushes at the head, so
//! same-millisecond delivery is LIFO. Protocols must not depend on the
//! order of same-time deliveries.

use std::collections::BTreeMap;

use crate::envelope::Envelope;
use crate::node::Node;

pub(crate) struct EnvelopeQueue<N: Node> {
    buckets: BTreeMap<u64, Box<Envelope<N>>>,
}

impl<N: Node> EnvelopeQueue<N> {
    pub(crate) fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }

    /// Push `envelope` at the head of the bucket for `at`.
    pub(crate) fn insert(&mut self, at: u64, mut envelope: Box<Envelope<N>>) {
        envelope.set_next(self.buckets.remove(&at));
        self.buckets.insert(at, envelope);
    }

    /// Detach and return the head of the bucket for `at`, if any. The
    /// returned envelope's chain pointer is cleared.
    pub(crate) fn pop_at(&mut self, at: u64) -> Option<Box<Envelope<N>>> {
        let mut head = self.buckets.remove(&at)?;
        if let Some(rest) = head.take_next() {
            self.buckets.insert(at, rest);
        }
        Some(head)
    }

    /// Earliest non-empty bucket.
    pub(crate) fn next_time(&self) -> Option<u64> {
        self.buckets.keys().next().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::network::Network;
    use crate::node::NodeCore;
    use meshsim_types::NodeId;
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestNode {
        core: NodeCore,
    }

    impl Node for TestNode {
        fn core(&self) -> &NodeCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut NodeCore {
            &mut self.core
        }
    }

    #[derive(Debug)]
    struct Noop;

    impl Message<TestNode> for Noop {
        fn size(&self) -> usize {
            0
        }
        fn action(&self, _network: &mut Network<TestNode>, _from: NodeId, _to: NodeId) {}
    }

    fn envelope(to: NodeId, arrival: u64) -> Box<Envelope<TestNode>> {
        Box::new(Envelope::single(
            Arc::new(Noop) as Arc<dyn Message<TestNode>>,
            0,
            to,
            arrival,
        ))
    }

    #[test]
    fn test_same_time_chain_is_lifo() {
        let mut queue = EnvelopeQueue::new();
        queue.insert(5, envelope(1, 5));
        queue.insert(5, envelope(2, 5));
        queue.insert(5, envelope(3, 5));

        let order: Vec<NodeId> = std::iter::from_fn(|| queue.pop_at(5).map(|e| e.next_dest()))
            .collect();
        assert_eq!(order, vec![3, 2, 1]);
        assert!(queue.pop_at(5).is_none());
        assert_eq!(queue.next_time(), None);
    }

    #[test]
    fn test_next_time_finds_earliest_bucket() {
        let mut queue = EnvelopeQueue::new();
        assert_eq!(queue.next_time(), None);
        queue.insert(900, envelope(1, 900));
        queue.insert(20, envelope(2, 20));
        assert_eq!(queue.next_time(), Some(20));
        queue.pop_at(20);
        assert_eq!(queue.next_time(), Some(900));
    }
}
