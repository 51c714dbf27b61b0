//! Attestations and the aggregation gossip message.

use meshsim_core::{Message, Network};
use meshsim_types::{NodeId, SignerSet};

use super::node::{self, HandelNode};

/// A signed claim at a consensus height: a hash identifying the signed
/// content plus the bitset of contributing signer ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub height: u64,
    pub hash: u32,
    /// Contributing signer ids.
    pub who: SignerSet,
}

impl Attestation {
    /// A single signer's attestation.
    pub fn individual(height: u64, hash: u32, signer: NodeId) -> Self {
        let mut who = SignerSet::new();
        who.set(signer);
        Self { height, hash, who }
    }

    /// Fold another attestation over the same content into this one.
    pub fn merge_from(&mut self, other: &Attestation) {
        debug_assert_eq!(self.hash, other.hash, "cannot merge different content");
        self.who.union_with(&other.who);
    }
}

/// A received contribution queued for pairing verification.
#[derive(Debug, Clone)]
pub struct PendingAggregation {
    pub from: NodeId,
    pub level: usize,
    pub own_hash: u32,
    /// Sender's reception rank at the time the contribution arrived.
    pub rank: u32,
    pub attestations: Vec<Attestation>,
}

/// One cycle's aggregate, gossiped to peers of a level.
///
/// `level_finished` tells the receiver the sender has completed this
/// level and should not be contacted for it anymore.
#[derive(Debug, Clone)]
pub struct AggregationGossip {
    pub level: usize,
    pub height: u64,
    /// Hash of the sender's own attestation.
    pub own_hash: u32,
    pub level_finished: bool,
    /// Everything the sender collected below this level.
    pub attestations: Vec<Attestation>,
}

impl AggregationGossip {
    /// # Panics
    ///
    /// The attestation list must not be empty.
    pub fn new(
        level: usize,
        own_hash: u32,
        level_finished: bool,
        attestations: Vec<Attestation>,
    ) -> Self {
        assert!(
            !attestations.is_empty(),
            "attestations should not be empty"
        );
        let height = attestations[0].height;
        Self {
            level,
            height,
            own_hash,
            level_finished,
            attestations,
        }
    }
}

impl Message<HandelNode> for AggregationGossip {
    fn size(&self) -> usize {
        1
    }

    fn action(&self, network: &mut Network<HandelNode>, from: NodeId, to: NodeId) {
        node::on_new_aggregation(network, from, to, self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attestation_merge() {
        let mut a = Attestation::individual(7, 0, 3);
        let b = Attestation::individual(7, 0, 5);
        a.merge_from(&b);
        assert_eq!(a.who, [3usize, 5].into_iter().collect());
        assert_eq!(a.height, 7);
    }

    #[test]
    #[should_panic(expected = "attestations should not be empty")]
    fn test_empty_gossip_is_a_contract_violation() {
        AggregationGossip::new(1, 0, false, Vec::new());
    }
}
