//! The per-height aggregation state machine.

use std::collections::BTreeMap;

use meshsim_types::{NodeId, SignerSet};

use super::level::Level;
use super::messages::{AggregationGossip, Attestation, PendingAggregation};
use super::PERIOD_TIME;

/// Coordinates level-by-level combination of attestations for one
/// consensus height.
#[derive(Debug)]
pub struct AggregationProcess {
    pub height: u64,
    /// Hash of this node's own attestation.
    pub own_hash: u32,
    pub start_at: u64,
    /// Deadline; the process is dropped once a new one starts past it.
    pub end_at: u64,
    /// Per-process copy of the reception ranks: they mutate as messages
    /// arrive, while the node-level table seeds the next process.
    pub reception_ranks: Vec<u32>,
    /// Peers that told us they finished the level we share with them.
    pub finished_peers: SignerSet,
    /// Peers we already accepted a message from in this process.
    pub received_peers: SignerSet,
    /// `levels[0]` holds the own attestation; `levels[l]` the XOR block
    /// of size `2^(l-1)`.
    pub levels: Vec<Level>,
    last_level_verified: usize,
    full_cardinality: usize,
}

impl AggregationProcess {
    pub(crate) fn new(
        own: Attestation,
        start_at: u64,
        reception_ranks: &[u32],
        peers_per_level: &[Vec<NodeId>],
    ) -> Self {
        let height = own.height;
        let own_hash = own.hash;
        let mut levels = Vec::with_capacity(peers_per_level.len());
        levels.push(Level::leaf(own));
        for (index, peers) in peers_per_level.iter().enumerate().skip(1) {
            levels.push(Level::new(index, peers.clone()));
        }

        Self {
            height,
            own_hash,
            start_at,
            end_at: start_at + PERIOD_TIME,
            reception_ranks: reception_ranks.to_vec(),
            finished_peers: SignerSet::new(),
            received_peers: SignerSet::new(),
            levels,
            last_level_verified: 0,
            full_cardinality: 0,
        }
    }

    /// The best contribution to verify across levels, scanning from the
    /// last verified level and wrapping. Returns `None` when nothing
    /// inside the window is worth a pairing.
    pub fn best_to_verify(
        &mut self,
        window: usize,
        blacklist: &SignerSet,
    ) -> Option<PendingAggregation> {
        let count = self.levels.len();
        let mut index = self.last_level_verified;
        for _ in 0..count {
            if let Some(pending) = self.levels[index].take_best(window, blacklist) {
                self.last_level_verified = index;
                return Some(pending);
            }
            index = (index + 1) % count;
        }
        None
    }

    /// Walk the levels bottom-up, setting each emitting level's
    /// outgoing aggregate to the union of everything below it.
    pub fn update_all_outgoing(&mut self) {
        let mut accumulated: BTreeMap<u32, Attestation> = BTreeMap::new();
        let mut size = 0usize;
        for level in &mut self.levels {
            if level.is_emitting() {
                level.outgoing = accumulated.clone();
                level.outgoing_cardinality = size;
            }
            for attestation in level.incoming.values() {
                size += attestation.who.cardinality();
                match accumulated.get_mut(&attestation.hash) {
                    Some(existing) => existing.merge_from(attestation),
                    None => {
                        accumulated.insert(attestation.hash, attestation.clone());
                    }
                }
            }
        }
        self.full_cardinality = accumulated
            .values()
            .map(|a| a.who.cardinality())
            .sum();
    }

    /// Signer count of the full aggregate (union over all levels), as
    /// of the last dissemination cycle.
    pub fn full_aggregate_cardinality(&self) -> usize {
        self.full_cardinality
    }

    /// One dissemination cycle: refresh the outgoing aggregates, then
    /// emit at every open level.
    pub(crate) fn disseminate(
        &mut self,
        window: usize,
    ) -> Vec<(Vec<NodeId>, AggregationGossip)> {
        self.update_all_outgoing();
        let mut sends = Vec::new();
        for level in &mut self.levels {
            if let Some(send) = level.disseminate(self.own_hash, &self.finished_peers, window) {
                sends.push(send);
            }
        }
        sends
    }

}
