//! Per-level aggregation state.

use std::collections::BTreeMap;

use meshsim_types::{NodeId, SignerSet};

use super::messages::{AggregationGossip, Attestation, PendingAggregation};

/// Lifecycle of a level within one aggregation process.
///
/// `Open` accepts contributions and emits; `IncomingComplete` accepts
/// nothing more but still emits one final cycle carrying the
/// `level_finished` flag; `Closed` is silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelState {
    Open,
    IncomingComplete,
    Closed,
}

/// One level of an aggregation process.
#[derive(Debug)]
pub struct Level {
    pub level: usize,
    /// Peers of this level in emission-rank order.
    peers: Vec<NodeId>,
    /// Cursor into `peers`, advanced by each emission cycle.
    cursor: usize,
    /// The level's theoretical full signer set.
    expected: SignerSet,
    /// Verified contributions, keyed by attestation hash.
    pub incoming: BTreeMap<u32, Attestation>,
    /// Union of verified signers, for the completeness check.
    coverage: SignerSet,
    /// What this node advertises at this level: the union of everything
    /// collected at levels strictly below. Refreshed by the process at
    /// every dissemination cycle.
    pub outgoing: BTreeMap<u32, Attestation>,
    /// Total signer count behind `outgoing`.
    pub outgoing_cardinality: usize,
    /// Contributions awaiting pairing verification.
    to_verify: Vec<PendingAggregation>,
    state: LevelState,
}

impl Level {
    /// Level 0: holds only the node's own attestation, never emits.
    pub(crate) fn leaf(own: Attestation) -> Self {
        let mut incoming = BTreeMap::new();
        incoming.insert(own.hash, own);
        Self {
            level: 0,
            peers: Vec::new(),
            cursor: 0,
            expected: SignerSet::new(),
            incoming,
            coverage: SignerSet::new(),
            outgoing: BTreeMap::new(),
            outgoing_cardinality: 0,
            to_verify: Vec::new(),
            state: LevelState::Closed,
        }
    }

    pub(crate) fn new(level: usize, peers: Vec<NodeId>) -> Self {
        let expected: SignerSet = peers.iter().copied().collect();
        Self {
            level,
            peers,
            cursor: 0,
            expected,
            incoming: BTreeMap::new(),
            coverage: SignerSet::new(),
            outgoing: BTreeMap::new(),
            outgoing_cardinality: 0,
            to_verify: Vec::new(),
            state: LevelState::Open,
        }
    }

    pub fn state(&self) -> LevelState {
        self.state
    }

    /// Whether this level accepts no further contributions.
    pub fn is_incoming_complete(&self) -> bool {
        !matches!(self.state, LevelState::Open)
    }

    pub(crate) fn is_emitting(&self) -> bool {
        !matches!(self.state, LevelState::Closed) && !self.peers.is_empty()
    }

    pub(crate) fn enqueue(&mut self, pending: PendingAggregation) {
        debug_assert_eq!(pending.level, self.level);
        self.to_verify.push(pending);
    }

    /// Merge a verified contribution and update the completeness state.
    pub(crate) fn merge_incoming(&mut self, pending: &PendingAggregation) {
        for attestation in &pending.attestations {
            match self.incoming.get_mut(&attestation.hash) {
                Some(existing) => existing.merge_from(attestation),
                None => {
                    self.incoming.insert(attestation.hash, attestation.clone());
                }
            }
            let mut contributed = attestation.who.clone();
            contributed.intersect_with(&self.expected);
            self.coverage.union_with(&contributed);
        }
        if self.state == LevelState::Open && self.coverage == self.expected {
            self.state = LevelState::IncomingComplete;
        }
    }

    /// Pick the most valuable pending contribution inside the rank
    /// window and remove it from the queue.
    ///
    /// Blacklisted senders and contributions with nothing new are
    /// pruned while scanning. Candidates are ordered by reception rank;
    /// only the first `window` are eligible, and the eligible entry
    /// adding the most unseen signers wins.
    pub(crate) fn take_best(
        &mut self,
        window: usize,
        blacklist: &SignerSet,
    ) -> Option<PendingAggregation> {
        if self.is_incoming_complete() {
            self.to_verify.clear();
            return None;
        }

        let queue = std::mem::take(&mut self.to_verify);
        let coverage = &self.coverage;
        let mut kept: Vec<PendingAggregation> = queue
            .into_iter()
            .filter(|p| !blacklist.contains(p.from) && Self::new_signers(coverage, p) > 0)
            .collect();
        if kept.is_empty() {
            self.to_verify = kept;
            return None;
        }

        let mut order: Vec<usize> = (0..kept.len()).collect();
        order.sort_by_key(|&i| (kept[i].rank, kept[i].from));
        let mut best = order[0];
        let mut best_score = Self::new_signers(&self.coverage, &kept[best]);
        for &i in order.iter().take(window.max(1)).skip(1) {
            let score = Self::new_signers(&self.coverage, &kept[i]);
            if score > best_score {
                best = i;
                best_score = score;
            }
        }

        let chosen = kept.swap_remove(best);
        self.to_verify = kept;
        Some(chosen)
    }

    fn new_signers(coverage: &SignerSet, pending: &PendingAggregation) -> usize {
        let mut union = SignerSet::new();
        for attestation in &pending.attestations {
            union.union_with(&attestation.who);
        }
        union.subtract(coverage);
        union.cardinality()
    }

    /// One emission cycle: contact the next peers in emission-rank
    /// order, skipping peers that told us they are finished.
    ///
    /// While `Open`, at most `window` peers are contacted and the
    /// cursor advances. On the first cycle after the level completed,
    /// every remaining peer is told `level_finished` and the level
    /// closes.
    pub(crate) fn disseminate(
        &mut self,
        own_hash: u32,
        finished_peers: &SignerSet,
        window: usize,
    ) -> Option<(Vec<NodeId>, AggregationGossip)> {
        if !self.is_emitting() || self.outgoing.is_empty() {
            return None;
        }

        let level_finished = self.state == LevelState::IncomingComplete;
        let dests: Vec<NodeId> = if level_finished {
            // Last word at this level: tell everyone still listening.
            self.state = LevelState::Closed;
            self.peers
                .iter()
                .copied()
                .filter(|p| !finished_peers.contains(*p))
                .collect()
        } else {
            let len = self.peers.len();
            let mut dests = Vec::new();
            let mut scanned = 0;
            while scanned < len && dests.len() < window {
                let peer = self.peers[(self.cursor + scanned) % len];
                scanned += 1;
                if !finished_peers.contains(peer) {
                    dests.push(peer);
                }
            }
            self.cursor = (self.cursor + scanned) % len;
            dests
        };

        if dests.is_empty() {
            return None;
        }
        let attestations: Vec<Attestation> = self.outgoing.values().cloned().collect();
        Some((
            dests,
            AggregationGossip::new(self.level, own_hash, level_finished, attestations),
        ))
    }
}
