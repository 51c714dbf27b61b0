//! The Handel node: windows, ranks, blacklist and message intake.

use std::collections::BTreeMap;
use std::sync::Arc;

use meshsim_core::{Network, Node, NodeCore, NodeLayout};
use meshsim_types::{NodeId, SignerSet};
use rand_chacha::ChaCha8Rng;

use super::messages::{AggregationGossip, PendingAggregation};
use super::process::AggregationProcess;
use super::HandelParameters;

/// Initial adaptive verification window.
const INITIAL_WINDOW: usize = 16;
/// Window ceiling.
const MAX_WINDOW: usize = 128;

/// A level-based aggregator node.
#[derive(Debug)]
pub struct HandelNode {
    core: NodeCore,
    params: Arc<HandelParameters>,
    /// Current consensus height; bumped every period.
    pub height: u64,
    /// Peers per level in emission-rank order. The ranks never change
    /// during a run, so processes share these lists.
    pub(crate) peers_per_level: Vec<Vec<NodeId>>,
    /// Node-level reception ranks; each process snapshots its own
    /// mutable copy.
    pub(crate) reception_ranks: Vec<u32>,
    /// Running aggregation processes by height.
    pub running: BTreeMap<u64, AggregationProcess>,
    /// Senders of bad signatures. Kept across heights.
    pub blacklist: SignerSet,
    /// Adaptive verification window, in [1, 128].
    pub cur_window: usize,
    /// Pairing time scaled by this node's speed ratio, at least 1 ms.
    pub node_pairing_time: u64,
    /// Faulty nodes emit contributions that fail verification.
    pub faulty: bool,
    pub(crate) last_process_verified: u64,
}

impl Node for HandelNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }
}

impl HandelNode {
    pub(crate) fn new(
        rng: &mut ChaCha8Rng,
        layout: &dyn NodeLayout,
        params: Arc<HandelParameters>,
        faulty: bool,
    ) -> Self {
        let core = NodeCore::new(rng, layout);
        let node_pairing_time = ((params.pairing_time as f64) * core.speed_ratio).max(1.0) as u64;
        let height = 1000;
        Self {
            core,
            params,
            height,
            peers_per_level: Vec::new(),
            reception_ranks: Vec::new(),
            running: BTreeMap::new(),
            blacklist: SignerSet::new(),
            cur_window: INITIAL_WINDOW,
            node_pairing_time,
            faulty,
            last_process_verified: height,
        }
    }

    pub(crate) fn successful_verification(&mut self) {
        self.cur_window = (self.cur_window * 2).min(MAX_WINDOW);
    }

    pub(crate) fn failed_verification(&mut self) {
        self.cur_window = (self.cur_window / 4).max(1);
    }

    /// All signer ids this node should hold once levels `1..=level` are
    /// complete: the contiguous id block sharing the bits above the
    /// lowest `level`, excluding the node itself.
    ///
    /// # Panics
    ///
    /// `level` must be at least 1.
    pub fn peers_up_to_level(&self, level: u32) -> SignerSet {
        assert!(level >= 1, "level={level}");
        let id = self.core.id;
        let mask = (1usize << level) - 1;
        let start = (mask | id) ^ mask;
        let end = (id | mask).min(self.params.node_count - 1);

        let mut result = SignerSet::new();
        if start <= end {
            result.set_range(start, end);
        }
        result.clear(id);
        result
    }

    /// The level at which this node communicates with `other`.
    ///
    /// # Panics
    ///
    /// Querying a node's level with itself is a contract violation.
    pub fn communication_level_with(&self, other: NodeId) -> usize {
        communication_level(self.core.id, other, self.params.level_count())
    }
}

/// Smallest `l` after which the ids, right-shifted `l` times, coincide.
pub(crate) fn communication_level(a: NodeId, b: NodeId, level_count: usize) -> usize {
    assert_ne!(a, b, "same id: {b}");
    let (mut sa, mut sb) = (a, b);
    for level in 1..=level_count {
        sa >>= 1;
        sb >>= 1;
        if sa == sb {
            return level;
        }
    }
    panic!("nodes {a} and {b} do not communicate within {level_count} levels");
}

/// Intake of an aggregate contribution.
///
/// Messages for unknown heights are dropped (too early or too late), as
/// is any second message from the same sender within one process. An
/// accepted sender's reception rank is bumped by the population size,
/// saturating instead of wrapping.
pub(crate) fn on_new_aggregation(
    network: &mut Network<HandelNode>,
    from: NodeId,
    to: NodeId,
    gossip: &AggregationGossip,
) {
    let node = &mut network.nodes[to];
    let node_count = node.params.node_count;

    let Some(process) = node.running.get_mut(&gossip.height) else {
        return;
    };

    if gossip.level_finished {
        process.finished_peers.set(from);
    }

    if process.received_peers.contains(from) {
        return;
    }
    process.received_peers.set(from);

    let rank = process.reception_ranks[from];
    process.reception_ranks[from] = rank.saturating_add(node_count as u32);

    let level = &mut process.levels[gossip.level];
    if !level.is_incoming_complete() {
        level.enqueue(PendingAggregation {
            from,
            level: gossip.level,
            own_hash: gossip.own_hash,
            rank,
            attestations: gossip.attestations.clone(),
        });
    }
}
