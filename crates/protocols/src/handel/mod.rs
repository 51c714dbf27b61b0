//! Handel-style level-based signature aggregation.
//!
//! Node ids are leaves of a binary tree. Level `l` of a node is the set
//! of peers sharing all id bits above the lowest `l`; a node receives
//! the aggregate of a peer's sub-tree at the level it shares with that
//! peer and advertises, at each level, the union of everything it
//! collected at the levels below. Contributions pass through a pairing
//! verification queue ranked by per-sender reception ranks, gated by an
//! adaptive window that doubles on success and quarters on failure, and
//! a global blacklist of misbehaving senders.
//!
//! One [`AggregationProcess`] runs per consensus height; a new height
//! starts every [`PERIOD_TIME`] ms.

mod level;
mod messages;
mod node;
mod process;

pub use level::{Level, LevelState};
pub use messages::{AggregationGossip, Attestation, PendingAggregation};
pub use node::HandelNode;
pub use process::AggregationProcess;

use std::collections::BTreeSet;
use std::sync::Arc;

use meshsim_core::{
    latency_by_name, layout_by_name, Network, Node, NodeLayout, Protocol, RegistryError,
};
use meshsim_types::NodeId;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Interval between consecutive aggregation heights, in ms. Each
/// process's deadline is its start plus one period.
pub const PERIOD_TIME: u64 = 6_000;

/// Parameter record for [`Handel`]; serializes flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandelParameters {
    /// Number of aggregating nodes.
    pub node_count: usize,
    /// Base pairing time in ms; each node scales it by its speed ratio.
    pub pairing_time: u64,
    /// Period of the dissemination task, in ms.
    pub dissemination_period: u64,
    /// Nodes whose contributions fail pairing verification.
    pub faulty_node_count: usize,
    pub node_layout_name: String,
    pub network_latency_name: String,
}

impl Default for HandelParameters {
    fn default() -> Self {
        Self {
            node_count: 64,
            pairing_time: 4,
            dissemination_period: 20,
            faulty_node_count: 0,
            node_layout_name: "random".to_string(),
            network_latency_name: "distance".to_string(),
        }
    }
}

impl HandelParameters {
    /// Number of aggregation levels: `ceil(log2(node_count))`.
    pub fn level_count(&self) -> usize {
        ceil_log2(self.node_count)
    }
}

pub(crate) fn ceil_log2(n: usize) -> usize {
    assert!(n >= 2, "need at least two nodes, got {n}");
    (usize::BITS - (n - 1).leading_zeros()) as usize
}

/// The level-based aggregation protocol.
pub struct Handel {
    params: Arc<HandelParameters>,
    layout: Box<dyn NodeLayout>,
    network: Network<HandelNode>,
}

impl Handel {
    /// Build the protocol; fails on unknown latency or layout names.
    pub fn new(params: HandelParameters, seed: u64) -> Result<Self, RegistryError> {
        let latency = latency_by_name(&params.network_latency_name)?;
        let layout = layout_by_name(&params.node_layout_name)?;
        Ok(Self {
            params: Arc::new(params),
            layout,
            network: Network::new(latency, seed),
        })
    }

    pub fn params(&self) -> &HandelParameters {
        &self.params
    }
}

impl Protocol for Handel {
    type N = HandelNode;

    fn init(&mut self) {
        let params = Arc::clone(&self.params);
        let level_count = params.level_count();

        let mut faulty: BTreeSet<NodeId> = BTreeSet::new();
        while faulty.len() < params.faulty_node_count {
            faulty.insert(self.network.rng.gen_range(0..params.node_count));
        }

        for i in 0..params.node_count {
            let node = HandelNode::new(
                &mut self.network.rng,
                self.layout.as_ref(),
                Arc::clone(&params),
                faulty.contains(&i),
            );
            self.network.add_node(node);
        }

        // Static per-node tables: emission-ranked peer lists per level
        // and the initial reception-rank permutation, both seeded.
        for id in 0..params.node_count {
            let mut per_level: Vec<Vec<NodeId>> = vec![Vec::new(); level_count + 1];
            for peer in 0..params.node_count {
                if peer != id {
                    let level = node::communication_level(id, peer, level_count);
                    per_level[level].push(peer);
                }
            }
            for list in per_level.iter_mut().skip(1) {
                list.shuffle(&mut self.network.rng);
            }

            let mut permutation: Vec<NodeId> = (0..params.node_count).collect();
            permutation.shuffle(&mut self.network.rng);
            let mut ranks = vec![0u32; params.node_count];
            for (position, &who) in permutation.iter().enumerate() {
                ranks[who] = position as u32;
            }

            let node = &mut self.network.nodes[id];
            node.peers_per_level = per_level;
            node.reception_ranks = ranks;
        }

        for id in 0..params.node_count {
            let pairing = self.network.nodes[id].node_pairing_time;
            self.network
                .register_periodic_task(1, PERIOD_TIME, id, move |net| {
                    start_new_aggregation(net, id);
                });
            self.network.register_conditional_task(
                params.dissemination_period,
                params.dissemination_period,
                id,
                move |net| dissemination(net, id),
                |n: &HandelNode| !n.running.is_empty(),
                |_| true,
            );
            self.network.register_conditional_task(
                pairing,
                pairing,
                id,
                move |net| verify(net, id),
                |n: &HandelNode| !n.running.is_empty(),
                |_| true,
            );
        }

        info!(
            node_count = params.node_count,
            levels = level_count,
            faulty = params.faulty_node_count,
            "initialized Handel protocol"
        );
    }

    fn network(&mut self) -> &mut Network<HandelNode> {
        &mut self.network
    }
}

// ─── Periodic tasks ───

/// Bump the height and open the aggregation process for it, dropping
/// processes whose deadline has passed.
fn start_new_aggregation(network: &mut Network<HandelNode>, id: NodeId) {
    let now = network.time();
    // Models disagreement about the attested data: a fifth of the nodes
    // see a different hash, a twenty-fifth yet another, and so on.
    let mut hash = 0u32;
    while network.rng.gen::<f64>() < 0.2 {
        hash += 1;
    }

    let node = &mut network.nodes[id];
    node.height += 1;
    let height = node.height;
    node.running.retain(|_, process| process.end_at > now);

    let own = Attestation::individual(height, hash, node.core().id);
    let process = AggregationProcess::new(own, now, &node.reception_ranks, &node.peers_per_level);
    let previous = node.running.insert(height, process);
    assert!(
        previous.is_none(),
        "aggregation process already running at height {height}"
    );
}

/// Recompute every running process's outgoing aggregates and emit one
/// cycle of level messages.
fn dissemination(network: &mut Network<HandelNode>, id: NodeId) {
    let window = network.nodes[id].cur_window;
    let sends = {
        let node = &mut network.nodes[id];
        let mut out = Vec::new();
        for process in node.running.values_mut() {
            out.extend(process.disseminate(window));
        }
        out
    };
    for (dests, gossip) in sends {
        network.send_all(gossip, id, &dests);
    }
}

/// Pick the best pending contribution across running processes
/// (round-robin from the last verified height) and schedule its pairing
/// completion just before the next verification tick.
fn verify(network: &mut Network<HandelNode>, id: NodeId) {
    let chosen = {
        let node = &mut network.nodes[id];
        if node.running.is_empty() {
            return;
        }
        let window = node.cur_window;
        let blacklist = node.blacklist.clone();
        let start = node.last_process_verified;

        let heights: Vec<u64> = node.running.keys().copied().collect();
        let mut chosen = None;
        for height in heights
            .iter()
            .copied()
            .filter(|&h| h > start)
            .chain(heights.iter().copied().filter(|&h| h <= start))
        {
            let process = node
                .running
                .get_mut(&height)
                .expect("height taken from the running set");
            if let Some(pending) = process.best_to_verify(window, &blacklist) {
                chosen = Some((height, pending));
                break;
            }
        }
        if let Some((height, _)) = &chosen {
            node.last_process_verified = *height;
        }
        chosen
    };

    if let Some((height, pending)) = chosen {
        let pairing = network.nodes[id].node_pairing_time;
        // Land just before the next verification tick so that cycle
        // already sees the merged state.
        let at = network.time() + pairing - 1;
        network.register_task(at, id, move |net| {
            update_verified_signatures(net, id, height, &pending);
        });
    }
}

/// Pairing completed: merge the contribution on success, or blacklist
/// the sender and shrink the window on a bad signature.
fn update_verified_signatures(
    network: &mut Network<HandelNode>,
    id: NodeId,
    height: u64,
    pending: &PendingAggregation,
) {
    let sender_faulty = network.nodes[pending.from].faulty;
    let node = &mut network.nodes[id];

    if sender_faulty {
        node.failed_verification();
        node.blacklist.set(pending.from);
        debug!(
            node = id,
            sender = pending.from,
            window = node.cur_window,
            "bad signature, sender blacklisted"
        );
        return;
    }

    let Some(process) = node.running.get_mut(&height) else {
        // The process expired while the pairing was in flight.
        return;
    };
    let level = &mut process.levels[pending.level];
    if level.is_incoming_complete() {
        return;
    }
    level.merge_incoming(pending);
    node.successful_verification();
}
