//! Gossip-based signature aggregation with optional San Fermin
//! acceleration.
//!
//! Every node holds a bitset of verified signer ids. Nodes broadcast
//! their state to their direct peers whenever it changes, periodically
//! send a set of signatures to one peer that is missing some, and run a
//! periodic verification step that models pairing cost as a scheduled
//! delay. With San Fermin enabled, completing the signer range of a
//! power-of-two sub-tree triggers a direct send to members of the next
//! larger sub-tree.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use meshsim_core::{
    latency_by_name, layout_by_name, Message, Network, Node, NodeCore, NodeLayout, Protocol,
    RegistryError,
};
use meshsim_types::{NodeId, SignerSet};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// How `send_sigs` encodes the signatures it pushes to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendSigsStrategy {
    /// Send the full verified set, one signature per bit.
    All,
    /// Send just the bits the peer is missing.
    Dif,
    /// Send the full verified set at its compressed size.
    CmpAll,
    /// Send the full set, charged at min(compressed full, compressed diff).
    CmpDiff,
}

/// Parameter record for [`P2PSignature`]; serializes flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2PSignatureParameters {
    /// Nodes participating in signing.
    pub signing_node_count: usize,
    /// Nodes relaying without signing.
    pub relaying_node_count: usize,
    /// Verified-signer count at which a node declares itself done.
    pub threshold: usize,
    /// Target degree of the random peer graph (at least 3).
    pub connection_count: usize,
    /// Time one pairing takes, in ms.
    pub pairing_time: u64,
    /// Period of the `send_sigs` task, in ms.
    pub sigs_send_period: u64,
    /// Verification strategy: true aggregates all pending sets per
    /// cycle, false verifies the single best set.
    pub double_aggregate_strategy: bool,
    /// Whether nodes broadcast their state to their peers on change.
    pub with_state: bool,
    /// Run San Fermin sub-tree completion alongside gossip.
    pub san_fermin: bool,
    /// Wire encoding of pushed signatures. Forced to `CmpAll` when
    /// `san_fermin` is set.
    pub send_sigs_strategy: SendSigsStrategy,
    /// Window width of the compression scheme, in bits.
    pub sig_range: usize,
    pub node_layout_name: String,
    pub network_latency_name: String,
}

impl Default for P2PSignatureParameters {
    fn default() -> Self {
        Self {
            signing_node_count: 100,
            relaying_node_count: 20,
            threshold: 99,
            connection_count: 40,
            pairing_time: 100,
            sigs_send_period: 1000,
            double_aggregate_strategy: true,
            with_state: true,
            san_fermin: true,
            send_sigs_strategy: SendSigsStrategy::CmpAll,
            sig_range: 20,
            node_layout_name: "random".to_string(),
            network_latency_name: "distance".to_string(),
        }
    }
}

impl P2PSignatureParameters {
    /// Effective signature count of `sigs` under the compression
    /// scheme, used as the wire size of compressed messages.
    ///
    /// The bitset is scanned in windows of `sig_range` bits. A window
    /// whose first bit opens an unbroken run of set bits counts one
    /// aggregated signature for the run; set bits outside such runs
    /// count individually. Runs of fully-set windows aligned on
    /// `sig_range * 2^k` boundaries collapse recursively, so
    /// `2^k` aligned full windows cost a single signature.
    pub fn compressed_size(&self, sigs: &SignerSet) -> usize {
        if sigs.cardinality() == self.signing_node_count {
            // Everything signed: one aggregated signature.
            return 1;
        }

        let mut first_one_at: i64 = -1;
        let mut sig_count: i64 = 0;
        let mut compressing = false;
        let mut was_compressing = false;

        for pos in 0..=sigs.upper_bound() + 1 {
            if !sigs.contains(pos) {
                compressing = false;
                sig_count -= self.merge_ranges(first_one_at, pos);
                first_one_at = -1;
            } else if compressing {
                if (pos + 1) % self.sig_range == 0 {
                    // Whole window covered; the next one starts a new count.
                    compressing = false;
                    was_compressing = true;
                }
            } else {
                sig_count += 1;
                if pos % self.sig_range == 0 {
                    compressing = true;
                    if !was_compressing {
                        first_one_at = pos as i64;
                    } else {
                        was_compressing = false;
                    }
                }
            }
        }

        sig_count as usize
    }

    /// Signatures saved by collapsing consecutive fully-set windows in
    /// `[first_one_at, pos)`. Merges combine recursively: eleven full
    /// windows collapse to three signatures (8 + 2 + 1).
    fn merge_ranges(&self, mut first_one_at: i64, pos: usize) -> i64 {
        if first_one_at < 0 {
            return 0;
        }
        let pair = (self.sig_range * 2) as i64;
        // Merges only start on a double-window boundary.
        if first_one_at % pair != 0 {
            first_one_at += pair - (first_one_at % pair);
        }

        let range_count = (pos as i64 - first_one_at) / self.sig_range as i64;
        if range_count < 2 {
            return 0;
        }

        let mut max = floor_log2(range_count as usize) as i64;
        while max > 0 {
            let size_in_blocks = 1i64 << max;
            let size = size_in_blocks * self.sig_range as i64;
            if first_one_at % size == 0 {
                return (size_in_blocks - 1) + self.merge_ranges(first_one_at + size, pos);
            }
            max -= 1;
        }

        0
    }
}

fn floor_log2(n: usize) -> u32 {
    debug_assert!(n > 0);
    usize::BITS - 1 - n.leading_zeros()
}

// ─── Messages ───

/// A node's advertised verified-signer set. Trailing zero bits are
/// implicit, so the wire size is the used prefix of the bitset.
#[derive(Debug, Clone)]
struct StateGossip {
    who: NodeId,
    desc: SignerSet,
}

impl Message<SigNode> for StateGossip {
    fn size(&self) -> usize {
        (self.desc.upper_bound() / 8).max(1)
    }

    fn action(&self, network: &mut Network<SigNode>, _from: NodeId, to: NodeId) {
        let threshold = network.nodes[to].params.threshold;
        let node = &mut network.nodes[to];
        let new_cardinality = self.desc.cardinality();
        // States arrive asynchronously; keep only the freshest, and only
        // while the peer still needs anything.
        if new_cardinality < threshold {
            let fresher = node
                .peers_state
                .get(&self.who)
                .map_or(true, |old| old.cardinality() < new_cardinality);
            if fresher {
                node.peers_state.insert(self.who, self.desc.clone());
            }
        }
    }
}

/// A set of signatures pushed to one peer. Size is the bit field plus
/// 48 bytes per signature actually included.
#[derive(Debug, Clone)]
struct SendSigs {
    sigs: SignerSet,
    size: usize,
}

impl SendSigs {
    fn new(sigs: SignerSet) -> Self {
        let count = sigs.cardinality();
        Self::with_count(sigs, count)
    }

    fn with_count(sigs: SignerSet, sig_count: usize) -> Self {
        let size = (sigs.upper_bound() / 8 + sig_count * 48).max(1);
        Self { sigs, size }
    }
}

impl Message<SigNode> for SendSigs {
    fn size(&self) -> usize {
        self.size
    }

    fn action(&self, network: &mut Network<SigNode>, _from: NodeId, to: NodeId) {
        // Just queue the set; the periodic check_sigs task verifies.
        network.nodes[to].to_verify.insert(self.sigs.clone());
    }
}

// ─── Node ───

/// A gossiping aggregator node.
#[derive(Debug)]
pub struct SigNode {
    core: NodeCore,
    params: Arc<P2PSignatureParameters>,
    /// Signer ids whose signatures this node has verified. Contains the
    /// node's own bit unless it is a pure relay.
    pub verified_signatures: SignerSet,
    /// Received signature sets awaiting pairing verification.
    to_verify: BTreeSet<SignerSet>,
    /// Freshest known verified set per direct peer.
    peers_state: BTreeMap<NodeId, SignerSet>,
    /// Relays forward aggregates but contribute no signature of their own.
    pub just_relay: bool,
    pub done: bool,
}

impl Node for SigNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }
}

impl SigNode {
    fn new(
        rng: &mut ChaCha8Rng,
        layout: &dyn NodeLayout,
        params: Arc<P2PSignatureParameters>,
        just_relay: bool,
    ) -> Self {
        Self {
            core: NodeCore::new(rng, layout),
            params,
            verified_signatures: SignerSet::new(),
            to_verify: BTreeSet::new(),
            peers_state: BTreeMap::new(),
            just_relay,
            done: false,
        }
    }

    /// The contiguous id range sharing all bits above the lowest
    /// `round` with this node, excluding the node itself and capped at
    /// the signing population.
    ///
    /// # Panics
    ///
    /// `round` must be at least 1.
    pub fn san_fermin_peers(&self, round: u32) -> SignerSet {
        assert!(round >= 1, "round={round}");
        let id = self.core.id;
        let mask = (1usize << round) - 1;
        let start = (mask | id) ^ mask;
        let end = (id | mask).min(self.params.signing_node_count - 1);

        let mut range = SignerSet::new();
        // Relays can sit above the signing id range, where the capped
        // interval is empty.
        if start <= end {
            range.set_range(start, end);
        }
        range.clear(id);
        range
    }
}

// ─── Node behaviour ───

fn send_state_to_peers(network: &mut Network<SigNode>, id: NodeId) {
    let message = StateGossip {
        who: id,
        desc: network.nodes[id].verified_signatures.clone(),
    };
    let dests = network.peers(id).to_vec();
    network.send_all(message, id, &dests);
}

/// Pick one peer whose known state is missing bits we have, drop it from
/// the bookkeeping, and push signatures to it according to the strategy.
fn send_sigs(network: &mut Network<SigNode>, id: NodeId) {
    let params = Arc::clone(&network.nodes[id].params);

    let picked: Option<(NodeId, SignerSet)> = if params.with_state {
        let node = &mut network.nodes[id];
        let mut found = None;
        for (&who, desc) in node.peers_state.iter() {
            let mut diff = node.verified_signatures.clone();
            diff.subtract(desc);
            if diff.cardinality() > 0 {
                found = Some((who, diff));
                break;
            }
        }
        if let Some((who, _)) = &found {
            node.peers_state.remove(who);
        }
        found
    } else {
        // Without state tracking, push to a random peer whatever it is
        // missing right now.
        let peers = network.peers(id).to_vec();
        if peers.is_empty() {
            return;
        }
        let who = peers[network.rng.gen_range(0..peers.len())];
        let mut diff = network.nodes[id].verified_signatures.clone();
        diff.subtract(&network.nodes[who].verified_signatures);
        (diff.cardinality() > 0).then_some((who, diff))
    };

    let Some((who, diff)) = picked else {
        return;
    };

    let verified = network.nodes[id].verified_signatures.clone();
    let message = match params.send_sigs_strategy {
        SendSigsStrategy::Dif => SendSigs::new(diff),
        SendSigsStrategy::All => SendSigs::new(verified),
        SendSigsStrategy::CmpAll => {
            let count = params.compressed_size(&verified);
            SendSigs::with_count(verified, count)
        }
        SendSigsStrategy::CmpDiff => {
            let count = params
                .compressed_size(&verified)
                .min(params.compressed_size(&diff));
            SendSigs::with_count(verified, count)
        }
    };

    // A small delay accounting for message size.
    let at = network.time() + 1 + message.sigs.cardinality() as u64 / 100;
    network.send_at(message, at, id, &[who]);
}

fn check_sigs(network: &mut Network<SigNode>, id: NodeId) {
    if network.nodes[id].params.double_aggregate_strategy {
        check_sigs_aggregate(network, id);
    } else {
        check_sigs_best(network, id);
    }
}

/// Strategy 1: verify the single pending set bringing the most new
/// signatures; exhausted sets are dropped while scanning.
fn check_sigs_best(network: &mut Network<SigNode>, id: NodeId) {
    let pairing_time = network.nodes[id].params.pairing_time;
    let best = {
        let node = &mut network.nodes[id];
        let mut best: Option<SignerSet> = None;
        let mut best_value = 0;
        let mut exhausted = Vec::new();
        for candidate in node.to_verify.iter() {
            let mut fresh = candidate.clone();
            fresh.subtract(&node.verified_signatures);
            let value = fresh.cardinality();
            if value == 0 {
                exhausted.push(candidate.clone());
            } else if value > best_value {
                best_value = value;
                best = Some(candidate.clone());
            }
        }
        for sigs in exhausted {
            node.to_verify.remove(&sigs);
        }
        if let Some(best) = &best {
            node.to_verify.remove(best);
        }
        best
    };

    if let Some(best) = best {
        let at = network.time() + pairing_time * 2;
        network.register_task(at, id, move |net| {
            update_verified_signatures(net, id, &best);
        });
    }
}

/// Strategy 2: or every pending set together and verify the aggregate in
/// one pairing. Faster, but one bad signature would invalidate the whole
/// batch, so it assumes honest senders.
fn check_sigs_aggregate(network: &mut Network<SigNode>, id: NodeId) {
    let pairing_time = network.nodes[id].params.pairing_time;
    let aggregate = {
        let node = &mut network.nodes[id];
        let mut aggregate: Option<SignerSet> = None;
        for sigs in node.to_verify.iter() {
            match &mut aggregate {
                None => aggregate = Some(sigs.clone()),
                Some(acc) => acc.union_with(sigs),
            }
        }
        node.to_verify.clear();
        aggregate
    };

    if let Some(aggregate) = aggregate {
        let mut fresh = aggregate.clone();
        fresh.subtract(&network.nodes[id].verified_signatures);
        if fresh.cardinality() > 0 {
            let at = network.time() + pairing_time * 2;
            network.register_task(at, id, move |net| {
                update_verified_signatures(net, id, &aggregate);
            });
        }
    }
}

/// Merge freshly verified signatures into the node's set and react to
/// the change: broadcast state, fire San Fermin completions, and on
/// reaching the threshold declare the node done and flush everything its
/// peers are still missing.
fn update_verified_signatures(network: &mut Network<SigNode>, id: NodeId, sigs: &SignerSet) {
    let params = Arc::clone(&network.nodes[id].params);

    let grew = {
        let node = &mut network.nodes[id];
        let before = node.verified_signatures.cardinality();
        node.verified_signatures.union_with(sigs);
        node.verified_signatures.cardinality() > before
    };
    if !grew {
        return;
    }

    if params.with_state {
        send_state_to_peers(network, id);
    }

    if params.san_fermin {
        san_fermin_expand(network, id, sigs, &params);
    }

    let node = &network.nodes[id];
    if !node.just_relay
        && !node.done
        && node.verified_signatures.cardinality() >= params.threshold
    {
        let now = network.time();
        let node = &mut network.nodes[id];
        node.done = true;
        node.core_mut().done_at = Some(now);
        debug!(node = id, time = now, "reached threshold");
        // Last push: flush signatures to every peer known to miss some.
        while !network.nodes[id].peers_state.is_empty() {
            send_sigs(network, id);
        }
    }
}

/// For every San Fermin round the new signatures touch, check whether
/// the round's id range just became complete; if so, hand the completed
/// aggregate to two nodes of the next larger range.
fn san_fermin_expand(
    network: &mut Network<SigNode>,
    id: NodeId,
    sigs: &SignerSet,
    params: &P2PSignatureParameters,
) {
    let mut round = 2;
    while round < 30 && round < floor_log2(params.signing_node_count) {
        let completed: Option<(Vec<NodeId>, SignerSet)> = {
            let node = &network.nodes[id];
            let range = node.san_fermin_peers(round);
            let mut touched = range.clone();
            touched.intersect_with(sigs);
            if touched.is_empty() {
                None
            } else {
                let mut covered = range.clone();
                covered.intersect_with(&node.verified_signatures);
                if covered == range {
                    // Range complete: pick candidates from the next
                    // round's range, excluding it and our direct peers.
                    let mut next_range = node.san_fermin_peers(round + 1);
                    next_range.subtract(&range);
                    let peers = network.peers(id);
                    let pool: Vec<NodeId> =
                        next_range.iter().filter(|p| !peers.contains(p)).collect();
                    Some((pool, range))
                } else {
                    None
                }
            }
        };

        if let Some((pool, range)) = completed {
            let dests = network.random_subset(pool, 2);
            if !dests.is_empty() {
                let at = network.time() + 1;
                network.send_at(SendSigs::with_count(range, 1), at, id, &dests);
            }
        }
        round += 1;
    }
}

// ─── Protocol ───

/// The gossip + San Fermin aggregation protocol.
pub struct P2PSignature {
    params: Arc<P2PSignatureParameters>,
    layout: Box<dyn NodeLayout>,
    network: Network<SigNode>,
}

impl P2PSignature {
    /// Build the protocol; fails on unknown latency or layout names.
    pub fn new(mut params: P2PSignatureParameters, seed: u64) -> Result<Self, RegistryError> {
        if params.san_fermin {
            params.send_sigs_strategy = SendSigsStrategy::CmpAll;
        }
        let latency = latency_by_name(&params.network_latency_name)?;
        let layout = layout_by_name(&params.node_layout_name)?;
        Ok(Self {
            params: Arc::new(params),
            layout,
            network: Network::new(latency, seed),
        })
    }

    pub fn params(&self) -> &P2PSignatureParameters {
        &self.params
    }
}

impl Protocol for P2PSignature {
    type N = SigNode;

    fn init(&mut self) {
        let params = Arc::clone(&self.params);
        let total = params.signing_node_count + params.relaying_node_count;

        let mut just_relay: BTreeSet<NodeId> = BTreeSet::new();
        while just_relay.len() < params.relaying_node_count {
            just_relay.insert(self.network.rng.gen_range(0..total));
        }

        for i in 0..total {
            let node = SigNode::new(
                &mut self.network.rng,
                self.layout.as_ref(),
                Arc::clone(&params),
                just_relay.contains(&i),
            );
            let id = self.network.add_node(node);
            if !just_relay.contains(&i) {
                self.network.nodes[id].verified_signatures.set(id);
            }

            if params.with_state && !params.san_fermin {
                self.network
                    .register_task(1, id, move |net| send_state_to_peers(net, id));
            }
            self.network.register_conditional_task(
                1,
                params.sigs_send_period,
                id,
                move |net| send_sigs(net, id),
                |n: &SigNode| !n.peers_state.is_empty(),
                |n: &SigNode| !n.done,
            );
            self.network.register_conditional_task(
                1,
                params.pairing_time,
                id,
                move |net| check_sigs(net, id),
                |n: &SigNode| !n.to_verify.is_empty(),
                |n: &SigNode| !n.done,
            );
        }

        if params.san_fermin {
            // Seed the first round: every signer hands its signature to
            // its round-1 partner.
            for i in 0..params.signing_node_count {
                let partner = self.network.nodes[i].san_fermin_peers(1).highest();
                if let Some(partner) = partner {
                    let sigs = SendSigs::new(self.network.nodes[i].verified_signatures.clone());
                    self.network.send_at(sigs, 1, i, &[partner]);
                }
            }
        }

        self.network.set_peers(params.connection_count);

        info!(
            signing = params.signing_node_count,
            relaying = params.relaying_node_count,
            threshold = params.threshold,
            san_fermin = params.san_fermin,
            "initialized P2P signature protocol"
        );
    }

    fn network(&mut self) -> &mut Network<SigNode> {
        &mut self.network
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn params_with_range(sig_range: usize, signing_node_count: usize) -> P2PSignatureParameters {
        P2PSignatureParameters {
            sig_range,
            signing_node_count,
            ..Default::default()
        }
    }

    fn bits(ids: &[usize]) -> SignerSet {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_compressed_size_examples() {
        let params = params_with_range(4, 1000);
        // 1101 0111: two runs of window prefixes plus loose bits.
        assert_eq!(params.compressed_size(&bits(&[0, 1, 3, 5, 6, 7])), 5);
        // 1111 1110: one full window, one broken run starting at the
        // second window boundary.
        assert_eq!(params.compressed_size(&bits(&[0, 1, 2, 3, 4, 5, 6])), 2);
        // 0111 0111: no window starts on a set bit, all bits count.
        assert_eq!(params.compressed_size(&bits(&[1, 2, 3, 5, 6, 7])), 6);
    }

    #[test]
    fn test_compressed_size_merges_aligned_full_windows() {
        let params = params_with_range(2, 1000);
        // Eight bits = four aligned full windows collapse to one.
        let eight: SignerSet = (0..8).collect();
        assert_eq!(params.compressed_size(&eight), 1);
        // Eleven full windows: 8 + 2 + 1 blocks = 3 signatures.
        let twenty_two: SignerSet = (0..22).collect();
        assert_eq!(params.compressed_size(&twenty_two), 3);
        // Alignment is positional, not zero-based: eight full windows
        // starting at bit 16 still collapse to one.
        let offset: SignerSet = (16..32).collect();
        assert_eq!(params.compressed_size(&offset), 1);
    }

    #[test]
    fn test_compressed_size_full_population_is_one() {
        let params = params_with_range(4, 64);
        let all: SignerSet = (0..64).collect();
        assert_eq!(params.compressed_size(&all), 1);
    }

    #[test]
    fn test_compressed_size_lower_bound() {
        let params = params_with_range(8, 1000);
        for sample in [bits(&[0]), bits(&[999]), bits(&[3, 77]), bits(&[8, 9])] {
            assert!(params.compressed_size(&sample) >= 1);
        }
        assert_eq!(params.compressed_size(&SignerSet::new()), 0);
    }

    #[test]
    fn test_san_fermin_peers_ranges() {
        let params = Arc::new(P2PSignatureParameters {
            signing_node_count: 16,
            relaying_node_count: 0,
            ..Default::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let layout = meshsim_core::RandomLayout {
            heterogeneous_speed: false,
        };
        let mut node = SigNode::new(&mut rng, &layout, params, false);
        node.core.id = 6;

        // Round 1: the pair {6, 7} minus self.
        assert_eq!(node.san_fermin_peers(1), bits(&[7]));
        // Round 2: {4..=7} minus self.
        assert_eq!(node.san_fermin_peers(2), bits(&[4, 5, 7]));
        // Round 3: {0..=7} minus self.
        assert_eq!(node.san_fermin_peers(3), bits(&[0, 1, 2, 3, 4, 5, 7]));

        // A high id is capped at the signing population.
        node.core.id = 15;
        assert_eq!(node.san_fermin_peers(2), bits(&[12, 13, 14]));
    }

    #[test]
    #[should_panic(expected = "round=0")]
    fn test_san_fermin_round_zero_is_a_contract_violation() {
        let params = Arc::new(P2PSignatureParameters::default());
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let layout = meshsim_core::RandomLayout {
            heterogeneous_speed: false,
        };
        let node = SigNode::new(&mut rng, &layout, params, false);
        node.san_fermin_peers(0);
    }

    #[test]
    fn test_san_fermin_forces_compressed_strategy() {
        let params = P2PSignatureParameters {
            san_fermin: true,
            send_sigs_strategy: SendSigsStrategy::Dif,
            ..Default::default()
        };
        let protocol = P2PSignature::new(params, 0).expect("default registry names");
        assert_eq!(
            protocol.params().send_sigs_strategy,
            SendSigsStrategy::CmpAll
        );
    }

    #[test]
    fn test_unknown_registry_name_fails() {
        let params = P2PSignatureParameters {
            network_latency_name: "wormhole".to_string(),
            ..Default::default()
        };
        assert!(P2PSignature::new(params, 0).is_err());
    }

    #[test]
    fn test_message_sizes() {
        let state = StateGossip {
            who: 0,
            desc: bits(&[0, 1, 2, 100]),
        };
        // 101 used bits -> 12 bytes.
        assert_eq!(state.size(), 12);
        let empty_state = StateGossip {
            who: 0,
            desc: SignerSet::new(),
        };
        assert_eq!(empty_state.size(), 1);

        // Bit field (1 byte) + 3 signatures at 48 bytes.
        assert_eq!(SendSigs::new(bits(&[0, 1, 2])).size(), 144);
        assert_eq!(SendSigs::with_count(bits(&[0, 1, 2]), 1).size(), 48);
    }
}
