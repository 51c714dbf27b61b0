//! The simulator object: node table, peer graph, clock and event engine.

use std::collections::BTreeSet;
use std::sync::Arc;

use meshsim_types::NodeId;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::envelope::Envelope;
use crate::event_queue::EnvelopeQueue;
use crate::latency::{pseudo_random, LatencyModel};
use crate::message::Message;
use crate::node::Node;
use crate::task::{Task, TaskKind, TaskQueue};

/// Engine-level counters, collected per run.
///
/// Two runs with identical parameters and seed must produce identical
/// stats; the determinism tests use this as a cheap fingerprint.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NetworkStats {
    /// Envelope deliveries executed (one per destination reached).
    pub envelopes_delivered: u64,
    /// Task bodies executed (skipped and cancelled firings not counted).
    pub tasks_run: u64,
    /// Logical sends (one per `send*` call, regardless of fan-out).
    pub sends: u64,
}

/// A deterministic simulated network of protocol nodes.
///
/// The network owns everything a run touches: the dense node table, the
/// peer graph, the envelope and task queues, the latency model and the
/// single seeded RNG. Message actions and tasks receive `&mut Network`
/// and drive all further activity through it; nothing in a run draws
/// randomness from anywhere else.
///
/// `nodes` and `rng` are public because protocol crates need split
/// borrows: mutate one node's state while drawing from the RNG or
/// reading another node.
pub struct Network<N: Node> {
    /// Node table; a node's id is its index here.
    pub nodes: Vec<N>,
    /// The only source of randomness in a run.
    pub rng: ChaCha8Rng,
    time: u64,
    latency: Box<dyn LatencyModel>,
    peer_table: Vec<Vec<NodeId>>,
    msgs: EnvelopeQueue<N>,
    tasks: TaskQueue<N>,
    stats: NetworkStats,
}

impl<N: Node> Network<N> {
    pub fn new(latency: Box<dyn LatencyModel>, seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            time: 0,
            latency,
            peer_table: Vec::new(),
            msgs: EnvelopeQueue::new(),
            tasks: TaskQueue::new(),
            stats: NetworkStats::default(),
        }
    }

    /// Current simulated time in ms. Non-decreasing; advances only
    /// inside [`run_ms`](Self::run_ms).
    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn latency_model(&self) -> &dyn LatencyModel {
        self.latency.as_ref()
    }

    /// Register a node, assigning it the next dense id.
    pub fn add_node(&mut self, mut node: N) -> NodeId {
        let id = self.nodes.len();
        node.core_mut().id = id;
        self.nodes.push(node);
        id
    }

    /// Direct peers of `id`; empty until [`set_peers`](Self::set_peers)
    /// has been called.
    pub fn peers(&self, id: NodeId) -> &[NodeId] {
        self.peer_table.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Materialize a random symmetric peer graph.
    ///
    /// Every node draws random partners until it has at least `degree`
    /// edges (clamped to at least 3 and at most `n - 1`); edges are
    /// added in both directions and self-edges are forbidden. Nodes can
    /// end up with more than `degree` peers through edges initiated by
    /// others.
    pub fn set_peers(&mut self, degree: usize) {
        let n = self.nodes.len();
        assert!(n >= 2, "peer graph needs at least two nodes");
        let degree = degree.max(3).min(n - 1);

        let mut table: Vec<BTreeSet<NodeId>> = vec![BTreeSet::new(); n];
        for id in 0..n {
            while table[id].len() < degree {
                let peer = self.rng.gen_range(0..n);
                if peer != id && table[id].insert(peer) {
                    table[peer].insert(id);
                }
            }
        }
        self.peer_table = table.into_iter().map(|s| s.into_iter().collect()).collect();
    }

    // ─── Sending ───

    /// Send to a single destination at `time + 1`.
    pub fn send<M: Message<N> + 'static>(&mut self, message: M, from: NodeId, to: NodeId) {
        let at = self.time + 1;
        self.send_at(message, at, from, &[to]);
    }

    /// Send to many destinations at `time + 1`.
    pub fn send_all<M: Message<N> + 'static>(
        &mut self,
        message: M,
        from: NodeId,
        dests: &[NodeId],
    ) {
        let at = self.time + 1;
        self.send_at(message, at, from, dests);
    }

    /// Send `message` from `from`, leaving the sender at `send_time`.
    ///
    /// Per destination, the arrival time is
    /// `send_time + latency(from, dest, pseudo_random(dest, seed))` with
    /// one seed drawn per logical send. Destinations are sorted by
    /// arrival; a lone destination gets a single envelope, several get
    /// one multi envelope inserted at the head destination's arrival
    /// (the engine re-inserts it as the cursor advances).
    ///
    /// # Panics
    ///
    /// If `send_time` is not in the future, or a destination equals the
    /// sender.
    pub fn send_at<M: Message<N> + 'static>(
        &mut self,
        message: M,
        send_time: u64,
        from: NodeId,
        dests: &[NodeId],
    ) {
        assert!(
            send_time > self.time,
            "send scheduled at {send_time} but time is already {}",
            self.time
        );
        if dests.is_empty() {
            return;
        }

        let message: Arc<dyn Message<N>> = Arc::new(message);
        let size = message.size() as u64;
        let seed = self.rng.gen::<u64>();

        let mut arrivals: Vec<(u64, NodeId)> = Vec::with_capacity(dests.len());
        for &dest in dests {
            assert_ne!(dest, from, "node {from} cannot send to itself");
            let latency = self.latency.latency(
                self.nodes[from].core(),
                self.nodes[dest].core(),
                pseudo_random(dest, seed),
            );
            arrivals.push((send_time + latency, dest));
        }
        arrivals.sort_by_key(|&(at, _)| at);

        let sender = self.nodes[from].core_mut();
        sender.msg_sent += dests.len() as u64;
        sender.bytes_sent += size * dests.len() as u64;
        self.stats.sends += 1;

        let head_arrival = arrivals[0].0;
        let envelope = if arrivals.len() == 1 {
            Envelope::single(message, from, arrivals[0].1, head_arrival)
        } else {
            Envelope::multi(message, from, &arrivals, send_time, seed)
        };
        self.msgs.insert(head_arrival, Box::new(envelope));
    }

    // ─── Tasks ───

    /// Run `task` once at simulated time `at`, unless the node is down
    /// by then.
    pub fn register_task(
        &mut self,
        at: u64,
        node: NodeId,
        task: impl FnOnce(&mut Network<N>) + 'static,
    ) {
        assert!(
            at >= self.time,
            "task scheduled at {at} but time is already {}",
            self.time
        );
        self.tasks.schedule(
            at,
            Task {
                node,
                kind: TaskKind::Once(Box::new(task)),
            },
        );
    }

    /// Run `body` every `period` ms starting at `first_at`.
    ///
    /// Before each firing, `cont` false cancels the task permanently and
    /// `start` false skips the period but keeps the schedule.
    pub fn register_conditional_task(
        &mut self,
        first_at: u64,
        period: u64,
        node: NodeId,
        body: impl FnMut(&mut Network<N>) + 'static,
        start: impl Fn(&N) -> bool + 'static,
        cont: impl Fn(&N) -> bool + 'static,
    ) {
        assert!(period > 0, "conditional task needs a non-zero period");
        assert!(
            first_at >= self.time,
            "task scheduled at {first_at} but time is already {}",
            self.time
        );
        self.tasks.schedule(
            first_at,
            Task {
                node,
                kind: TaskKind::Conditional {
                    body: Box::new(body),
                    period,
                    start: Box::new(start),
                    cont: Box::new(cont),
                },
            },
        );
    }

    /// Run `body` every `period` ms unconditionally (while the node is
    /// alive).
    pub fn register_periodic_task(
        &mut self,
        first_at: u64,
        period: u64,
        node: NodeId,
        body: impl FnMut(&mut Network<N>) + 'static,
    ) {
        self.register_conditional_task(first_at, period, node, body, |_| true, |_| true);
    }

    // ─── Running ───

    /// Advance simulated time by `ms` milliseconds, dispatching
    /// everything due on the way. The cursor jumps straight to the next
    /// non-empty bucket when the timeline is sparse, and lands on
    /// `time + ms` on return.
    pub fn run_ms(&mut self, ms: u64) {
        let until = self.time + ms;
        loop {
            let next = match (self.msgs.next_time(), self.tasks.next_time()) {
                (None, None) => break,
                (a, b) => a.into_iter().chain(b).min().expect("one side is non-empty"),
            };
            if next > until {
                break;
            }
            debug_assert!(next >= self.time, "queue holds an event in the past");
            self.time = next;
            self.drain_current();
        }
        self.time = until;
    }

    /// Dispatch all work at the current millisecond: envelopes first,
    /// then tasks, repeating until neither phase produced new work for
    /// this same millisecond.
    fn drain_current(&mut self) {
        let now = self.time;
        loop {
            let mut worked = false;
            while let Some(envelope) = self.msgs.pop_at(now) {
                worked = true;
                self.deliver(envelope);
            }
            let due = self.tasks.pop_at(now);
            if !due.is_empty() {
                worked = true;
                for task in due {
                    self.run_task(task);
                }
            }
            if !worked {
                break;
            }
        }
    }

    /// Deliver one envelope to the recipient at its cursor, then
    /// re-insert it if destinations remain.
    fn deliver(&mut self, mut envelope: Box<Envelope<N>>) {
        let from = envelope.from();
        let to = envelope.next_dest();

        if !self.nodes[to].core().down {
            let receiver = self.nodes[to].core_mut();
            receiver.msg_received += 1;
            receiver.bytes_received += envelope.message().size() as u64;
            self.stats.envelopes_delivered += 1;

            trace!(time = self.time, from, to, "deliver");
            let message = Arc::clone(envelope.message());
            message.action(self, from, to);
        }

        envelope.mark_read();
        if envelope.has_next_reader() {
            let at = envelope.next_arrival_time(self);
            debug_assert!(
                at >= self.time,
                "multi envelope arrival times must be non-decreasing"
            );
            self.msgs.insert(at, envelope);
        }
    }

    fn run_task(&mut self, task: Task<N>) {
        match task.kind {
            TaskKind::Once(body) => {
                if !self.nodes[task.node].core().down {
                    self.stats.tasks_run += 1;
                    body(self);
                }
            }
            TaskKind::Conditional {
                mut body,
                period,
                start,
                cont,
            } => {
                let node = &self.nodes[task.node];
                if node.core().down || !cont(node) {
                    trace!(time = self.time, node = task.node, "task cancelled");
                    return;
                }
                if start(node) {
                    self.stats.tasks_run += 1;
                    body(self);
                }
                let at = self.time + period;
                self.tasks.schedule(
                    at,
                    Task {
                        node: task.node,
                        kind: TaskKind::Conditional {
                            body,
                            period,
                            start,
                            cont,
                        },
                    },
                );
            }
        }
    }

    /// Draw `count` distinct elements from `pool` by seeded shuffle.
    /// Returns the whole pool when it is not larger than `count`.
    pub fn random_subset(&mut self, mut pool: Vec<NodeId>, count: usize) -> Vec<NodeId> {
        if pool.len() > count {
            pool.shuffle(&mut self.rng);
            pool.truncate(count);
        }
        pool
    }
}
