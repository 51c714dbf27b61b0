//! One-shot and conditional tasks bound to a node.

use std::collections::BTreeMap;

use meshsim_types::NodeId;

use crate::network::Network;
use crate::node::Node;

pub(crate) enum TaskKind<N: Node> {
    /// Fires once, unless the owning node is down.
    Once(Box<dyn FnOnce(&mut Network<N>)>),
    /// Repeats every `period` ms. Before each firing the engine checks
    /// `cont` (false cancels the task permanently) and then `start`
    /// (false skips this period but keeps the schedule).
    Conditional {
        body: Box<dyn FnMut(&mut Network<N>)>,
        period: u64,
        start: Box<dyn Fn(&N) -> bool>,
        cont: Box<dyn Fn(&N) -> bool>,
    },
}

pub(crate) struct Task<N: Node> {
    pub(crate) node: NodeId,
    pub(crate) kind: TaskKind<N>,
}

/// Time-bucketed task storage. Tasks scheduled for the same millisecond
/// run in registration order, after all envelope deliveries at that
/// time.
pub(crate) struct TaskQueue<N: Node> {
    buckets: BTreeMap<u64, Vec<Task<N>>>,
}

impl<N: Node> TaskQueue<N> {
    pub(crate) fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
        }
    }

    pub(crate) fn schedule(&mut self, at: u64, task: Task<N>) {
        self.buckets.entry(at).or_default().push(task);
    }

    pub(crate) fn pop_at(&mut self, at: u64) -> Vec<Task<N>> {
        self.buckets.remove(&at).unwrap_or_default()
    }

    pub(crate) fn next_time(&self) -> Option<u64> {
        self.buckets.keys().next().copied()
    }
}
