//! Per-node NMT state tracking.
//!
//! One record per possible node id (0..=127), preallocated for the
//! lifetime of the engine and mutated only from the dispatch task when a
//! heartbeat or boot-up frame arrives.

use std::time::{Duration, Instant};

use canopen_common::NmtStatus;

pub(crate) type BootCallback = Box<dyn FnMut(NmtStatus) + Send>;

pub(crate) struct NodeState {
    current: NmtStatus,
    previous: NmtStatus,
    last_seen: Option<Instant>,
    compulsory: bool,
    on_boot: Option<BootCallback>,
}

impl NodeState {
    fn new() -> Self {
        Self {
            current: NmtStatus::Unknown,
            previous: NmtStatus::Unknown,
            last_seen: None,
            compulsory: false,
            on_boot: None,
        }
    }
}

pub(crate) struct NmtTracker {
    nodes: Vec<NodeState>,
}

impl NmtTracker {
    pub fn new() -> Self {
        Self {
            nodes: (0..0x80).map(|_| NodeState::new()).collect(),
        }
    }

    fn node(&self, node: u8) -> &NodeState {
        &self.nodes[usize::from(node & 0x7F)]
    }

    fn node_mut(&mut self, node: u8) -> &mut NodeState {
        &mut self.nodes[usize::from(node & 0x7F)]
    }

    /// Record a heartbeat/boot-up report for `node`.
    ///
    /// The boot callback fires only on a transition *into* `Boot` from a
    /// different state, so a node re-announcing boot-up twice in a row
    /// triggers it once.
    pub fn report(&mut self, node: u8, status: NmtStatus, now: Instant) {
        let record = self.node_mut(node);
        record.previous = record.current;
        record.current = status;
        record.last_seen = Some(now);

        if status == NmtStatus::Boot && record.previous != status {
            if let Some(cb) = record.on_boot.as_mut() {
                cb(status);
            }
        }
    }

    pub fn current_status(&self, node: u8) -> NmtStatus {
        self.node(node).current
    }

    pub fn previous_status(&self, node: u8) -> NmtStatus {
        self.node(node).previous
    }

    /// True once any valid status has been observed for the node.
    pub fn is_known(&self, node: u8) -> bool {
        self.node(node).current != NmtStatus::Unknown
    }

    pub fn set_boot_callback(&mut self, node: u8, cb: BootCallback) {
        self.node_mut(node).on_boot = Some(cb);
    }

    pub fn set_compulsory(&mut self, node: u8, compulsory: bool) {
        self.node_mut(node).compulsory = compulsory;
    }

    pub fn is_compulsory(&self, node: u8) -> bool {
        self.node(node).compulsory
    }

    /// True iff the node reported within `max_age` of `now`. A node that
    /// was never heard from is not alive.
    pub fn check_liveness(&self, node: u8, max_age: Duration, now: Instant) -> bool {
        match self.node(node).last_seen {
            Some(seen) => now.duration_since(seen) <= max_age,
            None => false,
        }
    }
}
