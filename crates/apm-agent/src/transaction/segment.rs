//! Segment tree for a single transaction.
//!
//! Segments live in an arena owned by the transaction; index `0` is the root
//! segment, whose parent is the transaction itself. Children are appended
//! under the transaction lock, which makes concurrent attachment from fan-out
//! threads an atomic append.
//!
//! # Exclusive time
//!
//! ```text
//! parent  |------------------------------|   total = 10
//! child a     |--------|                      4
//! child b          |--------|                 4 (overlaps a by 2)
//! union       |-------------|                 6
//! exclusive = 10 - 6 = 4
//! ```
//!
//! Child intervals are clipped to the parent interval and merged before
//! subtraction, so exclusive time never goes negative.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{Transaction, TransactionStatus};

pub(crate) type SegmentId = usize;

pub(crate) const ROOT_SEGMENT: SegmentId = 0;

#[derive(Debug)]
struct SegmentNode {
    name: String,
    parent: Option<SegmentId>,
    children: Vec<SegmentId>,
    start: Instant,
    end: Option<Instant>,
}

/// Total and self time of one closed segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentTiming {
    pub name: String,
    pub depth: usize,
    pub total: Duration,
    pub exclusive: Duration,
}

#[derive(Debug)]
pub(crate) struct SegmentTree {
    nodes: Vec<SegmentNode>,
}

impl SegmentTree {
    pub(crate) fn new(root_name: &str, start: Instant) -> Self {
        Self {
            nodes: vec![SegmentNode {
                name: root_name.to_string(),
                parent: None,
                children: Vec::new(),
                start,
                end: None,
            }],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn open_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.end.is_none()).count()
    }

    /// Appends a new open segment under `parent`. Returns `None` when the
    /// parent does not exist.
    pub(crate) fn start_child(
        &mut self,
        parent: SegmentId,
        name: &str,
        now: Instant,
    ) -> Option<SegmentId> {
        let id = self.nodes.len();
        self.nodes.get_mut(parent)?.children.push(id);
        self.nodes.push(SegmentNode {
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            start: now,
            end: None,
        });
        Some(id)
    }

    /// Closes a segment. Closing an already closed segment is a no-op and
    /// returns `false`.
    pub(crate) fn end(&mut self, id: SegmentId, now: Instant) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) if node.end.is_none() => {
                node.end = Some(now.max(node.start));
                true
            }
            _ => false,
        }
    }

    /// Closes every open segment at `at`. Returns how many were forced.
    pub(crate) fn force_close(&mut self, at: Instant) -> usize {
        let mut forced = 0;
        for node in self.nodes.iter_mut().filter(|node| node.end.is_none()) {
            node.end = Some(at.max(node.start));
            forced += 1;
        }
        forced
    }

    pub(crate) fn is_open(&self, id: SegmentId) -> bool {
        self.nodes.get(id).is_some_and(|node| node.end.is_none())
    }

    pub(crate) fn name(&self, id: SegmentId) -> Option<&str> {
        self.nodes.get(id).map(|node| node.name.as_str())
    }

    pub(crate) fn parent(&self, id: SegmentId) -> Option<SegmentId> {
        self.nodes.get(id).and_then(|node| node.parent)
    }

    /// Timings of every closed segment, in creation order. Open segments are
    /// skipped.
    pub(crate) fn timings(&self) -> Vec<SegmentTiming> {
        let mut depths = vec![0usize; self.nodes.len()];
        let mut timings = Vec::with_capacity(self.nodes.len());

        for (id, node) in self.nodes.iter().enumerate() {
            if let Some(parent) = node.parent {
                depths[id] = depths[parent] + 1;
            }
            let Some(end) = node.end else {
                continue;
            };
            let total = end.saturating_duration_since(node.start);
            let children = node
                .children
                .iter()
                .filter_map(|child| {
                    let child = &self.nodes[*child];
                    child.end.map(|child_end| (child.start, child_end))
                })
                .collect();
            let covered = covered_duration(children, node.start, end);
            timings.push(SegmentTiming {
                name: node.name.clone(),
                depth: depths[id],
                total,
                exclusive: total.saturating_sub(covered),
            });
        }

        timings
    }
}

/// Length of the union of `intervals` after clipping each to `[lower, upper]`.
fn covered_duration(mut intervals: Vec<(Instant, Instant)>, lower: Instant, upper: Instant) -> Duration {
    intervals.retain_mut(|(start, end)| {
        *start = (*start).max(lower);
        *end = (*end).min(upper);
        start < end
    });
    intervals.sort_unstable_by_key(|(start, _)| *start);

    let mut covered = Duration::ZERO;
    let mut current: Option<(Instant, Instant)> = None;
    for (start, end) in intervals {
        current = match current {
            Some((current_start, current_end)) if start <= current_end => {
                Some((current_start, current_end.max(end)))
            }
            Some((current_start, current_end)) => {
                covered += current_end - current_start;
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some((start, end)) = current {
        covered += end - start;
    }
    covered
}

/// Handle to a segment of a live transaction.
///
/// A handle created against a transaction that had already ended is inert:
/// starting children from it yields more inert handles and ending it does
/// nothing.
#[derive(Clone)]
pub struct SegmentHandle {
    transaction: Arc<Transaction>,
    id: Option<SegmentId>,
}

impl std::fmt::Debug for SegmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentHandle")
            .field("transaction", &self.transaction.id())
            .field("id", &self.id)
            .finish()
    }
}

impl SegmentHandle {
    pub(crate) fn start(transaction: &Arc<Transaction>, parent: SegmentId, name: &str) -> Self {
        let id = transaction.with_state(|state| {
            if state.status != TransactionStatus::Active {
                debug!(
                    "Ignoring segment {name} started on ended transaction {}",
                    transaction.id()
                );
                return None;
            }
            state.tree.start_child(parent, name, Instant::now())
        });
        SegmentHandle {
            transaction: Arc::clone(transaction),
            id,
        }
    }

    /// Starts a child of this segment.
    #[must_use]
    pub fn start_child(&self, name: &str) -> SegmentHandle {
        match self.id {
            Some(id) => SegmentHandle::start(&self.transaction, id, name),
            None => SegmentHandle {
                transaction: Arc::clone(&self.transaction),
                id: None,
            },
        }
    }

    /// Closes the segment. Returns `false` if it was already closed, was
    /// force-closed with its transaction, or is inert.
    pub fn end(&self) -> bool {
        let Some(id) = self.id else {
            return false;
        };
        let ended = self
            .transaction
            .with_state(|state| state.tree.end(id, Instant::now()));
        if !ended {
            debug!(
                "Ignoring repeated end of segment {id} in transaction {}",
                self.transaction.id()
            );
        }
        ended
    }

    #[must_use]
    pub fn is_inert(&self) -> bool {
        self.id.is_none()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.id
            .is_some_and(|id| self.transaction.with_state(|state| state.tree.is_open(id)))
    }

    #[must_use]
    pub fn name(&self) -> Option<String> {
        let id = self.id?;
        self.transaction
            .with_state(|state| state.tree.name(id).map(str::to_string))
    }

    #[must_use]
    pub fn transaction_id(&self) -> &str {
        self.transaction.id()
    }

    /// Whether the owning transaction is still active.
    #[must_use]
    pub fn transaction_is_active(&self) -> bool {
        self.transaction
            .with_state(|state| state.status == TransactionStatus::Active)
    }

    pub(crate) fn id(&self) -> Option<SegmentId> {
        self.id
    }
}
