//! Per-operator memory budget tracking.
//!
//! Every allocation that grows with the input (hash-table bucket arrays,
//! duplicate-node data pages, row-spool blocks) is routed through a
//! [`MemTracker`]. A denied [`MemTracker::try_consume`] is the signal that
//! drives the operator spill path; trackers never panic on exhaustion.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::RiffleError;

/// Hierarchical memory budget tracker.
///
/// A tracker either owns a hard byte limit or chains to a parent whose limit
/// it shares. Consumption is propagated to every ancestor, so an engine-level
/// tracker sees the sum of all operator-level consumption.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    limit_bytes: usize,
    consumed_bytes: AtomicUsize,
    parent: Option<Arc<MemTracker>>,
}

impl MemTracker {
    /// Create a root tracker with a hard byte limit.
    pub fn new(label: impl Into<String>, limit_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit_bytes,
            consumed_bytes: AtomicUsize::new(0),
            parent: None,
        })
    }

    /// Create a child tracker sharing `parent`'s budget, with an optional
    /// tighter local limit.
    pub fn new_child(
        parent: &Arc<MemTracker>,
        label: impl Into<String>,
        limit_bytes: Option<usize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit_bytes: limit_bytes.unwrap_or(usize::MAX),
            consumed_bytes: AtomicUsize::new(0),
            parent: Some(Arc::clone(parent)),
        })
    }

    /// Attempt to reserve `bytes`. Returns `false` (and reserves nothing
    /// anywhere in the chain) if this tracker or any ancestor would exceed
    /// its limit.
    pub fn try_consume(&self, bytes: usize) -> bool {
        if bytes == 0 {
            return true;
        }
        loop {
            let current = self.consumed_bytes.load(Ordering::Acquire);
            let next = match current.checked_add(bytes) {
                Some(next) if next <= self.limit_bytes => next,
                _ => return false,
            };
            if self
                .consumed_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if let Some(parent) = &self.parent {
                if !parent.try_consume(bytes) {
                    self.consumed_bytes.fetch_sub(bytes, Ordering::AcqRel);
                    return false;
                }
            }
            return true;
        }
    }

    /// Release `bytes` previously reserved through [`Self::try_consume`].
    pub fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let prev = self.consumed_bytes.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "release of {} bytes exceeds consumption", bytes);
        if let Some(parent) = &self.parent {
            parent.release(bytes);
        }
    }

    /// Bytes currently reserved through this tracker.
    pub fn consumption(&self) -> usize {
        self.consumed_bytes.load(Ordering::Acquire)
    }

    /// Bytes still available before this tracker's own limit.
    pub fn spare_capacity(&self) -> usize {
        let local = self.limit_bytes.saturating_sub(self.consumption());
        match &self.parent {
            Some(parent) => local.min(parent.spare_capacity()),
            None => local,
        }
    }

    /// Construct the recoverable budget-denied error for a failed reservation.
    pub fn mem_limit_exceeded(&self, detail: impl Into<String>) -> RiffleError {
        RiffleError::MemoryBudget(format!(
            "{}: {} (consumed {} of {} bytes)",
            self.label,
            detail.into(),
            self.consumption(),
            self.limit_bytes,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_respects_limit() {
        let t = MemTracker::new("op", 100);
        assert!(t.try_consume(80));
        assert!(!t.try_consume(21));
        assert!(t.try_consume(20));
        assert_eq!(t.consumption(), 100);
        t.release(100);
        assert_eq!(t.consumption(), 0);
    }

    #[test]
    fn child_propagates_to_parent() {
        let root = MemTracker::new("engine", 100);
        let a = MemTracker::new_child(&root, "op-a", None);
        let b = MemTracker::new_child(&root, "op-b", None);
        assert!(a.try_consume(60));
        assert!(!b.try_consume(50));
        assert!(b.try_consume(40));
        assert_eq!(root.consumption(), 100);
        a.release(60);
        assert_eq!(root.consumption(), 40);
        assert_eq!(b.consumption(), 40);
    }

    #[test]
    fn failed_child_consume_leaves_no_residue() {
        let root = MemTracker::new("engine", 50);
        let child = MemTracker::new_child(&root, "op", None);
        assert!(child.try_consume(40));
        assert!(!child.try_consume(20));
        assert_eq!(child.consumption(), 40);
        assert_eq!(root.consumption(), 40);
    }
}
