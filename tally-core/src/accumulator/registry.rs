//! Worker-side table of received accumulator copies.
//!
//! The receive hook inserts every accumulator copy decoded with a call under
//! the call's [`CorrelationId`]. The chunk wrapper removes the whole list once,
//! right before the loop body runs, and later pushes each copy.
use std::{fmt, sync::Arc};

use dashmap::DashMap;

use crate::{error::Result, worker::{AccumulatorId, CorrelationId}};

/// The worker-side half of an accumulator copy.
pub trait Contributor: Send + Sync {
    fn id(&self) -> AccumulatorId;

    /// Report the copy's local value to the accumulator's home.
    fn push(&self) -> Result<()>;

    /// Report that the chunk owning this copy failed.
    fn push_failure(&self) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct AccumulatorRegistry {
    entries: Arc<DashMap<CorrelationId, Vec<Arc<dyn Contributor>>>>,
}

impl AccumulatorRegistry {
    pub fn register(&self, correlation: CorrelationId, copy: Arc<dyn Contributor>) {
        self.entries.entry(correlation).or_default().push(copy);
    }

    /// Remove and return every copy registered under `correlation`, in the
    /// order they were decoded. Empty if there were none.
    pub fn take(&self, correlation: CorrelationId) -> Vec<Arc<dyn Contributor>> {
        self.entries
            .remove(&correlation)
            .map(|(_, copies)| copies)
            .unwrap_or_default()
    }

    pub fn contains(&self, correlation: CorrelationId) -> bool {
        self.entries.contains_key(&correlation)
    }

    /// Number of invocations with registered copies.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for AccumulatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccumulatorRegistry")
            .field("invocations", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counting {
        id: AccumulatorId,
        pushes: AtomicUsize,
    }

    impl Contributor for Counting {
        fn id(&self) -> AccumulatorId {
            self.id
        }

        fn push(&self) -> Result<()> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn push_failure(&self) -> Result<()> {
            Ok(())
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            id: AccumulatorId::new(),
            pushes: AtomicUsize::new(0),
        })
    }

    #[test]
    fn take_removes_exactly_once() {
        let registry = AccumulatorRegistry::default();
        let correlation = CorrelationId::new();
        let a = counting();
        let b = counting();

        registry.register(correlation, a.clone());
        registry.register(correlation, b.clone());
        assert!(registry.contains(correlation));

        let taken: Vec<_> = registry.take(correlation).iter().map(|c| c.id()).collect();
        assert_eq!(taken, vec![a.id, b.id]);
        assert!(registry.take(correlation).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn invocations_are_kept_apart() {
        let registry = AccumulatorRegistry::default();
        let first = CorrelationId::new();
        let second = CorrelationId::new();

        registry.register(first, counting());
        registry.register(second, counting());
        registry.register(second, counting());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.take(first).len(), 1);
        assert_eq!(registry.take(second).len(), 2);
    }
}
