//! Per-node protocol state.
//!
//! Each participant owns one [`Node`]: the mailboxes of the accumulators it
//! created and the registry of accumulator copies it received. Nothing here
//! is process-global, so several nodes can share one process.
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{trace, warn};

use crate::{
    accumulator::registry::AccumulatorRegistry,
    transport::Delivery,
    worker::{AccumulatorId, WorkerId},
};

/// Inbound contribution channels, keyed by the accumulator they feed.
#[derive(Clone, Default, Debug)]
pub struct Mailboxes {
    inner: Arc<DashMap<AccumulatorId, UnboundedSender<Delivery>>>,
}

impl Mailboxes {
    /// Open the mailbox of a new accumulator.
    ///
    /// Returns the sender registered for `id` together with its receiver.
    pub(crate) fn open(
        &self,
        id: AccumulatorId,
    ) -> (UnboundedSender<Delivery>, UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.insert(id, tx.clone());
        (tx, rx)
    }

    pub(crate) fn close(&self, id: AccumulatorId) {
        self.inner.remove(&id);
    }

    pub fn contains(&self, id: AccumulatorId) -> bool {
        self.inner.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Hand `delivery` to its accumulator's mailbox.
    ///
    /// Deliveries for an accumulator that no longer exists are dropped.
    pub fn post(&self, delivery: Delivery) {
        let accumulator = delivery.accumulator;
        let from = delivery.from;
        let sent = match self.inner.get(&accumulator) {
            Some(tx) => tx.send(delivery).is_ok(),
            None => false,
        };

        if sent {
            trace!(%accumulator, %from, "contribution delivered");
        } else {
            warn!(%accumulator, %from, "dropping contribution for unknown accumulator");
        }
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    id: WorkerId,
    mailboxes: Mailboxes,
    registry: AccumulatorRegistry,
}

impl Node {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            mailboxes: Mailboxes::default(),
            registry: AccumulatorRegistry::default(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn mailboxes(&self) -> &Mailboxes {
        &self.mailboxes
    }

    pub fn registry(&self) -> &AccumulatorRegistry {
        &self.registry
    }
}
