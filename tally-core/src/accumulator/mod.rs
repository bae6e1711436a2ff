//! Worker-local accumulation with an explicit merge on the driver.
//!
//! An [`Accumulator`] is created on the driver with an initial value. When a
//! loop body holding it is shipped to a worker, the worker decodes a fresh
//! copy starting from the initial value, mutates it locally while running its
//! chunk, and finally pushes the local value back to the driver's mailbox.
//! The driver then calls [`Accumulator::reduce`] to wait for exactly one
//! contribution per worker the accumulator was sent to, and combine them.
//!
//! ```
//! # use tally::runtime::Runtime;
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let runtime = Runtime::in_memory().await?;
//! let total = runtime.accumulator(0_i64);
//!
//! // Never transmitted: reduce returns the local value right away.
//! total.write(42);
//! assert_eq!(total.reduce(|a, b| a + b).await?, 42);
//! # Ok(())
//! # }
//! ```
use std::{
    collections::BTreeSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use serde::{de, ser, Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::{
    error::{ParallelError, Result},
    serializer::{Serializable, Serializer},
    transport::{
        hooks::{self, ReceiveContext, Transmitted},
        node::{Mailboxes, Node},
        Contribution, ContributionSink, Delivery,
    },
    worker::{AccumulatorId, WorkerId},
};

pub mod reduce;
pub mod registry;

use reduce::ReduceDriver;
use registry::Contributor;

/// A value accumulated independently on several workers and merged on its
/// home node.
///
/// Cloning yields another handle to the same accumulator.
pub struct Accumulator<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Accumulator<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<T> {
    id: AccumulatorId,
    home: WorkerId,
    initial: T,
    serializer: Serializer,
    state: Mutex<State<T>>,
    role: Role,
}

struct State<T> {
    value: T,
    /// Workers holding a copy that has yet to report back.
    pending: BTreeSet<WorkerId>,
    /// Abandoned workers whose own contribution may still arrive late.
    abandoned: BTreeSet<WorkerId>,
    generation: u64,
}

enum Role {
    /// The authoritative instance, living on its home node.
    Home {
        outbox: UnboundedSender<Delivery>,
        inbox: tokio::sync::Mutex<UnboundedReceiver<Delivery>>,
        mailboxes: Mailboxes,
    },
    /// A copy decoded on a worker.
    Copy {
        local: WorkerId,
        sink: Arc<dyn ContributionSink>,
    },
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Role::Home { mailboxes, .. } = &self.role {
            mailboxes.close(self.id);
        }
    }
}

impl<T> Shared<T> {
    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Serializable + Clone> Shared<T> {
    fn encode_value(&self) -> Result<(Bytes, u64)> {
        let (value, generation) = {
            let mut state = self.state();
            state.generation += 1;
            (state.value.clone(), state.generation)
        };
        let bytes = self
            .serializer
            .to_bytes(&value)
            .map_err(ParallelError::Serialization)?;
        Ok((Bytes::from(bytes), generation))
    }

    fn push(&self) -> Result<()> {
        match &self.role {
            Role::Copy { local, sink } => {
                let (bytes, generation) = self.encode_value()?;
                debug!(accumulator = %self.id, worker = %local, generation, "pushing local value");
                sink.deliver(
                    self.home,
                    Delivery {
                        accumulator: self.id,
                        from: *local,
                        contribution: Contribution::Ok(bytes),
                    },
                )?;
                Ok(())
            }
            Role::Home { outbox, .. } => {
                if self.state().pending.contains(&self.home) {
                    return Err(ParallelError::InvalidArgument(format!(
                        "{} already has a pending contribution for accumulator {}",
                        self.home, self.id
                    )));
                }
                let (bytes, _) = self.encode_value()?;
                self.state().pending.insert(self.home);
                self.send_home(
                    outbox,
                    Delivery {
                        accumulator: self.id,
                        from: self.home,
                        contribution: Contribution::Ok(bytes),
                    },
                );
                Ok(())
            }
        }
    }

    fn push_failure(&self) -> Result<()> {
        match &self.role {
            Role::Copy { local, sink } => {
                debug!(accumulator = %self.id, worker = %local, "pushing failure");
                sink.deliver(
                    self.home,
                    Delivery {
                        accumulator: self.id,
                        from: *local,
                        contribution: Contribution::Failed,
                    },
                )?;
                Ok(())
            }
            Role::Home { .. } => Err(ParallelError::InvalidArgument(
                "failures are reported by worker copies, not by the home instance".to_string(),
            )),
        }
    }

    fn send_home(&self, outbox: &UnboundedSender<Delivery>, delivery: Delivery) {
        if outbox.send(delivery).is_err() {
            warn!(accumulator = %self.id, "home inbox closed, dropping contribution");
        }
    }
}

impl<T: Send + Sync> Transmitted for Shared<T> {
    fn id(&self) -> AccumulatorId {
        self.id
    }

    fn abandon(&self, worker: WorkerId) {
        if let Role::Home { outbox, .. } = &self.role {
            debug!(accumulator = %self.id, %worker, "abandoning copy that will never report");
            if outbox
                .send(Delivery {
                    accumulator: self.id,
                    from: worker,
                    contribution: Contribution::Abandoned,
                })
                .is_err()
            {
                warn!(accumulator = %self.id, "home inbox closed, dropping failure marker");
            }
        }
    }
}

impl<T: Serializable + Clone> Contributor for Shared<T> {
    fn id(&self) -> AccumulatorId {
        self.id
    }

    fn push(&self) -> Result<()> {
        Shared::push(self)
    }

    fn push_failure(&self) -> Result<()> {
        Shared::push_failure(self)
    }
}

impl<T: Serializable + Clone> Accumulator<T> {
    /// Create an accumulator homed on `node`.
    ///
    /// Contributions are decoded with `serializer`, which must match the one
    /// the node's calls are encoded with.
    pub fn new(initial: T, node: &Node, serializer: Serializer) -> Self {
        let id = AccumulatorId::new();
        let (outbox, inbox) = node.mailboxes().open(id);

        Self {
            shared: Arc::new(Shared {
                id,
                home: node.id(),
                initial: initial.clone(),
                serializer,
                state: Mutex::new(State {
                    value: initial,
                    pending: BTreeSet::new(),
                    abandoned: BTreeSet::new(),
                    generation: 0,
                }),
                role: Role::Home {
                    outbox,
                    inbox: tokio::sync::Mutex::new(inbox),
                    mailboxes: node.mailboxes().clone(),
                },
            }),
        }
    }

    fn copy(wire: Wire<T>, context: &ReceiveContext) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: wire.id,
                home: wire.home,
                initial: wire.initial.clone(),
                serializer: context.serializer(),
                state: Mutex::new(State {
                    value: wire.initial,
                    pending: BTreeSet::new(),
                    abandoned: BTreeSet::new(),
                    generation: wire.generation,
                }),
                role: Role::Copy {
                    local: context.local(),
                    sink: context.sink().clone(),
                },
            }),
        }
    }

    pub fn id(&self) -> AccumulatorId {
        self.shared.id
    }

    /// The node whose mailbox receives this accumulator's contributions.
    pub fn home(&self) -> WorkerId {
        self.shared.home
    }

    pub fn initial(&self) -> T {
        self.shared.initial.clone()
    }

    /// Whether this handle is a worker-local copy rather than the instance
    /// living on its home node.
    pub fn is_copy(&self) -> bool {
        matches!(self.shared.role, Role::Copy { .. })
    }

    pub fn generation(&self) -> u64 {
        self.shared.state().generation
    }

    /// Workers that received a copy and have not been reduced yet.
    pub fn pending(&self) -> Vec<WorkerId> {
        self.shared.state().pending.iter().copied().collect()
    }

    /// The current local value.
    pub fn read(&self) -> T {
        self.shared.state().value.clone()
    }

    /// Replace the local value.
    pub fn write(&self, value: T) {
        self.shared.state().value = value;
    }

    /// Modify the local value in place, under a single lock.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.shared.state().value);
    }

    /// Report the local value to the home node.
    ///
    /// On a worker copy this enqueues a contribution from the local worker.
    /// On the home instance it enqueues a contribution from the home node
    /// itself and marks it pending, so the next [`reduce`](Self::reduce)
    /// consumes it. Inside a parallel-for, copies are pushed automatically
    /// once their chunk completes. Outside of it, push at most once per
    /// worker per round.
    pub fn push(&self) -> Result<()> {
        self.shared.push()
    }

    /// Combine the contributions of every pending worker with `op`, starting
    /// from the initial value.
    ///
    /// See [`reduce_with`](Self::reduce_with).
    pub async fn reduce<F>(&self, op: F) -> Result<T>
    where
        F: FnMut(T, T) -> T,
    {
        self.reduce_with(op, self.initial()).await
    }

    /// Combine the contributions of every pending worker with `op`, starting
    /// from `seed`, in arrival order.
    ///
    /// If no worker is pending, the current value is returned unchanged.
    /// Otherwise this waits until every pending worker has reported. When all
    /// of them succeeded, the combined value becomes the current value. When
    /// any of them failed, the current value is kept and the failures are
    /// returned.
    ///
    /// # Errors
    ///
    /// - [`ParallelError::InvalidArgument`] when called on a worker copy.
    /// - [`ParallelError::Worker`] or [`ParallelError::Composite`] when
    ///   workers failed.
    /// - [`ParallelError::ProtocolViolation`] when a worker that is not
    ///   pending reports.
    pub async fn reduce_with<F>(&self, op: F, seed: T) -> Result<T>
    where
        F: FnMut(T, T) -> T,
    {
        let Role::Home { inbox, .. } = &self.shared.role else {
            return Err(ParallelError::InvalidArgument(
                "reduce can only be called on the home instance of an accumulator".to_string(),
            ));
        };

        let mut inbox = inbox.lock().await;
        let (pending, abandoned) = {
            let mut state = self.shared.state();
            if state.pending.is_empty() {
                return Ok(state.value.clone());
            }
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.abandoned),
            )
        };
        debug!(accumulator = %self.id(), pending = pending.len(), "waiting for contributions");

        let mut driver = ReduceDriver::new(self.id(), self.shared.serializer, pending, seed, op)
            .tolerating(abandoned);
        let collected = driver.collect(&mut inbox).await;
        self.shared.state().abandoned = driver.take_abandoned();
        collected?;
        let value = driver.finish()?;

        let mut state = self.shared.state();
        state.value = value.clone();
        state.generation += 1;
        Ok(value)
    }

    /// Reset the accumulator as if it had just been created.
    ///
    /// The value returns to the initial value, pending workers are forgotten
    /// and contributions already waiting in the mailbox are discarded.
    /// Contributions still in flight will be seen as unexpected by the next
    /// [`reduce`](Self::reduce), so do not clear while a round is outstanding.
    pub fn clear(&self) {
        {
            let mut state = self.shared.state();
            state.value = self.shared.initial.clone();
            state.pending.clear();
            state.abandoned.clear();
            state.generation += 1;
        }

        if let Role::Home { inbox, .. } = &self.shared.role {
            if let Ok(mut inbox) = inbox.try_lock() {
                let mut discarded = 0_usize;
                while inbox.try_recv().is_ok() {
                    discarded += 1;
                }
                if discarded > 0 {
                    debug!(accumulator = %self.id(), discarded, "discarded delivered contributions");
                }
            }
        }
    }
}

impl<T> fmt::Debug for Accumulator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state();
        f.debug_struct("Accumulator")
            .field("id", &self.shared.id)
            .field("home", &self.shared.home)
            .field("copy", &matches!(self.shared.role, Role::Copy { .. }))
            .field("pending", &state.pending)
            .field("generation", &state.generation)
            .finish()
    }
}

/// What travels with a transmitted accumulator. The local value does not:
/// every copy starts from the initial value.
#[derive(Deserialize)]
struct Wire<T> {
    id: AccumulatorId,
    home: WorkerId,
    generation: u64,
    initial: T,
}

#[derive(Serialize)]
struct WireRef<'a, T> {
    id: AccumulatorId,
    home: WorkerId,
    generation: u64,
    initial: &'a T,
}

impl<T: Serializable + Clone> Serialize for Accumulator<T> {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.is_copy() {
            return Err(ser::Error::custom(format!(
                "accumulator {} is a worker copy and cannot be transmitted again",
                self.id()
            )));
        }

        let destination = hooks::with_send_context(|context| {
            context.record(self.shared.clone());
            context.destination()
        });
        let generation = {
            let mut state = self.shared.state();
            if let Some(destination) = destination {
                state.pending.insert(destination);
            }
            state.generation
        };

        WireRef {
            id: self.shared.id,
            home: self.shared.home,
            generation,
            initial: &self.shared.initial,
        }
        .serialize(serializer)
    }
}

impl<'de, T: Serializable + Clone> Deserialize<'de> for Accumulator<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = Wire::<T>::deserialize(deserializer)?;
        let id = wire.id;

        hooks::with_receive_context(|context| {
            if let Some(seen) = context.decoded(id) {
                return seen
                    .downcast::<Shared<T>>()
                    .map(|shared| Self { shared })
                    .map_err(|_| format!("accumulator {id} was decoded with two value types"));
            }

            let copy = Self::copy(wire, context);
            context.remember(id, copy.shared.clone());
            if let Some(correlation) = context.correlation() {
                context.registry().register(correlation, copy.shared.clone());
            }
            Ok(copy)
        })
        .ok_or_else(|| {
            <D::Error as de::Error>::custom("accumulator decoded outside of a receive context")
        })?
        .map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        testing::with_timeout,
        transport::{hooks::encode_for, DispatchError},
        worker::CorrelationId,
    };

    /// Routes deliveries straight into one node's mailboxes.
    struct NodeSink(Node);

    impl ContributionSink for NodeSink {
        fn deliver(&self, _: WorkerId, delivery: Delivery) -> std::result::Result<(), DispatchError> {
            self.0.mailboxes().post(delivery);
            Ok(())
        }
    }

    struct Harness {
        driver: Node,
        sink: Arc<dyn ContributionSink>,
    }

    impl Harness {
        fn new() -> Self {
            let driver = Node::new(WorkerId(1));
            let sink: Arc<dyn ContributionSink> = Arc::new(NodeSink(driver.clone()));
            Self { driver, sink }
        }

        fn accumulator(&self, initial: i64) -> Accumulator<i64> {
            Accumulator::new(initial, &self.driver, Serializer::Postcard)
        }

        /// Transmit `acc` to `worker` and decode the worker's copy.
        fn ship(
            &self,
            acc: &Accumulator<i64>,
            worker: &Node,
            correlation: Option<CorrelationId>,
        ) -> Accumulator<i64> {
            let (bytes, _) = encode_for(worker.id(), Serializer::Postcard, acc).unwrap();
            ReceiveContext::new(
                worker.id(),
                correlation,
                Serializer::Postcard,
                self.sink.clone(),
                worker.registry().clone(),
            )
            .enter(|| Serializer::Postcard.from_bytes(&bytes))
            .unwrap()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn reduce_without_transmission_returns_local_value() {
        let harness = Harness::new();
        let acc = harness.accumulator(0);

        acc.write(5);
        assert_eq!(with_timeout(acc.reduce(|a, b| a + b)).await.unwrap(), 5);
        assert!(acc.pending().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn reduce_combines_one_contribution_per_worker() {
        let harness = Harness::new();
        let acc = harness.accumulator(0);
        let workers: Vec<_> = (2..=4).map(|id| Node::new(WorkerId(id))).collect();

        let copies: Vec<_> = workers
            .iter()
            .map(|worker| harness.ship(&acc, worker, None))
            .collect();
        assert_eq!(acc.pending(), vec![WorkerId(2), WorkerId(3), WorkerId(4)]);

        for (copy, value) in copies.iter().zip([5, 7, 9]) {
            assert!(copy.is_copy());
            assert_eq!(copy.read(), 0);
            copy.write(value);
            copy.push().unwrap();
        }

        let generation = acc.generation();
        assert_eq!(with_timeout(acc.reduce(|a, b| a + b)).await.unwrap(), 21);
        assert_eq!(acc.read(), 21);
        assert!(acc.pending().is_empty());
        assert!(acc.generation() > generation);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn failure_marker_unblocks_reduce() {
        let harness = Harness::new();
        let acc = harness.accumulator(0);
        acc.write(3);
        let healthy = harness.ship(&acc, &Node::new(WorkerId(2)), None);
        let broken = harness.ship(&acc, &Node::new(WorkerId(3)), None);

        healthy.write(10);
        healthy.push().unwrap();
        broken.push_failure_for_test();

        let err = with_timeout(acc.reduce(|a, b| a + b)).await.unwrap_err();
        assert!(matches!(
            err,
            ParallelError::Worker(crate::error::WorkerFailure { worker: WorkerId(3), .. })
        ));
        assert_eq!(acc.read(), 3);
        assert!(acc.pending().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn abandoned_copy_unblocks_reduce() {
        let harness = Harness::new();
        let acc = harness.accumulator(0);
        let (_, transmitted) = encode_for(WorkerId(6), Serializer::Postcard, &acc).unwrap();

        hooks::abandon_all(&transmitted, WorkerId(6));

        let err = with_timeout(acc.reduce(|a, b| a + b)).await.unwrap_err();
        assert_eq!(err.failed_workers(), vec![WorkerId(6)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn clear_is_idempotent() {
        let harness = Harness::new();
        let acc = harness.accumulator(7);
        acc.write(100);
        harness.ship(&acc, &Node::new(WorkerId(2)), None);

        acc.clear();
        let generation = acc.generation();
        acc.clear();

        assert_eq!(acc.read(), 7);
        assert!(acc.pending().is_empty());
        assert_eq!(acc.generation(), generation + 1);
        assert_eq!(with_timeout(acc.reduce(|a, b| a + b)).await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn clear_discards_delivered_contributions() {
        let harness = Harness::new();
        let acc = harness.accumulator(0);
        let copy = harness.ship(&acc, &Node::new(WorkerId(2)), None);
        copy.write(1);
        copy.push().unwrap();

        acc.clear();
        harness.ship(&acc, &Node::new(WorkerId(2)), None).push().unwrap();

        assert_eq!(with_timeout(acc.reduce(|a, b| a + b)).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn unexpected_worker_is_a_protocol_violation() {
        let harness = Harness::new();
        let acc = harness.accumulator(0);
        harness.ship(&acc, &Node::new(WorkerId(2)), None);

        harness.driver.mailboxes().post(Delivery {
            accumulator: acc.id(),
            from: WorkerId(9),
            contribution: Contribution::Failed,
        });

        let err = with_timeout(acc.reduce(|a, b| a + b)).await.unwrap_err();
        assert!(matches!(
            err,
            ParallelError::ProtocolViolation { worker: WorkerId(9), .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn push_on_home_is_consumed_by_reduce() {
        let harness = Harness::new();
        let acc = harness.accumulator(1);
        acc.write(4);

        acc.push().unwrap();
        assert_eq!(acc.pending(), vec![WorkerId(1)]);
        assert!(acc.push().is_err());
        assert_eq!(with_timeout(acc.reduce(|a, b| a + b)).await.unwrap(), 5);
    }

    #[test]
    fn decoded_copy_registers_under_correlation() {
        let harness = Harness::new();
        let acc = harness.accumulator(0);
        let worker = Node::new(WorkerId(2));
        let correlation = CorrelationId::new();

        harness.ship(&acc, &worker, Some(correlation));

        let registered: Vec<_> = worker
            .registry()
            .take(correlation)
            .iter()
            .map(|copy| copy.id())
            .collect();
        assert_eq!(registered, vec![acc.id()]);
    }

    #[test]
    fn repeated_handle_decodes_to_one_copy() {
        let harness = Harness::new();
        let acc = harness.accumulator(0);
        let worker = Node::new(WorkerId(2));
        let correlation = CorrelationId::new();

        let (bytes, transmitted) =
            encode_for(worker.id(), Serializer::Postcard, &(acc.clone(), acc.clone())).unwrap();
        assert_eq!(transmitted.len(), 1);
        assert_eq!(acc.pending(), vec![WorkerId(2)]);

        let (first, second): (Accumulator<i64>, Accumulator<i64>) = ReceiveContext::new(
            worker.id(),
            Some(correlation),
            Serializer::Postcard,
            harness.sink.clone(),
            worker.registry().clone(),
        )
        .enter(|| Serializer::Postcard.from_bytes(&bytes))
        .unwrap();

        first.write(8);
        assert_eq!(second.read(), 8);
        assert_eq!(worker.registry().take(correlation).len(), 1);
    }

    #[test]
    fn copies_cannot_be_retransmitted() {
        let harness = Harness::new();
        let acc = harness.accumulator(0);
        let copy = harness.ship(&acc, &Node::new(WorkerId(2)), None);

        assert!(encode_for(WorkerId(3), Serializer::Postcard, &copy).is_err());
        assert!(copy.reduce_blocking_for_test().is_err());
    }

    #[test]
    fn decoding_requires_a_receive_context() {
        let harness = Harness::new();
        let acc = harness.accumulator(0);
        let bytes = Serializer::Postcard.to_bytes(&acc).unwrap();

        assert!(Serializer::Postcard.from_bytes::<Accumulator<i64>>(&bytes).is_err());
        assert!(acc.pending().is_empty());
    }

    #[test]
    fn dropping_last_handle_closes_mailbox() {
        let harness = Harness::new();
        let acc = harness.accumulator(0);
        let other = acc.clone();
        let id = acc.id();

        drop(acc);
        assert!(harness.driver.mailboxes().contains(id));
        drop(other);
        assert!(!harness.driver.mailboxes().contains(id));
    }

    impl Accumulator<i64> {
        fn push_failure_for_test(&self) {
            self.shared.push_failure().unwrap();
        }

        fn reduce_blocking_for_test(&self) -> Result<i64> {
            futures::executor::block_on(self.reduce(|a, b| a + b))
        }
    }
}
