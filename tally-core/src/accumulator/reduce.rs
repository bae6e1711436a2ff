//! Driver-side collection of accumulator contributions.
use std::collections::BTreeSet;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, trace, warn};

use crate::{
    error::{ParallelError, Result, WorkerFailure},
    serializer::{Serializable, Serializer},
    transport::{Contribution, Delivery, DispatchError},
    worker::{AccumulatorId, WorkerId},
};

/// Waits for exactly one contribution from every pending worker and folds
/// the successful ones, in arrival order, starting from a seed.
///
/// A failed contribution does not stop the wait; it only turns the final
/// result into an error once every pending worker has reported.
///
/// An abandoned worker may still have pushed before its call was lost, so
/// one late delivery from it is discarded rather than treated as a protocol
/// violation. The same holds for an abandonment marker that arrives after
/// the worker's own contribution.
pub struct ReduceDriver<T, F> {
    accumulator: AccumulatorId,
    serializer: Serializer,
    pending: BTreeSet<WorkerId>,
    abandoned: BTreeSet<WorkerId>,
    seed: T,
    op: F,
    contributions: Vec<T>,
    failures: Vec<WorkerFailure>,
}

impl<T, F> ReduceDriver<T, F>
where
    T: Serializable,
    F: FnMut(T, T) -> T,
{
    pub fn new(
        accumulator: AccumulatorId,
        serializer: Serializer,
        pending: BTreeSet<WorkerId>,
        seed: T,
        op: F,
    ) -> Self {
        Self {
            accumulator,
            serializer,
            contributions: Vec::with_capacity(pending.len()),
            pending,
            abandoned: BTreeSet::new(),
            seed,
            op,
            failures: Vec::new(),
        }
    }

    /// Also discard one late delivery from each of `abandoned`, left over
    /// from an earlier reduction.
    pub fn tolerating(mut self, abandoned: BTreeSet<WorkerId>) -> Self {
        self.abandoned.extend(abandoned);
        self
    }

    /// Abandoned workers whose late delivery has not shown up yet.
    pub fn take_abandoned(&mut self) -> BTreeSet<WorkerId> {
        std::mem::take(&mut self.abandoned)
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Workers that have yet to report.
    pub fn outstanding(&self) -> &BTreeSet<WorkerId> {
        &self.pending
    }

    /// Account for one delivery.
    ///
    /// # Errors
    ///
    /// [`ParallelError::ProtocolViolation`] if the delivery is addressed to
    /// another accumulator or comes from a worker that is neither pending nor
    /// abandoned.
    pub fn accept(&mut self, delivery: Delivery) -> Result<()> {
        let Delivery {
            accumulator,
            from,
            contribution,
        } = delivery;

        if accumulator != self.accumulator {
            return Err(ParallelError::ProtocolViolation {
                accumulator: self.accumulator,
                worker: from,
            });
        }
        if !self.pending.remove(&from) {
            let late = contribution == Contribution::Abandoned || self.abandoned.remove(&from);
            if late {
                debug!(accumulator = %self.accumulator, %from, "discarding late delivery");
                return Ok(());
            }
            return Err(ParallelError::ProtocolViolation {
                accumulator: self.accumulator,
                worker: from,
            });
        }
        trace!(accumulator = %self.accumulator, %from, remaining = self.pending.len(), "contribution received");

        match contribution {
            Contribution::Ok(bytes) => match self.serializer.from_bytes::<T>(&bytes) {
                Ok(value) => self.contributions.push(value),
                Err(err) => self.failures.push(WorkerFailure {
                    worker: from,
                    message: format!("undecodable contribution: {err:#}"),
                }),
            },
            Contribution::Failed => self.failures.push(WorkerFailure {
                worker: from,
                message: "chunk failed before contributing".to_string(),
            }),
            Contribution::Abandoned => {
                self.abandoned.insert(from);
                self.failures.push(WorkerFailure {
                    worker: from,
                    message: "call was lost before the chunk reported".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Receive from `inbox` until every pending worker has reported, then
    /// produce the combined value.
    pub async fn drive(mut self, inbox: &mut UnboundedReceiver<Delivery>) -> Result<T> {
        self.collect(inbox).await?;
        self.finish()
    }

    /// Receive from `inbox` until every pending worker has reported.
    pub async fn collect(&mut self, inbox: &mut UnboundedReceiver<Delivery>) -> Result<()> {
        loop {
            let Some(next) = self.pending.first().copied() else {
                break;
            };
            match inbox.recv().await {
                Some(delivery) => self.accept(delivery)?,
                None => {
                    warn!(accumulator = %self.accumulator, outstanding = self.pending.len(), "inbox closed mid-reduction");
                    return Err(DispatchError::Dropped(next).into());
                }
            }
        }

        Ok(())
    }

    /// Fold the collected contributions, or report the failed workers.
    pub fn finish(self) -> Result<T> {
        if let Some(err) = ParallelError::from_failures(self.failures) {
            return Err(err);
        }

        Ok(self.contributions.into_iter().fold(self.seed, self.op))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;

    fn ok(accumulator: AccumulatorId, from: u32, value: i64) -> Delivery {
        Delivery {
            accumulator,
            from: WorkerId(from),
            contribution: Contribution::Ok(Bytes::from(
                Serializer::Postcard.to_bytes(&value).unwrap(),
            )),
        }
    }

    fn failed(accumulator: AccumulatorId, from: u32) -> Delivery {
        Delivery {
            accumulator,
            from: WorkerId(from),
            contribution: Contribution::Failed,
        }
    }

    fn abandoned(accumulator: AccumulatorId, from: u32) -> Delivery {
        Delivery {
            accumulator,
            from: WorkerId(from),
            contribution: Contribution::Abandoned,
        }
    }

    fn pending(ids: &[u32]) -> BTreeSet<WorkerId> {
        ids.iter().copied().map(WorkerId).collect()
    }

    #[tokio::test]
    async fn folds_every_contribution() {
        let id = AccumulatorId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for (from, value) in [(3, 7), (2, 5), (4, 9)] {
            tx.send(ok(id, from, value)).unwrap();
        }

        let driver = ReduceDriver::new(id, Serializer::Postcard, pending(&[2, 3, 4]), 0_i64, |a, b| a + b);
        assert_eq!(driver.drive(&mut rx).await.unwrap(), 21);
    }

    #[tokio::test]
    async fn folds_in_arrival_order() {
        let id = AccumulatorId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(ok(id, 4, 3)).unwrap();
        tx.send(ok(id, 2, 1)).unwrap();

        let driver = ReduceDriver::new(id, Serializer::Postcard, pending(&[2, 4]), 0_i64, |a, b| a * 10 + b);
        assert_eq!(driver.drive(&mut rx).await.unwrap(), 31);
    }

    #[tokio::test]
    async fn one_failure_is_a_worker_failure() {
        let id = AccumulatorId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(ok(id, 2, 5)).unwrap();
        tx.send(failed(id, 3)).unwrap();

        let driver = ReduceDriver::new(id, Serializer::Postcard, pending(&[2, 3]), 0, |a: i64, b| a + b);
        let err = driver.drive(&mut rx).await.unwrap_err();
        assert!(matches!(err, ParallelError::Worker(WorkerFailure { worker: WorkerId(3), .. })));
    }

    #[tokio::test]
    async fn several_failures_are_composite() {
        let id = AccumulatorId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(failed(id, 2)).unwrap();
        tx.send(failed(id, 3)).unwrap();

        let driver = ReduceDriver::new(id, Serializer::Postcard, pending(&[2, 3]), 0, |a: i64, b| a + b);
        match driver.drive(&mut rx).await {
            Err(ParallelError::Composite(composite)) => {
                assert_eq!(composite.workers(), vec![WorkerId(2), WorkerId(3)])
            }
            other => panic!("expected a composite failure, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unexpected_worker() {
        let id = AccumulatorId::new();
        let mut driver = ReduceDriver::new(id, Serializer::Postcard, pending(&[2]), 0, |a: i64, b| a + b);

        let err = driver.accept(ok(id, 9, 1)).unwrap_err();
        assert!(matches!(err, ParallelError::ProtocolViolation { worker: WorkerId(9), .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn rejects_second_contribution_from_same_worker() {
        let id = AccumulatorId::new();
        let mut driver = ReduceDriver::new(id, Serializer::Postcard, pending(&[2, 3]), 0, |a: i64, b| a + b);

        driver.accept(ok(id, 2, 1)).unwrap();
        assert!(driver.accept(ok(id, 2, 1)).is_err());
        assert_eq!(driver.outstanding(), &pending(&[3]));
    }

    #[tokio::test]
    async fn late_push_from_abandoned_worker_is_discarded() {
        let id = AccumulatorId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(abandoned(id, 2)).unwrap();
        tx.send(ok(id, 2, 100)).unwrap();
        tx.send(ok(id, 3, 5)).unwrap();

        let driver = ReduceDriver::new(id, Serializer::Postcard, pending(&[2, 3]), 0, |a: i64, b| a + b);
        let err = driver.drive(&mut rx).await.unwrap_err();
        assert!(matches!(err, ParallelError::Worker(WorkerFailure { worker: WorkerId(2), .. })));
    }

    #[tokio::test]
    async fn abandonment_after_a_push_is_discarded() {
        let id = AccumulatorId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(ok(id, 2, 4)).unwrap();
        tx.send(abandoned(id, 2)).unwrap();
        tx.send(ok(id, 3, 5)).unwrap();

        let driver = ReduceDriver::new(id, Serializer::Postcard, pending(&[2, 3]), 0, |a: i64, b| a + b);
        assert_eq!(driver.drive(&mut rx).await.unwrap(), 9);
    }

    #[test]
    fn abandoned_workers_carry_over_to_the_next_reduction() {
        let id = AccumulatorId::new();
        let mut first = ReduceDriver::new(id, Serializer::Postcard, pending(&[2]), 0, |a: i64, b| a + b);
        first.accept(abandoned(id, 2)).unwrap();
        let carried = first.take_abandoned();
        assert_eq!(carried, pending(&[2]));

        let mut second = ReduceDriver::new(id, Serializer::Postcard, pending(&[3]), 0, |a: i64, b| a + b)
            .tolerating(carried);
        second.accept(ok(id, 2, 1)).unwrap();
        assert!(second.accept(ok(id, 2, 1)).is_err());
        second.accept(ok(id, 3, 6)).unwrap();
        assert_eq!(second.finish().unwrap(), 6);
    }

    #[tokio::test]
    async fn closed_inbox_does_not_hang() {
        let id = AccumulatorId::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        drop(tx);

        let driver = ReduceDriver::new(id, Serializer::Postcard, pending(&[2]), 0, |a: i64, b| a + b);
        let err = driver.drive(&mut rx).await.unwrap_err();
        assert!(matches!(err, ParallelError::Transport(DispatchError::Dropped(WorkerId(2)))));
    }
}
