//! Distributed map-and-combine over a range.
//!
//! Every chunk is reduced on its owner, and the per-chunk results come back
//! as call outcomes. Accumulators play no part here.
use anyhow::{anyhow, Context};
use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, error, instrument};

use crate::{
    error::{ParallelError, Result, WorkerFailure},
    executor::run_blocking,
    operation::Reduction,
    partition::{partition, Chunk, StepRange},
    runtime::WorkerContext,
    serializer::Serializer,
    transport::{RemoteCall, RemoteOutcome, Transport},
    worker::WorkerId,
};

/// Driver half of a distributed reduction.
pub struct ParallelReduce<'a> {
    transport: &'a dyn Transport,
    serializer: Serializer,
}

impl<'a> ParallelReduce<'a> {
    pub fn new(transport: &'a dyn Transport, serializer: Serializer) -> Self {
        Self {
            transport,
            serializer,
        }
    }

    /// Reduce `range` with `reduction`, spread over `workers`.
    ///
    /// Chunk results are combined in range order, so `combine` needs to be
    /// associative but not commutative. An empty range yields
    /// [`Reduction::empty`] without contacting any worker.
    ///
    /// # Errors
    ///
    /// [`ParallelError::Worker`] naming the first failed chunk in range order,
    /// once every chunk has answered. A failing `combine` on the driver is
    /// attributed to the driver.
    #[instrument(skip_all, fields(reduction = R::ID, len = range.len()))]
    pub async fn run<R: Reduction>(
        &self,
        reduction: &R,
        range: StepRange,
        workers: &[WorkerId],
    ) -> Result<R::Elem> {
        let len = i64::try_from(range.len()).map_err(|_| {
            ParallelError::InvalidArgument(format!("range of {} elements is too long", range.len()))
        })?;
        let chunks = partition(len, workers)?;
        if chunks.is_empty() {
            return Ok(reduction.empty());
        }

        let payload = Bytes::from(
            self.serializer
                .to_bytes(reduction)
                .map_err(ParallelError::Serialization)?,
        );
        debug!(chunks = chunks.len(), "dispatching chunks");

        let outcomes = join_all(chunks.iter().map(|chunk| {
            let call = RemoteCall {
                routing: R::ID.to_string(),
                correlation: None,
                chunk: *chunk,
                range,
                payload: payload.clone(),
                serializer: self.serializer,
            };
            let owner = chunk.owner;
            async move { (owner, self.transport.dispatch(owner, call).await) }
        }))
        .await;

        let mut partials = Vec::with_capacity(outcomes.len());
        for (worker, outcome) in outcomes {
            let bytes = outcome
                .map_err(|err| WorkerFailure {
                    worker,
                    message: err.to_string(),
                })
                .and_then(|outcome| outcome.into_result(worker))
                .map_err(|failure| {
                    error!(%failure, "chunk failed");
                    ParallelError::Worker(failure)
                })?;
            partials.push(
                self.serializer
                    .from_bytes::<R::Elem>(&bytes)
                    .map_err(ParallelError::Serialization)?,
            );
        }

        let mut partials = partials.into_iter();
        let Some(first) = partials.next() else {
            return Ok(reduction.empty());
        };
        let local = self.transport.local();
        partials
            .try_fold(first, |acc, elem| reduction.combine(acc, elem))
            .map_err(|err| {
                WorkerFailure {
                    worker: local,
                    message: format!("combining chunk results failed: {err:#}"),
                }
                .into()
            })
    }
}

/// Worker half of a distributed reduction: reduce the chunk of `call` with
/// `R` and return the encoded element.
pub async fn execute_chunk<R: Reduction>(call: RemoteCall, context: WorkerContext) -> RemoteOutcome {
    let RemoteCall {
        correlation,
        chunk,
        range,
        payload,
        serializer,
        ..
    } = call;

    let reduction = match context
        .receive_context(correlation, serializer)
        .enter(|| serializer.from_bytes::<R>(&payload))
    {
        Ok(reduction) => reduction,
        Err(err) => return RemoteOutcome::Err(format!("failed to decode `{}`: {err:#}", R::ID)),
    };

    match run_blocking(move || fold_chunk(&reduction, &range, chunk)).await {
        Ok(elem) => match serializer.to_bytes(&elem) {
            Ok(bytes) => RemoteOutcome::Ok(Bytes::from(bytes)),
            Err(err) => RemoteOutcome::Err(format!("failed to encode chunk result: {err:#}")),
        },
        Err(message) => {
            error!(worker = %context.id(), lo = chunk.lo, hi = chunk.hi, %message, "chunk failed");
            RemoteOutcome::Err(message)
        }
    }
}

fn fold_chunk<R: Reduction>(reduction: &R, range: &StepRange, chunk: Chunk) -> anyhow::Result<R::Elem> {
    let mut elements = chunk.indices().map(|k| -> anyhow::Result<R::Elem> {
        let index = range
            .nth(k)
            .ok_or_else(|| anyhow!("chunk index {k} is outside a range of {} elements", range.len()))?;
        reduction
            .map(index)
            .with_context(|| format!("map failed at index {index}"))
    });

    let first = elements
        .next()
        .ok_or_else(|| anyhow!("chunk {}..={} is empty", chunk.lo, chunk.hi))??;
    elements.try_fold(first, |acc, elem| reduction.combine(acc, elem?))
}
