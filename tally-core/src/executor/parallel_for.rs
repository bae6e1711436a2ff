//! Distributed for-loops.
//!
//! A [`ParallelFor`] run:
//! 1. draws a fresh [`CorrelationId`] and partitions the range,
//! 2. encodes the body once per chunk with a send context for the chunk's
//!    owner, so every accumulator inside records that worker as pending,
//! 3. dispatches all calls at once and awaits every outcome.
//!
//! On the worker, [`execute_chunk`] decodes the body with a receive context,
//! takes the accumulator copies registered under the correlation id, runs the
//! body over its chunk and pushes each copy. If the chunk fails, the copies
//! push a failure marker instead, so the driver's
//! [`reduce`](crate::accumulator::Accumulator::reduce) still terminates.
use std::sync::Arc;

use anyhow::{anyhow, Context};
use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, debug_span, error, field, instrument, Span};

use crate::{
    error::{CompositeFailure, ParallelError, Result, WorkerFailure},
    executor::{fail_all, push_all, run_blocking},
    operation::LoopBody,
    partition::{partition, Chunk, Partition, StepRange},
    runtime::WorkerContext,
    serializer::Serializer,
    transport::{
        hooks::{abandon_all, encode_for, Transmitted},
        DispatchError, RemoteCall, RemoteOutcome, Transport,
    },
    worker::{CorrelationId, WorkerId},
};

struct Prepared {
    chunk: Chunk,
    call: RemoteCall,
    transmitted: Vec<Arc<dyn Transmitted>>,
}

/// Driver half of a distributed for-loop.
pub struct ParallelFor<'a> {
    transport: &'a dyn Transport,
    serializer: Serializer,
}

impl<'a> ParallelFor<'a> {
    pub fn new(transport: &'a dyn Transport, serializer: Serializer) -> Self {
        Self {
            transport,
            serializer,
        }
    }

    /// Run `body` for every element of `range`, spread over `workers`.
    ///
    /// # Errors
    ///
    /// - [`ParallelError::InvalidArgument`] if the worker list is unusable.
    /// - [`ParallelError::Serialization`] if the body cannot be encoded.
    /// - [`ParallelError::Composite`] with one entry per failed chunk.
    #[instrument(skip_all, fields(body = B::ID, len = range.len(), correlation = field::Empty))]
    pub async fn run<B: LoopBody>(
        &self,
        body: &B,
        range: StepRange,
        workers: &[WorkerId],
    ) -> Result<()> {
        let correlation = CorrelationId::new();
        Span::current().record("correlation", field::display(correlation));

        let len = i64::try_from(range.len()).map_err(|_| {
            ParallelError::InvalidArgument(format!("range of {} elements is too long", range.len()))
        })?;
        let chunks = partition(len, workers)?;
        if chunks.is_empty() {
            return Ok(());
        }

        let prepared = self.prepare(body, correlation, range, &chunks)?;
        debug!(chunks = prepared.len(), "dispatching chunks");

        let outcomes = join_all(prepared.into_iter().map(|prepared| async move {
            let outcome = self.transport.dispatch(prepared.chunk.owner, prepared.call).await;
            (prepared.chunk, prepared.transmitted, outcome)
        }))
        .await;

        let failures: CompositeFailure = outcomes
            .into_iter()
            .filter_map(|(chunk, transmitted, outcome)| failure_of(chunk, &transmitted, outcome))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            error!(%failures, "parallel for failed");
            Err(failures.into())
        }
    }

    fn prepare<B: LoopBody>(
        &self,
        body: &B,
        correlation: CorrelationId,
        range: StepRange,
        chunks: &Partition,
    ) -> Result<Vec<Prepared>> {
        let mut prepared: Vec<Prepared> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let (payload, transmitted) = match encode_for(chunk.owner, self.serializer, body) {
                Ok(encoded) => encoded,
                Err(err) => {
                    // Nothing has been dispatched yet.
                    for earlier in &prepared {
                        abandon_all(&earlier.transmitted, earlier.chunk.owner);
                    }
                    return Err(err);
                }
            };

            prepared.push(Prepared {
                chunk: *chunk,
                call: RemoteCall {
                    routing: B::ID.to_string(),
                    correlation: Some(correlation),
                    chunk: *chunk,
                    range,
                    payload,
                    serializer: self.serializer,
                },
                transmitted,
            });
        }

        Ok(prepared)
    }
}

fn failure_of(
    chunk: Chunk,
    transmitted: &[Arc<dyn Transmitted>],
    outcome: std::result::Result<RemoteOutcome, DispatchError>,
) -> Option<WorkerFailure> {
    let worker = chunk.owner;
    match outcome {
        Ok(RemoteOutcome::Ok(_)) => None,
        Ok(RemoteOutcome::Err(message)) => Some(WorkerFailure { worker, message }),
        Err(err) => {
            // Either the call never arrived or its worker went away: its
            // copies may never report.
            abandon_all(transmitted, worker);
            Some(WorkerFailure {
                worker,
                message: err.to_string(),
            })
        }
    }
}

/// Worker half of a distributed for-loop: run `B` over the chunk of `call`.
pub async fn execute_chunk<B: LoopBody>(call: RemoteCall, context: WorkerContext) -> RemoteOutcome {
    let RemoteCall {
        correlation,
        chunk,
        range,
        payload,
        serializer,
        ..
    } = call;
    let worker = context.id();

    let decoded = context
        .receive_context(correlation, serializer)
        .enter(|| serializer.from_bytes::<B>(&payload));
    let copies = correlation
        .map(|correlation| context.registry().take(correlation))
        .unwrap_or_default();

    let body = match decoded {
        Ok(body) => body,
        Err(err) => {
            fail_all(&copies);
            return RemoteOutcome::Err(format!("failed to decode `{}`: {err:#}", B::ID));
        }
    };

    let span = debug_span!("chunk", %worker, lo = chunk.lo, hi = chunk.hi, copies = copies.len());
    let outcome = run_blocking(move || {
        let _span = span.entered();
        run_chunk(&body, &range, chunk)
    })
    .await;

    match outcome {
        Ok(()) => match push_all(&copies) {
            Ok(()) => RemoteOutcome::Ok(Bytes::new()),
            Err(err) => RemoteOutcome::Err(format!("failed to push accumulators: {err}")),
        },
        Err(message) => {
            error!(%worker, lo = chunk.lo, hi = chunk.hi, %message, "chunk failed");
            fail_all(&copies);
            RemoteOutcome::Err(message)
        }
    }
}

fn run_chunk<B: LoopBody>(body: &B, range: &StepRange, chunk: Chunk) -> anyhow::Result<()> {
    for k in chunk.indices() {
        let index = range
            .nth(k)
            .ok_or_else(|| anyhow!("chunk index {k} is outside a range of {} elements", range.len()))?;
        body.execute(index)
            .with_context(|| format!("loop body failed at index {index}"))?;
    }
    Ok(())
}
