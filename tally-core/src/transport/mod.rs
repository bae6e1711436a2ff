//! The contract between the protocol core and the process fabric.
//!
//! The core never talks to processes directly. It sees the cluster through a
//! [`Transport`], which offers:
//! - a snapshot of the current worker set,
//! - asynchronous dispatch of an opaque [`RemoteCall`] to a worker, answered
//!   by a [`RemoteOutcome`],
//! - a [`ContributionSink`] routing accumulator [`Delivery`]s to the mailbox
//!   of the node that owns the accumulator.
//!
//! Side effects of transmitting an accumulator are driven by the
//! [`hooks`] installed around each encode and decode.
//!
//! [`in_memory::InMemoryCluster`] implements the contract inside one process.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    error::{Result, WorkerFailure},
    partition::{Chunk, StepRange},
    serializer::Serializer,
    worker::{AccumulatorId, CorrelationId, WorkerId},
};

pub mod hooks;
pub mod in_memory;
pub mod node;

/// An opaque unit of work addressed to one worker.
///
/// `routing` names the registered body or reduction type (see
/// [`RemoteExecute`](crate::task::RemoteExecute)), and `payload` is that
/// value encoded with `serializer`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RemoteCall {
    pub routing: String,
    pub correlation: Option<CorrelationId>,
    pub chunk: Chunk,
    pub range: StepRange,
    pub payload: Bytes,
    pub serializer: Serializer,
}

/// The reply to a [`RemoteCall`].
///
/// Failures are carried as messages: the worker's error value cannot be
/// shipped back as is.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    Ok(Bytes),
    Err(String),
}

impl RemoteOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Attribute a failed outcome to `worker`.
    pub fn into_result(self, worker: WorkerId) -> std::result::Result<Bytes, WorkerFailure> {
        match self {
            Self::Ok(bytes) => Ok(bytes),
            Self::Err(message) => Err(WorkerFailure { worker, message }),
        }
    }
}

/// A worker's final report for one accumulator copy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Contribution {
    /// The encoded local value.
    Ok(Bytes),
    /// The chunk the copy belonged to did not complete.
    Failed,
    /// Posted by the home node when the call carrying the copy was lost.
    /// The copy may still have pushed before the loss.
    Abandoned,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub accumulator: AccumulatorId,
    pub from: WorkerId,
    pub contribution: Contribution,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The call never reached the worker.
    #[error("{0} is not reachable")]
    Unreachable(WorkerId),
    /// The call reached the worker, which went away before replying.
    #[error("{0} went away before replying")]
    Dropped(WorkerId),
}

impl DispatchError {
    pub fn worker(&self) -> WorkerId {
        match self {
            Self::Unreachable(worker) | Self::Dropped(worker) => *worker,
        }
    }
}

/// Routes contributions to the node owning an accumulator.
///
/// Delivery never blocks: the receiving mailbox is unbounded.
pub trait ContributionSink: Send + Sync {
    fn deliver(&self, home: WorkerId, delivery: Delivery) -> std::result::Result<(), DispatchError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// The node this transport handle runs on.
    fn local(&self) -> WorkerId;

    /// The local node's registry and mailboxes.
    fn local_node(&self) -> &node::Node;

    /// A snapshot of the current workers, in a stable order.
    fn workers(&self) -> Vec<WorkerId>;

    fn worker_count(&self) -> usize {
        self.workers().len()
    }

    fn sink(&self) -> Arc<dyn ContributionSink>;

    async fn dispatch(
        &self,
        target: WorkerId,
        call: RemoteCall,
    ) -> std::result::Result<RemoteOutcome, DispatchError>;

    /// Dispatch `call` and flatten its outcome into a [`Result`].
    async fn dispatch_and_wait(&self, target: WorkerId, call: RemoteCall) -> Result<Bytes> {
        let outcome = self.dispatch(target, call).await?;
        Ok(outcome.into_result(target)?)
    }
}
