//! The driver-side entry point.
//!
//! A [`Runtime`] ties a [`Transport`] to a serialization format and offers
//! the user-facing operations: creating accumulators, and running
//! [`parallel_for`](Runtime::parallel_for) and
//! [`parallel_reduce`](Runtime::parallel_reduce) over the current worker set.
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use tally::{accumulator::Accumulator, operation::LoopBody, runtime::Runtime, RemoteExecute};
//!
//! #[derive(Serialize, Deserialize, RemoteExecute)]
//! #[tally(body)]
//! struct CountEven {
//!     evens: Accumulator<u64>,
//! }
//!
//! impl LoopBody for CountEven {
//!     fn execute(&self, index: i64) -> anyhow::Result<()> {
//!         if index % 2 == 0 {
//!             self.evens.update(|evens| *evens += 1);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let runtime = Runtime::in_memory().await?;
//! let evens = runtime.accumulator(0_u64);
//!
//! runtime.parallel_for(&CountEven { evens: evens.clone() }, 1..=100).await?;
//! assert_eq!(evens.reduce(|a, b| a + b).await?, 50);
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

use tracing::instrument;

use crate::{
    accumulator::{registry::AccumulatorRegistry, Accumulator},
    config::Config,
    error::Result,
    executor::{parallel_for::ParallelFor, parallel_reduce::ParallelReduce},
    operation::{LoopBody, Reduction},
    partition::StepRange,
    serializer::{Serializable, Serializer},
    transport::{
        hooks::ReceiveContext, in_memory::InMemoryCluster, node::Node, ContributionSink,
        Transport,
    },
    worker::{CorrelationId, WorkerId},
};

/// What a worker exposes to the chunks it executes.
#[derive(Clone)]
pub struct WorkerContext {
    node: Node,
    sink: Arc<dyn ContributionSink>,
}

impl WorkerContext {
    pub fn new(node: Node, sink: Arc<dyn ContributionSink>) -> Self {
        Self { node, sink }
    }

    pub fn id(&self) -> WorkerId {
        self.node.id()
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn registry(&self) -> &AccumulatorRegistry {
        self.node.registry()
    }

    pub fn sink(&self) -> &Arc<dyn ContributionSink> {
        &self.sink
    }

    /// The context to decode a call's payload in.
    pub fn receive_context(
        &self,
        correlation: Option<CorrelationId>,
        serializer: Serializer,
    ) -> ReceiveContext {
        ReceiveContext::new(
            self.id(),
            correlation,
            serializer,
            self.sink.clone(),
            self.registry().clone(),
        )
    }
}

/// The driver's handle on a cluster.
pub struct Runtime<T = InMemoryCluster> {
    transport: T,
    serializer: Serializer,
}

impl Runtime<InMemoryCluster> {
    /// Start an in-memory cluster as described by `config`.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(
            InMemoryCluster::new(config.num_workers),
            Serializer::from(config),
        ))
    }

    /// Start an in-memory cluster with the default configuration.
    pub async fn in_memory() -> anyhow::Result<Self> {
        Self::from_config(&Config::default()).await
    }
}

impl<T: Transport> Runtime<T> {
    pub fn new(transport: T, serializer: Serializer) -> Self {
        Self {
            transport,
            serializer,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    pub fn driver(&self) -> WorkerId {
        self.transport.local()
    }

    /// A snapshot of the current workers.
    pub fn workers(&self) -> Vec<WorkerId> {
        self.transport.workers()
    }

    /// Create an accumulator homed on the driver.
    pub fn accumulator<V: Serializable + Clone>(&self, initial: V) -> Accumulator<V> {
        Accumulator::new(initial, self.transport.local_node(), self.serializer)
    }

    /// Run `body` for every element of `range` across the current workers.
    #[instrument(skip_all, level = "debug")]
    pub async fn parallel_for<B: LoopBody>(
        &self,
        body: &B,
        range: impl Into<StepRange>,
    ) -> Result<()> {
        let range = range.into();
        let workers = self.workers();
        self.parallel_for_on(body, range, &workers).await
    }

    /// Run `body` for every element of `range` across `workers`.
    pub async fn parallel_for_on<B: LoopBody>(
        &self,
        body: &B,
        range: impl Into<StepRange>,
        workers: &[WorkerId],
    ) -> Result<()> {
        ParallelFor::new(&self.transport, self.serializer)
            .run(body, range.into(), workers)
            .await
    }

    /// Reduce `range` with `reduction` across the current workers.
    #[instrument(skip_all, level = "debug")]
    pub async fn parallel_reduce<R: Reduction>(
        &self,
        reduction: &R,
        range: impl Into<StepRange>,
    ) -> Result<R::Elem> {
        let range = range.into();
        let workers = self.workers();
        self.parallel_reduce_on(reduction, range, &workers).await
    }

    /// Reduce `range` with `reduction` across `workers`.
    pub async fn parallel_reduce_on<R: Reduction>(
        &self,
        reduction: &R,
        range: impl Into<StepRange>,
        workers: &[WorkerId],
    ) -> Result<R::Elem> {
        ParallelReduce::new(&self.transport, self.serializer)
            .run(reduction, range.into(), workers)
            .await
    }
}
