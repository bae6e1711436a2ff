//! An in-process cluster: one driver and any number of emulated workers.
//!
//! Every node runs its own task loop, owns its own registry and mailboxes,
//! and receives calls over a channel. Payloads are really encoded and decoded,
//! so accumulators behave exactly as they would across processes.
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::{
    runtime::WorkerContext,
    transport::{
        node::{Mailboxes, Node},
        ContributionSink, Delivery, DispatchError, RemoteCall, RemoteOutcome, Transport,
    },
    worker::WorkerId,
};

const DRIVER: WorkerId = WorkerId(1);

struct Envelope {
    call: RemoteCall,
    reply: oneshot::Sender<RemoteOutcome>,
}

struct Endpoint {
    node: Node,
    calls: mpsc::UnboundedSender<Envelope>,
    handle: JoinHandle<()>,
}

/// Routes deliveries to the mailboxes of the addressed node.
#[derive(Clone, Default)]
struct Directory {
    mailboxes: Arc<DashMap<WorkerId, Mailboxes>>,
}

impl ContributionSink for Directory {
    fn deliver(&self, home: WorkerId, delivery: Delivery) -> Result<(), DispatchError> {
        let mailboxes = self
            .mailboxes
            .get(&home)
            .map(|entry| entry.value().clone())
            .ok_or(DispatchError::Unreachable(home))?;
        mailboxes.post(delivery);
        Ok(())
    }
}

struct Inner {
    driver: Node,
    endpoints: DashMap<WorkerId, Endpoint>,
    directory: Directory,
    next_id: AtomicU32,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for endpoint in self.endpoints.iter() {
            endpoint.handle.abort();
        }
    }
}

/// A driver plus a dynamic set of emulated workers.
///
/// The driver is [`WorkerId(1)`](WorkerId) and workers are numbered upwards
/// from 2. With no workers, the driver itself is the only participant and
/// runs every chunk.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct InMemoryCluster {
    inner: Arc<Inner>,
}

impl InMemoryCluster {
    pub fn new(num_workers: usize) -> Self {
        let driver = Node::new(DRIVER);
        let cluster = Self {
            inner: Arc::new(Inner {
                driver: driver.clone(),
                endpoints: DashMap::new(),
                directory: Directory::default(),
                next_id: AtomicU32::new(DRIVER.0 + 1),
            }),
        };

        cluster.spawn(driver);
        for _ in 0..num_workers {
            cluster.add_worker();
        }
        info!(num_workers, "in-memory cluster started");
        cluster
    }

    pub fn driver(&self) -> WorkerId {
        self.inner.driver.id()
    }

    /// Start a new worker and return its id.
    pub fn add_worker(&self) -> WorkerId {
        let id = WorkerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.spawn(Node::new(id));
        id
    }

    /// Stop a worker. Calls dispatched to it afterwards fail as unreachable.
    ///
    /// The driver cannot be removed.
    pub fn remove_worker(&self, id: WorkerId) -> bool {
        if id == self.driver() {
            return false;
        }
        self.inner.directory.mailboxes.remove(&id);
        match self.inner.endpoints.remove(&id) {
            Some((_, endpoint)) => {
                endpoint.handle.abort();
                debug!(worker = %id, "worker removed");
                true
            }
            None => false,
        }
    }

    /// The protocol state of a node, if it is part of the cluster.
    pub fn node(&self, id: WorkerId) -> Option<Node> {
        self.inner
            .endpoints
            .get(&id)
            .map(|endpoint| endpoint.node.clone())
    }

    fn spawn(&self, node: Node) {
        let id = node.id();
        let (calls, rx) = mpsc::unbounded_channel();
        let context = WorkerContext::new(node.clone(), Arc::new(self.inner.directory.clone()));
        let handle = tokio::spawn(serve(context, rx));

        self.inner
            .directory
            .mailboxes
            .insert(id, node.mailboxes().clone());
        self.inner.endpoints.insert(
            id,
            Endpoint {
                node,
                calls,
                handle,
            },
        );
    }
}

/// A node's task loop. Every call runs on its own task, so chunks dispatched
/// to the same node do not queue behind each other.
async fn serve(context: WorkerContext, mut calls: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(Envelope { call, reply }) = calls.recv().await {
        let context = context.clone();
        let span = debug_span!("remote_call", worker = %context.id(), routing = %call.routing);
        tokio::spawn(
            async move {
                let outcome = call.remote_execute(context).await;
                if reply.send(outcome).is_err() {
                    warn!("caller went away before the outcome was delivered");
                }
            }
            .instrument(span),
        );
    }
}

#[async_trait]
impl Transport for InMemoryCluster {
    fn local(&self) -> WorkerId {
        self.driver()
    }

    fn local_node(&self) -> &Node {
        &self.inner.driver
    }

    fn workers(&self) -> Vec<WorkerId> {
        let driver = self.driver();
        let mut workers: Vec<_> = self
            .inner
            .endpoints
            .iter()
            .map(|endpoint| *endpoint.key())
            .filter(|id| *id != driver)
            .collect();
        if workers.is_empty() {
            workers.push(driver);
        }
        workers.sort_unstable();
        workers
    }

    fn sink(&self) -> Arc<dyn ContributionSink> {
        Arc::new(self.inner.directory.clone())
    }

    async fn dispatch(
        &self,
        target: WorkerId,
        call: RemoteCall,
    ) -> Result<RemoteOutcome, DispatchError> {
        let calls = self
            .inner
            .endpoints
            .get(&target)
            .map(|endpoint| endpoint.calls.clone())
            .ok_or(DispatchError::Unreachable(target))?;

        let (reply, response) = oneshot::channel();
        calls
            .send(Envelope { call, reply })
            .map_err(|_| DispatchError::Unreachable(target))?;
        tokio::task::yield_now().await;

        response.await.map_err(|_| DispatchError::Dropped(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        partition::{Chunk, StepRange},
        serializer::Serializer,
        testing::with_timeout,
        transport::Contribution,
        worker::AccumulatorId,
    };

    fn call(routing: &str, owner: WorkerId) -> RemoteCall {
        RemoteCall {
            routing: routing.to_string(),
            correlation: None,
            chunk: Chunk { owner, lo: 1, hi: 1 },
            range: StepRange::from(1..=1),
            payload: Default::default(),
            serializer: Serializer::default(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn workers_are_numbered_after_the_driver() {
        let cluster = InMemoryCluster::new(3);
        assert_eq!(cluster.driver(), WorkerId(1));
        assert_eq!(cluster.workers(), vec![WorkerId(2), WorkerId(3), WorkerId(4)]);
        assert_eq!(cluster.worker_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn driver_stands_in_when_there_are_no_workers() {
        let cluster = InMemoryCluster::new(0);
        assert_eq!(cluster.workers(), vec![cluster.driver()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn worker_set_can_change() {
        let cluster = InMemoryCluster::new(1);
        let added = cluster.add_worker();
        assert_eq!(cluster.workers(), vec![WorkerId(2), added]);

        assert!(cluster.remove_worker(WorkerId(2)));
        assert!(!cluster.remove_worker(cluster.driver()));
        assert_eq!(cluster.workers(), vec![added]);

        let err = with_timeout(cluster.dispatch(WorkerId(2), call("anything", WorkerId(2))))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Unreachable(WorkerId(2)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn unknown_routing_is_reported_by_the_worker() {
        let cluster = InMemoryCluster::new(1);
        let outcome = with_timeout(cluster.dispatch(WorkerId(2), call("no::such::Body", WorkerId(2))))
            .await
            .unwrap();
        assert!(matches!(outcome, RemoteOutcome::Err(message) if message.contains("no::such::Body")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn sink_routes_to_the_home_node() {
        let cluster = InMemoryCluster::new(1);
        let id = AccumulatorId::new();
        let (_, mut inbox) = cluster.local_node().mailboxes().open(id);

        let delivery = Delivery {
            accumulator: id,
            from: WorkerId(2),
            contribution: Contribution::Failed,
        };
        cluster.sink().deliver(cluster.driver(), delivery.clone()).unwrap();
        assert_eq!(with_timeout(inbox.recv()).await, Some(delivery.clone()));

        assert_eq!(
            cluster.sink().deliver(WorkerId(42), delivery),
            Err(DispatchError::Unreachable(WorkerId(42)))
        );
    }
}
