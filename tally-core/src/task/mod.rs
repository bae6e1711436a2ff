//! Routing of opaque calls to registered types.
//!
//! A [`RemoteCall`] only names the type of its payload by a string id. Every
//! type deriving `RemoteExecute` adds a [`RemoteEntry`] to a link-time
//! registry, which maps that id to a function able to decode the payload and
//! run the chunk. A worker binary therefore understands every body and
//! reduction linked into it, without any runtime registration step.
use std::{collections::HashMap, sync::OnceLock};

use futures::future::BoxFuture;
use tracing::{error, instrument};

use crate::{
    __private::REMOTE_ENTRIES,
    runtime::WorkerContext,
    transport::{RemoteCall, RemoteOutcome},
};

/// A type that can be executed on a worker from a [`RemoteCall`].
///
/// Implemented by `#[derive(RemoteExecute)]`; there is no reason to
/// implement it by hand.
pub trait RemoteExecute {
    /// Stable identifier of the type, shared by every binary it is linked
    /// into.
    const ID: &'static str;
}

pub type InvokeFn = fn(RemoteCall, WorkerContext) -> BoxFuture<'static, RemoteOutcome>;

/// One entry of the link-time registry.
pub struct RemoteEntry {
    pub id: &'static str,
    pub invoke: InvokeFn,
}

fn index() -> &'static HashMap<&'static str, InvokeFn> {
    static INDEX: OnceLock<HashMap<&'static str, InvokeFn>> = OnceLock::new();
    INDEX.get_or_init(|| {
        let mut index = HashMap::with_capacity(REMOTE_ENTRIES.len());
        for entry in REMOTE_ENTRIES.iter() {
            if index.insert(entry.id, entry.invoke).is_some() {
                error!(id = entry.id, "duplicate remote entry, keeping the last one");
            }
        }
        index
    })
}

/// Find the invoke function registered under `id`.
pub fn lookup(id: &str) -> Option<InvokeFn> {
    index().get(id).copied()
}

impl RemoteCall {
    /// Decode and run this call on the worker described by `context`.
    #[instrument(skip_all, level = "debug", fields(routing = %self.routing, lo = self.chunk.lo, hi = self.chunk.hi))]
    pub async fn remote_execute(self, context: WorkerContext) -> RemoteOutcome {
        match lookup(&self.routing) {
            Some(invoke) => invoke(self, context).await,
            None => RemoteOutcome::Err(format!(
                "no remote entry registered for `{}`",
                self.routing
            )),
        }
    }
}
