#![cfg_attr(docsrs, feature(doc_cfg))]

//! Distributed for-loops and reductions with worker-local accumulators.
//!
//! Tally splits an index range into contiguous chunks, one per worker, and
//! runs a computation over every chunk on its worker. Two shapes of
//! computation are supported:
//!
//! - **Parallel for**: a [`LoopBody`](crate::operation::LoopBody) runs once per
//!   index. Results flow back through the
//!   [`Accumulator`](crate::accumulator::Accumulator)s the body holds: every
//!   worker accumulates locally into its own copy, pushes its final value once
//!   its chunk is done, and the driver merges them with
//!   [`Accumulator::reduce`](crate::accumulator::Accumulator::reduce).
//! - **Parallel reduce**: a [`Reduction`](crate::operation::Reduction) maps
//!   every index to an element and combines elements pairwise. Each worker
//!   reduces its chunk and returns the result, and the driver combines the
//!   chunk results in range order.
//!
//! A failure on any worker never leaves the driver waiting: a failed chunk
//! reports a failure marker for each of its accumulators, and the driver
//! reports every failed worker.
//!
//! # Defining computations
//!
//! Loop bodies and reductions travel to workers, so they are serializable
//! types registered with `#[derive(RemoteExecute)]` and either
//! `#[tally(body)]` or `#[tally(reduction)]`:
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use tally::{accumulator::Accumulator, operation::{LoopBody, Reduction}, RemoteExecute};
//!
//! #[derive(Serialize, Deserialize, RemoteExecute)]
//! #[tally(body)]
//! struct Histogram {
//!     small: Accumulator<u32>,
//!     large: Accumulator<u32>,
//! }
//!
//! impl LoopBody for Histogram {
//!     fn execute(&self, index: i64) -> anyhow::Result<()> {
//!         let bucket = if index < 50 { &self.small } else { &self.large };
//!         bucket.update(|count| *count += 1);
//!         Ok(())
//!     }
//! }
//!
//! #[derive(Serialize, Deserialize, RemoteExecute)]
//! #[tally(reduction)]
//! struct Max;
//!
//! impl Reduction for Max {
//!     type Elem = i64;
//!
//!     fn map(&self, index: i64) -> anyhow::Result<i64> {
//!         Ok((index * 37) % 101)
//!     }
//!
//!     fn combine(&self, a: i64, b: i64) -> anyhow::Result<i64> {
//!         Ok(a.max(b))
//!     }
//!
//!     fn empty(&self) -> i64 {
//!         i64::MIN
//!     }
//! }
//! ```
//!
//! # Running them
//!
//! A [`Runtime`](crate::runtime::Runtime) drives the computation. The bundled
//! [`InMemoryCluster`](crate::transport::in_memory::InMemoryCluster) emulates
//! a worker pool inside the current process; other process fabrics plug in
//! through the [`Transport`](crate::transport::Transport) trait.
//!
//! ```
//! # use serde::{Deserialize, Serialize};
//! # use tally::{accumulator::Accumulator, operation::{LoopBody, Reduction}, RemoteExecute};
//! # #[derive(Serialize, Deserialize, RemoteExecute)]
//! # #[tally(body)]
//! # struct Histogram {
//! #     small: Accumulator<u32>,
//! #     large: Accumulator<u32>,
//! # }
//! # impl LoopBody for Histogram {
//! #     fn execute(&self, index: i64) -> anyhow::Result<()> {
//! #         let bucket = if index < 50 { &self.small } else { &self.large };
//! #         bucket.update(|count| *count += 1);
//! #         Ok(())
//! #     }
//! # }
//! # #[derive(Serialize, Deserialize, RemoteExecute)]
//! # #[tally(reduction)]
//! # struct Max;
//! # impl Reduction for Max {
//! #     type Elem = i64;
//! #     fn map(&self, index: i64) -> anyhow::Result<i64> { Ok((index * 37) % 101) }
//! #     fn combine(&self, a: i64, b: i64) -> anyhow::Result<i64> { Ok(a.max(b)) }
//! #     fn empty(&self) -> i64 { i64::MIN }
//! # }
//! use tally::{config::Config, runtime::Runtime};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let runtime = Runtime::from_config(&Config::default()).await?;
//!
//! let histogram = Histogram {
//!     small: runtime.accumulator(0),
//!     large: runtime.accumulator(0),
//! };
//! runtime.parallel_for(&histogram, 0..100).await?;
//! assert_eq!(histogram.small.reduce(|a, b| a + b).await?, 50);
//! assert_eq!(histogram.large.reduce(|a, b| a + b).await?, 50);
//!
//! assert_eq!(runtime.parallel_reduce(&Max, 1..=100).await?, 100);
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod config;
pub mod error;
pub mod executor;
pub mod operation;
pub mod partition;
pub mod runtime;
pub mod serializer;
pub mod task;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

pub use tally_derive::RemoteExecute;

#[doc(hidden)]
pub mod __private {
    pub use futures;
    pub use linkme;
    use linkme::distributed_slice;

    use crate::task::RemoteEntry;

    /// Every type registered with `#[derive(RemoteExecute)]` in the binary.
    #[distributed_slice]
    pub static REMOTE_ENTRIES: [RemoteEntry] = [..];
}
