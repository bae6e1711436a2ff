//! User-facing computation traits.
//!
//! [`LoopBody`] and [`Reduction`] are the two shapes of work that can be
//! distributed over a range. Since a value has to cross a process boundary to
//! run on a worker, both are plain serializable types registered with
//! `#[derive(RemoteExecute)]`, rather than closures.
//!
//! # Loop bodies
//!
//! A body runs once per index. Results are collected through the
//! [`Accumulator`](crate::accumulator::Accumulator)s it holds:
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use tally::{accumulator::Accumulator, operation::LoopBody, RemoteExecute};
//!
//! #[derive(Serialize, Deserialize, RemoteExecute)]
//! #[tally(body)]
//! struct SumOfSquares {
//!     total: Accumulator<i64>,
//! }
//!
//! impl LoopBody for SumOfSquares {
//!     fn execute(&self, index: i64) -> anyhow::Result<()> {
//!         self.total.update(|total| *total += index * index);
//!         Ok(())
//!     }
//! }
//! ```
//!
//! # Reductions
//!
//! A reduction maps every index to an element and combines elements
//! pairwise. `combine` must be associative; it need not be commutative,
//! since chunk results are always combined in range order:
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use tally::{operation::Reduction, RemoteExecute};
//!
//! #[derive(Serialize, Deserialize, RemoteExecute)]
//! #[tally(reduction)]
//! struct Digits;
//!
//! impl Reduction for Digits {
//!     type Elem = String;
//!
//!     fn map(&self, index: i64) -> anyhow::Result<String> {
//!         Ok(index.to_string())
//!     }
//!
//!     fn combine(&self, a: String, b: String) -> anyhow::Result<String> {
//!         Ok(a + &b)
//!     }
//!
//!     fn empty(&self) -> String {
//!         String::new()
//!     }
//! }
//! ```
use std::fmt::Debug;

use crate::{serializer::Serializable, task::RemoteExecute};

/// The body of a distributed for-loop.
pub trait LoopBody: RemoteExecute + Serializable {
    /// Run the body for one element of the range.
    fn execute(&self, index: i64) -> anyhow::Result<()>;
}

/// A distributed map-and-combine over a range.
pub trait Reduction: RemoteExecute + Serializable {
    type Elem: Serializable + Debug;

    fn map(&self, index: i64) -> anyhow::Result<Self::Elem>;

    fn combine(&self, a: Self::Elem, b: Self::Elem) -> anyhow::Result<Self::Elem>;

    /// The result of reducing an empty range.
    fn empty(&self) -> Self::Elem;
}
