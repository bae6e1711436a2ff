//! Identities used by the distribution protocol.
//!
//! - [`WorkerId`]: a participant in the cluster, the driver included.
//! - [`CorrelationId`]: a single parallel-for invocation.
//! - [`AccumulatorId`]: a driver-side [`Accumulator`](crate::accumulator::Accumulator),
//!   and thereby the mailbox its contributions are routed to.
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, totally ordered and stable identity of a participant.
///
/// No value carries a special meaning. Failures are reported through
/// [`Contribution::Failed`](crate::transport::Contribution::Failed) rather than
/// a reserved id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

impl From<u32> for WorkerId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Links a parallel-for invocation to the accumulators transmitted with it.
///
/// It travels inside every [`RemoteCall`](crate::transport::RemoteCall) of the
/// invocation, so accumulator copies decoded on a worker are registered under
/// the invocation that shipped them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies a driver-side accumulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccumulatorId(Uuid);

impl AccumulatorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AccumulatorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccumulatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
