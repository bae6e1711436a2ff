//! Errors surfaced by parallel operations.
//!
//! Every public operation returns [`Result`], whose error type
//! [`ParallelError`] separates caller mistakes, failures that happened on a
//! worker, and violations of the contribution protocol. Failures originating
//! in loop bodies are carried as plain messages, since the original error
//! value lives in another process.
use std::fmt;

use thiserror::Error;

use crate::{
    transport::DispatchError,
    worker::{AccumulatorId, WorkerId},
};

/// A failure attributed to a single worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{worker} failed: {message}")]
pub struct WorkerFailure {
    pub worker: WorkerId,
    pub message: String,
}

/// Every worker failure observed by one operation.
#[derive(Error, Debug, Clone, Default, PartialEq, Eq)]
pub struct CompositeFailure {
    failures: Vec<WorkerFailure>,
}

impl CompositeFailure {
    pub fn new(failures: Vec<WorkerFailure>) -> Self {
        Self { failures }
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, WorkerFailure> {
        self.failures.iter()
    }

    /// The failed workers, in the order their failures were recorded.
    pub fn workers(&self) -> Vec<WorkerId> {
        self.failures.iter().map(|failure| failure.worker).collect()
    }

    pub fn into_inner(self) -> Vec<WorkerFailure> {
        self.failures
    }
}

impl fmt::Display for CompositeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} worker(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let separator = if i == 0 { ": " } else { "; " };
            write!(f, "{separator}{failure}")?;
        }
        Ok(())
    }
}

impl FromIterator<WorkerFailure> for CompositeFailure {
    fn from_iter<I: IntoIterator<Item = WorkerFailure>>(iter: I) -> Self {
        Self {
            failures: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for CompositeFailure {
    type Item = WorkerFailure;
    type IntoIter = std::vec::IntoIter<WorkerFailure>;

    fn into_iter(self) -> Self::IntoIter {
        self.failures.into_iter()
    }
}

#[derive(Error, Debug)]
pub enum ParallelError {
    /// The caller supplied an argument the operation cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Worker(#[from] WorkerFailure),

    #[error(transparent)]
    Composite(#[from] CompositeFailure),

    /// A contribution arrived from a worker that holds no pending copy of the
    /// accumulator. The accumulator's bookkeeping can no longer be trusted.
    #[error("accumulator {accumulator} received an unexpected contribution from {worker}")]
    ProtocolViolation {
        accumulator: AccumulatorId,
        worker: WorkerId,
    },

    #[error("serialization failed: {0:#}")]
    Serialization(#[source] anyhow::Error),

    #[error(transparent)]
    Transport(#[from] DispatchError),
}

impl ParallelError {
    /// Whether the error indicates broken internal state rather than a
    /// failed computation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. })
    }

    /// The workers blamed by this error, if any.
    pub fn failed_workers(&self) -> Vec<WorkerId> {
        match self {
            Self::Worker(failure) => vec![failure.worker],
            Self::Composite(composite) => composite.workers(),
            Self::ProtocolViolation { worker, .. } => vec![*worker],
            Self::Transport(err) => vec![err.worker()],
            Self::InvalidArgument(_) | Self::Serialization(_) => Vec::new(),
        }
    }

    /// Collapse a list of failures into the narrowest variant describing it.
    pub(crate) fn from_failures(mut failures: Vec<WorkerFailure>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop().map(Self::Worker),
            _ => Some(Self::Composite(CompositeFailure::new(failures))),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParallelError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(worker: u32, message: &str) -> WorkerFailure {
        WorkerFailure {
            worker: WorkerId(worker),
            message: message.to_string(),
        }
    }

    #[test]
    fn composite_lists_every_failure() {
        let composite: CompositeFailure =
            vec![failure(2, "boom"), failure(3, "bang")].into_iter().collect();

        assert_eq!(composite.len(), 2);
        assert_eq!(composite.workers(), vec![WorkerId(2), WorkerId(3)]);
        assert_eq!(
            composite.to_string(),
            "2 worker(s) failed: worker-2 failed: boom; worker-3 failed: bang"
        );
    }

    #[test]
    fn from_failures_picks_narrowest_variant() {
        assert!(ParallelError::from_failures(Vec::new()).is_none());
        assert!(matches!(
            ParallelError::from_failures(vec![failure(2, "x")]),
            Some(ParallelError::Worker(WorkerFailure { worker: WorkerId(2), .. }))
        ));
        let composite = ParallelError::from_failures(vec![failure(2, "x"), failure(4, "y")]);
        assert!(matches!(composite, Some(ParallelError::Composite(ref c)) if c.len() == 2));
    }

    #[test]
    fn only_protocol_violations_are_fatal() {
        let violation = ParallelError::ProtocolViolation {
            accumulator: AccumulatorId::new(),
            worker: WorkerId(9),
        };
        assert!(violation.is_fatal());
        assert_eq!(violation.failed_workers(), vec![WorkerId(9)]);
        assert!(!ParallelError::Worker(failure(2, "x")).is_fatal());
    }
}
