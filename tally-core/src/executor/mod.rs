//! Distribution of loop bodies and reductions over a worker set.
//!
//! Each executor has two halves: a driver half that partitions the range and
//! dispatches one [`RemoteCall`](crate::transport::RemoteCall) per chunk, and
//! an `execute_chunk` function that runs on the receiving worker. The latter
//! is what `#[derive(RemoteExecute)]` registers for a type.
use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use tracing::{error, warn};

use crate::{accumulator::registry::Contributor, error::Result};

pub mod parallel_for;
pub mod parallel_reduce;

/// Run `f` on the blocking pool, turning errors and panics into messages.
pub(crate) async fn run_blocking<T, F>(f: F) -> std::result::Result<T, String>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(move || catch_unwind(AssertUnwindSafe(f))).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(err))) => Err(format!("{err:#}")),
        Ok(Err(panic)) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
        Err(err) => Err(format!("blocking task failed: {err}")),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

/// Push every accumulator copy of a completed chunk.
///
/// A copy whose push fails reports a failure instead, so its home still
/// hears from this worker exactly once.
pub(crate) fn push_all(copies: &[Arc<dyn Contributor>]) -> Result<()> {
    let mut first_error = None;
    for copy in copies {
        let Err(err) = copy.push() else {
            continue;
        };
        warn!(accumulator = %copy.id(), %err, "push failed, reporting a failure instead");
        if let Err(fallback) = copy.push_failure() {
            error!(accumulator = %copy.id(), %fallback, "could not report failure either");
        }
        first_error.get_or_insert(err);
    }

    first_error.map_or(Ok(()), Err)
}

/// Report a failed chunk to the home of every accumulator copy.
pub(crate) fn fail_all(copies: &[Arc<dyn Contributor>]) {
    for copy in copies {
        if let Err(err) = copy.push_failure() {
            error!(accumulator = %copy.id(), %err, "could not report chunk failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_blocking_catches_panics() {
        let result: std::result::Result<(), String> = run_blocking(|| panic!("kaboom")).await;
        assert_eq!(result.unwrap_err(), "panicked: kaboom");
    }

    #[tokio::test]
    async fn run_blocking_reports_error_chain() {
        let result: std::result::Result<(), String> =
            run_blocking(|| Err(anyhow::anyhow!("inner")).map_err(|e| e.context("outer"))).await;
        assert_eq!(result.unwrap_err(), "outer: inner");
    }
}
