//! Helpers shared by the unit tests.
use std::{future::Future, time::Duration};

/// Await `f`, failing the test if it does not complete in time.
pub(crate) async fn with_timeout<F: Future>(f: F) -> F::Output {
    tokio::select! {
        output = f => output,
        _ = tokio::time::sleep(Duration::from_secs(5)) => panic!("timed out"),
    }
}
