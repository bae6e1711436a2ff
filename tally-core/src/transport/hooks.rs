//! Before-send and after-receive hooks.
//!
//! Encoding an accumulator for a worker has to record that worker on the
//! driver, and decoding one on a worker has to register the new copy. serde
//! gives a value no way to learn where it is going or coming from, so the
//! transport installs a context on the current thread for the exact duration
//! of one encode ([`SendContext::enter`]) or decode
//! ([`ReceiveContext::enter`]). The accumulator's serde impls consult it.
//!
//! Contexts nest, and the previous context is restored when `enter` returns
//! or unwinds.
use std::{any::Any, cell::RefCell, fmt, sync::Arc, thread::LocalKey};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;

use crate::{
    accumulator::registry::AccumulatorRegistry,
    error::{ParallelError, Result},
    serializer::Serializer,
    transport::ContributionSink,
    worker::{AccumulatorId, CorrelationId, WorkerId},
};

thread_local! {
    static SEND: RefCell<Option<SendContext>> = RefCell::new(None);
    static RECEIVE: RefCell<Option<ReceiveContext>> = RefCell::new(None);
}

/// The driver-side half of an accumulator that has been encoded for a worker.
pub trait Transmitted: Send + Sync {
    fn id(&self) -> AccumulatorId;

    /// Record on behalf of `worker` that its copy may never report back.
    fn abandon(&self, worker: WorkerId);
}

/// State of an in-progress encode for one destination.
pub struct SendContext {
    destination: WorkerId,
    transmitted: Vec<Arc<dyn Transmitted>>,
}

impl SendContext {
    pub fn new(destination: WorkerId) -> Self {
        Self {
            destination,
            transmitted: Vec::new(),
        }
    }

    pub fn destination(&self) -> WorkerId {
        self.destination
    }

    /// Record `accumulator` once, however many times the value holds it.
    pub(crate) fn record(&mut self, accumulator: Arc<dyn Transmitted>) {
        let id = accumulator.id();
        if self.transmitted.iter().all(|seen| seen.id() != id) {
            self.transmitted.push(accumulator);
        }
    }

    /// Every accumulator encoded while this context was installed.
    pub fn transmitted(&self) -> &[Arc<dyn Transmitted>] {
        &self.transmitted
    }

    pub fn into_transmitted(self) -> Vec<Arc<dyn Transmitted>> {
        self.transmitted
    }

    /// Run `f` with this context installed, and hand the context back
    /// alongside `f`'s output.
    pub fn enter<R>(self, f: impl FnOnce() -> R) -> (R, Self) {
        let destination = self.destination;
        let (output, context) = install(&SEND, self, f);
        (output, context.unwrap_or_else(|| Self::new(destination)))
    }
}

impl fmt::Debug for SendContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendContext")
            .field("destination", &self.destination)
            .field("transmitted", &self.transmitted.len())
            .finish()
    }
}

/// Everything a decoded accumulator copy needs to find its way home.
///
/// Copies decoded under one context are remembered by id, so a value that
/// holds the same accumulator several times decodes to a single shared copy.
#[derive(Clone)]
pub struct ReceiveContext {
    local: WorkerId,
    correlation: Option<CorrelationId>,
    serializer: Serializer,
    sink: Arc<dyn ContributionSink>,
    registry: AccumulatorRegistry,
    decoded: Arc<DashMap<AccumulatorId, Arc<dyn Any + Send + Sync>>>,
}

impl ReceiveContext {
    pub fn new(
        local: WorkerId,
        correlation: Option<CorrelationId>,
        serializer: Serializer,
        sink: Arc<dyn ContributionSink>,
        registry: AccumulatorRegistry,
    ) -> Self {
        Self {
            local,
            correlation,
            serializer,
            sink,
            registry,
            decoded: Arc::default(),
        }
    }

    pub fn local(&self) -> WorkerId {
        self.local
    }

    pub fn correlation(&self) -> Option<CorrelationId> {
        self.correlation
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    pub fn sink(&self) -> &Arc<dyn ContributionSink> {
        &self.sink
    }

    pub fn registry(&self) -> &AccumulatorRegistry {
        &self.registry
    }

    /// A copy of `id` already decoded under this context.
    pub(crate) fn decoded(&self, id: AccumulatorId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.decoded.get(&id).map(|copy| copy.value().clone())
    }

    pub(crate) fn remember(&self, id: AccumulatorId, copy: Arc<dyn Any + Send + Sync>) {
        self.decoded.insert(id, copy);
    }

    /// Run `f` with this context installed.
    pub fn enter<R>(self, f: impl FnOnce() -> R) -> R {
        install(&RECEIVE, self, f).0
    }
}

impl fmt::Debug for ReceiveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveContext")
            .field("local", &self.local)
            .field("correlation", &self.correlation)
            .field("serializer", &self.serializer)
            .field("decoded", &self.decoded.len())
            .finish_non_exhaustive()
    }
}

/// Access the installed send context, if any.
pub(crate) fn with_send_context<R>(f: impl FnOnce(&mut SendContext) -> R) -> Option<R> {
    SEND.with(|slot| slot.borrow_mut().as_mut().map(f))
}

/// Access the installed receive context, if any.
pub(crate) fn with_receive_context<R>(f: impl FnOnce(&ReceiveContext) -> R) -> Option<R> {
    RECEIVE.with(|slot| slot.borrow().as_ref().map(f))
}

/// Encode `value` for `destination` with a send context installed.
///
/// If encoding fails, every accumulator that was already recorded is
/// abandoned for `destination`, since no call carrying it will be sent.
pub fn encode_for<V: Serialize + ?Sized>(
    destination: WorkerId,
    serializer: Serializer,
    value: &V,
) -> Result<(Bytes, Vec<Arc<dyn Transmitted>>)> {
    let (encoded, context) = SendContext::new(destination).enter(|| serializer.to_bytes(value));
    let transmitted = context.into_transmitted();
    match encoded {
        Ok(bytes) => Ok((Bytes::from(bytes), transmitted)),
        Err(err) => {
            abandon_all(&transmitted, destination);
            Err(ParallelError::Serialization(err))
        }
    }
}

pub(crate) fn abandon_all(transmitted: &[Arc<dyn Transmitted>], worker: WorkerId) {
    for accumulator in transmitted {
        accumulator.abandon(worker);
    }
}

/// Restores the previous occupant of a context slot on drop.
struct Restore<T: 'static> {
    slot: &'static LocalKey<RefCell<Option<T>>>,
    previous: Option<Option<T>>,
}

impl<T: 'static> Drop for Restore<T> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.slot.with(|slot| *slot.borrow_mut() = previous);
        }
    }
}

fn install<T: 'static, R>(
    slot: &'static LocalKey<RefCell<Option<T>>>,
    context: T,
    f: impl FnOnce() -> R,
) -> (R, Option<T>) {
    let previous = slot.with(|slot| slot.replace(Some(context)));
    let mut restore = Restore {
        slot,
        previous: Some(previous),
    };
    let output = f();
    let previous = restore.previous.take().unwrap_or_default();
    let context = slot.with(|slot| slot.replace(previous));
    (output, context)
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::Mutex,
    };

    use super::*;
    use crate::transport::{Delivery, DispatchError};

    struct Recorder {
        id: AccumulatorId,
        abandoned: Mutex<Vec<WorkerId>>,
    }

    impl Transmitted for Recorder {
        fn id(&self) -> AccumulatorId {
            self.id
        }

        fn abandon(&self, worker: WorkerId) {
            self.abandoned.lock().unwrap().push(worker);
        }
    }

    struct NullSink;

    impl ContributionSink for NullSink {
        fn deliver(&self, _: WorkerId, _: Delivery) -> std::result::Result<(), DispatchError> {
            Ok(())
        }
    }

    fn current_destination() -> Option<WorkerId> {
        with_send_context(|context| context.destination())
    }

    #[test]
    fn no_context_outside_enter() {
        assert!(current_destination().is_none());
        assert!(with_receive_context(|context| context.local()).is_none());
    }

    #[test]
    fn send_context_collects_and_restores() {
        let recorder = Arc::new(Recorder {
            id: AccumulatorId::new(),
            abandoned: Mutex::new(Vec::new()),
        });

        let (seen, context) = SendContext::new(WorkerId(3)).enter(|| {
            with_send_context(|context| context.record(recorder.clone()));
            current_destination()
        });

        assert_eq!(seen, Some(WorkerId(3)));
        assert_eq!(context.transmitted().len(), 1);
        assert!(current_destination().is_none());
    }

    #[test]
    fn repeated_accumulator_is_recorded_once() {
        let recorder = Arc::new(Recorder {
            id: AccumulatorId::new(),
            abandoned: Mutex::new(Vec::new()),
        });

        let ((), context) = SendContext::new(WorkerId(2)).enter(|| {
            for _ in 0..3 {
                with_send_context(|context| context.record(recorder.clone()));
            }
        });

        assert_eq!(context.transmitted().len(), 1);
        abandon_all(context.transmitted(), WorkerId(2));
        assert_eq!(*recorder.abandoned.lock().unwrap(), vec![WorkerId(2)]);
        assert!(current_destination().is_none());
    }

    #[test]
    fn nested_contexts_restore_the_outer_one() {
        let ((inner, after_inner), _) = SendContext::new(WorkerId(2)).enter(|| {
            let (inner, _) = SendContext::new(WorkerId(5)).enter(current_destination);
            (inner, current_destination())
        });

        assert_eq!(inner, Some(WorkerId(5)));
        assert_eq!(after_inner, Some(WorkerId(2)));
        assert!(current_destination().is_none());
    }

    #[test]
    fn context_is_restored_after_panic() {
        let result = catch_unwind(AssertUnwindSafe(|| {
            ReceiveContext::new(
                WorkerId(4),
                Some(CorrelationId::new()),
                Serializer::default(),
                Arc::new(NullSink),
                AccumulatorRegistry::default(),
            )
            .enter(|| panic!("decode blew up"))
        }));

        assert!(result.is_err());
        assert!(with_receive_context(|context| context.local()).is_none());
    }

    #[test]
    fn failed_encode_abandons_recorded_accumulators() {
        struct Failing(Arc<Recorder>);

        impl Serialize for Failing {
            fn serialize<S: serde::Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
                with_send_context(|context| context.record(self.0.clone()));
                Err(serde::ser::Error::custom("refusing to encode"))
            }
        }

        let recorder = Arc::new(Recorder {
            id: AccumulatorId::new(),
            abandoned: Mutex::new(Vec::new()),
        });
        let err = encode_for(WorkerId(7), Serializer::Postcard, &Failing(recorder.clone()))
            .err()
            .expect("encoding should fail");

        assert!(matches!(err, ParallelError::Serialization(_)));
        assert_eq!(*recorder.abandoned.lock().unwrap(), vec![WorkerId(7)]);
    }
}
