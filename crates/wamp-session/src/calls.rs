//! Call correlation.
//!
//! Each outstanding CALL owns one single-shot completion keyed by its call
//! ID. A CALLRESULT or CALLERROR removes the entry and completes it; unknown
//! or already-completed IDs are ignored.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tracing::{debug, trace};
use wamp_core::{CallError, CallId};

type Outcome = Result<Value, CallError>;

/// Receiving side of a pending call's completion.
pub type Completion = oneshot::Receiver<Outcome>;

/// Tracks one pending completion per outstanding call ID.
pub struct CallCorrelator {
    pending: Mutex<HashMap<CallId, oneshot::Sender<Outcome>>>,
    id_length: usize,
}

impl CallCorrelator {
    /// Create a correlator generating IDs of `id_length` characters.
    pub fn new(id_length: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            id_length: id_length.max(1),
        }
    }

    /// Register a new call under an ID distinct from every outstanding one.
    pub fn begin_call(&self) -> (CallId, Completion) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        let call_id = loop {
            let candidate = CallId::random(self.id_length);
            if !pending.contains_key(&candidate) {
                break candidate;
            }
            debug!(call_id = %candidate, "call id collision, regenerating");
        };
        let _ = pending.insert(call_id.clone(), tx);
        trace!(call_id = %call_id, outstanding = pending.len(), "call registered");
        (call_id, rx)
    }

    /// Complete `call_id` with a result. Returns `false` if it was not pending.
    pub fn resolve(&self, call_id: &CallId, value: Value) -> bool {
        self.complete(call_id, Ok(value))
    }

    /// Complete `call_id` with a failure. Returns `false` if it was not pending.
    pub fn reject(&self, call_id: &CallId, error: CallError) -> bool {
        self.complete(call_id, Err(error))
    }

    /// Forget `call_id` without completing it.
    pub fn cancel(&self, call_id: &CallId) -> bool {
        self.pending.lock().remove(call_id).is_some()
    }

    /// Fail every outstanding call, returning how many there were.
    pub fn reject_all(&self, error: impl Fn() -> CallError) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error()));
        }
        count
    }

    /// Whether `call_id` is outstanding.
    pub fn is_pending(&self, call_id: &CallId) -> bool {
        self.pending.lock().contains_key(call_id)
    }

    /// Number of outstanding calls.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn complete(&self, call_id: &CallId, outcome: Outcome) -> bool {
        // Remove under the lock, complete outside it.
        let Some(tx) = self.pending.lock().remove(call_id) else {
            return false;
        };
        if tx.send(outcome).is_err() {
            trace!(call_id = %call_id, "caller dropped before completion");
        }
        true
    }
}

/// Future for one outstanding call, decoding the result to `T`.
///
/// The CALL is already on the wire when this is returned. Dropping it
/// unregisters the call.
#[must_use = "dropping a PendingCall abandons the call"]
pub struct PendingCall<T> {
    call_id: CallId,
    completion: Option<Completion>,
    failed: Option<CallError>,
    deadline: Option<(Pin<Box<Sleep>>, u64)>,
    correlator: Weak<CallCorrelator>,
    _result: PhantomData<fn() -> T>,
}

impl<T> PendingCall<T> {
    pub(crate) fn new(
        call_id: CallId,
        completion: Completion,
        correlator: Weak<CallCorrelator>,
        timeout: Option<Duration>,
    ) -> Self {
        let deadline = timeout.map(|t| {
            let timeout_ms = u64::try_from(t.as_millis()).unwrap_or(u64::MAX);
            (Box::pin(tokio::time::sleep(t)), timeout_ms)
        });
        Self {
            call_id,
            completion: Some(completion),
            failed: None,
            deadline,
            correlator,
            _result: PhantomData,
        }
    }

    /// Unregister this call and turn it into an immediate failure.
    pub(crate) fn fail(mut self, error: CallError) -> Self {
        if let Some(correlator) = self.correlator.upgrade() {
            let _ = correlator.cancel(&self.call_id);
        }
        self.finish();
        self.failed = Some(error);
        self
    }

    /// ID this call was sent under.
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    fn finish(&mut self) {
        self.completion = None;
        self.deadline = None;
    }
}

impl<T: DeserializeOwned> Future for PendingCall<T> {
    type Output = Result<T, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(error) = this.failed.take() {
            return Poll::Ready(Err(error));
        }

        if let Some(completion) = this.completion.as_mut() {
            if let Poll::Ready(outcome) = Pin::new(completion).poll(cx) {
                this.finish();
                let result = match outcome {
                    Ok(Ok(value)) => serde_json::from_value(value).map_err(CallError::Decode),
                    Ok(Err(error)) => Err(error),
                    Err(_) => Err(CallError::SessionClosed),
                };
                return Poll::Ready(result);
            }
        }

        if let Some((sleep, timeout_ms)) = this.deadline.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                let timeout_ms = *timeout_ms;
                if let Some(correlator) = this.correlator.upgrade() {
                    let _ = correlator.cancel(&this.call_id);
                }
                this.finish();
                debug!(call_id = %this.call_id, timeout_ms, "call timed out");
                return Poll::Ready(Err(CallError::Timeout { timeout_ms }));
            }
        }

        Poll::Pending
    }
}

impl<T> Drop for PendingCall<T> {
    fn drop(&mut self) {
        if self.completion.is_some() {
            if let Some(correlator) = self.correlator.upgrade() {
                let _ = correlator.cancel(&self.call_id);
            }
        }
    }
}
