//! Matches asynchronous replies to the requests that are waiting for them.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nimbus_types::RequestId;
use tracing::{debug, warn};

use crate::error::CorrelationError;

/// One-shot slot returned by [`Deliverator::register`].
#[derive(Debug)]
pub struct Completion<T> {
    request_id: RequestId,
    rx: Receiver<T>,
}

impl<T> Completion<T> {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

/// Request correlator.
///
/// Each registered id has exactly one pending slot. Delivery and
/// cancellation both remove the slot under the lock, so whichever happens
/// first wins and the other is a no-op: a caller observes at most one reply
/// per id, and replies for unknown ids are dropped.
#[derive(Debug)]
pub struct Deliverator<T> {
    pending: Mutex<HashMap<RequestId, SyncSender<T>>>,
}

impl<T> Default for Deliverator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deliverator<T> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a fresh request id and its completion slot.
    pub fn register(&self) -> Completion<T> {
        let (tx, rx) = mpsc::sync_channel(1);
        let mut pending = self.lock();
        let mut request_id = RequestId::random();
        while pending.contains_key(&request_id) {
            request_id = RequestId::random();
        }
        pending.insert(request_id, tx);
        Completion { request_id, rx }
    }

    /// Hands `reply` to the caller waiting on `request_id`.
    ///
    /// Returns false, and drops the reply, if nothing is waiting for that id.
    pub fn deliver(&self, request_id: RequestId, reply: T) -> bool {
        let mut pending = self.lock();
        match pending.remove(&request_id) {
            Some(tx) => {
                // Capacity 1 and a single send per slot: never blocks. The
                // receiver may already be gone if the caller dropped it.
                let _ = tx.try_send(reply);
                true
            }
            None => {
                debug!(request_id = %request_id, "discarding unmatched reply");
                false
            }
        }
    }

    /// Waits for the reply or the timeout, whichever comes first.
    ///
    /// Blocks only the calling thread.
    pub fn await_reply(
        &self,
        completion: Completion<T>,
        timeout: Duration,
    ) -> Result<T, CorrelationError> {
        let request_id = completion.request_id;
        match completion.rx.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                if self.cancel(request_id) {
                    return Err(CorrelationError::TimedOut { request_id });
                }
                // Delivery won the race; the reply is already in the channel.
                match completion.rx.try_recv() {
                    Ok(reply) => Ok(reply),
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                        Err(CorrelationError::Closed { request_id })
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(CorrelationError::Closed { request_id }),
        }
    }

    /// Removes the pending slot. Returns false if it was already resolved.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        self.lock().remove(&request_id).is_some()
    }

    /// Resolves every pending slot with a reply built from its id.
    pub fn resolve_all(&self, mut make_reply: impl FnMut(RequestId) -> T) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (request_id, tx) in drained {
            let _ = tx.try_send(make_reply(request_id));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, SyncSender<T>>> {
        self.pending.lock().unwrap_or_else(|poisoned| {
            warn!("deliverator lock poisoned, continuing");
            PoisonError::into_inner(poisoned)
        })
    }
}
