//! Receiver fan-out
//!
//! Holds the receivers registered on one shared channel and delivers each
//! inbound message to all of them. A [`Fanout`] is what gets installed on the
//! transport as its delivery handler; it does not own the transport, so no
//! reference cycle forms between a wrapper and its transport.
//!
//! Dispatch walks an immutable snapshot of the receiver list, so receivers
//! may add or remove receivers (including themselves) from inside
//! `receive`. Add and remove publish a new snapshot.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::thread::{self, ThreadId};

use crate::error::BoxError;
use crate::transport::{DeliveryHandler, GroupMessage};

/// Listener for messages arriving on a shared channel
///
/// Receivers are held weakly: dropping the last `Arc` to a receiver stops
/// delivery to it. `receive` may run on any thread.
pub trait GroupReceiver: Send + Sync {
    /// Handle one message
    fn receive(&self, message: &GroupMessage) -> Result<(), BoxError>;
}

#[derive(Default)]
struct EntryState {
    removed: bool,
    /// Threads currently inside this receiver's `receive`
    running: Vec<ThreadId>,
}

/// One registered receiver
struct Entry {
    receiver: Weak<dyn GroupReceiver>,
    state: Mutex<EntryState>,
    idle: Condvar,
}

impl Entry {
    fn new(receiver: Weak<dyn GroupReceiver>) -> Self {
        Self {
            receiver,
            state: Mutex::new(EntryState::default()),
            idle: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_live(&self) -> bool {
        self.receiver.strong_count() > 0 && !self.lock().removed
    }

    /// Mark the calling thread as running this receiver, unless removed
    fn begin(&self) -> Option<Arc<dyn GroupReceiver>> {
        let mut state = self.lock();
        if state.removed {
            return None;
        }
        let receiver = self.receiver.upgrade()?;
        state.running.push(thread::current().id());
        Some(receiver)
    }

    fn finish(&self) {
        let me = thread::current().id();
        let mut state = self.lock();
        if let Some(index) = state.running.iter().position(|t| *t == me) {
            state.running.swap_remove(index);
        }
        self.idle.notify_all();
    }

    /// Stop future calls and wait for calls running on other threads
    ///
    /// A call on the current thread (a receiver removing itself) is not
    /// waited for.
    fn retire(&self) {
        let me = thread::current().id();
        let mut state = self.lock();
        state.removed = true;
        while state.running.iter().any(|t| *t != me) {
            state = self.idle.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }
}

type Snapshot = Arc<Vec<Arc<Entry>>>;

/// Ordered set of weakly held receivers
pub(crate) struct Fanout {
    channel: String,
    receivers: RwLock<Snapshot>,
}

impl Fanout {
    pub(crate) fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            receivers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.receivers.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Append a receiver; returns false if it was already registered
    pub(crate) fn add(&self, receiver: Arc<dyn GroupReceiver>) -> bool {
        let weak = Arc::downgrade(&receiver);
        let mut current = self.receivers.write().unwrap_or_else(|e| e.into_inner());

        let mut next: Vec<Arc<Entry>> = current.iter().filter(|e| e.is_live()).cloned().collect();
        if next.iter().any(|e| Weak::ptr_eq(&e.receiver, &weak)) {
            return false;
        }
        next.push(Arc::new(Entry::new(weak)));
        *current = Arc::new(next);
        true
    }

    /// Remove a receiver by identity; returns false if it was absent
    ///
    /// Blocks until calls to this receiver running on other threads have
    /// returned, so the receiver is never invoked once this returns.
    pub(crate) fn remove(&self, receiver: &Arc<dyn GroupReceiver>) -> bool {
        let weak = Arc::downgrade(receiver);
        let removed = {
            let mut current = self.receivers.write().unwrap_or_else(|e| e.into_inner());
            let Some(index) = current
                .iter()
                .position(|e| Weak::ptr_eq(&e.receiver, &weak) && !e.lock().removed)
            else {
                return false;
            };

            let entry = Arc::clone(&current[index]);
            let next: Vec<Arc<Entry>> = current
                .iter()
                .filter(|e| !Arc::ptr_eq(e, &entry) && e.is_live())
                .cloned()
                .collect();
            *current = Arc::new(next);
            entry
        };

        // Waiting happens outside the list lock so dispatch is never blocked
        removed.retire();
        true
    }

    /// Number of live receivers
    pub(crate) fn len(&self) -> usize {
        self.snapshot().iter().filter(|e| e.is_live()).count()
    }

    /// Deliver a message to every live receiver in registration order
    ///
    /// Returns the number of receivers that accepted the message.
    pub(crate) fn dispatch(&self, message: &GroupMessage) -> usize {
        let snapshot = self.snapshot();
        let mut delivered = 0;

        for (index, entry) in snapshot.iter().enumerate() {
            let Some(receiver) = entry.begin() else {
                continue;
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| receiver.receive(message)));
            entry.finish();

            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(
                        channel = %self.channel,
                        receiver = index,
                        error = %e,
                        "Receiver failed to handle message"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        channel = %self.channel,
                        receiver = index,
                        "Receiver panicked while handling message"
                    );
                }
            }
        }

        delivered
    }
}

impl DeliveryHandler for Fanout {
    fn deliver(&self, message: &GroupMessage) {
        let delivered = self.dispatch(message);
        tracing::trace!(
            channel = %self.channel,
            bytes = message.len(),
            delivered = delivered,
            "Wrapper received message"
        );
    }
}
