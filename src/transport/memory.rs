//! In-process group transport
//!
//! [`MemoryNetwork`] is a shared hub of named groups. Each connected
//! [`MemoryTransport`] owns a delivery task that drains its inbox and hands
//! every message to the installed [`DeliveryHandler`]. There is no membership
//! protocol: a send reaches whoever is connected to the group at that moment.
//!
//! ```text
//!   MemoryTransport::send()
//!            │
//!            ▼
//!   MemoryNetwork { groups: name -> [inbox tx] }
//!            │                 │
//!            ▼                 ▼
//!     delivery task      delivery task
//!     handler.deliver()  handler.deliver()
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TransportError;

use super::message::GroupMessage;
use super::{DeliveryHandler, Transport};

type HandlerSlot = Arc<RwLock<Option<Arc<dyn DeliveryHandler>>>>;

/// Inbox of one connected transport
struct Member {
    id: u64,
    inbox: mpsc::UnboundedSender<GroupMessage>,
}

/// Shared hub connecting in-process transports by group name
#[derive(Default)]
pub struct MemoryNetwork {
    groups: Mutex<HashMap<String, Vec<Member>>>,
    next_id: AtomicU64,
}

impl MemoryNetwork {
    /// Create a new, empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport attached to this network
    pub fn transport(self: &Arc<Self>) -> MemoryTransport {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        MemoryTransport {
            id,
            network: Arc::clone(self),
            handler: Arc::new(RwLock::new(None)),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Number of transports connected to a group
    pub fn member_count(&self, group: &str) -> usize {
        self.groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(group)
            .map_or(0, Vec::len)
    }

    fn join(&self, group: &str, member: Member) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.entry(group.to_string()).or_default().push(member);
    }

    fn leave(&self, group: &str, id: u64) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(members) = groups.get_mut(group) {
            members.retain(|m| m.id != id);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    /// Queue a message on every member's inbox
    ///
    /// Returns the number of inboxes reached.
    fn publish(&self, group: &str, sender: u64, message: &GroupMessage) -> usize {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let Some(members) = groups.get_mut(group) else {
            return 0;
        };

        // Inboxes whose delivery task is gone are dropped here
        members.retain(|m| !m.inbox.is_closed());

        let mut reached = 0;
        for member in members.iter() {
            if member.id == sender && message.is_dont_loopback() {
                continue;
            }
            if member.inbox.send(message.clone()).is_ok() {
                reached += 1;
            }
        }
        reached
    }
}

#[derive(Default)]
struct MemoryState {
    group: Option<String>,
    closed: bool,
    delivery: Option<JoinHandle<()>>,
}

/// Transport backed by a [`MemoryNetwork`]
pub struct MemoryTransport {
    id: u64,
    network: Arc<MemoryNetwork>,
    handler: HandlerSlot,
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    /// Identifier of this transport on its network
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Group currently joined, if any
    pub fn group(&self) -> Option<String> {
        self.lock_state().group.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_delivery(
        id: u64,
        handler: HandlerSlot,
        mut inbox: mpsc::UnboundedReceiver<GroupMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                let current = handler.read().unwrap_or_else(|e| e.into_inner()).clone();
                match current {
                    Some(h) => h.deliver(&message),
                    None => {
                        tracing::trace!(transport = id, "No delivery handler, message dropped");
                    }
                }
            }
        })
    }
}

impl Transport for MemoryTransport {
    async fn connect(&self, name: &str) -> Result<(), TransportError> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.group.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.delivery = Some(Self::spawn_delivery(self.id, Arc::clone(&self.handler), rx));
        state.group = Some(name.to_string());
        self.network.join(name, Member { id: self.id, inbox: tx });

        tracing::debug!(transport = self.id, group = name, "Memory transport connected");
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.lock_state().closed
    }

    fn is_connected(&self) -> bool {
        self.lock_state().group.is_some()
    }

    async fn send(&self, message: GroupMessage) -> Result<(), TransportError> {
        let group = {
            let state = self.lock_state();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.group.clone().ok_or(TransportError::NotConnected)?
        };

        let reached = self.network.publish(&group, self.id, &message);
        tracing::trace!(
            transport = self.id,
            group = %group,
            reached = reached,
            "Memory transport sent message"
        );
        Ok(())
    }

    async fn close(&self) {
        let (group, delivery) = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            (state.group.take(), state.delivery.take())
        };

        if let Some(group) = group {
            self.network.leave(&group, self.id);
        }
        if let Some(task) = delivery {
            task.abort();
        }
        tracing::debug!(transport = self.id, "Memory transport closed");
    }

    fn set_delivery_handler(&self, handler: Option<Arc<dyn DeliveryHandler>>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = handler;
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(group) = state.group.take() {
            self.network.leave(&group, self.id);
        }
        if let Some(task) = state.delivery.take() {
            task.abort();
        }
    }
}
