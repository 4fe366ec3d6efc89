//! Channel manager implementation
//!
//! The registry that hands out one shared [`ChannelWrapper`] per channel name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::transport::Transport;

use super::config::ManagerConfig;
use super::wrapper::{ChannelStats, ChannelWrapper};

/// Registry of shared channels keyed by name
///
/// Construct one per process (or per test) and share it behind the returned
/// `Arc`. Lock order is registry first, then a wrapper's lifecycle lock.
///
/// `acquire` holds the registry lock while waiting for a channel's lifecycle
/// lock, and `connect`/`release` hold that lock across transport I/O, so an
/// acquire of any name can wait behind one channel's slow connect or close.
pub struct ChannelManager<T: Transport> {
    /// Map of channel name to its live wrapper
    channels: Mutex<HashMap<String, Arc<ChannelWrapper<T>>>>,

    /// Deliver a process's own messages back to it
    loopback_messages: AtomicBool,
}

impl<T: Transport> ChannelManager<T> {
    /// Create a new manager with default configuration
    pub fn new() -> Arc<Self> {
        Self::with_config(ManagerConfig::default())
    }

    /// Create a new manager with custom configuration
    pub fn with_config(config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            loopback_messages: AtomicBool::new(config.loopback_messages),
        })
    }

    /// Check whether loopback delivery is allowed
    pub fn is_loopback_messages(&self) -> bool {
        self.loopback_messages.load(Ordering::Relaxed)
    }

    /// Allow or suppress loopback delivery for subsequent sends
    pub fn set_loopback_messages(&self, enabled: bool) {
        self.loopback_messages.store(enabled, Ordering::Relaxed);
    }

    /// Get the shared channel for `name`, creating it on first use
    ///
    /// An existing channel gains one reference. Otherwise `factory` is called
    /// once to create the transport and the new channel starts with a single
    /// reference. A factory error is returned as is and nothing is registered.
    pub async fn acquire<F>(
        self: &Arc<Self>,
        name: &str,
        factory: F,
    ) -> Result<Arc<ChannelWrapper<T>>>
    where
        F: FnOnce(&str) -> Result<T>,
    {
        let mut channels = self.channels.lock().await;

        if let Some(existing) = channels.get(name) {
            if existing.try_acquire().await {
                return Ok(Arc::clone(existing));
            }
            // Last release is in flight; its removal will find a new instance
            tracing::debug!(channel = name, "Replacing destroyed channel");
        }

        let transport = factory(name)?;
        let wrapper = Arc::new(ChannelWrapper::new(Arc::downgrade(self), name, transport));
        channels.insert(name.to_string(), Arc::clone(&wrapper));

        tracing::info!(
            channel = name,
            channels = channels.len(),
            "Channel created"
        );
        Ok(wrapper)
    }

    /// Forget a channel whose reference count reached zero
    ///
    /// Only removes the entry if it is still `wrapper`, so a channel created
    /// again under the same name is left alone.
    pub(crate) async fn remove(&self, name: &str, wrapper: &Arc<ChannelWrapper<T>>) -> bool {
        let mut channels = self.channels.lock().await;

        match channels.get(name) {
            Some(current) if Arc::ptr_eq(current, wrapper) => {
                channels.remove(name);
                tracing::debug!(channel = name, "Channel removed");
                true
            }
            _ => {
                tracing::trace!(channel = name, "Channel already replaced, not removed");
                false
            }
        }
    }

    /// Look up a channel without taking a reference
    pub async fn get(&self, name: &str) -> Option<Arc<ChannelWrapper<T>>> {
        self.channels.lock().await.get(name).cloned()
    }

    /// Check if a channel is registered
    pub async fn contains(&self, name: &str) -> bool {
        self.channels.lock().await.contains_key(name)
    }

    /// Get total number of registered channels
    pub async fn channel_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    /// Get channel statistics
    pub async fn channel_stats(&self, name: &str) -> Option<ChannelStats> {
        let wrapper = self.get(name).await?;
        Some(wrapper.stats().await)
    }

    /// Tear down every channel and empty the registry
    ///
    /// Outstanding handles become destroyed; their transports are closed.
    /// Returns the number of channels torn down.
    pub async fn clear(&self) -> usize {
        let drained: Vec<_> = {
            let mut channels = self.channels.lock().await;
            channels.drain().map(|(_, wrapper)| wrapper).collect()
        };

        for wrapper in &drained {
            wrapper.destroy().await;
        }

        tracing::info!(channels = drained.len(), "Channel manager cleared");
        drained.len()
    }
}
