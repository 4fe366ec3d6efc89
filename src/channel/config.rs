//! Channel manager configuration

/// Configuration for a [`ChannelManager`](super::ChannelManager)
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Deliver a process's own messages back to it (default: false)
    ///
    /// When disabled, every message sent through a shared channel is flagged
    /// so the transport does not redeliver it to the sender.
    pub loopback_messages: bool,
}

impl ManagerConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow or suppress loopback delivery
    pub fn loopback_messages(mut self, enabled: bool) -> Self {
        self.loopback_messages = enabled;
        self
    }
}
