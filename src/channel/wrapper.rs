//! Reference-counted shared channel
//!
//! A [`ChannelWrapper`] owns one transport and is shared by every logical
//! owner of the same channel name. The last `release` tears it down.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::transport::{DeliveryHandler, GroupMessage, Transport};

use super::fanout::{Fanout, GroupReceiver};
use super::manager::ChannelManager;

/// Reference count and connection state, guarded together
#[derive(Debug)]
struct Lifecycle {
    ref_count: u32,
    connected: bool,
}

/// Shared owner of one transport
///
/// Created by [`ChannelManager::acquire`] with a reference count of 1.
/// Every `acquire` must be paired with exactly one `release`.
pub struct ChannelWrapper<T: Transport> {
    name: String,
    transport: T,
    manager: Weak<ChannelManager<T>>,

    /// Serializes acquire, release and connect
    lifecycle: Mutex<Lifecycle>,

    /// Installed on the transport as its delivery handler
    fanout: Arc<Fanout>,

    /// Set once, under the lifecycle lock, when the count reaches zero
    destroyed: AtomicBool,
}

impl<T: Transport> ChannelWrapper<T> {
    pub(crate) fn new(manager: Weak<ChannelManager<T>>, name: &str, transport: T) -> Self {
        let fanout = Arc::new(Fanout::new(name));
        let handler: Arc<dyn DeliveryHandler> = fanout.clone();
        transport.set_delivery_handler(Some(handler));

        Self {
            name: name.to_string(),
            transport,
            manager,
            lifecycle: Mutex::new(Lifecycle {
                ref_count: 1,
                connected: false,
            }),
            fanout,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Channel name (the registry key)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wrapped transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Check whether the last reference has been released
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Current reference count
    pub async fn ref_count(&self) -> u32 {
        self.lifecycle.lock().await.ref_count
    }

    /// Check whether `connect` has succeeded and the channel is not torn down
    pub async fn is_connected(&self) -> bool {
        self.lifecycle.lock().await.connected
    }

    /// Number of live receivers
    pub fn receiver_count(&self) -> usize {
        self.fanout.len()
    }

    /// Get a statistics snapshot
    pub async fn stats(&self) -> ChannelStats {
        let lifecycle = self.lifecycle.lock().await;
        ChannelStats {
            ref_count: lifecycle.ref_count,
            connected: lifecycle.connected,
            receiver_count: self.fanout.len(),
            transport_open: self.transport.is_open(),
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::ChannelDestroyed(self.name.clone()));
        }
        Ok(())
    }

    /// Add a reference and return another handle to this channel
    pub async fn acquire(self: &Arc<Self>) -> Result<Arc<Self>> {
        if self.try_acquire().await {
            Ok(Arc::clone(self))
        } else {
            Err(Error::ChannelDestroyed(self.name.clone()))
        }
    }

    /// Add a reference unless the channel is already destroyed
    pub(crate) async fn try_acquire(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_destroyed() {
            return false;
        }
        lifecycle.ref_count += 1;
        tracing::trace!(
            channel = %self.name,
            ref_count = lifecycle.ref_count,
            "RefCount++"
        );
        true
    }

    /// Join the group channel
    ///
    /// Returns immediately if already connected. Concurrent callers are
    /// serialized, so the transport is connected at most once. On failure the
    /// channel stays disconnected and the call can be retried.
    pub async fn connect(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.ensure_alive()?;

        if lifecycle.connected {
            tracing::trace!(channel = %self.name, "Already connected");
            return Ok(());
        }

        if !self.transport.is_connected() {
            tracing::trace!(channel = %self.name, "Connecting transport");
            self.transport.connect(&self.name).await?;
        }
        lifecycle.connected = true;

        tracing::debug!(
            channel = %self.name,
            ref_count = lifecycle.ref_count,
            "Channel connected"
        );
        Ok(())
    }

    /// Send a message to the group
    ///
    /// When the manager suppresses loopback, the message is flagged so this
    /// process does not receive its own message.
    pub async fn send(&self, mut message: GroupMessage) -> Result<()> {
        self.ensure_alive()?;

        if !self.loopback_messages() {
            message.set_dont_loopback();
        }

        tracing::trace!(
            channel = %self.name,
            open = self.transport.is_open(),
            bytes = message.len(),
            dont_loopback = message.is_dont_loopback(),
            "Sending message"
        );
        self.transport.send(message).await?;
        Ok(())
    }

    fn loopback_messages(&self) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|manager| manager.is_loopback_messages())
    }

    /// Register a receiver for inbound messages
    ///
    /// The receiver is held weakly. Adding one that is already registered has
    /// no effect.
    pub fn add_receiver<R: GroupReceiver + 'static>(&self, receiver: &Arc<R>) -> Result<()> {
        self.add_receiver_dyn(receiver.clone())
    }

    /// Register a type-erased receiver
    pub fn add_receiver_dyn(&self, receiver: Arc<dyn GroupReceiver>) -> Result<()> {
        self.ensure_alive()?;

        if self.fanout.add(receiver) {
            tracing::trace!(
                channel = %self.name,
                receivers = self.fanout.len(),
                "Add receiver"
            );
        }
        Ok(())
    }

    /// Unregister a receiver
    ///
    /// Once this returns the receiver is never invoked again by this channel.
    /// A call already running on another thread is waited for; a receiver may
    /// remove itself from inside `receive`. Returns false if it was not
    /// registered.
    pub fn remove_receiver<R: GroupReceiver + 'static>(&self, receiver: &Arc<R>) -> bool {
        let receiver: Arc<dyn GroupReceiver> = receiver.clone();
        self.remove_receiver_dyn(&receiver)
    }

    /// Unregister a type-erased receiver
    pub fn remove_receiver_dyn(&self, receiver: &Arc<dyn GroupReceiver>) -> bool {
        let removed = self.fanout.remove(receiver);
        tracing::trace!(channel = %self.name, removed = removed, "Remove receiver");
        removed
    }

    /// Drop one reference
    ///
    /// Returns the remaining count. When it reaches zero the delivery handler
    /// is detached, the transport is closed if `close_transport` is set, and
    /// the channel is removed from its manager. With `close_transport` unset
    /// the transport is left as is and the caller owns closing it.
    pub async fn release(self: &Arc<Self>, close_transport: bool) -> Result<u32> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            self.ensure_alive()?;

            lifecycle.ref_count -= 1;
            tracing::trace!(
                channel = %self.name,
                ref_count = lifecycle.ref_count,
                "RefCount--"
            );
            if lifecycle.ref_count > 0 {
                return Ok(lifecycle.ref_count);
            }

            self.teardown(&mut lifecycle, close_transport).await;
        }

        // Lifecycle lock is released first: the manager takes its registry
        // lock before any wrapper lock.
        if let Some(manager) = self.manager.upgrade() {
            manager.remove(&self.name, self).await;
        }
        Ok(0)
    }

    /// Tear down regardless of outstanding references
    pub(crate) async fn destroy(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_destroyed() {
            return;
        }
        lifecycle.ref_count = 0;
        self.teardown(&mut lifecycle, true).await;
    }

    async fn teardown(&self, lifecycle: &mut Lifecycle, close_transport: bool) {
        lifecycle.connected = false;
        self.destroyed.store(true, Ordering::Release);
        self.transport.set_delivery_handler(None);

        if close_transport {
            self.transport.close().await;
            tracing::info!(channel = %self.name, "Channel destroyed, transport closed");
        } else {
            tracing::info!(
                channel = %self.name,
                transport_open = self.transport.is_open(),
                "Channel destroyed, transport left to caller"
            );
        }
    }
}

impl<T: Transport> fmt::Debug for ChannelWrapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ChannelWrapper");
        s.field("name", &self.name);
        match self.lifecycle.try_lock() {
            Ok(lifecycle) => {
                s.field("ref_count", &lifecycle.ref_count);
                s.field("connected", &lifecycle.connected);
            }
            Err(_) => {
                s.field("lifecycle", &"<locked>");
            }
        }
        s.field("receivers", &self.fanout.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Statistics for a shared channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    /// Outstanding references
    pub ref_count: u32,
    /// Whether the channel has been connected
    pub connected: bool,
    /// Number of live receivers
    pub receiver_count: usize,
    /// Whether the transport reports itself open
    pub transport_open: bool,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Mutex as StdMutex;

    use bytes::Bytes;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::error::{BoxError, TransportError};
    use crate::transport::mock::MockTransport;

    struct Collect(StdMutex<Vec<Bytes>>);

    impl GroupReceiver for Collect {
        fn receive(&self, message: &GroupMessage) -> std::result::Result<(), BoxError> {
            self.0.lock().unwrap().push(message.payload().clone());
            Ok(())
        }
    }

    fn standalone(mock: &Arc<MockTransport>) -> Arc<ChannelWrapper<Arc<MockTransport>>> {
        Arc::new(ChannelWrapper::new(Weak::new(), "g", Arc::clone(mock)))
    }

    #[tokio::test]
    async fn test_new_installs_handler() {
        let mock = Arc::new(MockTransport::default());
        let wrapper = standalone(&mock);

        assert!(mock.has_handler());
        assert_eq!(wrapper.ref_count().await, 1);
        assert!(!wrapper.is_connected().await);
        assert_eq!(wrapper.name(), "g");
    }

    #[tokio::test]
    async fn test_connect_failure_allows_retry() {
        let mock = Arc::new(MockTransport::default());
        let wrapper = standalone(&mock);

        mock.fail_connect.store(true, Ordering::SeqCst);
        let err = wrapper.connect().await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Rejected(_))));
        assert!(!wrapper.is_connected().await);
        assert_eq!(wrapper.ref_count().await, 1);

        mock.fail_connect.store(false, Ordering::SeqCst);
        assert_ok!(wrapper.connect().await);
        assert!(wrapper.is_connected().await);
        assert_eq!(mock.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_skips_already_connected_transport() {
        let mock = Arc::new(MockTransport::default());
        mock.connected.store(true, Ordering::SeqCst);
        let wrapper = standalone(&mock);

        assert_ok!(wrapper.connect().await);
        assert!(wrapper.is_connected().await);
        assert_eq!(mock.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_failure_propagates() {
        let mock = Arc::new(MockTransport::default());
        let wrapper = standalone(&mock);

        mock.fail_send.store(true, Ordering::SeqCst);
        assert_err!(wrapper.send(GroupMessage::new(Bytes::new())).await);
        assert!(mock.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_without_manager_suppresses_loopback() {
        let mock = Arc::new(MockTransport::default());
        let wrapper = standalone(&mock);

        assert_ok!(wrapper.send(GroupMessage::new(Bytes::from_static(b"x"))).await);
        assert!(mock.sent.lock().unwrap()[0].is_dont_loopback());
    }

    #[tokio::test]
    async fn test_inbound_message_reaches_receiver() {
        let mock = Arc::new(MockTransport::default());
        let wrapper = standalone(&mock);
        let receiver = Arc::new(Collect(StdMutex::new(Vec::new())));

        assert_ok!(wrapper.add_receiver(&receiver));
        assert_eq!(wrapper.receiver_count(), 1);
        mock.inject(&GroupMessage::new(Bytes::from_static(b"ping")));
        assert_eq!(receiver.0.lock().unwrap().len(), 1);

        assert!(wrapper.remove_receiver(&receiver));
        assert!(!wrapper.remove_receiver(&receiver));
        mock.inject(&GroupMessage::new(Bytes::from_static(b"ping")));
        assert_eq!(receiver.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_to_zero_detaches_and_closes() {
        let mock = Arc::new(MockTransport::default());
        let wrapper = standalone(&mock);
        assert_ok!(wrapper.connect().await);

        let again = wrapper.acquire().await.unwrap();
        assert_eq!(wrapper.ref_count().await, 2);

        assert_eq!(again.release(true).await.unwrap(), 1);
        assert!(mock.has_handler());
        assert_eq!(mock.closes.load(Ordering::SeqCst), 0);

        assert_eq!(wrapper.release(true).await.unwrap(), 0);
        assert!(wrapper.is_destroyed());
        assert!(!wrapper.is_connected().await);
        assert!(!mock.has_handler());
        assert_eq!(mock.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_destroyed_wrapper_fails_fast() {
        let mock = Arc::new(MockTransport::default());
        let wrapper = standalone(&mock);
        assert_ok!(wrapper.release(true).await);

        assert!(matches!(
            wrapper.connect().await,
            Err(Error::ChannelDestroyed(_))
        ));
        assert!(matches!(
            wrapper.send(GroupMessage::new(Bytes::new())).await,
            Err(Error::ChannelDestroyed(_))
        ));
        assert!(matches!(
            wrapper.acquire().await,
            Err(Error::ChannelDestroyed(_))
        ));
        assert!(matches!(
            wrapper.release(true).await,
            Err(Error::ChannelDestroyed(_))
        ));
        let receiver = Arc::new(Collect(StdMutex::new(Vec::new())));
        assert_err!(wrapper.add_receiver(&receiver));

        // Transport closed exactly once despite the extra release
        assert_eq!(mock.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_debug_output() {
        let mock = Arc::new(MockTransport::default());
        let wrapper = standalone(&mock);

        let rendered = format!("{:?}", wrapper);
        assert!(rendered.contains("name: \"g\""));
        assert!(rendered.contains("ref_count: 1"));
        assert!(rendered.contains("connected: false"));
    }

    type MockWrapper = ChannelWrapper<Arc<MockTransport>>;

    /// Broadcast group that leaves the channel on the first message it sees
    struct LeaveOnFirst {
        channel: Weak<MockWrapper>,
        me: std::sync::OnceLock<Weak<LeaveOnFirst>>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl GroupReceiver for LeaveOnFirst {
        fn receive(&self, _message: &GroupMessage) -> std::result::Result<(), BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let channel = self.channel.upgrade();
            let me = self.me.get().and_then(Weak::upgrade);
            if let (Some(channel), Some(me)) = (channel, me) {
                channel.remove_receiver(&me);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_receiver_leaves_from_delivery_thread() {
        let mock = Arc::new(MockTransport::default());
        let wrapper = standalone(&mock);
        let leaving = Arc::new(LeaveOnFirst {
            channel: Arc::downgrade(&wrapper),
            me: std::sync::OnceLock::new(),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let _ = leaving.me.set(Arc::downgrade(&leaving));
        let other = Arc::new(Collect(StdMutex::new(Vec::new())));
        assert_ok!(wrapper.add_receiver(&leaving));
        assert_ok!(wrapper.add_receiver(&other));

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let transport = Arc::clone(&mock);
        std::thread::spawn(move || {
            transport.inject(&GroupMessage::new(Bytes::from_static(b"bye")));
            let _ = done_tx.send(());
        });
        done_rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("delivery thread did not return");

        assert_eq!(wrapper.receiver_count(), 1);
        mock.inject(&GroupMessage::new(Bytes::from_static(b"again")));
        assert_eq!(leaving.calls.load(Ordering::SeqCst), 1);
        assert_eq!(other.0.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_type_erased_receiver() {
        let mock = Arc::new(MockTransport::default());
        let wrapper = standalone(&mock);
        let concrete = Arc::new(Collect(StdMutex::new(Vec::new())));
        let erased: Arc<dyn GroupReceiver> = concrete.clone();

        assert_ok!(wrapper.add_receiver_dyn(Arc::clone(&erased)));
        // Same allocation through the typed API is a duplicate
        assert_ok!(wrapper.add_receiver(&concrete));
        assert_eq!(wrapper.receiver_count(), 1);

        mock.inject(&GroupMessage::new(Bytes::from_static(b"x")));
        assert_eq!(concrete.0.lock().unwrap().len(), 1);

        assert!(wrapper.remove_receiver_dyn(&erased));
        assert!(!wrapper.remove_receiver(&concrete));
        assert_eq!(wrapper.receiver_count(), 0);
    }
}
