//! Group transport abstraction
//!
//! A [`Transport`] is one physical connection to a named group channel. This
//! crate never implements the group protocol itself; it only needs the narrow
//! contract below. [`memory`] provides an in-process implementation for demos
//! and tests.

pub mod memory;
pub mod message;

use std::future::Future;
use std::sync::Arc;

use crate::error::TransportError;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::GroupMessage;

/// Callback installed on a transport to receive inbound messages
///
/// Invoked on a thread or task owned by the transport.
pub trait DeliveryHandler: Send + Sync {
    /// Handle one inbound message
    fn deliver(&self, message: &GroupMessage);
}

/// Physical group-communication channel
pub trait Transport: Send + Sync + 'static {
    /// Join the group channel with the given name
    fn connect(&self, name: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Check whether the transport has not been closed
    fn is_open(&self) -> bool;

    /// Check whether the transport has joined a group
    fn is_connected(&self) -> bool;

    /// Send a message to every member of the group
    fn send(
        &self,
        message: GroupMessage,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Leave the group and release all resources
    fn close(&self) -> impl Future<Output = ()> + Send;

    /// Install the delivery handler, replacing any prior one
    ///
    /// `None` detaches the current handler.
    fn set_delivery_handler(&self, handler: Option<Arc<dyn DeliveryHandler>>);
}
