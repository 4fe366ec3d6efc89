//! Reference-counted shared channels for group-communication transports
//!
//! Discovery and broadcast groups in a cluster often need to talk on the same
//! named group channel. Rather than each opening its own connection, they
//! share one transport per channel name through a [`ChannelManager`]:
//!
//! - the first `acquire` for a name creates the transport, later ones share it
//! - `connect` is idempotent across all holders
//! - every inbound message is fanned out to all registered receivers
//! - the last `release` detaches and closes the transport
//!
//! The group protocol itself lives behind the [`Transport`] trait.
//! [`transport::memory`] provides an in-process implementation.

pub mod channel;
pub mod error;
pub mod transport;

pub use channel::{ChannelManager, ChannelStats, ChannelWrapper, GroupReceiver, ManagerConfig};
pub use error::{BoxError, Error, Result, TransportError};
pub use transport::{DeliveryHandler, GroupMessage, MemoryNetwork, MemoryTransport, Transport};
