//! Shared channels for group communication
//!
//! Several logical owners (for example one per discovery group) can share a
//! single transport connection per channel name. The manager hands out
//! reference-counted wrappers; the last release closes the transport.
//!
//! # Architecture
//!
//! ```text
//!                      Arc<ChannelManager<T>>
//!                 ┌─────────────────────────────┐
//!                 │ channels: HashMap<String,   │
//!                 │   Arc<ChannelWrapper<T>> {  │
//!                 │     transport: T,           │
//!                 │     ref_count, connected,   │
//!                 │     fanout: Arc<Fanout>,    │
//!                 │   }                         │
//!                 │ >                           │
//!                 └──────────────┬──────────────┘
//!                                │
//!        ┌───────────────────────┼───────────────────────┐
//!        ▼                       ▼                       ▼
//!   [Owner A]               [Owner B]            [transport task]
//!   acquire()/connect()     send()               fanout.deliver()
//!   release()               release()                 │
//!                                            ┌────────┴────────┐
//!                                            ▼                 ▼
//!                                       receiver 1        receiver 2
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use groupmux::channel::ChannelManager;
//! use groupmux::transport::{GroupMessage, MemoryNetwork, MemoryTransport};
//!
//! # async fn example() -> groupmux::error::Result<()> {
//! let network = MemoryNetwork::new();
//! let manager: Arc<ChannelManager<MemoryTransport>> = ChannelManager::new();
//!
//! let channel = manager.acquire("disco", |_| Ok(network.transport())).await?;
//! channel.connect().await?;
//! channel.send(GroupMessage::new(&b"hello"[..])).await?;
//! channel.release(true).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod fanout;
pub mod manager;
pub mod wrapper;

pub use config::ManagerConfig;
pub use fanout::GroupReceiver;
pub use manager::ChannelManager;
pub use wrapper::{ChannelStats, ChannelWrapper};
