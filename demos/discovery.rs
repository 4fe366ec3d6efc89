//! Discovery groups sharing one channel
//!
//! Run with: cargo run --example discovery
//!
//! Two "nodes" run in one process on an in-memory network. Node A hosts two
//! broadcast groups that share a single transport on the `disco` channel;
//! node B announces itself and both of A's groups see the announcement.
//!
//! Set `RUST_LOG=groupmux=trace` to watch reference counts change.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use groupmux::{
    BoxError, ChannelManager, GroupMessage, GroupReceiver, MemoryNetwork, MemoryTransport,
};

/// Broadcast group that prints every announcement it hears
struct Group {
    name: &'static str,
}

impl GroupReceiver for Group {
    fn receive(&self, message: &GroupMessage) -> Result<(), BoxError> {
        let text = std::str::from_utf8(message.payload())?;
        println!("[{}] heard: {}", self.name, text);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("groupmux=info".parse()?),
        )
        .init();

    let network = MemoryNetwork::new();
    let node_a: Arc<ChannelManager<MemoryTransport>> = ChannelManager::new();
    let node_b: Arc<ChannelManager<MemoryTransport>> = ChannelManager::new();

    // Node A: two groups, one transport
    let cluster = node_a.acquire("disco", |_| Ok(network.transport())).await?;
    let backup = node_a.acquire("disco", |_| Ok(network.transport())).await?;
    cluster.connect().await?;
    backup.connect().await?;

    let cluster_group = Arc::new(Group { name: "cluster" });
    let backup_group = Arc::new(Group { name: "backup" });
    cluster.add_receiver(&cluster_group)?;
    backup.add_receiver(&backup_group)?;

    println!(
        "node A: refs={} members on disco={}",
        cluster.ref_count().await,
        network.member_count("disco")
    );

    // Node B announces
    let announcer = node_b.acquire("disco", |_| Ok(network.transport())).await?;
    announcer.connect().await?;
    announcer
        .send(GroupMessage::new(Bytes::from_static(b"node-b@10.0.0.2:61616")))
        .await?;

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Tear down in any order; the transport closes on the last release
    backup.remove_receiver(&backup_group);
    backup.release(true).await?;
    println!("node A after one release: {:?}", node_a.channel_stats("disco").await);
    cluster.remove_receiver(&cluster_group);
    cluster.release(true).await?;
    println!("node A channels left: {}", node_a.channel_count().await);

    announcer.release(true).await?;
    Ok(())
}
