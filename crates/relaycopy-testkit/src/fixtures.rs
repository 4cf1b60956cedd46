//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: deterministic identities, two
//! nodes that know each other on temporary spools, and an in-memory
//! connection between them.

use std::io::Cursor;
use std::time::Duration;

use relaycopy::{Node, NodeConfig, SessionConfig, SessionReport};
use relaycopy_core::{ContentHash, NodeId, NodeOur};
use relaycopy_packet::{Packet, PacketType};
use relaycopy_sync::Deadlined;
use tempfile::TempDir;
use tokio::io::DuplexStream;

/// In-memory pipe capacity used by [`connect`].
pub const DUPLEX_BUFFER: usize = 1 << 20;

/// Deterministic identity derived from one byte.
pub fn identity(seed: u8) -> NodeOur {
    NodeOur::from_seeds(&[seed; 32], [seed ^ 0x55; 32], [seed ^ 0xAA; 32])
}

/// Create multiple identities for multi-party tests.
pub fn multi_party_identities(count: usize) -> Vec<NodeOur> {
    (0..count).map(|i| identity(i as u8)).collect()
}

/// Session settings short enough for tests: a session ends a little over
/// half a second after the last substantive frame.
pub fn fast_session() -> SessionConfig {
    SessionConfig::default()
        .with_online_deadline(Duration::from_millis(600))
        .with_ping_interval(Duration::from_millis(200))
        .with_tick(Duration::from_millis(50))
        .with_timeouts(Duration::from_millis(50), Duration::from_secs(2))
}

/// Node configuration using [`fast_session`].
pub fn fast_config() -> NodeConfig {
    NodeConfig::default().with_session(fast_session())
}

/// A connected pair of in-memory streams.
pub fn connect() -> (Deadlined<DuplexStream>, Deadlined<DuplexStream>) {
    let (a, b) = tokio::io::duplex(DUPLEX_BUFFER);
    (Deadlined::new(a), Deadlined::new(b))
}

/// Header of a plain file packet.
pub fn file_packet(nice: u8, path: &str) -> Packet {
    Packet {
        kind: PacketType::File,
        nice,
        path: path.as_bytes().to_vec(),
    }
}

/// Route test logs through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Two nodes that know each other, each on its own spool.
pub struct NodePair {
    pub a: Node,
    pub b: Node,
    dir: TempDir,
}

impl NodePair {
    /// Pair with [`fast_config`] on both sides.
    pub async fn new() -> relaycopy::Result<Self> {
        Self::with_configs(fast_config(), fast_config()).await
    }

    pub async fn with_configs(a: NodeConfig, b: NodeConfig) -> relaycopy::Result<Self> {
        let dir = TempDir::new()?;
        let (our_a, our_b) = (identity(1), identity(2));
        let (pub_a, pub_b) = (our_a.their().clone(), our_b.their().clone());
        let a = Node::open(our_a, [pub_b], dir.path().join("a"), a).await?;
        let b = Node::open(our_b, [pub_a], dir.path().join("b"), b).await?;
        Ok(Self { a, b, dir })
    }

    pub fn a_id(&self) -> NodeId {
        self.a.id()
    }

    pub fn b_id(&self) -> NodeId {
        self.b.id()
    }

    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Queue a file packet from A to B.
    pub async fn queue_a_to_b(&self, nice: u8, path: &str, payload: Vec<u8>) -> relaycopy::Result<ContentHash> {
        self.a
            .queue_packet(&self.b_id(), file_packet(nice, path), Cursor::new(payload))
            .await
    }

    /// Queue a file packet from B to A.
    pub async fn queue_b_to_a(&self, nice: u8, path: &str, payload: Vec<u8>) -> relaycopy::Result<ContentHash> {
        self.b
            .queue_packet(&self.a_id(), file_packet(nice, path), Cursor::new(payload))
            .await
    }

    /// A calls B; both sides run until the session ends.
    pub async fn session(&self) -> (relaycopy::Result<SessionReport>, relaycopy::Result<SessionReport>) {
        let (conn_a, conn_b) = connect();
        let b_id = self.b_id();
        tokio::join!(self.a.call(conn_a, &b_id), self.b.serve(conn_b))
    }

    /// Stop both checker pools.
    pub async fn shutdown(&self) {
        self.a.shutdown().await;
        self.b.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities_are_deterministic() {
        assert_eq!(identity(7).id(), identity(7).id());
        assert_ne!(identity(7).id(), identity(8).id());
    }

    #[test]
    fn test_multi_party() {
        let parties = multi_party_identities(3);

        // Each party has unique keys
        let ids: Vec<_> = parties.iter().map(|p| p.id()).collect();
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_ne!(ids[0], ids[2]);
    }

    #[tokio::test]
    async fn test_pair_knows_each_other() {
        let pair = NodePair::new().await.unwrap();
        assert!(pair.a.peer(&pair.b_id()).is_some());
        assert!(pair.b.peer(&pair.a_id()).is_some());
        assert!(pair.dir().join("a").is_dir());

        let hash = pair.queue_a_to_b(10, "x", b"payload".to_vec()).await.unwrap();
        let outbound = pair.a.outbound(&pair.b_id()).await.unwrap();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].hash, hash);
        pair.shutdown().await;
    }
}
