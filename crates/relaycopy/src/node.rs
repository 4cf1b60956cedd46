//! The node: one identity, its peers, a spool and a checker pool.
//!
//! A `Node` is what an application holds. Outbound packets are encrypted
//! straight into the spool, sessions are run over whatever connection the
//! caller brings, and received packets are opened from the spool.

use std::collections::HashMap;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;

use relaycopy_core::{ContentHash, NodeId, NodeOur, NodeTheir};
use relaycopy_packet::{decode_packet, encode_packet, EncodeOptions, Encoded, Packet};
use relaycopy_spool::{CatalogEntry, Direction, Spool};
use relaycopy_sync::{Checker, Conn, Session, SessionConfig, SessionReport};

use crate::error::{NodeError, Result};

/// Configuration for a node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Configuration of every session the node runs.
    pub session: SessionConfig,
    /// Pad outbound packets up to this size.
    pub min_size: u64,
    /// Refuse to encode packets larger than this.
    pub max_size: u64,
    /// Transit layers the packet will still be wrapped in.
    pub wrappers: u32,
    /// Report this much free spool space instead of asking the filesystem.
    pub spool_capacity: Option<u64>,
    /// Checksum workers shared by all sessions.
    pub checkers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            min_size: 0,
            max_size: u64::MAX,
            wrappers: 0,
            spool_capacity: None,
            checkers: 2,
        }
    }
}

impl NodeConfig {
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_sizes(mut self, min_size: u64, max_size: u64) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    pub fn with_spool_capacity(mut self, bytes: u64) -> Self {
        self.spool_capacity = Some(bytes);
        self
    }
}

/// A decrypted inbound packet.
#[derive(Debug, Clone)]
pub struct Opened {
    /// Who encrypted it.
    pub sender: NodeId,
    pub packet: Packet,
    pub payload: Vec<u8>,
}

/// A store-and-forward node.
pub struct Node {
    our: Arc<NodeOur>,
    peers: Arc<HashMap<NodeId, NodeTheir>>,
    spool: Spool,
    checker: Arc<Checker>,
    config: NodeConfig,
}

impl Node {
    /// Open a node over the spool at `root`, starting its checker pool.
    pub async fn open(
        our: NodeOur,
        peers: impl IntoIterator<Item = NodeTheir>,
        root: impl Into<PathBuf>,
        config: NodeConfig,
    ) -> Result<Self> {
        let mut spool = Spool::open(root).await?;
        if let Some(capacity) = config.spool_capacity {
            spool = spool.with_capacity(capacity);
        }
        let peers: HashMap<_, _> = peers.into_iter().map(|p| (p.id, p)).collect();
        tracing::info!(node = %our.id(), peers = peers.len(), root = %spool.root().display(), "node opened");
        Ok(Self {
            our: Arc::new(our),
            peers: Arc::new(peers),
            spool,
            checker: Checker::start(config.checkers),
            config,
        })
    }

    pub fn id(&self) -> NodeId {
        self.our.id()
    }

    pub fn our(&self) -> &NodeOur {
        &self.our
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn peer(&self, id: &NodeId) -> Option<&NodeTheir> {
        self.peers.get(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────────

    /// Encrypt `packet` and `data` for `to` and store the result in its
    /// outbound spool. Returns the name it is stored under.
    pub async fn queue_packet<R>(&self, to: &NodeId, packet: Packet, data: R) -> Result<ContentHash>
    where
        R: Read + Send + 'static,
    {
        let recipient = self
            .peers
            .get(to)
            .cloned()
            .ok_or(NodeError::UnknownPeer(*to))?;
        let our = Arc::clone(&self.our);
        let nice = packet.nice;
        let opts = EncodeOptions {
            nice,
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            wrappers: self.config.wrappers,
        };

        let stored = self
            .spool
            .store_tx(to, move |out| -> Result<Encoded> {
                Ok(encode_packet(&our, &recipient, &packet, &opts, data, out)?)
            })
            .await?;
        tracing::info!(peer = %to, hash = %stored.hash, size = stored.size, nice, "packet queued");
        Ok(stored.hash)
    }

    /// Outbound items still waiting for `peer`.
    pub async fn outbound(&self, peer: &NodeId) -> Result<Vec<CatalogEntry>> {
        Ok(self.spool.catalog(peer, Direction::Tx).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────

    fn session(&self) -> Session {
        Session::new(
            Arc::clone(&self.our),
            Arc::clone(&self.peers),
            self.spool.clone(),
            Arc::clone(&self.checker),
            self.config.session.clone(),
        )
    }

    /// Call `peer` over an established connection and run a session.
    pub async fn call<C: Conn>(&self, conn: C, peer: &NodeId) -> Result<SessionReport> {
        if !self.peers.contains_key(peer) {
            return Err(NodeError::UnknownPeer(*peer));
        }
        Ok(self.session().initiate(conn, peer).await?)
    }

    /// Answer a call over an established connection.
    pub async fn serve<C: Conn>(&self, conn: C) -> Result<SessionReport> {
        Ok(self.session().accept(conn).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────────

    /// Verified inbound items from `peer`.
    pub async fn received(&self, peer: &NodeId) -> Result<Vec<CatalogEntry>> {
        Ok(self.spool.catalog(peer, Direction::Rx).await?)
    }

    /// Decrypt a received item, then mark it seen and drop it from the spool.
    ///
    /// The envelope must be signed by a known peer. On any error the item
    /// stays where it is.
    pub async fn open_received(&self, peer: &NodeId, hash: &ContentHash) -> Result<Opened> {
        let path = self.spool.rx_path(peer, hash);
        let our = Arc::clone(&self.our);
        let peers = Arc::clone(&self.peers);
        let (sender, plain) = tokio::task::spawn_blocking(move || -> Result<(Option<NodeTheir>, Vec<u8>)> {
            let file = std::fs::File::open(&path)?;
            let mut plain = Vec::new();
            let decoded = decode_packet(&our, &peers, BufReader::new(file), &mut plain, true, None)?;
            Ok((decoded.peer, plain))
        })
        .await??;

        let sender = sender.map(|p| p.id).ok_or(NodeError::UnknownPeer(*peer))?;
        let (packet, payload) = Packet::split_plaintext(&plain)?;
        let opened = Opened {
            sender,
            packet,
            payload: payload.to_vec(),
        };

        self.spool.mark_seen(peer, hash).await?;
        self.spool.remove_rx(peer, hash).await?;
        tracing::info!(%peer, %hash, sender = %opened.sender, kind = ?opened.packet.kind, len = opened.payload.len(), "packet opened");
        Ok(opened)
    }

    /// Stop the checker pool once queued checks are done.
    pub async fn shutdown(&self) {
        self.checker.stop().await;
    }
}
