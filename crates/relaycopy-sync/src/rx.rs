//! Inbound side of a session: decrypt records and act on their frames.

use std::collections::HashMap;
use std::io::{SeekFrom, Write};
use std::sync::Arc;

use relaycopy_core::{ContentHash, MthSeq};
use relaycopy_spool::CatalogEntry;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::checker::CheckJob;
use crate::conn::{ConnReader, RecordReader};
use crate::error::{Result, SyncError};
use crate::frames::Frame;
use crate::noise::Opener;
use crate::session::{decode_body, Ctx, Dead};
use crate::state::QueuedFreq;

/// A file being received. Dropping it closes the descriptor.
struct Inbound {
    file: tokio::fs::File,
    /// Bytes present in the partial file.
    have: u64,
    /// Inline hasher, kept only while chunks arrive in order.
    hasher: Option<MthSeq>,
}

/// Dispatches inbound frames. Owned by the receiving task.
pub(crate) struct Receiver {
    ctx: Arc<Ctx>,
    parts: HashMap<ContentHash, Inbound>,
}

impl Receiver {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self {
            ctx,
            parts: HashMap::new(),
        }
    }

    /// Hand files left unchecked by an earlier session to the checker.
    pub async fn recover_pending(&self) {
        let ctx = &self.ctx;
        match ctx.spool.pending_checks(&ctx.peer).await {
            Ok(hashes) => {
                for hash in hashes {
                    tracing::info!(peer = %ctx.peer, %hash, "re-queueing unchecked content");
                    self.enqueue_check(hash).await;
                }
            }
            Err(e) => tracing::warn!(peer = %ctx.peer, "cannot list unchecked content: {}", e),
        }
    }

    async fn enqueue_check(&self, hash: ContentHash) {
        let ctx = &self.ctx;
        ctx.checker
            .enqueue(CheckJob {
                spool: ctx.spool.clone(),
                peer: ctx.peer,
                hash,
                reply: Some(ctx.checks.clone()),
            })
            .await;
    }

    pub async fn handle(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Halt => {
                tracing::trace!(peer = %self.ctx.peer, "halt");
                self.ctx.state.halt().await;
            }
            Frame::Ping => tracing::trace!(peer = %self.ctx.peer, "ping"),
            Frame::Info { nice, size, hash } => self.on_info(nice, size, hash).await,
            Frame::Freq { hash, offset } => self.on_freq(hash, offset).await,
            Frame::File {
                hash,
                offset,
                payload,
            } => self.on_file(hash, offset, &payload).await?,
            Frame::Done { hash } => self.on_done(hash).await,
        }
        Ok(())
    }

    async fn on_info(&mut self, nice: u8, size: u64, hash: ContentHash) {
        let ctx = &self.ctx;
        let peer = &ctx.peer;
        if !ctx.config.admits(nice, &hash) {
            tracing::debug!(%peer, %hash, nice, "not taking part in this session");
            return;
        }
        if ctx.spool.has_complete(peer, &hash).await || ctx.spool.is_seen(peer, &hash).await {
            tracing::info!(%peer, %hash, "already have it");
            ctx.send(Frame::Done { hash });
            return;
        }
        if ctx.spool.has_nock(peer, &hash).await {
            tracing::debug!(%peer, %hash, "waiting for checksum, deferring");
            return;
        }

        let mut have = match ctx.spool.part_size(peer, &hash).await {
            Ok(have) => have,
            Err(e) => {
                tracing::warn!(%peer, %hash, "cannot stat partial file: {}", e);
                return;
            }
        };
        if have > size {
            tracing::warn!(%peer, %hash, have, size, "partial file larger than advertised, restarting");
            if let Err(e) = ctx.spool.discard(&ctx.spool.part_path(peer, &hash)).await {
                tracing::warn!(%peer, %hash, "cannot remove oversized partial file: {}", e);
                return;
            }
            have = 0;
        }

        let spool = ctx.spool.clone();
        let free = match tokio::task::spawn_blocking(move || spool.free_space()).await {
            Ok(Ok(free)) => free,
            Ok(Err(e)) => {
                tracing::warn!(%peer, %hash, "cannot query free space: {}", e);
                return;
            }
            Err(e) => {
                tracing::warn!(%peer, %hash, "free space query failed: {}", e);
                return;
            }
        };
        if free < size - have {
            tracing::warn!(%peer, %hash, size, have, free, "not enough space");
            ctx.state.skipped_for_space().await;
            return;
        }

        ctx.state.want(CatalogEntry { hash, size, nice }).await;
        if ctx.config.list_only {
            tracing::info!(%peer, %hash, size, nice, "listed");
            return;
        }
        tracing::debug!(%peer, %hash, offset = have, size, "requesting");
        ctx.send(Frame::Freq { hash, offset: have });
    }

    async fn on_freq(&mut self, hash: ContentHash, offset: u64) {
        let ctx = &self.ctx;
        let peer = &ctx.peer;
        let Some(entry) = ctx.state.our_info(&hash).await else {
            tracing::warn!(%peer, %hash, "request for content we did not advertise");
            return;
        };
        if !ctx.config.admits(entry.nice, &hash) {
            tracing::debug!(%peer, %hash, "request outside allow-list");
            return;
        }
        if offset > entry.size {
            tracing::warn!(%peer, %hash, offset, size = entry.size, "request beyond end of content");
            return;
        }
        tracing::debug!(%peer, %hash, offset, "queueing request");
        ctx.state
            .enqueue_freq(QueuedFreq {
                hash,
                offset,
                size: entry.size,
                nice: entry.nice,
            })
            .await;
    }

    async fn on_file(&mut self, hash: ContentHash, offset: u64, payload: &[u8]) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let peer = &ctx.peer;
        let Some(entry) = ctx.state.their_info(&hash).await else {
            tracing::debug!(%peer, %hash, offset, "chunk for content we did not request");
            return Ok(());
        };
        let end = offset.checked_add(payload.len() as u64);
        if end.map_or(true, |end| end > entry.size) {
            tracing::warn!(%peer, %hash, offset, len = payload.len(), size = entry.size, "chunk beyond advertised size");
            return Ok(());
        }
        ctx.state.add_rx_bytes(payload.len() as u64).await;

        let have = match self.write_chunk(&hash, offset, payload).await {
            Ok(have) => have,
            Err(e) => {
                tracing::error!(%peer, %hash, offset, "cannot write partial content, abandoning: {}", e);
                self.parts.remove(&hash);
                ctx.state.forget_their(&hash).await;
                return Ok(());
            }
        };
        tracing::trace!(%peer, %hash, offset, have, size = entry.size, "chunk written");

        if have == entry.size {
            self.complete(&entry).await?;
        }
        Ok(())
    }

    /// Write a chunk into the partial file, returning how many bytes it now has.
    async fn write_chunk(&mut self, hash: &ContentHash, offset: u64, payload: &[u8]) -> Result<u64> {
        if !self.parts.contains_key(hash) {
            let file = self.ctx.spool.open_part(&self.ctx.peer, hash).await?;
            let have = file.metadata().await?.len();
            let hasher = (!self.ctx.config.defer_checks).then(|| MthSeq::new_at(offset));
            self.parts.insert(*hash, Inbound { file, have, hasher });
        }
        let inbound = self
            .parts
            .get_mut(hash)
            .ok_or_else(|| SyncError::Frame(format!("no partial file for {}", hash)))?;

        inbound.file.seek(SeekFrom::Start(offset)).await?;
        inbound.file.write_all(payload).await?;
        inbound.have = inbound.have.max(offset.saturating_add(payload.len() as u64));

        let in_order = inbound.hasher.as_ref().map_or(false, |h| h.position() == offset);
        if in_order {
            if let Some(hasher) = inbound.hasher.as_mut() {
                hasher.write_all(payload)?;
            }
        } else if inbound.hasher.take().is_some() {
            tracing::debug!(peer = %self.ctx.peer, %hash, offset, "out of order chunk, checksum deferred");
        }
        Ok(inbound.have)
    }

    async fn complete(&mut self, entry: &CatalogEntry) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let peer = &ctx.peer;
        let hash = entry.hash;
        let Some(mut inbound) = self.parts.remove(&hash) else {
            return Ok(());
        };
        if let Err(e) = inbound.file.sync_all().await {
            tracing::error!(%peer, %hash, "cannot sync received content: {}", e);
            ctx.state.forget_their(&hash).await;
            return Ok(());
        }
        let hasher = inbound.hasher.take();
        drop(inbound);

        let part = ctx.spool.part_path(peer, &hash);
        let Some(mut hasher) = hasher else {
            match ctx.spool.mark_nock(peer, &hash).await {
                Ok(_) => {
                    tracing::info!(%peer, %hash, size = entry.size, "received, checksum deferred");
                    ctx.state.forget_their(&hash).await;
                    self.enqueue_check(hash).await;
                }
                Err(e) => {
                    tracing::error!(%peer, %hash, "cannot mark content for checking: {}", e);
                    ctx.state.forget_their(&hash).await;
                }
            }
            return Ok(());
        };

        let path = part.clone();
        let computed = tokio::task::spawn_blocking(move || -> relaycopy_core::Result<ContentHash> {
            if hasher.needs_prefix() {
                let file = std::fs::File::open(&path)?;
                hasher.preadd_from(std::io::BufReader::new(file))?;
            }
            hasher.sum()
        })
        .await?;
        let computed = match computed {
            Ok(computed) => computed,
            Err(e) => {
                tracing::error!(%peer, %hash, "cannot finish checksum: {}", e);
                ctx.state.forget_their(&hash).await;
                return Ok(());
            }
        };

        if computed != hash {
            tracing::error!(%peer, %hash, %computed, size = entry.size, "checksum mismatch, discarding");
            if let Err(e) = ctx.spool.discard(&part).await {
                tracing::warn!(%peer, %hash, "cannot remove corrupt content: {}", e);
            }
            ctx.state.forget_their(&hash).await;
            ctx.state.integrity_failure().await;
            return Ok(());
        }

        if let Err(e) = ctx.spool.commit(peer, &hash, &part).await {
            tracing::error!(%peer, %hash, "cannot commit received content: {}", e);
            ctx.state.forget_their(&hash).await;
            return Ok(());
        }
        tracing::info!(%peer, %hash, size = entry.size, "received");
        ctx.state.received(&hash).await;
        ctx.send(Frame::Done { hash });
        Ok(())
    }

    async fn on_done(&mut self, hash: ContentHash) {
        let ctx = &self.ctx;
        if !ctx.state.acknowledge(&hash).await {
            tracing::debug!(peer = %ctx.peer, %hash, "acknowledgement for content not on offer");
            return;
        }
        match ctx.spool.remove_tx(&ctx.peer, &hash).await {
            Ok(()) => tracing::info!(peer = %ctx.peer, %hash, "acknowledged, outbound copy removed"),
            Err(e) => tracing::warn!(peer = %ctx.peer, %hash, "cannot remove acknowledged content: {}", e),
        }
    }
}

/// Receiving task. Ends the session when it stops.
pub(crate) async fn run<R: ConnReader>(
    reader: RecordReader<R>,
    opener: Opener,
    receiver: Receiver,
    dead: Dead,
) -> Result<()> {
    let peer = receiver.ctx.peer;
    let result = receive(reader, opener, receiver, dead.clone()).await;
    match &result {
        Ok(()) => dead.kill(&peer, "connection closed"),
        Err(e) => {
            tracing::error!(%peer, "receive failed: {}", e);
            dead.kill(&peer, "receive failed");
        }
    }
    result
}

async fn receive<R: ConnReader>(
    mut reader: RecordReader<R>,
    mut opener: Opener,
    mut receiver: Receiver,
    mut dead: Dead,
) -> Result<()> {
    let ctx = Arc::clone(&receiver.ctx);
    loop {
        let record = tokio::select! {
            _ = dead.wait() => return Ok(()),
            record = reader.next(ctx.config.read_timeout) => record,
        };
        let record = match record {
            Ok(record) => record,
            Err(e) if e.is_retryable() => {
                if ctx.state.idle_for() >= ctx.config.online_deadline {
                    tracing::debug!(peer = %ctx.peer, "read timed out past the online deadline");
                    return Ok(());
                }
                continue;
            }
            Err(e) if e.is_hangup() => {
                tracing::debug!(peer = %ctx.peer, "peer closed the connection: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let frames = decode_body(opener.open(&record)?)?;
        ctx.state.touch_rx(frames.iter().any(Frame::is_substantive));
        for frame in frames {
            receiver.handle(frame).await?;
        }
        dead.throttle(ctx.config.rx_rate).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use relaycopy_core::{hash_bytes, NodeId};
    use relaycopy_spool::Spool;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use crate::checker::Checker;
    use crate::session::SessionConfig;

    struct Harness {
        _dir: TempDir,
        ctx: Arc<Ctx>,
        out: mpsc::UnboundedReceiver<Frame>,
        checker: Arc<Checker>,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).await.unwrap();
        let checker = Checker::start(1);
        let (out_tx, out) = mpsc::unbounded_channel();
        let (checks_tx, _) = mpsc::unbounded_channel();
        let ctx = Arc::new(Ctx::new(
            NodeId([7; 32]),
            spool,
            Arc::clone(&checker),
            SessionConfig::default(),
            out_tx,
            checks_tx,
        ));
        Harness {
            _dir: dir,
            ctx,
            out,
            checker,
        }
    }

    fn entry(hash: ContentHash, size: u64) -> CatalogEntry {
        CatalogEntry { hash, size, nice: 1 }
    }

    #[tokio::test]
    async fn test_chunk_with_overflowing_offset_is_dropped() {
        let h = harness().await;
        let hash = ContentHash([3; 32]);
        h.ctx.state.want(entry(hash, 1000)).await;
        let mut receiver = Receiver::new(Arc::clone(&h.ctx));

        receiver
            .handle(Frame::File {
                hash,
                offset: u64::MAX - 10,
                payload: Bytes::from(vec![1u8; 100]),
            })
            .await
            .unwrap();

        assert!(!h.ctx.spool.part_path(&h.ctx.peer, &hash).exists());
        assert_eq!(h.ctx.state.report().await.bytes_rx, 0);
        assert!(h.ctx.state.their_info(&hash).await.is_some());
        h.checker.stop().await;
    }

    #[tokio::test]
    async fn test_chunk_past_advertised_size_is_dropped() {
        let h = harness().await;
        let hash = ContentHash([3; 32]);
        h.ctx.state.want(entry(hash, 1000)).await;
        let mut receiver = Receiver::new(Arc::clone(&h.ctx));

        receiver
            .handle(Frame::File {
                hash,
                offset: 950,
                payload: Bytes::from(vec![1u8; 100]),
            })
            .await
            .unwrap();

        assert!(!h.ctx.spool.part_path(&h.ctx.peer, &hash).exists());
        h.checker.stop().await;
    }

    #[tokio::test]
    async fn test_last_chunk_commits_and_acknowledges() {
        let mut h = harness().await;
        let data = vec![5u8; 1000];
        let hash = hash_bytes(&data);
        h.ctx.state.want(entry(hash, 1000)).await;
        let mut receiver = Receiver::new(Arc::clone(&h.ctx));

        receiver
            .handle(Frame::File {
                hash,
                offset: 0,
                payload: Bytes::from(data),
            })
            .await
            .unwrap();

        assert!(h.ctx.spool.has_complete(&h.ctx.peer, &hash).await);
        assert_eq!(h.out.try_recv().unwrap(), Frame::Done { hash });
        let report = h.ctx.state.report().await;
        assert_eq!(report.received, vec![hash]);
        assert_eq!(report.bytes_rx, 1000);
        h.checker.stop().await;
    }

    #[tokio::test]
    async fn test_halt_clears_queued_requests() {
        let h = harness().await;
        let first = ContentHash([1; 32]);
        let second = ContentHash([2; 32]);
        h.ctx.state.advertise(entry(first, 10)).await;
        h.ctx.state.advertise(entry(second, 10)).await;
        let mut receiver = Receiver::new(Arc::clone(&h.ctx));

        receiver.handle(Frame::Freq { hash: first, offset: 0 }).await.unwrap();
        receiver.handle(Frame::Freq { hash: second, offset: 4 }).await.unwrap();
        assert_eq!(h.ctx.state.queue_len().await, 2);

        receiver.handle(Frame::Halt).await.unwrap();
        assert_eq!(h.ctx.state.queue_len().await, 0);
        assert!(h.ctx.state.front_freq().await.is_none());
        h.checker.stop().await;
    }

    #[tokio::test]
    async fn test_request_beyond_end_is_ignored() {
        let h = harness().await;
        let hash = ContentHash([1; 32]);
        h.ctx.state.advertise(entry(hash, 10)).await;
        let mut receiver = Receiver::new(Arc::clone(&h.ctx));

        receiver.handle(Frame::Freq { hash, offset: 11 }).await.unwrap();
        assert_eq!(h.ctx.state.queue_len().await, 0);
        h.checker.stop().await;
    }

    #[tokio::test]
    async fn test_repeated_done_counts_once() {
        let h = harness().await;
        let hash = ContentHash([1; 32]);
        h.ctx.state.advertise(entry(hash, 10)).await;
        let mut receiver = Receiver::new(Arc::clone(&h.ctx));

        receiver.handle(Frame::Done { hash }).await.unwrap();
        receiver.handle(Frame::Done { hash }).await.unwrap();
        assert_eq!(h.ctx.state.report().await.acknowledged, vec![hash]);
        h.checker.stop().await;
    }
}
