//! Outbound side of a session.
//!
//! Control frames are batched into as few messages as fit. When none are
//! waiting, one chunk of the most urgent requested file is sent. At most
//! one outbound file is open at a time.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use relaycopy_core::ContentHash;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use crate::checker::CheckOutcome;
use crate::conn::{ConnWriter, RecordWriter};
use crate::error::Result;
use crate::frames::{Frame, FILE_FRAME_OVERHEAD};
use crate::noise::{Sealer, MAX_TRANSPORT_PAYLOAD};
use crate::session::{Ctx, Dead};
use crate::state::QueuedFreq;

/// Largest content chunk carried by one `File` frame.
pub const MAX_CHUNK: usize = MAX_TRANSPORT_PAYLOAD - FILE_FRAME_OVERHEAD;

enum Wake {
    Dead,
    Frame(Frame),
    Check(CheckOutcome),
    Closed,
    Timer,
}

pub(crate) struct Sender<W> {
    ctx: Arc<Ctx>,
    writer: RecordWriter<W>,
    sealer: Sealer,
    out: mpsc::UnboundedReceiver<Frame>,
    checks: mpsc::UnboundedReceiver<CheckOutcome>,
    dead: Dead,
    pending: VecDeque<Frame>,
    open: Option<(ContentHash, tokio::fs::File)>,
}

impl<W: ConnWriter> Sender<W> {
    pub fn new(
        ctx: Arc<Ctx>,
        writer: RecordWriter<W>,
        sealer: Sealer,
        out: mpsc::UnboundedReceiver<Frame>,
        checks: mpsc::UnboundedReceiver<CheckOutcome>,
        dead: Dead,
    ) -> Self {
        Self {
            ctx,
            writer,
            sealer,
            out,
            checks,
            dead,
            pending: VecDeque::new(),
            open: None,
        }
    }

    /// Sending task. Ends the session when it stops.
    pub async fn run(mut self) -> Result<()> {
        let peer = self.ctx.peer;
        let result = match self.send_loop().await {
            Err(e) if e.is_hangup() => {
                tracing::debug!(%peer, "peer closed the connection: {}", e);
                self.dead.kill(&peer, "connection closed");
                Ok(())
            }
            other => other,
        };
        if let Err(e) = &result {
            tracing::error!(%peer, "send failed: {}", e);
            self.dead.kill(&peer, "send failed");
        }

        // Whatever is still queued is dropped with the session.
        self.out.close();
        let mut discarded = self.pending.len();
        while self.out.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(%peer, discarded, "dropping unsent frames");
        }
        self.open = None;
        if let Err(e) = self.writer.close().await {
            tracing::debug!(%peer, "closing connection: {}", e);
        }
        result
    }

    async fn send_loop(&mut self) -> Result<()> {
        loop {
            if self.dead.is_dead() {
                return Ok(());
            }
            while let Ok(frame) = self.out.try_recv() {
                self.pending.push_back(frame);
            }
            while let Ok(outcome) = self.checks.try_recv() {
                self.on_check(outcome).await;
            }

            if !self.pending.is_empty() {
                self.send_control().await?;
            } else if let Some(freq) = self.ctx.state.front_freq().await {
                self.serve(freq).await?;
            } else {
                self.open = None;
                match self.idle().await {
                    Wake::Dead | Wake::Closed => return Ok(()),
                    Wake::Frame(frame) => self.pending.push_back(frame),
                    Wake::Check(outcome) => self.on_check(outcome).await,
                    Wake::Timer => {}
                }
                continue;
            }
            self.dead.throttle(self.ctx.config.tx_rate).await;
        }
    }

    async fn idle(&mut self) -> Wake {
        let mut dead = self.dead.clone();
        tokio::select! {
            _ = dead.wait() => Wake::Dead,
            frame = self.out.recv() => frame.map_or(Wake::Closed, Wake::Frame),
            outcome = self.checks.recv() => outcome.map_or(Wake::Closed, Wake::Check),
            _ = self.ctx.state.queued.notified() => Wake::Timer,
            _ = tokio::time::sleep(self.ctx.config.tick) => Wake::Timer,
        }
    }

    async fn on_check(&mut self, outcome: CheckOutcome) {
        let state = &self.ctx.state;
        match outcome {
            CheckOutcome::Verified(hash) => {
                state.received(&hash).await;
                self.pending.push_back(Frame::Done { hash });
            }
            CheckOutcome::Mismatch(hash) => {
                state.forget_their(&hash).await;
                state.integrity_failure().await;
            }
        }
    }

    async fn send_control(&mut self) -> Result<()> {
        let mut body = BytesMut::new();
        let mut substantive = false;
        while let Some(frame) = self.pending.front() {
            if !body.is_empty() && body.len() + frame.encoded_len() > MAX_TRANSPORT_PAYLOAD {
                break;
            }
            substantive |= frame.is_substantive();
            frame.encode(&mut body);
            self.pending.pop_front();
        }
        tracing::trace!(peer = %self.ctx.peer, len = body.len(), "sending control frames");
        self.transmit(&body, substantive).await
    }

    async fn serve(&mut self, freq: QueuedFreq) -> Result<()> {
        let peer = self.ctx.peer;
        let want = (freq.size - freq.offset).min(MAX_CHUNK as u64) as usize;
        let payload = match self.read_chunk(&freq.hash, freq.offset, want).await {
            Ok(payload) if payload.len() == want => payload,
            Ok(payload) => {
                tracing::warn!(%peer, hash = %freq.hash, offset = freq.offset, want, got = payload.len(), "outbound content shorter than advertised, dropping request");
                self.ctx.state.drop_freq(&freq.hash).await;
                self.open = None;
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(%peer, hash = %freq.hash, offset = freq.offset, "cannot read outbound content, dropping request: {}", e);
                self.ctx.state.drop_freq(&freq.hash).await;
                self.open = None;
                return Ok(());
            }
        };

        let frame = Frame::File {
            hash: freq.hash,
            offset: freq.offset,
            payload,
        };
        let mut body = BytesMut::with_capacity(frame.encoded_len());
        frame.encode(&mut body);
        self.transmit(&body, true).await?;
        tracing::trace!(%peer, hash = %freq.hash, offset = freq.offset, len = want, "chunk sent");

        self.ctx.state.advance_freq(&freq.hash, freq.offset, want as u64).await;
        if freq.offset + want as u64 >= freq.size {
            tracing::info!(%peer, hash = %freq.hash, size = freq.size, "sent");
            self.open = None;
        }
        Ok(())
    }

    async fn read_chunk(&mut self, hash: &ContentHash, offset: u64, want: usize) -> Result<Bytes> {
        if self.open.as_ref().map(|(h, _)| h) != Some(hash) {
            let path = self.ctx.spool.tx_path(&self.ctx.peer, hash);
            self.open = Some((*hash, tokio::fs::File::open(path).await?));
        }
        let Some((_, file)) = self.open.as_mut() else {
            return Ok(Bytes::new());
        };
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn transmit(&mut self, body: &[u8], substantive: bool) -> Result<()> {
        let message = self.sealer.seal(body)?;
        let dead = &self.dead;
        let state = &self.ctx.state;
        let deadline = self.ctx.config.online_deadline;
        self.writer
            .send(&message, self.ctx.config.write_timeout, || {
                !dead.is_dead() && state.idle_for() < deadline
            })
            .await?;
        state.touch_tx(substantive);
        Ok(())
    }
}
