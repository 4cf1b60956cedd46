//! Session driver.
//!
//! A session handshakes, then runs three tasks until a shared "dead" signal
//! fires:
//!
//! - the sender drains queued control frames and serves one `Freq` at a time
//! - the receiver decrypts and dispatches inbound frames
//! - the ticker enforces deadlines, sends pings and refreshes our catalog

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use relaycopy_core::{base32_encode, ContentHash, NodeId, NodeOur, NodeTheir};
use relaycopy_spool::{CatalogEntry, Direction, LockKind, Spool, SpoolLock};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::checker::{CheckOutcome, Checker};
use crate::conn::{Conn, ConnReader, ConnWriter, RecordReader, RecordWriter, MAX_SP_SIZE};
use crate::error::{Result, SyncError};
use crate::frames::{pad_with_halts, Frame};
use crate::noise::{Initiator, Responder, Transport, MSG1_OVERHEAD, MSG2_OVERHEAD};
use crate::rx::{self, Receiver};
use crate::state::{SessionReport, SessionState};
use crate::tx::Sender;

/// Session behaviour.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Only exchange items at least this urgent (nice at or below).
    pub nice: u8,
    /// End the session after this long without substantive traffic.
    pub online_deadline: Duration,
    /// Hard cap on session length.
    pub max_online_time: Option<Duration>,
    /// Send a `Ping` after this long without sending anything.
    pub ping_interval: Duration,
    /// Ticker period; also bounds how long the sender sleeps when idle.
    pub tick: Duration,
    /// Inbound messages processed per second, 0 for unlimited.
    pub rx_rate: u32,
    /// Outbound messages sent per second, 0 for unlimited.
    pub tx_rate: u32,
    /// Record the peer's catalog without requesting anything.
    pub list_only: bool,
    /// Never hash inline; every completed file goes through the checker.
    pub defer_checks: bool,
    /// Restrict exchanged items to these hashes.
    pub only: Option<HashSet<ContentHash>>,
    /// Bound on a single transport read.
    pub read_timeout: Duration,
    /// Bound on a single transport write.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            nice: 255,
            online_deadline: Duration::from_secs(10),
            max_online_time: None,
            ping_interval: Duration::from_secs(5),
            tick: Duration::from_secs(1),
            rx_rate: 0,
            tx_rate: 0,
            list_only: false,
            defer_checks: false,
            only: None,
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn with_nice(mut self, nice: u8) -> Self {
        self.nice = nice;
        self
    }

    pub fn with_online_deadline(mut self, deadline: Duration) -> Self {
        self.online_deadline = deadline;
        self
    }

    pub fn with_max_online_time(mut self, max: Duration) -> Self {
        self.max_online_time = Some(max);
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_rates(mut self, rx_rate: u32, tx_rate: u32) -> Self {
        self.rx_rate = rx_rate;
        self.tx_rate = tx_rate;
        self
    }

    pub fn with_list_only(mut self, list_only: bool) -> Self {
        self.list_only = list_only;
        self
    }

    pub fn with_defer_checks(mut self, defer: bool) -> Self {
        self.defer_checks = defer;
        self
    }

    pub fn with_only(mut self, hashes: impl IntoIterator<Item = ContentHash>) -> Self {
        self.only = Some(hashes.into_iter().collect());
        self
    }

    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    /// Whether an item of this urgency and hash takes part in the session.
    pub fn admits(&self, nice: u8, hash: &ContentHash) -> bool {
        nice <= self.nice && self.only.as_ref().map_or(true, |only| only.contains(hash))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared task context
// ─────────────────────────────────────────────────────────────────────────────

/// Session teardown signal. Every task watches it at each suspension point.
#[derive(Clone)]
pub(crate) struct Dead {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Dead {
    fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn kill(&self, peer: &NodeId, reason: &str) {
        if !self.tx.send_replace(true) {
            tracing::info!(%peer, reason, "session ending");
        }
    }

    pub fn is_dead(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&mut self) {
        // The sender lives as long as any clone of us.
        let _ = self.rx.wait_for(|dead| *dead).await;
    }

    /// Sleep for one rate-limit interval, waking early if the session dies.
    pub async fn throttle(&mut self, rate: u32) {
        if rate == 0 {
            return;
        }
        let pause = Duration::from_secs(1) / rate;
        tokio::select! {
            _ = self.wait() => {}
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// What every session task can reach.
pub(crate) struct Ctx {
    pub peer: NodeId,
    pub spool: Spool,
    pub checker: Arc<Checker>,
    pub config: SessionConfig,
    pub state: SessionState,
    out: mpsc::UnboundedSender<Frame>,
    pub checks: mpsc::UnboundedSender<CheckOutcome>,
}

impl Ctx {
    pub fn new(
        peer: NodeId,
        spool: Spool,
        checker: Arc<Checker>,
        config: SessionConfig,
        out: mpsc::UnboundedSender<Frame>,
        checks: mpsc::UnboundedSender<CheckOutcome>,
    ) -> Self {
        Self {
            peer,
            spool,
            checker,
            config,
            state: SessionState::new(peer),
            out,
            checks,
        }
    }

    /// Queue a control frame for the sender.
    pub fn send(&self, frame: Frame) {
        // Fails only once the sender has exited.
        let _ = self.out.send(frame);
    }
}

fn info_frame(entry: &CatalogEntry) -> Frame {
    Frame::Info {
        nice: entry.nice,
        size: entry.size,
        hash: entry.hash,
    }
}

/// Pack as many `Info`s as fit into a handshake payload of exactly `max`
/// bytes, padding with `Halt`s. The rest are returned for the sender.
fn opening_payload(entries: &[CatalogEntry], max: usize) -> (BytesMut, Vec<Frame>) {
    let mut buf = BytesMut::with_capacity(max);
    let mut rest = Vec::new();
    for entry in entries {
        let frame = info_frame(entry);
        if rest.is_empty() && buf.len() + frame.encoded_len() <= max {
            frame.encode(&mut buf);
        } else {
            rest.push(frame);
        }
    }
    pad_with_halts(&mut buf, max);
    (buf, rest)
}

/// Decode a message body, collapsing runs of padding `Halt`s.
pub(crate) fn decode_body(body: Vec<u8>) -> Result<Vec<Frame>> {
    let mut frames = Frame::decode_all(Bytes::from(body))?;
    frames.dedup_by(|a, b| *a == Frame::Halt && *b == Frame::Halt);
    Ok(frames)
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Everything needed to run sessions with known peers.
pub struct Session {
    our: Arc<NodeOur>,
    peers: Arc<HashMap<NodeId, NodeTheir>>,
    spool: Spool,
    checker: Arc<Checker>,
    config: SessionConfig,
}

struct Opened<R, W> {
    peer: NodeId,
    reader: RecordReader<R>,
    writer: RecordWriter<W>,
    transport: Transport,
    catalog: Vec<CatalogEntry>,
    rest: Vec<Frame>,
    their_opening: Vec<u8>,
    _locks: (SpoolLock, SpoolLock),
}

impl Session {
    pub fn new(
        our: Arc<NodeOur>,
        peers: Arc<HashMap<NodeId, NodeTheir>>,
        spool: Spool,
        checker: Arc<Checker>,
        config: SessionConfig,
    ) -> Self {
        Self {
            our,
            peers,
            spool,
            checker,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Call `peer` over `conn`.
    pub async fn initiate<C: Conn>(&self, conn: C, peer: &NodeId) -> Result<SessionReport> {
        let their = self
            .peers
            .get(peer)
            .ok_or_else(|| SyncError::UnknownPeer(peer.to_string()))?;
        let locks = self.lock(peer)?;
        let (r, w) = conn.split();
        let mut reader = RecordReader::new(r);
        let mut writer = RecordWriter::new(w);
        let deadline = Instant::now() + self.config.online_deadline;

        let catalog = self.catalog(peer).await?;
        let (payload, rest) = opening_payload(&catalog, MAX_SP_SIZE - MSG1_OVERHEAD);
        let mut handshake = Initiator::new(&self.our.noise_private(), &their.noise_pub)?;
        let msg1 = handshake.write_first(&payload)?;
        writer
            .send(&msg1, self.config.write_timeout, || Instant::now() < deadline)
            .await?;

        let msg2 = self.recv_handshake(&mut reader, deadline).await?;
        let (transport, their_opening) = handshake.read_reply(&msg2)?;
        tracing::info!(%peer, advertised = catalog.len(), "handshake complete, we called");

        self.run(Opened {
            peer: *peer,
            reader,
            writer,
            transport,
            catalog,
            rest,
            their_opening,
            _locks: locks,
        })
        .await
    }

    /// Answer a call over `conn`; the peer is identified by the handshake.
    pub async fn accept<C: Conn>(&self, conn: C) -> Result<SessionReport> {
        let (r, w) = conn.split();
        let mut reader = RecordReader::new(r);
        let mut writer = RecordWriter::new(w);
        let deadline = Instant::now() + self.config.online_deadline;

        let msg1 = self.recv_handshake(&mut reader, deadline).await?;
        let mut handshake = Responder::new(&self.our.noise_private())?;
        let (their_opening, remote) = handshake.read_first(&msg1)?;

        let Some(peer) = self
            .peers
            .values()
            .find(|p| p.noise_pub == remote)
            .map(|p| p.id)
        else {
            let key = base32_encode(&remote);
            tracing::error!(key = %key, "unknown peer static key, dropping connection");
            if let Err(e) = writer.close().await {
                tracing::debug!("close after unknown peer: {}", e);
            }
            return Err(SyncError::UnknownPeer(key));
        };

        let locks = self.lock(&peer)?;
        let catalog = self.catalog(&peer).await?;
        let (payload, rest) = opening_payload(&catalog, MAX_SP_SIZE - MSG2_OVERHEAD);
        let (transport, msg2) = handshake.write_reply(&payload)?;
        writer
            .send(&msg2, self.config.write_timeout, || Instant::now() < deadline)
            .await?;
        tracing::info!(%peer, advertised = catalog.len(), "handshake complete, we answered");

        self.run(Opened {
            peer,
            reader,
            writer,
            transport,
            catalog,
            rest,
            their_opening,
            _locks: locks,
        })
        .await
    }

    fn lock(&self, peer: &NodeId) -> Result<(SpoolLock, SpoolLock)> {
        let tx = self.spool.lock(peer, LockKind::Tx)?;
        let rx = self.spool.lock(peer, LockKind::Rx)?;
        Ok((tx, rx))
    }

    async fn catalog(&self, peer: &NodeId) -> Result<Vec<CatalogEntry>> {
        our_catalog(&self.spool, peer, &self.config).await
    }

    async fn recv_handshake<R: ConnReader>(
        &self,
        reader: &mut RecordReader<R>,
        deadline: Instant,
    ) -> Result<Vec<u8>> {
        loop {
            match reader.next(self.config.read_timeout).await {
                Ok(record) => return Ok(record.to_vec()),
                Err(e) if e.is_retryable() && Instant::now() < deadline => continue,
                Err(e) if e.is_retryable() => {
                    return Err(SyncError::Timeout("waiting for handshake".into()))
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run<R, W>(&self, opened: Opened<R, W>) -> Result<SessionReport>
    where
        R: ConnReader + 'static,
        W: ConnWriter + 'static,
    {
        let Opened {
            peer,
            reader,
            writer,
            transport,
            catalog,
            rest,
            their_opening,
            _locks,
        } = opened;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (checks_tx, checks_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(Ctx::new(
            peer,
            self.spool.clone(),
            Arc::clone(&self.checker),
            self.config.clone(),
            out_tx,
            checks_tx,
        ));
        for entry in &catalog {
            ctx.state.advertise(*entry).await;
        }
        for frame in rest {
            ctx.send(frame);
        }

        let dead = Dead::new();
        let (sealer, opener) = transport.split();
        let mut receiver = Receiver::new(Arc::clone(&ctx));
        receiver.recover_pending().await;

        let opening = decode_body(their_opening)?;
        ctx.state.touch_rx(true);
        for frame in opening {
            receiver.handle(frame).await?;
        }

        let sender = Sender::new(Arc::clone(&ctx), writer, sealer, out_rx, checks_rx, dead.clone());
        let tasks = [
            tokio::spawn(sender.run()),
            tokio::spawn(rx::run(reader, opener, receiver, dead.clone())),
            tokio::spawn(tick(Arc::clone(&ctx), dead.clone())),
        ];

        let mut failure = None;
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(e.into());
                }
            }
        }

        let report = ctx.state.report().await;
        tracing::info!(
            %peer,
            bytes_rx = report.bytes_rx,
            bytes_tx = report.bytes_tx,
            received = report.received.len(),
            acknowledged = report.acknowledged.len(),
            skipped_for_space = report.skipped_for_space,
            integrity_failures = report.integrity_failures,
            duration_ms = report.duration.as_millis() as u64,
            "session finished"
        );
        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

/// Outbound items this session may advertise, most urgent first.
pub(crate) async fn our_catalog(
    spool: &Spool,
    peer: &NodeId,
    config: &SessionConfig,
) -> Result<Vec<CatalogEntry>> {
    Ok(spool
        .catalog(peer, Direction::Tx)
        .await?
        .into_iter()
        .filter(|e| config.admits(e.nice, &e.hash))
        .collect())
}

/// Deadlines, keepalives and catalog refresh.
async fn tick(ctx: Arc<Ctx>, mut dead: Dead) -> Result<()> {
    let config = &ctx.config;
    let mut interval = tokio::time::interval(config.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = dead.wait() => return Ok(()),
            _ = interval.tick() => {}
        }

        if let Some(max) = config.max_online_time {
            if ctx.state.online_for() >= max {
                dead.kill(&ctx.peer, "maximum online time reached");
                return Ok(());
            }
        }
        if ctx.state.idle_for() >= config.online_deadline {
            dead.kill(&ctx.peer, "online deadline elapsed");
            return Ok(());
        }
        if ctx.state.tx_silent_for() >= config.ping_interval {
            ctx.send(Frame::Ping);
        }

        match our_catalog(&ctx.spool, &ctx.peer, config).await {
            Ok(entries) => {
                for entry in entries {
                    if ctx.state.advertise(entry).await {
                        tracing::debug!(peer = %ctx.peer, hash = %entry.hash, nice = entry.nice, "advertising new content");
                        ctx.send(info_frame(&entry));
                    }
                }
            }
            Err(e) => tracing::warn!(peer = %ctx.peer, "catalog refresh failed: {}", e),
        }
    }
}
