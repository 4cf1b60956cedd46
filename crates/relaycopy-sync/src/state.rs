//! Shared per-session state.
//!
//! The guards live next to, not inside, the data: catalogs and the request
//! queue sit behind an async mutex, activity clocks behind a plain mutex so
//! synchronous retry predicates can read them.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use relaycopy_core::{ContentHash, NodeId};
use relaycopy_spool::CatalogEntry;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// A `Freq` waiting to be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedFreq {
    pub hash: ContentHash,
    pub offset: u64,
    pub size: u64,
    pub nice: u8,
}

/// Counters and outcomes of one session.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    /// Peer the session ran with.
    pub peer: Option<NodeId>,
    /// Content bytes received in `File` frames.
    pub bytes_rx: u64,
    /// Content bytes sent in `File` frames.
    pub bytes_tx: u64,
    /// Hashes received and verified.
    pub received: Vec<ContentHash>,
    /// Outbound hashes the peer acknowledged.
    pub acknowledged: Vec<ContentHash>,
    /// `Info`s skipped for lack of space.
    pub skipped_for_space: usize,
    /// Received content whose root did not match.
    pub integrity_failures: usize,
    /// Wall time the session was active.
    pub duration: Duration,
}

#[derive(Default)]
struct Catalogs {
    /// What we advertised to the peer.
    ours: HashMap<ContentHash, CatalogEntry>,
    /// What the peer advertised and we decided to fetch.
    theirs: HashMap<ContentHash, CatalogEntry>,
    /// Requests from the peer, most urgent first.
    queue: Vec<QueuedFreq>,
    report: SessionReport,
}

struct Clocks {
    started: Instant,
    rx_substantive: Instant,
    tx_substantive: Instant,
    tx_any: Instant,
}

/// State shared by the sender, receiver and ticker tasks.
pub struct SessionState {
    catalogs: Mutex<Catalogs>,
    clocks: StdMutex<Clocks>,
    /// Woken when the request queue gains work.
    pub(crate) queued: Notify,
}

impl SessionState {
    pub fn new(peer: NodeId) -> Self {
        let now = Instant::now();
        Self {
            catalogs: Mutex::new(Catalogs {
                report: SessionReport {
                    peer: Some(peer),
                    ..Default::default()
                },
                ..Default::default()
            }),
            clocks: StdMutex::new(Clocks {
                started: now,
                rx_substantive: now,
                tx_substantive: now,
                tx_any: now,
            }),
            queued: Notify::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Catalogs
    // ─────────────────────────────────────────────────────────────────────────

    /// Record an item we advertise. Returns false if it was already known.
    pub async fn advertise(&self, entry: CatalogEntry) -> bool {
        self.catalogs.lock().await.ours.insert(entry.hash, entry).is_none()
    }

    pub async fn our_info(&self, hash: &ContentHash) -> Option<CatalogEntry> {
        self.catalogs.lock().await.ours.get(hash).copied()
    }

    /// Forget an item the peer acknowledged, along with any request for it.
    /// Returns false if the item was not on offer, e.g. a repeated `Done`.
    pub async fn acknowledge(&self, hash: &ContentHash) -> bool {
        let mut c = self.catalogs.lock().await;
        c.queue.retain(|q| q.hash != *hash);
        let known = c.ours.remove(hash).is_some();
        if known {
            c.report.acknowledged.push(*hash);
        }
        known
    }

    pub async fn want(&self, entry: CatalogEntry) {
        self.catalogs.lock().await.theirs.insert(entry.hash, entry);
    }

    pub async fn their_info(&self, hash: &ContentHash) -> Option<CatalogEntry> {
        self.catalogs.lock().await.theirs.get(hash).copied()
    }

    /// Stop tracking an inbound item.
    pub async fn forget_their(&self, hash: &ContentHash) {
        self.catalogs.lock().await.theirs.remove(hash);
    }

    /// Drop an inbound item and count it as received.
    pub async fn received(&self, hash: &ContentHash) {
        let mut c = self.catalogs.lock().await;
        c.theirs.remove(hash);
        c.report.received.push(*hash);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Request queue
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue a request after every entry of equal or higher urgency, so equal
    /// nice values are served in arrival order. A repeated request for the
    /// same hash replaces the earlier one.
    pub async fn enqueue_freq(&self, freq: QueuedFreq) {
        {
            let mut c = self.catalogs.lock().await;
            c.queue.retain(|q| q.hash != freq.hash);
            let at = c.queue.partition_point(|q| q.nice <= freq.nice);
            c.queue.insert(at, freq);
        }
        self.queued.notify_one();
    }

    /// The request to serve next.
    pub async fn front_freq(&self) -> Option<QueuedFreq> {
        self.catalogs.lock().await.queue.first().copied()
    }

    /// Advance a request served from `from` by `sent` bytes; finished
    /// requests leave the queue. A request replaced meanwhile is untouched.
    pub async fn advance_freq(&self, hash: &ContentHash, from: u64, sent: u64) {
        let mut c = self.catalogs.lock().await;
        if let Some(pos) = c.queue.iter().position(|q| q.hash == *hash && q.offset == from) {
            let q = &mut c.queue[pos];
            q.offset += sent;
            if q.offset >= q.size {
                c.queue.remove(pos);
            }
        }
        c.report.bytes_tx += sent;
    }

    pub async fn drop_freq(&self, hash: &ContentHash) {
        self.catalogs.lock().await.queue.retain(|q| q.hash != *hash);
    }

    /// `Halt`: forget everything queued for the peer.
    pub async fn halt(&self) {
        self.catalogs.lock().await.queue.clear();
    }

    pub async fn queue_len(&self) -> usize {
        self.catalogs.lock().await.queue.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Report
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn add_rx_bytes(&self, n: u64) {
        self.catalogs.lock().await.report.bytes_rx += n;
    }

    pub async fn skipped_for_space(&self) {
        self.catalogs.lock().await.report.skipped_for_space += 1;
    }

    pub async fn integrity_failure(&self) {
        self.catalogs.lock().await.report.integrity_failures += 1;
    }

    pub async fn report(&self) -> SessionReport {
        let mut report = self.catalogs.lock().await.report.clone();
        report.duration = self.clocks().started.elapsed();
        report
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Clocks
    // ─────────────────────────────────────────────────────────────────────────

    fn clocks(&self) -> std::sync::MutexGuard<'_, Clocks> {
        // A poisoned guard still holds valid instants.
        self.clocks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn touch_rx(&self, substantive: bool) {
        if substantive {
            self.clocks().rx_substantive = Instant::now();
        }
    }

    pub fn touch_tx(&self, substantive: bool) {
        let now = Instant::now();
        let mut c = self.clocks();
        c.tx_any = now;
        if substantive {
            c.tx_substantive = now;
        }
    }

    /// Time since substantive traffic in either direction.
    pub fn idle_for(&self) -> Duration {
        let c = self.clocks();
        c.rx_substantive.max(c.tx_substantive).elapsed()
    }

    /// Time since we last sent anything.
    pub fn tx_silent_for(&self) -> Duration {
        self.clocks().tx_any.elapsed()
    }

    pub fn online_for(&self) -> Duration {
        self.clocks().started.elapsed()
    }
}
