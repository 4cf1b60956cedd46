//! Background checksum pool.
//!
//! Files whose hash could not be computed inline (a transfer resumed out of
//! order, or a session configured to defer checks) are renamed to `.nock`
//! and handed here. A worker hashes the file and either commits it under
//! its final name or discards it, then tells the owning session.
//!
//! One `Checker` is shared by every session of a process. It is started and
//! stopped explicitly.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use relaycopy_core::{hash_reader, ContentHash, NodeId};
use relaycopy_spool::Spool;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::error::Result;

/// Result of checking one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Root matched; the file is now under its final name.
    Verified(ContentHash),
    /// Root did not match; the file was removed.
    Mismatch(ContentHash),
}

/// One file to check.
pub struct CheckJob {
    pub spool: Spool,
    pub peer: NodeId,
    pub hash: ContentHash,
    /// Where to report the outcome, if anyone is listening.
    pub reply: Option<mpsc::UnboundedSender<CheckOutcome>>,
}

type InFlight = Arc<StdMutex<HashSet<(NodeId, ContentHash)>>>;

/// Shared checksum worker pool.
pub struct Checker {
    jobs: Mutex<Option<mpsc::UnboundedSender<CheckJob>>>,
    in_flight: InFlight,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Checker {
    /// Start a pool running at most `workers` checks at once.
    pub fn start(workers: usize) -> Arc<Self> {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight: InFlight = Arc::default();
        let dispatcher = tokio::spawn(dispatch(rx, workers, Arc::clone(&in_flight)));
        tracing::debug!(workers, "checker started");
        Arc::new(Self {
            jobs: Mutex::new(Some(tx)),
            in_flight,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Queue a check. Returns false if the same file is already being
    /// checked or the pool is stopped.
    pub async fn enqueue(&self, job: CheckJob) -> bool {
        let key = (job.peer, job.hash);
        {
            let mut in_flight = lock(&self.in_flight);
            if !in_flight.insert(key) {
                tracing::trace!(peer = %job.peer, hash = %job.hash, "check already queued");
                return false;
            }
        }
        let jobs = self.jobs.lock().await;
        match jobs.as_ref().map(|tx| tx.send(job)) {
            Some(Ok(())) => true,
            _ => {
                lock(&self.in_flight).remove(&key);
                false
            }
        }
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn stop(&self) {
        self.jobs.lock().await.take();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!("checker dispatcher failed: {}", e);
            }
        }
        tracing::debug!("checker stopped");
    }
}

fn lock(in_flight: &InFlight) -> std::sync::MutexGuard<'_, HashSet<(NodeId, ContentHash)>> {
    in_flight.lock().unwrap_or_else(|e| e.into_inner())
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<CheckJob>, workers: usize, in_flight: InFlight) {
    let permits = Arc::new(Semaphore::new(workers));
    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let in_flight = Arc::clone(&in_flight);
        tokio::spawn(async move {
            let key = (job.peer, job.hash);
            match check(&job).await {
                Ok(outcome) => {
                    if let Some(reply) = &job.reply {
                        // The session may already be gone.
                        let _ = reply.send(outcome);
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %job.peer, hash = %job.hash, "checksum failed: {}", e);
                }
            }
            lock(&in_flight).remove(&key);
            drop(permit);
        });
    }
    // Wait for running checks.
    let _ = permits.acquire_many(workers as u32).await;
}

async fn check(job: &CheckJob) -> Result<CheckOutcome> {
    let nock = job.spool.nock_path(&job.peer, &job.hash);
    let path = nock.clone();
    let computed = tokio::task::spawn_blocking(move || -> relaycopy_core::Result<ContentHash> {
        let file = std::fs::File::open(&path)?;
        hash_reader(std::io::BufReader::new(file))
    })
    .await??;

    if computed == job.hash {
        job.spool.commit(&job.peer, &job.hash, &nock).await?;
        tracing::info!(peer = %job.peer, hash = %job.hash, "checksum verified");
        Ok(CheckOutcome::Verified(job.hash))
    } else {
        tracing::error!(
            peer = %job.peer,
            hash = %job.hash,
            computed = %computed,
            "checksum mismatch, discarding"
        );
        job.spool.discard(&nock).await?;
        Ok(CheckOutcome::Mismatch(job.hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycopy_core::hash_bytes;
    use tempfile::TempDir;

    async fn nock(spool: &Spool, peer: &NodeId, hash: &ContentHash, data: &[u8]) {
        tokio::fs::create_dir_all(spool.rx_dir(peer)).await.unwrap();
        tokio::fs::write(spool.nock_path(peer, hash), data).await.unwrap();
    }

    #[tokio::test]
    async fn test_verified_file_is_committed() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).await.unwrap();
        let peer = NodeId([1; 32]);
        let data = vec![42u8; 300_000];
        let hash = hash_bytes(&data);
        nock(&spool, &peer, &hash, &data).await;

        let checker = Checker::start(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(
            checker
                .enqueue(CheckJob {
                    spool: spool.clone(),
                    peer,
                    hash,
                    reply: Some(tx),
                })
                .await
        );

        assert_eq!(rx.recv().await, Some(CheckOutcome::Verified(hash)));
        assert!(spool.has_complete(&peer, &hash).await);
        assert!(!spool.has_nock(&peer, &hash).await);
        checker.stop().await;
    }

    #[tokio::test]
    async fn test_mismatch_is_discarded() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).await.unwrap();
        let peer = NodeId([1; 32]);
        let hash = hash_bytes(b"expected");
        nock(&spool, &peer, &hash, b"corrupted").await;

        let checker = Checker::start(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        checker
            .enqueue(CheckJob {
                spool: spool.clone(),
                peer,
                hash,
                reply: Some(tx),
            })
            .await;

        assert_eq!(rx.recv().await, Some(CheckOutcome::Mismatch(hash)));
        assert!(!spool.has_complete(&peer, &hash).await);
        assert!(!spool.has_nock(&peer, &hash).await);
        checker.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_checker_refuses_jobs() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).await.unwrap();
        let checker = Checker::start(1);
        checker.stop().await;
        assert!(
            !checker
                .enqueue(CheckJob {
                    spool,
                    peer: NodeId([1; 32]),
                    hash: ContentHash([2; 32]),
                    reply: None,
                })
                .await
        );
    }

    #[tokio::test]
    async fn test_stop_waits_for_queued_checks() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).await.unwrap();
        let peer = NodeId([1; 32]);
        let checker = Checker::start(1);

        let mut hashes = Vec::new();
        for i in 0..4u8 {
            let data = vec![i; 1000];
            let hash = hash_bytes(&data);
            nock(&spool, &peer, &hash, &data).await;
            checker
                .enqueue(CheckJob {
                    spool: spool.clone(),
                    peer,
                    hash,
                    reply: None,
                })
                .await;
            hashes.push(hash);
        }
        checker.stop().await;
        for hash in hashes {
            assert!(spool.has_complete(&peer, &hash).await);
        }
    }
}
