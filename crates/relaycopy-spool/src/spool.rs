//! Filesystem spool.
//!
//! Layout under the spool root, per peer:
//!
//! ```text
//! <peer>/tx/<hash>          outbound content, named by its Merkle root
//! <peer>/rx/<hash>.part     inbound content still arriving
//! <peer>/rx/<hash>.nock     complete, waiting for a checksum
//! <peer>/rx/<hash>          verified inbound content
//! <peer>/rx/seen/<hash>     already processed, never fetch again
//! ```
//!
//! Names are unpadded base32. Only verified content ever appears under its
//! final name: it is renamed into place and the directory is fsynced.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use relaycopy_core::{ContentHash, MthSeq, NodeId};
use relaycopy_packet::EncryptedPacket;
use tokio::io::AsyncReadExt;

use crate::error::{Result, SpoolError};
use crate::lock::{LockKind, SpoolLock};

/// Suffix of partially received files.
pub const PART_SUFFIX: &str = ".part";

/// Suffix of received files awaiting checksum confirmation.
pub const NOCK_SUFFIX: &str = ".nock";

const SEEN_DIR: &str = "seen";
const TMP_PREFIX: &str = ".tmp-";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Which side of a peer's spool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Tx,
    Rx,
}

/// One spooled item as advertised in a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub hash: ContentHash,
    pub size: u64,
    pub nice: u8,
}

/// Outcome of [`Spool::store_tx`].
#[derive(Debug, Clone)]
pub struct StoredTx<T> {
    pub hash: ContentHash,
    pub size: u64,
    pub value: T,
}

/// Writer handed to [`Spool::store_tx`] callbacks: bytes go to a temporary
/// file and through a Merkle hasher at once.
pub struct TxWriter {
    file: std::fs::File,
    mth: MthSeq,
    written: u64,
}

impl Write for TxWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.file.write(data)?;
        self.mth.write_all(&data[..n])?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Per-peer spool rooted at a directory.
#[derive(Debug, Clone)]
pub struct Spool {
    root: PathBuf,
    capacity: Option<u64>,
}

impl Spool {
    /// Open (creating if needed) a spool at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            capacity: None,
        })
    }

    /// Report `bytes` as free space instead of asking the filesystem.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Spool root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Paths
    // ─────────────────────────────────────────────────────────────────────────

    fn peer_dir(&self, peer: &NodeId) -> PathBuf {
        self.root.join(peer.to_base32())
    }

    /// Outbound directory of a peer.
    pub fn tx_dir(&self, peer: &NodeId) -> PathBuf {
        self.peer_dir(peer).join("tx")
    }

    /// Inbound directory of a peer.
    pub fn rx_dir(&self, peer: &NodeId) -> PathBuf {
        self.peer_dir(peer).join("rx")
    }

    fn seen_dir(&self, peer: &NodeId) -> PathBuf {
        self.rx_dir(peer).join(SEEN_DIR)
    }

    pub fn tx_path(&self, peer: &NodeId, hash: &ContentHash) -> PathBuf {
        self.tx_dir(peer).join(hash.to_base32())
    }

    pub fn rx_path(&self, peer: &NodeId, hash: &ContentHash) -> PathBuf {
        self.rx_dir(peer).join(hash.to_base32())
    }

    pub fn part_path(&self, peer: &NodeId, hash: &ContentHash) -> PathBuf {
        self.rx_dir(peer).join(format!("{}{}", hash.to_base32(), PART_SUFFIX))
    }

    pub fn nock_path(&self, peer: &NodeId, hash: &ContentHash) -> PathBuf {
        self.rx_dir(peer).join(format!("{}{}", hash.to_base32(), NOCK_SUFFIX))
    }

    fn seen_path(&self, peer: &NodeId, hash: &ContentHash) -> PathBuf {
        self.seen_dir(peer).join(hash.to_base32())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Complete items in one direction, most urgent first.
    pub async fn catalog(&self, peer: &NodeId, dir: Direction) -> Result<Vec<CatalogEntry>> {
        let path = match dir {
            Direction::Tx => self.tx_dir(peer),
            Direction::Rx => self.rx_dir(peer),
        };
        let mut entries = Vec::new();
        for (hash, file) in list_named(&path, "").await? {
            let meta = match tokio::fs::metadata(&file).await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let nice = match read_nice(&file).await {
                Ok(nice) => nice,
                Err(e) => {
                    tracing::warn!(%peer, %hash, "skipping unreadable spool entry: {}", e);
                    continue;
                }
            };
            entries.push(CatalogEntry {
                hash,
                size: meta.len(),
                nice,
            });
        }
        entries.sort_by(|a, b| a.nice.cmp(&b.nice).then(a.hash.cmp(&b.hash)));
        Ok(entries)
    }

    /// Bytes already received for `hash`, zero if nothing is partial.
    pub async fn part_size(&self, peer: &NodeId, hash: &ContentHash) -> Result<u64> {
        match tokio::fs::metadata(self.part_path(peer, hash)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether verified content for `hash` is already in place.
    pub async fn has_complete(&self, peer: &NodeId, hash: &ContentHash) -> bool {
        exists(&self.rx_path(peer, hash)).await
    }

    /// Whether `hash` was already processed.
    pub async fn is_seen(&self, peer: &NodeId, hash: &ContentHash) -> bool {
        exists(&self.seen_path(peer, hash)).await
    }

    /// Whether `hash` is waiting for a checksum.
    pub async fn has_nock(&self, peer: &NodeId, hash: &ContentHash) -> bool {
        exists(&self.nock_path(peer, hash)).await
    }

    /// Hashes left waiting for a checksum, e.g. by a crashed session.
    pub async fn pending_checks(&self, peer: &NodeId) -> Result<Vec<ContentHash>> {
        Ok(list_named(&self.rx_dir(peer), NOCK_SUFFIX)
            .await?
            .into_iter()
            .map(|(hash, _)| hash)
            .collect())
    }

    /// Free space available for inbound content.
    pub fn free_space(&self) -> Result<u64> {
        if let Some(capacity) = self.capacity {
            return Ok(capacity);
        }
        let stat = nix::sys::statvfs::statvfs(&self.root).map_err(|errno| SpoolError::Fs {
            path: self.root.clone(),
            errno,
        })?;
        Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Open the partial file for `hash` for writing, creating it if needed.
    pub async fn open_part(&self, peer: &NodeId, hash: &ContentHash) -> Result<tokio::fs::File> {
        tokio::fs::create_dir_all(self.rx_dir(peer)).await?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .read(true)
            .open(self.part_path(peer, hash))
            .await?;
        Ok(file)
    }

    /// Rename a complete partial file to await its checksum.
    pub async fn mark_nock(&self, peer: &NodeId, hash: &ContentHash) -> Result<PathBuf> {
        let nock = self.nock_path(peer, hash);
        tokio::fs::rename(self.part_path(peer, hash), &nock).await?;
        Ok(nock)
    }

    /// Move verified content from `from` to its final name and fsync the directory.
    pub async fn commit(&self, peer: &NodeId, hash: &ContentHash, from: &Path) -> Result<()> {
        let dir = self.rx_dir(peer);
        tokio::fs::rename(from, self.rx_path(peer, hash)).await?;
        sync_dir(&dir).await?;
        tracing::debug!(%peer, %hash, "received content committed");
        Ok(())
    }

    /// Record `hash` as processed.
    pub async fn mark_seen(&self, peer: &NodeId, hash: &ContentHash) -> Result<()> {
        tokio::fs::create_dir_all(self.seen_dir(peer)).await?;
        tokio::fs::write(self.seen_path(peer, hash), b"").await?;
        Ok(())
    }

    /// Remove a file, ignoring one that is already gone.
    pub async fn discard(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove outbound content the peer acknowledged.
    pub async fn remove_tx(&self, peer: &NodeId, hash: &ContentHash) -> Result<()> {
        tokio::fs::remove_file(self.tx_path(peer, hash)).await?;
        Ok(())
    }

    /// Remove received content once it has been consumed.
    pub async fn remove_rx(&self, peer: &NodeId, hash: &ContentHash) -> Result<()> {
        self.discard(&self.rx_path(peer, hash)).await
    }

    /// Store outbound content produced by `write`.
    ///
    /// The callback runs on a blocking thread. Its bytes land in a temporary
    /// file while being hashed, and the file is then renamed to its root.
    pub async fn store_tx<F, T, E>(&self, peer: &NodeId, write: F) -> std::result::Result<StoredTx<T>, E>
    where
        F: FnOnce(&mut TxWriter) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<SpoolError> + Send + 'static,
    {
        let dir = self.tx_dir(peer);
        let peer = *peer;
        let task = tokio::task::spawn_blocking(move || -> std::result::Result<StoredTx<T>, E> {
            let (tmp, mut writer) = begin_tx(&dir)?;
            let value = match write(&mut writer) {
                Ok(value) => value,
                Err(e) => {
                    let _ = std::fs::remove_file(&tmp);
                    return Err(e);
                }
            };
            let (hash, size) = finish_tx(&dir, &tmp, writer)?;
            tracing::debug!(%peer, %hash, size, "outbound content stored");
            Ok(StoredTx { hash, size, value })
        });
        task.await.map_err(SpoolError::from)?
    }

    /// Store outbound bytes as they are.
    pub async fn store_tx_bytes(&self, peer: &NodeId, data: Vec<u8>) -> Result<ContentHash> {
        let stored = self
            .store_tx(peer, move |w| -> Result<()> { Ok(w.write_all(&data)?) })
            .await?;
        Ok(stored.hash)
    }

    /// Take the advisory lock of one side of a peer's spool.
    pub fn lock(&self, peer: &NodeId, kind: LockKind) -> Result<SpoolLock> {
        let dir = self.peer_dir(peer);
        std::fs::create_dir_all(&dir)?;
        SpoolLock::acquire(&dir.join(kind.file_name()))
    }
}

fn begin_tx(dir: &Path) -> Result<(PathBuf, TxWriter)> {
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(
        "{}{}-{}",
        TMP_PREFIX,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let file = std::fs::File::create(&tmp)?;
    Ok((
        tmp,
        TxWriter {
            file,
            mth: MthSeq::new(),
            written: 0,
        },
    ))
}

fn finish_tx(dir: &Path, tmp: &Path, mut writer: TxWriter) -> Result<(ContentHash, u64)> {
    writer.file.sync_all()?;
    let hash = writer.mth.sum()?;
    std::fs::rename(tmp, dir.join(hash.to_base32()))?;
    std::fs::File::open(dir)?.sync_all()?;
    Ok((hash, writer.written))
}

async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

async fn sync_dir(dir: &Path) -> Result<()> {
    tokio::fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

async fn read_nice(path: &Path) -> Result<u8> {
    let mut head = [0u8; 9];
    tokio::fs::File::open(path).await?.read_exact(&mut head).await?;
    EncryptedPacket::peek_nice(&head)
        .map_err(|e| SpoolError::InvalidData(format!("{}: {}", path.display(), e)))
}

/// Files in `dir` named `<base32 hash><suffix>`; a missing directory is empty.
async fn list_named(dir: &Path, suffix: &str) -> Result<Vec<(ContentHash, PathBuf)>> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(suffix) else { continue };
        if let Ok(hash) = stem.parse::<ContentHash>() {
            out.push((hash, entry.path()));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycopy_core::hash_bytes;
    use relaycopy_packet::{EncryptedPacket, ENVELOPE_LEN};
    use relaycopy_core::Ed25519Signature;
    use tempfile::TempDir;

    fn envelope_bytes(nice: u8, body: &[u8]) -> Vec<u8> {
        let env = EncryptedPacket {
            nice,
            sender: NodeId([1; 32]),
            recipient: NodeId([2; 32]),
            exch_pub: [3; 32],
            sig: Ed25519Signature::ZERO,
        };
        let mut out = env.to_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    async fn spool() -> (TempDir, Spool) {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).await.unwrap();
        (dir, spool)
    }

    #[tokio::test]
    async fn test_store_tx_names_by_root() {
        let (_dir, spool) = spool().await;
        let peer = NodeId([7; 32]);
        let data = envelope_bytes(10, b"payload");

        let hash = spool.store_tx_bytes(&peer, data.clone()).await.unwrap();
        assert_eq!(hash, hash_bytes(&data));
        assert_eq!(std::fs::read(spool.tx_path(&peer, &hash)).unwrap(), data);

        let catalog = spool.catalog(&peer, Direction::Tx).await.unwrap();
        assert_eq!(
            catalog,
            vec![CatalogEntry {
                hash,
                size: (ENVELOPE_LEN + 7) as u64,
                nice: 10
            }]
        );
    }

    #[tokio::test]
    async fn test_catalog_orders_by_nice_and_skips_junk() {
        let (_dir, spool) = spool().await;
        let peer = NodeId([7; 32]);
        spool.store_tx_bytes(&peer, envelope_bytes(200, b"a")).await.unwrap();
        spool.store_tx_bytes(&peer, envelope_bytes(5, b"b")).await.unwrap();
        std::fs::write(spool.tx_dir(&peer).join("not-a-hash"), b"x").unwrap();

        let nices: Vec<u8> = spool
            .catalog(&peer, Direction::Tx)
            .await
            .unwrap()
            .iter()
            .map(|e| e.nice)
            .collect();
        assert_eq!(nices, vec![5, 200]);
    }

    #[tokio::test]
    async fn test_missing_peer_is_empty() {
        let (_dir, spool) = spool().await;
        let peer = NodeId([9; 32]);
        assert!(spool.catalog(&peer, Direction::Rx).await.unwrap().is_empty());
        assert!(spool.pending_checks(&peer).await.unwrap().is_empty());
        assert_eq!(spool.part_size(&peer, &ContentHash::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_part_nock_commit_lifecycle() {
        use tokio::io::AsyncWriteExt;

        let (_dir, spool) = spool().await;
        let peer = NodeId([7; 32]);
        let hash = ContentHash([5; 32]);

        let mut part = spool.open_part(&peer, &hash).await.unwrap();
        part.write_all(b"hello").await.unwrap();
        part.sync_all().await.unwrap();
        drop(part);
        assert_eq!(spool.part_size(&peer, &hash).await.unwrap(), 5);

        let nock = spool.mark_nock(&peer, &hash).await.unwrap();
        assert!(spool.has_nock(&peer, &hash).await);
        assert_eq!(spool.pending_checks(&peer).await.unwrap(), vec![hash]);

        spool.commit(&peer, &hash, &nock).await.unwrap();
        assert!(spool.has_complete(&peer, &hash).await);
        assert!(!spool.has_nock(&peer, &hash).await);
        assert_eq!(spool.part_size(&peer, &hash).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_seen_marker() {
        let (_dir, spool) = spool().await;
        let peer = NodeId([7; 32]);
        let hash = ContentHash([6; 32]);
        assert!(!spool.is_seen(&peer, &hash).await);
        spool.mark_seen(&peer, &hash).await.unwrap();
        assert!(spool.is_seen(&peer, &hash).await);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let (_dir, spool) = spool().await;
        let peer = NodeId([7; 32]);
        let held = spool.lock(&peer, LockKind::Rx).unwrap();
        assert!(matches!(
            spool.lock(&peer, LockKind::Rx),
            Err(SpoolError::Locked(_))
        ));
        let _tx = spool.lock(&peer, LockKind::Tx).unwrap();
        drop(held);
        assert!(spool.lock(&peer, LockKind::Rx).is_ok());
    }

    #[tokio::test]
    async fn test_capacity_override() {
        let (_dir, spool) = spool().await;
        assert!(spool.free_space().unwrap() > 0);
        let small = spool.with_capacity(42);
        assert_eq!(small.free_space().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_failed_store_leaves_nothing() {
        let (_dir, spool) = spool().await;
        let peer = NodeId([7; 32]);
        let result = spool
            .store_tx(&peer, |w| -> Result<()> {
                w.write_all(b"partial")?;
                Err(SpoolError::InvalidData("boom".to_string()))
            })
            .await;
        assert!(result.is_err());
        let leftover = std::fs::read_dir(spool.tx_dir(&peer)).unwrap().count();
        assert_eq!(leftover, 0);
    }
}
