//! Connection abstraction and record framing.
//!
//! A session runs over any duplex byte stream that can be split into a
//! reader and a writer with independent deadlines. Each Noise message
//! travels as one record: `magic(8) | len u32 | message`.

use std::io;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;

use crate::error::{Result, SyncError};

/// Magic prefix of every session record.
pub const RECORD_MAGIC: [u8; 8] = *b"RCSYNC\x00\x01";

/// Largest Noise message carried in one record.
pub const MAX_SP_SIZE: usize = 65536 - 256;

const RECORD_HEADER_LEN: usize = 8 + 4;

/// Reading half of a connection.
#[async_trait]
pub trait ConnReader: Send {
    /// Read some bytes; `Ok(0)` means the peer closed.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Reads after `deadline` fail with [`io::ErrorKind::TimedOut`].
    fn set_read_deadline(&mut self, deadline: Option<Instant>);
}

/// Writing half of a connection.
#[async_trait]
pub trait ConnWriter: Send {
    /// Write some bytes, returning how many were accepted.
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Writes after `deadline` fail with [`io::ErrorKind::TimedOut`].
    fn set_write_deadline(&mut self, deadline: Option<Instant>);

    /// Flush and shut down the writing direction.
    async fn close(&mut self) -> io::Result<()>;
}

/// A duplex connection a session can run over.
pub trait Conn: Send + 'static {
    type Reader: ConnReader + 'static;
    type Writer: ConnWriter + 'static;

    /// Split into independently owned halves.
    fn split(self) -> (Self::Reader, Self::Writer);
}

// ─────────────────────────────────────────────────────────────────────────────
// Deadlined adapter over tokio streams
// ─────────────────────────────────────────────────────────────────────────────

/// Adds deadlines to any tokio byte stream (TCP, pipes, in-memory duplex).
pub struct Deadlined<T> {
    inner: T,
}

impl<T> Deadlined<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

pub struct DeadlinedReader<T> {
    inner: ReadHalf<T>,
    deadline: Option<Instant>,
}

pub struct DeadlinedWriter<T> {
    inner: WriteHalf<T>,
    deadline: Option<Instant>,
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} deadline exceeded", what))
}

impl<T> Conn for Deadlined<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    type Reader = DeadlinedReader<T>;
    type Writer = DeadlinedWriter<T>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (r, w) = tokio::io::split(self.inner);
        (
            DeadlinedReader {
                inner: r,
                deadline: None,
            },
            DeadlinedWriter {
                inner: w,
                deadline: None,
            },
        )
    }
}

#[async_trait]
impl<T> ConnReader for DeadlinedReader<T>
where
    T: AsyncRead + Send + 'static,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.inner.read(buf))
                .await
                .map_err(|_| timed_out("read"))?,
            None => self.inner.read(buf).await,
        }
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }
}

#[async_trait]
impl<T> ConnWriter for DeadlinedWriter<T>
where
    T: AsyncWrite + Send + 'static,
{
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.inner.write(buf))
                .await
                .map_err(|_| timed_out("write"))?,
            None => self.inner.write(buf).await,
        }
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// Reads whole records, keeping partial input across timeouts so a timed
/// out read can simply be retried.
pub struct RecordReader<R> {
    conn: R,
    buf: BytesMut,
    chunk: Vec<u8>,
}

impl<R: ConnReader> RecordReader<R> {
    pub fn new(conn: R) -> Self {
        Self {
            conn,
            buf: BytesMut::with_capacity(RECORD_HEADER_LEN + MAX_SP_SIZE),
            chunk: vec![0u8; 16 * 1024],
        }
    }

    /// Next record body; each read is bounded by `timeout`.
    pub async fn next(&mut self, timeout: std::time::Duration) -> Result<BytesMut> {
        loop {
            if let Some(record) = self.parse()? {
                return Ok(record);
            }
            self.conn.set_read_deadline(Some(Instant::now() + timeout));
            let n = self.conn.read(&mut self.chunk).await?;
            if n == 0 {
                return Err(SyncError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                )));
            }
            self.buf.extend_from_slice(&self.chunk[..n]);
        }
    }

    fn parse(&mut self) -> Result<Option<BytesMut>> {
        if self.buf.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }
        if self.buf[..8] != RECORD_MAGIC {
            return Err(SyncError::BadMagic);
        }
        let len = (&self.buf[8..12]).get_u32() as usize;
        if len > MAX_SP_SIZE {
            return Err(SyncError::Frame(format!("record of {} bytes exceeds {}", len, MAX_SP_SIZE)));
        }
        if self.buf.len() < RECORD_HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(RECORD_HEADER_LEN);
        Ok(Some(self.buf.split_to(len)))
    }
}

/// Writes whole records, resuming after timed out writes.
pub struct RecordWriter<W> {
    conn: W,
}

impl<W: ConnWriter> RecordWriter<W> {
    pub fn new(conn: W) -> Self {
        Self { conn }
    }

    /// Write one record. Each write is bounded by `timeout`; on expiry
    /// `keep_trying` decides whether to continue where it stopped.
    pub async fn send(
        &mut self,
        body: &[u8],
        timeout: std::time::Duration,
        mut keep_trying: impl FnMut() -> bool + Send,
    ) -> Result<()> {
        if body.len() > MAX_SP_SIZE {
            return Err(SyncError::Frame(format!("record of {} bytes exceeds {}", body.len(), MAX_SP_SIZE)));
        }
        let mut record = BytesMut::with_capacity(RECORD_HEADER_LEN + body.len());
        record.put_slice(&RECORD_MAGIC);
        record.put_u32(body.len() as u32);
        record.put_slice(body);

        let mut sent = 0;
        while sent < record.len() {
            self.conn.set_write_deadline(Some(Instant::now() + timeout));
            match self.conn.write(&record[sent..]).await {
                Ok(0) => {
                    return Err(SyncError::Transport(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection refused more bytes",
                    )))
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut && keep_trying() => {
                    tracing::debug!(sent, total = record.len(), "write timed out, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Shut down the connection.
    pub async fn close(&mut self) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}
