//! Session frames.
//!
//! A decrypted session message is a packed sequence of frames, each a
//! one-byte tag followed by fixed big-endian fields:
//!
//! ```text
//! Halt  0
//! Info  1  nice u8 | size u64 | hash [32]
//! Freq  2  hash [32] | offset u64
//! File  3  hash [32] | offset u64 | len u32 | payload
//! Done  4  hash [32]
//! Ping  5
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use relaycopy_core::ContentHash;

use crate::error::{Result, SyncError};

const TAG_HALT: u8 = 0;
const TAG_INFO: u8 = 1;
const TAG_FREQ: u8 = 2;
const TAG_FILE: u8 = 3;
const TAG_DONE: u8 = 4;
const TAG_PING: u8 = 5;

/// Encoded size of a `File` frame without its payload.
pub const FILE_FRAME_OVERHEAD: usize = 1 + 32 + 8 + 4;

/// A session frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Forget everything queued for sending to the peer.
    Halt,
    /// "I have this content, this big, this urgent."
    Info {
        nice: u8,
        size: u64,
        hash: ContentHash,
    },
    /// "Send me this, starting at byte offset."
    Freq { hash: ContentHash, offset: u64 },
    /// A chunk of content.
    File {
        hash: ContentHash,
        offset: u64,
        payload: Bytes,
    },
    /// "I have it fully, you may delete your copy."
    Done { hash: ContentHash },
    /// Liveness probe.
    Ping,
}

impl Frame {
    /// Encoded length.
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Halt | Frame::Ping => 1,
            Frame::Info { .. } => 1 + 1 + 8 + 32,
            Frame::Freq { .. } => 1 + 32 + 8,
            Frame::File { payload, .. } => FILE_FRAME_OVERHEAD + payload.len(),
            Frame::Done { .. } => 1 + 32,
        }
    }

    /// Whether this frame counts as useful traffic for deadline purposes.
    pub fn is_substantive(&self) -> bool {
        !matches!(self, Frame::Ping)
    }

    /// Append the encoding to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Halt => buf.put_u8(TAG_HALT),
            Frame::Info { nice, size, hash } => {
                buf.put_u8(TAG_INFO);
                buf.put_u8(*nice);
                buf.put_u64(*size);
                buf.put_slice(hash.as_bytes());
            }
            Frame::Freq { hash, offset } => {
                buf.put_u8(TAG_FREQ);
                buf.put_slice(hash.as_bytes());
                buf.put_u64(*offset);
            }
            Frame::File {
                hash,
                offset,
                payload,
            } => {
                buf.put_u8(TAG_FILE);
                buf.put_slice(hash.as_bytes());
                buf.put_u64(*offset);
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            Frame::Done { hash } => {
                buf.put_u8(TAG_DONE);
                buf.put_slice(hash.as_bytes());
            }
            Frame::Ping => buf.put_u8(TAG_PING),
        }
    }

    /// Decode every frame packed in `data`.
    pub fn decode_all(data: Bytes) -> Result<Vec<Frame>> {
        let mut buf = data;
        let mut frames = Vec::new();
        while buf.has_remaining() {
            frames.push(Self::decode_one(&mut buf)?);
        }
        Ok(frames)
    }

    fn decode_one(buf: &mut Bytes) -> Result<Frame> {
        let tag = buf.get_u8();
        let frame = match tag {
            TAG_HALT => Frame::Halt,
            TAG_PING => Frame::Ping,
            TAG_INFO => {
                need(buf, 1 + 8 + 32, "Info")?;
                let nice = buf.get_u8();
                let size = buf.get_u64();
                Frame::Info {
                    nice,
                    size,
                    hash: get_hash(buf),
                }
            }
            TAG_FREQ => {
                need(buf, 32 + 8, "Freq")?;
                let hash = get_hash(buf);
                Frame::Freq {
                    hash,
                    offset: buf.get_u64(),
                }
            }
            TAG_FILE => {
                need(buf, 32 + 8 + 4, "File")?;
                let hash = get_hash(buf);
                let offset = buf.get_u64();
                let len = buf.get_u32() as usize;
                need(buf, len, "File payload")?;
                Frame::File {
                    hash,
                    offset,
                    payload: buf.split_to(len),
                }
            }
            TAG_DONE => {
                need(buf, 32, "Done")?;
                Frame::Done {
                    hash: get_hash(buf),
                }
            }
            other => return Err(SyncError::UnknownFrame(other)),
        };
        Ok(frame)
    }
}

fn need(buf: &Bytes, len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(SyncError::Frame(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_hash(buf: &mut Bytes) -> ContentHash {
    let mut hash = [0u8; 32];
    buf.copy_to_slice(&mut hash);
    ContentHash(hash)
}

/// Pack frames into one message body.
pub fn pack(frames: &[Frame]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(frames.iter().map(Frame::encoded_len).sum());
    for frame in frames {
        frame.encode(&mut buf);
    }
    buf
}

/// Fill `buf` with `Halt` frames up to `target` bytes.
pub fn pad_with_halts(buf: &mut BytesMut, target: usize) {
    while buf.len() < target {
        buf.put_u8(TAG_HALT);
    }
}
