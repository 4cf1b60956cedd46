//! Streaming packet encoder and decoder.
//!
//! After the envelope, the plaintext (header followed by payload) is cut
//! into [`BLOCK_SIZE`] blocks sealed with the full key. The last, possibly
//! short, block is preceded by a size record sealed with the size key:
//!
//! ```text
//! envelope | full block * n | size(payload u64, pad u64) | last block | pad
//! ```
//!
//! Block counters run across all sealed blocks. The decoder tells a full
//! block from the size record by which key opens it, so the true length is
//! only revealed to the holder of the shared key. Padding is the BLAKE3
//! output stream of the pad key and is checked byte for byte.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};

use bytes::{Buf, BufMut};
use relaycopy_core::{NodeId, NodeOur, NodeTheir};

use crate::crypto::{EphemeralKeyPair, PacketKeys, SharedKey, BLOCK_SIZE, TAG_SIZE};
use crate::envelope::{EncryptedPacket, ENVELOPE_LEN};
use crate::error::{PacketError, Result};
use crate::packet::{Packet, PACKET_HEADER_LEN};

/// Plaintext size record: payload length and pad length.
const SIZE_RECORD_LEN: usize = 16;

/// Sealed size record.
const SIZE_BLOCK_LEN: usize = SIZE_RECORD_LEN + TAG_SIZE;

/// Fixed cost one more layer of wrapping adds around a payload.
pub const PKT_OVERHEAD: u64 =
    (ENVELOPE_LEN + PACKET_HEADER_LEN + SIZE_BLOCK_LEN + TAG_SIZE) as u64;

const PAD_CHUNK: usize = 64 * 1024;

/// Parameters for [`encode_packet`].
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    /// Envelope niceness.
    pub nice: u8,
    /// Pad so that the packet, after `wrappers` more wrappings, reaches this size.
    pub min_size: u64,
    /// Refuse to produce more than this many bytes.
    pub max_size: u64,
    /// Number of further wrapping layers to reserve room for.
    pub wrappers: u32,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            nice: 255,
            min_size: 0,
            max_size: u64::MAX,
            wrappers: 0,
        }
    }
}

/// Result of a successful encode.
#[derive(Debug, Clone)]
pub struct Encoded {
    /// The envelope as written.
    pub envelope: EncryptedPacket,
    /// Total bytes written, envelope included.
    pub size: u64,
}

/// Result of a successful decode.
#[derive(Debug, Clone)]
pub struct Decoded {
    /// Shared key, reusable for the same envelope.
    pub shared: SharedKey,
    /// Sender's view, `None` when unverified and unknown.
    pub peer: Option<NodeTheir>,
    /// Plaintext bytes written: header plus payload.
    pub plain_size: u64,
}

/// Output sink that enforces the maximum size.
struct Sink<W> {
    inner: W,
    written: u64,
    max: u64,
}

impl<W: Write> Sink<W> {
    fn put(&mut self, data: &[u8]) -> Result<()> {
        let size = self.written + data.len() as u64;
        if size > self.max {
            return Err(PacketError::TooBig {
                size,
                max: self.max,
            });
        }
        self.inner.write_all(data)?;
        self.written = size;
        Ok(())
    }
}

/// Fill `buf` as far as the reader allows; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ─────────────────────────────────────────────────────────────────────────────
// Encode
// ─────────────────────────────────────────────────────────────────────────────

/// Encrypt `packet` followed by everything `data` yields for `recipient`.
pub fn encode_packet<R: Read, W: Write>(
    our: &NodeOur,
    recipient: &NodeTheir,
    packet: &Packet,
    opts: &EncodeOptions,
    data: R,
    out: W,
) -> Result<Encoded> {
    let ephemeral = EphemeralKeyPair::generate();
    let mut envelope = EncryptedPacket {
        nice: opts.nice,
        sender: our.id(),
        recipient: recipient.id,
        exch_pub: ephemeral.public_key(),
        sig: relaycopy_core::Ed25519Signature::ZERO,
    };
    envelope.sig = our.sign(&envelope.tbs_bytes());
    let ad = envelope.associated_data();
    let keys = ephemeral.diffie_hellman(&recipient.exch_pub).packet_keys()?;

    let mut sink = Sink {
        inner: out,
        written: 0,
        max: opts.max_size,
    };
    sink.put(&envelope.to_bytes())?;

    let header = packet.to_bytes();
    let mut plain = Read::chain(Cursor::new(&header[..]), data);
    let mut ctr = 0u64;
    let mut payload = 0u64;

    let mut cur = vec![0u8; BLOCK_SIZE];
    let mut next = vec![0u8; BLOCK_SIZE];
    let mut cur_len = read_full(&mut plain, &mut cur)?;
    loop {
        if cur_len < BLOCK_SIZE {
            break;
        }
        let next_len = read_full(&mut plain, &mut next)?;
        if next_len == 0 {
            break;
        }
        sink.put(&keys.full.seal(ctr, &ad, &cur)?)?;
        ctr += 1;
        payload += BLOCK_SIZE as u64;
        std::mem::swap(&mut cur, &mut next);
        cur_len = next_len;
    }
    payload += cur_len as u64;

    let natural = sink.written + (SIZE_BLOCK_LEN + cur_len + TAG_SIZE) as u64;
    let reserve = opts.wrappers as u64 * PKT_OVERHEAD;
    let pad = opts.min_size.saturating_sub(natural.saturating_add(reserve));

    let mut record = [0u8; SIZE_RECORD_LEN];
    {
        let mut buf = &mut record[..];
        buf.put_u64(payload);
        buf.put_u64(pad);
    }
    sink.put(&keys.size.seal(ctr, &ad, &record)?)?;
    ctr += 1;
    sink.put(&keys.full.seal(ctr, &ad, &cur[..cur_len])?)?;

    write_pad(&keys, pad, &mut sink)?;

    tracing::debug!(
        recipient = %recipient.id,
        nice = opts.nice,
        payload,
        pad,
        size = sink.written,
        "packet encoded"
    );
    Ok(Encoded {
        envelope,
        size: sink.written,
    })
}

fn write_pad<W: Write>(keys: &PacketKeys, pad: u64, sink: &mut Sink<W>) -> Result<()> {
    let mut stream = keys.pad_stream();
    let mut chunk = vec![0u8; PAD_CHUNK];
    let mut left = pad;
    while left > 0 {
        let n = left.min(PAD_CHUNK as u64) as usize;
        stream.fill(&mut chunk[..n]);
        sink.put(&chunk[..n])?;
        left -= n as u64;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Decode
// ─────────────────────────────────────────────────────────────────────────────

/// Decrypt a packet addressed to us, writing header and payload to `out`.
///
/// With `verify_signature` set the sender must be among `peers` and its
/// signature must verify. Without it an unknown sender yields no peer view.
/// `cached` is reused when it belongs to this envelope's ephemeral key.
pub fn decode_packet<R: Read, W: Write>(
    our: &NodeOur,
    peers: &HashMap<NodeId, NodeTheir>,
    mut reader: R,
    mut out: W,
    verify_signature: bool,
    cached: Option<&SharedKey>,
) -> Result<Decoded> {
    let envelope = EncryptedPacket::read_from(&mut reader)?;
    if envelope.recipient != our.id() {
        return Err(PacketError::WrongRecipient(envelope.recipient));
    }

    let peer = peers.get(&envelope.sender).cloned();
    if verify_signature {
        let their = peer
            .as_ref()
            .ok_or(PacketError::UnknownSender(envelope.sender))?;
        their
            .verify(&envelope.tbs_bytes(), &envelope.sig)
            .map_err(|_| PacketError::BadSignature)?;
    }

    let shared = match cached {
        Some(key) if key.ephemeral() == &envelope.exch_pub => key.clone(),
        _ => SharedKey::agree(our.exch_secret(), &envelope.exch_pub),
    };
    let keys = shared.packet_keys()?;
    let ad = envelope.associated_data();

    let mut buf = vec![0u8; BLOCK_SIZE + TAG_SIZE];
    let mut ctr = 0u64;
    let mut written = 0u64;
    let (payload, pad, tail) = loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == buf.len() {
            if let Ok(plain) = keys.full.open(ctr, &ad, &buf) {
                out.write_all(&plain)?;
                written += plain.len() as u64;
                ctr += 1;
                continue;
            }
        }
        // Anything that is not a full block must start with the size record.
        if n < SIZE_BLOCK_LEN {
            return Err(PacketError::Malformed("missing size record".to_string()));
        }
        let record = keys.size.open(ctr, &ad, &buf[..SIZE_BLOCK_LEN])?;
        ctr += 1;
        let mut record = &record[..];
        let payload = record.get_u64();
        let pad = record.get_u64();
        break (payload, pad, buf[SIZE_BLOCK_LEN..n].to_vec());
    };

    let last_len = payload
        .checked_sub(written)
        .filter(|len| *len <= BLOCK_SIZE as u64)
        .ok_or_else(|| {
            PacketError::Malformed(format!(
                "size record claims {} bytes after {} decrypted",
                payload, written
            ))
        })? as usize;
    let sealed_len = last_len + TAG_SIZE;

    let mut tail = tail;
    if tail.len() < sealed_len {
        let have = tail.len();
        tail.resize(sealed_len, 0);
        reader.read_exact(&mut tail[have..]).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => PacketError::Malformed("truncated last block".to_string()),
            _ => PacketError::Io(e),
        })?;
    }
    let plain = keys.full.open(ctr, &ad, &tail[..sealed_len])?;
    out.write_all(&plain)?;
    written += plain.len() as u64;
    out.flush()?;

    check_pad(&keys, pad, &tail[sealed_len..], &mut reader)?;

    tracing::debug!(
        sender = %envelope.sender,
        nice = envelope.nice,
        plain_size = written,
        pad,
        "packet decoded"
    );
    Ok(Decoded {
        shared,
        peer,
        plain_size: written,
    })
}

/// Compare the remaining stream against the expected padding.
fn check_pad<R: Read>(keys: &PacketKeys, pad: u64, already: &[u8], reader: &mut R) -> Result<()> {
    let mut stream = keys.pad_stream();
    let mut expected = vec![0u8; PAD_CHUNK];

    if already.len() as u64 > pad {
        return Err(PacketError::PadMismatch);
    }
    for piece in already.chunks(PAD_CHUNK) {
        stream.fill(&mut expected[..piece.len()]);
        if piece != &expected[..piece.len()] {
            return Err(PacketError::PadMismatch);
        }
    }

    let mut left = pad - already.len() as u64;
    let mut got = vec![0u8; PAD_CHUNK];
    while left > 0 {
        let n = left.min(PAD_CHUNK as u64) as usize;
        if read_full(reader, &mut got[..n])? != n {
            return Err(PacketError::PadMismatch);
        }
        stream.fill(&mut expected[..n]);
        if got[..n] != expected[..n] {
            return Err(PacketError::PadMismatch);
        }
        left -= n as u64;
    }

    if read_full(reader, &mut got[..1])? != 0 {
        return Err(PacketError::Malformed("trailing bytes after padding".to_string()));
    }
    Ok(())
}
