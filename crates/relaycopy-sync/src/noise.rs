//! Noise IK handshake and transport ciphers.
//!
//! The initiator knows the responder's static key up front, so its very
//! first message is already encrypted and carries a padded opening catalog.
//! The responder learns who is calling only from the static key revealed by
//! that message.
//!
//! After the handshake the transport runs in stateless mode. Each direction
//! keeps its own nonce counter so the sender and receiver tasks never share
//! mutable cipher state.

use std::sync::Arc;

use snow::{Builder, HandshakeState, StatelessTransportState};

use crate::conn::MAX_SP_SIZE;
use crate::error::{Result, SyncError};

/// Noise protocol name.
pub const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2b";

/// IK message 1 overhead: `e` (32) + encrypted `s` (32 + 16) + payload tag (16).
pub const MSG1_OVERHEAD: usize = 32 + 48 + 16;

/// IK message 2 overhead: `e` (32) + payload tag (16).
pub const MSG2_OVERHEAD: usize = 32 + 16;

/// Per-message overhead after the handshake.
pub const TRANSPORT_OVERHEAD: usize = 16;

/// Largest frame payload that fits one transport message.
pub const MAX_TRANSPORT_PAYLOAD: usize = MAX_SP_SIZE - TRANSPORT_OVERHEAD;

fn builder<'a>() -> Result<Builder<'a>> {
    let params: snow::params::NoiseParams = NOISE_PATTERN
        .parse()
        .map_err(|_| SyncError::Frame(format!("bad noise pattern {}", NOISE_PATTERN)))?;
    Ok(Builder::new(params))
}

/// Initiator side of the handshake.
pub struct Initiator {
    state: HandshakeState,
}

impl Initiator {
    /// Start a handshake towards a responder whose static key is known.
    pub fn new(our_private: &[u8; 32], their_public: &[u8; 32]) -> Result<Self> {
        let state = builder()?
            .local_private_key(our_private)
            .remote_public_key(their_public)
            .build_initiator()?;
        Ok(Self { state })
    }

    /// Message 1 carrying `payload`.
    pub fn write_first(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut msg = vec![0u8; payload.len() + MSG1_OVERHEAD];
        let len = self.state.write_message(payload, &mut msg)?;
        msg.truncate(len);
        Ok(msg)
    }

    /// Read message 2, finishing the handshake.
    pub fn read_reply(mut self, msg: &[u8]) -> Result<(Transport, Vec<u8>)> {
        let mut payload = vec![0u8; msg.len()];
        let len = self.state.read_message(msg, &mut payload)?;
        payload.truncate(len);
        let transport = Transport::new(self.state.into_stateless_transport_mode()?);
        Ok((transport, payload))
    }
}

/// Responder side of the handshake.
pub struct Responder {
    state: HandshakeState,
}

impl Responder {
    pub fn new(our_private: &[u8; 32]) -> Result<Self> {
        let state = builder()?.local_private_key(our_private).build_responder()?;
        Ok(Self { state })
    }

    /// Read message 1, returning its payload and the caller's static key.
    pub fn read_first(&mut self, msg: &[u8]) -> Result<(Vec<u8>, [u8; 32])> {
        let mut payload = vec![0u8; msg.len()];
        let len = self.state.read_message(msg, &mut payload)?;
        payload.truncate(len);
        let remote = self
            .state
            .get_remote_static()
            .and_then(|key| <[u8; 32]>::try_from(key).ok())
            .ok_or_else(|| SyncError::Frame("handshake carried no static key".into()))?;
        Ok((payload, remote))
    }

    /// Message 2 carrying `payload`, finishing the handshake.
    pub fn write_reply(mut self, payload: &[u8]) -> Result<(Transport, Vec<u8>)> {
        let mut msg = vec![0u8; payload.len() + MSG2_OVERHEAD];
        let len = self.state.write_message(payload, &mut msg)?;
        msg.truncate(len);
        let transport = Transport::new(self.state.into_stateless_transport_mode()?);
        Ok((transport, msg))
    }
}

/// Completed handshake, ready to be split between tasks.
pub struct Transport {
    state: Arc<StatelessTransportState>,
}

impl Transport {
    fn new(state: StatelessTransportState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Split into the outbound and inbound cipher halves.
    pub fn split(self) -> (Sealer, Opener) {
        (
            Sealer {
                state: Arc::clone(&self.state),
                nonce: 0,
            },
            Opener {
                state: self.state,
                nonce: 0,
            },
        )
    }
}

/// Outbound cipher.
pub struct Sealer {
    state: Arc<StatelessTransportState>,
    nonce: u64,
}

impl Sealer {
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = vec![0u8; plaintext.len() + TRANSPORT_OVERHEAD];
        let len = self.state.write_message(self.nonce, plaintext, &mut out)?;
        out.truncate(len);
        self.nonce += 1;
        Ok(out)
    }
}

/// Inbound cipher.
pub struct Opener {
    state: Arc<StatelessTransportState>,
    nonce: u64,
}

impl Opener {
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut out = vec![0u8; ciphertext.len()];
        let len = self.state.read_message(self.nonce, ciphertext, &mut out)?;
        out.truncate(len);
        self.nonce += 1;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycopy_core::NodeOur;

    fn handshake(a: &NodeOur, b: &NodeOur) -> (Transport, Transport, Vec<u8>, Vec<u8>) {
        let b_pub = b.their().noise_pub;
        let mut init = Initiator::new(&a.noise_private(), &b_pub).unwrap();
        let msg1 = init.write_first(b"hello responder").unwrap();
        assert_eq!(msg1.len(), 15 + MSG1_OVERHEAD);

        let mut resp = Responder::new(&b.noise_private()).unwrap();
        let (p1, remote) = resp.read_first(&msg1).unwrap();
        assert_eq!(remote, a.their().noise_pub);
        let (t_b, msg2) = resp.write_reply(b"hello initiator").unwrap();
        assert_eq!(msg2.len(), 15 + MSG2_OVERHEAD);

        let (t_a, p2) = init.read_reply(&msg2).unwrap();
        (t_a, t_b, p1, p2)
    }

    #[test]
    fn test_ik_handshake_and_transport() {
        let a = NodeOur::generate();
        let b = NodeOur::generate();
        let (t_a, t_b, p1, p2) = handshake(&a, &b);
        assert_eq!(p1, b"hello responder");
        assert_eq!(p2, b"hello initiator");

        let (mut a_seal, mut a_open) = t_a.split();
        let (mut b_seal, mut b_open) = t_b.split();

        for i in 0..3u8 {
            let ct = a_seal.seal(&[i; 100]).unwrap();
            assert_eq!(ct.len(), 100 + TRANSPORT_OVERHEAD);
            assert_eq!(b_open.open(&ct).unwrap(), vec![i; 100]);
        }
        let ct = b_seal.seal(b"back").unwrap();
        assert_eq!(a_open.open(&ct).unwrap(), b"back");
    }

    #[test]
    fn test_replayed_message_fails() {
        let a = NodeOur::generate();
        let b = NodeOur::generate();
        let (t_a, t_b, _, _) = handshake(&a, &b);
        let (mut a_seal, _) = t_a.split();
        let (_, mut b_open) = t_b.split();

        let ct = a_seal.seal(b"once").unwrap();
        b_open.open(&ct).unwrap();
        assert!(b_open.open(&ct).is_err());
    }

    #[test]
    fn test_wrong_responder_key_fails() {
        let a = NodeOur::generate();
        let b = NodeOur::generate();
        let c = NodeOur::generate();
        let mut init = Initiator::new(&a.noise_private(), &c.their().noise_pub).unwrap();
        let msg1 = init.write_first(b"").unwrap();
        let mut resp = Responder::new(&b.noise_private()).unwrap();
        assert!(matches!(resp.read_first(&msg1), Err(SyncError::Noise(_))));
    }

    #[test]
    fn test_max_payload_fits_record() {
        let a = NodeOur::generate();
        let b = NodeOur::generate();
        let mut init = Initiator::new(&a.noise_private(), &b.their().noise_pub).unwrap();
        let msg1 = init.write_first(&vec![0u8; MAX_SP_SIZE - MSG1_OVERHEAD]).unwrap();
        assert_eq!(msg1.len(), MAX_SP_SIZE);
    }
}
