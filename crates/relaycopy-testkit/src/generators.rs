//! Proptest generators and random content.

use proptest::prelude::*;
use rand::{rngs::StdRng, RngCore, SeedableRng};

use relaycopy_core::{NodeOur, MTH_BLOCK_SIZE};
use relaycopy_packet::{Packet, PacketType, MAX_PATH_LEN};

/// Reproducible pseudo-random content.
pub fn random_payload(seed: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Generate an identity from three arbitrary seeds.
pub fn identity() -> impl Strategy<Value = NodeOur> {
    (any::<[u8; 32]>(), any::<[u8; 32]>(), any::<[u8; 32]>())
        .prop_map(|(sign, exch, noise)| NodeOur::from_seeds(&sign, exch, noise))
}

/// Generate a packet type.
pub fn packet_type() -> impl Strategy<Value = PacketType> {
    prop_oneof![
        Just(PacketType::File),
        Just(PacketType::Freq),
        Just(PacketType::Exec),
        Just(PacketType::Trns),
        Just(PacketType::ExecFat),
        Just(PacketType::Area),
        Just(PacketType::Ack),
    ]
}

/// Generate a packet path of valid length.
pub fn path() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=MAX_PATH_LEN)
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Sizes clustered around Merkle block boundaries, where off-by-one
/// mistakes live.
pub fn boundary_len(max_blocks: usize) -> impl Strategy<Value = usize> {
    (0..=max_blocks, -2i64..=2).prop_map(|(blocks, delta)| (blocks as i64 * MTH_BLOCK_SIZE as i64 + delta).max(0) as usize)
}

/// Parameters for generating a packet.
#[derive(Debug, Clone)]
pub struct PacketParams {
    pub packet: Packet,
    pub payload: Vec<u8>,
}

impl Arbitrary for PacketParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (packet_type(), any::<u8>(), path(), payload(4096))
            .prop_map(|(kind, nice, path, payload)| PacketParams {
                packet: Packet { kind, nice, path },
                payload,
            })
            .boxed()
    }
}
