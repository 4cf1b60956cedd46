//! # relaycopy testkit
//!
//! Testing utilities for relaycopy.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Determinism vectors**: Merkle roots computed several ways that must agree
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: Paired nodes on temporary spools and in-memory connections
//!
//! ## Determinism Vectors
//!
//! ```rust
//! use relaycopy_testkit::vectors::verify_all_vectors;
//!
//! for result in verify_all_vectors().unwrap() {
//!     assert!(result.consistent());
//!     println!("{}: {}", result.name, result.root);
//! }
//! ```
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use relaycopy_testkit::generators::PacketParams;
//!
//! proptest! {
//!     #[test]
//!     fn header_round_trips(params in any::<PacketParams>()) {
//!         let bytes = params.packet.to_bytes();
//!         prop_assert_eq!(Packet::from_bytes(&bytes).unwrap(), params.packet);
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! Run a whole session between two nodes:
//!
//! ```rust,no_run
//! use relaycopy_testkit::fixtures::NodePair;
//!
//! async fn example() -> relaycopy::Result<()> {
//!     let pair = NodePair::new().await?;
//!     let hash = pair.queue_a_to_b(100, "hello.txt", b"hello".to_vec()).await?;
//!     let (caller, answerer) = pair.session().await;
//!     assert!(caller?.acknowledged.contains(&hash));
//!     assert!(answerer?.received.contains(&hash));
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{connect, fast_config, fast_session, identity, init_tracing, multi_party_identities, NodePair};
pub use generators::{random_payload, PacketParams};
pub use vectors::{all_vectors, verify_all_vectors, DeterminismVector, VectorResult};
