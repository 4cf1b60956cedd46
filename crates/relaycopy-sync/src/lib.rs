//! # relaycopy sync
//!
//! The online session two nodes run when they get a transient connection.
//!
//! ## Overview
//!
//! A session authenticates with a Noise IK handshake, then both sides
//! exchange catalogs of spooled content and pull what they miss. Transfers
//! resume from whatever a previous session left in the `.part` files, and
//! every received file is checked against its Merkle root before it appears
//! under its final name.
//!
//! ## Message Flow
//!
//! ```text
//! Caller                                   Answerer
//!   |-- msg1: Info.. Halt.. (padded) -------->|
//!   |<-------- msg2: Info.. Halt.. (padded) --|
//!   |-- Freq{hash, offset} ------------------>|
//!   |<-------------- File{hash, offset, ..} --|
//!   |<-------------- File{hash, offset, ..} --|
//!   |-- Done{hash} -------------------------->|
//!   |<--------------------------------- Ping -|
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use relaycopy_core::NodeOur;
//! use relaycopy_spool::Spool;
//! use relaycopy_sync::{Checker, Deadlined, Session, SessionConfig};
//!
//! async fn example<S>(stream: S) -> relaycopy_sync::Result<()>
//! where
//!     S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
//! {
//!     let our = Arc::new(NodeOur::generate());
//!     let peers = Arc::new(HashMap::new());
//!     let spool = Spool::open("/var/spool/relaycopy").await?;
//!     let checker = Checker::start(2);
//!
//!     let session = Session::new(our, peers, spool, checker.clone(), SessionConfig::default());
//!     let report = session.accept(Deadlined::new(stream)).await?;
//!     println!("received {} items", report.received.len());
//!     checker.stop().await;
//!     Ok(())
//! }
//! ```

pub mod checker;
pub mod conn;
pub mod error;
pub mod frames;
pub mod noise;
mod rx;
pub mod session;
pub mod state;
mod tx;

pub use checker::{CheckJob, CheckOutcome, Checker};
pub use conn::{Conn, ConnReader, ConnWriter, Deadlined, RecordReader, RecordWriter, MAX_SP_SIZE};
pub use error::{Result, SyncError};
pub use frames::Frame;
pub use session::{Session, SessionConfig};
pub use state::SessionReport;
pub use tx::MAX_CHUNK;
