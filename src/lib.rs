//! Shoal worker - peer-to-peer worker framework
//!
//! Independent worker processes authenticate each other, hand fresh tunnels
//! to protocol modules through a two-stage handshake, and talk over:
//!
//! - worker sockets: streaming RPC with per-value acknowledgment
//! - worker group channels: broadcast, multicast, synchronize, variables,
//!   locker and sync-queue over a fixed member set
//! - absence tolerance record commissions: quorum-replicated records
//!
//! [`Worker`] bundles all of it for one process.

pub mod cli;
pub mod codec;
pub mod commission;
pub mod config;
pub mod error;
pub mod group;
pub mod logging;
pub mod membership;
pub mod peer;
pub mod protocol;
pub mod seed;
pub mod socket;
pub mod tunnel;
pub mod version;
pub mod worker;

pub use error::{Error, Result};
pub use worker::Worker;
