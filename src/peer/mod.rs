//! Worker peer directory and authenticity checks
//!
//! Every worker knows the other members of its shoal by integer worker id:
//! - `directory`: connector settings, detail and authenticity data per peer,
//!   plus join / update / leave change notifications
//! - `auth`: proofs exchanged during the worker handshake

pub mod auth;
pub mod directory;

pub use auth::*;
pub use directory::*;

/// Integer worker identifier. `0` is reserved for a prospective joiner.
pub type WorkerId = u64;

/// Worker id used by a worker that has not joined a shoal yet
pub const PROSPECTIVE_WORKER_ID: WorkerId = 0;
