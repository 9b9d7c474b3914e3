//! Worker groups: operating on a fixed set of peers as a unit
//!
//! - `channel`: broadcast, request, multicast and synchronize over a member set
//! - `variable`: group-scoped values converging on the newest write
//! - `authority`: locker and sync-queue held by a seed-chosen member
//! - `manager`: channel creation and the `0x02` link handshake

mod authority;
mod channel;
mod frame;
mod manager;
mod variable;

pub use authority::{Locker, SyncQueue};
pub use channel::{
    Channel, ChannelHandler, Confirm, GroupOutcome, SyncStatus, Synchronized, SynchronizeRound,
};
pub use frame::{ChannelDescriptor, ChannelId, GroupFrame, Outcome, RequestKind};
pub use manager::{ChannelCreatedHandler, WorkerGroupManager};
pub use variable::VariableState;
