//! Persistent, replicated publish/subscribe streaming core
//!
//! granary layers a durable, replayable log on top of a lightweight
//! subject based router: streams own an append-only message store,
//! consumers hold per-subscriber cursors with acknowledgment tracking
//! and redelivery, and a replicated catalog assigns everything to
//! peers. The wire types live in [`granary_proto`], the storage
//! engine in [`granary_store`].

pub use granary_proto as proto;
pub use granary_store as store;

mod account;
mod advisory;
mod api;
mod consumer;
mod meta;
mod raft;
mod router;
mod server;
mod source;
mod stream;
mod timer;

pub use crate::server::{Server, ServerBuilder, DEFAULT_ACCOUNT};

pub mod core {
    //! The building blocks of a running instance

    pub use crate::account::{Account, Usage};
    pub use crate::advisory::Advisories;
    pub use crate::consumer::{ConsumerHandle, ConsumerState, PendingEntry};
    pub use crate::meta::{MetaHandle, NodeInfo, StreamAssignment};
    pub use crate::router::{Router, Subscription};
    pub use crate::stream::{StreamHandle, StreamSnapshot};
}

pub mod cluster {
    //! Consensus groups and the in-process peer transport

    pub use crate::raft::{
        spawn_replica, Applied, GroupError, GroupHandle, GroupNetwork, GroupStatus, NodeId,
        Replica,
    };
}

pub mod error {
    //! Errors surfaced by the core

    pub use crate::router::RequestError;
    pub use crate::stream::SnapshotDecodeError;
    pub use granary_proto::error::{ApiError, ErrorCode, Response};
}
