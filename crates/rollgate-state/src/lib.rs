//! rollgate-state — fleet state store for rollgate.
//!
//! Backed by [redb](https://docs.rs/redb), holds applications, groups,
//! channels, packages, the per-(instance, application) rows every poll
//! upserts, and the append-only event, status history and activity logs.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys are built from length-prefixed segments (`{len}:{part}`)
//! followed, for logs, by `{ts}:{seq}`. They enable prefix scans for related
//! records, and a group index table lets statistics scan one group's rows.
//! Every store method runs in a single redb transaction, so each one is
//! individually atomic.
//!
//! Rows whose `last_check_for_updates` is older than the validity interval
//! are never deleted; aggregate queries simply filter them out.

pub mod error;
pub mod status;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use status::InstanceStatus;
pub use store::StateStore;
pub use types::*;
