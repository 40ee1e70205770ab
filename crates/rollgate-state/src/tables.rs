//! redb table definitions for the rollgate state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys join length-prefixed segments (`{len}:{part}`, written
//! `<part>` below), so client-supplied ids cannot collide with each other.
//! Append-only logs embed a zero-padded microsecond timestamp in the key so
//! a lexicographic scan is also a chronological one.

use redb::TableDefinition;

/// Applications keyed by `{app_id}`.
pub const APPLICATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("applications");

/// Groups keyed by `{group_id}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Channels keyed by `{channel_id}`.
pub const CHANNELS: TableDefinition<&str, &[u8]> = TableDefinition::new("channels");

/// Packages keyed by `{package_id}`.
pub const PACKAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("packages");

/// Instances keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Per-application instance rows keyed by `<instance_id><app_id>`.
pub const INSTANCE_APPLICATIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("instance_applications");

/// Group membership index keyed by `<group_id><instance_id><app_id>`.
/// The value is the row's `INSTANCE_APPLICATIONS` key.
pub const GROUP_INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("group_instances");

/// Status history keyed by `<instance_id><app_id>{ts}:{seq}`.
pub const STATUS_HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("status_history");

/// Reported events keyed by `<instance_id><app_id>{ts}:{seq}`.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");

/// Activity entries keyed by `{ts}:{uuid}`.
pub const ACTIVITY: TableDefinition<&str, &[u8]> = TableDefinition::new("activity");
