//! Domain types for the rollgate state store.
//!
//! These types represent the persisted fleet state: the catalog
//! (applications, groups, channels, packages), the per-instance rows that
//! every poll upserts, and the append-only logs (events, status history,
//! activity). All types are serializable to/from JSON for storage in redb.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rollgate_core::Arch;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::InstanceStatus;

pub type ApplicationId = String;
pub type GroupId = String;
pub type ChannelId = String;
pub type PackageId = String;
pub type InstanceId = String;

// ── Catalog ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Application {
    pub id: ApplicationId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_ts: DateTime<Utc>,
}

/// A cohort of instances sharing one rollout policy and one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub application_id: ApplicationId,
    pub channel_id: Option<ChannelId>,
    pub policy_updates_enabled: bool,
    /// Canary gate: one instance must attempt a new version before any
    /// parallel rollout.
    pub policy_safe_mode: bool,
    /// Only grant updates Mon–Fri 09:00–17:00 in `policy_timezone`.
    pub policy_office_hours: bool,
    /// IANA timezone name; UTC when absent.
    pub policy_timezone: Option<String>,
    /// Window for `policy_max_updates_per_period`, e.g. `"15 minutes"`.
    pub policy_period_interval: String,
    pub policy_max_updates_per_period: u32,
    /// Granted updates older than this and still in progress count as timed out.
    pub policy_update_timeout: String,
    pub rollout_in_progress: bool,
    pub created_ts: DateTime<Utc>,
}

impl Group {
    /// A group with permissive defaults: updates on, no safe mode, no
    /// office hours, effectively unlimited updates per period.
    pub fn new(id: &str, application_id: &str, name: &str, created_ts: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            application_id: application_id.to_string(),
            channel_id: None,
            policy_updates_enabled: true,
            policy_safe_mode: false,
            policy_office_hours: false,
            policy_timezone: None,
            policy_period_interval: "15 minutes".to_string(),
            policy_max_updates_per_period: 999_999,
            policy_update_timeout: "60 minutes".to_string(),
            rollout_in_progress: false,
            created_ts,
        }
    }
}

/// A named pointer to the package currently served to groups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub application_id: ApplicationId,
    pub package_id: Option<PackageId>,
    pub arch: Arch,
    pub created_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    /// Operating system update image; carries a [`FlatcarAction`].
    Flatcar,
    Docker,
    Rkt,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Package {
    pub id: PackageId,
    pub application_id: ApplicationId,
    pub package_type: PackageType,
    pub version: String,
    /// Base download URL; `filename` is appended by the client.
    pub url: String,
    pub filename: Option<String>,
    #[serde(default)]
    pub description: String,
    pub size: Option<String>,
    /// Base64 SHA-1 of the payload.
    pub hash: Option<String>,
    /// Channels that must not serve this package.
    #[serde(default)]
    pub channels_blacklist: Vec<ChannelId>,
    pub arch: Arch,
    pub flatcar_action: Option<FlatcarAction>,
    pub created_ts: DateTime<Utc>,
}

/// Install semantics for a platform update package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlatcarAction {
    pub event: String,
    #[serde(default)]
    pub chromeos_version: String,
    /// Base64 SHA-256 of the payload.
    pub sha256: String,
    pub needs_admin: bool,
    pub is_delta: bool,
    pub disable_payload_backoff: bool,
    #[serde(default)]
    pub metadata_signature_rsa: String,
    #[serde(default)]
    pub metadata_size: String,
    #[serde(default)]
    pub deadline: String,
}

// ── Instances ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub ip: String,
    pub created_ts: DateTime<Utc>,
}

/// Mutable per-(instance, application) state, upserted on every poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceApplication {
    pub instance_id: InstanceId,
    pub application_id: ApplicationId,
    pub group_id: GroupId,
    /// Version the instance last reported.
    pub version: String,
    pub status: InstanceStatus,
    pub last_check_for_updates: DateTime<Utc>,
    pub last_update_granted_ts: Option<DateTime<Utc>>,
    pub last_update_version: Option<String>,
    /// Always equal to `status.is_in_progress()` after a store write.
    pub update_in_progress: bool,
    pub created_ts: DateTime<Utc>,
}

impl InstanceApplication {
    pub fn table_key(&self) -> String {
        instance_application_key(&self.instance_id, &self.application_id)
    }

    /// True if `version` was granted and that update is still running.
    pub fn has_pending_grant_for(&self, version: &str) -> bool {
        self.update_in_progress && self.last_update_version.as_deref() == Some(version)
    }
}

pub(crate) fn instance_application_key(instance_id: &str, app_id: &str) -> String {
    format!("{}{}", key_segment(instance_id), key_segment(app_id))
}

/// Self-delimiting key segment `{len}:{part}`.
///
/// Concatenated segments never share a prefix unless their parts are
/// equal, whatever characters the parts contain.
pub(crate) fn key_segment(part: &str) -> String {
    format!("{}:{part}", part.len())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusHistoryEntry {
    pub instance_id: InstanceId,
    pub application_id: ApplicationId,
    pub group_id: GroupId,
    pub status: InstanceStatus,
    pub version: String,
    pub created_ts: DateTime<Utc>,
}

// ── Events ────────────────────────────────────────────────────────

/// Omaha event type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    UpdateComplete,
    UpdateDownloadStarted,
    UpdateDownloadFinished,
    UpdateInstalled,
    Other(u32),
}

impl EventType {
    pub fn from_code(code: u32) -> Self {
        match code {
            3 => EventType::UpdateComplete,
            13 => EventType::UpdateDownloadStarted,
            14 => EventType::UpdateDownloadFinished,
            800 => EventType::UpdateInstalled,
            other => EventType::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            EventType::UpdateComplete => 3,
            EventType::UpdateDownloadStarted => 13,
            EventType::UpdateDownloadFinished => 14,
            EventType::UpdateInstalled => 800,
            EventType::Other(code) => code,
        }
    }
}

/// Omaha event result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventResult {
    Failed,
    Success,
    SuccessReboot,
    Other(u32),
}

impl EventResult {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => EventResult::Failed,
            1 => EventResult::Success,
            2 => EventResult::SuccessReboot,
            other => EventResult::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            EventResult::Failed => 0,
            EventResult::Success => 1,
            EventResult::SuccessReboot => 2,
            EventResult::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Uuid,
    pub instance_id: InstanceId,
    pub application_id: ApplicationId,
    pub event_type: EventType,
    pub result: EventResult,
    pub previous_version: String,
    pub error_code: String,
    pub created_ts: DateTime<Utc>,
}

// ── Activity ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityClass {
    RolloutStarted,
    RolloutFinished,
    RolloutFailed,
    InstanceUpdateFailed,
    PackageNotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySeverity {
    Success,
    Info,
    Warning,
    Error,
}

/// Operator-facing audit record of a rollout consequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    pub id: Uuid,
    pub class: ActivityClass,
    pub severity: ActivitySeverity,
    pub version: String,
    pub application_id: ApplicationId,
    pub group_id: Option<GroupId>,
    pub instance_id: Option<InstanceId>,
    pub created_ts: DateTime<Utc>,
}

impl Activity {
    /// Two entries describe the same occurrence (for deduplication).
    pub fn same_occurrence(&self, other: &Activity) -> bool {
        self.class == other.class
            && self.severity == other.severity
            && self.version == other.version
            && self.application_id == other.application_id
            && self.group_id == other.group_id
            && self.instance_id == other.instance_id
    }
}

// ── Rollout statistics ────────────────────────────────────────────

/// Parameters of one rollout statistics computation.
#[derive(Debug, Clone)]
pub struct StatsQuery<'a> {
    pub group_id: &'a str,
    /// The group's current channel package version.
    pub version: &'a str,
    pub period: Duration,
    pub update_timeout: Duration,
    pub validity: Duration,
    pub now: DateTime<Utc>,
}

/// Aggregate counts over a group's non-stale instance rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatesStats {
    pub total_instances: u32,
    pub updates_to_current_version_granted: u32,
    pub updates_to_current_version_attempted: u32,
    pub updates_to_current_version_succeeded: u32,
    pub updates_to_current_version_failed: u32,
    pub updates_granted_in_last_period: u32,
    pub updates_in_progress: u32,
    pub updates_timed_out: u32,
}
