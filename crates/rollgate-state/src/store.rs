//! StateStore — redb-backed fleet state for rollgate.
//!
//! Every public method opens exactly one redb transaction, so each call is
//! individually atomic. Nothing spans calls: the admission engine reads
//! statistics and writes grants in separate transactions.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use rollgate_core::Arch;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::status::InstanceStatus;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type KvDef = TableDefinition<'static, &'static str, &'static [u8]>;
type KvTable<'txn> = redb::Table<'txn, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for def in [
            APPLICATIONS,
            GROUPS,
            CHANNELS,
            PACKAGES,
            INSTANCES,
            INSTANCE_APPLICATIONS,
            GROUP_INSTANCES,
            STATUS_HISTORY,
            EVENTS,
            ACTIVITY,
        ] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn get<T: DeserializeOwned>(&self, def: KvDef, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        load(&table, key)
    }

    fn put<T: Serialize>(&self, def: KvDef, key: &str, value: &T) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            save(&mut table, key, value)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn scan_prefix<T: DeserializeOwned>(&self, def: KvDef, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    // ── Applications ───────────────────────────────────────────────

    pub fn put_application(&self, app: &Application) -> StateResult<()> {
        self.put(APPLICATIONS, &app.id, app)?;
        debug!(app = %app.id, "application stored");
        Ok(())
    }

    pub fn get_application(&self, id: &str) -> StateResult<Option<Application>> {
        self.get(APPLICATIONS, id)
    }

    // ── Groups ─────────────────────────────────────────────────────

    /// Insert or update a group. Its channel must belong to the same application.
    pub fn put_group(&self, group: &Group) -> StateResult<()> {
        let value = encode(group)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let apps = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            if load::<Application, _>(&apps, &group.application_id)?.is_none() {
                return Err(StateError::NotFound(format!(
                    "application {}",
                    group.application_id
                )));
            }
            if let Some(channel_id) = &group.channel_id {
                let channels = txn.open_table(CHANNELS).map_err(map_err!(Table))?;
                let channel: Channel = load(&channels, channel_id)?
                    .ok_or_else(|| StateError::NotFound(format!("channel {channel_id}")))?;
                if channel.application_id != group.application_id {
                    return Err(StateError::Integrity(format!(
                        "channel {channel_id} belongs to application {}, group {} to {}",
                        channel.application_id, group.id, group.application_id
                    )));
                }
            }
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            table
                .insert(group.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(group = %group.id, "group stored");
        Ok(())
    }

    pub fn get_group(&self, id: &str) -> StateResult<Option<Group>> {
        self.get(GROUPS, id)
    }

    pub fn list_groups(&self) -> StateResult<Vec<Group>> {
        self.scan_prefix(GROUPS, "")
    }

    pub fn set_group_updates_enabled(&self, id: &str, enabled: bool) -> StateResult<()> {
        self.modify_group(id, |g| g.policy_updates_enabled = enabled)?;
        debug!(group = %id, enabled, "group updates toggled");
        Ok(())
    }

    pub fn set_group_rollout_in_progress(&self, id: &str, in_progress: bool) -> StateResult<()> {
        self.modify_group(id, |g| g.rollout_in_progress = in_progress)?;
        debug!(group = %id, in_progress, "group rollout flag set");
        Ok(())
    }

    fn modify_group(&self, id: &str, f: impl FnOnce(&mut Group)) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            let mut group: Group =
                load(&table, id)?.ok_or_else(|| StateError::NotFound(format!("group {id}")))?;
            f(&mut group);
            save(&mut table, id, &group)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Channels ───────────────────────────────────────────────────

    /// Insert or update a channel. Its package must belong to the same application.
    pub fn put_channel(&self, channel: &Channel) -> StateResult<()> {
        let value = encode(channel)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let apps = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            if load::<Application, _>(&apps, &channel.application_id)?.is_none() {
                return Err(StateError::NotFound(format!(
                    "application {}",
                    channel.application_id
                )));
            }
            if let Some(package_id) = &channel.package_id {
                let packages = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
                let package: Package = load(&packages, package_id)?
                    .ok_or_else(|| StateError::NotFound(format!("package {package_id}")))?;
                if package.application_id != channel.application_id {
                    return Err(StateError::Integrity(format!(
                        "package {package_id} belongs to application {}, channel {} to {}",
                        package.application_id, channel.id, channel.application_id
                    )));
                }
            }
            let mut table = txn.open_table(CHANNELS).map_err(map_err!(Table))?;
            table
                .insert(channel.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(channel = %channel.id, package = ?channel.package_id, "channel stored");
        Ok(())
    }

    pub fn get_channel(&self, id: &str) -> StateResult<Option<Channel>> {
        self.get(CHANNELS, id)
    }

    // ── Packages ───────────────────────────────────────────────────

    /// Insert or update a package. Blacklisted channels must belong to the
    /// package's application.
    pub fn put_package(&self, package: &Package) -> StateResult<()> {
        let value = encode(package)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let apps = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            if load::<Application, _>(&apps, &package.application_id)?.is_none() {
                return Err(StateError::NotFound(format!(
                    "application {}",
                    package.application_id
                )));
            }
            let channels = txn.open_table(CHANNELS).map_err(map_err!(Table))?;
            for channel_id in &package.channels_blacklist {
                let channel: Channel = load(&channels, channel_id)?
                    .ok_or_else(|| StateError::NotFound(format!("channel {channel_id}")))?;
                if channel.application_id != package.application_id {
                    return Err(StateError::Integrity(format!(
                        "blacklisted channel {channel_id} belongs to application {}",
                        channel.application_id
                    )));
                }
            }
            let mut table = txn.open_table(PACKAGES).map_err(map_err!(Table))?;
            table
                .insert(package.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(package = %package.id, version = %package.version, "package stored");
        Ok(())
    }

    pub fn get_package(&self, id: &str) -> StateResult<Option<Package>> {
        self.get(PACKAGES, id)
    }

    /// Find an application's package for `version` built for `arch`.
    pub fn get_package_by_version_and_arch(
        &self,
        app_id: &str,
        version: &str,
        arch: Arch,
    ) -> StateResult<Option<Package>> {
        let packages: Vec<Package> = self.scan_prefix(PACKAGES, "")?;
        Ok(packages
            .into_iter()
            .find(|p| p.application_id == app_id && p.version == version && p.arch.serves(arch)))
    }

    pub fn get_flatcar_action(&self, package_id: &str) -> StateResult<Option<FlatcarAction>> {
        Ok(self
            .get_package(package_id)?
            .and_then(|p| p.flatcar_action))
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert an instance or refresh its IP, keeping its creation time.
    pub fn upsert_instance(&self, id: &str, ip: &str, now: DateTime<Utc>) -> StateResult<Instance> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let instance;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            instance = match load::<Instance, _>(&table, id)? {
                Some(existing) => Instance {
                    ip: ip.to_string(),
                    ..existing
                },
                None => Instance {
                    id: id.to_string(),
                    ip: ip.to_string(),
                    created_ts: now,
                },
            };
            save(&mut table, id, &instance)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(instance)
    }

    pub fn get_instance(&self, id: &str) -> StateResult<Option<Instance>> {
        self.get(INSTANCES, id)
    }

    /// Record a poll: create or refresh the (instance, application) row.
    ///
    /// Moving to another group resets the row's status to `Undefined` and
    /// moves the row's group index entry.
    pub fn upsert_instance_application(
        &self,
        instance_id: &str,
        app_id: &str,
        group_id: &str,
        version: &str,
        now: DateTime<Utc>,
    ) -> StateResult<InstanceApplication> {
        let key = instance_application_key(instance_id, app_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let row;
        {
            let mut table = txn.open_table(INSTANCE_APPLICATIONS).map_err(map_err!(Table))?;
            let mut index = txn.open_table(GROUP_INSTANCES).map_err(map_err!(Table))?;
            row = match load::<InstanceApplication, _>(&table, &key)? {
                Some(mut existing) => {
                    if existing.group_id != group_id {
                        index
                            .remove(group_index_key(&existing.group_id, &key).as_str())
                            .map_err(map_err!(Write))?;
                        debug!(
                            instance = %instance_id,
                            app = %app_id,
                            from = %existing.group_id,
                            to = %group_id,
                            "instance moved to another group"
                        );
                        existing.group_id = group_id.to_string();
                        existing.status = InstanceStatus::Undefined;
                        existing.update_in_progress = false;
                    }
                    existing.version = version.to_string();
                    existing.last_check_for_updates = now;
                    existing
                }
                None => InstanceApplication {
                    instance_id: instance_id.to_string(),
                    application_id: app_id.to_string(),
                    group_id: group_id.to_string(),
                    version: version.to_string(),
                    status: InstanceStatus::Undefined,
                    last_check_for_updates: now,
                    last_update_granted_ts: None,
                    last_update_version: None,
                    update_in_progress: false,
                    created_ts: now,
                },
            };
            save(&mut table, &key, &row)?;
            index
                .insert(group_index_key(group_id, &key).as_str(), key.as_bytes())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(row)
    }

    pub fn get_instance_application(
        &self,
        instance_id: &str,
        app_id: &str,
    ) -> StateResult<Option<InstanceApplication>> {
        self.get(INSTANCE_APPLICATIONS, &instance_application_key(instance_id, app_id))
    }

    /// Mark `version` as granted to the instance and move it to `UpdateGranted`.
    pub fn grant_update(
        &self,
        instance_id: &str,
        app_id: &str,
        version: &str,
        now: DateTime<Utc>,
    ) -> StateResult<InstanceApplication> {
        self.modify_instance_application(instance_id, app_id, now, |row| {
            row.last_update_version = Some(version.to_string());
            row.last_update_granted_ts = Some(now);
            Some(InstanceStatus::UpdateGranted)
        })
        .map(|(row, _)| row)
    }

    /// Write a new status for the instance and append a history entry.
    ///
    /// Returns `false` without writing anything when the stored status
    /// already equals `status`.
    pub fn update_instance_status(
        &self,
        instance_id: &str,
        app_id: &str,
        status: InstanceStatus,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        self.modify_instance_application(instance_id, app_id, now, |_| Some(status))
            .map(|(_, changed)| changed)
    }

    /// Apply `f` to the row and, if it asks for a status change, write the
    /// status and its history entry in the same transaction.
    fn modify_instance_application(
        &self,
        instance_id: &str,
        app_id: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut InstanceApplication) -> Option<InstanceStatus>,
    ) -> StateResult<(InstanceApplication, bool)> {
        let key = instance_application_key(instance_id, app_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut row: InstanceApplication;
        let mut changed = false;
        {
            let mut table = txn.open_table(INSTANCE_APPLICATIONS).map_err(map_err!(Table))?;
            let before: Option<InstanceApplication> = load(&table, &key)?;
            row = before.clone().ok_or_else(|| {
                StateError::NotFound(format!("instance {instance_id} application {app_id}"))
            })?;
            let requested = f(&mut row);
            if let Some(status) = requested.filter(|s| *s != row.status) {
                let entry = apply_status(&mut row, status, now);
                let mut history = txn.open_table(STATUS_HISTORY).map_err(map_err!(Table))?;
                let history_key = sequenced_key(&history, &key, now)?;
                save(&mut history, &history_key, &entry)?;
                changed = true;
            }
            if changed || before.as_ref() != Some(&row) {
                save(&mut table, &key, &row)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if changed {
            debug!(
                instance = %instance_id,
                app = %app_id,
                status = ?row.status,
                version = %row.version,
                "instance status updated"
            );
        }
        Ok((row, changed))
    }

    pub fn list_status_history(
        &self,
        instance_id: &str,
        app_id: &str,
    ) -> StateResult<Vec<StatusHistoryEntry>> {
        let prefix = instance_application_key(instance_id, app_id);
        self.scan_prefix(STATUS_HISTORY, &prefix)
    }

    // ── Events ─────────────────────────────────────────────────────

    pub fn insert_event(&self, event: &Event) -> StateResult<()> {
        let prefix = instance_application_key(&event.instance_id, &event.application_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            let key = sequenced_key(&table, &prefix, event.created_ts)?;
            save(&mut table, &key, event)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn list_events(&self, instance_id: &str, app_id: &str) -> StateResult<Vec<Event>> {
        let prefix = instance_application_key(instance_id, app_id);
        self.scan_prefix(EVENTS, &prefix)
    }

    // ── Activity ───────────────────────────────────────────────────

    /// Append an activity entry.
    ///
    /// With a `dedup_window`, the entry is dropped (returning `false`) when
    /// an entry for the same occurrence was recorded within the window.
    pub fn insert_activity(
        &self,
        entry: &Activity,
        dedup_window: Option<Duration>,
    ) -> StateResult<bool> {
        let key = format!("{}{}", ts_key(entry.created_ts, ""), entry.id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ACTIVITY).map_err(map_err!(Table))?;
            if let Some(window) = dedup_window {
                let cutoff = ts_key(since(entry.created_ts, window), "");
                for item in table.range(cutoff.as_str()..).map_err(map_err!(Read))? {
                    let (_, value) = item.map_err(map_err!(Read))?;
                    let existing: Activity = decode(value.value())?;
                    if existing.same_occurrence(entry) {
                        debug!(class = ?entry.class, version = %entry.version, "duplicate activity suppressed");
                        return Ok(false);
                    }
                }
            }
            save(&mut table, &key, entry)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(true)
    }

    /// Most recent activity entries, newest first.
    pub fn list_activity(&self, limit: usize) -> StateResult<Vec<Activity>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIVITY).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }

    // ── Rollout statistics ─────────────────────────────────────────

    /// Aggregate a group's non-stale instance rows against a reference version.
    ///
    /// Rows whose last poll is older than `query.validity` are skipped.
    pub fn group_updates_stats(&self, query: &StatsQuery<'_>) -> StateResult<UpdatesStats> {
        let valid_since = since(query.now, query.validity);
        let period_start = since(query.now, query.period);
        let timeout = to_delta(query.update_timeout);

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(GROUP_INSTANCES).map_err(map_err!(Table))?;
        let table = txn.open_table(INSTANCE_APPLICATIONS).map_err(map_err!(Table))?;
        let prefix = key_segment(query.group_id);
        let mut stats = UpdatesStats::default();
        for entry in index.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix.as_str()) {
                break;
            }
            let row_key = std::str::from_utf8(value.value()).map_err(map_err!(Deserialize))?;
            let Some(row) = load::<InstanceApplication, _>(&table, row_key)? else {
                continue;
            };
            if row.last_check_for_updates <= valid_since {
                continue;
            }
            stats.total_instances += 1;

            if row.last_update_version.as_deref() == Some(query.version) {
                stats.updates_to_current_version_granted += 1;
                if !row.update_in_progress {
                    stats.updates_to_current_version_attempted += 1;
                    if row.version == query.version {
                        stats.updates_to_current_version_succeeded += 1;
                    } else {
                        stats.updates_to_current_version_failed += 1;
                    }
                }
            }

            if let Some(granted) = row.last_update_granted_ts {
                if granted > period_start {
                    stats.updates_granted_in_last_period += 1;
                }
                if row.update_in_progress {
                    if query.now.signed_duration_since(granted) <= timeout {
                        stats.updates_in_progress += 1;
                    } else {
                        stats.updates_timed_out += 1;
                    }
                }
            }
        }
        Ok(stats)
    }
}

// ── Free helpers ───────────────────────────────────────────────────

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn load<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn save<T: Serialize>(table: &mut KvTable<'_>, key: &str, value: &T) -> StateResult<()> {
    let bytes = encode(value)?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Set the status on a row and build its history entry.
///
/// `Complete` finalizes the pending version: the row's version becomes the
/// last granted one.
fn apply_status(
    row: &mut InstanceApplication,
    status: InstanceStatus,
    now: DateTime<Utc>,
) -> StatusHistoryEntry {
    if !row.status.can_transition_to(status) {
        debug!(
            instance = %row.instance_id,
            app = %row.application_id,
            from = ?row.status,
            to = ?status,
            "status write outside the update lifecycle"
        );
    }
    if status == InstanceStatus::Complete {
        if let Some(version) = &row.last_update_version {
            row.version = version.clone();
        }
    }
    row.status = status;
    row.update_in_progress = status.is_in_progress();
    StatusHistoryEntry {
        instance_id: row.instance_id.clone(),
        application_id: row.application_id.clone(),
        group_id: row.group_id.clone(),
        status,
        version: row.version.clone(),
        created_ts: now,
    }
}

/// `GROUP_INSTANCES` key for an `INSTANCE_APPLICATIONS` row key.
fn group_index_key(group_id: &str, row_key: &str) -> String {
    format!("{}{row_key}", key_segment(group_id))
}

/// `{prefix}{micros:020}:`; lexicographic order equals chronological order.
fn ts_key(ts: DateTime<Utc>, prefix: &str) -> String {
    format!("{prefix}{:020}:", ts.timestamp_micros().max(0))
}

/// `{prefix}{micros:020}:{seq:06}`, where `seq` orders entries that share
/// a timestamp.
fn sequenced_key(table: &KvTable<'_>, prefix: &str, ts: DateTime<Utc>) -> StateResult<String> {
    let stamp = ts_key(ts, prefix);
    let mut seq = 0usize;
    for entry in table.range(stamp.as_str()..).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        if !key.value().starts_with(stamp.as_str()) {
            break;
        }
        seq += 1;
    }
    Ok(format!("{stamp}{seq:06}"))
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

fn since(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_delta(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
