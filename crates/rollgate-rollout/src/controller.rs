//! Update admission: registers each poll and decides whether the instance
//! gets its group's current package.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rollgate_core::config::{ConfigError, RolloutConfig};
use rollgate_core::parse_interval;
use rollgate_state::*;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{RolloutError, RolloutResult};

/// Activity entries for the same occurrence are recorded at most once per window.
const ACTIVITY_DEDUP_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Instances that have not polled within this window are ignored by stats.
    pub validity_interval: Duration,
    /// Whether a failed rollout disables the group's updates.
    pub disable_updates_on_failed_rollout: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            validity_interval: Duration::from_secs(24 * 60 * 60),
            disable_updates_on_failed_rollout: true,
        }
    }
}

impl ControllerConfig {
    pub fn from_rollout_config(cfg: &RolloutConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            validity_interval: cfg.validity_interval()?,
            disable_updates_on_failed_rollout: cfg.disable_updates_on_failed_rollout,
        })
    }
}

/// Outcome of an update check that is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Serve this package.
    Update(Package),
    /// Nothing to do: the instance is current or the package is excluded.
    NoUpdate,
}

/// The admission engine. Cheap to clone; all state lives in the store.
#[derive(Clone)]
pub struct Controller {
    pub(crate) store: StateStore,
    pub(crate) config: ControllerConfig,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Controller {
    pub fn new(store: StateStore, config: ControllerConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: StateStore, config: ControllerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Record a poll from an instance without asking for an update.
    pub fn register_instance(
        &self,
        instance_id: &str,
        ip: &str,
        version: &str,
        app_id: &str,
        group_id: &str,
    ) -> RolloutResult<InstanceApplication> {
        let now = self.clock.now();
        self.register(instance_id, ip, version, app_id, group_id, now)
            .map(|(row, _)| row)
    }

    fn register(
        &self,
        instance_id: &str,
        ip: &str,
        version: &str,
        app_id: &str,
        group_id: &str,
        now: DateTime<Utc>,
    ) -> RolloutResult<(InstanceApplication, Group)> {
        parse_semver(version)?;
        let group = self.validate_application_and_group(app_id, group_id)?;
        self.store.upsert_instance(instance_id, ip, now)?;
        let row = self
            .store
            .upsert_instance_application(instance_id, app_id, group_id, version, now)?;
        debug!(instance = %instance_id, app = %app_id, group = %group_id, %version, "instance registered");
        Ok((row, group))
    }

    /// The group must exist and belong to `app_id`.
    pub fn validate_application_and_group(
        &self,
        app_id: &str,
        group_id: &str,
    ) -> RolloutResult<Group> {
        match self.store.get_group(group_id)? {
            Some(group) if group.application_id == app_id => Ok(group),
            _ => Err(RolloutError::InvalidApplicationOrGroup),
        }
    }

    /// Decide whether the polling instance may update to its group's package.
    pub fn get_update_package(
        &self,
        instance_id: &str,
        ip: &str,
        version: &str,
        app_id: &str,
        group_id: &str,
    ) -> RolloutResult<Admission> {
        let now = self.clock.now();
        let (instance, group) = self
            .register(instance_id, ip, version, app_id, group_id, now)
            .map_err(|e| {
                warn!(instance = %instance_id, app = %app_id, group = %group_id, error = %e, "registering instance failed");
                RolloutError::RegisterInstanceFailed
            })?;

        if instance.status.is_applying() {
            debug!(instance = %instance_id, status = ?instance.status, "update already being applied");
            return Err(RolloutError::UpdateInProgressOnInstance);
        }

        let Some((channel, package)) = self.group_package(&group)? else {
            self.log_group_activity(
                ActivityClass::PackageNotFound,
                ActivitySeverity::Warning,
                "0.0.0",
                app_id,
                group_id,
                now,
            );
            return Err(RolloutError::NoPackageFound);
        };

        if package.channels_blacklist.contains(&channel.id) {
            debug!(package = %package.id, channel = %channel.id, "package excluded from channel");
            self.finalize_pending_update(&instance, now)?;
            return Ok(Admission::NoUpdate);
        }

        let instance_semver = parse_semver(&instance.version)?;
        let package_semver = parse_semver(&package.version)?;
        if instance_semver >= package_semver {
            self.finalize_pending_update(&instance, now)?;
            return Ok(Admission::NoUpdate);
        }

        if instance.status == InstanceStatus::UpdateGranted
            && instance.has_pending_grant_for(&package.version)
        {
            debug!(instance = %instance_id, version = %package.version, "update already granted");
            return Ok(Admission::Update(package));
        }

        self.enforce_rollout_policy(&instance, &group, &package.version, now)?;

        self.store
            .grant_update(instance_id, app_id, &package.version, now)
            .map_err(|e| {
                warn!(instance = %instance_id, app = %app_id, error = %e, "granting update failed");
                RolloutError::GrantingUpdate
            })?;
        info!(
            instance = %instance_id,
            app = %app_id,
            group = %group_id,
            from = %instance.version,
            to = %package.version,
            "update granted"
        );

        self.log_group_activity(
            ActivityClass::RolloutStarted,
            ActivitySeverity::Info,
            &package.version,
            app_id,
            group_id,
            now,
        );
        if !group.rollout_in_progress {
            if let Err(e) = self.store.set_group_rollout_in_progress(group_id, true) {
                warn!(group = %group_id, error = %e, "marking rollout in progress failed");
            }
        }

        Ok(Admission::Update(package))
    }

    /// Complete an update that was granted but is no longer needed.
    fn finalize_pending_update(
        &self,
        instance: &InstanceApplication,
        now: DateTime<Utc>,
    ) -> RolloutResult<()> {
        if instance.update_in_progress {
            self.store.update_instance_status(
                &instance.instance_id,
                &instance.application_id,
                InstanceStatus::Complete,
                now,
            )?;
        }
        Ok(())
    }

    /// The group's channel and the package it currently serves, if both exist.
    pub(crate) fn group_package(&self, group: &Group) -> RolloutResult<Option<(Channel, Package)>> {
        let Some(channel_id) = &group.channel_id else {
            return Ok(None);
        };
        let Some(channel) = self.store.get_channel(channel_id)? else {
            return Ok(None);
        };
        let Some(package_id) = &channel.package_id else {
            return Ok(None);
        };
        Ok(self.store.get_package(package_id)?.map(|p| (channel, p)))
    }

    /// Rollout statistics for a group against its current package version.
    pub fn group_updates_stats(&self, group_id: &str) -> RolloutResult<UpdatesStats> {
        let group = self
            .store
            .get_group(group_id)?
            .ok_or(RolloutError::InvalidApplicationOrGroup)?;
        let version = self
            .group_package(&group)?
            .map(|(_, p)| p.version)
            .unwrap_or_default();
        self.updates_stats(&group, &version, self.clock.now())
    }

    pub(crate) fn updates_stats(
        &self,
        group: &Group,
        version: &str,
        now: DateTime<Utc>,
    ) -> RolloutResult<UpdatesStats> {
        let intervals = parse_interval(&group.policy_period_interval)
            .and_then(|p| parse_interval(&group.policy_update_timeout).map(|t| (p, t)));
        let (period, update_timeout) = intervals.map_err(|e| {
            warn!(group = %group.id, error = %e, "invalid group policy interval");
            RolloutError::GetUpdatesStatsFailed
        })?;
        self.store
            .group_updates_stats(&StatsQuery {
                group_id: &group.id,
                version,
                period,
                update_timeout,
                validity: self.config.validity_interval,
                now,
            })
            .map_err(|e| {
                warn!(group = %group.id, error = %e, "computing updates stats failed");
                RolloutError::GetUpdatesStatsFailed
            })
    }

    pub(crate) fn log_group_activity(
        &self,
        class: ActivityClass,
        severity: ActivitySeverity,
        version: &str,
        app_id: &str,
        group_id: &str,
        now: DateTime<Utc>,
    ) {
        self.record_activity(Activity {
            id: Uuid::new_v4(),
            class,
            severity,
            version: version.to_string(),
            application_id: app_id.to_string(),
            group_id: Some(group_id.to_string()),
            instance_id: None,
            created_ts: now,
        });
    }

    pub(crate) fn log_instance_activity(
        &self,
        class: ActivityClass,
        severity: ActivitySeverity,
        version: &str,
        instance: &InstanceApplication,
        now: DateTime<Utc>,
    ) {
        self.record_activity(Activity {
            id: Uuid::new_v4(),
            class,
            severity,
            version: version.to_string(),
            application_id: instance.application_id.clone(),
            group_id: Some(instance.group_id.clone()),
            instance_id: Some(instance.instance_id.clone()),
            created_ts: now,
        });
    }

    fn record_activity(&self, entry: Activity) {
        match self.store.insert_activity(&entry, Some(ACTIVITY_DEDUP_WINDOW)) {
            Ok(true) => info!(
                class = ?entry.class,
                severity = ?entry.severity,
                version = %entry.version,
                group = ?entry.group_id,
                instance = ?entry.instance_id,
                "activity recorded"
            ),
            Ok(false) => {}
            Err(e) => warn!(class = ?entry.class, error = %e, "recording activity failed"),
        }
    }
}

pub(crate) fn parse_semver(version: &str) -> RolloutResult<semver::Version> {
    semver::Version::parse(version.trim())
        .map_err(|_| RolloutError::InvalidSemver(version.to_string()))
}
