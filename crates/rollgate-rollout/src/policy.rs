//! Rollout policy: the checks a grant must pass, and the rollout circuit
//! breaker.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use rollgate_state::*;
use tracing::{info, warn};

use crate::controller::Controller;
use crate::error::{RolloutError, RolloutResult};

/// Per-period caps at or above this value are treated as unlimited and skip
/// the stats query.
pub const UNLIMITED_UPDATES_PER_PERIOD: u32 = 900_000;

const OFFICE_OPEN_HOUR: u32 = 9;
const OFFICE_CLOSE_HOUR: u32 = 17;

/// Monday to Friday, 09:00 to 17:00 local time in `timezone` (UTC when unset).
///
/// An unknown timezone is never in office hours.
pub fn in_office_hours(now: DateTime<Utc>, timezone: Option<&str>) -> bool {
    let tz = match timezone.map(str::trim).filter(|name| !name.is_empty()) {
        None => Tz::UTC,
        Some(name) => match name.parse::<Tz>() {
            Ok(tz) => tz,
            Err(_) => {
                warn!(timezone = %name, "unknown timezone, treating as outside office hours");
                return false;
            }
        },
    };
    let local = now.with_timezone(&tz);
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    (OFFICE_OPEN_HOUR..OFFICE_CLOSE_HOUR).contains(&local.hour())
}

impl Controller {
    /// Check every group policy against the instance about to be granted
    /// `version`. Capacity denials put the instance on hold.
    pub(crate) fn enforce_rollout_policy(
        &self,
        instance: &InstanceApplication,
        group: &Group,
        version: &str,
        now: DateTime<Utc>,
    ) -> RolloutResult<()> {
        if !group.policy_updates_enabled {
            info!(group = %group.id, "updates disabled for group");
            return Err(RolloutError::UpdatesDisabled);
        }

        if group.policy_office_hours && !in_office_hours(now, group.policy_timezone.as_deref()) {
            info!(group = %group.id, timezone = ?group.policy_timezone, "outside office hours");
            return Err(RolloutError::UpdatesDisabled);
        }

        let stats = if group.policy_max_updates_per_period < UNLIMITED_UPDATES_PER_PERIOD
            || group.policy_safe_mode
        {
            self.updates_stats(group, version, now)?
        } else {
            UpdatesStats::default()
        };

        let mut max_updates = group.policy_max_updates_per_period;
        if group.policy_safe_mode && stats.updates_to_current_version_attempted == 0 {
            max_updates = 1;
        }

        if stats.updates_granted_in_last_period >= max_updates {
            info!(group = %group.id, granted = stats.updates_granted_in_last_period, max_updates, "per-period limit reached");
            self.hold(instance, now);
            return Err(RolloutError::MaxUpdatesPerPeriodLimitReached);
        }

        if stats.updates_in_progress >= max_updates {
            info!(group = %group.id, in_progress = stats.updates_in_progress, max_updates, "concurrent updates limit reached");
            self.hold(instance, now);
            return Err(RolloutError::MaxConcurrentUpdatesLimitReached);
        }

        if group.policy_safe_mode && stats.updates_timed_out >= max_updates {
            info!(group = %group.id, timed_out = stats.updates_timed_out, max_updates, "timed-out updates limit reached");
            self.trip_circuit_breaker(group, version, now);
            self.hold(instance, now);
            return Err(RolloutError::MaxTimedOutUpdatesLimitReached);
        }

        Ok(())
    }

    fn hold(&self, instance: &InstanceApplication, now: DateTime<Utc>) {
        if let Err(e) = self.store.update_instance_status(
            &instance.instance_id,
            &instance.application_id,
            InstanceStatus::OnHold,
            now,
        ) {
            warn!(instance = %instance.instance_id, error = %e, "putting instance on hold failed");
        }
    }

    /// Record a failed rollout and, when configured, stop it by disabling
    /// the group's updates.
    pub(crate) fn trip_circuit_breaker(&self, group: &Group, version: &str, now: DateTime<Utc>) {
        if self.config.disable_updates_on_failed_rollout {
            warn!(group = %group.id, %version, "rollout failed, disabling updates");
            if let Err(e) = self.store.set_group_updates_enabled(&group.id, false) {
                warn!(group = %group.id, error = %e, "disabling group updates failed");
            }
            if let Err(e) = self.store.set_group_rollout_in_progress(&group.id, false) {
                warn!(group = %group.id, error = %e, "clearing rollout flag failed");
            }
        } else {
            warn!(group = %group.id, %version, "rollout failed, leaving updates enabled");
        }
        self.log_group_activity(
            ActivityClass::RolloutFailed,
            ActivitySeverity::Error,
            version,
            &group.application_id,
            &group.id,
            now,
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone};

    use super::*;
    use crate::controller::{Admission, ControllerConfig};
    use crate::testutil::*;

    #[test]
    fn office_hours_in_utc() {
        // 2024-03-04 is a Monday.
        let at = |d, h, m| Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap();
        assert!(in_office_hours(at(4, 9, 0), None));
        assert!(in_office_hours(at(4, 16, 59), None));
        assert!(!in_office_hours(at(4, 8, 59), None));
        assert!(!in_office_hours(at(4, 17, 0), None));
        assert!(!in_office_hours(at(9, 12, 0), None));
        assert!(!in_office_hours(at(10, 12, 0), None));
    }

    #[test]
    fn office_hours_follow_timezone() {
        // 07:00 UTC is 16:00 in Tokyo and 02:00 in New York.
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 7, 0, 0).unwrap();
        assert!(in_office_hours(now, Some("Asia/Tokyo")));
        assert!(!in_office_hours(now, Some("America/New_York")));
        assert!(!in_office_hours(now, Some("UTC")));
        assert!(!in_office_hours(t0(), Some("Not/AZone")));
    }

    #[test]
    fn disabled_group_denies() {
        let fx = Fixture::new();
        fx.update_group(|g| g.policy_updates_enabled = false);
        assert!(matches!(fx.poll("i-1", "1.0.0"), Err(RolloutError::UpdatesDisabled)));
        assert_eq!(fx.row("i-1").status, InstanceStatus::Undefined);
    }

    #[test]
    fn office_hours_gate() {
        let fx = Fixture::new();
        fx.update_group(|g| g.policy_office_hours = true);
        fx.clock.set(Utc.with_ymd_and_hms(2024, 3, 4, 20, 0, 0).unwrap());
        assert!(matches!(fx.poll("i-1", "1.0.0"), Err(RolloutError::UpdatesDisabled)));
        fx.clock.set(t0());
        assert!(matches!(fx.poll("i-1", "1.0.0"), Ok(Admission::Update(_))));
    }

    #[test]
    fn per_period_limit_holds_instance() {
        let fx = Fixture::new();
        fx.update_group(|g| g.policy_max_updates_per_period = 2);
        fx.poll("i-1", "1.0.0").unwrap();
        fx.poll("i-2", "1.0.0").unwrap();
        assert!(matches!(
            fx.poll("i-3", "1.0.0"),
            Err(RolloutError::MaxUpdatesPerPeriodLimitReached)
        ));
        assert_eq!(fx.row("i-3").status, InstanceStatus::OnHold);

        // A new period opens, but both grants are still in flight.
        fx.clock.advance(TimeDelta::minutes(20));
        assert!(matches!(
            fx.poll("i-3", "1.0.0"),
            Err(RolloutError::MaxConcurrentUpdatesLimitReached)
        ));
    }

    #[test]
    fn held_instance_is_admitted_when_capacity_frees() {
        let fx = Fixture::new();
        fx.update_group(|g| g.policy_max_updates_per_period = 1);
        fx.poll("i-1", "1.0.0").unwrap();
        assert!(fx.poll("i-2", "1.0.0").is_err());

        fx.poll("i-1", "1.0.1").unwrap();
        fx.clock.advance(TimeDelta::minutes(20));
        assert!(matches!(fx.poll("i-2", "1.0.0"), Ok(Admission::Update(_))));
        assert_lifecycle_history(&fx, "i-2");
    }

    #[test]
    fn safe_mode_admits_single_canary() {
        let fx = Fixture::new();
        fx.update_group(|g| {
            g.policy_safe_mode = true;
            g.policy_max_updates_per_period = 10;
        });
        assert!(matches!(fx.poll("i-1", "1.0.0"), Ok(Admission::Update(_))));
        for id in ["i-2", "i-3", "i-4"] {
            assert!(matches!(
                fx.poll(id, "1.0.0"),
                Err(RolloutError::MaxUpdatesPerPeriodLimitReached)
            ));
        }

        // Once the canary lands, the configured cap applies.
        fx.poll("i-1", "1.0.1").unwrap();
        assert!(matches!(fx.poll("i-2", "1.0.0"), Ok(Admission::Update(_))));
    }

    #[test]
    fn timed_out_canary_trips_breaker() {
        let fx = Fixture::new();
        fx.update_group(|g| {
            g.policy_safe_mode = true;
            g.policy_max_updates_per_period = 10;
        });
        fx.poll("i-1", "1.0.0").unwrap();
        fx.clock.advance(TimeDelta::minutes(61));

        assert!(matches!(
            fx.poll("i-2", "1.0.0"),
            Err(RolloutError::MaxTimedOutUpdatesLimitReached)
        ));
        let group = fx.group();
        assert!(!group.policy_updates_enabled);
        assert!(!group.rollout_in_progress);
        assert_eq!(fx.activity_count(ActivityClass::RolloutFailed), 1);
        assert!(matches!(fx.poll("i-3", "1.0.0"), Err(RolloutError::UpdatesDisabled)));
    }

    #[test]
    fn breaker_respects_config() {
        let fx = Fixture::with_config(ControllerConfig {
            disable_updates_on_failed_rollout: false,
            ..ControllerConfig::default()
        });
        fx.update_group(|g| g.policy_safe_mode = true);
        fx.poll("i-1", "1.0.0").unwrap();
        fx.clock.advance(TimeDelta::minutes(61));
        assert!(matches!(
            fx.poll("i-2", "1.0.0"),
            Err(RolloutError::MaxTimedOutUpdatesLimitReached)
        ));
        assert!(fx.group().policy_updates_enabled);
        assert_eq!(fx.activity_count(ActivityClass::RolloutFailed), 1);
    }

    #[test]
    fn unlimited_group_skips_stats() {
        let fx = Fixture::new();
        // The timeout is only parsed by the stats query.
        fx.update_group(|g| g.policy_update_timeout = "whenever".to_string());
        assert!(fx.group().policy_max_updates_per_period >= UNLIMITED_UPDATES_PER_PERIOD);
        assert!(matches!(fx.poll("i-1", "1.0.0"), Ok(Admission::Update(_))));

        fx.update_group(|g| g.policy_safe_mode = true);
        assert!(matches!(
            fx.poll("i-2", "1.0.0"),
            Err(RolloutError::GetUpdatesStatsFailed)
        ));
    }
}
