//! Lifecycle events reported by instances during an admitted update.

use chrono::{DateTime, Utc};
use rollgate_state::*;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::controller::Controller;
use crate::error::{RolloutError, RolloutResult};

/// One `<event>` as reported by an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReport {
    pub event_type: EventType,
    pub result: EventResult,
    pub previous_version: String,
    pub error_code: String,
}

impl EventReport {
    pub fn new(event_type: EventType, result: EventResult) -> Self {
        Self {
            event_type,
            result,
            previous_version: String::new(),
            error_code: String::new(),
        }
    }

    fn is_reboot_completion(&self) -> bool {
        self.event_type == EventType::UpdateComplete && self.result == EventResult::SuccessReboot
    }
}

impl Controller {
    /// Record an event and apply its consequences. Only accepted while the
    /// instance has an update in progress for the application.
    pub fn register_event(
        &self,
        instance_id: &str,
        app_id: &str,
        group_id: &str,
        report: &EventReport,
    ) -> RolloutResult<()> {
        let group = self.validate_application_and_group(app_id, group_id)?;
        let instance = self
            .store
            .get_instance_application(instance_id, app_id)?
            .ok_or(RolloutError::InvalidInstance)?;

        if !instance.update_in_progress {
            debug!(instance = %instance_id, app = %app_id, "event without update in progress");
            return Err(RolloutError::NoUpdateInProgress);
        }

        if report.is_reboot_completion()
            && instance.last_update_version.as_deref() != Some(report.previous_version.as_str())
        {
            warn!(
                instance = %instance_id,
                previous_version = %report.previous_version,
                last_update_version = ?instance.last_update_version,
                "completion does not match granted version"
            );
            return Err(RolloutError::EventRegistrationFailed);
        }

        let now = self.clock.now();
        self.store.insert_event(&Event {
            id: Uuid::new_v4(),
            instance_id: instance_id.to_string(),
            application_id: app_id.to_string(),
            event_type: report.event_type,
            result: report.result,
            previous_version: report.previous_version.clone(),
            error_code: report.error_code.clone(),
            created_ts: now,
        })?;
        debug!(
            instance = %instance_id,
            event_type = report.event_type.code(),
            result = report.result.code(),
            "event recorded"
        );

        self.trigger_event_consequences(&instance, &group, report, now)
    }

    fn trigger_event_consequences(
        &self,
        instance: &InstanceApplication,
        group: &Group,
        report: &EventReport,
        now: DateTime<Utc>,
    ) -> RolloutResult<()> {
        let granted = instance.last_update_version.clone().unwrap_or_default();
        let set_status = |status| {
            self.store.update_instance_status(
                &instance.instance_id,
                &instance.application_id,
                status,
                now,
            )
        };

        match (report.event_type, report.result) {
            (_, EventResult::Failed) => {
                set_status(InstanceStatus::Error)?;
                self.log_instance_activity(
                    ActivityClass::InstanceUpdateFailed,
                    ActivitySeverity::Error,
                    &granted,
                    instance,
                    now,
                );
                let version = self.rollout_version(group, &granted)?;
                let stats = self.updates_stats(group, &version, now)?;
                if stats.updates_to_current_version_attempted == 1 {
                    self.trip_circuit_breaker(group, &version, now);
                }
            }
            (EventType::UpdateComplete, EventResult::SuccessReboot) => {
                set_status(InstanceStatus::Complete)?;
                let version = self.rollout_version(group, &granted)?;
                let stats = self.updates_stats(group, &version, now)?;
                if stats.total_instances > 0
                    && stats.updates_to_current_version_succeeded == stats.total_instances
                {
                    info!(group = %group.id, %version, "rollout finished");
                    if let Err(e) = self.store.set_group_rollout_in_progress(&group.id, false) {
                        warn!(group = %group.id, error = %e, "clearing rollout flag failed");
                    }
                    self.log_group_activity(
                        ActivityClass::RolloutFinished,
                        ActivitySeverity::Success,
                        &version,
                        &group.application_id,
                        &group.id,
                        now,
                    );
                }
            }
            (EventType::UpdateDownloadStarted, EventResult::Success) => {
                set_status(InstanceStatus::Downloading)?;
            }
            (EventType::UpdateDownloadFinished, EventResult::Success) => {
                set_status(InstanceStatus::Downloaded)?;
            }
            (EventType::UpdateInstalled, EventResult::Success) => {
                set_status(InstanceStatus::Installed)?;
            }
            (event_type, result) => {
                debug!(?event_type, ?result, "event has no status consequence");
            }
        }
        Ok(())
    }

    /// The version the group is currently rolling out, falling back to the
    /// one granted to the reporting instance.
    fn rollout_version(&self, group: &Group, granted: &str) -> RolloutResult<String> {
        Ok(self
            .group_package(group)?
            .map(|(_, package)| package.version)
            .unwrap_or_else(|| granted.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Admission;
    use crate::testutil::*;

    fn report(event_type: u32, result: u32) -> EventReport {
        EventReport::new(EventType::from_code(event_type), EventResult::from_code(result))
    }

    fn send(fx: &Fixture, instance_id: &str, report: &EventReport) -> RolloutResult<()> {
        fx.controller.register_event(instance_id, APP, GROUP, report)
    }

    fn completion() -> EventReport {
        EventReport {
            previous_version: "1.0.1".to_string(),
            ..report(3, 2)
        }
    }

    #[test]
    fn full_update_cycle_finishes_rollout() {
        let fx = Fixture::new();
        fx.poll("i-1", "1.0.0").unwrap();
        assert!(fx.group().rollout_in_progress);

        send(&fx, "i-1", &report(13, 1)).unwrap();
        assert_eq!(fx.row("i-1").status, InstanceStatus::Downloading);
        send(&fx, "i-1", &report(14, 1)).unwrap();
        assert_eq!(fx.row("i-1").status, InstanceStatus::Downloaded);
        send(&fx, "i-1", &report(800, 1)).unwrap();
        assert_eq!(fx.row("i-1").status, InstanceStatus::Installed);
        send(&fx, "i-1", &completion()).unwrap();

        let row = fx.row("i-1");
        assert_eq!(row.status, InstanceStatus::Complete);
        assert_eq!(row.version, "1.0.1");
        assert!(!row.update_in_progress);
        assert!(!fx.group().rollout_in_progress);
        assert_eq!(fx.activity_count(ActivityClass::RolloutFinished), 1);
        assert_eq!(fx.store.list_events("i-1", APP).unwrap().len(), 4);
        assert_lifecycle_history(&fx, "i-1");
    }

    #[test]
    fn rollout_not_finished_while_instances_lag() {
        let fx = Fixture::new();
        fx.poll("i-1", "1.0.0").unwrap();
        fx.controller
            .register_instance("i-2", "10.0.0.2", "1.0.0", APP, GROUP)
            .unwrap();
        send(&fx, "i-1", &completion()).unwrap();
        assert!(fx.group().rollout_in_progress);
        assert_eq!(fx.activity_count(ActivityClass::RolloutFinished), 0);
    }

    #[test]
    fn events_require_update_in_progress() {
        let fx = Fixture::new();
        fx.controller
            .register_instance("i-1", "10.0.0.1", "1.0.0", APP, GROUP)
            .unwrap();
        assert!(matches!(
            send(&fx, "i-1", &report(13, 1)),
            Err(RolloutError::NoUpdateInProgress)
        ));
        assert!(matches!(
            send(&fx, "i-unknown", &report(13, 1)),
            Err(RolloutError::InvalidInstance)
        ));
        assert!(matches!(
            fx.controller.register_event("i-1", "other-app", GROUP, &report(13, 1)),
            Err(RolloutError::InvalidApplicationOrGroup)
        ));
        assert!(fx.store.list_events("i-1", APP).unwrap().is_empty());
    }

    #[test]
    fn mismatched_completion_is_rejected() {
        let fx = Fixture::new();
        fx.poll("i-1", "1.0.0").unwrap();
        let stale = EventReport {
            previous_version: "0.9.0".to_string(),
            ..report(3, 2)
        };
        assert!(matches!(
            send(&fx, "i-1", &stale),
            Err(RolloutError::EventRegistrationFailed)
        ));
        assert_eq!(fx.row("i-1").status, InstanceStatus::UpdateGranted);
        assert!(fx.store.list_events("i-1", APP).unwrap().is_empty());
    }

    #[test]
    fn failure_marks_error_and_records_activity() {
        let fx = Fixture::new();
        fx.poll("i-1", "1.0.0").unwrap();
        let failed = EventReport {
            error_code: "268435456".to_string(),
            ..report(3, 0)
        };
        send(&fx, "i-1", &failed).unwrap();

        let row = fx.row("i-1");
        assert_eq!(row.status, InstanceStatus::Error);
        assert_eq!(row.version, "1.0.0");
        assert_eq!(fx.activity_count(ActivityClass::InstanceUpdateFailed), 1);
    }

    #[test]
    fn first_failed_attempt_disables_group_without_safe_mode() {
        let fx = Fixture::new();
        fx.poll("i-1", "1.0.0").unwrap();
        send(&fx, "i-1", &report(3, 0)).unwrap();

        assert!(!fx.group().policy_updates_enabled);
        assert_eq!(fx.activity_count(ActivityClass::RolloutFailed), 1);
    }

    #[test]
    fn later_failures_leave_group_enabled() {
        let fx = Fixture::new();
        fx.poll("i-1", "1.0.0").unwrap();
        fx.poll("i-2", "1.0.0").unwrap();
        fx.poll("i-1", "1.0.1").unwrap();
        send(&fx, "i-2", &report(3, 0)).unwrap();

        assert_eq!(fx.row("i-2").status, InstanceStatus::Error);
        assert!(fx.group().policy_updates_enabled);
        assert_eq!(fx.activity_count(ActivityClass::RolloutFailed), 0);
        assert!(matches!(fx.poll("i-3", "1.0.0"), Ok(Admission::Update(_))));
    }

    #[test]
    fn failed_safe_mode_canary_disables_group() {
        let fx = Fixture::new();
        fx.update_group(|g| g.policy_safe_mode = true);
        fx.poll("i-1", "1.0.0").unwrap();
        send(&fx, "i-1", &report(3, 0)).unwrap();

        let group = fx.group();
        assert!(!group.policy_updates_enabled);
        assert!(!group.rollout_in_progress);
        assert_eq!(fx.activity_count(ActivityClass::RolloutFailed), 1);
        assert!(matches!(fx.poll("i-2", "1.0.0"), Err(RolloutError::UpdatesDisabled)));
    }

    #[test]
    fn unmapped_success_events_only_append() {
        let fx = Fixture::new();
        fx.poll("i-1", "1.0.0").unwrap();
        send(&fx, "i-1", &report(3, 1)).unwrap();
        send(&fx, "i-1", &report(42, 1)).unwrap();
        assert_eq!(fx.row("i-1").status, InstanceStatus::UpdateGranted);
        assert_eq!(fx.store.list_events("i-1", APP).unwrap().len(), 2);
    }
}
