//! Shared fixture for engine tests: one application with a single channel
//! serving package 1.0.1 to one group.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rollgate_core::Arch;
use rollgate_state::*;

use crate::clock::FixedClock;
use crate::controller::{Admission, Controller, ControllerConfig};
use crate::error::RolloutResult;

pub(crate) const APP: &str = "e96281a6-d1af-4bde-9a0a-97b76e56dc57";
pub(crate) const GROUP: &str = "stable";
pub(crate) const CHANNEL: &str = "ch-stable";
pub(crate) const PACKAGE: &str = "pkg-101";

/// Monday 2024-03-04 12:00 UTC.
pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
}

pub(crate) struct Fixture {
    pub controller: Controller,
    pub store: StateStore,
    pub clock: Arc<FixedClock>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_application(&Application {
                id: APP.to_string(),
                name: "Flatcar".to_string(),
                description: String::new(),
                created_ts: t0(),
            })
            .unwrap();
        store
            .put_package(&Package {
                id: PACKAGE.to_string(),
                application_id: APP.to_string(),
                package_type: PackageType::Flatcar,
                version: "1.0.1".to_string(),
                url: "https://update.example.com/1.0.1/".to_string(),
                filename: Some("update.gz".to_string()),
                description: String::new(),
                size: Some("1024".to_string()),
                hash: Some("c2hhMQ==".to_string()),
                channels_blacklist: Vec::new(),
                arch: Arch::Amd64,
                flatcar_action: None,
                created_ts: t0(),
            })
            .unwrap();
        store
            .put_channel(&Channel {
                id: CHANNEL.to_string(),
                name: "stable".to_string(),
                application_id: APP.to_string(),
                package_id: Some(PACKAGE.to_string()),
                arch: Arch::Amd64,
                created_ts: t0(),
            })
            .unwrap();
        let mut group = Group::new(GROUP, APP, "Stable", t0());
        group.channel_id = Some(CHANNEL.to_string());
        store.put_group(&group).unwrap();

        let clock = Arc::new(FixedClock::new(t0()));
        let controller = Controller::with_clock(store.clone(), config, clock.clone());
        Self {
            controller,
            store,
            clock,
        }
    }

    pub fn poll(&self, instance_id: &str, version: &str) -> RolloutResult<Admission> {
        self.controller
            .get_update_package(instance_id, "10.0.0.1", version, APP, GROUP)
    }

    pub fn row(&self, instance_id: &str) -> InstanceApplication {
        self.store
            .get_instance_application(instance_id, APP)
            .unwrap()
            .unwrap()
    }

    pub fn group(&self) -> Group {
        self.store.get_group(GROUP).unwrap().unwrap()
    }

    pub fn update_group(&self, f: impl FnOnce(&mut Group)) {
        let mut group = self.group();
        f(&mut group);
        self.store.put_group(&group).unwrap();
    }

    pub fn update_channel(&self, f: impl FnOnce(&mut Channel)) {
        let mut channel = self.store.get_channel(CHANNEL).unwrap().unwrap();
        f(&mut channel);
        self.store.put_channel(&channel).unwrap();
    }

    pub fn update_package(&self, f: impl FnOnce(&mut Package)) {
        let mut package = self.store.get_package(PACKAGE).unwrap().unwrap();
        f(&mut package);
        self.store.put_package(&package).unwrap();
    }

    pub fn activity_count(&self, class: ActivityClass) -> usize {
        self.store
            .list_activity(1000)
            .unwrap()
            .iter()
            .filter(|a| a.class == class)
            .count()
    }
}

/// Every recorded status change must be a legal lifecycle step.
pub(crate) fn assert_lifecycle_history(fx: &Fixture, instance_id: &str) {
    let history = fx.store.list_status_history(instance_id, APP).unwrap();
    let mut previous = InstanceStatus::Undefined;
    for entry in history {
        assert!(
            previous.can_transition_to(entry.status),
            "{instance_id}: {previous:?} -> {:?}",
            entry.status
        );
        previous = entry.status;
    }
}
