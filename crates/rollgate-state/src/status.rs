//! Instance update status and its transition table.

use serde::{Deserialize, Serialize};

/// Where an instance is in its update cycle for one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Undefined,
    UpdateGranted,
    Downloading,
    Downloaded,
    Installed,
    Complete,
    Error,
    OnHold,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 8] = [
        InstanceStatus::Undefined,
        InstanceStatus::UpdateGranted,
        InstanceStatus::Downloading,
        InstanceStatus::Downloaded,
        InstanceStatus::Installed,
        InstanceStatus::Complete,
        InstanceStatus::Error,
        InstanceStatus::OnHold,
    ];

    /// Stable integer code, in canonical order.
    pub fn code(self) -> u8 {
        match self {
            InstanceStatus::Undefined => 0,
            InstanceStatus::UpdateGranted => 1,
            InstanceStatus::Downloading => 2,
            InstanceStatus::Downloaded => 3,
            InstanceStatus::Installed => 4,
            InstanceStatus::Complete => 5,
            InstanceStatus::Error => 6,
            InstanceStatus::OnHold => 7,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// An update was granted and has not finished yet.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            InstanceStatus::UpdateGranted
                | InstanceStatus::Downloading
                | InstanceStatus::Downloaded
                | InstanceStatus::Installed
        )
    }

    /// The client has started acting on a granted update.
    pub fn is_applying(self) -> bool {
        matches!(
            self,
            InstanceStatus::Downloading | InstanceStatus::Downloaded | InstanceStatus::Installed
        )
    }

    /// Whether moving from `self` to `next` follows the update lifecycle.
    ///
    /// Writing the current status again is always allowed (it is a no-op).
    /// `Undefined` is reachable from anywhere because moving an instance to
    /// another group resets it.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;

        if self == next {
            return true;
        }
        match (self, next) {
            (_, Undefined) | (_, OnHold) => true,
            (Undefined | Complete | Error | OnHold, UpdateGranted) => true,
            (from, Complete | Error) => from.is_in_progress(),
            (UpdateGranted, Downloading | Downloaded | Installed) => true,
            (Downloading, Downloaded | Installed) => true,
            (Downloaded, Installed) => true,
            _ => false,
        }
    }
}
