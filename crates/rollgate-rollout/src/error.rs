//! Admission and event errors.
//!
//! Every variant except [`RolloutError::State`] is part of the bounded
//! vocabulary the protocol layer maps to client-visible status tokens.

use rollgate_state::StateError;
use thiserror::Error;

pub type RolloutResult<T> = Result<T, RolloutError>;

#[derive(Debug, Error)]
pub enum RolloutError {
    // Registration
    #[error("instance registration failed")]
    RegisterInstanceFailed,
    #[error("invalid application or group")]
    InvalidApplicationOrGroup,
    #[error("invalid semantic version: {0}")]
    InvalidSemver(String),
    #[error("unknown instance")]
    InvalidInstance,

    // Admission
    #[error("an update is already being applied on this instance")]
    UpdateInProgressOnInstance,
    #[error("no package found for group")]
    NoPackageFound,
    #[error("updates disabled for group")]
    UpdatesDisabled,
    #[error("max updates per period limit reached")]
    MaxUpdatesPerPeriodLimitReached,
    #[error("max concurrent updates limit reached")]
    MaxConcurrentUpdatesLimitReached,
    #[error("max timed out updates limit reached")]
    MaxTimedOutUpdatesLimitReached,
    #[error("could not compute group updates stats")]
    GetUpdatesStatsFailed,
    #[error("failed to grant update")]
    GrantingUpdate,

    // Events
    #[error("no update in progress for instance")]
    NoUpdateInProgress,
    #[error("event rejected")]
    EventRegistrationFailed,

    #[error(transparent)]
    State(#[from] StateError),
}

impl RolloutError {
    /// A rollout policy refused the update; the instance should poll again later.
    pub fn is_policy_denial(&self) -> bool {
        matches!(
            self,
            RolloutError::UpdatesDisabled
                | RolloutError::MaxUpdatesPerPeriodLimitReached
                | RolloutError::MaxConcurrentUpdatesLimitReached
                | RolloutError::MaxTimedOutUpdatesLimitReached
        )
    }
}
