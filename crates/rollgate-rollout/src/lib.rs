//! rollgate-rollout — update admission for rollgate.
//!
//! Decides, per poll, whether an instance may receive its group's current
//! package.
//!
//! The engine keeps no state of its own: every decision recomputes the
//! group's rollout statistics from the store, so any number of replicas can
//! serve any instance. Limits are soft under concurrency; two polls may both
//! pass a check before either grant is written.
//!
//! # Components
//!
//! - **`controller`** — instance registration and the admission decision
//! - **`policy`** — updates-enabled, office hours, per-period and concurrency
//!   caps, safe-mode canary gate, rollout circuit breaker
//! - **`events`** — maps reported lifecycle events to status transitions and
//!   rollout consequences
//! - **`clock`** — time source, fixed in tests

pub mod clock;
pub mod controller;
pub mod error;
pub mod events;
pub mod policy;

#[cfg(test)]
mod testutil;

pub use clock::{Clock, FixedClock, SystemClock};
pub use controller::{Admission, Controller, ControllerConfig};
pub use error::{RolloutError, RolloutResult};
pub use events::EventReport;
pub use policy::in_office_hours;
