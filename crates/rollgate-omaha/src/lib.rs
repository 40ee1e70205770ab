//! rollgate Omaha protocol layer.
//!
//! Decodes Omaha v3 update-check requests, runs every `<app>` entry through
//! the rollout engine, and encodes the per-app response. Engine errors are
//! reduced to a fixed vocabulary of status tokens here; internal details
//! never reach the wire.

pub mod error;
pub mod handler;
pub mod protocol;

pub use error::OmahaError;
pub use handler::{Handler, resolve_arch, status_token};
pub use protocol::{Request, Response};
