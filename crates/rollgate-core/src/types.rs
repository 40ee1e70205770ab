//! Shared types used across rollgate crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CPU architecture a package or channel targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// Matches every architecture.
    All,
    Amd64,
    Aarch64,
    X86,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid architecture: {0}")]
pub struct ParseArchError(pub String);

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::All => "all",
            Arch::Amd64 => "amd64",
            Arch::Aarch64 => "aarch64",
            Arch::X86 => "x86",
        }
    }

    /// Map an Omaha `board` string (e.g. `amd64-usr`) to an architecture.
    pub fn from_board(board: &str) -> Option<Self> {
        match board.trim() {
            "amd64-usr" => Some(Arch::Amd64),
            "arm64-usr" => Some(Arch::Aarch64),
            _ => None,
        }
    }

    /// Map an Omaha `os.arch` string to an architecture.
    pub fn from_os_arch(arch: &str) -> Option<Self> {
        match arch.trim().to_ascii_lowercase().as_str() {
            "x64" | "x86_64" | "amd64" => Some(Arch::Amd64),
            "arm64" | "aarch64" => Some(Arch::Aarch64),
            "x86" | "i686" => Some(Arch::X86),
            _ => None,
        }
    }

    /// True if a package built for `self` may be served to `other`.
    pub fn serves(&self, other: Arch) -> bool {
        *self == Arch::All || other == Arch::All || *self == other
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = ParseArchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Arch::All),
            "amd64" | "x86_64" | "x64" => Ok(Arch::Amd64),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            "x86" => Ok(Arch::X86),
            _ => Err(ParseArchError(s.to_string())),
        }
    }
}
