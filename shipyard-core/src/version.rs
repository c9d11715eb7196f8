//! Semantic chart versions (`major.minor.patch`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChartVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ChartVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Next patch within the same `major.minor` bucket.
    pub fn bump_patch(&self) -> Self {
        Self {
            patch: self.patch.saturating_add(1),
            ..*self
        }
    }

    pub fn same_bucket(&self, other: &ChartVersion) -> bool {
        self.major == other.major && self.minor == other.minor
    }

    /// First version a new bucket starts at.
    pub fn first_in_bucket(major: u32, minor: u32) -> Self {
        Self::new(major, minor, 1)
    }

    /// Whether the chart renders app-metrics hooks (3.7 and later).
    pub fn supports_app_metrics(&self) -> bool {
        (self.major, self.minor) >= (3, 7)
    }
}

impl fmt::Display for ChartVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Error when parsing an invalid version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartVersionParseError(pub String);

impl fmt::Display for ChartVersionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid chart version: {}", self.0)
    }
}

impl std::error::Error for ChartVersionParseError {}

impl FromStr for ChartVersion {
    type Err = ChartVersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(ChartVersionParseError(s.to_string()));
        }
        let num = |p: &str| p.parse::<u32>().map_err(|_| ChartVersionParseError(s.to_string()));
        Ok(Self {
            major: num(parts[0])?,
            minor: num(parts[1])?,
            patch: num(parts[2])?,
        })
    }
}
