//! Publishing destinations (target platforms).

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lower-cased platform name a post is published to (e.g. `linkedin`).
///
/// Normalised on construction so registry and rate-limiter lookups never
/// depend on the casing the planner happened to store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Destination(String);

impl Destination {
    pub const LINKEDIN: &'static str = "linkedin";
    pub const INSTAGRAM: &'static str = "instagram";
    pub const TWITTER: &'static str = "twitter";
    pub const FACEBOOK: &'static str = "facebook";
    pub const MASTODON: &'static str = "mastodon";
    pub const THREAD: &'static str = "thread";

    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Destination {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Destination {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Destination {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Destination> for String {
    fn from(value: Destination) -> Self {
        value.0
    }
}

impl FromStr for Destination {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let d = Self::new(s);
        if d.0.is_empty() {
            return Err(DomainError::validation("destination must not be empty"));
        }
        Ok(d)
    }
}
