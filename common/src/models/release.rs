use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// States a release moves through while the build pipeline runs.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ReleaseStatus {
    #[default]
    Pending,
    Building,
    Pushing,
    /// Immutable once entered.
    Ready,
    Failed,
}

impl ReleaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Release {
    pub id: Uuid,
    pub service_id: Uuid,
    /// Strictly monotonic per service, starting at 1.
    pub sequence: i64,
    pub git_sha: String,
    pub image_uri: Option<String>,
    pub image_digest: Option<String>,
    pub sbom_ref: Option<String>,
    pub signature_ref: Option<String>,
    pub provenance_ref: Option<String>,
    pub status: ReleaseStatus,
    pub created_at: DateTime<Utc>,
    pub builder_log_ref: Option<String>,
    /// Whether the dependency-manifest layer cache hit during the build.
    pub cache_hit: Option<bool>,
    /// Recorded determinism policy: a rebuild of the same sha either deduped
    /// to this release or appended a new one.
    pub digest_policy: Option<String>,
}

impl Release {
    pub fn short_sha(&self) -> &str {
        self.git_sha.get(..7).unwrap_or(&self.git_sha)
    }
}

/// What triggered a build.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum BuildTrigger {
    Push,
    PrOpen,
    PrSync,
    Manual,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn status_round_trip() {
        assert_eq!(ReleaseStatus::from_str("ready").unwrap(), ReleaseStatus::Ready);
        assert_eq!(ReleaseStatus::from_str("Pushing").unwrap(), ReleaseStatus::Pushing);
        assert_eq!(ReleaseStatus::Failed.to_string(), "failed");
        assert!(ReleaseStatus::Ready.is_terminal());
        assert!(!ReleaseStatus::Building.is_terminal());
    }

    #[test]
    fn trigger_round_trip() {
        assert_eq!(BuildTrigger::from_str("pr_open").unwrap(), BuildTrigger::PrOpen);
        assert_eq!(BuildTrigger::PrSync.to_string(), "pr_sync");
    }
}
