use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Where a log line came from.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum LogSource {
    /// Emitted by a build pipeline stage.
    Build,
    /// Streamed from a running pod.
    Runtime,
}

/// One line of build or runtime output, addressed by the release or
/// deployment it belongs to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogItem {
    pub id: Uuid,
    pub source: LogSource,
    pub timestamp: DateTime<Utc>,
    /// Build stage or pod name.
    pub origin: String,
    pub line: String,
}

impl LogItem {
    pub fn build(release_id: Uuid, stage: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            id: release_id,
            source: LogSource::Build,
            timestamp: Utc::now(),
            origin: stage.into(),
            line: line.into(),
        }
    }

    pub fn runtime(deployment_id: Uuid, pod: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            id: deployment_id,
            source: LogSource::Runtime,
            timestamp: Utc::now(),
            origin: pod.into(),
            line: line.into(),
        }
    }
}
