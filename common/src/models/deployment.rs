use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// States a deployment can be in.
///
/// `BuildingThrough` and `PushingThrough` cover deployment intents created
/// while the referenced release is still being produced (deploy-on-push);
/// the reconciler holds the key until the release turns ready.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum DeploymentStatus {
    #[default]
    Queued,
    BuildingThrough,
    PushingThrough,
    Deploying,
    Verifying,
    Running,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Running | Self::Failed | Self::RolledBack)
    }

    /// Legal edges of the state machine. Anything else is a bug in the
    /// caller and is rejected at the store.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Queued, BuildingThrough)
                | (Queued, PushingThrough)
                | (Queued, Deploying)
                | (Queued, Failed)
                | (BuildingThrough, PushingThrough)
                | (BuildingThrough, Deploying)
                | (BuildingThrough, Failed)
                | (PushingThrough, Deploying)
                | (PushingThrough, Failed)
                | (Deploying, Verifying)
                | (Deploying, Failed)
                | (Verifying, Running)
                | (Verifying, Failed)
                | (Failed, RolledBack)
        )
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// The algorithm used to replace running pods.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Strategy {
    #[default]
    Rolling,
    Recreate,
    BlueGreen,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub release_id: Uuid,
    pub environment_id: Uuid,
    pub replicas_desired: u32,
    pub replicas_ready: u32,
    pub status: DeploymentStatus,
    pub health: HealthState,
    pub strategy: Strategy,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// For rollbacks: the deployment this one replaces.
    pub previous_deployment_id: Option<Uuid>,
    pub error: Option<String>,
}

/// A signed provenance summary emitted for every terminal deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Receipt {
    pub deployment_id: Uuid,
    pub release_id: Uuid,
    pub git_sha: String,
    pub pr_url: Option<String>,
    pub pr_approver: Option<String>,
    pub image_digest: Option<String>,
    pub signature_ref: Option<String>,
    pub sbom_ref: Option<String>,
    pub deployed_by: String,
    pub deployed_at: DateTime<Utc>,
    /// Base64 Ed25519 signature over the canonical newline-delimited
    /// `key=value` rendering of the fields above.
    pub signed_payload: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub outcome: String,
    pub context: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(DeploymentStatus::Running.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
        assert!(DeploymentStatus::RolledBack.is_terminal());
        assert!(!DeploymentStatus::Verifying.is_terminal());
    }

    #[test]
    fn legal_transitions() {
        use DeploymentStatus::*;
        assert!(Queued.can_transition_to(Deploying));
        assert!(Deploying.can_transition_to(Verifying));
        assert!(Verifying.can_transition_to(Running));
        assert!(Verifying.can_transition_to(Failed));
        assert!(Failed.can_transition_to(RolledBack));

        assert!(!Running.can_transition_to(Failed));
        assert!(!Queued.can_transition_to(Running));
        assert!(!RolledBack.can_transition_to(Deploying));
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(DeploymentStatus::RolledBack.to_string(), "rolled_back");
        assert_eq!(DeploymentStatus::BuildingThrough.to_string(), "building_through");
        assert_eq!(Strategy::BlueGreen.to_string(), "blue_green");
    }
}
