//! Source-forge event intake: HMAC authentication, service resolution,
//! build enqueueing, and the preview-environment lifecycle. The
//! auto-deploy coordinator rides the change stream and turns ready
//! releases into deployment intents.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use enclii_common::models::deployment::{DeploymentStatus, Strategy};
use enclii_common::models::error::ErrorKind;
use enclii_common::models::project::EnvironmentName;
use enclii_common::models::release::BuildTrigger;
use enclii_common::models::service::Service;

use crate::build::{BuildManager, BuildOutcome};
use crate::persistence::{BuildJob, Change, DeployOutcome, Persistence};
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Constant-time verification of `sha256=<hex>` webhook signatures.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> Result<()> {
    let signature = header
        .and_then(|value| value.strip_prefix("sha256="))
        .ok_or_else(|| Error::from_kind(ErrorKind::InvalidSignature))?;
    let signature =
        hex::decode(signature).map_err(|_| Error::from_kind(ErrorKind::InvalidSignature))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::source(ErrorKind::Internal, e))?;
    mac.update(body);
    mac.verify_slice(&signature)
        .map_err(|_| Error::from_kind(ErrorKind::InvalidSignature))
}

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct PullRequestHead {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestInner {
    head: PullRequestHead,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    action: String,
    number: u32,
    pull_request: PullRequestInner,
    repository: Repository,
}

/// What the intake did with one delivery; drives the HTTP response and
/// the audit outcome.
#[derive(Debug, Default, serde::Serialize)]
pub struct IntakeSummary {
    pub affected_services: usize,
    pub builds_enqueued: usize,
    pub deduplicated: usize,
    pub previews_touched: usize,
}

impl IntakeSummary {
    pub fn audit_outcome(&self) -> &'static str {
        if self.affected_services > 0 && self.builds_enqueued == 0 {
            "dedup"
        } else {
            "success"
        }
    }
}

pub struct Intake {
    persistence: Persistence,
    builds: BuildManager,
}

impl Intake {
    pub fn new(persistence: Persistence, builds: BuildManager) -> Self {
        Self {
            persistence,
            builds,
        }
    }

    /// Resolution policy: every service whose repo matches the event's
    /// repository. Branch filtering happens per event type.
    async fn resolve_services(&self, full_name: &str) -> Result<Vec<Service>> {
        let mut services = self.persistence.services_by_repo(full_name).await?;
        if services.is_empty() {
            services = self
                .persistence
                .services_by_repo(&format!("github.com/{full_name}"))
                .await?;
        }
        Ok(services)
    }

    #[instrument(skip(self, body))]
    pub async fn handle(&self, event_type: &str, body: &[u8]) -> Result<IntakeSummary> {
        match event_type {
            "push" => self.handle_push(body).await,
            "pull_request" => self.handle_pull_request(body).await,
            other => {
                info!(event = other, "ignoring unhandled webhook event");
                Ok(IntakeSummary::default())
            }
        }
    }

    async fn handle_push(&self, body: &[u8]) -> Result<IntakeSummary> {
        let payload: PushPayload =
            serde_json::from_slice(body).map_err(|e| Error::source(ErrorKind::Validation, e))?;
        let Some(branch) = payload.git_ref.strip_prefix("refs/heads/") else {
            return Ok(IntakeSummary::default());
        };
        if payload.after.is_empty() {
            return Ok(IntakeSummary::default());
        }

        let mut summary = IntakeSummary::default();
        for service in self.resolve_services(&payload.repository.full_name).await? {
            if service.git_branch != branch {
                continue;
            }
            summary.affected_services += 1;

            match self
                .builds
                .request_build(
                    service.id,
                    &payload.after,
                    BuildTrigger::Push,
                    None,
                    false,
                    "webhook",
                )
                .await?
            {
                BuildOutcome::Started(_) => summary.builds_enqueued += 1,
                BuildOutcome::Deduped(_) | BuildOutcome::Existing(_) => {
                    summary.deduplicated += 1
                }
            }
        }

        Ok(summary)
    }

    async fn handle_pull_request(&self, body: &[u8]) -> Result<IntakeSummary> {
        let payload: PullRequestPayload =
            serde_json::from_slice(body).map_err(|e| Error::source(ErrorKind::Validation, e))?;

        let mut summary = IntakeSummary::default();
        let services = self.resolve_services(&payload.repository.full_name).await?;

        match payload.action.as_str() {
            "opened" | "synchronize" => {
                let trigger = if payload.action == "opened" {
                    BuildTrigger::PrOpen
                } else {
                    BuildTrigger::PrSync
                };

                for service in services {
                    summary.affected_services += 1;

                    let project = self.persistence.get_project(service.project_id).await?;
                    self.persistence
                        .ensure_preview_environment(&project, payload.number, "webhook")
                        .await?;
                    summary.previews_touched += 1;

                    match self
                        .builds
                        .request_build(
                            service.id,
                            &payload.pull_request.head.sha,
                            trigger,
                            Some(payload.number),
                            false,
                            "webhook",
                        )
                        .await?
                    {
                        BuildOutcome::Started(_) => summary.builds_enqueued += 1,
                        BuildOutcome::Deduped(_) | BuildOutcome::Existing(_) => {
                            summary.deduplicated += 1
                        }
                    }
                }
            }
            "closed" => {
                for service in services {
                    summary.affected_services += 1;

                    let name = EnvironmentName::Preview(payload.number);
                    if let Some(environment) = self
                        .persistence
                        .find_environment(service.project_id, &name)
                        .await?
                    {
                        if !environment.draining {
                            self.persistence
                                .set_environment_draining(environment.id, "webhook")
                                .await?;
                        }
                        summary.previews_touched += 1;
                    }
                }
            }
            other => {
                info!(action = other, "ignoring pull request action");
            }
        }

        Ok(summary)
    }
}

/// Watches the change stream and deploys ready releases for auto-deploy
/// services: pushes land in the production environment, pull requests in
/// their preview environment.
pub struct AutoDeployer {
    persistence: Persistence,
}

impl AutoDeployer {
    pub fn new(persistence: Persistence) -> Self {
        Self { persistence }
    }

    pub fn spawn(self) {
        let mut changes = self.persistence.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(Change::ReleaseReady {
                        service_id,
                        release_id,
                    }) => {
                        if let Err(err) = self.deploy_release(service_id, release_id).await {
                            error!(error = %err, %release_id, "auto-deploy failed");
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "auto-deployer lagged behind the change stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn deploy_release(&self, service_id: Uuid, release_id: Uuid) -> Result<()> {
        let service = self.persistence.get_service(service_id).await?;
        if !service.auto_deploy {
            return Ok(());
        }

        let release = self.persistence.get_release(release_id).await?;
        let job = self.persistence.job_for_release(release_id).await?;

        let environment_name = match job.as_ref() {
            Some(BuildJob {
                pr_number: Some(pr_number),
                ..
            }) => EnvironmentName::Preview(*pr_number),
            Some(job) if job.trigger == BuildTrigger::Push => EnvironmentName::Production,
            // Manual builds deploy manually.
            _ => return Ok(()),
        };

        let Some(environment) = self
            .persistence
            .find_environment(service.project_id, &environment_name)
            .await?
        else {
            info!(
                environment = %environment_name,
                service = %service.name,
                "auto-deploy target environment does not exist"
            );
            return Ok(());
        };

        match self
            .persistence
            .begin_deployment(
                &service,
                &environment,
                &release,
                Strategy::Rolling,
                service.runtime_config.replicas,
                DeploymentStatus::Queued,
                None,
                false,
                "auto-deploy",
            )
            .await
        {
            Ok(DeployOutcome::Started(deployment)) => {
                info!(
                    deployment_id = %deployment.id,
                    environment = %environment_name,
                    "auto-deploy started"
                );
                Ok(())
            }
            Ok(DeployOutcome::AlreadyRunning(_)) => Ok(()),
            Err(err) if err.kind() == ErrorKind::DeploymentInProgress => {
                // An operator deploy is in flight; stay out of the way.
                warn!(environment = %environment_name, "auto-deploy skipped, key is busy");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let header = sign("topsecret", body);
        assert!(verify_signature("topsecret", body, Some(&header)).is_ok());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let header = sign("topsecret", b"original");
        let err = verify_signature("topsecret", b"tampered", Some(&header)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = b"payload";
        let header = sign("other-secret", body);
        let err = verify_signature("topsecret", body, Some(&header)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    #[test]
    fn missing_or_malformed_headers_are_rejected() {
        assert_eq!(
            verify_signature("s", b"b", None).unwrap_err().kind(),
            ErrorKind::InvalidSignature
        );
        assert_eq!(
            verify_signature("s", b"b", Some("sha1=abcdef")).unwrap_err().kind(),
            ErrorKind::InvalidSignature
        );
        assert_eq!(
            verify_signature("s", b"b", Some("sha256=zz-not-hex"))
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidSignature
        );
    }

    #[test]
    fn push_payload_parses() {
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "after": "abc1234def",
            "repository": { "full_name": "acme/shop" },
        });
        let payload: PushPayload = serde_json::from_value(body).unwrap();
        assert_eq!(payload.git_ref, "refs/heads/main");
        assert_eq!(payload.after, "abc1234def");
        assert_eq!(payload.repository.full_name, "acme/shop");
    }

    #[test]
    fn pull_request_payload_parses() {
        let body = serde_json::json!({
            "action": "opened",
            "number": 42,
            "pull_request": {
                "head": { "sha": "fff000", "ref": "feature/snazzy" },
                "html_url": "https://github.com/acme/shop/pull/42",
            },
            "repository": { "full_name": "acme/shop" },
        });
        let payload: PullRequestPayload = serde_json::from_value(body).unwrap();
        assert_eq!(payload.number, 42);
        assert_eq!(payload.pull_request.head.sha, "fff000");
    }
}
