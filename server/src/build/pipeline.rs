//! The staged build pipeline. Each stage is an ordinary typed result;
//! the pipeline short-circuits on the first error, records the failing
//! stage, and leaves the release ledger consistent.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::Future;
use sha2::{Digest, Sha256};
use strum::Display;
use tokio::time::{sleep, timeout};
use tracing::{error, info, instrument, warn};

use enclii_common::models::release::Release;
use enclii_common::models::service::{BuildConfig, Service};

use super::backend::{BuildBackend, BuildRequest, Workspace};
use crate::artifacts::{ArtifactStore, Signer};
use crate::persistence::{BuildJob, Persistence};

pub const STAGE_TIMEOUT: Duration = Duration::from_secs(600);
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const RETRY_BASE: Duration = Duration::from_secs(2);
const RETRY_ATTEMPTS: u32 = 3;

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Claim,
    Fetch,
    Detect,
    Build,
    Sbom,
    Sign,
    Push,
    Ready,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StageErrorKind {
    /// Worth retrying with backoff.
    Transport,
    /// Terminal for this release.
    Failed,
    Timeout,
}

#[derive(Debug)]
pub struct StageError {
    pub stage: Stage,
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn transport(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: StageErrorKind::Transport,
            message: message.into(),
        }
    }

    pub fn failed(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: StageErrorKind::Failed,
            message: message.into(),
        }
    }

    pub fn timeout(stage: Stage) -> Self {
        Self {
            stage,
            kind: StageErrorKind::Timeout,
            message: format!("stage {stage} exceeded its deadline"),
        }
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage {} failed: {}", self.stage, self.message)
    }
}

impl std::error::Error for StageError {}

/// Delay before the given 1-based retry attempt.
pub fn backoff_delay(attempt: u32) -> Duration {
    RETRY_BASE * 2_u32.saturating_pow(attempt.saturating_sub(1))
}

/// Retry transport errors with exponential backoff; everything else is
/// terminal immediately.
async fn with_retries<T, F, Fut>(mut run: F) -> Result<T, StageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let mut attempt = 1;
    loop {
        match run().await {
            Ok(value) => return Ok(value),
            Err(err) if err.kind == StageErrorKind::Transport && attempt < RETRY_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                warn!(stage = %err.stage, %attempt, ?delay, "transient failure, backing off");
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn staged<T, Fut>(stage: Stage, fut: Fut) -> Result<T, StageError>
where
    Fut: Future<Output = Result<T, StageError>>,
{
    timeout(STAGE_TIMEOUT, fut)
        .await
        .map_err(|_| StageError::timeout(stage))?
}

pub struct Pipeline {
    pub persistence: Persistence,
    pub artifacts: Arc<ArtifactStore>,
    pub signer: Arc<Signer>,
    pub backend: Arc<dyn BuildBackend>,
}

impl Pipeline {
    /// Run one job to completion, transitioning its release to `ready` or
    /// `failed`. Never returns an error: failures land on the release row.
    #[instrument(skip_all, fields(service_id = %job.service_id, git_sha = %job.git_sha))]
    pub async fn run(&self, job: BuildJob) {
        // Claim is idempotent: a crashed worker that already claimed this
        // job gets the same release back.
        let release = match self.persistence.claim_build(&job).await {
            Ok(release) => release,
            Err(err) => {
                error!(error = %err, "failed to claim build job");
                return;
            }
        };

        info!(release_id = %release.id, sequence = release.sequence, "starting build");

        match timeout(BUILD_TIMEOUT, self.stages(&job, &release)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(error = %err, stage = %err.stage, "build failed");
                self.log(&release, err.stage, &format!("error: {}", err.message))
                    .await;
                if let Err(persist_err) = self
                    .persistence
                    .fail_release(release.id, &err.stage.to_string(), &err.message)
                    .await
                {
                    error!(error = %persist_err, "failed to record build failure");
                }
            }
            Err(_) => {
                let err = StageError::timeout(Stage::Build);
                error!("build exceeded the overall timeout");
                if let Err(persist_err) = self
                    .persistence
                    .fail_release(release.id, "build", &err.message)
                    .await
                {
                    error!(error = %persist_err, "failed to record build timeout");
                }
            }
        }
    }

    async fn stages(&self, job: &BuildJob, release: &Release) -> Result<(), StageError> {
        let service = self
            .persistence
            .get_service(job.service_id)
            .await
            .map_err(|e| StageError::failed(Stage::Claim, e.to_string()))?;

        let workspace = Workspace::create()?;
        let source_dir = workspace.source_dir();

        // Fetch: shallow clone at the revision, retried on transport.
        self.log(release, Stage::Fetch, &format!("fetching {}", release.git_sha))
            .await;
        staged(
            Stage::Fetch,
            with_retries(|| self.backend.fetch(&service.git_repo, &release.git_sha, &source_dir)),
        )
        .await?;

        let app_dir = if service.app_path == "." || service.app_path.is_empty() {
            source_dir.clone()
        } else {
            source_dir.join(&service.app_path)
        };

        // Detect: derive a concrete build config when the service says auto.
        let build_config = detect_build_config(&service.build_config, &app_dir)?;
        self.log(
            release,
            Stage::Detect,
            &format!("build config: {build_config:?}"),
        )
        .await;

        let cache_hit = self.record_cache_key(&service, &app_dir).await;

        // Build: produce the OCI image.
        let persistence = self.persistence.clone();
        let release_for_log = release.id;
        let log = move |line: String| {
            let persistence = persistence.clone();
            tokio::spawn(async move {
                let _ = persistence
                    .append_build_log(release_for_log, "build", &line)
                    .await;
            });
        };
        let built = staged(
            Stage::Build,
            with_retries(|| {
                self.backend.build(BuildRequest {
                    service: &service,
                    release,
                    source_dir: &app_dir,
                    build_config: &build_config,
                    log: &log,
                })
            }),
        )
        .await?;

        // Push: registry writes are effect-idempotent, retried on transport.
        self.persistence
            .set_release_pushing(release.id)
            .await
            .map_err(|e| StageError::failed(Stage::Push, e.to_string()))?;
        self.log(release, Stage::Push, &format!("pushing {}", built.image_uri))
            .await;
        let image_digest =
            staged(Stage::Push, with_retries(|| self.backend.push(&built.image_uri))).await?;

        // SBOM over the pushed image.
        let sbom = cyclonedx_sbom(&service, release, &built.image_uri, &image_digest);
        let sbom_ref = self
            .artifacts
            .store("sbom", sbom.to_string().as_bytes())
            .await
            .map_err(|e| StageError::failed(Stage::Sbom, e.to_string()))?;
        self.log(release, Stage::Sbom, &sbom_ref).await;

        // Sign the image digest with the platform key.
        let signature = self.signer.sign(image_digest.as_bytes());
        let signature_ref = self
            .artifacts
            .store("signature", signature.as_bytes())
            .await
            .map_err(|e| StageError::failed(Stage::Sign, e.to_string()))?;

        let provenance = serde_json::json!({
            "builder": "enclii",
            "git_repo": service.git_repo,
            "git_sha": release.git_sha,
            "trigger": job.trigger.to_string(),
            "pr_number": job.pr_number,
            "built_at": Utc::now().to_rfc3339(),
            "public_key": self.signer.public_key_base64(),
        });
        let provenance_ref = self
            .artifacts
            .store("provenance", provenance.to_string().as_bytes())
            .await
            .map_err(|e| StageError::failed(Stage::Sign, e.to_string()))?;

        // Determinism contract: a forced rebuild that reproduces an existing
        // ready release byte for byte is rejected; a diverging one appends.
        let digest_policy = match self
            .persistence
            .find_ready_release(service.id, &release.git_sha)
            .await
            .map_err(|e| StageError::failed(Stage::Ready, e.to_string()))?
        {
            Some(existing) if existing.image_digest.as_deref() == Some(image_digest.as_str()) => {
                return Err(StageError::failed(
                    Stage::Ready,
                    format!(
                        "rebuild reproduced release {} exactly; keeping the original",
                        existing.sequence
                    ),
                ));
            }
            Some(_) => "append",
            None => "dedup",
        };

        self.persistence
            .ready_release(
                release.id,
                &built.image_uri,
                &image_digest,
                &sbom_ref,
                &signature_ref,
                &provenance_ref,
                cache_hit,
                digest_policy,
            )
            .await
            .map_err(|e| StageError::failed(Stage::Ready, e.to_string()))?;

        info!(release_id = %release.id, %image_digest, "release ready");
        self.log(release, Stage::Ready, &format!("release ready: {image_digest}"))
            .await;

        Ok(())
    }

    async fn log(&self, release: &Release, stage: Stage, line: &str) {
        if let Err(err) = self
            .persistence
            .append_build_log(release.id, &stage.to_string(), line)
            .await
        {
            warn!(error = %err, "failed to append build log");
        }
    }

    /// Layer cache bookkeeping keyed by the dependency manifest's content
    /// hash; a repeated hash for the service means the cache hit. The
    /// marker lives in the content-addressed store, so its address is the
    /// hash of the sentinel itself.
    async fn record_cache_key(&self, service: &Service, app_dir: &Path) -> bool {
        let Some(manifest_hash) = dependency_manifest_hash(app_dir) else {
            return false;
        };

        let sentinel = format!("{}:{manifest_hash}", service.id);
        let addr = format!(
            "cache:sha256:{}",
            hex::encode(Sha256::digest(sentinel.as_bytes()))
        );

        let hit = self.artifacts.load(&addr).await.is_ok();
        if !hit {
            if let Err(err) = self.artifacts.store("cache", sentinel.as_bytes()).await {
                warn!(error = %err, "failed to record layer cache key");
            }
        }
        hit
    }
}

/// Inspect the checkout and derive a concrete build config. The order is
/// fixed; the first match wins.
pub fn detect_build_config(
    configured: &BuildConfig,
    app_dir: &Path,
) -> Result<BuildConfig, StageError> {
    if !matches!(configured, BuildConfig::Auto) {
        return Ok(configured.clone());
    }

    if app_dir.join("Dockerfile").is_file() {
        return Ok(BuildConfig::Dockerfile {
            path: "Dockerfile".to_string(),
        });
    }
    if app_dir.join("project.toml").is_file() {
        return Ok(BuildConfig::Buildpack {
            name: "paketo".to_string(),
        });
    }
    for (manifest, buildpack) in [
        ("package.json", "nodejs"),
        ("Cargo.toml", "rust"),
        ("go.mod", "go"),
        ("requirements.txt", "python"),
    ] {
        if app_dir.join(manifest).is_file() {
            return Ok(BuildConfig::Buildpack {
                name: buildpack.to_string(),
            });
        }
    }

    Err(StageError::failed(
        Stage::Detect,
        "no Dockerfile, buildpack descriptor, or recognised manifest".to_string(),
    ))
}

fn dependency_manifest_hash(app_dir: &Path) -> Option<String> {
    for manifest in [
        "Cargo.lock",
        "package-lock.json",
        "yarn.lock",
        "go.sum",
        "requirements.txt",
    ] {
        if let Ok(content) = std::fs::read(app_dir.join(manifest)) {
            return Some(hex::encode(Sha256::digest(&content)));
        }
    }
    None
}

/// A CycloneDX 1.5 document over the image. Components cover the image
/// itself and its source provenance; registry scanners enrich it later.
fn cyclonedx_sbom(
    service: &Service,
    release: &Release,
    image_uri: &str,
    image_digest: &str,
) -> serde_json::Value {
    serde_json::json!({
        "bomFormat": "CycloneDX",
        "specVersion": "1.5",
        "serialNumber": format!("urn:uuid:{}", release.id),
        "version": 1,
        "metadata": {
            "timestamp": Utc::now().to_rfc3339(),
            "component": {
                "type": "container",
                "name": service.name.to_string(),
                "version": format!("r{}", release.sequence),
                "purl": format!("pkg:oci/{}@{image_digest}", service.name),
            },
        },
        "components": [{
            "type": "container",
            "name": image_uri,
            "hashes": [{
                "alg": "SHA-256",
                "content": image_digest.trim_start_matches("sha256:"),
            }],
            "properties": [
                { "name": "enclii:git_repo", "value": service.git_repo },
                { "name": "enclii:git_sha", "value": release.git_sha },
            ],
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_from_two_seconds() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn retries_stop_at_three_attempts() {
        tokio::time::pause();

        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen = attempts.clone();
        let result: Result<(), StageError> = with_retries(|| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(StageError::transport(Stage::Push, "registry down"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen = attempts.clone();
        let result: Result<(), StageError> = with_retries(|| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(StageError::failed(Stage::Build, "compile error"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn detect_prefers_dockerfile_then_buildpack_then_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path();

        std::fs::write(path.join("package.json"), "{}").unwrap();
        assert_eq!(
            detect_build_config(&BuildConfig::Auto, path).unwrap(),
            BuildConfig::Buildpack {
                name: "nodejs".to_string()
            }
        );

        std::fs::write(path.join("project.toml"), "").unwrap();
        assert_eq!(
            detect_build_config(&BuildConfig::Auto, path).unwrap(),
            BuildConfig::Buildpack {
                name: "paketo".to_string()
            }
        );

        std::fs::write(path.join("Dockerfile"), "FROM scratch").unwrap();
        assert_eq!(
            detect_build_config(&BuildConfig::Auto, path).unwrap(),
            BuildConfig::Dockerfile {
                path: "Dockerfile".to_string()
            }
        );
    }

    #[test]
    fn detect_respects_explicit_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch").unwrap();

        let configured = BuildConfig::Buildpack {
            name: "rust".to_string(),
        };
        assert_eq!(
            detect_build_config(&configured, dir.path()).unwrap(),
            configured
        );
    }

    #[test]
    fn detect_fails_on_an_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        let err = detect_build_config(&BuildConfig::Auto, dir.path()).unwrap_err();
        assert_eq!(err.stage, Stage::Detect);
        assert_eq!(err.kind, StageErrorKind::Failed);
    }

    #[test]
    fn sbom_is_cyclonedx_with_image_hash() {
        let service = Service {
            id: uuid::Uuid::new_v4(),
            project_id: uuid::Uuid::new_v4(),
            name: "api".parse().unwrap(),
            git_repo: "github.com/acme/shop".to_string(),
            git_branch: "main".to_string(),
            app_path: ".".to_string(),
            build_config: BuildConfig::Auto,
            runtime_config: Default::default(),
            auto_deploy: true,
            created_at: Utc::now(),
        };
        let release = Release {
            id: uuid::Uuid::new_v4(),
            service_id: service.id,
            sequence: 3,
            git_sha: "abc1234".to_string(),
            image_uri: None,
            image_digest: None,
            sbom_ref: None,
            signature_ref: None,
            provenance_ref: None,
            status: enclii_common::models::release::ReleaseStatus::Building,
            created_at: Utc::now(),
            builder_log_ref: None,
            cache_hit: None,
            digest_policy: None,
        };

        let sbom = cyclonedx_sbom(&service, &release, "reg/api:v1", "sha256:deadbeef");
        assert_eq!(sbom["bomFormat"], "CycloneDX");
        assert_eq!(sbom["components"][0]["hashes"][0]["content"], "deadbeef");
        assert_eq!(
            sbom["components"][0]["properties"][1]["value"],
            "abc1234"
        );
    }
}
