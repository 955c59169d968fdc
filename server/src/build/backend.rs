//! The effectful half of the build pipeline: fetching sources, producing
//! images, and pushing them. Split behind a trait so the stub backend can
//! stand in where no Docker daemon exists.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use bollard::image::{BuildImageOptions, PushImageOptions};
use bollard::Docker;
use chrono::Utc;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, trace};

use enclii_common::models::release::Release;
use enclii_common::models::service::{BuildConfig, Service};

use super::pipeline::{Stage, StageError};

/// Everything the backend needs to produce an image for one release.
pub struct BuildRequest<'a> {
    pub service: &'a Service,
    pub release: &'a Release,
    pub source_dir: &'a Path,
    pub build_config: &'a BuildConfig,
    /// Collects raw tool output into the build log.
    pub log: &'a (dyn Fn(String) + Send + Sync),
}

pub struct BuiltImage {
    /// Mutable tag reference, `registry/<owner>/<service>:v<ts>-<shortsha>`.
    pub image_uri: String,
}

#[async_trait]
pub trait BuildBackend: Send + Sync + 'static {
    /// Shallow checkout of exactly `git_sha` into `dest`.
    async fn fetch(&self, repo: &str, git_sha: &str, dest: &Path) -> Result<(), StageError>;

    async fn build(&self, request: BuildRequest<'_>) -> Result<BuiltImage, StageError>;

    /// Push the tag and return the immutable content digest.
    async fn push(&self, image_uri: &str) -> Result<String, StageError>;
}

pub struct DockerBackend {
    docker: Docker,
    registry: String,
}

impl DockerBackend {
    pub fn connect(registry: &str) -> anyhow::Result<Self> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
            registry: registry.to_string(),
        })
    }

    fn image_tag(&self, service: &Service, release: &Release) -> String {
        format!(
            "{}/{}:v{}-{}",
            self.registry,
            service.name,
            Utc::now().timestamp(),
            release.short_sha()
        )
    }

    /// Pack the source directory into the tar stream `docker build` wants.
    fn tar_context(source_dir: &Path) -> Result<Vec<u8>, StageError> {
        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_dir_all(".", source_dir)
            .and_then(|_| builder.into_inner())
            .map_err(|e| StageError::failed(Stage::Build, format!("packing context: {e}")))
    }

    async fn dockerfile_build(
        &self,
        request: &BuildRequest<'_>,
        dockerfile: &str,
        tag: &str,
    ) -> Result<(), StageError> {
        let context = Self::tar_context(request.source_dir)?;

        let options = BuildImageOptions {
            dockerfile: dockerfile.to_string(),
            t: tag.to_string(),
            labels: HashMap::from([
                ("enclii.git-sha".to_string(), request.release.git_sha.clone()),
                (
                    "enclii.service".to_string(),
                    request.release.service_id.to_string(),
                ),
            ]),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(context.into()));
        while let Some(message) = stream.next().await {
            let info =
                message.map_err(|e| StageError::transport(Stage::Build, e.to_string()))?;
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    (request.log)(line.to_string());
                }
            }
            if let Some(detail) = info.error {
                return Err(StageError::failed(Stage::Build, detail));
            }
        }

        Ok(())
    }

    /// Buildpack builds shell out to the `pack` CLI against the local
    /// daemon, so the produced image flows through the same push path as
    /// Dockerfile builds.
    async fn buildpack_build(
        &self,
        request: &BuildRequest<'_>,
        buildpack: &str,
        tag: &str,
    ) -> Result<(), StageError> {
        let builder = builder_image(buildpack);

        let mut child = Command::new("pack")
            .arg("build")
            .arg(tag)
            .arg("--path")
            .arg(request.source_dir)
            .args(["--builder", &builder, "--pull-policy", "if-not-present"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                StageError::failed(Stage::Build, format!("failed to run pack: {e}"))
            })?;

        // Drain both pipes together so neither side can fill and stall
        // the build.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let log = request.log;

        let forward_stdout = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        (log)(line);
                    }
                }
            }
        };
        let forward_stderr = async {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    (log)(line.clone());
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            tail
        };

        let (_, tail) = tokio::join!(forward_stdout, forward_stderr);

        let status = child
            .wait()
            .await
            .map_err(|e| StageError::transport(Stage::Build, e.to_string()))?;
        if !status.success() {
            let detail = if tail.is_empty() {
                format!("pack exited with {status}")
            } else {
                tail.into_iter().collect::<Vec<_>>().join("\n")
            };
            return Err(StageError::failed(Stage::Build, detail));
        }

        Ok(())
    }
}

const STDERR_TAIL_LINES: usize = 20;

/// Builder image for a buildpack family. An unrecognised name is treated
/// as a builder image reference, so explicit configs can pin their own.
fn builder_image(buildpack: &str) -> String {
    match buildpack {
        "paketo" | "nodejs" | "rust" | "go" | "python" => {
            "paketobuildpacks/builder-jammy-base".to_string()
        }
        image => image.to_string(),
    }
}

#[async_trait]
impl BuildBackend for DockerBackend {
    async fn fetch(&self, repo: &str, git_sha: &str, dest: &Path) -> Result<(), StageError> {
        let url = if repo.starts_with("http") || repo.starts_with("git@") {
            repo.to_string()
        } else {
            format!("https://{repo}.git")
        };

        let clone = Command::new("git")
            .args(["init", "--quiet"])
            .arg(dest)
            .output()
            .await
            .map_err(|e| StageError::transport(Stage::Fetch, e.to_string()))?;
        if !clone.status.success() {
            return Err(StageError::failed(
                Stage::Fetch,
                String::from_utf8_lossy(&clone.stderr).to_string(),
            ));
        }

        // Shallow fetch of exactly the requested revision; a missing ref is
        // terminal, not transport.
        let fetch = Command::new("git")
            .current_dir(dest)
            .args(["fetch", "--quiet", "--depth", "1", &url, git_sha])
            .output()
            .await
            .map_err(|e| StageError::transport(Stage::Fetch, e.to_string()))?;
        if !fetch.status.success() {
            let stderr = String::from_utf8_lossy(&fetch.stderr).to_string();
            if stderr.contains("not found") || stderr.contains("couldn't find remote ref") {
                return Err(StageError::failed(Stage::Fetch, stderr));
            }
            return Err(StageError::transport(Stage::Fetch, stderr));
        }

        let checkout = Command::new("git")
            .current_dir(dest)
            .args(["checkout", "--quiet", "FETCH_HEAD"])
            .output()
            .await
            .map_err(|e| StageError::transport(Stage::Fetch, e.to_string()))?;
        if !checkout.status.success() {
            return Err(StageError::failed(
                Stage::Fetch,
                String::from_utf8_lossy(&checkout.stderr).to_string(),
            ));
        }

        Ok(())
    }

    async fn build(&self, request: BuildRequest<'_>) -> Result<BuiltImage, StageError> {
        let tag = self.image_tag(request.service, request.release);

        match request.build_config {
            BuildConfig::Dockerfile { path } => {
                self.dockerfile_build(&request, path, &tag).await?;
            }
            // Detect resolves `auto` before the build stage; a bare auto
            // falls back to the conventional Dockerfile.
            BuildConfig::Auto => {
                self.dockerfile_build(&request, "Dockerfile", &tag).await?;
            }
            BuildConfig::Buildpack { name } => {
                self.buildpack_build(&request, name, &tag).await?;
            }
        }

        Ok(BuiltImage { image_uri: tag })
    }

    async fn push(&self, image_uri: &str) -> Result<String, StageError> {
        let (name, tag) = image_uri
            .rsplit_once(':')
            .ok_or_else(|| StageError::failed(Stage::Push, "image uri has no tag".to_string()))?;

        let mut stream = self.docker.push_image(
            name,
            Some(PushImageOptions { tag }),
            None,
        );
        while let Some(message) = stream.next().await {
            let info = message.map_err(|e| StageError::transport(Stage::Push, e.to_string()))?;
            if let Some(detail) = info.error {
                return Err(StageError::transport(Stage::Push, detail));
            }
            trace!(?info.status, "push progress");
        }

        let inspection = self
            .docker
            .inspect_image(image_uri)
            .await
            .map_err(|e| StageError::transport(Stage::Push, e.to_string()))?;

        inspection
            .repo_digests
            .unwrap_or_default()
            .first()
            .and_then(|repo_digest| repo_digest.rsplit_once('@').map(|(_, d)| d.to_string()))
            .ok_or_else(|| {
                StageError::failed(Stage::Push, "registry returned no digest".to_string())
            })
    }
}

/// Records builds without touching git or Docker. Image digests are a
/// function of `(service, git_sha)`, which keeps the determinism contract
/// observable in development.
#[derive(Default)]
pub struct StubBackend {
    /// When set, digests also hash this salt; lets tests exercise the
    /// forced-rebuild divergence path.
    pub digest_salt: std::sync::Mutex<Option<String>>,
}

impl StubBackend {
    pub fn set_digest_salt(&self, salt: &str) {
        *self.digest_salt.lock().unwrap() = Some(salt.to_string());
    }

    fn digest(&self, service_id: &str, git_sha: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(service_id.as_bytes());
        hasher.update(git_sha.as_bytes());
        if let Some(salt) = self.digest_salt.lock().unwrap().as_ref() {
            hasher.update(salt.as_bytes());
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl BuildBackend for StubBackend {
    async fn fetch(&self, repo: &str, git_sha: &str, dest: &Path) -> Result<(), StageError> {
        debug!(%repo, %git_sha, "stub fetch");
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| StageError::failed(Stage::Fetch, e.to_string()))?;
        tokio::fs::write(dest.join("Dockerfile"), "FROM scratch\n")
            .await
            .map_err(|e| StageError::failed(Stage::Fetch, e.to_string()))?;
        Ok(())
    }

    async fn build(&self, request: BuildRequest<'_>) -> Result<BuiltImage, StageError> {
        (request.log)(format!(
            "stub build of {} at {}",
            request.service.name, request.release.git_sha
        ));
        Ok(BuiltImage {
            image_uri: format!(
                "stub.local/{}:v0-{}",
                request.service.name,
                request.release.short_sha()
            ),
        })
    }

    async fn push(&self, image_uri: &str) -> Result<String, StageError> {
        let (name, sha_part) = image_uri
            .rsplit_once("-")
            .unwrap_or((image_uri, ""));
        let service = name.split('/').nth(1).unwrap_or(name);
        Ok(self.digest(service, sha_part))
    }
}

/// A build context fresh per job; dropped (and deleted) with the job.
pub struct Workspace {
    root: tempfile::TempDir,
}

impl Workspace {
    pub fn create() -> Result<Self, StageError> {
        tempfile::Builder::new()
            .prefix("enclii-build-")
            .tempdir()
            .map(|root| Self { root })
            .map_err(|e| StageError::failed(Stage::Fetch, e.to_string()))
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root.path().join("source")
    }
}
