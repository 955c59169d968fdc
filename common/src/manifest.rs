//! The `enclii.yaml` service manifest committed at the repository root.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::models::service::{BuildConfig, EnvVarKey, RuntimeConfig, ServiceName};
use crate::models::project::ProjectSlug;

pub const MANIFEST_FILE: &str = "enclii.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read {MANIFEST_FILE}: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse {MANIFEST_FILE}: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Declares a service: name, owning project, how to build it, and how to
/// run it. Parsed at `init`/`sync` time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub name: ServiceName,
    pub project: ProjectSlug,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Default env vars, overridable per environment through the API.
    #[serde(default)]
    pub env: BTreeMap<EnvVarKey, String>,
}

impl Manifest {
    pub fn from_str(raw: &str) -> Result<Self, ManifestError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn from_dir(dir: &Path) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(dir.join(MANIFEST_FILE))?;
        Self::from_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_manifest() {
        let raw = r#"
name: api
project: acme-shop
build:
  type: dockerfile
  path: deploy/Dockerfile
runtime:
  port: 3000
  replicas: 2
  healthcheck:
    path: /healthz
    initial_delay_secs: 10
    timeout_secs: 2
env:
  RUST_LOG: info
  BASE_URL: https://acme.example.com
"#;
        let manifest = Manifest::from_str(raw).unwrap();
        assert_eq!(manifest.name.as_str(), "api");
        assert_eq!(manifest.runtime.port, 3000);
        assert_eq!(manifest.runtime.replicas, 2);
        assert_eq!(manifest.runtime.healthcheck.path, "/healthz");
        assert_eq!(
            manifest.build,
            BuildConfig::Dockerfile {
                path: "deploy/Dockerfile".to_string()
            }
        );
        assert_eq!(manifest.env.len(), 2);
    }

    #[test]
    fn defaults_apply() {
        let manifest = Manifest::from_str("name: worker\nproject: acme-shop\n").unwrap();
        assert_eq!(manifest.build, BuildConfig::Auto);
        assert_eq!(manifest.runtime.port, 8080);
        assert_eq!(manifest.runtime.replicas, 1);
        assert!(manifest.env.is_empty());
    }

    #[test]
    fn rejects_bad_env_key() {
        let raw = "name: api\nproject: acme-shop\nenv:\n  lower_case: nope\n";
        assert!(Manifest::from_str(raw).is_err());
    }
}
