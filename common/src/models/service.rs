use std::fmt::Formatter;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use super::project::is_dns_label;
use super::InvalidName;

/// Service names share the project slug shape but may be as short as a
/// single character within their project.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ServiceName {
    type Err = InvalidName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_dns_label(s, 1, 63) {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidName::ServiceName(s.to_string()))
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for ServiceName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

/// `^[A-Z_][A-Z0-9_]*$`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EnvVarKey(String);

impl EnvVarKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for EnvVarKey {
    type Err = InvalidName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = s.bytes();
        let head_ok = bytes
            .next()
            .map(|b| b.is_ascii_uppercase() || b == b'_')
            .unwrap_or(false);
        if head_ok && bytes.all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_') {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidName::EnvVarKey(s.to_string()))
        }
    }
}

impl std::fmt::Display for EnvVarKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for EnvVarKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

/// How a service's image gets produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BuildConfig {
    /// Inspect the repository and derive one of the concrete configs.
    Auto,
    Dockerfile { path: String },
    Buildpack { name: String },
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self::Auto
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_request_millis: u32,
    pub cpu_limit_millis: u32,
    pub memory_request_mb: u32,
    pub memory_limit_mb: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_request_millis: 100,
            cpu_limit_millis: 1000,
            memory_request_mb: 128,
            memory_limit_mb: 512,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Healthcheck {
    pub path: String,
    pub initial_delay_secs: u32,
    pub timeout_secs: u32,
}

impl Default for Healthcheck {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            initial_delay_secs: 5,
            timeout_secs: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub port: u16,
    pub replicas: u32,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub healthcheck: Healthcheck,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            replicas: 1,
            resources: ResourceLimits::default(),
            healthcheck: Healthcheck::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: ServiceName,
    pub git_repo: String,
    pub git_branch: String,
    pub app_path: String,
    pub build_config: BuildConfig,
    pub runtime_config: RuntimeConfig,
    pub auto_deploy: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvVar {
    pub id: Uuid,
    pub service_id: Uuid,
    /// None means the variable applies to every environment of the service.
    pub environment_id: Option<Uuid>,
    pub key: EnvVarKey,
    /// Masked in list responses when `secret` is set.
    pub value: Option<String>,
    pub secret: bool,
    pub version: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_key_shapes() {
        assert!("1ABC".parse::<EnvVarKey>().is_err());
        assert!("_ABC".parse::<EnvVarKey>().is_ok());
        assert!("ABC".parse::<EnvVarKey>().is_ok());
        assert!("A_B_C_9".parse::<EnvVarKey>().is_ok());
        assert!("abc".parse::<EnvVarKey>().is_err());
        assert!("".parse::<EnvVarKey>().is_err());
    }

    #[test]
    fn build_config_wire_shape() {
        let json = serde_json::to_value(BuildConfig::Dockerfile {
            path: "Dockerfile".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "dockerfile");
        assert_eq!(json["path"], "Dockerfile");
    }
}
