pub mod deployment;
pub mod error;
pub mod project;
pub mod release;
pub mod service;

/// Name validation failures, surfaced to callers as `validation` errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidName {
    #[error("`{0}` is not a valid project slug (3-63 chars, [a-z0-9-], no edge hyphens)")]
    ProjectSlug(String),
    #[error("`{0}` is not a valid service name")]
    ServiceName(String),
    #[error("`{0}` is not a valid environment name (dev, staging, production, preview-<n>)")]
    EnvironmentName(String),
    #[error("`{0}` is not a valid env var key (^[A-Z_][A-Z0-9_]*$)")]
    EnvVarKey(String),
}
