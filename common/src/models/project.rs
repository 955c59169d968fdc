use std::fmt::Formatter;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use super::InvalidName;

/// A DNS-label-shaped project identifier: lowercase alphanumerics and
/// hyphens, no leading or trailing hyphen, 3 to 63 characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ProjectSlug(String);

pub(crate) fn is_dns_label(s: &str, min: usize, max: usize) -> bool {
    s.len() >= min
        && s.len() <= max
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

impl ProjectSlug {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ProjectSlug {
    type Err = InvalidName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_dns_label(s, 3, 63) {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidName::ProjectSlug(s.to_string()))
        }
    }
}

impl std::fmt::Display for ProjectSlug {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for ProjectSlug {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub slug: ProjectSlug,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// The fixed environment names plus per-PR previews.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EnvironmentName {
    Dev,
    Staging,
    Production,
    Preview(u32),
}

impl EnvironmentName {
    pub fn is_preview(&self) -> bool {
        matches!(self, Self::Preview(_))
    }
}

impl FromStr for EnvironmentName {
    type Err = InvalidName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Self::Dev),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            other => other
                .strip_prefix("preview-")
                .and_then(|n| n.parse().ok())
                .map(Self::Preview)
                .ok_or_else(|| InvalidName::EnvironmentName(s.to_string())),
        }
    }
}

impl std::fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dev => f.write_str("dev"),
            Self::Staging => f.write_str("staging"),
            Self::Production => f.write_str("production"),
            Self::Preview(pr) => write!(f, "preview-{pr}"),
        }
    }
}

impl Serialize for EnvironmentName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EnvironmentName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Environment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: EnvironmentName,
    pub namespace: String,
    pub is_production: bool,
    /// Set when deletion has begun; the reconciler refuses new deploys and
    /// tears the namespace down once every deployment is terminal.
    pub draining: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_boundaries() {
        assert!("ab".parse::<ProjectSlug>().is_err());
        assert!("abc".parse::<ProjectSlug>().is_ok());
        assert!("a".repeat(63).parse::<ProjectSlug>().is_ok());
        assert!("a".repeat(64).parse::<ProjectSlug>().is_err());
        assert!("-abc".parse::<ProjectSlug>().is_err());
        assert!("abc-".parse::<ProjectSlug>().is_err());
        assert!("Abc".parse::<ProjectSlug>().is_err());
        assert!("a-b1".parse::<ProjectSlug>().is_ok());
    }

    #[test]
    fn environment_names_round_trip() {
        assert_eq!(
            "preview-42".parse::<EnvironmentName>().unwrap(),
            EnvironmentName::Preview(42)
        );
        assert_eq!(EnvironmentName::Preview(42).to_string(), "preview-42");
        assert!("qa".parse::<EnvironmentName>().is_err());
        assert!("preview-".parse::<EnvironmentName>().is_err());
    }
}
