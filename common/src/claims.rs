use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Platform roles, ordered by privilege.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Role {
    Viewer,
    Developer,
    Admin,
    Owner,
}

/// Scopes carried by CI tokens. OIDC principals get the full set implied by
/// their role instead.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum TokenScope {
    Read,
    Deploy,
    Admin,
    Logs,
    Secrets,
}

/// Where a verified principal came from.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    Oidc,
    ApiToken,
}

/// The verified identity attached to a request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claim {
    pub sub: String,
    pub email: Option<String>,
    pub role: Role,
    /// Projects the caller may touch. Owners implicitly cover all projects.
    pub projects: Vec<Uuid>,
    /// Only populated for API tokens.
    pub scopes: Vec<TokenScope>,
    pub source: CredentialSource,
}

impl Claim {
    pub fn actor(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.sub)
    }

    fn in_project(&self, project_id: Uuid) -> bool {
        self.role == Role::Owner || self.projects.contains(&project_id)
    }

    fn has_scope(&self, scope: TokenScope) -> bool {
        match self.source {
            CredentialSource::Oidc => true,
            CredentialSource::ApiToken => {
                self.scopes.contains(&scope) || self.scopes.contains(&TokenScope::Admin)
            }
        }
    }

    /// Read project/service/release/deployment state.
    pub fn may_read(&self, project_id: Uuid) -> bool {
        self.role >= Role::Viewer && self.in_project(project_id) && self.has_scope(TokenScope::Read)
    }

    /// Create or update services, trigger builds.
    pub fn may_write_services(&self, project_id: Uuid) -> bool {
        self.role >= Role::Developer
            && self.in_project(project_id)
            && self.has_scope(TokenScope::Deploy)
    }

    /// Deploy or roll back in an environment. Production needs admin.
    pub fn may_deploy(&self, project_id: Uuid, is_production: bool) -> bool {
        let min = if is_production { Role::Admin } else { Role::Developer };
        self.role >= min && self.in_project(project_id) && self.has_scope(TokenScope::Deploy)
    }

    pub fn may_stream_logs(&self, project_id: Uuid) -> bool {
        self.role >= Role::Viewer && self.in_project(project_id) && self.has_scope(TokenScope::Logs)
    }

    /// Administer a project's environments.
    pub fn may_administer(&self, project_id: Uuid) -> bool {
        self.role >= Role::Admin
            && self.in_project(project_id)
            && self.has_scope(TokenScope::Admin)
    }

    pub fn may_manage_secrets(&self, project_id: Uuid) -> bool {
        self.role >= Role::Admin
            && self.in_project(project_id)
            && self.has_scope(TokenScope::Secrets)
    }

    /// Manage projects and users. Owner only, regardless of project set.
    pub fn may_manage_platform(&self) -> bool {
        self.role == Role::Owner && self.has_scope(TokenScope::Admin)
    }
}
