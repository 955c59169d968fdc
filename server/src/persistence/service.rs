use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use enclii_common::claims::{Role, TokenScope};
use enclii_common::models::error::ErrorKind;
use enclii_common::models::service::{
    BuildConfig, EnvVar, EnvVarKey, RuntimeConfig, Service, ServiceName,
};

use super::{record_audit, Persistence};
use crate::{Error, Result};

/// Patchable service fields.
#[derive(Debug, Default, serde::Deserialize)]
pub struct ServiceUpdate {
    pub git_branch: Option<String>,
    pub app_path: Option<String>,
    pub build_config: Option<BuildConfig>,
    pub runtime_config: Option<RuntimeConfig>,
    pub auto_deploy: Option<bool>,
}

/// The role and project set attached to a platform user or API token.
#[derive(Clone, Debug)]
pub struct Grant {
    pub role: Role,
    pub projects: Vec<Uuid>,
    pub scopes: Vec<TokenScope>,
}

impl Persistence {
    // ==== services ====

    #[allow(clippy::too_many_arguments)]
    pub async fn create_service(
        &self,
        project_id: Uuid,
        name: &ServiceName,
        git_repo: &str,
        git_branch: &str,
        app_path: &str,
        build_config: BuildConfig,
        runtime_config: RuntimeConfig,
        auto_deploy: bool,
        actor: &str,
    ) -> Result<Service> {
        let service = Service {
            id: Uuid::new_v4(),
            project_id,
            name: name.clone(),
            git_repo: git_repo.to_string(),
            git_branch: git_branch.to_string(),
            app_path: app_path.to_string(),
            build_config,
            runtime_config,
            auto_deploy,
            created_at: Utc::now(),
        };

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO services
             (id, project_id, name, git_repo, git_branch, app_path, build_config, runtime_config, auto_deploy, created_at, updated_at, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(service.id)
        .bind(service.project_id)
        .bind(service.name.as_str())
        .bind(&service.git_repo)
        .bind(&service.git_branch)
        .bind(&service.app_path)
        .bind(to_json(&service.build_config)?)
        .bind(to_json(&service.runtime_config)?)
        .bind(service.auto_deploy)
        .bind(service.created_at)
        .bind(service.created_at)
        .execute(&mut *tx)
        .await?;
        record_audit(
            &mut *tx,
            actor,
            "service.create",
            "service",
            &service.id.to_string(),
            "success",
            serde_json::json!({ "name": service.name.as_str(), "repo": service.git_repo }),
        )
        .await?;
        tx.commit().await?;

        Ok(service)
    }

    pub async fn update_service(
        &self,
        id: Uuid,
        update: ServiceUpdate,
        actor: &str,
    ) -> Result<Service> {
        let mut service = self.get_service(id).await?;

        if let Some(branch) = update.git_branch {
            service.git_branch = branch;
        }
        if let Some(path) = update.app_path {
            service.app_path = path;
        }
        if let Some(build) = update.build_config {
            service.build_config = build;
        }
        if let Some(runtime) = update.runtime_config {
            service.runtime_config = runtime;
        }
        if let Some(auto) = update.auto_deploy {
            service.auto_deploy = auto;
        }

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "UPDATE services
             SET git_branch = ?, app_path = ?, build_config = ?, runtime_config = ?,
                 auto_deploy = ?, updated_at = ?, version = version + 1
             WHERE id = ?",
        )
        .bind(&service.git_branch)
        .bind(&service.app_path)
        .bind(to_json(&service.build_config)?)
        .bind(to_json(&service.runtime_config)?)
        .bind(service.auto_deploy)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        record_audit(
            &mut *tx,
            actor,
            "service.update",
            "service",
            &id.to_string(),
            "success",
            serde_json::Value::Null,
        )
        .await?;
        tx.commit().await?;

        Ok(service)
    }

    pub async fn get_service(&self, id: Uuid) -> Result<Service> {
        sqlx::query(SERVICE_COLUMNS_WHERE_ID)
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .map(|row| service_from_row(&row))
            .transpose()?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    pub async fn list_services(&self, project_id: Uuid) -> Result<Vec<Service>> {
        sqlx::query(
            "SELECT id, project_id, name, git_repo, git_branch, app_path, build_config,
                    runtime_config, auto_deploy, created_at
             FROM services WHERE project_id = ? ORDER BY name",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?
        .iter()
        .map(service_from_row)
        .collect()
    }

    /// Every service sourced from the given repository, regardless of
    /// project. Used by the webhook intake to resolve affected services.
    pub async fn services_by_repo(&self, git_repo: &str) -> Result<Vec<Service>> {
        sqlx::query(
            "SELECT id, project_id, name, git_repo, git_branch, app_path, build_config,
                    runtime_config, auto_deploy, created_at
             FROM services WHERE git_repo = ?",
        )
        .bind(git_repo)
        .fetch_all(self.pool())
        .await?
        .iter()
        .map(service_from_row)
        .collect()
    }

    // ==== env vars ====

    pub async fn upsert_env_var(
        &self,
        service_id: Uuid,
        environment_id: Option<Uuid>,
        key: &EnvVarKey,
        value: &str,
        secret: bool,
        actor: &str,
    ) -> Result<EnvVar> {
        let env_scope = environment_id.map(|id| id.to_string()).unwrap_or_default();
        let id = Uuid::new_v4();

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO env_vars (id, service_id, environment_id, key, value, secret, version)
             VALUES (?, ?, ?, ?, ?, ?, 1)
             ON CONFLICT (service_id, environment_id, key)
             DO UPDATE SET value = excluded.value, secret = excluded.secret, version = version + 1",
        )
        .bind(id)
        .bind(service_id)
        .bind(&env_scope)
        .bind(key.as_str())
        .bind(value)
        .bind(secret)
        .execute(&mut *tx)
        .await?;
        record_audit(
            &mut *tx,
            actor,
            "env_var.set",
            "service",
            &service_id.to_string(),
            "success",
            // Never the value; secret values must not reach the audit log.
            serde_json::json!({ "key": key.as_str(), "secret": secret }),
        )
        .await?;
        tx.commit().await?;

        let row = sqlx::query(
            "SELECT id, service_id, environment_id, key, value, secret, version
             FROM env_vars WHERE service_id = ? AND environment_id = ? AND key = ?",
        )
        .bind(service_id)
        .bind(&env_scope)
        .bind(key.as_str())
        .fetch_one(self.pool())
        .await?;

        env_var_from_row(&row, false)
    }

    /// List env vars with secret values masked.
    pub async fn list_env_vars(&self, service_id: Uuid) -> Result<Vec<EnvVar>> {
        sqlx::query(
            "SELECT id, service_id, environment_id, key, value, secret, version
             FROM env_vars WHERE service_id = ? ORDER BY key",
        )
        .bind(service_id)
        .fetch_all(self.pool())
        .await?
        .iter()
        .map(|row| env_var_from_row(row, true))
        .collect()
    }

    pub async fn delete_env_var(
        &self,
        service_id: Uuid,
        environment_id: Option<Uuid>,
        key: &EnvVarKey,
        actor: &str,
    ) -> Result<()> {
        let env_scope = environment_id.map(|id| id.to_string()).unwrap_or_default();

        let mut tx = self.pool().begin().await?;
        let deleted = sqlx::query(
            "DELETE FROM env_vars WHERE service_id = ? AND environment_id = ? AND key = ?",
        )
        .bind(service_id)
        .bind(&env_scope)
        .bind(key.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if deleted == 0 {
            return Err(Error::from_kind(ErrorKind::NotFound));
        }
        record_audit(
            &mut *tx,
            actor,
            "env_var.delete",
            "service",
            &service_id.to_string(),
            "success",
            serde_json::json!({ "key": key.as_str() }),
        )
        .await?;
        tx.commit().await?;

        Ok(())
    }

    /// The merged env map a deployment runs with: service-wide defaults
    /// overridden by environment-scoped values.
    pub async fn merged_env(
        &self,
        service_id: Uuid,
        environment_id: Uuid,
    ) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query(
            "SELECT environment_id, key, value FROM env_vars
             WHERE service_id = ? AND environment_id IN ('', ?)",
        )
        .bind(service_id)
        .bind(environment_id.to_string())
        .fetch_all(self.pool())
        .await?;

        let mut merged = BTreeMap::new();
        // Service-wide first, then the environment overrides win.
        for scoped in [false, true] {
            for row in &rows {
                let scope: String = row.try_get("environment_id")?;
                if scope.is_empty() != scoped {
                    let key: String = row.try_get("key")?;
                    let value: String = row.try_get("value")?;
                    merged.insert(key, value);
                }
            }
        }

        Ok(merged)
    }

    // ==== api tokens and platform users ====

    pub async fn create_api_token(
        &self,
        name: &str,
        token_hash: &str,
        role: Role,
        scopes: &[TokenScope],
        project_ids: &[Uuid],
        actor: &str,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO api_tokens (id, name, token_hash, role, scopes, project_ids, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(token_hash)
        .bind(role.to_string())
        .bind(to_json(&scopes)?)
        .bind(to_json(&project_ids)?)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        record_audit(
            &mut *tx,
            actor,
            "token.create",
            "api_token",
            &id.to_string(),
            "success",
            serde_json::json!({ "name": name }),
        )
        .await?;
        tx.commit().await?;

        Ok(id)
    }

    pub async fn find_api_token(&self, token_hash: &str) -> Result<Option<(String, Grant)>> {
        let Some(row) = sqlx::query(
            "SELECT name, role, scopes, project_ids FROM api_tokens WHERE token_hash = ?",
        )
        .bind(token_hash)
        .fetch_optional(self.pool())
        .await?
        else {
            return Ok(None);
        };

        let name: String = row.try_get("name")?;
        Ok(Some((name, grant_from_row(&row)?)))
    }

    pub async fn upsert_platform_user(
        &self,
        sub: &str,
        email: &str,
        role: Role,
        project_ids: &[Uuid],
        actor: &str,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO platform_users (sub, email, role, project_ids) VALUES (?, ?, ?, ?)
             ON CONFLICT (sub) DO UPDATE SET email = excluded.email, role = excluded.role,
             project_ids = excluded.project_ids",
        )
        .bind(sub)
        .bind(email)
        .bind(role.to_string())
        .bind(to_json(&project_ids)?)
        .execute(&mut *tx)
        .await?;
        record_audit(
            &mut *tx,
            actor,
            "user.upsert",
            "user",
            sub,
            "success",
            serde_json::json!({ "email": email, "role": role.to_string() }),
        )
        .await?;
        tx.commit().await?;

        Ok(())
    }

    pub async fn find_platform_user(&self, sub: &str, email: Option<&str>) -> Result<Option<Grant>> {
        let row = match email {
            Some(email) => {
                sqlx::query(
                    "SELECT role, project_ids FROM platform_users WHERE sub = ? OR email = ?",
                )
                .bind(sub)
                .bind(email)
                .fetch_optional(self.pool())
                .await?
            }
            None => {
                sqlx::query("SELECT role, project_ids FROM platform_users WHERE sub = ?")
                    .bind(sub)
                    .fetch_optional(self.pool())
                    .await?
            }
        };

        row.map(|row| grant_from_row(&row)).transpose()
    }

    /// Seed the initial owner so a fresh install can be administered.
    pub async fn bootstrap_owner(&self, email: Option<&str>) -> Result<()> {
        let Some(email) = email else {
            return Ok(());
        };

        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM platform_users WHERE role = 'owner'")
                .fetch_one(self.pool())
                .await?;
        if existing == 0 {
            self.upsert_platform_user(email, email, Role::Owner, &[], "bootstrap")
                .await?;
        }

        Ok(())
    }
}

const SERVICE_COLUMNS_WHERE_ID: &str =
    "SELECT id, project_id, name, git_repo, git_branch, app_path, build_config,
            runtime_config, auto_deploy, created_at
     FROM services WHERE id = ?";

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::source(ErrorKind::Internal, e))
}

fn service_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Service> {
    let name: String = row.try_get("name")?;
    let build_config: String = row.try_get("build_config")?;
    let runtime_config: String = row.try_get("runtime_config")?;

    Ok(Service {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: name
            .parse()
            .map_err(|e| Error::source(ErrorKind::Internal, e))?,
        git_repo: row.try_get("git_repo")?,
        git_branch: row.try_get("git_branch")?,
        app_path: row.try_get("app_path")?,
        build_config: serde_json::from_str(&build_config)
            .map_err(|e| Error::source(ErrorKind::Internal, e))?,
        runtime_config: serde_json::from_str(&runtime_config)
            .map_err(|e| Error::source(ErrorKind::Internal, e))?,
        auto_deploy: row.try_get("auto_deploy")?,
        created_at: row.try_get("created_at")?,
    })
}

fn env_var_from_row(row: &sqlx::sqlite::SqliteRow, mask_secrets: bool) -> Result<EnvVar> {
    let scope: String = row.try_get("environment_id")?;
    let key: String = row.try_get("key")?;
    let secret: bool = row.try_get("secret")?;
    let value: String = row.try_get("value")?;

    Ok(EnvVar {
        id: row.try_get("id")?,
        service_id: row.try_get("service_id")?,
        environment_id: if scope.is_empty() {
            None
        } else {
            Some(
                scope
                    .parse()
                    .map_err(|e| Error::source(ErrorKind::Internal, e))?,
            )
        },
        key: key
            .parse()
            .map_err(|e| Error::source(ErrorKind::Internal, e))?,
        value: if secret && mask_secrets { None } else { Some(value) },
        secret,
        version: row.try_get("version")?,
    })
}

fn grant_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Grant> {
    let role: String = row.try_get("role")?;
    let project_ids: String = row.try_get("project_ids")?;
    let scopes: Vec<TokenScope> = match row.try_get::<String, _>("scopes") {
        Ok(raw) => serde_json::from_str(&raw).map_err(|e| Error::source(ErrorKind::Internal, e))?,
        Err(_) => Vec::new(),
    };

    Ok(Grant {
        role: role
            .parse()
            .map_err(|e| Error::source(ErrorKind::Internal, e))?,
        projects: serde_json::from_str(&project_ids)
            .map_err(|e| Error::source(ErrorKind::Internal, e))?,
        scopes,
    })
}

#[cfg(test)]
mod tests {
    use enclii_common::models::project::ProjectSlug;

    use super::*;

    async fn fixture() -> (Persistence, Service, Uuid) {
        let persistence = Persistence::new_in_memory().await.unwrap();
        let slug: ProjectSlug = "acme-shop".parse().unwrap();
        let project = persistence
            .create_project(&slug, "Acme Shop", "tester")
            .await
            .unwrap();
        let environment = persistence
            .create_environment(&project, "staging".parse().unwrap(), "tester")
            .await
            .unwrap();
        let service = persistence
            .create_service(
                project.id,
                &"api".parse().unwrap(),
                "github.com/acme/shop",
                "main",
                ".",
                BuildConfig::Auto,
                RuntimeConfig::default(),
                true,
                "tester",
            )
            .await
            .unwrap();
        (persistence, service, environment.id)
    }

    #[tokio::test]
    async fn secrets_are_masked_in_lists() {
        let (persistence, service, _) = fixture().await;

        persistence
            .upsert_env_var(
                service.id,
                None,
                &"DATABASE_URL".parse().unwrap(),
                "postgres://secret",
                true,
                "tester",
            )
            .await
            .unwrap();

        let vars = persistence.list_env_vars(service.id).await.unwrap();
        assert_eq!(vars.len(), 1);
        assert!(vars[0].secret);
        assert_eq!(vars[0].value, None);
    }

    #[tokio::test]
    async fn environment_overrides_win_in_merged_env() {
        let (persistence, service, environment_id) = fixture().await;

        persistence
            .upsert_env_var(service.id, None, &"RUST_LOG".parse().unwrap(), "info", false, "t")
            .await
            .unwrap();
        persistence
            .upsert_env_var(
                service.id,
                Some(environment_id),
                &"RUST_LOG".parse().unwrap(),
                "debug",
                false,
                "t",
            )
            .await
            .unwrap();
        persistence
            .upsert_env_var(service.id, None, &"PORT".parse().unwrap(), "8080", false, "t")
            .await
            .unwrap();

        let merged = persistence.merged_env(service.id, environment_id).await.unwrap();
        assert_eq!(merged.get("RUST_LOG").unwrap(), "debug");
        assert_eq!(merged.get("PORT").unwrap(), "8080");
    }

    #[tokio::test]
    async fn upsert_bumps_version() {
        let (persistence, service, _) = fixture().await;
        let key: EnvVarKey = "API_KEY".parse().unwrap();

        let first = persistence
            .upsert_env_var(service.id, None, &key, "one", false, "t")
            .await
            .unwrap();
        let second = persistence
            .upsert_env_var(service.id, None, &key, "two", false, "t")
            .await
            .unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
    }
}
