// Handle database interactions.

mod deployment;
mod release;
mod service;

pub use deployment::{DeployOutcome, DeploymentFilter};
pub use release::{BuildJob, BuildJobStatus, EnqueueOutcome};
pub use service::{Grant, ServiceUpdate};

use std::str::FromStr;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use enclii_common::models::deployment::DeploymentStatus;
use enclii_common::models::error::ErrorKind;
use enclii_common::models::project::{Environment, EnvironmentName, Project, ProjectSlug};

use crate::{Error, Result};

const CHANGE_BUFFER_SIZE: usize = 256;

/// Logical events published after commits. Delivery is at-least-once from a
/// consumer's point of view (a resync can replay the same observation), so
/// consumers key their work on `(entity_id, version)`.
#[derive(Clone, Debug)]
pub enum Change {
    ReleaseReady {
        service_id: Uuid,
        release_id: Uuid,
    },
    ReleaseFailed {
        service_id: Uuid,
        release_id: Uuid,
    },
    DeploymentStatusChanged {
        deployment_id: Uuid,
        service_id: Uuid,
        environment_id: Uuid,
        status: DeploymentStatus,
        version: i64,
    },
    EnvironmentDraining {
        environment_id: Uuid,
    },
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        slug TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS environments (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        namespace TEXT NOT NULL,
        is_production INTEGER NOT NULL DEFAULT 0,
        draining INTEGER NOT NULL DEFAULT 0,
        UNIQUE (project_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS services (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        git_repo TEXT NOT NULL,
        git_branch TEXT NOT NULL,
        app_path TEXT NOT NULL DEFAULT '.',
        build_config TEXT NOT NULL,
        runtime_config TEXT NOT NULL,
        auto_deploy INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        UNIQUE (project_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS releases (
        id TEXT PRIMARY KEY,
        service_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        git_sha TEXT NOT NULL,
        image_uri TEXT,
        image_digest TEXT,
        sbom_ref TEXT,
        signature_ref TEXT,
        provenance_ref TEXT,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        builder_log_ref TEXT,
        cache_hit INTEGER,
        digest_policy TEXT,
        UNIQUE (service_id, sequence)
    )",
    "CREATE INDEX IF NOT EXISTS releases_service_sha ON releases (service_id, git_sha)",
    "CREATE TABLE IF NOT EXISTS build_jobs (
        id TEXT PRIMARY KEY,
        service_id TEXT NOT NULL,
        git_sha TEXT NOT NULL,
        trigger_kind TEXT NOT NULL,
        pr_number INTEGER,
        force INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        release_id TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS build_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        release_id TEXT NOT NULL,
        stage TEXT NOT NULL,
        line TEXT NOT NULL,
        timestamp TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS deployments (
        id TEXT PRIMARY KEY,
        release_id TEXT NOT NULL,
        environment_id TEXT NOT NULL,
        service_id TEXT NOT NULL,
        replicas_desired INTEGER NOT NULL,
        replicas_ready INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        health TEXT NOT NULL,
        strategy TEXT NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        previous_deployment_id TEXT,
        error TEXT,
        version INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE INDEX IF NOT EXISTS deployments_key ON deployments (service_id, environment_id)",
    "CREATE TABLE IF NOT EXISTS env_vars (
        id TEXT PRIMARY KEY,
        service_id TEXT NOT NULL,
        environment_id TEXT NOT NULL DEFAULT '',
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        secret INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL DEFAULT 1,
        UNIQUE (service_id, environment_id, key)
    )",
    "CREATE TABLE IF NOT EXISTS audit_events (
        id TEXT PRIMARY KEY,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        resource_id TEXT NOT NULL,
        outcome TEXT NOT NULL,
        context TEXT NOT NULL,
        timestamp TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS receipts (
        deployment_id TEXT PRIMARY KEY,
        release_id TEXT NOT NULL,
        git_sha TEXT NOT NULL,
        pr_url TEXT,
        pr_approver TEXT,
        image_digest TEXT,
        signature_ref TEXT,
        sbom_ref TEXT,
        deployed_by TEXT NOT NULL,
        deployed_at TEXT NOT NULL,
        signed_payload TEXT NOT NULL,
        delivered INTEGER NOT NULL DEFAULT 0,
        attempts INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS api_tokens (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        token_hash TEXT NOT NULL UNIQUE,
        role TEXT NOT NULL,
        scopes TEXT NOT NULL,
        project_ids TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS platform_users (
        sub TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        role TEXT NOT NULL,
        project_ids TEXT NOT NULL
    )",
];

#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
    changes: broadcast::Sender<Change>,
}

impl Persistence {
    pub async fn new(uri: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(uri)
            .map_err(|e| Error::source(ErrorKind::Internal, e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;

        Self::from_pool(pool).await
    }

    /// An isolated store for tests and local experiments.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        let (changes, _) = broadcast::channel(CHANGE_BUFFER_SIZE);

        Ok(Self { pool, changes })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    /// Readiness probe: can we reach the store at all.
    pub async fn healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub(crate) fn emit(&self, change: Change) {
        // Nobody listening is fine; resync covers the gap.
        let _ = self.changes.send(change);
    }

    // ==== projects ====

    pub async fn create_project(
        &self,
        slug: &ProjectSlug,
        name: &str,
        actor: &str,
    ) -> Result<Project> {
        let project = Project {
            id: Uuid::new_v4(),
            slug: slug.clone(),
            name: name.to_string(),
            created_at: Utc::now(),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO projects (id, slug, name, created_at) VALUES (?, ?, ?, ?)")
            .bind(project.id)
            .bind(project.slug.as_str())
            .bind(&project.name)
            .bind(project.created_at)
            .execute(&mut *tx)
            .await?;
        record_audit(
            &mut *tx,
            actor,
            "project.create",
            "project",
            &project.id.to_string(),
            "success",
            serde_json::json!({ "slug": project.slug.as_str() }),
        )
        .await?;
        tx.commit().await?;

        info!(slug = %project.slug, "created project");

        Ok(project)
    }

    pub async fn get_project(&self, id: Uuid) -> Result<Project> {
        sqlx::query("SELECT id, slug, name, created_at FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| project_from_row(&row))
            .transpose()?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    pub async fn get_project_by_slug(&self, slug: &ProjectSlug) -> Result<Project> {
        sqlx::query("SELECT id, slug, name, created_at FROM projects WHERE slug = ?")
            .bind(slug.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| project_from_row(&row))
            .transpose()?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        sqlx::query("SELECT id, slug, name, created_at FROM projects ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(project_from_row)
            .collect()
    }

    // ==== environments ====

    pub async fn create_environment(
        &self,
        project: &Project,
        name: EnvironmentName,
        actor: &str,
    ) -> Result<Environment> {
        let is_production = name == EnvironmentName::Production;
        let environment = Environment {
            id: Uuid::new_v4(),
            project_id: project.id,
            namespace: format!("{}-{}", project.slug, name),
            name,
            is_production,
            draining: false,
        };

        let mut tx = self.pool.begin().await?;

        if is_production {
            let existing: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM environments WHERE project_id = ? AND is_production = 1",
            )
            .bind(project.id)
            .fetch_one(&mut *tx)
            .await?;
            if existing > 0 {
                return Err(Error::custom(
                    ErrorKind::Conflict,
                    "project already has a production environment",
                ));
            }
        }

        sqlx::query(
            "INSERT INTO environments (id, project_id, name, namespace, is_production, draining)
             VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(environment.id)
        .bind(environment.project_id)
        .bind(environment.name.to_string())
        .bind(&environment.namespace)
        .bind(environment.is_production)
        .execute(&mut *tx)
        .await?;
        record_audit(
            &mut *tx,
            actor,
            "environment.create",
            "environment",
            &environment.id.to_string(),
            "success",
            serde_json::json!({ "name": environment.name.to_string() }),
        )
        .await?;
        tx.commit().await?;

        Ok(environment)
    }

    /// Get-or-create the preview environment for a pull request.
    pub async fn ensure_preview_environment(
        &self,
        project: &Project,
        pr_number: u32,
        actor: &str,
    ) -> Result<Environment> {
        let name = EnvironmentName::Preview(pr_number);
        match self.find_environment(project.id, &name).await? {
            Some(environment) => Ok(environment),
            None => self.create_environment(project, name, actor).await,
        }
    }

    pub async fn get_environment(&self, id: Uuid) -> Result<Environment> {
        sqlx::query(
            "SELECT id, project_id, name, namespace, is_production, draining
             FROM environments WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| environment_from_row(&row))
        .transpose()?
        .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    pub async fn find_environment(
        &self,
        project_id: Uuid,
        name: &EnvironmentName,
    ) -> Result<Option<Environment>> {
        sqlx::query(
            "SELECT id, project_id, name, namespace, is_production, draining
             FROM environments WHERE project_id = ? AND name = ?",
        )
        .bind(project_id)
        .bind(name.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| environment_from_row(&row))
        .transpose()
    }

    pub async fn list_environments(&self, project_id: Uuid) -> Result<Vec<Environment>> {
        sqlx::query(
            "SELECT id, project_id, name, namespace, is_production, draining
             FROM environments WHERE project_id = ? ORDER BY name",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(environment_from_row)
        .collect()
    }

    /// Flag an environment for teardown. The reconciler refuses new deploys
    /// for draining environments and removes the namespace once every
    /// deployment is terminal.
    pub async fn set_environment_draining(&self, id: Uuid, actor: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE environments SET draining = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(Error::from_kind(ErrorKind::NotFound));
        }
        record_audit(
            &mut *tx,
            actor,
            "environment.drain",
            "environment",
            &id.to_string(),
            "success",
            serde_json::Value::Null,
        )
        .await?;
        tx.commit().await?;

        self.emit(Change::EnvironmentDraining { environment_id: id });

        Ok(())
    }

    pub async fn environment_has_active_deployments(&self, id: Uuid) -> Result<bool> {
        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deployments
             WHERE environment_id = ? AND status NOT IN ('running', 'failed', 'rolled_back')",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(active > 0)
    }

    /// Remove a fully drained environment. Refused while any deployment
    /// under it is still non-terminal; terminal deployments are retained.
    pub async fn delete_environment(&self, id: Uuid) -> Result<()> {
        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deployments
             WHERE environment_id = ? AND status NOT IN ('running', 'failed', 'rolled_back')",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        if active > 0 {
            return Err(Error::custom(
                ErrorKind::Conflict,
                "environment still has non-terminal deployments",
            ));
        }

        sqlx::query("DELETE FROM environments WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==== audit ====

    pub async fn record_audit_event(
        &self,
        actor: &str,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        outcome: &str,
        context: serde_json::Value,
    ) -> Result<()> {
        record_audit(
            &self.pool,
            actor,
            action,
            resource_type,
            resource_id,
            outcome,
            context,
        )
        .await
    }

    pub async fn list_audit_events(
        &self,
        resource_type: Option<&str>,
        limit: u32,
    ) -> Result<Vec<enclii_common::models::deployment::AuditEvent>> {
        let rows = match resource_type {
            Some(rtype) => {
                sqlx::query(
                    "SELECT id, actor, action, resource_type, resource_id, outcome, context, timestamp
                     FROM audit_events WHERE resource_type = ? ORDER BY timestamp DESC LIMIT ?",
                )
                .bind(rtype)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, actor, action, resource_type, resource_id, outcome, context, timestamp
                     FROM audit_events ORDER BY timestamp DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter()
            .map(|row| {
                let context: String = row.try_get("context")?;
                Ok(enclii_common::models::deployment::AuditEvent {
                    id: row.try_get("id")?,
                    actor: row.try_get("actor")?,
                    action: row.try_get("action")?,
                    resource_type: row.try_get("resource_type")?,
                    resource_id: row.try_get("resource_id")?,
                    outcome: row.try_get("outcome")?,
                    context: serde_json::from_str(&context)
                        .unwrap_or(serde_json::Value::Null),
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }
}

/// Audit writes share the transaction of the verb they describe, so the
/// record and the state change land or fail together.
pub(crate) async fn record_audit<'e, E>(
    executor: E,
    actor: &str,
    action: &str,
    resource_type: &str,
    resource_id: &str,
    outcome: &str,
    context: serde_json::Value,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO audit_events (id, actor, action, resource_type, resource_id, outcome, context, timestamp)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4())
    .bind(actor)
    .bind(action)
    .bind(resource_type)
    .bind(resource_id)
    .bind(outcome)
    .bind(context.to_string())
    .bind(Utc::now())
    .execute(executor)
    .await?;

    Ok(())
}

fn project_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Project> {
    let slug: String = row.try_get("slug")?;
    Ok(Project {
        id: row.try_get("id")?,
        slug: slug
            .parse()
            .map_err(|e| Error::source(ErrorKind::Internal, e))?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn environment_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Environment> {
    let name: String = row.try_get("name")?;
    Ok(Environment {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: name
            .parse()
            .map_err(|e| Error::source(ErrorKind::Internal, e))?,
        namespace: row.try_get("namespace")?,
        is_production: row.try_get("is_production")?,
        draining: row.try_get("draining")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn project_slug_is_unique() {
        let persistence = Persistence::new_in_memory().await.unwrap();
        let slug: ProjectSlug = "acme-shop".parse().unwrap();

        persistence
            .create_project(&slug, "Acme Shop", "tester")
            .await
            .unwrap();
        let err = persistence
            .create_project(&slug, "Other", "tester")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn single_production_environment_per_project() {
        let persistence = Persistence::new_in_memory().await.unwrap();
        let slug: ProjectSlug = "acme-shop".parse().unwrap();
        let project = persistence
            .create_project(&slug, "Acme Shop", "tester")
            .await
            .unwrap();

        persistence
            .create_environment(&project, EnvironmentName::Production, "tester")
            .await
            .unwrap();
        let err = persistence
            .create_environment(&project, EnvironmentName::Production, "tester")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn preview_environment_is_get_or_create() {
        let persistence = Persistence::new_in_memory().await.unwrap();
        let slug: ProjectSlug = "acme-shop".parse().unwrap();
        let project = persistence
            .create_project(&slug, "Acme Shop", "tester")
            .await
            .unwrap();

        let first = persistence
            .ensure_preview_environment(&project, 42, "webhook")
            .await
            .unwrap();
        let second = persistence
            .ensure_preview_environment(&project, 42, "webhook")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.namespace, "acme-shop-preview-42");
    }

    #[tokio::test]
    async fn audit_lands_with_the_verb() {
        let persistence = Persistence::new_in_memory().await.unwrap();
        let slug: ProjectSlug = "acme-shop".parse().unwrap();
        persistence
            .create_project(&slug, "Acme Shop", "alice@example.com")
            .await
            .unwrap();

        let events = persistence.list_audit_events(Some("project"), 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "project.create");
        assert_eq!(events[0].actor, "alice@example.com");
        assert_eq!(events[0].outcome, "success");
    }
}
