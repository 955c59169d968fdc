use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use enclii_common::models::deployment::{
    Deployment, DeploymentStatus, HealthState, Receipt, Strategy,
};
use enclii_common::models::error::ErrorKind;
use enclii_common::models::project::Environment;
use enclii_common::models::release::Release;
use enclii_common::models::service::Service;

use super::{record_audit, Change, Persistence};
use crate::{Error, Result};

/// Narrowing for deployment listings.
#[derive(Clone, Copy, Debug)]
pub enum DeploymentFilter {
    Service(Uuid),
    Environment(Uuid),
}

/// What starting a deployment resolved to.
#[derive(Debug)]
pub enum DeployOutcome {
    Started(Deployment),
    /// The release is already the current running deployment for the key.
    AlreadyRunning(Deployment),
}

impl Persistence {
    /// Start a deployment for `(service, environment)`, enforcing the
    /// single-non-terminal invariant inside one transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn begin_deployment(
        &self,
        service: &Service,
        environment: &Environment,
        release: &Release,
        strategy: Strategy,
        replicas: u32,
        initial_status: DeploymentStatus,
        previous_deployment_id: Option<Uuid>,
        preempt: bool,
        actor: &str,
    ) -> Result<DeployOutcome> {
        if environment.draining {
            return Err(Error::custom(
                ErrorKind::Conflict,
                "environment is draining and refuses new deployments",
            ));
        }

        let mut tx = self.pool().begin().await?;

        let current = sqlx::query(&deployment_query(
            "WHERE service_id = ? AND environment_id = ?
             ORDER BY started_at DESC, version DESC LIMIT 1",
        ))
        .bind(service.id)
        .bind(environment.id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| deployment_from_row(&row))
        .transpose()?;

        if let Some(current) = current {
            if !current.status.is_terminal() {
                if !preempt {
                    return Err(Error::custom(
                        ErrorKind::DeploymentInProgress,
                        format!("deployment {} is in flight", current.id),
                    ));
                }
                sqlx::query(
                    "UPDATE deployments SET status = 'failed', error = 'preempted',
                     ended_at = ?, version = version + 1 WHERE id = ?",
                )
                .bind(Utc::now())
                .bind(current.id)
                .execute(&mut *tx)
                .await?;
            } else if current.status == DeploymentStatus::Running
                && current.release_id == release.id
            {
                // Re-deploying the converged release is a no-op.
                return Ok(DeployOutcome::AlreadyRunning(current));
            }
        }

        let deployment = Deployment {
            id: Uuid::new_v4(),
            release_id: release.id,
            environment_id: environment.id,
            replicas_desired: replicas,
            replicas_ready: 0,
            status: initial_status,
            health: HealthState::Unknown,
            strategy,
            started_at: Utc::now(),
            ended_at: None,
            previous_deployment_id,
            error: None,
        };

        sqlx::query(
            "INSERT INTO deployments
             (id, release_id, environment_id, service_id, replicas_desired, replicas_ready,
              status, health, strategy, started_at, previous_deployment_id, version)
             VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, 1)",
        )
        .bind(deployment.id)
        .bind(deployment.release_id)
        .bind(deployment.environment_id)
        .bind(service.id)
        .bind(deployment.replicas_desired)
        .bind(deployment.status.to_string())
        .bind(deployment.health.to_string())
        .bind(deployment.strategy.to_string())
        .bind(deployment.started_at)
        .bind(deployment.previous_deployment_id)
        .execute(&mut *tx)
        .await?;
        record_audit(
            &mut *tx,
            actor,
            "deployment.create",
            "deployment",
            &deployment.id.to_string(),
            "success",
            serde_json::json!({
                "release": release.id.to_string(),
                "environment": environment.name.to_string(),
                "strategy": deployment.strategy.to_string(),
            }),
        )
        .await?;
        tx.commit().await?;

        self.emit(Change::DeploymentStatusChanged {
            deployment_id: deployment.id,
            service_id: service.id,
            environment_id: environment.id,
            status: deployment.status,
            version: 1,
        });

        Ok(DeployOutcome::Started(deployment))
    }

    /// Advance the deployment state machine. Illegal edges are rejected so
    /// a stale reconciler pass cannot corrupt history.
    pub async fn set_deployment_status(
        &self,
        id: Uuid,
        next: DeploymentStatus,
        error: Option<&str>,
    ) -> Result<Deployment> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(&deployment_query("WHERE id = ?"))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;
        let current = deployment_from_row(&row)?;
        let service_id: Uuid = row.try_get("service_id")?;

        if current.status == next {
            return Ok(current);
        }
        if !current.status.can_transition_to(next) {
            return Err(Error::custom(
                ErrorKind::Conflict,
                format!("illegal deployment transition {} -> {next}", current.status),
            ));
        }

        let ended_at = next.is_terminal().then(Utc::now);
        sqlx::query(
            "UPDATE deployments SET status = ?, error = COALESCE(?, error), ended_at = ?,
             version = version + 1 WHERE id = ?",
        )
        .bind(next.to_string())
        .bind(error)
        .bind(ended_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let updated = self.get_deployment(id).await?;
        self.emit(Change::DeploymentStatusChanged {
            deployment_id: id,
            service_id,
            environment_id: updated.environment_id,
            status: next,
            version: 0,
        });

        Ok(updated)
    }

    /// Record observed progress without moving the state machine.
    pub async fn update_deployment_progress(
        &self,
        id: Uuid,
        replicas_ready: u32,
        health: HealthState,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE deployments SET replicas_ready = ?, health = ?, version = version + 1
             WHERE id = ?",
        )
        .bind(replicas_ready)
        .bind(health.to_string())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_deployment(&self, id: Uuid) -> Result<Deployment> {
        sqlx::query(&deployment_query("WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .map(|row| deployment_from_row(&row))
            .transpose()?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    pub async fn deployment_service_id(&self, id: Uuid) -> Result<Uuid> {
        sqlx::query_scalar("SELECT service_id FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    pub async fn active_deployment(
        &self,
        service_id: Uuid,
        environment_id: Uuid,
    ) -> Result<Option<Deployment>> {
        sqlx::query(&deployment_query(
            "WHERE service_id = ? AND environment_id = ?
             AND status NOT IN ('running', 'failed', 'rolled_back')
             ORDER BY started_at DESC LIMIT 1",
        ))
        .bind(service_id)
        .bind(environment_id)
        .fetch_optional(self.pool())
        .await?
        .map(|row| deployment_from_row(&row))
        .transpose()
    }

    pub async fn latest_deployment(
        &self,
        service_id: Uuid,
        environment_id: Option<Uuid>,
    ) -> Result<Option<Deployment>> {
        let rows = match environment_id {
            Some(environment_id) => {
                sqlx::query(&deployment_query(
                    "WHERE service_id = ? AND environment_id = ?
                     ORDER BY started_at DESC, version DESC LIMIT 1",
                ))
                .bind(service_id)
                .bind(environment_id)
                .fetch_optional(self.pool())
                .await?
            }
            None => {
                sqlx::query(&deployment_query(
                    "WHERE service_id = ? ORDER BY started_at DESC, version DESC LIMIT 1",
                ))
                .bind(service_id)
                .fetch_optional(self.pool())
                .await?
            }
        };

        rows.map(|row| deployment_from_row(&row)).transpose()
    }

    pub async fn list_deployments(&self, filter: DeploymentFilter) -> Result<Vec<Deployment>> {
        let rows = match filter {
            DeploymentFilter::Service(id) => {
                sqlx::query(&deployment_query(
                    "WHERE service_id = ? ORDER BY started_at DESC",
                ))
                .bind(id)
                .fetch_all(self.pool())
                .await?
            }
            DeploymentFilter::Environment(id) => {
                sqlx::query(&deployment_query(
                    "WHERE environment_id = ? ORDER BY started_at DESC",
                ))
                .bind(id)
                .fetch_all(self.pool())
                .await?
            }
        };

        rows.iter().map(deployment_from_row).collect()
    }

    /// The most recent deployment that reached `running` before the given
    /// one; the default rollback target.
    pub async fn previous_running_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<Option<Deployment>> {
        let service_id = self.deployment_service_id(deployment.id).await?;
        sqlx::query(&deployment_query(
            "WHERE service_id = ? AND environment_id = ? AND status = 'running'
             AND started_at < ? AND id != ?
             ORDER BY started_at DESC LIMIT 1",
        ))
        .bind(service_id)
        .bind(deployment.environment_id)
        .bind(deployment.started_at)
        .bind(deployment.id)
        .fetch_optional(self.pool())
        .await?
        .map(|row| deployment_from_row(&row))
        .transpose()
    }

    /// Every `(service, environment)` key with reconcile work pending:
    /// a non-terminal deployment, or a draining environment.
    pub async fn reconcile_keys(&self) -> Result<Vec<(Uuid, Uuid)>> {
        let mut keys: Vec<(Uuid, Uuid)> = sqlx::query(
            "SELECT DISTINCT service_id, environment_id FROM deployments
             WHERE status NOT IN ('running', 'failed', 'rolled_back')",
        )
        .fetch_all(self.pool())
        .await?
        .iter()
        .map(|row| Ok((row.try_get("service_id")?, row.try_get("environment_id")?)))
        .collect::<Result<_>>()?;

        let draining: Vec<(Uuid, Uuid)> = sqlx::query(
            "SELECT DISTINCT d.service_id, d.environment_id FROM deployments d
             JOIN environments e ON e.id = d.environment_id WHERE e.draining = 1",
        )
        .fetch_all(self.pool())
        .await?
        .iter()
        .map(|row| Ok((row.try_get("service_id")?, row.try_get("environment_id")?)))
        .collect::<Result<_>>()?;

        for key in draining {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        Ok(keys)
    }

    /// Keys whose in-flight deployments wait on the given release.
    pub async fn keys_for_release(&self, release_id: Uuid) -> Result<Vec<(Uuid, Uuid)>> {
        sqlx::query(
            "SELECT DISTINCT service_id, environment_id FROM deployments
             WHERE release_id = ? AND status NOT IN ('running', 'failed', 'rolled_back')",
        )
        .bind(release_id)
        .fetch_all(self.pool())
        .await?
        .iter()
        .map(|row| Ok((row.try_get("service_id")?, row.try_get("environment_id")?)))
        .collect()
    }

    /// Who created the deployment, per its audit trail.
    pub async fn deployment_actor(&self, deployment_id: Uuid) -> Result<String> {
        let actor: Option<String> = sqlx::query_scalar(
            "SELECT actor FROM audit_events
             WHERE action = 'deployment.create' AND resource_id = ?
             ORDER BY timestamp LIMIT 1",
        )
        .bind(deployment_id.to_string())
        .fetch_optional(self.pool())
        .await?;

        Ok(actor.unwrap_or_else(|| "unknown".to_string()))
    }

    // ==== receipts ====

    /// Insert-if-absent so a crashed reconciler replaying a terminal
    /// transition cannot double-emit.
    pub async fn insert_receipt(&self, receipt: &Receipt) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO receipts
             (deployment_id, release_id, git_sha, pr_url, pr_approver, image_digest,
              signature_ref, sbom_ref, deployed_by, deployed_at, signed_payload)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(receipt.deployment_id)
        .bind(receipt.release_id)
        .bind(&receipt.git_sha)
        .bind(&receipt.pr_url)
        .bind(&receipt.pr_approver)
        .bind(&receipt.image_digest)
        .bind(&receipt.signature_ref)
        .bind(&receipt.sbom_ref)
        .bind(&receipt.deployed_by)
        .bind(receipt.deployed_at)
        .bind(&receipt.signed_payload)
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(inserted > 0)
    }

    pub async fn get_receipt(&self, deployment_id: Uuid) -> Result<Option<Receipt>> {
        sqlx::query(
            "SELECT deployment_id, release_id, git_sha, pr_url, pr_approver, image_digest,
                    signature_ref, sbom_ref, deployed_by, deployed_at, signed_payload
             FROM receipts WHERE deployment_id = ?",
        )
        .bind(deployment_id)
        .fetch_optional(self.pool())
        .await?
        .map(|row| receipt_from_row(&row))
        .transpose()
    }

    pub async fn undelivered_receipts(&self, limit: u32) -> Result<Vec<Receipt>> {
        sqlx::query(
            "SELECT deployment_id, release_id, git_sha, pr_url, pr_approver, image_digest,
                    signature_ref, sbom_ref, deployed_by, deployed_at, signed_payload
             FROM receipts WHERE delivered = 0 ORDER BY deployed_at LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?
        .iter()
        .map(receipt_from_row)
        .collect()
    }

    pub async fn mark_receipt_delivered(&self, deployment_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE receipts SET delivered = 1 WHERE deployment_id = ?")
            .bind(deployment_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn bump_receipt_attempts(&self, deployment_id: Uuid) -> Result<i64> {
        sqlx::query("UPDATE receipts SET attempts = attempts + 1 WHERE deployment_id = ?")
            .bind(deployment_id)
            .execute(self.pool())
            .await?;
        Ok(
            sqlx::query_scalar("SELECT attempts FROM receipts WHERE deployment_id = ?")
                .bind(deployment_id)
                .fetch_one(self.pool())
                .await?,
        )
    }
}

fn deployment_query(suffix: &str) -> String {
    format!(
        "SELECT id, release_id, environment_id, service_id, replicas_desired, replicas_ready,
                status, health, strategy, started_at, ended_at, previous_deployment_id, error
         FROM deployments {suffix}"
    )
}

fn deployment_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Deployment> {
    let status: String = row.try_get("status")?;
    let health: String = row.try_get("health")?;
    let strategy: String = row.try_get("strategy")?;
    let previous: Option<Uuid> = row.try_get("previous_deployment_id")?;

    Ok(Deployment {
        id: row.try_get("id")?,
        release_id: row.try_get("release_id")?,
        environment_id: row.try_get("environment_id")?,
        replicas_desired: row.try_get("replicas_desired")?,
        replicas_ready: row.try_get("replicas_ready")?,
        status: status
            .parse()
            .map_err(|e| Error::source(ErrorKind::Internal, e))?,
        health: health
            .parse()
            .map_err(|e| Error::source(ErrorKind::Internal, e))?,
        strategy: strategy
            .parse()
            .map_err(|e| Error::source(ErrorKind::Internal, e))?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        previous_deployment_id: previous,
        error: row.try_get("error")?,
    })
}

fn receipt_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Receipt> {
    Ok(Receipt {
        deployment_id: row.try_get("deployment_id")?,
        release_id: row.try_get("release_id")?,
        git_sha: row.try_get("git_sha")?,
        pr_url: row.try_get("pr_url")?,
        pr_approver: row.try_get("pr_approver")?,
        image_digest: row.try_get("image_digest")?,
        signature_ref: row.try_get("signature_ref")?,
        sbom_ref: row.try_get("sbom_ref")?,
        deployed_by: row.try_get("deployed_by")?,
        deployed_at: row.try_get("deployed_at")?,
        signed_payload: row.try_get("signed_payload")?,
    })
}
