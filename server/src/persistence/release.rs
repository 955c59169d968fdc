use chrono::{DateTime, Utc};
use sqlx::Row;
use strum::{Display, EnumString};
use uuid::Uuid;

use enclii_common::models::error::ErrorKind;
use enclii_common::models::release::{BuildTrigger, Release, ReleaseStatus};

use super::{record_audit, Change, Persistence};
use crate::{Error, Result};

#[derive(
    Clone, Copy, Debug, Default, Display, EnumString, Eq, PartialEq,
)]
#[strum(serialize_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum BuildJobStatus {
    #[default]
    Queued,
    Building,
    Done,
    Failed,
}

/// One unit of work for the build pool.
#[derive(Clone, Debug)]
pub struct BuildJob {
    pub id: Uuid,
    pub service_id: Uuid,
    pub git_sha: String,
    pub trigger: BuildTrigger,
    pub pr_number: Option<u32>,
    pub force: bool,
    pub status: BuildJobStatus,
    pub release_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// What enqueueing a build resolved to.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// A new job was queued.
    Queued(BuildJob),
    /// An identical job is already queued or building.
    Deduped(BuildJob),
    /// A ready release for the pair already exists; no rebuild.
    Existing(Release),
}

impl Persistence {
    // ==== build jobs ====

    pub async fn enqueue_build(
        &self,
        service_id: Uuid,
        git_sha: &str,
        trigger: BuildTrigger,
        pr_number: Option<u32>,
        force: bool,
        actor: &str,
    ) -> Result<EnqueueOutcome> {
        if !force {
            if let Some(release) = self.find_ready_release(service_id, git_sha).await? {
                return Ok(EnqueueOutcome::Existing(release));
            }
        }

        if let Some(job) = self.find_active_job(service_id, git_sha).await? {
            return Ok(EnqueueOutcome::Deduped(job));
        }

        let job = BuildJob {
            id: Uuid::new_v4(),
            service_id,
            git_sha: git_sha.to_string(),
            trigger,
            pr_number,
            force,
            status: BuildJobStatus::Queued,
            release_id: None,
            created_at: Utc::now(),
        };

        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO build_jobs (id, service_id, git_sha, trigger_kind, pr_number, force, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 'queued', ?)",
        )
        .bind(job.id)
        .bind(job.service_id)
        .bind(&job.git_sha)
        .bind(job.trigger.to_string())
        .bind(job.pr_number)
        .bind(job.force)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await?;
        record_audit(
            &mut *tx,
            actor,
            "build.enqueue",
            "service",
            &service_id.to_string(),
            "success",
            serde_json::json!({ "git_sha": git_sha, "trigger": job.trigger.to_string() }),
        )
        .await?;
        tx.commit().await?;

        Ok(EnqueueOutcome::Queued(job))
    }

    async fn find_active_job(&self, service_id: Uuid, git_sha: &str) -> Result<Option<BuildJob>> {
        sqlx::query(
            "SELECT id, service_id, git_sha, trigger_kind, pr_number, force, status, release_id, created_at
             FROM build_jobs
             WHERE service_id = ? AND git_sha = ? AND status IN ('queued', 'building')",
        )
        .bind(service_id)
        .bind(git_sha)
        .fetch_optional(self.pool())
        .await?
        .map(|row| job_from_row(&row))
        .transpose()
    }

    /// The job that produced a release; carries the trigger and PR number
    /// the auto-deploy path routes on.
    pub async fn job_for_release(&self, release_id: Uuid) -> Result<Option<BuildJob>> {
        sqlx::query(
            "SELECT id, service_id, git_sha, trigger_kind, pr_number, force, status, release_id, created_at
             FROM build_jobs WHERE release_id = ?",
        )
        .bind(release_id)
        .fetch_optional(self.pool())
        .await?
        .map(|row| job_from_row(&row))
        .transpose()
    }

    /// Jobs that were in flight when the process died; re-claimed at startup.
    pub async fn unfinished_jobs(&self) -> Result<Vec<BuildJob>> {
        sqlx::query(
            "SELECT id, service_id, git_sha, trigger_kind, pr_number, force, status, release_id, created_at
             FROM build_jobs WHERE status IN ('queued', 'building') ORDER BY created_at",
        )
        .fetch_all(self.pool())
        .await?
        .iter()
        .map(job_from_row)
        .collect()
    }

    /// Atomically mark the job building and allocate the release row with
    /// the next per-service sequence. Re-running after a crash hands back
    /// the release the first run created.
    pub async fn claim_build(&self, job: &BuildJob) -> Result<Release> {
        if let Some(release_id) = job.release_id {
            return self.get_release(release_id).await;
        }

        let mut tx = self.pool().begin().await?;

        // Double-check under the transaction: a restart may have claimed it.
        let existing: Option<Uuid> =
            sqlx::query_scalar("SELECT release_id FROM build_jobs WHERE id = ?")
                .bind(job.id)
                .fetch_one(&mut *tx)
                .await?;
        if let Some(release_id) = existing {
            tx.commit().await?;
            return self.get_release(release_id).await;
        }

        let sequence: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM releases WHERE service_id = ?",
        )
        .bind(job.service_id)
        .fetch_one(&mut *tx)
        .await?;

        let release = Release {
            id: Uuid::new_v4(),
            service_id: job.service_id,
            sequence,
            git_sha: job.git_sha.clone(),
            image_uri: None,
            image_digest: None,
            sbom_ref: None,
            signature_ref: None,
            provenance_ref: None,
            status: ReleaseStatus::Building,
            created_at: Utc::now(),
            builder_log_ref: None,
            cache_hit: None,
            digest_policy: None,
        };

        sqlx::query(
            "INSERT INTO releases (id, service_id, sequence, git_sha, status, created_at)
             VALUES (?, ?, ?, ?, 'building', ?)",
        )
        .bind(release.id)
        .bind(release.service_id)
        .bind(release.sequence)
        .bind(&release.git_sha)
        .bind(release.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE build_jobs SET status = 'building', release_id = ? WHERE id = ?")
            .bind(release.id)
            .bind(job.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(release)
    }

    pub async fn set_release_pushing(&self, release_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE releases SET status = 'pushing' WHERE id = ? AND status != 'ready'")
            .bind(release_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Finalize a successful build. A release that already turned ready is
    /// immutable; the guard makes replays no-ops.
    #[allow(clippy::too_many_arguments)]
    pub async fn ready_release(
        &self,
        release_id: Uuid,
        image_uri: &str,
        image_digest: &str,
        sbom_ref: &str,
        signature_ref: &str,
        provenance_ref: &str,
        cache_hit: bool,
        digest_policy: &str,
    ) -> Result<Release> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "UPDATE releases
             SET status = 'ready', image_uri = ?, image_digest = ?, sbom_ref = ?,
                 signature_ref = ?, provenance_ref = ?, cache_hit = ?, digest_policy = ?,
                 builder_log_ref = ?
             WHERE id = ? AND status != 'ready'",
        )
        .bind(image_uri)
        .bind(image_digest)
        .bind(sbom_ref)
        .bind(signature_ref)
        .bind(provenance_ref)
        .bind(cache_hit)
        .bind(digest_policy)
        .bind(format!("logs/{release_id}"))
        .bind(release_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE build_jobs SET status = 'done' WHERE release_id = ?")
            .bind(release_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let release = self.get_release(release_id).await?;
        self.emit(Change::ReleaseReady {
            service_id: release.service_id,
            release_id,
        });

        Ok(release)
    }

    pub async fn fail_release(&self, release_id: Uuid, stage: &str, error: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "UPDATE releases SET status = 'failed', builder_log_ref = ?
             WHERE id = ? AND status != 'ready'",
        )
        .bind(format!("logs/{release_id}"))
        .bind(release_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE build_jobs SET status = 'failed' WHERE release_id = ?")
            .bind(release_id)
            .execute(&mut *tx)
            .await?;
        record_audit(
            &mut *tx,
            "builder",
            "build.failed",
            "release",
            &release_id.to_string(),
            "failure",
            serde_json::json!({ "stage": stage, "error": error }),
        )
        .await?;
        tx.commit().await?;

        let release = self.get_release(release_id).await?;
        self.emit(Change::ReleaseFailed {
            service_id: release.service_id,
            release_id,
        });

        Ok(())
    }

    // ==== release ledger ====

    pub async fn get_release(&self, id: Uuid) -> Result<Release> {
        sqlx::query(&release_query("WHERE id = ?"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .map(|row| release_from_row(&row))
            .transpose()?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    /// Newest first; `cursor` is the sequence to continue below.
    pub async fn list_releases(
        &self,
        service_id: Uuid,
        limit: u32,
        cursor: Option<i64>,
    ) -> Result<Vec<Release>> {
        sqlx::query(&release_query(
            "WHERE service_id = ? AND sequence < ? ORDER BY sequence DESC LIMIT ?",
        ))
        .bind(service_id)
        .bind(cursor.unwrap_or(i64::MAX))
        .bind(limit)
        .fetch_all(self.pool())
        .await?
        .iter()
        .map(release_from_row)
        .collect()
    }

    pub async fn latest_ready_release(&self, service_id: Uuid) -> Result<Option<Release>> {
        sqlx::query(&release_query(
            "WHERE service_id = ? AND status = 'ready' ORDER BY sequence DESC LIMIT 1",
        ))
        .bind(service_id)
        .fetch_optional(self.pool())
        .await?
        .map(|row| release_from_row(&row))
        .transpose()
    }

    pub async fn find_ready_release(
        &self,
        service_id: Uuid,
        git_sha: &str,
    ) -> Result<Option<Release>> {
        sqlx::query(&release_query(
            "WHERE service_id = ? AND git_sha = ? AND status = 'ready'
             ORDER BY sequence DESC LIMIT 1",
        ))
        .bind(service_id)
        .bind(git_sha)
        .fetch_optional(self.pool())
        .await?
        .map(|row| release_from_row(&row))
        .transpose()
    }

    // ==== build logs ====

    pub async fn append_build_log(&self, release_id: Uuid, stage: &str, line: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO build_logs (release_id, stage, line, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(release_id)
        .bind(stage)
        .bind(line)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Incremental build log fetch; returns `(cursor, stage, line)` rows
    /// strictly after `since`.
    pub async fn build_logs_since(
        &self,
        release_id: Uuid,
        since: i64,
    ) -> Result<Vec<(i64, String, String)>> {
        sqlx::query(
            "SELECT id, stage, line FROM build_logs
             WHERE release_id = ? AND id > ? ORDER BY id",
        )
        .bind(release_id)
        .bind(since)
        .fetch_all(self.pool())
        .await?
        .iter()
        .map(|row| {
            Ok((
                row.try_get("id")?,
                row.try_get("stage")?,
                row.try_get("line")?,
            ))
        })
        .collect()
    }
}

fn release_query(suffix: &str) -> String {
    format!(
        "SELECT id, service_id, sequence, git_sha, image_uri, image_digest, sbom_ref,
                signature_ref, provenance_ref, status, created_at, builder_log_ref,
                cache_hit, digest_policy
         FROM releases {suffix}"
    )
}

fn release_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Release> {
    let status: String = row.try_get("status")?;
    Ok(Release {
        id: row.try_get("id")?,
        service_id: row.try_get("service_id")?,
        sequence: row.try_get("sequence")?,
        git_sha: row.try_get("git_sha")?,
        image_uri: row.try_get("image_uri")?,
        image_digest: row.try_get("image_digest")?,
        sbom_ref: row.try_get("sbom_ref")?,
        signature_ref: row.try_get("signature_ref")?,
        provenance_ref: row.try_get("provenance_ref")?,
        status: status
            .parse()
            .map_err(|e| Error::source(ErrorKind::Internal, e))?,
        created_at: row.try_get("created_at")?,
        builder_log_ref: row.try_get("builder_log_ref")?,
        cache_hit: row.try_get("cache_hit")?,
        digest_policy: row.try_get("digest_policy")?,
    })
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<BuildJob> {
    let trigger: String = row.try_get("trigger_kind")?;
    let status: String = row.try_get("status")?;
    let release_id: Option<Uuid> = row.try_get("release_id")?;
    Ok(BuildJob {
        id: row.try_get("id")?,
        service_id: row.try_get("service_id")?,
        git_sha: row.try_get("git_sha")?,
        trigger: trigger
            .parse()
            .map_err(|e| Error::source(ErrorKind::Internal, e))?,
        pr_number: row.try_get("pr_number")?,
        force: row.try_get("force")?,
        status: status
            .parse()
            .map_err(|e| Error::source(ErrorKind::Internal, e))?,
        release_id,
        created_at: row.try_get("created_at")?,
    })
}
