//! One reconcile pass for one `(service, environment)` key: load the
//! snapshot, read observed state, compute the minimal mutations, apply
//! idempotent upserts, and sample the health gate.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};

use enclii_common::models::deployment::{Deployment, DeploymentStatus, HealthState, Strategy};
use enclii_common::models::error::ErrorKind;
use enclii_common::models::project::Environment;
use enclii_common::models::release::{Release, ReleaseStatus};
use enclii_common::models::service::Service;

use super::{Inner, Key, Reconciler};
use crate::orchestrator::OrchestratorError;
use crate::persistence::DeployOutcome;
use crate::planner::{self, Plan};
use crate::{receipt, Error, Result};

const VERIFY_POLL: Duration = Duration::from_secs(2);

fn upstream(err: OrchestratorError) -> Error {
    Error::source(ErrorKind::UpstreamUnavailable, err)
}

#[instrument(skip(inner), fields(service_id = %key.0, environment_id = %key.1))]
pub(crate) async fn reconcile(inner: &Arc<Inner>, key: Key) -> Result<()> {
    let (service_id, environment_id) = key;

    let environment = match inner.persistence.get_environment(environment_id).await {
        Ok(environment) => environment,
        // Row already gone: the key is fully drained.
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    if environment.draining {
        return drain(inner, key, &environment).await;
    }

    let Some(deployment) = inner
        .persistence
        .active_deployment(service_id, environment_id)
        .await?
    else {
        // Converged; only terminal history remains for this key.
        return Ok(());
    };

    let service = inner.persistence.get_service(service_id).await?;
    let release = inner.persistence.get_release(deployment.release_id).await?;

    match deployment.status {
        DeploymentStatus::Queued
        | DeploymentStatus::BuildingThrough
        | DeploymentStatus::PushingThrough => {
            follow_release(inner, key, &service, &release, &environment, &deployment).await
        }
        // A crashed pass resumes by re-applying; upserts make that safe.
        DeploymentStatus::Deploying => {
            apply(inner, key, &service, &release, &environment, &deployment).await
        }
        DeploymentStatus::Verifying => {
            verify(inner, key, &service, &release, &environment, &deployment).await
        }
        DeploymentStatus::Running
        | DeploymentStatus::Failed
        | DeploymentStatus::RolledBack => Ok(()),
    }
}

/// A deployment whose release is still in the build pipeline tracks it
/// through the `*_through` states until it turns ready or fails.
async fn follow_release(
    inner: &Arc<Inner>,
    key: Key,
    service: &Service,
    release: &Release,
    environment: &Environment,
    deployment: &Deployment,
) -> Result<()> {
    match release.status {
        ReleaseStatus::Pending | ReleaseStatus::Building => {
            if deployment.status == DeploymentStatus::Queued {
                inner
                    .persistence
                    .set_deployment_status(deployment.id, DeploymentStatus::BuildingThrough, None)
                    .await?;
            }
            Ok(())
        }
        ReleaseStatus::Pushing => {
            if deployment.status != DeploymentStatus::PushingThrough {
                inner
                    .persistence
                    .set_deployment_status(deployment.id, DeploymentStatus::PushingThrough, None)
                    .await?;
            }
            Ok(())
        }
        ReleaseStatus::Failed => {
            let failed = inner
                .persistence
                .set_deployment_status(
                    deployment.id,
                    DeploymentStatus::Failed,
                    Some("release build failed"),
                )
                .await?;
            receipt::record_terminal(&inner.persistence, &inner.signer, &failed).await?;
            Ok(())
        }
        ReleaseStatus::Ready => {
            apply(inner, key, service, release, environment, deployment).await
        }
    }
}

/// Issue the minimal mutations that move observed toward desired. Every
/// apply is an idempotent upsert keyed by resource identity, so replays
/// after a crash are safe.
async fn apply(
    inner: &Arc<Inner>,
    key: Key,
    service: &Service,
    release: &Release,
    environment: &Environment,
    deployment: &Deployment,
) -> Result<()> {
    let deployment = if deployment.status == DeploymentStatus::Deploying {
        deployment.clone()
    } else {
        inner
            .persistence
            .set_deployment_status(deployment.id, DeploymentStatus::Deploying, None)
            .await?
    };

    let env = inner
        .persistence
        .merged_env(service.id, environment.id)
        .await?;
    let plan = planner::plan(service, release, environment, &deployment, env)?;

    inner
        .orchestrator
        .ensure_namespace(&plan.namespace)
        .await
        .map_err(upstream)?;

    if plan.strategy == Strategy::Recreate {
        // Stop old, then start new.
        let observed = inner
            .orchestrator
            .observe(&plan.namespace, &plan.selector)
            .await
            .map_err(upstream)?;
        if let Some(existing) = observed.workload(&plan.workload.name) {
            if existing.image != plan.workload.image {
                inner
                    .orchestrator
                    .delete_workload(&plan.namespace, &plan.workload.name)
                    .await
                    .map_err(upstream)?;
            }
        }
    }

    inner
        .orchestrator
        .upsert_workload(&plan.namespace, &plan.workload)
        .await
        .map_err(upstream)?;
    inner
        .orchestrator
        .upsert_network(&plan.namespace, &plan.network)
        .await
        .map_err(upstream)?;
    if plan.strategy != Strategy::BlueGreen {
        // Blue/green keeps the route on the old colour until health passes.
        inner
            .orchestrator
            .upsert_ingress(&plan.namespace, &plan.ingress)
            .await
            .map_err(upstream)?;
    }

    // All mutations acknowledged.
    inner
        .persistence
        .set_deployment_status(deployment.id, DeploymentStatus::Verifying, None)
        .await?;

    Reconciler::requeue_after(inner, key, VERIFY_POLL);

    Ok(())
}

/// Sample the health gate: ready replicas and probes, bounded by the
/// stabilisation window.
async fn verify(
    inner: &Arc<Inner>,
    key: Key,
    service: &Service,
    release: &Release,
    environment: &Environment,
    deployment: &Deployment,
) -> Result<()> {
    let env = inner
        .persistence
        .merged_env(service.id, environment.id)
        .await?;
    let plan = planner::plan(service, release, environment, deployment, env)?;

    let observed = inner
        .orchestrator
        .observe(&plan.namespace, &plan.selector)
        .await
        .map_err(upstream)?;
    let ready = observed
        .workload(&plan.workload.name)
        .map(|workload| workload.replicas_ready)
        .unwrap_or(0);

    if ready >= deployment.replicas_desired {
        promote(inner, deployment, &plan, &observed).await
    } else if Utc::now() - deployment.started_at
        > chrono::Duration::from_std(inner.settings.stabilise)
            .unwrap_or_else(|_| chrono::Duration::seconds(120))
    {
        let message = format!(
            "health gate failed: {ready} of {} replicas ready after stabilisation window",
            deployment.replicas_desired
        );
        inner
            .persistence
            .update_deployment_progress(deployment.id, ready, HealthState::Unhealthy)
            .await?;
        let failed = inner
            .persistence
            .set_deployment_status(deployment.id, DeploymentStatus::Failed, Some(&message))
            .await?;
        receipt::record_terminal(&inner.persistence, &inner.signer, &failed).await?;
        warn!(deployment_id = %failed.id, %message, "deployment failed verification");

        maybe_auto_rollback(inner, key, service, environment, &failed).await
    } else {
        inner
            .persistence
            .update_deployment_progress(deployment.id, ready, HealthState::Unknown)
            .await?;
        Reconciler::requeue_after(inner, key, VERIFY_POLL);
        Ok(())
    }
}

/// The health gate passed: finish the strategy, mark running, settle any
/// rollback bookkeeping, and emit the receipt.
async fn promote(
    inner: &Arc<Inner>,
    deployment: &Deployment,
    plan: &Plan,
    observed: &crate::orchestrator::Observed,
) -> Result<()> {
    if plan.strategy == Strategy::BlueGreen {
        // The flip: a single ingress mutation, then the old colour goes.
        inner
            .orchestrator
            .upsert_ingress(&plan.namespace, &plan.ingress)
            .await
            .map_err(upstream)?;
        for workload in &observed.workloads {
            if workload.name != plan.workload.name {
                inner
                    .orchestrator
                    .delete_workload(&plan.namespace, &workload.name)
                    .await
                    .map_err(upstream)?;
            }
        }
    }

    inner
        .persistence
        .update_deployment_progress(
            deployment.id,
            deployment.replicas_desired,
            HealthState::Healthy,
        )
        .await?;
    let running = inner
        .persistence
        .set_deployment_status(deployment.id, DeploymentStatus::Running, None)
        .await?;
    info!(deployment_id = %running.id, "deployment running");

    receipt::record_terminal(&inner.persistence, &inner.signer, &running).await?;

    // This deployment replaced a failed one: the failure becomes a
    // completed rollback now that the replacement is healthy.
    if let Some(previous_id) = deployment.previous_deployment_id {
        if let Ok(previous) = inner.persistence.get_deployment(previous_id).await {
            if previous.status == DeploymentStatus::Failed {
                let rolled_back = inner
                    .persistence
                    .set_deployment_status(previous_id, DeploymentStatus::RolledBack, None)
                    .await?;
                receipt::record_terminal(&inner.persistence, &inner.signer, &rolled_back)
                    .await?;
            }
        }
    }

    Ok(())
}

/// Production deployments that are not the first for their key roll back
/// automatically to the previous running release.
async fn maybe_auto_rollback(
    inner: &Arc<Inner>,
    key: Key,
    service: &Service,
    environment: &Environment,
    failed: &Deployment,
) -> Result<()> {
    if !environment.is_production {
        return Ok(());
    }
    let Some(previous) = inner.persistence.previous_running_deployment(failed).await? else {
        // First deployment for the key: nothing to roll back to.
        return Ok(());
    };

    let release = inner.persistence.get_release(previous.release_id).await?;
    match inner
        .persistence
        .begin_deployment(
            service,
            environment,
            &release,
            Strategy::Rolling,
            previous.replicas_desired.max(1),
            DeploymentStatus::Queued,
            Some(failed.id),
            false,
            "auto-rollback",
        )
        .await
    {
        Ok(DeployOutcome::Started(replacement)) => {
            info!(
                failed_id = %failed.id,
                replacement_id = %replacement.id,
                release_sequence = release.sequence,
                "auto-rollback started"
            );
            Ok(())
        }
        Ok(DeployOutcome::AlreadyRunning(_)) => Ok(()),
        Err(err) if err.kind() == ErrorKind::DeploymentInProgress => {
            warn!("auto-rollback skipped; another deployment is already in flight");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// A draining environment converges to nothing: in-flight deployments are
/// failed, and once every deployment is terminal the namespace and the
/// environment row go away. Terminal deployments are retained for audit.
async fn drain(inner: &Arc<Inner>, key: Key, environment: &Environment) -> Result<()> {
    let (service_id, environment_id) = key;

    if let Some(active) = inner
        .persistence
        .active_deployment(service_id, environment_id)
        .await?
    {
        let failed = inner
            .persistence
            .set_deployment_status(
                active.id,
                DeploymentStatus::Failed,
                Some("environment draining"),
            )
            .await?;
        receipt::record_terminal(&inner.persistence, &inner.signer, &failed).await?;
    }

    // Another service may still be draining its own deployments here.
    if inner
        .persistence
        .environment_has_active_deployments(environment_id)
        .await?
    {
        Reconciler::requeue_after(inner, key, VERIFY_POLL);
        return Ok(());
    }

    inner
        .orchestrator
        .remove_namespace(&environment.namespace)
        .await
        .map_err(upstream)?;
    inner.persistence.delete_environment(environment_id).await?;
    info!(namespace = %environment.namespace, "environment drained and removed");

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use enclii_common::models::project::EnvironmentName;
    use enclii_common::models::release::BuildTrigger;
    use enclii_common::models::service::{BuildConfig, RuntimeConfig};

    use super::super::Settings;
    use super::*;
    use crate::artifacts::Signer;
    use crate::orchestrator::MemoryOrchestrator;
    use crate::persistence::{EnqueueOutcome, Persistence};
    use crate::reconciler::Reconciler;

    struct World {
        persistence: Persistence,
        orchestrator: Arc<MemoryOrchestrator>,
        reconciler: Reconciler,
        service: Service,
        environment: Environment,
    }

    async fn world(environment_name: EnvironmentName) -> World {
        let persistence = Persistence::new_in_memory().await.unwrap();
        let orchestrator = Arc::new(MemoryOrchestrator::default());
        let signer = Arc::new(Signer::ephemeral());

        let project = persistence
            .create_project(&"acme-shop".parse().unwrap(), "Acme Shop", "tester")
            .await
            .unwrap();
        let environment = persistence
            .create_environment(&project, environment_name, "tester")
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

        let reconciler = Reconciler::new(
            persistence.clone(),
            orchestrator.clone(),
            signer,
            Settings {
                workers: 1,
                resync: std::time::Duration::from_secs(60),
                stabilise: std::time::Duration::ZERO,
            },
        );

        World {
            persistence,
            orchestrator,
            reconciler,
            service,
            environment,
        }
    }

    async fn ready_release(world: &World, git_sha: &str) -> Release {
        let EnqueueOutcome::Queued(job) = world
            .persistence
            .enqueue_build(world.service.id, git_sha, BuildTrigger::Push, None, false, "t")
            .await
            .unwrap()
        else {
            panic!("expected a fresh job");
        };
        let claimed = world.persistence.claim_build(&job).await.unwrap();
        world
            .persistence
            .ready_release(
                claimed.id,
                &format!("registry.local/api:{git_sha}"),
                &format!("sha256:{git_sha}"),
                "sbom:sha256:1",
                "signature:sha256:1",
                "provenance:sha256:1",
                false,
                "dedup",
            )
            .await
            .unwrap()
    }

    async fn start_deployment(world: &World, release: &Release, actor: &str) -> Deployment {
        match world
            .persistence
            .begin_deployment(
                &world.service,
                &world.environment,
                release,
                Strategy::Rolling,
                1,
                DeploymentStatus::Queued,
                None,
                false,
                actor,
            )
            .await
            .unwrap()
        {
            DeployOutcome::Started(deployment) => deployment,
            other => panic!("expected a started deployment, got {other:?}"),
        }
    }

    fn key(world: &World) -> (Uuid, Uuid) {
        (world.service.id, world.environment.id)
    }

    #[tokio::test]
    async fn happy_path_converges_to_running_with_a_receipt() {
        let world = world(EnvironmentName::Staging).await;
        let release = ready_release(&world, "abc1234").await;
        let deployment = start_deployment(&world, &release, "alice@example.com").await;

        // Pass 1: apply mutations, land in verifying.
        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        let mid = world.persistence.get_deployment(deployment.id).await.unwrap();
        assert_eq!(mid.status, DeploymentStatus::Verifying);

        // Pass 2: health gate passes, running.
        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        let done = world.persistence.get_deployment(deployment.id).await.unwrap();
        assert_eq!(done.status, DeploymentStatus::Running);
        assert_eq!(done.health, HealthState::Healthy);
        assert_eq!(done.replicas_ready, 1);

        // Cluster state matches the plan.
        assert!(world.orchestrator.namespace_exists("acme-shop-staging"));
        assert_eq!(
            world.orchestrator.ingress_backend("acme-shop-staging", "api"),
            Some("api".to_string())
        );

        // Exactly one receipt, signed.
        let receipt = world
            .persistence
            .get_receipt(deployment.id)
            .await
            .unwrap()
            .expect("terminal deployment must have a receipt");
        assert_eq!(receipt.git_sha, "abc1234");
        assert_eq!(receipt.deployed_by, "alice@example.com");
        assert!(!receipt.signed_payload.is_empty());
    }

    #[tokio::test]
    async fn repeated_passes_are_stable_once_converged() {
        let world = world(EnvironmentName::Staging).await;
        let release = ready_release(&world, "abc1234").await;
        let deployment = start_deployment(&world, &release, "tester").await;

        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        let converged = world.persistence.get_deployment(deployment.id).await.unwrap();
        assert_eq!(converged.status, DeploymentStatus::Running);
        let version_snapshot = world.orchestrator.workload_names("acme-shop-staging");

        // Further passes find nothing to do.
        for _ in 0..3 {
            world.reconciler.reconcile_once(key(&world)).await.unwrap();
        }
        let after = world.persistence.get_deployment(deployment.id).await.unwrap();
        assert_eq!(after.status, DeploymentStatus::Running);
        assert_eq!(
            world.orchestrator.workload_names("acme-shop-staging"),
            version_snapshot
        );
    }

    #[tokio::test]
    async fn failed_health_in_production_rolls_back_to_previous_release() {
        let world = world(EnvironmentName::Production).await;

        // d1 converges on r1.
        let r1 = ready_release(&world, "aaa1111").await;
        let d1 = start_deployment(&world, &r1, "tester").await;
        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        assert_eq!(
            world.persistence.get_deployment(d1.id).await.unwrap().status,
            DeploymentStatus::Running
        );

        // d2 ships r2 whose replicas never get healthy.
        world.orchestrator.hold_unhealthy("api");
        let r2 = ready_release(&world, "bbb2222").await;
        let d2 = start_deployment(&world, &r2, "tester").await;
        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        world.reconciler.reconcile_once(key(&world)).await.unwrap();

        let failed = world.persistence.get_deployment(d2.id).await.unwrap();
        assert_eq!(failed.status, DeploymentStatus::Failed);
        assert_eq!(failed.health, HealthState::Unhealthy);

        // Auto-rollback created d3 referencing d2 and running r1.
        let d3 = world
            .persistence
            .active_deployment(world.service.id, world.environment.id)
            .await
            .unwrap()
            .expect("auto-rollback deployment");
        assert_eq!(d3.release_id, r1.id);
        assert_eq!(d3.previous_deployment_id, Some(d2.id));

        // The fix lands, d3 converges, and d2 settles as rolled back.
        world.orchestrator.release_unhealthy("api");
        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        world.reconciler.reconcile_once(key(&world)).await.unwrap();

        assert_eq!(
            world.persistence.get_deployment(d3.id).await.unwrap().status,
            DeploymentStatus::Running
        );
        assert_eq!(
            world.persistence.get_deployment(d2.id).await.unwrap().status,
            DeploymentStatus::RolledBack
        );

        // Every terminal deployment got exactly one receipt.
        for id in [d1.id, d2.id, d3.id] {
            assert!(world.persistence.get_receipt(id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn non_production_failures_do_not_roll_back() {
        let world = world(EnvironmentName::Staging).await;

        let r1 = ready_release(&world, "aaa1111").await;
        let d1 = start_deployment(&world, &r1, "tester").await;
        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        assert_eq!(
            world.persistence.get_deployment(d1.id).await.unwrap().status,
            DeploymentStatus::Running
        );

        world.orchestrator.hold_unhealthy("api");
        let r2 = ready_release(&world, "bbb2222").await;
        let d2 = start_deployment(&world, &r2, "tester").await;
        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        world.reconciler.reconcile_once(key(&world)).await.unwrap();

        assert_eq!(
            world.persistence.get_deployment(d2.id).await.unwrap().status,
            DeploymentStatus::Failed
        );
        assert!(world
            .persistence
            .active_deployment(world.service.id, world.environment.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn draining_environment_tears_down_and_deletes_the_row() {
        let world = world(EnvironmentName::Staging).await;
        let release = ready_release(&world, "abc1234").await;
        let deployment = start_deployment(&world, &release, "tester").await;
        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        assert!(world.orchestrator.namespace_exists("acme-shop-staging"));

        world
            .persistence
            .set_environment_draining(world.environment.id, "tester")
            .await
            .unwrap();
        world.reconciler.reconcile_once(key(&world)).await.unwrap();

        assert!(!world.orchestrator.namespace_exists("acme-shop-staging"));
        assert!(world
            .persistence
            .get_environment(world.environment.id)
            .await
            .is_err());

        // History survives the environment.
        let retained = world.persistence.get_deployment(deployment.id).await.unwrap();
        assert_eq!(retained.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn deployment_waiting_on_a_building_release_tracks_it() {
        let world = world(EnvironmentName::Staging).await;

        let EnqueueOutcome::Queued(job) = world
            .persistence
            .enqueue_build(world.service.id, "ccc3333", BuildTrigger::Push, None, false, "t")
            .await
            .unwrap()
        else {
            panic!("expected a fresh job");
        };
        let building = world.persistence.claim_build(&job).await.unwrap();

        let deployment = match world
            .persistence
            .begin_deployment(
                &world.service,
                &world.environment,
                &building,
                Strategy::Rolling,
                1,
                DeploymentStatus::Queued,
                None,
                false,
                "tester",
            )
            .await
            .unwrap()
        {
            DeployOutcome::Started(deployment) => deployment,
            other => panic!("unexpected outcome {other:?}"),
        };

        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        assert_eq!(
            world
                .persistence
                .get_deployment(deployment.id)
                .await
                .unwrap()
                .status,
            DeploymentStatus::BuildingThrough
        );

        world
            .persistence
            .ready_release(
                building.id,
                "registry.local/api:ccc",
                "sha256:ccc",
                "sbom:sha256:1",
                "signature:sha256:1",
                "provenance:sha256:1",
                false,
                "dedup",
            )
            .await
            .unwrap();

        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        world.reconciler.reconcile_once(key(&world)).await.unwrap();
        assert_eq!(
            world
                .persistence
                .get_deployment(deployment.id)
                .await
                .unwrap()
                .status,
            DeploymentStatus::Running
        );
    }
}
