//! End-to-end scenarios driven through the HTTP API against an in-memory
//! store, the stub builder, and the in-memory orchestrator.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::Router;
use hmac::{Hmac, Mac};
use http::{header, Request, StatusCode};
use sha2::Sha256;
use tower::ServiceExt;
use uuid::Uuid;

use enclii_common::claims::{Role, TokenScope};
use enclii_common::models::deployment::DeploymentStatus;
use enclii_common::models::project::{Environment, EnvironmentName, Project};
use enclii_common::models::service::{BuildConfig, RuntimeConfig, Service};

use enclii_server::api::{self, ApiContext};
use enclii_server::artifacts::{ArtifactStore, Signer};
use enclii_server::auth::{hash_token, Authenticator, Key};
use enclii_server::build::backend::StubBackend;
use enclii_server::build::BuildManager;
use enclii_server::intake::AutoDeployer;
use enclii_server::orchestrator::MemoryOrchestrator;
use enclii_server::persistence::{DeploymentFilter, Persistence};
use enclii_server::reconciler::{Reconciler, Settings};

const WEBHOOK_SECRET: &str = "it-is-a-webhook-secret";

struct World {
    router: Router,
    persistence: Persistence,
    orchestrator: Arc<MemoryOrchestrator>,
}

async fn world(stabilise: Duration) -> World {
    let persistence = Persistence::new_in_memory().await.unwrap();
    let orchestrator = Arc::new(MemoryOrchestrator::default());

    let dir = tempfile::tempdir().unwrap();
    let artifacts = Arc::new(ArtifactStore::new(&dir.path().join("artifacts")).unwrap());
    let signer = Arc::new(Signer::from_file_or_generate(&dir.path().join("key.p8")).unwrap());
    std::mem::forget(dir);

    let build_manager = BuildManager::new(
        persistence.clone(),
        artifacts,
        signer.clone(),
        Arc::new(StubBackend::default()),
        2,
    );

    let reconciler = Reconciler::new(
        persistence.clone(),
        orchestrator.clone(),
        signer,
        Settings {
            workers: 2,
            resync: Duration::from_millis(200),
            stabilise,
        },
    );
    reconciler.spawn();

    AutoDeployer::new(persistence.clone()).spawn();

    let authenticator = Arc::new(Authenticator::new(
        persistence.clone(),
        "https://issuer.invalid".to_string(),
        "enclii".to_string(),
    ));

    let router = api::router(ApiContext {
        persistence: persistence.clone(),
        authenticator,
        build_manager,
        orchestrator: orchestrator.clone(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        oidc_issuer: "https://issuer.invalid".to_string(),
        oidc_client_id: "enclii".to_string(),
    });

    World {
        router,
        persistence,
        orchestrator,
    }
}

impl World {
    async fn token(&self, name: &str, role: Role, projects: &[Uuid]) -> String {
        let (token, hash) = Key::generate();
        assert_eq!(hash, hash_token(&token));
        self.persistence
            .create_api_token(name, &hash, role, &[TokenScope::Admin], projects, "tests")
            .await
            .unwrap();
        token
    }

    async fn fixture_project(&self) -> (Project, Environment, Service) {
        let project = self
            .persistence
            .create_project(&"acme-shop".parse().unwrap(), "Acme Shop", "tests")
            .await
            .unwrap();
        let production = self
            .persistence
            .create_environment(&project, EnvironmentName::Production, "tests")
            .await
            .unwrap();
        let service = self
            .persistence
            .create_service(
                project.id,
                &"api".parse().unwrap(),
                "github.com/acme/shop",
                "main",
                ".",
                BuildConfig::Auto,
                RuntimeConfig::default(),
                true,
                "tests",
            )
            .await
            .unwrap();
        (project, production, service)
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }
}

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn webhook(event: &str, body: &serde_json::Value) -> Request<Body> {
    let bytes = serde_json::to_vec(body).unwrap();
    Request::builder()
        .method("POST")
        .uri("/v1/webhooks/github")
        .header("X-GitHub-Event", event)
        .header("X-Hub-Signature-256", sign(&bytes))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .unwrap()
}

fn push_event(sha: &str) -> serde_json::Value {
    serde_json::json!({
        "ref": "refs/heads/main",
        "after": sha,
        "repository": { "full_name": "acme/shop" },
    })
}

fn authed(method: &str, uri: &str, token: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(body) => builder
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn wait_until<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_push_builds_and_deploys_to_production() {
    let world = world(Duration::from_secs(120)).await;
    let (project, _production, service) = world.fixture_project().await;

    let (status, summary) = world
        .send(webhook("push", &push_event("abc1234def5678")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["builds_enqueued"], 1);

    // Release r1 reaches ready.
    wait_until("release ready", || async {
        world
            .persistence
            .find_ready_release(service.id, "abc1234def5678")
            .await
            .unwrap()
            .is_some()
    })
    .await;

    // Deployment d1 reaches running.
    wait_until("deployment running", || async {
        matches!(
            world
                .persistence
                .latest_deployment(service.id, None)
                .await
                .unwrap(),
            Some(d) if d.status == DeploymentStatus::Running
        )
    })
    .await;

    // Observable through the API.
    let viewer = world.token("viewer", Role::Viewer, &[project.id]).await;
    let (status, deployment) = world
        .send(authed(
            "GET",
            &format!("/v1/services/{}/deployments/latest", service.id),
            &viewer,
            None,
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deployment["status"], "running");
    assert_eq!(deployment["health"], "healthy");

    // The cluster converged and the receipt landed.
    assert!(world.orchestrator.namespace_exists("acme-shop-production"));
    let deployment_id: Uuid = deployment["id"].as_str().unwrap().parse().unwrap();
    let receipt = world
        .persistence
        .get_receipt(deployment_id)
        .await
        .unwrap()
        .expect("terminal deployment must have a receipt");
    assert_eq!(receipt.git_sha, "abc1234def5678");
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_webhook_is_deduplicated() {
    let world = world(Duration::from_secs(120)).await;
    let (_, _, service) = world.fixture_project().await;

    let body = push_event("abc1234def5678");
    let (first, _) = world.send(webhook("push", &body)).await;
    assert_eq!(first, StatusCode::OK);

    // Replay within the build window: 200, but nothing new enqueued.
    let (second, summary) = world.send(webhook("push", &body)).await;
    assert_eq!(second, StatusCode::OK);
    assert_eq!(summary["builds_enqueued"], 0);
    assert_eq!(summary["deduplicated"], 1);

    wait_until("release ready", || async {
        world
            .persistence
            .find_ready_release(service.id, "abc1234def5678")
            .await
            .unwrap()
            .is_some()
    })
    .await;

    // Exactly one release for the pair.
    let releases = world
        .persistence
        .list_releases(service.id, 10, None)
        .await
        .unwrap();
    assert_eq!(releases.len(), 1);

    // The audit trail shows the dedup.
    let events = world
        .persistence
        .list_audit_events(Some("webhook"), 10)
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|event| event.action == "webhook.received" && event.outcome == "dedup"));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_health_rolls_back_to_the_previous_release() {
    let world = world(Duration::from_secs(3)).await;
    let (_, production, service) = world.fixture_project().await;

    // d1 converges on r1.
    world.send(webhook("push", &push_event("aaa1111aaa1111"))).await;
    wait_until("first deployment running", || async {
        matches!(
            world
                .persistence
                .latest_deployment(service.id, Some(production.id))
                .await
                .unwrap(),
            Some(d) if d.status == DeploymentStatus::Running
        )
    })
    .await;
    let d1 = world
        .persistence
        .latest_deployment(service.id, Some(production.id))
        .await
        .unwrap()
        .unwrap();

    // r2's pods never get healthy.
    world.orchestrator.hold_unhealthy("api");
    world.send(webhook("push", &push_event("bbb2222bbb2222"))).await;

    let d2 = {
        wait_until("second deployment failed", || async {
            world
                .persistence
                .list_deployments(DeploymentFilter::Environment(production.id))
                .await
                .unwrap()
                .iter()
                .any(|d| d.id != d1.id && d.status == DeploymentStatus::Failed
                    || d.id != d1.id && d.status == DeploymentStatus::RolledBack)
        })
        .await;
        world
            .persistence
            .list_deployments(DeploymentFilter::Environment(production.id))
            .await
            .unwrap()
            .into_iter()
            .find(|d| d.id != d1.id && d.previous_deployment_id.is_none())
            .unwrap()
    };

    // The fix: replicas become healthy again, the rollback converges.
    world.orchestrator.release_unhealthy("api");

    wait_until("rollback running and d2 rolled back", || async {
        let deployments = world
            .persistence
            .list_deployments(DeploymentFilter::Environment(production.id))
            .await
            .unwrap();
        let d3_running = deployments.iter().any(|d| {
            d.previous_deployment_id == Some(d2.id) && d.status == DeploymentStatus::Running
        });
        let d2_rolled_back = deployments
            .iter()
            .any(|d| d.id == d2.id && d.status == DeploymentStatus::RolledBack);
        d3_running && d2_rolled_back
    })
    .await;

    // The rollback runs d1's release.
    let deployments = world
        .persistence
        .list_deployments(DeploymentFilter::Environment(production.id))
        .await
        .unwrap();
    let d3 = deployments
        .iter()
        .find(|d| d.previous_deployment_id == Some(d2.id))
        .unwrap();
    assert_eq!(d3.release_id, d1.release_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn authorization_matrix_gates_production_deploys() {
    let world = world(Duration::from_secs(120)).await;
    let (project, _production, service) = world.fixture_project().await;
    let staging = world
        .persistence
        .create_environment(
            &world.persistence.get_project(project.id).await.unwrap(),
            EnvironmentName::Staging,
            "tests",
        )
        .await
        .unwrap();
    assert!(!staging.is_production);

    let developer = world.token("dev", Role::Developer, &[project.id]).await;
    let admin = world.token("ops", Role::Admin, &[project.id]).await;

    // A manual build gives us a ready release without touching auto-deploy.
    let (status, _) = world
        .send(authed(
            "POST",
            &format!("/v1/services/{}/build", service.id),
            &developer,
            Some(serde_json::json!({ "git_sha": "abc1234def" })),
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_until("manual release ready", || async {
        world
            .persistence
            .find_ready_release(service.id, "abc1234def")
            .await
            .unwrap()
            .is_some()
    })
    .await;

    // Developer to staging: accepted.
    let (status, _) = world
        .send(authed(
            "POST",
            &format!("/v1/services/{}/deploy", service.id),
            &developer,
            Some(serde_json::json!({ "environment": "staging" })),
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // Developer to production: forbidden.
    let (status, body) = world
        .send(authed(
            "POST",
            &format!("/v1/services/{}/deploy", service.id),
            &developer,
            Some(serde_json::json!({ "environment": "production" })),
        ))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");

    // Admin to production: accepted.
    let (status, _) = world
        .send(authed(
            "POST",
            &format!("/v1/services/{}/deploy", service.id),
            &admin,
            Some(serde_json::json!({ "environment": "production" })),
        ))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test(flavor = "multi_thread")]
async fn preview_environments_live_and_die_with_the_pull_request() {
    let world = world(Duration::from_secs(120)).await;
    let (project, _, service) = world.fixture_project().await;

    let pr_opened = serde_json::json!({
        "action": "opened",
        "number": 42,
        "pull_request": {
            "head": { "sha": "fff0000fff0000", "ref": "feature/snazzy" },
            "html_url": "https://github.com/acme/shop/pull/42",
        },
        "repository": { "full_name": "acme/shop" },
    });
    let (status, summary) = world.send(webhook("pull_request", &pr_opened)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["previews_touched"], 1);

    // The preview environment exists and receives the deployment.
    let preview = world
        .persistence
        .find_environment(project.id, &EnvironmentName::Preview(42))
        .await
        .unwrap()
        .expect("preview environment");
    assert_eq!(preview.namespace, "acme-shop-preview-42");

    wait_until("preview deployment running", || async {
        matches!(
            world
                .persistence
                .latest_deployment(service.id, Some(preview.id))
                .await
                .unwrap(),
            Some(d) if d.status == DeploymentStatus::Running
        )
    })
    .await;

    // Closing the PR drains and deletes the environment.
    let pr_closed = serde_json::json!({
        "action": "closed",
        "number": 42,
        "pull_request": {
            "head": { "sha": "fff0000fff0000", "ref": "feature/snazzy" },
            "html_url": "https://github.com/acme/shop/pull/42",
        },
        "repository": { "full_name": "acme/shop" },
    });
    let (status, _) = world.send(webhook("pull_request", &pr_closed)).await;
    assert_eq!(status, StatusCode::OK);

    wait_until("preview environment deleted", || async {
        world
            .persistence
            .find_environment(project.id, &EnvironmentName::Preview(42))
            .await
            .unwrap()
            .is_none()
    })
    .await;
    assert!(!world.orchestrator.namespace_exists("acme-shop-preview-42"));

    // Its deployments remain queryable for audit.
    let retained = world
        .persistence
        .list_deployments(DeploymentFilter::Environment(preview.id))
        .await
        .unwrap();
    assert!(!retained.is_empty());
    assert!(retained.iter().all(|d| d.status.is_terminal()));
}

#[tokio::test(flavor = "multi_thread")]
async fn tampered_webhook_is_rejected_without_side_effects() {
    let world = world(Duration::from_secs(120)).await;
    let (_, _, service) = world.fixture_project().await;

    // Sign one body, send another.
    let signed_for = serde_json::to_vec(&push_event("abc1234def5678")).unwrap();
    let tampered = serde_json::to_vec(&push_event("eee9999eee9999")).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/v1/webhooks/github")
        .header("X-GitHub-Event", "push")
        .header("X-Hub-Signature-256", sign(&signed_for))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(tampered))
        .unwrap();

    let (status, body) = world.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "invalid_signature");

    // No release was created.
    let releases = world
        .persistence
        .list_releases(service.id, 10, None)
        .await
        .unwrap();
    assert!(releases.is_empty());

    // The rejection is audited.
    let events = world
        .persistence
        .list_audit_events(Some("webhook"), 10)
        .await
        .unwrap();
    assert!(events.iter().any(|event| event.action == "webhook.rejected"));
}

#[tokio::test(flavor = "multi_thread")]
async fn project_slug_boundaries_are_enforced() {
    let world = world(Duration::from_secs(120)).await;
    let owner = world.token("root", Role::Owner, &[]).await;

    let (status, body) = world
        .send(authed(
            "POST",
            "/v1/projects",
            &owner,
            Some(serde_json::json!({ "slug": "ab", "name": "Too Short" })),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation");

    let (status, project) = world
        .send(authed(
            "POST",
            "/v1/projects",
            &owner,
            Some(serde_json::json!({ "slug": "abc", "name": "Just Right" })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(project["slug"], "abc");
}

#[tokio::test(flavor = "multi_thread")]
async fn builds_without_auto_deploy_produce_no_deployments() {
    let world = world(Duration::from_secs(120)).await;
    let project = world
        .persistence
        .create_project(&"acme-shop".parse().unwrap(), "Acme Shop", "tests")
        .await
        .unwrap();
    world
        .persistence
        .create_environment(&project, EnvironmentName::Production, "tests")
        .await
        .unwrap();
    let service = world
        .persistence
        .create_service(
            project.id,
            &"api".parse().unwrap(),
            "github.com/acme/shop",
            "main",
            ".",
            BuildConfig::Auto,
            RuntimeConfig::default(),
            false,
            "tests",
        )
        .await
        .unwrap();

    world.send(webhook("push", &push_event("abc1234def5678"))).await;

    wait_until("release ready", || async {
        world
            .persistence
            .find_ready_release(service.id, "abc1234def5678")
            .await
            .unwrap()
            .is_some()
    })
    .await;

    // Give the auto-deployer a moment to (not) act.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(world
        .persistence
        .latest_deployment(service.id, None)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn unauthenticated_and_unknown_tokens_are_rejected() {
    let world = world(Duration::from_secs(120)).await;
    world.fixture_project().await;

    let request = Request::builder()
        .method("GET")
        .uri("/v1/projects")
        .body(Body::empty())
        .unwrap();
    let (status, body) = world.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthenticated");

    let (status, _) = world
        .send(authed("GET", "/v1/projects", "enclii_notreal", None))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread")]
async fn health_endpoints_answer() {
    let world = world(Duration::from_secs(120)).await;

    let request = Request::builder()
        .method("GET")
        .uri("/health/live")
        .body(Body::empty())
        .unwrap();
    let response = world.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .method("GET")
        .uri("/health/ready")
        .body(Body::empty())
        .unwrap();
    let response = world.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
