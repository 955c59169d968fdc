//! The HTTP façade: translates external JSON calls into component verbs,
//! applies validation and the authorization matrix, and returns the
//! uniform error envelope. Long-running verbs answer immediately with a
//! resource id; progress streams over the log endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Path, Query};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use enclii_common::claims::{Role, TokenScope};
use enclii_common::log::LogItem;
use enclii_common::models::deployment::{Deployment, DeploymentStatus, Strategy};
use enclii_common::models::error::ErrorKind;
use enclii_common::models::project::{Environment, EnvironmentName, Project, ProjectSlug};
use enclii_common::models::release::{BuildTrigger, Release};
use enclii_common::models::service::{BuildConfig, EnvVar, EnvVarKey, RuntimeConfig, Service, ServiceName};

use crate::auth::{Authenticator, Key, User};
use crate::build::{BuildManager, BuildOutcome};
use crate::intake::{self, Intake};
use crate::orchestrator::{labels, Orchestrator, PodInfo};
use crate::persistence::{DeployOutcome, DeploymentFilter, Persistence, ServiceUpdate};
use crate::{Error, Result};

const LOG_BACKLOG_LIMIT: usize = 1000;
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ApiContext {
    pub persistence: Persistence,
    pub authenticator: Arc<Authenticator>,
    pub build_manager: BuildManager,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub webhook_secret: String,
    pub oidc_issuer: String,
    pub oidc_client_id: String,
}

pub fn router(context: ApiContext) -> Router {
    let intake = Arc::new(Intake::new(
        context.persistence.clone(),
        context.build_manager.clone(),
    ));

    Router::new()
        .route("/v1/auth/login", post(auth_login))
        .route("/v1/auth/refresh", post(auth_refresh))
        .route("/v1/auth/tokens", post(create_token))
        .route("/v1/projects", get(list_projects).post(create_project))
        .route("/v1/projects/:slug", get(get_project))
        .route(
            "/v1/projects/:slug/environments",
            get(list_environments).post(create_environment),
        )
        .route("/v1/projects/:slug/services", post(create_service))
        .route("/v1/services/:id", get(get_service).patch(update_service))
        .route("/v1/services/:id/build", post(trigger_build))
        .route("/v1/services/:id/deploy", post(trigger_deploy))
        .route("/v1/services/:id/releases", get(list_releases))
        .route("/v1/services/:id/deployments/latest", get(latest_deployment))
        .route(
            "/v1/services/:id/env-vars",
            get(list_env_vars).post(set_env_var),
        )
        .route(
            "/v1/services/:id/env-vars/:key",
            axum::routing::put(put_env_var).delete(delete_env_var),
        )
        .route("/v1/releases/:id", get(get_release))
        .route("/v1/releases/:id/logs", get(get_build_logs))
        .route("/v1/deployments/:id", get(get_deployment))
        .route("/v1/deployments/:id/rollback", post(rollback_deployment))
        .route("/v1/deployments/:id/logs", get(deployment_logs))
        .route(
            "/v1/environments/:id",
            axum::routing::delete(delete_environment),
        )
        .route(
            "/v1/environments/:id/deployments",
            get(list_environment_deployments),
        )
        .route("/v1/webhooks/github", post(github_webhook))
        .route("/health/live", get(|| async { "ok" }))
        .route("/health/ready", get(health_ready))
        .layer(Extension(context.persistence))
        .layer(Extension(context.authenticator))
        .layer(Extension(context.build_manager))
        .layer(Extension(context.orchestrator))
        .layer(Extension(intake))
        .layer(Extension(WebhookSecret(context.webhook_secret)))
        .layer(tower_http::timeout::TimeoutLayer::new(REQUEST_DEADLINE))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[derive(Clone)]
struct WebhookSecret(String);

fn forbid_unless(allowed: bool) -> Result<()> {
    if allowed {
        Ok(())
    } else {
        Err(Error::from_kind(ErrorKind::Forbidden))
    }
}

// ==== auth ====

#[derive(Deserialize)]
struct LoginRequest {
    redirect_uri: String,
}

#[derive(Serialize)]
struct LoginResponse {
    authorize_url: String,
}

async fn auth_login(
    Extension(authenticator): Extension<Arc<Authenticator>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let authorize_url = format!(
        "{}/authorize?response_type=code&client_id={}&scope=openid%20email&redirect_uri={}",
        authenticator.issuer().trim_end_matches('/'),
        authenticator.client_id(),
        request.redirect_uri,
    );
    Ok(Json(LoginResponse { authorize_url }))
}

#[derive(Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

async fn auth_refresh(
    Extension(authenticator): Extension<Arc<Authenticator>>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<serde_json::Value>> {
    authenticator
        .refresh_token(&request.refresh_token)
        .await
        .map(Json)
}

#[derive(Deserialize)]
struct CreateTokenRequest {
    name: String,
    role: Role,
    #[serde(default)]
    scopes: Vec<TokenScope>,
    #[serde(default)]
    project_ids: Vec<Uuid>,
}

#[derive(Serialize)]
struct CreateTokenResponse {
    id: Uuid,
    /// Shown exactly once; only the hash is stored.
    token: String,
}

async fn create_token(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Json(request): Json<CreateTokenRequest>,
) -> Result<Json<CreateTokenResponse>> {
    forbid_unless(claim.may_manage_platform())?;

    let (token, hash) = Key::generate();
    let id = persistence
        .create_api_token(
            &request.name,
            &hash,
            request.role,
            &request.scopes,
            &request.project_ids,
            claim.actor(),
        )
        .await?;

    Ok(Json(CreateTokenResponse { id, token }))
}

// ==== projects and environments ====

#[derive(Deserialize)]
struct CreateProjectRequest {
    slug: String,
    name: String,
}

async fn create_project(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Json(request): Json<CreateProjectRequest>,
) -> Result<Json<Project>> {
    forbid_unless(claim.may_manage_platform())?;

    let slug: ProjectSlug = request.slug.parse()?;
    persistence
        .create_project(&slug, &request.name, claim.actor())
        .await
        .map(Json)
}

async fn list_projects(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
) -> Result<Json<Vec<Project>>> {
    let projects = persistence
        .list_projects()
        .await?
        .into_iter()
        .filter(|project| claim.may_read(project.id))
        .collect();
    Ok(Json(projects))
}

async fn get_project(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(slug): Path<String>,
) -> Result<Json<Project>> {
    let slug: ProjectSlug = slug.parse()?;
    let project = persistence.get_project_by_slug(&slug).await?;
    forbid_unless(claim.may_read(project.id))?;
    Ok(Json(project))
}

#[derive(Deserialize)]
struct CreateEnvironmentRequest {
    name: EnvironmentName,
}

async fn create_environment(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(slug): Path<String>,
    Json(request): Json<CreateEnvironmentRequest>,
) -> Result<Json<Environment>> {
    let slug: ProjectSlug = slug.parse()?;
    let project = persistence.get_project_by_slug(&slug).await?;
    forbid_unless(claim.may_administer(project.id))?;

    persistence
        .create_environment(&project, request.name, claim.actor())
        .await
        .map(Json)
}

async fn list_environments(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(slug): Path<String>,
) -> Result<Json<Vec<Environment>>> {
    let slug: ProjectSlug = slug.parse()?;
    let project = persistence.get_project_by_slug(&slug).await?;
    forbid_unless(claim.may_read(project.id))?;

    persistence.list_environments(project.id).await.map(Json)
}

/// Begin draining; the reconciler finishes the teardown.
async fn delete_environment(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    let environment = persistence.get_environment(id).await?;
    forbid_unless(claim.may_administer(environment.project_id))?;

    if !environment.draining {
        persistence.set_environment_draining(id, claim.actor()).await?;
    }
    Ok(StatusCode::ACCEPTED)
}

// ==== services ====

#[derive(Deserialize)]
struct CreateServiceRequest {
    name: ServiceName,
    git_repo: String,
    git_branch: String,
    #[serde(default = "default_app_path")]
    app_path: String,
    #[serde(default)]
    build_config: BuildConfig,
    #[serde(default)]
    runtime_config: RuntimeConfig,
    #[serde(default)]
    auto_deploy: bool,
}

fn default_app_path() -> String {
    ".".to_string()
}

async fn create_service(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(slug): Path<String>,
    Json(request): Json<CreateServiceRequest>,
) -> Result<Json<Service>> {
    let slug: ProjectSlug = slug.parse()?;
    let project = persistence.get_project_by_slug(&slug).await?;
    forbid_unless(claim.may_write_services(project.id))?;

    persistence
        .create_service(
            project.id,
            &request.name,
            &request.git_repo,
            &request.git_branch,
            &request.app_path,
            request.build_config,
            request.runtime_config,
            request.auto_deploy,
            claim.actor(),
        )
        .await
        .map(Json)
}

async fn get_service(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(id): Path<Uuid>,
) -> Result<Json<Service>> {
    let service = persistence.get_service(id).await?;
    forbid_unless(claim.may_read(service.project_id))?;
    Ok(Json(service))
}

async fn update_service(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(id): Path<Uuid>,
    Json(update): Json<ServiceUpdate>,
) -> Result<Json<Service>> {
    let service = persistence.get_service(id).await?;
    forbid_unless(claim.may_write_services(service.project_id))?;

    persistence
        .update_service(id, update, claim.actor())
        .await
        .map(Json)
}

// ==== builds and releases ====

#[derive(Deserialize)]
struct BuildRequestBody {
    git_sha: String,
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
struct BuildResponse {
    status: &'static str,
    release: Option<Release>,
    job_id: Option<Uuid>,
}

#[instrument(skip_all, fields(service_id = %id))]
async fn trigger_build(
    Extension(persistence): Extension<Persistence>,
    Extension(builds): Extension<BuildManager>,
    User { claim }: User,
    Path(id): Path<Uuid>,
    Json(request): Json<BuildRequestBody>,
) -> Result<(StatusCode, Json<BuildResponse>)> {
    let service = persistence.get_service(id).await?;
    forbid_unless(claim.may_write_services(service.project_id))?;

    if request.git_sha.len() < 7 || !request.git_sha.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::custom(
            ErrorKind::Validation,
            "git_sha must be at least 7 hex characters",
        ));
    }

    let response = match builds
        .request_build(
            service.id,
            &request.git_sha,
            BuildTrigger::Manual,
            None,
            request.force,
            claim.actor(),
        )
        .await?
    {
        BuildOutcome::Started(job) => BuildResponse {
            status: "queued",
            release: None,
            job_id: Some(job.id),
        },
        BuildOutcome::Deduped(job) => BuildResponse {
            status: "in_flight",
            release: None,
            job_id: Some(job.id),
        },
        BuildOutcome::Existing(release) => BuildResponse {
            status: "exists",
            release: Some(release),
            job_id: None,
        },
    };

    Ok((StatusCode::ACCEPTED, Json(response)))
}

async fn list_releases(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(id): Path<Uuid>,
    Query(page): Query<ReleasePage>,
) -> Result<Json<Vec<Release>>> {
    let service = persistence.get_service(id).await?;
    forbid_unless(claim.may_read(service.project_id))?;

    persistence
        .list_releases(id, page.limit.unwrap_or(50), page.cursor)
        .await
        .map(Json)
}

#[derive(Deserialize)]
struct ReleasePage {
    limit: Option<u32>,
    cursor: Option<i64>,
}

async fn get_release(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(id): Path<Uuid>,
) -> Result<Json<Release>> {
    let release = persistence.get_release(id).await?;
    let service = persistence.get_service(release.service_id).await?;
    forbid_unless(claim.may_read(service.project_id))?;
    Ok(Json(release))
}

#[derive(Deserialize)]
struct BuildLogsQuery {
    #[serde(default)]
    since: i64,
}

#[derive(Serialize)]
struct BuildLogLine {
    cursor: i64,
    stage: String,
    line: String,
}

async fn get_build_logs(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(id): Path<Uuid>,
    Query(query): Query<BuildLogsQuery>,
) -> Result<Json<Vec<BuildLogLine>>> {
    let release = persistence.get_release(id).await?;
    let service = persistence.get_service(release.service_id).await?;
    forbid_unless(claim.may_stream_logs(service.project_id))?;

    let lines = persistence
        .build_logs_since(id, query.since)
        .await?
        .into_iter()
        .map(|(cursor, stage, line)| BuildLogLine { cursor, stage, line })
        .collect();
    Ok(Json(lines))
}

// ==== deployments ====

#[derive(Deserialize)]
struct DeployRequest {
    environment: EnvironmentName,
    release_id: Option<Uuid>,
    #[serde(default)]
    strategy: Strategy,
    replicas: Option<u32>,
    #[serde(default)]
    preempt: bool,
}

#[instrument(skip_all, fields(service_id = %id))]
async fn trigger_deploy(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(id): Path<Uuid>,
    Json(request): Json<DeployRequest>,
) -> Result<(StatusCode, Json<Deployment>)> {
    let service = persistence.get_service(id).await?;
    let environment = persistence
        .find_environment(service.project_id, &request.environment)
        .await?
        .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;

    forbid_unless(claim.may_deploy(service.project_id, environment.is_production))?;

    let release = match request.release_id {
        Some(release_id) => {
            let release = persistence.get_release(release_id).await?;
            if release.service_id != service.id {
                return Err(Error::custom(
                    ErrorKind::Validation,
                    "release belongs to a different service",
                ));
            }
            release
        }
        None => persistence
            .latest_ready_release(service.id)
            .await?
            .ok_or_else(|| {
                Error::custom(ErrorKind::NotFound, "service has no ready release")
            })?,
    };

    let replicas = request
        .replicas
        .unwrap_or(service.runtime_config.replicas)
        .max(1);

    match persistence
        .begin_deployment(
            &service,
            &environment,
            &release,
            request.strategy,
            replicas,
            DeploymentStatus::Queued,
            None,
            request.preempt,
            claim.actor(),
        )
        .await?
    {
        DeployOutcome::Started(deployment) => Ok((StatusCode::ACCEPTED, Json(deployment))),
        DeployOutcome::AlreadyRunning(deployment) => Ok((StatusCode::OK, Json(deployment))),
    }
}

async fn get_deployment(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(id): Path<Uuid>,
) -> Result<Json<Deployment>> {
    let deployment = persistence.get_deployment(id).await?;
    let service_id = persistence.deployment_service_id(id).await?;
    let service = persistence.get_service(service_id).await?;
    forbid_unless(claim.may_read(service.project_id))?;
    Ok(Json(deployment))
}

async fn latest_deployment(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(id): Path<Uuid>,
) -> Result<Json<Deployment>> {
    let service = persistence.get_service(id).await?;
    forbid_unless(claim.may_read(service.project_id))?;

    persistence
        .latest_deployment(id, None)
        .await?
        .map(Json)
        .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
}

#[derive(Deserialize, Default)]
struct RollbackRequest {
    to_deployment_id: Option<Uuid>,
}

#[instrument(skip_all, fields(deployment_id = %id))]
async fn rollback_deployment(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(id): Path<Uuid>,
    body: Option<Json<RollbackRequest>>,
) -> Result<(StatusCode, Json<Deployment>)> {
    let current = persistence.get_deployment(id).await?;
    let service_id = persistence.deployment_service_id(id).await?;
    let service = persistence.get_service(service_id).await?;
    let environment = persistence.get_environment(current.environment_id).await?;

    forbid_unless(claim.may_deploy(service.project_id, environment.is_production))?;

    if !matches!(
        current.status,
        DeploymentStatus::Failed | DeploymentStatus::Running
    ) {
        return Err(Error::custom(
            ErrorKind::Conflict,
            "rollback is valid from failed or running deployments only",
        ));
    }

    let target = match body.and_then(|Json(body)| body.to_deployment_id) {
        Some(target_id) => {
            let target = persistence.get_deployment(target_id).await?;
            if target.environment_id != current.environment_id {
                return Err(Error::custom(
                    ErrorKind::Validation,
                    "rollback target is in a different environment",
                ));
            }
            target
        }
        None => persistence
            .previous_running_deployment(&current)
            .await?
            .ok_or_else(|| {
                Error::custom(ErrorKind::NotFound, "no prior running deployment to roll back to")
            })?,
    };

    let release = persistence.get_release(target.release_id).await?;
    match persistence
        .begin_deployment(
            &service,
            &environment,
            &release,
            Strategy::Rolling,
            target.replicas_desired.max(1),
            DeploymentStatus::Queued,
            Some(current.id),
            false,
            claim.actor(),
        )
        .await?
    {
        DeployOutcome::Started(deployment) => Ok((StatusCode::ACCEPTED, Json(deployment))),
        DeployOutcome::AlreadyRunning(deployment) => Ok((StatusCode::OK, Json(deployment))),
    }
}

// ==== env vars ====

#[derive(Deserialize)]
struct EnvVarRequest {
    key: EnvVarKey,
    value: String,
    #[serde(default)]
    secret: bool,
    environment_id: Option<Uuid>,
}

async fn list_env_vars(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<EnvVar>>> {
    let service = persistence.get_service(id).await?;
    forbid_unless(claim.may_read(service.project_id))?;

    persistence.list_env_vars(id).await.map(Json)
}

async fn set_env_var(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(id): Path<Uuid>,
    Json(request): Json<EnvVarRequest>,
) -> Result<Json<EnvVar>> {
    let service = persistence.get_service(id).await?;
    let allowed = if request.secret {
        claim.may_manage_secrets(service.project_id)
    } else {
        claim.may_write_services(service.project_id)
    };
    forbid_unless(allowed)?;

    persistence
        .upsert_env_var(
            id,
            request.environment_id,
            &request.key,
            &request.value,
            request.secret,
            claim.actor(),
        )
        .await
        .map(Json)
}

#[derive(Deserialize)]
struct EnvVarUpdateBody {
    value: String,
    #[serde(default)]
    secret: bool,
    environment_id: Option<Uuid>,
}

async fn put_env_var(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path((id, key)): Path<(Uuid, String)>,
    Json(request): Json<EnvVarUpdateBody>,
) -> Result<Json<EnvVar>> {
    let key: EnvVarKey = key.parse()?;
    let service = persistence.get_service(id).await?;
    let allowed = if request.secret {
        claim.may_manage_secrets(service.project_id)
    } else {
        claim.may_write_services(service.project_id)
    };
    forbid_unless(allowed)?;

    persistence
        .upsert_env_var(
            id,
            request.environment_id,
            &key,
            &request.value,
            request.secret,
            claim.actor(),
        )
        .await
        .map(Json)
}

#[derive(Deserialize, Default)]
struct EnvVarScope {
    environment_id: Option<Uuid>,
}

async fn delete_env_var(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path((id, key)): Path<(Uuid, String)>,
    Query(scope): Query<EnvVarScope>,
) -> Result<StatusCode> {
    let key: EnvVarKey = key.parse()?;
    let service = persistence.get_service(id).await?;
    forbid_unless(claim.may_manage_secrets(service.project_id))?;

    persistence
        .delete_env_var(id, scope.environment_id, &key, claim.actor())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ==== webhook intake ====

#[instrument(skip_all)]
async fn github_webhook(
    Extension(persistence): Extension<Persistence>,
    Extension(intake): Extension<Arc<Intake>>,
    Extension(WebhookSecret(secret)): Extension<WebhookSecret>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<intake::IntakeSummary>> {
    let signature = headers
        .get(intake::SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    if let Err(err) = intake::verify_signature(&secret, &body, signature) {
        warn!("webhook signature rejected");
        persistence
            .record_audit_event(
                "github",
                "webhook.rejected",
                "webhook",
                "github",
                "invalid_signature",
                serde_json::Value::Null,
            )
            .await?;
        return Err(err);
    }

    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("push");

    let summary = intake.handle(event_type, &body).await?;

    persistence
        .record_audit_event(
            "github",
            "webhook.received",
            "webhook",
            event_type,
            summary.audit_outcome(),
            serde_json::to_value(&summary).unwrap_or(serde_json::Value::Null),
        )
        .await?;

    Ok(Json(summary))
}

// ==== logs ====

#[derive(Deserialize, Default)]
struct DeploymentLogsQuery {
    #[serde(default)]
    follow: bool,
    since: Option<chrono::DateTime<chrono::Utc>>,
}

/// Current logs across the deployment's pods; with `follow=true` and a
/// WebSocket upgrade, a live multiplexed stream. Closing the socket tears
/// the pod watches down promptly.
async fn deployment_logs(
    Extension(persistence): Extension<Persistence>,
    Extension(orchestrator): Extension<Arc<dyn Orchestrator>>,
    User { claim }: User,
    Path(id): Path<Uuid>,
    Query(query): Query<DeploymentLogsQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response> {
    let deployment = persistence.get_deployment(id).await?;
    let service_id = persistence.deployment_service_id(id).await?;
    let service = persistence.get_service(service_id).await?;
    forbid_unless(claim.may_stream_logs(service.project_id))?;

    let environment = match persistence.get_environment(deployment.environment_id).await {
        Ok(environment) => environment,
        // Drained environment: only history remains, no pods to stream.
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(Json(Vec::<LogItem>::new()).into_response());
        }
        Err(err) => return Err(err),
    };

    let selector = BTreeMap::from([(labels::DEPLOYMENT.to_string(), id.to_string())]);
    let pods = orchestrator
        .list_pods(&environment.namespace, &selector)
        .await
        .map_err(|e| Error::source(ErrorKind::UpstreamUnavailable, e))?;

    if let (true, Some(upgrade)) = (query.follow, ws) {
        let namespace = environment.namespace.clone();
        let orchestrator = orchestrator.clone();
        return Ok(upgrade.on_upgrade(move |socket| {
            stream_logs(socket, orchestrator, namespace, id, pods, query.since)
        }));
    }

    let mut backlog = Vec::new();
    for pod in &pods {
        let mut stream = orchestrator
            .pod_logs(&environment.namespace, &pod.name, query.since, false)
            .await
            .map_err(|e| Error::source(ErrorKind::UpstreamUnavailable, e))?;
        while let Some(line) = futures::StreamExt::next(&mut stream).await {
            backlog.push(LogItem::runtime(id, pod.name.clone(), line));
            if backlog.len() >= LOG_BACKLOG_LIMIT {
                break;
            }
        }
    }
    backlog.sort_by_key(|item| item.timestamp);

    Ok(Json(backlog).into_response())
}

async fn stream_logs(
    mut socket: WebSocket,
    orchestrator: Arc<dyn Orchestrator>,
    namespace: String,
    deployment_id: Uuid,
    pods: Vec<PodInfo>,
    since: Option<chrono::DateTime<chrono::Utc>>,
) {
    let (tx, mut rx) = mpsc::channel::<LogItem>(64);

    let mut watches = Vec::new();
    for pod in pods {
        let orchestrator = orchestrator.clone();
        let namespace = namespace.clone();
        let tx = tx.clone();
        watches.push(tokio::spawn(async move {
            match orchestrator
                .pod_logs(&namespace, &pod.name, since, true)
                .await
            {
                Ok(mut stream) => {
                    while let Some(line) = futures::StreamExt::next(&mut stream).await {
                        let item = LogItem::runtime(deployment_id, pod.name.clone(), line);
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, pod = %pod.name, "failed to open pod log stream");
                }
            }
        }));
    }
    drop(tx);

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    let Ok(payload) = serde_json::to_string(&item) else { continue };
                    if socket.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                // The client hung up; close the pod watches promptly.
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    for watch in watches {
        watch.abort();
    }
    let _ = socket.close().await;
}

// ==== health ====

async fn health_ready(
    Extension(persistence): Extension<Persistence>,
) -> Response {
    if persistence.healthy().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Deployment history for an environment; drained previews keep theirs.
async fn list_environment_deployments(
    Extension(persistence): Extension<Persistence>,
    User { claim }: User,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Deployment>>> {
    let environment = persistence.get_environment(id).await?;
    forbid_unless(claim.may_read(environment.project_id))?;

    persistence
        .list_deployments(DeploymentFilter::Environment(id))
        .await
        .map(Json)
}
