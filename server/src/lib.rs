use std::error::Error as StdError;
use std::fmt::Formatter;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, info};

use enclii_common::models::error::{ApiError, ErrorEnvelope, ErrorKind};
use enclii_common::models::InvalidName;

pub mod api;
pub mod args;
pub mod artifacts;
pub mod auth;
pub mod build;
pub mod intake;
pub mod orchestrator;
pub mod persistence;
pub mod planner;
pub mod receipt;
pub mod reconciler;

use args::StartArgs;
use artifacts::{ArtifactStore, Signer};
use auth::Authenticator;
use build::BuildManager;
use orchestrator::Orchestrator;
use persistence::Persistence;
use receipt::ReceiptDeliverer;
use reconciler::Reconciler;

/// Server-side errors. Each one carries an [`ErrorKind`] and an optional
/// source; the [`IntoResponse`] implementation does not leak the source.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl Error {
    pub fn source<E: StdError + Sync + Send + 'static>(kind: ErrorKind, err: E) -> Self {
        Self {
            kind,
            source: Some(Box::new(err)),
        }
    }

    pub fn custom<S: AsRef<str>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(io::Error::new(
                io::ErrorKind::Other,
                message.as_ref().to_string(),
            ))),
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The message a caller is allowed to see.
    pub fn client_message(&self) -> String {
        match self.kind {
            // Validation and conflict details help the caller fix the request.
            ErrorKind::Validation | ErrorKind::Conflict | ErrorKind::DeploymentInProgress => self
                .source
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| self.kind.default_message().to_string()),
            _ => self.kind.default_message().to_string(),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::from_kind(kind)
    }
}

impl From<InvalidName> for Error {
    fn from(err: InvalidName) -> Self {
        Self::source(ErrorKind::Validation, err)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::source(ErrorKind::NotFound, err),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Self::source(ErrorKind::Conflict, err)
            }
            _ => Self::source(ErrorKind::Internal, err),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        error!(error = %self, "request had an error");

        let body = ErrorEnvelope::from(ApiError {
            code: self.kind.code().to_string(),
            message: self.client_message(),
            details: None,
        });

        (self.kind.status(), Json(body)).into_response()
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(source) = self.source.as_ref() {
            write!(f, ": ")?;
            source.fmt(f)?;
        }
        Ok(())
    }
}

impl StdError for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Wire the components together and serve until ctrl-c.
pub async fn start(args: StartArgs) -> anyhow::Result<()> {
    let persistence = Persistence::new(&args.state).await?;
    persistence.bootstrap_owner(args.root_owner.as_deref()).await?;

    let signer = Arc::new(Signer::from_file_or_generate(&args.signing_key)?);
    let artifacts = Arc::new(ArtifactStore::new(&args.artifacts_dir)?);
    let authenticator = Arc::new(Authenticator::new(
        persistence.clone(),
        args.oidc_issuer.clone(),
        args.oidc_client_id.clone(),
    ));

    let orchestrator: Arc<dyn Orchestrator> = args.orchestrator.connect().await?;

    let build_manager = BuildManager::new(
        persistence.clone(),
        artifacts.clone(),
        signer.clone(),
        args.builder.backend(&args)?,
        args.n_build.unwrap_or_else(num_cpus::get),
    );
    build_manager.recover().await?;

    let reconciler = Reconciler::new(
        persistence.clone(),
        orchestrator.clone(),
        signer.clone(),
        reconciler::Settings {
            workers: args.n_reconcile,
            resync: std::time::Duration::from_secs(args.resync_secs),
            stabilise: std::time::Duration::from_secs(args.stabilise_secs),
        },
    );
    reconciler.spawn();

    intake::AutoDeployer::new(persistence.clone()).spawn();

    if let Some(sink) = args.receipt_sink.clone() {
        ReceiptDeliverer::new(persistence.clone(), sink).spawn();
    }

    let router = api::router(api::ApiContext {
        persistence,
        authenticator,
        build_manager,
        orchestrator,
        webhook_secret: args.webhook_secret.clone(),
        oidc_issuer: args.oidc_issuer.clone(),
        oidc_client_id: args.oidc_client_id.clone(),
    });

    let addr: SocketAddr = args.api;
    info!(%addr, "binding control plane API");

    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}
