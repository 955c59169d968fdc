use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};

use crate::build::backend::{BuildBackend, DockerBackend, StubBackend};
use crate::orchestrator::{DockerOrchestrator, MemoryOrchestrator, Orchestrator};

#[derive(Parser, Debug)]
#[command(name = "enclii-server", version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Start(StartArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct StartArgs {
    /// Address to bind the API to
    #[arg(long, default_value = "127.0.0.1:8001", env = "ENCLII_API_ADDR")]
    pub api: SocketAddr,

    /// Uri to the `.sqlite` file used to store state
    #[arg(long, default_value = "./enclii.sqlite", env = "ENCLII_STATE")]
    pub state: String,

    /// Directory for SBOMs, signatures, and other build artifacts
    #[arg(long, default_value = "./artifacts", env = "ENCLII_ARTIFACTS_DIR")]
    pub artifacts_dir: PathBuf,

    /// Path to the platform Ed25519 signing key (PKCS#8); generated when absent
    #[arg(long, default_value = "./enclii-signing.p8", env = "ENCLII_SIGNING_KEY")]
    pub signing_key: PathBuf,

    /// Shared secret used to verify source-forge webhook signatures
    #[arg(long, env = "ENCLII_WEBHOOK_SECRET")]
    pub webhook_secret: String,

    /// OIDC issuer URL tokens are verified against
    #[arg(long, env = "ENCLII_OIDC_ISSUER")]
    pub oidc_issuer: String,

    /// OIDC client id used when initiating logins
    #[arg(long, default_value = "enclii", env = "ENCLII_OIDC_CLIENT_ID")]
    pub oidc_client_id: String,

    /// Registry prefix images are pushed under, e.g. `registry.example.com/acme`
    #[arg(long, default_value = "registry.local/enclii", env = "ENCLII_REGISTRY")]
    pub registry: String,

    /// Email granted the owner role on first start
    #[arg(long, env = "ENCLII_ROOT_OWNER")]
    pub root_owner: Option<String>,

    /// Compliance sink receipts are delivered to
    #[arg(long, env = "ENCLII_RECEIPT_SINK")]
    pub receipt_sink: Option<String>,

    /// Maximum concurrent builds; defaults to the CPU count
    #[arg(long, env = "ENCLII_N_BUILD")]
    pub n_build: Option<usize>,

    /// Maximum concurrent reconcile passes
    #[arg(long, default_value_t = 8, env = "ENCLII_N_RECONCILE")]
    pub n_reconcile: usize,

    /// Seconds between reconciler resync ticks
    #[arg(long, default_value_t = 60, env = "ENCLII_RESYNC_SECS")]
    pub resync_secs: u64,

    /// Seconds a deployment gets to become healthy before it fails
    #[arg(long, default_value_t = 120, env = "ENCLII_STABILISE_SECS")]
    pub stabilise_secs: u64,

    /// Which orchestrator backend to converge against
    #[arg(long, value_enum, default_value_t = OrchestratorKind::Docker)]
    pub orchestrator: OrchestratorKind,

    /// Which builder backend produces images
    #[arg(long, value_enum, default_value_t = BuilderKind::Docker)]
    pub builder: BuilderKind,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum OrchestratorKind {
    /// Drive the local Docker daemon. The default for single-node installs.
    Docker,
    /// Keep cluster state in memory. For local development only.
    Memory,
}

impl OrchestratorKind {
    pub async fn connect(&self) -> anyhow::Result<Arc<dyn Orchestrator>> {
        Ok(match self {
            Self::Docker => Arc::new(DockerOrchestrator::connect().await?),
            Self::Memory => Arc::new(MemoryOrchestrator::default()),
        })
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum BuilderKind {
    Docker,
    /// Record builds without producing images. For local development only.
    Stub,
}

impl BuilderKind {
    pub fn backend(&self, args: &StartArgs) -> anyhow::Result<Arc<dyn BuildBackend>> {
        Ok(match self {
            Self::Docker => Arc::new(DockerBackend::connect(&args.registry)?),
            Self::Stub => Arc::new(StubBackend::default()),
        })
    }
}
