//! The cluster contract the reconciler converges against: idempotent
//! upserts of workload/network/ingress objects keyed by name and
//! namespace, observation by label selector, pod listing, and per-pod log
//! streams. Kubernetes satisfies this contract; the bundled backends drive
//! a Docker daemon or an in-memory cluster.

mod docker;
mod memory;

pub use docker::DockerOrchestrator;
pub use memory::MemoryOrchestrator;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

/// Labels the control plane stamps on everything it creates.
pub mod labels {
    pub const NAMESPACE: &str = "enclii.namespace";
    pub const SERVICE: &str = "enclii.service";
    pub const ENVIRONMENT: &str = "enclii.environment";
    pub const DEPLOYMENT: &str = "enclii.deployment";
    pub const WORKLOAD: &str = "enclii.workload";
    pub const CONFIG_HASH: &str = "enclii.config-hash";
    pub const REPLICAS: &str = "enclii.replicas";
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("orchestrator unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("orchestrator rejected the request: {0}")]
    Rejected(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProbeSpec {
    pub path: String,
    pub initial_delay_secs: u32,
    pub timeout_secs: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadSpec {
    pub name: String,
    pub image: String,
    pub replicas: u32,
    pub port: u16,
    pub env: BTreeMap<String, String>,
    pub cpu_limit_millis: u32,
    pub memory_limit_mb: u32,
    pub probe: ProbeSpec,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NetworkSpec {
    pub name: String,
    pub port: u16,
    /// Workload the network fronts.
    pub backend: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IngressSpec {
    pub name: String,
    pub hostname: String,
    /// Workload traffic lands on. Flipping this is the blue/green switch.
    pub backend: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct ObservedWorkload {
    pub name: String,
    pub image: String,
    pub replicas_desired: u32,
    pub replicas_ready: u32,
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct ObservedIngress {
    pub name: String,
    pub backend: String,
}

/// A snapshot of what actually runs under a namespace and selector.
#[derive(Clone, Debug, Default)]
pub struct Observed {
    pub workloads: Vec<ObservedWorkload>,
    pub networks: Vec<String>,
    pub ingresses: Vec<ObservedIngress>,
}

impl Observed {
    pub fn workload(&self, name: &str) -> Option<&ObservedWorkload> {
        self.workloads.iter().find(|w| w.name == name)
    }
}

#[derive(Clone, Debug)]
pub struct PodInfo {
    pub name: String,
    pub ready: bool,
}

/// A change notification from the cluster; carries enough labels for the
/// reconciler to find the affected key.
#[derive(Clone, Debug)]
pub struct OrchestratorEvent {
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

#[async_trait]
pub trait Orchestrator: Send + Sync + 'static {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), OrchestratorError>;

    /// Idempotent server-side upsert keyed by `(namespace, spec.name)`.
    async fn upsert_workload(
        &self,
        namespace: &str,
        spec: &WorkloadSpec,
    ) -> Result<(), OrchestratorError>;

    async fn upsert_network(
        &self,
        namespace: &str,
        spec: &NetworkSpec,
    ) -> Result<(), OrchestratorError>;

    async fn upsert_ingress(
        &self,
        namespace: &str,
        spec: &IngressSpec,
    ) -> Result<(), OrchestratorError>;

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError>;

    async fn observe(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Observed, OrchestratorError>;

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodInfo>, OrchestratorError>;

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        since: Option<DateTime<Utc>>,
        follow: bool,
    ) -> Result<BoxStream<'static, String>, OrchestratorError>;

    /// Tear down every object under the namespace.
    async fn remove_namespace(&self, namespace: &str) -> Result<(), OrchestratorError>;

    /// Change events, used to trigger reconciles between resync ticks.
    async fn events(&self) -> Result<BoxStream<'static, OrchestratorEvent>, OrchestratorError>;
}
