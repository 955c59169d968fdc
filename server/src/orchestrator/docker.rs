//! Docker-daemon backend. Workloads map to one container per replica,
//! namespaces to Docker networks, and ingress to a hostname alias on the
//! shared edge network that the platform proxy routes by.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions};
use bollard::service::{
    ContainerSummary, EndpointSettings, HealthConfig, HealthStatusEnum, HostConfig,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::system::EventsOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use super::{
    labels, IngressSpec, NetworkSpec, Observed, ObservedIngress, ObservedWorkload,
    Orchestrator, OrchestratorError, OrchestratorEvent, PodInfo, WorkloadSpec,
};

const EDGE_NETWORK: &str = "enclii-edge";
const INGRESS_HOST_LABEL: &str = "enclii.ingress.host";

pub struct DockerOrchestrator {
    docker: Docker,
}

impl DockerOrchestrator {
    pub async fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.version().await?;

        let orchestrator = Self { docker };
        orchestrator.ensure_network(EDGE_NETWORK).await?;

        Ok(orchestrator)
    }

    /// Best-effort pull; images built on this host are not in the registry
    /// yet, which is fine.
    async fn pull_image(&self, image: &str) {
        let mut stream = self.docker.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            if let Err(err) = progress {
                trace!(error = %err, %image, "image pull skipped");
                break;
            }
        }
    }

    fn container_name(namespace: &str, workload: &str, index: u32) -> String {
        format!("{namespace}-{workload}-{index}")
    }

    fn config_hash(spec: &WorkloadSpec) -> String {
        let mut hasher = Sha256::new();
        hasher.update(spec.image.as_bytes());
        hasher.update(spec.port.to_be_bytes());
        hasher.update(spec.probe.path.as_bytes());
        hasher.update(spec.cpu_limit_millis.to_be_bytes());
        hasher.update(spec.memory_limit_mb.to_be_bytes());
        for (key, value) in &spec.env {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), OrchestratorError> {
        match self
            .docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                check_duplicate: true,
                ..Default::default()
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(DockerError::DockerResponseServerError { status_code, .. })
                if status_code == 409 =>
            {
                Ok(())
            }
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn list_by_labels(
        &self,
        label_filters: Vec<String>,
    ) -> Result<Vec<ContainerSummary>, OrchestratorError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), label_filters);
        self.docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(unavailable)
    }

    async fn remove_container(&self, name: &str) -> Result<(), OrchestratorError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError { status_code, .. })
                if status_code == 404 =>
            {
                Ok(())
            }
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn connect_with_alias(
        &self,
        network: &str,
        container: &str,
        alias: &str,
    ) -> Result<(), OrchestratorError> {
        match self
            .docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: container.to_string(),
                    endpoint_config: EndpointSettings {
                        aliases: Some(vec![alias.to_string()]),
                        ..Default::default()
                    },
                },
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already connected is the desired state.
            Err(DockerError::DockerResponseServerError { status_code, .. })
                if status_code == 403 || status_code == 409 =>
            {
                Ok(())
            }
            Err(err) => Err(unavailable(err)),
        }
    }

    /// One container is ready when it runs and its probe, if any, reports
    /// healthy.
    async fn container_ready(&self, name: &str) -> bool {
        let Ok(inspection) = self.docker.inspect_container(name, None).await else {
            return false;
        };
        let Some(state) = inspection.state else {
            return false;
        };
        if state.running != Some(true) {
            return false;
        }
        match state.health.and_then(|health| health.status) {
            Some(HealthStatusEnum::HEALTHY) | None => true,
            _ => false,
        }
    }

    fn summary_name(summary: &ContainerSummary) -> Option<String> {
        summary
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|name| name.trim_start_matches('/').to_string())
    }
}

fn unavailable(err: DockerError) -> OrchestratorError {
    OrchestratorError::Unavailable(Box::new(err))
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), OrchestratorError> {
        self.ensure_network(namespace).await
    }

    async fn upsert_workload(
        &self,
        namespace: &str,
        spec: &WorkloadSpec,
    ) -> Result<(), OrchestratorError> {
        let hash = Self::config_hash(spec);
        self.pull_image(&spec.image).await;

        for index in 0..spec.replicas {
            let name = Self::container_name(namespace, &spec.name, index);

            if let Ok(existing) = self.docker.inspect_container(&name, None).await {
                let current_hash = existing
                    .config
                    .as_ref()
                    .and_then(|config| config.labels.as_ref())
                    .and_then(|labels| labels.get(labels::CONFIG_HASH));
                let running = existing
                    .state
                    .as_ref()
                    .and_then(|state| state.running)
                    .unwrap_or(false);
                if current_hash == Some(&hash) && running {
                    trace!(%name, "container already converged");
                    continue;
                }
                debug!(%name, "replacing container with stale config");
                self.remove_container(&name).await?;
            }

            let mut container_labels: HashMap<String, String> = spec
                .labels
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            container_labels.insert(labels::NAMESPACE.to_string(), namespace.to_string());
            container_labels.insert(labels::WORKLOAD.to_string(), spec.name.clone());
            container_labels.insert(labels::CONFIG_HASH.to_string(), hash.clone());
            container_labels.insert(labels::REPLICAS.to_string(), spec.replicas.to_string());

            let env: Vec<String> = spec
                .env
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();

            let healthcheck = HealthConfig {
                test: Some(vec![
                    "CMD-SHELL".to_string(),
                    format!(
                        "curl -sf http://localhost:{}{} || exit 1",
                        spec.port, spec.probe.path
                    ),
                ]),
                interval: Some(5_000_000_000),
                timeout: Some(i64::from(spec.probe.timeout_secs) * 1_000_000_000),
                retries: Some(3),
                start_period: Some(i64::from(spec.probe.initial_delay_secs) * 1_000_000_000),
                ..Default::default()
            };

            let config = Config {
                image: Some(spec.image.clone()),
                env: Some(env),
                labels: Some(container_labels),
                healthcheck: Some(healthcheck),
                host_config: Some(HostConfig {
                    memory: Some(i64::from(spec.memory_limit_mb) * 1024 * 1024),
                    nano_cpus: Some(i64::from(spec.cpu_limit_millis) * 1_000_000),
                    restart_policy: Some(RestartPolicy {
                        name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                        maximum_retry_count: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            };

            self.docker
                .create_container(
                    Some(CreateContainerOptions {
                        name: name.clone(),
                        platform: None,
                    }),
                    config,
                )
                .await
                .map_err(unavailable)?;
            self.docker
                .start_container(&name, None::<StartContainerOptions<String>>)
                .await
                .map_err(unavailable)?;
            self.connect_with_alias(namespace, &name, &spec.name).await?;
        }

        // Scale down: drop replicas beyond the desired count.
        let existing = self
            .list_by_labels(vec![
                format!("{}={namespace}", labels::NAMESPACE),
                format!("{}={}", labels::WORKLOAD, spec.name),
            ])
            .await?;
        for summary in existing {
            let Some(name) = Self::summary_name(&summary) else {
                continue;
            };
            let index = name
                .rsplit('-')
                .next()
                .and_then(|raw| raw.parse::<u32>().ok());
            if matches!(index, Some(index) if index >= spec.replicas) {
                debug!(%name, "scaling down surplus replica");
                self.remove_container(&name).await?;
            }
        }

        Ok(())
    }

    async fn upsert_network(
        &self,
        namespace: &str,
        spec: &NetworkSpec,
    ) -> Result<(), OrchestratorError> {
        self.ensure_network(namespace).await?;

        // The service name resolves to the backend containers inside the
        // namespace network.
        let containers = self
            .list_by_labels(vec![
                format!("{}={namespace}", labels::NAMESPACE),
                format!("{}={}", labels::WORKLOAD, spec.backend),
            ])
            .await?;
        for summary in containers {
            if let Some(name) = Self::summary_name(&summary) {
                self.connect_with_alias(namespace, &name, &spec.name).await?;
            }
        }

        Ok(())
    }

    async fn upsert_ingress(
        &self,
        namespace: &str,
        spec: &IngressSpec,
    ) -> Result<(), OrchestratorError> {
        self.ensure_network(EDGE_NETWORK).await?;

        let all = self
            .list_by_labels(vec![format!("{}={namespace}", labels::NAMESPACE)])
            .await?;

        for summary in all {
            let Some(name) = Self::summary_name(&summary) else {
                continue;
            };
            let workload = summary
                .labels
                .as_ref()
                .and_then(|labels| labels.get(labels::WORKLOAD))
                .cloned()
                .unwrap_or_default();

            if workload == spec.backend {
                self.connect_with_alias(EDGE_NETWORK, &name, &spec.hostname)
                    .await?;
            } else {
                // Route flip: anything else loses the hostname.
                match self
                    .docker
                    .disconnect_network(
                        EDGE_NETWORK,
                        DisconnectNetworkOptions {
                            container: name.clone(),
                            force: true,
                        },
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(DockerError::DockerResponseServerError { status_code, .. })
                        if status_code == 403 || status_code == 404 || status_code == 409 => {}
                    Err(err) => return Err(unavailable(err)),
                }
            }
        }

        Ok(())
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError> {
        let containers = self
            .list_by_labels(vec![
                format!("{}={namespace}", labels::NAMESPACE),
                format!("{}={name}", labels::WORKLOAD),
            ])
            .await?;
        for summary in containers {
            if let Some(container) = Self::summary_name(&summary) {
                self.remove_container(&container).await?;
            }
        }
        Ok(())
    }

    async fn observe(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Observed, OrchestratorError> {
        let mut label_filters = vec![format!("{}={namespace}", labels::NAMESPACE)];
        for (key, value) in selector {
            label_filters.push(format!("{key}={value}"));
        }

        let summaries = self.list_by_labels(label_filters).await?;

        let mut workloads: HashMap<String, ObservedWorkload> = HashMap::new();
        let mut ingresses: Vec<ObservedIngress> = Vec::new();

        for summary in summaries {
            let Some(name) = Self::summary_name(&summary) else {
                continue;
            };
            let container_labels = summary.labels.clone().unwrap_or_default();
            let Some(workload_name) = container_labels.get(labels::WORKLOAD).cloned() else {
                continue;
            };

            let ready = self.container_ready(&name).await;
            let desired = container_labels
                .get(labels::REPLICAS)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(1);

            let entry = workloads
                .entry(workload_name.clone())
                .or_insert_with(|| ObservedWorkload {
                    name: workload_name.clone(),
                    image: summary.image.clone().unwrap_or_default(),
                    replicas_desired: desired,
                    replicas_ready: 0,
                    labels: container_labels
                        .iter()
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect(),
                });
            if ready {
                entry.replicas_ready += 1;
            }

            if let Some(host) = container_labels.get(INGRESS_HOST_LABEL) {
                if !ingresses.iter().any(|ingress| ingress.name == *host) {
                    ingresses.push(ObservedIngress {
                        name: host.clone(),
                        backend: workload_name,
                    });
                }
            }
        }

        Ok(Observed {
            workloads: workloads.into_values().collect(),
            networks: vec![namespace.to_string()],
            ingresses,
        })
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodInfo>, OrchestratorError> {
        let mut label_filters = vec![format!("{}={namespace}", labels::NAMESPACE)];
        for (key, value) in selector {
            label_filters.push(format!("{key}={value}"));
        }

        let summaries = self.list_by_labels(label_filters).await?;
        let mut pods = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(name) = Self::summary_name(&summary) else {
                continue;
            };
            let ready = self.container_ready(&name).await;
            pods.push(PodInfo { name, ready });
        }

        Ok(pods)
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        pod: &str,
        since: Option<DateTime<Utc>>,
        follow: bool,
    ) -> Result<BoxStream<'static, String>, OrchestratorError> {
        let stream = self
            .docker
            .logs(
                pod,
                Some(LogsOptions::<String> {
                    follow,
                    stdout: true,
                    stderr: true,
                    since: since.map(|ts| ts.timestamp()).unwrap_or(0),
                    timestamps: false,
                    ..Default::default()
                }),
            )
            .filter_map(|chunk| async move {
                match chunk {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                        Some(String::from_utf8_lossy(&message).trim_end().to_string())
                    }
                    Ok(_) => None,
                    Err(err) => {
                        warn!(error = %err, "pod log stream ended with an error");
                        None
                    }
                }
            });

        Ok(stream.boxed())
    }

    async fn remove_namespace(&self, namespace: &str) -> Result<(), OrchestratorError> {
        let containers = self
            .list_by_labels(vec![format!("{}={namespace}", labels::NAMESPACE)])
            .await?;
        for summary in containers {
            if let Some(name) = Self::summary_name(&summary) {
                self.remove_container(&name).await?;
            }
        }

        match self.docker.remove_network(namespace).await {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError { status_code, .. })
                if status_code == 404 =>
            {
                Ok(())
            }
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn events(&self) -> Result<BoxStream<'static, OrchestratorEvent>, OrchestratorError> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert("label".to_string(), vec![labels::NAMESPACE.to_string()]);

        let stream = self
            .docker
            .events(Some(EventsOptions::<String> {
                filters,
                ..Default::default()
            }))
            .filter_map(|message| async move {
                let message = message.ok()?;
                let attributes = message.actor?.attributes?;
                let namespace = attributes.get(labels::NAMESPACE)?.clone();
                Some(OrchestratorEvent {
                    namespace,
                    labels: attributes.into_iter().collect(),
                })
            });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::ProbeSpec;

    fn spec(image: &str, replicas: u32) -> WorkloadSpec {
        WorkloadSpec {
            name: "api".to_string(),
            image: image.to_string(),
            replicas,
            port: 8080,
            env: BTreeMap::from([("RUST_LOG".to_string(), "info".to_string())]),
            cpu_limit_millis: 500,
            memory_limit_mb: 256,
            probe: ProbeSpec {
                path: "/health".to_string(),
                initial_delay_secs: 5,
                timeout_secs: 3,
            },
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn config_hash_tracks_spec_content() {
        let base = spec("registry.local/api:v1", 2);
        assert_eq!(
            DockerOrchestrator::config_hash(&base),
            DockerOrchestrator::config_hash(&spec("registry.local/api:v1", 2)),
        );
        // Replica count scales containers, it does not change their config.
        assert_eq!(
            DockerOrchestrator::config_hash(&base),
            DockerOrchestrator::config_hash(&spec("registry.local/api:v1", 3)),
        );
        assert_ne!(
            DockerOrchestrator::config_hash(&base),
            DockerOrchestrator::config_hash(&spec("registry.local/api:v2", 2)),
        );
    }

    #[test]
    fn container_names_embed_namespace_and_index() {
        assert_eq!(
            DockerOrchestrator::container_name("acme-staging", "api", 0),
            "acme-staging-api-0"
        );
    }
}
