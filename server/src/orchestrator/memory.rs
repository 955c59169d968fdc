//! An in-memory cluster for tests and single-process development runs.
//! Upserted workloads become ready immediately unless their health is held
//! down, which is how deployment failure paths are exercised.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;

use super::{
    IngressSpec, NetworkSpec, Observed, ObservedIngress, ObservedWorkload, Orchestrator,
    OrchestratorError, OrchestratorEvent, PodInfo, WorkloadSpec,
};

#[derive(Default)]
struct NamespaceState {
    workloads: HashMap<String, WorkloadEntry>,
    networks: HashMap<String, NetworkSpec>,
    ingresses: HashMap<String, IngressSpec>,
    pod_logs: HashMap<String, Vec<String>>,
}

struct WorkloadEntry {
    spec: WorkloadSpec,
    ready: u32,
}

pub struct MemoryOrchestrator {
    state: Mutex<HashMap<String, NamespaceState>>,
    /// Workload names whose replicas never become ready.
    unhealthy: Mutex<HashSet<String>>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl Default for MemoryOrchestrator {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(HashMap::new()),
            unhealthy: Mutex::new(HashSet::new()),
            events,
        }
    }
}

impl MemoryOrchestrator {
    /// Make every current and future replica of the workload fail its
    /// health probe.
    pub fn hold_unhealthy(&self, workload: &str) {
        self.unhealthy.lock().unwrap().insert(workload.to_string());
        let mut state = self.state.lock().unwrap();
        for ns in state.values_mut() {
            if let Some(entry) = ns.workloads.get_mut(workload) {
                entry.ready = 0;
            }
        }
    }

    pub fn release_unhealthy(&self, workload: &str) {
        self.unhealthy.lock().unwrap().remove(workload);
        let mut state = self.state.lock().unwrap();
        for ns in state.values_mut() {
            if let Some(entry) = ns.workloads.get_mut(workload) {
                entry.ready = entry.spec.replicas;
            }
        }
    }

    pub fn push_pod_log(&self, namespace: &str, pod: &str, line: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .entry(namespace.to_string())
            .or_default()
            .pod_logs
            .entry(pod.to_string())
            .or_default()
            .push(line.to_string());
    }

    pub fn namespace_exists(&self, namespace: &str) -> bool {
        self.state.lock().unwrap().contains_key(namespace)
    }

    pub fn ingress_backend(&self, namespace: &str, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .get(namespace)
            .and_then(|ns| ns.ingresses.get(name))
            .map(|ingress| ingress.backend.clone())
    }

    pub fn workload_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .get(namespace)
            .map(|ns| ns.workloads.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn emit(&self, namespace: &str, workload_labels: &BTreeMap<String, String>) {
        let _ = self.events.send(OrchestratorEvent {
            namespace: namespace.to_string(),
            labels: workload_labels.clone(),
        });
    }

    fn selected(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

#[async_trait]
impl Orchestrator for MemoryOrchestrator {
    async fn ensure_namespace(&self, namespace: &str) -> Result<(), OrchestratorError> {
        self.state
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_default();
        Ok(())
    }

    async fn upsert_workload(
        &self,
        namespace: &str,
        spec: &WorkloadSpec,
    ) -> Result<(), OrchestratorError> {
        let ready = if self.unhealthy.lock().unwrap().contains(&spec.name) {
            0
        } else {
            spec.replicas
        };

        {
            let mut state = self.state.lock().unwrap();
            let ns = state.entry(namespace.to_string()).or_default();
            ns.workloads.insert(
                spec.name.clone(),
                WorkloadEntry {
                    spec: spec.clone(),
                    ready,
                },
            );
        }
        self.emit(namespace, &spec.labels);

        Ok(())
    }

    async fn upsert_network(
        &self,
        namespace: &str,
        spec: &NetworkSpec,
    ) -> Result<(), OrchestratorError> {
        self.state
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_default()
            .networks
            .insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn upsert_ingress(
        &self,
        namespace: &str,
        spec: &IngressSpec,
    ) -> Result<(), OrchestratorError> {
        self.state
            .lock()
            .unwrap()
            .entry(namespace.to_string())
            .or_default()
            .ingresses
            .insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), OrchestratorError> {
        if let Some(ns) = self.state.lock().unwrap().get_mut(namespace) {
            ns.workloads.remove(name);
        }
        Ok(())
    }

    async fn observe(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Observed, OrchestratorError> {
        let state = self.state.lock().unwrap();
        let Some(ns) = state.get(namespace) else {
            return Ok(Observed::default());
        };

        Ok(Observed {
            workloads: ns
                .workloads
                .values()
                .filter(|entry| Self::selected(&entry.spec.labels, selector))
                .map(|entry| ObservedWorkload {
                    name: entry.spec.name.clone(),
                    image: entry.spec.image.clone(),
                    replicas_desired: entry.spec.replicas,
                    replicas_ready: entry.ready,
                    labels: entry.spec.labels.clone(),
                })
                .collect(),
            networks: ns.networks.keys().cloned().collect(),
            ingresses: ns
                .ingresses
                .values()
                .map(|ingress| ObservedIngress {
                    name: ingress.name.clone(),
                    backend: ingress.backend.clone(),
                })
                .collect(),
        })
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodInfo>, OrchestratorError> {
        let state = self.state.lock().unwrap();
        let Some(ns) = state.get(namespace) else {
            return Ok(Vec::new());
        };

        let mut pods = Vec::new();
        for entry in ns.workloads.values() {
            if !Self::selected(&entry.spec.labels, selector) {
                continue;
            }
            for i in 0..entry.spec.replicas {
                pods.push(PodInfo {
                    name: format!("{}-{i}", entry.spec.name),
                    ready: i < entry.ready,
                });
            }
        }

        Ok(pods)
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        _since: Option<DateTime<Utc>>,
        _follow: bool,
    ) -> Result<BoxStream<'static, String>, OrchestratorError> {
        let lines = self
            .state
            .lock()
            .unwrap()
            .get(namespace)
            .and_then(|ns| ns.pod_logs.get(pod))
            .cloned()
            .unwrap_or_default();

        Ok(futures::stream::iter(lines).boxed())
    }

    async fn remove_namespace(&self, namespace: &str) -> Result<(), OrchestratorError> {
        self.state.lock().unwrap().remove(namespace);
        Ok(())
    }

    async fn events(&self) -> Result<BoxStream<'static, OrchestratorEvent>, OrchestratorError> {
        let receiver = self.events.subscribe();
        let stream = tokio_stream::wrappers::BroadcastStream::new(receiver)
            .filter_map(|event| async { event.ok() });
        Ok(stream.boxed())
    }
}
