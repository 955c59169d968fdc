//! Turns `(service, release, environment, deployment)` into the desired
//! orchestrator resources. Pure: no side effects, no clock, no I/O.

use std::collections::BTreeMap;

use enclii_common::models::deployment::{Deployment, Strategy};
use enclii_common::models::error::ErrorKind;
use enclii_common::models::project::Environment;
use enclii_common::models::release::Release;
use enclii_common::models::service::Service;

use crate::orchestrator::{labels, IngressSpec, NetworkSpec, ProbeSpec, WorkloadSpec};
use crate::{Error, Result};

const INGRESS_DOMAIN: &str = "enclii.app";

/// The desired state for one deployment: exactly one workload, its
/// network service, and the ingress rule for the environment's hostname.
#[derive(Clone, Debug)]
pub struct Plan {
    pub namespace: String,
    /// Label selector that scopes observation to this service.
    pub selector: BTreeMap<String, String>,
    pub workload: WorkloadSpec,
    pub network: NetworkSpec,
    pub ingress: IngressSpec,
    pub strategy: Strategy,
}

impl Plan {
    /// Blue/green runs each release under its own workload name so both
    /// colours coexist; the other strategies replace in place.
    pub fn workload_name(service: &Service, release: &Release, strategy: Strategy) -> String {
        match strategy {
            Strategy::BlueGreen => format!("{}-r{}", service.name, release.sequence),
            Strategy::Rolling | Strategy::Recreate => service.name.to_string(),
        }
    }
}

pub fn plan(
    service: &Service,
    release: &Release,
    environment: &Environment,
    deployment: &Deployment,
    env: BTreeMap<String, String>,
) -> Result<Plan> {
    let image = release
        .image_uri
        .clone()
        .ok_or_else(|| Error::custom(ErrorKind::DeployFailed, "release has no image"))?;

    let runtime = &service.runtime_config;
    let workload_name = Plan::workload_name(service, release, deployment.strategy);

    let mut workload_env = env;
    workload_env
        .entry("PORT".to_string())
        .or_insert_with(|| runtime.port.to_string());

    let selector = BTreeMap::from([(labels::SERVICE.to_string(), service.id.to_string())]);

    let mut workload_labels = selector.clone();
    workload_labels.insert(
        labels::ENVIRONMENT.to_string(),
        environment.id.to_string(),
    );
    workload_labels.insert(labels::DEPLOYMENT.to_string(), deployment.id.to_string());

    let workload = WorkloadSpec {
        name: workload_name.clone(),
        image,
        replicas: deployment.replicas_desired,
        port: runtime.port,
        env: workload_env,
        cpu_limit_millis: runtime.resources.cpu_limit_millis,
        memory_limit_mb: runtime.resources.memory_limit_mb,
        probe: ProbeSpec {
            path: runtime.healthcheck.path.clone(),
            initial_delay_secs: runtime.healthcheck.initial_delay_secs,
            timeout_secs: runtime.healthcheck.timeout_secs,
        },
        labels: workload_labels,
    };

    let network = NetworkSpec {
        name: service.name.to_string(),
        port: runtime.port,
        backend: workload_name.clone(),
    };

    let ingress = IngressSpec {
        name: service.name.to_string(),
        hostname: format!("{}.{}.{INGRESS_DOMAIN}", service.name, environment.namespace),
        backend: workload_name,
        port: runtime.port,
    };

    Ok(Plan {
        namespace: environment.namespace.clone(),
        selector,
        workload,
        network,
        ingress,
        strategy: deployment.strategy,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use enclii_common::models::deployment::{DeploymentStatus, HealthState};
    use enclii_common::models::project::EnvironmentName;
    use enclii_common::models::release::ReleaseStatus;
    use enclii_common::models::service::{BuildConfig, RuntimeConfig};

    use super::*;

    fn fixture(strategy: Strategy) -> (Service, Release, Environment, Deployment) {
        let project_id = Uuid::new_v4();
        let service = Service {
            id: Uuid::new_v4(),
            project_id,
            name: "api".parse().unwrap(),
            git_repo: "github.com/acme/shop".to_string(),
            git_branch: "main".to_string(),
            app_path: ".".to_string(),
            build_config: BuildConfig::Auto,
            runtime_config: RuntimeConfig::default(),
            auto_deploy: true,
            created_at: Utc::now(),
        };
        let release = Release {
            id: Uuid::new_v4(),
            service_id: service.id,
            sequence: 7,
            git_sha: "abc1234".to_string(),
            image_uri: Some("registry.local/acme/api:v7".to_string()),
            image_digest: Some("sha256:abc".to_string()),
            sbom_ref: Some("sbom:sha256:1".to_string()),
            signature_ref: Some("signature:sha256:1".to_string()),
            provenance_ref: None,
            status: ReleaseStatus::Ready,
            created_at: Utc::now(),
            builder_log_ref: None,
            cache_hit: None,
            digest_policy: None,
        };
        let environment = Environment {
            id: Uuid::new_v4(),
            project_id,
            name: EnvironmentName::Staging,
            namespace: "acme-shop-staging".to_string(),
            is_production: false,
            draining: false,
        };
        let deployment = Deployment {
            id: Uuid::new_v4(),
            release_id: release.id,
            environment_id: environment.id,
            replicas_desired: 3,
            replicas_ready: 0,
            status: DeploymentStatus::Queued,
            health: HealthState::Unknown,
            strategy,
            started_at: Utc::now(),
            ended_at: None,
            previous_deployment_id: None,
            error: None,
        };
        (service, release, environment, deployment)
    }

    #[test]
    fn rolling_plans_a_stable_workload_name() {
        let (service, release, environment, deployment) = fixture(Strategy::Rolling);
        let plan = plan(
            &service,
            &release,
            &environment,
            &deployment,
            BTreeMap::new(),
        )
        .unwrap();

        assert_eq!(plan.workload.name, "api");
        assert_eq!(plan.workload.replicas, 3);
        assert_eq!(plan.namespace, "acme-shop-staging");
        assert_eq!(plan.ingress.hostname, "api.acme-shop-staging.enclii.app");
        assert_eq!(plan.ingress.backend, "api");
        assert_eq!(plan.workload.env.get("PORT").unwrap(), "8080");
    }

    #[test]
    fn blue_green_plans_a_per_release_workload() {
        let (service, release, environment, deployment) = fixture(Strategy::BlueGreen);
        let plan = plan(
            &service,
            &release,
            &environment,
            &deployment,
            BTreeMap::new(),
        )
        .unwrap();

        assert_eq!(plan.workload.name, "api-r7");
        assert_eq!(plan.ingress.backend, "api-r7");
    }

    #[test]
    fn caller_env_wins_over_injected_port() {
        let (service, release, environment, deployment) = fixture(Strategy::Rolling);
        let env = BTreeMap::from([("PORT".to_string(), "9999".to_string())]);
        let plan = plan(&service, &release, &environment, &deployment, env).unwrap();
        assert_eq!(plan.workload.env.get("PORT").unwrap(), "9999");
    }

    #[test]
    fn unbuilt_release_cannot_be_planned() {
        let (service, mut release, environment, deployment) = fixture(Strategy::Rolling);
        release.image_uri = None;
        let err = plan(
            &service,
            &release,
            &environment,
            &deployment,
            BTreeMap::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeployFailed);
    }

    #[test]
    fn plan_labels_identify_the_deployment() {
        let (service, release, environment, deployment) = fixture(Strategy::Rolling);
        let plan = plan(
            &service,
            &release,
            &environment,
            &deployment,
            BTreeMap::new(),
        )
        .unwrap();

        assert_eq!(
            plan.workload.labels.get(labels::DEPLOYMENT).unwrap(),
            &deployment.id.to_string()
        );
        assert_eq!(
            plan.selector.get(labels::SERVICE).unwrap(),
            &service.id.to_string()
        );
    }
}
