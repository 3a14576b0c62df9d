//! Deploy Orchestrator (C8) and Rollback Orchestrator (C11).
//!
//! The state machine from spec §4.8: PLAN -> ALLOCATE_VERSION ->
//! (PROVISION_NODES) -> UPLOAD -> START_NEW -> HEALTH_GATE -> (SWITCH_NGINX +
//! UPDATE_DNS) -> RETIRE_OLD -> PRUNE_IMAGES -> SUCCESS, with PARTIAL_FAILURE
//! transitioning to FAILED from any step after START_NEW. Rollback is folded
//! in here, matching spec.md's description of it as "an ordinary forward
//! deploy of a past image."

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::error::{ControlPlaneError, Result};
use crate::events::EventSink;
use crate::lock::LockRegistry;
use crate::model::{
    Container, ContainerHealthStatus, ContainerStatus, Deployment, DeploymentStatus, Node,
    NodeStatus, ServiceType,
};
use crate::naming;
use crate::node_agent::{HealthState, NodeAgentClientPool, StartContainerRequest};
use crate::repository::{new_pending_deployment, Repository};
use crate::stateful;

/// New nodes to provision before placing containers, or `None` to deploy
/// only onto `existing_node_ids`.
#[derive(Debug, Clone)]
pub struct NewNodesSpec {
    pub count: u32,
    pub region: String,
    pub size: String,
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub tenant_id: String,
    pub project_id: String,
    pub service_id: String,
    pub env: String,
    /// Set for a fresh image upload; mutually exclusive with `image_name`.
    pub image_blob: Option<Vec<u8>>,
    /// Set for scale-up / rollback, where the image already lives on nodes.
    pub image_name: Option<String>,
    pub env_variables: Vec<String>,
    pub existing_node_ids: Vec<String>,
    pub new_nodes: Option<NewNodesSpec>,
    pub triggered_by: String,
    /// Set by the scale orchestrator for a scale-up: START_NEW targets only
    /// the newly provisioned nodes and RETIRE_OLD is skipped. Rollback also
    /// carries `image_name` with no blob, so this can't be inferred from
    /// the image fields alone.
    pub is_scale_up: bool,
}

/// Cloud VM provisioning is an external collaborator (spec §1 Out of scope);
/// this is the narrow contract PROVISION_NODES needs from it.
#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    async fn provision(
        &self,
        workspace_id: &str,
        count: u32,
        region: &str,
        size: &str,
        snapshot_id: Option<&str>,
    ) -> Result<Vec<Node>>;
}

#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub deploy_deadline: Duration,
    pub rollback_deadline: Duration,
    pub scale_deadline: Duration,
    pub upload_concurrency: usize,
    pub node_probe_concurrency: usize,
    pub health_gate_attempts: u32,
    pub health_gate_interval: Duration,
    pub node_agent_timeout: Duration,
    pub drain_timeout_secs: u32,
    pub prune_keep_latest: u32,
    pub provision_wait: Duration,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            deploy_deadline: Duration::from_secs(30 * 60),
            rollback_deadline: Duration::from_secs(10 * 60),
            scale_deadline: Duration::from_secs(10 * 60),
            upload_concurrency: 4,
            node_probe_concurrency: 8,
            health_gate_attempts: 10,
            health_gate_interval: Duration::from_secs(2),
            node_agent_timeout: Duration::from_secs(10),
            drain_timeout_secs: 30,
            prune_keep_latest: 100,
            provision_wait: Duration::from_secs(60),
        }
    }
}

pub struct DeployOrchestrator {
    repo: Arc<dyn Repository>,
    locks: Arc<LockRegistry>,
    agents: Arc<NodeAgentClientPool>,
    dns: Arc<dyn crate::dns::DnsClient>,
    provisioner: Arc<dyn NodeProvisioner>,
    config: DeployConfig,
}

/// Runs `items` through `f` with at most `concurrency` in flight at once,
/// pairing each input with its result so partial failures stay attributable
/// (spec §9, "collect per-node results as (node_id, Result) pairs").
async fn run_bounded<T, F, Fut, O>(items: Vec<T>, concurrency: usize, f: F) -> Vec<(T, O)>
where
    T: Clone + Send + 'static,
    F: Fn(T) -> Fut,
    Fut: std::future::Future<Output = O> + Send,
    O: Send,
{
    stream::iter(items)
        .map(|item| {
            let fut = f(item.clone());
            async move { (item, fut.await) }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

impl DeployOrchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        locks: Arc<LockRegistry>,
        agents: Arc<NodeAgentClientPool>,
        dns: Arc<dyn crate::dns::DnsClient>,
        provisioner: Arc<dyn NodeProvisioner>,
        config: DeployConfig,
    ) -> Self {
        Self { repo, locks, agents, dns, provisioner, config }
    }

    pub async fn deploy(&self, req: DeployRequest, sink: EventSink) -> Result<Deployment> {
        match timeout(self.config.deploy_deadline, self.run(req, &sink)).await {
            Ok(result) => result,
            Err(_) => {
                sink.error("operation deadline exceeded");
                sink.complete(false, "", Some("deadline exceeded".to_string()));
                Err(ControlPlaneError::DeadlineExceeded)
            }
        }
    }

    /// Rollback (C11): re-deploys the previous successful image as a new
    /// version. Spec §4.8: "always allocate a new version with
    /// `is_rollback=true`".
    pub async fn rollback(&self, service_id: &str, env: &str, triggered_by: &str, sink: EventSink) -> Result<Deployment> {
        let current = self.repo.get_latest_success(service_id, env).await?;
        let current_version = current.as_ref().map(|d| d.version).unwrap_or(0);
        let previous = self.repo.get_previous_success(service_id, env, current_version).await?;

        let Some(previous) = previous else {
            sink.error("no previous successful deployment to roll back to");
            sink.complete(false, "", Some("no prior deployment".to_string()));
            return Err(ControlPlaneError::Validation("no previous successful deployment".to_string()));
        };

        let service = self.repo.get_service(service_id).await?;
        let project = self.repo.get_project(&service.project_id).await?;

        let req = DeployRequest {
            tenant_id: project.workspace_id.clone(),
            project_id: service.project_id.clone(),
            service_id: service_id.to_string(),
            env: env.to_string(),
            image_blob: None,
            image_name: Some(previous.image_name.clone()),
            env_variables: previous.env_variables.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            existing_node_ids: previous.node_ids.clone(),
            new_nodes: None,
            triggered_by: triggered_by.to_string(),
            is_scale_up: false,
        };

        match timeout(self.config.rollback_deadline, self.run_with_rollback_flag(req, &sink, true)).await {
            Ok(result) => result,
            Err(_) => {
                sink.error("operation deadline exceeded");
                sink.complete(false, "", Some("deadline exceeded".to_string()));
                Err(ControlPlaneError::DeadlineExceeded)
            }
        }
    }

    async fn run(&self, req: DeployRequest, sink: &EventSink) -> Result<Deployment> {
        self.run_with_rollback_flag(req, sink, false).await
    }

    async fn run_with_rollback_flag(&self, req: DeployRequest, sink: &EventSink, is_rollback: bool) -> Result<Deployment> {
        // --- Preconditions ---
        if req.existing_node_ids.is_empty() && req.new_nodes.as_ref().map(|n| n.count).unwrap_or(0) == 0 {
            let msg = "deploy requires at least one existing or newly provisioned node";
            sink.error(msg);
            sink.complete(false, "", Some(msg.to_string()));
            return Err(ControlPlaneError::Validation(msg.to_string()));
        }

        let service = self.repo.get_service(&req.service_id).await?;
        if service.is_deleted() {
            let msg = format!("service {} is deleted", req.service_id);
            sink.error(&msg);
            sink.complete(false, "", Some(msg.clone()));
            return Err(ControlPlaneError::Validation(msg));
        }

        let lock_ttl = self.config.deploy_deadline;
        let Some(lock) = self.locks.acquire(&req.service_id, &req.env, lock_ttl).await else {
            let msg = format!("deploy already in progress for {}/{}", req.service_id, req.env);
            sink.error(&msg);
            sink.complete(false, "", Some(msg.clone()));
            return Err(ControlPlaneError::LockBusy { service_id: req.service_id.clone(), env: req.env.clone() });
        };

        let outcome = self.run_locked(&req, sink, is_rollback).await;
        self.locks.release(&req.service_id, &req.env, &lock.lock_id).await;
        outcome
    }

    async fn run_locked(&self, req: &DeployRequest, sink: &EventSink, is_rollback: bool) -> Result<Deployment> {
        let service = self.repo.get_service(&req.service_id).await?;
        let is_scale_up = req.is_scale_up;

        // --- PLAN ---
        sink.info(format!("planning deploy for {}/{}", service.name, req.env));
        let previous_success = self.repo.get_latest_success(&req.service_id, &req.env).await?;

        // --- ALLOCATE_VERSION ---
        // Scale-up reuses the current deployment's version rather than
        // allocating a new one: RETIRE_OLD is skipped and the surviving
        // nodes' containers keep running under their existing host_port
        // (naming::host_port folds the version into the hash for stateless
        // services), so a fresh version here would point nginx at a port
        // those containers were never started on.
        let mut deployment = if is_scale_up {
            let Some(current) = previous_success.clone() else {
                let msg = "scale-up requires an existing successful deployment".to_string();
                sink.error(&msg);
                sink.complete(false, "", Some(msg.clone()));
                return Err(ControlPlaneError::Validation(msg));
            };
            sink.info(format!("reusing version {} for scale-up", current.version));
            let mut current = current;
            current.status = DeploymentStatus::InProgress;
            self.repo.update_deployment(current).await?
        } else {
            let version = self.repo.next_version(&req.service_id, &req.env).await?;
            let mut deployment = new_pending_deployment(&req.service_id, &req.env, version, &req.triggered_by);
            deployment.is_rollback = is_rollback;
            deployment.status = DeploymentStatus::InProgress;
            sink.info(format!("allocated version {version}"));
            self.repo.create_deployment(deployment).await?
        };

        match self
            .execute_pipeline(req, &service, &mut deployment, previous_success, is_scale_up, sink)
            .await
        {
            Ok(()) => {
                deployment.status = DeploymentStatus::Success;
                deployment.error = None;
                let deployment = self.repo.update_deployment(deployment).await?;
                sink.info("deploy succeeded");
                sink.complete(true, deployment.id.clone(), None);
                Ok(deployment)
            }
            Err(err) => {
                warn!(error = %err, service_id = %req.service_id, env = %req.env, "deploy failed");
                deployment.status = DeploymentStatus::Failed;
                deployment.error = Some(err.to_string());
                deployment.log.push_str(&format!("FAILED: {err}\n"));
                if deployment.log.len() > 8192 {
                    let truncated: String = deployment.log.chars().take(8192).collect();
                    deployment.log = truncated;
                }
                let deployment = self.repo.update_deployment(deployment).await?;
                sink.error(err.to_string());
                sink.complete(false, deployment.id.clone(), Some(err.to_string()));
                Ok(deployment)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_pipeline(
        &self,
        req: &DeployRequest,
        service: &crate::model::Service,
        deployment: &mut Deployment,
        previous_success: Option<Deployment>,
        is_scale_up: bool,
        sink: &EventSink,
    ) -> Result<()> {
        let domain = naming::domain(&req.tenant_id, &req.project_id, &service.name, &req.env);
        let container_name = naming::container_name(&req.tenant_id, &req.project_id, &service.name, &req.env, deployment.version);
        let image_name = match (&req.image_blob, &req.image_name) {
            (_, Some(name)) => name.clone(),
            (Some(_), None) => naming::image_name(&req.tenant_id, &req.project_id, &service.name, &req.env, deployment.version),
            (None, None) => return Err(ControlPlaneError::Validation("either image_blob or image_name is required".to_string())),
        };
        let image_base = naming::image_base_name(&req.tenant_id, &req.project_id, &service.name, &req.env);
        let container_port = naming::container_port(service.service_type);
        let host_port = naming::host_port(&req.tenant_id, &req.project_id, &service.name, &req.env, deployment.version, service.service_type);

        let mut env_map = naming::parse_env_variables(&req.env_variables);
        let (injected, warnings) = stateful::inject_stateful_env(self.repo.as_ref(), &req.project_id, &req.env, None).await?;
        for warning in &warnings {
            sink.warn(warning.clone());
        }
        // Injected wiring wins on conflict so user input can't accidentally
        // shadow a sibling stateful service's URL.
        for (k, v) in injected {
            env_map.insert(k, v);
        }

        deployment.image_name = image_name.clone();
        deployment.container_name = container_name.clone();
        deployment.env_variables = env_map.clone();

        // --- PROVISION_NODES ---
        let mut target_nodes: Vec<Node> = Vec::new();
        for id in &req.existing_node_ids {
            target_nodes.push(self.repo.get_node(id).await?);
        }
        let new_node_count = if let Some(spec) = &req.new_nodes {
            sink.info(format!("provisioning {} node(s)", spec.count));
            let project = self.repo.get_project(&req.project_id).await?;
            let provisioned = timeout(
                self.config.provision_wait,
                self.provisioner.provision(&project.workspace_id, spec.count, &spec.region, &spec.size, spec.snapshot_id.as_deref()),
            )
            .await
            .map_err(|_| ControlPlaneError::ProviderError("node provisioning timed out".to_string()))??;
            let count = provisioned.len();
            target_nodes.extend(provisioned);
            count
        } else {
            0
        };

        deployment.node_ids = target_nodes.iter().map(|n| n.id.clone()).collect();
        *deployment = self.repo.update_deployment(deployment.clone()).await?;

        // On scale-up, START_NEW only targets the newly provisioned nodes.
        let start_nodes: Vec<Node> = if is_scale_up {
            target_nodes[target_nodes.len() - new_node_count..].to_vec()
        } else {
            target_nodes.clone()
        };

        // --- UPLOAD ---
        if let Some(blob) = &req.image_blob {
            sink.info(format!("uploading image to {} node(s)", target_nodes.len()));
            let blob = Arc::new(blob.clone());
            let image_name = image_name.clone();
            let results = run_bounded(target_nodes.clone(), self.config.upload_concurrency, {
                let agents = self.agents.clone();
                let blob = blob.clone();
                let image_name = image_name.clone();
                move |node: Node| {
                    let agents = agents.clone();
                    let blob = blob.clone();
                    let image_name = image_name.clone();
                    async move {
                        let client = agents.client_for(node.host()).await;
                        client.upload_image((*blob).clone(), &image_name).await
                    }
                }
            })
            .await;

            for (node, result) in results {
                if let Err(err) = result {
                    return Err(ControlPlaneError::ProviderError(format!("upload to {} failed: {err}", node.id)));
                }
            }
        }

        // --- stateful stop-before-start (free the version-stable port) ---
        if service.service_type.is_stateful() {
            if let Some(previous) = &previous_success {
                for node in &start_nodes {
                    if previous.node_ids.contains(&node.id) {
                        let client = self.agents.client_for(node.host()).await;
                        if let Err(err) = client.remove_container(&previous.container_name, false, 0).await {
                            sink.warn(format!("best-effort stop of previous container on {} failed: {err}", node.id));
                        }
                    }
                }
            }
        }

        // --- START_NEW ---
        sink.info(format!("starting containers on {} node(s)", start_nodes.len()));
        let env_list: Vec<String> = env_map.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let volumes = vec!["/data:/app/data".to_string()];
        let results = run_bounded(start_nodes.clone(), self.config.node_probe_concurrency, {
            let agents = self.agents.clone();
            let container_name = container_name.clone();
            let image_name = image_name.clone();
            let env_list = env_list.clone();
            let volumes = volumes.clone();
            move |node: Node| {
                let agents = agents.clone();
                let container_name = container_name.clone();
                let image_name = image_name.clone();
                let env_list = env_list.clone();
                let volumes = volumes.clone();
                async move {
                    let client = agents.client_for(node.host()).await;
                    client
                        .start_container(StartContainerRequest {
                            name: &container_name,
                            image: &image_name,
                            env: &env_list,
                            container_port,
                            host_port,
                            volumes: &volumes,
                        })
                        .await
                }
            }
        })
        .await;

        for (node, result) in &results {
            let container = Container {
                container_name: container_name.clone(),
                node_id: node.id.clone(),
                deployment_id: deployment.id.clone(),
                status: if result.is_ok() { ContainerStatus::Pending } else { ContainerStatus::Failed },
                health_status: ContainerHealthStatus::Unknown,
                failure_count: 0,
                last_failure_reason: result.as_ref().err().map(|e| e.to_string()),
                last_failure_at: None,
                last_healthy_at: None,
                last_restart_at: None,
            };
            self.repo.upsert_container(container).await?;
        }
        for (node, result) in &results {
            if let Err(err) = result {
                return Err(ControlPlaneError::ProviderError(format!("start_container on {} failed: {err}", node.id)));
            }
        }

        // --- HEALTH_GATE ---
        sink.info("waiting for health gate");
        let http_path = if service.service_type.is_webservice() { Some("/health") } else { None };
        let gate_results = run_bounded(start_nodes.clone(), self.config.node_probe_concurrency, {
            let agents = self.agents.clone();
            let container_name = container_name.clone();
            let attempts = self.config.health_gate_attempts;
            let interval = self.config.health_gate_interval;
            let probe_timeout = self.config.node_agent_timeout;
            move |node: Node| {
                let agents = agents.clone();
                let container_name = container_name.clone();
                async move {
                    let client = agents.client_for(node.host()).await;
                    for attempt in 0..attempts {
                        if attempt > 0 {
                            tokio::time::sleep(interval).await;
                        }
                        if let Ok(resp) = client.health(&container_name, container_port, http_path, probe_timeout).await {
                            if resp.status == HealthState::Healthy {
                                return Ok(());
                            }
                        }
                    }
                    Err(ControlPlaneError::HealthGateTimeout { node_id: node.id.clone(), container_name: container_name.clone() })
                }
            }
        })
        .await;

        let mut gate_failed = false;
        for (node, result) in &gate_results {
            match result {
                Ok(()) => {
                    if let Ok(mut container) = self.get_container(&node.id, &container_name).await {
                        container.status = ContainerStatus::Running;
                        container.health_status = ContainerHealthStatus::Healthy;
                        container.last_healthy_at = Some(chrono::Utc::now());
                        self.repo.upsert_container(container).await?;
                    }
                }
                Err(_) => gate_failed = true,
            }
        }
        if gate_failed {
            let failing: Vec<String> = gate_results.iter().filter(|(_, r)| r.is_err()).map(|(n, _)| n.id.clone()).collect();
            return Err(ControlPlaneError::HealthGateTimeout { node_id: failing.join(","), container_name: container_name.clone() });
        }
        sink.info("health gate passed");

        // --- SWITCH_NGINX + UPDATE_DNS (webservice only) ---
        if service.service_type.is_webservice() {
            let private_ips: Vec<String> = target_nodes.iter().map(|n| n.private_ip.clone()).collect();
            sink.info("reconfiguring nginx");
            let results = run_bounded(target_nodes.clone(), self.config.node_probe_concurrency, {
                let agents = self.agents.clone();
                let private_ips = private_ips.clone();
                let domain = domain.clone();
                move |node: Node| {
                    let agents = agents.clone();
                    let private_ips = private_ips.clone();
                    let domain = domain.clone();
                    async move {
                        let client = agents.client_for(node.host()).await;
                        client.configure_nginx(&private_ips, host_port, &domain).await
                    }
                }
            })
            .await;
            for (node, result) in results {
                if let Err(err) = result {
                    return Err(ControlPlaneError::ProviderError(format!("configure_nginx on {} failed: {err}", node.id)));
                }
            }

            sink.info("updating DNS");
            let public_ips: Vec<String> = target_nodes.iter().map(|n| n.public_ip.clone()).collect();
            self.dns.setup_multi_server(&domain, &public_ips).await?;
        }

        // --- RETIRE_OLD ---
        if !is_scale_up {
            if let Some(previous) = &previous_success {
                let target_ids: std::collections::HashSet<&String> = target_nodes.iter().map(|n| &n.id).collect();
                let stale: Vec<String> = previous
                    .node_ids
                    .iter()
                    .filter(|id| !target_ids.contains(id) || previous.container_name != container_name)
                    .cloned()
                    .collect();
                if !stale.is_empty() {
                    sink.info(format!("retiring {} old container(s)", stale.len()));
                }
                for node_id in stale {
                    let client = self.agents.client_for(&node_id).await;
                    if let Err(err) = client.remove_container(&previous.container_name, true, self.config.drain_timeout_secs).await {
                        sink.warn(format!("retire old container on {node_id} failed: {err}"));
                    }
                    let _ = self.repo.delete_container_by(&node_id, &previous.container_name).await;
                }
            }
        }

        // --- PRUNE_IMAGES ---
        sink.info("pruning old image versions");
        let prune_results = run_bounded(target_nodes.clone(), self.config.upload_concurrency, {
            let agents = self.agents.clone();
            let image_base = image_base.clone();
            let keep = self.config.prune_keep_latest;
            move |node: Node| {
                let agents = agents.clone();
                let image_base = image_base.clone();
                async move {
                    let client = agents.client_for(node.host()).await;
                    client.cleanup_images(&image_base, keep).await
                }
            }
        })
        .await;
        for (node, result) in prune_results {
            if let Err(err) = result {
                sink.warn(format!("prune images on {} failed: {err}", node.id));
            }
        }

        info!(service_id = %req.service_id, env = %req.env, version = deployment.version, "deploy pipeline complete");
        Ok(())
    }

    async fn get_container(&self, node_id: &str, container_name: &str) -> Result<Container> {
        self.repo
            .list_containers_for_node(node_id)
            .await?
            .into_iter()
            .find(|c| c.container_name == container_name)
            .ok_or_else(|| ControlPlaneError::no_such("container", container_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::DnsClient;
    use crate::model::{NodeHealthStatus, Project, Service};
    use crate::repository::InMemoryRepository;

    struct NoopProvisioner;

    #[async_trait]
    impl NodeProvisioner for NoopProvisioner {
        async fn provision(&self, _workspace_id: &str, _count: u32, _region: &str, _size: &str, _snapshot_id: Option<&str>) -> Result<Vec<Node>> {
            Ok(Vec::new())
        }
    }

    struct NoopDns;

    #[async_trait]
    impl DnsClient for NoopDns {
        async fn setup_multi_server(&self, _domain: &str, _ips: &[String]) -> Result<()> {
            Ok(())
        }
        async fn remove_domain(&self, _domain: &str) -> Result<()> {
            Ok(())
        }
    }

    fn make_node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            workspace_id: "w1".to_string(),
            provider_id: "p1".to_string(),
            public_ip: format!("1.1.1.{id}", id = &id[1..]),
            private_ip: format!("10.0.0.{id}", id = &id[1..]),
            region: "lon1".to_string(),
            size: "s-1vcpu".to_string(),
            vpc_id: "vpc1".to_string(),
            snapshot_id: None,
            status: NodeStatus::Active,
            health_status: NodeHealthStatus::Healthy,
            failure_count: 0,
            problematic_reason: None,
            flagged_at: None,
            last_reboot_at: None,
            deleted_at: None,
        }
    }

    fn make_orchestrator(repo: Arc<InMemoryRepository>) -> DeployOrchestrator {
        DeployOrchestrator::new(
            repo,
            Arc::new(LockRegistry::new()),
            Arc::new(NodeAgentClientPool::new("token", 9999, Duration::from_secs(5))),
            Arc::new(NoopDns),
            Arc::new(NoopProvisioner),
            DeployConfig { health_gate_attempts: 1, health_gate_interval: Duration::from_millis(1), ..Default::default() },
        )
    }

    #[tokio::test]
    async fn rejects_deploy_with_no_target_nodes() {
        let repo = Arc::new(InMemoryRepository::new());
        let orch = make_orchestrator(repo);
        let req = DeployRequest {
            tenant_id: "tenant".to_string(),
            project_id: "proj".to_string(),
            service_id: "svc".to_string(),
            env: "prod".to_string(),
            image_blob: Some(vec![1, 2, 3]),
            image_name: None,
            env_variables: vec![],
            existing_node_ids: vec![],
            new_nodes: None,
            triggered_by: "test".to_string(),
            is_scale_up: false,
        };
        let (sink, _rx) = EventSink::channel();
        let result = orch.deploy(req, sink).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn second_deploy_for_same_service_env_is_lock_busy() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_node(make_node("n1"));
        repo.seed_service(Service { id: "svc".to_string(), project_id: "proj".to_string(), name: "svc".to_string(), service_type: ServiceType::Worker, deleted_at: None });
        let orch = make_orchestrator(repo.clone());

        let lock = orch.locks.acquire("svc", "prod", Duration::from_secs(60)).await.unwrap();

        let req = DeployRequest {
            tenant_id: "tenant".to_string(),
            project_id: "proj".to_string(),
            service_id: "svc".to_string(),
            env: "prod".to_string(),
            image_blob: Some(vec![1]),
            image_name: None,
            env_variables: vec![],
            existing_node_ids: vec!["n1".to_string()],
            new_nodes: None,
            triggered_by: "test".to_string(),
            is_scale_up: false,
        };
        let (sink, _rx) = EventSink::channel();
        let result = orch.deploy(req, sink).await;
        assert!(matches!(result, Err(ControlPlaneError::LockBusy { .. })));

        orch.locks.release("svc", "prod", &lock.lock_id).await;
    }

    #[tokio::test]
    async fn rollback_without_prior_success_is_rejected() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_project(Project { id: "proj".to_string(), workspace_id: "w1".to_string(), name: "p".to_string(), deleted_at: None });
        repo.seed_service(Service { id: "svc".to_string(), project_id: "proj".to_string(), name: "svc".to_string(), service_type: ServiceType::Worker, deleted_at: None });
        let orch = make_orchestrator(repo);
        let (sink, _rx) = EventSink::channel();
        let result = orch.rollback("svc", "prod", "test", sink).await;
        assert!(result.is_err());
    }

    fn make_node_at(id: &str, host: &str) -> Node {
        let mut node = make_node(id);
        node.public_ip = host.to_string();
        node.private_ip = host.to_string();
        node
    }

    #[tokio::test]
    async fn full_pipeline_deploy_with_fresh_image_reaches_success() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_project(Project { id: "proj".to_string(), workspace_id: "tenant".to_string(), name: "p".to_string(), deleted_at: None });
        repo.seed_service(Service { id: "svc".to_string(), project_id: "proj".to_string(), name: "svc".to_string(), service_type: ServiceType::Webservice, deleted_at: None });

        let mut server = mockito::Server::new_async().await;
        let host = server.host_with_port();
        let (ip, port_str) = host.split_once(':').unwrap();
        let port: u16 = port_str.parse().unwrap();
        repo.seed_node(make_node_at("n1", ip));

        let upload_mock = server
            .mock("POST", mockito::Matcher::Regex("/images/.*/upload".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;
        let start_mock = server
            .mock("POST", "/containers/run")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"container_id":"c1"}"#)
            .create_async()
            .await;
        let health_mock = server
            .mock("GET", mockito::Matcher::Regex("/containers/.*/health".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"healthy","reason":null}"#)
            .create_async()
            .await;
        let nginx_mock = server
            .mock("POST", "/nginx/configure")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;
        let cleanup_mock = server
            .mock("POST", "/images/cleanup")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"removed":0}"#)
            .create_async()
            .await;

        let orch = DeployOrchestrator::new(
            repo.clone(),
            Arc::new(LockRegistry::new()),
            Arc::new(NodeAgentClientPool::new("token", port, Duration::from_secs(5))),
            Arc::new(NoopDns),
            Arc::new(NoopProvisioner),
            DeployConfig { health_gate_attempts: 1, health_gate_interval: Duration::from_millis(1), ..Default::default() },
        );

        let req = DeployRequest {
            tenant_id: "tenant".to_string(),
            project_id: "proj".to_string(),
            service_id: "svc".to_string(),
            env: "prod".to_string(),
            image_blob: Some(vec![1, 2, 3]),
            image_name: None,
            env_variables: vec![],
            existing_node_ids: vec!["n1".to_string()],
            new_nodes: None,
            triggered_by: "test".to_string(),
            is_scale_up: false,
        };
        let (sink, _rx) = EventSink::channel();
        let deployment = orch.deploy(req, sink).await.unwrap();

        assert_eq!(deployment.status, DeploymentStatus::Success);
        assert_eq!(deployment.version, 1);
        assert_eq!(deployment.node_ids, vec!["n1".to_string()]);

        upload_mock.assert_async().await;
        start_mock.assert_async().await;
        health_mock.assert_async().await;
        nginx_mock.assert_async().await;
        cleanup_mock.assert_async().await;
    }
}
