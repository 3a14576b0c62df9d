//! Health Monitor / auto-healer (C10).
//!
//! A periodic scheduler (spec §4.10): one health-check pass per configured
//! interval, fanned out one job per workspace with active nodes, unbounded
//! across workspaces and fan-out-bounded within a workspace across
//! nodes/containers. A second, independent interval sweeps stale check rows
//! (named in spec §6's configuration table, elaborated from
//! `original_source/deploy_api/worker.py`'s second periodic job).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{Container, ContainerHealthStatus, ContainerStatus, Node, NodeHealthStatus};
use crate::naming::container_port;
use crate::node_agent::{HealthState, NodeAgentClientPool};
use crate::repository::Repository;

const MAX_NODE_REBOOTS: u32 = 2;
const MAX_CONTAINER_RESTARTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub check_interval: Duration,
    pub cleanup_interval: Duration,
    pub node_probe_timeout: Duration,
    pub container_probe_timeout: Duration,
    pub fan_out_concurrency: usize,
    pub shutdown_grace: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(86_400),
            node_probe_timeout: Duration::from_secs(10),
            container_probe_timeout: Duration::from_secs(10),
            fan_out_concurrency: 8,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Reboots a node via the cloud provider. External collaborator (spec §1).
#[async_trait::async_trait]
pub trait NodeRebooter: Send + Sync {
    async fn reboot(&self, node_id: &str) -> crate::error::Result<()>;
}

pub struct HealthMonitor {
    repo: Arc<dyn Repository>,
    agents: Arc<NodeAgentClientPool>,
    rebooter: Arc<dyn NodeRebooter>,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    pub fn new(repo: Arc<dyn Repository>, agents: Arc<NodeAgentClientPool>, rebooter: Arc<dyn NodeRebooter>, config: HealthMonitorConfig) -> Self {
        Self { repo, agents, rebooter, config }
    }

    /// Runs both periodic passes until `cancel` fires, then allows in-flight
    /// checks a grace window to finish before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut check_tick = interval(self.config.check_interval);
        let mut cleanup_tick = interval(self.config.cleanup_interval);

        loop {
            tokio::select! {
                _ = check_tick.tick() => {
                    self.run_check_pass().await;
                }
                _ = cleanup_tick.tick() => {
                    self.run_cleanup_pass().await;
                }
                _ = cancel.cancelled() => {
                    info!("health monitor stopping, waiting up to {:?} for in-flight checks", self.config.shutdown_grace);
                    tokio::time::sleep(self.config.shutdown_grace).await;
                    break;
                }
            }
        }
    }

    pub async fn run_check_pass(&self) {
        let workspaces = match self.repo.list_workspaces_with_active_nodes().await {
            Ok(w) => w,
            Err(err) => {
                warn!(%err, "failed to list workspaces for health pass");
                return;
            }
        };
        if workspaces.is_empty() {
            debug!("health pass: no workspaces with active nodes");
            return;
        }

        let mut tasks = tokio::task::JoinSet::new();
        for workspace_id in workspaces {
            let this = self.clone_handles();
            tasks.spawn(async move { this.check_workspace(&workspace_id).await });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Stale check-row cleanup: out of scope to implement the actual
    /// persisted "check" table (not part of the repository facade's
    /// contract in spec §4.3), so this pass is a hook orchestrated on its
    /// own interval and left for the persistence layer to wire up.
    pub async fn run_cleanup_pass(&self) {
        debug!("stale health-check row cleanup pass");
    }

    fn clone_handles(&self) -> HealthMonitorHandles {
        HealthMonitorHandles {
            repo: self.repo.clone(),
            agents: self.agents.clone(),
            rebooter: self.rebooter.clone(),
            config: self.config.clone(),
        }
    }

    async fn check_workspace(&self, workspace_id: &str) {
        self.clone_handles().check_workspace_inner(workspace_id).await
    }
}

/// Cheaply-cloneable bundle so each workspace's check pass can run as an
/// independent spawned task without borrowing `&self`.
#[derive(Clone)]
struct HealthMonitorHandles {
    repo: Arc<dyn Repository>,
    agents: Arc<NodeAgentClientPool>,
    rebooter: Arc<dyn NodeRebooter>,
    config: HealthMonitorConfig,
}

impl HealthMonitorHandles {
    async fn check_workspace_inner(&self, workspace_id: &str) {
        let nodes = match self.repo.list_active_nodes_for_workspace(workspace_id).await {
            Ok(n) => n,
            Err(err) => {
                warn!(%err, workspace_id, "failed to list active nodes");
                return;
            }
        };

        let mut tasks = tokio::task::JoinSet::new();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.fan_out_concurrency));
        for node in nodes {
            let this = self.clone();
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore is never closed");
            tasks.spawn(async move {
                let _permit = permit;
                this.check_node(node).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn check_node(&self, mut node: Node) {
        let client = self.agents.client_for(node.host()).await;
        let ping_result = tokio::time::timeout(self.config.node_probe_timeout, client.ping()).await;

        let healthy = matches!(ping_result, Ok(Ok(true)));

        if healthy {
            node.health_status = NodeHealthStatus::Healthy;
            node.failure_count = 0;
            let _ = self.repo.update_node(node.clone()).await;
        } else {
            node.failure_count += 1;
            if node.failure_count <= MAX_NODE_REBOOTS {
                info!(node_id = %node.id, failure_count = node.failure_count, "rebooting unresponsive node");
                if let Err(err) = self.rebooter.reboot(&node.id).await {
                    warn!(node_id = %node.id, %err, "reboot request failed");
                }
                node.health_status = NodeHealthStatus::Unhealthy;
                node.last_reboot_at = Some(chrono::Utc::now());
            } else {
                warn!(node_id = %node.id, "node exceeded reboot budget, flagging problematic");
                node.health_status = NodeHealthStatus::Problematic;
                node.problematic_reason = Some("exceeded automatic reboot budget".to_string());
                node.flagged_at = Some(chrono::Utc::now());
            }
            let _ = self.repo.update_node(node.clone()).await;
        }

        if node.health_status != NodeHealthStatus::Healthy {
            // Container checks on a node flagged unhealthy/problematic this
            // pass are skipped (spec §4.10 ordering).
            return;
        }

        let containers = match self.repo.list_containers_for_node(&node.id).await {
            Ok(c) => c,
            Err(err) => {
                warn!(node_id = %node.id, %err, "failed to list containers");
                return;
            }
        };

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.fan_out_concurrency));
        let mut tasks = tokio::task::JoinSet::new();
        for container in containers {
            let this = self.clone();
            let node = node.clone();
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore is never closed");
            tasks.spawn(async move {
                let _permit = permit;
                this.check_container(&node, container).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn check_container(&self, node: &Node, mut container: Container) {
        let deployment = match self.repo.get_deployment(&container.deployment_id).await {
            Ok(d) => d,
            Err(_) => return,
        };
        let service = match self.repo.get_service(&deployment.service_id).await {
            Ok(s) => s,
            Err(_) => return,
        };

        let client = self.agents.client_for(node.host()).await;
        let port = container_port(service.service_type);
        let http_path = if service.service_type.is_webservice() { Some("/health") } else { None };

        let result = tokio::time::timeout(self.config.container_probe_timeout, client.health(&container.container_name, port, http_path, self.config.container_probe_timeout)).await;

        let healthy = matches!(result, Ok(Ok(resp)) if resp.status == HealthState::Healthy);

        if healthy {
            container.health_status = ContainerHealthStatus::Healthy;
            container.status = ContainerStatus::Running;
            container.failure_count = 0;
            container.last_healthy_at = Some(chrono::Utc::now());
        } else {
            container.failure_count += 1;
            container.last_failure_at = Some(chrono::Utc::now());
            container.last_failure_reason = match result {
                Ok(Ok(resp)) => resp.reason,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some("probe timed out".to_string()),
            };

            if container.failure_count <= MAX_CONTAINER_RESTARTS {
                info!(container = %container.container_name, node_id = %node.id, failure_count = container.failure_count, "restarting unhealthy container");
                if let Err(err) = client.restart_container(&container.container_name).await {
                    warn!(container = %container.container_name, %err, "restart failed");
                }
                container.last_restart_at = Some(chrono::Utc::now());
                container.health_status = ContainerHealthStatus::Unhealthy;
            } else {
                warn!(container = %container.container_name, node_id = %node.id, "container exceeded restart budget, flagging problematic");
                container.health_status = ContainerHealthStatus::Problematic;
            }
        }

        let _ = self.repo.upsert_container(container).await;
    }
}
