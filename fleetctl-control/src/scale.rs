//! Scale Orchestrator (C9): grow or shrink an existing deployment's node set.
//!
//! Scale-up delegates to [`crate::deploy::DeployOrchestrator`]'s scale-up
//! path (same image, no upload, START_NEW only on new nodes). Scale-down is
//! implemented directly here: LIFO removal, nginx/DNS reconciled on the
//! nodes that remain.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::deploy::{DeployConfig, DeployOrchestrator, DeployRequest, NewNodesSpec};
use crate::error::{ControlPlaneError, Result};
use crate::events::EventSink;
use crate::lock::LockRegistry;
use crate::node_agent::NodeAgentClientPool;
use crate::repository::Repository;

pub struct ScaleRequest {
    pub tenant_id: String,
    pub project_id: String,
    pub service_id: String,
    pub env: String,
    pub target_count: u32,
    pub region: String,
    pub size: String,
    pub snapshot_id: Option<String>,
    pub triggered_by: String,
}

pub struct ScaleOrchestrator {
    repo: Arc<dyn Repository>,
    locks: Arc<LockRegistry>,
    agents: Arc<NodeAgentClientPool>,
    dns: Arc<dyn crate::dns::DnsClient>,
    deploy: Arc<DeployOrchestrator>,
    config: DeployConfig,
}

impl ScaleOrchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        locks: Arc<LockRegistry>,
        agents: Arc<NodeAgentClientPool>,
        dns: Arc<dyn crate::dns::DnsClient>,
        deploy: Arc<DeployOrchestrator>,
        config: DeployConfig,
    ) -> Self {
        Self { repo, locks, agents, dns, deploy, config }
    }

    pub async fn scale(&self, req: ScaleRequest, sink: EventSink) -> Result<()> {
        match timeout(self.config.scale_deadline, self.run(req, &sink)).await {
            Ok(result) => result,
            Err(_) => {
                sink.error("operation deadline exceeded");
                sink.complete(false, "", Some("deadline exceeded".to_string()));
                Err(ControlPlaneError::DeadlineExceeded)
            }
        }
    }

    async fn run(&self, req: ScaleRequest, sink: &EventSink) -> Result<()> {
        let current = self
            .repo
            .get_latest_success(&req.service_id, &req.env)
            .await?
            .ok_or_else(|| ControlPlaneError::Validation("no successful deployment to scale".to_string()))?;

        let current_count = current.node_ids.len() as u32;
        if req.target_count == current_count {
            sink.info("target count equals current count, no-op");
            sink.complete(true, current.id.clone(), None);
            return Ok(());
        }

        if req.target_count > current_count {
            sink.info(format!("scaling up from {current_count} to {}", req.target_count));
            let deploy_req = DeployRequest {
                tenant_id: req.tenant_id.clone(),
                project_id: req.project_id.clone(),
                service_id: req.service_id.clone(),
                env: req.env.clone(),
                image_blob: None,
                image_name: Some(current.image_name.clone()),
                env_variables: current.env_variables.iter().map(|(k, v)| format!("{k}={v}")).collect(),
                existing_node_ids: current.node_ids.clone(),
                new_nodes: Some(NewNodesSpec {
                    count: req.target_count - current_count,
                    region: req.region.clone(),
                    size: req.size.clone(),
                    snapshot_id: req.snapshot_id.clone(),
                }),
                triggered_by: req.triggered_by.clone(),
                is_scale_up: true,
            };
            self.deploy.deploy(deploy_req, sink.clone()).await?;
            return Ok(());
        }

        self.scale_down(&req, &current, sink).await
    }

    async fn scale_down(&self, req: &ScaleRequest, current: &crate::model::Deployment, sink: &EventSink) -> Result<()> {
        let target = req.target_count as usize;
        sink.info(format!("scaling down from {} to {}", current.node_ids.len(), target));

        let Some(lock) = self.locks.acquire(&req.service_id, &req.env, self.config.scale_deadline).await else {
            let msg = format!("deploy already in progress for {}/{}", req.service_id, req.env);
            sink.error(&msg);
            sink.complete(false, current.id.clone(), Some(msg.clone()));
            return Err(ControlPlaneError::LockBusy { service_id: req.service_id.clone(), env: req.env.clone() });
        };

        let result = self.scale_down_locked(req, current, target, sink).await;
        self.locks.release(&req.service_id, &req.env, &lock.lock_id).await;
        result
    }

    async fn scale_down_locked(
        &self,
        req: &ScaleRequest,
        current: &crate::model::Deployment,
        target: usize,
        sink: &EventSink,
    ) -> Result<()> {
        let keep_ids: Vec<String> = current.node_ids[..target].to_vec();
        let remove_ids: Vec<String> = current.node_ids[target..].to_vec();

        for node_id in &remove_ids {
            let client = self.agents.client_for(node_id).await;
            if let Err(err) = client.remove_container(&current.container_name, true, self.config.drain_timeout_secs).await {
                sink.warn(format!("remove container on {node_id} failed: {err}"));
            }
            let _ = self.repo.delete_container_by(node_id, &current.container_name).await;
        }

        let mut updated = current.clone();
        updated.node_ids = keep_ids.clone();
        let updated = self.repo.update_deployment(updated).await?;

        let service = self.repo.get_service(&req.service_id).await?;
        if service.service_type.is_webservice() {
            let mut kept_nodes = Vec::with_capacity(keep_ids.len());
            for id in &keep_ids {
                kept_nodes.push(self.repo.get_node(id).await?);
            }
            let private_ips: Vec<String> = kept_nodes.iter().map(|n| n.private_ip.clone()).collect();
            let domain = crate::naming::domain(&req.tenant_id, &req.project_id, &service.name, &req.env);
            let host_port = crate::naming::host_port(&req.tenant_id, &req.project_id, &service.name, &req.env, current.version, service.service_type);

            sink.info("reconfiguring nginx on remaining nodes");
            for node in &kept_nodes {
                let client = self.agents.client_for(node.host()).await;
                client.configure_nginx(&private_ips, host_port, &domain).await?;
            }

            sink.info("updating DNS to remaining nodes");
            let public_ips: Vec<String> = kept_nodes.iter().map(|n| n.public_ip.clone()).collect();
            self.dns.setup_multi_server(&domain, &public_ips).await?;
        }

        sink.info("scale down complete");
        sink.complete(true, updated.id.clone(), None);
        Ok(())
    }
}
