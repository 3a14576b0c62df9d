//! Deployment orchestration engine: naming, locking, node-agent/DNS clients,
//! stateful-dependency injection, deploy/scale/rollback state machines and
//! health monitoring.
//!
//! This crate is the core described in spec §1 — the HTTP API surface,
//! entity persistence, node-agent daemon, cloud provider SDKs, DNS provider
//! and credential encryption are external collaborators the core only talks
//! to through the narrow interfaces in [`repository`], [`node_agent`],
//! [`dns`], and the provisioner/rebooter traits in [`deploy`] and [`health`].

pub mod config;
pub mod deploy;
pub mod dns;
pub mod error;
pub mod events;
pub mod health;
pub mod lock;
pub mod model;
pub mod naming;
pub mod node_agent;
pub mod repository;
pub mod scale;
pub mod stateful;

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::deploy::{DeployConfig, DeployOrchestrator, NodeProvisioner};
use crate::dns::DnsClient;
use crate::health::{HealthMonitor, HealthMonitorConfig, NodeRebooter};
use crate::lock::LockRegistry;
use crate::node_agent::NodeAgentClientPool;
use crate::repository::Repository;
use crate::scale::ScaleOrchestrator;

fn deploy_config_from(cfg: &Config) -> DeployConfig {
    DeployConfig {
        deploy_deadline: Duration::from_secs(cfg.deploy_deadline_secs),
        rollback_deadline: Duration::from_secs(cfg.rollback_deadline_secs),
        scale_deadline: Duration::from_secs(cfg.scale_deadline_secs),
        upload_concurrency: cfg.upload_concurrency,
        node_probe_concurrency: cfg.health_check_concurrency,
        prune_keep_latest: cfg.prune_keep_latest,
        ..DeployConfig::default()
    }
}

fn health_config_from(cfg: &Config) -> HealthMonitorConfig {
    HealthMonitorConfig {
        check_interval: Duration::from_secs(cfg.health_check_interval_secs),
        cleanup_interval: Duration::from_secs(cfg.health_check_cleanup_interval_secs),
        fan_out_concurrency: cfg.health_check_concurrency,
        ..HealthMonitorConfig::default()
    }
}

/// Wires the whole core together: the single entry point a host application
/// (the `fleetctl` daemon binary, or an embedding HTTP API shell) depends on.
pub struct ControlPlane {
    pub deploy: Arc<DeployOrchestrator>,
    pub scale: Arc<ScaleOrchestrator>,
    pub health: Arc<HealthMonitor>,
    pub locks: Arc<LockRegistry>,
    pub agents: Arc<NodeAgentClientPool>,
}

impl ControlPlane {
    pub fn new(
        cfg: &Config,
        do_token: &str,
        repo: Arc<dyn Repository>,
        dns: Arc<dyn DnsClient>,
        provisioner: Arc<dyn NodeProvisioner>,
        rebooter: Arc<dyn NodeRebooter>,
    ) -> Self {
        let locks = Arc::new(LockRegistry::new());
        let agents = Arc::new(NodeAgentClientPool::new(do_token, cfg.node_agent_port, Duration::from_secs(30)));

        let deploy = Arc::new(DeployOrchestrator::new(
            repo.clone(),
            locks.clone(),
            agents.clone(),
            dns.clone(),
            provisioner,
            deploy_config_from(cfg),
        ));

        let scale = Arc::new(ScaleOrchestrator::new(repo.clone(), locks.clone(), agents.clone(), dns, deploy.clone(), deploy_config_from(cfg)));

        let health = Arc::new(HealthMonitor::new(repo, agents.clone(), rebooter, health_config_from(cfg)));

        Self { deploy, scale, health, locks, agents }
    }
}
