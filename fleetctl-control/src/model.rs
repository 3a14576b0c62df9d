//! Entities the orchestrators read and write through [`crate::repository::Repository`].
//!
//! The repository facade owns serializing `env_variables`/`node_ids` to the
//! opaque JSON columns described in spec §9; everything in this module is
//! the typed, in-memory shape callers actually work with.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    Webservice,
    Worker,
    Schedule,
    Redis,
    Postgres,
    Mysql,
    Mongodb,
}

impl ServiceType {
    pub fn is_stateless(self) -> bool {
        matches!(self, ServiceType::Webservice | ServiceType::Worker | ServiceType::Schedule)
    }

    pub fn is_webservice(self) -> bool {
        matches!(self, ServiceType::Webservice)
    }

    pub fn is_stateful(self) -> bool {
        !self.is_stateless()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Webservice => "webservice",
            ServiceType::Worker => "worker",
            ServiceType::Schedule => "schedule",
            ServiceType::Redis => "redis",
            ServiceType::Postgres => "postgres",
            ServiceType::Mysql => "mysql",
            ServiceType::Mongodb => "mongodb",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub service_type: ServiceType,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Service {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Active,
    Inactive,
    Provisioning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeHealthStatus {
    Healthy,
    Unhealthy,
    Problematic,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub workspace_id: String,
    pub provider_id: String,
    pub public_ip: String,
    pub private_ip: String,
    pub region: String,
    pub size: String,
    pub vpc_id: String,
    pub snapshot_id: Option<String>,
    pub status: NodeStatus,
    pub health_status: NodeHealthStatus,
    pub failure_count: u32,
    pub problematic_reason: Option<String>,
    pub flagged_at: Option<DateTime<Utc>>,
    pub last_reboot_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Node {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn host(&self) -> &str {
        if self.private_ip.is_empty() {
            if self.public_ip.is_empty() { "localhost" } else { &self.public_ip }
        } else {
            &self.private_ip
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub service_id: String,
    pub env: String,
    pub version: u64,
    pub image_name: String,
    pub container_name: String,
    pub env_variables: BTreeMap<String, String>,
    pub node_ids: Vec<String>,
    pub is_rollback: bool,
    pub status: DeploymentStatus,
    pub error: Option<String>,
    pub log: String,
    pub triggered_by: String,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    Pending,
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerHealthStatus {
    Healthy,
    Unhealthy,
    Problematic,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub container_name: String,
    pub node_id: String,
    pub deployment_id: String,
    pub status: ContainerStatus,
    pub health_status: ContainerHealthStatus,
    pub failure_count: u32,
    pub last_failure_reason: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_healthy_at: Option<DateTime<Utc>>,
    pub last_restart_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub workspace_id: String,
    pub region: String,
    pub provider_snapshot_id: String,
    pub is_base: bool,
    pub is_managed: bool,
}

/// Fresh identifier helper, used wherever the repository facade needs to
/// mint an id for a row it creates (`create_deployment`, `upsert_container`).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
