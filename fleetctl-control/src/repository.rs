//! Repository facade (C3): a narrow, typed read/write port over the entity
//! store. The real persistence layer (CRUD on projects/services/deployments/
//! nodes/containers/snapshots) is out of scope — this trait is the entire
//! contract the orchestrators depend on, plus an in-memory implementation
//! used by this crate's own tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{ControlPlaneError, Result};
use crate::model::{
    new_id, Container, Deployment, DeploymentStatus, Node, Project, Service, Snapshot,
};

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_service(&self, service_id: &str) -> Result<Service>;
    async fn get_project(&self, project_id: &str) -> Result<Project>;
    async fn get_node(&self, node_id: &str) -> Result<Node>;
    async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment>;
    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot>;

    async fn list_services_for_project(&self, project_id: &str) -> Result<Vec<Service>>;
    async fn list_nodes_for_deployment(&self, deployment: &Deployment) -> Result<Vec<Node>>;
    async fn list_containers_for_deployment(&self, deployment_id: &str) -> Result<Vec<Container>>;
    async fn list_containers_for_node(&self, node_id: &str) -> Result<Vec<Container>>;

    /// Allocates the next monotonic version for `(service_id, env)`. Callers
    /// must hold the deploy lock for that pair; this method is only
    /// contended under it.
    async fn next_version(&self, service_id: &str, env: &str) -> Result<u64>;

    async fn get_latest_success(&self, service_id: &str, env: &str) -> Result<Option<Deployment>>;
    async fn get_previous_success(&self, service_id: &str, env: &str, before_version: u64) -> Result<Option<Deployment>>;

    async fn create_deployment(&self, deployment: Deployment) -> Result<Deployment>;
    async fn update_deployment(&self, deployment: Deployment) -> Result<Deployment>;

    async fn upsert_container(&self, container: Container) -> Result<Container>;
    async fn delete_container_by(&self, node_id: &str, container_name: &str) -> Result<()>;

    /// Nodes with `status = active` in a workspace — the health monitor's
    /// unit of enumeration.
    async fn list_active_nodes_for_workspace(&self, workspace_id: &str) -> Result<Vec<Node>>;
    async fn list_workspaces_with_active_nodes(&self) -> Result<Vec<String>>;
    async fn update_node(&self, node: Node) -> Result<Node>;
}

/// Test double. Not a real persistence layer: single-process, lost on
/// restart, guarded by a plain `Mutex` since tests don't need more.
#[derive(Default)]
pub struct InMemoryRepository {
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    projects: BTreeMap<String, Project>,
    services: BTreeMap<String, Service>,
    nodes: BTreeMap<String, Node>,
    deployments: BTreeMap<String, Deployment>,
    containers: BTreeMap<(String, String), Container>,
    snapshots: BTreeMap<String, Snapshot>,
    versions: BTreeMap<String, u64>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_project(&self, project: Project) {
        self.inner.lock().unwrap().projects.insert(project.id.clone(), project);
    }

    pub fn seed_service(&self, service: Service) {
        self.inner.lock().unwrap().services.insert(service.id.clone(), service);
    }

    pub fn seed_node(&self, node: Node) {
        self.inner.lock().unwrap().nodes.insert(node.id.clone(), node);
    }

    pub fn seed_snapshot(&self, snapshot: Snapshot) {
        self.inner.lock().unwrap().snapshots.insert(snapshot.id.clone(), snapshot);
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_service(&self, service_id: &str) -> Result<Service> {
        self.inner
            .lock()
            .unwrap()
            .services
            .get(service_id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::no_such("service", service_id))
    }

    async fn get_project(&self, project_id: &str) -> Result<Project> {
        self.inner
            .lock()
            .unwrap()
            .projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::no_such("project", project_id))
    }

    async fn get_node(&self, node_id: &str) -> Result<Node> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::no_such("node", node_id))
    }

    async fn get_deployment(&self, deployment_id: &str) -> Result<Deployment> {
        self.inner
            .lock()
            .unwrap()
            .deployments
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::no_such("deployment", deployment_id))
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::no_such("snapshot", snapshot_id))
    }

    async fn list_services_for_project(&self, project_id: &str) -> Result<Vec<Service>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .services
            .values()
            .filter(|s| s.project_id == project_id && !s.is_deleted())
            .cloned()
            .collect())
    }

    async fn list_nodes_for_deployment(&self, deployment: &Deployment) -> Result<Vec<Node>> {
        let state = self.inner.lock().unwrap();
        Ok(deployment
            .node_ids
            .iter()
            .filter_map(|id| state.nodes.get(id).cloned())
            .collect())
    }

    async fn list_containers_for_deployment(&self, deployment_id: &str) -> Result<Vec<Container>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.deployment_id == deployment_id)
            .cloned()
            .collect())
    }

    async fn list_containers_for_node(&self, node_id: &str) -> Result<Vec<Container>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn next_version(&self, service_id: &str, env: &str) -> Result<u64> {
        let mut state = self.inner.lock().unwrap();
        let key = format!("{service_id}:{env}");
        let next = state.versions.get(&key).copied().unwrap_or(0) + 1;
        state.versions.insert(key, next);
        Ok(next)
    }

    async fn get_latest_success(&self, service_id: &str, env: &str) -> Result<Option<Deployment>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .deployments
            .values()
            .filter(|d| d.service_id == service_id && d.env == env && d.status == DeploymentStatus::Success)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn get_previous_success(&self, service_id: &str, env: &str, before_version: u64) -> Result<Option<Deployment>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .deployments
            .values()
            .filter(|d| {
                d.service_id == service_id
                    && d.env == env
                    && d.status == DeploymentStatus::Success
                    && d.version < before_version
            })
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn create_deployment(&self, mut deployment: Deployment) -> Result<Deployment> {
        if deployment.id.is_empty() {
            deployment.id = new_id();
        }
        self.inner.lock().unwrap().deployments.insert(deployment.id.clone(), deployment.clone());
        Ok(deployment)
    }

    async fn update_deployment(&self, deployment: Deployment) -> Result<Deployment> {
        let mut state = self.inner.lock().unwrap();
        if !state.deployments.contains_key(&deployment.id) {
            return Err(ControlPlaneError::no_such("deployment", deployment.id.clone()));
        }
        state.deployments.insert(deployment.id.clone(), deployment.clone());
        Ok(deployment)
    }

    async fn upsert_container(&self, container: Container) -> Result<Container> {
        let key = (container.node_id.clone(), container.container_name.clone());
        self.inner.lock().unwrap().containers.insert(key, container.clone());
        Ok(container)
    }

    async fn delete_container_by(&self, node_id: &str, container_name: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .remove(&(node_id.to_string(), container_name.to_string()));
        Ok(())
    }

    async fn list_active_nodes_for_workspace(&self, workspace_id: &str) -> Result<Vec<Node>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.workspace_id == workspace_id && n.status == crate::model::NodeStatus::Active && !n.is_deleted())
            .cloned()
            .collect())
    }

    async fn list_workspaces_with_active_nodes(&self) -> Result<Vec<String>> {
        let state = self.inner.lock().unwrap();
        let mut workspaces: Vec<String> = state
            .nodes
            .values()
            .filter(|n| n.status == crate::model::NodeStatus::Active && !n.is_deleted())
            .map(|n| n.workspace_id.clone())
            .collect();
        workspaces.sort();
        workspaces.dedup();
        Ok(workspaces)
    }

    async fn update_node(&self, node: Node) -> Result<Node> {
        let mut state = self.inner.lock().unwrap();
        if !state.nodes.contains_key(&node.id) {
            return Err(ControlPlaneError::no_such("node", node.id.clone()));
        }
        state.nodes.insert(node.id.clone(), node.clone());
        Ok(node)
    }
}

/// Helper for constructing a fresh pending deployment row, used by
/// orchestrators right after `next_version`.
pub fn new_pending_deployment(service_id: &str, env: &str, version: u64, triggered_by: &str) -> Deployment {
    Deployment {
        id: new_id(),
        service_id: service_id.to_string(),
        env: env.to_string(),
        version,
        image_name: String::new(),
        container_name: String::new(),
        env_variables: BTreeMap::new(),
        node_ids: Vec::new(),
        is_rollback: false,
        status: DeploymentStatus::Pending,
        error: None,
        log: String::new(),
        triggered_by: triggered_by.to_string(),
        triggered_at: Utc::now(),
    }
}
