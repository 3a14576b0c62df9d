//! Stateful-dependency injection (C6): compute connection URLs for sibling
//! stateful services and inject them into a stateless deploy's environment.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::model::ServiceType;
use crate::naming::{build_url, container_port, env_var_name};
use crate::repository::Repository;

/// For every stateful sibling service in `project_id` with a successful
/// deployment in `env`, computes `(VAR, URL)` and collects any dependency
/// that couldn't be resolved as a warning. Warnings never fail the deploy
/// (spec §4.6) — they're surfaced in the SSE log only.
pub async fn inject_stateful_env(
    repo: &dyn Repository,
    project_id: &str,
    env: &str,
    target_node_id: Option<&str>,
) -> Result<(BTreeMap<String, String>, Vec<String>)> {
    let mut env_map = BTreeMap::new();
    let mut warnings = Vec::new();

    let siblings = repo.list_services_for_project(project_id).await?;

    for svc in siblings.into_iter().filter(|s| s.service_type.is_stateful()) {
        let env_var = env_var_name(svc.service_type, &svc.name);

        let deployment = match repo.get_latest_success(&svc.id, env).await? {
            Some(d) => d,
            None => {
                warnings.push(format!("{} ({}) not deployed - {} not injected", svc.name, svc.service_type.as_str(), env_var));
                continue;
            }
        };

        let Some(node_id) = deployment.node_ids.first() else {
            warnings.push(format!("{} ({}) has no nodes - {} not injected", svc.name, svc.service_type.as_str(), env_var));
            continue;
        };

        let node = match repo.get_node(node_id).await {
            Ok(node) => node,
            Err(_) => {
                warnings.push(format!("{} ({}) node not found - {} not injected", svc.name, svc.service_type.as_str(), env_var));
                continue;
            }
        };

        let host = if target_node_id == Some(node.id.as_str()) {
            "localhost".to_string()
        } else if !node.private_ip.is_empty() {
            node.private_ip.clone()
        } else if !node.public_ip.is_empty() {
            node.public_ip.clone()
        } else {
            "localhost".to_string()
        };

        let port = container_port(svc.service_type);
        let url = build_url(svc.service_type, &host, port, &svc.name);
        env_map.insert(env_var, url);
    }

    Ok((env_map, warnings))
}

pub fn is_stateful(service_type: ServiceType) -> bool {
    service_type.is_stateful()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Deployment, DeploymentStatus, Node, NodeHealthStatus, NodeStatus, Project, Service};
    use crate::repository::InMemoryRepository;
    use chrono::Utc;

    fn node(id: &str, private_ip: &str, public_ip: &str) -> Node {
        Node {
            id: id.to_string(),
            workspace_id: "w1".to_string(),
            provider_id: "p1".to_string(),
            public_ip: public_ip.to_string(),
            private_ip: private_ip.to_string(),
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

    #[tokio::test]
    async fn injects_url_for_successfully_deployed_sibling() {
        let repo = InMemoryRepository::new();
        repo.seed_project(Project { id: "proj".to_string(), workspace_id: "w1".to_string(), name: "p".to_string(), deleted_at: None });
        repo.seed_node(node("n3", "10.0.0.3", "1.1.1.3"));
        repo.seed_service(Service { id: "redis".to_string(), project_id: "proj".to_string(), name: "redis".to_string(), service_type: ServiceType::Redis, deleted_at: None });

        repo.create_deployment(Deployment {
            id: "d1".to_string(),
            service_id: "redis".to_string(),
            env: "prod".to_string(),
            version: 1,
            image_name: "img".to_string(),
            container_name: "c1".to_string(),
            env_variables: Default::default(),
            node_ids: vec!["n3".to_string()],
            is_rollback: false,
            status: DeploymentStatus::Success,
            error: None,
            log: String::new(),
            triggered_by: "test".to_string(),
            triggered_at: Utc::now(),
        })
        .await
        .unwrap();

        let (env_map, warnings) = inject_stateful_env(&repo, "proj", "prod", None).await.unwrap();
        assert!(warnings.is_empty());
        assert_eq!(env_map.get("REDIS_URL").map(String::as_str), Some("redis://10.0.0.3:6379/0"));
    }

    #[tokio::test]
    async fn warns_when_sibling_never_deployed() {
        let repo = InMemoryRepository::new();
        repo.seed_service(Service { id: "redis".to_string(), project_id: "proj".to_string(), name: "redis".to_string(), service_type: ServiceType::Redis, deleted_at: None });

        let (env_map, warnings) = inject_stateful_env(&repo, "proj", "prod", None).await.unwrap();
        assert!(env_map.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("not deployed"));
        assert!(warnings[0].contains("REDIS_URL"));
    }

    #[tokio::test]
    async fn uses_localhost_when_target_node_matches() {
        let repo = InMemoryRepository::new();
        repo.seed_node(node("n3", "10.0.0.3", "1.1.1.3"));
        repo.seed_service(Service { id: "redis".to_string(), project_id: "proj".to_string(), name: "redis".to_string(), service_type: ServiceType::Redis, deleted_at: None });
        repo.create_deployment(Deployment {
            id: "d1".to_string(),
            service_id: "redis".to_string(),
            env: "prod".to_string(),
            version: 1,
            image_name: "img".to_string(),
            container_name: "c1".to_string(),
            env_variables: Default::default(),
            node_ids: vec!["n3".to_string()],
            is_rollback: false,
            status: DeploymentStatus::Success,
            error: None,
            log: String::new(),
            triggered_by: "test".to_string(),
            triggered_at: Utc::now(),
        })
        .await
        .unwrap();

        let (env_map, _) = inject_stateful_env(&repo, "proj", "prod", Some("n3")).await.unwrap();
        assert_eq!(env_map.get("REDIS_URL").map(String::as_str), Some("redis://localhost:6379/0"));
    }
}
