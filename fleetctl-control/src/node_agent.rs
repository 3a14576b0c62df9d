//! HMAC-authenticated HTTP client to the node agent daemon (C4).
//!
//! The node agent itself (container runtime, nginx templating, file I/O on
//! the node) is out of scope; this module only implements the wire contract
//! spec §4.4/§6 describe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::error::{ControlPlaneError, Result};

type HmacSha256 = Hmac<Sha256>;

/// `hex(HMAC-SHA256(do_token, "node-agent:"))`, per spec §6.
pub fn node_agent_api_key(do_token: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(do_token.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(b"node-agent:");
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Clone, Serialize)]
pub struct StartContainerRequest<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub env: &'a [String],
    pub container_port: u16,
    pub host_port: u16,
    pub volumes: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartContainerResponse {
    pub container_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub status: HealthState,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupImagesResponse {
    pub removed: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[allow(dead_code)]
    error: String,
}

/// One HTTP client scoped to a single node.
pub struct NodeAgentClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    per_call_timeout: Duration,
}

impl NodeAgentClient {
    pub fn new(node_ip: &str, port: u16, do_token: &str, per_call_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("http://{node_ip}:{port}"),
            api_key: node_agent_api_key(do_token),
            per_call_timeout,
        }
    }

    fn retry_policy(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        }
    }

    fn is_transient_status(status: reqwest::StatusCode) -> bool {
        status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429
    }

    /// Sends one request, retrying transient failures (connect errors, 5xx,
    /// 408, 429) with bounded exponential backoff. Non-retriable 4xx and
    /// semantic failures surface immediately.
    async fn send<T, F>(&self, build: F) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let operation = || async {
            let response = build()
                .header("X-API-Key", &self.api_key)
                .timeout(self.per_call_timeout)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() || e.is_connect() {
                        backoff::Error::transient(ControlPlaneError::Transient { node_id: self.base_url.clone(), source: e.to_string() })
                    } else {
                        backoff::Error::permanent(ControlPlaneError::ProviderError(e.to_string()))
                    }
                })?;

            let status = response.status();
            if status.is_success() {
                response
                    .json::<T>()
                    .await
                    .map_err(|e| backoff::Error::permanent(ControlPlaneError::ProviderError(e.to_string())))
            } else {
                let body = response.json::<ApiErrorBody>().await.map(|b| b.error).unwrap_or_default();
                let err = ControlPlaneError::ProviderError(format!("{status}: {body}"));
                if Self::is_transient_status(status) {
                    Err(backoff::Error::transient(err))
                } else {
                    Err(backoff::Error::permanent(err))
                }
            }
        };

        backoff::future::retry(self.retry_policy(), operation).await
    }

    pub async fn ping(&self) -> Result<bool> {
        #[derive(Deserialize)]
        struct Pong {
            ok: bool,
        }
        let url = format!("{}/ping", self.base_url);
        let pong: Pong = self.send(|| self.http.get(&url)).await?;
        Ok(pong.ok)
    }

    pub async fn upload_image(&self, blob: Vec<u8>, name: &str) -> Result<()> {
        let url = format!("{}/images/{}/upload", self.base_url, name);
        #[derive(Deserialize)]
        struct Ack {}
        let blob = Arc::new(blob);
        let _: Ack = self
            .send(|| self.http.post(&url).header("Content-Type", "application/octet-stream").body((*blob).clone()))
            .await?;
        Ok(())
    }

    pub async fn start_container(&self, req: StartContainerRequest<'_>) -> Result<StartContainerResponse> {
        let url = format!("{}/containers/run", self.base_url);
        self.send(|| self.http.post(&url).json(&req)).await
    }

    pub async fn remove_container(&self, name: &str, drain: bool, drain_timeout_secs: u32) -> Result<()> {
        let url = format!("{}/containers/{}/remove", self.base_url, name);
        #[derive(Deserialize)]
        struct Ack {}
        let _: Ack = self
            .send(|| self.http.post(&url).query(&[("drain", drain.to_string()), ("drain_timeout", drain_timeout_secs.to_string())]))
            .await?;
        Ok(())
    }

    pub async fn restart_container(&self, name: &str) -> Result<()> {
        let url = format!("{}/containers/{}/restart", self.base_url, name);
        #[derive(Deserialize)]
        struct Ack {}
        let _: Ack = self.send(|| self.http.post(&url)).await?;
        Ok(())
    }

    pub async fn health(&self, name: &str, container_port: u16, http_path: Option<&str>, timeout: Duration) -> Result<HealthResponse> {
        let url = format!("{}/containers/{}/health", self.base_url, name);
        let mut query = vec![("container_port", container_port.to_string()), ("timeout_ms", timeout.as_millis().to_string())];
        if let Some(path) = http_path {
            query.push(("http_path", path.to_string()));
        }
        self.send(|| self.http.get(&url).query(&query)).await
    }

    pub async fn configure_nginx(&self, private_ips: &[String], host_port: u16, domain: &str) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            private_ips: &'a [String],
            host_port: u16,
            domain: &'a str,
        }
        #[derive(Deserialize)]
        struct Ack {}
        let url = format!("{}/nginx/configure", self.base_url);
        let body = Body { private_ips, host_port, domain };
        let _: Ack = self.send(|| self.http.post(&url).json(&body)).await?;
        Ok(())
    }

    pub async fn cleanup_images(&self, prefix: &str, keep_latest: u32) -> Result<u32> {
        let url = format!("{}/images/cleanup", self.base_url);
        let resp: CleanupImagesResponse = self
            .send(|| self.http.post(&url).query(&[("prefix", prefix.to_string()), ("keep_latest", keep_latest.to_string())]))
            .await?;
        Ok(resp.removed)
    }
}

/// One [`NodeAgentClient`] per `(node_ip, port)`, pooled for connection
/// reuse across orchestration steps within a single deploy/scale/rollback.
pub struct NodeAgentClientPool {
    do_token: String,
    port: u16,
    per_call_timeout: Duration,
    clients: Mutex<HashMap<String, Arc<NodeAgentClient>>>,
}

impl NodeAgentClientPool {
    pub fn new(do_token: impl Into<String>, port: u16, per_call_timeout: Duration) -> Self {
        Self { do_token: do_token.into(), port, per_call_timeout, clients: Mutex::new(HashMap::new()) }
    }

    pub async fn client_for(&self, node_ip: &str) -> Arc<NodeAgentClient> {
        let mut clients = self.clients.lock().await;
        clients
            .entry(node_ip.to_string())
            .or_insert_with(|| Arc::new(NodeAgentClient::new(node_ip, self.port, &self.do_token, self.per_call_timeout)))
            .clone()
    }

    /// Drops all pooled clients, releasing their connections.
    pub async fn close(&self) {
        self.clients.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_is_deterministic_hex() {
        let a = node_agent_api_key("secret-token");
        let b = node_agent_api_key("secret-token");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn api_key_differs_per_token() {
        assert_ne!(node_agent_api_key("token-a"), node_agent_api_key("token-b"));
    }

    #[tokio::test]
    async fn ping_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ping")
            .match_header("x-api-key", mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let host = server.host_with_port();
        let (ip, port) = host.split_once(':').unwrap();
        let client = NodeAgentClient::new(ip, port.parse().unwrap(), "token", Duration::from_secs(5));

        let ok = client.ping().await.unwrap();
        assert!(ok);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_retriable_4xx_fails_fast() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/ping")
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":"not found"}"#)
            .create_async()
            .await;

        let host = server.host_with_port();
        let (ip, port) = host.split_once(':').unwrap();
        let client = NodeAgentClient::new(ip, port.parse().unwrap(), "token", Duration::from_secs(5));

        let result = client.ping().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn pool_reuses_client_per_ip() {
        let pool = NodeAgentClientPool::new("token", 9999, Duration::from_secs(5));
        let a = pool.client_for("10.0.0.1").await;
        let b = pool.client_for("10.0.0.1").await;
        assert!(Arc::ptr_eq(&a, &b));

        let c = pool.client_for("10.0.0.2").await;
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
