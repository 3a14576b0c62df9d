//! Edge-CDN DNS client (C5): A-record set reconciliation for service domains.
//!
//! `setup_multi_server` replaces the full A-record set for a domain. The
//! provider has no atomic "replace" primitive, so this is list -> delete ->
//! create; callers tolerate a brief interval where the record set is
//! partial (spec §4.5).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{ControlPlaneError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub content: String,
}

#[async_trait]
pub trait DnsClient: Send + Sync {
    async fn setup_multi_server(&self, domain: &str, ips: &[String]) -> Result<()>;
    async fn remove_domain(&self, domain: &str) -> Result<()>;
}

pub struct CloudflareDnsClient {
    http: reqwest::Client,
    api_base: String,
    api_token: String,
}

#[derive(Deserialize)]
struct ListRecordsResponse {
    result: Vec<DnsRecord>,
}

impl CloudflareDnsClient {
    pub fn new(api_base: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), api_base: api_base.into(), api_token: api_token.into() }
    }

    fn retry_policy(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(Duration::from_secs(20)),
            ..Default::default()
        }
    }

    async fn list_a_records(&self, domain: &str) -> Result<Vec<DnsRecord>> {
        let url = format!("{}/dns_records", self.api_base);
        let op = || async {
            let resp = self
                .http
                .get(&url)
                .bearer_auth(&self.api_token)
                .query(&[("name", domain), ("type", "A")])
                .send()
                .await
                .map_err(|e| backoff::Error::transient(ControlPlaneError::Transient { node_id: domain.to_string(), source: e.to_string() }))?;

            if resp.status().is_success() {
                resp.json::<ListRecordsResponse>()
                    .await
                    .map(|body| body.result)
                    .map_err(|e| backoff::Error::permanent(ControlPlaneError::ProviderError(e.to_string())))
            } else {
                Err(backoff::Error::permanent(ControlPlaneError::ProviderError(format!("list records: {}", resp.status()))))
            }
        };
        backoff::future::retry(self.retry_policy(), op).await
    }

    async fn delete_record(&self, record_id: &str) -> Result<()> {
        let url = format!("{}/dns_records/{}", self.api_base, record_id);
        let op = || async {
            let resp = self
                .http
                .delete(&url)
                .bearer_auth(&self.api_token)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(ControlPlaneError::Transient { node_id: record_id.to_string(), source: e.to_string() }))?;
            if resp.status().is_success() {
                Ok(())
            } else {
                Err(backoff::Error::permanent(ControlPlaneError::ProviderError(format!("delete record: {}", resp.status()))))
            }
        };
        backoff::future::retry(self.retry_policy(), op).await
    }

    async fn create_a_record(&self, domain: &str, ip: &str) -> Result<()> {
        let url = format!("{}/dns_records", self.api_base);
        let op = || async {
            let resp = self
                .http
                .post(&url)
                .bearer_auth(&self.api_token)
                .json(&serde_json::json!({
                    "type": "A",
                    "name": domain,
                    "content": ip,
                    "proxied": true,
                }))
                .send()
                .await
                .map_err(|e| backoff::Error::transient(ControlPlaneError::Transient { node_id: domain.to_string(), source: e.to_string() }))?;
            if resp.status().is_success() {
                Ok(())
            } else {
                Err(backoff::Error::permanent(ControlPlaneError::ProviderError(format!("create record: {}", resp.status()))))
            }
        };
        backoff::future::retry(self.retry_policy(), op).await
    }
}

#[async_trait]
impl DnsClient for CloudflareDnsClient {
    async fn setup_multi_server(&self, domain: &str, ips: &[String]) -> Result<()> {
        let existing = self.list_a_records(domain).await?;
        for record in existing.iter().filter(|r| r.record_type == "A") {
            self.delete_record(&record.id).await?;
        }
        for ip in ips {
            self.create_a_record(domain, ip).await?;
        }
        Ok(())
    }

    async fn remove_domain(&self, domain: &str) -> Result<()> {
        let existing = self.list_a_records(domain).await?;
        for record in existing {
            self.delete_record(&record.id).await?;
        }
        Ok(())
    }
}
