//! `fleetctl` daemon: wires the control plane core together and runs the
//! health-monitor scheduler as a long-lived process. The HTTP API surface
//! that would expose deploy/scale/rollback to callers is out of scope
//! (spec §1) — this binary only owns the "run this forever" concern.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleetctl_control::config::Config;
use fleetctl_control::deploy::NodeProvisioner;
use fleetctl_control::dns::CloudflareDnsClient;
use fleetctl_control::health::NodeRebooter;
use fleetctl_control::model::Node;
use fleetctl_control::repository::InMemoryRepository;
use fleetctl_control::ControlPlane;

#[derive(Parser, Debug)]
#[command(name = "fleetctl", about = "Deployment control plane daemon")]
struct Cli {
    /// Path to an optional config file layered under environment variables.
    #[arg(long)]
    config: Option<String>,

    /// Shared secret used to derive the node-agent `X-API-Key` header.
    #[arg(long, env = "FLEETCTL_DO_TOKEN")]
    do_token: String,

    /// Base URL of the edge-CDN DNS API.
    #[arg(long, env = "FLEETCTL_DNS_API_BASE")]
    dns_api_base: String,

    /// Bearer token for the edge-CDN DNS API.
    #[arg(long, env = "FLEETCTL_DNS_API_TOKEN")]
    dns_api_token: String,
}

/// Cloud provider VM creation is an external collaborator (spec §1); this
/// daemon ships no provider SDK integration, so provisioning requests are
/// logged and rejected until a real implementation is wired in by the host
/// application embedding this crate.
struct UnimplementedProvisioner;

#[async_trait]
impl NodeProvisioner for UnimplementedProvisioner {
    async fn provision(
        &self,
        workspace_id: &str,
        count: u32,
        region: &str,
        _size: &str,
        _snapshot_id: Option<&str>,
    ) -> fleetctl_control::error::Result<Vec<Node>> {
        warn!(workspace_id, count, region, "node provisioning requested but no cloud provider is configured");
        Err(fleetctl_control::error::ControlPlaneError::ProviderError("no cloud provisioner configured".to_string()))
    }
}

struct UnimplementedRebooter;

#[async_trait]
impl NodeRebooter for UnimplementedRebooter {
    async fn reboot(&self, node_id: &str) -> fleetctl_control::error::Result<()> {
        warn!(node_id, "node reboot requested but no cloud provider is configured");
        Err(fleetctl_control::error::ControlPlaneError::ProviderError("no cloud provisioner configured".to_string()))
    }
}

struct Daemon {
    control_plane: Arc<ControlPlane>,
    running: Arc<AtomicBool>,
}

impl Daemon {
    async fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let monitor = self.control_plane.health.clone();
        let monitor_cancel = cancel.clone();
        let monitor_task = tokio::spawn(async move {
            monitor.run(monitor_cancel).await;
        });

        info!("fleetctl daemon started");

        signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
        info!("received shutdown signal, stopping health monitor");
        self.running.store(false, Ordering::SeqCst);
        cancel.cancel();

        monitor_task.await.context("health monitor task panicked")?;
        info!("fleetctl daemon stopped");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    // Persistence is an external collaborator (spec §1); this daemon has no
    // embedded database, so it runs against the in-memory repository test
    // double until a host application wires in a real one via
    // `ControlPlane::new`.
    let repo = Arc::new(InMemoryRepository::new());
    let dns = Arc::new(CloudflareDnsClient::new(cli.dns_api_base, cli.dns_api_token));
    let provisioner = Arc::new(UnimplementedProvisioner);
    let rebooter = Arc::new(UnimplementedRebooter);

    let control_plane = Arc::new(ControlPlane::new(&config, &cli.do_token, repo, dns, provisioner, rebooter));

    let daemon = Daemon { control_plane, running: Arc::new(AtomicBool::new(false)) };
    daemon.run().await
}
