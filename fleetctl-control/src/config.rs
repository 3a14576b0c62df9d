//! Ambient configuration: environment-variable-driven settings for the
//! control plane, following the teacher's `arceon-core::config::Config::load`
//! pattern (the `config` crate, file source + `Environment`). Unlike the
//! teacher, the environment source carries no prefix: `NODE_AGENT_PORT`,
//! `HEALTH_CHECK_INTERVAL`, `HEALTH_CHECK_CLEANUP_INTERVAL` and `ADMIN_IPS`
//! are the literal external contract, not `FLEETCTL_*`-namespaced.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Port the node-agent daemon listens on: `NODE_AGENT_PORT`.
    pub node_agent_port: u16,
    /// Seconds between health monitor passes: `HEALTH_CHECK_INTERVAL`.
    #[serde(alias = "health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Seconds between stale check-row cleanup passes: `HEALTH_CHECK_CLEANUP_INTERVAL`.
    #[serde(alias = "health_check_cleanup_interval")]
    pub health_check_cleanup_interval_secs: u64,
    /// CIDRs allowed by node firewalls in managed mode: `ADMIN_IPS`.
    pub admin_ips: Vec<String>,

    /// Total deploy deadline, seconds (default 1800 = 30 min).
    pub deploy_deadline_secs: u64,
    /// Total rollback deadline, seconds (default 600 = 10 min).
    pub rollback_deadline_secs: u64,
    /// Total scale deadline, seconds (default 600 = 10 min).
    pub scale_deadline_secs: u64,
    /// Bounded fan-out for image uploads and image pruning.
    pub upload_concurrency: usize,
    /// Bounded fan-out for node/container probes (start, health-gate, health monitor).
    pub health_check_concurrency: usize,
    /// Image versions kept per `cleanup_images` call. Spec §9 open question
    /// resolved as a configurable default of 100.
    pub prune_keep_latest: u32,

    /// Handed to the out-of-scope auth layer, never interpreted here.
    pub jwt_secret: Option<String>,
    /// Handed to the out-of-scope persistence layer, never interpreted here.
    pub database_url: Option<String>,
    /// Handed to the out-of-scope persistence layer, never interpreted here.
    pub redis_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_agent_port: 9999,
            health_check_interval_secs: 60,
            health_check_cleanup_interval_secs: 86_400,
            admin_ips: Vec::new(),
            deploy_deadline_secs: 1800,
            rollback_deadline_secs: 600,
            scale_deadline_secs: 600,
            upload_concurrency: 4,
            health_check_concurrency: 8,
            prune_keep_latest: 100,
            jwt_secret: None,
            database_url: None,
            redis_url: None,
        }
    }
}

impl Config {
    /// Loads defaults, then an optional file at `path`, then unprefixed
    /// environment variables, highest precedence last. `ADMIN_IPS` is
    /// comma-separated, e.g. `ADMIN_IPS=10.0.0.1,10.0.0.2`.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&defaults)?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::default()
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("admin_ips"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.node_agent_port, 9999);
        assert_eq!(cfg.health_check_interval_secs, 60);
        assert_eq!(cfg.health_check_cleanup_interval_secs, 86_400);
        assert_eq!(cfg.prune_keep_latest, 100);
    }

    #[test]
    fn load_with_no_file_falls_back_to_defaults() {
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.node_agent_port, 9999);
    }

    /// Reproduces the external contract directly: these env var names, with
    /// no `FLEETCTL_` namespace, must be the ones `load` actually reads.
    #[test]
    fn load_reads_unprefixed_env_vars() {
        std::env::set_var("NODE_AGENT_PORT", "8123");
        std::env::set_var("HEALTH_CHECK_INTERVAL", "30");
        std::env::set_var("HEALTH_CHECK_CLEANUP_INTERVAL", "3600");
        std::env::set_var("ADMIN_IPS", "10.0.0.1,10.0.0.2");

        let cfg = Config::load(None).unwrap();

        std::env::remove_var("NODE_AGENT_PORT");
        std::env::remove_var("HEALTH_CHECK_INTERVAL");
        std::env::remove_var("HEALTH_CHECK_CLEANUP_INTERVAL");
        std::env::remove_var("ADMIN_IPS");

        assert_eq!(cfg.node_agent_port, 8123);
        assert_eq!(cfg.health_check_interval_secs, 30);
        assert_eq!(cfg.health_check_cleanup_interval_secs, 3600);
        assert_eq!(cfg.admin_ips, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
    }
}
