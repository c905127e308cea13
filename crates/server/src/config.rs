//! Server configuration from environment variables

use std::time::Duration;

use flowline_engine::worker::PollerConfig;
use flowline_engine::{ExecutorConfig, SweeperConfig, WorkerPoolConfig};
use uuid::Uuid;

/// Process configuration
///
/// Environment variables:
/// - `DATABASE_URL`: PostgreSQL URL; unset runs on the in-memory store
/// - `BIND_ADDR`: HTTP listen address (default: "0.0.0.0:9000")
/// - `API_PREFIX`: Prefix for API routes, e.g. "/api" (default: none)
/// - `WORKER_ID`: Identity recorded on claimed steps (default: random)
/// - `MAX_CONCURRENT_STEPS`: Steps executing at once (default: 10)
/// - `SWEEP_INTERVAL_MS`: Time between sweeper passes (default: 1000)
/// - `RUN_RETENTION_HOURS`: Step history retention, 0 keeps forever (default: 168)
/// - `DEFAULT_ORG_CREDITS`: Starting balance per org on the in-memory ledger (default: 1000)
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub database_url: Option<String>,
    pub bind_addr: String,
    pub api_prefix: String,
    pub worker_id: String,
    pub max_concurrent_steps: usize,
    pub sweep_interval: Duration,
    pub run_retention: Option<Duration>,
    pub default_org_credits: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_addr: "0.0.0.0:9000".to_string(),
            api_prefix: String::new(),
            worker_id: format!("flowline-{}", Uuid::now_v7()),
            max_concurrent_steps: 10,
            sweep_interval: Duration::from_secs(1),
            run_retention: Some(Duration::from_secs(168 * 3600)),
            default_org_credits: 1_000,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let run_retention = match get("RUN_RETENTION_HOURS").and_then(|v| v.parse::<u64>().ok()) {
            Some(0) => None,
            Some(hours) => Some(Duration::from_secs(hours.saturating_mul(3600))),
            None => defaults.run_retention,
        };

        Self {
            database_url: get("DATABASE_URL"),
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            api_prefix: get("API_PREFIX")
                .map(|p| p.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_prefix),
            worker_id: get("WORKER_ID").unwrap_or(defaults.worker_id),
            max_concurrent_steps: get("MAX_CONCURRENT_STEPS")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_steps),
            sweep_interval: get("SWEEP_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            run_retention,
            default_org_credits: get("DEFAULT_ORG_CREDITS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_org_credits),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default().with_worker_id(self.worker_id.clone())
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new()
            .with_max_concurrency(self.max_concurrent_steps)
            .with_poller(PollerConfig::new().with_batch_size(self.max_concurrent_steps))
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig::new()
            .with_interval(self.sweep_interval)
            .with_retention(self.run_retention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[]));
        assert_eq!(config.database_url, None);
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.api_prefix, "");
        assert!(config.worker_id.starts_with("flowline-"));
        assert_eq!(config.max_concurrent_steps, 10);
        assert_eq!(config.run_retention, Some(Duration::from_secs(168 * 3600)));
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/flowline"),
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("API_PREFIX", "/api/"),
            ("WORKER_ID", "w-7"),
            ("MAX_CONCURRENT_STEPS", "32"),
            ("SWEEP_INTERVAL_MS", "250"),
            ("RUN_RETENTION_HOURS", "0"),
            ("DEFAULT_ORG_CREDITS", "5"),
        ]));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/flowline"));
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.api_prefix, "/api");
        assert_eq!(config.executor_config().worker_id, "w-7");
        assert_eq!(config.pool_config().max_concurrency, 32);
        assert_eq!(config.sweeper_config().interval, Duration::from_millis(250));
        assert_eq!(config.sweeper_config().retention, None);
        assert_eq!(config.default_org_credits, 5);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("MAX_CONCURRENT_STEPS", "0"),
            ("SWEEP_INTERVAL_MS", "soon"),
            ("DATABASE_URL", "  "),
        ]));
        assert_eq!(config.max_concurrent_steps, 10);
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert_eq!(config.database_url, None);
    }
}
