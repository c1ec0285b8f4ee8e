use std::path::PathBuf;

use crate::error::{SonataError, SonataResult};

/// Server configuration.
///
/// Built from [`Config::default`], overlaid with `SONATA_*` environment
/// variables by [`Config::from_env`], and finally overridden by whatever the
/// caller (usually the CLI) sets explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interface to bind (default: 0.0.0.0)
    pub host: String,

    /// Listening TCP port (default: 9006)
    pub port: u16,

    /// Directory static targets are resolved against (default: ./root)
    pub doc_root: PathBuf,

    /// File served for the bare `/` target. `None` answers `/` with 400,
    /// like any other directory.
    pub index_file: Option<String>,

    /// Number of worker threads (default: number of CPUs)
    pub workers: usize,

    /// Maximum number of queued tasks before submissions are rejected.
    pub max_queue: usize,

    /// Size of the pre-allocated connection slot table.
    pub max_connections: usize,

    /// Events fetched per multiplexer wait.
    pub max_events: usize,

    /// Multiplexer wait timeout in milliseconds; bounds how long a shutdown
    /// request can go unnoticed.
    pub poll_timeout_ms: i32,

    /// Location handed back to the client after a successful login.
    pub login_redirect: String,

    /// Decode login/register bodies with a real JSON parser instead of the
    /// lenient substring scanner.
    pub strict_json: bool,

    /// Period of the metrics summary log line, in seconds. 0 disables it.
    pub metrics_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9006,
            doc_root: PathBuf::from("./root"),
            index_file: Some("index.html".to_string()),
            workers: num_cpus::get(),
            max_queue: 10_000,
            max_connections: 4096,
            max_events: 1024,
            poll_timeout_ms: 1000,
            login_redirect: "/welcome.html".to_string(),
            strict_json: false,
            metrics_interval_secs: 0,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    ///
    /// Unset or unparsable variables keep their default value.
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let mut config = Config::default();
        if let Ok(host) = std::env::var("SONATA_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("SONATA_PORT") {
            config.port = port;
        }
        if let Ok(root) = std::env::var("SONATA_DOC_ROOT") {
            config.doc_root = PathBuf::from(root);
        }
        if let Ok(index) = std::env::var("SONATA_INDEX_FILE") {
            config.index_file = if index.is_empty() { None } else { Some(index) };
        }
        if let Some(workers) = env_parse("SONATA_WORKERS") {
            config.workers = workers;
        }
        if let Some(max_queue) = env_parse("SONATA_MAX_QUEUE") {
            config.max_queue = max_queue;
        }
        if let Some(max_connections) = env_parse("SONATA_MAX_CONNECTIONS") {
            config.max_connections = max_connections;
        }
        if let Some(max_events) = env_parse("SONATA_MAX_EVENTS") {
            config.max_events = max_events;
        }
        if let Some(timeout) = env_parse("SONATA_POLL_TIMEOUT_MS") {
            config.poll_timeout_ms = timeout;
        }
        if let Ok(redirect) = std::env::var("SONATA_LOGIN_REDIRECT") {
            config.login_redirect = redirect;
        }
        config.strict_json = matches!(
            std::env::var("SONATA_STRICT_JSON")
                .unwrap_or_default()
                .to_lowercase()
                .as_str(),
            "true" | "1" | "yes"
        );
        if let Some(interval) = env_parse("SONATA_METRICS_INTERVAL_SECS") {
            config.metrics_interval_secs = interval;
        }
        config
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> SonataResult<()> {
        if self.workers == 0 {
            return Err(SonataError::Config("workers must be at least 1".into()));
        }
        if self.max_queue == 0 {
            return Err(SonataError::Config("max_queue must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(SonataError::Config(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.max_events == 0 {
            return Err(SonataError::Config("max_events must be at least 1".into()));
        }
        Ok(())
    }

    /// `host:port` string used for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 9006);
        assert_eq!(config.index_file.as_deref(), Some("index.html"));
        assert!(!config.strict_json);
    }

    #[test]
    fn zero_capacities_are_rejected() {
        let config = Config {
            workers: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(SonataError::Config(_))));

        let config = Config {
            max_queue: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_connections: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn server_addr_joins_host_and_port() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.server_addr(), "127.0.0.1:8080");
    }
}
