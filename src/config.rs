use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MnemaConfig {
    pub log_level: String,
    pub storage: StorageConfig,
    pub oracle: OracleConfig,
    pub mirror: MirrorConfig,
    pub linking: LinkingConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub graph_path: String,
    pub trace_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OracleConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MirrorConfig {
    pub enabled: bool,
    pub url: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LinkingConfig {
    /// Cap on candidate events considered for Oracle relationship judgement.
    pub max_candidates: usize,
    /// Channel capacity between pipeline stages.
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueryConfig {
    /// How many top search hits seed the context traversal.
    pub max_seeds: usize,
    pub traversal_depth: usize,
}

impl Default for MnemaConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            storage: StorageConfig::default(),
            oracle: OracleConfig::default(),
            mirror: MirrorConfig::default(),
            linking: LinkingConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let dir = default_mnema_dir();
        Self {
            graph_path: dir.join("graph.json").to_string_lossy().into_owned(),
            trace_path: dir.join("trace.json").to_string_lossy().into_owned(),
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/api/generate".into(),
            model: "phi3:mini".into(),
            timeout_secs: 30,
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:7474".into(),
            user: "neo4j".into(),
            password: "password".into(),
        }
    }
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            max_candidates: 10,
            queue_capacity: 256,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_seeds: 5,
            traversal_depth: 1,
        }
    }
}

/// Returns `~/.mnema/`
pub fn default_mnema_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".mnema")
}

/// Returns the default config file path: `~/.mnema/config.toml`
pub fn default_config_path() -> PathBuf {
    default_mnema_dir().join("config.toml")
}

impl MnemaConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MnemaConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (MNEMA_GRAPH, MNEMA_ORACLE_URL,
    /// MNEMA_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MNEMA_GRAPH") {
            self.storage.graph_path = val;
        }
        if let Ok(val) = std::env::var("MNEMA_ORACLE_URL") {
            self.oracle.base_url = val;
        }
        if let Ok(val) = std::env::var("MNEMA_LOG_LEVEL") {
            self.log_level = val;
        }
    }

    /// Resolve the graph snapshot path, expanding `~` if needed.
    pub fn resolved_graph_path(&self) -> PathBuf {
        expand_tilde(&self.storage.graph_path)
    }

    /// Resolve the trace log path, expanding `~` if needed.
    pub fn resolved_trace_path(&self) -> PathBuf {
        expand_tilde(&self.storage.trace_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MnemaConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.oracle.model, "phi3:mini");
        assert_eq!(config.linking.max_candidates, 10);
        assert!(!config.mirror.enabled);
        assert!(config.storage.graph_path.ends_with("graph.json"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
log_level = "debug"

[storage]
graph_path = "/tmp/test-graph.json"

[oracle]
model = "llama3.2"
timeout_secs = 10

[mirror]
enabled = true
url = "http://graph-db:7474"
"#;
        let config: MnemaConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.storage.graph_path, "/tmp/test-graph.json");
        assert_eq!(config.oracle.model, "llama3.2");
        assert_eq!(config.oracle.timeout_secs, 10);
        assert!(config.mirror.enabled);
        // defaults still apply for unset fields
        assert_eq!(config.query.max_seeds, 5);
        assert!(config.storage.trace_path.ends_with("trace.json"));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = MnemaConfig::default();
        std::env::set_var("MNEMA_GRAPH", "/tmp/override-graph.json");
        std::env::set_var("MNEMA_ORACLE_URL", "http://oracle:11434/api/generate");
        std::env::set_var("MNEMA_LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.storage.graph_path, "/tmp/override-graph.json");
        assert_eq!(config.oracle.base_url, "http://oracle:11434/api/generate");
        assert_eq!(config.log_level, "trace");

        // Clean up
        std::env::remove_var("MNEMA_GRAPH");
        std::env::remove_var("MNEMA_ORACLE_URL");
        std::env::remove_var("MNEMA_LOG_LEVEL");
    }
}
