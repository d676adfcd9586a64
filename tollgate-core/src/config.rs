// config.rs - Node configuration for tollgate-core
use serde::{Deserialize, Serialize};
use std::path::Path;
use tollgate_common::error::{TollError, TollResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Path to the state database
    pub db_path: String,

    /// HTTP listen address, e.g. 127.0.0.1:8080
    pub listen_addr: String,

    /// Trust policy file; built-in defaults when absent
    pub policy_path: Option<String>,

    /// Shared admin key for the protected endpoints
    pub admin_key: String,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            db_path: "./tollgate_db".to_string(),
            listen_addr: "127.0.0.1:8080".to_string(),
            policy_path: None,
            admin_key: String::new(),
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load a config from a YAML file
    pub fn load(path: impl AsRef<Path>) -> TollResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: NodeConfig = serde_yaml::from_str(&raw)
            .map_err(|e| TollError::config(format!("config parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> TollResult<()> {
        if self.db_path.is_empty() {
            return Err(TollError::config("db_path cannot be empty"));
        }

        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(TollError::config(format!(
                "listen_addr {:?} is not a valid socket address",
                self.listen_addr
            )));
        }

        if self.admin_key.len() < 16 {
            return Err(TollError::config(
                "admin_key must be at least 16 characters",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> NodeConfig {
        NodeConfig {
            admin_key: "0123456789abcdef".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validation() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.admin_key = "short".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.listen_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{}",
            serde_yaml::to_string(&valid()).unwrap()
        )
        .unwrap();

        let loaded = NodeConfig::load(file.path()).unwrap();
        assert_eq!(loaded.listen_addr, "127.0.0.1:8080");
    }
}
