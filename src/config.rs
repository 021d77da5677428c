//! sniproxy/src/config.rs
//! Typed configuration (SPEC_FULL.md §6.H), deserialized with `serde` from
//! either JSON or YAML (format auto-detected from the file extension,
//! following the same `serde_json`/`serde_yaml` split the retrieval pack's
//! `router-api` crate uses for its own settings).

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Tls,
    Http,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    /// Absent only for a listener's `fallback` entry.
    pub pattern: Option<String>,
    pub address: String,
    #[serde(default)]
    pub use_proxy_header: bool,
    #[serde(default)]
    pub use_proxy_socks5: bool,
    #[serde(default)]
    pub use_proxy_socks5_remote_resolv: bool,
    #[serde(default)]
    pub source_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub address: String,
    pub protocol: ProtocolKind,
    #[serde(default)]
    pub fallback: Option<BackendConfig>,
    #[serde(default)]
    pub fallback_use_proxy_header: bool,
    /// Requires `CAP_NET_ADMIN` at runtime; off unless a config explicitly
    /// opts in (SPEC_FULL.md §4.E).
    #[serde(default)]
    pub transparent_proxy: bool,
    #[serde(default)]
    pub log_bad_requests: bool,
    #[serde(default)]
    pub source_address: Option<String>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_buffer_capacity() -> usize {
    4096
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listeners: Vec<ListenerConfig>,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default)]
    pub access_log: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(path, &text)
    }

    fn parse(path: &Path, text: &str) -> Result<Config, ConfigError> {
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let config: Config = if is_yaml {
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                source: anyhow::Error::new(e),
            })?
        } else {
            serde_json::from_str(text).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                source: anyhow::Error::new(e),
            })?
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }
        for listener in &self.listeners {
            for (index, backend) in listener.backends.iter().enumerate() {
                let pattern = backend.pattern.as_deref().unwrap_or("");
                regex::Regex::new(&format!("(?i){pattern}")).map_err(|source| ConfigError::InvalidPattern {
                    listener: listener.address.clone(),
                    index,
                    pattern: pattern.to_string(),
                    source,
                })?;
                crate::backend::Address::parse(&backend.address).ok_or_else(|| {
                    ConfigError::InvalidAddress {
                        listener: listener.address.clone(),
                        address: backend.address.clone(),
                        reason: "expected host:port".to_string(),
                    }
                })?;
            }
            if let Some(fallback) = &listener.fallback {
                crate::backend::Address::parse(&fallback.address).ok_or_else(|| {
                    ConfigError::InvalidAddress {
                        listener: listener.address.clone(),
                        address: fallback.address.clone(),
                        reason: "expected host:port".to_string(),
                    }
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_json_document() {
        let json = r#"{
            "listeners": [
                {
                    "address": "0.0.0.0:443",
                    "protocol": "tls",
                    "backends": [
                        { "pattern": "^example\\.com$", "address": "127.0.0.1:8443" }
                    ]
                }
            ]
        }"#;
        let config = Config::parse(Path::new("test.json"), json).unwrap();
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.idle_timeout_secs, 120);
        assert_eq!(config.buffer_capacity, 4096);
    }

    #[test]
    fn parses_yaml_by_extension() {
        let yaml = "listeners:\n  - address: \"0.0.0.0:80\"\n    protocol: http\n    backends: []\n";
        let config = Config::parse(Path::new("test.yaml"), yaml).unwrap();
        assert_eq!(config.listeners[0].protocol, ProtocolKind::Http);
    }

    #[test]
    fn rejects_an_uncompilable_regex() {
        let json = r#"{
            "listeners": [
                {
                    "address": "0.0.0.0:443",
                    "protocol": "tls",
                    "backends": [ { "pattern": "(", "address": "127.0.0.1:8443" } ]
                }
            ]
        }"#;
        let result = Config::parse(Path::new("test.json"), json);
        assert!(matches!(result, Err(ConfigError::InvalidPattern { .. })));
    }

    #[test]
    fn rejects_an_empty_listener_list() {
        let json = r#"{ "listeners": [] }"#;
        let result = Config::parse(Path::new("test.json"), json);
        assert!(matches!(result, Err(ConfigError::NoListeners)));
    }
}
