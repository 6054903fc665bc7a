use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Alias used for routes that do not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_upstream: Option<String>,
    #[serde(default)]
    pub upstreams: BTreeMap<String, UpstreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Environment variable holding the API key. Takes precedence over `api_key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    /// Prefix placed before the key, separated by a space. Empty sends the bare key.
    #[serde(default = "default_auth_prefix")]
    pub auth_prefix: String,
    #[serde(default)]
    pub default_model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

fn default_auth_prefix() -> String {
    "Bearer".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            default_upstream: None,
            upstreams: BTreeMap::new(),
        }
    }
}

impl UpstreamConfig {
    /// An upstream with every optional field at its default.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key_env: None,
            api_key: None,
            auth_header: default_auth_header(),
            auth_prefix: default_auth_prefix(),
            default_model: String::new(),
            timeout_secs: default_timeout_secs(),
        }
    }

    /// The configured API key, if any. A named but unset environment variable falls
    /// back to the inline `api_key`.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .or_else(|| self.api_key.clone())
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }

    /// Header value for `key`, e.g. `Bearer sk-...`.
    pub fn auth_value(&self, key: &str) -> String {
        let prefix = self.auth_prefix.trim();
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{} {}", prefix, key)
        }
    }
}

impl BridgeConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        let candidates = config_search_paths();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        Err(BridgeError::config(format!(
            "No config file found. Searched: {}",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstreams.is_empty() {
            return Err(BridgeError::config("No upstreams configured"));
        }
        for (alias, upstream) in &self.upstreams {
            if upstream.base_url.trim().is_empty() {
                return Err(BridgeError::config(format!(
                    "Upstream '{}' has an empty base_url",
                    alias
                )));
            }
        }
        if let Some(ref name) = self.default_upstream {
            if !self.upstreams.contains_key(name) {
                return Err(BridgeError::config(format!(
                    "default_upstream '{}' is not a configured upstream",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Pick the upstream for a request. An explicit alias must name a configured
    /// upstream; otherwise `default_upstream`, then the only upstream if there is one.
    pub fn resolve_upstream(&self, alias: Option<&str>) -> Result<(&str, &UpstreamConfig)> {
        if let Some(alias) = alias {
            return self
                .upstreams
                .get_key_value(alias)
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| BridgeError::unknown_upstream(alias));
        }

        if let Some(found) = self
            .default_upstream
            .as_deref()
            .and_then(|name| self.upstreams.get_key_value(name))
        {
            return Ok((found.0.as_str(), found.1));
        }

        if self.upstreams.len() == 1 {
            if let Some((k, v)) = self.upstreams.iter().next() {
                return Ok((k.as_str(), v));
            }
        }

        Err(BridgeError::unknown_upstream(
            self.default_upstream.as_deref().unwrap_or("<default>"),
        ))
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("chat-bridge.toml"));

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("chat-bridge").join("config.toml"));
    }
    if let Some(home) = dirs_path() {
        paths.push(home.join(".config").join("chat-bridge").join("config.toml"));
        paths.push(home.join(".chat-bridge.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn two_upstreams() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config
            .upstreams
            .insert("main".to_string(), UpstreamConfig::new("https://a.example/v1"));
        config
            .upstreams
            .insert("backup".to_string(), UpstreamConfig::new("https://b.example"));
        config
    }

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
port = 5000
default_upstream = "main"

[upstreams.main]
base_url = "https://api.openai.com/v1"
api_key = "sk-inline"
default_model = "gpt-4o-mini"

[upstreams.local]
base_url = "http://localhost:11434"
auth_header = "x-api-key"
auth_prefix = ""
timeout_secs = 30
"#
        )
        .unwrap();

        let config = BridgeConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.upstreams.len(), 2);

        let main = &config.upstreams["main"];
        assert_eq!(main.auth_header, "Authorization");
        assert_eq!(main.auth_prefix, "Bearer");
        assert_eq!(main.timeout_secs, 300);
        assert_eq!(main.default_model, "gpt-4o-mini");
        assert_eq!(main.resolve_api_key().as_deref(), Some("sk-inline"));
        assert_eq!(main.auth_value("sk-inline"), "Bearer sk-inline");

        let local = &config.upstreams["local"];
        assert_eq!(local.timeout_secs, 30);
        assert_eq!(local.resolve_api_key(), None);
        assert_eq!(local.auth_value("k"), "k");
    }

    #[test]
    fn test_load_rejects_bad_default() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
default_upstream = "missing"
[upstreams.main]
base_url = "http://x"
"#
        )
        .unwrap();
        let err = BridgeConfig::load(f.path()).unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
    }

    #[test]
    fn test_load_rejects_empty_config() {
        let f = NamedTempFile::new().unwrap();
        assert!(BridgeConfig::load(f.path()).is_err());
    }

    #[test]
    fn test_resolve_upstream() {
        let mut config = two_upstreams();

        let (alias, upstream) = config.resolve_upstream(Some("backup")).unwrap();
        assert_eq!(alias, "backup");
        assert_eq!(upstream.base_url, "https://b.example");

        assert!(matches!(
            config.resolve_upstream(Some("nope")),
            Err(BridgeError::UnknownUpstream { .. })
        ));
        // Two upstreams and no default is ambiguous
        assert!(config.resolve_upstream(None).is_err());

        config.default_upstream = Some("main".to_string());
        assert_eq!(config.resolve_upstream(None).unwrap().0, "main");

        config.default_upstream = None;
        config.upstreams.remove("main");
        assert_eq!(config.resolve_upstream(None).unwrap().0, "backup");
    }

    #[test]
    fn test_api_key_env_takes_precedence() {
        let mut upstream = UpstreamConfig::new("http://x");
        upstream.api_key = Some("inline".to_string());
        upstream.api_key_env = Some("CHAT_BRIDGE_TEST_KEY_UNSET_9F2".to_string());
        assert_eq!(upstream.resolve_api_key().as_deref(), Some("inline"));

        upstream.api_key_env = Some("PATH".to_string());
        assert_ne!(upstream.resolve_api_key().as_deref(), Some("inline"));
    }
}
