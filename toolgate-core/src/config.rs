//! Configuration types for Toolgate

use crate::error::{Result, ToolgateError};
use crate::security::PermissionProfile;
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name, looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "toolgate.toml";

/// Environment variable pointing at an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "TOOLGATE_CONFIG_PATH";

/// Main configuration for Toolgate
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolgateConfig {
    /// Tool servers keyed by unique server name
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,

    /// Connection and request behaviour
    #[serde(default)]
    pub client: ClientConfig,

    /// Permission profiles, consent and audit settings
    #[serde(default)]
    pub security: SecurityConfig,

    /// Function catalog settings
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// How to reach a single tool server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Disabled servers are ignored entirely
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Connect during startup
    #[serde(default, alias = "autoConnect")]
    pub auto_connect: bool,

    /// Transport used to reach the server
    #[serde(default)]
    pub transport: TransportKind,

    /// Executable for stdio servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments for stdio servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Extra environment for stdio servers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// URL for http servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Extra request headers for http servers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// A subprocess server speaking newline-delimited JSON-RPC on stdio
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            enabled: true,
            auto_connect: false,
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            args,
            env: BTreeMap::new(),
            endpoint: None,
            headers: BTreeMap::new(),
        }
    }

    /// A server reached over streamable HTTP
    pub fn http(endpoint: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Http,
            command: None,
            endpoint: Some(endpoint.into()),
            ..Self::stdio("", Vec::new())
        }
    }

    /// A server served by an in-process memory connector
    pub fn memory() -> Self {
        Self {
            transport: TransportKind::Memory,
            command: None,
            ..Self::stdio("", Vec::new())
        }
    }

    /// Mark the server for connection at startup
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Enable or disable the server
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Add an environment variable for the child process
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a request header for http servers
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Whether startup should connect this server
    pub fn should_auto_connect(&self) -> bool {
        self.enabled && self.auto_connect
    }

    fn validate(&self, name: &str) -> Result<()> {
        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().is_none_or(|c| c.trim().is_empty()) {
                    return Err(ToolgateError::Configuration(format!(
                        "Server '{}' uses stdio transport but has no command",
                        name
                    )));
                }
            }
            TransportKind::Http => {
                if self.endpoint.as_deref().is_none_or(|e| e.trim().is_empty()) {
                    return Err(ToolgateError::Configuration(format!(
                        "Server '{}' uses http transport but has no endpoint",
                        name
                    )));
                }
            }
            TransportKind::Memory => {}
        }
        Ok(())
    }
}

/// Connection behaviour shared by all servers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Name announced in the initialize handshake
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Upper bound for opening a transport plus the initialize handshake
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Upper bound for a single request on an open transport
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Stop following list pagination after this many items
    #[serde(default = "default_max_list_items")]
    pub max_list_items: usize,
}

fn default_client_name() -> String {
    "toolgate".to_string()
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_list_items() -> usize {
    500
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            handshake_timeout: default_handshake_timeout(),
            request_timeout: default_request_timeout(),
            max_list_items: default_max_list_items(),
        }
    }
}

/// Security policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// How long a consent prompt waits before denying
    #[serde(default = "default_consent_timeout", with = "humantime_serde")]
    pub consent_timeout: Duration,

    /// Maximum retained audit entries
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,

    /// Fragments added to the built-in forbidden list (never replacing it)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_forbidden_paths: Vec<String>,

    /// Per-server permission profiles
    #[serde(default)]
    pub permissions: BTreeMap<String, PermissionProfile>,
}

fn default_consent_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_audit_capacity() -> usize {
    1000
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            consent_timeout: default_consent_timeout(),
            audit_capacity: default_audit_capacity(),
            extra_forbidden_paths: Vec::new(),
            permissions: BTreeMap::new(),
        }
    }
}

/// Function catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// How long a derived function catalog stays fresh
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub cache_ttl: Duration,
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cache_ttl: default_cache_ttl(),
        }
    }
}

/// Builder for ToolgateConfig
pub struct ConfigBuilder {
    config: ToolgateConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            config: ToolgateConfig::default(),
        }
    }

    /// Add or replace a server
    pub fn server(mut self, name: impl Into<String>, config: ServerConfig) -> Self {
        self.config.servers.insert(name.into(), config);
        self
    }

    /// Set a server's permission profile
    pub fn permissions(mut self, server: impl Into<String>, profile: PermissionProfile) -> Self {
        self.config.security.permissions.insert(server.into(), profile);
        self
    }

    /// Set client configuration
    pub fn client(mut self, config: ClientConfig) -> Self {
        self.config.client = config;
        self
    }

    /// Set security configuration
    pub fn security(mut self, config: SecurityConfig) -> Self {
        self.config.security = config;
        self
    }

    /// Set executor configuration
    pub fn executor(mut self, config: ExecutorConfig) -> Self {
        self.config.executor = config;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ToolgateConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolgateConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Loads in this order, later sources overriding earlier ones:
    /// 1. Default configuration
    /// 2. `toolgate/toolgate.toml` in the user config directory
    /// 3. `toolgate.toml` in the working directory
    /// 4. `TOOLGATE_`-prefixed environment variables (`__` separates nesting)
    /// 5. The file named by `TOOLGATE_CONFIG_PATH`
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid or validation fails.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Toml},
        };

        let mut figment = Figment::new();
        if let Some(user_file) = user_config_file() {
            figment = figment.merge(Toml::file(user_file));
        }
        figment = figment
            .merge(Toml::file(CONFIG_FILE_NAME))
            .merge(Env::prefixed("TOOLGATE_").split("__"));

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }

        let config: ToolgateConfig = figment.extract().map_err(|e| {
            ToolgateError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// The format is picked from the extension: `.json`, `.yaml`/`.yml`,
    /// anything else is read as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, cannot be parsed or fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Json, Toml, Yaml},
        };

        let path = path.as_ref();
        if !path.is_file() {
            return Err(ToolgateError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Figment::new().merge(Json::file(path)),
            Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
            _ => Figment::new().merge(Toml::file(path)),
        };

        let config: ToolgateConfig = figment.extract().map_err(|e| {
            ToolgateError::Configuration(format!("Failed to load configuration file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        for (name, server) in &self.servers {
            if name.trim().is_empty() {
                return Err(ToolgateError::Configuration(
                    "Server names must not be empty".to_string(),
                ));
            }
            server.validate(name)?;
        }

        if self.client.handshake_timeout.is_zero() || self.client.request_timeout.is_zero() {
            return Err(ToolgateError::Configuration(
                "Client timeouts must be greater than zero".to_string(),
            ));
        }
        if self.client.max_list_items == 0 {
            return Err(ToolgateError::Configuration(
                "client.max_list_items must be greater than zero".to_string(),
            ));
        }
        if self.security.consent_timeout.is_zero() {
            return Err(ToolgateError::Configuration(
                "security.consent_timeout must be greater than zero".to_string(),
            ));
        }
        if self.security.audit_capacity == 0 {
            return Err(ToolgateError::Configuration(
                "security.audit_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Servers that startup should connect, in name order
    pub fn auto_connect_servers(&self) -> impl Iterator<Item = (&String, &ServerConfig)> {
        self.servers
            .iter()
            .filter(|(_, server)| server.should_auto_connect())
    }
}

fn user_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("toolgate").join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ToolgateConfig::default();
        assert!(config.servers.is_empty());
        assert_eq!(config.security.audit_capacity, 1000);
        assert_eq!(config.executor.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.client.max_list_items, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[servers.filesystem]
auto_connect = true
transport = "stdio"
command = "fs-server"
args = ["/data"]

[servers.remote]
enabled = false
transport = "http"
endpoint = "http://localhost:8808/mcp"

[security]
consent_timeout = "5s"
extra_forbidden_paths = ["vault/"]

[security.permissions.filesystem]
allowed_paths = ["notes/"]
read_only = true

[executor]
cache_ttl = "2m"
"#
        )
        .unwrap();

        let config = ToolgateConfig::from_file(file.path()).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert!(config.servers["filesystem"].should_auto_connect());
        assert!(!config.servers["remote"].should_auto_connect());
        assert_eq!(config.security.consent_timeout, Duration::from_secs(5));
        assert_eq!(config.executor.cache_ttl, Duration::from_secs(120));
        let profile = &config.security.permissions["filesystem"];
        assert_eq!(profile.allowed_paths, vec!["notes/".to_string()]);
        assert!(profile.read_only);
        assert!(profile.require_consent);

        let names: Vec<_> = config.auto_connect_servers().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["filesystem"]);
    }

    #[test]
    fn test_from_json_file_accepts_camel_case_aliases() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"servers": {{"git": {{"autoConnect": true, "command": "git-server"}}}}}}"#
        )
        .unwrap();

        let config = ToolgateConfig::from_file(file.path()).unwrap();
        assert!(config.servers["git"].auto_connect);
        assert_eq!(config.servers["git"].transport, TransportKind::Stdio);
    }

    #[test]
    fn test_validation_rejects_incomplete_servers() {
        let config = ConfigBuilder::new()
            .server("broken", ServerConfig::stdio("  ", Vec::new()))
            .build();
        assert!(matches!(
            config.validate(),
            Err(ToolgateError::Configuration(_))
        ));

        let mut http = ServerConfig::http("http://localhost");
        http.endpoint = None;
        let config = ConfigBuilder::new().server("remote", http).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = ToolgateConfig::from_file("/definitely/not/here/toolgate.toml");
        assert!(matches!(result, Err(ToolgateError::Configuration(_))));
    }
}
