//! Settings file.
//!
//! All settings live in one TOML file passed with `--config` (or
//! `TIDEWIRE_CONFIG`). Every key is optional:
//!
//! ```toml
//! [log]
//! format = "json"
//! filter = "tidewire_channel=debug"
//!
//! [server]
//! bind_address = "0.0.0.0:7070"
//! max_connections = 100
//! strict = false
//!
//! [client]
//! address = "127.0.0.1:7070"
//! connect_timeout_secs = 5
//! command_timeout_secs = 30
//!
//! [client.reconnect]
//! initial_backoff_ms = 1000
//! max_backoff_ms = 64000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidewire_channel::{ChannelConfig, ClientConfig, DEFAULT_PORT, ReconnectPolicy, ServerConfig};

use crate::error::{CliError, CliResult};
use crate::logging::LogFormat;

/// Contents of the settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Logging settings.
    pub log: LogSettings,

    /// `serve` settings.
    pub server: ServerSettings,

    /// `call` / `notify` settings.
    pub client: ClientSettings,
}

/// Logging settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSettings {
    /// Output format.
    pub format: LogFormat,

    /// Filter directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

/// Server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    /// Address to bind.
    pub bind_address: String,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Reject payloads with missing or unknown fields.
    pub strict: bool,

    /// Answer timeout for commands the server sends.
    pub command_timeout_secs: Option<u64>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind_address: defaults.bind_address,
            max_connections: defaults.max_connections,
            strict: false,
            command_timeout_secs: None,
        }
    }
}

/// Client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    /// Server address.
    pub address: String,

    /// TCP connect timeout.
    pub connect_timeout_secs: u64,

    /// Answer timeout; unset waits indefinitely.
    pub command_timeout_secs: Option<u64>,

    /// Reconnect after the connection drops.
    pub reconnect: Option<ReconnectSettings>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{DEFAULT_PORT}"),
            connect_timeout_secs: 5,
            command_timeout_secs: None,
            reconnect: None,
        }
    }
}

/// Reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            initial_backoff_ms: duration_ms(policy.initial_backoff),
            max_backoff_ms: duration_ms(policy.max_backoff),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Settings {
    /// Loads settings from a TOML file.
    pub fn load_from(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CliError::Config {
            path: path.to_path_buf(),
            message: format!("failed to read config: {e}"),
        })?;
        let settings: Self = toml::from_str(&content).map_err(|e| CliError::Config {
            path: path.to_path_buf(),
            message: format!("failed to parse config: {e}"),
        })?;
        settings.validate().map_err(|message| CliError::Config {
            path: path.to_path_buf(),
            message,
        })?;
        Ok(settings)
    }

    /// Loads `path` if given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> CliResult<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => Ok(Self::default()),
        }
    }

    /// Checks values that parse but cannot work.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.max_connections == 0 {
            return Err("server.max_connections must be at least 1".into());
        }
        if self.client.connect_timeout_secs == 0 {
            return Err("client.connect_timeout_secs must be at least 1".into());
        }
        if let Some(reconnect) = &self.client.reconnect
            && (reconnect.initial_backoff_ms == 0
                || reconnect.initial_backoff_ms > reconnect.max_backoff_ms)
        {
            return Err(
                "client.reconnect.initial_backoff_ms must be between 1 and max_backoff_ms".into(),
            );
        }
        Ok(())
    }

    /// Renders the settings as TOML.
    pub fn to_toml(&self) -> CliResult<String> {
        toml::to_string_pretty(self).map_err(|e| CliError::Serialize(e.to_string()))
    }

    /// Server configuration, with an optional bind override.
    pub fn server_config(&self, bind: Option<&str>) -> ServerConfig {
        let mut channel = ChannelConfig::default();
        if let Some(secs) = self.server.command_timeout_secs {
            channel = channel.with_command_timeout(Duration::from_secs(secs));
        }
        ServerConfig::new(bind.unwrap_or(self.server.bind_address.as_str()))
            .with_max_connections(self.server.max_connections)
            .with_channel(channel)
    }

    /// Client configuration, with optional address and timeout overrides.
    pub fn client_config(&self, address: Option<&str>, timeout_secs: Option<u64>) -> ClientConfig {
        let mut channel = ChannelConfig::default();
        if let Some(secs) = timeout_secs.or(self.client.command_timeout_secs) {
            channel = channel.with_command_timeout(Duration::from_secs(secs));
        }

        let mut config = ClientConfig::new(address.unwrap_or(self.client.address.as_str()))
            .with_connect_timeout(Duration::from_secs(self.client.connect_timeout_secs))
            .with_channel(channel);
        if let Some(reconnect) = &self.client.reconnect {
            config = config.with_reconnect(ReconnectPolicy {
                initial_backoff: Duration::from_millis(reconnect.initial_backoff_ms),
                max_backoff: Duration::from_millis(reconnect.max_backoff_ms),
            });
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_gives_defaults() {
        let file = write_config("");
        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.server.bind_address, "0.0.0.0:7070");
        assert_eq!(settings.client.address, "127.0.0.1:7070");
    }

    #[test]
    fn full_file() {
        let file = write_config(
            r#"
[log]
format = "json"
filter = "tidewire_channel=debug"

[server]
bind_address = "127.0.0.1:9000"
max_connections = 4
strict = true

[client]
address = "10.0.0.2:9000"
connect_timeout_secs = 2
command_timeout_secs = 30

[client.reconnect]
initial_backoff_ms = 250
max_backoff_ms = 4000
"#,
        );
        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.log.format, LogFormat::Json);
        assert!(settings.server.strict);

        let server = settings.server_config(None);
        assert_eq!(server.bind_address, "127.0.0.1:9000");
        assert_eq!(server.max_connections, 4);

        let client = settings.client_config(None, None);
        assert_eq!(client.address, "10.0.0.2:9000");
        assert_eq!(client.connect_timeout, Duration::from_secs(2));
        assert_eq!(client.channel.command_timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            client.reconnect,
            Some(ReconnectPolicy {
                initial_backoff: Duration::from_millis(250),
                max_backoff: Duration::from_secs(4),
            })
        );
    }

    #[test]
    fn flags_override_file() {
        let settings = Settings::default();
        let client = settings.client_config(Some("192.168.1.1:1"), Some(3));
        assert_eq!(client.address, "192.168.1.1:1");
        assert_eq!(client.channel.command_timeout, Some(Duration::from_secs(3)));

        let server = settings.server_config(Some("127.0.0.1:0"));
        assert_eq!(server.bind_address, "127.0.0.1:0");
    }

    #[test]
    fn unknown_key_rejected() {
        let file = write_config("[server]\nport = 1\n");
        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse config"), "{err}");
    }

    #[test]
    fn invalid_values_rejected() {
        let file = write_config("[client.reconnect]\ninitial_backoff_ms = 5000\nmax_backoff_ms = 10\n");
        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("initial_backoff_ms"), "{err}");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(Some(dir.path().join("absent.toml").as_path())).unwrap_err();
        assert!(err.to_string().contains("failed to read config"), "{err}");
    }

    #[test]
    fn dump_round_trips() {
        let mut settings = Settings::default();
        settings.client.reconnect = Some(ReconnectSettings::default());
        let text = settings.to_toml().unwrap();
        let parsed: Settings = toml::from_str(&text).unwrap();
        assert_eq!(parsed, settings);
    }
}
