use anyhow::{Context, Result};
use clap::Parser;
use lib_relay::{BrokerConfig, DEFAULT_TOPIC};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "server_relay.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "DHT telemetry relay: MQTT sensor topic to live WebSocket viewers", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "RELAY_PORT", help = "Port to listen on for viewer connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "MQTT_HOST", help = "MQTT broker host.")]
    pub mqtt_host: Option<String>,

    #[clap(long, env = "MQTT_PORT", help = "MQTT broker port.")]
    pub mqtt_port: Option<u16>,

    #[clap(long, env = "MQTT_TOPIC", help = "Topic the sensors publish readings on.")]
    pub mqtt_topic: Option<String>,

    #[clap(long, env = "MQTT_KEEPALIVE_SECONDS", help = "MQTT keepalive interval in seconds.")]
    pub mqtt_keepalive_seconds: Option<u64>,

    #[clap(long, env = "MQTT_CLIENT_ID_PREFIX", help = "Prefix of the generated MQTT client id.")]
    pub mqtt_client_id_prefix: Option<String>,

    #[clap(long, env = "MQTT_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for broker reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "MQTT_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for broker reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "RELAY_SESSION_QUEUE", help = "Readings a viewer may fall behind before it is dropped.")]
    pub session_queue: Option<usize>,

    #[clap(long, env = "RELAY_SEND_TIMEOUT_MS", help = "Timeout in milliseconds for a single write to a viewer.")]
    pub send_timeout_ms: Option<u64>,

    #[clap(long, env = "RELAY_MAX_SESSIONS", help = "Maximum concurrent viewers (unbounded when unset).")]
    pub max_sessions: Option<usize>,

    #[clap(long, env = "RELAY_STALE_AFTER_SECONDS", help = "Seconds without readings before the dataflow monitor warns.")]
    pub stale_after_seconds: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            mqtt_host: other.mqtt_host.or(self.mqtt_host),
            mqtt_port: other.mqtt_port.or(self.mqtt_port),
            mqtt_topic: other.mqtt_topic.or(self.mqtt_topic),
            mqtt_keepalive_seconds: other.mqtt_keepalive_seconds.or(self.mqtt_keepalive_seconds),
            mqtt_client_id_prefix: other.mqtt_client_id_prefix.or(self.mqtt_client_id_prefix),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            session_queue: other.session_queue.or(self.session_queue),
            send_timeout_ms: other.send_timeout_ms.or(self.send_timeout_ms),
            max_sessions: other.max_sessions.or(self.max_sessions),
            stale_after_seconds: other.stale_after_seconds.or(self.stale_after_seconds),
        }
    }

    fn defaults() -> Config {
        let broker = BrokerConfig::default();
        Config {
            port: Some(5000),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            mqtt_host: Some(broker.host),
            mqtt_port: Some(broker.port),
            mqtt_topic: Some(DEFAULT_TOPIC.to_string()),
            mqtt_keepalive_seconds: Some(broker.keep_alive.as_secs()),
            mqtt_client_id_prefix: Some(broker.client_id_prefix),
            reconnect_base_delay_ms: Some(broker.reconnect_base_delay.as_millis() as u64),
            reconnect_max_delay_ms: Some(broker.reconnect_max_delay.as_millis() as u64),
            session_queue: Some(64),
            send_timeout_ms: Some(2000),
            max_sessions: None,
            stale_after_seconds: Some(120),
            config_path: None,
        }
    }
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub broker: BrokerConfig,
    pub session_queue: usize,
    pub send_timeout: Duration,
    pub max_sessions: Option<usize>,
    pub stale_after: Duration,
}

impl Settings {
    fn from_config(config: Config) -> Result<Settings> {
        let defaults = BrokerConfig::default();
        let broker = BrokerConfig {
            host: config.mqtt_host.unwrap_or(defaults.host),
            port: config.mqtt_port.unwrap_or(defaults.port),
            topic: config.mqtt_topic.unwrap_or(defaults.topic),
            keep_alive: config
                .mqtt_keepalive_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.keep_alive),
            client_id_prefix: config.mqtt_client_id_prefix.unwrap_or(defaults.client_id_prefix),
            reconnect_base_delay: config
                .reconnect_base_delay_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(defaults.reconnect_base_delay),
            reconnect_max_delay: config
                .reconnect_max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_max_delay),
        };
        broker.validate().context("Invalid broker configuration")?;

        Ok(Settings {
            port: config.port.unwrap_or(5000),
            log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
            broker,
            session_queue: config.session_queue.unwrap_or(64).max(1),
            send_timeout: Duration::from_millis(config.send_timeout_ms.unwrap_or(2000).max(1)),
            max_sessions: config.max_sessions,
            stale_after: Duration::from_secs(config.stale_after_seconds.unwrap_or(120).max(1)),
        })
    }
}

/// Reads the command line and environment (clap exits on unparsable values), then
/// layers them over the config file and the defaults.
pub fn load_config() -> Result<Settings> {
    resolve(Config::parse())
}

/// Defaults < config file < environment/CLI.
pub fn resolve(cli: Config) -> Result<Settings> {
    let explicit_path = cli.config_path.is_some();
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();

    // A missing default file is fine; a file the operator pointed at must load.
    if config_file_path.exists() {
        let config_str = fs::read_to_string(&config_file_path)
            .with_context(|| format!("Failed to read config file {}", config_file_path.display()))?;
        let file_config: Config = serde_json::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file {}", config_file_path.display()))?;
        current_config = current_config.merge(file_config);
    } else if explicit_path {
        anyhow::bail!("Config file not found: {}", config_file_path.display());
    }

    Settings::from_config(current_config.merge(cli))
}
