//! Layered configuration: compiled defaults, then `sumika.json`, then
//! `SUMIKA_*` environment variables. Later layers win.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub mqtt: MqttConfig,
    pub websocket: WebsocketConfig,
    pub voice: VoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,sumika=debug".to_string(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./build-data"),
            backup_dir: PathBuf::from("./build-data/backups"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Topic root the gateway publishes under.
    pub base_topic: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            user: None,
            password: None,
            base_topic: "zigbee2mqtt".to_string(),
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsocketConfig {
    /// Per-client outbound queue depth; a client that falls this far behind
    /// is disconnected.
    pub queue_capacity: usize,
    pub ping_interval_secs: u64,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            ping_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub enabled: bool,
    /// Command line for the speech-to-intent worker subprocess.
    pub worker_command: Vec<String>,
    /// Where the intent table for the worker is written.
    pub intents_path: PathBuf,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            worker_command: vec!["python3".to_string(), "assets/voice/worker.py".to_string()],
            intents_path: PathBuf::from("assets/voice/intents.json"),
        }
    }
}

impl Config {
    /// Load configuration. `path` defaults to `./sumika.json`; a missing file
    /// is fine (defaults apply), a malformed one is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(|| Path::new("sumika.json"));

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("invalid config file {:?}: {}", path, e))?
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Apply `SUMIKA_*` environment overrides on top of file/default values.
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("SUMIKA_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse("SUMIKA_PORT") {
            self.server.port = port;
        }
        if let Ok(dir) = std::env::var("SUMIKA_DATA_DIR") {
            self.database.data_dir = PathBuf::from(dir);
        }
        if let Ok(broker) = std::env::var("SUMIKA_MQTT_BROKER") {
            self.mqtt.broker = broker;
        }
        if let Some(port) = env_parse("SUMIKA_MQTT_PORT") {
            self.mqtt.port = port;
        }
        if let Ok(user) = std::env::var("SUMIKA_MQTT_USER") {
            self.mqtt.user = Some(user);
        }
        if let Ok(password) = std::env::var("SUMIKA_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Ok(level) = std::env::var("SUMIKA_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(debug) = std::env::var("SUMIKA_DEBUG") {
            self.logging.debug = matches!(debug.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.mqtt.base_topic, "zigbee2mqtt");
        assert_eq!(config.database.data_dir, PathBuf::from("./build-data"));
        assert!(!config.voice.enabled);
    }

    #[test]
    fn file_layer_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sumika.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9000}, "mqtt": {"broker": "mqtt.local"}}"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.mqtt.broker, "mqtt.local");
        // Untouched sections keep their defaults
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("nope.json"))).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sumika.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
