use std::path::Path;
use std::time::Duration;

use serde_derive::Deserialize;

use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::staleness::{DEFAULT_STALENESS, DEFAULT_SWEEP_INTERVAL};

const DEFAULT_ID: &str = "bay-01";
const DEFAULT_TRACKED_IDS: &str = "A1,A2,A3";
const DEFAULT_RETAIN_WARNING: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A missing `[mqtt]` section selects demo mode.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct AppConfig {
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub demo: DemoConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub reconnect_interval_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// One bay at a time, `status` + `heartbeat` topics.
    #[default]
    Single,
    /// Every tracked bay, `status` + `distance` + `online` topics.
    Multi,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct TrackingConfig {
    pub variant: Option<Variant>,
    pub default_id: Option<String>,
    /// Comma-separated, e.g. `"A1,A2,A3"`.
    pub ids: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct TimingConfig {
    pub retain_warning_ms: Option<u64>,
    pub staleness_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub history_capacity: Option<usize>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ReplicationConfig {
    /// Defaults to the first tracked id in the multi variant; `""` disables.
    pub source: Option<String>,
    /// Comma-separated; defaults to the tracked ids.
    pub targets: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct DemoConfig {
    /// 0 seeds from entropy.
    pub seed: Option<u64>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::de::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(mqtt) = &self.mqtt {
            if mqtt.host.trim().is_empty() {
                return Err(ConfigError::Invalid("mqtt.host is empty".to_string()));
            }
        }
        if self.timing.history_capacity == Some(0) {
            return Err(ConfigError::Invalid(
                "timing.history_capacity must be at least 1".to_string(),
            ));
        }
        if self.timing.sweep_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "timing.sweep_interval_ms must be positive".to_string(),
            ));
        }
        if self.tracking.variant() == Variant::Multi && self.tracking.tracked_ids().is_empty() {
            return Err(ConfigError::Invalid("tracking.ids lists no bays".to_string()));
        }
        Ok(())
    }
}

impl MqttConfig {
    pub fn topic_path(&self) -> String {
        self.topic_path.clone().unwrap_or_else(|| "parking".to_string())
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.unwrap_or(2_000))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(8_000))
    }
}

impl TrackingConfig {
    pub fn variant(&self) -> Variant {
        self.variant.unwrap_or_default()
    }

    pub fn default_id(&self) -> String {
        self.default_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(DEFAULT_ID)
            .to_string()
    }

    pub fn tracked_ids(&self) -> Vec<String> {
        split_ids(self.ids.as_deref().unwrap_or(DEFAULT_TRACKED_IDS))
    }
}

impl TimingConfig {
    pub fn retain_warning(&self) -> Duration {
        self.retain_warning_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RETAIN_WARNING)
    }

    pub fn staleness(&self) -> Duration {
        self.staleness_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_STALENESS)
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity.unwrap_or(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ReplicationConfig {
    pub fn source(&self, tracking: &TrackingConfig) -> Option<String> {
        match self.source.as_deref().map(str::trim) {
            Some("") => None,
            Some(id) => Some(id.to_string()),
            None if tracking.variant() == Variant::Multi => {
                tracking.tracked_ids().into_iter().next()
            }
            None => None,
        }
    }

    pub fn targets(&self, tracking: &TrackingConfig) -> Vec<String> {
        match self.targets.as_deref() {
            Some(targets) => split_ids(targets),
            None => tracking.tracked_ids(),
        }
    }
}

/// Splits a comma-separated id list, dropping blanks and repeats.
fn split_ids(raw: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in raw.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        if !ids.iter().any(|known| known == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [mqtt]
            host = "localhost"
            port = 1883
            username = "user"
            password = "pass"
            topic_path = "parking/space"
            reconnect_interval_ms = 1000

            [tracking]
            variant = "multi"
            ids = "A1, A2,,A3,A2"

            [timing]
            staleness_ms = 5000
            history_capacity = 5

            [replication]
            source = "A1"
        "#;
        let config = AppConfig::parse(config_str).unwrap();
        let mqtt = config.mqtt.as_ref().unwrap();
        assert!(mqtt.host == "localhost");
        assert_eq!(mqtt.topic_path(), "parking/space");
        assert_eq!(mqtt.reconnect_interval(), Duration::from_secs(1));
        assert_eq!(mqtt.connect_timeout(), Duration::from_secs(8));
        assert!(config.mqtt.is_some());

        assert_eq!(config.tracking.variant(), Variant::Multi);
        assert_eq!(config.tracking.tracked_ids(), vec!["A1", "A2", "A3"]);
        assert_eq!(config.timing.staleness(), Duration::from_secs(5));
        assert_eq!(config.timing.retain_warning(), Duration::from_secs(3));
        assert_eq!(config.timing.history_capacity(), 5);
        assert_eq!(
            config.replication.source(&config.tracking).as_deref(),
            Some("A1")
        );
        assert_eq!(
            config.replication.targets(&config.tracking),
            vec!["A1", "A2", "A3"]
        );
    }

    #[test]
    fn test_empty_config_is_demo_with_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert!(config.mqtt.is_none());
        assert_eq!(config.tracking.variant(), Variant::Single);
        assert_eq!(config.tracking.default_id(), "bay-01");
        assert_eq!(config.timing.sweep_interval(), Duration::from_secs(1));
        assert_eq!(config.timing.staleness(), Duration::from_secs(10));
        assert_eq!(config.timing.history_capacity(), 20);
        assert_eq!(config.replication.source(&config.tracking), None);
    }

    #[test]
    fn test_multi_replicates_first_tracked_id_by_default() {
        let config = AppConfig::parse("[tracking]\nvariant = \"multi\"\nids = \"B7,B8\"\n").unwrap();
        assert_eq!(
            config.replication.source(&config.tracking).as_deref(),
            Some("B7")
        );

        let disabled = AppConfig::parse(
            "[tracking]\nvariant = \"multi\"\n\n[replication]\nsource = \"\"\n",
        )
        .unwrap();
        assert_eq!(disabled.replication.source(&disabled.tracking), None);
    }

    #[test]
    fn test_example_config_parses() {
        let config = AppConfig::parse(include_str!("../config.example.toml")).unwrap();
        assert_eq!(config.mqtt.map(|m| m.topic_path()).as_deref(), Some("parking"));
        assert_eq!(config.demo.seed, Some(0));
    }

    #[test]
    fn test_blank_default_id_falls_back() {
        let config = AppConfig::parse("[tracking]\ndefault_id = \"   \"\n").unwrap();
        assert_eq!(config.tracking.default_id(), "bay-01");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let zero_capacity = AppConfig::parse("[timing]\nhistory_capacity = 0\n");
        assert!(matches!(zero_capacity, Err(ConfigError::Invalid(_))));

        let no_ids = AppConfig::parse("[tracking]\nvariant = \"multi\"\nids = \" , \"\n");
        assert!(matches!(no_ids, Err(ConfigError::Invalid(_))));

        let bad_toml = AppConfig::parse("[mqtt\nhost = 1");
        assert!(matches!(bad_toml, Err(ConfigError::Parse(_))));
    }
}
