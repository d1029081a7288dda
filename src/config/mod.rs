use std::fs;
use std::path::{Path, PathBuf};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read the config on config/s2v.yaml or s2v.yaml")]
    NotFound,
    #[error("unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
}

fn mqtt_port_default() -> u16 { return 1883 }
fn mqtt_client_name_default() -> String { return "shelly2venus".to_string() }
fn mqtt_topic_root_default() -> String { return "venus".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default="mqtt_port_default")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default="mqtt_client_name_default")]
    pub client_name: String,
    /* Meter items go to <topic_root>/N/..., writes come from <topic_root>/W/... */
    #[serde(default="mqtt_topic_root_default")]
    pub topic_root: String,
}

fn settings_path_default() -> String { return "settings.yaml".to_string() }
fn settings_timeout_default() -> u64 { return 5 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SettingsConfig {
    #[serde(default="settings_path_default")]
    pub path: String,
    /* Seconds to wait for the settings authority */
    #[serde(default="settings_timeout_default")]
    pub timeout: u64,
}

fn shelly_enabled_default() -> bool { return true }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ShellyDeviceConfig {
    pub name: String,
    /* MQTT topic prefix configured on the Shelly */
    pub prefix: String,
    #[serde(default="shelly_enabled_default")]
    pub enabled: bool,
}

fn settings_default() -> SettingsConfig {
    return SettingsConfig { path: settings_path_default(), timeout: settings_timeout_default() };
}
fn devices_default() -> Vec<ShellyDeviceConfig> { return Vec::new() }
fn retry_interval_default() -> u64 { return 10 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default="settings_default")]
    pub settings: SettingsConfig,
    #[serde(default="devices_default")]
    pub devices: Vec<ShellyDeviceConfig>,
    #[serde(default="retry_interval_default")]
    pub retry_interval: u64,
    #[serde(skip)]
    pub base_path: PathBuf,
}

impl Config {
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        return Ok(serde_yml::from_str(contents)?);
    }

    /// Look for config/s2v.yaml first, then s2v.yaml
    pub fn load() -> Result<Self, ConfigError> {
        for (file, base) in [("config/s2v.yaml", "config"), ("s2v.yaml", "")] {
            if let Ok(contents) = fs::read_to_string(file) {
                info!("Using config {file}");
                let mut c = Config::parse(&contents)?;
                c.base_path = PathBuf::from(base);
                return Ok(c);
            }
        }

        return Err(ConfigError::NotFound);
    }

    /// The settings file lives next to the config unless an absolute path is given
    pub fn settings_file(&self) -> PathBuf {
        let p = Path::new(&self.settings.path);
        if p.is_absolute() {
            return p.to_path_buf();
        }
        return self.base_path.join(p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let c = Config::parse("mqtt:\n  host: venus.local\n").unwrap();
        assert_eq!(c.mqtt.host, "venus.local");
        assert_eq!(c.mqtt.port, 1883);
        assert_eq!(c.mqtt.topic_root, "venus");
        assert_eq!(c.settings.timeout, 5);
        assert_eq!(c.retry_interval, 10);
        assert!(c.devices.is_empty());
        assert_eq!(c.settings_file(), PathBuf::from("settings.yaml"));
    }

    #[test]
    fn test_devices() {
        let yaml = r#"
mqtt:
  host: localhost
  user: user
  pass: secret
devices:
  - name: house
    prefix: shellypro3em-aabbcc
  - name: garage
    prefix: shellypro3pm-ddeeff
    enabled: false
"#;
        let mut c = Config::parse(yaml).unwrap();
        assert_eq!(c.devices.len(), 2);
        assert!(c.devices[0].enabled);
        assert!(!c.devices[1].enabled);

        c.base_path = PathBuf::from("config");
        assert_eq!(c.settings_file(), PathBuf::from("config/settings.yaml"));
    }

    #[test]
    fn test_missing_mqtt_is_an_error() {
        assert!(matches!(Config::parse("devices: []"), Err(ConfigError::Parse(_))));
    }
}
