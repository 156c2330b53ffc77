use lazy_static::lazy_static;
use serde::Deserialize;
use std::fs;

use crate::metering_ce102m::duration::PollInterval;

fn client_name_default() -> String {
    "ce102m2mqtt".to_string()
}
fn base_topic_default() -> String {
    "ce102m2mqtt".to_string()
}

#[derive(Deserialize, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default = "base_topic_default")]
    pub base_topic: String,
    #[serde(default = "client_name_default")]
    pub client_name: String,
}

fn tariff_prefix_default() -> String {
    "chan_".to_string()
}
fn read_interval_default() -> u64 {
    60
}

#[derive(Deserialize, Clone)]
pub struct Ce102mConfig {
    pub name: String,
    /// tcp socket address of the rs485-to-ethernet converter.
    #[serde(default)]
    pub socket: String,
    /// device address, optional for broadcast.
    #[serde(default)]
    pub address: String,
    /// even parity handled manually when the bridge is pinned to 8N1.
    #[serde(default)]
    pub software_parity: bool,
    /// status request interval, never requested when omitted or zero.
    #[serde(default)]
    pub status_interval: PollInterval,
    /// timezone of the device system time, UTC when omitted.
    #[serde(default)]
    pub systime_tz: String,
    /// log protocol frames at debug instead of trace level.
    #[serde(default)]
    pub log_protocol: bool,
    /// query only these tariffs (1..5); empty means the summary.
    #[serde(default)]
    pub tariff_include: Vec<u8>,
    /// value field prefix for a tariff.
    #[serde(default = "tariff_prefix_default")]
    pub tariff_prefix: String,
    /// seconds between gather passes.
    #[serde(default = "read_interval_default")]
    pub read_interval: u64,
}

fn devices_default() -> Vec<Ce102mConfig> {
    Vec::new()
}

#[derive(Deserialize, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default = "devices_default")]
    pub ce102m: Vec<Ce102mConfig>,
}

impl Config {
    pub fn parse(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }

    pub fn load() -> Self {
        /* Check for the two paths of the config file */
        let contents = fs::read_to_string("config/c2m.yaml")
            .or_else(|_| fs::read_to_string("c2m.yaml"))
            .expect("Unable to read the config on config/c2m.yaml or c2m.yaml");
        Config::parse(&contents).expect("Unable to parse config file")
    }
}

lazy_static! {
    pub static ref CONFIG: Config = Config::load();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
mqtt:
  host: localhost
  port: 1883
ce102m:
  - name: meter1
    socket: "localhost:4001"
    software_parity: true
    status_interval: "1d"
    systime_tz: "Europe/Moscow"
    tariff_include: [2, 3]
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.mqtt.base_topic, "ce102m2mqtt");
        assert_eq!(config.mqtt.client_name, "ce102m2mqtt");
        assert_eq!(config.ce102m.len(), 1);

        let device = &config.ce102m[0];
        assert_eq!(device.socket, "localhost:4001");
        assert!(device.software_parity);
        assert!(!device.status_interval.is_empty());
        assert_eq!(device.tariff_include, vec![2, 3]);
        assert_eq!(device.tariff_prefix, "chan_");
        assert_eq!(device.read_interval, 60);
        assert_eq!(device.address, "");
    }

    #[test]
    fn rejects_bad_interval_text() {
        let broken = SAMPLE.replace("\"1d\"", "\"1x\"");
        assert!(Config::parse(&broken).is_err());
    }

    #[test]
    fn reads_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let contents = fs::read_to_string(file.path()).unwrap();
        let config = Config::parse(&contents).unwrap();
        assert_eq!(config.ce102m[0].name, "meter1");
    }
}
