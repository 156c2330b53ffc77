//! CE102M meter reader.
//!
//! Polls CE102M power meters over a serial-to-TCP bridge using the
//! IEC 62056-21 protocol and exports tariff totals, device status flags
//! and connectivity changes as timestamped records over MQTT.

pub mod config;
pub mod iec62056;
pub mod metering_ce102m;
pub mod mqtt;

// Re-export common types for easier access
pub use config::{Ce102mConfig, Config, CONFIG};
pub use iec62056::tcp::TcpDialer;
pub use metering_ce102m::{Ce102mDevice, ConfigError, MeterError};
pub use mqtt::{Accumulator, MetricPoint, MqttPublisher, PointBuffer};
