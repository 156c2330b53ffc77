//! Metric sink boundary. Gather passes hand their records to an
//! [`Accumulator`]; the binary drains a [`PointBuffer`] into the
//! [`MqttPublisher`], which ships each record as one JSON document.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{Receiver, Sender};

use crate::config::MqttConfig;

/// One timestamped, tagged record produced by a gather pass.
#[derive(Debug, Clone, Serialize)]
pub struct MetricPoint {
    pub measurement: String,
    pub tags: HashMap<String, String>,
    pub fields: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

pub trait Accumulator {
    fn add_fields(
        &mut self,
        measurement: &str,
        fields: Map<String, Value>,
        tags: HashMap<String, String>,
        timestamp: DateTime<Utc>,
    );
}

/// In-memory accumulator; the poll loop drains it after every pass.
#[derive(Default)]
pub struct PointBuffer {
    points: Vec<MetricPoint>,
}

impl PointBuffer {
    pub fn new() -> Self {
        PointBuffer::default()
    }

    pub fn drain(&mut self) -> Vec<MetricPoint> {
        std::mem::take(&mut self.points)
    }
}

impl Accumulator for PointBuffer {
    fn add_fields(
        &mut self,
        measurement: &str,
        fields: Map<String, Value>,
        tags: HashMap<String, String>,
        timestamp: DateTime<Utc>,
    ) {
        self.points.push(MetricPoint {
            measurement: measurement.to_string(),
            tags,
            fields,
            timestamp,
        });
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    eventloop: EventLoop,
    base_topic: String,
    receiver: Receiver<MetricPoint>,
}

impl MqttPublisher {
    pub fn new(cfg: &MqttConfig) -> (Self, Sender<MetricPoint>) {
        let mut options = MqttOptions::new(cfg.client_name.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(30));
        if !cfg.user.is_empty() {
            options.set_credentials(cfg.user.clone(), cfg.pass.clone());
        }
        let (client, eventloop) = AsyncClient::new(options, 10);
        let (sender, receiver) = tokio::sync::mpsc::channel(64);
        (
            MqttPublisher {
                client,
                eventloop,
                base_topic: cfg.base_topic.clone(),
                receiver,
            },
            sender,
        )
    }

    pub async fn start_thread(mut self) {
        info!("Starting MQTT publisher");
        loop {
            tokio::select! {
                point = self.receiver.recv() => {
                    let Some(point) = point else {
                        info!("All record senders are gone, stopping MQTT publisher");
                        break;
                    };
                    self.publish(point).await;
                }
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => info!("MQTT connected"),
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT connection error: {e}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }

    async fn publish(&mut self, point: MetricPoint) {
        let topic = point_topic(&self.base_topic, &point);
        match serde_json::to_string(&point) {
            Ok(payload) => {
                debug!("publishing to {topic}: {payload}");
                if let Err(e) = self
                    .client
                    .publish(topic, QoS::AtLeastOnce, false, payload)
                    .await
                {
                    error!("MQTT publish failed: {e}");
                }
            }
            Err(e) => error!("Unable to serialize metric point: {e}"),
        }
    }
}

/// Records for a meter land under `<base_topic>/<meter id>`; records
/// gathered before the meter ever identified itself go to `unknown`.
fn point_topic(base_topic: &str, point: &MetricPoint) -> String {
    let meter = point
        .tags
        .get("id")
        .filter(|id| !id.is_empty())
        .map(String::as_str)
        .unwrap_or("unknown");
    format!("{base_topic}/{meter}")
}
