//! Weft node simulator - stand-in IoT endpoint for development
//!
//! Behaves like a fleet device without hardware:
//! - Announces a retained online status on `iot/<id>/status` (offline as
//!   last-will) so the kernel's device enforcer sees births and deaths
//! - Subscribes to `iot/<id>/control` and applies SET_* commands to its
//!   local configuration
//! - Publishes telemetry on `iot/<id>/telemetry` at the configured
//!   interval, mirroring its configuration fields so the kernel's ack
//!   window sees the reflection of every change

use anyhow::{Context, Result};
use rand::Rng;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Mutable device configuration, mirrored verbatim into telemetry
#[derive(Debug, Clone, Serialize)]
struct NodeConfig {
    interval_ms: u64,
    qos: u8,
    enabled: bool,
    gain: f64,
    resolution: String,
    quality: i64,
    brightness: i64,
    capture_interval_ms: u64,
    power_saving: bool,
    profile: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            qos: 0,
            enabled: true,
            gain: 1.0,
            resolution: "SVGA".to_string(),
            quality: 15,
            brightness: 0,
            capture_interval_ms: 1000,
            power_saving: false,
            profile: "standard".to_string(),
        }
    }
}

struct Node {
    id: String,
    kind: String,
    config: NodeConfig,
    client: AsyncClient,
    control_rx: mpsc::Receiver<serde_json::Value>,
}

impl Node {
    async fn connect(id: String, kind: String, broker: String, port: u16) -> Result<Self> {
        let status_topic = format!("iot/{id}/status");
        let offline = serde_json::to_vec(&json!({ "device_id": id, "status": "offline" }))?;

        let mut options = MqttOptions::new(format!("node-sim-{id}"), broker, port);
        options.set_keep_alive(Duration::from_secs(15));
        options.set_last_will(LastWill::new(&status_topic, offline, QoS::AtLeastOnce, true));

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let (control_tx, control_rx) = mpsc::channel::<serde_json::Value>(16);

        let control_topic = format!("iot/{id}/control");
        let node_id = id.clone();
        let loop_client = client.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("node {node_id} connected");
                        if let Err(e) = loop_client.subscribe(&control_topic, QoS::AtLeastOnce).await {
                            error!("control subscribe failed: {e:?}");
                        }
                        let online = json!({ "device_id": node_id, "status": "online" });
                        let _ = loop_client
                            .publish(
                                format!("iot/{node_id}/status"),
                                QoS::AtLeastOnce,
                                true,
                                serde_json::to_vec(&online).unwrap_or_default(),
                            )
                            .await;
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        match serde_json::from_slice::<serde_json::Value>(&publish.payload) {
                            Ok(payload) => {
                                let _ = control_tx.send(payload).await;
                            }
                            Err(e) => warn!("bad control payload: {e}"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("mqtt error: {e:?}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Ok(Node { id, kind, config: NodeConfig::default(), client, control_rx })
    }

    /// Applies a control message to the local configuration
    fn apply_control(&mut self, message: &serde_json::Value) {
        let command = message.get("command").and_then(|v| v.as_str()).unwrap_or("");
        info!("node {} applying {command}", self.id);
        match command {
            "SET_SAMPLING_INTERVAL" | "SET_PUBLISH_INTERVAL" => {
                if let Some(ms) = message.get("interval_ms").and_then(|v| v.as_u64()) {
                    self.config.interval_ms = ms.max(100);
                }
            }
            "SET_MQTT_QOS" => {
                if let Some(qos) = message.get("qos").and_then(|v| v.as_u64()) {
                    self.config.qos = qos.min(2) as u8;
                }
            }
            "SET_AUDIO_GAIN" => {
                if let Some(gain) = message.get("gain").and_then(|v| v.as_f64()) {
                    self.config.gain = gain;
                }
            }
            "SET_CAMERA_RESOLUTION" => {
                if let Some(res) = message.get("resolution").and_then(|v| v.as_str()) {
                    self.config.resolution = res.to_string();
                }
            }
            "SET_CAMERA_QUALITY" => {
                if let Some(quality) = message.get("quality").and_then(|v| v.as_i64()) {
                    self.config.quality = quality.clamp(0, 63);
                }
            }
            "SET_CAMERA_BRIGHTNESS" => {
                if let Some(brightness) = message.get("brightness").and_then(|v| v.as_i64()) {
                    self.config.brightness = brightness.clamp(-2, 2);
                }
            }
            "SET_CAMERA_FRAMERATE" => {
                if let Some(ms) = message.get("capture_interval_ms").and_then(|v| v.as_u64()) {
                    self.config.capture_interval_ms = ms.max(33);
                }
            }
            "SET_POWER_SAVING" => {
                if let Some(enabled) = message.get("enabled").and_then(|v| v.as_bool()) {
                    self.config.power_saving = enabled;
                }
            }
            "SET_SECURITY_PROFILE" => {
                if let Some(profile) = message.get("profile").and_then(|v| v.as_str()) {
                    self.config.profile = profile.to_string();
                }
            }
            "ENABLE" => self.config.enabled = true,
            "DISABLE" => self.config.enabled = false,
            "RESET" => self.config = NodeConfig::default(),
            other => warn!("unknown command ignored: {other}"),
        }
    }

    /// Telemetry payload: simulated readings + mirrored configuration
    fn telemetry(&self) -> serde_json::Value {
        let mut rng = rand::thread_rng();
        let mut message = json!({
            "device_id": self.id,
            "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
            "battery": (rng.gen_range(80.0..100.0) * 10.0_f64).round() / 10.0,
        });
        match self.kind.as_str() {
            "camera" => {
                message["fps"] = json!(1000.0 / self.config.capture_interval_ms as f64);
                message["bandwidth_bps"] = json!(rng.gen_range(100_000..400_000));
            }
            "audio" => {
                message["level_db"] = json!((rng.gen_range(-40.0..-10.0_f64) * 10.0).round() / 10.0);
            }
            _ => {
                message["temperature"] = json!(((20.0 + rng.gen_range(-5.0..5.0_f64)) * 10.0).round() / 10.0);
                message["co2_ppm"] = json!(rng.gen_range(400..900));
                message["latency_ms"] = json!((rng.gen_range(5.0..50.0_f64) * 10.0).round() / 10.0);
            }
        }
        // Reflet de la configuration courante pour l'ack du kernel
        if let Ok(config) = serde_json::to_value(&self.config) {
            if let (Some(message), Some(config)) = (message.as_object_mut(), config.as_object()) {
                for (key, value) in config {
                    message.insert(key.clone(), value.clone());
                }
            }
        }
        message
    }

    async fn run(&mut self) -> Result<()> {
        let telemetry_topic = format!("iot/{}/telemetry", self.id);
        loop {
            let sleep = tokio::time::sleep(Duration::from_millis(self.config.interval_ms));
            tokio::select! {
                control = self.control_rx.recv() => {
                    match control {
                        Some(message) => {
                            self.apply_control(&message);
                            // Reflet immédiat, sans attendre le prochain tick
                            self.publish_telemetry(&telemetry_topic).await;
                        }
                        None => break Ok(()),
                    }
                }
                _ = sleep => {
                    if self.config.enabled {
                        self.publish_telemetry(&telemetry_topic).await;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("node {} going offline", self.id);
                    let offline = json!({ "device_id": self.id, "status": "offline" });
                    let _ = self.client
                        .publish(
                            format!("iot/{}/status", self.id),
                            QoS::AtLeastOnce,
                            true,
                            serde_json::to_vec(&offline)?,
                        )
                        .await;
                    let _ = self.client.disconnect().await;
                    break Ok(());
                }
            }
        }
    }

    async fn publish_telemetry(&self, topic: &str) {
        let qos = match self.config.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        };
        let payload = match serde_json::to_vec(&self.telemetry()) {
            Ok(p) => p,
            Err(e) => {
                error!("telemetry encode failed: {e}");
                return;
            }
        };
        if let Err(e) = self.client.publish(topic, qos, false, payload).await {
            error!("telemetry publish failed: {e:?}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("node_sim=info")),
        )
        .init();

    let id = std::env::var("NODE_ID").unwrap_or_else(|_| "temp-01".to_string());
    let kind = std::env::var("NODE_KIND").unwrap_or_else(|_| "sensor".to_string());
    let broker = std::env::var("MQTT_BROKER").unwrap_or_else(|_| "localhost".to_string());
    let port: u16 = std::env::var("MQTT_PORT")
        .unwrap_or_else(|_| "1883".to_string())
        .parse()
        .context("bad MQTT_PORT")?;

    info!("starting node simulator {id} ({kind}) against {broker}:{port}");
    let mut node = Node::connect(id, kind, broker, port).await?;
    node.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_node() -> Node {
        // Client jamais connecté : suffisant pour tester apply_control
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 1);
        let (_tx, control_rx) = mpsc::channel(1);
        Node {
            id: "temp-01".into(),
            kind: "sensor".into(),
            config: NodeConfig::default(),
            client,
            control_rx,
        }
    }

    #[test]
    fn test_apply_sampling_interval() {
        let mut node = offline_node();
        node.apply_control(&json!({ "command": "SET_SAMPLING_INTERVAL", "interval_ms": 30000 }));
        assert_eq!(node.config.interval_ms, 30000);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut node = offline_node();
        node.apply_control(&json!({ "command": "SET_AUDIO_GAIN", "gain": 3.5 }));
        assert!((node.config.gain - 3.5).abs() < f64::EPSILON);
        node.apply_control(&json!({ "command": "RESET" }));
        assert!((node.config.gain - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_telemetry_mirrors_config() {
        let mut node = offline_node();
        node.apply_control(&json!({ "command": "SET_SAMPLING_INTERVAL", "interval_ms": 30000 }));
        let telemetry = node.telemetry();
        assert_eq!(telemetry["interval_ms"], 30000);
        assert_eq!(telemetry["device_id"], "temp-01");
    }

    #[test]
    fn test_quality_clamped() {
        let mut node = offline_node();
        node.apply_control(&json!({ "command": "SET_CAMERA_QUALITY", "quality": 99 }));
        assert_eq!(node.config.quality, 63);
    }
}
