/**
 * TRANSPORT MQTT - I/O pub/sub du kernel Weft
 *
 * RÔLE :
 * Task unique qui possède le client MQTT : souscrit aux topics de
 * télémétrie des devices et au status topic (retained), dépose les
 * messages entrants sur les files bornées des workers, draine l'outbox
 * des publications sortantes.
 *
 * Aucune callback réentrante dans le kernel : tout passe par messages.
 * Reconnexion avec backoff ; après reconnexion les souscriptions sont
 * rejouées et le device worker reçoit TransportReconnected pour
 * re-vérifier les policies appliquées.
 *
 * La télémétrie alimente aussi metrics_history (ingestion idempotente,
 * les doublons du rejeu at-least-once sont ignorés par le store).
 */

use crate::catalog::CatalogHandle;
use crate::enforce::device::DeviceEvent;
use crate::health::HealthTracker;
use crate::metrics::KernelMetrics;
use crate::models::{MetricSample, ParamMap};
use crate::store::Store;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Publication sortante déposée par les enforcers
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Démarre la task transport et rend l'outbox.
/// `device_events` reçoit Telemetry / Status / TransportReconnected.
pub fn spawn_transport(
    mqtt: crate::config::MqttConf,
    catalog: CatalogHandle,
    store: Store,
    metrics: Arc<KernelMetrics>,
    health: HealthTracker,
    device_events: mpsc::Sender<DeviceEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::Sender<OutboundMessage> {
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<OutboundMessage>(256);

    tokio::spawn(async move {
        let mut options = MqttOptions::new("weft-kernel", &mqtt.host, mqtt.port);
        options.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("transport stopping");
                        let _ = client.disconnect().await;
                        break;
                    }
                }
                outbound = outbox_rx.recv() => {
                    let Some(message) = outbound else { break };
                    if let Err(e) = client
                        .publish(&message.topic, message.qos, message.retain, message.payload)
                        .await
                    {
                        error!(topic = %message.topic, error = ?e, "publish failed");
                    }
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("mqtt connected to {}:{}", mqtt.host, mqtt.port);
                            health.mark_mqtt_connected();
                            subscribe_all(&client, &catalog, &mqtt.status_topic).await;
                            // Première connexion comme reconnexion : les
                            // policies device `applied` sont re-vérifiées
                            let _ = device_events.send(DeviceEvent::TransportReconnected).await;
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            handle_publish(
                                &catalog,
                                &store,
                                &metrics,
                                &device_events,
                                &mqtt.status_topic,
                                &publish.topic,
                                &publish.payload,
                            )
                            .await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = ?e, "mqtt connection error, retrying");
                            health.increment_reconnects();
                            health.mark_mqtt_disconnected();
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        }
    });

    outbox_tx
}

async fn subscribe_all(client: &AsyncClient, catalog: &CatalogHandle, status_topic: &str) {
    if let Err(e) = client.subscribe(status_topic, QoS::AtLeastOnce).await {
        error!(topic = status_topic, error = ?e, "status subscribe failed");
    }
    // Le QoS de télémétrie reste le choix du device ; l'ingestion tolère
    // les doublons du rejeu, on souscrit donc au niveau le plus permissif.
    let snapshot = catalog.snapshot();
    for device in snapshot.devices() {
        if let Err(e) = client.subscribe(&device.telemetry_topic, QoS::AtLeastOnce).await {
            error!(topic = %device.telemetry_topic, error = ?e, "telemetry subscribe failed");
        }
    }
}

/// Route un message entrant : statut device ou télémétrie
async fn handle_publish(
    catalog: &CatalogHandle,
    store: &Store,
    metrics: &Arc<KernelMetrics>,
    device_events: &mpsc::Sender<DeviceEvent>,
    status_pattern: &str,
    topic: &str,
    payload: &[u8],
) {
    let Ok(json) = serde_json::from_slice::<serde_json::Value>(payload) else {
        debug!(topic, "non-JSON payload ignored");
        return;
    };

    if topic_matches(status_pattern, topic) {
        let Some(device_id) = json.get("device_id").and_then(|v| v.as_str()) else {
            warn!(topic, "status message without device_id");
            return;
        };
        let online = json.get("status").and_then(|v| v.as_str()) == Some("online");
        let _ = device_events
            .send(DeviceEvent::Status { device_id: device_id.to_string(), online })
            .await;
        return;
    }

    // Télémétrie : résolution du device par son topic déclaré
    let snapshot = catalog.snapshot();
    let Some(device) = snapshot.devices().find(|d| d.telemetry_topic == topic) else {
        debug!(topic, "message on unknown topic ignored");
        return;
    };
    let Some(flat) = json.as_object() else { return };

    KernelMetrics::incr(&metrics.telemetry_messages_total);

    // Timestamp du device si présent, sinon heure de réception
    let timestamp = flat
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);

    // Ingestion : chaque champ numérique devient un sample idempotent
    for (field, value) in flat {
        if field == "timestamp" || field == "device_id" {
            continue;
        }
        if let Some(number) = value.as_f64() {
            let sample = MetricSample {
                metric_name: field.clone(),
                device_id: Some(device.id.clone()),
                value: number,
                timestamp,
            };
            if let Err(e) = store.append_metric(&sample).await {
                error!(error = %e, "metric append failed");
            }
        }
    }

    let payload_map: ParamMap = flat.clone();
    let _ = device_events
        .send(DeviceEvent::Telemetry { device_id: device.id.clone(), payload: payload_map })
        .await;
}

/// Matching de topic MQTT avec jokers `+` (un niveau) et `#` (suffixe)
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (None, None) => return true,
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches_single_level_wildcard() {
        assert!(topic_matches("iot/+/status", "iot/temp-01/status"));
        assert!(!topic_matches("iot/+/status", "iot/temp-01/telemetry"));
        assert!(!topic_matches("iot/+/status", "iot/a/b/status"));
    }

    #[test]
    fn test_topic_matches_hash_wildcard() {
        assert!(topic_matches("iot/#", "iot/temp-01/telemetry"));
        assert!(topic_matches("iot/#", "iot/x"));
        assert!(!topic_matches("iot/#", "other/x"));
    }

    #[test]
    fn test_topic_matches_exact() {
        assert!(topic_matches("iot/temp-01/control", "iot/temp-01/control"));
        assert!(!topic_matches("iot/temp-01/control", "iot/temp-02/control"));
    }
}
