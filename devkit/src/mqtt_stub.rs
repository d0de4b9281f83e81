/*!
Transport MQTT simulé pour développer et tester sans broker

Joue le broker et les devices à la fois :
- côté kernel : publish/subscribe compatibles avec rumqttc::AsyncClient,
  journal des publications pour les assertions
- côté devices : simulate_telemetry / simulate_status injectent des
  messages conformes aux contrats wire sur les topics iot/<id>/...
- les messages de contrôle (SET_*, RESET) publiés par le device enforcer
  se relisent décodés via control_messages / last_control
*/

use anyhow::Result;
use rumqttc::QoS;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Transport simulé, clonable ; tous les clones partagent le journal
#[derive(Clone)]
pub struct MockTransport {
    published: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    incoming: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            incoming: Arc::new(Mutex::new(None)),
        }
    }

    /// Canal des messages entrants simulés. Le harnais le draine et les
    /// traduit en événements kernel, comme la task transport réelle.
    pub fn incoming_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.incoming.lock().unwrap() = Some(sender);
        receiver
    }

    /// Publication côté kernel, signature alignée sur AsyncClient
    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage { topic: topic.into(), payload: payload.into(), qos, retain };
        debug!(topic = %message.topic, bytes = message.payload.len(), "mock publish");
        self.published.lock().unwrap().push(message);
        Ok(())
    }

    pub async fn subscribe<S: Into<String>>(&self, topic: S, _qos: QoS) -> Result<()> {
        let topic = topic.into();
        debug!(%topic, "mock subscribe");
        self.subscriptions.lock().unwrap().push(topic);
        Ok(())
    }

    fn inject(&self, topic: String, payload: Vec<u8>, retain: bool) -> Result<()> {
        debug!(%topic, "mock incoming");
        let message = MockMessage { topic, payload, qos: QoS::AtLeastOnce, retain };
        if let Some(sender) = self.incoming.lock().unwrap().as_ref() {
            sender
                .send(message)
                .map_err(|e| anyhow::anyhow!("incoming channel closed: {e}"))?;
        }
        Ok(())
    }

    /// Télémétrie d'un device : contrat wire complet (device_id,
    /// timestamp, mesures et reflets de configuration)
    pub fn simulate_telemetry(&self, device_id: &str, fields: &[(&str, Value)]) -> Result<()> {
        let message = crate::fixtures::telemetry_message(device_id, fields);
        self.inject(
            format!("iot/{device_id}/telemetry"),
            serde_json::to_vec(&message)?,
            false,
        )
    }

    /// Annonce online/offline d'un device, retained comme chez un broker
    pub fn simulate_status(&self, device_id: &str, online: bool) -> Result<()> {
        let message = crate::fixtures::status_message(device_id, online);
        self.inject(
            format!("iot/{device_id}/status"),
            serde_json::to_vec(&message)?,
            true,
        )
    }

    /// Messages de contrôle décodés reçus par un device, dans l'ordre
    pub fn control_messages(&self, device_id: &str) -> Vec<Value> {
        let topic = format!("iot/{device_id}/control");
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic == topic)
            .filter_map(|m| serde_json::from_slice(&m.payload).ok())
            .collect()
    }

    /// Dernier message de contrôle reçu par un device
    pub fn last_control(&self, device_id: &str) -> Option<Value> {
        self.control_messages(device_id).pop()
    }

    /// Publications brutes sur un topic donné
    pub fn published_on(&self, topic: &str) -> Vec<MockMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_control_messages_decoded_in_order() {
        let transport = MockTransport::new();

        let first = json!({ "command": "SET_SAMPLING_INTERVAL", "interval_ms": 30000 });
        let second = json!({ "command": "RESET" });
        transport
            .publish("iot/temp-01/control", QoS::AtLeastOnce, false, serde_json::to_vec(&first).unwrap())
            .await
            .unwrap();
        transport
            .publish("iot/temp-01/control", QoS::AtLeastOnce, false, serde_json::to_vec(&second).unwrap())
            .await
            .unwrap();

        let messages = transport.control_messages("temp-01");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["interval_ms"], 30000);
        assert_eq!(transport.last_control("temp-01").unwrap()["command"], "RESET");
        assert!(transport.control_messages("temp-02").is_empty());
    }

    #[tokio::test]
    async fn test_simulated_telemetry_reaches_receiver() {
        let transport = MockTransport::new();
        let mut incoming = transport.incoming_receiver();

        transport
            .simulate_telemetry("esp32-audio-1", &[("gain", json!(3.5))])
            .unwrap();

        let message = incoming.recv().await.unwrap();
        assert_eq!(message.topic, "iot/esp32-audio-1/telemetry");
        let payload: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(payload["device_id"], "esp32-audio-1");
        assert_eq!(payload["gain"], 3.5);
        assert!(payload["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_simulated_status_is_retained() {
        let transport = MockTransport::new();
        let mut incoming = transport.incoming_receiver();

        transport.simulate_status("esp32-cam-1", false).unwrap();
        let message = incoming.recv().await.unwrap();
        assert!(message.retain);
        let payload: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(payload["status"], "offline");
    }
}
