use crate::state::{shared, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Vue santé retournée par l'opération health()
#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub schema_version: i64,
    pub degraded: bool,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    pub devices_known: usize,
    pub active_intents: i64,
    pub components: std::collections::BTreeMap<String, String>,
}

/// Suivi de santé des composants du kernel. Cloné partout, état partagé.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_status: Shared<String>,
    mqtt_reconnects: Arc<AtomicU32>,
    degraded: Arc<AtomicBool>,
    schema_version: Arc<AtomicI64>,
    components: Shared<std::collections::BTreeMap<String, String>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_status: shared("connecting".to_string()),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            degraded: Arc::new(AtomicBool::new(false)),
            schema_version: Arc::new(AtomicI64::new(0)),
            components: shared(std::collections::BTreeMap::new()),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn mqtt_connected(&self) -> bool {
        *self.mqtt_status.lock() == "connected"
    }

    /// Mode dégradé : store indisponible, les soumissions sont refusées
    /// mais l'enforcement des policies déjà appliquées continue.
    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn set_schema_version(&self, version: i64) {
        self.schema_version.store(version, Ordering::Relaxed);
    }

    pub fn set_component(&self, name: &str, status: &str) {
        self.components.lock().insert(name.to_string(), status.to_string());
    }

    pub fn snapshot(&self, devices_known: usize, active_intents: i64) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            schema_version: self.schema_version.load(Ordering::Relaxed),
            degraded: self.is_degraded(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            devices_known,
            active_intents,
            components: self.components.lock().clone(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
