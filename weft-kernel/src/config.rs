/**
 * CONFIGURATION KERNEL - Paramètres du kernel Weft
 *
 * RÔLE :
 * Charge la configuration centralisée depuis un fichier YAML (weft.yaml
 * ou variable WEFT_KERNEL_CONFIG) avec fallback par défaut.
 *
 * FONCTIONNEMENT :
 * - Parsing YAML -> structures typées avec serde
 * - Pas de crash si config absente ou malformée : défauts + warning
 * - Les trois fichiers du Catalog (devices, grammaire, templates) sont
 *   référencés ici mais chargés/rechargés par le module catalog
 *
 * EXEMPLE WEFT.YAML :
 * ```yaml
 * mqtt:
 *   host: "192.168.1.100"
 *   port: 1883
 * interface: eth0
 * database: data/weft.db
 * catalog:
 *   devices: config/devices.yaml
 *   grammar: config/grammar.yaml
 *   templates: config/templates.yaml
 * feedback:
 *   period_secs: 15
 *   tolerance: 0.10
 * dry_run: true
 * ```
 */

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

/// Configuration principale du kernel Weft
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KernelConfig {
    /// Broker MQTT (host, port)
    #[serde(default)]
    pub mqtt: MqttConf,
    /// Interface réseau gérée par le data plane
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Chemin du fichier SQLite
    #[serde(default = "default_database")]
    pub database: String,
    /// Adresse d'écoute de la surface HTTP
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub catalog: CatalogPaths,
    #[serde(default)]
    pub feedback: FeedbackConf,
    #[serde(default)]
    pub enforcement: EnforcementConf,
    /// Mode dry-run du data plane : valide et enregistre sans exécuter.
    /// Choisi au démarrage, jamais mélangé avec le mode réel.
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    /// Rétention des metric samples en heures
    #[serde(default = "default_retention")]
    pub metrics_retention_hours: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    /// Topic à souscrire pour les annonces online/offline (retained)
    #[serde(default = "default_status_topic")]
    pub status_topic: String,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            status_topic: default_status_topic(),
        }
    }
}

/// Chemins des trois fichiers rechargeables du Catalog
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CatalogPaths {
    pub devices: String,
    pub grammar: String,
    pub templates: String,
}

impl Default for CatalogPaths {
    fn default() -> Self {
        Self {
            devices: "config/devices.yaml".into(),
            grammar: "config/grammar.yaml".into(),
            templates: "config/templates.yaml".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FeedbackConf {
    /// Période T de la boucle (secondes)
    pub period_secs: u64,
    /// Bande de tolérance symétrique autour du goal (fraction)
    pub tolerance: f64,
    /// Pas borné d'ajustement des correctifs (fraction)
    pub correction_step: f64,
}

impl Default for FeedbackConf {
    fn default() -> Self {
        Self { period_secs: 15, tolerance: 0.10, correction_step: 0.25 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnforcementConf {
    /// Deadline dure d'un apply data plane (secondes)
    pub dataplane_deadline_secs: u64,
    /// Deadline dure d'un apply device plane, attente d'ack incluse (secondes)
    pub device_deadline_secs: u64,
    /// Fenêtre d'ack : la télémétrie doit refléter le changement avant expiration (secondes)
    pub ack_window_secs: u64,
    /// Nombre de tentatives avant de marquer la policy failed
    pub max_attempts: u32,
}

impl Default for EnforcementConf {
    fn default() -> Self {
        Self {
            dataplane_deadline_secs: 3,
            device_deadline_secs: 10,
            ack_window_secs: 5,
            max_attempts: 3,
        }
    }
}

fn default_interface() -> String {
    "eth0".into()
}
fn default_database() -> String {
    "data/weft.db".into()
}
fn default_listen() -> String {
    "0.0.0.0:8080".into()
}
fn default_status_topic() -> String {
    "iot/+/status".into()
}
fn default_dry_run() -> bool {
    false
}
fn default_retention() -> u64 {
    24
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            interface: default_interface(),
            database: default_database(),
            listen: default_listen(),
            catalog: CatalogPaths::default(),
            feedback: FeedbackConf::default(),
            enforcement: EnforcementConf::default(),
            dry_run: default_dry_run(),
            metrics_retention_hours: default_retention(),
        }
    }
}

/// Charge la configuration depuis le fichier YAML, défauts en fallback
pub async fn load_config() -> KernelConfig {
    let path = std::env::var("WEFT_KERNEL_CONFIG").unwrap_or_else(|_| "weft.yaml".into());

    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return KernelConfig::default();
        }

        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            warn!("invalid YAML in {}: {}, using defaults", path, e);
            KernelConfig::default()
        })
    } else {
        warn!("config file {} not found, using defaults", path);
        KernelConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.interface, "eth0");
        assert_eq!(cfg.feedback.period_secs, 15);
        assert!((cfg.feedback.tolerance - 0.10).abs() < f64::EPSILON);
        assert_eq!(cfg.enforcement.max_attempts, 3);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let cfg: KernelConfig = serde_yaml::from_str("interface: wlan0\ndry_run: true\n").unwrap();
        assert_eq!(cfg.interface, "wlan0");
        assert!(cfg.dry_run);
        assert_eq!(cfg.mqtt.port, 1883);
    }
}
