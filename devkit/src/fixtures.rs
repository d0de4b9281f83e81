/*!
Fixtures de Catalog et builders de messages pour les tests

Fournit un registre de devices, une grammaire et des templates YAML
représentatifs d'une petite flotte edge, écrits dans un répertoire
temporaire, ainsi que des constructeurs de messages conformes aux
contrats wire (télémétrie, statut online/offline).
*/

use serde_json::{json, Value};
use std::path::PathBuf;
use time::OffsetDateTime;

pub const DEVICES_YAML: &str = r#"
devices:
  temp-01:
    kind: sensor
    address: 10.0.10.21
    capabilities: [mqtt, telemetry, sampling]
    control_topic: iot/temp-01/control
    telemetry_topic: iot/temp-01/telemetry
    min_sampling_interval_ms: 1000
  temp-02:
    kind: sensor
    address: 10.0.10.22
    capabilities: [mqtt, telemetry, sampling]
    control_topic: iot/temp-02/control
    telemetry_topic: iot/temp-02/telemetry
    min_sampling_interval_ms: 1000
  sensor-01:
    kind: sensor
    address: 10.0.10.23
    capabilities: [mqtt, telemetry, sampling]
    control_topic: iot/sensor-01/control
    telemetry_topic: iot/sensor-01/telemetry
  esp32-mhz19-1:
    kind: sensor
    address: 10.0.10.31
    capabilities: [mqtt, telemetry, sampling, power_saving]
    control_topic: iot/esp32-mhz19-1/control
    telemetry_topic: iot/esp32-mhz19-1/telemetry
    min_sampling_interval_ms: 2000
  esp32-audio-1:
    kind: audio
    address: 10.0.10.41
    capabilities: [mqtt, telemetry, audio_gain, sampling]
    control_topic: iot/esp32-audio-1/control
    telemetry_topic: iot/esp32-audio-1/telemetry
  esp32-cam-1:
    kind: camera
    address: 10.0.10.51
    capabilities: [mqtt, telemetry, bandwidth_limit, resolution]
    control_topic: iot/esp32-cam-1/control
    telemetry_topic: iot/esp32-cam-1/telemetry
  camera-01:
    kind: camera
    address: 10.0.10.52
    capabilities: [mqtt, telemetry, bandwidth_limit, resolution]
    control_topic: iot/camera-01/control
    telemetry_topic: iot/camera-01/telemetry
groups:
  temperature sensors: { kind: sensor, id_glob: "temp-*" }
  cameras: { kind: camera }
  audio devices: { kind: audio }
"#;

pub const GRAMMAR_YAML: &str = r#"
rules:
  - pattern: '^enable power saving( mode)?( for (?P<target>.+))?$'
    intent: power_saving
    params: { enabled: true }
  - pattern: '^set camera resolution to (?P<value>[0-9a-z ]+?)( for (?P<target>.+))?$'
    intent: camera_config
    params: { field: resolution }
  - pattern: '^set audio gain to (?P<gain>[0-9.]+)x?( for (?P<target>.+))?$'
    intent: audio_gain
  - pattern: '^set sampling (interval|rate) to (?P<interval>[0-9.]+ ?(ms|s|sec|seconds|m|min))( for (?P<target>.+))?$'
    intent: sampling
  - pattern: '^set (mqtt )?qos( level)?( to)? (?P<qos>\d)( for (?P<target>.+))?$'
    intent: qos
  - pattern: '^reduce latency to (?P<delay>[0-9.]+ ?(ms|s))( for (?P<target>.+))?$'
    intent: latency
  - pattern: '^limit bandwidth to (?P<rate>\S+)( for (?P<target>.+))?$'
    intent: bandwidth
  - pattern: '^limit (?P<target>.+) to (?P<rate>\S+)$'
    intent: bandwidth
  - pattern: '^prioritize (?P<target>.+)$'
    intent: priority
    params: { level: high }
  - pattern: '^set security profile (?P<profile>standard|strict)( for (?P<target>.+))?$'
    intent: security
  - pattern: '^(enable|start|activate) (?P<target>.+)$'
    intent: enable
    params: { enabled: true }
  - pattern: '^(disable|stop|deactivate) (?P<target>.+)$'
    intent: enable
    params: { enabled: false }
  - pattern: '^reset (?P<target>.+)$'
    intent: reset
"#;

pub const TEMPLATES_YAML: &str = r#"
templates:
  htb_class: "class replace dev {interface} parent 1: classid {classid} htb rate {rate_bit}bit ceil {ceil_bit}bit burst {burst}"
  netem_delay: "qdisc replace dev {interface} parent {classid} handle {handle} netem delay {delay_ms}ms"
  priority_mark: "-t mangle -A POSTROUTING -d {address} -j MARK --set-mark {mark}"
  iptables_rule: "-t mangle -A {chain} -d {address} -j MARK --set-mark {mark}"
"#;

/// Chemins des trois fichiers du Catalog écrits sur disque
pub struct CatalogFixture {
    pub dir: PathBuf,
    pub devices: String,
    pub grammar: String,
    pub templates: String,
}

/// Écrit les fixtures dans un répertoire temporaire unique
pub fn write_catalog_fixtures() -> CatalogFixture {
    let dir = std::env::temp_dir().join(format!("weft-fixture-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("fixture dir");

    let devices = dir.join("devices.yaml");
    let grammar = dir.join("grammar.yaml");
    let templates = dir.join("templates.yaml");
    std::fs::write(&devices, DEVICES_YAML).expect("devices fixture");
    std::fs::write(&grammar, GRAMMAR_YAML).expect("grammar fixture");
    std::fs::write(&templates, TEMPLATES_YAML).expect("templates fixture");

    CatalogFixture {
        dir,
        devices: devices.to_string_lossy().into_owned(),
        grammar: grammar.to_string_lossy().into_owned(),
        templates: templates.to_string_lossy().into_owned(),
    }
}

/// Message de télémétrie conforme au contrat wire :
/// `{ "device_id": ..., "timestamp": ..., <metric>: <value>, ... }`
pub fn telemetry_message(device_id: &str, fields: &[(&str, Value)]) -> Value {
    let mut message = json!({
        "device_id": device_id,
        "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
    });
    for (key, value) in fields {
        message[*key] = value.clone();
    }
    message
}

/// Message de statut online/offline (retained sur le status topic)
pub fn status_message(device_id: &str, online: bool) -> Value {
    json!({
        "device_id": device_id,
        "status": if online { "online" } else { "offline" },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_files_written() {
        let fixture = write_catalog_fixtures();
        assert!(std::path::Path::new(&fixture.devices).exists());
        assert!(std::path::Path::new(&fixture.grammar).exists());
        assert!(std::path::Path::new(&fixture.templates).exists());
    }

    #[test]
    fn test_telemetry_builder_shape() {
        let message = telemetry_message("temp-01", &[("temperature", json!(21.5))]);
        assert_eq!(message["device_id"], "temp-01");
        assert_eq!(message["temperature"], 21.5);
        assert!(message["timestamp"].is_i64());
    }

    #[test]
    fn test_status_builder_shape() {
        assert_eq!(status_message("temp-01", true)["status"], "online");
        assert_eq!(status_message("temp-01", false)["status"], "offline");
    }
}
