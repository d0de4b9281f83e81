/**
 * COMPILER (POLICY ENGINE) - ParsedIntent -> liste ordonnée de Policies
 *
 * RÔLE :
 * Abaisse chaque clause structurée en directives concrètes par plan :
 * classes HTB, délais netem, marques de priorité côté data plane ;
 * messages de contrôle côté device plane.
 *
 * RÈGLES D'ABAISSEMENT :
 * - priority  -> 1 htb_class (feuille partagée du niveau) + 1 priority_mark
 *                par cible adressable
 * - bandwidth -> 1 htb_class feuille par cible, rate = ceil
 * - latency   -> 1 netem_delay par cible (min des délais concurrents,
 *                arbitré à la supersession)
 * - qos       -> 1 mqtt_qos device plane par cible
 * - sampling / audio_gain / camera_config / enable / reset /
 *   power_saving / security -> 1 device_control par cible
 *
 * Les conflits entre clauses sœurs d'une même compilation sont rejetés
 * (compile_conflict), rien n'est persisté. La compilation est déterministe :
 * même ParsedIntent, mêmes paramètres de policies.
 */

use crate::catalog::Catalog;
use crate::models::{
    Device, Goal, GoalAggregate, GoalBound, GoalMetric, IdGen, IntentKind, ParamMap, ParsedIntent,
    Policy, PolicyKind, PolicyStatus, PolicyTarget, PriorityLevel,
};
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("compile_conflict: sibling clauses collide on {0}")]
    Conflict(String),
    #[error("unknown_target: selector resolves to no known device")]
    UnknownTarget,
    #[error("unsupported_target: {0}")]
    Unsupported(String),
}

/// Paramètres HTB de la feuille partagée de chaque niveau de priorité
fn priority_leaf_params(level: PriorityLevel) -> (u64, u64) {
    match level {
        PriorityLevel::High => (100_000_000, 200_000_000),
        PriorityLevel::Normal => (50_000_000, 100_000_000),
        PriorityLevel::Low => (10_000_000, 50_000_000),
    }
}

pub struct Compiler<'a> {
    catalog: &'a Catalog,
    interface: &'a str,
    ids: &'a IdGen,
}

impl<'a> Compiler<'a> {
    pub fn new(catalog: &'a Catalog, interface: &'a str, ids: &'a IdGen) -> Self {
        Self { catalog, interface, ids }
    }

    /// Compile toutes les clauses sœurs d'un intent en une liste ordonnée
    /// de policies, et extrait le goal mesurable s'il y en a un.
    pub fn compile(
        &self,
        intent_id: &str,
        siblings: &[ParsedIntent],
    ) -> Result<(Vec<Policy>, Option<Goal>), CompileError> {
        let mut policies: Vec<Policy> = Vec::new();
        let mut goal: Option<Goal> = None;
        let mut seq: u32 = 0;

        for parsed in siblings {
            let devices = self.catalog.resolve_targets(&parsed.selector);
            if devices.is_empty() {
                return Err(CompileError::UnknownTarget);
            }

            match parsed.kind {
                IntentKind::Priority => {
                    self.lower_priority(intent_id, parsed, &devices, &mut policies, &mut seq)?
                }
                IntentKind::Bandwidth => {
                    self.lower_bandwidth(intent_id, parsed, &devices, &mut policies, &mut seq)?;
                    if goal.is_none() {
                        let bytes = u64_param(&parsed.parameters, "rate_bytes");
                        goal = Some(Goal {
                            metric: GoalMetric::BandwidthBps,
                            aggregate: GoalAggregate::Mean,
                            bound: GoalBound::UpperBound,
                            value: (bytes * 8) as f64,
                            device_id: devices.first().map(|d| d.id.clone()),
                        });
                    }
                }
                IntentKind::Latency => {
                    self.lower_latency(intent_id, parsed, &devices, &mut policies, &mut seq)?;
                    if goal.is_none() {
                        goal = Some(Goal {
                            metric: GoalMetric::LatencyMs,
                            aggregate: GoalAggregate::Mean,
                            bound: GoalBound::UpperBound,
                            value: u64_param(&parsed.parameters, "delay_ms") as f64,
                            device_id: devices.first().map(|d| d.id.clone()),
                        });
                    }
                }
                IntentKind::Qos => {
                    for device in &devices {
                        let mut params = ParamMap::new();
                        params.insert("command".into(), json!("SET_MQTT_QOS"));
                        params.insert("qos".into(), parsed.parameters["qos"].clone());
                        self.push_device_policy(
                            intent_id,
                            PolicyKind::MqttQos,
                            device,
                            params,
                            &mut policies,
                            &mut seq,
                        )?;
                    }
                }
                IntentKind::Sampling => {
                    for device in &devices {
                        let mut params = ParamMap::new();
                        params.insert("command".into(), json!("SET_SAMPLING_INTERVAL"));
                        params.insert("interval_ms".into(), parsed.parameters["interval_ms"].clone());
                        self.push_device_policy(
                            intent_id,
                            PolicyKind::DeviceControl,
                            device,
                            params,
                            &mut policies,
                            &mut seq,
                        )?;
                    }
                }
                IntentKind::AudioGain => {
                    for device in &devices {
                        if !device.has_capability("audio_gain") {
                            return Err(CompileError::Unsupported(format!(
                                "{} has no audio_gain capability",
                                device.id
                            )));
                        }
                        let mut params = ParamMap::new();
                        params.insert("command".into(), json!("SET_AUDIO_GAIN"));
                        params.insert("gain".into(), parsed.parameters["gain"].clone());
                        self.push_device_policy(
                            intent_id,
                            PolicyKind::DeviceControl,
                            device,
                            params,
                            &mut policies,
                            &mut seq,
                        )?;
                    }
                }
                IntentKind::CameraConfig => {
                    for device in &devices {
                        if device.kind != crate::models::DeviceKind::Camera {
                            return Err(CompileError::Unsupported(format!(
                                "{} is not a camera",
                                device.id
                            )));
                        }
                        let params = camera_control_params(&parsed.parameters);
                        self.push_device_policy(
                            intent_id,
                            PolicyKind::DeviceControl,
                            device,
                            params,
                            &mut policies,
                            &mut seq,
                        )?;
                    }
                }
                IntentKind::Enable => {
                    for device in &devices {
                        let enabled = parsed.parameters["enabled"].as_bool().unwrap_or(true);
                        let mut params = ParamMap::new();
                        params
                            .insert("command".into(), json!(if enabled { "ENABLE" } else { "DISABLE" }));
                        params.insert("enabled".into(), json!(enabled));
                        self.push_device_policy(
                            intent_id,
                            PolicyKind::DeviceControl,
                            device,
                            params,
                            &mut policies,
                            &mut seq,
                        )?;
                    }
                }
                IntentKind::Reset => {
                    for device in &devices {
                        let mut params = ParamMap::new();
                        params.insert("command".into(), json!("RESET"));
                        self.push_device_policy(
                            intent_id,
                            PolicyKind::DeviceControl,
                            device,
                            params,
                            &mut policies,
                            &mut seq,
                        )?;
                    }
                }
                IntentKind::PowerSaving => {
                    for device in &devices {
                        let mut params = ParamMap::new();
                        params.insert("command".into(), json!("SET_POWER_SAVING"));
                        params.insert("enabled".into(), parsed.parameters["enabled"].clone());
                        self.push_device_policy(
                            intent_id,
                            PolicyKind::DeviceControl,
                            device,
                            params,
                            &mut policies,
                            &mut seq,
                        )?;
                    }
                }
                IntentKind::Security => {
                    for device in &devices {
                        let mut params = ParamMap::new();
                        params.insert("command".into(), json!("SET_SECURITY_PROFILE"));
                        params.insert("profile".into(), parsed.parameters["profile"].clone());
                        self.push_device_policy(
                            intent_id,
                            PolicyKind::DeviceControl,
                            device,
                            params,
                            &mut policies,
                            &mut seq,
                        )?;
                    }
                }
            }
        }

        Ok((policies, goal))
    }

    fn lower_priority(
        &self,
        intent_id: &str,
        parsed: &ParsedIntent,
        devices: &[&Device],
        policies: &mut Vec<Policy>,
        seq: &mut u32,
    ) -> Result<(), CompileError> {
        let level: PriorityLevel = parsed.parameters["level"]
            .as_str()
            .unwrap_or("high")
            .parse()
            .map_err(CompileError::Unsupported)?;
        let (rate_bit, ceil_bit) = priority_leaf_params(level);
        let classid = format!("1:{}", level.class_minor());

        // Feuille HTB partagée du niveau, une seule par compilation
        let target = PolicyTarget::DataPlane {
            interface: self.interface.to_string(),
            classid: classid.clone(),
        };
        let mut params = ParamMap::new();
        params.insert("level".into(), json!(level.as_str()));
        params.insert("rate_bit".into(), json!(rate_bit));
        params.insert("ceil_bit".into(), json!(ceil_bit));
        params.insert("burst".into(), json!("32k"));
        self.push_policy(intent_id, PolicyKind::HtbClass, target, params, policies, seq)?;

        // Une marque par cible adressable, qui aiguille vers la feuille
        for device in devices {
            let Some(address) = &device.address else { continue };
            let target = PolicyTarget::DataPlane {
                interface: self.interface.to_string(),
                classid: classid.clone(),
            };
            let mut params = ParamMap::new();
            params.insert("device".into(), json!(device.id));
            params.insert("address".into(), json!(address));
            params.insert("mark".into(), json!(level.class_minor()));
            params.insert("level".into(), json!(level.as_str()));
            self.push_policy(intent_id, PolicyKind::PriorityMark, target, params, policies, seq)?;
        }
        Ok(())
    }

    fn lower_bandwidth(
        &self,
        intent_id: &str,
        parsed: &ParsedIntent,
        devices: &[&Device],
        policies: &mut Vec<Policy>,
        seq: &mut u32,
    ) -> Result<(), CompileError> {
        let rate_bytes = u64_param(&parsed.parameters, "rate_bytes");
        let rate_bit = rate_bytes * 8;

        for device in devices {
            let minor = self
                .catalog
                .class_minor(&device.id)
                .ok_or(CompileError::UnknownTarget)?;
            let target = PolicyTarget::DataPlane {
                interface: self.interface.to_string(),
                classid: format!("1:{minor}"),
            };
            let mut params = ParamMap::new();
            params.insert("device".into(), json!(device.id));
            params.insert("rate_bit".into(), json!(rate_bit));
            params.insert("ceil_bit".into(), json!(rate_bit));
            params.insert("rate_bytes".into(), json!(rate_bytes));
            params.insert("burst".into(), json!("15k"));
            self.push_policy(intent_id, PolicyKind::HtbClass, target, params, policies, seq)?;
        }
        Ok(())
    }

    fn lower_latency(
        &self,
        intent_id: &str,
        parsed: &ParsedIntent,
        devices: &[&Device],
        policies: &mut Vec<Policy>,
        seq: &mut u32,
    ) -> Result<(), CompileError> {
        let delay_ms = u64_param(&parsed.parameters, "delay_ms");

        for device in devices {
            let minor = self
                .catalog
                .class_minor(&device.id)
                .ok_or(CompileError::UnknownTarget)?;
            let target = PolicyTarget::DataPlane {
                interface: self.interface.to_string(),
                classid: format!("1:{minor}"),
            };
            let mut params = ParamMap::new();
            params.insert("device".into(), json!(device.id));
            params.insert("delay_ms".into(), json!(delay_ms));
            params.insert("requested_ms".into(), json!(delay_ms));
            params.insert("handle".into(), json!(format!("{minor}0:")));
            self.push_policy(intent_id, PolicyKind::NetemDelay, target, params, policies, seq)?;
        }
        Ok(())
    }

    fn push_device_policy(
        &self,
        intent_id: &str,
        kind: PolicyKind,
        device: &Device,
        params: ParamMap,
        policies: &mut Vec<Policy>,
        seq: &mut u32,
    ) -> Result<(), CompileError> {
        let target = PolicyTarget::Device { device_id: device.id.clone() };
        self.push_policy(intent_id, kind, target, params, policies, seq)
    }

    /// Ajoute une policy en détectant les collisions au sein du lot :
    /// même clé + paramètres différents -> compile_conflict,
    /// même clé + paramètres identiques -> doublon ignoré.
    fn push_policy(
        &self,
        intent_id: &str,
        kind: PolicyKind,
        target: PolicyTarget,
        params: ParamMap,
        policies: &mut Vec<Policy>,
        seq: &mut u32,
    ) -> Result<(), CompileError> {
        let key = Policy::conflict_key_for(kind, &target, &params);
        if let Some(existing) = policies.iter().find(|p| p.conflict_key == key) {
            if existing.parameters == params {
                return Ok(());
            }
            return Err(CompileError::Conflict(key));
        }

        policies.push(Policy {
            id: self.ids.next("policy"),
            intent_id: intent_id.to_string(),
            kind,
            target,
            parameters: params,
            conflict_key: key,
            status: PolicyStatus::Pending,
            seq: *seq,
            applied_at: None,
            last_error: None,
        });
        *seq += 1;
        Ok(())
    }
}

/// Message de contrôle caméra depuis les paramètres canonicalisés du parser
fn camera_control_params(parsed: &ParamMap) -> ParamMap {
    let field = parsed["field"].as_str().unwrap_or("resolution");
    let mut params = ParamMap::new();
    match field {
        "resolution" => {
            params.insert("command".into(), json!("SET_CAMERA_RESOLUTION"));
            params.insert("resolution".into(), parsed["value"].clone());
        }
        "quality" => {
            params.insert("command".into(), json!("SET_CAMERA_QUALITY"));
            params.insert("quality".into(), parsed["value"].clone());
        }
        "brightness" => {
            params.insert("command".into(), json!("SET_CAMERA_BRIGHTNESS"));
            params.insert("brightness".into(), parsed["value"].clone());
        }
        "framerate" => {
            let fps = parsed["value"].as_i64().unwrap_or(1).max(1);
            params.insert("command".into(), json!("SET_CAMERA_FRAMERATE"));
            params.insert(
                "capture_interval_ms".into(),
                json!(std::cmp::max(33, 1000 / fps)),
            );
        }
        _ => {
            params.insert("command".into(), json!("SET_CAMERA_RESOLUTION"));
            params.insert("resolution".into(), parsed["value"].clone());
        }
    }
    params
}

fn u64_param(map: &ParamMap, key: &str) -> u64 {
    map.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

/// Vérifie qu'aucune policy du lot n'entre en collision avec elle-même,
/// utilitaire pour la loi "compiler deux fois = mêmes paramètres".
pub fn parameters_fingerprint(policies: &[Policy]) -> HashMap<String, String> {
    policies
        .iter()
        .map(|p| {
            (
                p.conflict_key.clone(),
                serde_json::to_string(&p.parameters).unwrap_or_default(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::build_snapshot;
    use crate::parser::parse;

    const DEVICES: &str = r#"
devices:
  camera-01:
    kind: camera
    address: 10.0.0.31
    capabilities: [mqtt, telemetry, bandwidth_limit, resolution]
    control_topic: iot/camera-01/control
    telemetry_topic: iot/camera-01/telemetry
  esp32-audio-1:
    kind: audio
    capabilities: [mqtt, telemetry, audio_gain]
    control_topic: iot/esp32-audio-1/control
    telemetry_topic: iot/esp32-audio-1/telemetry
  temp-01:
    kind: sensor
    address: 10.0.0.21
    capabilities: [mqtt, telemetry, sampling]
    control_topic: iot/temp-01/control
    telemetry_topic: iot/temp-01/telemetry
  temp-02:
    kind: sensor
    address: 10.0.0.22
    capabilities: [mqtt, telemetry, sampling]
    control_topic: iot/temp-02/control
    telemetry_topic: iot/temp-02/telemetry
groups:
  temperature sensors: { kind: sensor, id_glob: "temp-*" }
  cameras: { kind: camera }
"#;

    const GRAMMAR: &str = r#"
rules:
  - pattern: '^prioritize (?P<target>.+)$'
    intent: priority
    params: { level: high }
  - pattern: '^limit bandwidth to (?P<rate>\S+) for (?P<target>.+)$'
    intent: bandwidth
  - pattern: '^reduce latency to (?P<delay>\S+?)( for (?P<target>.+))?$'
    intent: latency
  - pattern: '^set audio gain to (?P<gain>[0-9.]+)( for (?P<target>.+))?$'
    intent: audio_gain
  - pattern: '^set camera resolution to (?P<value>\S+)( for (?P<target>.+))?$'
    intent: camera_config
    params: { field: resolution }
"#;

    const TEMPLATES: &str = "templates: {}\n";

    fn catalog() -> crate::catalog::Catalog {
        build_snapshot(DEVICES, GRAMMAR, TEMPLATES, "d", "g", "t").unwrap()
    }

    #[test]
    fn test_priority_produces_shared_leaf_plus_marks() {
        let cat = catalog();
        let ids = IdGen::new();
        let parsed = parse(&cat, "prioritize temperature sensors").unwrap();
        let compiler = Compiler::new(&cat, "eth0", &ids);
        let (policies, _) = compiler.compile("intent-1", &parsed).unwrap();

        assert_eq!(policies.len(), 3);
        assert_eq!(policies[0].kind, PolicyKind::HtbClass);
        assert!(matches!(
            &policies[0].target,
            PolicyTarget::DataPlane { classid, .. } if classid == "1:10"
        ));
        assert_eq!(policies[1].kind, PolicyKind::PriorityMark);
        assert_eq!(policies[2].kind, PolicyKind::PriorityMark);
    }

    #[test]
    fn test_bandwidth_rate_equals_ceil_in_bits() {
        let cat = catalog();
        let ids = IdGen::new();
        let parsed = parse(&cat, "limit bandwidth to 50KB/s for cameras").unwrap();
        let compiler = Compiler::new(&cat, "eth0", &ids);
        let (policies, goal) = compiler.compile("intent-1", &parsed).unwrap();

        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].parameters["rate_bit"], 409600);
        assert_eq!(policies[0].parameters["ceil_bit"], 409600);
        assert_eq!(policies[0].parameters["device"], "camera-01");
        assert_eq!(goal.unwrap().value, 409600.0);
    }

    #[test]
    fn test_conflicting_siblings_rejected() {
        let cat = catalog();
        let ids = IdGen::new();
        let parsed =
            parse(&cat, "set audio gain to 2.0 and set audio gain to 4.0 for esp32-audio-1")
                .unwrap();
        let compiler = Compiler::new(&cat, "eth0", &ids);
        let err = compiler.compile("intent-1", &parsed).unwrap_err();
        assert!(matches!(err, CompileError::Conflict(_)));
    }

    #[test]
    fn test_identical_siblings_deduped() {
        let cat = catalog();
        let ids = IdGen::new();
        let parsed =
            parse(&cat, "set audio gain to 2.0 and set audio gain to 2.0 for esp32-audio-1")
                .unwrap();
        let compiler = Compiler::new(&cat, "eth0", &ids);
        let (policies, _) = compiler.compile("intent-1", &parsed).unwrap();
        assert_eq!(policies.len(), 1);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let cat = catalog();
        let ids = IdGen::new();
        let parsed = parse(&cat, "reduce latency to 20ms for temp-01").unwrap();
        let compiler = Compiler::new(&cat, "eth0", &ids);
        let (a, _) = compiler.compile("intent-1", &parsed).unwrap();
        let (b, _) = compiler.compile("intent-2", &parsed).unwrap();
        assert_eq!(parameters_fingerprint(&a), parameters_fingerprint(&b));
    }

    #[test]
    fn test_latency_goal_extracted() {
        let cat = catalog();
        let ids = IdGen::new();
        let parsed = parse(&cat, "reduce latency to 20ms for temp-01").unwrap();
        let compiler = Compiler::new(&cat, "eth0", &ids);
        let (_, goal) = compiler.compile("intent-1", &parsed).unwrap();
        let goal = goal.unwrap();
        assert_eq!(goal.metric, GoalMetric::LatencyMs);
        assert_eq!(goal.bound, GoalBound::UpperBound);
        assert_eq!(goal.value, 20.0);
        assert_eq!(goal.device_id.as_deref(), Some("temp-01"));
    }

    #[test]
    fn test_audio_gain_requires_capability() {
        let cat = catalog();
        let ids = IdGen::new();
        let parsed = parse(&cat, "set audio gain to 2.0 for temp-01").unwrap();
        let compiler = Compiler::new(&cat, "eth0", &ids);
        let err = compiler.compile("intent-1", &parsed).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported(_)));
    }

    #[test]
    fn test_camera_resolution_control_message() {
        let cat = catalog();
        let ids = IdGen::new();
        let parsed = parse(&cat, "set camera resolution to vga for camera-01").unwrap();
        let compiler = Compiler::new(&cat, "eth0", &ids);
        let (policies, _) = compiler.compile("intent-1", &parsed).unwrap();
        assert_eq!(policies[0].kind, PolicyKind::DeviceControl);
        assert_eq!(policies[0].parameters["command"], "SET_CAMERA_RESOLUTION");
        assert_eq!(policies[0].parameters["resolution"], "VGA");
    }
}
