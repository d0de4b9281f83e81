/**
 * PARSER D'INTENTS - Texte libre -> ParsedIntent structurés
 *
 * RÔLE :
 * Transforme une soumission ("limit bandwidth to 50KB/s for cameras") en
 * une ou plusieurs clauses structurées prêtes pour le Compiler.
 *
 * FONCTIONNEMENT :
 * 1. Normalisation : minuscules, espaces compactés, ponctuation finale
 * 2. Découpage sur les conjonctions de tête ("; ", " then ", " and ")
 * 3. Première règle de grammaire qui matche la clause entière gagne ;
 *    les groupes de capture nommés deviennent des paramètres
 * 4. Résolution du sélecteur contre le Catalog (0 device -> unknown_target)
 * 5. Validation des plages par type + canonicalisation en unités de base
 *    (octets/s, millisecondes)
 *
 * La soumission est atomique : une clause qui ne matche pas fait échouer
 * l'ensemble, rien n'est persisté.
 */

use crate::catalog::Catalog;
use crate::models::{IntentKind, ParamMap, ParsedIntent, TargetSelector};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("parse_failure: no grammar rule matches clause {0:?}")]
    NoMatch(String),
    #[error("parse_failure: {0}")]
    InvalidParameter(String),
    #[error("parse_failure: clause {0:?} has no target")]
    MissingTarget(String),
    #[error("unknown_target: selector {0:?} resolves to no known device")]
    UnknownTarget(String),
}

/// Parse un texte complet en clauses sœurs. Déterministe : même texte,
/// même résultat.
pub fn parse(catalog: &Catalog, raw_text: &str) -> Result<Vec<ParsedIntent>, ParseError> {
    let normalized = normalize(raw_text);
    if normalized.is_empty() {
        return Err(ParseError::NoMatch(raw_text.to_string()));
    }

    let clauses = split_clauses(&normalized);

    // Première passe : matcher chaque clause, mémoriser le texte du target
    let mut drafts: Vec<(String, IntentKind, ParamMap, Option<String>)> = Vec::new();
    for clause in &clauses {
        let (kind, params, target) = match_clause(catalog, clause)?;
        drafts.push((clause.clone(), kind, params, target));
    }

    // Remplissage arrière des targets manquants : "set audio gain to 2.0
    // and set audio gain to 4.0 for esp32-audio-1" donne deux clauses dont
    // la première hérite du target de la seconde.
    let mut carried: Option<String> = None;
    for (clause, _, _, target) in drafts.iter_mut().rev() {
        match target {
            Some(t) => carried = Some(t.clone()),
            None => match &carried {
                Some(t) => *target = Some(t.clone()),
                None => return Err(ParseError::MissingTarget(clause.clone())),
            },
        }
    }

    // Deuxième passe : résolution des sélecteurs + validation des plages
    let mut out = Vec::with_capacity(drafts.len());
    for (_, kind, raw_params, target) in drafts {
        let target_text = target.expect("target filled above");
        let selector = classify_selector(catalog, &target_text);
        let devices = catalog.resolve_targets(&selector);
        if devices.is_empty() {
            return Err(ParseError::UnknownTarget(target_text));
        }
        let parameters = validate_params(kind, raw_params, &devices)?;
        out.push(ParsedIntent { kind, selector, parameters });
    }

    Ok(out)
}

/// Minuscules, espaces compactés, guillemets et ponctuation finale retirés
fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .filter(|c| *c != '"' && *c != '\'')
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(|c| c == '.' || c == '!' || c == '?')
        .trim()
        .to_string()
}

/// Découpe sur les conjonctions de tête, dans l'ordre "; ", " then ", " and "
fn split_clauses(text: &str) -> Vec<String> {
    let mut clauses = vec![text.to_string()];
    for sep in ["; ", " then ", " and "] {
        clauses = clauses
            .iter()
            .flat_map(|c| c.split(sep).map(|s| s.trim().to_string()))
            .filter(|s| !s.is_empty())
            .collect();
    }
    clauses
}

/// Essaie les règles dans l'ordre déclaré ; la première qui matche la
/// clause entière gagne.
fn match_clause(
    catalog: &Catalog,
    clause: &str,
) -> Result<(IntentKind, ParamMap, Option<String>), ParseError> {
    for rule in catalog.grammar_rules() {
        let Some(caps) = rule.regex.captures(clause) else { continue };
        if caps.get(0).map(|m| m.as_str()) != Some(clause) {
            continue;
        }

        let mut params = ParamMap::new();
        for (name, value) in &rule.params {
            params.insert(name.clone(), value.clone());
        }
        for name in rule.regex.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                params.insert(name.to_string(), json!(m.as_str().trim()));
            }
        }

        let target = params
            .remove("target")
            .and_then(|v| v.as_str().map(|s| s.to_string()));
        return Ok((rule.intent, params, target));
    }
    Err(ParseError::NoMatch(clause.to_string()))
}

fn classify_selector(catalog: &Catalog, text: &str) -> TargetSelector {
    if catalog.has_group(text) {
        return TargetSelector::Group { name: text.to_string() };
    }
    if let Some(kind) = crate::catalog::kind_alias(text) {
        return TargetSelector::Kind { kind };
    }
    if text.contains('*') || text.contains('?') {
        return TargetSelector::Glob { pattern: text.to_string() };
    }
    TargetSelector::Ids {
        ids: text
            .split(|c| c == ',' || c == ' ')
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect(),
    }
}

/// Validation par type + canonicalisation en unités de base
fn validate_params(
    kind: IntentKind,
    raw: ParamMap,
    devices: &[&crate::models::Device],
) -> Result<ParamMap, ParseError> {
    let mut out = ParamMap::new();
    match kind {
        IntentKind::Priority => {
            let level = str_param(&raw, "level").unwrap_or_else(|| "high".to_string());
            level
                .parse::<crate::models::PriorityLevel>()
                .map_err(ParseError::InvalidParameter)?;
            out.insert("level".into(), json!(level));
        }
        IntentKind::Bandwidth => {
            let text = str_param(&raw, "rate")
                .ok_or_else(|| ParseError::InvalidParameter("missing rate".into()))?;
            let bytes = parse_rate_bytes(&text).ok_or_else(|| {
                ParseError::InvalidParameter(format!("rate {text:?} is not a valid <num><unit>"))
            })?;
            if bytes == 0 {
                return Err(ParseError::InvalidParameter("rate must be positive".into()));
            }
            out.insert("rate_bytes".into(), json!(bytes));
        }
        IntentKind::Latency => {
            let text = str_param(&raw, "delay")
                .ok_or_else(|| ParseError::InvalidParameter("missing delay".into()))?;
            let ms = parse_duration_ms(&text)
                .ok_or_else(|| ParseError::InvalidParameter(format!("bad delay {text:?}")))?;
            if ms == 0 {
                return Err(ParseError::InvalidParameter("delay must be >= 1ms".into()));
            }
            out.insert("delay_ms".into(), json!(ms));
        }
        IntentKind::Qos => {
            let text = str_param(&raw, "qos")
                .ok_or_else(|| ParseError::InvalidParameter("missing qos level".into()))?;
            let level: i64 = text
                .parse()
                .map_err(|_| ParseError::InvalidParameter(format!("bad qos {text:?}")))?;
            if !(0..=2).contains(&level) {
                return Err(ParseError::InvalidParameter(format!(
                    "qos level {level} outside 0..=2"
                )));
            }
            out.insert("qos".into(), json!(level));
        }
        IntentKind::Sampling => {
            let text = str_param(&raw, "interval")
                .ok_or_else(|| ParseError::InvalidParameter("missing interval".into()))?;
            let ms = parse_duration_ms(&text)
                .ok_or_else(|| ParseError::InvalidParameter(format!("bad interval {text:?}")))?;
            if ms < 100 {
                return Err(ParseError::InvalidParameter(
                    "sampling interval below 100ms".into(),
                ));
            }
            // Minimum documenté de chaque device ciblé
            for device in devices {
                if ms < device.min_sampling_interval_ms {
                    return Err(ParseError::InvalidParameter(format!(
                        "sampling interval {ms}ms below minimum {}ms of {}",
                        device.min_sampling_interval_ms, device.id
                    )));
                }
            }
            out.insert("interval_ms".into(), json!(ms));
        }
        IntentKind::AudioGain => {
            let text = str_param(&raw, "gain")
                .ok_or_else(|| ParseError::InvalidParameter("missing gain".into()))?;
            let gain: f64 = text
                .trim_end_matches('x')
                .parse()
                .map_err(|_| ParseError::InvalidParameter(format!("bad gain {text:?}")))?;
            if !(0.1..=10.0).contains(&gain) {
                return Err(ParseError::InvalidParameter(format!(
                    "gain {gain} outside 0.1..=10.0"
                )));
            }
            out.insert("gain".into(), json!(gain));
        }
        IntentKind::CameraConfig => {
            let field = str_param(&raw, "field")
                .ok_or_else(|| ParseError::InvalidParameter("missing camera field".into()))?;
            let value = str_param(&raw, "value")
                .ok_or_else(|| ParseError::InvalidParameter("missing camera value".into()))?;
            let (field, canonical) = canonicalize_camera(&field, &value)?;
            out.insert("field".into(), json!(field));
            out.insert("value".into(), canonical);
        }
        IntentKind::Enable | IntentKind::PowerSaving => {
            let enabled = raw
                .get("enabled")
                .and_then(|v| v.as_bool().or_else(|| v.as_str().map(|s| s == "true")))
                .unwrap_or(true);
            out.insert("enabled".into(), json!(enabled));
        }
        IntentKind::Reset => {}
        IntentKind::Security => {
            let profile = str_param(&raw, "profile").unwrap_or_else(|| "standard".to_string());
            if profile != "standard" && profile != "strict" {
                return Err(ParseError::InvalidParameter(format!(
                    "unknown security profile {profile:?}"
                )));
            }
            out.insert("profile".into(), json!(profile));
        }
    }
    Ok(out)
}

fn str_param(map: &ParamMap, key: &str) -> Option<String> {
    map.get(key).map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Canonicalise les valeurs caméra : résolutions en alias fermés,
/// qualité 0..63 (presets high/medium/low), luminosité -2..2,
/// framerate en fps positif.
fn canonicalize_camera(
    field: &str,
    value: &str,
) -> Result<(String, serde_json::Value), ParseError> {
    match field {
        "resolution" => {
            let canonical = match value {
                "qvga" | "240p" => "QVGA",
                "vga" | "480p" => "VGA",
                "svga" | "600p" => "SVGA",
                "xga" | "768p" => "XGA",
                "hd" | "720p" => "HD",
                "sxga" | "960p" => "SXGA",
                "uxga" | "1080p" | "full hd" => "UXGA",
                other => {
                    return Err(ParseError::InvalidParameter(format!(
                        "unknown resolution {other:?}"
                    )))
                }
            };
            Ok(("resolution".into(), json!(canonical)))
        }
        "quality" => {
            let q: i64 = match value {
                "high" => 5,
                "medium" => 15,
                "low" => 35,
                num => num
                    .parse()
                    .map_err(|_| ParseError::InvalidParameter(format!("bad quality {num:?}")))?,
            };
            Ok(("quality".into(), json!(q.clamp(0, 63))))
        }
        "brightness" => {
            let b: i64 = value
                .parse()
                .map_err(|_| ParseError::InvalidParameter(format!("bad brightness {value:?}")))?;
            Ok(("brightness".into(), json!(b.clamp(-2, 2))))
        }
        "framerate" => {
            let fps: i64 = value
                .parse()
                .map_err(|_| ParseError::InvalidParameter(format!("bad framerate {value:?}")))?;
            if fps <= 0 {
                return Err(ParseError::InvalidParameter("framerate must be positive".into()));
            }
            Ok(("framerate".into(), json!(fps)))
        }
        other => Err(ParseError::InvalidParameter(format!(
            "unknown camera field {other:?}"
        ))),
    }
}

/// Parse un débit "<num><unité>" en octets/s.
/// b/s, kb/s, mb/s, gb/s : octets (multiples de 1024).
/// bps, kbps, mbps, gbps : bits (multiples de 1000, divisés par 8).
pub fn parse_rate_bytes(text: &str) -> Option<u64> {
    let text = text.trim().replace(' ', "");
    let split = text.find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')?;
    let (num, unit) = text.split_at(split);
    let value: f64 = num.parse().ok()?;
    if value < 0.0 {
        return None;
    }
    let bytes = match unit {
        "b/s" => value,
        "kb/s" => value * 1024.0,
        "mb/s" => value * 1024.0 * 1024.0,
        "gb/s" => value * 1024.0 * 1024.0 * 1024.0,
        "bps" => value / 8.0,
        "kbps" => value * 1000.0 / 8.0,
        "mbps" => value * 1_000_000.0 / 8.0,
        "gbps" => value * 1_000_000_000.0 / 8.0,
        _ => return None,
    };
    Some(bytes.round() as u64)
}

/// Parse une durée "<num><unité>" en millisecondes (ms, s, m ; défaut ms)
pub fn parse_duration_ms(text: &str) -> Option<u64> {
    let text = text.trim().replace(' ', "");
    let split = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(text.len());
    let (num, unit) = text.split_at(split);
    let value: f64 = num.parse().ok()?;
    let ms = match unit {
        "" | "ms" => value,
        "s" | "sec" | "seconds" | "second" => value * 1000.0,
        "m" | "min" | "minutes" | "minute" => value * 60_000.0,
        _ => return None,
    };
    Some(ms.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::build_snapshot;
    use crate::models::IntentKind;

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
    min_sampling_interval_ms: 1000
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
  - pattern: '^set qos (?:level )?(?P<qos>\d)( for (?P<target>.+))?$'
    intent: qos
  - pattern: '^set sampling interval to (?P<interval>\S+)( for (?P<target>.+))?$'
    intent: sampling
  - pattern: '^set audio gain to (?P<gain>[0-9.]+)( for (?P<target>.+))?$'
    intent: audio_gain
  - pattern: '^set camera resolution to (?P<value>\S+)( for (?P<target>.+))?$'
    intent: camera_config
    params: { field: resolution }
  - pattern: '^reset (?P<target>.+)$'
    intent: reset
"#;

    const TEMPLATES: &str = "templates: {}\n";

    fn catalog() -> crate::catalog::Catalog {
        build_snapshot(DEVICES, GRAMMAR, TEMPLATES, "d", "g", "t").unwrap()
    }

    #[test]
    fn test_parse_priority_group() {
        let cat = catalog();
        let parsed = parse(&cat, "Prioritize temperature sensors").unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].kind, IntentKind::Priority);
        assert_eq!(parsed[0].parameters["level"], "high");
    }

    #[test]
    fn test_parse_bandwidth_units() {
        let cat = catalog();
        let parsed = parse(&cat, "limit bandwidth to 50KB/s for cameras").unwrap();
        assert_eq!(parsed[0].parameters["rate_bytes"], 51200);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let cat = catalog();
        let a = parse(&cat, "reduce latency to 20ms for temp-01").unwrap();
        let b = parse(&cat, "reduce latency to 20ms for temp-01").unwrap();
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }

    #[test]
    fn test_conjunction_splits_with_target_backfill() {
        let cat = catalog();
        let parsed =
            parse(&cat, "set audio gain to 2.0 and set audio gain to 4.0 for esp32-audio-1")
                .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].selector, parsed[1].selector);
        assert_eq!(parsed[0].parameters["gain"], 2.0);
        assert_eq!(parsed[1].parameters["gain"], 4.0);
    }

    #[test]
    fn test_unknown_target() {
        let cat = catalog();
        let err = parse(&cat, "prioritize ghost-42").unwrap_err();
        assert!(matches!(err, ParseError::UnknownTarget(_)));
    }

    #[test]
    fn test_unmatched_clause_fails_whole_submission() {
        let cat = catalog();
        let err = parse(&cat, "prioritize temp-01; dance wildly").unwrap_err();
        assert!(matches!(err, ParseError::NoMatch(_)));
    }

    #[test]
    fn test_qos_out_of_range() {
        let cat = catalog();
        let err = parse(&cat, "set qos 5 for temp-01").unwrap_err();
        assert!(matches!(err, ParseError::InvalidParameter(_)));
    }

    #[test]
    fn test_zero_rate_rejected() {
        let cat = catalog();
        let err = parse(&cat, "limit bandwidth to 0KB/s for cameras").unwrap_err();
        assert!(matches!(err, ParseError::InvalidParameter(_)));
    }

    #[test]
    fn test_sampling_below_device_minimum() {
        let cat = catalog();
        // temp-01 documente un minimum de 1000ms
        let err = parse(&cat, "set sampling interval to 500ms for temp-01").unwrap_err();
        assert!(matches!(err, ParseError::InvalidParameter(_)));
        assert!(parse(&cat, "set sampling interval to 2s for temp-01").is_ok());
    }

    #[test]
    fn test_glob_matching_all_devices_accepted() {
        let cat = catalog();
        let parsed = parse(&cat, "prioritize temp-*").unwrap();
        assert!(matches!(parsed[0].selector, TargetSelector::Glob { .. }));
    }

    #[test]
    fn test_camera_resolution_aliases() {
        let cat = catalog();
        let parsed = parse(&cat, "set camera resolution to 480p for camera-01").unwrap();
        assert_eq!(parsed[0].parameters["value"], "VGA");
    }

    #[test]
    fn test_rate_parsing_table() {
        assert_eq!(parse_rate_bytes("50kb/s"), Some(51200));
        assert_eq!(parse_rate_bytes("1mb/s"), Some(1024 * 1024));
        assert_eq!(parse_rate_bytes("8kbps"), Some(1000));
        assert_eq!(parse_rate_bytes("nonsense"), None);
    }

    #[test]
    fn test_duration_parsing_table() {
        assert_eq!(parse_duration_ms("30s"), Some(30_000));
        assert_eq!(parse_duration_ms("500ms"), Some(500));
        assert_eq!(parse_duration_ms("2m"), Some(120_000));
        assert_eq!(parse_duration_ms("20"), Some(20));
    }
}
