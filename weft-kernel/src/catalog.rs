/**
 * CATALOG - Registre statique-mais-rechargeable du kernel Weft
 *
 * RÔLE :
 * Charge les trois configurations persistantes : registre des devices,
 * grammaire d'intents (liste ordonnée de règles regex), templates de
 * policies (squelettes de directives à trous nommés).
 *
 * FONCTIONNEMENT :
 * - Snapshot immuable publié derrière un Arc : reload() = swap atomique,
 *   les opérations en vol continuent sur le snapshot qu'elles tiennent
 * - resolve_targets : ids explicites, glob, filtre par kind, groupe nommé
 * - Validation au chargement : une règle qui référence un paramètre
 *   inconnu ou un template avec un trou inconnu -> config_invalid,
 *   rien n'est appliqué (jamais de reload partiel)
 *
 * UTILITÉ DANS WEFT :
 * Source unique de vérité pour "qui sont les devices" et "que veut dire
 * ce texte" ; le Parser et le Compiler ne lisent que des snapshots.
 */

use crate::models::{Device, DeviceKind, IntentKind, PolicyKind};
use crate::state::Slot;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::fs;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("IO error reading {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("YAML error in {0}: {1}")]
    Yaml(String, #[source] serde_yaml::Error),
    #[error("config_invalid: {0}")]
    ConfigInvalid(String),
}

// ---------------------------------------------------------------------------
// Formats des fichiers YAML
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DeviceRegistryFile {
    /// id -> fiche device (l'id est recopié depuis la clé)
    devices: BTreeMap<String, DeviceEntry>,
    /// Groupes nommés : phrase -> sélecteur kind et/ou glob
    #[serde(default)]
    groups: BTreeMap<String, GroupEntry>,
}

#[derive(Debug, Deserialize)]
struct DeviceEntry {
    kind: DeviceKind,
    address: Option<String>,
    #[serde(default)]
    default_priority: Option<crate::models::PriorityLevel>,
    #[serde(default)]
    default_qos: Option<u8>,
    bandwidth_cap: Option<u64>,
    #[serde(default)]
    capabilities: Vec<String>,
    control_topic: String,
    telemetry_topic: String,
    min_sampling_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupEntry {
    pub kind: Option<DeviceKind>,
    pub id_glob: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GrammarFile {
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    pattern: String,
    intent: String,
    /// Paramètres fixes injectés quand la règle matche (ex: level: high)
    #[serde(default)]
    params: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct TemplatesFile {
    templates: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Structures runtime
// ---------------------------------------------------------------------------

/// Règle de grammaire compilée. Les groupes de capture nommés deviennent
/// des paramètres ; `params` sont les valeurs fixes de la règle.
#[derive(Debug, Clone)]
pub struct GrammarRule {
    pub pattern: String,
    pub regex: Regex,
    pub intent: IntentKind,
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Squelette de directive paramétrée pour un policy kind
#[derive(Debug, Clone)]
pub struct Template {
    pub kind: PolicyKind,
    pub skeleton: String,
    pub holes: Vec<String>,
}

impl Template {
    /// Substitue les trous `{nom}` par les valeurs fournies.
    /// Tous les trous doivent être servis (vérifié au chargement côté
    /// template, au rendu côté appelant).
    pub fn render(&self, values: &HashMap<&str, String>) -> Result<String, CatalogError> {
        let mut out = self.skeleton.clone();
        for hole in &self.holes {
            let value = values.get(hole.as_str()).ok_or_else(|| {
                CatalogError::ConfigInvalid(format!(
                    "template {} missing value for hole {{{}}}",
                    self.kind.as_str(),
                    hole
                ))
            })?;
            out = out.replace(&format!("{{{hole}}}"), value);
        }
        Ok(out)
    }
}

/// Snapshot immuable du Catalog
#[derive(Debug)]
pub struct Catalog {
    devices: BTreeMap<String, Device>,
    groups: BTreeMap<String, GroupEntry>,
    rules: Vec<GrammarRule>,
    templates: HashMap<PolicyKind, Template>,
    /// Minor de classe HTB stable par device (ordre du registre, base 101)
    class_minors: HashMap<String, u32>,
}

impl Catalog {
    pub fn lookup_device(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn grammar_rules(&self) -> &[GrammarRule] {
        &self.rules
    }

    pub fn template(&self, kind: PolicyKind) -> Option<&Template> {
        self.templates.get(&kind)
    }

    /// Minor de la classe feuille dédiée à un device
    pub fn class_minor(&self, device_id: &str) -> Option<u32> {
        self.class_minors.get(device_id).copied()
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Résout un sélecteur structuré en devices, triés par id
    pub fn resolve_targets(&self, selector: &crate::models::TargetSelector) -> Vec<&Device> {
        use crate::models::TargetSelector as S;
        match selector {
            S::Group { name } => self.resolve_selector(name),
            S::Kind { kind } => {
                let mut out: Vec<&Device> =
                    self.devices.values().filter(|d| d.kind == *kind).collect();
                out.sort_by(|a, b| a.id.cmp(&b.id));
                out
            }
            S::Glob { pattern } => self.resolve_selector(pattern),
            S::Ids { ids } => {
                // Tout ou rien : un id inconnu invalide la liste entière
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.devices.get(id) {
                        Some(d) => out.push(d),
                        None => return Vec::new(),
                    }
                }
                out
            }
        }
    }

    /// Résout un sélecteur textuel en devices, triés par id.
    /// Ordre d'essai : groupe nommé, alias de kind, glob, liste d'ids.
    pub fn resolve_selector(&self, text: &str) -> Vec<&Device> {
        let text = text.trim();

        if let Some(group) = self.groups.get(text) {
            let mut out: Vec<&Device> = self
                .devices
                .values()
                .filter(|d| group.kind.map_or(true, |k| d.kind == k))
                .filter(|d| {
                    group
                        .id_glob
                        .as_deref()
                        .map_or(true, |g| glob_match(g, &d.id))
                })
                .collect();
            out.sort_by(|a, b| a.id.cmp(&b.id));
            return out;
        }

        if let Some(kind) = kind_alias(text) {
            let mut out: Vec<&Device> = self.devices.values().filter(|d| d.kind == kind).collect();
            out.sort_by(|a, b| a.id.cmp(&b.id));
            return out;
        }

        if text.contains('*') || text.contains('?') {
            let mut out: Vec<&Device> = self
                .devices
                .values()
                .filter(|d| glob_match(text, &d.id))
                .collect();
            out.sort_by(|a, b| a.id.cmp(&b.id));
            return out;
        }

        // Liste d'ids : "temp-01, temp-02" ou "temp-01 temp-02"
        let mut out = Vec::new();
        for token in text.split(|c| c == ',' || c == ' ').filter(|t| !t.is_empty()) {
            if let Some(d) = self.devices.get(token) {
                out.push(d);
            } else {
                // Un id inconnu invalide tout le sélecteur
                return Vec::new();
            }
        }
        out
    }
}

/// Alias pluriel/singulier -> kind
pub fn kind_alias(text: &str) -> Option<DeviceKind> {
    match text {
        "sensor" | "sensors" | "all sensors" => Some(DeviceKind::Sensor),
        "camera" | "cameras" | "all cameras" => Some(DeviceKind::Camera),
        "audio" | "audio devices" => Some(DeviceKind::Audio),
        "gateway" | "gateways" => Some(DeviceKind::Gateway),
        _ => None,
    }
}

/// Matcher glob minimal : `*` = toute séquence, `?` = un caractère
pub fn glob_match(pattern: &str, input: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = input.chars().collect();

    fn inner(p: &[char], s: &[char]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&p[1..], s) || (!s.is_empty() && inner(p, &s[1..]))
            }
            (Some('?'), Some(_)) => inner(&p[1..], &s[1..]),
            (Some(pc), Some(sc)) if pc == sc => inner(&p[1..], &s[1..]),
            _ => false,
        }
    }
    inner(&p, &s)
}

// ---------------------------------------------------------------------------
// Chargement + swap atomique
// ---------------------------------------------------------------------------

/// Poignée partagée : les lecteurs clonent l'Arc du snapshot courant,
/// reload() publie un snapshot neuf sans toucher aux lecteurs en vol.
#[derive(Clone)]
pub struct CatalogHandle {
    current: Arc<Slot<Catalog>>,
    paths: crate::config::CatalogPaths,
}

impl CatalogHandle {
    pub async fn load(paths: crate::config::CatalogPaths) -> Result<Self, CatalogError> {
        let snapshot = load_snapshot(&paths).await?;
        info!(
            devices = snapshot.device_count(),
            rules = snapshot.rules.len(),
            templates = snapshot.templates.len(),
            "catalog loaded"
        );
        Ok(Self { current: Arc::new(Slot::new(snapshot)), paths })
    }

    /// Snapshot courant ; à tenir pour la durée d'une opération
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.current.get()
    }

    /// Recharge les trois fichiers. Tout ou rien : la moindre erreur
    /// laisse le snapshot courant en place.
    pub async fn reload(&self) -> Result<(), CatalogError> {
        let fresh = load_snapshot(&self.paths).await?;
        info!(devices = fresh.device_count(), "catalog reloaded");
        self.current.publish(fresh);
        Ok(())
    }
}

async fn load_snapshot(paths: &crate::config::CatalogPaths) -> Result<Catalog, CatalogError> {
    let devices_txt = fs::read_to_string(&paths.devices)
        .await
        .map_err(|e| CatalogError::Io(paths.devices.clone(), e))?;
    let grammar_txt = fs::read_to_string(&paths.grammar)
        .await
        .map_err(|e| CatalogError::Io(paths.grammar.clone(), e))?;
    let templates_txt = fs::read_to_string(&paths.templates)
        .await
        .map_err(|e| CatalogError::Io(paths.templates.clone(), e))?;

    build_snapshot(&devices_txt, &grammar_txt, &templates_txt, &paths.devices, &paths.grammar, &paths.templates)
}

/// Construit et valide un snapshot depuis le contenu des trois fichiers.
/// Séparé du chargement disque pour les tests.
pub fn build_snapshot(
    devices_txt: &str,
    grammar_txt: &str,
    templates_txt: &str,
    devices_path: &str,
    grammar_path: &str,
    templates_path: &str,
) -> Result<Catalog, CatalogError> {
    let registry: DeviceRegistryFile = serde_yaml::from_str(devices_txt)
        .map_err(|e| CatalogError::Yaml(devices_path.to_string(), e))?;
    let grammar: GrammarFile = serde_yaml::from_str(grammar_txt)
        .map_err(|e| CatalogError::Yaml(grammar_path.to_string(), e))?;
    let templates_file: TemplatesFile = serde_yaml::from_str(templates_txt)
        .map_err(|e| CatalogError::Yaml(templates_path.to_string(), e))?;

    // Devices : id depuis la clé, unicité des topics
    let mut devices = BTreeMap::new();
    let mut seen_topics: HashMap<String, String> = HashMap::new();
    for (id, entry) in registry.devices {
        for topic in [&entry.control_topic, &entry.telemetry_topic] {
            if let Some(owner) = seen_topics.insert(topic.clone(), id.clone()) {
                return Err(CatalogError::ConfigInvalid(format!(
                    "topic {topic} declared by both {owner} and {id}"
                )));
            }
        }
        let device = Device {
            id: id.clone(),
            kind: entry.kind,
            address: entry.address,
            default_priority: entry.default_priority.unwrap_or(crate::models::PriorityLevel::Normal),
            default_qos: entry.default_qos.unwrap_or(1),
            bandwidth_cap: entry.bandwidth_cap,
            capabilities: entry.capabilities,
            control_topic: entry.control_topic,
            telemetry_topic: entry.telemetry_topic,
            min_sampling_interval_ms: entry.min_sampling_interval_ms.unwrap_or(100),
        };
        devices.insert(id, device);
    }

    // Minor de classe stable par device : ordre alphabétique du registre
    let class_minors: HashMap<String, u32> = devices
        .keys()
        .enumerate()
        .map(|(i, id)| (id.clone(), 101 + i as u32))
        .collect();

    // Grammaire : compile les regex, valide les noms de paramètres
    let mut rules = Vec::with_capacity(grammar.rules.len());
    for entry in grammar.rules {
        let intent: IntentKind = entry
            .intent
            .parse()
            .map_err(|e: String| CatalogError::ConfigInvalid(e))?;
        let regex = Regex::new(&entry.pattern).map_err(|e| {
            CatalogError::ConfigInvalid(format!("bad pattern {:?}: {e}", entry.pattern))
        })?;

        let known = intent.known_params();
        for name in regex.capture_names().flatten() {
            if !known.contains(&name) {
                return Err(CatalogError::ConfigInvalid(format!(
                    "rule {:?} captures unknown parameter {name} for intent {}",
                    entry.pattern,
                    intent.as_str()
                )));
            }
        }
        let mut params = BTreeMap::new();
        for (name, value) in entry.params {
            if !known.contains(&name.as_str()) {
                return Err(CatalogError::ConfigInvalid(format!(
                    "rule {:?} sets unknown parameter {name} for intent {}",
                    entry.pattern,
                    intent.as_str()
                )));
            }
            let json: serde_json::Value = serde_yaml::from_value(value)
                .map_err(|e| CatalogError::Yaml(grammar_path.to_string(), e))?;
            params.insert(name, json);
        }

        rules.push(GrammarRule { pattern: entry.pattern, regex, intent, params });
    }

    // Templates : valide les trous contre les substitutions connues du kind
    let mut templates = HashMap::new();
    for (kind_str, skeleton) in templates_file.templates {
        let kind: PolicyKind = kind_str
            .parse()
            .map_err(|e: String| CatalogError::ConfigInvalid(e))?;
        let holes = extract_holes(&skeleton);
        for hole in &holes {
            if !kind.known_holes().contains(&hole.as_str()) {
                return Err(CatalogError::ConfigInvalid(format!(
                    "template {kind_str} references unknown substitution key {{{hole}}}"
                )));
            }
        }
        templates.insert(kind, Template { kind, skeleton, holes });
    }

    Ok(Catalog { devices, groups: registry.groups, rules, templates, class_minors })
}

/// Extrait les noms de trous `{nom}` d'un squelette
fn extract_holes(skeleton: &str) -> Vec<String> {
    let mut holes = Vec::new();
    let mut rest = skeleton;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start + 1..].find('}') else { break };
        let name = &rest[start + 1..start + 1 + len];
        if !name.is_empty() && !holes.iter().any(|h| h == name) {
            holes.push(name.to_string());
        }
        rest = &rest[start + 1 + len + 1..];
    }
    holes
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES: &str = r#"
devices:
  camera-01:
    kind: camera
    address: 10.0.0.31
    capabilities: [mqtt, telemetry, bandwidth_limit, resolution]
    control_topic: iot/camera-01/control
    telemetry_topic: iot/camera-01/telemetry
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
"#;

    const TEMPLATES: &str = r#"
templates:
  htb_class: "class replace dev {interface} parent 1: classid {classid} htb rate {rate_bit}bit ceil {ceil_bit}bit burst {burst}"
  netem_delay: "qdisc replace dev {interface} parent {classid} handle {handle} netem delay {delay_ms}ms"
"#;

    fn snapshot() -> Catalog {
        build_snapshot(DEVICES, GRAMMAR, TEMPLATES, "d", "g", "t").unwrap()
    }

    #[test]
    fn test_resolve_group() {
        let cat = snapshot();
        let found = cat.resolve_selector("temperature sensors");
        let ids: Vec<&str> = found.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["temp-01", "temp-02"]);
    }

    #[test]
    fn test_resolve_kind_alias_and_glob() {
        let cat = snapshot();
        assert_eq!(cat.resolve_selector("cameras").len(), 1);
        assert_eq!(cat.resolve_selector("temp-*").len(), 2);
        assert_eq!(cat.resolve_selector("*").len(), 3);
    }

    #[test]
    fn test_resolve_id_list_with_unknown_id_is_empty() {
        let cat = snapshot();
        assert_eq!(cat.resolve_selector("temp-01, temp-02").len(), 2);
        assert!(cat.resolve_selector("temp-01, ghost-9").is_empty());
    }

    #[test]
    fn test_unknown_rule_parameter_rejected() {
        let grammar = r#"
rules:
  - pattern: '^prioritize (?P<bogus>.+)$'
    intent: priority
"#;
        let err = build_snapshot(DEVICES, grammar, TEMPLATES, "d", "g", "t").unwrap_err();
        assert!(matches!(err, CatalogError::ConfigInvalid(_)));
    }

    #[test]
    fn test_unknown_template_hole_rejected() {
        let templates = r#"
templates:
  htb_class: "class add dev {interface} {nonsense}"
"#;
        let err = build_snapshot(DEVICES, GRAMMAR, templates, "d", "g", "t").unwrap_err();
        assert!(matches!(err, CatalogError::ConfigInvalid(_)));
    }

    #[test]
    fn test_template_render() {
        let cat = snapshot();
        let tpl = cat.template(PolicyKind::HtbClass).unwrap();
        let mut values = HashMap::new();
        values.insert("interface", "eth0".to_string());
        values.insert("classid", "1:101".to_string());
        values.insert("rate_bit", "409600".to_string());
        values.insert("ceil_bit", "409600".to_string());
        values.insert("burst", "15k".to_string());
        let rendered = tpl.render(&values).unwrap();
        assert_eq!(
            rendered,
            "class replace dev eth0 parent 1: classid 1:101 htb rate 409600bit ceil 409600bit burst 15k"
        );
    }

    #[test]
    fn test_class_minors_stable() {
        let cat = snapshot();
        // Ordre alphabétique : camera-01, temp-01, temp-02
        assert_eq!(cat.class_minor("camera-01"), Some(101));
        assert_eq!(cat.class_minor("temp-01"), Some(102));
        assert_eq!(cat.class_minor("temp-02"), Some(103));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("temp-*", "temp-01"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("esp32-?am-1", "esp32-cam-1"));
        assert!(!glob_match("temp-*", "camera-01"));
    }

    #[test]
    fn test_duplicate_topic_rejected() {
        let devices = r#"
devices:
  a:
    kind: sensor
    control_topic: iot/x/control
    telemetry_topic: iot/x/telemetry
  b:
    kind: sensor
    control_topic: iot/x/control
    telemetry_topic: iot/y/telemetry
"#;
        let err = build_snapshot(devices, GRAMMAR, TEMPLATES, "d", "g", "t").unwrap_err();
        assert!(matches!(err, CatalogError::ConfigInvalid(_)));
    }
}
