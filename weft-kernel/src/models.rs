/**
 * MODÈLES DE DONNÉES - Structures centrales du kernel Weft
 *
 * RÔLE : Définit les structures partagées entre tous les modules :
 * Device (registre), Intent (souhait utilisateur), ParsedIntent (forme
 * structurée), Policy (directive concrète), MetricSample (observation).
 *
 * UTILITÉ : Typage fort, sérialisation JSON (store + API), mapping TEXT
 * pour SQLite via as_str()/parse().
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

/// Sac de paramètres ordonné (déterministe) utilisé par ParsedIntent et Policy
pub type ParamMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Sensor,
    Camera,
    Audio,
    Gateway,
    Other,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Sensor => "sensor",
            DeviceKind::Camera => "camera",
            DeviceKind::Audio => "audio",
            DeviceKind::Gateway => "gateway",
            DeviceKind::Other => "other",
        }
    }
}

impl FromStr for DeviceKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sensor" => Ok(DeviceKind::Sensor),
            "camera" => Ok(DeviceKind::Camera),
            "audio" => Ok(DeviceKind::Audio),
            "gateway" => Ok(DeviceKind::Gateway),
            "other" => Ok(DeviceKind::Other),
            other => Err(format!("unknown device kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    Low,
    Normal,
    High,
}

impl PriorityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityLevel::Low => "low",
            PriorityLevel::Normal => "normal",
            PriorityLevel::High => "high",
        }
    }

    /// Minor de la classe HTB partagée pour ce niveau (1:10 / 1:20 / 1:30)
    pub fn class_minor(&self) -> u32 {
        match self {
            PriorityLevel::High => 10,
            PriorityLevel::Normal => 20,
            PriorityLevel::Low => 30,
        }
    }
}

impl FromStr for PriorityLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(PriorityLevel::Low),
            "normal" => Ok(PriorityLevel::Normal),
            "high" => Ok(PriorityLevel::High),
            other => Err(format!("unknown priority level: {other}")),
        }
    }
}

/// Endpoint connu du kernel. Chargé depuis le registre de devices,
/// jamais créé par une soumission utilisateur.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub kind: DeviceKind,
    /// Adresse IP ou logique, optionnelle (requis pour le marquage data plane)
    pub address: Option<String>,
    #[serde(default = "default_priority")]
    pub default_priority: PriorityLevel,
    #[serde(default = "default_qos")]
    pub default_qos: u8,
    /// Plafond de bande passante en octets/s, optionnel
    pub bandwidth_cap: Option<u64>,
    /// Tokens de capacités : mqtt, telemetry, bandwidth_limit, audio_gain, resolution...
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub control_topic: String,
    pub telemetry_topic: String,
    /// Intervalle d'échantillonnage minimum documenté du device (ms)
    #[serde(default = "default_min_sampling")]
    pub min_sampling_interval_ms: u64,
}

fn default_priority() -> PriorityLevel {
    PriorityLevel::Normal
}
fn default_qos() -> u8 {
    1
}
fn default_min_sampling() -> u64 {
    100
}

impl Device {
    pub fn has_capability(&self, token: &str) -> bool {
        self.capabilities.iter().any(|c| c == token)
    }
}

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

/// Famille fermée d'intents que la grammaire peut produire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Priority,
    Bandwidth,
    Latency,
    Qos,
    Sampling,
    AudioGain,
    CameraConfig,
    Enable,
    Reset,
    PowerSaving,
    Security,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Priority => "priority",
            IntentKind::Bandwidth => "bandwidth",
            IntentKind::Latency => "latency",
            IntentKind::Qos => "qos",
            IntentKind::Sampling => "sampling",
            IntentKind::AudioGain => "audio_gain",
            IntentKind::CameraConfig => "camera_config",
            IntentKind::Enable => "enable",
            IntentKind::Reset => "reset",
            IntentKind::PowerSaving => "power_saving",
            IntentKind::Security => "security",
        }
    }

    /// Noms de paramètres acceptés pour ce type (validation de la grammaire)
    pub fn known_params(&self) -> &'static [&'static str] {
        match self {
            IntentKind::Priority => &["level", "target"],
            IntentKind::Bandwidth => &["rate", "target"],
            IntentKind::Latency => &["delay", "target"],
            IntentKind::Qos => &["qos", "target"],
            IntentKind::Sampling => &["interval", "target"],
            IntentKind::AudioGain => &["gain", "target"],
            IntentKind::CameraConfig => &["field", "value", "target"],
            IntentKind::Enable => &["enabled", "target"],
            IntentKind::Reset => &["target"],
            IntentKind::PowerSaving => &["enabled", "target"],
            IntentKind::Security => &["profile", "target"],
        }
    }
}

impl FromStr for IntentKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "priority" => Ok(IntentKind::Priority),
            "bandwidth" => Ok(IntentKind::Bandwidth),
            "latency" => Ok(IntentKind::Latency),
            "qos" => Ok(IntentKind::Qos),
            "sampling" => Ok(IntentKind::Sampling),
            "audio_gain" => Ok(IntentKind::AudioGain),
            "camera_config" => Ok(IntentKind::CameraConfig),
            "enable" => Ok(IntentKind::Enable),
            "reset" => Ok(IntentKind::Reset),
            "power_saving" => Ok(IntentKind::PowerSaving),
            "security" => Ok(IntentKind::Security),
            other => Err(format!("unknown intent kind: {other}")),
        }
    }
}

/// Sélecteur de cibles résolu contre le Catalog au moment de la compilation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum TargetSelector {
    /// Liste explicite d'ids de devices
    Ids { ids: Vec<String> },
    /// Motif glob sur les ids (ex: "temp-*")
    Glob { pattern: String },
    /// Filtre par famille de devices
    Kind { kind: DeviceKind },
    /// Groupe nommé déclaré dans le registre ("temperature sensors", "cameras")
    Group { name: String },
}

/// Forme structurée d'une clause de texte
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedIntent {
    pub kind: IntentKind,
    pub selector: TargetSelector,
    pub parameters: ParamMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Compiled,
    Applied,
    Satisfied,
    Violated,
    Superseded,
    Failed,
    Revoked,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Compiled => "compiled",
            IntentStatus::Applied => "applied",
            IntentStatus::Satisfied => "satisfied",
            IntentStatus::Violated => "violated",
            IntentStatus::Superseded => "superseded",
            IntentStatus::Failed => "failed",
            IntentStatus::Revoked => "revoked",
        }
    }

    /// Statuts terminaux : plus aucune transition autorisée
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Superseded | IntentStatus::Failed | IntentStatus::Revoked
        )
    }
}

impl FromStr for IntentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IntentStatus::Pending),
            "compiled" => Ok(IntentStatus::Compiled),
            "applied" => Ok(IntentStatus::Applied),
            "satisfied" => Ok(IntentStatus::Satisfied),
            "violated" => Ok(IntentStatus::Violated),
            "superseded" => Ok(IntentStatus::Superseded),
            "failed" => Ok(IntentStatus::Failed),
            "revoked" => Ok(IntentStatus::Revoked),
            other => Err(format!("unknown intent status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Goals (cibles mesurables pour la boucle de feedback)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalMetric {
    LatencyMs,
    ThroughputMsgs,
    BandwidthBps,
}

impl GoalMetric {
    /// Nom de série dans metrics_history
    pub fn metric_name(&self) -> &'static str {
        match self {
            GoalMetric::LatencyMs => "latency_ms",
            GoalMetric::ThroughputMsgs => "throughput_msgs",
            GoalMetric::BandwidthBps => "bandwidth_bps",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalAggregate {
    Mean,
    P95,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalBound {
    /// L'observation doit rester sous la valeur (latence, bande passante)
    UpperBound,
    /// L'observation doit rester au-dessus (débit)
    LowerBound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub metric: GoalMetric,
    pub aggregate: GoalAggregate,
    pub bound: GoalBound,
    pub value: f64,
    /// Device sur lequel la série est évaluée
    pub device_id: Option<String>,
}

/// Intent complet tel que persisté
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub id: String,
    pub raw_text: String,
    /// Clauses sœurs issues du découpage par conjonctions
    pub parsed: Vec<ParsedIntent>,
    pub goal: Option<Goal>,
    pub status: IntentStatus,
    pub submitter: String,
    /// Back-pointer vers l'intent parent pour les correctifs du feedback
    pub parent_id: Option<String>,
    /// Vrai tant qu'au moins une policy attend la livraison (device offline)
    pub warning: bool,
    pub superseded_by: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyPlane {
    DataPlane,
    Device,
}

impl PolicyPlane {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyPlane::DataPlane => "data_plane",
            PolicyPlane::Device => "device",
        }
    }
}

impl FromStr for PolicyPlane {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data_plane" => Ok(PolicyPlane::DataPlane),
            "device" => Ok(PolicyPlane::Device),
            other => Err(format!("unknown policy plane: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    HtbClass,
    NetemDelay,
    PriorityMark,
    IptablesRule,
    DeviceControl,
    MqttQos,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::HtbClass => "htb_class",
            PolicyKind::NetemDelay => "netem_delay",
            PolicyKind::PriorityMark => "priority_mark",
            PolicyKind::IptablesRule => "iptables_rule",
            PolicyKind::DeviceControl => "device_control",
            PolicyKind::MqttQos => "mqtt_qos",
        }
    }

    pub fn plane(&self) -> PolicyPlane {
        match self {
            PolicyKind::HtbClass
            | PolicyKind::NetemDelay
            | PolicyKind::PriorityMark
            | PolicyKind::IptablesRule => PolicyPlane::DataPlane,
            PolicyKind::DeviceControl | PolicyKind::MqttQos => PolicyPlane::Device,
        }
    }

    /// Trous de substitution autorisés dans le template de ce kind
    pub fn known_holes(&self) -> &'static [&'static str] {
        match self {
            PolicyKind::HtbClass => &["interface", "classid", "rate_bit", "ceil_bit", "burst"],
            PolicyKind::NetemDelay => &["interface", "classid", "handle", "delay_ms"],
            PolicyKind::PriorityMark => &["address", "mark"],
            PolicyKind::IptablesRule => &["address", "mark", "chain"],
            PolicyKind::DeviceControl | PolicyKind::MqttQos => &[],
        }
    }
}

impl FromStr for PolicyKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "htb_class" => Ok(PolicyKind::HtbClass),
            "netem_delay" => Ok(PolicyKind::NetemDelay),
            "priority_mark" => Ok(PolicyKind::PriorityMark),
            "iptables_rule" => Ok(PolicyKind::IptablesRule),
            "device_control" => Ok(PolicyKind::DeviceControl),
            "mqtt_qos" => Ok(PolicyKind::MqttQos),
            other => Err(format!("unknown policy kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Pending,
    /// Device hors ligne : en attente de l'événement de naissance
    PendingDelivery,
    Applied,
    Failed,
    RolledBack,
    Superseded,
}

impl PolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyStatus::Pending => "pending",
            PolicyStatus::PendingDelivery => "pending_delivery",
            PolicyStatus::Applied => "applied",
            PolicyStatus::Failed => "failed",
            PolicyStatus::RolledBack => "rolled_back",
            PolicyStatus::Superseded => "superseded",
        }
    }
}

impl FromStr for PolicyStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PolicyStatus::Pending),
            "pending_delivery" => Ok(PolicyStatus::PendingDelivery),
            "applied" => Ok(PolicyStatus::Applied),
            "failed" => Ok(PolicyStatus::Failed),
            "rolled_back" => Ok(PolicyStatus::RolledBack),
            "superseded" => Ok(PolicyStatus::Superseded),
            other => Err(format!("unknown policy status: {other}")),
        }
    }
}

/// Cible d'une policy : classe tc sur une interface, ou device distant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "plane", rename_all = "snake_case")]
pub enum PolicyTarget {
    DataPlane { interface: String, classid: String },
    Device { device_id: String },
}

impl fmt::Display for PolicyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyTarget::DataPlane { interface, classid } => {
                write!(f, "{interface}/{classid}")
            }
            PolicyTarget::Device { device_id } => write!(f, "{device_id}"),
        }
    }
}

/// Directive concrète applicable sur un plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub intent_id: String,
    pub kind: PolicyKind,
    pub target: PolicyTarget,
    /// Pour device_control : inclut le champ "command" publié tel quel
    pub parameters: ParamMap,
    /// Clé de collision (target + kind, + commande pour device_control).
    /// Au plus une policy `applied` par clé.
    pub conflict_key: String,
    pub status: PolicyStatus,
    /// Ordre d'application au sein de l'intent
    pub seq: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub applied_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

impl Policy {
    pub fn plane(&self) -> PolicyPlane {
        self.kind.plane()
    }

    /// Calcule la clé de collision d'une policy.
    /// device_control : la commande fait partie de la clé pour que
    /// résolution et luminosité d'une même caméra coexistent
    /// (ENABLE/DISABLE partagent la même clé, ils s'excluent).
    /// priority_mark : l'adresse cible fait partie de la clé, une marque
    /// par device même quand elles pointent vers la même feuille.
    pub fn conflict_key_for(kind: PolicyKind, target: &PolicyTarget, params: &ParamMap) -> String {
        match kind {
            PolicyKind::DeviceControl => {
                let command = params
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or("UNKNOWN");
                let group = match command {
                    "ENABLE" | "DISABLE" => "ENABLE",
                    other => other,
                };
                format!("{target}/{}/{group}", kind.as_str())
            }
            PolicyKind::PriorityMark => {
                let address = params
                    .get("address")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                format!("{target}/{}/{address}", kind.as_str())
            }
            _ => format!("{target}/{}", kind.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Observation unique utilisée par la boucle de feedback.
/// Append-only, idempotente au rejeu (clé unique nom+device+timestamp).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric_name: String,
    pub device_id: Option<String>,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Générateur d'identifiants monotones
// ---------------------------------------------------------------------------

/// Ids au format `<prefix>-<millis>-<seq>` : lisibles, triables, monotones
/// même quand plusieurs ids tombent dans la même milliseconde.
pub struct IdGen {
    seq: AtomicU64,
}

impl IdGen {
    pub fn new() -> Self {
        Self { seq: AtomicU64::new(0) }
    }

    pub fn next(&self, prefix: &str) -> String {
        let now = OffsetDateTime::now_utc();
        let millis = (now.unix_timestamp_nanos() / 1_000_000) as u64;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{millis}-{seq:04}")
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}
