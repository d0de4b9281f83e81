/**
 * DEVICE ENFORCER - Livraison des policies device via le bus pub/sub
 *
 * RÔLE :
 * Publie les messages de contrôle JSON sur le control_topic de chaque
 * device (QoS at-least-once) et considère une policy `applied` quand la
 * télémétrie du device reflète le changement dans la fenêtre d'ack.
 *
 * FONCTIONNEMENT :
 * - Une file logique par device : sérialisé par device, parallèle entre
 *   devices (une task par device, spawned à la demande)
 * - Ack : après publication, la télémétrie entrante est sondée jusqu'à ce
 *   que chaque paramètre du message soit reflété ; sinon retry avec
 *   backoff exponentiel, puis failed. Deadline dure de 10s par tentative
 *   globale, attente d'ack comprise
 * - Devices hors ligne (statut retained online/offline) : la policy passe
 *   en pending_delivery et est relivrée à l'événement de naissance
 * - À la reconnexion du transport, toutes les policies `applied` du plan
 *   device sont re-vérifiées (republication idempotente)
 *
 * Le rollback d'une policy device est purement comptable : le message de
 * contrôle suivant sur la même clé écrase le précédent chez le device.
 */

use super::{ApplyOutcome, EnforceNotice, JobAction, PlaneJob};
use crate::catalog::CatalogHandle;
use crate::models::{ParamMap, Policy, PolicyPlane, PolicyStatus, PolicyTarget};
use crate::mqtt::OutboundMessage;
use crate::state::{shared, Shared};
use crate::store::Store;
use rumqttc::QoS;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Événements consommés par le worker device plane
pub enum DeviceEvent {
    Job(PlaneJob),
    /// Télémétrie entrante déjà décodée en JSON plat
    Telemetry { device_id: String, payload: ParamMap },
    /// Annonce online/offline du status topic (retained)
    Status { device_id: String, online: bool },
    /// Le transport s'est reconnecté : re-vérifier les policies appliquées
    TransportReconnected,
}

#[derive(Clone)]
pub struct DeviceEnforcerCfg {
    pub ack_window: Duration,
    pub deadline: Duration,
    pub max_attempts: u32,
}

impl DeviceEnforcerCfg {
    pub fn from_config(cfg: &crate::config::EnforcementConf) -> Self {
        Self {
            ack_window: Duration::from_secs(cfg.ack_window_secs),
            deadline: Duration::from_secs(cfg.device_deadline_secs),
            max_attempts: cfg.max_attempts,
        }
    }
}

/// Job interne d'une file par device. `reply` est absent pour les
/// relivraisons (flush, re-vérification) : l'issue part alors en notice.
struct DeviceJob {
    policy: Policy,
    reply: Option<oneshot::Sender<ApplyOutcome>>,
}

pub async fn run_device_worker(
    cfg: DeviceEnforcerCfg,
    store: Store,
    catalog: CatalogHandle,
    outbox: mpsc::Sender<OutboundMessage>,
    mut events: mpsc::Receiver<DeviceEvent>,
    notices: mpsc::Sender<EnforceNotice>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("device-plane worker started");
    let latest: Shared<HashMap<String, ParamMap>> = shared(HashMap::new());
    let mut online: HashSet<String> = HashSet::new();
    let mut seen_status: HashSet<String> = HashSet::new();
    let mut pending: HashMap<String, Vec<Policy>> = HashMap::new();
    let mut queues: HashMap<String, mpsc::Sender<DeviceJob>> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("device-plane worker stopping");
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    DeviceEvent::Telemetry { device_id, payload } => {
                        latest.lock().insert(device_id, payload);
                    }
                    DeviceEvent::Status { device_id, online: is_online } => {
                        seen_status.insert(device_id.clone());
                        if is_online {
                            info!(device = %device_id, "device online");
                            online.insert(device_id.clone());
                            // Relivraison des policies parquées
                            for policy in pending.remove(&device_id).unwrap_or_default() {
                                enqueue(
                                    &mut queues, &cfg, &store, &catalog, &outbox,
                                    &latest, &notices,
                                    DeviceJob { policy, reply: None },
                                ).await;
                            }
                        } else {
                            info!(device = %device_id, "device offline");
                            online.remove(&device_id);
                        }
                    }
                    DeviceEvent::TransportReconnected => {
                        match store.applied_policies(PolicyPlane::Device).await {
                            Ok(applied) => {
                                info!(count = applied.len(), "re-verifying device policies after reconnect");
                                for policy in applied {
                                    enqueue(
                                        &mut queues, &cfg, &store, &catalog, &outbox,
                                        &latest, &notices,
                                        DeviceJob { policy, reply: None },
                                    ).await;
                                }
                            }
                            Err(e) => error!(error = %e, "reconnect re-verify query failed"),
                        }
                    }
                    DeviceEvent::Job(PlaneJob { action, policy, reply }) => {
                        let device_id = match &policy.target {
                            PolicyTarget::Device { device_id } => device_id.clone(),
                            PolicyTarget::DataPlane { .. } => {
                                let _ = reply.send(ApplyOutcome::Failed(
                                    "data-plane policy routed to device plane".into(),
                                ));
                                continue;
                            }
                        };

                        if action == JobAction::Rollback {
                            // Comptable : l'écrasement fait le travail côté device
                            if let Err(e) = store
                                .set_policy_status(&policy.id, PolicyStatus::RolledBack, None)
                                .await
                            {
                                error!(policy = %policy.id, error = %e, "rollback status write failed");
                            }
                            let _ = reply.send(ApplyOutcome::RolledBack);
                            continue;
                        }

                        // Hors ligne connu -> pending_delivery jusqu'à la naissance
                        if seen_status.contains(&device_id) && !online.contains(&device_id) {
                            if let Err(e) = store
                                .set_policy_status(&policy.id, PolicyStatus::PendingDelivery, None)
                                .await
                            {
                                error!(policy = %policy.id, error = %e, "pending status write failed");
                            }
                            pending.entry(device_id).or_default().push(policy);
                            let _ = reply.send(ApplyOutcome::PendingDelivery);
                            continue;
                        }

                        enqueue(
                            &mut queues, &cfg, &store, &catalog, &outbox,
                            &latest, &notices,
                            DeviceJob { policy, reply: Some(reply) },
                        ).await;
                    }
                }
            }
        }
    }
}

/// Route un job vers la file de son device, en créant la task par device
/// au premier usage.
#[allow(clippy::too_many_arguments)]
async fn enqueue(
    queues: &mut HashMap<String, mpsc::Sender<DeviceJob>>,
    cfg: &DeviceEnforcerCfg,
    store: &Store,
    catalog: &CatalogHandle,
    outbox: &mpsc::Sender<OutboundMessage>,
    latest: &Shared<HashMap<String, ParamMap>>,
    notices: &mpsc::Sender<EnforceNotice>,
    job: DeviceJob,
) {
    let device_id = match &job.policy.target {
        PolicyTarget::Device { device_id } => device_id.clone(),
        PolicyTarget::DataPlane { .. } => return,
    };

    let sender = queues.entry(device_id.clone()).or_insert_with(|| {
        let (tx, rx) = mpsc::channel::<DeviceJob>(16);
        tokio::spawn(run_device_queue(
            device_id,
            cfg.clone(),
            store.clone(),
            catalog.clone(),
            outbox.clone(),
            latest.clone(),
            notices.clone(),
            rx,
        ));
        tx
    });

    if sender.send(job).await.is_err() {
        warn!("device queue closed, job dropped");
    }
}

/// File d'un device : applique ses jobs un par un
#[allow(clippy::too_many_arguments)]
async fn run_device_queue(
    device_id: String,
    cfg: DeviceEnforcerCfg,
    store: Store,
    catalog: CatalogHandle,
    outbox: mpsc::Sender<OutboundMessage>,
    latest: Shared<HashMap<String, ParamMap>>,
    notices: mpsc::Sender<EnforceNotice>,
    mut jobs: mpsc::Receiver<DeviceJob>,
) {
    while let Some(DeviceJob { policy, reply }) = jobs.recv().await {
        let outcome = apply_device_policy(&device_id, &cfg, &catalog, &outbox, &latest, &policy).await;

        let (status, error) = match &outcome {
            ApplyOutcome::Applied => (PolicyStatus::Applied, None),
            ApplyOutcome::Failed(e) => (PolicyStatus::Failed, Some(e.clone())),
            ApplyOutcome::PendingDelivery => (PolicyStatus::PendingDelivery, None),
            ApplyOutcome::RolledBack | ApplyOutcome::Absent => (PolicyStatus::RolledBack, None),
        };
        if let Err(e) = store.set_policy_status(&policy.id, status, error.as_deref()).await {
            error!(policy = %policy.id, error = %e, "policy status write failed");
        }

        match reply {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                let _ = notices
                    .send(EnforceNotice {
                        intent_id: policy.intent_id.clone(),
                        policy_id: policy.id.clone(),
                        outcome,
                    })
                    .await;
            }
        }
    }
}

/// Publication + attente du reflet en télémétrie, avec retries bornés.
/// Toute la séquence est sous la deadline dure du plan device.
async fn apply_device_policy(
    device_id: &str,
    cfg: &DeviceEnforcerCfg,
    catalog: &CatalogHandle,
    outbox: &mpsc::Sender<OutboundMessage>,
    latest: &Shared<HashMap<String, ParamMap>>,
    policy: &Policy,
) -> ApplyOutcome {
    let snapshot = catalog.snapshot();
    let Some(device) = snapshot.lookup_device(device_id) else {
        return ApplyOutcome::Failed(format!("device {device_id} not in catalog"));
    };
    let topic = device.control_topic.clone();
    let payload = match serde_json::to_vec(&policy.parameters) {
        Ok(p) => p,
        Err(e) => return ApplyOutcome::Failed(format!("payload encode: {e}")),
    };

    let attempt_loop = async {
        for attempt in 0..cfg.max_attempts {
            if attempt > 0 {
                // Backoff exponentiel entre tentatives
                tokio::time::sleep(Duration::from_millis(500u64 << attempt)).await;
            }
            let message = OutboundMessage {
                topic: topic.clone(),
                payload: payload.clone(),
                qos: QoS::AtLeastOnce,
                retain: false,
            };
            if outbox.send(message).await.is_err() {
                return ApplyOutcome::Failed("transport_unavailable".into());
            }
            debug!(device = device_id, policy = %policy.id, attempt, "control message published");

            if wait_for_reflection(cfg.ack_window, latest, device_id, &policy.parameters).await {
                return ApplyOutcome::Applied;
            }
            warn!(device = device_id, policy = %policy.id, attempt, "no telemetry reflection in ack window");
        }
        ApplyOutcome::Failed("no telemetry reflection after retries".into())
    };

    match tokio::time::timeout(cfg.deadline, attempt_loop).await {
        Ok(outcome) => outcome,
        Err(_) => ApplyOutcome::Failed("apply_timeout".into()),
    }
}

/// Sonde la dernière télémétrie du device jusqu'à ce qu'elle reflète tous
/// les paramètres du message (la commande elle-même exceptée).
async fn wait_for_reflection(
    window: Duration,
    latest: &Shared<HashMap<String, ParamMap>>,
    device_id: &str,
    params: &ParamMap,
) -> bool {
    // Message sans paramètre observable (RESET) : l'ack est la publication
    if params.keys().all(|k| k == "command") {
        return true;
    }

    let deadline = tokio::time::Instant::now() + window;
    loop {
        if let Some(telemetry) = latest.lock().get(device_id) {
            if reflects(params, telemetry) {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Vrai si chaque paramètre (hors commande) a son reflet dans la télémétrie
fn reflects(params: &ParamMap, telemetry: &ParamMap) -> bool {
    for (key, expected) in params {
        if key == "command" {
            continue;
        }
        let Some(actual) = telemetry.get(key) else { return false };
        let matched = match (expected.as_f64(), actual.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < 1e-6,
            _ => expected == actual,
        };
        if !matched {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, serde_json::Value)]) -> ParamMap {
        let mut map = ParamMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        map
    }

    #[test]
    fn test_reflects_numeric_tolerance() {
        let wanted = params(&[("command", json!("SET_AUDIO_GAIN")), ("gain", json!(3.5))]);
        let telemetry = params(&[("gain", json!(3.5000001)), ("uptime", json!(12))]);
        assert!(reflects(&wanted, &telemetry));
    }

    #[test]
    fn test_reflects_missing_field() {
        let wanted = params(&[("command", json!("SET_SAMPLING_INTERVAL")), ("interval_ms", json!(30000))]);
        let telemetry = params(&[("co2_ppm", json!(420))]);
        assert!(!reflects(&wanted, &telemetry));
    }

    #[test]
    fn test_reflects_string_values() {
        let wanted = params(&[("command", json!("SET_CAMERA_RESOLUTION")), ("resolution", json!("VGA"))]);
        let telemetry = params(&[("resolution", json!("VGA"))]);
        assert!(reflects(&wanted, &telemetry));
        let stale = params(&[("resolution", json!("HD"))]);
        assert!(!reflects(&wanted, &stale));
    }

    #[tokio::test]
    async fn test_wait_for_reflection_command_only_acks_on_publish() {
        let latest = shared(HashMap::new());
        let wanted = params(&[("command", json!("RESET"))]);
        assert!(wait_for_reflection(Duration::from_millis(10), &latest, "dev", &wanted).await);
    }

    #[tokio::test]
    async fn test_wait_for_reflection_times_out() {
        let latest = shared(HashMap::new());
        let wanted = params(&[("command", json!("SET_AUDIO_GAIN")), ("gain", json!(2.0))]);
        let start = tokio::time::Instant::now();
        assert!(!wait_for_reflection(Duration::from_millis(300), &latest, "dev", &wanted).await);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
