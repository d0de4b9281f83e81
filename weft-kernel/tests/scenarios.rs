//! Scénarios de bout en bout du kernel : soumission -> compilation ->
//! enforcement -> feedback, sur data plane dry-run et device plane joué
//! contre le transport simulé du devkit (télémétrie, statuts retained,
//! messages de contrôle relus décodés).

use std::sync::Arc;
use std::time::Duration;

use devkit::fixtures::write_catalog_fixtures;
use devkit::MockTransport;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};

use weft_kernel::catalog::CatalogHandle;
use weft_kernel::config::{CatalogPaths, KernelConfig};
use weft_kernel::core::{Core, FEEDBACK_SUBMITTER};
use weft_kernel::enforce::dataplane::DryRunner;
use weft_kernel::enforce::device::DeviceEvent;
use weft_kernel::feedback::FeedbackController;
use weft_kernel::health::HealthTracker;
use weft_kernel::metrics::KernelMetrics;
use weft_kernel::models::{
    IntentStatus, MetricSample, ParamMap, PolicyKind, PolicyStatus,
};
use weft_kernel::mqtt::OutboundMessage;
use weft_kernel::start_kernel;
use weft_kernel::store::Store;

struct Harness {
    core: Core,
    store: Store,
    runner: DryRunner,
    mock: MockTransport,
    _shutdown: watch::Sender<bool>,
}

async fn harness() -> Harness {
    let fixture = write_catalog_fixtures();
    let catalog = CatalogHandle::load(CatalogPaths {
        devices: fixture.devices.clone(),
        grammar: fixture.grammar.clone(),
        templates: fixture.templates.clone(),
    })
    .await
    .expect("catalog fixture");

    let db = std::env::temp_dir().join(format!("weft-scenario-{}.db", uuid::Uuid::new_v4()));
    let store = Store::open(db.to_str().unwrap()).await.expect("store");

    let mut cfg = KernelConfig::default();
    cfg.dry_run = true;
    // La boucle spawned ne doit pas interférer : on tick à la main
    cfg.feedback.period_secs = 3600;
    cfg.enforcement.ack_window_secs = 1;
    cfg.enforcement.device_deadline_secs = 3;
    cfg.enforcement.max_attempts = 2;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<OutboundMessage>(256);
    let (device_tx, device_rx) = mpsc::channel(256);
    let runner = DryRunner::new();
    let mock = MockTransport::new();

    // Pont sortant : l'outbox du kernel se rejoue sur le transport simulé
    let outbound_mock = mock.clone();
    tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            let _ = outbound_mock
                .publish(message.topic, message.qos, message.retain, message.payload)
                .await;
        }
    });

    // Pont entrant : les messages simulés deviennent des événements
    // device, comme le ferait la task transport réelle
    let mut incoming = mock.incoming_receiver();
    let inbound_events = device_tx.clone();
    tokio::spawn(async move {
        while let Some(message) = incoming.recv().await {
            let Ok(json) = serde_json::from_slice::<serde_json::Value>(&message.payload) else {
                continue;
            };
            let mut segments = message.topic.split('/');
            let (Some("iot"), Some(device_id), Some(channel), None) =
                (segments.next(), segments.next(), segments.next(), segments.next())
            else {
                continue;
            };
            let event = match channel {
                "status" => DeviceEvent::Status {
                    device_id: device_id.to_string(),
                    online: json.get("status").and_then(|v| v.as_str()) == Some("online"),
                },
                "telemetry" => {
                    let Some(flat) = json.as_object() else { continue };
                    let payload: ParamMap = flat.clone();
                    DeviceEvent::Telemetry { device_id: device_id.to_string(), payload }
                }
                _ => continue,
            };
            if inbound_events.send(event).await.is_err() {
                break;
            }
        }
    });

    let core = start_kernel(
        cfg,
        store.clone(),
        catalog,
        runner.clone(),
        outbox_tx,
        device_tx,
        device_rx,
        HealthTracker::new(),
        Arc::new(KernelMetrics::new()),
        shutdown_rx,
    )
    .await
    .expect("kernel start");

    Harness { core, store, runner, mock, _shutdown: shutdown_tx }
}

async fn wait_for_intent_status(core: &Core, id: &str, wanted: IntentStatus) {
    for _ in 0..100 {
        if let Ok(Some(view)) = core.get_intent(id).await {
            if view.intent.status == wanted {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("intent {id} never reached {wanted:?}");
}

async fn wait_for_policy_status(core: &Core, intent_id: &str, policy_id: &str, wanted: PolicyStatus) {
    for _ in 0..100 {
        if let Ok(Some(view)) = core.get_intent(intent_id).await {
            if view.policies.iter().any(|p| p.id == policy_id && p.status == wanted) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("policy {policy_id} never reached {wanted:?}");
}

// Scénario 1 : priorisation. Une feuille HTB haute priorité partagée +
// une marque par capteur adressable.
#[tokio::test]
async fn scenario_prioritize_temperature_sensors() {
    let h = harness().await;

    let receipt = h.core.submit("prioritize temperature sensors", "alice").await.unwrap();
    assert_eq!(receipt.policies.len(), 3);
    assert_eq!(receipt.policies[0].kind, PolicyKind::HtbClass);
    assert_eq!(receipt.policies[1].kind, PolicyKind::PriorityMark);
    assert_eq!(receipt.policies[2].kind, PolicyKind::PriorityMark);

    wait_for_intent_status(&h.core, &receipt.intent_id, IntentStatus::Applied).await;
    let view = h.core.get_intent(&receipt.intent_id).await.unwrap().unwrap();
    assert_eq!(view.policies.len(), 3);
    assert!(view.policies.iter().all(|p| p.status == PolicyStatus::Applied));

    // La feuille 1:10 et les deux marques sont passées au plan data
    let recorded = h.runner.recorded();
    assert!(recorded.iter().any(|l| l.contains("classid 1:10 ")));
    assert_eq!(recorded.iter().filter(|l| l.contains("--set-mark 10")).count(), 2);
}

// Scénario 2 : cap de bande passante avec parsing d'unités.
// 50KB/s -> 409600 bit/s, rate = ceil ; ré-application = no-op.
#[tokio::test]
async fn scenario_bandwidth_cap_with_unit_parsing() {
    let h = harness().await;

    let receipt = h.core.submit("limit bandwidth to 50KB/s for camera-01", "alice").await.unwrap();
    assert_eq!(receipt.policies.len(), 1);
    let policy = &receipt.policies[0];
    assert_eq!(policy.kind, PolicyKind::HtbClass);
    assert_eq!(policy.parameters["rate_bit"], 409600);
    assert_eq!(policy.parameters["ceil_bit"], 409600);
    assert_eq!(policy.parameters["device"], "camera-01");

    wait_for_intent_status(&h.core, &receipt.intent_id, IntentStatus::Applied).await;
    let after_first = h
        .runner
        .recorded()
        .iter()
        .filter(|l| l.contains("rate 409600bit"))
        .count();
    assert_eq!(after_first, 1);

    // Même intent re-soumis : supersession propre + apply idempotent
    let second = h.core.submit("limit bandwidth to 50KB/s for camera-01", "alice").await.unwrap();
    wait_for_intent_status(&h.core, &second.intent_id, IntentStatus::Applied).await;
    let after_second = h
        .runner
        .recorded()
        .iter()
        .filter(|l| l.contains("rate 409600bit"))
        .count();
    assert_eq!(after_second, after_first, "re-apply must be a no-op");

    let first = h.core.get_intent(&receipt.intent_id).await.unwrap().unwrap();
    assert_eq!(first.intent.status, IntentStatus::Superseded);
}

// Scénario 3 : composé conflictuel -> erreur synchrone, rien persisté.
#[tokio::test]
async fn scenario_conflicting_compound_rejected() {
    let h = harness().await;

    let err = h
        .core
        .submit("set audio gain to 2.0 and set audio gain to 4.0 for esp32-audio-1", "alice")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "compile_conflict");

    let intents = h.core.list_intents(None).await.unwrap();
    assert!(intents.is_empty(), "nothing may be persisted on compile_conflict");
    let policies = h.core.list_policies(None).await.unwrap();
    assert!(policies.is_empty());
}

// Scénario 4 : correction par feedback. Latence observée 40ms pour un
// goal de 20ms -> violated + correctif ; convergence vers 22ms -> satisfied.
#[tokio::test]
async fn scenario_feedback_correction() {
    let h = harness().await;

    let receipt = h.core.submit("reduce latency to 20ms for sensor-01", "alice").await.unwrap();
    wait_for_intent_status(&h.core, &receipt.intent_id, IntentStatus::Applied).await;

    let mut feedback_cfg = weft_kernel::config::FeedbackConf::default();
    feedback_cfg.period_secs = 5; // fenêtre d'agrégation 10s
    let mut controller = FeedbackController::new(h.core.clone(), feedback_cfg);

    // Trois ticks d'observations à 40ms
    let now = OffsetDateTime::now_utc();
    for i in 0..3 {
        h.store
            .append_metric(&MetricSample {
                metric_name: "latency_ms".into(),
                device_id: Some("sensor-01".into()),
                value: 40.0,
                timestamp: now - time::Duration::seconds(6 - i),
            })
            .await
            .unwrap();
    }
    controller.tick().await;
    wait_for_intent_status(&h.core, &receipt.intent_id, IntentStatus::Violated).await;

    // Un correctif signé "feedback" pointe vers le parent et resserre le délai
    let mut corrective = None;
    for _ in 0..100 {
        let intents = h.core.list_intents(None).await.unwrap();
        corrective = intents
            .into_iter()
            .find(|i| i.submitter == FEEDBACK_SUBMITTER && i.parent_id.as_deref() == Some(receipt.intent_id.as_str()));
        if corrective.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let corrective = corrective.expect("corrective intent emitted");
    let corrective_view = h.core.get_intent(&corrective.id).await.unwrap().unwrap();
    let delay = corrective_view
        .policies
        .iter()
        .find(|p| p.kind == PolicyKind::NetemDelay)
        .and_then(|p| p.parameters.get("requested_ms"))
        .and_then(|v| v.as_u64())
        .unwrap();
    assert!(delay < 20, "corrective must tighten the delay, got {delay}");

    // Convergence : la série passe à 22ms (dans la bande ±10% de 20)
    h.store.prune_metrics(OffsetDateTime::now_utc()).await.unwrap();
    let now = OffsetDateTime::now_utc();
    for i in 0..3 {
        h.store
            .append_metric(&MetricSample {
                metric_name: "latency_ms".into(),
                device_id: Some("sensor-01".into()),
                value: 22.0,
                timestamp: now + time::Duration::seconds(i),
            })
            .await
            .unwrap();
    }
    controller.tick().await;
    wait_for_intent_status(&h.core, &receipt.intent_id, IntentStatus::Satisfied).await;
}

// Scénario 5 : device hors ligne puis naissance. pending_delivery,
// intent applied avec warning, puis applied quand la télémétrie reflète.
#[tokio::test]
async fn scenario_device_offline_then_online() {
    let h = harness().await;

    h.mock.simulate_status("esp32-mhz19-1", false).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let receipt = h
        .core
        .submit("set sampling interval to 30s for esp32-mhz19-1", "alice")
        .await
        .unwrap();
    let policy_id = receipt.policies[0].id.clone();

    wait_for_policy_status(&h.core, &receipt.intent_id, &policy_id, PolicyStatus::PendingDelivery).await;
    wait_for_intent_status(&h.core, &receipt.intent_id, IntentStatus::Applied).await;
    let view = h.core.get_intent(&receipt.intent_id).await.unwrap().unwrap();
    assert!(view.intent.warning, "intent must carry the pending-delivery warning");
    assert!(
        h.mock.control_messages("esp32-mhz19-1").is_empty(),
        "nothing may be published while the device is offline"
    );

    // Naissance + télémétrie qui reflète le nouvel intervalle
    h.mock.simulate_status("esp32-mhz19-1", true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.mock
        .simulate_telemetry(
            "esp32-mhz19-1",
            &[("interval_ms", json!(30000)), ("co2_ppm", json!(420))],
        )
        .unwrap();

    wait_for_policy_status(&h.core, &receipt.intent_id, &policy_id, PolicyStatus::Applied).await;

    // Le message de contrôle est bien parti sur le control topic du device
    let control = h
        .mock
        .last_control("esp32-mhz19-1")
        .expect("control message published on birth");
    assert_eq!(control["command"], "SET_SAMPLING_INTERVAL");
    assert_eq!(control["interval_ms"], 30000);

    // Plus rien en attente : le warning retombe
    for _ in 0..100 {
        let view = h.core.get_intent(&receipt.intent_id).await.unwrap().unwrap();
        if !view.intent.warning {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("warning flag never cleared");
}

// Scénario 6 : supersession. VGA puis HD sur la même caméra : le premier
// intent devient superseded, une seule policy applied par clé.
#[tokio::test]
async fn scenario_camera_resolution_supersession() {
    let h = harness().await;

    // Reflet VGA disponible avant soumission : ack immédiat
    h.mock
        .simulate_telemetry("esp32-cam-1", &[("resolution", json!("VGA"))])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let first = h
        .core
        .submit("set camera resolution to vga for esp32-cam-1", "alice")
        .await
        .unwrap();
    wait_for_intent_status(&h.core, &first.intent_id, IntentStatus::Applied).await;
    assert_eq!(
        h.mock.last_control("esp32-cam-1").unwrap()["resolution"],
        "VGA"
    );

    h.mock
        .simulate_telemetry("esp32-cam-1", &[("resolution", json!("HD"))])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = h
        .core
        .submit("set camera resolution to hd for esp32-cam-1", "alice")
        .await
        .unwrap();
    wait_for_intent_status(&h.core, &second.intent_id, IntentStatus::Applied).await;
    assert_eq!(
        h.mock.last_control("esp32-cam-1").unwrap()["resolution"],
        "HD"
    );

    let first_view = h.core.get_intent(&first.intent_id).await.unwrap().unwrap();
    assert_eq!(first_view.intent.status, IntentStatus::Superseded);
    assert_eq!(first_view.intent.superseded_by.as_deref(), Some(second.intent_id.as_str()));
    assert!(first_view
        .policies
        .iter()
        .all(|p| p.status == PolicyStatus::Superseded));

    // Une seule policy applied sur la clé (esp32-cam-1, resolution)
    let policies = h.core.list_policies(None).await.unwrap();
    let applied_on_key: Vec<_> = policies
        .iter()
        .filter(|p| {
            p.conflict_key.contains("esp32-cam-1") && p.conflict_key.contains("SET_CAMERA_RESOLUTION")
        })
        .filter(|p| p.status == PolicyStatus::Applied)
        .collect();
    assert_eq!(applied_on_key.len(), 1);
    assert_eq!(applied_on_key[0].intent_id, second.intent_id);
}

// Révocation : l'intent devient revoked et ses directives data plane
// sont retirées du plan.
#[tokio::test]
async fn scenario_revoke_rolls_back_dataplane() {
    let h = harness().await;

    let receipt = h.core.submit("limit bandwidth to 100KB/s for camera-01", "alice").await.unwrap();
    wait_for_intent_status(&h.core, &receipt.intent_id, IntentStatus::Applied).await;

    h.core.revoke_intent(&receipt.intent_id).await.unwrap();
    let view = h.core.get_intent(&receipt.intent_id).await.unwrap().unwrap();
    assert_eq!(view.intent.status, IntentStatus::Revoked);

    for _ in 0..100 {
        if h.runner.recorded().iter().any(|l| l.contains("class del dev eth0")) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("rollback directive never reached the data plane");
}

// Mode dégradé : store indisponible simulé -> soumissions refusées.
#[tokio::test]
async fn scenario_degraded_mode_rejects_submissions() {
    let h = harness().await;

    h.core.health_tracker().set_degraded(true);
    let err = h.core.submit("prioritize temperature sensors", "alice").await.unwrap_err();
    assert_eq!(err.kind(), "store_unavailable");

    h.core.health_tracker().set_degraded(false);
    assert!(h.core.submit("prioritize temperature sensors", "alice").await.is_ok());
}
