//! Weft kernel - intent-based networking controller for edge/IoT fleets
//!
//! The kernel ingests free-form intent text, compiles it into concrete
//! policies, enforces them on the local traffic-control plane and on
//! remote devices over MQTT, then keeps verifying the result against
//! live telemetry and corrects drift.
//!
//! `start_kernel` wires the long-lived workers together; the binary in
//! `main.rs` adds the real transport and the HTTP surface on top.

pub mod catalog;
pub mod compiler;
pub mod config;
pub mod core;
pub mod enforce;
pub mod feedback;
pub mod health;
pub mod http;
pub mod metrics;
pub mod models;
pub mod mqtt;
pub mod parser;
pub mod state;
pub mod store;

use crate::catalog::CatalogHandle;
use crate::config::KernelConfig;
use crate::core::{spawn_core, spawn_notice_forwarder, Core};
use crate::enforce::dataplane::{run_dataplane_worker, CommandRunner, DataPlaneEnforcer};
use crate::enforce::device::{run_device_worker, DeviceEnforcerCfg, DeviceEvent};
use crate::health::HealthTracker;
use crate::metrics::KernelMetrics;
use crate::models::PolicyPlane;
use crate::mqtt::OutboundMessage;
use crate::store::{Store, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Démarre tous les workers du kernel et rend la poignée Core.
///
/// L'appelant fournit le runner data plane (shell réel ou dry-run),
/// l'outbox du transport et les deux bouts du canal d'événements device :
/// en production le transport MQTT alimente ce canal, dans les tests le
/// harnais y injecte télémétrie et statuts directement.
#[allow(clippy::too_many_arguments)]
pub async fn start_kernel<R: CommandRunner>(
    cfg: KernelConfig,
    store: Store,
    catalog: CatalogHandle,
    runner: R,
    outbox: mpsc::Sender<OutboundMessage>,
    device_events_tx: mpsc::Sender<DeviceEvent>,
    device_events_rx: mpsc::Receiver<DeviceEvent>,
    health: HealthTracker,
    metrics: Arc<KernelMetrics>,
    shutdown: watch::Receiver<bool>,
) -> Result<Core, StoreError> {
    // Schéma courant exposé par health() ; les migrations ont déjà tourné
    health.set_schema_version(store.schema_version().await?);

    // Plan data : enforcer + réconciliation de démarrage contre le store
    let mut enforcer = DataPlaneEnforcer::new(
        &cfg.interface,
        runner,
        catalog.clone(),
        Duration::from_secs(cfg.enforcement.dataplane_deadline_secs),
        cfg.enforcement.max_attempts,
    );
    let applied = store.applied_policies(PolicyPlane::DataPlane).await?;
    match enforcer.reconcile(&applied).await {
        Ok(()) => {
            info!(policies = applied.len(), "data plane reconciled");
            health.set_component("data_plane", "ok");
        }
        Err(e) => {
            warn!(error = %e, "data plane reconciliation failed");
            health.set_component("data_plane", "degraded");
        }
    }

    let (dataplane_tx, dataplane_rx) = mpsc::channel(64);
    tokio::spawn(run_dataplane_worker(
        enforcer,
        store.clone(),
        dataplane_rx,
        shutdown.clone(),
    ));

    let core = spawn_core(
        cfg.clone(),
        store.clone(),
        catalog.clone(),
        metrics,
        health.clone(),
        dataplane_tx,
        device_events_tx,
        shutdown.clone(),
    );

    // Plan device : worker + forwarder des notices asynchrones
    let notices = spawn_notice_forwarder(&core);
    tokio::spawn(run_device_worker(
        DeviceEnforcerCfg::from_config(&cfg.enforcement),
        store.clone(),
        catalog,
        outbox,
        device_events_rx,
        notices,
        shutdown.clone(),
    ));
    health.set_component("device_plane", "ok");

    // Boucle de feedback, supervisée : un crash la relance avec backoff
    spawn_supervised_feedback(core.clone(), cfg.feedback.clone(), shutdown.clone());
    health.set_component("feedback", "ok");

    spawn_metrics_pruner(store, cfg.metrics_retention_hours, shutdown);

    Ok(core)
}

/// Supervision de la boucle de feedback : son état se reconstruit depuis
/// le store, un panic la relance donc avec un backoff borné.
fn spawn_supervised_feedback(
    core: Core,
    cfg: crate::config::FeedbackConf,
    shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut backoff_secs = 1u64;
        loop {
            let handle = feedback::spawn_feedback(core.clone(), cfg.clone(), shutdown.clone());
            match handle.await {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, backoff_secs, "feedback loop crashed, restarting");
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(60);
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
    });
}

/// Purge horaire des metric samples au-delà de la rétention
fn spawn_metrics_pruner(store: Store, retention_hours: u64, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = interval.tick() => {
                    let cutoff = time::OffsetDateTime::now_utc()
                        - time::Duration::hours(retention_hours as i64);
                    match store.prune_metrics(cutoff).await {
                        Ok(0) => {}
                        Ok(pruned) => info!(pruned, "metric samples pruned"),
                        Err(e) => warn!(error = %e, "metric pruning failed"),
                    }
                }
            }
        }
    });
}
