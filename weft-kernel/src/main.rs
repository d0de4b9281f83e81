/**
 * WEFT KERNEL - Point d'entrée du contrôleur IBN
 *
 * RÔLE : Orchestration de tous les modules : store, catalog, transport,
 * enforcers, feedback, surface HTTP. Séquence de démarrage stricte :
 * 1. Store + migrations (refus de servir si le schéma ne migre pas)
 * 2. Catalog (devices, grammaire, templates)
 * 3. Enforcers + réconciliation contre le store
 * 4. Boucle de feedback
 * 5. Surface de soumission HTTP
 *
 * Arrêt gracieux : signal -> plus de soumissions, drain des workers sous
 * 5s, flush du store, déconnexion du transport. Les policies appliquées
 * persistent ; la réconciliation du prochain démarrage recolle le réel
 * au store.
 */

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use weft_kernel::catalog::CatalogHandle;
use weft_kernel::config::load_config;
use weft_kernel::enforce::dataplane::{DryRunner, ShellRunner};
use weft_kernel::health::HealthTracker;
use weft_kernel::http::{build_router, AppState};
use weft_kernel::metrics::KernelMetrics;
use weft_kernel::mqtt::spawn_transport;
use weft_kernel::start_kernel;
use weft_kernel::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft_kernel=info")),
        )
        .init();

    let cfg = load_config().await;
    info!(interface = %cfg.interface, dry_run = cfg.dry_run, "weft kernel starting");

    // 1. Store + migrations. Échec = fatal : on ne sert pas sans schéma.
    let store = Store::open(&cfg.database)
        .await
        .context("failed to open state store")?;

    // 2. Catalog
    let catalog = CatalogHandle::load(cfg.catalog.clone())
        .await
        .context("failed to load catalog")?;

    let health = HealthTracker::new();
    let metrics = Arc::new(KernelMetrics::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (device_events_tx, device_events_rx) = mpsc::channel(256);

    // Transport MQTT : alimente les files entrantes, draine l'outbox
    let outbox = spawn_transport(
        cfg.mqtt.clone(),
        catalog.clone(),
        store.clone(),
        metrics.clone(),
        health.clone(),
        device_events_tx.clone(),
        shutdown_rx.clone(),
    );

    // 3-4. Workers du kernel. Stratégie data plane figée au démarrage.
    let core = if cfg.dry_run {
        info!("data plane in dry-run mode: directives validated and recorded, not executed");
        start_kernel(
            cfg.clone(),
            store,
            catalog,
            DryRunner::new(),
            outbox,
            device_events_tx,
            device_events_rx,
            health,
            metrics,
            shutdown_rx.clone(),
        )
        .await?
    } else {
        start_kernel(
            cfg.clone(),
            store,
            catalog,
            ShellRunner,
            outbox,
            device_events_tx,
            device_events_rx,
            health,
            metrics,
            shutdown_rx.clone(),
        )
        .await?
    };

    // 5. Surface de soumission
    let app = build_router(AppState { core });
    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen))?;
    info!("listening on http://{}", cfg.listen);

    let mut http_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .await
    });

    tokio::select! {
        result = server => {
            if let Ok(Err(e)) = result {
                error!(error = %e, "http server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    // Drain : les workers abandonnent leurs appels bloquants sous 5s
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_secs(5)).await;
    info!("weft kernel stopped");
    Ok(())
}
