/**
 * CORE - Valeur centrale du kernel Weft + submission worker
 *
 * RÔLE :
 * Point d'entrée unique des opérations du kernel : submit, revoke,
 * get/list, health. Possède les inboxes des workers et le générateur
 * d'ids. Pas d'état global : le Core se passe en valeur.
 *
 * FONCTIONNEMENT :
 * - Submission worker = écrivain unique des statuts d'intents. Toutes les
 *   soumissions (utilisateur, HTTP, feedback) passent par sa file mpsc,
 *   ce qui rend l'ordre des supersessions déterministe
 * - submit : parse -> compile -> arbitrage netem (min des délais
 *   concurrents) -> persistance transactionnelle -> supersession des
 *   policies en collision -> driver d'application par intent
 * - Le driver applique les policies dans l'ordre déclaré, la suivante ne
 *   part que quand la précédente a répondu applied ou failed
 * - Les correctifs du feedback (parent_id renseigné) ne supersèdent que
 *   les POLICIES de leur parent, jamais l'intent parent lui-même : c'est
 *   lui que la boucle continue d'évaluer contre son goal
 *
 * Erreurs synchrones (parse, compile, unknown_target) retournées au
 * soumetteur ; erreurs asynchrones (apply) enregistrées sur les policies
 * et visibles via get_intent.
 */

use crate::catalog::CatalogHandle;
use crate::compiler::{CompileError, Compiler};
use crate::config::KernelConfig;
use crate::enforce::device::DeviceEvent;
use crate::enforce::{ApplyOutcome, EnforceNotice, JobAction, PlaneJob};
use crate::health::HealthTracker;
use crate::metrics::KernelMetrics;
use crate::models::{
    IdGen, Intent, IntentStatus, MetricSample, Policy, PolicyPlane, PolicyStatus,
};
use crate::parser::{parse, ParseError};
use crate::store::{Store, StoreError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

/// Soumetteur réservé aux correctifs de la boucle de feedback
pub const FEEDBACK_SUBMITTER: &str = "feedback";

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("store_unavailable: kernel is degraded, not accepting submissions")]
    Degraded,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("kernel shutting down")]
    ShuttingDown,
}

impl SubmitError {
    /// Kind stable de la taxonomie, exposé par la surface HTTP
    pub fn kind(&self) -> &'static str {
        match self {
            SubmitError::Parse(ParseError::UnknownTarget(_)) => "unknown_target",
            SubmitError::Parse(_) => "parse_failure",
            SubmitError::Compile(CompileError::Conflict(_)) => "compile_conflict",
            SubmitError::Compile(CompileError::UnknownTarget) => "unknown_target",
            SubmitError::Compile(CompileError::Unsupported(_)) => "unsupported_target",
            SubmitError::Degraded => "store_unavailable",
            SubmitError::Store(_) => "store_unavailable",
            SubmitError::NotFound(_) => "not_found",
            SubmitError::Conflict(_) => "conflict",
            SubmitError::ShuttingDown => "shutting_down",
        }
    }
}

/// Reçu de soumission retourné au soumetteur
#[derive(Debug, Serialize)]
pub struct SubmitReceipt {
    pub intent_id: String,
    pub status: IntentStatus,
    pub policies: Vec<Policy>,
}

/// Vue détaillée d'un intent pour get_intent
#[derive(Debug, Serialize)]
pub struct IntentView {
    pub intent: Intent,
    pub policies: Vec<Policy>,
    pub last_metrics: Vec<MetricSample>,
}

enum CoreMsg {
    Submit {
        raw_text: String,
        submitter: String,
        parent_id: Option<String>,
        reply: oneshot::Sender<Result<SubmitReceipt, SubmitError>>,
    },
    Revoke {
        intent_id: String,
        reply: oneshot::Sender<Result<(), SubmitError>>,
    },
    SetIntentStatus {
        intent_id: String,
        status: IntentStatus,
        note: Option<String>,
    },
    ApplyFinished {
        intent_id: String,
        any_failed: bool,
        any_pending: bool,
    },
    Notice(EnforceNotice),
}

/// Poignée clonable du kernel, passée à la surface HTTP et au feedback
#[derive(Clone)]
pub struct Core {
    tx: mpsc::Sender<CoreMsg>,
    store: Store,
    catalog: CatalogHandle,
    metrics: Arc<KernelMetrics>,
    health: HealthTracker,
}

impl Core {
    pub fn metrics(&self) -> &Arc<KernelMetrics> {
        &self.metrics
    }

    pub fn health_tracker(&self) -> &HealthTracker {
        &self.health
    }

    pub fn catalog(&self) -> &CatalogHandle {
        &self.catalog
    }

    pub async fn submit(
        &self,
        raw_text: &str,
        submitter: &str,
    ) -> Result<SubmitReceipt, SubmitError> {
        self.submit_with_parent(raw_text, submitter, None).await
    }

    pub async fn submit_with_parent(
        &self,
        raw_text: &str,
        submitter: &str,
        parent_id: Option<String>,
    ) -> Result<SubmitReceipt, SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoreMsg::Submit {
                raw_text: raw_text.to_string(),
                submitter: submitter.to_string(),
                parent_id,
                reply,
            })
            .await
            .map_err(|_| SubmitError::ShuttingDown)?;
        rx.await.map_err(|_| SubmitError::ShuttingDown)?
    }

    pub async fn revoke_intent(&self, intent_id: &str) -> Result<(), SubmitError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoreMsg::Revoke { intent_id: intent_id.to_string(), reply })
            .await
            .map_err(|_| SubmitError::ShuttingDown)?;
        rx.await.map_err(|_| SubmitError::ShuttingDown)?
    }

    /// Mutation de statut ordonnée par la file du submission worker.
    /// Utilisé par la boucle de feedback (satisfied/violated).
    pub async fn set_intent_status(
        &self,
        intent_id: &str,
        status: IntentStatus,
        note: Option<String>,
    ) {
        let _ = self
            .tx
            .send(CoreMsg::SetIntentStatus { intent_id: intent_id.to_string(), status, note })
            .await;
    }

    pub async fn get_intent(&self, id: &str) -> Result<Option<IntentView>, SubmitError> {
        let Some((intent, policies)) = self.store.get_intent(id).await? else {
            return Ok(None);
        };
        let device_id = intent
            .goal
            .as_ref()
            .and_then(|g| g.device_id.clone())
            .or_else(|| {
                policies.iter().find_map(|p| match &p.target {
                    crate::models::PolicyTarget::Device { device_id } => Some(device_id.clone()),
                    crate::models::PolicyTarget::DataPlane { .. } => p
                        .parameters
                        .get("device")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                })
            });
        let last_metrics = match device_id {
            Some(device) => self.store.recent_samples(&device, 10).await?,
            None => Vec::new(),
        };
        Ok(Some(IntentView { intent, policies, last_metrics }))
    }

    pub async fn list_intents(
        &self,
        status: Option<IntentStatus>,
    ) -> Result<Vec<Intent>, SubmitError> {
        Ok(self.store.list_intents(status, 200).await?)
    }

    pub async fn list_policies(
        &self,
        plane: Option<PolicyPlane>,
    ) -> Result<Vec<Policy>, SubmitError> {
        Ok(self.store.list_policies(plane, 200).await?)
    }

    pub async fn active_goal_intents(&self) -> Result<Vec<Intent>, SubmitError> {
        Ok(self.store.active_goal_intents().await?)
    }

    pub async fn metric_aggregate(
        &self,
        metric_name: &str,
        device_id: Option<&str>,
        since: OffsetDateTime,
        aggregate: crate::models::GoalAggregate,
    ) -> Result<Option<f64>, SubmitError> {
        Ok(self.store.metric_aggregate(metric_name, device_id, since, aggregate).await?)
    }

    pub async fn health(&self) -> crate::health::KernelHealth {
        let devices = self.catalog.snapshot().device_count();
        let active = self
            .store
            .count_intents_with_status(&[
                IntentStatus::Applied,
                IntentStatus::Satisfied,
                IntentStatus::Violated,
            ])
            .await
            .unwrap_or(-1);
        self.health.snapshot(devices, active)
    }
}

/// Contexte interne du submission worker et de ses drivers
struct Worker {
    cfg: KernelConfig,
    store: Store,
    catalog: CatalogHandle,
    ids: Arc<IdGen>,
    metrics: Arc<KernelMetrics>,
    health: HealthTracker,
    dataplane_tx: mpsc::Sender<PlaneJob>,
    device_tx: mpsc::Sender<DeviceEvent>,
    self_tx: mpsc::Sender<CoreMsg>,
}

/// Démarre le submission worker et rend la poignée Core
#[allow(clippy::too_many_arguments)]
pub fn spawn_core(
    cfg: KernelConfig,
    store: Store,
    catalog: CatalogHandle,
    metrics: Arc<KernelMetrics>,
    health: HealthTracker,
    dataplane_tx: mpsc::Sender<PlaneJob>,
    device_tx: mpsc::Sender<DeviceEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Core {
    let (tx, mut rx) = mpsc::channel::<CoreMsg>(64);

    let worker = Worker {
        cfg,
        store: store.clone(),
        catalog: catalog.clone(),
        ids: Arc::new(IdGen::new()),
        metrics: metrics.clone(),
        health: health.clone(),
        dataplane_tx,
        device_tx,
        self_tx: tx.clone(),
    };

    tokio::spawn(async move {
        info!("submission worker started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("submission worker stopping");
                        break;
                    }
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    worker.handle(msg).await;
                }
            }
        }
    });

    Core { tx, store, catalog, metrics, health }
}

impl Worker {
    async fn handle(&self, msg: CoreMsg) {
        match msg {
            CoreMsg::Submit { raw_text, submitter, parent_id, reply } => {
                let result = self.handle_submit(&raw_text, &submitter, parent_id).await;
                if result.is_err() {
                    KernelMetrics::incr(&self.metrics.intents_rejected_total);
                }
                // Store inaccessible -> mode dégradé : les soumissions
                // suivantes sont refusées, l'enforcement existant continue
                if matches!(result, Err(SubmitError::Store(_))) {
                    error!("state store unavailable, entering degraded mode");
                    self.health.set_degraded(true);
                }
                let _ = reply.send(result);
            }
            CoreMsg::Revoke { intent_id, reply } => {
                let _ = reply.send(self.handle_revoke(&intent_id).await);
            }
            CoreMsg::SetIntentStatus { intent_id, status, note } => {
                if let Err(e) = self
                    .store
                    .set_intent_status(&intent_id, status, note.as_deref())
                    .await
                {
                    error!(intent = %intent_id, error = %e, "status write failed");
                }
            }
            CoreMsg::ApplyFinished { intent_id, any_failed, any_pending } => {
                let status = if any_failed { IntentStatus::Violated } else { IntentStatus::Applied };
                if let Err(e) = self
                    .store
                    .set_intent_status(&intent_id, status, Some("enforcement finished"))
                    .await
                {
                    error!(intent = %intent_id, error = %e, "status write failed");
                }
                if any_pending {
                    let _ = self.store.set_intent_warning(&intent_id, true).await;
                }
            }
            CoreMsg::Notice(notice) => self.handle_notice(notice).await,
        }
    }

    async fn handle_submit(
        &self,
        raw_text: &str,
        submitter: &str,
        parent_id: Option<String>,
    ) -> Result<SubmitReceipt, SubmitError> {
        if self.health.is_degraded() {
            return Err(SubmitError::Degraded);
        }

        let snapshot = self.catalog.snapshot();
        let parsed = parse(&snapshot, raw_text)?;

        let intent_id = self.ids.next("intent");
        let compiler = Compiler::new(&snapshot, &self.cfg.interface, &self.ids);
        let (mut policies, mut goal) = compiler.compile(&intent_id, &parsed)?;

        // Les correctifs ne portent pas leur propre goal : la boucle de
        // feedback continue d'évaluer l'intent parent.
        if parent_id.is_some() {
            goal = None;
        }

        // Arbitrage des délais concurrents : le nouveau netem porte le
        // minimum des délais encore vivants sur la même classe.
        let mut superseded_intents: Vec<String> = Vec::new();
        let mut superseded_policies: Vec<Policy> = Vec::new();
        for policy in &mut policies {
            let olds = self
                .store
                .conflicting_policies(&policy.conflict_key, &intent_id)
                .await?;
            if policy.kind == crate::models::PolicyKind::NetemDelay {
                let requested = policy
                    .parameters
                    .get("requested_ms")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                let competing = olds
                    .iter()
                    .filter_map(|p| p.parameters.get("delay_ms").and_then(|v| v.as_u64()))
                    .min();
                if let Some(min_old) = competing {
                    let effective = requested.min(min_old);
                    policy
                        .parameters
                        .insert("delay_ms".into(), serde_json::json!(effective));
                }
            }
            for old in olds {
                if parent_id.as_deref() == Some(old.intent_id.as_str()) {
                    // Correctif : seule la policy du parent est écartée
                    superseded_policies.push(old);
                } else if !superseded_intents.contains(&old.intent_id) {
                    superseded_intents.push(old.intent_id.clone());
                }
            }
        }

        self.store.ensure_user(submitter).await?;
        let now = OffsetDateTime::now_utc();
        let intent = Intent {
            id: intent_id.clone(),
            raw_text: raw_text.to_string(),
            parsed,
            goal,
            status: IntentStatus::Compiled,
            submitter: submitter.to_string(),
            parent_id,
            warning: false,
            superseded_by: None,
            submitted_at: now,
            updated_at: now,
        };
        self.store.create_intent_with_policies(&intent, &policies).await?;
        KernelMetrics::incr(&self.metrics.intents_submitted_total);

        // Supersession totale ordonnée par ce worker
        for old_intent in &superseded_intents {
            self.store.supersede_intent(old_intent, &intent_id).await?;
        }
        for old_policy in &superseded_policies {
            self.store
                .set_policy_status(&old_policy.id, PolicyStatus::Superseded, None)
                .await?;
        }

        self.spawn_apply_driver(intent_id.clone(), policies.clone());

        Ok(SubmitReceipt { intent_id, status: IntentStatus::Compiled, policies })
    }

    /// Driver d'application d'un intent : policies dans l'ordre déclaré,
    /// la suivante ne part que quand la précédente a répondu.
    fn spawn_apply_driver(&self, intent_id: String, policies: Vec<Policy>) {
        let store = self.store.clone();
        let dataplane_tx = self.dataplane_tx.clone();
        let device_tx = self.device_tx.clone();
        let metrics = self.metrics.clone();
        let self_tx = self.self_tx.clone();

        tokio::spawn(async move {
            let mut any_failed = false;
            let mut any_pending = false;

            for policy in policies {
                // Une supersession a pu écarter la policy entre temps
                let fresh = store
                    .intent_policies(&intent_id)
                    .await
                    .ok()
                    .and_then(|ps| ps.into_iter().find(|p| p.id == policy.id));
                let Some(fresh) = fresh else { continue };
                if fresh.status == PolicyStatus::Superseded {
                    continue;
                }

                match dispatch_job(&dataplane_tx, &device_tx, JobAction::Apply, fresh).await {
                    ApplyOutcome::Applied => {
                        KernelMetrics::incr(&metrics.policies_applied_total);
                    }
                    ApplyOutcome::PendingDelivery => any_pending = true,
                    ApplyOutcome::Failed(reason) => {
                        warn!(intent = %intent_id, policy = %policy.id, %reason, "policy apply failed");
                        KernelMetrics::incr(&metrics.apply_failures_total);
                        any_failed = true;
                    }
                    ApplyOutcome::RolledBack | ApplyOutcome::Absent => {}
                }
            }

            let _ = self_tx
                .send(CoreMsg::ApplyFinished { intent_id, any_failed, any_pending })
                .await;
        });
    }

    async fn handle_revoke(&self, intent_id: &str) -> Result<(), SubmitError> {
        let Some((intent, policies)) = self.store.get_intent(intent_id).await? else {
            return Err(SubmitError::NotFound(intent_id.to_string()));
        };
        if intent.status.is_terminal() {
            return Err(SubmitError::Conflict(format!(
                "intent {} is already {}",
                intent_id,
                intent.status.as_str()
            )));
        }

        self.store
            .set_intent_status(intent_id, IntentStatus::Revoked, Some("revoked by submitter"))
            .await?;

        for policy in policies {
            if matches!(
                policy.status,
                PolicyStatus::Applied | PolicyStatus::Pending | PolicyStatus::PendingDelivery
            ) {
                let outcome =
                    dispatch_job(&self.dataplane_tx, &self.device_tx, JobAction::Rollback, policy)
                        .await;
                if let ApplyOutcome::Failed(reason) = outcome {
                    warn!(intent = intent_id, %reason, "rollback failed");
                }
            }
        }
        info!(intent = intent_id, "intent revoked");
        Ok(())
    }

    /// Issues asynchrones (flush pending_delivery, re-vérification)
    async fn handle_notice(&self, notice: EnforceNotice) {
        match notice.outcome {
            ApplyOutcome::Applied => {
                KernelMetrics::incr(&self.metrics.policies_applied_total);
                // Plus aucune policy en attente -> le warning tombe
                if let Ok(policies) = self.store.intent_policies(&notice.intent_id).await {
                    if !policies.iter().any(|p| p.status == PolicyStatus::PendingDelivery) {
                        let _ = self.store.set_intent_warning(&notice.intent_id, false).await;
                    }
                }
            }
            ApplyOutcome::Failed(reason) => {
                KernelMetrics::incr(&self.metrics.apply_failures_total);
                if let Err(e) = self
                    .store
                    .set_intent_status(&notice.intent_id, IntentStatus::Violated, Some(&reason))
                    .await
                {
                    error!(intent = %notice.intent_id, error = %e, "status write failed");
                }
            }
            _ => {}
        }
    }
}

/// Route un job vers le worker de son plan et attend l'issue
async fn dispatch_job(
    dataplane_tx: &mpsc::Sender<PlaneJob>,
    device_tx: &mpsc::Sender<DeviceEvent>,
    action: JobAction,
    policy: Policy,
) -> ApplyOutcome {
    let (reply, rx) = oneshot::channel();
    let plane = policy.plane();
    let job = PlaneJob { action, policy, reply };
    let sent = match plane {
        PolicyPlane::DataPlane => dataplane_tx.send(job).await.is_ok(),
        PolicyPlane::Device => device_tx.send(DeviceEvent::Job(job)).await.is_ok(),
    };
    if !sent {
        return ApplyOutcome::Failed("enforcer unavailable".into());
    }
    match tokio::time::timeout(Duration::from_secs(30), rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => ApplyOutcome::Failed("enforcer dropped the job".into()),
        Err(_) => ApplyOutcome::Failed("apply_timeout".into()),
    }
}

/// Forwarder des notices du device worker vers le submission worker
pub fn spawn_notice_forwarder(core: &Core) -> mpsc::Sender<EnforceNotice> {
    let (tx, mut rx) = mpsc::channel::<EnforceNotice>(64);
    let core_tx = core.tx.clone();
    tokio::spawn(async move {
        while let Some(notice) = rx.recv().await {
            if core_tx.send(CoreMsg::Notice(notice)).await.is_err() {
                break;
            }
        }
    });
    tx
}
