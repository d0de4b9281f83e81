/**
 * FEEDBACK CONTROLLER - Boucle fermée de vérification des goals
 *
 * RÔLE :
 * Ticker unique de période T. À chaque tick, compare l'agrégat observé
 * (mean/p95/max sur la fenêtre 2T) de chaque intent actif porteur d'un
 * goal à sa cible, avec une bande de tolérance symétrique (±10% par
 * défaut).
 *
 * FONCTIONNEMENT :
 * - Dans la bande : transition violated -> satisfied
 * - Hors bande : transition -> violated + émission d'un intent correctif
 *   du même type, paramètre ajusté d'un pas borné, soumis par le chemin
 *   normal avec submitter="feedback" et back-pointer vers le parent
 *   (au plus un correctif par intent et par tick)
 * - Amortissement : trois oscillations satisfied->violated->satisfied en
 *   moins de 3 ticks chacune suspendent les correctifs de l'intent pour
 *   10 ticks (hysteresis_block comptabilisé)
 * - Série indisponible : statut inchangé, compteur metric_unavailable
 *
 * Cible de convergence : goal bien spécifié ramené dans la bande en
 * moins de cinq ticks sous charge stable.
 */

use crate::config::FeedbackConf;
use crate::core::{Core, FEEDBACK_SUBMITTER};
use crate::metrics::KernelMetrics;
use crate::models::{GoalBound, GoalMetric, Intent, IntentStatus, PolicyKind};
use std::collections::HashMap;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// État de suivi d'un intent entre les ticks
#[derive(Default)]
struct IntentTrack {
    /// Dernier délai émis en correction (ms), sinon celui des policies
    last_delay_ms: Option<u64>,
    /// Dernier débit émis en correction (octets/s)
    last_rate_bytes: Option<u64>,
    /// Tick du dernier passage violated -> satisfied
    last_recovered_at: Option<u64>,
    /// Tick du dernier passage satisfied -> violated
    last_violated_at: Option<u64>,
    /// Cycles d'oscillation consécutifs
    oscillations: u32,
    /// Correctifs suspendus jusqu'à ce tick exclus
    paused_until: u64,
}

pub struct FeedbackController {
    core: Core,
    cfg: FeedbackConf,
    tracks: HashMap<String, IntentTrack>,
    tick_count: u64,
}

impl FeedbackController {
    pub fn new(core: Core, cfg: FeedbackConf) -> Self {
        Self { core, cfg, tracks: HashMap::new(), tick_count: 0 }
    }

    /// Un tour de boucle. Public pour piloter la boucle dans les tests
    /// sans attendre la période réelle.
    pub async fn tick(&mut self) {
        self.tick_count += 1;
        let intents = match self.core.active_goal_intents().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "feedback cannot list active intents");
                return;
            }
        };

        let active_ids: Vec<String> = intents.iter().map(|i| i.id.clone()).collect();
        for intent in intents {
            // Les correctifs eux-mêmes ne portent pas de goal, mais on
            // n'évalue jamais deux fois la même chaîne dans un tick.
            if intent.submitter == FEEDBACK_SUBMITTER {
                continue;
            }
            self.evaluate(&intent).await;
        }

        // Les pistes d'intents disparus (supersédés, révoqués) s'éteignent
        self.tracks.retain(|id, _| active_ids.contains(id));
    }

    async fn evaluate(&mut self, intent: &Intent) {
        let Some(goal) = &intent.goal else { return };
        let window = Duration::from_secs(self.cfg.period_secs * 2);
        let since = OffsetDateTime::now_utc() - time::Duration::seconds(window.as_secs() as i64);

        let observed = match self
            .core
            .metric_aggregate(goal.metric.metric_name(), goal.device_id.as_deref(), since, goal.aggregate)
            .await
        {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!(intent = %intent.id, "metric_unavailable, status unchanged");
                KernelMetrics::incr(&self.core.metrics().metric_unavailable_total);
                return;
            }
            Err(e) => {
                warn!(intent = %intent.id, error = %e, "metric query failed");
                KernelMetrics::incr(&self.core.metrics().metric_unavailable_total);
                return;
            }
        };

        let within_band = match goal.bound {
            GoalBound::UpperBound => observed <= goal.value * (1.0 + self.cfg.tolerance),
            GoalBound::LowerBound => observed >= goal.value * (1.0 - self.cfg.tolerance),
        };
        debug!(
            intent = %intent.id,
            observed,
            target = goal.value,
            within_band,
            "goal evaluated"
        );

        let tick = self.tick_count;
        let metrics = self.core.metrics().clone();

        if within_band {
            if intent.status != IntentStatus::Satisfied {
                self.core
                    .set_intent_status(
                        &intent.id,
                        IntentStatus::Satisfied,
                        Some(format!("observed {observed:.1} within band of {:.1}", goal.value)),
                    )
                    .await;
                let track = self.tracks.entry(intent.id.clone()).or_default();
                // Détection d'oscillation : cycle violated -> satisfied court
                if let Some(violated_at) = track.last_violated_at {
                    if tick.saturating_sub(violated_at) <= 3
                        && track
                            .last_recovered_at
                            .is_some_and(|r| violated_at.saturating_sub(r) <= 3)
                    {
                        track.oscillations += 1;
                        if track.oscillations >= 3 {
                            track.paused_until = tick + 10;
                            track.oscillations = 0;
                            info!(intent = %intent.id, "hysteresis_block: corrections paused for 10 ticks");
                            KernelMetrics::incr(&metrics.hysteresis_blocks_total);
                        }
                    } else {
                        track.oscillations = 0;
                    }
                }
                track.last_recovered_at = Some(tick);
            }
            return;
        }

        // Hors bande
        if intent.status != IntentStatus::Violated {
            self.core
                .set_intent_status(
                    &intent.id,
                    IntentStatus::Violated,
                    Some(format!("observed {observed:.1} outside band of {:.1}", goal.value)),
                )
                .await;
            self.tracks.entry(intent.id.clone()).or_default().last_violated_at = Some(tick);
        }

        let paused_until = self.tracks.entry(intent.id.clone()).or_default().paused_until;
        if tick < paused_until {
            debug!(intent = %intent.id, "corrections paused (hysteresis)");
            return;
        }

        if let Some(text) = self.corrective_text(intent, goal.metric, goal.bound).await {
            info!(intent = %intent.id, corrective = %text, "emitting corrective intent");
            match self
                .core
                .submit_with_parent(&text, FEEDBACK_SUBMITTER, Some(intent.id.clone()))
                .await
            {
                Ok(receipt) => {
                    debug!(corrective = %receipt.intent_id, "corrective submitted");
                    KernelMetrics::incr(&self.core.metrics().corrections_emitted_total);
                }
                Err(e) => warn!(intent = %intent.id, error = %e, "corrective submission failed"),
            }
        }
    }

    /// Texte du correctif : même type, paramètre resserré d'un pas borné
    async fn corrective_text(
        &mut self,
        intent: &Intent,
        metric: GoalMetric,
        bound: GoalBound,
    ) -> Option<String> {
        let goal = intent.goal.as_ref()?;
        let device = goal.device_id.clone()?;
        let step = self.cfg.correction_step;

        // Valeurs courantes lues avant de toucher la piste (borrow court)
        let policy_delay =
            current_policy_u64(&self.core, &intent.id, PolicyKind::NetemDelay, "delay_ms").await;
        let policy_rate =
            current_policy_u64(&self.core, &intent.id, PolicyKind::HtbClass, "rate_bytes").await;
        let track = self.tracks.entry(intent.id.clone()).or_default();

        match (metric, bound) {
            (GoalMetric::LatencyMs, GoalBound::UpperBound) => {
                let current = track
                    .last_delay_ms
                    .or(policy_delay)
                    .unwrap_or(goal.value as u64);
                let mut next = ((current as f64) * (1.0 - step)).floor() as u64;
                if next >= current {
                    next = current.saturating_sub(1);
                }
                let next = next.max(1);
                track.last_delay_ms = Some(next);
                Some(format!("reduce latency to {next}ms for {device}"))
            }
            (GoalMetric::BandwidthBps, GoalBound::UpperBound) => {
                let current = track
                    .last_rate_bytes
                    .or(policy_rate)
                    .unwrap_or((goal.value / 8.0) as u64);
                let next = (((current as f64) * (1.0 - step)).floor() as u64).max(1);
                track.last_rate_bytes = Some(next);
                Some(format!("limit bandwidth to {next}b/s for {device}"))
            }
            (GoalMetric::ThroughputMsgs, GoalBound::LowerBound) => {
                let current = track.last_rate_bytes.or(policy_rate).unwrap_or(65536);
                let next = ((current as f64) * 1.5).ceil() as u64;
                track.last_rate_bytes = Some(next);
                Some(format!("limit bandwidth to {next}b/s for {device}"))
            }
            _ => None,
        }
    }
}

/// Paramètre numérique courant d'une policy de l'intent (ou de sa chaîne)
async fn current_policy_u64(
    core: &Core,
    intent_id: &str,
    kind: PolicyKind,
    param: &str,
) -> Option<u64> {
    let view = core.get_intent(intent_id).await.ok().flatten()?;
    view.policies
        .iter()
        .find(|p| p.kind == kind)
        .and_then(|p| p.parameters.get(param))
        .and_then(|v| v.as_u64())
}

/// Démarre la boucle de feedback sur sa période configurée
pub fn spawn_feedback(
    core: Core,
    cfg: FeedbackConf,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let mut controller = FeedbackController::new(core, cfg.clone());
    tokio::spawn(async move {
        info!(period = cfg.period_secs, "feedback loop started");
        let mut interval = tokio::time::interval(Duration::from_secs(cfg.period_secs.max(1)));
        interval.tick().await; // le premier tick est immédiat, on le saute
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("feedback loop stopping");
                        break;
                    }
                }
                _ = interval.tick() => {
                    controller.tick().await;
                }
            }
        }
    })
}
