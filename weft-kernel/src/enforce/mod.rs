/**
 * ENFORCEMENT - Types partagés entre les deux plans d'application
 *
 * RÔLE :
 * Définit le contrat commun des enforcers : jobs envoyés par le driver
 * d'application (inbox mpsc + réponse oneshot), issues possibles d'un
 * apply/rollback, erreurs d'exécution.
 *
 * Les mutations du plan data passent toutes par le worker data plane ;
 * les policies device sont sérialisées par device et parallèles entre
 * devices. Chaque apply a une deadline dure (3s data plane, 10s device
 * plane, attente d'ack comprise).
 */

pub mod dataplane;
pub mod device;

use crate::models::Policy;
use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error)]
pub enum EnforceError {
    #[error("apply_timeout")]
    Timeout,
    #[error("apply_rejected: {0}")]
    Rejected(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Issue d'un apply ou d'un rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Device hors ligne, policy parquée en attente de l'événement online
    PendingDelivery,
    Failed(String),
    RolledBack,
    /// Rollback d'une directive déjà absente du plan
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Apply,
    Rollback,
}

/// Job déposé dans l'inbox d'un plan par le driver d'application
pub struct PlaneJob {
    pub action: JobAction,
    pub policy: Policy,
    pub reply: oneshot::Sender<ApplyOutcome>,
}

/// Notification asynchrone vers le submission worker quand une policy
/// change d'état hors du flux d'application initial (flush de
 /// pending_delivery, re-vérification après reconnexion).
#[derive(Debug, Clone)]
pub struct EnforceNotice {
    pub intent_id: String,
    pub policy_id: String,
    pub outcome: ApplyOutcome,
}
