/**
 * DATA-PLANE ENFORCER - Réalisation des policies sur la pile réseau locale
 *
 * RÔLE :
 * Matérialise les policies data_plane : classes HTB hiérarchiques (racine
 * 1: avec feuille par défaut 1:30), délais netem attachés aux feuilles,
 * marques iptables + filtres fw qui aiguillent les flux vers les feuilles.
 *
 * FONCTIONNEMENT :
 * - Un seul worker mutateur : l'interface kernel tc/iptables n'est pas
 *   sûre en concurrence par interface
 * - Idempotence : état désiré en mémoire (clé de collision -> directive
 *   rendue), re-appliquer la même policy est un no-op ; les directives
 *   utilisent replace plutôt que add
 * - Stratégie choisie au démarrage : ShellRunner (tc/iptables réels) ou
 *   DryRunner (valide et enregistre sans exécuter), jamais mélangées
 * - Réconciliation au démarrage : diff arbre vivant vs policies applied
 *   du store, ré-application des manquantes, suppression des feuilles
 *   orphelines ; point fixe (une seconde passe ne change rien)
 * - 3 tentatives consécutives en échec -> policy failed ; deadline dure
 *   par tentative
 */

use super::{ApplyOutcome, EnforceError, JobAction, PlaneJob};
use crate::catalog::CatalogHandle;
use crate::models::{Policy, PolicyKind, PolicyStatus, PolicyTarget};
use crate::state::{shared, Shared};
use crate::store::Store;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Exécuteur de commandes du plan data. Implémenté par le shell réel et
/// par le mode dry-run.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(
        &self,
        program: &str,
        args: &[String],
    ) -> impl Future<Output = Result<String, EnforceError>> + Send;
}

/// Exécution réelle via tc(8) et iptables(8)
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, EnforceError> {
        debug!(program, ?args, "exec");
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(EnforceError::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// Mode dry-run : valide et journalise les directives sans les exécuter.
/// Le journal sert aux assertions de tests et au diagnostic.
#[derive(Clone)]
pub struct DryRunner {
    pub log: Shared<Vec<String>>,
}

impl DryRunner {
    pub fn new() -> Self {
        Self { log: shared(Vec::new()) }
    }

    pub fn recorded(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl Default for DryRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for DryRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, EnforceError> {
        let line = format!("{program} {}", args.join(" "));
        debug!(%line, "dry-run");
        self.log.lock().push(line);
        Ok(String::new())
    }
}

/// Enforcer du plan data, possédé par son worker
pub struct DataPlaneEnforcer<R: CommandRunner> {
    interface: String,
    runner: R,
    catalog: CatalogHandle,
    /// État désiré : clé de collision -> directive rendue
    applied: HashMap<String, String>,
    root_ready: bool,
    deadline: Duration,
    max_attempts: u32,
}

impl<R: CommandRunner> DataPlaneEnforcer<R> {
    pub fn new(
        interface: &str,
        runner: R,
        catalog: CatalogHandle,
        deadline: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            interface: interface.to_string(),
            runner,
            catalog,
            applied: HashMap::new(),
            root_ready: false,
            deadline,
            max_attempts,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Applique une policy avec retries bornés. Re-appliquer une policy
    /// déjà en place est un no-op.
    pub async fn apply(&mut self, policy: &Policy) -> ApplyOutcome {
        let rendered = match self.render(policy) {
            Ok(r) => r,
            Err(e) => return ApplyOutcome::Failed(e.to_string()),
        };

        if self.applied.get(&policy.conflict_key) == Some(&rendered) {
            debug!(policy = %policy.id, "already applied, no-op");
            return ApplyOutcome::Applied;
        }

        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match tokio::time::timeout(self.deadline, self.execute(policy)).await {
                Ok(Ok(())) => {
                    self.applied.insert(policy.conflict_key.clone(), rendered);
                    return ApplyOutcome::Applied;
                }
                Ok(Err(e)) => {
                    warn!(policy = %policy.id, attempt, error = %e, "apply attempt failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!(policy = %policy.id, attempt, "apply deadline expired");
                    last_error = "apply_timeout".to_string();
                }
            }
        }
        ApplyOutcome::Failed(last_error)
    }

    /// Retire la directive du plan. Une directive déjà absente n'est pas
    /// une erreur.
    pub async fn rollback(&mut self, policy: &Policy) -> ApplyOutcome {
        let was_tracked = self.applied.remove(&policy.conflict_key).is_some();
        match tokio::time::timeout(self.deadline, self.remove(policy)).await {
            Ok(Ok(())) => {
                if was_tracked {
                    ApplyOutcome::RolledBack
                } else {
                    ApplyOutcome::Absent
                }
            }
            Ok(Err(EnforceError::Rejected(msg)))
                if msg.contains("No such") || msg.contains("Invalid handle") =>
            {
                ApplyOutcome::Absent
            }
            Ok(Err(e)) => ApplyOutcome::Failed(e.to_string()),
            Err(_) => ApplyOutcome::Failed("apply_timeout".to_string()),
        }
    }

    /// Arbre de directives courant, tel que l'enforcer le voit
    pub async fn show(&self) -> Result<String, EnforceError> {
        self.runner
            .run(
                "tc",
                &split_args(&format!("class show dev {}", self.interface)),
            )
            .await
    }

    /// Réconciliation au démarrage : converge l'interface vers l'ensemble
    /// des policies `applied` du store. Point fixe : une deuxième passe ne
    /// produit aucun changement.
    pub async fn reconcile(&mut self, stored: &[Policy]) -> Result<(), EnforceError> {
        self.applied.clear();
        self.root_ready = false;
        self.ensure_root().await?;

        let mut owned_minors: HashSet<String> = HashSet::new();
        // Feuilles structurelles : défaut + niveaux de priorité
        owned_minors.extend(["10", "20", "30"].map(String::from));

        for policy in stored {
            if let PolicyTarget::DataPlane { classid, .. } = &policy.target {
                if let Some(minor) = classid.strip_prefix("1:") {
                    owned_minors.insert(minor.to_string());
                }
            }
            match self.apply(policy).await {
                ApplyOutcome::Applied => {}
                other => warn!(policy = %policy.id, ?other, "reconcile re-apply failed"),
            }
        }

        // Feuilles vivantes sans policy propriétaire -> supprimées
        for minor in self.live_minors().await? {
            if !owned_minors.contains(&minor) {
                info!(classid = %format!("1:{minor}"), "removing stray class");
                let args = split_args(&format!(
                    "class del dev {} classid 1:{minor}",
                    self.interface
                ));
                if let Err(e) = self.runner.run("tc", &args).await {
                    warn!(error = %e, "stray class removal failed");
                }
            }
        }
        Ok(())
    }

    /// Minors des classes feuilles vivantes sur l'interface.
    /// En dry-run la sortie est vide : l'état désiré en mémoire fait foi.
    async fn live_minors(&self) -> Result<Vec<String>, EnforceError> {
        let output = self.show().await?;
        let mut minors = Vec::new();
        for line in output.lines() {
            // Format tc : "class htb 1:101 parent 1: ..."
            let mut tokens = line.split_whitespace();
            if tokens.next() == Some("class") && tokens.next() == Some("htb") {
                if let Some(classid) = tokens.next() {
                    if let Some(minor) = classid.strip_prefix("1:") {
                        minors.push(minor.to_string());
                    }
                }
            }
        }
        Ok(minors)
    }

    /// Racine HTB + feuille par défaut, idempotent (replace)
    async fn ensure_root(&mut self) -> Result<(), EnforceError> {
        if self.root_ready {
            return Ok(());
        }
        let iface = &self.interface;
        self.runner
            .run(
                "tc",
                &split_args(&format!(
                    "qdisc replace dev {iface} root handle 1: htb default 30"
                )),
            )
            .await?;
        // Feuilles structurelles des niveaux de priorité
        for (minor, rate, ceil) in [
            ("10", 100_000_000u64, 200_000_000u64),
            ("20", 50_000_000, 100_000_000),
            ("30", 10_000_000, 50_000_000),
        ] {
            self.runner
                .run(
                    "tc",
                    &split_args(&format!(
                        "class replace dev {iface} parent 1: classid 1:{minor} htb rate {rate}bit ceil {ceil}bit burst 32k"
                    )),
                )
                .await?;
        }
        self.root_ready = true;
        Ok(())
    }

    /// Rend la directive d'une policy depuis son template du Catalog
    fn render(&self, policy: &Policy) -> Result<String, EnforceError> {
        let catalog = self.catalog.snapshot();
        let template = catalog
            .template(policy.kind)
            .ok_or_else(|| EnforceError::Template(format!("no template for {}", policy.kind.as_str())))?;

        let mut values: HashMap<&str, String> = HashMap::new();
        if let PolicyTarget::DataPlane { interface, classid } = &policy.target {
            values.insert("interface", interface.clone());
            values.insert("classid", classid.clone());
        }
        for (key, value) in &policy.parameters {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            values.insert(key.as_str(), rendered);
        }
        template
            .render(&values)
            .map_err(|e| EnforceError::Template(e.to_string()))
    }

    async fn execute(&mut self, policy: &Policy) -> Result<(), EnforceError> {
        self.ensure_root().await?;
        let rendered = self.render(policy)?;

        match policy.kind {
            PolicyKind::HtbClass | PolicyKind::NetemDelay => {
                self.runner.run("tc", &split_args(&rendered)).await?;
            }
            PolicyKind::PriorityMark => {
                // Marque iptables + filtre fw qui aiguille vers la feuille
                self.runner.run("iptables", &split_args(&rendered)).await?;
                if let (Some(mark), PolicyTarget::DataPlane { classid, .. }) =
                    (policy.parameters.get("mark"), &policy.target)
                {
                    let filter = format!(
                        "filter replace dev {} parent 1: protocol ip handle {} fw flowid {}",
                        self.interface, mark, classid
                    );
                    self.runner.run("tc", &split_args(&filter)).await?;
                }
            }
            PolicyKind::IptablesRule => {
                self.runner.run("iptables", &split_args(&rendered)).await?;
            }
            PolicyKind::DeviceControl | PolicyKind::MqttQos => {
                return Err(EnforceError::Rejected(
                    "device-plane policy routed to data plane".into(),
                ));
            }
        }
        Ok(())
    }

    async fn remove(&self, policy: &Policy) -> Result<(), EnforceError> {
        let iface = &self.interface;
        match (&policy.kind, &policy.target) {
            (PolicyKind::HtbClass, PolicyTarget::DataPlane { classid, .. }) => {
                self.runner
                    .run("tc", &split_args(&format!("class del dev {iface} classid {classid}")))
                    .await?;
            }
            (PolicyKind::NetemDelay, PolicyTarget::DataPlane { classid, .. }) => {
                let handle = policy
                    .parameters
                    .get("handle")
                    .and_then(|v| v.as_str())
                    .unwrap_or("0:");
                self.runner
                    .run(
                        "tc",
                        &split_args(&format!(
                            "qdisc del dev {iface} parent {classid} handle {handle}"
                        )),
                    )
                    .await?;
            }
            (PolicyKind::PriorityMark, _) => {
                let rendered = self.render(policy)?;
                // La règle d'ajout est en -A : la suppression la rejoue en -D
                let delete = rendered.replacen("-A ", "-D ", 1);
                self.runner.run("iptables", &split_args(&delete)).await?;
            }
            (PolicyKind::IptablesRule, _) => {
                let rendered = self.render(policy)?;
                let delete = rendered.replacen("-A ", "-D ", 1);
                self.runner.run("iptables", &split_args(&delete)).await?;
            }
            _ => {
                return Err(EnforceError::Rejected(
                    "device-plane policy routed to data plane".into(),
                ))
            }
        }
        Ok(())
    }
}

fn split_args(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

/// Worker du plan data : seul mutateur de l'interface. Consomme les jobs
/// de son inbox, écrit les statuts de policies dans le store, répond au
/// driver d'application.
pub async fn run_dataplane_worker<R: CommandRunner>(
    mut enforcer: DataPlaneEnforcer<R>,
    store: Store,
    mut inbox: mpsc::Receiver<PlaneJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("data-plane worker started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("data-plane worker stopping");
                    break;
                }
            }
            job = inbox.recv() => {
                let Some(PlaneJob { action, policy, reply }) = job else { break };
                let outcome = match action {
                    JobAction::Apply => enforcer.apply(&policy).await,
                    JobAction::Rollback => enforcer.rollback(&policy).await,
                };
                let (status, error) = match &outcome {
                    ApplyOutcome::Applied => (PolicyStatus::Applied, None),
                    ApplyOutcome::Failed(e) => (PolicyStatus::Failed, Some(e.clone())),
                    ApplyOutcome::RolledBack | ApplyOutcome::Absent => {
                        (PolicyStatus::RolledBack, None)
                    }
                    ApplyOutcome::PendingDelivery => (PolicyStatus::PendingDelivery, None),
                };
                if let Err(e) = store
                    .set_policy_status(&policy.id, status, error.as_deref())
                    .await
                {
                    error!(policy = %policy.id, error = %e, "policy status write failed");
                }
                let _ = reply.send(outcome);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogHandle;
    use crate::models::{IdGen, ParamMap, PolicyStatus};
    use serde_json::json;

    const DEVICES: &str = r#"
devices:
  camera-01:
    kind: camera
    address: 10.0.0.31
    control_topic: iot/camera-01/control
    telemetry_topic: iot/camera-01/telemetry
"#;
    const GRAMMAR: &str = "rules: []\n";
    const TEMPLATES: &str = r#"
templates:
  htb_class: "class replace dev {interface} parent 1: classid {classid} htb rate {rate_bit}bit ceil {ceil_bit}bit burst {burst}"
  netem_delay: "qdisc replace dev {interface} parent {classid} handle {handle} netem delay {delay_ms}ms"
  priority_mark: "-t mangle -A POSTROUTING -d {address} -j MARK --set-mark {mark}"
"#;

    async fn catalog_handle() -> CatalogHandle {
        let dir = std::env::temp_dir().join(format!("weft-dp-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let paths = crate::config::CatalogPaths {
            devices: dir.join("devices.yaml").to_str().unwrap().to_string(),
            grammar: dir.join("grammar.yaml").to_str().unwrap().to_string(),
            templates: dir.join("templates.yaml").to_str().unwrap().to_string(),
        };
        std::fs::write(&paths.devices, DEVICES).unwrap();
        std::fs::write(&paths.grammar, GRAMMAR).unwrap();
        std::fs::write(&paths.templates, TEMPLATES).unwrap();
        CatalogHandle::load(paths).await.unwrap()
    }

    fn htb_policy(ids: &IdGen) -> Policy {
        let target = PolicyTarget::DataPlane { interface: "eth0".into(), classid: "1:101".into() };
        let mut params = ParamMap::new();
        params.insert("device".into(), json!("camera-01"));
        params.insert("rate_bit".into(), json!(409600));
        params.insert("ceil_bit".into(), json!(409600));
        params.insert("burst".into(), json!("15k"));
        let key = Policy::conflict_key_for(PolicyKind::HtbClass, &target, &params);
        Policy {
            id: ids.next("policy"),
            intent_id: "intent-1".into(),
            kind: PolicyKind::HtbClass,
            target,
            parameters: params,
            conflict_key: key,
            status: PolicyStatus::Pending,
            seq: 0,
            applied_at: None,
            last_error: None,
        }
    }

    fn enforcer(runner: DryRunner, catalog: CatalogHandle) -> DataPlaneEnforcer<DryRunner> {
        DataPlaneEnforcer::new("eth0", runner, catalog, Duration::from_secs(3), 3)
    }

    #[tokio::test]
    async fn test_apply_renders_tc_directive() {
        let catalog = catalog_handle().await;
        let runner = DryRunner::new();
        let mut enf = enforcer(runner.clone(), catalog);
        let ids = IdGen::new();

        let outcome = enf.apply(&htb_policy(&ids)).await;
        assert_eq!(outcome, ApplyOutcome::Applied);

        let recorded = runner.recorded();
        assert!(recorded
            .iter()
            .any(|l| l.contains("classid 1:101 htb rate 409600bit ceil 409600bit")));
        // La racine est posée avant la feuille
        assert!(recorded[0].contains("qdisc replace dev eth0 root handle 1: htb default 30"));
    }

    #[tokio::test]
    async fn test_apply_twice_is_noop() {
        let catalog = catalog_handle().await;
        let runner = DryRunner::new();
        let mut enf = enforcer(runner.clone(), catalog);
        let ids = IdGen::new();
        let policy = htb_policy(&ids);

        assert_eq!(enf.apply(&policy).await, ApplyOutcome::Applied);
        let count_after_first = runner.recorded().len();
        assert_eq!(enf.apply(&policy).await, ApplyOutcome::Applied);
        assert_eq!(runner.recorded().len(), count_after_first);
    }

    #[tokio::test]
    async fn test_apply_then_rollback_restores_plane() {
        let catalog = catalog_handle().await;
        let runner = DryRunner::new();
        let mut enf = enforcer(runner.clone(), catalog);
        let ids = IdGen::new();
        let policy = htb_policy(&ids);

        assert_eq!(enf.apply(&policy).await, ApplyOutcome::Applied);
        assert_eq!(enf.rollback(&policy).await, ApplyOutcome::RolledBack);
        assert!(runner
            .recorded()
            .iter()
            .any(|l| l.contains("class del dev eth0 classid 1:101")));
        // Rollback d'une directive absente
        assert_eq!(enf.rollback(&policy).await, ApplyOutcome::Absent);
    }

    #[tokio::test]
    async fn test_reconcile_is_fixed_point() {
        let catalog = catalog_handle().await;
        let runner = DryRunner::new();
        let mut enf = enforcer(runner.clone(), catalog);
        let ids = IdGen::new();
        let mut policy = htb_policy(&ids);
        policy.status = PolicyStatus::Applied;

        enf.reconcile(std::slice::from_ref(&policy)).await.unwrap();
        let first_pass = runner.recorded();
        enf.reconcile(std::slice::from_ref(&policy)).await.unwrap();
        let second_pass = runner.recorded();

        // La seconde passe rejoue exactement les mêmes directives replace :
        // aucun del, aucun changement structurel
        assert_eq!(second_pass.len(), first_pass.len() * 2);
        assert!(!second_pass.iter().any(|l| l.contains(" del ")));
    }

    #[tokio::test]
    async fn test_priority_mark_installs_filter() {
        let catalog = catalog_handle().await;
        let runner = DryRunner::new();
        let mut enf = enforcer(runner.clone(), catalog);
        let ids = IdGen::new();

        let target = PolicyTarget::DataPlane { interface: "eth0".into(), classid: "1:10".into() };
        let mut params = ParamMap::new();
        params.insert("device".into(), json!("camera-01"));
        params.insert("address".into(), json!("10.0.0.31"));
        params.insert("mark".into(), json!(10));
        let key = Policy::conflict_key_for(PolicyKind::PriorityMark, &target, &params);
        let policy = Policy {
            id: ids.next("policy"),
            intent_id: "intent-1".into(),
            kind: PolicyKind::PriorityMark,
            target,
            parameters: params,
            conflict_key: key,
            status: PolicyStatus::Pending,
            seq: 0,
            applied_at: None,
            last_error: None,
        };

        assert_eq!(enf.apply(&policy).await, ApplyOutcome::Applied);
        let recorded = runner.recorded();
        assert!(recorded
            .iter()
            .any(|l| l.starts_with("iptables -t mangle -A POSTROUTING -d 10.0.0.31")));
        assert!(recorded
            .iter()
            .any(|l| l.contains("filter replace dev eth0 parent 1: protocol ip handle 10 fw flowid 1:10")));
    }
}
