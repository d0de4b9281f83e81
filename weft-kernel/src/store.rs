/**
 * STATE STORE - Persistance SQLite du kernel Weft
 *
 * RÔLE :
 * Source unique de vérité : intents, policies, historique de métriques,
 * journal d'audit, utilisateurs (attribution seulement, l'authentification
 * est un collaborateur externe).
 *
 * FONCTIONNEMENT :
 * - sqlx + SQLite, pool de connexions, migrations gated au démarrage
 *   (le kernel refuse de servir si le schéma n'est pas à jour)
 * - Intent + policies créés dans une transaction unique
 * - Supersession atomique : ancien intent + policies + lien successeur
 *   en un seul commit
 * - metrics_history idempotent au rejeu : clé unique (nom, device, ts)
 *   avec ON CONFLICT IGNORE, rétention bornée avec purge
 *
 * CONCURRENCE :
 * Les mutations de statut d'intent passent toutes par le submission worker
 * (écrivain unique) ; l'ingestion de métriques écrit sur sa propre table ;
 * les lectures sont concurrentes.
 */

use crate::models::{
    Goal, Intent, IntentStatus, MetricSample, ParsedIntent, Policy, PolicyKind, PolicyPlane,
    PolicyStatus, PolicyTarget,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store_unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Migrations ordonnées ; la version courante est le max appliqué
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        username   TEXT PRIMARY KEY,
        role       TEXT NOT NULL DEFAULT 'user',
        created_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS intents (
        id            TEXT PRIMARY KEY,
        raw_text      TEXT NOT NULL,
        parsed        TEXT NOT NULL,
        goal          TEXT,
        status        TEXT NOT NULL,
        submitter     TEXT NOT NULL,
        parent_id     TEXT,
        warning       INTEGER NOT NULL DEFAULT 0,
        superseded_by TEXT,
        submitted_at  INTEGER NOT NULL,
        updated_at    INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_intents_status ON intents(status);
    CREATE TABLE IF NOT EXISTS policies (
        id           TEXT PRIMARY KEY,
        intent_id    TEXT NOT NULL REFERENCES intents(id),
        plane        TEXT NOT NULL,
        kind         TEXT NOT NULL,
        target       TEXT NOT NULL,
        conflict_key TEXT NOT NULL,
        parameters   TEXT NOT NULL,
        status       TEXT NOT NULL,
        seq          INTEGER NOT NULL,
        applied_at   INTEGER,
        last_error   TEXT,
        created_at   INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_policies_intent ON policies(intent_id);
    CREATE INDEX IF NOT EXISTS idx_policies_conflict ON policies(conflict_key, status);
    CREATE TABLE IF NOT EXISTS metrics_history (
        metric_name TEXT NOT NULL,
        device_id   TEXT NOT NULL DEFAULT '',
        value       REAL NOT NULL,
        timestamp   INTEGER NOT NULL,
        UNIQUE(metric_name, device_id, timestamp) ON CONFLICT IGNORE
    );
    CREATE INDEX IF NOT EXISTS idx_metrics_name_ts ON metrics_history(metric_name, timestamp);
    CREATE TABLE IF NOT EXISTS audit_log (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        entity     TEXT NOT NULL,
        entity_id  TEXT NOT NULL,
        old_status TEXT,
        new_status TEXT NOT NULL,
        note       TEXT,
        at         INTEGER NOT NULL
    );
    "#,
)];

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Ouvre (ou crée) la base et applique les migrations manquantes
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        if let Some(dir) = std::path::Path::new(path).parent() {
            if !dir.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(dir);
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(StoreError::Unavailable)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        let current = self.schema_version().await?;
        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            let mut tx = self.pool.begin().await?;
            for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                .bind(*version)
                .bind(now_ts())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(version, "schema migration applied");
        }
        Ok(())
    }

    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS v FROM schema_migrations")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("v")?)
    }

    // -----------------------------------------------------------------------
    // Users (attribution uniquement)
    // -----------------------------------------------------------------------

    pub async fn ensure_user(&self, username: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO users (username, role, created_at) VALUES (?, 'user', ?)")
            .bind(username)
            .bind(now_ts())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Intents + policies
    // -----------------------------------------------------------------------

    /// Crée l'intent et toutes ses policies dans une transaction unique
    pub async fn create_intent_with_policies(
        &self,
        intent: &Intent,
        policies: &[Policy],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO intents
             (id, raw_text, parsed, goal, status, submitter, parent_id, warning,
              superseded_by, submitted_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&intent.id)
        .bind(&intent.raw_text)
        .bind(to_json(&intent.parsed)?)
        .bind(intent.goal.as_ref().map(to_json_ref).transpose()?)
        .bind(intent.status.as_str())
        .bind(&intent.submitter)
        .bind(&intent.parent_id)
        .bind(intent.warning as i64)
        .bind(&intent.superseded_by)
        .bind(intent.submitted_at.unix_timestamp())
        .bind(intent.updated_at.unix_timestamp())
        .execute(&mut *tx)
        .await?;

        for policy in policies {
            sqlx::query(
                "INSERT INTO policies
                 (id, intent_id, plane, kind, target, conflict_key, parameters,
                  status, seq, applied_at, last_error, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&policy.id)
            .bind(&policy.intent_id)
            .bind(policy.plane().as_str())
            .bind(policy.kind.as_str())
            .bind(policy.target.to_string())
            .bind(&policy.conflict_key)
            .bind(to_json(&policy.parameters)?)
            .bind(policy.status.as_str())
            .bind(policy.seq as i64)
            .bind(policy.applied_at.map(|t| t.unix_timestamp()))
            .bind(&policy.last_error)
            .bind(now_ts())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO audit_log (entity, entity_id, old_status, new_status, note, at)
             VALUES ('intent', ?, NULL, ?, 'created', ?)",
        )
        .bind(&intent.id)
        .bind(intent.status.as_str())
        .bind(now_ts())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(intent = %intent.id, policies = policies.len(), "intent persisted");
        Ok(())
    }

    pub async fn get_intent(&self, id: &str) -> Result<Option<(Intent, Vec<Policy>)>, StoreError> {
        let Some(row) = sqlx::query("SELECT * FROM intents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let intent = intent_from_row(&row)?;
        let policies = self.intent_policies(id).await?;
        Ok(Some((intent, policies)))
    }

    pub async fn intent_policies(&self, intent_id: &str) -> Result<Vec<Policy>, StoreError> {
        let rows = sqlx::query("SELECT * FROM policies WHERE intent_id = ? ORDER BY seq")
            .bind(intent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(policy_from_row).collect()
    }

    pub async fn list_intents(
        &self,
        status: Option<IntentStatus>,
        limit: i64,
    ) -> Result<Vec<Intent>, StoreError> {
        let rows = match status {
            Some(s) => {
                sqlx::query(
                    "SELECT * FROM intents WHERE status = ? ORDER BY submitted_at DESC LIMIT ?",
                )
                .bind(s.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM intents ORDER BY submitted_at DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(intent_from_row).collect()
    }

    pub async fn list_policies(
        &self,
        plane: Option<PolicyPlane>,
        limit: i64,
    ) -> Result<Vec<Policy>, StoreError> {
        let rows = match plane {
            Some(p) => {
                sqlx::query(
                    "SELECT * FROM policies WHERE plane = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(p.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM policies ORDER BY created_at DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(policy_from_row).collect()
    }

    /// Intents actifs porteurs d'un goal, pour la boucle de feedback
    pub async fn active_goal_intents(&self) -> Result<Vec<Intent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM intents
             WHERE status IN ('applied', 'satisfied', 'violated') AND goal IS NOT NULL
             ORDER BY submitted_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(intent_from_row).collect()
    }

    /// Mutation de statut d'intent, journalisée. Réservé au submission worker.
    pub async fn set_intent_status(
        &self,
        id: &str,
        status: IntentStatus,
        note: Option<&str>,
    ) -> Result<(), StoreError> {
        let old: Option<String> = sqlx::query("SELECT status FROM intents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| r.try_get("status"))
            .transpose()?;
        let Some(old) = old else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        // Les statuts terminaux sont définitifs : un ApplyFinished ou une
        // notice en retard ne ressuscite pas un intent supersédé/révoqué.
        if old
            .parse::<IntentStatus>()
            .map(|s| s.is_terminal())
            .unwrap_or(false)
        {
            debug!(intent = id, %old, next = status.as_str(), "terminal status kept");
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE intents SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ts())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO audit_log (entity, entity_id, old_status, new_status, note, at)
             VALUES ('intent', ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&old)
        .bind(status.as_str())
        .bind(note)
        .bind(now_ts())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_intent_warning(&self, id: &str, warning: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE intents SET warning = ?, updated_at = ? WHERE id = ?")
            .bind(warning as i64)
            .bind(now_ts())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Supersession atomique : ancien intent terminal + policies écartées +
    /// lien vers le successeur, en un seul commit.
    pub async fn supersede_intent(
        &self,
        old_intent_id: &str,
        successor_id: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE intents SET status = 'superseded', superseded_by = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(successor_id)
        .bind(now_ts())
        .bind(old_intent_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE policies SET status = 'superseded'
             WHERE intent_id = ? AND status IN ('pending', 'pending_delivery', 'applied')",
        )
        .bind(old_intent_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO audit_log (entity, entity_id, old_status, new_status, note, at)
             VALUES ('intent', ?, NULL, 'superseded', ?, ?)",
        )
        .bind(old_intent_id)
        .bind(format!("superseded by {successor_id}"))
        .bind(now_ts())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(old = old_intent_id, new = successor_id, "intent superseded");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Policies
    // -----------------------------------------------------------------------

    /// Mutation de statut de policy, réservée à l'Enforcer de son plan
    pub async fn set_policy_status(
        &self,
        id: &str,
        status: PolicyStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let applied_at = if status == PolicyStatus::Applied { Some(now_ts()) } else { None };
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE policies SET status = ?, last_error = ?,
             applied_at = COALESCE(?, applied_at) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(last_error)
        .bind(applied_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO audit_log (entity, entity_id, old_status, new_status, note, at)
             VALUES ('policy', ?, NULL, ?, ?, ?)",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(last_error)
        .bind(now_ts())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Policies appliquées d'un plan, pour la réconciliation au démarrage
    pub async fn applied_policies(&self, plane: PolicyPlane) -> Result<Vec<Policy>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM policies WHERE plane = ? AND status = 'applied' ORDER BY created_at",
        )
        .bind(plane.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(policy_from_row).collect()
    }

    /// Policies vivantes en collision avec une clé, hors intent donné.
    /// Sert au submission worker pour décider des supersessions.
    pub async fn conflicting_policies(
        &self,
        conflict_key: &str,
        exclude_intent: &str,
    ) -> Result<Vec<Policy>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM policies
             WHERE conflict_key = ? AND intent_id != ?
               AND status IN ('pending', 'pending_delivery', 'applied')",
        )
        .bind(conflict_key)
        .bind(exclude_intent)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(policy_from_row).collect()
    }

    pub async fn count_intents_with_status(
        &self,
        statuses: &[IntentStatus],
    ) -> Result<i64, StoreError> {
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!("SELECT COUNT(*) AS c FROM intents WHERE status IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for s in statuses {
            query = query.bind(s.as_str());
        }
        let row = query.fetch_one(&self.pool).await?;
        Ok(row.try_get::<i64, _>("c")?)
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    /// Append idempotent : un rejeu du même sample est ignoré (clé unique)
    pub async fn append_metric(&self, sample: &MetricSample) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO metrics_history (metric_name, device_id, value, timestamp)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&sample.metric_name)
        .bind(sample.device_id.as_deref().unwrap_or(""))
        .bind(sample.value)
        .bind(sample.timestamp.unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Purge les samples plus vieux que la rétention
    pub async fn prune_metrics(&self, older_than: OffsetDateTime) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM metrics_history WHERE timestamp < ?")
            .bind(older_than.unix_timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Agrégat d'une série sur une fenêtre : mean, p95 ou max.
    /// None si aucune observation dans la fenêtre (metric_unavailable).
    pub async fn metric_aggregate(
        &self,
        metric_name: &str,
        device_id: Option<&str>,
        since: OffsetDateTime,
        aggregate: crate::models::GoalAggregate,
    ) -> Result<Option<f64>, StoreError> {
        use crate::models::GoalAggregate;
        let device = device_id.unwrap_or("");

        match aggregate {
            GoalAggregate::Mean | GoalAggregate::Max => {
                let func = if aggregate == GoalAggregate::Mean { "AVG" } else { "MAX" };
                let sql = format!(
                    "SELECT {func}(value) AS v FROM metrics_history
                     WHERE metric_name = ? AND device_id = ? AND timestamp >= ?"
                );
                let row = sqlx::query(&sql)
                    .bind(metric_name)
                    .bind(device)
                    .bind(since.unix_timestamp())
                    .fetch_one(&self.pool)
                    .await?;
                Ok(row.try_get::<Option<f64>, _>("v")?)
            }
            GoalAggregate::P95 => {
                let rows = sqlx::query(
                    "SELECT value FROM metrics_history
                     WHERE metric_name = ? AND device_id = ? AND timestamp >= ?
                     ORDER BY value",
                )
                .bind(metric_name)
                .bind(device)
                .bind(since.unix_timestamp())
                .fetch_all(&self.pool)
                .await?;
                if rows.is_empty() {
                    return Ok(None);
                }
                let values: Vec<f64> = rows
                    .iter()
                    .map(|r| r.try_get::<f64, _>("value"))
                    .collect::<Result<_, _>>()?;
                let index = ((values.len() as f64) * 0.95).ceil() as usize;
                Ok(Some(values[index.min(values.len()) - 1]))
            }
        }
    }

    /// Derniers samples d'un device, pour la vue get_intent
    pub async fn recent_samples(
        &self,
        device_id: &str,
        limit: i64,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let rows = sqlx::query(
            "SELECT metric_name, device_id, value, timestamp FROM metrics_history
             WHERE device_id = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let device: String = row.try_get("device_id")?;
                Ok(MetricSample {
                    metric_name: row.try_get("metric_name")?,
                    device_id: if device.is_empty() { None } else { Some(device) },
                    value: row.try_get("value")?,
                    timestamp: ts_from_unix(row.try_get("timestamp")?),
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Mapping lignes -> modèles
// ---------------------------------------------------------------------------

fn intent_from_row(row: &SqliteRow) -> Result<Intent, StoreError> {
    let parsed_json: String = row.try_get("parsed").map_err(StoreError::Unavailable)?;
    let parsed: Vec<ParsedIntent> = serde_json::from_str(&parsed_json)
        .map_err(|e| StoreError::Corrupt(format!("parsed: {e}")))?;
    let goal: Option<Goal> = row
        .try_get::<Option<String>, _>("goal")
        .map_err(StoreError::Unavailable)?
        .map(|g| serde_json::from_str(&g))
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("goal: {e}")))?;
    let status: String = row.try_get("status").map_err(StoreError::Unavailable)?;

    Ok(Intent {
        id: row.try_get("id").map_err(StoreError::Unavailable)?,
        raw_text: row.try_get("raw_text").map_err(StoreError::Unavailable)?,
        parsed,
        goal,
        status: status.parse().map_err(StoreError::Corrupt)?,
        submitter: row.try_get("submitter").map_err(StoreError::Unavailable)?,
        parent_id: row.try_get("parent_id").map_err(StoreError::Unavailable)?,
        warning: row.try_get::<i64, _>("warning").map_err(StoreError::Unavailable)? != 0,
        superseded_by: row.try_get("superseded_by").map_err(StoreError::Unavailable)?,
        submitted_at: ts_from_unix(row.try_get("submitted_at").map_err(StoreError::Unavailable)?),
        updated_at: ts_from_unix(row.try_get("updated_at").map_err(StoreError::Unavailable)?),
    })
}

fn policy_from_row(row: &SqliteRow) -> Result<Policy, StoreError> {
    let plane: String = row.try_get("plane").map_err(StoreError::Unavailable)?;
    let plane: PolicyPlane = plane.parse().map_err(StoreError::Corrupt)?;
    let kind: String = row.try_get("kind").map_err(StoreError::Unavailable)?;
    let target_raw: String = row.try_get("target").map_err(StoreError::Unavailable)?;
    let target = match plane {
        PolicyPlane::DataPlane => {
            let (interface, classid) = target_raw
                .split_once('/')
                .ok_or_else(|| StoreError::Corrupt(format!("target: {target_raw}")))?;
            PolicyTarget::DataPlane {
                interface: interface.to_string(),
                classid: classid.to_string(),
            }
        }
        PolicyPlane::Device => PolicyTarget::Device { device_id: target_raw },
    };
    let parameters: String = row.try_get("parameters").map_err(StoreError::Unavailable)?;
    let status: String = row.try_get("status").map_err(StoreError::Unavailable)?;

    Ok(Policy {
        id: row.try_get("id").map_err(StoreError::Unavailable)?,
        intent_id: row.try_get("intent_id").map_err(StoreError::Unavailable)?,
        kind: kind.parse::<PolicyKind>().map_err(StoreError::Corrupt)?,
        target,
        parameters: serde_json::from_str(&parameters)
            .map_err(|e| StoreError::Corrupt(format!("parameters: {e}")))?,
        conflict_key: row.try_get("conflict_key").map_err(StoreError::Unavailable)?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        seq: row.try_get::<i64, _>("seq").map_err(StoreError::Unavailable)? as u32,
        applied_at: row
            .try_get::<Option<i64>, _>("applied_at")
            .map_err(StoreError::Unavailable)?
            .map(ts_from_unix),
        last_error: row.try_get("last_error").map_err(StoreError::Unavailable)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn to_json_ref<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    to_json(&value)
}

fn now_ts() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn ts_from_unix(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IdGen, ParamMap};
    use serde_json::json;

    async fn test_store() -> Store {
        let path = std::env::temp_dir()
            .join(format!("weft-store-test-{}.db", uuid::Uuid::new_v4()));
        Store::open(path.to_str().unwrap()).await.unwrap()
    }

    fn sample_intent(id: &str, status: IntentStatus, goal: Option<Goal>) -> Intent {
        Intent {
            id: id.to_string(),
            raw_text: "reduce latency to 20ms for temp-01".into(),
            parsed: Vec::new(),
            goal,
            status,
            submitter: "tests".into(),
            parent_id: None,
            warning: false,
            superseded_by: None,
            submitted_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    fn sample_policy(ids: &IdGen, intent_id: &str, key_suffix: &str) -> Policy {
        let target = PolicyTarget::Device { device_id: format!("dev-{key_suffix}") };
        let mut params = ParamMap::new();
        params.insert("command".into(), json!("SET_SAMPLING_INTERVAL"));
        params.insert("interval_ms".into(), json!(1000));
        let key = Policy::conflict_key_for(PolicyKind::DeviceControl, &target, &params);
        Policy {
            id: ids.next("policy"),
            intent_id: intent_id.to_string(),
            kind: PolicyKind::DeviceControl,
            target,
            parameters: params,
            conflict_key: key,
            status: PolicyStatus::Pending,
            seq: 0,
            applied_at: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let store = test_store().await;
        assert_eq!(store.schema_version().await.unwrap(), 1);
        store.migrate().await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_intent_roundtrip_with_policies() {
        let store = test_store().await;
        let ids = IdGen::new();
        let intent = sample_intent("intent-1", IntentStatus::Pending, None);
        let policy = sample_policy(&ids, "intent-1", "a");
        store.create_intent_with_policies(&intent, &[policy.clone()]).await.unwrap();

        let (loaded, policies) = store.get_intent("intent-1").await.unwrap().unwrap();
        assert_eq!(loaded.raw_text, intent.raw_text);
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].id, policy.id);
        assert_eq!(policies[0].parameters, policy.parameters);
    }

    #[tokio::test]
    async fn test_supersede_is_atomic() {
        let store = test_store().await;
        let ids = IdGen::new();
        let old = sample_intent("intent-old", IntentStatus::Applied, None);
        let mut policy = sample_policy(&ids, "intent-old", "a");
        policy.status = PolicyStatus::Applied;
        store.create_intent_with_policies(&old, &[policy]).await.unwrap();

        store.supersede_intent("intent-old", "intent-new").await.unwrap();

        let (loaded, policies) = store.get_intent("intent-old").await.unwrap().unwrap();
        assert_eq!(loaded.status, IntentStatus::Superseded);
        assert_eq!(loaded.superseded_by.as_deref(), Some("intent-new"));
        assert_eq!(policies[0].status, PolicyStatus::Superseded);
    }

    #[tokio::test]
    async fn test_metric_append_idempotent_under_replay() {
        let store = test_store().await;
        let sample = MetricSample {
            metric_name: "latency_ms".into(),
            device_id: Some("temp-01".into()),
            value: 40.0,
            timestamp: OffsetDateTime::now_utc(),
        };
        store.append_metric(&sample).await.unwrap();
        store.append_metric(&sample).await.unwrap();

        let mean = store
            .metric_aggregate(
                "latency_ms",
                Some("temp-01"),
                OffsetDateTime::now_utc() - time::Duration::minutes(5),
                crate::models::GoalAggregate::Mean,
            )
            .await
            .unwrap();
        assert_eq!(mean, Some(40.0));
        let samples = store.recent_samples("temp-01", 10).await.unwrap();
        assert_eq!(samples.len(), 1);
    }

    #[tokio::test]
    async fn test_metric_aggregate_none_when_empty() {
        let store = test_store().await;
        let value = store
            .metric_aggregate(
                "latency_ms",
                Some("ghost"),
                OffsetDateTime::now_utc() - time::Duration::minutes(5),
                crate::models::GoalAggregate::Mean,
            )
            .await
            .unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_prune_metrics() {
        let store = test_store().await;
        let old_sample = MetricSample {
            metric_name: "latency_ms".into(),
            device_id: None,
            value: 1.0,
            timestamp: OffsetDateTime::now_utc() - time::Duration::hours(48),
        };
        store.append_metric(&old_sample).await.unwrap();
        let pruned = store
            .prune_metrics(OffsetDateTime::now_utc() - time::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn test_conflicting_policies_lookup() {
        let store = test_store().await;
        let ids = IdGen::new();
        let old = sample_intent("intent-old", IntentStatus::Applied, None);
        let mut policy = sample_policy(&ids, "intent-old", "a");
        policy.status = PolicyStatus::Applied;
        let key = policy.conflict_key.clone();
        store.create_intent_with_policies(&old, &[policy]).await.unwrap();

        let hits = store.conflicting_policies(&key, "intent-new").await.unwrap();
        assert_eq!(hits.len(), 1);
        let none = store.conflicting_policies(&key, "intent-old").await.unwrap();
        assert!(none.is_empty());
    }
}
