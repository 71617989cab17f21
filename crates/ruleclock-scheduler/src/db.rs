use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::store::{RuleChange, RuleStore, CHANGE_FEED_CAPACITY};
use crate::types::AlarmRule;

/// Initialise the rules schema in `conn`.
///
/// Creates the `rules` table (idempotent). Condition lists are stored as
/// JSON in the same tagged format the API uses.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS rules (
            id                    TEXT    NOT NULL PRIMARY KEY,
            name                  TEXT    NOT NULL,
            enabled               INTEGER NOT NULL DEFAULT 1,
            triggers              TEXT    NOT NULL,   -- JSON TriggerCondition[]
            filters               TEXT    NOT NULL,   -- JSON FilterCondition[]
            activated_at          TEXT,               -- RFC3339 or NULL
            notification_enabled  INTEGER NOT NULL DEFAULT 1,
            created_at            TEXT    NOT NULL,
            updated_at            TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

const SELECT_RULES: &str = "SELECT id, name, enabled, triggers, filters, activated_at,
                                   notification_enabled, created_at, updated_at
                            FROM rules";

/// SQLite-backed rule collection with a change feed.
///
/// Writes made through this handle are announced immediately. Commits from
/// other connections (another `ruleclock` process editing the same file)
/// are announced as [`RuleChange::Reloaded`] once
/// [`watch_external`](Self::watch_external) is running.
pub struct SqliteRuleStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<RuleChange>,
    /// Last `PRAGMA data_version` seen on `conn`.
    data_version: AtomicI64,
}

impl SqliteRuleStore {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        let version = data_version(&conn)?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
            data_version: AtomicI64::new(version),
        })
    }

    /// Poll for commits made through other connections every `period`.
    /// The task ends once the last strong reference to the store is gone.
    pub fn watch_external(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                match store.poll_external() {
                    Ok(true) => {
                        debug!("rules changed by another connection");
                        store.notify(RuleChange::Reloaded);
                    }
                    Ok(false) => {}
                    Err(e) => warn!("data_version poll failed: {e}"),
                }
            }
            debug!("external change watcher stopped");
        })
    }

    /// Whether another connection committed since the previous call.
    /// Commits made through this handle never count.
    pub fn poll_external(&self) -> Result<bool> {
        let version = data_version(&*self.lock()?)?;
        let previous = self.data_version.swap(version, Ordering::SeqCst);
        Ok(version != previous)
    }

    /// Insert or replace a rule by ID after validation.
    pub fn upsert_rule(&self, rule: &AlarmRule) -> Result<()> {
        rule.validate()?;
        let triggers = serde_json::to_string(&rule.triggers)?;
        let filters = serde_json::to_string(&rule.filters)?;
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO rules
                 (id, name, enabled, triggers, filters, activated_at,
                  notification_enabled, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                 ON CONFLICT(id) DO UPDATE SET
                    name=excluded.name, enabled=excluded.enabled,
                    triggers=excluded.triggers, filters=excluded.filters,
                    activated_at=excluded.activated_at,
                    notification_enabled=excluded.notification_enabled,
                    updated_at=excluded.updated_at",
                rusqlite::params![
                    rule.id,
                    rule.name,
                    rule.enabled,
                    triggers,
                    filters,
                    rule.activated_at.map(|t| t.to_rfc3339()),
                    rule.notification_enabled,
                    rule.created_at.to_rfc3339(),
                    rule.updated_at.to_rfc3339(),
                ],
            )?;
        }
        info!(rule_id = %rule.id, name = %rule.name, "rule saved");
        self.notify(RuleChange::Upserted {
            id: rule.id.clone(),
        });
        Ok(())
    }

    /// Remove a rule by ID. Returns `RuleNotFound` if no row is deleted.
    pub fn delete_rule(&self, id: &str) -> Result<()> {
        let n = self.lock()?.execute("DELETE FROM rules WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::RuleNotFound { id: id.to_string() });
        }
        info!(rule_id = %id, "rule removed");
        self.notify(RuleChange::Removed { id: id.to_string() });
        Ok(())
    }

    /// Toggle a rule; enabling re-anchors its interval triggers at now.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<AlarmRule> {
        let mut rule = self
            .get_rule(id)?
            .ok_or_else(|| SchedulerError::RuleNotFound { id: id.to_string() })?;
        rule.set_enabled(enabled, Utc::now());
        self.upsert_rule(&rule)?;
        Ok(rule)
    }

    pub fn get_rule(&self, id: &str) -> Result<Option<AlarmRule>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("{SELECT_RULES} WHERE id = ?1"),
                [id],
                RawRule::from_row,
            )
            .optional()?;
        raw.map(RawRule::decode).transpose()
    }

    /// Every decodable rule in insertion order. Undecodable rows are
    /// skipped with a warning.
    pub fn all_rules(&self) -> Result<Vec<AlarmRule>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!("{SELECT_RULES} ORDER BY rowid"))?;
        let raws = stmt
            .query_map([], RawRule::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let rules = raws
            .into_iter()
            .filter_map(|raw| {
                let id = raw.id.clone();
                match raw.decode() {
                    Ok(rule) => Some(rule),
                    Err(e) => {
                        warn!(rule_id = %id, "skipping undecodable rule: {e}");
                        None
                    }
                }
            })
            .collect();
        Ok(rules)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::Store("connection lock poisoned".into()))
    }

    fn notify(&self, change: RuleChange) {
        let _ = self.changes.send(change);
    }
}

#[async_trait]
impl RuleStore for SqliteRuleStore {
    async fn list_rules(&self) -> Result<Vec<AlarmRule>> {
        self.all_rules()
    }

    fn subscribe(&self) -> broadcast::Receiver<RuleChange> {
        self.changes.subscribe()
    }
}

/// Column values as stored, before JSON and timestamp decoding.
struct RawRule {
    id: String,
    name: String,
    enabled: bool,
    triggers: String,
    filters: String,
    activated_at: Option<String>,
    notification_enabled: bool,
    created_at: String,
    updated_at: String,
}

impl RawRule {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            enabled: row.get(2)?,
            triggers: row.get(3)?,
            filters: row.get(4)?,
            activated_at: row.get(5)?,
            notification_enabled: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<AlarmRule> {
        Ok(AlarmRule {
            triggers: serde_json::from_str(&self.triggers)?,
            filters: serde_json::from_str(&self.filters)?,
            activated_at: self.activated_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            name: self.name,
            enabled: self.enabled,
            notification_enabled: self.notification_enabled,
        })
    }
}

fn data_version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("PRAGMA data_version", [], |row| row.get(0))?)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::Store(format!("bad timestamp {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TimeCondition, TriggerCondition};

    fn store() -> SqliteRuleStore {
        SqliteRuleStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn rules_round_trip_through_sqlite() {
        let store = store();
        let rule = AlarmRule::new(
            "lunch",
            vec![TriggerCondition::at(12, 30), TriggerCondition::interval(45)],
            vec![TimeCondition::range(11, 0, 14, 0)],
        );
        store.upsert_rule(&rule).unwrap();

        let listed = store.list_rules().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].triggers, rule.triggers);
        assert_eq!(listed[0].filters, rule.filters);
        assert_eq!(listed[0].name, "lunch");
        assert!(listed[0].enabled);
    }

    #[test]
    fn upsert_keeps_insertion_order() {
        let store = store();
        let a = AlarmRule::new("a", vec![TriggerCondition::at(1, 0)], vec![]);
        let b = AlarmRule::new("b", vec![TriggerCondition::at(2, 0)], vec![]);
        store.upsert_rule(&a).unwrap();
        store.upsert_rule(&b).unwrap();

        let mut a2 = a.clone();
        a2.name = "a-renamed".into();
        store.upsert_rule(&a2).unwrap();

        let names: Vec<_> = store.all_rules().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a-renamed", "b"]);
    }

    #[test]
    fn writes_are_announced() {
        let store = store();
        let mut feed = store.subscribe();
        let rule = AlarmRule::new("x", vec![TriggerCondition::at(6, 0)], vec![]);
        store.upsert_rule(&rule).unwrap();
        store.delete_rule(&rule.id).unwrap();

        assert_eq!(feed.try_recv().unwrap(), RuleChange::Upserted { id: rule.id.clone() });
        assert_eq!(feed.try_recv().unwrap(), RuleChange::Removed { id: rule.id });
    }

    #[test]
    fn delete_missing_is_not_found() {
        assert!(matches!(
            store().delete_rule("ghost"),
            Err(SchedulerError::RuleNotFound { .. })
        ));
    }

    #[test]
    fn set_enabled_persists_anchor() {
        let store = store();
        let mut rule = AlarmRule::new("x", vec![TriggerCondition::interval(20)], vec![]);
        rule.enabled = false;
        store.upsert_rule(&rule).unwrap();

        store.set_enabled(&rule.id, true).unwrap();
        let on = store.get_rule(&rule.id).unwrap().unwrap();
        assert!(on.enabled);
        assert!(on.activated_at.is_some());

        store.set_enabled(&rule.id, false).unwrap();
        let off = store.get_rule(&rule.id).unwrap().unwrap();
        assert!(!off.enabled);
        assert!(off.activated_at.is_none());
    }

    fn file_pair(dir: &tempfile::TempDir) -> (Arc<SqliteRuleStore>, SqliteRuleStore) {
        let path = dir.path().join("rules.db");
        let host = SqliteRuleStore::new(Connection::open(&path).unwrap()).unwrap();
        let other = SqliteRuleStore::new(Connection::open(&path).unwrap()).unwrap();
        (Arc::new(host), other)
    }

    #[test]
    fn foreign_commits_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let (host, other) = file_pair(&dir);
        assert!(!host.poll_external().unwrap());

        let rule = AlarmRule::new("x", vec![TriggerCondition::at(6, 0)], vec![]);
        other.upsert_rule(&rule).unwrap();
        assert!(host.poll_external().unwrap());
        assert!(!host.poll_external().unwrap());

        // own writes already go out on the feed directly
        host.delete_rule(&rule.id).unwrap();
        assert!(!host.poll_external().unwrap());
        assert!(other.poll_external().unwrap());
    }

    #[tokio::test]
    async fn watcher_announces_foreign_commits() {
        let dir = tempfile::tempdir().unwrap();
        let (host, other) = file_pair(&dir);
        let mut feed = host.subscribe();
        let watcher = host.watch_external(Duration::from_millis(10));

        let rule = AlarmRule::new("x", vec![TriggerCondition::at(6, 0)], vec![]);
        other.upsert_rule(&rule).unwrap();
        let change = tokio::time::timeout(Duration::from_secs(2), feed.recv())
            .await
            .expect("no change announced")
            .unwrap();
        assert_eq!(change, RuleChange::Reloaded);
        assert_eq!(host.all_rules().unwrap().len(), 1);

        drop(host);
        tokio::time::timeout(Duration::from_secs(2), watcher)
            .await
            .expect("watcher outlived its store")
            .unwrap();
    }

    #[test]
    fn corrupt_row_is_skipped() {
        let store = store();
        let good = AlarmRule::new("good", vec![TriggerCondition::at(3, 0)], vec![]);
        store.upsert_rule(&good).unwrap();
        store
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO rules (id, name, triggers, filters, created_at, updated_at)
                 VALUES ('bad', 'bad', 'not json', '[]', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();

        let rules = store.all_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, good.id);
    }
}
