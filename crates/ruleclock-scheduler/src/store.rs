use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::types::AlarmRule;

pub const CHANGE_FEED_CAPACITY: usize = 64;

/// What happened to the rule collection. The engine treats every variant
/// as "something changed, reschedule".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleChange {
    Upserted { id: String },
    Removed { id: String },
    /// Changed by a writer this handle cannot see into, e.g. another process.
    Reloaded,
}

/// Read side of the rule collection, as seen by the engine.
#[async_trait]
pub trait RuleStore: Send + Sync + 'static {
    /// Snapshot of every rule in stable order.
    async fn list_rules(&self) -> Result<Vec<AlarmRule>>;

    /// Push feed of collection changes. Lagging receivers only lose detail,
    /// never the fact that something changed.
    fn subscribe(&self) -> broadcast::Receiver<RuleChange>;
}

/// Rules held in process memory, in insertion order.
pub struct MemoryRuleStore {
    rules: RwLock<Vec<AlarmRule>>,
    changes: broadcast::Sender<RuleChange>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::with_rules(Vec::new())
    }

    pub fn with_rules(rules: Vec<AlarmRule>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            rules: RwLock::new(rules),
            changes,
        }
    }

    /// Insert or replace by ID after validation.
    pub fn upsert(&self, rule: AlarmRule) -> Result<()> {
        rule.validate()?;
        let id = rule.id.clone();
        {
            let mut rules = self.write()?;
            match rules.iter_mut().find(|r| r.id == rule.id) {
                Some(existing) => *existing = rule,
                None => rules.push(rule),
            }
        }
        debug!(rule_id = %id, "rule upserted");
        self.notify(RuleChange::Upserted { id });
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        {
            let mut rules = self.write()?;
            let before = rules.len();
            rules.retain(|r| r.id != id);
            if rules.len() == before {
                return Err(SchedulerError::RuleNotFound { id: id.to_string() });
            }
        }
        debug!(rule_id = %id, "rule removed");
        self.notify(RuleChange::Removed { id: id.to_string() });
        Ok(())
    }

    /// Toggle a rule; see [`AlarmRule::set_enabled`] for anchor handling.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<AlarmRule> {
        let updated = {
            let mut rules = self.write()?;
            let rule = rules
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| SchedulerError::RuleNotFound { id: id.to_string() })?;
            rule.set_enabled(enabled, Utc::now());
            rule.clone()
        };
        self.notify(RuleChange::Upserted { id: id.to_string() });
        Ok(updated)
    }

    pub fn get(&self, id: &str) -> Result<Option<AlarmRule>> {
        Ok(self.read()?.iter().find(|r| r.id == id).cloned())
    }

    fn notify(&self, change: RuleChange) {
        // No receivers just means no engine is running.
        let _ = self.changes.send(change);
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<AlarmRule>>> {
        self.rules
            .read()
            .map_err(|_| SchedulerError::Store("rule list lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<AlarmRule>>> {
        self.rules
            .write()
            .map_err(|_| SchedulerError::Store("rule list lock poisoned".into()))
    }
}

impl Default for MemoryRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn list_rules(&self) -> Result<Vec<AlarmRule>> {
        Ok(self.read()?.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<RuleChange> {
        self.changes.subscribe()
    }
}
