use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Local, Utc};
use ruleclock_core::RuleclockConfig;
use ruleclock_scheduler::{
    next_alarm_time, AlarmRule, ChannelSink, FilterCondition, FireEvent, SchedulerEngine,
    SqliteRuleStore, SystemClock, TriggerCondition, WallTime,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Open (and migrate) the rule database, creating its directory if needed.
pub fn open_store(db_path: &str) -> anyhow::Result<Arc<SqliteRuleStore>> {
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let conn = rusqlite::Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(Arc::new(SqliteRuleStore::new(conn)?))
}

pub async fn run(config: &RuleclockConfig, store: Arc<SqliteRuleStore>) -> anyhow::Result<()> {
    // Picks up `import`/`enable`/`disable`/`remove` run from another shell.
    let watcher = store.watch_external(config.database.watch_interval());

    // Fired-event channel: SchedulerEngine → stdout delivery task
    let (sink, mut fired_rx) = ChannelSink::channel(256);
    let (engine, handle) = SchedulerEngine::new(
        config.scheduler.clone(),
        store,
        Arc::new(sink),
        Arc::new(SystemClock),
    );
    let engine_task = engine.spawn();

    tokio::spawn(async move {
        while let Some(event) = fired_rx.recv().await {
            if let Some(line) = notification_line(&event) {
                println!("{line}");
            }
        }
    });

    if config.scheduler.autostart {
        handle.start()?;
    } else {
        info!("autostart disabled, alarms are paused");
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    handle.shutdown()?;
    engine_task.await?;
    watcher.abort();
    Ok(())
}

/// JSON line for stdout, or `None` for rules that fire silently.
fn notification_line(event: &FireEvent) -> Option<String> {
    if !event.notification_enabled {
        debug!(rule_id = %event.rule_id, name = %event.rule_name, "silent rule fired");
        return None;
    }
    match serde_json::to_string(event) {
        Ok(line) => Some(line),
        Err(e) => {
            warn!(rule_id = %event.rule_id, "could not encode fire event: {e}");
            None
        }
    }
}

pub fn list(store: &SqliteRuleStore) -> anyhow::Result<()> {
    let now = WallTime::of(&Local::now());
    for rule in store.all_rules()? {
        let next = if rule.enabled {
            next_alarm_time(&rule.triggers, &rule.filters, now, rule.anchor())
                .map(|t| t.to_string())
                .unwrap_or_else(|| "never".to_string())
        } else {
            "off".to_string()
        };
        println!("{}  {:<5}  {:<24}  {}", rule.id, next, rule.name, describe(&rule));
    }
    Ok(())
}

/// One entry of an import file. Omitted IDs are generated.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportedRule {
    id: Option<String>,
    name: String,
    #[serde(default = "bool_true")]
    enabled: bool,
    triggers: Vec<TriggerCondition>,
    #[serde(default)]
    filters: Vec<FilterCondition>,
    #[serde(default = "bool_true")]
    notification_enabled: bool,
}

fn bool_true() -> bool {
    true
}

impl ImportedRule {
    fn into_rule(self, existing: Option<AlarmRule>) -> AlarmRule {
        let now = Utc::now();
        let mut rule = existing.unwrap_or_else(|| {
            let mut fresh = AlarmRule::new(self.name.clone(), Vec::new(), Vec::new());
            fresh.enabled = false;
            fresh
        });
        if let Some(id) = self.id {
            rule.id = id;
        }
        rule.name = self.name;
        rule.triggers = self.triggers;
        rule.filters = self.filters;
        rule.notification_enabled = self.notification_enabled;
        rule.set_enabled(self.enabled, now);
        rule
    }
}

pub fn import(store: &SqliteRuleStore, file: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let entries: Vec<ImportedRule> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;

    let count = entries.len();
    for entry in entries {
        let existing = match entry.id.as_deref() {
            Some(id) => store.get_rule(id)?,
            None => None,
        };
        let rule = entry.into_rule(existing);
        store
            .upsert_rule(&rule)
            .with_context(|| format!("rule {:?}", rule.name))?;
    }
    info!(count, "rules imported");
    Ok(())
}

pub fn set_enabled(store: &SqliteRuleStore, id: &str, enabled: bool) -> anyhow::Result<()> {
    let rule = store.set_enabled(id, enabled)?;
    println!("{} {}", rule.id, if rule.enabled { "enabled" } else { "disabled" });
    Ok(())
}

pub fn remove(store: &SqliteRuleStore, id: &str) -> anyhow::Result<()> {
    store.delete_rule(id)?;
    println!("{id} removed");
    Ok(())
}

fn describe(rule: &AlarmRule) -> String {
    format!(
        "{} trigger(s), {} filter(s){}",
        rule.triggers.len(),
        rule.filters.len(),
        if rule.notification_enabled { "" } else { ", silent" }
    )
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
