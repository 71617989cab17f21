use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SAFETY_NET_SECS: u64 = 300; // re-check every 5 min regardless of primary timer
pub const DEFAULT_DEBOUNCE_MS: u64 = 500; // coalesce bursts of rule edits
pub const DEFAULT_WATCH_MS: u64 = 1000; // poll for writes made by other processes
pub const ENV_PREFIX: &str = "RULECLOCK_";

/// Top-level config (ruleclock.toml + RULECLOCK_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleclockConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Background scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the safety-net re-check, in seconds.
    #[serde(default = "default_safety_net_secs")]
    pub safety_net_secs: u64,
    /// Quiet period after a rule change before the primary timer is re-armed.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Start the engine as soon as the host boots (default: true).
    /// Override with env var: RULECLOCK_SCHEDULER__AUTOSTART=false
    #[serde(default = "bool_true")]
    pub autostart: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            safety_net_secs: DEFAULT_SAFETY_NET_SECS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            autostart: true,
        }
    }
}

impl SchedulerConfig {
    pub fn safety_net(&self) -> std::time::Duration {
        // A zero period would make tokio's interval panic.
        std::time::Duration::from_secs(self.safety_net_secs.max(1))
    }

    pub fn debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How often a running scheduler looks for rule edits made by other
    /// `ruleclock` invocations, in milliseconds.
    #[serde(default = "default_watch_ms")]
    pub watch_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            watch_ms: DEFAULT_WATCH_MS,
        }
    }
}

impl DatabaseConfig {
    pub fn watch_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.watch_ms.max(1))
    }
}

fn bool_true() -> bool {
    true
}
fn default_safety_net_secs() -> u64 {
    DEFAULT_SAFETY_NET_SECS
}
fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}
fn default_watch_ms() -> u64 {
    DEFAULT_WATCH_MS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.ruleclock/rules.db", home)
}

impl RuleclockConfig {
    /// Load config from a TOML file with RULECLOCK_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument (must be readable)
    ///   2. ~/.ruleclock/ruleclock.toml (optional)
    ///
    /// Nested keys use a double underscore: `RULECLOCK_DATABASE__PATH`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = match config_path {
            Some(p) => {
                std::fs::File::open(p)?;
                p.to_string()
            }
            None => default_config_path(),
        };

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.ruleclock/ruleclock.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = RuleclockConfig::from_figment(Figment::from(Toml::string(""))).unwrap();
        assert_eq!(cfg.scheduler.safety_net_secs, DEFAULT_SAFETY_NET_SECS);
        assert_eq!(cfg.scheduler.debounce_ms, DEFAULT_DEBOUNCE_MS);
        assert!(cfg.scheduler.autostart);
        assert!(cfg.database.path.ends_with("/.ruleclock/rules.db"));
    }

    #[test]
    fn partial_scheduler_section_keeps_other_defaults() {
        let toml = r#"
            [scheduler]
            debounce_ms = 50

            [database]
            path = "/tmp/r.db"
        "#;
        let cfg = RuleclockConfig::from_figment(Figment::from(Toml::string(toml))).unwrap();
        assert_eq!(cfg.scheduler.debounce_ms, 50);
        assert_eq!(cfg.scheduler.safety_net_secs, DEFAULT_SAFETY_NET_SECS);
        assert_eq!(cfg.database.path, "/tmp/r.db");
    }

    #[test]
    fn wrong_type_is_config_error() {
        let toml = "[scheduler]\nsafety_net_secs = \"soon\"";
        let err = RuleclockConfig::from_figment(Figment::from(Toml::string(toml))).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn missing_explicit_path_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = RuleclockConfig::load(missing.to_str()).unwrap_err();
        assert_eq!(err.code(), "IO_ERROR");
    }

    #[test]
    fn explicit_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ruleclock.toml");
        std::fs::write(&path, "[database]\nwatch_ms = 250\n").unwrap();
        let cfg = RuleclockConfig::load(path.to_str()).unwrap();
        assert_eq!(cfg.database.watch_ms, 250);
        assert_eq!(cfg.database.watch_interval(), std::time::Duration::from_millis(250));
    }

    #[test]
    fn zero_safety_net_is_clamped() {
        let cfg = SchedulerConfig {
            safety_net_secs: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(cfg.safety_net(), std::time::Duration::from_secs(1));
    }
}
