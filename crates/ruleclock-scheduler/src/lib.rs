//! `ruleclock-scheduler`: rule-based alarm evaluation and scheduling.
//!
//! # Overview
//!
//! An [`AlarmRule`] fires at a minute when any of its triggers matches and
//! all of its filters hold. The [`engine::SchedulerEngine`] arms a single
//! timer for the earliest upcoming occurrence across all enabled rules
//! instead of polling every minute, and re-checks on a slow safety-net timer.
//!
//! # Conditions
//!
//! | Type       | Trigger | Filter | Matches                                   |
//! |------------|---------|--------|-------------------------------------------|
//! | `range`    | no      | yes    | inclusive window, may cross midnight      |
//! | `interval` | yes     | yes    | every N minutes from midnight or anchor   |
//! | `specific` | yes     | yes    | hh:mm with optional hour/minute wildcards |
//!
//! Compound `AND`/`OR` trees can be evaluated with [`evaluate::evaluate`].

pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod evaluate;
pub mod next;
pub mod sink;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use db::SqliteRuleStore;
pub use engine::{SchedulerEngine, SchedulerHandle, SchedulerStatus};
pub use error::{Result, SchedulerError};
pub use evaluate::{evaluate, evaluate_rule};
pub use next::{next_alarm_time, next_occurrence, Occurrence};
pub use sink::{ChannelSink, FireSink, LogSink};
pub use store::{MemoryRuleStore, RuleChange, RuleStore};
pub use types::{
    AlarmRule, Condition, FilterCondition, FireEvent, TimeCondition, TriggerCondition, WallTime,
};
