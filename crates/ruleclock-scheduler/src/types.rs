use chrono::{DateTime, Local, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

pub const MINUTES_PER_DAY: u16 = 24 * 60;
pub const MAX_INTERVAL_MINUTES: u16 = 720;

/// A minute of the local day, `00:00` through `23:59`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WallTime {
    pub hour: u8,
    pub minute: u8,
}

impl WallTime {
    pub const MIDNIGHT: WallTime = WallTime { hour: 0, minute: 0 };

    pub const fn new(hour: u8, minute: u8) -> Self {
        Self { hour, minute }
    }

    /// Build from minutes-since-midnight; values past the end of the day wrap.
    pub fn from_minutes(minutes: u16) -> Self {
        let m = minutes % MINUTES_PER_DAY;
        Self {
            hour: (m / 60) as u8,
            minute: (m % 60) as u8,
        }
    }

    /// The wall-clock minute of `dt` in its own time zone. Seconds are dropped.
    pub fn of<Tz: TimeZone>(dt: &DateTime<Tz>) -> Self {
        Self {
            hour: dt.hour() as u8,
            minute: dt.minute() as u8,
        }
    }

    pub fn minutes(self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }

    /// Forward distance to `later` in minutes, always in `1..=1440`.
    ///
    /// Equal times are a full day apart: "next" never means "now".
    pub fn minutes_until(self, later: WallTime) -> u16 {
        let diff = (later.minutes() + MINUTES_PER_DAY - self.minutes()) % MINUTES_PER_DAY;
        if diff == 0 {
            MINUTES_PER_DAY
        } else {
            diff
        }
    }
}

impl std::fmt::Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Inclusive window of the day. `start > end` wraps past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeCondition {
    pub start_hour: u8,
    pub start_minute: u8,
    pub end_hour: u8,
    pub end_minute: u8,
}

impl RangeCondition {
    pub fn new(start_hour: u8, start_minute: u8, end_hour: u8, end_minute: u8) -> Self {
        Self {
            start_hour,
            start_minute,
            end_hour,
            end_minute,
        }
    }

    pub fn start(&self) -> WallTime {
        WallTime::new(self.start_hour, self.start_minute)
    }

    pub fn end(&self) -> WallTime {
        WallTime::new(self.end_hour, self.end_minute)
    }
}

/// Every N minutes; phase is midnight unless a rule anchor applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalCondition {
    pub interval_minutes: u16,
}

/// Fixed clock time with optional wildcards.
///
/// | hour | minute | fires                 |
/// |------|--------|-----------------------|
/// | set  | set    | daily at hh:mm        |
/// | set  | -      | daily at hh:00        |
/// | -    | set    | hourly at :mm         |
/// | -    | -      | hourly at :00         |
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecificTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<u8>,
}

/// Leaf time condition, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TimeCondition {
    Range(RangeCondition),
    Interval(IntervalCondition),
    Specific(SpecificTime),
}

/// Filters may be any leaf condition; all of a rule's filters must hold.
pub type FilterCondition = TimeCondition;

/// Conditions that identify firing minutes on their own. A range cannot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TriggerCondition {
    Interval(IntervalCondition),
    Specific(SpecificTime),
}

impl TimeCondition {
    pub fn range(start_hour: u8, start_minute: u8, end_hour: u8, end_minute: u8) -> Self {
        TimeCondition::Range(RangeCondition::new(
            start_hour,
            start_minute,
            end_hour,
            end_minute,
        ))
    }

    pub fn interval(minutes: u16) -> Self {
        TimeCondition::Interval(IntervalCondition {
            interval_minutes: minutes,
        })
    }

    pub fn specific(hour: Option<u8>, minute: Option<u8>) -> Self {
        TimeCondition::Specific(SpecificTime { hour, minute })
    }
}

impl TriggerCondition {
    pub fn interval(minutes: u16) -> Self {
        TriggerCondition::Interval(IntervalCondition {
            interval_minutes: minutes,
        })
    }

    pub fn specific(hour: Option<u8>, minute: Option<u8>) -> Self {
        TriggerCondition::Specific(SpecificTime { hour, minute })
    }

    pub fn at(hour: u8, minute: u8) -> Self {
        Self::specific(Some(hour), Some(minute))
    }
}

impl From<TriggerCondition> for TimeCondition {
    fn from(t: TriggerCondition) -> Self {
        match t {
            TriggerCondition::Interval(i) => TimeCondition::Interval(i),
            TriggerCondition::Specific(s) => TimeCondition::Specific(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    And,
    Or,
}

/// Boolean composition over child conditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundCondition {
    pub operator: LogicalOperator,
    pub conditions: Vec<Condition>,
}

/// Any condition tree node. Compound nodes carry `operator`, leaves carry `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Compound(CompoundCondition),
    Time(TimeCondition),
}

impl Condition {
    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::Compound(CompoundCondition {
            operator: LogicalOperator::And,
            conditions,
        })
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Compound(CompoundCondition {
            operator: LogicalOperator::Or,
            conditions,
        })
    }
}

impl From<TimeCondition> for Condition {
    fn from(c: TimeCondition) -> Self {
        Condition::Time(c)
    }
}

/// A user-defined alarm: fires when any trigger matches and every filter holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmRule {
    /// UUID v4 string, primary key.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    pub enabled: bool,
    /// OR-ed. An empty list never fires.
    pub triggers: Vec<TriggerCondition>,
    /// AND-ed gates evaluated at the candidate minute.
    #[serde(default)]
    pub filters: Vec<FilterCondition>,
    /// Set when the rule was last switched on; anchors interval triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default = "bool_true")]
    pub notification_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn bool_true() -> bool {
    true
}

impl AlarmRule {
    /// A fresh, enabled rule with a random ID and no anchor.
    pub fn new(
        name: impl Into<String>,
        triggers: Vec<TriggerCondition>,
        filters: Vec<FilterCondition>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            enabled: true,
            triggers,
            filters,
            activated_at: None,
            notification_enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Local minute-of-day of `activated_at`, the phase of interval triggers.
    pub fn anchor(&self) -> Option<WallTime> {
        self.activated_at
            .map(|at| WallTime::of(&at.with_timezone(&Local)))
    }

    /// Switch the rule on or off. Turning it on re-anchors interval triggers
    /// at `now`; turning it off clears the anchor.
    pub fn set_enabled(&mut self, enabled: bool, now: DateTime<Utc>) {
        if enabled && !self.enabled {
            self.activated_at = Some(now);
        } else if !enabled {
            self.activated_at = None;
        }
        self.enabled = enabled;
        self.updated_at = now;
    }

    /// Dedup key for a fire at `at`: `ruleId:hour:minute`.
    pub fn fire_key(&self, at: WallTime) -> String {
        format!("{}:{}:{}", self.id, at.hour, at.minute)
    }

    /// Range-check every field. Stores call this before persisting.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SchedulerError::InvalidRule("rule id must not be empty".into()));
        }
        for trigger in &self.triggers {
            validate_time(&trigger.clone().into())?;
        }
        for filter in &self.filters {
            validate_time(filter)?;
        }
        Ok(())
    }
}

/// Range-check a condition tree. Compound nodes must have children.
pub fn validate_condition(condition: &Condition) -> Result<()> {
    match condition {
        Condition::Time(t) => validate_time(t),
        Condition::Compound(c) => {
            if c.conditions.is_empty() {
                return Err(SchedulerError::InvalidRule(
                    "compound condition has no children".into(),
                ));
            }
            c.conditions.iter().try_for_each(validate_condition)
        }
    }
}

fn validate_time(condition: &TimeCondition) -> Result<()> {
    match condition {
        TimeCondition::Range(r) => {
            check_hour(r.start_hour)?;
            check_minute(r.start_minute)?;
            check_hour(r.end_hour)?;
            check_minute(r.end_minute)
        }
        TimeCondition::Interval(i) => {
            if (1..=MAX_INTERVAL_MINUTES).contains(&i.interval_minutes) {
                Ok(())
            } else {
                Err(SchedulerError::InvalidRule(format!(
                    "interval must be 1..={MAX_INTERVAL_MINUTES} minutes, got {}",
                    i.interval_minutes
                )))
            }
        }
        TimeCondition::Specific(s) => {
            if let Some(h) = s.hour {
                check_hour(h)?;
            }
            if let Some(m) = s.minute {
                check_minute(m)?;
            }
            Ok(())
        }
    }
}

fn check_hour(h: u8) -> Result<()> {
    if h < 24 {
        Ok(())
    } else {
        Err(SchedulerError::InvalidRule(format!("hour out of range: {h}")))
    }
}

fn check_minute(m: u8) -> Result<()> {
    if m < 60 {
        Ok(())
    } else {
        Err(SchedulerError::InvalidRule(format!("minute out of range: {m}")))
    }
}

/// Emitted to the fire sink each time a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FireEvent {
    pub rule_id: String,
    pub rule_name: String,
    pub triggered_at: DateTime<Utc>,
    /// Next occurrence after this one, for display only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_alarm_time: Option<WallTime>,
    /// Whether the host should surface a notification for this fire.
    pub notification_enabled: bool,
}
