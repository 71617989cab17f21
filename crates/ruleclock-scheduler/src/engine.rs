use std::collections::HashSet;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Local, Timelike, Utc};
use ruleclock_core::SchedulerConfig;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    evaluate::evaluate_rule,
    next::{next_alarm_time, next_occurrence},
    sink::FireSink,
    store::{RuleChange, RuleStore},
    types::{AlarmRule, FireEvent, WallTime},
};

/// Added to every primary delay so the timer lands inside the target minute.
const TIMER_SLACK: StdDuration = StdDuration::from_millis(25);

#[derive(Debug)]
enum Command {
    Start,
    Stop,
    CheckNow,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    /// Evaluate every rule at the current minute, then reschedule.
    Check,
    /// Only re-arm the primary timer.
    Schedule,
}

/// Result of a store read, tagged with the generation that asked for it.
struct Snapshot {
    generation: u64,
    purpose: Purpose,
    rules: Result<Vec<AlarmRule>>,
}

/// Observable engine state, published on every transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStatus {
    pub running: bool,
    /// Bumped on every start and stop.
    pub generation: u64,
    /// Wall-clock time of the last completed check.
    pub last_check: Option<DateTime<Utc>>,
    /// Completed checks since the engine was built.
    pub checks: u64,
    /// Target of the armed primary timer, if any.
    pub next_alarm: Option<DateTime<Local>>,
}

/// Cloneable control surface for a running [`SchedulerEngine`] task.
#[derive(Clone)]
pub struct SchedulerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<SchedulerStatus>,
}

impl SchedulerHandle {
    /// Start (or restart) the scheduler. An immediate check follows.
    pub fn start(&self) -> Result<()> {
        self.send(Command::Start)
    }

    /// Stop all timers. Reads still in flight are discarded when they land.
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Force a check now. Ignored while stopped.
    pub fn check_now(&self) -> Result<()> {
        self.send(Command::CheckNow)
    }

    /// Stop and end the engine task.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SchedulerStatus> {
        self.status_rx.clone()
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| SchedulerError::EngineClosed)
    }
}

/// Background alarm scheduler.
///
/// Owns a one-shot primary timer armed for the earliest upcoming occurrence
/// across all enabled rules, a recurring safety-net timer, and a debounce
/// timer fed by the store's change feed. All state lives in this one task;
/// the [`SchedulerHandle`] talks to it over a channel.
pub struct SchedulerEngine {
    config: SchedulerConfig,
    store: Arc<dyn RuleStore>,
    sink: Arc<dyn FireSink>,
    clock: Arc<dyn Clock>,

    cmd_rx: mpsc::UnboundedReceiver<Command>,
    snap_tx: mpsc::UnboundedSender<Snapshot>,
    snap_rx: mpsc::UnboundedReceiver<Snapshot>,
    status_tx: watch::Sender<SchedulerStatus>,

    running: bool,
    generation: u64,
    primary: Option<Pin<Box<Sleep>>>,
    safety_net: Option<Interval>,
    debounce: Option<Pin<Box<Sleep>>>,
    changes: Option<broadcast::Receiver<RuleChange>>,

    /// Dedup keys (`ruleId:hour:minute`) fired during `fired_minute`.
    fired: HashSet<String>,
    fired_minute: Option<DateTime<Local>>,
}

impl SchedulerEngine {
    /// Build a stopped engine and its handle. Nothing runs until
    /// [`run`](Self::run) is polled and [`SchedulerHandle::start`] is sent.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn RuleStore>,
        sink: Arc<dyn FireSink>,
        clock: Arc<dyn Clock>,
    ) -> (Self, SchedulerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (snap_tx, snap_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SchedulerStatus::default());
        let engine = Self {
            config,
            store,
            sink,
            clock,
            cmd_rx,
            snap_tx,
            snap_rx,
            status_tx,
            running: false,
            generation: 0,
            primary: None,
            safety_net: None,
            debounce: None,
            changes: None,
            fired: HashSet::new(),
            fired_minute: None,
        };
        (engine, SchedulerHandle { cmd_tx, status_rx })
    }

    /// Spawn [`run`](Self::run) on the current tokio runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Main event loop. Exits on `shutdown` or when every handle is dropped.
    pub async fn run(mut self) {
        debug!("scheduler engine task started");
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Start) => self.start(),
                    Some(Command::Stop) => self.stop(),
                    Some(Command::CheckNow) => {
                        if self.running {
                            self.request_rules(Purpose::Check);
                        } else {
                            debug!("check requested while stopped, ignoring");
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        self.stop();
                        info!("scheduler engine shutting down");
                        break;
                    }
                },
                Some(snapshot) = self.snap_rx.recv() => self.on_snapshot(snapshot),
                _ = sleep_opt(&mut self.primary) => {
                    self.primary = None;
                    debug!("primary timer fired");
                    self.request_rules(Purpose::Check);
                }
                _ = tick_opt(&mut self.safety_net) => {
                    debug!("safety-net check");
                    self.request_rules(Purpose::Check);
                }
                _ = sleep_opt(&mut self.debounce) => {
                    self.debounce = None;
                    self.request_rules(Purpose::Schedule);
                }
                change = recv_opt(&mut self.changes) => match change {
                    Ok(change) => {
                        debug!(?change, "rule collection changed");
                        self.arm_debounce();
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "change feed lagged");
                        self.arm_debounce();
                    }
                    Err(RecvError::Closed) => {
                        warn!("rule change feed closed, relying on safety net");
                        self.changes = None;
                    }
                },
            }
        }
    }

    // --- transitions -------------------------------------------------------

    fn start(&mut self) {
        if self.running {
            self.stop();
        }
        self.generation += 1;
        self.running = true;
        self.changes = Some(self.store.subscribe());

        let period = self.config.safety_net();
        let mut net = tokio::time::interval_at(Instant::now() + period, period);
        net.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.safety_net = Some(net);

        info!(generation = self.generation, safety_net_secs = period.as_secs(), "alarm scheduler started");
        self.publish();
        self.request_rules(Purpose::Check);
    }

    fn stop(&mut self) {
        self.generation += 1;
        let was_running = self.running;
        self.running = false;
        self.primary = None;
        self.safety_net = None;
        self.debounce = None;
        self.changes = None;
        if was_running {
            info!(generation = self.generation, "alarm scheduler stopped");
        }
        self.status_tx.send_modify(|s| {
            s.running = false;
            s.generation = self.generation;
            s.next_alarm = None;
        });
    }

    /// Cancel-and-replace: only the last change in a burst reschedules.
    fn arm_debounce(&mut self) {
        self.debounce = Some(Box::pin(tokio::time::sleep(self.config.debounce())));
    }

    /// Read the rule set off-loop; the result comes back as a [`Snapshot`].
    fn request_rules(&self, purpose: Purpose) {
        let store = Arc::clone(&self.store);
        let tx = self.snap_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let rules = store.list_rules().await;
            // The engine may already be gone.
            let _ = tx.send(Snapshot {
                generation,
                purpose,
                rules,
            });
        });
    }

    fn on_snapshot(&mut self, snapshot: Snapshot) {
        if !self.running || snapshot.generation != self.generation {
            debug!(
                snapshot_generation = snapshot.generation,
                generation = self.generation,
                "discarding stale rule snapshot"
            );
            return;
        }
        let rules = match snapshot.rules {
            Ok(rules) => rules,
            Err(e) => {
                error!(purpose = ?snapshot.purpose, "rule store read failed: {e}");
                return;
            }
        };
        if snapshot.purpose == Purpose::Check {
            self.check(&rules);
        }
        self.schedule(&rules);
    }

    // --- evaluation --------------------------------------------------------

    /// Fire every enabled rule matching the current minute, once per minute.
    fn check(&mut self, rules: &[AlarmRule]) {
        let now = self.clock.now();
        let minute = minute_start(now);
        if self.fired_minute != Some(minute) {
            self.fired.clear();
            self.fired_minute = Some(minute);
        }

        let at = WallTime::of(&now);
        let mut fired = 0usize;
        for rule in rules.iter().filter(|r| r.enabled) {
            let anchor = rule.anchor();
            if !evaluate_rule(&rule.triggers, &rule.filters, at, anchor) {
                continue;
            }
            if !self.fired.insert(rule.fire_key(at)) {
                debug!(rule_id = %rule.id, %at, "already fired this minute");
                continue;
            }

            let event = FireEvent {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                triggered_at: now.with_timezone(&Utc),
                next_alarm_time: next_alarm_time(&rule.triggers, &rule.filters, at, anchor),
                notification_enabled: rule.notification_enabled,
            };
            info!(rule_id = %rule.id, name = %rule.name, %at, "rule fired");
            fired += 1;
            if let Err(e) = self.sink.on_fire(&event) {
                warn!(rule_id = %rule.id, "fire event dropped: {e}");
            }
        }

        debug!(%at, rules = rules.len(), fired, "check complete");
        self.status_tx.send_modify(|s| {
            s.last_check = Some(now.with_timezone(&Utc));
            s.checks += 1;
        });
    }

    /// Re-arm the primary timer for the earliest occurrence across `rules`.
    fn schedule(&mut self, rules: &[AlarmRule]) {
        let now = self.clock.now();
        let at = WallTime::of(&now);

        let earliest = rules
            .iter()
            .filter(|r| r.enabled)
            .filter_map(|r| {
                next_occurrence(&r.triggers, &r.filters, at, r.anchor()).map(|occ| (r, occ))
            })
            .min_by_key(|(_, occ)| occ.minutes_ahead);

        let target = match earliest {
            None => {
                self.primary = None;
                debug!("no upcoming alarms, safety net only");
                None
            }
            Some((rule, occ)) => {
                let target = minute_start(now) + Duration::minutes(i64::from(occ.minutes_ahead));
                let delay = (target - now).to_std().unwrap_or(StdDuration::ZERO) + TIMER_SLACK;
                self.primary = Some(Box::pin(tokio::time::sleep(delay)));
                debug!(
                    rule_id = %rule.id,
                    target = %target,
                    ?delay,
                    "primary timer armed"
                );
                Some(target)
            }
        };
        self.status_tx.send_modify(|s| s.next_alarm = target);
    }

    fn publish(&self) {
        self.status_tx.send_modify(|s| {
            s.running = self.running;
            s.generation = self.generation;
        });
    }
}

/// `now` with seconds and sub-seconds dropped.
fn minute_start(now: DateTime<Local>) -> DateTime<Local> {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

async fn sleep_opt(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn recv_opt(
    rx: &mut Option<broadcast::Receiver<RuleChange>>,
) -> std::result::Result<RuleChange, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}
