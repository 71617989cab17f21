use crate::evaluate::{filters_pass, phase_offset};
use crate::types::{FilterCondition, SpecificTime, TriggerCondition, WallTime, MINUTES_PER_DAY};

/// A future firing minute and how far away it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub time: WallTime,
    /// Always in `1..=1440`.
    pub minutes_ahead: u16,
}

impl Occurrence {
    fn after(now: WallTime, time: WallTime) -> Self {
        Self {
            time,
            minutes_ahead: now.minutes_until(time),
        }
    }
}

/// The nearest minute strictly after `now` at which any trigger fires with
/// every filter holding. `None` when no trigger can ever be satisfied.
pub fn next_alarm_time(
    triggers: &[TriggerCondition],
    filters: &[FilterCondition],
    now: WallTime,
    anchor: Option<WallTime>,
) -> Option<WallTime> {
    next_occurrence(triggers, filters, now, anchor).map(|o| o.time)
}

/// Like [`next_alarm_time`] but keeps the distance. Ties go to the first
/// trigger in list order.
pub fn next_occurrence(
    triggers: &[TriggerCondition],
    filters: &[FilterCondition],
    now: WallTime,
    anchor: Option<WallTime>,
) -> Option<Occurrence> {
    let mut best: Option<Occurrence> = None;
    for trigger in triggers {
        let Some(candidate) = next_for_trigger(trigger, filters, now, anchor) else {
            continue;
        };
        if best.map_or(true, |b| candidate.minutes_ahead < b.minutes_ahead) {
            best = Some(candidate);
        }
    }
    best
}

/// Next occurrence of a single trigger that also satisfies `filters`.
pub fn next_for_trigger(
    trigger: &TriggerCondition,
    filters: &[FilterCondition],
    now: WallTime,
    anchor: Option<WallTime>,
) -> Option<Occurrence> {
    match trigger {
        TriggerCondition::Interval(i) => next_interval(i.interval_minutes, filters, now, anchor),
        TriggerCondition::Specific(s) => next_specific(s, filters, now),
    }
}

fn next_interval(
    every: u16,
    filters: &[FilterCondition],
    now: WallTime,
    anchor: Option<WallTime>,
) -> Option<Occurrence> {
    if every == 0 {
        return None;
    }
    let origin = anchor.map(WallTime::minutes).unwrap_or(0);
    // Slots sit at origin + k*every for every k with k*every < 1440; the
    // phase restarts at the origin each day.
    let slots = MINUTES_PER_DAY.div_ceil(every);
    let first = phase_offset(now, anchor) / every + 1;

    // Today's remaining slots, then tomorrow's up to and including now.
    (first..slots)
        .chain(0..first)
        .map(|k| WallTime::from_minutes(origin + k * every))
        .find(|t| filters_pass(filters, *t))
        .map(|t| Occurrence::after(now, t))
}

fn next_specific(s: &SpecificTime, filters: &[FilterCondition], now: WallTime) -> Option<Occurrence> {
    match (s.hour, s.minute) {
        // One fixed slot per day: a filter that rejects it rejects it forever.
        (Some(h), m) => {
            let slot = WallTime::new(h, m.unwrap_or(0));
            filters_pass(filters, slot).then(|| Occurrence::after(now, slot))
        }
        (None, m) => {
            let target = m.unwrap_or(0);
            let start = if now.minute < target {
                now.hour
            } else {
                now.hour + 1
            };
            (0..24)
                .map(|i| WallTime::new((start + i) % 24, target))
                .find(|t| filters_pass(filters, *t))
                .map(|t| Occurrence::after(now, t))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::evaluate_rule;
    use crate::types::TimeCondition;

    fn t(h: u8, m: u8) -> WallTime {
        WallTime::new(h, m)
    }

    #[test]
    fn interval_steps_strictly_forward() {
        let triggers = [TriggerCondition::interval(15)];
        assert_eq!(next_alarm_time(&triggers, &[], t(14, 30), None), Some(t(14, 45)));
        assert_eq!(next_alarm_time(&triggers, &[], t(14, 45), None), Some(t(15, 0)));
        assert_eq!(next_alarm_time(&triggers, &[], t(14, 31), None), Some(t(14, 45)));
    }

    #[test]
    fn interval_wraps_past_midnight() {
        let triggers = [TriggerCondition::interval(30)];
        assert_eq!(next_alarm_time(&triggers, &[], t(23, 30), None), Some(t(0, 0)));
    }

    #[test]
    fn interval_not_dividing_the_day_restarts_at_midnight() {
        // 7 does not divide 1440: the last slot is 23:55, then 00:00.
        let triggers = [TriggerCondition::interval(7)];
        assert_eq!(next_alarm_time(&triggers, &[], t(23, 54), None), Some(t(23, 55)));
        assert_eq!(next_alarm_time(&triggers, &[], t(23, 55), None), Some(t(0, 0)));
    }

    #[test]
    fn interval_skips_filtered_slots() {
        let triggers = [TriggerCondition::interval(60)];
        let filters = [TimeCondition::range(9, 0, 17, 0)];
        assert_eq!(next_alarm_time(&triggers, &filters, t(17, 0), None), Some(t(9, 0)));
        assert_eq!(next_alarm_time(&triggers, &filters, t(3, 10), None), Some(t(9, 0)));
        assert_eq!(next_alarm_time(&triggers, &filters, t(9, 0), None), Some(t(10, 0)));
    }

    #[test]
    fn interval_with_impossible_filter_is_none() {
        let triggers = [TriggerCondition::interval(60)];
        let filters = [TimeCondition::specific(Some(9), Some(30))];
        assert_eq!(next_alarm_time(&triggers, &filters, t(9, 0), None), None);
    }

    #[test]
    fn anchored_interval_follows_activation_minute() {
        let triggers = [TriggerCondition::interval(15)];
        let anchor = Some(t(9, 7));
        assert_eq!(next_alarm_time(&triggers, &[], t(9, 7), anchor), Some(t(9, 22)));
        assert_eq!(next_alarm_time(&triggers, &[], t(9, 10), anchor), Some(t(9, 22)));
        assert_eq!(next_alarm_time(&triggers, &[], t(23, 59), anchor), Some(t(0, 7)));
    }

    #[test]
    fn anchored_interval_revisits_anchor_next_day() {
        // 700 min after the anchor, the next slot would be past midnight of
        // the phase day, so the phase restarts at the anchor.
        let triggers = [TriggerCondition::interval(700)];
        let anchor = Some(t(10, 0));
        assert_eq!(next_alarm_time(&triggers, &[], t(10, 0), anchor), Some(t(21, 40)));
        assert_eq!(next_alarm_time(&triggers, &[], t(21, 40), anchor), Some(t(9, 20)));
        assert_eq!(next_alarm_time(&triggers, &[], t(9, 20), anchor), Some(t(10, 0)));
    }

    #[test]
    fn specific_fixed_time_now_is_a_day_away() {
        let triggers = [TriggerCondition::at(14, 30)];
        let occ = next_occurrence(&triggers, &[], t(14, 30), None).unwrap();
        assert_eq!(occ.time, t(14, 30));
        assert_eq!(occ.minutes_ahead, MINUTES_PER_DAY);
    }

    #[test]
    fn earliest_trigger_wins() {
        let triggers = [TriggerCondition::interval(60), TriggerCondition::at(14, 30)];
        assert_eq!(next_alarm_time(&triggers, &[], t(14, 30), None), Some(t(15, 0)));
        let reversed = [TriggerCondition::at(14, 30), TriggerCondition::interval(60)];
        assert_eq!(next_alarm_time(&reversed, &[], t(14, 10), None), Some(t(14, 30)));
    }

    #[test]
    fn filtered_fixed_time_is_unschedulable() {
        let triggers = [TriggerCondition::at(20, 0)];
        let filters = [TimeCondition::range(9, 0, 17, 0)];
        for m in (0..MINUTES_PER_DAY).step_by(13) {
            assert_eq!(next_alarm_time(&triggers, &filters, WallTime::from_minutes(m), None), None);
        }
    }

    #[test]
    fn unschedulable_trigger_does_not_hide_others() {
        let triggers = [TriggerCondition::at(20, 0), TriggerCondition::at(10, 0)];
        let filters = [TimeCondition::range(9, 0, 17, 0)];
        assert_eq!(next_alarm_time(&triggers, &filters, t(12, 0), None), Some(t(10, 0)));
    }

    #[test]
    fn minute_wildcard_rotates_hours() {
        let triggers = [TriggerCondition::specific(None, Some(45))];
        assert_eq!(next_alarm_time(&triggers, &[], t(10, 30), None), Some(t(10, 45)));
        assert_eq!(next_alarm_time(&triggers, &[], t(10, 45), None), Some(t(11, 45)));
        assert_eq!(next_alarm_time(&triggers, &[], t(23, 50), None), Some(t(0, 45)));

        let filters = [TimeCondition::range(22, 0, 2, 0)];
        assert_eq!(next_alarm_time(&triggers, &filters, t(10, 30), None), Some(t(22, 45)));
    }

    #[test]
    fn hour_wildcards() {
        let hourly = [TriggerCondition::specific(None, None)];
        assert_eq!(next_alarm_time(&hourly, &[], t(10, 0), None), Some(t(11, 0)));
        assert_eq!(next_alarm_time(&hourly, &[], t(10, 59), None), Some(t(11, 0)));

        let daily_at_seven = [TriggerCondition::specific(Some(7), None)];
        assert_eq!(next_alarm_time(&daily_at_seven, &[], t(6, 59), None), Some(t(7, 0)));
        let filters = [TimeCondition::range(8, 0, 9, 0)];
        assert_eq!(next_alarm_time(&daily_at_seven, &filters, t(6, 59), None), None);
    }

    #[test]
    fn no_triggers_is_none() {
        assert_eq!(next_alarm_time(&[], &[], t(12, 0), None), None);
    }

    /// The calculator must agree with a minute-by-minute scan of the evaluator.
    #[test]
    fn agrees_with_exhaustive_scan() {
        let cases: Vec<(Vec<TriggerCondition>, Vec<FilterCondition>, Option<WallTime>)> = vec![
            (vec![TriggerCondition::interval(7)], vec![], None),
            (vec![TriggerCondition::interval(45)], vec![TimeCondition::range(22, 0, 3, 0)], None),
            (vec![TriggerCondition::interval(25)], vec![], Some(t(9, 7))),
            (
                vec![TriggerCondition::interval(90), TriggerCondition::specific(None, Some(20))],
                vec![TimeCondition::interval(10), TimeCondition::range(6, 0, 20, 0)],
                Some(t(13, 33)),
            ),
            (vec![TriggerCondition::specific(Some(5), None)], vec![], None),
            (vec![TriggerCondition::at(23, 59), TriggerCondition::at(0, 1)], vec![], None),
        ];

        for (triggers, filters, anchor) in &cases {
            for now_m in (0..MINUTES_PER_DAY).step_by(11) {
                let now = WallTime::from_minutes(now_m);
                let expected = (1..=MINUTES_PER_DAY).find_map(|d| {
                    let at = WallTime::from_minutes(now_m + d);
                    evaluate_rule(triggers, filters, at, *anchor).then_some(Occurrence {
                        time: at,
                        minutes_ahead: d,
                    })
                });
                assert_eq!(
                    next_occurrence(triggers, filters, now, *anchor),
                    expected,
                    "triggers={triggers:?} filters={filters:?} anchor={anchor:?} now={now}"
                );
            }
        }
    }
}
