//! Expansion of recurring series into concrete occurrences.
//!
//! Everything here is pure: the same root, rule, exceptions and window always
//! produce the same occurrences in the same order.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveTime};

use crate::db::models::{CalendarEvent, Frequency, RecurrenceEnd, RecurrenceRule};
use crate::window::DateWindow;

/// Expand `root` over `window`, overlaying `exceptions` (rows whose
/// `parent_event_id` is not `root.id` are ignored).
///
/// Generated occurrences are copies of the root with shifted times,
/// `parent_event_id = root.id` and `original_occurrence_date` set. Modified
/// occurrences are the exception rows themselves, so their own ids survive.
pub fn expand(
    root: &CalendarEvent,
    rule: &RecurrenceRule,
    exceptions: &[CalendarEvent],
    window: &DateWindow,
) -> Vec<CalendarEvent> {
    let local_start = root.start.with_timezone(&window.tz);
    let root_date = local_start.date_naive();
    let root_time = local_start.time();
    let duration = root.end - root.start;

    let rule_end = match rule.end {
        RecurrenceEnd::EndDate { date } => Some(date),
        _ => None,
    };
    let end_date = rule_end.into_iter().chain(root.recurrence_end_date).min();
    let count = match rule.end {
        RecurrenceEnd::Count { count } => Some(count),
        _ => None,
    };

    let overrides: BTreeMap<NaiveDate, &CalendarEvent> = exceptions
        .iter()
        .filter(|e| e.parent_event_id.as_deref() == Some(root.id.as_str()))
        .filter_map(|e| e.original_occurrence_date.map(|d| (d, e)))
        .collect();
    let mut consumed = HashSet::new();

    let mut generated = 0u32;
    let mut occurrences = Vec::new();
    for candidate in Candidates::new(rule, root_date) {
        if candidate > window.to || end_date.is_some_and(|end| candidate > end) {
            break;
        }
        if count.is_some_and(|n| generated >= n) {
            break;
        }
        generated += 1;

        if candidate < window.from {
            continue;
        }

        match overrides.get(&candidate) {
            Some(exception) => {
                consumed.insert(candidate);
                if exception.is_public {
                    occurrences.push((*exception).clone());
                }
            }
            None => occurrences.push(occurrence(root, candidate, root_time, duration, window)),
        }
    }

    // Modifications whose date the rule no longer produces still show up.
    for (date, exception) in &overrides {
        if !consumed.contains(date) && window.contains_date(*date) && exception.is_public {
            occurrences.push((*exception).clone());
        }
    }

    occurrences.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));
    occurrences
}

fn occurrence(
    root: &CalendarEvent,
    date: NaiveDate,
    time: NaiveTime,
    duration: Duration,
    window: &DateWindow,
) -> CalendarEvent {
    // A wall-clock time swallowed by a DST gap keeps the root's UTC time of day.
    let start = window.resolve_local(date, time).unwrap_or_else(|| {
        let root_date = window.local_date(root.start);
        root.start + (date - root_date)
    });

    let mut event = root.clone();
    event.start = start;
    event.end = start + duration;
    event.recurrence_rule = None;
    event.parent_event_id = Some(root.id.clone());
    event.original_occurrence_date = Some(date);
    event
}

/// Candidate dates of a rule in ascending order, starting at the root's date.
struct Candidates<'a> {
    rule: &'a RecurrenceRule,
    root_date: NaiveDate,
    step: u32,
    pending: VecDeque<NaiveDate>,
    exhausted: bool,
}

impl<'a> Candidates<'a> {
    fn new(rule: &'a RecurrenceRule, root_date: NaiveDate) -> Self {
        Self {
            rule,
            root_date,
            step: 0,
            pending: VecDeque::new(),
            exhausted: false,
        }
    }

    fn weekdays(&self) -> Vec<u32> {
        let mut days: Vec<u32> = match &self.rule.days_of_week {
            Some(days) if !days.is_empty() => days.iter().map(|d| u32::from(*d)).collect(),
            _ => vec![self.root_date.weekday().num_days_from_sunday()],
        };
        days.sort_unstable();
        days.dedup();
        days
    }

    /// Fill `pending` with the dates of the next step. `false` once dates run out.
    fn fill(&mut self) -> bool {
        let interval = self.rule.interval.max(1);
        let Some(offset) = self.step.checked_mul(interval) else {
            return false;
        };
        self.step += 1;

        match self.rule.frequency {
            Frequency::Daily => match self.root_date.checked_add_signed(Duration::days(i64::from(offset))) {
                Some(date) => self.pending.push_back(date),
                None => return false,
            },
            Frequency::Weekly => {
                let week_start = self.root_date
                    - Duration::days(i64::from(self.root_date.weekday().num_days_from_sunday()));
                let Some(block_start) =
                    week_start.checked_add_signed(Duration::weeks(i64::from(offset)))
                else {
                    return false;
                };
                for day in self.weekdays() {
                    let date = block_start + Duration::days(i64::from(day));
                    if date >= self.root_date {
                        self.pending.push_back(date);
                    }
                }
            }
            Frequency::Monthly => {
                let day = self.rule.day_of_month.unwrap_or(self.root_date.day());
                let Some(first) = first_of_month(self.root_date).checked_add_months(Months::new(offset))
                else {
                    return false;
                };
                let date = clamped(first.year(), first.month(), day);
                if date >= self.root_date {
                    self.pending.push_back(date);
                }
            }
            Frequency::Yearly => {
                let month = self.rule.month_of_year.unwrap_or(self.root_date.month());
                let day = self.rule.day_of_month.unwrap_or(self.root_date.day());
                let Some(year) = i32::try_from(offset)
                    .ok()
                    .and_then(|o| self.root_date.year().checked_add(o))
                else {
                    return false;
                };
                if NaiveDate::from_ymd_opt(year, month, 1).is_none() {
                    return false;
                }
                let date = clamped(year, month, day);
                if date >= self.root_date {
                    self.pending.push_back(date);
                }
            }
        }
        true
    }
}

impl Iterator for Candidates<'_> {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        // A step can legitimately produce nothing (e.g. the root's own week when every
        // listed weekday precedes it), so keep stepping until something comes out.
        while self.pending.is_empty() && !self.exhausted {
            if !self.fill() {
                self.exhausted = true;
            }
        }
        self.pending.pop_front()
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// `year-month-day`, with `day` pulled back to the month's last day when it overflows.
fn clamped(year: i32, month: u32, day: u32) -> NaiveDate {
    let day = day.clamp(1, days_in_month(year, month));
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}
