//! iCalendar rendering of merged events for widgets and other calendar apps.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use icalendar::{Calendar, Component, EventLike};

use crate::merge::{DisplayEvent, MergedEventSet};

/// Render the widget slice of a merged set as a VCALENDAR.
pub fn widget_calendar(set: &MergedEventSet, now: DateTime<Utc>, limit: usize) -> String {
    render_calendar(&set.widget_slice_at(now, limit), set.window().tz, now)
}

/// Render events as a VCALENDAR document, stamped with `stamp`. All-day dates are
/// taken in `tz`.
pub fn render_calendar(events: &[DisplayEvent], tz: Tz, stamp: DateTime<Utc>) -> String {
    let stamp = stamp.format("%Y%m%dT%H%M%SZ").to_string();
    let mut cal = Calendar::new();

    for display in events {
        let event = &display.event;
        let mut ics_event = icalendar::Event::new();
        ics_event.uid(&uid(display));
        ics_event.summary(&event.title);
        ics_event.add_property("DTSTAMP", &stamp);

        if event.all_day {
            let start = event.start.with_timezone(&tz).date_naive();
            let end = event
                .end
                .with_timezone(&tz)
                .date_naive()
                .max(start + Duration::days(1));
            ics_event.starts(start);
            ics_event.ends(end);
        } else {
            ics_event.starts(event.start);
            ics_event.ends(event.end);
        }

        if let Some(notes) = &event.notes {
            ics_event.description(notes);
        }
        if let Some(location) = &event.location {
            ics_event.location(location);
        }
        if display.shared_count > 1 {
            ics_event.add_property("X-CALSYNC-SHARED-COUNT", display.shared_count.to_string());
        }

        cal.push(ics_event.done());
    }

    cal.done().to_string()
}

/// Occurrences of one series share the root id, so their date goes into the UID.
fn uid(display: &DisplayEvent) -> String {
    match display.event.original_occurrence_date {
        Some(date) => format!("{}-{}@calsync", display.event.id, date.format("%Y%m%d")),
        None => format!("{}@calsync", display.event.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{MergeInputs, Viewer, merge};
    use crate::testutil::{at, date, group_event};
    use crate::window::DateWindow;

    fn display(shared_count: usize) -> DisplayEvent {
        let mut event = group_event("e1", "alice", "g1", "Dinner", 5, 19);
        event.location = Some("Luigi's".into());
        DisplayEvent {
            event,
            shared_count,
        }
    }

    /// Undo RFC 5545 line folding.
    fn unfold(ics: &str) -> String {
        ics.replace("\r\n ", "").replace("\r\n\t", "")
    }

    #[test]
    fn test_render_calendar() {
        let ics = unfold(&render_calendar(&[display(1)], Tz::UTC, at(2026, 3, 1, 0)));

        assert!(ics.starts_with("BEGIN:VCALENDAR"));
        assert!(ics.trim_end().ends_with("END:VCALENDAR"));
        assert_eq!(ics.matches("BEGIN:VEVENT").count(), 1);
        assert!(ics.contains("UID:e1@calsync"));
        assert!(ics.contains("DTSTAMP:20260301T000000Z"));
        assert!(ics.contains("DTSTART:20260305T190000Z"));
        assert!(ics.contains("DTEND:20260305T200000Z"));
        assert!(ics.contains("SUMMARY:Dinner"));
        assert!(ics.contains("LOCATION:Luigi's"));
        assert!(!ics.contains("DESCRIPTION"));
        assert!(!ics.contains("X-CALSYNC-SHARED-COUNT"));
    }

    #[test]
    fn test_shared_count_and_occurrence_uid() {
        let mut shared = display(3);
        shared.event.original_occurrence_date = Some(date(2026, 3, 5));
        let ics = unfold(&render_calendar(&[shared], Tz::UTC, at(2026, 3, 1, 0)));
        assert!(ics.contains("UID:e1-20260305@calsync"));
        assert!(ics.contains("X-CALSYNC-SHARED-COUNT:3"));
    }

    #[test]
    fn test_all_day_uses_dates() {
        let mut all_day = display(1);
        all_day.event.all_day = true;
        all_day.event.start = at(2026, 3, 5, 0);
        all_day.event.end = at(2026, 3, 5, 0);
        let ics = unfold(&render_calendar(&[all_day], Tz::UTC, at(2026, 3, 1, 0)));
        assert!(ics.contains("DTSTART;VALUE=DATE:20260305"));
        assert!(ics.contains("DTEND;VALUE=DATE:20260306"));
    }

    #[test]
    fn test_all_day_dates_follow_zone() {
        let mut all_day = display(1);
        all_day.event.all_day = true;
        // Midnight of Mar 5 and Mar 6 in Tokyo.
        all_day.event.start = at(2026, 3, 4, 15);
        all_day.event.end = at(2026, 3, 5, 15);
        let ics = unfold(&render_calendar(
            &[all_day],
            chrono_tz::Asia::Tokyo,
            at(2026, 3, 1, 0),
        ));
        assert!(ics.contains("DTSTART;VALUE=DATE:20260305"));
        assert!(ics.contains("DTEND;VALUE=DATE:20260306"));
    }

    #[test]
    fn test_widget_calendar_strips_details() {
        let mut first = group_event("a", "alice", "g1", "Breakfast", 2, 8);
        first.notes = Some("bring coffee".into());
        let inputs = MergeInputs {
            group_events: vec![first, group_event("b", "alice", "g1", "Lunch", 2, 12)],
            ..Default::default()
        };
        let window = DateWindow::new(date(2026, 3, 1), date(2026, 3, 14), Tz::UTC);
        let viewer = Viewer::new("alice", "g1", ["alice".to_string()]);
        let set = merge(&inputs, &viewer, &window);

        let ics = unfold(&widget_calendar(&set, at(2026, 3, 1, 0), 1));
        assert_eq!(ics.matches("BEGIN:VEVENT").count(), 1);
        assert!(ics.contains("SUMMARY:Breakfast"));
        assert!(!ics.contains("bring coffee"));
    }
}
