use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// A closed range of calendar days `[from, to]` in a time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub tz: Tz,
}

impl DateWindow {
    pub fn new(from: NaiveDate, to: NaiveDate, tz: Tz) -> Self {
        Self { from, to, tz }
    }

    /// `today .. today + days` in the given zone.
    pub fn starting(today: NaiveDate, days: i64, tz: Tz) -> Self {
        Self::new(today, today + Duration::days(days), tz)
    }

    /// Local midnight at the start of `from`, as UTC.
    pub fn start_utc(&self) -> DateTime<Utc> {
        self.local_midnight(self.from)
    }

    /// Local midnight after `to` (exclusive bound), as UTC.
    pub fn end_utc(&self) -> DateTime<Utc> {
        self.local_midnight(self.to + Duration::days(1))
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        date >= self.from && date <= self.to
    }

    /// Whether `[start, end)` overlaps the window. Zero-length events count when they start inside.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let (lo, hi) = (self.start_utc(), self.end_utc());
        if end <= start {
            return start >= lo && start < hi;
        }
        start < hi && end > lo
    }

    /// Calendar day of an instant in the window's zone.
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    /// Convert a local wall-clock time to UTC, resolving DST ambiguity to the earlier instant.
    pub fn resolve_local(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        self.tz
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn local_midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        self.resolve_local(date, NaiveTime::MIN)
            .unwrap_or_else(|| date.and_time(NaiveTime::MIN).and_utc())
    }
}
