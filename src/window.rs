//! The reporting window: the UTC calendar day preceding an invocation.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use std::fmt;

/// A half-open `[start, end)` interval of exactly one UTC day.
///
/// `end` is midnight UTC of the invocation date and doubles as the
/// timestamp of every point published for the window.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Computes the window for "yesterday" relative to `now`.
    pub fn previous_day(now: DateTime<Utc>) -> Self {
        let end = Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN));
        TimeWindow {
            start: end - Duration::days(1),
            end,
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::TimeWindow;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_mid_day() {
        let window = TimeWindow::previous_day(Utc.with_ymd_and_hms(2023, 10, 8, 22, 15, 25).unwrap());
        assert_eq!(window.start, Utc.with_ymd_and_hms(2023, 10, 7, 0, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2023, 10, 8, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_exactly_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let window = TimeWindow::previous_day(now);
        assert_eq!(window.end, now);
        // 2024 is a leap year.
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_year_boundary() {
        let window = TimeWindow::previous_day(Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 59).unwrap());
        assert_eq!(window.start, Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_window_is_one_day() {
        let mut now = Utc.with_ymd_and_hms(2023, 1, 1, 3, 7, 11).unwrap();
        for _ in 0..500 {
            let window = TimeWindow::previous_day(now);
            assert_eq!(window.end - window.start, Duration::days(1));
            assert_eq!(window.end.date_naive(), now.date_naive());
            assert!(window.end <= now);
            now += Duration::minutes(1013);
        }
    }

    #[test]
    fn test_display() {
        let window = TimeWindow::previous_day(Utc.with_ymd_and_hms(2023, 10, 8, 12, 0, 0).unwrap());
        assert_eq!(
            window.to_string(),
            "[2023-10-07T00:00:00+00:00, 2023-10-08T00:00:00+00:00)"
        );
    }
}
