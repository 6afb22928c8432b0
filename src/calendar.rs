//! Working-day calendars for net leave computation
use crate::types::CalendarDate;
use chrono::{Datelike, Weekday};
use std::collections::BTreeSet;

pub trait WorkCalendar: Send + Sync {
    fn is_workday(&self, date: CalendarDate) -> bool;

    /// Working days in the inclusive range. Weekends and holidays do not
    /// consume leave balance.
    fn net_days(&self, start: CalendarDate, end: CalendarDate) -> u32 {
        start
            .naive()
            .iter_days()
            .take_while(|d| *d <= end.naive())
            .filter(|d| self.is_workday(CalendarDate::from(*d)))
            .count() as u32
    }
}

/// Calendar with a fixed weekend and an explicit holiday list.
pub struct WeekendCalendar {
    weekend: Vec<Weekday>,
    holidays: BTreeSet<CalendarDate>,
}

impl WeekendCalendar {
    pub fn new() -> Self {
        Self {
            weekend: vec![Weekday::Sat, Weekday::Sun],
            holidays: BTreeSet::new(),
        }
    }
    pub fn set_weekend(mut self, days: &[Weekday]) -> Self {
        self.weekend = days.to_vec();
        self
    }
    pub fn add_holiday(mut self, date: CalendarDate) -> Self {
        self.holidays.insert(date);
        self
    }
}

impl Default for WeekendCalendar {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkCalendar for WeekendCalendar {
    fn is_workday(&self, date: CalendarDate) -> bool {
        !self.weekend.contains(&date.naive().weekday()) && !self.holidays.contains(&date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2025-01-06 is a Monday
    #[test]
    fn net_days_skips_weekends() {
        let cal = WeekendCalendar::new();
        let start = CalendarDate::new(2025, 1, 6);
        let end = CalendarDate::new(2025, 1, 12);

        assert_eq!(cal.net_days(start, end), 5);
    }

    #[test]
    fn net_days_skips_holidays() {
        let cal = WeekendCalendar::new().add_holiday(CalendarDate::new(2025, 1, 8));
        let start = CalendarDate::new(2025, 1, 6);
        let end = CalendarDate::new(2025, 1, 10);

        assert_eq!(cal.net_days(start, end), 4);
    }

    #[test]
    fn net_days_single_weekend_day_is_zero() {
        let cal = WeekendCalendar::new();
        let sat = CalendarDate::new(2025, 1, 11);

        assert_eq!(cal.net_days(sat, sat), 0);
    }

    #[test]
    fn custom_weekend() {
        let cal = WeekendCalendar::new().set_weekend(&[Weekday::Fri, Weekday::Sat]);
        let fri = CalendarDate::new(2025, 1, 10);
        let sun = CalendarDate::new(2025, 1, 12);

        assert_eq!(cal.net_days(fri, sun), 1);
    }
}
