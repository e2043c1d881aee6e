//! Schedule configuration and execution-window evaluation.
//!
//! A schedule carries one optional `HH:MM-HH:MM` interval per weekday.
//! Intervals whose start is later than their end cross midnight:
//! `22:00-06:00` is open from 22:00 until 05:59 the next morning.

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use tiering_core::{Result, TieringError};

/// Default number of items dispatched between two periodic checkpoints.
pub const DEFAULT_CHECKPOINT_FREQUENCY: u32 = 5;

/// A named execution schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub schedule_name: String,
    pub enabled: bool,
    pub windows: WeeklyWindows,
    /// Rest between two batches.
    pub batch_cooldown_minutes: u32,
    pub enable_checkpointing: bool,
    pub checkpoint_frequency: u32,
}

impl ScheduleConfig {
    /// A schedule with no windows configured (never open) and default tuning.
    pub fn new(name: &str) -> Self {
        Self {
            schedule_name: name.to_string(),
            enabled: true,
            windows: WeeklyWindows::default(),
            batch_cooldown_minutes: 0,
            enable_checkpointing: false,
            checkpoint_frequency: DEFAULT_CHECKPOINT_FREQUENCY,
        }
    }

    /// Builder-style: set the window for one weekday.
    pub fn with_window(mut self, day: Weekday, hours: &str) -> Self {
        self.windows.set(day, Some(hours.to_string()));
        self
    }

    /// Same window every day of the week.
    pub fn every_day(mut self, hours: &str) -> Self {
        for day in ALL_WEEKDAYS {
            self.windows.set(day, Some(hours.to_string()));
        }
        self
    }

    pub fn cooldown(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.batch_cooldown_minutes) * 60)
    }

    /// Checkpoint interval, never zero.
    pub fn checkpoint_every(&self) -> usize {
        self.checkpoint_frequency.max(1) as usize
    }

    /// Reject windows that do not parse.
    pub fn validate(&self) -> Result<()> {
        for day in ALL_WEEKDAYS {
            if let Some(hours) = self.windows.get(day) {
                TimeWindow::parse(hours)?;
            }
        }
        Ok(())
    }
}

pub const ALL_WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Per-weekday interval strings; `None` means no execution that day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeeklyWindows {
    pub monday: Option<String>,
    pub tuesday: Option<String>,
    pub wednesday: Option<String>,
    pub thursday: Option<String>,
    pub friday: Option<String>,
    pub saturday: Option<String>,
    pub sunday: Option<String>,
}

impl WeeklyWindows {
    pub fn get(&self, day: Weekday) -> Option<&str> {
        let slot = match day {
            Weekday::Mon => &self.monday,
            Weekday::Tue => &self.tuesday,
            Weekday::Wed => &self.wednesday,
            Weekday::Thu => &self.thursday,
            Weekday::Fri => &self.friday,
            Weekday::Sat => &self.saturday,
            Weekday::Sun => &self.sunday,
        };
        slot.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn set(&mut self, day: Weekday, hours: Option<String>) {
        let slot = match day {
            Weekday::Mon => &mut self.monday,
            Weekday::Tue => &mut self.tuesday,
            Weekday::Wed => &mut self.wednesday,
            Weekday::Thu => &mut self.thursday,
            Weekday::Fri => &mut self.friday,
            Weekday::Sat => &mut self.saturday,
            Weekday::Sun => &mut self.sunday,
        };
        *slot = hours;
    }
}

/// A parsed time-of-day interval, in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: u32,
    pub end: u32,
}

impl TimeWindow {
    /// Parse `HH:MM-HH:MM`.
    pub fn parse(hours: &str) -> Result<Self> {
        let invalid = || TieringError::InvalidWindow(hours.to_string());
        let (start, end) = hours.trim().split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            start: parse_minutes(start).ok_or_else(invalid)?,
            end: parse_minutes(end).ok_or_else(invalid)?,
        })
    }

    pub fn crosses_midnight(&self) -> bool {
        self.start > self.end
    }

    /// Whether `minute` (since midnight) falls inside the window.
    pub fn contains(&self, minute: u32) -> bool {
        if self.crosses_midnight() {
            minute >= self.start || minute < self.end
        } else {
            self.start <= minute && minute < self.end
        }
    }
}

fn parse_minutes(hhmm: &str) -> Option<u32> {
    let (h, m) = hhmm.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

/// The interval configured for `now`'s weekday, or `None` when closed today.
pub fn today_hours(schedule: &ScheduleConfig, now: NaiveDateTime) -> Option<&str> {
    schedule.windows.get(now.weekday())
}

/// Whether execution is permitted at `now`.
pub fn in_window(schedule: &ScheduleConfig, now: NaiveDateTime) -> bool {
    let Some(hours) = today_hours(schedule, now) else {
        return false;
    };
    match TimeWindow::parse(hours) {
        Ok(window) => window.contains(now.hour() * 60 + now.minute()),
        Err(e) => {
            tracing::warn!("⚠️ Schedule '{}': {e}; treating as closed", schedule.schedule_name);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    // 2026-10-19 is a Monday.
    fn monday(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_parse() {
        assert_eq!(TimeWindow::parse("02:00-04:30").unwrap(), TimeWindow { start: 120, end: 270 });
        assert_eq!(TimeWindow::parse(" 22:00 - 06:00 ").unwrap(), TimeWindow { start: 1320, end: 360 });
        assert!(TimeWindow::parse("02:00").is_err());
        assert!(TimeWindow::parse("24:00-01:00").is_err());
        assert!(TimeWindow::parse("02:60-03:00").is_err());
        assert!(TimeWindow::parse("ab:cd-01:00").is_err());
    }

    #[test]
    fn test_same_day_window_is_half_open() {
        let s = ScheduleConfig::new("s").with_window(Weekday::Mon, "02:00-04:00");
        assert!(!in_window(&s, monday(1, 59)));
        assert!(in_window(&s, monday(2, 0)));
        assert!(in_window(&s, monday(3, 59)));
        assert!(!in_window(&s, monday(4, 0)));
    }

    #[test]
    fn test_overnight_window() {
        let s = ScheduleConfig::new("s").with_window(Weekday::Mon, "22:00-06:00");
        assert!(in_window(&s, monday(23, 30)));
        assert!(in_window(&s, monday(5, 0)));
        assert!(in_window(&s, monday(22, 0)));
        assert!(!in_window(&s, monday(6, 0)));
        assert!(!in_window(&s, monday(12, 0)));
    }

    #[test]
    fn test_exhaustive_against_definition() {
        for hours in ["01:15-03:45", "22:00-06:00", "00:00-23:59", "23:00-00:30"] {
            let s = ScheduleConfig::new("s").with_window(Weekday::Mon, hours);
            let w = TimeWindow::parse(hours).unwrap();
            for minute in 0..24 * 60 {
                let expected = if w.start > w.end {
                    minute >= w.start || minute < w.end
                } else {
                    w.start <= minute && minute < w.end
                };
                assert_eq!(in_window(&s, monday(minute / 60, minute % 60)), expected, "{hours} @ {minute}");
            }
        }
    }

    #[test]
    fn test_no_window_today_is_closed() {
        let s = ScheduleConfig::new("s").with_window(Weekday::Tue, "00:00-23:59");
        assert_eq!(today_hours(&s, monday(12, 0)), None);
        assert!(!in_window(&s, monday(12, 0)));
    }

    #[test]
    fn test_blank_and_malformed_are_closed() {
        let mut s = ScheduleConfig::new("s");
        s.windows.set(Weekday::Mon, Some("   ".into()));
        assert_eq!(today_hours(&s, monday(3, 0)), None);

        s.windows.set(Weekday::Mon, Some("garbage".into()));
        assert!(!in_window(&s, monday(3, 0)));
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_empty_window_never_opens() {
        let s = ScheduleConfig::new("s").with_window(Weekday::Mon, "03:00-03:00");
        assert!(!in_window(&s, monday(3, 0)));
        assert!(!in_window(&s, monday(15, 0)));
    }

    #[test]
    fn test_tuning_helpers() {
        let mut s = ScheduleConfig::new("s").every_day("00:00-01:00");
        s.batch_cooldown_minutes = 2;
        s.checkpoint_frequency = 0;
        assert_eq!(s.cooldown(), std::time::Duration::from_secs(120));
        assert_eq!(s.checkpoint_every(), 1);
        assert!(s.validate().is_ok());
    }
}
