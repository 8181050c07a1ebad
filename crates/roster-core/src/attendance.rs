//! Check-in / check-out policy.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Local hour at or after which a check-in is late.
pub const DEFAULT_LATE_CUTOFF_HOUR: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

impl AttendanceStatus {
    /// Status fixed at check-in from the local time of day.
    pub fn for_check_in(at: NaiveDateTime, late_cutoff_hour: u32) -> Self {
        if at.hour() >= late_cutoff_hour {
            AttendanceStatus::Late
        } else {
            AttendanceStatus::Present
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Absent => "absent",
        }
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(AttendanceStatus::Present),
            "late" => Ok(AttendanceStatus::Late),
            "absent" => Ok(AttendanceStatus::Absent),
            other => Err(format!("unknown attendance status '{other}'")),
        }
    }
}

/// What a recognition should do to the attendance log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceAction {
    CheckIn,
    CheckOut,
}

impl AttendanceAction {
    /// Check out when an open record exists for today, otherwise check in.
    pub fn decide(has_open_record_today: bool) -> Self {
        if has_open_record_today {
            AttendanceAction::CheckOut
        } else {
            AttendanceAction::CheckIn
        }
    }
}

/// Half-open `[start, end)` bounds covering one calendar day.
pub fn day_bounds(day: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
    let start = day.and_time(NaiveTime::MIN);
    (start, start + Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_status_before_cutoff_is_present() {
        assert_eq!(AttendanceStatus::for_check_in(at(8, 59), 9), AttendanceStatus::Present);
    }

    #[test]
    fn test_status_at_cutoff_is_late() {
        assert_eq!(AttendanceStatus::for_check_in(at(9, 0), 9), AttendanceStatus::Late);
        assert_eq!(AttendanceStatus::for_check_in(at(17, 30), 9), AttendanceStatus::Late);
    }

    #[test]
    fn test_decide() {
        assert_eq!(AttendanceAction::decide(true), AttendanceAction::CheckOut);
        assert_eq!(AttendanceAction::decide(false), AttendanceAction::CheckIn);
    }

    #[test]
    fn test_day_bounds_cover_last_second() {
        let (start, end) = day_bounds(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        let last = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_milli_opt(23, 59, 59, 999)
            .unwrap();
        assert!(start <= last && last < end);
        assert_eq!(end.date(), NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
    }

    #[test]
    fn test_status_roundtrip_str() {
        for s in [AttendanceStatus::Present, AttendanceStatus::Late, AttendanceStatus::Absent] {
            assert_eq!(s.as_str().parse::<AttendanceStatus>().unwrap(), s);
        }
    }
}
