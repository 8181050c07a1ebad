//! Rendering helpers for the daily attendance report.

use chrono::NaiveDateTime;

/// Shown in place of a missing time or duration.
pub const PLACEHOLDER: &str = "-";

/// Worked time as whole hours and minutes, or [`PLACEHOLDER`] while still checked in.
pub fn format_duration(check_in: NaiveDateTime, check_out: Option<NaiveDateTime>) -> String {
    let Some(check_out) = check_out else {
        return PLACEHOLDER.to_string();
    };
    let total_minutes = (check_out - check_in).num_minutes();
    format!("{} h {} min", total_minutes / 60, total_minutes % 60)
}

/// `HH:MM`, or [`PLACEHOLDER`].
pub fn format_time(time: Option<NaiveDateTime>) -> String {
    time.map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|| PLACEHOLDER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_duration_placeholder_when_open() {
        assert_eq!(format_duration(at(8, 0, 0), None), "-");
    }

    #[test]
    fn test_duration_hours_and_minutes() {
        assert_eq!(format_duration(at(8, 15, 0), Some(at(17, 45, 30))), "9 h 30 min");
    }

    #[test]
    fn test_duration_truncates_seconds() {
        assert_eq!(format_duration(at(8, 0, 0), Some(at(8, 0, 59))), "0 h 0 min");
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(Some(at(7, 5, 0))), "07:05");
        assert_eq!(format_time(None), "-");
    }
}
