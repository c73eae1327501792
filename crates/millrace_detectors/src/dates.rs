//! Arithmetic over the source's 8-digit YYYYMMDD date texts.

use chrono::{Datelike, NaiveDate, Utc};

/// Parse an 8-digit YYYYMMDD date. Returns None for anything else,
/// including the source's zero placeholder dates.
pub fn parse_yyyymmdd(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.len() != 8 || !text.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = text[0..4].parse().ok()?;
    let month: u32 = text[4..6].parse().ok()?;
    let day: u32 = text[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Signed whole days from `a` to `b` (positive when b is later).
pub fn days_between(a: &str, b: &str) -> Option<i64> {
    Some((parse_yyyymmdd(b)? - parse_yyyymmdd(a)?).num_days())
}

/// Days elapsed from `date` to today.
pub fn age_days(date: &str) -> Option<i64> {
    Some((Utc::now().date_naive() - parse_yyyymmdd(date)?).num_days())
}

/// Today as YYYYMMDD text, the source's date rendering.
pub fn today_yyyymmdd() -> String {
    let today = Utc::now().date_naive();
    format!("{:04}{:02}{:02}", today.year(), today.month(), today.day())
}

/// Largest pairwise spread, in days, across a set of date texts.
/// Unparseable dates are skipped; fewer than two valid dates spread zero.
pub fn spread_days<'a>(dates: impl Iterator<Item = &'a str>) -> i64 {
    let parsed: Vec<NaiveDate> = dates.filter_map(parse_yyyymmdd).collect();
    match (parsed.iter().min(), parsed.iter().max()) {
        (Some(min), Some(max)) => (*max - *min).num_days(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_dates_only() {
        assert_eq!(
            parse_yyyymmdd("20260801"),
            NaiveDate::from_ymd_opt(2026, 8, 1)
        );
        assert_eq!(parse_yyyymmdd("0"), None);
        assert_eq!(parse_yyyymmdd(""), None);
        assert_eq!(parse_yyyymmdd("20261332"), None);
        assert_eq!(parse_yyyymmdd("2026-08-01"), None);
    }

    #[test]
    fn day_arithmetic() {
        assert_eq!(days_between("20260801", "20260815"), Some(14));
        assert_eq!(days_between("20260815", "20260801"), Some(-14));
        assert_eq!(days_between("", "20260801"), None);
    }

    #[test]
    fn spread_ignores_unparseable() {
        let dates = ["20260801", "0", "20260805", ""];
        assert_eq!(spread_days(dates.iter().copied()), 4);
        assert_eq!(spread_days(["20260801"].iter().copied()), 0);
        assert_eq!(spread_days([].iter().copied()), 0);
    }
}
