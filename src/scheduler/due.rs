//! Due-date resolution
//!
//! A job config may carry an absolute base `date`, a relative offset
//! (`in: {days: 2}`) and absolute field overrides (`on: {hour: 0}`). The
//! resolver starts from the base (or now) and applies the two sections in the
//! order the config gave them, one unit at a time and in insertion order.
//!
//! Each step behaves like a calendar setter: out-of-range values carry into
//! the next larger field, so day 32 of January becomes February 1, month 13
//! becomes January of the next year and negative values borrow. Fields are
//! read and written in the scheduling time zone.
//!
//! Resolution never fails. Entries that cannot be applied are logged and
//! skipped.

use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeDelta, TimeZone,
    Timelike, Utc,
};
use serde_json::{Map, Value};

use super::options::JobConfig;
use crate::models::truncate_millis;

/// Calendar field addressed by a config key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateUnit {
    Second,
    Minute,
    Hour,
    /// Day of month
    Day,
    /// Month of year, 1-based
    Month,
    Year,
}

impl DateUnit {
    /// Parse a unit name. Singular and plural forms are accepted, as is
    /// `date` for the day of month. Matching ignores ASCII case.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "second" | "seconds" => Some(Self::Second),
            "minute" | "minutes" => Some(Self::Minute),
            "hour" | "hours" => Some(Self::Hour),
            "day" | "days" | "date" | "dates" => Some(Self::Day),
            "month" | "months" => Some(Self::Month),
            "year" | "years" => Some(Self::Year),
            _ => None,
        }
    }
}

/// How a config section changes a calendar field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// `in`: add the amount to the field
    Add,
    /// `on`: overwrite the field
    Set,
}

impl Adjustment {
    /// Config key of the section
    pub fn section(self) -> &'static str {
        match self {
            Self::Add => "in",
            Self::Set => "on",
        }
    }
}

/// Broken-down local time with unbounded fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fields {
    year: i64,
    month: i64,
    day: i64,
    hour: i64,
    minute: i64,
    second: i64,
    nanos: u32,
}

impl Fields {
    fn from_local(local: &NaiveDateTime) -> Self {
        Self {
            year: i64::from(local.year()),
            month: i64::from(local.month()),
            day: i64::from(local.day()),
            hour: i64::from(local.hour()),
            minute: i64::from(local.minute()),
            second: i64::from(local.second()),
            nanos: local.nanosecond(),
        }
    }

    fn get(&self, unit: DateUnit) -> i64 {
        match unit {
            DateUnit::Second => self.second,
            DateUnit::Minute => self.minute,
            DateUnit::Hour => self.hour,
            DateUnit::Day => self.day,
            DateUnit::Month => self.month,
            DateUnit::Year => self.year,
        }
    }

    fn set(&mut self, unit: DateUnit, value: i64) {
        match unit {
            DateUnit::Second => self.second = value,
            DateUnit::Minute => self.minute = value,
            DateUnit::Hour => self.hour = value,
            DateUnit::Day => self.day = value,
            DateUnit::Month => self.month = value,
            DateUnit::Year => self.year = value,
        }
    }

    /// Normalize into a real local time, carrying overflow upwards
    fn compose(&self) -> Option<NaiveDateTime> {
        let months = self.year.checked_mul(12)?.checked_add(self.month.checked_sub(1)?)?;
        let year = i32::try_from(months.div_euclid(12)).ok()?;
        let month = u32::try_from(months.rem_euclid(12) + 1).ok()?;

        let date = NaiveDate::from_ymd_opt(year, month, 1)?
            .checked_add_signed(TimeDelta::try_days(self.day.checked_sub(1)?)?)?;

        let time = TimeDelta::try_hours(self.hour)?
            .checked_add(&TimeDelta::try_minutes(self.minute)?)?
            .checked_add(&TimeDelta::try_seconds(self.second)?)?
            .checked_add(&TimeDelta::nanoseconds(i64::from(self.nanos)))?;

        date.and_hms_opt(0, 0, 0)?.checked_add_signed(time)
    }
}

/// Resolves job configs to absolute due dates
#[derive(Debug, Clone, Copy)]
pub struct DueDateResolver {
    offset: FixedOffset,
}

impl Default for DueDateResolver {
    fn default() -> Self {
        Self::utc()
    }
}

impl DueDateResolver {
    /// Resolver working in the given fixed offset
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Resolver working in UTC
    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    /// Scheduling time zone
    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Due date for `config`, evaluated at `now`
    pub fn resolve(&self, config: &JobConfig, now: DateTime<Utc>) -> DateTime<Utc> {
        self.resolve_parts(config.date, &config.sections(), now)
    }

    /// Due date from a base and a sequence of sections, applied in order
    pub fn resolve_parts(
        &self,
        base: Option<DateTime<Utc>>,
        sections: &[(Adjustment, &Map<String, Value>)],
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let mut current = base.unwrap_or(now);

        for (adjustment, entries) in sections {
            for (key, value) in entries.iter() {
                current = self.apply(current, *adjustment, key, value);
            }
        }

        truncate_millis(current)
    }

    fn apply(
        &self,
        current: DateTime<Utc>,
        adjustment: Adjustment,
        key: &str,
        value: &Value,
    ) -> DateTime<Utc> {
        let section = adjustment.section();
        let Some(unit) = DateUnit::parse(key) else {
            tracing::debug!(section, unit = key, "Ignoring unknown date unit");
            return current;
        };
        let Some(number) = numeric_value(value) else {
            tracing::warn!(section, unit = key, value = %value, "Invalid type was input, ignoring");
            return current;
        };

        let local = current.with_timezone(&self.offset).naive_local();
        let mut fields = Fields::from_local(&local);
        let target = match adjustment {
            Adjustment::Add => fields.get(unit).checked_add(number),
            Adjustment::Set => Some(number),
        };

        let resolved = target.and_then(|target| {
            fields.set(unit, target);
            fields.compose()
        });
        let resolved = resolved.and_then(|naive| {
            self.offset
                .from_local_datetime(&naive)
                .single()
                .map(|at| at.with_timezone(&Utc))
        });

        match resolved {
            Some(at) => at,
            None => {
                tracing::warn!(section, unit = key, value = %value, "Date out of range, ignoring");
                current
            }
        }
    }
}

/// Integer value of a config entry. Numbers and numeric strings are accepted
/// and truncated toward zero; anything else is rejected.
fn numeric_value(value: &Value) -> Option<i64> {
    let float = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(i);
            }
            n.as_f64()?
        }
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(i) = s.parse::<i64>() {
                return Some(i);
            }
            s.parse::<f64>().ok()?
        }
        _ => return None,
    };

    let truncated = float.trunc();
    if truncated.is_finite() && truncated >= i64::MIN as f64 && truncated <= i64::MAX as f64 {
        Some(truncated as i64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn resolve(offset: Value, fields: Value, now: DateTime<Utc>) -> DateTime<Utc> {
        let (offset, fields) = (map(offset), map(fields));
        DueDateResolver::utc().resolve_parts(
            None,
            &[(Adjustment::Add, &offset), (Adjustment::Set, &fields)],
            now,
        )
    }

    #[test]
    fn test_in_days() {
        let now = at(2024, 1, 10, 15, 30, 0);
        assert_eq!(resolve(json!({"days": 2}), json!({}), now), at(2024, 1, 12, 15, 30, 0));
    }

    #[test]
    fn test_on_hour_minute() {
        let now = at(2024, 1, 10, 15, 30, 0);
        assert_eq!(
            resolve(json!({}), json!({"hour": 0, "minute": 0}), now),
            at(2024, 1, 10, 0, 0, 0)
        );
    }

    #[test]
    fn test_no_entries_returns_base() {
        let now = at(2024, 1, 10, 15, 30, 0);
        let base = at(2030, 6, 1, 8, 0, 0);
        let resolver = DueDateResolver::utc();
        assert_eq!(resolver.resolve_parts(Some(base), &[], now), base);
        assert_eq!(resolver.resolve_parts(None, &[], now), now);
    }

    #[test]
    fn test_day_overflow_rolls_month() {
        let now = at(2024, 1, 10, 0, 0, 0);
        assert_eq!(resolve(json!({}), json!({"date": 32}), now), at(2024, 2, 1, 0, 0, 0));
    }

    #[test]
    fn test_month_overflow_rolls_year() {
        let now = at(2024, 1, 10, 0, 0, 0);
        assert_eq!(resolve(json!({}), json!({"month": 13}), now), at(2025, 1, 10, 0, 0, 0));
        assert_eq!(resolve(json!({"months": 12}), json!({}), now), at(2025, 1, 10, 0, 0, 0));
    }

    #[test]
    fn test_month_end_carries_into_next_month() {
        let now = at(2024, 1, 31, 0, 0, 0);
        assert_eq!(resolve(json!({"month": 1}), json!({}), now), at(2024, 3, 2, 0, 0, 0));
    }

    #[test]
    fn test_negative_values_borrow() {
        let now = at(2024, 3, 1, 0, 30, 0);
        assert_eq!(resolve(json!({"minutes": -45}), json!({}), now), at(2024, 2, 29, 23, 45, 0));
        assert_eq!(resolve(json!({}), json!({"day": 0}), now), at(2024, 2, 29, 0, 30, 0));
    }

    #[test]
    fn test_units_apply_in_order() {
        let now = at(2024, 1, 31, 12, 0, 0);
        let out = resolve(json!({"months": 1, "days": 1}), json!({"hour": 6}), now);
        assert_eq!(out, at(2024, 3, 3, 6, 0, 0));
    }

    #[test]
    fn test_sections_follow_config_order() {
        let now = at(2024, 1, 10, 15, 30, 0);
        let resolver = DueDateResolver::utc();

        let on_first = JobConfig::from_value(&json!({"on": {"hour": 0}, "in": {"hours": 5}})).unwrap();
        assert_eq!(resolver.resolve(&on_first, now), at(2024, 1, 10, 5, 30, 0));

        let in_first = JobConfig::from_value(&json!({"in": {"hours": 5}, "on": {"hour": 0}})).unwrap();
        assert_eq!(resolver.resolve(&in_first, now), at(2024, 1, 10, 0, 30, 0));

        let built = JobConfig::new().on("hour", 0).after("hours", 5);
        assert_eq!(resolver.resolve(&built, now), at(2024, 1, 10, 5, 30, 0));
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let now = at(2024, 1, 10, 15, 30, 0);
        let out = resolve(
            json!({"days": "abc", "hours": null, "weeks": 3, "minutes": "15"}),
            json!({"second": true}),
            now,
        );
        assert_eq!(out, at(2024, 1, 10, 15, 45, 0));
    }

    #[test]
    fn test_fractions_truncate_toward_zero() {
        let now = at(2024, 1, 10, 15, 30, 0);
        assert_eq!(resolve(json!({"hours": 1.9}), json!({}), now), at(2024, 1, 10, 16, 30, 0));
        assert_eq!(resolve(json!({"hours": -1.9}), json!({}), now), at(2024, 1, 10, 14, 30, 0));
    }

    #[test]
    fn test_fixed_offset_fields() {
        // 23:30 UTC is 08:30 the next day at +09:00
        let now = at(2024, 1, 10, 23, 30, 0);
        let tokyo = DueDateResolver::new(FixedOffset::east_opt(9 * 3600).unwrap());
        let fields = map(json!({"hour": 0}));
        let out = tokyo.resolve_parts(None, &[(Adjustment::Set, &fields)], now);
        assert_eq!(out, at(2024, 1, 10, 15, 0, 0));
    }

    #[test]
    fn test_out_of_range_year_is_skipped() {
        let now = at(2024, 1, 10, 15, 30, 0);
        assert_eq!(resolve(json!({}), json!({"year": 9_999_999_999i64}), now), now);
    }

    #[test]
    fn test_unit_parse() {
        assert_eq!(DateUnit::parse("Days"), Some(DateUnit::Day));
        assert_eq!(DateUnit::parse("date"), Some(DateUnit::Day));
        assert_eq!(DateUnit::parse("years"), Some(DateUnit::Year));
        assert_eq!(DateUnit::parse("fortnight"), None);
    }

    proptest! {
        #[test]
        fn prop_in_seconds_is_plain_addition(secs in -10_000_000i64..10_000_000) {
            let now = at(2024, 5, 17, 9, 41, 7);
            let out = resolve(json!({"seconds": secs}), json!({}), now);
            prop_assert_eq!(out, now + TimeDelta::seconds(secs));
        }

        #[test]
        fn prop_on_hour_in_range_keeps_date(hour in 0i64..24) {
            let now = at(2024, 5, 17, 9, 41, 7);
            let out = resolve(json!({}), json!({"hour": hour}), now);
            prop_assert_eq!(out.date_naive(), now.date_naive());
            prop_assert_eq!(i64::from(out.hour()), hour);
        }
    }
}
