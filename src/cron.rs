//! Cron translation and evaluation.
//!
//! Clients either submit a raw 6-field expression (`sec min hour dom month
//! dow`) or a structured recurrence descriptor; both canonicalize to the
//! same form. Next-fire computation is zone-aware, so DST gaps skip a
//! fire and fall-back repeats fire once at the earlier offset.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::SchedulerError;

/// Structured recurrence options accepted by the API. Options outside the
/// recognized set are ignored upstream; precedence here is hourly interval,
/// then days of week, then days of month, then every day.
#[derive(Debug, Clone, Default)]
pub struct RecurrenceSpec {
    /// Raw expression; wins over the structured fields when present.
    pub raw_expression: Option<String>,
    /// 1 = Monday .. 7 = Sunday.
    pub days_of_week: Option<Vec<u8>>,
    pub days_of_month: Option<Vec<u8>>,
    pub hourly_interval: Option<u32>,
    pub hour: Option<u8>,
    pub minute: Option<u8>,
}

/// Weekday names keyed 1 = Monday .. 7 = Sunday. Numeric weekdays differ
/// between cron dialects, so the canonical form always uses names.
const DAY_NAMES: [&str; 7] = ["MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Parse and validate a cron expression.
pub fn parse(expression: &str) -> Result<Schedule, SchedulerError> {
    Schedule::from_str(expression)
        .map_err(|e| SchedulerError::InvalidCron(format!("{expression}: {e}")))
}

/// Canonicalize a recurrence descriptor into a 6-field cron expression.
pub fn canonical_expression(spec: &RecurrenceSpec) -> Result<String, SchedulerError> {
    if let Some(raw) = &spec.raw_expression {
        parse(raw)?;
        return Ok(raw.trim().to_string());
    }

    let hour = spec.hour.unwrap_or(0);
    let minute = spec.minute.unwrap_or(0);
    if hour > 23 {
        return Err(SchedulerError::Validation(format!(
            "recurring_time_hour must be 0-23, got {hour}"
        )));
    }
    if minute > 59 {
        return Err(SchedulerError::Validation(format!(
            "recurring_time_minute must be 0-59, got {minute}"
        )));
    }

    let expression = if let Some(interval) = spec.hourly_interval {
        if interval < 1 {
            return Err(SchedulerError::Validation(
                "hourly_interval must be >= 1".to_string(),
            ));
        }
        format!("0 {minute} 0/{interval} * * ?")
    } else if let Some(days) = spec.days_of_week.as_ref().filter(|d| !d.is_empty()) {
        let names = days
            .iter()
            .map(|d| {
                DAY_NAMES
                    .get((*d as usize).wrapping_sub(1))
                    .copied()
                    .ok_or_else(|| {
                        SchedulerError::Validation(format!(
                            "days_of_week entries must be 1-7, got {d}"
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?
            .join(",");
        format!("0 {minute} {hour} ? * {names}")
    } else if let Some(days) = spec.days_of_month.as_ref().filter(|d| !d.is_empty()) {
        for d in days {
            if !(1..=31).contains(d) {
                return Err(SchedulerError::Validation(format!(
                    "days_of_month entries must be 1-31, got {d}"
                )));
            }
        }
        let list = days
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("0 {minute} {hour} {list} * ?")
    } else {
        format!("0 {minute} {hour} * * ?")
    };

    // Every emitted form must be acceptable back on the raw path.
    parse(&expression)?;
    Ok(expression)
}

/// Next instant strictly after `after` satisfying `schedule` in `zone`.
///
/// Returns `None` when the schedule has no future occurrence.
pub fn next_after(after: DateTime<Utc>, schedule: &Schedule, zone: Tz) -> Option<DateTime<Utc>> {
    let local = after.with_timezone(&zone);
    schedule.after(&local).next().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn spec() -> RecurrenceSpec {
        RecurrenceSpec::default()
    }

    #[test]
    fn raw_expression_wins_and_is_validated() {
        let s = RecurrenceSpec {
            raw_expression: Some("0 */5 * * * *".to_string()),
            days_of_week: Some(vec![1]),
            ..spec()
        };
        assert_eq!(canonical_expression(&s).unwrap(), "0 */5 * * * *");

        let bad = RecurrenceSpec {
            raw_expression: Some("not a cron".to_string()),
            ..spec()
        };
        assert!(matches!(
            canonical_expression(&bad),
            Err(SchedulerError::InvalidCron(_))
        ));
    }

    #[test]
    fn five_field_unix_cron_is_rejected() {
        let s = RecurrenceSpec {
            raw_expression: Some("*/5 * * * *".to_string()),
            ..spec()
        };
        assert!(canonical_expression(&s).is_err());
    }

    #[test]
    fn days_of_week_emit_named_days() {
        let s = RecurrenceSpec {
            days_of_week: Some(vec![1, 3, 5]),
            hour: Some(9),
            minute: Some(0),
            ..spec()
        };
        assert_eq!(canonical_expression(&s).unwrap(), "0 0 9 ? * MON,WED,FRI");
    }

    #[test]
    fn days_of_month_emission() {
        let s = RecurrenceSpec {
            days_of_month: Some(vec![1, 15]),
            hour: Some(8),
            minute: Some(30),
            ..spec()
        };
        assert_eq!(canonical_expression(&s).unwrap(), "0 30 8 1,15 * ?");
    }

    #[test]
    fn hourly_interval_emission() {
        let s = RecurrenceSpec {
            hourly_interval: Some(2),
            minute: Some(15),
            ..spec()
        };
        assert_eq!(canonical_expression(&s).unwrap(), "0 15 0/2 * * ?");
    }

    #[test]
    fn default_is_daily_at_midnight() {
        assert_eq!(canonical_expression(&spec()).unwrap(), "0 0 0 * * ?");
    }

    #[test]
    fn descriptor_range_checks() {
        let bad_dow = RecurrenceSpec {
            days_of_week: Some(vec![8]),
            ..spec()
        };
        assert!(matches!(
            canonical_expression(&bad_dow),
            Err(SchedulerError::Validation(_))
        ));

        let bad_dom = RecurrenceSpec {
            days_of_month: Some(vec![0]),
            ..spec()
        };
        assert!(canonical_expression(&bad_dom).is_err());

        let bad_hour = RecurrenceSpec {
            hour: Some(24),
            ..spec()
        };
        assert!(canonical_expression(&bad_hour).is_err());

        let bad_interval = RecurrenceSpec {
            hourly_interval: Some(0),
            ..spec()
        };
        assert!(canonical_expression(&bad_interval).is_err());
    }

    #[test]
    fn next_after_is_strictly_after() {
        let schedule = parse("0 * * * * *").unwrap();
        let tz: Tz = "UTC".parse().unwrap();
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap();
        let next = next_after(at, &schedule, tz).unwrap();
        assert!(next > at);
        assert_eq!(next, Utc.with_ymd_and_hms(2030, 1, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn next_after_is_monotone() {
        let schedule = parse("0 0 9 ? * MON,WED,FRI").unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        let t1 = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2030, 2, 1, 0, 0, 0).unwrap();
        let n1 = next_after(t1, &schedule, tz).unwrap();
        let n2 = next_after(t2, &schedule, tz).unwrap();
        assert!(n1 <= n2);
    }

    #[test]
    fn named_days_fire_on_the_right_weekday() {
        // 2030-01-01 is a Tuesday; the next MON/WED/FRI slot is Wednesday.
        let schedule = parse("0 0 9 ? * MON,WED,FRI").unwrap();
        let tz: Tz = "UTC".parse().unwrap();
        let after = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let next = next_after(after, &schedule, tz).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2030, 1, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn spring_forward_skips_the_missing_slot() {
        // 02:30 local does not exist on 2030-03-10 in New York.
        let schedule = parse("0 30 2 * * ?").unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        let after = Utc.with_ymd_and_hms(2030, 3, 9, 12, 0, 0).unwrap();
        let next = next_after(after, &schedule, tz).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2030, 3, 11, 6, 30, 0).unwrap());
    }

    #[test]
    fn fall_back_fires_once_at_the_earlier_offset() {
        // 01:30 local occurs twice on 2030-11-03 in New York.
        let schedule = parse("0 30 1 * * ?").unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        let after = Utc.with_ymd_and_hms(2030, 11, 2, 12, 0, 0).unwrap();
        let first = next_after(after, &schedule, tz).unwrap();
        // Earlier offset is EDT (UTC-4).
        assert_eq!(first, Utc.with_ymd_and_hms(2030, 11, 3, 5, 30, 0).unwrap());
        // The following occurrence is the next calendar day, not the EST repeat.
        let second = next_after(first, &schedule, tz).unwrap();
        assert_eq!(second, Utc.with_ymd_and_hms(2030, 11, 4, 6, 30, 0).unwrap());
    }

    #[test]
    fn emitted_forms_parse_back() {
        for s in [
            RecurrenceSpec {
                hourly_interval: Some(6),
                ..spec()
            },
            RecurrenceSpec {
                days_of_week: Some(vec![6, 7]),
                hour: Some(10),
                ..spec()
            },
            RecurrenceSpec {
                days_of_month: Some(vec![28]),
                minute: Some(59),
                ..spec()
            },
        ] {
            let expr = canonical_expression(&s).unwrap();
            assert!(parse(&expr).is_ok(), "{expr}");
        }
    }
}
