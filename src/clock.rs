//! Clock and timezone service.
//!
//! All internal time math runs on absolute UTC instants; wall-clock values
//! cross the boundary only together with an IANA zone name. Ambiguous local
//! times (fall-back) resolve to the earlier offset; non-existent local times
//! (spring-forward) advance to the first valid instant.

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::SchedulerError;

/// Source of the current instant. Trait-level so tests can pin time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Resolve an IANA zone name.
pub fn resolve_zone(name: &str) -> Result<Tz, SchedulerError> {
    name.parse::<Tz>()
        .map_err(|_| SchedulerError::ZoneInvalid(name.to_string()))
}

/// Convert a wall-clock time in `zone` to an absolute instant.
///
/// Spring-forward gaps are walked forward minute by minute until the local
/// time exists, so a 02:30 in a one-hour gap lands on 03:00 local.
pub fn to_instant(wall: NaiveDateTime, zone: Tz) -> DateTime<Utc> {
    let mut candidate = wall;
    // DST gaps are at most a handful of hours anywhere in the tz database.
    for _ in 0..(48 * 60) {
        match zone.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earlier, _) => return earlier.with_timezone(&Utc),
            LocalResult::None => candidate = candidate + Duration::minutes(1),
        }
    }
    // Unreachable with real tz data; interpret as UTC rather than panic.
    Utc.from_utc_datetime(&wall)
}

/// Convert an absolute instant to wall-clock time in `zone`.
pub fn to_wall(instant: DateTime<Utc>, zone: Tz) -> NaiveDateTime {
    instant.with_timezone(&zone).naive_local()
}
