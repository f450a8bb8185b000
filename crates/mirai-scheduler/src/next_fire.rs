//! Next-instant computation for daily and solar schedules
//!
//! Pure functions over an explicit `now` so the timezone edge cases are
//! directly testable.

use chrono::{DateTime, Datelike, Days, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use mirai_config::Location;

/// Which solar event a schedule follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolarEvent {
    Sunrise,
    Sunset,
}

/// Next occurrence of a local time-of-day strictly after `now`
///
/// If today's occurrence is already at or before `now`, tomorrow's is
/// used. A DST gap resolves to the first representable local time after
/// the gap; an ambiguous time (fall-back) resolves to the later instant.
pub fn next_daily(now: DateTime<Utc>, tz: Tz, at: NaiveTime) -> DateTime<Utc> {
    let local_today = now.with_timezone(&tz).date_naive();

    for days_ahead in 0..3 {
        let date = local_today + Days::new(days_ahead);
        if let Some(instant) = resolve_local(tz, date, at) {
            if instant > now {
                return instant;
            }
        }
    }

    // Not reachable: within three days some occurrence lies ahead
    now + Duration::days(1)
}

/// Next solar event strictly after `now`, with the offset applied
///
/// Tries today and tomorrow; None means no usable event exists on either
/// day (polar day or night) and the caller should retry later.
pub fn next_solar(
    now: DateTime<Utc>,
    tz: Tz,
    location: Location,
    event: SolarEvent,
    offset_minutes: i64,
) -> Option<DateTime<Utc>> {
    let local_today = now.with_timezone(&tz).date_naive();

    for days_ahead in 0..2 {
        let date = local_today + Days::new(days_ahead);
        if let Some(instant) = solar_instant(date, location, event) {
            let instant = instant + Duration::minutes(offset_minutes);
            if instant > now {
                return Some(instant);
            }
        }
    }

    None
}

/// Resolve a local wall-clock time on a date to a UTC instant
fn resolve_local(tz: Tz, date: NaiveDate, at: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = date.and_time(at);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(_, later) => Some(later.with_timezone(&Utc)),
        LocalResult::None => {
            // Inside a DST gap: probe forward to the first valid local time
            let mut probe = naive;
            for _ in 0..8 {
                probe += Duration::minutes(15);
                match tz.from_local_datetime(&probe) {
                    LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                    LocalResult::Ambiguous(_, later) => return Some(later.with_timezone(&Utc)),
                    LocalResult::None => {}
                }
            }
            None
        }
    }
}

/// The solar event instant on a calendar date, or None when the sun does
/// not rise or set there that day
fn solar_instant(date: NaiveDate, location: Location, event: SolarEvent) -> Option<DateTime<Utc>> {
    let (rise, set) = sunrise::sunrise_sunset(
        location.latitude,
        location.longitude,
        date.year(),
        date.month(),
        date.day(),
    );
    if rise >= set {
        return None;
    }
    let timestamp = match event {
        SolarEvent::Sunrise => rise,
        SolarEvent::Sunset => set,
    };
    DateTime::from_timestamp(timestamp, 0)
}
