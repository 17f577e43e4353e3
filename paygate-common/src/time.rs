//! Timezone-aware time helpers.
//!
//! The platform runs on UTC instants internally ([`chrono::DateTime<Utc>`])
//! and converts at the edges: day boundaries ("orders since today 00:00"),
//! `HH:MM` trading windows, daily-counter key suffixes, and the two output
//! formats (RFC 3339 with offset on the API, `yyyy-MM-dd HH:mm:ss` on the
//! admin surface) are all evaluated in the configured platform timezone.

use chrono::{DateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;

#[inline]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// The UTC instant of today's 00:00 in `tz`, relative to `at`.
///
/// On DST gaps where local midnight doesn't exist the first valid local
/// time is used.
pub fn local_midnight(tz: Tz, at: DateTime<Utc>) -> DateTime<Utc> {
    let local_date = at.with_timezone(&tz).date_naive();
    let midnight = local_date
        .and_hms_opt(0, 0, 0)
        .expect("00:00:00 is always a valid wall time");
    match tz.from_local_datetime(&midnight) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earliest, _) =>
            earliest.with_timezone(&Utc),
        chrono::LocalResult::None => {
            // Midnight fell in a DST gap; scan forward minute by minute.
            let mut probe = midnight;
            loop {
                probe += chrono::Duration::minutes(1);
                if let chrono::LocalResult::Single(dt) =
                    tz.from_local_datetime(&probe)
                {
                    return dt.with_timezone(&Utc);
                }
            }
        }
    }
}

/// Local wall-clock time of `at` in `tz`.
pub fn local_time(tz: Tz, at: DateTime<Utc>) -> NaiveTime {
    at.with_timezone(&tz).time()
}

/// `YYYY-MM-DD` of `at` in `tz`; the suffix for daily counter keys.
pub fn date_key(tz: Tz, at: DateTime<Utc>) -> String {
    at.with_timezone(&tz).format("%Y-%m-%d").to_string()
}

/// RFC 3339 with TZ offset (`yyyy-MM-ddTHH:mm:ssXXX`); API output format.
pub fn format_api(tz: Tz, at: DateTime<Utc>) -> String {
    at.with_timezone(&tz).to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// `yyyy-MM-dd HH:mm:ss`; admin output format.
pub fn format_admin(tz: Tz, at: DateTime<Utc>) -> String {
    at.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parse an `HH:MM` trading-window bound.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

/// Whether `now` falls inside `[earliest, latest]`; `None` bounds are open.
/// Bounds are inclusive, matching how operators configure e.g.
/// `00:30`–`23:30` maintenance-free windows.
pub fn within_window(
    now: NaiveTime,
    earliest: Option<NaiveTime>,
    latest: Option<NaiveTime>,
) -> bool {
    if let Some(earliest) = earliest {
        if now < earliest {
            return false;
        }
    }
    if let Some(latest) = latest {
        if now > latest {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;

    const SHANGHAI: Tz = chrono_tz::Asia::Shanghai;

    #[test]
    fn midnight_in_configured_tz() {
        // 2026-08-01 03:00 Shanghai == 2026-07-31 19:00 UTC
        let at = Utc.with_ymd_and_hms(2026, 7, 31, 19, 0, 0).unwrap();
        let midnight = local_midnight(SHANGHAI, at);
        // Shanghai midnight Aug 1 == Jul 31 16:00 UTC
        assert_eq!(midnight, Utc.with_ymd_and_hms(2026, 7, 31, 16, 0, 0).unwrap());
    }

    #[test]
    fn date_key_uses_local_date() {
        let at = Utc.with_ymd_and_hms(2026, 7, 31, 19, 0, 0).unwrap();
        assert_eq!(date_key(SHANGHAI, at), "2026-08-01");
    }

    #[test]
    fn api_format_carries_offset() {
        let at = Utc.with_ymd_and_hms(2026, 8, 1, 4, 5, 6).unwrap();
        assert_eq!(format_api(SHANGHAI, at), "2026-08-01T12:05:06+08:00");
        assert_eq!(format_admin(SHANGHAI, at), "2026-08-01 12:05:06");
    }

    #[test]
    fn window_bounds() {
        let t = |s| parse_hhmm(s).unwrap();
        assert!(within_window(t("09:30"), Some(t("09:00")), Some(t("21:00"))));
        assert!(!within_window(t("08:59"), Some(t("09:00")), None));
        assert!(!within_window(t("21:01"), None, Some(t("21:00"))));
        assert!(within_window(t("00:00"), None, None));
    }
}
