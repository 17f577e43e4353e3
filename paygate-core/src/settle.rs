//! The settle-date calendar.
//!
//! A paid order's funds move from unavailable to available after its
//! channel's settle cycle elapses: `D<n>` counts natural days, `T<n>`
//! business days (Saturdays and Sundays skipped), both anchored at local
//! midnight in the platform timezone. A `T` cycle landing on a weekend
//! rolls forward to the next business day first.

use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use paygate_common::enums::{SettleCycle, SettleSchedule};

/// What to do with a freshly paid order's funds.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SettleAction {
    /// Credit the available balance in the payment transaction itself.
    CreditNow,
    /// Credit unavailable, then enqueue the settle job with this delay.
    Enqueue(Duration),
    /// Credit unavailable and stop; a test-swallow cycle never settles.
    Swallow,
}

/// Resolve the action for a cycle given when the order was paid.
pub fn settle_action(
    cycle: SettleCycle,
    paid_at: DateTime<Utc>,
    tz: Tz,
) -> SettleAction {
    match cycle.schedule() {
        SettleSchedule::Immediate => SettleAction::CreditNow,
        SettleSchedule::Never => SettleAction::Swallow,
        SettleSchedule::AfterDays { days, business } => {
            let paid_date = paid_at.with_timezone(&tz).date_naive();
            let target = advance_days(paid_date, days, business);
            if target <= paid_date {
                // Same-day cycles (D0 / T0 on a business day) settle on
                // the spot, through the unavailable balance.
                return SettleAction::Enqueue(Duration::ZERO);
            }
            let settle_at = midnight_utc(tz, target);
            let delay = (settle_at - paid_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            SettleAction::Enqueue(delay)
        }
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Advance `days` from `date`: naturally, or counting business days only.
fn advance_days(date: NaiveDate, days: u32, business: bool) -> NaiveDate {
    if !business {
        return date + Days::new(u64::from(days));
    }
    let mut date = date;
    while is_weekend(date) {
        date = date.succ_opt().expect("date range");
    }
    let mut remaining = days;
    while remaining > 0 {
        date = date.succ_opt().expect("date range");
        if !is_weekend(date) {
            remaining -= 1;
        }
    }
    date
}

/// UTC instant of 00:00 local on `date`.
fn midnight_utc(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_hms_opt(0, 0, 0).expect("valid wall time");
    match tz.from_local_datetime(&midnight) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earliest, _) =>
            earliest.with_timezone(&Utc),
        chrono::LocalResult::None => {
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
