//! Next-fire computation for plans.
//!
//! All functions work on the wall clock of the timezone carried by `now`, so a
//! reminder set for 08:30 keeps firing at 08:30 local time across DST changes.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Utc};

use crate::{CoreError, CoreResult, Plan, RepeatRule, TimeOfDay, MAX_INTERVAL_DAYS};

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

/// Upper bound on how far a local time inside a DST gap is pushed forward.
const MAX_GAP_MINUTES: i64 = 180;

/// Days since 1970-01-01 for a calendar date.
pub fn epoch_day(date: NaiveDate) -> i64 {
    i64::from(date.num_days_from_ce()) - UNIX_EPOCH_DAYS_FROM_CE
}

/// Calendar date for a count of days since 1970-01-01.
pub fn date_from_epoch_day(day: i64) -> CoreResult<NaiveDate> {
    day.checked_add(UNIX_EPOCH_DAYS_FROM_CE)
        .and_then(|ce_day| i32::try_from(ce_day).ok())
        .and_then(NaiveDate::from_num_days_from_ce_opt)
        .ok_or_else(|| CoreError::Validation(format!("epoch day {day} is out of range")))
}

/// Next instant strictly after `now` at `hour:minute` local time.
///
/// The candidate on `now`'s calendar date is used when it lies in the future;
/// otherwise the same wall-clock time on the following calendar day.
pub fn next_daily_trigger<Tz: TimeZone>(
    now: &DateTime<Tz>,
    hour: u8,
    minute: u8,
) -> CoreResult<DateTime<Tz>> {
    let time = TimeOfDay::new(hour, minute)?;
    let tz = now.timezone();
    let today = now.date_naive();

    let candidate = resolve_local(&tz, today, time)?;
    if candidate > *now {
        return Ok(candidate);
    }
    let tomorrow = today
        .succ_opt()
        .ok_or_else(|| CoreError::Validation(format!("no calendar day after {today}")))?;
    resolve_local(&tz, tomorrow, time)
}

/// Next instant strictly after `now` on a day `start + k * interval_days` (k >= 0).
pub fn next_interval_trigger<Tz: TimeZone>(
    now: &DateTime<Tz>,
    hour: u8,
    minute: u8,
    interval_days: u16,
    start_date_epoch_day: i64,
) -> CoreResult<DateTime<Tz>> {
    let time = TimeOfDay::new(hour, minute)?;
    if !(1..=MAX_INTERVAL_DAYS).contains(&interval_days) {
        return Err(CoreError::Validation(format!(
            "interval must be within 1..={MAX_INTERVAL_DAYS} days, got {interval_days}"
        )));
    }
    date_from_epoch_day(start_date_epoch_day)?;
    let tz = now.timezone();
    let interval = i64::from(interval_days);
    let today = epoch_day(now.date_naive());
    let overflow = || {
        CoreError::Validation(format!(
            "anchor day {start_date_epoch_day} is out of range"
        ))
    };

    // First qualifying day on or after today.
    let day = if today <= start_date_epoch_day {
        start_date_epoch_day
    } else {
        let elapsed = today.checked_sub(start_date_epoch_day).ok_or_else(overflow)?;
        let cycles = elapsed
            .checked_add(interval - 1)
            .map(|rounded| rounded / interval)
            .ok_or_else(overflow)?;
        cycles
            .checked_mul(interval)
            .and_then(|offset| start_date_epoch_day.checked_add(offset))
            .ok_or_else(overflow)?
    };

    let candidate = resolve_local(&tz, date_from_epoch_day(day)?, time)?;
    if candidate > *now {
        return Ok(candidate);
    }
    let following = day.checked_add(interval).ok_or_else(overflow)?;
    resolve_local(&tz, date_from_epoch_day(following)?, time)
}

/// Next fire instant for `plan`, in UTC.
pub fn next_trigger_for<Tz: TimeZone>(plan: &Plan, now: &DateTime<Tz>) -> CoreResult<DateTime<Utc>> {
    let hour = plan.time.hour();
    let minute = plan.time.minute();
    let next = match plan.repeat {
        RepeatRule::Daily => next_daily_trigger(now, hour, minute)?,
        RepeatRule::IntervalDays {
            interval_days,
            start_date_epoch_day,
        } => next_interval_trigger(now, hour, minute, interval_days, start_date_epoch_day)?,
    };
    Ok(next.with_timezone(&Utc))
}

/// Map a local date and time to an instant, moving out of DST gaps and
/// taking the earlier instant for ambiguous times.
fn resolve_local<Tz: TimeZone>(
    tz: &Tz,
    date: NaiveDate,
    time: TimeOfDay,
) -> CoreResult<DateTime<Tz>> {
    let mut local = date
        .and_hms_opt(u32::from(time.hour()), u32::from(time.minute()), 0)
        .ok_or_else(|| CoreError::Validation(format!("invalid local time {date} {time}")))?;
    for _ in 0..=MAX_GAP_MINUTES {
        match tz.from_local_datetime(&local) {
            LocalResult::Single(instant) => return Ok(instant),
            LocalResult::Ambiguous(earliest, _) => return Ok(earliest),
            LocalResult::None => local += Duration::minutes(1),
        }
    }
    Err(CoreError::Validation(format!(
        "no valid local instant near {date} {time}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Timelike};

    fn at(text: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(text).unwrap()
    }

    #[test]
    fn daily_uses_today_when_still_ahead() {
        let now = at("2024-03-10T07:00:00+02:00");
        let next = next_daily_trigger(&now, 8, 30).unwrap();
        assert_eq!(next, at("2024-03-10T08:30:00+02:00"));
    }

    #[test]
    fn daily_rolls_to_tomorrow_when_passed() {
        let now = at("2024-03-10T09:00:00+02:00");
        let next = next_daily_trigger(&now, 8, 30).unwrap();
        assert_eq!(next, at("2024-03-11T08:30:00+02:00"));
    }

    #[test]
    fn daily_never_fires_at_now() {
        let now = at("2024-03-10T08:30:00+02:00");
        let next = next_daily_trigger(&now, 8, 30).unwrap();
        assert_eq!(next, at("2024-03-11T08:30:00+02:00"));
    }

    #[test]
    fn daily_rolls_over_month_and_year_end() {
        let now = at("2023-12-31T23:59:30+00:00");
        let next = next_daily_trigger(&now, 0, 0).unwrap();
        assert_eq!(next, at("2024-01-01T00:00:00+00:00"));
    }

    #[test]
    fn daily_is_strictly_future_for_every_minute() {
        let now = at("2024-06-15T13:47:12+05:30");
        for hour in 0..24u8 {
            for minute in 0..60u8 {
                let next = next_daily_trigger(&now, hour, minute).unwrap();
                assert!(next > now);
                assert_eq!((next.hour(), next.minute(), next.second()), (u32::from(hour), u32::from(minute), 0));
                let days = next.date_naive() - now.date_naive();
                assert!(days == Duration::zero() || days == Duration::days(1));
            }
        }
    }

    #[test]
    fn daily_rejects_out_of_range_time() {
        let now = at("2024-03-10T07:00:00+00:00");
        assert!(matches!(
            next_daily_trigger(&now, 24, 0),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            next_daily_trigger(&now, 0, 60),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn epoch_day_round_trips() {
        let date = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        assert_eq!(epoch_day(date), 0);
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(date_from_epoch_day(epoch_day(date)).unwrap(), date);
    }

    #[test]
    fn interval_waits_for_future_anchor() {
        let now = at("2024-03-10T07:00:00+00:00");
        let start = epoch_day(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
        let next = next_interval_trigger(&now, 9, 0, 3, start).unwrap();
        assert_eq!(next, at("2024-03-15T09:00:00+00:00"));
    }

    #[test]
    fn interval_skips_elapsed_cycles() {
        // Anchor 2024-03-01 every 3 days: 1, 4, 7, 10, 13 ...
        let start = epoch_day(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let now = at("2024-03-11T07:00:00+00:00");
        let next = next_interval_trigger(&now, 9, 0, 3, start).unwrap();
        assert_eq!(next, at("2024-03-13T09:00:00+00:00"));
    }

    #[test]
    fn interval_uses_today_when_aligned_and_ahead() {
        let start = epoch_day(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let now = at("2024-03-10T07:00:00+00:00");
        let next = next_interval_trigger(&now, 9, 0, 3, start).unwrap();
        assert_eq!(next, at("2024-03-10T09:00:00+00:00"));
    }

    #[test]
    fn interval_moves_a_full_cycle_when_today_passed() {
        let start = epoch_day(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let now = at("2024-03-10T09:00:00+00:00");
        let next = next_interval_trigger(&now, 9, 0, 3, start).unwrap();
        assert_eq!(next, at("2024-03-13T09:00:00+00:00"));
    }

    #[test]
    fn interval_rejects_zero_days() {
        let now = at("2024-03-10T07:00:00+00:00");
        assert!(next_interval_trigger(&now, 9, 0, 0, 0).is_err());
    }

    /// UTC+1 with a summer offset of UTC+2 between 2024-03-31 and 2024-10-27.
    #[derive(Clone, Copy, Debug)]
    struct SummerTime;

    fn naive(text: &str) -> chrono::NaiveDateTime {
        chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M").unwrap()
    }

    fn winter() -> FixedOffset {
        FixedOffset::east_opt(3600).unwrap()
    }

    fn summer() -> FixedOffset {
        FixedOffset::east_opt(7200).unwrap()
    }

    impl TimeZone for SummerTime {
        type Offset = FixedOffset;

        fn from_offset(_offset: &FixedOffset) -> Self {
            SummerTime
        }

        fn offset_from_local_date(&self, _local: &NaiveDate) -> LocalResult<FixedOffset> {
            LocalResult::Single(winter())
        }

        fn offset_from_local_datetime(
            &self,
            local: &chrono::NaiveDateTime,
        ) -> LocalResult<FixedOffset> {
            if *local >= naive("2024-03-31 02:00") && *local < naive("2024-03-31 03:00") {
                LocalResult::None
            } else if *local >= naive("2024-10-27 02:00") && *local < naive("2024-10-27 03:00") {
                LocalResult::Ambiguous(summer(), winter())
            } else if *local >= naive("2024-03-31 03:00") && *local < naive("2024-10-27 02:00") {
                LocalResult::Single(summer())
            } else {
                LocalResult::Single(winter())
            }
        }

        fn offset_from_utc_date(&self, _utc: &NaiveDate) -> FixedOffset {
            winter()
        }

        fn offset_from_utc_datetime(&self, utc: &chrono::NaiveDateTime) -> FixedOffset {
            if *utc >= naive("2024-03-31 01:00") && *utc < naive("2024-10-27 01:00") {
                summer()
            } else {
                winter()
            }
        }
    }

    fn local(text: &str) -> DateTime<SummerTime> {
        SummerTime.from_local_datetime(&naive(text)).single().unwrap()
    }

    fn utc(text: &str) -> DateTime<Utc> {
        at(text).with_timezone(&Utc)
    }

    #[test]
    fn daily_skips_forward_out_of_dst_gap() {
        let next = next_daily_trigger(&local("2024-03-30 12:00"), 2, 30).unwrap();
        assert_eq!(next.with_timezone(&Utc), utc("2024-03-31T01:00:00Z"));
    }

    #[test]
    fn daily_takes_earlier_instant_when_ambiguous() {
        let next = next_daily_trigger(&local("2024-10-26 12:00"), 2, 30).unwrap();
        assert_eq!(next.with_timezone(&Utc), utc("2024-10-27T00:30:00Z"));
    }

    #[test]
    fn daily_keeps_wall_clock_time_across_transition() {
        let next = next_daily_trigger(&local("2024-03-31 09:00"), 8, 30).unwrap();
        assert_eq!(next.with_timezone(&Utc), utc("2024-04-01T06:30:00Z"));
        assert_eq!(next.hour(), 8);
    }

    #[test]
    fn out_of_range_anchor_is_an_error() {
        let now = at("2024-03-10T07:00:00+00:00");
        for anchor in [i64::MAX, i64::MIN, i64::from(i32::MAX)] {
            assert!(next_interval_trigger(&now, 9, 0, 3, anchor).is_err());
            assert!(date_from_epoch_day(anchor).is_err());
        }
    }

    #[test]
    fn out_of_range_anchor_never_reaches_a_rule() {
        assert!(RepeatRule::interval(3, i64::MAX).is_err());
        assert_eq!(
            RepeatRule::normalize(crate::RepeatMode::IntervalDays, 3, Some(i64::MIN)),
            RepeatRule::Daily
        );
        let forged = RepeatRule::IntervalDays {
            interval_days: 3,
            start_date_epoch_day: i64::MAX,
        };
        assert_eq!(forged.to_string(), "every 3 days");
    }
}
