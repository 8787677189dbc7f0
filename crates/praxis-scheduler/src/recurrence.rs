//! Recurrence arithmetic.
//!
//! `advance` computes the slot after a given one; `next_after_run`
//! implements the catch-up policy: advance from the schedule's previous
//! `next_run_at` until the result is strictly in the future. Both always
//! move strictly forward, which is what makes `next_run_at` monotonic and
//! re-fires for the same due instant impossible.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc, Weekday};

use praxis_store::{Frequency, RecurringSchedule};

/// The slot following `from` for this schedule's frequency spec.
pub fn advance(schedule: &RecurringSchedule, from: DateTime<Utc>) -> DateTime<Utc> {
  let interval = schedule.interval.max(1);
  let next = match schedule.frequency {
    Frequency::Daily => at_time(from.date_naive() + Duration::days(interval as i64), schedule),
    Frequency::Weekly => {
      let mut date = from.date_naive() + Duration::weeks(interval as i64);
      if let Some(target) = schedule.day_of_week {
        date += Duration::days(days_until_weekday(date.weekday(), target));
      }
      at_time(date, schedule)
    }
    Frequency::Monthly => {
      let shifted = from.date_naive() + Months::new(interval);
      let date = match schedule.day_of_month {
        Some(dom) => clamp_day(shifted.year(), shifted.month(), dom),
        None => shifted,
      };
      at_time(date, schedule)
    }
  };

  // Weekday/day-of-month alignment can only move forward, but guard the
  // invariant anyway: the next slot is strictly after the previous one.
  if next <= from {
    at_time(next.date_naive() + Duration::days(interval as i64), schedule)
  } else {
    next
  }
}

/// The next future slot after a run: one advance from the previous
/// `next_run_at`, then skip any slots that are already in the past. A
/// schedule that was offline for a while gets exactly one catch-up run and
/// resumes on its grid.
pub fn next_after_run(schedule: &RecurringSchedule, now: DateTime<Utc>) -> DateTime<Utc> {
  let mut next = advance(schedule, schedule.next_run_at);
  while next <= now {
    next = advance(schedule, next);
  }
  next
}

fn at_time(date: NaiveDate, schedule: &RecurringSchedule) -> DateTime<Utc> {
  date.and_time(schedule.time_of_day).and_utc()
}

/// Forward distance in days from `current` to `target` (0 if equal).
fn days_until_weekday(current: Weekday, target: Weekday) -> i64 {
  let cur = current.num_days_from_monday() as i64;
  let tgt = target.num_days_from_monday() as i64;
  (tgt - cur).rem_euclid(7)
}

/// `day` clamped to the length of the given month.
fn clamp_day(year: i32, month: u32, day: u32) -> NaiveDate {
  let last = last_day_of_month(year, month);
  NaiveDate::from_ymd_opt(year, month, day.clamp(1, last)).expect("clamped day is valid")
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
  let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
  let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1).expect("valid month");
  (first_of_next - Duration::days(1)).day()
}
