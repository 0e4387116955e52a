//! Send-time calculation: delay, jitter, preferred hours, Sunday blackout and
//! the business-hours window.
//!
//! All window checks happen on business-local wall-clock time; the returned
//! timestamp is UTC.

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
    Weekday,
};
use rand::Rng;

use leadpilot_core::config::BusinessHours;

/// Largest random de-clumping offset, in minutes.
const MAX_SPREAD_MINUTES: i64 = 59;

/// Result of one send-time computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputedSchedule {
    pub at: DateTime<Utc>,
    /// Effective jitter after clamping to `now`.
    pub jitter_applied_minutes: i64,
}

/// Pure send-time calculator bound to one business-hours window.
#[derive(Debug, Clone)]
pub struct ScheduleCalculator {
    hours: BusinessHours,
}

impl ScheduleCalculator {
    pub fn new(hours: BusinessHours) -> Self {
        Self { hours }
    }

    pub fn business_hours(&self) -> &BusinessHours {
        &self.hours
    }

    /// Send time for a message due `delay_hours` after `now`.
    pub fn compute_send_time<R: Rng + ?Sized>(
        &self,
        now: DateTime<Utc>,
        delay_hours: u32,
        jitter_minutes: u32,
        preferred_hours: &[u32],
        rng: &mut R,
    ) -> ComputedSchedule {
        let base = now + Duration::hours(i64::from(delay_hours));
        self.compute_from_base(now, base, jitter_minutes, preferred_hours, rng)
    }

    /// Send time for a message nominally due at `base` (never before `now`).
    pub fn compute_from_base<R: Rng + ?Sized>(
        &self,
        now: DateTime<Utc>,
        base: DateTime<Utc>,
        jitter_minutes: u32,
        preferred_hours: &[u32],
        rng: &mut R,
    ) -> ComputedSchedule {
        let base = base.max(now);
        let jitter = if jitter_minutes == 0 {
            0
        } else {
            let j = i64::from(jitter_minutes);
            rng.gen_range(-j..=j)
        };
        let jittered = (base + Duration::minutes(jitter)).max(now);
        let jitter_applied_minutes = (jittered - base).num_minutes();

        let mut local = jittered.with_timezone(&self.hours.tz).naive_local();
        if !preferred_hours.is_empty() {
            local = self.apply_preferred_hours(local, preferred_hours, rng);
        }
        local = self.apply_blackout(local);
        local = self.apply_window(local, rng);

        ComputedSchedule {
            at: self.to_utc(local),
            jitter_applied_minutes,
        }
    }

    /// Business-local `(hour, day_of_week)` of an instant; days count from
    /// Sunday = 0.
    pub fn local_slot(&self, at: DateTime<Utc>) -> (u32, u32) {
        let local = at.with_timezone(&self.hours.tz);
        (local.hour(), local.weekday().num_days_from_sunday())
    }

    /// Inside the window and not on a Sunday.
    pub fn is_sendable(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.hours.tz).naive_local();
        local.weekday() != Weekday::Sun
            && local.time() >= self.hours.start
            && local.time() <= self.hours.end
    }

    /// Move forward to the next preferred hour that lies inside the window.
    /// Preferences that never fit the window are ignored.
    fn apply_preferred_hours<R: Rng + ?Sized>(
        &self,
        local: NaiveDateTime,
        preferred: &[u32],
        rng: &mut R,
    ) -> NaiveDateTime {
        let mut hours: Vec<u32> = preferred
            .iter()
            .copied()
            .filter(|h| self.hour_in_window(*h))
            .collect();
        hours.sort_unstable();
        hours.dedup();
        if hours.is_empty() || hours.contains(&local.hour()) {
            return local;
        }

        let (date, hour) = match hours.iter().find(|h| **h > local.hour()) {
            Some(h) => (local.date(), *h),
            None => (next_day(local.date()), hours[0]),
        };
        let slot = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(self.hours.start);
        let room = (self.hours.end - slot)
            .num_minutes()
            .clamp(0, MAX_SPREAD_MINUTES);
        date.and_time(slot) + Duration::minutes(rng.gen_range(0..=room))
    }

    fn apply_blackout(&self, local: NaiveDateTime) -> NaiveDateTime {
        if local.weekday() == Weekday::Sun {
            next_day(local.date()).and_time(self.hours.fallback)
        } else {
            local
        }
    }

    fn apply_window<R: Rng + ?Sized>(&self, local: NaiveDateTime, rng: &mut R) -> NaiveDateTime {
        let time = local.time();
        if time < self.hours.start {
            return local.date().and_time(self.hours.start) + self.spread(rng);
        }
        if time > self.hours.end {
            let mut day = next_day(local.date());
            if day.weekday() == Weekday::Sun {
                day = next_day(day);
            }
            return day.and_time(self.hours.start) + self.spread(rng);
        }
        local
    }

    /// Random 0–59 minute offset that keeps window start + offset inside the
    /// window.
    fn spread<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let room = (self.hours.end - self.hours.start)
            .num_minutes()
            .clamp(0, MAX_SPREAD_MINUTES);
        Duration::minutes(rng.gen_range(0..=room))
    }

    fn hour_in_window(&self, hour: u32) -> bool {
        NaiveTime::from_hms_opt(hour, 0, 0)
            .is_some_and(|t| t >= self.hours.start && t <= self.hours.end)
    }

    fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let tz = self.hours.tz;
        if let Some(dt) = tz.from_local_datetime(&local).earliest() {
            return dt.with_timezone(&Utc);
        }
        // Skipped by a DST jump: the same wall-clock reading an hour later exists.
        tz.from_local_datetime(&(local + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&local))
    }
}

fn next_day(date: NaiveDate) -> NaiveDate {
    date.succ_opt().unwrap_or(date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadpilot_core::config::BusinessHoursConfig;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn calculator() -> ScheduleCalculator {
        ScheduleCalculator::new(BusinessHoursConfig::default().resolve().unwrap())
    }

    /// New York local wall-clock time as UTC.
    fn ny(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        chrono_tz::America::New_York
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_zero_delay_zero_jitter_inside_window_is_now() {
        let calc = calculator();
        let mut rng = StdRng::seed_from_u64(1);
        // Wednesday 11:15 New York.
        let now = ny(2026, 10, 14, 11, 15);
        let out = calc.compute_send_time(now, 0, 0, &[], &mut rng);
        assert_eq!(out.at, now);
        assert_eq!(out.jitter_applied_minutes, 0);
    }

    #[test]
    fn test_before_window_snaps_to_start() {
        let calc = calculator();
        let mut rng = StdRng::seed_from_u64(2);
        let now = ny(2026, 10, 14, 6, 0);
        let out = calc.compute_send_time(now, 0, 0, &[], &mut rng);
        let local = out.at.with_timezone(&chrono_tz::America::New_York);
        assert_eq!(local.hour(), 9);
        assert!(local.minute() <= 59);
        assert_eq!(local.day(), 14);
    }

    #[test]
    fn test_after_window_saturday_skips_sunday() {
        let calc = calculator();
        let mut rng = StdRng::seed_from_u64(3);
        // Saturday 21:00 New York.
        let now = ny(2026, 10, 17, 21, 0);
        let out = calc.compute_send_time(now, 0, 0, &[], &mut rng);
        let local = out.at.with_timezone(&chrono_tz::America::New_York);
        assert_eq!(local.weekday(), Weekday::Mon);
        assert_eq!(local.hour(), 9);
    }

    #[test]
    fn test_sunday_moves_to_monday_fallback() {
        let calc = calculator();
        let mut rng = StdRng::seed_from_u64(4);
        let now = ny(2026, 10, 18, 13, 30);
        let out = calc.compute_send_time(now, 0, 0, &[], &mut rng);
        assert_eq!(out.at, ny(2026, 10, 19, 10, 0));
    }

    #[test]
    fn test_preferred_hours_move_forward() {
        let calc = calculator();
        let mut rng = StdRng::seed_from_u64(5);
        let now = ny(2026, 10, 14, 11, 15);
        let out = calc.compute_send_time(now, 0, 0, &[14, 16], &mut rng);
        let local = out.at.with_timezone(&chrono_tz::America::New_York);
        assert_eq!((local.day(), local.hour()), (14, 14));

        // Past the last preferred hour: next day at the earliest one.
        let now = ny(2026, 10, 14, 17, 30);
        let out = calc.compute_send_time(now, 0, 0, &[10, 14], &mut rng);
        let local = out.at.with_timezone(&chrono_tz::America::New_York);
        assert_eq!((local.day(), local.hour()), (15, 10));
    }

    #[test]
    fn test_preferred_hours_outside_window_ignored() {
        let calc = calculator();
        let mut rng = StdRng::seed_from_u64(6);
        let now = ny(2026, 10, 14, 11, 15);
        let out = calc.compute_send_time(now, 0, 0, &[3, 22], &mut rng);
        assert_eq!(out.at, now);
    }

    #[test]
    fn test_jitter_never_earlier_than_now() {
        let calc = calculator();
        let mut rng = StdRng::seed_from_u64(7);
        let now = ny(2026, 10, 14, 12, 0);
        for _ in 0..1_000 {
            let out = calc.compute_send_time(now, 0, 120, &[], &mut rng);
            assert!(out.at >= now);
            assert!(out.jitter_applied_minutes >= 0);
        }
    }

    #[test]
    fn test_business_hours_containment() {
        let calc = calculator();
        let mut rng = StdRng::seed_from_u64(42);
        let start = ny(2026, 1, 1, 0, 0);
        for _ in 0..10_000 {
            let now = start + Duration::minutes(rng.gen_range(0..(60 * 24 * 365)));
            let delay = rng.gen_range(0..=200);
            let jitter = rng.gen_range(0..=240);
            let preferred: Vec<u32> = if rng.gen_bool(0.3) {
                vec![rng.gen_range(0..24), rng.gen_range(0..24)]
            } else {
                Vec::new()
            };
            let out = calc.compute_send_time(now, delay, jitter, &preferred, &mut rng);
            assert!(calc.is_sendable(out.at), "{} not sendable", out.at);
            assert!(out.at >= now);
        }
    }

    #[test]
    fn test_local_slot_counts_from_sunday() {
        let calc = calculator();
        assert_eq!(calc.local_slot(ny(2026, 10, 18, 15, 5)), (15, 0));
        assert_eq!(calc.local_slot(ny(2026, 10, 14, 9, 0)), (9, 3));
    }
}
