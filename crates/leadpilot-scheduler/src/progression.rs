//! Stage progression state machine.
//!
//! `plan` is pure: it looks at a lead, the stage catalog and the lead's reply
//! pattern and says what should happen next. Persisting the decision is the
//! caller's job (see `SequenceEngine`).

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use leadpilot_core::config::{LeadPilotConfig, ProgressionMode};
use leadpilot_core::error::Result;
use leadpilot_core::types::{DayBucket, Lead, ResponsePattern, StageConfig};

use crate::schedule::ScheduleCalculator;

/// Why a lead was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OptedOut,
    Paused,
    /// A reply arrived inside the reply guard.
    RecentReply,
    /// Day-offset mode: nothing applies to the lead's current age bucket yet.
    NothingDue,
    /// A send is already pending for the current stage.
    AlreadyScheduled,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::OptedOut => "opted_out",
            SkipReason::Paused => "paused",
            SkipReason::RecentReply => "recent_reply",
            SkipReason::NothingDue => "nothing_due",
            SkipReason::AlreadyScheduled => "already_scheduled",
        }
    }
}

/// A planned move to the next stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub stage: String,
    pub send_at: DateTime<Utc>,
    pub jitter_applied_minutes: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    Skipped(SkipReason),
    /// Catalog exhausted: clear `next_send_at`, keep the stage.
    Terminated,
    Scheduled(Transition),
}

/// Where the lead sits in the catalog.
enum Position {
    BeforeFirst,
    At(usize),
    Unknown,
}

pub struct ProgressionEngine {
    calculator: ScheduleCalculator,
    mode: ProgressionMode,
    reply_guard: Duration,
}

impl ProgressionEngine {
    pub fn new(
        calculator: ScheduleCalculator,
        mode: ProgressionMode,
        reply_guard_hours: u32,
    ) -> Self {
        Self {
            calculator,
            mode,
            reply_guard: Duration::hours(i64::from(reply_guard_hours)),
        }
    }

    pub fn from_config(config: &LeadPilotConfig) -> Result<Self> {
        Ok(Self::new(
            ScheduleCalculator::new(config.business_hours.resolve()?),
            config.progression.mode,
            config.progression.reply_guard_hours,
        ))
    }

    pub fn mode(&self) -> ProgressionMode {
        self.mode
    }

    pub fn calculator(&self) -> &ScheduleCalculator {
        &self.calculator
    }

    /// Precondition gates, in order. `Some` means the lead must not move.
    pub fn gate(&self, lead: &Lead, now: DateTime<Utc>) -> Option<SkipReason> {
        if !lead.opted_in {
            return Some(SkipReason::OptedOut);
        }
        if lead.sequence_paused {
            return Some(SkipReason::Paused);
        }
        if lead
            .last_reply_at
            .is_some_and(|at| now - at < self.reply_guard)
        {
            return Some(SkipReason::RecentReply);
        }
        if lead.next_send_at.is_some_and(|at| at > now) {
            return Some(SkipReason::AlreadyScheduled);
        }
        None
    }

    /// Decide the lead's next step.
    pub fn plan<R: Rng + ?Sized>(
        &self,
        lead: &Lead,
        stages: &[StageConfig],
        pattern: Option<&ResponsePattern>,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Advance {
        if let Some(reason) = self.gate(lead, now) {
            return Advance::Skipped(reason);
        }
        match self.mode {
            ProgressionMode::Linear => self.plan_linear(lead, stages, pattern, now, rng),
            ProgressionMode::DayOffset => self.plan_day_offset(lead, stages, pattern, now, rng),
        }
    }

    fn plan_linear<R: Rng + ?Sized>(
        &self,
        lead: &Lead,
        stages: &[StageConfig],
        pattern: Option<&ResponsePattern>,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Advance {
        let next = match position(lead, stages) {
            Position::BeforeFirst => 0,
            Position::At(idx) => idx + 1,
            Position::Unknown => return Advance::Terminated,
        };
        let Some(stage) = stages.get(next) else {
            return Advance::Terminated;
        };
        let computed = self.calculator.compute_send_time(
            now,
            stage.delay_hours,
            stage.jitter_minutes,
            &preferred_hours(stage, pattern),
            rng,
        );
        Advance::Scheduled(Transition {
            stage: stage.stage.clone(),
            send_at: computed.at,
            jitter_applied_minutes: computed.jitter_applied_minutes,
        })
    }

    /// Stages are gated by the lead's age bucket; `delay_hours` counts from
    /// lead creation.
    fn plan_day_offset<R: Rng + ?Sized>(
        &self,
        lead: &Lead,
        stages: &[StageConfig],
        pattern: Option<&ResponsePattern>,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Advance {
        let after = match position(lead, stages) {
            Position::BeforeFirst => 0,
            Position::At(idx) => idx + 1,
            Position::Unknown => return Advance::Terminated,
        };
        let Some(bucket) = DayBucket::for_age(lead.age_days(now)) else {
            return Advance::Terminated;
        };
        let remaining = &stages[after.min(stages.len())..];

        let Some(stage) = remaining.iter().find(|s| s.day_bucket == Some(bucket)) else {
            let (_, current_end) = bucket.days();
            let later_exists = remaining.iter().any(|s| {
                s.day_bucket
                    .is_some_and(|b| b.days().0 > current_end)
            });
            return if later_exists {
                Advance::Skipped(SkipReason::NothingDue)
            } else {
                Advance::Terminated
            };
        };

        let base = lead.created_at + Duration::hours(i64::from(stage.delay_hours));
        let computed = self.calculator.compute_from_base(
            now,
            base,
            stage.jitter_minutes,
            &preferred_hours(stage, pattern),
            rng,
        );
        Advance::Scheduled(Transition {
            stage: stage.stage.clone(),
            send_at: computed.at,
            jitter_applied_minutes: computed.jitter_applied_minutes,
        })
    }
}

fn position(lead: &Lead, stages: &[StageConfig]) -> Position {
    if lead.current_stage == Lead::INITIAL_STAGE {
        return Position::BeforeFirst;
    }
    match stages.iter().position(|s| s.stage == lead.current_stage) {
        Some(idx) => Position::At(idx),
        None => Position::Unknown,
    }
}

/// Pattern hours win over the stage defaults when the lead has any.
fn preferred_hours(stage: &StageConfig, pattern: Option<&ResponsePattern>) -> Vec<u32> {
    match pattern.map(|p| p.preferred_hours()) {
        Some(hours) if !hours.is_empty() => hours,
        _ => stage.preferred_hours.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use leadpilot_core::config::BusinessHoursConfig;
    use leadpilot_core::types::{AutomationUpdate, default_stage_catalog};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn engine(mode: ProgressionMode) -> ProgressionEngine {
        let hours = BusinessHoursConfig::default().resolve().unwrap();
        ProgressionEngine::new(ScheduleCalculator::new(hours), mode, 24)
    }

    /// Wednesday 2026-10-14 11:00 New York.
    fn wednesday() -> DateTime<Utc> {
        chrono_tz::America::New_York
            .with_ymd_and_hms(2026, 10, 14, 11, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_linear_order_is_monotonic_then_terminates() {
        let engine = engine(ProgressionMode::Linear);
        let stages = default_stage_catalog();
        let mut rng = StdRng::seed_from_u64(11);
        let mut lead = Lead::new("lead-1", "Ana");
        let mut now = wednesday();
        let mut visited = Vec::new();

        loop {
            match engine.plan(&lead, &stages, None, now, &mut rng) {
                Advance::Scheduled(t) => {
                    assert!(t.send_at >= now);
                    visited.push(stages.iter().position(|s| s.stage == t.stage).unwrap());
                    now = t.send_at;
                    AutomationUpdate::Advance {
                        stage: t.stage,
                        next_send_at: t.send_at,
                        template_id: None,
                    }
                    .apply(&mut lead, now);
                }
                Advance::Terminated => break,
                other => panic!("unexpected {other:?}"),
            }
        }

        assert_eq!(visited, (0..stages.len()).collect::<Vec<_>>());
        assert_eq!(lead.current_stage, "last_touch");
        // Repeated calls keep terminating.
        for _ in 0..3 {
            assert_eq!(
                engine.plan(&lead, &stages, None, now, &mut rng),
                Advance::Terminated
            );
        }
    }

    #[test]
    fn test_unknown_stage_terminates() {
        let engine = engine(ProgressionMode::Linear);
        let mut lead = Lead::new("lead-1", "Ana");
        lead.current_stage = "retired_stage".into();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            engine.plan(&lead, &default_stage_catalog(), None, wednesday(), &mut rng),
            Advance::Terminated
        );
    }

    #[test]
    fn test_empty_catalog_terminates() {
        let engine = engine(ProgressionMode::Linear);
        let lead = Lead::new("lead-1", "Ana");
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            engine.plan(&lead, &[], None, wednesday(), &mut rng),
            Advance::Terminated
        );
    }

    #[test]
    fn test_gates_in_order() {
        let engine = engine(ProgressionMode::Linear);
        let stages = default_stage_catalog();
        let mut rng = StdRng::seed_from_u64(1);
        let now = wednesday();

        let mut lead = Lead::new("lead-1", "Ana");
        lead.opted_in = false;
        lead.sequence_paused = true;
        assert_eq!(
            engine.plan(&lead, &stages, None, now, &mut rng),
            Advance::Skipped(SkipReason::OptedOut)
        );
        lead.opted_in = true;
        assert_eq!(
            engine.plan(&lead, &stages, None, now, &mut rng),
            Advance::Skipped(SkipReason::Paused)
        );
    }

    #[test]
    fn test_reply_guard_boundary() {
        let engine = engine(ProgressionMode::Linear);
        let stages = default_stage_catalog();
        let mut rng = StdRng::seed_from_u64(3);
        let now = wednesday();
        let mut lead = Lead::new("lead-1", "Ana");

        lead.last_reply_at = Some(now - Duration::hours(23) - Duration::minutes(59));
        assert_eq!(
            engine.plan(&lead, &stages, None, now, &mut rng),
            Advance::Skipped(SkipReason::RecentReply)
        );

        lead.last_reply_at = Some(now - Duration::hours(24) - Duration::minutes(1));
        assert!(matches!(
            engine.plan(&lead, &stages, None, now, &mut rng),
            Advance::Scheduled(_)
        ));
    }

    #[test]
    fn test_pending_send_is_not_replanned() {
        let engine = engine(ProgressionMode::Linear);
        let now = wednesday();
        let mut lead = Lead::new("lead-1", "Ana");
        lead.current_stage = "intro".into();
        lead.next_send_at = Some(now + Duration::hours(2));
        let mut rng = StdRng::seed_from_u64(2);
        assert_eq!(
            engine.plan(&lead, &default_stage_catalog(), None, now, &mut rng),
            Advance::Skipped(SkipReason::AlreadyScheduled)
        );
    }

    #[test]
    fn test_pattern_hours_take_precedence() {
        let engine = engine(ProgressionMode::Linear);
        let stages = vec![StageConfig::new("intro", 0, 0).with_hours(&[10])];
        let mut pattern = ResponsePattern::new("lead-1");
        pattern.record_reply(16, 3, wednesday());
        let lead = Lead::new("lead-1", "Ana");
        let mut rng = StdRng::seed_from_u64(9);

        let Advance::Scheduled(t) =
            engine.plan(&lead, &stages, Some(&pattern), wednesday(), &mut rng)
        else {
            panic!("expected a schedule");
        };
        let (hour, _) = engine.calculator().local_slot(t.send_at);
        assert_eq!(hour, 16);
    }

    #[test]
    fn test_day_zero_lead_gets_day_zero_stage() {
        let engine = engine(ProgressionMode::DayOffset);
        let stages = default_stage_catalog();
        let mut rng = StdRng::seed_from_u64(5);
        let now = wednesday();
        let mut lead = Lead::new("lead-1", "Ana");
        lead.created_at = now;

        let Advance::Scheduled(t) = engine.plan(&lead, &stages, None, now, &mut rng) else {
            panic!("expected a schedule");
        };
        let scoped = stages.iter().find(|s| s.stage == t.stage).unwrap();
        assert_eq!(scoped.day_bucket, Some(DayBucket::Day0));
        assert!(t.send_at >= now);
        assert!(engine.calculator().is_sendable(t.send_at));
    }

    #[test]
    fn test_day_offset_waits_for_next_bucket() {
        let engine = engine(ProgressionMode::DayOffset);
        let stages = default_stage_catalog();
        let mut rng = StdRng::seed_from_u64(5);
        let now = wednesday();
        let mut lead = Lead::new("lead-1", "Ana");
        lead.created_at = now;
        lead.current_stage = "intro".into();

        // Still day 0, next stages live in week 1.
        assert_eq!(
            engine.plan(&lead, &stages, None, now, &mut rng),
            Advance::Skipped(SkipReason::NothingDue)
        );

        // Day 2: follow_up_1 applies, no earlier than creation + 24h.
        let later = now + Duration::days(2);
        let Advance::Scheduled(t) = engine.plan(&lead, &stages, None, later, &mut rng) else {
            panic!("expected a schedule");
        };
        assert_eq!(t.stage, "follow_up_1");
        assert!(t.send_at >= later);
    }

    #[test]
    fn test_day_offset_terminates_past_ninety_days() {
        let engine = engine(ProgressionMode::DayOffset);
        let now = wednesday();
        let mut lead = Lead::new("lead-1", "Ana");
        lead.created_at = now - Duration::days(91);
        let mut rng = StdRng::seed_from_u64(5);
        assert_eq!(
            engine.plan(&lead, &default_stage_catalog(), None, now, &mut rng),
            Advance::Terminated
        );
    }
}
