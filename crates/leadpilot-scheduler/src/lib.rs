//! # LeadPilot Scheduler
//!
//! Decides what each lead receives next, when, and whether the sequence keeps
//! going, then learns from the replies.
//!
//! ## Architecture
//! ```text
//! SequenceEngine
//!   ├── schedule_next(lead)   → LeadLocks → ProgressionEngine::plan
//!   │                              ├── gates: opted out, paused, reply guard
//!   │                              ├── linear chain | day-offset buckets
//!   │                              └── ScheduleCalculator (jitter, window, Sunday)
//!   │                          → TemplateSelector (cold start / 80-20 exploit)
//!   │                          → CAS on Lead.version
//!   ├── run_due_sweep(now)    → compose → OutboundSender → record send → schedule_next
//!   └── on_inbound_reply      → LearningLoop (pattern, template credit, reply guard)
//! ```

pub mod engine;
pub mod learning;
pub mod lock;
pub mod progression;
pub mod retry;
pub mod schedule;
pub mod selector;

pub use engine::{GeneratedMessage, ScheduleOutcome, SequenceEngine, SweepReport, spawn_due_sweep};
pub use learning::{LearningLoop, LearningReport};
pub use progression::{Advance, ProgressionEngine, SkipReason, Transition};
pub use retry::{RetryPolicy, with_retry};
pub use schedule::{ComputedSchedule, ScheduleCalculator};
pub use selector::TemplateSelector;
