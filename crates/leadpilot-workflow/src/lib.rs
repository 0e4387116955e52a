//! # LeadPilot Workflow
//!
//! Reacts to datastore changes, routes leads to owners, recommends next
//! actions and wraps everything behind the `LeadPilot` facade.
//!
//! ## Architecture
//! ```text
//! LeadPilot (facade)
//!   ├── SequenceEngine      (leadpilot-scheduler)
//!   ├── WorkflowEngine      → triggers, executions, optimization cycle
//!   │     └── RoutingEngine → rules, conditions, assignment strategies
//!   └── RecommendationEngine → candidates, enhancement, dedupe, ranking
//! ```

pub mod recommend;
pub mod routing;
pub mod service;
pub mod workflow;

pub use recommend::{
    EngagementPattern, JourneyStage, MAX_RECOMMENDATIONS, RecommendationContext,
    RecommendationEngine,
};
pub use routing::{Assignment, RoutingEngine, evaluate_conditions, lead_attributes, select_rule};
pub use service::LeadPilot;
pub use workflow::{
    LoggingHook, OptimizationHook, Trigger, WorkflowEngine, WorkflowHealth,
    spawn_optimization_cycle, spawn_trigger_monitor,
};
