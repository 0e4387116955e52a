//! `LeadPilot`: the single entry point wiring store, engines and loops.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use leadpilot_core::config::LeadPilotConfig;
use leadpilot_core::error::Result;
use leadpilot_core::traits::composer::MessageComposer;
use leadpilot_core::traits::sender::OutboundSender;
use leadpilot_core::traits::store::Datastore;
use leadpilot_core::types::{LeadStatus, SmartRecommendation, WorkflowExecution};
use leadpilot_scheduler::engine::{ScheduleOutcome, SequenceEngine, spawn_due_sweep};
use leadpilot_scheduler::learning::LearningReport;
use leadpilot_scheduler::retry::{RetryPolicy, with_retry};

use crate::recommend::{
    EngagementPattern, JourneyStage, RecommendationContext, RecommendationEngine,
};
use crate::routing::RoutingEngine;
use crate::workflow::{WorkflowEngine, spawn_optimization_cycle, spawn_trigger_monitor};

pub struct LeadPilot {
    config: LeadPilotConfig,
    store: Arc<dyn Datastore>,
    sequence: Arc<SequenceEngine>,
    workflow: Arc<WorkflowEngine>,
    recommender: RecommendationEngine,
    retry: RetryPolicy,
}

impl LeadPilot {
    /// Validate the config, install its stage catalog and build the engines.
    pub async fn new(
        config: LeadPilotConfig,
        store: Arc<dyn Datastore>,
        composer: Arc<dyn MessageComposer>,
        sender: Arc<dyn OutboundSender>,
    ) -> Result<Self> {
        config.validate()?;
        let retry = RetryPolicy::from_config(&config.retry);
        let stages = config.stages.clone();
        with_retry(&retry, "replace_stage_configs", || {
            store.replace_stage_configs(stages.clone())
        })
        .await?;

        let sequence = Arc::new(SequenceEngine::new(store.clone(), &config, composer, sender)?);
        let routing = RoutingEngine::new(store.clone(), config.routing.clone(), retry.clone());
        let workflow = Arc::new(WorkflowEngine::new(
            store.clone(),
            sequence.clone(),
            routing,
            config.workflow.clone(),
        ));

        tracing::info!(
            "🚀 LeadPilot ready: {} stages, {:?} progression",
            config.stages.len(),
            config.progression.mode
        );
        Ok(Self {
            config,
            store,
            sequence,
            workflow,
            recommender: RecommendationEngine::new(),
            retry,
        })
    }

    /// Spawn the trigger monitor, the due-send sweep and the optimization cycle.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        vec![
            spawn_trigger_monitor(self.workflow.clone()),
            spawn_due_sweep(self.sequence.clone(), self.config.sweep.interval_secs),
            spawn_optimization_cycle(
                self.workflow.clone(),
                self.config.workflow.optimization_interval_secs,
            ),
        ]
    }

    /// Rendered text for the lead's current stage.
    pub async fn generate_message(&self, lead_id: &str) -> Result<Option<String>> {
        Ok(self
            .sequence
            .generate_message(lead_id)
            .await?
            .map(|message| message.body))
    }

    pub async fn schedule_next(&self, lead_id: &str) -> Result<ScheduleOutcome> {
        self.sequence.schedule_next(lead_id).await
    }

    pub async fn on_inbound_reply(
        &self,
        lead_id: &str,
        message_id: Option<&str>,
        replied_at: DateTime<Utc>,
    ) -> LearningReport {
        self.sequence
            .on_inbound_reply(lead_id, message_id, replied_at)
            .await
    }

    /// Assignee chosen for the lead, if any rule matched.
    pub async fn route_lead(
        &self,
        lead_id: &str,
        attributes: &Map<String, Value>,
    ) -> Result<Option<String>> {
        Ok(self
            .workflow
            .routing()
            .route_lead(lead_id, attributes)
            .await?
            .map(|assignment| assignment.assignee))
    }

    /// Ranked recommendations. The audit write is best-effort.
    pub async fn get_recommendations(
        &self,
        ctx: &RecommendationContext,
    ) -> Vec<SmartRecommendation> {
        let recs = self.recommender.generate(ctx);
        if let Err(e) = self.store.record_recommendations(&ctx.lead_id, &recs).await {
            tracing::warn!(
                "⚠️ Failed to record recommendations for lead {}: {}",
                ctx.lead_id,
                e
            );
        }
        recs
    }

    /// Build a recommendation context from what the store knows about a lead.
    pub async fn recommendation_context(
        &self,
        lead_id: &str,
    ) -> Result<Option<RecommendationContext>> {
        self.recommendation_context_at(lead_id, Utc::now()).await
    }

    pub async fn recommendation_context_at(
        &self,
        lead_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RecommendationContext>> {
        let Some(lead) =
            with_retry(&self.retry, "get_lead", || self.store.get_lead(lead_id)).await?
        else {
            return Ok(None);
        };
        let pattern =
            with_retry(&self.retry, "get_pattern", || self.store.get_pattern(lead_id)).await?;
        let last_sent =
            with_retry(&self.retry, "last_sent_for_lead", || self.store.last_sent_for_lead(lead_id))
                .await?;

        let last_contact = match (last_sent.map(|m| m.sent_at), lead.last_reply_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let (sent, responses) = pattern
            .as_ref()
            .map(|p| (p.total_messages_sent, p.total_responses))
            .unwrap_or((0, 0));

        let mut ctx = RecommendationContext::new(lead_id);
        ctx.hours_since_last_contact =
            last_contact.map(|at| (now - at).num_minutes().max(0) as f64 / 60.0);
        ctx.engagement = engagement_for(sent, responses);
        ctx.journey = match lead.status {
            LeadStatus::New | LeadStatus::Contacted => Some(JourneyStage::InitialContact),
            LeadStatus::Engaged => Some(JourneyStage::InterestBuilding),
            LeadStatus::Qualified => Some(JourneyStage::Decision),
            LeadStatus::Converted | LeadStatus::Lost => None,
        };
        if let Some(temperature) = lead.attributes.get("temperature").and_then(Value::as_f64) {
            ctx.temperature = temperature.clamp(0.0, 100.0);
        }
        ctx.conversation_length = (sent + responses) as usize;
        ctx.vehicle_interest = lead.attribute_str("vehicle_interest");
        Ok(Some(ctx))
    }

    pub async fn execute_recommendation(
        &self,
        lead_id: &str,
        rec: &SmartRecommendation,
        approved: bool,
    ) -> Result<WorkflowExecution> {
        self.workflow
            .execute_recommendation(lead_id, rec, approved)
            .await
    }

    pub fn config(&self) -> &LeadPilotConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Datastore> {
        &self.store
    }

    pub fn sequence(&self) -> &Arc<SequenceEngine> {
        &self.sequence
    }

    pub fn workflow(&self) -> &Arc<WorkflowEngine> {
        &self.workflow
    }
}

/// Half or more of the sends answered is responsive; none out of two or
/// more is inactive.
fn engagement_for(sent: u64, responses: u64) -> Option<EngagementPattern> {
    if sent == 0 {
        return None;
    }
    let rate = responses as f64 / sent as f64;
    if rate >= 0.5 {
        Some(EngagementPattern::Responsive)
    } else if responses > 0 {
        Some(EngagementPattern::Slow)
    } else if sent >= 2 {
        Some(EngagementPattern::Inactive)
    } else {
        None
    }
}
