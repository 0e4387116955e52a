//! Workflow engine: change events → triggers → tracked executions.
//!
//! ## Architecture
//! ```text
//! ChangeFeed (broadcast)
//!   → Trigger::from_event
//!     ├── lead_created   → RoutingEngine::route_lead → SequenceEngine::schedule_next
//!     ├── status_change  → terminal: pause_sequence | otherwise: schedule_next
//!     └── inbound_reply  → SequenceEngine::on_inbound_reply
//!   → WorkflowExecution (pending → running → completed | failed), persisted
//!
//! Optimization cycle (tokio interval)
//!   └── success rate per workflow → OptimizationHook
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use leadpilot_core::config::WorkflowConfig;
use leadpilot_core::error::{LeadPilotError, Result};
use leadpilot_core::traits::store::Datastore;
use leadpilot_core::types::{
    ApprovalRequest, ChangeEvent, ExecutionStatus, Lead, LeadStatus, NotificationRecord,
    RecommendationType, SmartRecommendation, Urgency, WorkflowExecution,
};
use leadpilot_scheduler::engine::{ScheduleOutcome, SequenceEngine};
use leadpilot_scheduler::retry::{RetryPolicy, with_retry};

use crate::routing::{RoutingEngine, lead_attributes};

pub const LEAD_INTAKE: &str = "lead_intake";
pub const STATUS_SYNC: &str = "status_sync";
pub const REPLY_LEARNING: &str = "reply_learning";
pub const RECOMMENDATION_EXECUTION: &str = "recommendation_execution";

/// Something the engine reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    LeadCreated {
        lead: Lead,
    },
    StatusChange {
        lead: Lead,
        from: LeadStatus,
        to: LeadStatus,
    },
    InboundReply {
        lead_id: String,
        message_id: Option<String>,
        replied_at: DateTime<Utc>,
    },
}

impl Trigger {
    /// Updates that leave `status` alone produce no trigger.
    pub fn from_event(event: &ChangeEvent) -> Option<Self> {
        match event {
            ChangeEvent::LeadCreated { lead } => Some(Trigger::LeadCreated { lead: lead.clone() }),
            ChangeEvent::LeadUpdated { before, after } if before.status != after.status => {
                Some(Trigger::StatusChange {
                    lead: after.clone(),
                    from: before.status,
                    to: after.status,
                })
            }
            ChangeEvent::LeadUpdated { .. } => None,
            ChangeEvent::InboundReply {
                lead_id,
                message_id,
                replied_at,
            } => Some(Trigger::InboundReply {
                lead_id: lead_id.clone(),
                message_id: message_id.clone(),
                replied_at: *replied_at,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Trigger::LeadCreated { .. } => "lead_created",
            Trigger::StatusChange { .. } => "status_change",
            Trigger::InboundReply { .. } => "inbound_reply",
        }
    }

    pub fn workflow(&self) -> &'static str {
        match self {
            Trigger::LeadCreated { .. } => LEAD_INTAKE,
            Trigger::StatusChange { .. } => STATUS_SYNC,
            Trigger::InboundReply { .. } => REPLY_LEARNING,
        }
    }

    pub fn lead_id(&self) -> &str {
        match self {
            Trigger::LeadCreated { lead } | Trigger::StatusChange { lead, .. } => &lead.id,
            Trigger::InboundReply { lead_id, .. } => lead_id,
        }
    }
}

/// Success statistics of one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowHealth {
    pub workflow: String,
    /// Finished executions (completed or failed).
    pub executions: u64,
    pub completed: u64,
    pub success_rate: f64,
}

/// Extension point for the optimization cycle.
#[async_trait]
pub trait OptimizationHook: Send + Sync {
    /// Success rate fell below the optimization threshold.
    async fn needs_optimization(&self, health: &WorkflowHealth);

    /// Enough executions with a high success rate.
    async fn promote(&self, health: &WorkflowHealth);
}

/// Default hook: logs only.
#[derive(Debug, Default)]
pub struct LoggingHook;

#[async_trait]
impl OptimizationHook for LoggingHook {
    async fn needs_optimization(&self, health: &WorkflowHealth) {
        tracing::warn!(
            "🔧 Workflow '{}' needs optimization: {:.0}% success over {} runs",
            health.workflow,
            health.success_rate * 100.0,
            health.executions
        );
    }

    async fn promote(&self, health: &WorkflowHealth) {
        tracing::info!(
            "🏆 Workflow '{}' promoted: {:.0}% success over {} runs",
            health.workflow,
            health.success_rate * 100.0,
            health.executions
        );
    }
}

pub struct WorkflowEngine {
    store: Arc<dyn Datastore>,
    sequence: Arc<SequenceEngine>,
    routing: RoutingEngine,
    hook: Arc<dyn OptimizationHook>,
    config: WorkflowConfig,
    retry: RetryPolicy,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn Datastore>,
        sequence: Arc<SequenceEngine>,
        routing: RoutingEngine,
        config: WorkflowConfig,
    ) -> Self {
        let retry = sequence.retry_policy().clone();
        Self {
            store,
            sequence,
            routing,
            hook: Arc::new(LoggingHook),
            config,
            retry,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn OptimizationHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn routing(&self) -> &RoutingEngine {
        &self.routing
    }

    /// Classify a change event and run the matching workflow.
    pub async fn handle_event(&self, event: &ChangeEvent) -> Result<Option<WorkflowExecution>> {
        match Trigger::from_event(event) {
            Some(trigger) => self.run_trigger(trigger).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn run_trigger(&self, trigger: Trigger) -> Result<WorkflowExecution> {
        tracing::debug!("⚡ Trigger '{}' for lead {}", trigger.name(), trigger.lead_id());
        let mut exec =
            WorkflowExecution::new(trigger.workflow(), trigger.name(), Some(trigger.lead_id()));
        self.begin(&mut exec).await?;

        let mut errors = Vec::new();
        match &trigger {
            Trigger::LeadCreated { lead } => {
                let attrs = lead_attributes(lead);
                match self.routing.route_lead(&lead.id, &attrs).await {
                    Ok(_) => exec.record_action(true),
                    Err(e) => {
                        exec.record_action(false);
                        errors.push(format!("route: {e}"));
                    }
                }
                self.schedule(&lead.id, &mut exec, &mut errors).await;
            }
            Trigger::StatusChange { lead, from, to } => {
                tracing::info!("🔀 Lead {} status {} → {}", lead.id, from, to);
                if to.is_terminal() {
                    match self.sequence.pause_sequence(&lead.id).await {
                        Ok(_) => exec.record_action(true),
                        Err(e) => {
                            exec.record_action(false);
                            errors.push(format!("pause: {e}"));
                        }
                    }
                } else {
                    // Re-plans only when nothing is pending.
                    self.schedule(&lead.id, &mut exec, &mut errors).await;
                }
            }
            Trigger::InboundReply {
                lead_id,
                message_id,
                replied_at,
            } => {
                let report = self
                    .sequence
                    .on_inbound_reply(lead_id, message_id.as_deref(), *replied_at)
                    .await;
                exec.record_action(report.pattern_updated);
                exec.record_action(report.lead_marked);
                if !report.pattern_updated {
                    errors.push("response pattern not updated".to_string());
                }
                if !report.lead_marked {
                    errors.push("reply guard not set".to_string());
                }
            }
        }

        self.finish(&mut exec, &errors).await?;
        Ok(exec)
    }

    async fn schedule(
        &self,
        lead_id: &str,
        exec: &mut WorkflowExecution,
        errors: &mut Vec<String>,
    ) {
        match self.sequence.schedule_next(lead_id).await {
            Ok(ScheduleOutcome::Conflict) => {
                exec.record_action(false);
                errors.push("schedule: concurrent update".to_string());
            }
            Ok(_) => exec.record_action(true),
            Err(e) => {
                exec.record_action(false);
                errors.push(format!("schedule: {e}"));
            }
        }
    }

    /// Carry out an approved (or automatable) recommendation.
    pub async fn execute_recommendation(
        &self,
        lead_id: &str,
        rec: &SmartRecommendation,
        approved: bool,
    ) -> Result<WorkflowExecution> {
        self.execute_recommendation_at(lead_id, rec, approved, Utc::now())
            .await
    }

    pub async fn execute_recommendation_at(
        &self,
        lead_id: &str,
        rec: &SmartRecommendation,
        approved: bool,
        now: DateTime<Utc>,
    ) -> Result<WorkflowExecution> {
        if !approved && !rec.automatable {
            return Err(LeadPilotError::Validation(format!(
                "recommendation '{}' needs approval",
                rec.id
            )));
        }
        let auto_approved = !approved;

        let mut exec =
            WorkflowExecution::new(RECOMMENDATION_EXECUTION, rec.rec_type.as_str(), Some(lead_id));
        self.begin(&mut exec).await?;

        let urgency = Urgency::from(rec.priority);
        let outcome = match rec.rec_type {
            RecommendationType::Immediate | RecommendationType::Scheduled => {
                let send_at = if rec.rec_type == RecommendationType::Scheduled {
                    now + Duration::hours(24)
                } else {
                    now
                };
                let request = ApprovalRequest {
                    id: uuid::Uuid::new_v4().to_string(),
                    lead_id: lead_id.to_string(),
                    content: rec.action.clone(),
                    urgency,
                    scheduled_send_at: send_at,
                    auto_approved,
                    created_at: now,
                };
                with_retry(&self.retry, "enqueue_approval", || {
                    self.store.enqueue_approval(request.clone())
                })
                .await
            }
            RecommendationType::Reminder => {
                let notification = NotificationRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    lead_id: lead_id.to_string(),
                    kind: "reminder".to_string(),
                    title: "Follow-up reminder".to_string(),
                    message: rec.action.clone(),
                    urgency,
                    confidence: rec.confidence,
                    created_at: now,
                };
                with_retry(&self.retry, "insert_notification", || {
                    self.store.insert_notification(notification.clone())
                })
                .await
            }
        };

        let errors = match outcome {
            Ok(()) => {
                exec.record_action(true);
                tracing::info!(
                    "✅ Recommendation '{}' ({}) queued for lead {}",
                    rec.action,
                    rec.rec_type.as_str(),
                    lead_id
                );
                Vec::new()
            }
            Err(e) => {
                exec.record_action(false);
                vec![e.to_string()]
            }
        };
        self.finish(&mut exec, &errors).await?;
        Ok(exec)
    }

    /// Score every workflow from its recent executions and call the hook.
    pub async fn optimization_cycle(&self) -> Result<Vec<WorkflowHealth>> {
        self.optimization_cycle_at(Utc::now()).await
    }

    /// Only executions created within `health_window_hours` before `now` count.
    pub async fn optimization_cycle_at(&self, now: DateTime<Utc>) -> Result<Vec<WorkflowHealth>> {
        let window = Duration::hours(self.config.health_window_hours.min(i32::MAX as u64) as i64);
        let since = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let executions = with_retry(&self.retry, "executions_since", || {
            self.store.executions_since(since)
        })
        .await?;

        let mut tally: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for exec in executions.iter().filter(|e| e.status.is_terminal()) {
            let entry = tally.entry(exec.workflow.clone()).or_insert((0, 0));
            entry.0 += 1;
            if exec.status == ExecutionStatus::Completed {
                entry.1 += 1;
            }
        }

        let mut report = Vec::with_capacity(tally.len());
        for (workflow, (executions, completed)) in tally {
            let health = WorkflowHealth {
                workflow,
                executions,
                completed,
                success_rate: completed as f64 / executions as f64,
            };
            if health.success_rate < self.config.optimize_below {
                self.hook.needs_optimization(&health).await;
            } else if health.executions >= self.config.promote_min_executions
                && health.success_rate > self.config.promote_above
            {
                self.hook.promote(&health).await;
            }
            report.push(health);
        }
        tracing::debug!("Optimization cycle scored {} workflows", report.len());
        Ok(report)
    }

    async fn begin(&self, exec: &mut WorkflowExecution) -> Result<()> {
        self.save(exec).await?;
        exec.start();
        self.save(exec).await
    }

    async fn finish(&self, exec: &mut WorkflowExecution, errors: &[String]) -> Result<()> {
        if errors.is_empty() {
            exec.complete();
        } else {
            exec.fail(&errors.join("; "));
            tracing::warn!(
                "⚠️ Workflow '{}' ({}) failed for lead {}: {}",
                exec.workflow,
                exec.id,
                exec.lead_id.as_deref().unwrap_or("-"),
                errors.join("; ")
            );
        }
        self.save(exec).await
    }

    async fn save(&self, exec: &WorkflowExecution) -> Result<()> {
        with_retry(&self.retry, "save_execution", || self.store.save_execution(exec)).await
    }
}

/// React to the change feed, one task per trigger.
pub fn spawn_trigger_monitor(engine: Arc<WorkflowEngine>) -> JoinHandle<()> {
    // Subscribe before spawning so no event published after this call is missed.
    let mut events = engine.store.subscribe();
    tokio::spawn(async move {
        tracing::info!("👂 Trigger monitor started");
        loop {
            match events.recv().await {
                Ok(event) => {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = engine.handle_event(&event).await {
                            tracing::warn!(
                                "⚠️ Trigger for lead {} failed: {}",
                                event.lead_id(),
                                e
                            );
                        }
                    });
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("⚠️ Trigger monitor lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => {
                    tracing::info!("Trigger monitor stopped: change feed closed");
                    break;
                }
            }
        }
    })
}

/// Run the optimization cycle every `interval_secs`.
pub fn spawn_optimization_cycle(engine: Arc<WorkflowEngine>, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("⏰ Optimization cycle started (every {}s)", interval_secs);
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        loop {
            interval.tick().await;
            if let Err(e) = engine.optimization_cycle().await {
                tracing::warn!("⚠️ Optimization cycle failed: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadpilot_core::config::LeadPilotConfig;
    use leadpilot_core::traits::composer::TemplateComposer;
    use leadpilot_core::traits::sender::OutboundSender;
    use leadpilot_core::traits::store::{
        ChangeFeed, ExecutionStore, LeadStore, OutboxStore, PatternStore, RoutingStore,
        TemplateStore,
    };
    use leadpilot_core::types::{
        AssignmentStrategy, MessageTemplate, RecommendationPriority, RoutingRule,
        default_stage_catalog,
    };
    use leadpilot_db::MemoryStore;
    use std::sync::Mutex;

    struct NullSender;

    #[async_trait]
    impl OutboundSender for NullSender {
        fn name(&self) -> &str {
            "null"
        }

        async fn send(&self, _lead: &Lead, _body: &str) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<(String, &'static str)>>,
    }

    #[async_trait]
    impl OptimizationHook for RecordingHook {
        async fn needs_optimization(&self, health: &WorkflowHealth) {
            self.calls.lock().unwrap().push((health.workflow.clone(), "optimize"));
        }

        async fn promote(&self, health: &WorkflowHealth) {
            self.calls.lock().unwrap().push((health.workflow.clone(), "promote"));
        }
    }

    async fn setup() -> (Arc<MemoryStore>, WorkflowEngine) {
        let store = Arc::new(MemoryStore::with_stages(default_stage_catalog()));
        let intro = MessageTemplate::new("t-intro", "intro", "friendly", "Hi {{first_name}}");
        store.upsert_template(intro).await.unwrap();
        let pool = ["amy", "ben"];
        let rule = RoutingRule::new("rr", "everyone", AssignmentStrategy::RoundRobin, &pool);
        store.upsert_rule(rule).await.unwrap();
        let config = LeadPilotConfig::default();
        let sequence = Arc::new(
            SequenceEngine::new(
                store.clone(),
                &config,
                Arc::new(TemplateComposer::new(false)),
                Arc::new(NullSender),
            )
            .unwrap()
            .with_seed(7)
            .with_retry_policy(RetryPolicy::none()),
        );
        let routing =
            RoutingEngine::new(store.clone(), config.routing.clone(), RetryPolicy::none());
        let engine = WorkflowEngine::new(store.clone(), sequence, routing, config.workflow.clone());
        (store, engine)
    }

    fn rec(rec_type: RecommendationType, automatable: bool) -> SmartRecommendation {
        SmartRecommendation {
            id: "rec-1".into(),
            action: "Send a check-in message".into(),
            rec_type,
            priority: RecommendationPriority::High,
            confidence: 0.8,
            success_probability: 0.7,
            context_factors: Vec::new(),
            expected_outcome: "Continued conversation".into(),
            time_to_execute_minutes: 5,
            related_actions: Vec::new(),
            automatable,
        }
    }

    #[test]
    fn test_trigger_classification() {
        let before = Lead::new("lead-1", "Ana");
        let mut after = before.clone();
        after.attributes.insert("note".into(), "called".into());
        assert!(Trigger::from_event(&ChangeEvent::LeadUpdated {
            before: before.clone(),
            after: after.clone(),
        })
        .is_none());

        after.status = LeadStatus::Engaged;
        let trigger = Trigger::from_event(&ChangeEvent::LeadUpdated { before, after }).unwrap();
        assert_eq!(trigger.name(), "status_change");
        assert!(matches!(
            trigger,
            Trigger::StatusChange {
                from: LeadStatus::New,
                to: LeadStatus::Engaged,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_lead_created_routes_then_schedules() {
        let (store, engine) = setup().await;
        let lead = Lead::new("lead-1", "Ana");
        store.insert_lead(lead.clone()).await.unwrap();

        let exec = engine
            .handle_event(&ChangeEvent::LeadCreated { lead })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.successful_actions, 2);
        assert_eq!(exec.workflow, LEAD_INTAKE);

        let stored = store.get_lead("lead-1").await.unwrap().unwrap();
        assert_eq!(stored.assigned_to.as_deref(), Some("amy"));
        assert_eq!(stored.current_stage, "intro");
        assert!(stored.next_send_at.is_some());

        let saved = store.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(saved.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_status_pauses_sequence() {
        let (store, engine) = setup().await;
        let lead = Lead::new("lead-1", "Ana");
        store.insert_lead(lead.clone()).await.unwrap();
        engine
            .handle_event(&ChangeEvent::LeadCreated { lead })
            .await
            .unwrap();

        let before = store.get_lead("lead-1").await.unwrap().unwrap();
        let mut after = before.clone();
        after.status = LeadStatus::Converted;
        store.update_lead(after.clone()).await.unwrap();

        let exec = engine
            .handle_event(&ChangeEvent::LeadUpdated { before, after })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        let stored = store.get_lead("lead-1").await.unwrap().unwrap();
        assert!(stored.sequence_paused);
        assert!(stored.next_send_at.is_none());
    }

    #[tokio::test]
    async fn test_inbound_reply_feeds_learning() {
        let (store, engine) = setup().await;
        store.insert_lead(Lead::new("lead-1", "Ana")).await.unwrap();
        let exec = engine
            .handle_event(&ChangeEvent::InboundReply {
                lead_id: "lead-1".into(),
                message_id: None,
                replied_at: Utc::now(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exec.workflow, REPLY_LEARNING);
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(store.get_pattern("lead-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recommendation_execution_by_type() {
        let (store, engine) = setup().await;
        let now = Utc::now();

        let immediate = rec(RecommendationType::Immediate, false);
        engine
            .execute_recommendation_at("lead-1", &immediate, true, now)
            .await
            .unwrap();
        let scheduled = rec(RecommendationType::Scheduled, true);
        engine
            .execute_recommendation_at("lead-1", &scheduled, false, now)
            .await
            .unwrap();
        let reminder = rec(RecommendationType::Reminder, true);
        let exec = engine
            .execute_recommendation_at("lead-1", &reminder, true, now)
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);

        let approvals = store.approvals("lead-1").await.unwrap();
        assert_eq!(approvals.len(), 2);
        let immediate = approvals.iter().find(|a| a.scheduled_send_at == now).unwrap();
        assert!(!immediate.auto_approved);
        let scheduled = approvals
            .iter()
            .find(|a| a.scheduled_send_at == now + Duration::hours(24))
            .unwrap();
        assert!(scheduled.auto_approved);
        assert_eq!(scheduled.urgency, Urgency::High);

        let notes = store.notifications("lead-1").await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, "reminder");
        assert_eq!(notes[0].confidence, 0.8);
    }

    #[tokio::test]
    async fn test_unapproved_manual_recommendation_rejected() {
        let (store, engine) = setup().await;
        let result = engine
            .execute_recommendation("lead-1", &rec(RecommendationType::Immediate, false), false)
            .await;
        assert!(matches!(result, Err(LeadPilotError::Validation(_))));
        assert!(store.approvals("lead-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_optimization_cycle_calls_hook() {
        let (store, engine) = setup().await;
        let hook = Arc::new(RecordingHook::default());
        let engine = engine.with_hook(hook.clone());

        let record = |workflow: &str, ok: bool| {
            let mut exec = WorkflowExecution::new(workflow, "test", None);
            exec.start();
            if ok {
                exec.complete();
            } else {
                exec.fail("boom");
            }
            exec
        };
        let mut executions = Vec::new();
        // flaky: 1/3 success; steady: 120 runs, 119 ok; middling: 7/10.
        for i in 0..3 {
            executions.push(record("flaky", i == 0));
        }
        for i in 0..120 {
            executions.push(record("steady", i != 0));
        }
        for i in 0..10 {
            executions.push(record("middling", i < 7));
        }
        for exec in &executions {
            store.save_execution(exec).await.unwrap();
        }
        // Still running: ignored.
        let mut running = WorkflowExecution::new("flaky", "test", None);
        running.start();
        store.save_execution(&running).await.unwrap();

        // Outside the scoring window: ignored.
        for _ in 0..5 {
            let mut old = record("flaky", true);
            old.created_at = Utc::now() - Duration::days(30);
            store.save_execution(&old).await.unwrap();
        }

        let report = engine.optimization_cycle().await.unwrap();
        let flaky = report.iter().find(|h| h.workflow == "flaky").unwrap();
        assert_eq!(flaky.executions, 3);

        let calls = hook.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("flaky".to_string(), "optimize"),
                ("steady".to_string(), "promote"),
            ]
        );
    }

    #[tokio::test]
    async fn test_trigger_monitor_reacts_to_feed() {
        let (store, engine) = setup().await;
        let engine = Arc::new(engine);
        let handle = spawn_trigger_monitor(engine.clone());

        store.insert_lead(Lead::new("lead-9", "Ana")).await.unwrap();
        store.publish(ChangeEvent::InboundReply {
            lead_id: "lead-9".into(),
            message_id: None,
            replied_at: Utc::now(),
        });

        let mut done = false;
        for _ in 0..100 {
            let executions = store.executions(None).await.unwrap();
            if executions.iter().filter(|e| e.status.is_terminal()).count() >= 2 {
                done = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(done, "monitor did not process both events");
        assert!(store.get_pattern("lead-9").await.unwrap().is_some());
    }
}
