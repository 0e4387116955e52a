//! Sequence engine: ties progression, selection, composition and delivery to
//! the datastore.
//!
//! Every write to a lead's automation fields happens under the lead's lock and
//! through a compare-and-swap on `Lead.version`, so two triggers for the same
//! lead cannot both advance it.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::task::JoinHandle;

use leadpilot_core::config::LeadPilotConfig;
use leadpilot_core::error::Result;
use leadpilot_core::traits::composer::{CompositionContext, MessageComposer};
use leadpilot_core::traits::sender::OutboundSender;
use leadpilot_core::traits::store::Datastore;
use leadpilot_core::types::{AutomationUpdate, Lead, ScheduledSend, SentMessage};

use crate::learning::{LearningLoop, LearningReport};
use crate::lock::LeadLocks;
use crate::progression::{Advance, ProgressionEngine, SkipReason};
use crate::retry::{RetryPolicy, with_retry};
use crate::schedule::ScheduleCalculator;
use crate::selector::TemplateSelector;

/// Result of a `schedule_next` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    Scheduled(ScheduledSend),
    Skipped(SkipReason),
    /// Sequence exhausted (or no template left); `next_send_at` is cleared.
    Terminated,
    /// Another writer changed the lead first; nothing was written.
    Conflict,
    LeadMissing,
}

/// Composed text for a lead's current stage.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedMessage {
    pub lead_id: String,
    pub template_id: String,
    pub stage: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub due: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct SequenceEngine {
    store: Arc<dyn Datastore>,
    progression: ProgressionEngine,
    selector: TemplateSelector,
    composer: Arc<dyn MessageComposer>,
    sender: Arc<dyn OutboundSender>,
    learning: LearningLoop,
    locks: LeadLocks,
    retry: RetryPolicy,
    rng: Mutex<StdRng>,
    batch_size: usize,
}

impl SequenceEngine {
    pub fn new(
        store: Arc<dyn Datastore>,
        config: &LeadPilotConfig,
        composer: Arc<dyn MessageComposer>,
        sender: Arc<dyn OutboundSender>,
    ) -> Result<Self> {
        let progression = ProgressionEngine::from_config(config)?;
        let retry = RetryPolicy::from_config(&config.retry);
        let learning = LearningLoop::new(
            store.clone(),
            progression.calculator().clone(),
            retry.clone(),
        );
        Ok(Self {
            store,
            progression,
            selector: TemplateSelector::from_config(&config.selector),
            composer,
            sender,
            learning,
            locks: LeadLocks::new(),
            retry,
            rng: Mutex::new(StdRng::from_entropy()),
            batch_size: config.sweep.batch_size.max(1),
        })
    }

    /// Deterministic randomness for jitter and selection.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.learning = LearningLoop::new(
            self.store.clone(),
            self.progression.calculator().clone(),
            retry.clone(),
        );
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn Datastore> {
        &self.store
    }

    pub fn calculator(&self) -> &ScheduleCalculator {
        self.progression.calculator()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Decide and persist the lead's next send.
    pub async fn schedule_next(&self, lead_id: &str) -> Result<ScheduleOutcome> {
        self.schedule_next_at(lead_id, Utc::now()).await
    }

    pub async fn schedule_next_at(
        &self,
        lead_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome> {
        let _guard = self.locks.lock(lead_id).await;
        self.schedule_locked(lead_id, now).await
    }

    /// Stop a lead's sequence (`sequence_paused`, no pending send).
    /// Returns false when the lead is missing, already paused or was changed
    /// concurrently.
    pub async fn pause_sequence(&self, lead_id: &str) -> Result<bool> {
        let _guard = self.locks.lock(lead_id).await;
        let Some(lead) = self.load_lead(lead_id).await? else {
            return Ok(false);
        };
        if lead.sequence_paused && lead.next_send_at.is_none() {
            return Ok(false);
        }
        let applied = with_retry(&self.retry, "apply_automation", || {
            self.store
                .apply_automation(&lead.id, lead.version, AutomationUpdate::Pause)
        })
        .await?;
        if applied {
            tracing::info!("⏸️ Sequence paused for lead {}", lead_id);
        } else {
            tracing::warn!("⚠️ Pause for lead {} lost a concurrent update", lead_id);
        }
        Ok(applied)
    }

    /// Compose the message for the lead's current stage, without sending it.
    pub async fn generate_message(&self, lead_id: &str) -> Result<Option<GeneratedMessage>> {
        let Some(lead) = self.load_lead(lead_id).await? else {
            tracing::warn!("⚠️ Cannot generate message: lead {} not found", lead_id);
            return Ok(None);
        };
        self.compose_for(&lead).await
    }

    /// Record a delivered message and bump the send counters.
    ///
    /// Ledger errors are returned; the counters are best-effort.
    pub async fn mark_sent(
        &self,
        message: &GeneratedMessage,
        at: DateTime<Utc>,
    ) -> Result<SentMessage> {
        let sent = SentMessage::new(&message.lead_id, &message.template_id, &message.stage, at);
        with_retry(&self.retry, "record_sent", || self.store.record_sent(sent.clone())).await?;

        if let Err(e) = with_retry(&self.retry, "increment_template_sent", || {
            self.store.increment_template_sent(&message.template_id)
        })
        .await
        {
            tracing::warn!(
                "⚠️ total_sent not updated for template {}: {}",
                message.template_id,
                e
            );
        }
        if let Err(e) = with_retry(&self.retry, "increment_pattern_sent", || {
            self.store.increment_pattern_sent(&message.lead_id)
        })
        .await
        {
            tracing::warn!(
                "⚠️ Pattern send count not updated for lead {}: {}",
                message.lead_id,
                e
            );
        }
        Ok(sent)
    }

    /// Feed an inbound reply to the learning loop.
    pub async fn on_inbound_reply(
        &self,
        lead_id: &str,
        message_id: Option<&str>,
        replied_at: DateTime<Utc>,
    ) -> LearningReport {
        let _guard = self.locks.lock(lead_id).await;
        self.learning
            .on_inbound_reply(lead_id, message_id, replied_at)
            .await
    }

    /// Dispatch every lead whose send is due, then schedule its next stage.
    pub async fn run_due_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let due = with_retry(&self.retry, "due_leads", || {
            self.store.due_leads(now, self.batch_size)
        })
        .await?;

        let mut report = SweepReport {
            due: due.len(),
            ..SweepReport::default()
        };
        for lead in &due {
            match self.dispatch(&lead.id, now).await {
                Ok(true) => report.sent += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        lead_id = %lead.id,
                        kind = e.kind(),
                        "⚠️ Dispatch failed: {}",
                        e
                    );
                }
            }
        }
        self.locks.prune();

        if report.due > 0 {
            tracing::info!(
                "📬 Sweep: {} due, {} sent, {} skipped, {} failed",
                report.due,
                report.sent,
                report.skipped,
                report.failed
            );
        } else {
            tracing::debug!("Sweep: nothing due");
        }
        Ok(report)
    }

    /// Send one due lead. `Ok(false)` means nothing was sent.
    ///
    /// The pending send is cleared before delivery, so a lead is never sent
    /// the same stage twice. Once delivery succeeds nothing after it can fail
    /// the dispatch.
    async fn dispatch(&self, lead_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let _guard = self.locks.lock(lead_id).await;

        // Re-check under the lock: the lead may have changed since the query.
        let Some(lead) = self.load_lead(lead_id).await? else {
            return Ok(false);
        };
        if !lead.is_due(now) {
            return Ok(false);
        }
        if let Some(reason) = self.progression.gate(&lead, now) {
            tracing::debug!("Holding send for lead {}: {}", lead_id, reason.as_str());
            return Ok(false);
        }

        let Some(message) = self.compose_for(&lead).await? else {
            tracing::warn!(
                "⚠️ No active template for stage '{}', ending sequence for lead {}",
                lead.current_stage,
                lead_id
            );
            self.terminate(&lead).await?;
            return Ok(false);
        };

        let claimed = with_retry(&self.retry, "apply_automation", || {
            self.store
                .apply_automation(&lead.id, lead.version, AutomationUpdate::Terminate)
        })
        .await?;
        if !claimed {
            tracing::warn!("⚠️ Lead {} changed concurrently, send dropped", lead_id);
            return Ok(false);
        }

        if let Err(e) = self.sender.send(&lead, &message.body).await {
            self.release(&lead).await;
            return Err(e);
        }
        tracing::info!(
            "📤 Sent '{}' ({}) to lead {} via {}",
            message.stage,
            message.template_id,
            lead_id,
            self.sender.name()
        );
        if let Err(e) = self.mark_sent(&message, now).await {
            tracing::warn!("⚠️ Send to lead {} not recorded: {}", lead_id, e);
        }

        match self.schedule_locked(lead_id, now).await {
            Ok(outcome) => tracing::debug!("Lead {} after send: {:?}", lead_id, outcome),
            Err(e) => {
                tracing::warn!("⚠️ Could not schedule lead {} after send: {}", lead_id, e)
            }
        }
        Ok(true)
    }

    /// Put back the pending send claimed by `dispatch` after a failed delivery.
    async fn release(&self, claimed: &Lead) {
        let Some(next_send_at) = claimed.next_send_at else {
            return;
        };
        let update = AutomationUpdate::Advance {
            stage: claimed.current_stage.clone(),
            next_send_at,
            template_id: claimed.scheduled_template_id.clone(),
        };
        match with_retry(&self.retry, "apply_automation", || {
            self.store
                .apply_automation(&claimed.id, claimed.version + 1, update.clone())
        })
        .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("⚠️ Lead {} changed before its send was released", claimed.id)
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not release send for lead {}: {}", claimed.id, e)
            }
        }
    }

    async fn schedule_locked(
        &self,
        lead_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome> {
        let Some(lead) = self.load_lead(lead_id).await? else {
            tracing::warn!("⚠️ schedule_next: lead {} not found", lead_id);
            return Ok(ScheduleOutcome::LeadMissing);
        };
        let stages = with_retry(&self.retry, "stage_configs", || self.store.stage_configs()).await?;
        let pattern =
            with_retry(&self.retry, "get_pattern", || self.store.get_pattern(lead_id)).await?;

        let advance = {
            let mut rng = self.rng();
            self.progression
                .plan(&lead, &stages, pattern.as_ref(), now, &mut *rng)
        };

        let transition = match advance {
            Advance::Skipped(reason) => {
                tracing::debug!("Lead {} not advanced: {}", lead_id, reason.as_str());
                return Ok(ScheduleOutcome::Skipped(reason));
            }
            Advance::Terminated => return self.terminate(&lead).await,
            Advance::Scheduled(t) => t,
        };

        let candidates = with_retry(&self.retry, "active_templates", || {
            self.store.active_templates(&transition.stage)
        })
        .await?;
        let template_id = {
            let mut rng = self.rng();
            self.selector
                .select(&candidates, pattern.as_ref(), &mut *rng)
                .map(|t| t.id.clone())
        };
        let Some(template_id) = template_id else {
            tracing::warn!(
                "⚠️ No active template for stage '{}', ending sequence for lead {}",
                transition.stage,
                lead_id
            );
            return self.terminate(&lead).await;
        };

        let update = AutomationUpdate::Advance {
            stage: transition.stage.clone(),
            next_send_at: transition.send_at,
            template_id: Some(template_id.clone()),
        };
        let applied = with_retry(&self.retry, "apply_automation", || {
            self.store
                .apply_automation(&lead.id, lead.version, update.clone())
        })
        .await?;
        if !applied {
            tracing::warn!("⚠️ Lead {} changed concurrently, schedule dropped", lead_id);
            return Ok(ScheduleOutcome::Conflict);
        }

        tracing::info!(
            "📅 Lead {} → '{}' at {} (jitter {}m, template {})",
            lead_id,
            transition.stage,
            transition.send_at,
            transition.jitter_applied_minutes,
            template_id
        );
        Ok(ScheduleOutcome::Scheduled(ScheduledSend {
            lead_id: lead.id,
            template_id,
            stage: transition.stage,
            scheduled_at: transition.send_at,
            jitter_applied_minutes: transition.jitter_applied_minutes,
        }))
    }

    /// Clear `next_send_at`, keeping the stage. Repeated calls write nothing.
    async fn terminate(&self, lead: &Lead) -> Result<ScheduleOutcome> {
        if lead.next_send_at.is_none() {
            return Ok(ScheduleOutcome::Terminated);
        }
        let applied = with_retry(&self.retry, "apply_automation", || {
            self.store
                .apply_automation(&lead.id, lead.version, AutomationUpdate::Terminate)
        })
        .await?;
        if !applied {
            return Ok(ScheduleOutcome::Conflict);
        }
        tracing::info!(
            "🏁 Sequence finished for lead {} at '{}'",
            lead.id,
            lead.current_stage
        );
        Ok(ScheduleOutcome::Terminated)
    }

    /// The scheduled template wins while it is still active for the stage;
    /// otherwise a fresh one is selected.
    async fn compose_for(&self, lead: &Lead) -> Result<Option<GeneratedMessage>> {
        if lead.current_stage == Lead::INITIAL_STAGE {
            return Ok(None);
        }
        let candidates = with_retry(&self.retry, "active_templates", || {
            self.store.active_templates(&lead.current_stage)
        })
        .await?;
        let scheduled = lead
            .scheduled_template_id
            .as_deref()
            .and_then(|id| candidates.iter().find(|t| t.id == id))
            .cloned();
        let template = match scheduled {
            Some(template) => Some(template),
            None => {
                let pattern =
                    with_retry(&self.retry, "get_pattern", || self.store.get_pattern(&lead.id))
                        .await?;
                let mut rng = self.rng();
                self.selector
                    .select(&candidates, pattern.as_ref(), &mut *rng)
                    .cloned()
            }
        };
        let Some(template) = template else {
            return Ok(None);
        };

        let ctx = CompositionContext::for_lead(lead, &template);
        let body = self.composer.compose(&template, &ctx).await?;
        Ok(Some(GeneratedMessage {
            lead_id: lead.id.clone(),
            template_id: template.id,
            stage: template.stage,
            body,
        }))
    }

    async fn load_lead(&self, lead_id: &str) -> Result<Option<Lead>> {
        with_retry(&self.retry, "get_lead", || self.store.get_lead(lead_id)).await
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Run the due-send sweep every `interval_secs` until the task is aborted.
pub fn spawn_due_sweep(engine: Arc<SequenceEngine>, interval_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("⏰ Due-send sweep started (every {}s)", interval_secs);
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        loop {
            interval.tick().await;
            if let Err(e) = engine.run_due_sweep(Utc::now()).await {
                tracing::warn!("⚠️ Due-send sweep failed: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use leadpilot_core::config::ProgressionMode;
    use leadpilot_core::error::LeadPilotError;
    use leadpilot_core::traits::composer::TemplateComposer;
    use leadpilot_core::traits::store::{LeadStore, PatternStore, TemplateStore};
    use leadpilot_core::types::{DayBucket, MessageTemplate, default_stage_catalog};
    use leadpilot_db::MemoryStore;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl RecordingSender {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn bodies(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OutboundSender for RecordingSender {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, lead: &Lead, body: &str) -> Result<()> {
            if self.fail {
                return Err(LeadPilotError::Send("carrier rejected".into()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((lead.id.clone(), body.to_string()));
            Ok(())
        }
    }

    /// Wednesday 2026-10-14 11:00 New York.
    fn wednesday() -> DateTime<Utc> {
        chrono_tz::America::New_York
            .with_ymd_and_hms(2026, 10, 14, 11, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn setup(
        mode: ProgressionMode,
        sender: Arc<RecordingSender>,
    ) -> (Arc<MemoryStore>, SequenceEngine) {
        let store = Arc::new(MemoryStore::with_stages(default_stage_catalog()));
        for (id, stage, body) in [
            ("t-intro", "intro", "Hi {{first_name}}, thanks for your interest!"),
            ("t-f1", "follow_up_1", "Still thinking about it, {{first_name}}?"),
        ] {
            store
                .upsert_template(MessageTemplate::new(id, stage, "friendly", body))
                .await
                .unwrap();
        }
        let mut config = LeadPilotConfig::default();
        config.progression.mode = mode;
        let engine = SequenceEngine::new(
            store.clone(),
            &config,
            Arc::new(TemplateComposer::new(true)),
            sender,
        )
        .unwrap()
        .with_seed(42)
        .with_retry_policy(RetryPolicy::none());
        (store, engine)
    }

    #[tokio::test]
    async fn test_day_zero_lead_end_to_end() {
        let (store, engine) = setup(ProgressionMode::DayOffset, Arc::default()).await;
        let now = wednesday();
        let mut lead = Lead::new("lead-1", "Ana Ruiz");
        lead.created_at = now;
        store.insert_lead(lead).await.unwrap();

        let ScheduleOutcome::Scheduled(send) = engine.schedule_next_at("lead-1", now).await.unwrap()
        else {
            panic!("expected a scheduled send");
        };
        let stage = default_stage_catalog()
            .into_iter()
            .find(|s| s.stage == send.stage)
            .unwrap();
        assert_eq!(stage.day_bucket, Some(DayBucket::Day0));
        assert_eq!(send.template_id, "t-intro");
        assert!(send.scheduled_at >= now);
        assert!(engine.calculator().is_sendable(send.scheduled_at));

        let stored = store.get_lead("lead-1").await.unwrap().unwrap();
        assert_eq!(stored.current_stage, "intro");
        assert_eq!(stored.next_send_at, Some(send.scheduled_at));
    }

    #[tokio::test]
    async fn test_second_call_before_due_is_a_noop() {
        let (store, engine) = setup(ProgressionMode::Linear, Arc::default()).await;
        store.insert_lead(Lead::new("lead-1", "Ana")).await.unwrap();
        let now = wednesday();

        assert!(matches!(
            engine.schedule_next_at("lead-1", now).await.unwrap(),
            ScheduleOutcome::Scheduled(_)
        ));
        let version = store.get_lead("lead-1").await.unwrap().unwrap().version;
        assert_eq!(
            engine.schedule_next_at("lead-1", now).await.unwrap(),
            ScheduleOutcome::Skipped(SkipReason::AlreadyScheduled)
        );
        assert_eq!(store.get_lead("lead-1").await.unwrap().unwrap().version, version);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_advance_once() {
        let (store, engine) = setup(ProgressionMode::Linear, Arc::default()).await;
        store.insert_lead(Lead::new("lead-1", "Ana")).await.unwrap();
        let engine = Arc::new(engine);
        let now = wednesday();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.schedule_next_at("lead-1", now).await })
            })
            .collect();
        let mut scheduled = 0;
        for h in handles {
            if let ScheduleOutcome::Scheduled(_) = h.await.unwrap().unwrap() {
                scheduled += 1;
            }
        }
        assert_eq!(scheduled, 1);
        let lead = store.get_lead("lead-1").await.unwrap().unwrap();
        assert_eq!(lead.current_stage, "intro");
        assert_eq!(lead.version, 1);
    }

    #[tokio::test]
    async fn test_missing_template_terminates() {
        let (store, engine) = setup(ProgressionMode::Linear, Arc::default()).await;
        let mut lead = Lead::new("lead-1", "Ana");
        lead.current_stage = "follow_up_1".into();
        store.insert_lead(lead).await.unwrap();

        // follow_up_2 has no template.
        assert_eq!(
            engine.schedule_next_at("lead-1", wednesday()).await.unwrap(),
            ScheduleOutcome::Terminated
        );
        let lead = store.get_lead("lead-1").await.unwrap().unwrap();
        assert_eq!(lead.current_stage, "follow_up_1");
        assert!(lead.next_send_at.is_none());
    }

    #[tokio::test]
    async fn test_missing_lead() {
        let (_store, engine) = setup(ProgressionMode::Linear, Arc::default()).await;
        assert_eq!(
            engine.schedule_next("ghost").await.unwrap(),
            ScheduleOutcome::LeadMissing
        );
        assert!(engine.generate_message("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_sends_and_advances() {
        let sender = Arc::new(RecordingSender::default());
        let (store, engine) = setup(ProgressionMode::Linear, sender.clone()).await;
        store.insert_lead(Lead::new("lead-1", "Ana Ruiz")).await.unwrap();

        let ScheduleOutcome::Scheduled(send) =
            engine.schedule_next_at("lead-1", wednesday()).await.unwrap()
        else {
            panic!("expected a scheduled send");
        };

        // Nothing is due before the scheduled time.
        let early = engine
            .run_due_sweep(send.scheduled_at - Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(early.due, 0);

        let report = engine.run_due_sweep(send.scheduled_at).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(
            sender.bodies(),
            vec![("lead-1".to_string(), "Hi Ana, thanks for your interest!".to_string())]
        );

        assert_eq!(store.get_template("t-intro").await.unwrap().unwrap().total_sent, 1);
        assert_eq!(
            store.get_pattern("lead-1").await.unwrap().unwrap().total_messages_sent,
            1
        );
        let lead = store.get_lead("lead-1").await.unwrap().unwrap();
        assert_eq!(lead.current_stage, "follow_up_1");
        assert!(lead.next_send_at.unwrap() > send.scheduled_at);
    }

    #[tokio::test]
    async fn test_sweep_holds_recent_reply() {
        let sender = Arc::new(RecordingSender::default());
        let (store, engine) = setup(ProgressionMode::Linear, sender.clone()).await;
        store.insert_lead(Lead::new("lead-1", "Ana")).await.unwrap();
        let ScheduleOutcome::Scheduled(send) =
            engine.schedule_next_at("lead-1", wednesday()).await.unwrap()
        else {
            panic!("expected a scheduled send");
        };
        store
            .record_lead_reply("lead-1", send.scheduled_at - Duration::minutes(5))
            .await
            .unwrap();

        let report = engine.run_due_sweep(send.scheduled_at).await.unwrap();
        assert_eq!((report.due, report.sent, report.skipped), (1, 0, 1));
        assert!(sender.bodies().is_empty());
    }

    #[tokio::test]
    async fn test_paused_lead_is_not_due() {
        let sender = Arc::new(RecordingSender::default());
        let (store, engine) = setup(ProgressionMode::Linear, sender.clone()).await;
        store.insert_lead(Lead::new("lead-1", "Ana")).await.unwrap();
        let ScheduleOutcome::Scheduled(send) =
            engine.schedule_next_at("lead-1", wednesday()).await.unwrap()
        else {
            panic!("expected a scheduled send");
        };
        assert!(engine.pause_sequence("lead-1").await.unwrap());
        assert!(!engine.pause_sequence("lead-1").await.unwrap());

        let report = engine.run_due_sweep(send.scheduled_at).await.unwrap();
        assert_eq!(report.due, 0);
        assert!(sender.bodies().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_keeps_lead_due() {
        let sender = Arc::new(RecordingSender::failing());
        let (store, engine) = setup(ProgressionMode::Linear, sender).await;
        store.insert_lead(Lead::new("lead-1", "Ana")).await.unwrap();
        let ScheduleOutcome::Scheduled(send) =
            engine.schedule_next_at("lead-1", wednesday()).await.unwrap()
        else {
            panic!("expected a scheduled send");
        };

        let report = engine.run_due_sweep(send.scheduled_at).await.unwrap();
        assert_eq!(report.failed, 1);
        let lead = store.get_lead("lead-1").await.unwrap().unwrap();
        assert_eq!(lead.current_stage, "intro");
        assert!(lead.is_due(send.scheduled_at));
        assert_eq!(store.get_template("t-intro").await.unwrap().unwrap().total_sent, 0);
    }

    #[tokio::test]
    async fn test_ledger_failure_after_send_does_not_resend() {
        let sender = Arc::new(RecordingSender::default());
        let (store, engine) = setup(ProgressionMode::Linear, sender.clone()).await;
        store.insert_lead(Lead::new("lead-1", "Ana")).await.unwrap();
        let ScheduleOutcome::Scheduled(send) =
            engine.schedule_next_at("lead-1", wednesday()).await.unwrap()
        else {
            panic!("expected a scheduled send");
        };
        store.inject_failures("record_sent", 1);

        let first = engine.run_due_sweep(send.scheduled_at).await.unwrap();
        assert_eq!((first.sent, first.failed), (1, 0));
        let second = engine.run_due_sweep(send.scheduled_at).await.unwrap();
        assert_eq!(second.sent, 0);
        assert_eq!(sender.bodies().len(), 1);

        let lead = store.get_lead("lead-1").await.unwrap().unwrap();
        assert_eq!(lead.current_stage, "follow_up_1");
        assert!(lead.next_send_at.unwrap() > send.scheduled_at);
    }

    #[tokio::test]
    async fn test_schedule_failure_after_send_does_not_resend() {
        let sender = Arc::new(RecordingSender::default());
        let (store, engine) = setup(ProgressionMode::Linear, sender.clone()).await;
        store.insert_lead(Lead::new("lead-1", "Ana")).await.unwrap();
        let ScheduleOutcome::Scheduled(send) =
            engine.schedule_next_at("lead-1", wednesday()).await.unwrap()
        else {
            panic!("expected a scheduled send");
        };
        store.inject_failures("stage_configs", 1);

        let first = engine.run_due_sweep(send.scheduled_at).await.unwrap();
        assert_eq!((first.sent, first.failed), (1, 0));
        let lead = store.get_lead("lead-1").await.unwrap().unwrap();
        assert_eq!(lead.current_stage, "intro");
        assert!(lead.next_send_at.is_none());

        let second = engine.run_due_sweep(send.scheduled_at + Duration::days(30)).await.unwrap();
        assert_eq!(second.due, 0);
        assert_eq!(sender.bodies().len(), 1);
        assert_eq!(store.get_template("t-intro").await.unwrap().unwrap().total_sent, 1);

        // The next trigger picks the sequence back up.
        let ScheduleOutcome::Scheduled(next) = engine
            .schedule_next_at("lead-1", send.scheduled_at + Duration::minutes(5))
            .await
            .unwrap()
        else {
            panic!("expected a scheduled send");
        };
        assert_eq!(next.stage, "follow_up_1");
    }

    #[tokio::test]
    async fn test_dispatch_sends_the_scheduled_template() {
        let sender = Arc::new(RecordingSender::default());
        let (store, engine) = setup(ProgressionMode::Linear, sender.clone()).await;
        store.insert_lead(Lead::new("lead-1", "Ana")).await.unwrap();
        let ScheduleOutcome::Scheduled(send) =
            engine.schedule_next_at("lead-1", wednesday()).await.unwrap()
        else {
            panic!("expected a scheduled send");
        };
        let lead = store.get_lead("lead-1").await.unwrap().unwrap();
        assert_eq!(lead.scheduled_template_id.as_deref(), Some("t-intro"));

        // New variants added after scheduling do not change what goes out.
        for id in ["t-intro-b", "t-intro-c", "t-intro-d"] {
            let variant = MessageTemplate::new(id, "intro", "direct", "Hello {{first_name}}.");
            store.upsert_template(variant).await.unwrap();
        }
        engine.run_due_sweep(send.scheduled_at).await.unwrap();
        assert_eq!(
            sender.bodies(),
            vec![("lead-1".to_string(), "Hi Ana, thanks for your interest!".to_string())]
        );
        assert_eq!(store.get_template(&send.template_id).await.unwrap().unwrap().total_sent, 1);
    }

    #[tokio::test]
    async fn test_deactivated_scheduled_template_is_replaced() {
        let sender = Arc::new(RecordingSender::default());
        let (store, engine) = setup(ProgressionMode::Linear, sender.clone()).await;
        store.insert_lead(Lead::new("lead-1", "Ana")).await.unwrap();
        let ScheduleOutcome::Scheduled(send) =
            engine.schedule_next_at("lead-1", wednesday()).await.unwrap()
        else {
            panic!("expected a scheduled send");
        };
        let variant = MessageTemplate::new("t-intro-b", "intro", "direct", "Hello {{first_name}}.");
        store.upsert_template(variant).await.unwrap();
        let mut retired = store.get_template("t-intro").await.unwrap().unwrap();
        retired.active = false;
        store.upsert_template(retired).await.unwrap();

        engine.run_due_sweep(send.scheduled_at).await.unwrap();
        assert_eq!(sender.bodies(), vec![("lead-1".to_string(), "Hello Ana.".to_string())]);
    }

    #[tokio::test]
    async fn test_generate_message_for_current_stage() {
        let (store, engine) = setup(ProgressionMode::Linear, Arc::default()).await;
        store.insert_lead(Lead::new("lead-1", "Ana Ruiz")).await.unwrap();
        // Nothing to say before the first stage.
        assert!(engine.generate_message("lead-1").await.unwrap().is_none());

        let mut other = Lead::new("lead-2", "Bo Chen");
        other.current_stage = "follow_up_1".into();
        store.insert_lead(other).await.unwrap();

        let message = engine.generate_message("lead-2").await.unwrap().unwrap();
        assert_eq!(message.template_id, "t-f1");
        assert_eq!(message.body, "Still thinking about it, Bo?");
    }

    #[tokio::test]
    async fn test_reply_goes_through_learning() {
        let (store, engine) = setup(ProgressionMode::Linear, Arc::default()).await;
        store.insert_lead(Lead::new("lead-1", "Ana")).await.unwrap();
        let report = engine
            .on_inbound_reply("lead-1", None, wednesday())
            .await;
        assert!(report.pattern_updated);
        assert!(report.lead_marked);
        assert_eq!(
            engine.schedule_next_at("lead-1", wednesday() + Duration::hours(1)).await.unwrap(),
            ScheduleOutcome::Skipped(SkipReason::RecentReply)
        );
    }
}
