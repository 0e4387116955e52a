//! In-process datastore. Same semantics as the SQLite store; used by tests and
//! single-process deployments.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use leadpilot_core::error::{LeadPilotError, Result};
use leadpilot_core::traits::store::{
    ChangeFeed, ExecutionStore, LeadStore, OutboxStore, PatternStore, RoutingStore, StageStore,
    TemplateStore,
};
use leadpilot_core::types::{
    ApprovalRequest, AssigneeStats, AutomationUpdate, ChangeEvent, Lead, LeadStatus,
    MessageTemplate, NotificationRecord, ResponsePattern, RoutingRule, SentMessage,
    SmartRecommendation, StageConfig, WorkflowExecution,
};

use crate::FEED_CAPACITY;

#[derive(Default)]
struct Inner {
    leads: HashMap<String, Lead>,
    templates: HashMap<String, MessageTemplate>,
    stages: Vec<StageConfig>,
    patterns: HashMap<String, ResponsePattern>,
    rules: HashMap<String, RoutingRule>,
    sent: Vec<SentMessage>,
    approvals: Vec<ApprovalRequest>,
    notifications: Vec<NotificationRecord>,
    recommendations: Vec<(String, SmartRecommendation)>,
    executions: HashMap<String, WorkflowExecution>,
    /// Remaining injected failures per operation name.
    faults: HashMap<String, u32>,
}

/// In-memory datastore.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Start with a stage catalog.
    pub fn with_stages(stages: Vec<StageConfig>) -> Self {
        let store = Self::new();
        if let Ok(mut inner) = store.inner.lock() {
            inner.stages = stages;
        }
        store
    }

    /// Make the next `count` calls of `op` fail with a transient store error.
    pub fn inject_failures(&self, op: &str, count: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.faults.insert(op.to_string(), count);
        }
    }

    /// Recommendations recorded for a lead (audit trail).
    pub fn recorded_recommendations(&self, lead_id: &str) -> Vec<SmartRecommendation> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .recommendations
                    .iter()
                    .filter(|(id, _)| id == lead_id)
                    .map(|(_, r)| r.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self, op: &str) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| LeadPilotError::Store(e.to_string()))?;
        if let Some(remaining) = inner.faults.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LeadPilotError::Store(format!("injected failure: {op}")));
            }
        }
        Ok(inner)
    }

    fn emit(&self, event: ChangeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn insert_lead(&self, lead: Lead) -> Result<()> {
        {
            let mut inner = self.lock("insert_lead")?;
            if inner.leads.contains_key(&lead.id) {
                return Err(LeadPilotError::Validation(format!(
                    "lead '{}' already exists",
                    lead.id
                )));
            }
            inner.leads.insert(lead.id.clone(), lead.clone());
        }
        self.emit(ChangeEvent::LeadCreated { lead });
        Ok(())
    }

    async fn get_lead(&self, id: &str) -> Result<Option<Lead>> {
        Ok(self.lock("get_lead")?.leads.get(id).cloned())
    }

    async fn update_lead(&self, lead: Lead) -> Result<()> {
        let (before, after) = {
            let mut inner = self.lock("update_lead")?;
            let stored = inner
                .leads
                .get_mut(&lead.id)
                .ok_or_else(|| LeadPilotError::NotFound(format!("lead '{}'", lead.id)))?;
            let before = stored.clone();
            stored.name = lead.name;
            stored.status = lead.status;
            stored.assigned_to = lead.assigned_to;
            stored.attributes = lead.attributes;
            stored.opted_in = lead.opted_in;
            stored.sequence_paused = lead.sequence_paused;
            stored.version += 1;
            stored.updated_at = Utc::now();
            (before, stored.clone())
        };
        self.emit(ChangeEvent::LeadUpdated { before, after });
        Ok(())
    }

    async fn apply_automation(
        &self,
        id: &str,
        expected_version: u64,
        update: AutomationUpdate,
    ) -> Result<bool> {
        let (before, after) = {
            let mut inner = self.lock("apply_automation")?;
            let stored = inner
                .leads
                .get_mut(id)
                .ok_or_else(|| LeadPilotError::NotFound(format!("lead '{id}'")))?;
            if stored.version != expected_version {
                return Ok(false);
            }
            let before = stored.clone();
            update.apply(stored, Utc::now());
            (before, stored.clone())
        };
        self.emit(ChangeEvent::LeadUpdated { before, after });
        Ok(true)
    }

    async fn record_lead_reply(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock("record_lead_reply")?;
        let stored = inner
            .leads
            .get_mut(id)
            .ok_or_else(|| LeadPilotError::NotFound(format!("lead '{id}'")))?;
        if stored.last_reply_at.is_none_or(|prev| prev < at) {
            stored.last_reply_at = Some(at);
        }
        Ok(())
    }

    async fn assign_lead(&self, id: &str, assignee: &str) -> Result<()> {
        let mut inner = self.lock("assign_lead")?;
        let stored = inner
            .leads
            .get_mut(id)
            .ok_or_else(|| LeadPilotError::NotFound(format!("lead '{id}'")))?;
        stored.assigned_to = Some(assignee.to_string());
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn due_leads(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Lead>> {
        let inner = self.lock("due_leads")?;
        let mut due: Vec<Lead> = inner
            .leads
            .values()
            .filter(|l| l.opted_in && !l.sequence_paused && l.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_send_at.cmp(&b.next_send_at).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn assignee_stats(&self, assignee: &str, since: DateTime<Utc>) -> Result<AssigneeStats> {
        let inner = self.lock("assignee_stats")?;
        let mut stats = AssigneeStats {
            assignee: assignee.to_string(),
            ..Default::default()
        };
        for lead in inner.leads.values() {
            if lead.assigned_to.as_deref() != Some(assignee) || lead.created_at < since {
                continue;
            }
            stats.total_leads += 1;
            if lead.status == LeadStatus::Converted {
                stats.converted_leads += 1;
            }
            if !lead.status.is_terminal() {
                stats.active_leads += 1;
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl TemplateStore for MemoryStore {
    async fn upsert_template(&self, template: MessageTemplate) -> Result<()> {
        let mut inner = self.lock("upsert_template")?;
        inner.templates.insert(template.id.clone(), template);
        Ok(())
    }

    async fn get_template(&self, id: &str) -> Result<Option<MessageTemplate>> {
        Ok(self.lock("get_template")?.templates.get(id).cloned())
    }

    async fn active_templates(&self, stage: &str) -> Result<Vec<MessageTemplate>> {
        let inner = self.lock("active_templates")?;
        let mut templates: Vec<MessageTemplate> = inner
            .templates
            .values()
            .filter(|t| t.active && t.stage == stage)
            .cloned()
            .collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(templates)
    }

    async fn increment_template_sent(&self, id: &str) -> Result<()> {
        let mut inner = self.lock("increment_template_sent")?;
        let t = inner
            .templates
            .get_mut(id)
            .ok_or_else(|| LeadPilotError::NotFound(format!("template '{id}'")))?;
        t.total_sent += 1;
        Ok(())
    }

    async fn increment_template_responses(&self, id: &str) -> Result<()> {
        let mut inner = self.lock("increment_template_responses")?;
        let t = inner
            .templates
            .get_mut(id)
            .ok_or_else(|| LeadPilotError::NotFound(format!("template '{id}'")))?;
        t.total_responses += 1;
        Ok(())
    }
}

#[async_trait]
impl StageStore for MemoryStore {
    async fn stage_configs(&self) -> Result<Vec<StageConfig>> {
        Ok(self.lock("stage_configs")?.stages.clone())
    }

    async fn replace_stage_configs(&self, stages: Vec<StageConfig>) -> Result<()> {
        self.lock("replace_stage_configs")?.stages = stages;
        Ok(())
    }
}

#[async_trait]
impl PatternStore for MemoryStore {
    async fn get_pattern(&self, lead_id: &str) -> Result<Option<ResponsePattern>> {
        Ok(self.lock("get_pattern")?.patterns.get(lead_id).cloned())
    }

    async fn upsert_pattern(&self, mut pattern: ResponsePattern) -> Result<()> {
        let mut inner = self.lock("upsert_pattern")?;
        if let Some(existing) = inner.patterns.get(&pattern.lead_id) {
            pattern.total_messages_sent = existing.total_messages_sent;
        }
        inner.patterns.insert(pattern.lead_id.clone(), pattern);
        Ok(())
    }

    async fn increment_pattern_sent(&self, lead_id: &str) -> Result<()> {
        let mut inner = self.lock("increment_pattern_sent")?;
        inner
            .patterns
            .entry(lead_id.to_string())
            .or_insert_with(|| ResponsePattern::new(lead_id))
            .total_messages_sent += 1;
        Ok(())
    }

    async fn record_pattern_reply(
        &self,
        lead_id: &str,
        hour: u32,
        day_of_week: u32,
        at: DateTime<Utc>,
    ) -> Result<ResponsePattern> {
        let mut inner = self.lock("record_pattern_reply")?;
        let pattern = inner
            .patterns
            .entry(lead_id.to_string())
            .or_insert_with(|| ResponsePattern::new(lead_id));
        pattern.record_reply(hour, day_of_week, at);
        Ok(pattern.clone())
    }
}

#[async_trait]
impl RoutingStore for MemoryStore {
    async fn upsert_rule(&self, mut rule: RoutingRule) -> Result<()> {
        let mut inner = self.lock("upsert_rule")?;
        if let Some(existing) = inner.rules.get(&rule.id) {
            rule.counters = existing.counters.clone();
        }
        inner.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    async fn routing_rules(&self) -> Result<Vec<RoutingRule>> {
        let inner = self.lock("routing_rules")?;
        let mut rules: Vec<RoutingRule> = inner.rules.values().cloned().collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules)
    }

    async fn advance_rule_cursor(&self, rule_id: &str) -> Result<u64> {
        let mut inner = self.lock("advance_rule_cursor")?;
        let rule = inner
            .rules
            .get_mut(rule_id)
            .ok_or_else(|| LeadPilotError::NotFound(format!("rule '{rule_id}'")))?;
        let previous = rule.counters.cursor;
        rule.counters.cursor += 1;
        Ok(previous)
    }

    async fn record_rule_assignment(&self, rule_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock("record_rule_assignment")?;
        let rule = inner
            .rules
            .get_mut(rule_id)
            .ok_or_else(|| LeadPilotError::NotFound(format!("rule '{rule_id}'")))?;
        rule.counters.assignments += 1;
        rule.counters.last_assigned_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn record_sent(&self, message: SentMessage) -> Result<()> {
        self.lock("record_sent")?.sent.push(message);
        Ok(())
    }

    async fn get_sent(&self, message_id: &str) -> Result<Option<SentMessage>> {
        let inner = self.lock("get_sent")?;
        Ok(inner.sent.iter().find(|m| m.id == message_id).cloned())
    }

    async fn last_sent_for_lead(&self, lead_id: &str) -> Result<Option<SentMessage>> {
        let inner = self.lock("last_sent_for_lead")?;
        Ok(inner
            .sent
            .iter()
            .filter(|m| m.lead_id == lead_id)
            .max_by_key(|m| m.sent_at)
            .cloned())
    }

    async fn enqueue_approval(&self, request: ApprovalRequest) -> Result<()> {
        self.lock("enqueue_approval")?.approvals.push(request);
        Ok(())
    }

    async fn approvals(&self, lead_id: &str) -> Result<Vec<ApprovalRequest>> {
        let inner = self.lock("approvals")?;
        Ok(inner
            .approvals
            .iter()
            .filter(|a| a.lead_id == lead_id)
            .cloned()
            .collect())
    }

    async fn insert_notification(&self, notification: NotificationRecord) -> Result<()> {
        self.lock("insert_notification")?
            .notifications
            .push(notification);
        Ok(())
    }

    async fn notifications(&self, lead_id: &str) -> Result<Vec<NotificationRecord>> {
        let inner = self.lock("notifications")?;
        Ok(inner
            .notifications
            .iter()
            .filter(|n| n.lead_id == lead_id)
            .cloned()
            .collect())
    }

    async fn record_recommendations(
        &self,
        lead_id: &str,
        recommendations: &[SmartRecommendation],
    ) -> Result<()> {
        let mut inner = self.lock("record_recommendations")?;
        inner.recommendations.extend(
            recommendations
                .iter()
                .map(|r| (lead_id.to_string(), r.clone())),
        );
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let mut inner = self.lock("save_execution")?;
        inner
            .executions
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        Ok(self.lock("get_execution")?.executions.get(id).cloned())
    }

    async fn executions(&self, workflow: Option<&str>) -> Result<Vec<WorkflowExecution>> {
        let inner = self.lock("executions")?;
        let mut list: Vec<WorkflowExecution> = inner
            .executions
            .values()
            .filter(|e| workflow.is_none_or(|w| e.workflow == w))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn executions_since(&self, since: DateTime<Utc>) -> Result<Vec<WorkflowExecution>> {
        let inner = self.lock("executions_since")?;
        let mut list: Vec<WorkflowExecution> = inner
            .executions
            .values()
            .filter(|e| e.created_at >= since)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }
}

impl ChangeFeed for MemoryStore {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ChangeEvent) {
        self.emit(event);
    }
}
