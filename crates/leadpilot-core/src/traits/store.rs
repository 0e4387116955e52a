//! Datastore traits: the abstract persistence boundary.
//!
//! Split by concern so a backend can be assembled from parts; `Datastore` is
//! the union every engine takes as `Arc<dyn Datastore>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::{
    ApprovalRequest, AssigneeStats, AutomationUpdate, ChangeEvent, Lead, MessageTemplate,
    NotificationRecord, ResponsePattern, RoutingRule, SentMessage, SmartRecommendation,
    StageConfig, WorkflowExecution,
};

/// Lead records.
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn insert_lead(&self, lead: Lead) -> Result<()>;

    async fn get_lead(&self, id: &str) -> Result<Option<Lead>>;

    /// Replace CRM-owned fields (status, attributes, assignee...). Emits
    /// `LeadUpdated`.
    async fn update_lead(&self, lead: Lead) -> Result<()>;

    /// Apply an automation write if the stored version still equals
    /// `expected_version`. Returns `Ok(false)` when another writer won.
    async fn apply_automation(
        &self,
        id: &str,
        expected_version: u64,
        update: AutomationUpdate,
    ) -> Result<bool>;

    /// Set `last_reply_at` (kept at the latest value seen).
    async fn record_lead_reply(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn assign_lead(&self, id: &str, assignee: &str) -> Result<()>;

    /// Leads whose `next_send_at <= now`, oldest due first.
    async fn due_leads(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Lead>>;

    /// Lead counts for one assignee among leads created since `since`.
    async fn assignee_stats(&self, assignee: &str, since: DateTime<Utc>) -> Result<AssigneeStats>;
}

/// Message templates and their counters.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn upsert_template(&self, template: MessageTemplate) -> Result<()>;

    async fn get_template(&self, id: &str) -> Result<Option<MessageTemplate>>;

    /// Active templates for a stage.
    async fn active_templates(&self, stage: &str) -> Result<Vec<MessageTemplate>>;

    /// Atomic `total_sent += 1`.
    async fn increment_template_sent(&self, id: &str) -> Result<()>;

    /// Atomic `total_responses += 1`.
    async fn increment_template_responses(&self, id: &str) -> Result<()>;
}

/// Read-mostly stage catalog.
#[async_trait]
pub trait StageStore: Send + Sync {
    async fn stage_configs(&self) -> Result<Vec<StageConfig>>;

    async fn replace_stage_configs(&self, stages: Vec<StageConfig>) -> Result<()>;
}

/// Per-lead response patterns.
#[async_trait]
pub trait PatternStore: Send + Sync {
    async fn get_pattern(&self, lead_id: &str) -> Result<Option<ResponsePattern>>;

    /// Insert or replace a pattern. An existing record keeps its
    /// `total_messages_sent`, which only `increment_pattern_sent` writes.
    async fn upsert_pattern(&self, pattern: ResponsePattern) -> Result<()>;

    /// Atomic `total_messages_sent += 1`, creating the record if needed.
    async fn increment_pattern_sent(&self, lead_id: &str) -> Result<()>;

    /// Fold one reply into the lead's pattern as a single atomic write,
    /// creating the record if needed. Returns the updated pattern.
    async fn record_pattern_reply(
        &self,
        lead_id: &str,
        hour: u32,
        day_of_week: u32,
        at: DateTime<Utc>,
    ) -> Result<ResponsePattern>;
}

/// Routing rule definitions and counters.
#[async_trait]
pub trait RoutingStore: Send + Sync {
    /// Insert or redefine a rule. Counters of an existing rule are kept.
    async fn upsert_rule(&self, rule: RoutingRule) -> Result<()>;

    async fn routing_rules(&self) -> Result<Vec<RoutingRule>>;

    /// Atomically advance the rule's round-robin cursor, returning the value
    /// before the increment.
    async fn advance_rule_cursor(&self, rule_id: &str) -> Result<u64>;

    async fn record_rule_assignment(&self, rule_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Write-only sinks plus the sent-message ledger.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn record_sent(&self, message: SentMessage) -> Result<()>;

    async fn get_sent(&self, message_id: &str) -> Result<Option<SentMessage>>;

    async fn last_sent_for_lead(&self, lead_id: &str) -> Result<Option<SentMessage>>;

    async fn enqueue_approval(&self, request: ApprovalRequest) -> Result<()>;

    async fn approvals(&self, lead_id: &str) -> Result<Vec<ApprovalRequest>>;

    async fn insert_notification(&self, notification: NotificationRecord) -> Result<()>;

    async fn notifications(&self, lead_id: &str) -> Result<Vec<NotificationRecord>>;

    /// Audit trail of generated recommendations.
    async fn record_recommendations(
        &self,
        lead_id: &str,
        recommendations: &[SmartRecommendation],
    ) -> Result<()>;
}

/// Externally visible workflow executions.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()>;

    async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>>;

    /// All executions, optionally for one workflow.
    async fn executions(&self, workflow: Option<&str>) -> Result<Vec<WorkflowExecution>>;

    /// Executions created at or after `since`, oldest first.
    async fn executions_since(&self, since: DateTime<Utc>) -> Result<Vec<WorkflowExecution>>;
}

/// Change notifications.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Publish an event that did not originate from a store write (inbound replies).
    fn publish(&self, event: ChangeEvent);
}

/// Everything the engines need from persistence.
pub trait Datastore:
    LeadStore
    + TemplateStore
    + StageStore
    + PatternStore
    + RoutingStore
    + OutboxStore
    + ExecutionStore
    + ChangeFeed
{
}

impl<T> Datastore for T where
    T: LeadStore
        + TemplateStore
        + StageStore
        + PatternStore
        + RoutingStore
        + OutboxStore
        + ExecutionStore
        + ChangeFeed
{
}
