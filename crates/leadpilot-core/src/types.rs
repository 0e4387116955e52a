//! Data model shared by every LeadPilot crate.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LeadPilotError;

/// Size of the per-lead reply-time windows.
pub const PATTERN_WINDOW: usize = 10;

// ─── Leads ──────────────────────────────────────────────────

/// CRM status of a lead. Owned by external CRM logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    #[default]
    New,
    Contacted,
    Engaged,
    Qualified,
    Converted,
    Lost,
}

impl LeadStatus {
    /// Converted and lost leads take no further automation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeadStatus::Converted | LeadStatus::Lost)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Contacted => "contacted",
            LeadStatus::Engaged => "engaged",
            LeadStatus::Qualified => "qualified",
            LeadStatus::Converted => "converted",
            LeadStatus::Lost => "lost",
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = LeadPilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(LeadStatus::New),
            "contacted" => Ok(LeadStatus::Contacted),
            "engaged" => Ok(LeadStatus::Engaged),
            "qualified" => Ok(LeadStatus::Qualified),
            "converted" => Ok(LeadStatus::Converted),
            "lost" => Ok(LeadStatus::Lost),
            other => Err(LeadPilotError::Validation(format!(
                "unknown lead status '{other}'"
            ))),
        }
    }
}

/// A sales lead plus its automation state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lead {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: LeadStatus,
    pub assigned_to: Option<String>,
    /// Free-form CRM attributes (source, budget, vehicle interest...). Routing
    /// conditions read these.
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Last stage scheduled for this lead.
    pub current_stage: String,
    /// When the message for `current_stage` is due. `None` = nothing scheduled.
    pub next_send_at: Option<DateTime<Utc>>,
    /// Template picked when the pending send was scheduled.
    #[serde(default)]
    pub scheduled_template_id: Option<String>,
    pub sequence_paused: bool,
    pub opted_in: bool,
    pub last_reply_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every automation write; used for compare-and-swap.
    #[serde(default)]
    pub version: u64,
}

impl Lead {
    /// Stage of a lead that entered the sequence but has nothing scheduled yet.
    pub const INITIAL_STAGE: &'static str = "initial";

    /// Create a fresh, opted-in lead at the initial stage.
    pub fn new(id: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            status: LeadStatus::New,
            assigned_to: None,
            attributes: serde_json::Map::new(),
            current_stage: Self::INITIAL_STAGE.to_string(),
            next_send_at: None,
            scheduled_template_id: None,
            sequence_paused: false,
            opted_in: true,
            last_reply_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attribute(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Whether the scheduled message for the current stage is due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_send_at.is_some_and(|at| at <= now)
    }

    /// Whole days elapsed since creation (never negative).
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days().max(0)
    }

    /// Attribute lookup as a string, for composition and display.
    pub fn attribute_str(&self, key: &str) -> Option<String> {
        self.attributes.get(key).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Automation write applied to a lead under compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub enum AutomationUpdate {
    /// Move to `stage`, due at `next_send_at`, sending `template_id`.
    Advance {
        stage: String,
        next_send_at: DateTime<Utc>,
        template_id: Option<String>,
    },
    /// Clear the pending send, keep the stage. Ends an exhausted sequence and
    /// claims a due send before delivery.
    Terminate,
    /// Stop the sequence: set `sequence_paused`, clear `next_send_at`.
    Pause,
}

impl AutomationUpdate {
    /// Apply the update to an in-memory lead (stores share this logic).
    pub fn apply(&self, lead: &mut Lead, now: DateTime<Utc>) {
        match self {
            AutomationUpdate::Advance {
                stage,
                next_send_at,
                template_id,
            } => {
                lead.current_stage = stage.clone();
                lead.next_send_at = Some(*next_send_at);
                lead.scheduled_template_id = template_id.clone();
            }
            AutomationUpdate::Terminate => {
                lead.next_send_at = None;
                lead.scheduled_template_id = None;
            }
            AutomationUpdate::Pause => {
                lead.sequence_paused = true;
                lead.next_send_at = None;
                lead.scheduled_template_id = None;
            }
        }
        lead.version += 1;
        lead.updated_at = now;
    }
}

// ─── Templates & stages ─────────────────────────────────────

/// A message template variant for one stage, with running counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageTemplate {
    pub id: String,
    pub stage: String,
    pub variant_name: String,
    /// Body with `{{placeholder}}` tokens.
    pub body: String,
    #[serde(default = "bool_true")]
    pub active: bool,
    #[serde(default)]
    pub total_sent: u64,
    #[serde(default)]
    pub total_responses: u64,
}

fn bool_true() -> bool {
    true
}

impl MessageTemplate {
    pub fn new(id: &str, stage: &str, variant_name: &str, body: &str) -> Self {
        Self {
            id: id.to_string(),
            stage: stage.to_string(),
            variant_name: variant_name.to_string(),
            body: body.to_string(),
            active: true,
            total_sent: 0,
            total_responses: 0,
        }
    }

    /// `total_responses / total_sent`, 0 when nothing was sent.
    pub fn response_rate(&self) -> f64 {
        if self.total_sent == 0 {
            0.0
        } else {
            self.total_responses as f64 / self.total_sent as f64
        }
    }
}

/// Lead-age bucket for the day-offset progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayBucket {
    /// Day 0.
    Day0,
    /// Days 1–7.
    Week1,
    /// Days 8–14.
    Week2,
    /// Days 15–45.
    Month1,
    /// Days 46–90.
    Quarter,
}

impl DayBucket {
    pub const ALL: [DayBucket; 5] = [
        DayBucket::Day0,
        DayBucket::Week1,
        DayBucket::Week2,
        DayBucket::Month1,
        DayBucket::Quarter,
    ];

    /// Inclusive day range covered by the bucket.
    pub fn days(&self) -> (i64, i64) {
        match self {
            DayBucket::Day0 => (0, 0),
            DayBucket::Week1 => (1, 7),
            DayBucket::Week2 => (8, 14),
            DayBucket::Month1 => (15, 45),
            DayBucket::Quarter => (46, 90),
        }
    }

    /// Bucket for a lead of the given age; `None` past day 90.
    pub fn for_age(days: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|b| {
            let (lo, hi) = b.days();
            days >= lo && days <= hi
        })
    }
}

/// One entry of the ordered stage catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageConfig {
    pub stage: String,
    /// Delay after the prior stage's send.
    pub delay_hours: u32,
    pub jitter_minutes: u32,
    /// Business-local hours preferred for this stage.
    #[serde(default)]
    pub preferred_hours: Vec<u32>,
    #[serde(default)]
    pub priority: i32,
    /// Age bucket, used only by the day-offset progression.
    #[serde(default)]
    pub day_bucket: Option<DayBucket>,
}

impl StageConfig {
    pub fn new(stage: &str, delay_hours: u32, jitter_minutes: u32) -> Self {
        Self {
            stage: stage.to_string(),
            delay_hours,
            jitter_minutes,
            preferred_hours: Vec::new(),
            priority: 0,
            day_bucket: None,
        }
    }

    pub fn with_hours(mut self, hours: &[u32]) -> Self {
        self.preferred_hours = hours.to_vec();
        self
    }

    pub fn in_bucket(mut self, bucket: DayBucket) -> Self {
        self.day_bucket = Some(bucket);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Built-in follow-up catalog used when no stages are configured.
pub fn default_stage_catalog() -> Vec<StageConfig> {
    vec![
        StageConfig::new("intro", 0, 15)
            .with_hours(&[10, 11, 14])
            .in_bucket(DayBucket::Day0)
            .with_priority(10),
        StageConfig::new("follow_up_1", 24, 60)
            .with_hours(&[10, 14, 16])
            .in_bucket(DayBucket::Week1)
            .with_priority(8),
        StageConfig::new("follow_up_2", 72, 90)
            .with_hours(&[11, 15])
            .in_bucket(DayBucket::Week1)
            .with_priority(7),
        StageConfig::new("value_add", 168, 120)
            .with_hours(&[10, 13])
            .in_bucket(DayBucket::Week2)
            .with_priority(5),
        StageConfig::new("check_in", 336, 180)
            .with_hours(&[11, 16])
            .in_bucket(DayBucket::Month1)
            .with_priority(3),
        StageConfig::new("last_touch", 720, 240)
            .with_hours(&[10, 15])
            .in_bucket(DayBucket::Quarter)
            .with_priority(1),
    ]
}

// ─── Response patterns ──────────────────────────────────────

/// Per-lead reply-time history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResponsePattern {
    pub lead_id: String,
    /// Business-local hours of the last replies, oldest first.
    pub best_response_hours: VecDeque<u32>,
    /// Days of week of the last replies (0 = Sunday), oldest first.
    pub best_response_days: VecDeque<u32>,
    pub total_messages_sent: u64,
    pub total_responses: u64,
    pub last_response_at: Option<DateTime<Utc>>,
    /// Variant names the lead responds to best.
    #[serde(default)]
    pub preferred_content_types: Vec<String>,
}

impl ResponsePattern {
    pub fn new(lead_id: &str) -> Self {
        Self {
            lead_id: lead_id.to_string(),
            ..Default::default()
        }
    }

    /// Record a reply. Windows keep the newest `PATTERN_WINDOW` entries.
    pub fn record_reply(&mut self, hour: u32, day_of_week: u32, at: DateTime<Utc>) {
        push_bounded(&mut self.best_response_hours, hour);
        push_bounded(&mut self.best_response_days, day_of_week);
        self.total_responses += 1;
        self.last_response_at = Some(at);
    }

    /// Preferred hours as a sorted, de-duplicated list.
    pub fn preferred_hours(&self) -> Vec<u32> {
        let mut hours: Vec<u32> = self.best_response_hours.iter().copied().collect();
        hours.sort_unstable();
        hours.dedup();
        hours
    }
}

fn push_bounded(window: &mut VecDeque<u32>, value: u32) {
    window.push_back(value);
    while window.len() > PATTERN_WINDOW {
        window.pop_front();
    }
}

// ─── Sends ──────────────────────────────────────────────────

/// A send decided by the progression engine. Consumed once by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledSend {
    pub lead_id: String,
    pub template_id: String,
    pub stage: String,
    pub scheduled_at: DateTime<Utc>,
    pub jitter_applied_minutes: i64,
}

/// A message that actually went out; lets replies be attributed to templates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentMessage {
    pub id: String,
    pub lead_id: String,
    pub template_id: String,
    pub stage: String,
    pub sent_at: DateTime<Utc>,
}

impl SentMessage {
    pub fn new(lead_id: &str, template_id: &str, stage: &str, sent_at: DateTime<Utc>) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            lead_id: lead_id.to_string(),
            template_id: template_id.to_string(),
            stage: stage.to_string(),
            sent_at,
        }
    }
}

// ─── Routing ────────────────────────────────────────────────

/// Comparison applied by a routing condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    NotContains,
}

impl FromStr for ConditionOperator {
    type Err = LeadPilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "equals" => Ok(Self::Equals),
            "not_equals" => Ok(Self::NotEquals),
            "greater_than" => Ok(Self::GreaterThan),
            "less_than" => Ok(Self::LessThan),
            "contains" => Ok(Self::Contains),
            "not_contains" => Ok(Self::NotContains),
            other => Err(LeadPilotError::Validation(format!(
                "unknown condition operator '{other}'"
            ))),
        }
    }
}

/// How a condition joins the result of the conditions before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// One predicate of a routing rule. `operator` stays a string so a malformed
/// rule can be loaded and then skipped at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub logic: LogicalOperator,
}

impl Condition {
    pub fn new(field: &str, operator: &str, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.to_string(),
            operator: operator.to_string(),
            value: value.into(),
            logic: LogicalOperator::And,
        }
    }

    pub fn or(mut self) -> Self {
        self.logic = LogicalOperator::Or;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    RoundRobin,
    PerformanceBased,
    WorkloadBalanced,
    ExpertiseMatch,
}

/// Per-rule assignment counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RuleCounters {
    pub assignments: u64,
    pub last_assigned_at: Option<DateTime<Utc>>,
    /// Persisted round-robin cursor.
    pub cursor: u64,
}

/// A prioritized condition → assignment mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingRule {
    pub id: String,
    pub name: String,
    pub conditions: Vec<Condition>,
    pub strategy: AssignmentStrategy,
    pub pool: Vec<String>,
    pub priority: i32,
    pub is_active: bool,
    #[serde(default)]
    pub counters: RuleCounters,
}

impl RoutingRule {
    pub fn new(id: &str, name: &str, strategy: AssignmentStrategy, pool: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            conditions: Vec::new(),
            strategy,
            pool: pool.iter().map(|s| s.to_string()).collect(),
            priority: 5,
            is_active: true,
            counters: RuleCounters::default(),
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Lead counts for one assignee over a trailing window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AssigneeStats {
    pub assignee: String,
    pub total_leads: u64,
    pub converted_leads: u64,
    /// Leads in a non-terminal status.
    pub active_leads: u64,
}

impl AssigneeStats {
    pub fn conversion_rate(&self) -> f64 {
        if self.total_leads == 0 {
            0.0
        } else {
            self.converted_leads as f64 / self.total_leads as f64
        }
    }
}

// ─── Recommendations ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationType {
    Immediate,
    Scheduled,
    Reminder,
}

impl RecommendationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Scheduled => "scheduled",
            Self::Reminder => "reminder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl RecommendationPriority {
    /// Sort rank; lower ranks first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

/// A ranked, context-derived next action for a lead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmartRecommendation {
    pub id: String,
    pub action: String,
    pub rec_type: RecommendationType,
    pub priority: RecommendationPriority,
    pub confidence: f64,
    pub success_probability: f64,
    pub context_factors: Vec<String>,
    pub expected_outcome: String,
    pub time_to_execute_minutes: u32,
    pub related_actions: Vec<String>,
    pub automatable: bool,
}

/// Urgency attached to approval-queue entries and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl From<RecommendationPriority> for Urgency {
    fn from(p: RecommendationPriority) -> Self {
        match p {
            RecommendationPriority::Critical => Urgency::Critical,
            RecommendationPriority::High => Urgency::High,
            RecommendationPriority::Medium => Urgency::Medium,
            RecommendationPriority::Low => Urgency::Low,
        }
    }
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }
}

/// Entry of the message-approval queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub id: String,
    pub lead_id: String,
    pub content: String,
    pub urgency: Urgency,
    pub scheduled_send_at: DateTime<Utc>,
    pub auto_approved: bool,
    pub created_at: DateTime<Utc>,
}

/// Entry of the notification sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRecord {
    pub id: String,
    pub lead_id: String,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub urgency: Urgency,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

// ─── Workflow executions ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = LeadPilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(LeadPilotError::Validation(format!(
                "unknown execution status '{other}'"
            ))),
        }
    }
}

/// One run of a workflow for one trigger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    /// Correlation id.
    pub id: String,
    pub workflow: String,
    pub trigger: String,
    pub lead_id: Option<String>,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub successful_actions: u32,
    pub failed_actions: u32,
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn new(workflow: &str, trigger: &str, lead_id: Option<&str>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow: workflow.to_string(),
            trigger: trigger.to_string(),
            lead_id: lead_id.map(str::to_string),
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            successful_actions: 0,
            failed_actions: 0,
            error: None,
        }
    }

    /// pending → running. Returns false for any other source state.
    pub fn start(&mut self) -> bool {
        if self.status != ExecutionStatus::Pending {
            return false;
        }
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    pub fn record_action(&mut self, ok: bool) {
        if ok {
            self.successful_actions += 1;
        } else {
            self.failed_actions += 1;
        }
    }

    /// running → completed.
    pub fn complete(&mut self) -> bool {
        if self.status != ExecutionStatus::Running {
            return false;
        }
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(Utc::now());
        true
    }

    /// running → failed.
    pub fn fail(&mut self, error: &str) -> bool {
        if self.status != ExecutionStatus::Running {
            return false;
        }
        self.status = ExecutionStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
        true
    }
}

// ─── Change feed ────────────────────────────────────────────

/// Datastore change notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChangeEvent {
    LeadCreated { lead: Lead },
    LeadUpdated { before: Lead, after: Lead },
    InboundReply {
        lead_id: String,
        message_id: Option<String>,
        replied_at: DateTime<Utc>,
    },
}

impl ChangeEvent {
    pub fn lead_id(&self) -> &str {
        match self {
            ChangeEvent::LeadCreated { lead } => &lead.id,
            ChangeEvent::LeadUpdated { after, .. } => &after.id,
            ChangeEvent::InboundReply { lead_id, .. } => lead_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_response_rate_zero_when_unsent() {
        let mut t = MessageTemplate::new("t1", "intro", "friendly", "Hi {{first_name}}");
        assert_eq!(t.response_rate(), 0.0);
        t.total_sent = 4;
        t.total_responses = 1;
        assert!((t.response_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pattern_window_keeps_newest() {
        let mut p = ResponsePattern::new("lead-1");
        let now = Utc::now();
        for h in 0..15 {
            p.record_reply(h, h % 7, now);
        }
        assert_eq!(p.best_response_hours.len(), PATTERN_WINDOW);
        assert_eq!(p.best_response_days.len(), PATTERN_WINDOW);
        let hours: Vec<u32> = p.best_response_hours.iter().copied().collect();
        assert_eq!(hours, (5..15).collect::<Vec<u32>>());
        assert_eq!(p.total_responses, 15);
    }

    #[test]
    fn test_day_buckets() {
        assert_eq!(DayBucket::for_age(0), Some(DayBucket::Day0));
        assert_eq!(DayBucket::for_age(1), Some(DayBucket::Week1));
        assert_eq!(DayBucket::for_age(7), Some(DayBucket::Week1));
        assert_eq!(DayBucket::for_age(8), Some(DayBucket::Week2));
        assert_eq!(DayBucket::for_age(45), Some(DayBucket::Month1));
        assert_eq!(DayBucket::for_age(90), Some(DayBucket::Quarter));
        assert_eq!(DayBucket::for_age(91), None);
    }

    #[test]
    fn test_execution_state_machine() {
        let mut exec = WorkflowExecution::new("lead_intake", "lead_created", Some("lead-1"));
        assert!(!exec.complete(), "cannot complete before running");
        assert!(exec.start());
        assert!(!exec.start());
        exec.record_action(true);
        exec.record_action(false);
        assert!(exec.complete());
        assert!(!exec.fail("late"));
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!((exec.successful_actions, exec.failed_actions), (1, 1));
    }

    #[test]
    fn test_automation_update_bumps_version() {
        let mut lead = Lead::new("lead-1", "Ana");
        let at = Utc::now() + Duration::hours(2);
        AutomationUpdate::Advance {
            stage: "intro".into(),
            next_send_at: at,
            template_id: Some("t-intro".into()),
        }
        .apply(&mut lead, Utc::now());
        assert_eq!(lead.current_stage, "intro");
        assert_eq!(lead.next_send_at, Some(at));
        assert_eq!(lead.scheduled_template_id.as_deref(), Some("t-intro"));
        assert_eq!(lead.version, 1);

        AutomationUpdate::Pause.apply(&mut lead, Utc::now());
        assert!(lead.sequence_paused);
        assert!(lead.next_send_at.is_none());
        assert!(lead.scheduled_template_id.is_none());
        assert_eq!(lead.version, 2);
    }

    #[test]
    fn test_unknown_operator_is_validation_error() {
        let err = "approximately".parse::<ConditionOperator>().unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
