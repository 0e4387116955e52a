//! SQLite-backed datastore. Survives restarts; counters are updated with
//! atomic `x = x + 1` statements and automation writes are guarded by the
//! lead's version column.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use leadpilot_core::error::{LeadPilotError, Result};
use leadpilot_core::traits::store::{
    ChangeFeed, ExecutionStore, LeadStore, OutboxStore, PatternStore, RoutingStore, StageStore,
    TemplateStore,
};
use leadpilot_core::types::{
    ApprovalRequest, AssigneeStats, AutomationUpdate, ChangeEvent, Lead, MessageTemplate,
    NotificationRecord, ResponsePattern, RoutingRule, RuleCounters, SentMessage,
    SmartRecommendation, StageConfig, WorkflowExecution,
};

use crate::FEED_CAPACITY;

const LEAD_COLUMNS: &str = "id, name, status, assigned_to, attributes, current_stage, \
     next_send_at, sequence_paused, opted_in, last_reply_at, created_at, updated_at, version, \
     scheduled_template_id";

const TEMPLATE_COLUMNS: &str = "id, stage, variant_name, body, active, total_sent, total_responses";

const RULE_COLUMNS: &str = "id, name, conditions, strategy, pool, priority, is_active, \
     assignments, last_assigned_at, cursor";

const EXECUTION_COLUMNS: &str = "id, workflow, trigger_name, lead_id, status, created_at, \
     started_at, completed_at, successful_actions, failed_actions, error";

/// SQLite datastore.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    events: broadcast::Sender<ChangeEvent>,
}

impl SqliteStore {
    /// Open or create the database file (parent directories included).
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        // Other processes may hold the write lock briefly.
        conn.busy_timeout(std::time::Duration::from_secs(5)).map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        let (events, _) = broadcast::channel(FEED_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            events,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LeadPilotError::Store(e.to_string()))
    }

    fn emit(&self, event: ChangeEvent) {
        let _ = self.events.send(event);
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Leads plus automation state
        CREATE TABLE IF NOT EXISTS leads (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'new',
            assigned_to TEXT,
            attributes TEXT NOT NULL DEFAULT '{}',   -- JSON object
            current_stage TEXT NOT NULL,
            next_send_at TEXT,
            sequence_paused INTEGER NOT NULL DEFAULT 0,
            opted_in INTEGER NOT NULL DEFAULT 1,
            last_reply_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            scheduled_template_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_leads_due ON leads(next_send_at);

        CREATE TABLE IF NOT EXISTS templates (
            id TEXT PRIMARY KEY,
            stage TEXT NOT NULL,
            variant_name TEXT NOT NULL,
            body TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            total_sent INTEGER NOT NULL DEFAULT 0,
            total_responses INTEGER NOT NULL DEFAULT 0
        );

        -- Ordered stage catalog
        CREATE TABLE IF NOT EXISTS stage_configs (
            position INTEGER PRIMARY KEY,
            stage TEXT NOT NULL UNIQUE,
            config TEXT NOT NULL                     -- JSON StageConfig
        );

        CREATE TABLE IF NOT EXISTS response_patterns (
            lead_id TEXT PRIMARY KEY,
            hours TEXT NOT NULL DEFAULT '[]',
            days TEXT NOT NULL DEFAULT '[]',
            total_messages_sent INTEGER NOT NULL DEFAULT 0,
            total_responses INTEGER NOT NULL DEFAULT 0,
            last_response_at TEXT,
            preferred_content_types TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE IF NOT EXISTS routing_rules (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            conditions TEXT NOT NULL DEFAULT '[]',   -- JSON conditions
            strategy TEXT NOT NULL,
            pool TEXT NOT NULL DEFAULT '[]',         -- JSON assignee ids
            priority INTEGER NOT NULL DEFAULT 5,
            is_active INTEGER NOT NULL DEFAULT 1,
            assignments INTEGER NOT NULL DEFAULT 0,
            last_assigned_at TEXT,
            cursor INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS sent_messages (
            id TEXT PRIMARY KEY,
            lead_id TEXT NOT NULL,
            template_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            sent_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sent_lead ON sent_messages(lead_id, sent_at);

        CREATE TABLE IF NOT EXISTS approvals (
            id TEXT PRIMARY KEY,
            lead_id TEXT NOT NULL,
            content TEXT NOT NULL,
            urgency TEXT NOT NULL,
            scheduled_send_at TEXT NOT NULL,
            auto_approved INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS notifications (
            id TEXT PRIMARY KEY,
            lead_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            urgency TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        -- Recommendation audit trail
        CREATE TABLE IF NOT EXISTS recommendations (
            row_id INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL,
            lead_id TEXT NOT NULL,
            data TEXT NOT NULL,                      -- JSON SmartRecommendation
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS workflow_executions (
            id TEXT PRIMARY KEY,
            workflow TEXT NOT NULL,
            trigger_name TEXT NOT NULL,
            lead_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            successful_actions INTEGER NOT NULL DEFAULT 0,
            failed_actions INTEGER NOT NULL DEFAULT 0,
            error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_executions_created ON workflow_executions(created_at);
        ",
    )
    .map_err(db_err)?;
    // Databases created before pending sends carried their template.
    let _ = conn.execute("ALTER TABLE leads ADD COLUMN scheduled_template_id TEXT", []);
    Ok(())
}

// ─── Column helpers ─────────────────────────────────────────

fn db_err(e: rusqlite::Error) -> LeadPilotError {
    LeadPilotError::Store(e.to_string())
}

/// Fixed-width UTC timestamps so text comparison orders correctly.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion(idx, e))
    })
    .transpose()
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion(idx, e))
}

/// Unit enums are stored as their serde name.
fn enum_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_value(serde_json::Value::String(raw)).map_err(|e| conversion(idx, e))
}

fn enum_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(LeadPilotError::Store(format!(
            "expected unit enum, got {other}"
        ))),
    }
}

fn flag(row: &Row<'_>, idx: usize) -> rusqlite::Result<bool> {
    Ok(row.get::<_, i32>(idx)? != 0)
}

fn count(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(idx)?.max(0) as u64)
}

fn lead_from_row(row: &Row<'_>) -> rusqlite::Result<Lead> {
    Ok(Lead {
        id: row.get(0)?,
        name: row.get(1)?,
        status: enum_col(row, 2)?,
        assigned_to: row.get(3)?,
        attributes: json_col(row, 4)?,
        current_stage: row.get(5)?,
        next_send_at: opt_ts_col(row, 6)?,
        sequence_paused: flag(row, 7)?,
        opted_in: flag(row, 8)?,
        last_reply_at: opt_ts_col(row, 9)?,
        created_at: ts_col(row, 10)?,
        updated_at: ts_col(row, 11)?,
        version: count(row, 12)?,
        scheduled_template_id: row.get(13)?,
    })
}

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<MessageTemplate> {
    Ok(MessageTemplate {
        id: row.get(0)?,
        stage: row.get(1)?,
        variant_name: row.get(2)?,
        body: row.get(3)?,
        active: flag(row, 4)?,
        total_sent: count(row, 5)?,
        total_responses: count(row, 6)?,
    })
}

fn pattern_from_row(row: &Row<'_>) -> rusqlite::Result<ResponsePattern> {
    Ok(ResponsePattern {
        lead_id: row.get(0)?,
        best_response_hours: json_col(row, 1)?,
        best_response_days: json_col(row, 2)?,
        total_messages_sent: count(row, 3)?,
        total_responses: count(row, 4)?,
        last_response_at: opt_ts_col(row, 5)?,
        preferred_content_types: json_col(row, 6)?,
    })
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<RoutingRule> {
    Ok(RoutingRule {
        id: row.get(0)?,
        name: row.get(1)?,
        conditions: json_col(row, 2)?,
        strategy: enum_col(row, 3)?,
        pool: json_col(row, 4)?,
        priority: row.get(5)?,
        is_active: flag(row, 6)?,
        counters: RuleCounters {
            assignments: count(row, 7)?,
            last_assigned_at: opt_ts_col(row, 8)?,
            cursor: count(row, 9)?,
        },
    })
}

fn sent_from_row(row: &Row<'_>) -> rusqlite::Result<SentMessage> {
    Ok(SentMessage {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        template_id: row.get(2)?,
        stage: row.get(3)?,
        sent_at: ts_col(row, 4)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowExecution> {
    Ok(WorkflowExecution {
        id: row.get(0)?,
        workflow: row.get(1)?,
        trigger: row.get(2)?,
        lead_id: row.get(3)?,
        status: enum_col(row, 4)?,
        created_at: ts_col(row, 5)?,
        started_at: opt_ts_col(row, 6)?,
        completed_at: opt_ts_col(row, 7)?,
        successful_actions: row.get(8)?,
        failed_actions: row.get(9)?,
        error: row.get(10)?,
    })
}

fn load_lead(conn: &Connection, id: &str) -> Result<Option<Lead>> {
    conn.query_row(
        &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
        [id],
        lead_from_row,
    )
    .optional()
    .map_err(db_err)
}

/// Write every mutable lead column if the stored version is still
/// `expected_version`. Returns the number of rows touched.
fn write_lead(conn: &Connection, lead: &Lead, expected_version: u64) -> Result<usize> {
    conn.execute(
        "UPDATE leads SET name = ?2, status = ?3, assigned_to = ?4, attributes = ?5,
             current_stage = ?6, next_send_at = ?7, sequence_paused = ?8, opted_in = ?9,
             last_reply_at = ?10, updated_at = ?11, version = ?12, scheduled_template_id = ?14
         WHERE id = ?1 AND version = ?13",
        rusqlite::params![
            lead.id,
            lead.name,
            lead.status.as_str(),
            lead.assigned_to,
            serde_json::Value::Object(lead.attributes.clone()).to_string(),
            lead.current_stage,
            lead.next_send_at.map(ts),
            lead.sequence_paused as i32,
            lead.opted_in as i32,
            lead.last_reply_at.map(ts),
            ts(lead.updated_at),
            lead.version as i64,
            expected_version as i64,
            lead.scheduled_template_id,
        ],
    )
    .map_err(db_err)
}

fn load_pattern(conn: &Connection, lead_id: &str) -> Result<Option<ResponsePattern>> {
    conn.query_row(
        "SELECT lead_id, hours, days, total_messages_sent, total_responses,
                last_response_at, preferred_content_types
         FROM response_patterns WHERE lead_id = ?1",
        [lead_id],
        pattern_from_row,
    )
    .optional()
    .map_err(db_err)
}

fn lead_exists(conn: &Connection, id: &str) -> Result<bool> {
    conn.query_row("SELECT 1 FROM leads WHERE id = ?1", [id], |_| Ok(()))
        .optional()
        .map(|r| r.is_some())
        .map_err(db_err)
}

fn query_list<T, F>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: F,
) -> Result<Vec<T>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt.query_map(params, map).map_err(db_err)?;
    rows.collect::<rusqlite::Result<Vec<T>>>().map_err(db_err)
}

// ─── Trait impls ────────────────────────────────────────────

#[async_trait]
impl LeadStore for SqliteStore {
    async fn insert_lead(&self, lead: Lead) -> Result<()> {
        {
            let conn = self.conn()?;
            if lead_exists(&conn, &lead.id)? {
                return Err(LeadPilotError::Validation(format!(
                    "lead '{}' already exists",
                    lead.id
                )));
            }
            conn.execute(
                &format!(
                    "INSERT INTO leads ({LEAD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                rusqlite::params![
                    lead.id,
                    lead.name,
                    lead.status.as_str(),
                    lead.assigned_to,
                    serde_json::Value::Object(lead.attributes.clone()).to_string(),
                    lead.current_stage,
                    lead.next_send_at.map(ts),
                    lead.sequence_paused as i32,
                    lead.opted_in as i32,
                    lead.last_reply_at.map(ts),
                    ts(lead.created_at),
                    ts(lead.updated_at),
                    lead.version as i64,
                    lead.scheduled_template_id,
                ],
            )
            .map_err(db_err)?;
        }
        self.emit(ChangeEvent::LeadCreated { lead });
        Ok(())
    }

    async fn get_lead(&self, id: &str) -> Result<Option<Lead>> {
        load_lead(&*self.conn()?, id)
    }

    async fn update_lead(&self, lead: Lead) -> Result<()> {
        let (before, after) = {
            let conn = self.conn()?;
            let before = load_lead(&conn, &lead.id)?
                .ok_or_else(|| LeadPilotError::NotFound(format!("lead '{}'", lead.id)))?;
            let mut after = before.clone();
            after.name = lead.name;
            after.status = lead.status;
            after.assigned_to = lead.assigned_to;
            after.attributes = lead.attributes;
            after.opted_in = lead.opted_in;
            after.sequence_paused = lead.sequence_paused;
            after.version += 1;
            after.updated_at = Utc::now();
            if write_lead(&conn, &after, before.version)? == 0 {
                return Err(LeadPilotError::Conflict(format!(
                    "lead '{}' changed during update",
                    after.id
                )));
            }
            (before, after)
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
            let conn = self.conn()?;
            let before = load_lead(&conn, id)?
                .ok_or_else(|| LeadPilotError::NotFound(format!("lead '{id}'")))?;
            if before.version != expected_version {
                return Ok(false);
            }
            let mut after = before.clone();
            update.apply(&mut after, Utc::now());
            if write_lead(&conn, &after, expected_version)? == 0 {
                return Ok(false);
            }
            (before, after)
        };
        self.emit(ChangeEvent::LeadUpdated { before, after });
        Ok(true)
    }

    async fn record_lead_reply(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE leads SET last_reply_at = ?2
                 WHERE id = ?1 AND (last_reply_at IS NULL OR last_reply_at < ?2)",
                rusqlite::params![id, ts(at)],
            )
            .map_err(db_err)?;
        if changed == 0 && !lead_exists(&conn, id)? {
            return Err(LeadPilotError::NotFound(format!("lead '{id}'")));
        }
        Ok(())
    }

    async fn assign_lead(&self, id: &str, assignee: &str) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE leads SET assigned_to = ?2, updated_at = ?3 WHERE id = ?1",
                rusqlite::params![id, assignee, ts(Utc::now())],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(LeadPilotError::NotFound(format!("lead '{id}'")));
        }
        Ok(())
    }

    async fn due_leads(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Lead>> {
        let conn = self.conn()?;
        query_list(
            &conn,
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads
                 WHERE next_send_at IS NOT NULL AND next_send_at <= ?1
                   AND opted_in = 1 AND sequence_paused = 0
                 ORDER BY next_send_at, id LIMIT ?2"
            ),
            rusqlite::params![ts(now), limit as i64],
            lead_from_row,
        )
    }

    async fn assignee_stats(&self, assignee: &str, since: DateTime<Utc>) -> Result<AssigneeStats> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'converted' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(
                        CASE WHEN status NOT IN ('converted', 'lost') THEN 1 ELSE 0 END
                    ), 0)
             FROM leads WHERE assigned_to = ?1 AND created_at >= ?2",
            rusqlite::params![assignee, ts(since)],
            |row| {
                Ok(AssigneeStats {
                    assignee: assignee.to_string(),
                    total_leads: count(row, 0)?,
                    converted_leads: count(row, 1)?,
                    active_leads: count(row, 2)?,
                })
            },
        )
        .map_err(db_err)
    }
}

#[async_trait]
impl TemplateStore for SqliteStore {
    async fn upsert_template(&self, template: MessageTemplate) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO templates ({TEMPLATE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            rusqlite::params![
                template.id,
                template.stage,
                template.variant_name,
                template.body,
                template.active as i32,
                template.total_sent as i64,
                template.total_responses as i64,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_template(&self, id: &str) -> Result<Option<MessageTemplate>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = ?1"),
            [id],
            template_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    async fn active_templates(&self, stage: &str) -> Result<Vec<MessageTemplate>> {
        let conn = self.conn()?;
        query_list(
            &conn,
            &format!(
                "SELECT {TEMPLATE_COLUMNS} FROM templates
                 WHERE stage = ?1 AND active = 1 ORDER BY id"
            ),
            [stage],
            template_from_row,
        )
    }

    async fn increment_template_sent(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE templates SET total_sent = total_sent + 1 WHERE id = ?1",
                [id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(LeadPilotError::NotFound(format!("template '{id}'")));
        }
        Ok(())
    }

    async fn increment_template_responses(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE templates SET total_responses = total_responses + 1 WHERE id = ?1",
                [id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(LeadPilotError::NotFound(format!("template '{id}'")));
        }
        Ok(())
    }
}

#[async_trait]
impl StageStore for SqliteStore {
    async fn stage_configs(&self) -> Result<Vec<StageConfig>> {
        let conn = self.conn()?;
        query_list(
            &conn,
            "SELECT config FROM stage_configs ORDER BY position",
            [],
            |row| json_col(row, 0),
        )
    }

    async fn replace_stage_configs(&self, stages: Vec<StageConfig>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM stage_configs", []).map_err(db_err)?;
        for (position, stage) in stages.iter().enumerate() {
            tx.execute(
                "INSERT INTO stage_configs (position, stage, config) VALUES (?1, ?2, ?3)",
                rusqlite::params![position as i64, stage.stage, serde_json::to_string(stage)?],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }
}

#[async_trait]
impl PatternStore for SqliteStore {
    async fn get_pattern(&self, lead_id: &str) -> Result<Option<ResponsePattern>> {
        load_pattern(&*self.conn()?, lead_id)
    }

    async fn upsert_pattern(&self, pattern: ResponsePattern) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO response_patterns
                 (lead_id, hours, days, total_messages_sent, total_responses,
                  last_response_at, preferred_content_types)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(lead_id) DO UPDATE SET
                 hours = excluded.hours,
                 days = excluded.days,
                 total_responses = excluded.total_responses,
                 last_response_at = excluded.last_response_at,
                 preferred_content_types = excluded.preferred_content_types",
            rusqlite::params![
                pattern.lead_id,
                serde_json::to_string(&pattern.best_response_hours)?,
                serde_json::to_string(&pattern.best_response_days)?,
                pattern.total_messages_sent as i64,
                pattern.total_responses as i64,
                pattern.last_response_at.map(ts),
                serde_json::to_string(&pattern.preferred_content_types)?,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn increment_pattern_sent(&self, lead_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO response_patterns (lead_id, total_messages_sent) VALUES (?1, 1)
             ON CONFLICT(lead_id) DO UPDATE SET total_messages_sent = total_messages_sent + 1",
            [lead_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Read and write inside one IMMEDIATE transaction: the write lock is
    /// taken before the read, so replies from other processes queue behind it.
    async fn record_pattern_reply(
        &self,
        lead_id: &str,
        hour: u32,
        day_of_week: u32,
        at: DateTime<Utc>,
    ) -> Result<ResponsePattern> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let mut pattern =
            load_pattern(&tx, lead_id)?.unwrap_or_else(|| ResponsePattern::new(lead_id));
        pattern.record_reply(hour, day_of_week, at);
        tx.execute(
            "INSERT INTO response_patterns
                 (lead_id, hours, days, total_responses, last_response_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(lead_id) DO UPDATE SET
                 hours = excluded.hours,
                 days = excluded.days,
                 total_responses = excluded.total_responses,
                 last_response_at = excluded.last_response_at",
            rusqlite::params![
                pattern.lead_id,
                serde_json::to_string(&pattern.best_response_hours)?,
                serde_json::to_string(&pattern.best_response_days)?,
                pattern.total_responses as i64,
                pattern.last_response_at.map(ts),
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(pattern)
    }
}

#[async_trait]
impl RoutingStore for SqliteStore {
    async fn upsert_rule(&self, rule: RoutingRule) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO routing_rules ({RULE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     conditions = excluded.conditions,
                     strategy = excluded.strategy,
                     pool = excluded.pool,
                     priority = excluded.priority,
                     is_active = excluded.is_active"
            ),
            rusqlite::params![
                rule.id,
                rule.name,
                serde_json::to_string(&rule.conditions)?,
                enum_text(&rule.strategy)?,
                serde_json::to_string(&rule.pool)?,
                rule.priority,
                rule.is_active as i32,
                rule.counters.assignments as i64,
                rule.counters.last_assigned_at.map(ts),
                rule.counters.cursor as i64,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn routing_rules(&self) -> Result<Vec<RoutingRule>> {
        let conn = self.conn()?;
        query_list(
            &conn,
            &format!("SELECT {RULE_COLUMNS} FROM routing_rules ORDER BY id"),
            [],
            rule_from_row,
        )
    }

    async fn advance_rule_cursor(&self, rule_id: &str) -> Result<u64> {
        let conn = self.conn()?;
        let after: Option<i64> = conn
            .query_row(
                "UPDATE routing_rules SET cursor = cursor + 1 WHERE id = ?1 RETURNING cursor",
                [rule_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match after {
            Some(value) => Ok((value - 1).max(0) as u64),
            None => Err(LeadPilotError::NotFound(format!("rule '{rule_id}'"))),
        }
    }

    async fn record_rule_assignment(&self, rule_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE routing_rules SET assignments = assignments + 1, last_assigned_at = ?2
                 WHERE id = ?1",
                rusqlite::params![rule_id, ts(at)],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(LeadPilotError::NotFound(format!("rule '{rule_id}'")));
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn record_sent(&self, message: SentMessage) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sent_messages (id, lead_id, template_id, stage, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                message.id,
                message.lead_id,
                message.template_id,
                message.stage,
                ts(message.sent_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_sent(&self, message_id: &str) -> Result<Option<SentMessage>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, lead_id, template_id, stage, sent_at FROM sent_messages WHERE id = ?1",
            [message_id],
            sent_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    async fn last_sent_for_lead(&self, lead_id: &str) -> Result<Option<SentMessage>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, lead_id, template_id, stage, sent_at FROM sent_messages
             WHERE lead_id = ?1 ORDER BY sent_at DESC LIMIT 1",
            [lead_id],
            sent_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    async fn enqueue_approval(&self, request: ApprovalRequest) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO approvals
                 (id, lead_id, content, urgency, scheduled_send_at, auto_approved, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                request.id,
                request.lead_id,
                request.content,
                request.urgency.as_str(),
                ts(request.scheduled_send_at),
                request.auto_approved as i32,
                ts(request.created_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn approvals(&self, lead_id: &str) -> Result<Vec<ApprovalRequest>> {
        let conn = self.conn()?;
        query_list(
            &conn,
            "SELECT id, lead_id, content, urgency, scheduled_send_at, auto_approved, created_at
             FROM approvals WHERE lead_id = ?1 ORDER BY created_at, id",
            [lead_id],
            |row| {
                Ok(ApprovalRequest {
                    id: row.get(0)?,
                    lead_id: row.get(1)?,
                    content: row.get(2)?,
                    urgency: enum_col(row, 3)?,
                    scheduled_send_at: ts_col(row, 4)?,
                    auto_approved: flag(row, 5)?,
                    created_at: ts_col(row, 6)?,
                })
            },
        )
    }

    async fn insert_notification(&self, notification: NotificationRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notifications
                 (id, lead_id, kind, title, message, urgency, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                notification.id,
                notification.lead_id,
                notification.kind,
                notification.title,
                notification.message,
                notification.urgency.as_str(),
                notification.confidence,
                ts(notification.created_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn notifications(&self, lead_id: &str) -> Result<Vec<NotificationRecord>> {
        let conn = self.conn()?;
        query_list(
            &conn,
            "SELECT id, lead_id, kind, title, message, urgency, confidence, created_at
             FROM notifications WHERE lead_id = ?1 ORDER BY created_at, id",
            [lead_id],
            |row| {
                Ok(NotificationRecord {
                    id: row.get(0)?,
                    lead_id: row.get(1)?,
                    kind: row.get(2)?,
                    title: row.get(3)?,
                    message: row.get(4)?,
                    urgency: enum_col(row, 5)?,
                    confidence: row.get(6)?,
                    created_at: ts_col(row, 7)?,
                })
            },
        )
    }

    async fn record_recommendations(
        &self,
        lead_id: &str,
        recommendations: &[SmartRecommendation],
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        let now = ts(Utc::now());
        for rec in recommendations {
            tx.execute(
                "INSERT INTO recommendations (id, lead_id, data, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![rec.id, lead_id, serde_json::to_string(rec)?, now],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO workflow_executions ({EXECUTION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            rusqlite::params![
                execution.id,
                execution.workflow,
                execution.trigger,
                execution.lead_id,
                execution.status.as_str(),
                ts(execution.created_at),
                execution.started_at.map(ts),
                execution.completed_at.map(ts),
                execution.successful_actions,
                execution.failed_actions,
                execution.error,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = ?1"),
            [id],
            execution_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    async fn executions(&self, workflow: Option<&str>) -> Result<Vec<WorkflowExecution>> {
        let conn = self.conn()?;
        query_list(
            &conn,
            &format!(
                "SELECT {EXECUTION_COLUMNS} FROM workflow_executions
                 WHERE ?1 IS NULL OR workflow = ?1 ORDER BY created_at, id"
            ),
            [workflow],
            execution_from_row,
        )
    }

    async fn executions_since(&self, since: DateTime<Utc>) -> Result<Vec<WorkflowExecution>> {
        let conn = self.conn()?;
        query_list(
            &conn,
            &format!(
                "SELECT {EXECUTION_COLUMNS} FROM workflow_executions
                 WHERE created_at >= ?1 ORDER BY created_at, id"
            ),
            [ts(since)],
            execution_from_row,
        )
    }
}

impl ChangeFeed for SqliteStore {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ChangeEvent) {
        self.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use leadpilot_core::types::{
        AssignmentStrategy, Condition, ExecutionStatus, LeadStatus, PATTERN_WINDOW, Urgency,
        default_stage_catalog,
    };

    fn temp_db(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("leadpilot_db_{name}_{}", uuid::Uuid::new_v4()));
        dir.join("leadpilot.db")
    }

    #[tokio::test]
    async fn test_lead_roundtrip_and_cas() {
        let store = SqliteStore::open_in_memory().unwrap();
        let lead = Lead::new("lead-1", "Ana").with_attribute("source", "web");
        store.insert_lead(lead).await.unwrap();

        let loaded = store.get_lead("lead-1").await.unwrap().unwrap();
        assert_eq!(loaded.attribute_str("source").as_deref(), Some("web"));
        assert_eq!(loaded.current_stage, Lead::INITIAL_STAGE);

        let at = Utc::now() + Duration::hours(3);
        let update = AutomationUpdate::Advance {
            stage: "intro".into(),
            next_send_at: at,
            template_id: Some("t-intro".into()),
        };
        assert!(store.apply_automation("lead-1", 0, update.clone()).await.unwrap());
        assert!(!store.apply_automation("lead-1", 0, update).await.unwrap());

        let loaded = store.get_lead("lead-1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.current_stage, "intro");
        assert_eq!(loaded.scheduled_template_id.as_deref(), Some("t-intro"));
        // Stored with microsecond precision.
        let drift = (loaded.next_send_at.unwrap() - at).num_milliseconds().abs();
        assert!(drift < 1);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let path = temp_db("reopen");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_lead(Lead::new("lead-1", "Ana")).await.unwrap();
            store.replace_stage_configs(default_stage_catalog()).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get_lead("lead-1").await.unwrap().is_some());
        let stages = store.stage_configs().await.unwrap();
        assert_eq!(stages.len(), 6);
        assert_eq!(stages[0].stage, "intro");
        assert_eq!(stages[5].stage, "last_touch");
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pattern_replies_from_two_connections_are_not_lost() {
        let path = temp_db("pattern_replies");
        let first = std::sync::Arc::new(SqliteStore::open(&path).unwrap());
        let second = std::sync::Arc::new(SqliteStore::open(&path).unwrap());
        let at = Utc::now();

        let handles: Vec<_> = [first.clone(), second.clone()]
            .into_iter()
            .enumerate()
            .map(|(n, store)| {
                tokio::spawn(async move {
                    for i in 0..25u32 {
                        store
                            .record_pattern_reply("lead-1", (i + n as u32) % 24, i % 7, at)
                            .await
                            .unwrap();
                        if i % 5 == 0 {
                            store.increment_pattern_sent("lead-1").await.unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        let pattern = first.get_pattern("lead-1").await.unwrap().unwrap();
        assert_eq!(pattern.total_responses, 50);
        assert_eq!(pattern.total_messages_sent, 10);
        assert_eq!(pattern.best_response_hours.len(), PATTERN_WINDOW);
        drop((first, second));
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[tokio::test]
    async fn test_template_counters_are_atomic_increments() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_template(MessageTemplate::new("t1", "intro", "friendly", "Hi"))
            .await
            .unwrap();
        for _ in 0..3 {
            store.increment_template_sent("t1").await.unwrap();
        }
        store.increment_template_responses("t1").await.unwrap();
        let t = store.get_template("t1").await.unwrap().unwrap();
        assert_eq!((t.total_sent, t.total_responses), (3, 1));
        assert!(store.increment_template_sent("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_pattern_upsert_keeps_sent_counter() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.increment_pattern_sent("lead-1").await.unwrap();
        store.increment_pattern_sent("lead-1").await.unwrap();

        let mut pattern = store.get_pattern("lead-1").await.unwrap().unwrap();
        assert_eq!(pattern.total_messages_sent, 2);
        pattern.record_reply(14, 2, Utc::now());
        pattern.total_messages_sent = 0;
        store.upsert_pattern(pattern).await.unwrap();

        let pattern = store.get_pattern("lead-1").await.unwrap().unwrap();
        assert_eq!(pattern.total_messages_sent, 2);
        assert_eq!(pattern.preferred_hours(), vec![14]);
    }

    #[tokio::test]
    async fn test_rule_cursor_and_counters() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rule = RoutingRule::new("r1", "Web", AssignmentStrategy::RoundRobin, &["a", "b"])
            .with_condition(Condition::new("source", "equals", "web"));
        store.upsert_rule(rule.clone()).await.unwrap();

        assert_eq!(store.advance_rule_cursor("r1").await.unwrap(), 0);
        assert_eq!(store.advance_rule_cursor("r1").await.unwrap(), 1);
        store.record_rule_assignment("r1", Utc::now()).await.unwrap();

        // Redefining the rule keeps its counters.
        store.upsert_rule(rule.with_priority(9)).await.unwrap();
        let rules = store.routing_rules().await.unwrap();
        assert_eq!(rules[0].priority, 9);
        assert_eq!(rules[0].counters.cursor, 2);
        assert_eq!(rules[0].counters.assignments, 1);
        assert_eq!(rules[0].conditions[0].field, "source");
    }

    #[tokio::test]
    async fn test_assignee_stats_window() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut converted = Lead::new("l1", "A");
        converted.assigned_to = Some("sam".into());
        converted.status = LeadStatus::Converted;
        let mut active = Lead::new("l2", "B");
        active.assigned_to = Some("sam".into());
        let mut old = Lead::new("l3", "C");
        old.assigned_to = Some("sam".into());
        old.created_at = now - Duration::days(60);
        for lead in [converted, active, old] {
            store.insert_lead(lead).await.unwrap();
        }

        let stats = store
            .assignee_stats("sam", now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(stats.total_leads, 2);
        assert_eq!(stats.converted_leads, 1);
        assert_eq!(stats.active_leads, 1);
        assert!((stats.conversion_rate() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sinks_and_executions() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .enqueue_approval(ApprovalRequest {
                id: "ap-1".into(),
                lead_id: "lead-1".into(),
                content: "Call back today".into(),
                urgency: Urgency::High,
                scheduled_send_at: now,
                auto_approved: false,
                created_at: now,
            })
            .await
            .unwrap();
        let approvals = store.approvals("lead-1").await.unwrap();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].urgency, Urgency::High);

        let mut exec = WorkflowExecution::new("lead_intake", "lead_created", Some("lead-1"));
        store.save_execution(&exec).await.unwrap();
        exec.start();
        exec.complete();
        store.save_execution(&exec).await.unwrap();

        let all = store.executions(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, ExecutionStatus::Completed);
        assert!(store.executions(Some("other")).await.unwrap().is_empty());

        let mut old = WorkflowExecution::new("lead_intake", "lead_created", None);
        old.created_at = now - Duration::days(10);
        store.save_execution(&old).await.unwrap();
        let recent = store.executions_since(now - Duration::days(1)).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, exec.id);
        assert_eq!(store.executions_since(now - Duration::days(30)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_last_sent_for_lead() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .record_sent(SentMessage::new("lead-1", "t1", "intro", now - Duration::days(1)))
            .await
            .unwrap();
        store
            .record_sent(SentMessage::new("lead-1", "t2", "follow_up_1", now))
            .await
            .unwrap();
        let last = store.last_sent_for_lead("lead-1").await.unwrap().unwrap();
        assert_eq!(last.template_id, "t2");
        assert!(store.last_sent_for_lead("lead-2").await.unwrap().is_none());
    }
}
