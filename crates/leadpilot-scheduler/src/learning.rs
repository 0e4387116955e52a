//! Reply learning: response patterns, template credit and the reply guard.
//!
//! The three updates are independent. Each one is retried on transient errors
//! and logged on failure without stopping the others.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use leadpilot_core::error::Result;
use leadpilot_core::traits::store::Datastore;

use crate::retry::{RetryPolicy, with_retry};
use crate::schedule::ScheduleCalculator;

/// What an inbound reply managed to update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearningReport {
    pub pattern_updated: bool,
    /// Template credited with the reply, when one could be attributed.
    pub template_credited: Option<String>,
    pub lead_marked: bool,
}

pub struct LearningLoop {
    store: Arc<dyn Datastore>,
    calculator: ScheduleCalculator,
    retry: RetryPolicy,
}

impl LearningLoop {
    pub fn new(
        store: Arc<dyn Datastore>,
        calculator: ScheduleCalculator,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            calculator,
            retry,
        }
    }

    /// Record an inbound reply. `message_id` names the sent message being
    /// answered; without it the lead's latest sent message is credited.
    pub async fn on_inbound_reply(
        &self,
        lead_id: &str,
        message_id: Option<&str>,
        replied_at: DateTime<Utc>,
    ) -> LearningReport {
        let mut report = LearningReport::default();

        match self.update_pattern(lead_id, replied_at).await {
            Ok(()) => report.pattern_updated = true,
            Err(e) => tracing::warn!("⚠️ Pattern update failed for lead {}: {}", lead_id, e),
        }

        match self.credit_template(lead_id, message_id).await {
            Ok(credited) => report.template_credited = credited,
            Err(e) => tracing::warn!("⚠️ Template credit failed for lead {}: {}", lead_id, e),
        }

        match with_retry(&self.retry, "record_lead_reply", || {
            self.store.record_lead_reply(lead_id, replied_at)
        })
        .await
        {
            Ok(()) => report.lead_marked = true,
            Err(e) => tracing::warn!("⚠️ Reply timestamp not saved for lead {}: {}", lead_id, e),
        }

        tracing::info!(
            "💬 Reply from lead {} (pattern: {}, template: {}, guard: {})",
            lead_id,
            report.pattern_updated,
            report.template_credited.as_deref().unwrap_or("-"),
            report.lead_marked
        );
        report
    }

    async fn update_pattern(&self, lead_id: &str, replied_at: DateTime<Utc>) -> Result<()> {
        let (hour, day) = self.calculator.local_slot(replied_at);
        let pattern = with_retry(&self.retry, "record_pattern_reply", || {
            self.store.record_pattern_reply(lead_id, hour, day, replied_at)
        })
        .await?;
        tracing::debug!(
            "Pattern for lead {}: {} replies, hours {:?}",
            lead_id,
            pattern.total_responses,
            pattern.preferred_hours()
        );
        Ok(())
    }

    async fn credit_template(
        &self,
        lead_id: &str,
        message_id: Option<&str>,
    ) -> Result<Option<String>> {
        let mut sent = None;
        if let Some(id) = message_id {
            sent = with_retry(&self.retry, "get_sent", || self.store.get_sent(id))
                .await?
                .filter(|m| m.lead_id == lead_id);
            if sent.is_none() {
                tracing::debug!("Message {} not found for lead {}, using latest send", id, lead_id);
            }
        }
        if sent.is_none() {
            sent = with_retry(&self.retry, "last_sent_for_lead", || {
                self.store.last_sent_for_lead(lead_id)
            })
            .await?;
        }
        let Some(sent) = sent else {
            return Ok(None);
        };

        with_retry(&self.retry, "increment_template_responses", || {
            self.store.increment_template_responses(&sent.template_id)
        })
        .await?;
        Ok(Some(sent.template_id))
    }
}
