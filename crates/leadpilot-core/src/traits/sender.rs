//! Outbound transport boundary (SMS/email delivery lives outside LeadPilot).

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Lead;

#[async_trait]
pub trait OutboundSender: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver `body` to the lead.
    async fn send(&self, lead: &Lead, body: &str) -> Result<()>;
}
