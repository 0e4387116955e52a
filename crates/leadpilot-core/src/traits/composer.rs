//! Message composition boundary and the default typed renderer.
//!
//! Templates carry `{{field}}` placeholders. Fields come from a typed
//! `CompositionContext`, not from string replacement over arbitrary JSON.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{LeadPilotError, Result};
use crate::types::{Lead, MessageTemplate};

/// Named values available to a template.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompositionContext {
    pub lead_id: String,
    pub lead_name: String,
    pub stage: String,
    pub variant: String,
    pub vehicle_interest: Option<String>,
    pub assignee: Option<String>,
    /// Extra string attributes copied from the lead.
    pub extra: BTreeMap<String, String>,
}

impl CompositionContext {
    /// Build a context from a lead and the template chosen for it.
    pub fn for_lead(lead: &Lead, template: &MessageTemplate) -> Self {
        let extra = lead
            .attributes
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();
        Self {
            lead_id: lead.id.clone(),
            lead_name: lead.name.clone(),
            stage: template.stage.clone(),
            variant: template.variant_name.clone(),
            vehicle_interest: lead.attribute_str("vehicle_interest"),
            assignee: lead.assigned_to.clone(),
            extra,
        }
    }

    /// Resolve one placeholder name.
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "lead_name" | "name" => Some(self.lead_name.clone()),
            "first_name" => self
                .lead_name
                .split_whitespace()
                .next()
                .map(str::to_string),
            "stage" => Some(self.stage.clone()),
            "vehicle" | "vehicle_interest" => self.vehicle_interest.clone(),
            "assignee" | "salesperson" => self.assignee.clone(),
            other => self.extra.get(other).cloned(),
        }
    }
}

/// Composes outbound text. Implementations may call out to generators.
#[async_trait]
pub trait MessageComposer: Send + Sync {
    async fn compose(&self, template: &MessageTemplate, ctx: &CompositionContext)
    -> Result<String>;
}

/// Placeholder renderer. Strict mode fails on unresolved placeholders; lenient
/// mode strips them and logs.
#[derive(Debug, Clone, Default)]
pub struct TemplateComposer {
    strict: bool,
}

impl TemplateComposer {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Render `body` against `ctx`.
    pub fn render(&self, body: &str, ctx: &CompositionContext) -> Result<String> {
        let mut out = String::with_capacity(body.len());
        let mut rest = body;
        let mut unresolved = Vec::new();

        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let Some(close) = after.find("}}") else {
                return Err(LeadPilotError::Template(format!(
                    "unterminated placeholder in template for stage '{}'",
                    ctx.stage
                )));
            };
            let name = after[..close].trim();
            match ctx.field(name) {
                Some(value) => out.push_str(&value),
                None => unresolved.push(name.to_string()),
            }
            rest = &after[close + 2..];
        }
        out.push_str(rest);

        if !unresolved.is_empty() {
            if self.strict {
                return Err(LeadPilotError::Template(format!(
                    "unresolved placeholders: {}",
                    unresolved.join(", ")
                )));
            }
            tracing::warn!(
                lead_id = %ctx.lead_id,
                placeholders = %unresolved.join(", "),
                "⚠️ Stripped unresolved placeholders"
            );
            // Collapse doubled spaces left by stripped tokens.
            let collapsed = out.split(' ').filter(|s| !s.is_empty()).collect::<Vec<_>>();
            return Ok(collapsed.join(" "));
        }
        Ok(out)
    }
}

#[async_trait]
impl MessageComposer for TemplateComposer {
    async fn compose(
        &self,
        template: &MessageTemplate,
        ctx: &CompositionContext,
    ) -> Result<String> {
        self.render(&template.body, ctx)
    }
}
