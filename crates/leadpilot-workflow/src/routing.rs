//! Rule-based lead routing.
//!
//! Active rules are evaluated against the lead's attributes; the highest
//! priority match (id ascending on ties) picks an assignee from its pool.
//! A rule with a malformed operator is skipped, never fatal.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use leadpilot_core::config::RoutingConfig;
use leadpilot_core::error::Result;
use leadpilot_core::traits::store::Datastore;
use leadpilot_core::types::{
    AssignmentStrategy, Condition, ConditionOperator, Lead, LogicalOperator, RoutingRule,
};
use leadpilot_scheduler::retry::{RetryPolicy, with_retry};

/// A routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub rule_id: String,
    pub assignee: String,
}

pub struct RoutingEngine {
    store: Arc<dyn Datastore>,
    config: RoutingConfig,
    retry: RetryPolicy,
}

impl RoutingEngine {
    pub fn new(store: Arc<dyn Datastore>, config: RoutingConfig, retry: RetryPolicy) -> Self {
        Self {
            store,
            config,
            retry,
        }
    }

    /// Route a lead using the given attributes. `Ok(None)` when no rule
    /// matches or the lead does not exist.
    pub async fn route_lead(
        &self,
        lead_id: &str,
        attributes: &Map<String, Value>,
    ) -> Result<Option<Assignment>> {
        self.route_lead_at(lead_id, attributes, Utc::now()).await
    }

    pub async fn route_lead_at(
        &self,
        lead_id: &str,
        attributes: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Option<Assignment>> {
        let lead = with_retry(&self.retry, "get_lead", || self.store.get_lead(lead_id)).await?;
        if lead.is_none() {
            tracing::warn!("⚠️ Cannot route: lead {} not found", lead_id);
            return Ok(None);
        }

        let rules = with_retry(&self.retry, "routing_rules", || self.store.routing_rules()).await?;
        let Some(rule) = select_rule(&rules, attributes) else {
            tracing::debug!("No routing rule matched lead {}", lead_id);
            return Ok(None);
        };

        let Some(assignee) = self.pick_assignee(rule, now).await? else {
            tracing::warn!(
                "⚠️ Rule '{}' has an empty pool, lead {} unassigned",
                rule.name,
                lead_id
            );
            return Ok(None);
        };

        with_retry(&self.retry, "assign_lead", || {
            self.store.assign_lead(lead_id, &assignee)
        })
        .await?;
        if let Err(e) = with_retry(&self.retry, "record_rule_assignment", || {
            self.store.record_rule_assignment(&rule.id, now)
        })
        .await
        {
            tracing::warn!("⚠️ Counters not updated for rule '{}': {}", rule.id, e);
        }

        tracing::info!(
            "🧭 Lead {} → {} (rule '{}', {:?})",
            lead_id,
            assignee,
            rule.name,
            rule.strategy
        );
        Ok(Some(Assignment {
            rule_id: rule.id.clone(),
            assignee,
        }))
    }

    async fn pick_assignee(
        &self,
        rule: &RoutingRule,
        now: DateTime<Utc>,
    ) -> Result<Option<String>> {
        if rule.pool.is_empty() {
            return Ok(None);
        }
        let picked = match rule.strategy {
            AssignmentStrategy::RoundRobin => {
                let cursor = with_retry(&self.retry, "advance_rule_cursor", || {
                    self.store.advance_rule_cursor(&rule.id)
                })
                .await?;
                let idx = (cursor % rule.pool.len() as u64) as usize;
                rule.pool[idx].clone()
            }
            // No separate expertise model: the best converter is the expert.
            AssignmentStrategy::PerformanceBased | AssignmentStrategy::ExpertiseMatch => {
                self.best_performer(&rule.pool, now).await?
            }
            AssignmentStrategy::WorkloadBalanced => self.least_loaded(&rule.pool, now).await?,
        };
        Ok(Some(picked))
    }

    /// Highest conversion rate among members with enough leads in the
    /// window; first pool member when nobody qualifies.
    async fn best_performer(&self, pool: &[String], now: DateTime<Utc>) -> Result<String> {
        let since = now - Duration::days(i64::from(self.config.performance_window_days));
        let mut best: Option<(String, f64)> = None;
        for member in pool {
            let stats = with_retry(&self.retry, "assignee_stats", || {
                self.store.assignee_stats(member, since)
            })
            .await?;
            if stats.total_leads < self.config.min_sample_size {
                continue;
            }
            let rate = stats.conversion_rate();
            if best.as_ref().is_none_or(|(_, top)| rate > *top) {
                best = Some((member.clone(), rate));
            }
        }
        Ok(best.map(|(member, _)| member).unwrap_or_else(|| pool[0].clone()))
    }

    /// Fewest non-terminal leads in the window; pool order breaks ties.
    async fn least_loaded(&self, pool: &[String], now: DateTime<Utc>) -> Result<String> {
        let since = now - Duration::days(i64::from(self.config.workload_window_days));
        let mut best: Option<(String, u64)> = None;
        for member in pool {
            let stats = with_retry(&self.retry, "assignee_stats", || {
                self.store.assignee_stats(member, since)
            })
            .await?;
            if best.as_ref().is_none_or(|(_, load)| stats.active_leads < *load) {
                best = Some((member.clone(), stats.active_leads));
            }
        }
        Ok(best.map(|(member, _)| member).unwrap_or_else(|| pool[0].clone()))
    }
}

/// Attributes a rule sees for a stored lead: its custom attributes plus the
/// built-in fields when not overridden.
pub fn lead_attributes(lead: &Lead) -> Map<String, Value> {
    let mut attrs = lead.attributes.clone();
    attrs
        .entry("status")
        .or_insert_with(|| Value::String(lead.status.as_str().to_string()));
    attrs
        .entry("name")
        .or_insert_with(|| Value::String(lead.name.clone()));
    attrs
}

/// First matching active rule by priority desc, id asc.
pub fn select_rule<'a>(
    rules: &'a [RoutingRule],
    attributes: &Map<String, Value>,
) -> Option<&'a RoutingRule> {
    let mut matching: Vec<&RoutingRule> = rules
        .iter()
        .filter(|r| r.is_active)
        .filter(|r| match evaluate_conditions(&r.conditions, attributes) {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!("⚠️ Skipping routing rule '{}': {}", r.id, e);
                false
            }
        })
        .collect();
    matching.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    matching.into_iter().next()
}

/// Fold conditions left to right, each joining the running result with its
/// own `and`/`or`. No conditions matches everything.
pub fn evaluate_conditions(
    conditions: &[Condition],
    attributes: &Map<String, Value>,
) -> Result<bool> {
    // Validate every operator first so a bad rule never half-matches.
    let operators = conditions
        .iter()
        .map(|c| ConditionOperator::from_str(&c.operator))
        .collect::<Result<Vec<_>>>()?;

    let mut result: Option<bool> = None;
    for (condition, operator) in conditions.iter().zip(operators) {
        let actual = attributes.get(&condition.field).unwrap_or(&Value::Null);
        let hit = compare(operator, actual, &condition.value);
        result = Some(match (result, condition.logic) {
            (None, _) => hit,
            (Some(acc), LogicalOperator::And) => acc && hit,
            (Some(acc), LogicalOperator::Or) => acc || hit,
        });
    }
    Ok(result.unwrap_or(true))
}

fn compare(operator: ConditionOperator, actual: &Value, expected: &Value) -> bool {
    match operator {
        ConditionOperator::Equals => values_equal(actual, expected),
        ConditionOperator::NotEquals => !values_equal(actual, expected),
        ConditionOperator::GreaterThan => match (as_number(actual), as_number(expected)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ConditionOperator::LessThan => match (as_number(actual), as_number(expected)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        ConditionOperator::Contains => contains(actual, expected),
        ConditionOperator::NotContains => !contains(actual, expected),
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) if actual.is_number() || expected.is_number() => a == b,
        _ => actual == expected,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Case-insensitive substring for strings, membership for arrays.
fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(s) => expected
            .as_str()
            .is_some_and(|needle| s.to_lowercase().contains(&needle.to_lowercase())),
        Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        _ => false,
    }
}
