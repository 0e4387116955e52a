//! Context-aware next-action recommendations.
//!
//! Candidates come from four sources: time since last contact, engagement
//! pattern, journey stage, and externally supplied base recommendations. Base
//! recommendations are enhanced with derived fields; the merged list is
//! deduplicated, ranked and cut to the top five.

use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use leadpilot_core::error::LeadPilotError;
use leadpilot_core::types::{RecommendationPriority, RecommendationType, SmartRecommendation};

pub const MAX_RECOMMENDATIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementPattern {
    Responsive,
    Slow,
    Inactive,
}

impl FromStr for EngagementPattern {
    type Err = LeadPilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "responsive" => Ok(Self::Responsive),
            "slow" => Ok(Self::Slow),
            "inactive" => Ok(Self::Inactive),
            other => Err(LeadPilotError::Validation(format!(
                "unknown engagement pattern '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStage {
    InitialContact,
    InterestBuilding,
    Decision,
}

impl FromStr for JourneyStage {
    type Err = LeadPilotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial_contact" => Ok(Self::InitialContact),
            "interest_building" => Ok(Self::InterestBuilding),
            "decision" => Ok(Self::Decision),
            other => Err(LeadPilotError::Validation(format!(
                "unknown journey stage '{other}'"
            ))),
        }
    }
}

/// Time since the last contact, in whole days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContactBucket {
    SameDay,
    OneToTwoDays,
    ThreeToSevenDays,
}

impl ContactBucket {
    fn for_hours(hours: f64) -> Option<Self> {
        if hours < 0.0 {
            return None;
        }
        match (hours / 24.0).floor() as i64 {
            0 => Some(Self::SameDay),
            1..=2 => Some(Self::OneToTwoDays),
            3..=7 => Some(Self::ThreeToSevenDays),
            _ => None,
        }
    }
}

/// Everything the engine knows about a lead for one analysis call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendationContext {
    pub lead_id: String,
    /// `None` when the lead was never contacted.
    pub hours_since_last_contact: Option<f64>,
    pub engagement: Option<EngagementPattern>,
    pub journey: Option<JourneyStage>,
    /// Lead temperature, 0–100.
    pub temperature: f64,
    /// Messages exchanged so far, both directions.
    pub conversation_length: usize,
    pub vehicle_interest: Option<String>,
    /// Externally supplied recommendations to enhance and rank.
    #[serde(default)]
    pub base: Vec<SmartRecommendation>,
}

impl RecommendationContext {
    pub fn new(lead_id: &str) -> Self {
        Self {
            lead_id: lead_id.to_string(),
            temperature: 50.0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecommendationEngine;

impl RecommendationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Ranked top-5 recommendations for `ctx`.
    pub fn generate(&self, ctx: &RecommendationContext) -> Vec<SmartRecommendation> {
        let mut candidates = Vec::new();
        if let Some(bucket) = ctx.hours_since_last_contact.and_then(ContactBucket::for_hours) {
            candidates.push(time_candidate(bucket));
        }
        if let Some(engagement) = ctx.engagement {
            candidates.push(engagement_candidate(engagement));
        }
        if let Some(journey) = ctx.journey {
            candidates.push(journey_candidate(journey));
        }
        candidates.extend(ctx.base.iter().map(|rec| enhance(rec, ctx)));

        let ranked = rank(dedupe(candidates));
        tracing::debug!(
            "Generated {} recommendations for lead {}",
            ranked.len(),
            ctx.lead_id
        );
        ranked
    }
}

/// Drop later recommendations whose action matches an earlier one, ignoring case.
pub fn dedupe(recs: Vec<SmartRecommendation>) -> Vec<SmartRecommendation> {
    let mut seen = HashSet::new();
    recs.into_iter()
        .filter(|r| seen.insert(r.action.trim().to_lowercase()))
        .collect()
}

/// Priority first, then confidence descending; stable; top five.
pub fn rank(mut recs: Vec<SmartRecommendation>) -> Vec<SmartRecommendation> {
    recs.sort_by(|a, b| {
        a.priority
            .rank()
            .cmp(&b.priority.rank())
            .then_with(|| b.confidence.total_cmp(&a.confidence))
    });
    recs.truncate(MAX_RECOMMENDATIONS);
    recs
}

/// Fill the derived fields of an external recommendation.
pub fn enhance(rec: &SmartRecommendation, ctx: &RecommendationContext) -> SmartRecommendation {
    let mut out = rec.clone();
    for factor in context_factors(ctx) {
        if !out.context_factors.contains(&factor) {
            out.context_factors.push(factor);
        }
    }
    out.expected_outcome = expected_outcome(&rec.action).to_string();
    out.time_to_execute_minutes = time_to_execute(&rec.action);
    out.related_actions = related_actions(&rec.action);
    out.success_probability = success_probability(rec.confidence, ctx);
    out
}

fn context_factors(ctx: &RecommendationContext) -> Vec<String> {
    let temperature = if ctx.temperature > 70.0 {
        "hot_lead"
    } else if ctx.temperature < 30.0 {
        "cold_lead"
    } else {
        "warm_lead"
    };
    let mut factors = vec![temperature.to_string()];
    if ctx.conversation_length > 10 {
        factors.push("extended_conversation".to_string());
    } else if ctx.conversation_length < 3 {
        factors.push("early_conversation".to_string());
    }
    match ctx.vehicle_interest.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => factors.push("specific_interest".to_string()),
        _ => factors.push("general_interest".to_string()),
    }
    factors
}

fn expected_outcome(action: &str) -> &'static str {
    let action = action.to_lowercase();
    [
        ("schedule", "Confirmed appointment"),
        ("provide", "Increased engagement"),
        ("send", "Continued conversation"),
        ("address", "Resolved concerns"),
        ("present", "Clear next steps"),
    ]
    .into_iter()
    .find(|(kw, _)| action.contains(kw))
    .map(|(_, outcome)| outcome)
    .unwrap_or("Positive response")
}

fn time_to_execute(action: &str) -> u32 {
    let action = action.to_lowercase();
    let has = |kws: &[&str]| kws.iter().any(|kw| action.contains(kw));
    if has(&["call", "phone"]) {
        20
    } else if has(&["meeting", "appointment"]) {
        30
    } else if has(&["email", "message"]) {
        5
    } else {
        10
    }
}

fn related_actions(action: &str) -> Vec<String> {
    let action = action.to_lowercase();
    let has = |kws: &[&str]| kws.iter().any(|kw| action.contains(kw));
    let related: &[&str] = if has(&["schedule", "appointment", "test drive"]) {
        &["Send calendar invite", "Confirm availability"]
    } else if has(&["call", "phone"]) {
        &["Prepare talking points", "Log call notes"]
    } else if has(&["price", "pricing", "financing", "trade-in"]) {
        &["Prepare payment estimate", "Share current incentives"]
    } else if has(&["send", "message", "email"]) {
        &["Track reply", "Plan next follow-up"]
    } else {
        &["Review lead history"]
    };
    related.iter().map(|s| s.to_string()).collect()
}

fn success_probability(confidence: f64, ctx: &RecommendationContext) -> f64 {
    let mut p = confidence;
    if ctx.temperature > 70.0 {
        p += 0.1;
    } else if ctx.temperature < 30.0 {
        p -= 0.2;
    }
    match ctx.engagement {
        Some(EngagementPattern::Responsive) => p += 0.15,
        Some(EngagementPattern::Inactive) => p -= 0.25,
        _ => {}
    }
    p.clamp(0.1, 0.95)
}

#[allow(clippy::too_many_arguments)]
fn fixed(
    id: &str,
    action: &str,
    rec_type: RecommendationType,
    priority: RecommendationPriority,
    confidence: f64,
    success_probability: f64,
    factor: &str,
    automatable: bool,
) -> SmartRecommendation {
    SmartRecommendation {
        id: id.to_string(),
        action: action.to_string(),
        rec_type,
        priority,
        confidence,
        success_probability,
        context_factors: vec![factor.to_string()],
        expected_outcome: expected_outcome(action).to_string(),
        time_to_execute_minutes: time_to_execute(action),
        related_actions: related_actions(action),
        automatable,
    }
}

fn time_candidate(bucket: ContactBucket) -> SmartRecommendation {
    use RecommendationPriority::*;
    use RecommendationType::*;
    match bucket {
        ContactBucket::SameDay => fixed(
            "time-same-day",
            "Send a quick follow-up while the conversation is fresh",
            Immediate,
            High,
            0.85,
            0.7,
            "contacted_today",
            true,
        ),
        ContactBucket::OneToTwoDays => fixed(
            "time-1-2-days",
            "Send a check-in message with one new detail",
            Scheduled,
            Medium,
            0.75,
            0.55,
            "contacted_recently",
            true,
        ),
        ContactBucket::ThreeToSevenDays => fixed(
            "time-3-7-days",
            "Call to re-engage before interest fades",
            Immediate,
            High,
            0.7,
            0.45,
            "contact_gap",
            false,
        ),
    }
}

fn engagement_candidate(engagement: EngagementPattern) -> SmartRecommendation {
    use RecommendationPriority::*;
    use RecommendationType::*;
    match engagement {
        EngagementPattern::Responsive => fixed(
            "engagement-responsive",
            "Schedule a test drive appointment",
            Immediate,
            Critical,
            0.9,
            0.75,
            "responsive",
            false,
        ),
        EngagementPattern::Slow => fixed(
            "engagement-slow",
            "Send a short message with a single clear question",
            Scheduled,
            Medium,
            0.7,
            0.5,
            "slow_responder",
            true,
        ),
        EngagementPattern::Inactive => fixed(
            "engagement-inactive",
            "Set a reminder to try a different channel next week",
            Reminder,
            Low,
            0.6,
            0.3,
            "inactive",
            true,
        ),
    }
}

fn journey_candidate(journey: JourneyStage) -> SmartRecommendation {
    use RecommendationPriority::*;
    use RecommendationType::*;
    match journey {
        JourneyStage::InitialContact => fixed(
            "journey-initial",
            "Provide a vehicle overview with pricing options",
            Immediate,
            High,
            0.8,
            0.6,
            "initial_contact",
            true,
        ),
        JourneyStage::InterestBuilding => fixed(
            "journey-interest",
            "Present financing and trade-in options",
            Scheduled,
            Medium,
            0.75,
            0.55,
            "interest_building",
            false,
        ),
        JourneyStage::Decision => fixed(
            "journey-decision",
            "Address remaining concerns and confirm the deal",
            Immediate,
            Critical,
            0.85,
            0.7,
            "decision",
            false,
        ),
    }
}
