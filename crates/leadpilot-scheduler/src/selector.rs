//! Explore/exploit template selection.

use rand::Rng;

use leadpilot_core::config::SelectorConfig;
use leadpilot_core::types::{MessageTemplate, ResponsePattern};

#[derive(Debug, Clone)]
pub struct TemplateSelector {
    cold_start_threshold: u64,
    exploit_probability: f64,
    exploit_pool: usize,
}

impl TemplateSelector {
    pub fn new(cold_start_threshold: u64, exploit_probability: f64, exploit_pool: usize) -> Self {
        Self {
            cold_start_threshold,
            exploit_probability: exploit_probability.clamp(0.0, 1.0),
            exploit_pool: exploit_pool.max(1),
        }
    }

    pub fn from_config(config: &SelectorConfig) -> Self {
        Self::new(
            config.cold_start_threshold,
            config.exploit_probability,
            config.exploit_pool,
        )
    }

    /// Pick a template among the active candidates of one stage.
    ///
    /// A preferred content type naming a present variant wins outright. Below
    /// the cold-start threshold every candidate is equally likely; above it the
    /// best performers are exploited with `exploit_probability`.
    pub fn select<'a, R: Rng + ?Sized>(
        &self,
        candidates: &'a [MessageTemplate],
        pattern: Option<&ResponsePattern>,
        rng: &mut R,
    ) -> Option<&'a MessageTemplate> {
        if candidates.is_empty() {
            return None;
        }

        if let Some(preferred) = pattern.and_then(|p| preferred_variant(candidates, p)) {
            return Some(preferred);
        }

        let total_sent: u64 = candidates.iter().map(|t| t.total_sent).sum();
        if total_sent < self.cold_start_threshold {
            return Some(&candidates[rng.gen_range(0..candidates.len())]);
        }

        if rng.gen_bool(self.exploit_probability) {
            let ranked = rank_by_response_rate(candidates);
            let pool = &ranked[..self.exploit_pool.min(ranked.len())];
            return Some(pool[rng.gen_range(0..pool.len())]);
        }
        Some(&candidates[rng.gen_range(0..candidates.len())])
    }
}

impl Default for TemplateSelector {
    fn default() -> Self {
        Self::from_config(&SelectorConfig::default())
    }
}

fn preferred_variant<'a>(
    candidates: &'a [MessageTemplate],
    pattern: &ResponsePattern,
) -> Option<&'a MessageTemplate> {
    pattern.preferred_content_types.iter().find_map(|variant| {
        candidates
            .iter()
            .filter(|t| &t.variant_name == variant)
            .min_by(|a, b| a.id.cmp(&b.id))
    })
}

/// Response rate descending, id ascending on ties.
fn rank_by_response_rate(candidates: &[MessageTemplate]) -> Vec<&MessageTemplate> {
    let mut ranked: Vec<&MessageTemplate> = candidates.iter().collect();
    ranked.sort_by(|a, b| {
        b.response_rate()
            .total_cmp(&a.response_rate())
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}
