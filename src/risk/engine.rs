//! Sums the weights of every configured rule that fires; clamps to 0-100.

use super::rules::{Matcher, ScoringRule};
use crate::config::RiskConfig;
use crate::enrichment::Enrichment;
use crate::error::{ConfigError, MalformedRecord};
use crate::events::RawEvent;
use serde::{Deserialize, Serialize};

pub const MIN_SCORE: u8 = 0;
pub const MAX_SCORE: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: u8, config: &RiskConfig) -> Self {
        if score >= config.high_threshold {
            RiskLevel::High
        } else if score >= config.medium_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// A rule that fired and what it contributed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub name: String,
    pub weight: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u8,
    /// In rule configuration order.
    pub factors: Vec<RiskFactor>,
}

struct CompiledRule {
    name: String,
    weight: i32,
    matcher: Matcher,
}

pub struct RiskScorer {
    rules: Vec<CompiledRule>,
}

impl RiskScorer {
    pub fn new(rules: &[ScoringRule]) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .map(|r| {
                Ok(CompiledRule {
                    name: r.name.clone(),
                    weight: r.weight,
                    matcher: Matcher::compile(r)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { rules })
    }

    pub fn from_config(config: &RiskConfig) -> Result<Self, ConfigError> {
        Self::new(&config.rules)
    }

    /// Pure and deterministic: no clock, no randomness, no shared state.
    pub fn score(&self, event: &RawEvent, ctx: &Enrichment) -> Result<RiskAssessment, MalformedRecord> {
        let mut total: i64 = 0;
        let mut factors = Vec::new();
        for rule in &self.rules {
            if rule.matcher.matches(event, ctx)? {
                total += i64::from(rule.weight);
                factors.push(RiskFactor {
                    name: rule.name.clone(),
                    weight: rule.weight,
                });
            }
        }
        Ok(RiskAssessment {
            score: total.clamp(i64::from(MIN_SCORE), i64::from(MAX_SCORE)) as u8,
            factors,
        })
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.name.as_str())
    }
}
