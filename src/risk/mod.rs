//! Heuristic risk scoring over raw events and their enrichment.

mod engine;
mod rules;

pub use engine::{RiskAssessment, RiskFactor, RiskLevel, RiskScorer, MAX_SCORE, MIN_SCORE};
pub use rules::{default_rules, RulePredicate, ScoringRule};
