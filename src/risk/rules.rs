//! Declarative scoring rules: an ordered list of `{name, weight, when}` entries.

use crate::enrichment::{Enrichment, TimeBucket};
use crate::error::{ConfigError, MalformedRecord};
use crate::events::{EventType, RawEvent};
use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};

/// A named heuristic. Fires when `when` holds and contributes `weight`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringRule {
    pub name: String,
    pub weight: i32,
    pub when: RulePredicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RulePredicate {
    /// Event type is one of the listed types.
    EventType { event_types: Vec<EventType> },
    /// Command-executed event whose command text matches any pattern (case-insensitive regex).
    CommandPattern { patterns: Vec<String> },
    /// Username tried is one of the listed accounts (case-insensitive).
    PrivilegedAccount { usernames: Vec<String> },
    TimeOfDay { buckets: Vec<TimeBucket> },
    /// Source address did not resolve to a geo-location.
    UnknownOrigin,
    OriginCountry { countries: Vec<String> },
    /// Password tried is on the list (case-insensitive).
    CommonPassword { passwords: Vec<String> },
    /// A password was tried and it is not on the list.
    UncommonPassword { passwords: Vec<String> },
}

impl ScoringRule {
    pub fn new(name: &str, weight: i32, when: RulePredicate) -> Self {
        Self {
            name: name.to_string(),
            weight,
            when,
        }
    }
}

/// Commands that harvest credentials, destroy data, or fetch second-stage payloads.
const MALICIOUS_COMMAND_PATTERNS: &[&str] = &[
    r"/etc/(passwd|shadow)\b",
    r"\b(unshadow|mimikatz|hashcat|john)\b",
    r"\.ssh/(authorized_keys|id_[a-z0-9]+)",
    r"\bchpasswd\b",
    r"\brm\s+-[a-z]*(rf|fr)[a-z]*\b",
    r"\bdd\s+if=/dev/(zero|u?random)",
    r"\bmkfs(\.[a-z0-9]+)?\b",
    r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    r"\bhistory\s+-c\b",
    r"\b(wget|curl|tftp|ftpget)\b",
];

/// Default rule set. Order here is the order factors are reported in.
pub fn default_rules() -> Vec<ScoringRule> {
    vec![
        ScoringRule::new(
            "login-success",
            30,
            RulePredicate::EventType {
                event_types: vec![EventType::LoginSuccess],
            },
        ),
        ScoringRule::new(
            "malicious-command",
            25,
            RulePredicate::CommandPattern {
                patterns: MALICIOUS_COMMAND_PATTERNS.iter().map(|p| p.to_string()).collect(),
            },
        ),
        ScoringRule::new(
            "elevated-privilege",
            15,
            RulePredicate::PrivilegedAccount {
                usernames: vec!["root".into(), "admin".into(), "administrator".into()],
            },
        ),
        ScoringRule::new(
            "night",
            5,
            RulePredicate::TimeOfDay {
                buckets: vec![TimeBucket::Night],
            },
        ),
        ScoringRule::new("unknown-origin", 5, RulePredicate::UnknownOrigin),
    ]
}

/// Predicate with regexes compiled and lists normalised.
#[derive(Debug)]
pub(crate) enum Matcher {
    EventType(Vec<EventType>),
    Command(RegexSet),
    Account(Vec<String>),
    TimeOfDay(Vec<TimeBucket>),
    UnknownOrigin,
    Country(Vec<String>),
    CommonPassword(Vec<String>),
    UncommonPassword(Vec<String>),
}

fn lowered(items: &[String]) -> Vec<String> {
    items.iter().map(|s| s.to_lowercase()).collect()
}

impl Matcher {
    pub(crate) fn compile(rule: &ScoringRule) -> Result<Self, ConfigError> {
        Ok(match &rule.when {
            RulePredicate::EventType { event_types } => Matcher::EventType(event_types.clone()),
            RulePredicate::CommandPattern { patterns } => Matcher::Command(
                RegexSetBuilder::new(patterns)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| ConfigError::InvalidPattern {
                        rule: rule.name.clone(),
                        source,
                    })?,
            ),
            RulePredicate::PrivilegedAccount { usernames } => Matcher::Account(lowered(usernames)),
            RulePredicate::TimeOfDay { buckets } => Matcher::TimeOfDay(buckets.clone()),
            RulePredicate::UnknownOrigin => Matcher::UnknownOrigin,
            RulePredicate::OriginCountry { countries } => Matcher::Country(lowered(countries)),
            RulePredicate::CommonPassword { passwords } => Matcher::CommonPassword(lowered(passwords)),
            RulePredicate::UncommonPassword { passwords } => {
                Matcher::UncommonPassword(lowered(passwords))
            }
        })
    }

    pub(crate) fn matches(&self, event: &RawEvent, ctx: &Enrichment) -> Result<bool, MalformedRecord> {
        Ok(match self {
            Matcher::EventType(types) => types.contains(&event.event_type),
            Matcher::Command(set) => {
                if event.event_type != EventType::CommandExecuted {
                    return Ok(false);
                }
                event.command()?.is_some_and(|cmd| set.is_match(cmd))
            }
            Matcher::Account(names) => event
                .username()?
                .is_some_and(|u| names.contains(&u.trim().to_lowercase())),
            Matcher::TimeOfDay(buckets) => buckets.contains(&ctx.time_bucket),
            Matcher::UnknownOrigin => ctx.geo.is_none(),
            Matcher::Country(countries) => ctx
                .geo
                .as_ref()
                .is_some_and(|g| countries.contains(&g.country.to_lowercase())),
            Matcher::CommonPassword(list) => event
                .password()?
                .is_some_and(|p| list.contains(&p.to_lowercase())),
            Matcher::UncommonPassword(list) => event
                .password()?
                .is_some_and(|p| !p.is_empty() && !list.contains(&p.to_lowercase())),
        })
    }
}
