use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlRule {
    /// Case-insensitive substring matched against the operation name
    pub pattern: String,
    pub ttl: Duration,
}

/// Per-operation cache lifetimes. The first matching rule wins; operations
/// matching no rule use the cache's default TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlPolicy {
    pub rules: Vec<TtlRule>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::empty()
            .with_rule("market_data", Duration::from_secs(2 * 3600))
            .with_rule("user_preferences", Duration::from_secs(30 * 60))
            .with_rule("realtime", Duration::from_secs(60))
    }
}

impl TtlPolicy {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, pattern: impl Into<String>, ttl: Duration) -> Self {
        self.rules.push(TtlRule {
            pattern: pattern.into().to_lowercase(),
            ttl,
        });
        self
    }

    pub fn ttl_for(&self, operation: &str) -> Option<Duration> {
        let operation = operation.to_lowercase();
        self.rules
            .iter()
            .find(|rule| operation.contains(&rule.pattern.to_lowercase()))
            .map(|rule| rule.ttl)
    }
}
