//! Ban lists, elevated quotas and per-spec configuration.
//!
//! Patterns match case-insensitively from the start of the spec.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ProviderError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecConfigRule {
    pub pattern: String,
    pub config: Map<String, Value>,
}

/// Parse a JSON list of `{pattern, config}` rules.
pub fn parse_spec_config(raw: &str) -> Result<Vec<SpecConfigRule>, ProviderError> {
    serde_json::from_str(raw).map_err(|e| ProviderError::InvalidConfig(e.to_string()))
}

/// Effective configuration for one spec.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoConfig {
    pub quota: Option<u64>,
    pub values: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct SpecPolicy {
    banned: Vec<Regex>,
    high_quota: Vec<Regex>,
    spec_config: Vec<(Regex, Map<String, Value>)>,
}

fn compile(pattern: &str) -> Result<Regex, ProviderError> {
    RegexBuilder::new(&format!("^(?:{})", pattern))
        .case_insensitive(true)
        .build()
        .map_err(|e| ProviderError::InvalidConfig(format!("pattern {:?}: {}", pattern, e)))
}

impl SpecPolicy {
    pub fn new(banned: &[String], high_quota: &[String], spec_config: &[SpecConfigRule]) -> Result<Self, ProviderError> {
        Ok(Self {
            banned: banned.iter().map(|p| compile(p)).collect::<Result<_, _>>()?,
            high_quota: high_quota.iter().map(|p| compile(p)).collect::<Result<_, _>>()?,
            spec_config: spec_config
                .iter()
                .map(|r| Ok((compile(&r.pattern)?, r.config.clone())))
                .collect::<Result<_, ProviderError>>()?,
        })
    }

    pub fn is_banned(&self, spec: &str) -> bool { self.banned.iter().any(|r| r.is_match(spec)) }

    pub fn has_higher_quota(&self, spec: &str) -> bool { self.high_quota.iter().any(|r| r.is_match(spec)) }

    /// Defaults `{quota}` overlaid with every matching rule in order; the last match wins per key.
    pub fn repo_config(&self, spec: &str, per_repo_quota: Option<u64>, per_repo_quota_higher: Option<u64>) -> RepoConfig {
        let default_quota = if self.has_higher_quota(spec) { per_repo_quota_higher } else { per_repo_quota };
        let mut values = Map::new();
        values.insert("quota".into(), default_quota.map(Value::from).unwrap_or(Value::Null));
        for (re, config) in &self.spec_config {
            if re.is_match(spec) {
                for (k, v) in config {
                    values.insert(k.clone(), v.clone());
                }
            }
        }
        let quota = values.get("quota").and_then(|v| v.as_u64());
        RepoConfig { quota, values }
    }
}
