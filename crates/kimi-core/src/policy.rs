//! Per-model-family request defaults.
//!
//! Model ids are matched against an explicit, versioned table of
//! case-insensitive regex rules. The first matching rule wins. Models that
//! match nothing get no defaults at all.

use kimi_contracts::ResponseFormatType;
use regex::{Regex, RegexBuilder};

pub const BUILTIN_POLICY_VERSION: &str = "2026-01";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FamilyDefaults {
    pub thinking_temperature: f64,
    pub instant_temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub response_format: Option<ResponseFormatType>,
}

impl FamilyDefaults {
    pub const THINKING: Self = Self {
        thinking_temperature: 1.0,
        instant_temperature: 0.6,
        top_p: 0.95,
        max_tokens: 16_000,
        response_format: Some(ResponseFormatType::JsonObject),
    };

    pub fn temperature(&self, instant_mode: bool) -> f64 {
        if instant_mode { self.instant_temperature } else { self.thinking_temperature }
    }
}

#[derive(Debug, Clone)]
pub struct FamilyRule {
    pub family: String,
    pattern: Regex,
    pub defaults: FamilyDefaults,
}

impl FamilyRule {
    pub fn new(
        family: impl Into<String>,
        pattern: &str,
        defaults: FamilyDefaults,
    ) -> Result<Self, regex::Error> {
        let pattern = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(Self { family: family.into(), pattern, defaults })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn matches(&self, model: &str) -> bool {
        self.pattern.is_match(model)
    }
}

#[derive(Debug, Clone)]
pub struct ModelPolicyTable {
    version: String,
    rules: Vec<FamilyRule>,
}

impl ModelPolicyTable {
    pub fn new(version: impl Into<String>, rules: Vec<FamilyRule>) -> Self {
        Self { version: version.into(), rules }
    }

    /// Thinking-capable Kimi families known as of the table version.
    pub fn builtin() -> Self {
        let rules = [("k2-thinking", r"k2.*thinking"), ("k2.5", r"k2\.5")]
            .into_iter()
            .map(|(family, pattern)| {
                FamilyRule::new(family, pattern, FamilyDefaults::THINKING)
                    .expect("static policy pattern")
            })
            .collect();
        Self::new(BUILTIN_POLICY_VERSION, rules)
    }

    pub fn empty() -> Self {
        Self::new("empty", Vec::new())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn rules(&self) -> &[FamilyRule] {
        &self.rules
    }

    pub fn resolve(&self, model: &str) -> Option<&FamilyRule> {
        self.rules.iter().find(|rule| rule.matches(model))
    }
}

impl Default for ModelPolicyTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(model: &str) -> Option<String> {
        ModelPolicyTable::builtin().resolve(model).map(|rule| rule.family.clone())
    }

    #[test]
    fn builtin_table_matches_thinking_families() {
        assert_eq!(family("kimi-k2-thinking").as_deref(), Some("k2-thinking"));
        assert_eq!(family("kimi-k2-thinking-turbo").as_deref(), Some("k2-thinking"));
        assert_eq!(family("KIMI-K2-THINKING").as_deref(), Some("k2-thinking"));
        assert_eq!(family("kimi-k2.5").as_deref(), Some("k2.5"));
        assert_eq!(family("kimi-k2.5-thinking").as_deref(), Some("k2-thinking"));
    }

    #[test]
    fn builtin_table_ignores_other_models() {
        for model in ["moonshot-v1-8k", "kimi-k2-0711", "kimi-k2-turbo-preview", "kimi-k25"] {
            assert_eq!(family(model), None, "{model} must not match");
        }
    }

    #[test]
    fn thinking_defaults_depend_on_instant_mode() {
        let defaults = FamilyDefaults::THINKING;
        assert_eq!(defaults.temperature(false), 1.0);
        assert_eq!(defaults.temperature(true), 0.6);
        assert_eq!(defaults.top_p, 0.95);
        assert_eq!(defaults.max_tokens, 16_000);
    }

    #[test]
    fn custom_rules_are_case_insensitive() {
        let rule = FamilyRule::new("custom", "Reasoner", FamilyDefaults::THINKING)
            .expect("pattern must compile");
        let table = ModelPolicyTable::new("test", vec![rule]);
        assert_eq!(table.version(), "test");
        assert!(table.resolve("my-reasoner-v2").is_some());
        assert!(ModelPolicyTable::empty().resolve("kimi-k2-thinking").is_none());
    }
}
