//! Data-driven rule matching for variant selection
//!
//! A rule set is an ordered list of `{ when, value }` entries. A rule
//! matches a context iff every tag in `when` equals the corresponding
//! context tag; the first match in list order wins, and an entry with an
//! empty `when` is the trailing catch-all. Keeping the matcher data-driven
//! (rather than folding rules into match arms) preserves the ability to
//! reload rule tables from configuration without recompiling.

use std::collections::BTreeMap;

use serde::Deserialize;
use rustc_hash::FxHashMap;

/// A tag value in a selection context or rule predicate
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        TagValue::Bool(v)
    }
}

impl From<u32> for TagValue {
    fn from(v: u32) -> Self {
        TagValue::Int(v as i64)
    }
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        TagValue::Text(v.to_string())
    }
}

/// Tagged facts about one operator invocation, consumed by rule matching
/// and by validator hooks.
#[derive(Debug, Clone, Default)]
pub struct SelectionCtx {
    tags: BTreeMap<String, TagValue>,
}

impl SelectionCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, tag: &str, value: impl Into<TagValue>) -> &mut Self {
        self.tags.insert(tag.to_string(), value.into());
        self
    }

    pub fn get(&self, tag: &str) -> Option<&TagValue> {
        self.tags.get(tag)
    }

    pub fn get_bool(&self, tag: &str) -> Option<bool> {
        match self.tags.get(tag) {
            Some(TagValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_int(&self, tag: &str) -> Option<i64> {
        match self.tags.get(tag) {
            Some(TagValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_text(&self, tag: &str) -> Option<&str> {
        match self.tags.get(tag) {
            Some(TagValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// One selection rule: all `when` tags must equal the context's tags
#[derive(Debug, Clone, Deserialize)]
pub struct SelectionRule<T> {
    #[serde(default)]
    pub when: BTreeMap<String, TagValue>,
    pub value: T,
}

impl<T> SelectionRule<T> {
    pub fn matches(&self, ctx: &SelectionCtx) -> bool {
        self.when
            .iter()
            .all(|(tag, expected)| ctx.get(tag) == Some(expected))
    }
}

/// First-match selection over an ordered rule list. Pure: the same
/// `(rules, ctx)` always yields the same result.
pub fn select_by_rules<'a, T>(
    rules: &'a [SelectionRule<T>],
    ctx: &SelectionCtx,
) -> Option<&'a T> {
    rules.iter().find(|rule| rule.matches(ctx)).map(|r| &r.value)
}

/// Named rule sets, keyed by `(namespace, rule_name)`, so selectors look
/// tables up instead of hard-coding them.
#[derive(Default)]
pub struct RuleRegistry {
    sets: FxHashMap<(String, String), Vec<SelectionRule<String>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        namespace: &str,
        name: &str,
        rules: Vec<SelectionRule<String>>,
    ) {
        self.sets
            .insert((namespace.to_string(), name.to_string()), rules);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<&[SelectionRule<String>]> {
        self.sets
            .get(&(namespace.to_string(), name.to_string()))
            .map(|v| v.as_slice())
    }

    /// Evaluate a named rule set against `ctx`
    pub fn select(&self, namespace: &str, name: &str, ctx: &SelectionCtx) -> Option<&str> {
        self.get(namespace, name)
            .and_then(|rules| select_by_rules(rules, ctx))
            .map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(when: &[(&str, TagValue)], value: &str) -> SelectionRule<String> {
        SelectionRule {
            when: when
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            value: value.to_string(),
        }
    }

    #[test]
    fn first_match_wins_in_list_order() {
        let rules = vec![
            rule(&[("decode", TagValue::Bool(true))], "a"),
            rule(&[("decode", TagValue::Bool(true))], "b"),
            rule(&[], "fallback"),
        ];

        let mut ctx = SelectionCtx::new();
        ctx.set("decode", true);
        assert_eq!(select_by_rules(&rules, &ctx).map(|s| s.as_str()), Some("a"));
    }

    #[test]
    fn empty_when_is_catch_all() {
        let rules = vec![
            rule(&[("f16", TagValue::Bool(true))], "fast"),
            rule(&[], "default"),
        ];

        let ctx = SelectionCtx::new();
        assert_eq!(
            select_by_rules(&rules, &ctx).map(|s| s.as_str()),
            Some("default")
        );
    }

    #[test]
    fn all_predicates_must_match() {
        let rules = vec![rule(
            &[
                ("decode", TagValue::Bool(true)),
                ("f16", TagValue::Bool(true)),
            ],
            "both",
        )];

        let mut ctx = SelectionCtx::new();
        ctx.set("decode", true);
        ctx.set("f16", false);
        assert!(select_by_rules(&rules, &ctx).is_none());
    }

    #[test]
    fn no_match_without_catch_all_is_none() {
        let rules = vec![rule(&[("x", TagValue::Int(4))], "v")];
        let ctx = SelectionCtx::new();
        assert!(select_by_rules(&rules, &ctx).is_none());
    }

    #[test]
    fn registry_lookup_by_namespace_and_name() {
        let mut registry = RuleRegistry::new();
        registry.insert("attention", "decode", vec![rule(&[], "streaming")]);

        let ctx = SelectionCtx::new();
        assert_eq!(registry.select("attention", "decode", &ctx), Some("streaming"));
        assert_eq!(registry.select("attention", "prefill", &ctx), None);
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let rules = vec![
            rule(&[("n", TagValue::Int(8))], "a"),
            rule(&[], "b"),
        ];
        let mut ctx = SelectionCtx::new();
        ctx.set("n", 8u32);
        let first = select_by_rules(&rules, &ctx).cloned();
        let second = select_by_rules(&rules, &ctx).cloned();
        assert_eq!(first, second);
    }
}
