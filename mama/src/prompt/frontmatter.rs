//! YAML frontmatter on rule files and the runtime context matcher.
//!
//! A rule file may begin with a `---` / `---` fenced YAML prologue declaring
//! `applies_to` (snake_case on disk). Malformed YAML is logged and treated as
//! no frontmatter; unknown `applies_to` fields are ignored with a warning.

use serde_yaml::Value;
use tracing::warn;

/// Closed, explicit filter record. All-empty means universal and parses to
/// `None` at the call site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliesTo {
    pub agent_id: Vec<String>,
    pub tier: Vec<String>,
    pub channel: Vec<String>,
    pub keywords: Vec<String>,
}

impl AppliesTo {
    fn is_universal(&self) -> bool {
        self.agent_id.is_empty()
            && self.tier.is_empty()
            && self.channel.is_empty()
            && self.keywords.is_empty()
    }
}

/// Runtime context a rule is matched against.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    pub agent_id: Option<String>,
    pub tier: Option<String>,
    pub channel: Option<String>,
    pub keywords: Vec<String>,
}

/// Splits an optional frontmatter prologue off `text`. Returns the parsed
/// filter (None when absent, malformed, or universal) and the body.
pub fn parse_frontmatter(text: &str) -> (Option<AppliesTo>, &str) {
    let Some(rest) = text.strip_prefix("---\n").or_else(|| text.strip_prefix("---\r\n")) else {
        return (None, text);
    };
    let Some(end) = rest.find("\n---") else {
        return (None, text);
    };
    let yaml = &rest[..end];
    let body_start = match rest[end + 1..].find('\n') {
        Some(nl) => end + 1 + nl + 1,
        None => rest.len(),
    };
    let body = &rest[body_start.min(rest.len())..];

    let parsed: Value = match serde_yaml::from_str(yaml) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "malformed rule frontmatter, ignoring");
            return (None, text);
        }
    };
    let applies = extract_applies_to(&parsed);
    (applies.filter(|a| !a.is_universal()), body)
}

fn extract_applies_to(doc: &Value) -> Option<AppliesTo> {
    let raw = doc.get("applies_to")?.as_mapping()?;
    let mut applies = AppliesTo::default();
    for (key, value) in raw {
        let Some(key) = key.as_str() else { continue };
        let target = match key {
            "agent_id" => &mut applies.agent_id,
            "tier" => &mut applies.tier,
            "channel" => &mut applies.channel,
            "keywords" => &mut applies.keywords,
            other => {
                warn!(field = other, "unknown applies_to field, ignoring");
                continue;
            }
        };
        *target = string_list(value);
    }
    Some(applies)
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Sequence(items) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Value::String(s) => vec![s.clone()],
        Value::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    }
}

/// Matching rules: a null filter always matches; an undefined context always
/// matches; within a field values combine with OR, across fields with AND; a
/// declared field missing from the context fails; keywords match on non-empty
/// intersection.
pub fn matches_context(applies: Option<&AppliesTo>, ctx: Option<&RuleContext>) -> bool {
    let Some(applies) = applies else { return true };
    let Some(ctx) = ctx else { return true };

    if !applies.agent_id.is_empty() {
        match &ctx.agent_id {
            Some(id) if applies.agent_id.contains(id) => {}
            _ => return false,
        }
    }
    if !applies.tier.is_empty() {
        match &ctx.tier {
            Some(tier) if applies.tier.contains(tier) => {}
            _ => return false,
        }
    }
    if !applies.channel.is_empty() {
        match &ctx.channel {
            Some(channel) if applies.channel.contains(channel) => {}
            _ => return false,
        }
    }
    if !applies.keywords.is_empty() {
        if ctx.keywords.is_empty() {
            return false;
        }
        if !applies.keywords.iter().any(|k| ctx.keywords.contains(k)) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_filter_and_undefined_context_always_match() {
        assert!(matches_context(None, None));
        assert!(matches_context(None, Some(&RuleContext::default())));
        let applies = AppliesTo {
            agent_id: vec!["main".into()],
            ..Default::default()
        };
        assert!(matches_context(Some(&applies), None));
    }

    #[test]
    fn or_within_field_and_across_fields() {
        let applies = AppliesTo {
            agent_id: vec!["main".into(), "helper".into()],
            channel: vec!["dev".into()],
            ..Default::default()
        };
        let mut ctx = RuleContext {
            agent_id: Some("helper".into()),
            channel: Some("dev".into()),
            ..Default::default()
        };
        assert!(matches_context(Some(&applies), Some(&ctx)));
        ctx.channel = Some("ops".into());
        assert!(!matches_context(Some(&applies), Some(&ctx)));
    }

    #[test]
    fn declared_field_absent_from_context_fails() {
        let applies = AppliesTo {
            tier: vec!["3".into()],
            ..Default::default()
        };
        let ctx = RuleContext::default(); // tier absent
        assert!(!matches_context(Some(&applies), Some(&ctx)));
    }

    #[test]
    fn keywords_match_on_intersection() {
        let applies = AppliesTo {
            keywords: vec!["deploy".into(), "release".into()],
            ..Default::default()
        };
        let hit = RuleContext {
            keywords: vec!["release".into()],
            ..Default::default()
        };
        let miss = RuleContext {
            keywords: vec!["testing".into()],
            ..Default::default()
        };
        assert!(matches_context(Some(&applies), Some(&hit)));
        assert!(!matches_context(Some(&applies), Some(&miss)));
    }

    #[test]
    fn parses_snake_case_frontmatter() {
        let text = "---\napplies_to:\n  agent_id: [main]\n  tier: [3]\n---\nbody here\n";
        let (applies, body) = parse_frontmatter(text);
        let applies = applies.unwrap();
        assert_eq!(applies.agent_id, vec!["main"]);
        assert_eq!(applies.tier, vec!["3"]);
        assert_eq!(body.trim(), "body here");
    }

    #[test]
    fn all_empty_arrays_mean_universal() {
        let text = "---\napplies_to:\n  agent_id: []\n  channel: []\n---\nbody\n";
        let (applies, body) = parse_frontmatter(text);
        assert!(applies.is_none());
        assert_eq!(body.trim(), "body");
    }

    #[test]
    fn malformed_yaml_is_no_frontmatter() {
        let text = "---\napplies_to: [unclosed\n---\nbody\n";
        let (applies, body) = parse_frontmatter(text);
        assert!(applies.is_none());
        assert_eq!(body, text);
    }

    #[test]
    fn text_without_prologue_passes_through() {
        let (applies, body) = parse_frontmatter("just a rule\n");
        assert!(applies.is_none());
        assert_eq!(body, "just a rule\n");
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let text = "---\napplies_to:\n  agent_id: [main]\n  severity: [high]\n---\nbody\n";
        let (applies, _) = parse_frontmatter(text);
        let applies = applies.unwrap();
        assert_eq!(applies.agent_id, vec!["main"]);
    }
}
