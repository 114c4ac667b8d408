//! Rule engine: matches a document's content against a user's ordered
//! rules and applies the matched rules' actions to the document in memory.
//!
//! # Matching
//!
//! | Kind | Match value |
//! |------|-------------|
//! | `exact` | the lower-cased filter, when the content contains it (case-insensitive) |
//! | `regex` with a group | the first captured group of the first match in the content |
//! | `regex` without a group | the match of the pattern against the filter text itself |
//!
//! The last row is long-standing behavior: such rules match whenever the
//! pattern matches its own source text, regardless of the content.
//!
//! A bad rule never stops the batch. [`apply_rules`] logs each failure,
//! collects it, and moves on to the next rule. Nothing here persists; the
//! caller saves the document once after the whole set has run.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{Document, Metadata, Rule, RuleAction, RuleDraft, RuleKind};

/// Filters that look like they contain a capturing group.
static SUBMATCH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(.+\)").unwrap());

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule {rule_id}: exact filter is empty")]
    EmptyFilter { rule_id: i64 },

    #[error("rule {rule_id}: invalid regex '{filter}': {source}")]
    InvalidRegex {
        rule_id: i64,
        filter: String,
        #[source]
        source: regex::Error,
    },

    #[error("rule {rule_id}: '{value}' does not match date format '{format}'")]
    DateMismatch {
        rule_id: i64,
        value: String,
        format: String,
    },
}

impl RuleError {
    pub fn rule_id(&self) -> i64 {
        match self {
            RuleError::EmptyFilter { rule_id }
            | RuleError::InvalidRegex { rule_id, .. }
            | RuleError::DateMismatch { rule_id, .. } => *rule_id,
        }
    }
}

fn check_filter(rule_id: i64, kind: RuleKind, filter: &str) -> Result<(), RuleError> {
    match kind {
        RuleKind::Exact if filter.is_empty() => Err(RuleError::EmptyFilter { rule_id }),
        RuleKind::Exact => Ok(()),
        RuleKind::Regex => Regex::new(filter)
            .map(|_| ())
            .map_err(|source| RuleError::InvalidRegex {
                rule_id,
                filter: filter.to_string(),
                source,
            }),
    }
}

impl Rule {
    /// A rule is runnable when its exact filter is non-empty or its regex
    /// compiles.
    pub fn validate(&self) -> Result<(), RuleError> {
        check_filter(self.id, self.kind, &self.filter)
    }
}

impl RuleDraft {
    pub fn validate(&self) -> Result<(), RuleError> {
        check_filter(0, self.kind, &self.filter)
    }
}

/// The match value a rule produces against `content`, if any.
pub fn match_rule(rule: &Rule, content: &str) -> Result<Option<String>, RuleError> {
    match rule.kind {
        RuleKind::Exact => {
            rule.validate()?;
            let filter = rule.filter.to_lowercase();
            Ok(content.to_lowercase().contains(&filter).then_some(filter))
        }
        RuleKind::Regex => {
            let re = Regex::new(&rule.filter).map_err(|source| RuleError::InvalidRegex {
                rule_id: rule.id,
                filter: rule.filter.clone(),
                source,
            })?;

            if SUBMATCH.is_match(&rule.filter) {
                Ok(re
                    .captures(content)
                    .and_then(|caps| caps.get(1))
                    .map(|group| group.as_str().to_string()))
            } else {
                Ok(re.find(&rule.filter).map(|m| m.as_str().to_string()))
            }
        }
    }
}

/// Apply one action to the document with the rule's match value.
pub fn apply_action(
    doc: &mut Document,
    rule_id: i64,
    action: &RuleAction,
    matched: &str,
) -> Result<(), RuleError> {
    match action {
        RuleAction::AddMetadata { key_id, value_id } => {
            doc.metadata.push(Metadata {
                key_id: *key_id,
                value_id: *value_id,
            });
        }
        RuleAction::Rename => {
            doc.name = matched.to_string();
        }
        RuleAction::SetDate { format } => {
            doc.date = parse_date(matched, format).ok_or_else(|| RuleError::DateMismatch {
                rule_id,
                value: matched.to_string(),
                format: format.clone(),
            })?;
        }
        RuleAction::AddTag { tag_id } => {
            doc.tags.push(*tag_id);
        }
        RuleAction::SetDescription => {
            if doc.description.is_empty() {
                doc.description = matched.to_string();
            } else {
                doc.description.push_str("\n\n");
                doc.description.push_str(matched);
            }
        }
    }
    Ok(())
}

/// Run `rules` in order against the document content. Returns the errors
/// of the rules that failed; the others have been applied.
pub fn apply_rules(doc: &mut Document, rules: &[Rule]) -> Vec<RuleError> {
    let mut errors = Vec::new();

    for rule in rules {
        let matched = match match_rule(rule, &doc.content) {
            Ok(Some(matched)) if !matched.is_empty() => matched,
            Ok(_) => continue,
            Err(e) => {
                warn!(document = doc.id, "skipping rule: {}", e);
                errors.push(e);
                continue;
            }
        };

        debug!(
            document = doc.id,
            rule = rule.id,
            action = rule.action.tag(),
            "rule matched '{}'",
            matched
        );

        if let Err(e) = apply_action(doc, rule.id, &rule.action, &matched) {
            warn!(document = doc.id, "rule action failed: {}", e);
            errors.push(e);
        }
    }

    errors
}

/// Parse `value` with a date layout. Accepts chrono `%` formats and the
/// reference-date layouts users write (`2006-01-02`, `02.01.2006`,
/// `Jan 2, 2006`). Layouts without a time of day resolve to midnight UTC.
pub fn parse_date(value: &str, layout: &str) -> Option<DateTime<Utc>> {
    let format = if layout.contains('%') {
        layout.to_string()
    } else {
        translate_layout(layout)
    };
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_str(value, &format) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, &format) {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(value, &format)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Reference-layout tokens, longest first at each position.
const LAYOUT_TOKENS: &[(&str, &str)] = &[
    ("January", "%B"),
    ("Monday", "%A"),
    ("-07:00", "%:z"),
    ("-0700", "%z"),
    ("2006", "%Y"),
    ("Jan", "%b"),
    ("Mon", "%a"),
    ("MST", "%Z"),
    ("_2", "%e"),
    ("01", "%m"),
    ("02", "%d"),
    ("03", "%I"),
    ("04", "%M"),
    ("05", "%S"),
    ("06", "%y"),
    ("15", "%H"),
    ("PM", "%p"),
    ("1", "%m"),
    ("2", "%d"),
    ("3", "%I"),
    ("4", "%M"),
    ("5", "%S"),
];

fn translate_layout(layout: &str) -> String {
    let mut out = String::with_capacity(layout.len() * 2);
    let mut rest = layout;

    'outer: while !rest.is_empty() {
        for (token, item) in LAYOUT_TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(item);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
        }
        rest = chars.as_str();
    }

    out
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<RuleDraft>,
}

/// Read a `[[rules]]` TOML file. Every rule must validate.
pub fn load_rules_file(path: &Path) -> Result<Vec<RuleDraft>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rules file: {}", path.display()))?;
    let file: RulesFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse rules file: {}", path.display()))?;

    for (i, draft) in file.rules.iter().enumerate() {
        draft
            .validate()
            .with_context(|| format!("rules[{}] in {}", i, path.display()))?;
    }

    Ok(file.rules)
}
