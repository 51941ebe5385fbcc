//! Unit validator - declarative rules, normalization, fingerprinting
//!
//! Pure function from (raw unit, job configuration) to either a normalized
//! unit or an ordered, non-empty list of field-level validation errors.
//! Validation performs no I/O so it can run ahead of dispatch at high
//! concurrency. The rule set is closed: required, type, pattern, plus a
//! fixed set of cross-field rules. Unknown fields follow an explicit
//! per-job policy.

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

use crate::domain::job::JobConfig;
use crate::import_engine::parser::RawUnit;

/// Target type a field's raw text is coerced into
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
    /// `YYYY-MM-DD`
    Date,
    /// Newline-separated entries within one cell
    TextList,
}

/// Field-level rule: required, type coercion, optional pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldRule {
    pub field: String,
    #[serde(default)]
    pub required: bool,
    pub field_type: FieldType,
    /// Applied to the raw text before coercion
    #[serde(default)]
    pub pattern: Option<String>,
}

/// Rules spanning multiple fields, evaluated only when every referenced
/// field passed its field-level rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrossFieldRule {
    RequiredTogether { fields: Vec<String> },
    MutuallyExclusive { fields: Vec<String> },
    AtLeastOneOf { fields: Vec<String> },
}

/// Handling of fields present in the unit but absent from the rule set
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnknownFieldPolicy {
    Reject,
    Ignore,
    PassThrough,
}

/// One structured validation failure: the offending field, the rule
/// violated and a safe representation of the offending value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub rule: String,
    pub value: Option<String>,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, rule: &str, value: Option<String>, message: String) -> Self {
        Self {
            field: field.to_string(),
            rule: rule.to_string(),
            value,
            message,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.field, self.rule, self.message)
    }
}

/// Typed payload post-coercion plus its content fingerprint
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedUnit {
    pub fields: Map<String, Value>,
    pub fingerprint: String,
}

/// A job configuration that cannot be compiled into a validator
#[derive(Debug, Error)]
pub enum ValidatorBuildError {
    #[error("invalid pattern for field '{field}': {source}")]
    BadPattern {
        field: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug)]
struct CompiledRule {
    rule: FieldRule,
    pattern: Option<Regex>,
}

/// Compiled per-job validator. Patterns compile once at construction;
/// a bad pattern is a configuration error, not a per-unit error.
#[derive(Debug)]
pub struct UnitValidator {
    rules: Vec<CompiledRule>,
    cross_rules: Vec<CrossFieldRule>,
    unknown_policy: UnknownFieldPolicy,
    mapping: Vec<(String, String)>,
    defaults: Map<String, Value>,
}

impl UnitValidator {
    pub fn for_job(config: &JobConfig) -> Result<Self, ValidatorBuildError> {
        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            let pattern = match &rule.pattern {
                Some(p) => Some(Regex::new(p).map_err(|source| ValidatorBuildError::BadPattern {
                    field: rule.field.clone(),
                    source,
                })?),
                None => None,
            };
            rules.push(CompiledRule {
                rule: rule.clone(),
                pattern,
            });
        }
        Ok(Self {
            rules,
            cross_rules: config.cross_rules.clone(),
            unknown_policy: config.unknown_fields,
            mapping: config
                .mapping
                .iter()
                .map(|m| (m.source.clone(), m.target.clone()))
                .collect(),
            defaults: config.defaults.clone(),
        })
    }

    /// Validate and normalize one raw unit. The error list is ordered by
    /// rule order and never empty on the `Err` side.
    pub fn validate(&self, unit: &RawUnit) -> Result<NormalizedUnit, Vec<ValidationError>> {
        let mut working = unit.fields.clone();

        // Column mapping and defaults run before rule evaluation
        for (source, target) in &self.mapping {
            if let Some(value) = working.remove(source) {
                working.insert(target.clone(), value);
            }
        }
        for (field, value) in &self.defaults {
            if !working.contains_key(field) {
                working.insert(field.clone(), value.clone());
            }
        }

        let mut errors: Vec<ValidationError> = Vec::new();
        let mut normalized = Map::new();
        let mut failed_fields: HashSet<&str> = HashSet::new();

        for compiled in &self.rules {
            let rule = &compiled.rule;
            let raw_value = working.get(&rule.field);
            let text = raw_value.and_then(value_text);

            let Some(text) = text else {
                // Empty optional fields normalize to absent, not empty string
                if rule.required {
                    errors.push(ValidationError::new(
                        &rule.field,
                        "required",
                        None,
                        format!("field '{}' is required", rule.field),
                    ));
                    failed_fields.insert(&rule.field);
                }
                continue;
            };

            if let Some(pattern) = &compiled.pattern {
                if !pattern.is_match(&text) {
                    errors.push(ValidationError::new(
                        &rule.field,
                        "pattern",
                        Some(text.clone()),
                        format!("value does not match pattern '{}'", pattern.as_str()),
                    ));
                    failed_fields.insert(&rule.field);
                    continue;
                }
            }

            match coerce(&text, raw_value, rule.field_type) {
                Ok(value) => {
                    normalized.insert(rule.field.clone(), value);
                }
                Err(message) => {
                    errors.push(ValidationError::new(
                        &rule.field,
                        "type",
                        Some(text),
                        message,
                    ));
                    failed_fields.insert(&rule.field);
                }
            }
        }

        // Unknown fields: present in the unit, absent from the rule set
        let known: HashSet<&str> = self.rules.iter().map(|c| c.rule.field.as_str()).collect();
        for (field, value) in &working {
            if known.contains(field.as_str()) {
                continue;
            }
            match self.unknown_policy {
                UnknownFieldPolicy::Reject => errors.push(ValidationError::new(
                    field,
                    "unknown-field",
                    value_text(value),
                    format!("field '{field}' is not part of the import schema"),
                )),
                UnknownFieldPolicy::Ignore => {}
                UnknownFieldPolicy::PassThrough => {
                    normalized.insert(field.clone(), value.clone());
                }
            }
        }

        // Cross-field rules run only when every referenced field passed
        for cross in &self.cross_rules {
            let fields = cross_fields(cross);
            if fields.iter().any(|f| failed_fields.contains(f.as_str())) {
                continue;
            }
            let present: Vec<&String> =
                fields.iter().filter(|f| normalized.contains_key(*f)).collect();
            match cross {
                CrossFieldRule::RequiredTogether { fields } => {
                    if !present.is_empty() && present.len() < fields.len() {
                        for absent in fields.iter().filter(|f| !normalized.contains_key(*f)) {
                            errors.push(ValidationError::new(
                                absent,
                                "required-together",
                                None,
                                format!("fields {fields:?} must be provided together"),
                            ));
                        }
                    }
                }
                CrossFieldRule::MutuallyExclusive { fields } => {
                    if present.len() > 1 {
                        errors.push(ValidationError::new(
                            present[1],
                            "mutually-exclusive",
                            value_text(&normalized[present[1].as_str()]),
                            format!("at most one of {fields:?} may be provided"),
                        ));
                    }
                }
                CrossFieldRule::AtLeastOneOf { fields } => {
                    if present.is_empty() {
                        errors.push(ValidationError::new(
                            &fields[0],
                            "at-least-one-of",
                            None,
                            format!("at least one of {fields:?} must be provided"),
                        ));
                    }
                }
            }
        }

        if errors.is_empty() {
            let fingerprint = fingerprint(&normalized);
            Ok(NormalizedUnit {
                fields: normalized,
                fingerprint,
            })
        } else {
            Err(errors)
        }
    }
}

fn cross_fields(rule: &CrossFieldRule) -> &[String] {
    match rule {
        CrossFieldRule::RequiredTogether { fields }
        | CrossFieldRule::MutuallyExclusive { fields }
        | CrossFieldRule::AtLeastOneOf { fields } => fields,
    }
}

/// Raw text of a value for pattern matching and error reporting. Empty or
/// whitespace-only strings count as absent.
fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn coerce(text: &str, raw: Option<&Value>, field_type: FieldType) -> Result<Value, String> {
    match field_type {
        FieldType::Text => Ok(Value::String(text.to_string())),
        FieldType::Integer => text
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|_| format!("'{text}' is not an integer")),
        FieldType::Float => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("'{text}' is not a number")),
        FieldType::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err(format!("'{text}' is not a boolean")),
        },
        FieldType::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(|_| Value::String(text.to_string()))
            .map_err(|_| format!("'{text}' is not a date in YYYY-MM-DD form")),
        FieldType::TextList => {
            // A JSON source may already carry a list
            if let Some(Value::Array(items)) = raw {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) if !s.trim().is_empty() => {
                            out.push(Value::String(s.trim().to_string()));
                        }
                        Value::String(_) => {}
                        other => return Err(format!("list entry '{other}' is not text")),
                    }
                }
                return Ok(Value::Array(out));
            }
            let entries: Vec<Value> = text
                .split('\n')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect();
            Ok(Value::Array(entries))
        }
    }
}

/// Content hash of the canonical JSON rendering of the normalized payload.
/// `serde_json::Map` keeps keys sorted, so equal content hashes equally.
fn fingerprint(fields: &Map<String, Value>) -> String {
    let canonical = serde_json::to_string(fields).unwrap_or_default();
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}
