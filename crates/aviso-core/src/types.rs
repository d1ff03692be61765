// ABOUTME: Type handlers that validate and canonicalize request attribute values.
// ABOUTME: A closed set of variants selected by the schema's `type` tag; chains try each in turn.

use chrono::format::{Item, StrftimeItems};
use chrono::{Duration, NaiveDate, NaiveTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised when a value fails validation.
#[derive(Debug, Error, PartialEq)]
pub enum TypeError {
    #[error("value '{value}' rejected by {kind} handler: {reason}")]
    Invalid {
        kind: &'static str,
        value: String,
        reason: String,
    },

    #[error("value '{value}' rejected by every handler: {reasons}")]
    Rejected { value: String, reasons: String },

    #[error("handler chain is empty")]
    EmptyChain,

    #[error("bad {kind} handler definition: {reason}")]
    BadDefinition { kind: &'static str, reason: String },
}

/// Letter case applied by the string handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Case {
    Upper,
    Lower,
}

/// Validates one attribute value and returns its canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TypeHandler {
    Date {
        #[serde(default = "default_date_canonic")]
        canonic: String,
    },
    Enum {
        values: Vec<String>,
    },
    Int {
        #[serde(default)]
        range: Option<[i64; 2]>,
    },
    Float {
        #[serde(default)]
        range: Option<[f64; 2]>,
    },
    Regex {
        regex: Pattern,
    },
    String {
        #[serde(default)]
        canonic: Option<Case>,
    },
    Time {
        #[serde(default = "default_time_canonic")]
        canonic: String,
    },
}

fn default_date_canonic() -> String {
    "%Y%m%d".to_string()
}

fn default_time_canonic() -> String {
    "%H%M".to_string()
}

/// A regex handler's pattern, compiled once when the schema is read.
///
/// Values must match it as a whole. Equality and serialization use the source text.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern {
    source: String,
    anchored: Regex,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Result<Self, TypeError> {
        let source = source.into();
        let anchored =
            Regex::new(&format!("^(?:{})$", source)).map_err(|e| TypeError::BadDefinition {
                kind: "regex",
                reason: e.to_string(),
            })?;
        Ok(Self { source, anchored })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.anchored.is_match(value)
    }
}

impl TryFrom<String> for Pattern {
    type Error = TypeError;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        Self::new(source)
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.source
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

/// One entry of an attribute's handler chain in the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRule {
    #[serde(flatten)]
    pub handler: TypeHandler,
    #[serde(default)]
    pub required: bool,
}

impl TypeHandler {
    pub fn kind(&self) -> &'static str {
        match self {
            TypeHandler::Date { .. } => "date",
            TypeHandler::Enum { .. } => "enum",
            TypeHandler::Int { .. } => "int",
            TypeHandler::Float { .. } => "float",
            TypeHandler::Regex { .. } => "regex",
            TypeHandler::String { .. } => "string",
            TypeHandler::Time { .. } => "time",
        }
    }

    /// Check the handler's own parameters when a schema is loaded.
    pub fn check_definition(&self) -> Result<(), TypeError> {
        let bad = |reason: String| TypeError::BadDefinition {
            kind: self.kind(),
            reason,
        };
        match self {
            TypeHandler::Date { canonic } | TypeHandler::Time { canonic } => {
                if StrftimeItems::new(canonic).any(|item| matches!(item, Item::Error)) {
                    return Err(bad(format!("invalid canonic format '{}'", canonic)));
                }
            }
            TypeHandler::Enum { values } if values.is_empty() => {
                return Err(bad("no values listed".to_string()));
            }
            TypeHandler::Int { range: Some([lo, hi]) } if lo > hi => {
                return Err(bad(format!("empty range [{}, {}]", lo, hi)));
            }
            TypeHandler::Float { range: Some([lo, hi]) } if lo > hi => {
                return Err(bad(format!("empty range [{}, {}]", lo, hi)));
            }
            _ => {}
        }
        Ok(())
    }

    /// Validate `raw` and return its canonical form.
    pub fn canonicalize(&self, raw: &str) -> Result<String, TypeError> {
        let raw = raw.trim();
        let invalid = |reason: &str| TypeError::Invalid {
            kind: self.kind(),
            value: raw.to_string(),
            reason: reason.to_string(),
        };

        match self {
            TypeHandler::Date { canonic } => parse_date(raw)
                .map(|d| d.format(canonic).to_string())
                .ok_or_else(|| invalid("not a date")),

            TypeHandler::Time { canonic } => parse_time(raw)
                .map(|t| t.format(canonic).to_string())
                .ok_or_else(|| invalid("not a time")),

            TypeHandler::Enum { values } => values
                .iter()
                .find(|v| v.eq_ignore_ascii_case(raw))
                .cloned()
                .ok_or_else(|| invalid("not one of the listed values")),

            TypeHandler::Int { range } => {
                let n: i64 = raw.parse().map_err(|_| invalid("not an integer"))?;
                if let Some([lo, hi]) = range
                    && (n < *lo || n > *hi)
                {
                    return Err(invalid("out of range"));
                }
                Ok(n.to_string())
            }

            TypeHandler::Float { range } => {
                let x: f64 = raw.parse().map_err(|_| invalid("not a number"))?;
                if !x.is_finite() {
                    return Err(invalid("not finite"));
                }
                if let Some([lo, hi]) = range
                    && (x < *lo || x > *hi)
                {
                    return Err(invalid("out of range"));
                }
                Ok(x.to_string())
            }

            TypeHandler::Regex { regex } => {
                if regex.is_match(raw) {
                    Ok(raw.to_string())
                } else {
                    Err(invalid("does not match"))
                }
            }

            TypeHandler::String { canonic } => {
                if raw.is_empty() {
                    return Err(invalid("empty"));
                }
                Ok(match canonic {
                    Some(Case::Upper) => raw.to_uppercase(),
                    Some(Case::Lower) => raw.to_lowercase(),
                    None => raw.to_string(),
                })
            }
        }
    }
}

/// Run a handler chain: the first handler to accept the value wins.
pub fn canonicalize_with(chain: &[AttributeRule], raw: &str) -> Result<String, TypeError> {
    if chain.is_empty() {
        return Err(TypeError::EmptyChain);
    }
    let mut reasons = Vec::new();
    for rule in chain {
        match rule.handler.canonicalize(raw) {
            Ok(value) => return Ok(value),
            Err(e) => reasons.push(e.to_string()),
        }
    }
    Err(TypeError::Rejected {
        value: raw.to_string(),
        reasons: reasons.join("; "),
    })
}

/// Render a scalar JSON/YAML value as the string handlers operate on.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    // Zero or a negative integer is a day offset relative to today (UTC).
    if let Ok(offset) = raw.parse::<i64>()
        && offset <= 0
    {
        return Utc::now()
            .date_naive()
            .checked_sub_signed(Duration::try_days(-offset)?);
    }
    ["%Y%m%d", "%Y-%m-%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    if raw.len() <= 2
        && let Ok(hour) = raw.parse::<u32>()
    {
        return NaiveTime::from_hms_opt(hour, 0, 0);
    }
    ["%H:%M", "%H%M", "%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(raw, fmt).ok())
}
