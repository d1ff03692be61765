// ABOUTME: Key templates with `{name}` placeholders, rendered forwards and matched in reverse.
// ABOUTME: Also holds the bracket-list tokenizer used to expand "[A,B]" request values.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;
use thiserror::Error;

/// Errors raised while parsing or rendering a key template.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed placeholder in template '{0}'")]
    Unclosed(String),

    #[error("invalid placeholder name '{name}' in template '{template}'")]
    InvalidName { template: String, name: String },

    #[error("template '{0}' cannot be matched: {1}")]
    Pattern(String, String),

    #[error("template '{template}' needs a value for '{name}'")]
    MissingField { template: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A parsed key template such as `/ec/diss/{destination}/{date}`.
#[derive(Clone)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
    matcher: Regex,
}

impl fmt::Debug for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyTemplate").field(&self.source).finish()
    }
}

impl PartialEq for KeyTemplate {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl KeyTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars();

        while let Some(c) = chars.next() {
            if c != '{' {
                literal.push(c);
                continue;
            }
            let mut name = String::new();
            let mut closed = false;
            for n in chars.by_ref() {
                if n == '}' {
                    closed = true;
                    break;
                }
                name.push(n);
            }
            if !closed {
                return Err(TemplateError::Unclosed(source.to_string()));
            }
            if !is_valid_name(&name) {
                return Err(TemplateError::InvalidName {
                    template: source.to_string(),
                    name,
                });
            }
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Field(name));
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let matcher = build_matcher(&segments)
            .map_err(|e| TemplateError::Pattern(source.to_string(), e.to_string()))?;
        Ok(Self {
            source: source.to_string(),
            segments,
            matcher,
        })
    }

    /// The template text as written in the schema.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Placeholder names in order of first appearance.
    pub fn fields(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for seg in &self.segments {
            if let Segment::Field(name) = seg
                && !names.contains(&name.as_str())
            {
                names.push(name);
            }
        }
        names
    }

    /// Join a base template and a stem template into a leaf template.
    /// A `/` separator is inserted unless the base already ends with one.
    pub fn join(base: &KeyTemplate, stem: &KeyTemplate) -> Result<Self, TemplateError> {
        let joined = if base.source.ends_with('/') || stem.source.starts_with('/') {
            format!("{}{}", base.source, stem.source)
        } else {
            format!("{}/{}", base.source, stem.source)
        };
        Self::parse(&joined)
    }

    /// Render every placeholder; a missing value is an error.
    pub fn render(&self, values: &BTreeMap<String, String>) -> Result<String, TemplateError> {
        let (rendered, missing) = self.render_until_missing(values);
        match missing {
            None => Ok(rendered),
            Some(name) => Err(TemplateError::MissingField {
                template: self.source.clone(),
                name: name.to_string(),
            }),
        }
    }

    /// Render up to the first placeholder without a value.
    ///
    /// Returns the rendered text and whether the whole template was rendered.
    /// A partial render is a key prefix covering every value of the missing field.
    pub fn render_prefix(&self, values: &BTreeMap<String, String>) -> (String, bool) {
        let (rendered, missing) = self.render_until_missing(values);
        (rendered, missing.is_none())
    }

    fn render_until_missing<'a>(
        &'a self,
        values: &BTreeMap<String, String>,
    ) -> (String, Option<&'a str>) {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => match values.get(name) {
                    Some(value) => out.push_str(value),
                    None => return (out, Some(name.as_str())),
                },
            }
        }
        (out, None)
    }

    /// Recover placeholder values from a concrete key.
    /// Returns `None` when the key does not have this template's shape.
    pub fn extract(&self, key: &str) -> Option<BTreeMap<String, String>> {
        let captures = self.matcher.captures(key)?;
        let mut values = BTreeMap::new();
        for name in self.fields() {
            if let Some(m) = captures.name(name) {
                values.insert(name.to_string(), m.as_str().to_string());
            }
        }
        Some(values)
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn build_matcher(segments: &[Segment]) -> Result<Regex, regex::Error> {
    let mut pattern = String::from("^");
    let mut seen: Vec<&str> = Vec::new();
    for seg in segments {
        match seg {
            Segment::Literal(text) => pattern.push_str(&regex::escape(text)),
            // Regex groups cannot repeat a name; later occurrences match anonymously.
            Segment::Field(name) if seen.contains(&name.as_str()) => pattern.push_str("(?:.+?)"),
            Segment::Field(name) => {
                seen.push(name);
                pattern.push_str(&format!("(?P<{}>.+?)", name));
            }
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

/// Split a bracket-delimited list literal such as `"[T1, 'T 2']"`.
///
/// Returns `None` when the value is not bracketed. Items are trimmed and may be
/// single- or double-quoted; commas inside quotes do not split.
pub fn split_bracket_list(value: &str) -> Option<Vec<String>> {
    let inner = value.trim().strip_prefix('[')?.strip_suffix(']')?;

    let mut items = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut saw_content = false;

    for c in inner.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    saw_content = true;
                }
                ',' => {
                    items.push(std::mem::take(&mut current).trim().to_string());
                    saw_content = false;
                }
                _ => {
                    if !c.is_whitespace() {
                        saw_content = true;
                    }
                    current.push(c);
                }
            },
        }
    }
    if saw_content || !items.is_empty() {
        items.push(current.trim().to_string());
    }
    Some(items)
}
