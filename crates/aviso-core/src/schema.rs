// ABOUTME: Event schemas loaded from YAML: key templates per engine plus attribute handler chains.
// ABOUTME: Compiles each event type into an EventSchema used by both the listen and publish paths.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::template::{KeyTemplate, TemplateError};
use crate::types::{AttributeRule, TypeError, canonicalize_with};

/// Errors raised while loading a schema or validating values against it.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("unknown event type '{0}'")]
    UnknownEvent(String),

    #[error("event '{event}' has no endpoint for engine '{engine}'")]
    NoEndpoint { event: String, engine: String },

    #[error("event '{event}': template field '{field}' is not declared under request")]
    UndeclaredField { event: String, field: String },

    #[error("event '{event}': unknown attribute '{attribute}'")]
    UnknownAttribute { event: String, attribute: String },

    #[error("event '{event}': attribute '{attribute}' is required")]
    MissingAttribute { event: String, attribute: String },

    #[error("event '{event}': attribute '{attribute}' must be a single scalar value")]
    NotScalar { event: String, attribute: String },

    #[error("event '{event}': attribute '{attribute}': {source}")]
    InvalidValue {
        event: String,
        attribute: String,
        #[source]
        source: TypeError,
    },
}

/// One endpoint entry of an event definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDef {
    #[serde(default)]
    pub engine: Vec<String>,
    pub base: String,
    pub stem: String,
    #[serde(default)]
    pub admin: Option<String>,
}

/// An event definition as written in the schema file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDef {
    #[serde(default = "default_payload")]
    pub payload: String,
    pub endpoint: Vec<EndpointDef>,
    #[serde(default)]
    pub request: BTreeMap<String, Vec<AttributeRule>>,
}

fn default_payload() -> String {
    "payload".to_string()
}

/// A compiled event type for one engine.
#[derive(Debug, Clone)]
pub struct EventSchema {
    pub event: String,
    pub payload: String,
    pub base: KeyTemplate,
    pub stem: KeyTemplate,
    pub leaf: KeyTemplate,
    pub admin: Option<KeyTemplate>,
    pub request: BTreeMap<String, Vec<AttributeRule>>,
}

impl EventSchema {
    /// Compile an event definition, picking the first endpoint usable by `engine`.
    pub fn compile(event: &str, def: &EventDef, engine: &str) -> Result<Self, SchemaError> {
        let endpoint = def
            .endpoint
            .iter()
            .find(|ep| ep.engine.is_empty() || ep.engine.iter().any(|e| e == engine))
            .ok_or_else(|| SchemaError::NoEndpoint {
                event: event.to_string(),
                engine: engine.to_string(),
            })?;

        let base = KeyTemplate::parse(&endpoint.base)?;
        let stem = KeyTemplate::parse(&endpoint.stem)?;
        let leaf = KeyTemplate::join(&base, &stem)?;
        let admin = endpoint
            .admin
            .as_deref()
            .map(KeyTemplate::parse)
            .transpose()?;

        let mut fields: Vec<&str> = leaf.fields();
        if let Some(admin) = &admin {
            fields.extend(admin.fields());
        }
        for field in fields {
            if !def.request.contains_key(field) {
                return Err(SchemaError::UndeclaredField {
                    event: event.to_string(),
                    field: field.to_string(),
                });
            }
        }

        for (attribute, chain) in &def.request {
            for rule in chain {
                rule.handler
                    .check_definition()
                    .map_err(|source| SchemaError::InvalidValue {
                        event: event.to_string(),
                        attribute: attribute.clone(),
                        source,
                    })?;
            }
        }

        Ok(Self {
            event: event.to_string(),
            payload: def.payload.clone(),
            base,
            stem,
            leaf,
            admin,
            request: def.request.clone(),
        })
    }

    /// Validate and canonicalize one attribute value.
    pub fn canonicalize(&self, attribute: &str, raw: &str) -> Result<String, SchemaError> {
        let chain = self
            .request
            .get(attribute)
            .ok_or_else(|| SchemaError::UnknownAttribute {
                event: self.event.clone(),
                attribute: attribute.to_string(),
            })?;
        canonicalize_with(chain, raw).map_err(|source| SchemaError::InvalidValue {
            event: self.event.clone(),
            attribute: attribute.to_string(),
            source,
        })
    }

    /// Attributes with at least one handler marked `required`.
    pub fn required_attributes(&self) -> impl Iterator<Item = &str> {
        self.request
            .iter()
            .filter(|(_, chain)| chain.iter().any(|r| r.required))
            .map(|(name, _)| name.as_str())
    }

    /// Recover attribute values from a concrete leaf key.
    pub fn parse_key(&self, key: &str) -> Option<BTreeMap<String, String>> {
        self.leaf.extract(key)
    }
}

/// All event types of a schema file, compiled for one engine.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    events: BTreeMap<String, EventSchema>,
}

impl Schema {
    pub fn from_yaml(text: &str, engine: &str) -> Result<Self, SchemaError> {
        let defs: BTreeMap<String, EventDef> = serde_yaml::from_str(text)?;
        let mut events = BTreeMap::new();
        for (name, def) in &defs {
            match EventSchema::compile(name, def, engine) {
                Ok(compiled) => {
                    events.insert(name.clone(), compiled);
                }
                Err(SchemaError::NoEndpoint { .. }) => {
                    tracing::debug!("event '{}' has no endpoint for engine {}, skipping", name, engine);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Self { events })
    }

    pub fn load(path: &Path, engine: &str) -> Result<Self, SchemaError> {
        let text = fs::read_to_string(path)?;
        let schema = Self::from_yaml(&text, engine)?;
        tracing::info!(
            "loaded {} event types from {}",
            schema.events.len(),
            path.display()
        );
        Ok(schema)
    }

    pub fn event(&self, name: &str) -> Result<&EventSchema, SchemaError> {
        self.events
            .get(name)
            .ok_or_else(|| SchemaError::UnknownEvent(name.to_string()))
    }

    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }
}
