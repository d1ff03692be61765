// ABOUTME: Publish-side key derivation and the notification document handed to triggers.
// ABOUTME: derive_notification_keys is the mirror of the listener's key expansion.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::schema::{EventSchema, SchemaError};
use crate::template::TemplateError;
use crate::types::scalar_to_string;

/// Keys written by one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationKeys {
    /// Data key holding the payload.
    pub leaf: String,
    /// Key holding the status chain.
    pub base: String,
    /// Optional retention marker.
    pub admin: Option<String>,
    /// Canonical request attributes used to render the keys.
    pub request: BTreeMap<String, String>,
}

/// Validate publish parameters and canonicalize every attribute.
///
/// Publishing addresses exactly one key, so list values are rejected and
/// every required attribute must be present.
pub fn canonical_request(
    params: &BTreeMap<String, Value>,
    schema: &EventSchema,
) -> Result<BTreeMap<String, String>, SchemaError> {
    let mut request = BTreeMap::new();
    for (attribute, value) in params {
        let raw = scalar_to_string(value).ok_or_else(|| SchemaError::NotScalar {
            event: schema.event.clone(),
            attribute: attribute.clone(),
        })?;
        request.insert(attribute.clone(), schema.canonicalize(attribute, &raw)?);
    }
    for required in schema.required_attributes() {
        if !request.contains_key(required) {
            return Err(SchemaError::MissingAttribute {
                event: schema.event.clone(),
                attribute: required.to_string(),
            });
        }
    }
    Ok(request)
}

/// Derive the (leaf, base, admin) keys a publish writes to.
pub fn derive_notification_keys(
    params: &BTreeMap<String, Value>,
    schema: &EventSchema,
) -> Result<NotificationKeys, SchemaError> {
    let request = canonical_request(params, schema)?;
    let missing = |e: TemplateError| match e {
        TemplateError::MissingField { name, .. } => {
            SchemaError::MissingAttribute {
                event: schema.event.clone(),
                attribute: name,
            }
        }
        other => SchemaError::Template(other),
    };

    let leaf = schema.leaf.render(&request).map_err(missing)?;
    let base = schema.base.render(&request).map_err(missing)?;
    let admin = match &schema.admin {
        Some(template) => Some(template.render(&request).map_err(missing)?),
        None => None,
    };

    Ok(NotificationKeys {
        leaf,
        base,
        admin,
        request,
    })
}

/// A matched notification, as passed to triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub event: String,
    pub request: BTreeMap<String, String>,
    pub payload_field: String,
    pub payload: Option<String>,
}

impl Notification {
    /// `{event, request[, <payload_field>]}` as JSON.
    pub fn to_value(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("event".to_string(), Value::String(self.event.clone()));
        let request: Map<String, Value> = self
            .request
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        doc.insert("request".to_string(), Value::Object(request));
        if let Some(payload) = &self.payload {
            doc.insert(self.payload_field.clone(), Value::String(payload.clone()));
        }
        Value::Object(doc)
    }
}
