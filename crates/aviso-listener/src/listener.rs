// ABOUTME: Event listeners: expand a request into watch keys and filters, then match and dispatch changes.
// ABOUTME: Listener files are YAML; every input problem is reported before any store access.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use aviso_core::template::split_bracket_list;
use aviso_core::types::scalar_to_string;
use aviso_core::{EventSchema, KeyValueRecord, Notification, Schema, SchemaError};
use aviso_store::{WatchCallback, WatchKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::trigger::{FunctionRegistry, TriggerDispatcher, TriggerError, TriggerSpec};

/// Errors raised while building a listener. All of them are input errors.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("listener for '{0}' has no triggers")]
    NoTriggers(String),

    #[error("listener for '{event}': attribute '{attribute}' has no values")]
    EmptyValues { event: String, attribute: String },

    #[error("listener for '{event}': attribute '{attribute}' is not part of the key and cannot be filtered")]
    NotInKey { event: String, attribute: String },

    #[error("listener for '{event}': base key needs attribute '{attribute}'")]
    IncompleteBase { event: String, attribute: String },
}

/// Top-level shape of a listener file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub listeners: Vec<ListenerDef>,
}

/// One listener: an event type, the request to match and what to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerDef {
    pub event: String,
    #[serde(default)]
    pub request: BTreeMap<String, Value>,
    pub triggers: Vec<TriggerSpec>,
}

impl ListenerConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ListenerError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ListenerError> {
        let config = Self::from_yaml(&fs::read_to_string(path)?)?;
        tracing::info!(
            "loaded {} listeners from {}",
            config.listeners.len(),
            path.display()
        );
        Ok(config)
    }
}

/// A compiled listener, ready to be handed to the polling scheduler.
pub struct EventListener {
    schema: EventSchema,
    keys: Vec<WatchKey>,
    filters: BTreeMap<String, Vec<String>>,
    dispatcher: TriggerDispatcher,
}

impl std::fmt::Debug for EventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListener")
            .field("event", &self.schema.event)
            .field("keys", &self.keys)
            .field("filters", &self.filters)
            .finish()
    }
}

impl EventListener {
    pub fn new(
        def: &ListenerDef,
        schema: &Schema,
        registry: &FunctionRegistry,
    ) -> Result<Self, ListenerError> {
        let event = schema.event(&def.event)?.clone();
        if def.triggers.is_empty() {
            return Err(ListenerError::NoTriggers(def.event.clone()));
        }

        let filters = filter_expansion(&def.request, &event)?;
        let keys = key_expansion(&filters, &event)?;
        let dispatcher = TriggerDispatcher::new(&def.triggers, registry)?;
        tracing::debug!(
            "listener for '{}' watches {} keys with {} triggers",
            event.event,
            keys.len(),
            dispatcher.len()
        );

        Ok(Self {
            schema: event,
            keys,
            filters,
            dispatcher,
        })
    }

    pub fn event(&self) -> &str {
        &self.schema.event
    }

    pub fn keys(&self) -> &[WatchKey] {
        &self.keys
    }

    pub fn filters(&self) -> &BTreeMap<String, Vec<String>> {
        &self.filters
    }

    /// Build the notification for a changed key, or `None` if it does not match.
    pub fn matches(&self, key: &str, value: &[u8]) -> Option<Notification> {
        let raw = self.schema.parse_key(key)?;
        let mut request = BTreeMap::new();
        for (attribute, raw_value) in raw {
            match self.schema.canonicalize(&attribute, &raw_value) {
                Ok(canonical) => {
                    request.insert(attribute, canonical);
                }
                Err(e) => {
                    tracing::debug!("dropping {}: {}", key, e);
                    return None;
                }
            }
        }

        let accepted = self
            .filters
            .iter()
            .all(|(attribute, values)| request.get(attribute).is_some_and(|v| values.contains(v)));
        if !accepted {
            return None;
        }

        let payload = (!value.is_empty()).then(|| String::from_utf8_lossy(value).into_owned());
        Some(Notification {
            event: self.schema.event.clone(),
            request,
            payload_field: self.schema.payload.clone(),
            payload,
        })
    }

    /// Match a change and run the triggers. Returns whether it matched.
    pub async fn callback(&self, key: &str, value: &[u8]) -> Result<bool, TriggerError> {
        let Some(notification) = self.matches(key, value) else {
            return Ok(false);
        };
        tracing::info!("notification for '{}' on {}", self.schema.event, key);
        self.dispatcher.dispatch(&notification.to_value()).await?;
        Ok(true)
    }
}

#[async_trait]
impl WatchCallback for EventListener {
    async fn notify(&self, record: KeyValueRecord) {
        if let Err(e) = self.callback(&record.key, &record.value).await {
            tracing::error!(
                "trigger for '{}' failed on {} (revision {}): {}",
                self.schema.event,
                record.key,
                record.mod_revision,
                e
            );
        }
    }
}

/// Values of one request attribute: a YAML list, a bracket literal, or a single scalar.
fn attribute_values(event: &str, attribute: &str, value: &Value) -> Result<Vec<String>, SchemaError> {
    let not_scalar = || SchemaError::NotScalar {
        event: event.to_string(),
        attribute: attribute.to_string(),
    };
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| scalar_to_string(item).ok_or_else(not_scalar))
            .collect(),
        other => {
            let raw = scalar_to_string(other).ok_or_else(not_scalar)?;
            Ok(split_bracket_list(&raw).unwrap_or_else(|| vec![raw]))
        }
    }
}

/// Every request attribute mapped to its canonical accepted values.
pub fn filter_expansion(
    request: &BTreeMap<String, Value>,
    schema: &EventSchema,
) -> Result<BTreeMap<String, Vec<String>>, ListenerError> {
    let key_fields = schema.leaf.fields();
    let mut filters = BTreeMap::new();
    for (attribute, value) in request {
        let raw_values = attribute_values(&schema.event, attribute, value)?;
        let mut canonical: Vec<String> = Vec::with_capacity(raw_values.len());
        for raw in raw_values {
            let value = schema.canonicalize(attribute, &raw)?;
            if !canonical.contains(&value) {
                canonical.push(value);
            }
        }
        if canonical.is_empty() {
            return Err(ListenerError::EmptyValues {
                event: schema.event.clone(),
                attribute: attribute.clone(),
            });
        }
        if !key_fields.contains(&attribute.as_str()) {
            return Err(ListenerError::NotInKey {
                event: schema.event.clone(),
                attribute: attribute.clone(),
            });
        }
        filters.insert(attribute.clone(), canonical);
    }
    Ok(filters)
}

/// Watch keys for every combination of filter values.
///
/// Stem placeholders without a value cut the stem short and the key is watched as
/// a prefix. Base placeholders must all have values.
pub fn key_expansion(
    filters: &BTreeMap<String, Vec<String>>,
    schema: &EventSchema,
) -> Result<Vec<WatchKey>, ListenerError> {
    for field in schema.base.fields() {
        if !filters.contains_key(field) {
            return Err(ListenerError::IncompleteBase {
                event: schema.event.clone(),
                attribute: field.to_string(),
            });
        }
    }

    // Only fields before the first missing one shape the key.
    let used: Vec<&str> = schema
        .leaf
        .fields()
        .into_iter()
        .take_while(|field| filters.contains_key(*field))
        .collect();

    let mut combinations: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
    for field in &used {
        let values = filters.get(*field).map(Vec::as_slice).unwrap_or_default();
        combinations = combinations
            .into_iter()
            .flat_map(move |combo| {
                values.iter().map(move |value| {
                    let mut next = combo.clone();
                    next.insert(field.to_string(), value.clone());
                    next
                })
            })
            .collect();
    }

    let mut seen = BTreeSet::new();
    let mut keys = Vec::new();
    for values in combinations {
        let base_key = schema.base.render(&values).map_err(SchemaError::from)?;
        let (key, complete) = schema.leaf.render_prefix(&values);
        if seen.insert(key.clone()) {
            keys.push(WatchKey {
                key,
                base_key,
                prefix: !complete,
            });
        }
    }
    Ok(keys)
}

/// Build every listener in `config`; the first input error aborts the whole batch.
pub fn build_listeners(
    config: &ListenerConfig,
    schema: &Schema,
    registry: &FunctionRegistry,
) -> Result<Vec<EventListener>, ListenerError> {
    config
        .listeners
        .iter()
        .map(|def| EventListener::new(def, schema, registry))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    const SCHEMA: &str = r#"
flight:
  payload: location
  endpoint:
    - engine: [in_memory]
      base: /x/{stream}/
      stem: "{date}"
  request:
    stream:
      - type: enum
        values: [enfo, oper]
        required: true
    date:
      - type: date
        required: true
diss:
  endpoint:
    - base: /ec/diss/{destination}
      stem: "date={date},target={target},class={class}"
  request:
    destination:
      - type: string
        canonic: upper
        required: true
    date:
      - type: date
    target:
      - type: string
    class:
      - type: enum
        values: [od, rd]
"#;

    fn schema() -> Schema {
        Schema::from_yaml(SCHEMA, "in_memory").unwrap()
    }

    fn def(event: &str, request: Value) -> ListenerDef {
        ListenerDef {
            event: event.to_string(),
            request: serde_json::from_value(request).unwrap(),
            triggers: vec![TriggerSpec::Echo],
        }
    }

    fn listener(event: &str, request: Value) -> EventListener {
        EventListener::new(&def(event, request), &schema(), &FunctionRegistry::new()).unwrap()
    }

    fn key_strings(l: &EventListener) -> Vec<String> {
        l.keys().iter().map(|k| k.key.clone()).collect()
    }

    #[test]
    fn single_request_watches_exact_key() {
        let l = listener("flight", json!({"stream": "enfo", "date": 20190810}));
        assert_eq!(
            l.keys(),
            &[WatchKey {
                key: "/x/enfo/20190810".to_string(),
                base_key: "/x/enfo/".to_string(),
                prefix: false,
            }]
        );
    }

    #[test]
    fn bracket_and_list_values_expand() {
        let l = listener(
            "diss",
            json!({"destination": "scl", "date": "20200101", "target": "[T1, T2]", "class": ["od", "rd"]}),
        );
        assert_eq!(
            key_strings(&l),
            vec![
                "/ec/diss/SCL/date=20200101,target=T1,class=od",
                "/ec/diss/SCL/date=20200101,target=T1,class=rd",
                "/ec/diss/SCL/date=20200101,target=T2,class=od",
                "/ec/diss/SCL/date=20200101,target=T2,class=rd",
            ]
        );
        assert!(l.keys().iter().all(|k| k.base_key == "/ec/diss/SCL"));
    }

    #[test]
    fn expanded_key_parses_back_to_request() {
        let l = listener(
            "diss",
            json!({"destination": "scl", "date": "2020-01-01", "target": "T1", "class": "OD"}),
        );
        let parsed = schema().event("diss").unwrap().parse_key(&l.keys()[0].key).unwrap();
        let expected: BTreeMap<String, String> = l
            .filters()
            .iter()
            .map(|(k, v)| (k.clone(), v[0].clone()))
            .collect();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn missing_stem_field_watches_prefix() {
        let l = listener("diss", json!({"destination": "SCL", "date": "20200101", "class": "od"}));
        assert_eq!(
            l.keys(),
            &[WatchKey {
                key: "/ec/diss/SCL/date=20200101,target=".to_string(),
                base_key: "/ec/diss/SCL".to_string(),
                prefix: true,
            }]
        );
        assert_eq!(l.filters().get("class"), Some(&vec!["od".to_string()]));
    }

    #[test]
    fn missing_base_field_is_an_input_error() {
        let err = EventListener::new(
            &def("flight", json!({"date": "20190810"})),
            &schema(),
            &FunctionRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ListenerError::IncompleteBase { ref attribute, .. } if attribute == "stream"));
    }

    #[test]
    fn input_errors_are_reported_up_front() {
        let build = |event: &str, request: Value| {
            EventListener::new(&def(event, request), &schema(), &FunctionRegistry::new())
        };
        assert!(matches!(
            build("ferry", json!({})),
            Err(ListenerError::Schema(SchemaError::UnknownEvent(_)))
        ));
        assert!(matches!(
            build("flight", json!({"stream": "enfo", "colour": "red"})),
            Err(ListenerError::Schema(SchemaError::UnknownAttribute { .. }))
        ));
        assert!(matches!(
            build("flight", json!({"stream": "mars"})),
            Err(ListenerError::Schema(SchemaError::InvalidValue { .. }))
        ));
        assert!(matches!(
            build("flight", json!({"stream": "[]"})),
            Err(ListenerError::EmptyValues { .. })
        ));
    }

    #[test]
    fn filters_are_anded_after_canonicalization() {
        let l = listener("diss", json!({"destination": "scl", "class": "OD"}));
        assert!(l.matches("/ec/diss/SCL/date=20200101,target=T1,class=od", b"").is_some());
        assert!(l.matches("/ec/diss/SCL/date=20200101,target=T1,class=rd", b"").is_none());
        assert!(l.matches("/ec/diss/XYZ/date=20200101,target=T1,class=od", b"").is_none());
        assert!(l.matches("/ec/other", b"").is_none());
    }

    #[test]
    fn notification_carries_payload_under_schema_name() {
        let l = listener("flight", json!({"stream": "enfo", "date": "20190810"}));
        let n = l.matches("/x/enfo/20190810", b"s3://bucket/file").unwrap();
        assert_eq!(
            n.to_value(),
            json!({
                "event": "flight",
                "request": {"stream": "enfo", "date": "20190810"},
                "location": "s3://bucket/file"
            })
        );
    }

    #[tokio::test]
    async fn callback_runs_triggers_only_on_match() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = FunctionRegistry::new();
        let sink = Arc::clone(&seen);
        registry.register("collect", move |doc| {
            sink.lock().unwrap().push(doc.clone());
            Ok(())
        });

        let mut d = def("flight", json!({"stream": "enfo", "date": "20190810"}));
        d.triggers = vec![TriggerSpec::Function {
            function: "collect".to_string(),
        }];
        let l = EventListener::new(&d, &schema(), &registry).unwrap();

        assert!(l.callback("/x/enfo/20190810", b"here").await.unwrap());
        assert!(!l.callback("/x/oper/20190810", b"there").await.unwrap());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["location"], "here");
    }

    #[test]
    fn listener_file_parses() {
        let yaml = r#"
listeners:
  - event: flight
    request:
      stream: enfo
      date: 20190810
    triggers:
      - type: echo
"#;
        let config = ListenerConfig::from_yaml(yaml).unwrap();
        let listeners = build_listeners(&config, &schema(), &FunctionRegistry::new()).unwrap();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].event(), "flight");
    }

    #[test]
    fn listener_without_triggers_is_rejected() {
        let mut d = def("flight", json!({"stream": "enfo"}));
        d.triggers.clear();
        let err = EventListener::new(&d, &schema(), &FunctionRegistry::new()).unwrap_err();
        assert!(matches!(err, ListenerError::NoTriggers(_)));
    }
}
