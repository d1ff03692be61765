// ABOUTME: Publish side: validate notification parameters, derive keys and write them with a status record.
// ABOUTME: Also answers which key a notification maps to and what value that key currently holds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use aviso_core::types::scalar_to_string;
use aviso_core::{NotificationKeys, Revision, Schema, SchemaError, derive_notification_keys};
use aviso_store::{KeyValue, Pull, StatusPush, StoreAdapter, StoreError, push_with_status};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("parameters must name an event")]
    MissingEvent,

    #[error("malformed parameter '{0}', expected name=value")]
    MalformedParam(String),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Keys written by a publish and the revision they were committed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub keys: NotificationKeys,
    pub revision: Revision,
}

pub struct Notifier {
    store: Arc<dyn StoreAdapter>,
    schema: Schema,
    ttl: Option<Duration>,
}

impl Notifier {
    pub fn new(store: Arc<dyn StoreAdapter>, schema: Schema, ttl: Option<Duration>) -> Self {
        Self { store, schema, ttl }
    }

    /// Write the payload at the leaf key, with status and admin bookkeeping.
    ///
    /// `params` holds `event`, the request attributes and optionally the payload
    /// under the event's payload field name.
    pub async fn notify(&self, params: &BTreeMap<String, Value>) -> Result<Published, PublishError> {
        let (keys, payload) = self.prepare(params)?;
        let push = StatusPush::new(
            vec![KeyValue::new(keys.leaf.clone(), payload.unwrap_or_default())],
            keys.base.clone(),
            format!("notification to {}", keys.leaf),
        )
        .admin_key(keys.admin.clone())
        .ttl(self.ttl);

        let revision = push_with_status(self.store.as_ref(), push).await?;
        tracing::info!("published {} at revision {}", keys.leaf, revision);
        Ok(Published { keys, revision })
    }

    /// The leaf key a notification with `params` is written to.
    pub fn key(&self, params: &BTreeMap<String, Value>) -> Result<String, PublishError> {
        Ok(self.prepare(params)?.0.leaf)
    }

    /// The value currently stored at the leaf key for `params`.
    pub async fn value(&self, params: &BTreeMap<String, Value>) -> Result<Option<String>, PublishError> {
        let key = self.key(params)?;
        let records = self.store.pull(&Pull::key(&key)).await?;
        Ok(records
            .into_iter()
            .next()
            .map(|record| String::from_utf8_lossy(&record.value).into_owned()))
    }

    fn prepare(
        &self,
        params: &BTreeMap<String, Value>,
    ) -> Result<(NotificationKeys, Option<String>), PublishError> {
        let mut request = params.clone();
        let event = request
            .remove("event")
            .as_ref()
            .and_then(scalar_to_string)
            .ok_or(PublishError::MissingEvent)?;
        let schema = self.schema.event(&event)?;

        let payload = match request.remove(&schema.payload) {
            None | Some(Value::Null) => None,
            Some(value) => Some(match scalar_to_string(&value) {
                Some(text) => text,
                None => serde_json::to_string(&value)?,
            }),
        };
        let keys = derive_notification_keys(&request, schema)?;
        Ok((keys, payload))
    }
}

/// Parse `name=value` pairs separated by commas, as given on the command line.
pub fn parse_params(text: &str) -> Result<BTreeMap<String, Value>, PublishError> {
    let mut params = BTreeMap::new();
    for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((name, value)) = item.split_once('=') else {
            return Err(PublishError::MalformedParam(item.to_string()));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(PublishError::MalformedParam(item.to_string()));
        }
        params.insert(name.to_string(), Value::String(value.trim().to_string()));
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aviso_core::StatusRecord;
    use aviso_store::{MemoryStore, current_status};
    use serde_json::json;

    const SCHEMA: &str = r#"
flight:
  payload: location
  endpoint:
    - base: /x/{stream}/
      stem: "{date}"
      admin: /admin/{date}/{stream}
  request:
    stream:
      - type: enum
        values: [enfo, oper]
        required: true
    date:
      - type: date
        required: true
"#;

    fn notifier() -> (Arc<MemoryStore>, Notifier) {
        let store = Arc::new(MemoryStore::new());
        let schema = Schema::from_yaml(SCHEMA, "in_memory").unwrap();
        let notifier = Notifier::new(store.clone(), schema, None);
        (store, notifier)
    }

    #[test]
    fn params_parse_from_command_line() {
        let params = parse_params("event=flight, stream=enfo,date=20190810").unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params["stream"], json!("enfo"));
        assert!(matches!(
            parse_params("event=flight,oops"),
            Err(PublishError::MalformedParam(ref p)) if p == "oops"
        ));
    }

    #[test]
    fn key_is_derived_from_params() {
        let (_, notifier) = notifier();
        let params = parse_params("event=flight,stream=ENFO,date=2019-08-10").unwrap();
        assert_eq!(notifier.key(&params).unwrap(), "/x/enfo/20190810");
    }

    #[test]
    fn missing_event_or_attribute_is_rejected() {
        let (_, notifier) = notifier();
        assert!(matches!(
            notifier.key(&parse_params("stream=enfo").unwrap()),
            Err(PublishError::MissingEvent)
        ));
        assert!(matches!(
            notifier.key(&parse_params("event=flight,stream=enfo").unwrap()),
            Err(PublishError::Schema(SchemaError::MissingAttribute { .. }))
        ));
    }

    #[tokio::test]
    async fn notify_writes_payload_status_and_admin() {
        let (store, notifier) = notifier();
        let params =
            parse_params("event=flight,stream=enfo,date=20190810,location=s3://bucket/a").unwrap();

        let published = notifier.notify(&params).await.unwrap();
        assert_eq!(published.keys.leaf, "/x/enfo/20190810");
        assert_eq!(published.keys.admin.as_deref(), Some("/admin/20190810/enfo"));

        assert_eq!(
            notifier.value(&params).await.unwrap().as_deref(),
            Some("s3://bucket/a")
        );

        let (status, revision): (StatusRecord, Revision) =
            current_status(store.as_ref(), "/x/enfo/").await.unwrap().unwrap();
        assert_eq!(revision, published.revision);
        assert_eq!(status.prev_revision, None);

        let admin = store.pull(&Pull::key("/admin/20190810/enfo")).await.unwrap();
        let listed: Vec<String> = serde_json::from_slice(&admin[0].value).unwrap();
        assert_eq!(listed, vec!["/x/enfo/20190810"]);
    }

    #[tokio::test]
    async fn second_publish_links_to_first() {
        let (store, notifier) = notifier();
        let first = notifier
            .notify(&parse_params("event=flight,stream=enfo,date=20190810").unwrap())
            .await
            .unwrap();
        notifier
            .notify(&parse_params("event=flight,stream=enfo,date=20190811").unwrap())
            .await
            .unwrap();

        let (status, _) = current_status(store.as_ref(), "/x/enfo/").await.unwrap().unwrap();
        assert_eq!(status.prev_revision, Some(first.revision));
    }

    #[tokio::test]
    async fn value_of_unpublished_key_is_none() {
        let (_, notifier) = notifier();
        let params = parse_params("event=flight,stream=oper,date=20190810").unwrap();
        assert_eq!(notifier.value(&params).await.unwrap(), None);
    }
}
