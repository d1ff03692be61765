// ABOUTME: Posts each notification to a webhook wrapped in a CloudEvents 1.0 envelope.
// ABOUTME: Anything other than a 200 reply, or a transport error, counts as a failed trigger.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use ulid::Ulid;

use super::TriggerError;

/// CloudEvents attributes set on every envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEventsSpec {
    #[serde(rename = "type", default = "default_type")]
    pub event_type: String,
    #[serde(default = "default_source")]
    pub source: String,
}

impl Default for CloudEventsSpec {
    fn default() -> Self {
        Self {
            event_type: default_type(),
            source: default_source(),
        }
    }
}

fn default_type() -> String {
    "aviso".to_string()
}

fn default_source() -> String {
    "/host/aviso".to_string()
}

/// Wrap a notification in a structured-mode CloudEvent.
pub fn cloudevent(notification: &Value, spec: &CloudEventsSpec) -> Value {
    json!({
        "type": spec.event_type,
        "data": notification,
        "datacontenttype": "application/json",
        "id": Ulid::new().to_string(),
        "source": spec.source,
        "specversion": "1.0",
        "time": Utc::now().to_rfc3339(),
    })
}

pub struct PostTrigger {
    client: reqwest::Client,
    url: String,
    headers: BTreeMap<String, String>,
    cloudevents: CloudEventsSpec,
}

impl PostTrigger {
    pub fn new(
        url: String,
        headers: BTreeMap<String, String>,
        timeout: Duration,
        cloudevents: CloudEventsSpec,
    ) -> Result<Self, TriggerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TriggerError::Post {
                url: url.clone(),
                reason: format!("failed to build http client: {}", e),
            })?;
        Ok(Self {
            client,
            url,
            headers,
            cloudevents,
        })
    }

    pub async fn run(&self, notification: &Value) -> Result<(), TriggerError> {
        let envelope = cloudevent(notification, &self.cloudevents);
        let mut request = self
            .client
            .post(&self.url)
            .header("content-type", "application/cloudevents+json")
            .body(serde_json::to_vec(&envelope)?);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| TriggerError::Post {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(TriggerError::Post {
                url: self.url.clone(),
                reason: format!("status {}: {}", status, body),
            });
        }
        tracing::debug!("posted notification {} to {}", envelope["id"], self.url);
        Ok(())
    }
}
