// ABOUTME: StoreAdapter over the etcd v3 JSON gateway (kv, lease, maintenance and cluster endpoints).
// ABOUTME: Keys and values travel base64-encoded; int64 fields may arrive as strings or numbers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aviso_core::{AvisoConfig, KeyValueRecord, Revision};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::adapter::{
    Endpoint, KeyValue, Member, Pull, StoreAdapter, StoreError, StoreResult, prefix_range_end,
};
use crate::auth::{self, Authenticator};

const COMPACTED: &str = "required revision has been compacted";

/// Talks to etcd through its grpc-gateway REST interface.
pub struct EtcdRestAdapter {
    http: reqwest::Client,
    base_url: String,
    endpoint: Endpoint,
    auth: Arc<dyn Authenticator>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseHeader {
    #[serde(default, deserialize_with = "lenient_i64")]
    revision: i64,
}

#[derive(Debug, Deserialize)]
struct WireKeyValue {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    version: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    create_revision: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    mod_revision: i64,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<WireKeyValue>,
}

#[derive(Debug, Deserialize)]
struct HeaderOnly {
    #[serde(default)]
    header: ResponseHeader,
}

#[derive(Debug, Deserialize)]
struct DeleteRangeResponse {
    #[serde(default)]
    prev_kvs: Vec<WireKeyValue>,
}

#[derive(Debug, Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID", deserialize_with = "lenient_i64")]
    id: i64,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    health: String,
}

#[derive(Debug, Deserialize)]
struct WireMember {
    #[serde(default)]
    name: String,
    #[serde(rename = "clientURLs", default)]
    client_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MemberListResponse {
    #[serde(default)]
    members: Vec<WireMember>,
}

/// Accept an int64 encoded either as a JSON number or a decimal string.
fn lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.parse().map_err(de::Error::custom),
    }
}

fn encode(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

fn decode(field: &str, text: &str) -> StoreResult<Vec<u8>> {
    B64.decode(text)
        .map_err(|e| StoreError::InvalidResponse(format!("bad base64 in {}: {}", field, e)))
}

impl WireKeyValue {
    fn into_record(self) -> StoreResult<KeyValueRecord> {
        let key = decode("key", &self.key)?;
        Ok(KeyValueRecord {
            key: String::from_utf8_lossy(&key).into_owned(),
            value: decode("value", &self.value)?,
            version: self.version,
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
        })
    }
}

/// Classify a non-success gateway reply.
fn classify(status: reqwest::StatusCode, body: &str) -> StoreError {
    if body.contains(COMPACTED) {
        return StoreError::HistoryNotAvailable(body.to_string());
    }
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return StoreError::Unavailable(format!("{}: {}", status, body));
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return StoreError::Auth(format!("{}: {}", status, body));
    }
    StoreError::Rejected(format!("{}: {}", status, body))
}

impl EtcdRestAdapter {
    pub fn new(
        base_url: impl Into<String>,
        endpoint: Endpoint,
        timeout: Duration,
        auth: Arc<dyn Authenticator>,
    ) -> StoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Rejected(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            endpoint,
            auth,
        })
    }

    pub fn from_config(config: &AvisoConfig) -> StoreResult<Self> {
        Self::new(
            config.base_url(),
            Endpoint {
                host: config.host.clone(),
                port: config.port,
            },
            config.timeout,
            auth::from_config(&config.auth),
        )
    }

    /// POST `body` to `path`, refreshing credentials once on an auth failure.
    async fn call<T: DeserializeOwned>(&self, path: &str, body: &Value) -> StoreResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut refreshed = false;
        loop {
            let mut request = self.http.post(&url).json(body);
            if let Some((name, value)) = self.auth.header(&self.http, &self.base_url).await? {
                request = request.header(name, value);
            }

            let response = request
                .send()
                .await
                .map_err(|e| StoreError::Unavailable(format!("{} failed: {}", path, e)))?;

            let status = response.status();
            if status.is_success() {
                return response.json().await.map_err(|e| {
                    StoreError::InvalidResponse(format!("failed to parse {} response: {}", path, e))
                });
            }

            let error_body = response.text().await.unwrap_or_default();
            match classify(status, &error_body) {
                StoreError::Auth(reason) if !refreshed => {
                    tracing::info!("{} rejected credentials ({}), re-authenticating", path, reason);
                    self.auth.invalidate().await;
                    refreshed = true;
                }
                err => return Err(err),
            }
        }
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<i64> {
        let seconds = ttl.as_secs().max(1);
        let granted: LeaseGrantResponse = self
            .call("/v3/lease/grant", &json!({"TTL": seconds, "ID": 0}))
            .await?;
        Ok(granted.id)
    }

    fn range_body(key: &str, prefix: bool) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("key".to_string(), Value::String(encode(key.as_bytes())));
        if prefix {
            body.insert(
                "range_end".to_string(),
                Value::String(encode(&prefix_range_end(key.as_bytes()))),
            );
        }
        body
    }
}

#[async_trait]
impl StoreAdapter for EtcdRestAdapter {
    async fn pull(&self, query: &Pull) -> StoreResult<Vec<KeyValueRecord>> {
        let mut body = Self::range_body(&query.key, query.prefix);
        body.insert("sort_order".to_string(), json!("DESCEND"));
        body.insert("sort_target".to_string(), json!("KEY"));
        if query.keys_only {
            body.insert("keys_only".to_string(), json!(true));
        }
        if let Some(rev) = query.revision {
            body.insert("revision".to_string(), json!(rev));
        }
        if let Some(min) = query.min_mod_revision {
            body.insert("min_mod_revision".to_string(), json!(min));
        }
        if let Some(max) = query.max_mod_revision {
            body.insert("max_mod_revision".to_string(), json!(max));
        }

        let response: RangeResponse = self.call("/v3/kv/range", &Value::Object(body)).await?;
        response
            .kvs
            .into_iter()
            .map(WireKeyValue::into_record)
            .collect()
    }

    async fn push(
        &self,
        kvs: &[KeyValue],
        keys_to_delete: &[String],
        ttl: Option<Duration>,
    ) -> StoreResult<Revision> {
        let lease = match ttl {
            Some(ttl) if !kvs.is_empty() => Some(self.grant_lease(ttl).await?),
            _ => None,
        };

        let mut ops: Vec<Value> = keys_to_delete
            .iter()
            .map(|key| json!({"request_delete_range": {"key": encode(key.as_bytes())}}))
            .collect();
        for kv in kvs {
            let mut put = json!({"key": encode(kv.key.as_bytes()), "value": encode(&kv.value)});
            if let Some(id) = lease {
                put["lease"] = json!(id);
            }
            ops.push(json!({"request_put": put}));
        }

        let response: HeaderOnly = self.call("/v3/kv/txn", &json!({"success": ops})).await?;
        Ok(response.header.revision)
    }

    async fn delete(&self, key: &str, prefix: bool) -> StoreResult<Vec<KeyValueRecord>> {
        let mut body = Self::range_body(key, prefix);
        body.insert("prev_kv".to_string(), json!(true));
        let response: DeleteRangeResponse = self
            .call("/v3/kv/deleterange", &Value::Object(body))
            .await?;
        response
            .prev_kvs
            .into_iter()
            .map(WireKeyValue::into_record)
            .collect()
    }

    async fn latest_revision(&self) -> StoreResult<Revision> {
        let response: HeaderOnly = self.call("/v3/maintenance/status", &json!({})).await?;
        Ok(response.header.revision)
    }

    fn engine_name(&self) -> &str {
        "etcd_rest"
    }

    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    async fn health(&self) -> StoreResult<bool> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("/health failed: {}", e)))?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let parsed: HealthResponse = response.json().await.map_err(|e| {
            StoreError::InvalidResponse(format!("failed to parse /health response: {}", e))
        })?;
        Ok(parsed.health == "true")
    }

    async fn members(&self) -> StoreResult<Vec<Member>> {
        let response: MemberListResponse =
            self.call("/v3/cluster/member/list", &json!({})).await?;
        Ok(response
            .members
            .into_iter()
            .map(|m| Member {
                name: m.name,
                client_urls: m.client_urls,
            })
            .collect())
    }
}
