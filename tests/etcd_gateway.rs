// ABOUTME: Runs the etcd REST adapter against an in-process mock of the etcd v3 JSON gateway.
// ABOUTME: Checks the wire encoding, transactions with leases, auth token refresh and a full listen cycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use aviso_core::Schema;
use aviso_listener::{EventListener, FunctionRegistry, ListenerDef, Notifier, TriggerSpec, parse_params};
use aviso_store::auth::{EtcdTokenAuth, NoAuth};
use aviso_store::{
    Authenticator, EtcdRestAdapter, Endpoint, KeyValue, PollState, PollerConfig, PollingScheduler,
    Pull, StatusPush, StoreAdapter, StoreError, current_status, push_with_status,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde_json::{Value, json};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Stored {
    value: Vec<u8>,
    version: i64,
    create_revision: i64,
    mod_revision: i64,
}

#[derive(Default)]
struct Cluster {
    revision: i64,
    compacted: i64,
    keys: BTreeMap<Vec<u8>, Stored>,
    leases: Vec<(i64, i64)>,
    token: Option<String>,
    issued: usize,
    failures: usize,
}

struct Mock {
    cluster: Mutex<Cluster>,
    credentials: Option<(String, String)>,
}

type Reply = Result<Json<Value>, (StatusCode, String)>;

fn b64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

fn field_bytes(body: &Value, field: &str) -> Option<Vec<u8>> {
    body.get(field)
        .and_then(Value::as_str)
        .and_then(|s| B64.decode(s).ok())
}

fn field_i64(body: &Value, field: &str) -> Option<i64> {
    match body.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn in_range(key: &[u8], start: &[u8], end: Option<&[u8]>) -> bool {
    match end {
        None => key == start,
        Some([0]) => key >= start,
        Some(end) => key >= start && key < end,
    }
}

fn wire(key: &[u8], stored: &Stored) -> Value {
    json!({
        "key": b64(key),
        "value": b64(&stored.value),
        "version": stored.version.to_string(),
        "create_revision": stored.create_revision.to_string(),
        "mod_revision": stored.mod_revision.to_string(),
    })
}

fn header(revision: i64) -> Value {
    json!({"cluster_id": "1", "member_id": "2", "revision": revision.to_string(), "raft_term": "3"})
}

impl Mock {
    fn new(credentials: Option<(String, String)>) -> Arc<Self> {
        Arc::new(Self {
            cluster: Mutex::new(Cluster {
                revision: 1,
                ..Cluster::default()
            }),
            credentials,
        })
    }

    async fn check(&self, headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
        let mut cluster = self.cluster.lock().await;
        if cluster.failures > 0 {
            cluster.failures -= 1;
            return Err((StatusCode::SERVICE_UNAVAILABLE, "etcdserver: leader changed".into()));
        }
        if self.credentials.is_none() {
            return Ok(());
        }
        let sent = headers.get("authorization").and_then(|v| v.to_str().ok());
        match (&cluster.token, sent) {
            (Some(token), Some(sent)) if token == sent => Ok(()),
            _ => Err((StatusCode::UNAUTHORIZED, "etcdserver: invalid auth token".into())),
        }
    }
}

async fn authenticate(State(mock): State<Arc<Mock>>, Json(body): Json<Value>) -> Reply {
    let given = (
        body["name"].as_str().unwrap_or_default().to_string(),
        body["password"].as_str().unwrap_or_default().to_string(),
    );
    if mock.credentials.as_ref() != Some(&given) {
        return Err((StatusCode::UNAUTHORIZED, "etcdserver: authentication failed".into()));
    }
    let mut cluster = mock.cluster.lock().await;
    cluster.issued += 1;
    let token = format!("token-{}", cluster.issued);
    cluster.token = Some(token.clone());
    Ok(Json(json!({"header": header(cluster.revision), "token": token})))
}

async fn range(State(mock): State<Arc<Mock>>, headers: HeaderMap, Json(body): Json<Value>) -> Reply {
    mock.check(&headers).await?;
    let cluster = mock.cluster.lock().await;
    let at = field_i64(&body, "revision").unwrap_or(0);
    if at > 0 && at < cluster.compacted {
        return Err((
            StatusCode::BAD_REQUEST,
            json!({"error": "etcdserver: mvcc: required revision has been compacted", "code": 11})
                .to_string(),
        ));
    }
    let start = field_bytes(&body, "key").unwrap_or_default();
    let end = field_bytes(&body, "range_end");
    let min = field_i64(&body, "min_mod_revision").unwrap_or(0);
    let max = field_i64(&body, "max_mod_revision").unwrap_or(i64::MAX);

    let mut kvs: Vec<Value> = cluster
        .keys
        .iter()
        .filter(|(key, _)| in_range(key, &start, end.as_deref()))
        .filter(|(_, s)| s.mod_revision >= min && s.mod_revision <= max)
        .filter(|(_, s)| at == 0 || s.mod_revision <= at)
        .map(|(key, stored)| wire(key, stored))
        .collect();
    if body["sort_order"] == "DESCEND" {
        kvs.reverse();
    }

    let mut reply = json!({"header": header(cluster.revision), "count": kvs.len().to_string()});
    if !kvs.is_empty() {
        reply["kvs"] = Value::Array(kvs);
    }
    Ok(Json(reply))
}

async fn txn(State(mock): State<Arc<Mock>>, headers: HeaderMap, Json(body): Json<Value>) -> Reply {
    mock.check(&headers).await?;
    let mut cluster = mock.cluster.lock().await;
    let revision = cluster.revision + 1;
    let ops = body["success"].as_array().cloned().unwrap_or_default();
    for op in &ops {
        if let Some(delete) = op.get("request_delete_range") {
            let key = field_bytes(delete, "key").unwrap_or_default();
            cluster.keys.remove(&key);
        }
        if let Some(put) = op.get("request_put") {
            let key = field_bytes(put, "key").unwrap_or_default();
            let value = field_bytes(put, "value").unwrap_or_default();
            let previous = cluster.keys.get(&key).cloned();
            cluster.keys.insert(
                key,
                Stored {
                    value,
                    version: previous.as_ref().map_or(1, |p| p.version + 1),
                    create_revision: previous.as_ref().map_or(revision, |p| p.create_revision),
                    mod_revision: revision,
                },
            );
        }
    }
    if !ops.is_empty() {
        cluster.revision = revision;
    }
    Ok(Json(json!({"header": header(cluster.revision), "succeeded": true})))
}

async fn grant(State(mock): State<Arc<Mock>>, headers: HeaderMap, Json(body): Json<Value>) -> Reply {
    mock.check(&headers).await?;
    let mut cluster = mock.cluster.lock().await;
    let id = 7000 + cluster.leases.len() as i64;
    let ttl = field_i64(&body, "TTL").unwrap_or(0);
    cluster.leases.push((id, ttl));
    Ok(Json(json!({"header": header(cluster.revision), "ID": id.to_string(), "TTL": ttl.to_string()})))
}

async fn delete_range(
    State(mock): State<Arc<Mock>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    mock.check(&headers).await?;
    let mut cluster = mock.cluster.lock().await;
    let start = field_bytes(&body, "key").unwrap_or_default();
    let end = field_bytes(&body, "range_end");
    let doomed: Vec<Vec<u8>> = cluster
        .keys
        .keys()
        .filter(|key| in_range(key, &start, end.as_deref()))
        .cloned()
        .collect();
    let mut prev_kvs = Vec::new();
    for key in doomed {
        if let Some(stored) = cluster.keys.remove(&key) {
            prev_kvs.push(wire(&key, &stored));
        }
    }
    if !prev_kvs.is_empty() {
        cluster.revision += 1;
    }
    Ok(Json(json!({
        "header": header(cluster.revision),
        "deleted": prev_kvs.len().to_string(),
        "prev_kvs": prev_kvs,
    })))
}

async fn status(State(mock): State<Arc<Mock>>, headers: HeaderMap) -> Reply {
    mock.check(&headers).await?;
    let cluster = mock.cluster.lock().await;
    Ok(Json(json!({"header": header(cluster.revision), "version": "3.5.0"})))
}

async fn members(State(mock): State<Arc<Mock>>, headers: HeaderMap) -> Reply {
    mock.check(&headers).await?;
    Ok(Json(json!({
        "members": [
            {"ID": "1", "name": "etcd-0", "clientURLs": ["http://10.0.0.1:2379"]},
            {"ID": "2", "name": "etcd-1", "clientURLs": ["http://10.0.0.2:2379"]}
        ]
    })))
}

async fn health() -> Json<Value> {
    Json(json!({"health": "true", "reason": ""}))
}

/// Serve the mock on an ephemeral port and return an adapter pointed at it.
async fn serve(mock: Arc<Mock>, auth: Arc<dyn Authenticator>) -> EtcdRestAdapter {
    let app = Router::new()
        .route("/v3/auth/authenticate", post(authenticate))
        .route("/v3/kv/range", post(range))
        .route("/v3/kv/txn", post(txn))
        .route("/v3/kv/deleterange", post(delete_range))
        .route("/v3/lease/grant", post(grant))
        .route("/v3/maintenance/status", post(status))
        .route("/v3/cluster/member/list", post(members))
        .route("/health", get(health))
        .with_state(mock);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    EtcdRestAdapter::new(
        format!("http://{}", addr),
        Endpoint {
            host: addr.ip().to_string(),
            port: addr.port(),
        },
        Duration::from_secs(5),
        auth,
    )
    .unwrap()
}

#[tokio::test]
async fn push_and_pull_round_trip_through_gateway() {
    let mock = Mock::new(None);
    let store = serve(Arc::clone(&mock), Arc::new(NoAuth)).await;

    let rev = store
        .push(
            &[
                KeyValue::new("/x/enfo/20190810", "a"),
                KeyValue::new("/x/enfo/20190811", "b"),
                KeyValue::new("/x/oper/20190810", "c"),
            ],
            &[],
            None,
        )
        .await
        .unwrap();
    assert_eq!(rev, 2);
    assert_eq!(store.latest_revision().await.unwrap(), 2);

    let records = store.pull(&Pull::key("/x/enfo/").prefix(true)).await.unwrap();
    let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["/x/enfo/20190811", "/x/enfo/20190810"]);
    assert_eq!(records[0].value, b"b");
    assert_eq!(records[0].mod_revision, 2);
    assert_eq!(records[0].version, 1);

    let missing = store.pull(&Pull::key("/nothing")).await.unwrap();
    assert!(missing.is_empty());

    let rev = store
        .push(&[KeyValue::new("/x/enfo/20190810", "a2")], &["/x/oper/20190810".to_string()], None)
        .await
        .unwrap();
    assert_eq!(rev, 3);
    let later = store
        .pull(&Pull::key("/x/").prefix(true).min_mod_revision(3))
        .await
        .unwrap();
    assert_eq!(later.len(), 1);
    assert_eq!(later[0].version, 2);
    assert_eq!(later[0].create_revision, 2);

    let removed = store.delete("/x/enfo/", true).await.unwrap();
    assert_eq!(removed.len(), 2);
    assert!(store.pull(&Pull::key("/x/").prefix(true)).await.unwrap().is_empty());
}

#[tokio::test]
async fn ttl_push_attaches_one_lease() {
    let mock = Mock::new(None);
    let store = serve(Arc::clone(&mock), Arc::new(NoAuth)).await;

    let push = StatusPush::new(vec![KeyValue::new("/x/enfo/20190810", "loc")], "/x/enfo/", "test")
        .admin_key(Some("/admin/20190810/enfo".to_string()))
        .ttl(Some(Duration::from_secs(3600)));
    let rev = push_with_status(&store, push).await.unwrap();

    let cluster = mock.cluster.lock().await;
    assert_eq!(cluster.leases, vec![(7000, 3600)]);
    assert_eq!(cluster.keys.len(), 3);
    assert!(cluster.keys.values().all(|s| s.mod_revision == rev));
    drop(cluster);

    let (status, status_rev) = current_status(&store, "/x/enfo/").await.unwrap().unwrap();
    assert_eq!(status_rev, rev);
    assert_eq!(status.engine, "etcd_rest");
}

#[tokio::test]
async fn gateway_errors_are_classified() {
    let mock = Mock::new(None);
    let store = serve(Arc::clone(&mock), Arc::new(NoAuth)).await;

    mock.cluster.lock().await.failures = 1;
    let err = store.latest_revision().await.unwrap_err();
    assert!(err.is_transient(), "got {:?}", err);
    assert_eq!(store.latest_revision().await.unwrap(), 1);

    mock.cluster.lock().await.compacted = 10;
    let err = store.pull(&Pull::key("/x").at_revision(3)).await.unwrap_err();
    assert!(matches!(err, StoreError::HistoryNotAvailable(_)), "got {:?}", err);
}

#[tokio::test]
async fn diagnostics_report_health_and_members() {
    let store = serve(Mock::new(None), Arc::new(NoAuth)).await;
    assert!(store.health().await.unwrap());
    let members = store.members().await.unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(members[1].name, "etcd-1");
    assert_eq!(members[1].client_urls, vec!["http://10.0.0.2:2379"]);
}

#[tokio::test]
async fn token_is_fetched_once_and_refreshed_after_rejection() {
    let mock = Mock::new(Some(("aviso".to_string(), "secret".to_string())));
    let auth = Arc::new(EtcdTokenAuth::new("aviso".to_string(), "secret".to_string()));
    let store = serve(Arc::clone(&mock), auth).await;

    store.push(&[KeyValue::new("/k", "v")], &[], None).await.unwrap();
    store.pull(&Pull::key("/k")).await.unwrap();
    assert_eq!(mock.cluster.lock().await.issued, 1);

    // The server forgets the token; the next call re-authenticates and succeeds.
    mock.cluster.lock().await.token = Some("revoked".to_string());
    let records = store.pull(&Pull::key("/k")).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(mock.cluster.lock().await.issued, 2);
}

#[tokio::test]
async fn wrong_credentials_are_not_retried() {
    let mock = Mock::new(Some(("aviso".to_string(), "secret".to_string())));
    let auth = Arc::new(EtcdTokenAuth::new("aviso".to_string(), "wrong".to_string()));
    let store = serve(Arc::clone(&mock), auth).await;

    let err = store.latest_revision().await.unwrap_err();
    assert!(matches!(err, StoreError::Auth(_)), "got {:?}", err);
    assert_eq!(mock.cluster.lock().await.issued, 0);
}

#[tokio::test]
async fn listener_receives_notification_through_gateway() {
    const SCHEMA: &str = r#"
flight:
  payload: location
  endpoint:
    - engine: [etcd_rest]
      base: /x/{stream}/
      stem: "{date}"
  request:
    stream:
      - type: enum
        values: [enfo, oper]
    date:
      - type: date
"#;
    let schema = Schema::from_yaml(SCHEMA, "etcd_rest").unwrap();
    let store: Arc<dyn StoreAdapter> = Arc::new(serve(Mock::new(None), Arc::new(NoAuth)).await);

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut registry = FunctionRegistry::new();
    registry.register("collect", move |doc| {
        sink.lock().unwrap().push(doc.clone());
        Ok(())
    });
    let def = ListenerDef {
        event: "flight".to_string(),
        request: serde_json::from_value(json!({"stream": "enfo", "date": "20190810"})).unwrap(),
        triggers: vec![TriggerSpec::Function {
            function: "collect".to_string(),
        }],
    };
    let listener = EventListener::new(&def, &schema, &registry).unwrap();

    let scheduler = PollingScheduler::new(
        Arc::clone(&store),
        PollerConfig {
            polling_interval: Duration::from_millis(20),
            retry_delay: Duration::from_millis(20),
            catchup: false,
        },
        None,
    );
    let ids = scheduler
        .listen(listener.keys().to_vec(), Arc::new(listener), None, None)
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while scheduler.state(ids[0]).await != Some(PollState::Live) {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    Notifier::new(Arc::clone(&store), schema, None)
        .notify(&parse_params("event=flight,stream=enfo,date=20190810,location=s3://b/f").unwrap())
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while seen.lock().unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "no notification arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen.lock().unwrap()[0]["location"], "s3://b/f");

    scheduler.stop_all().await;
    tokio::time::timeout(Duration::from_secs(5), scheduler.wait_idle())
        .await
        .unwrap();
}
