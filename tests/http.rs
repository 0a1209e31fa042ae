// HTTP surface tests: push ingress, notification bridge, probes, triage
//
// Requests are driven through the router directly with tower's oneshot.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use journal2parquet::auth::IdentityTokens;
use journal2parquet::config::AuthConfig;
use journal2parquet::dead_letter::DeadLetterQueue;
use journal2parquet::dispatch::PushEnvelope;
use journal2parquet::queue::{
    DeliveryAttempt, MessageId, MessageQueue, QueueSettings, UploadEvent,
};
use journal2parquet::sink::ParquetSink;
use journal2parquet::source::OpendalSource;
use journal2parquet::worker::{Worker, WorkerSettings};
use journal2parquet::{router, AppState};
use opendal::{services, Operator};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

const SECRET: &str = "test-secret";

const JOURNAL: &[u8] = b"\
11/30/25 08:00:00.000 MTXPOS MTX_POS_BeginOrder
11/30/25 08:00:00.120 SERIAL Pinpad poll
11/30/25 08:00:01.004 TCP/IP Connected to 10.0.0.5:443
";

fn memory() -> Operator {
    Operator::new(services::Memory::default()).unwrap().finish()
}

struct TestApp {
    router: Router,
    state: AppState,
    source: Operator,
    sink: Operator,
}

async fn app(tokens: Option<IdentityTokens>) -> TestApp {
    let source = memory();
    let sink = memory();
    source
        .write("acme/0042/jrnl0002-20251130.txt", JOURNAL.to_vec())
        .await
        .unwrap();

    let worker = Arc::new(Worker::new(
        Arc::new(OpendalSource::new(source.clone(), "journals")),
        Arc::new(ParquetSink::new(sink.clone())),
        WorkerSettings::default(),
    ));
    let dead_letters = DeadLetterQueue::new();
    let (queue, _task) = MessageQueue::new(QueueSettings::default())
        .on_delivery(worker.clone())
        .dead_letters(dead_letters.clone())
        .start()
        .await
        .unwrap();

    let state = AppState {
        worker,
        queue,
        dead_letters,
        tokens: tokens.map(Arc::new),
        ready: Arc::new(AtomicBool::new(true)),
        max_payload_bytes: 64 * 1024,
        max_concurrency: 4,
    };
    TestApp {
        router: router(state.clone()),
        state,
        source,
        sink,
    }
}

fn tokens(enforce: bool) -> IdentityTokens {
    let config = AuthConfig {
        enforce,
        ..AuthConfig::default()
    };
    IdentityTokens::new(config, SECRET).unwrap()
}

fn envelope(object_path: &str) -> Value {
    let attempt = DeliveryAttempt {
        message_id: MessageId::generate(),
        upload_event: UploadEvent::new("journals", object_path, 1),
        attempt_number: 1,
        delivered_at: Utc::now(),
    };
    serde_json::to_value(PushEnvelope::from_attempt(&attempt, "test-subscription").unwrap())
        .unwrap()
}

fn post_json(uri: &str, body: &Value, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

#[tokio::test]
async fn health_is_independent_of_readiness() {
    let test = app(None).await;
    test.state.ready.store(false, Ordering::Release);

    let (status, body) = send(&test.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = send(&test.router, get("/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "starting");

    test.state.ready.store(true, Ordering::Release);
    let (status, body) = send(&test.router, get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn push_acknowledges_and_writes_records() {
    let test = app(None).await;

    let (status, body) = send(
        &test.router,
        post_json("/push", &envelope("acme/0042/jrnl0002-20251130.txt"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["status"], "acknowledged");
    assert_eq!(body["disposition"]["kind"], "written");
    assert_eq!(body["disposition"]["records"], 3);

    let written: Vec<_> = test
        .sink
        .list_with("records/log_date=2025-11-30/")
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.path().ends_with(".parquet"))
        .collect();
    assert_eq!(written.len(), 1);

    // The same generation again is a no-op acknowledgement.
    let (status, body) = send(
        &test.router,
        post_json("/push", &envelope("acme/0042/jrnl0002-20251130.txt"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["disposition"]["kind"], "already_committed");
}

#[tokio::test]
async fn push_failures_map_to_status_codes() {
    let test = app(None).await;

    // Missing object: fatal.
    let (status, body) = send(
        &test.router,
        post_json("/push", &envelope("acme/0042/jrnl0099.txt"), None),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["status"], "fatal_failure");
    assert_eq!(body["kind"], "ObjectNotFound");

    // Binary payload: fatal.
    test.source
        .write("acme/0042/jrnl0003.txt", vec![0u8, 159, 146, 150, 0, 1])
        .await
        .unwrap();
    let (status, _) = send(
        &test.router,
        post_json("/push", &envelope("acme/0042/jrnl0003.txt"), None),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    // Not an envelope at all.
    let (status, body) = send(&test.router, post_json("/push", &json!({"hello": 1}), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    // Envelope whose data is not an upload event.
    let mut bad = envelope("acme/0042/jrnl0002-20251130.txt");
    bad["message"]["data"] = json!("bm90IGpzb24=");
    let (status, _) = send(&test.router, post_json("/push", &bad, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_push_is_rejected() {
    let test = app(None).await;
    let mut big = envelope("acme/0042/jrnl0002-20251130.txt");
    big["padding"] = json!("x".repeat(128 * 1024));

    let (status, _) = send(&test.router, post_json("/push", &big, None)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn enforced_identity_tokens() {
    let issuer = tokens(true);
    let test = app(Some(tokens(true))).await;
    let body = envelope("acme/0042/jrnl0002-20251130.txt");

    let (status, _) = send(&test.router, post_json("/push", &body, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&test.router, post_json("/push", &body, Some("not-a-jwt"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let minted = issuer.mint(Utc::now()).unwrap();
    let (status, _) = send(&test.router, post_json("/push", &body, Some(&minted.token))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unenforced_identity_tokens_only_warn() {
    let test = app(Some(tokens(false))).await;
    let (status, _) = send(
        &test.router,
        post_json("/push", &envelope("acme/0042/jrnl0002-20251130.txt"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn notifications_are_enqueued() {
    let test = app(None).await;
    let mut settlements = test.state.queue.subscribe();

    let notification = json!({
        "bucket": "journals",
        "name": "acme/0042/jrnl0002-20251130.txt",
        "generation": "1",
        "contentType": "text/plain"
    });
    let (status, body) = send(&test.router, post_json("/notifications", &notification, None)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["messageId"].is_string());
    assert_eq!(
        body["idempotencyKey"],
        UploadEvent::new("journals", "acme/0042/jrnl0002-20251130.txt", 1)
            .idempotency_key()
            .to_string()
    );

    let settlement = settlements.recv().await.unwrap();
    assert_eq!(
        settlement.message_id().to_string(),
        body["messageId"].as_str().unwrap()
    );

    let (status, stats) = send(&test.router, get("/queue")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["enqueued_total"], 1);
    assert_eq!(stats["acknowledged_total"], 1);

    let (status, _) = send(
        &test.router,
        post_json("/notifications", &json!({"bucket": "journals"}), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn dead_letters_are_exported() {
    let test = app(None).await;
    let mut settlements = test.state.queue.subscribe();

    let (status, _) = send(
        &test.router,
        post_json(
            "/notifications",
            &json!({"bucket": "journals", "name": "acme/0042/missing.txt", "generation": 4}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    settlements.recv().await.unwrap();

    let (status, body) = send(&test.router, get("/dead-letters")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["pendingWrites"], 0);
    let entry = &body["entries"][0];
    assert_eq!(entry["upload_event"]["object_path"], "acme/0042/missing.txt");
    assert_eq!(entry["attempt_history"].as_array().unwrap().len(), 1);
}
