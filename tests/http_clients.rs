//! HTTP client tests against a local one-shot server.
//!
//! Each test binds 127.0.0.1:0, serves a scripted list of responses (one per
//! connection) and records the requests it received.
//!
//! Run with: cargo test --test http_clients

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use sentiment_forge::error::{DispatchError, ReconcileError, SourceError};
use sentiment_forge::model::{
    BatchPayload, CommentPayload, HttpModelClient, ModelResponse, ModelTransport, ResponseMode,
    Retryable, StreamLine,
};
use sentiment_forge::source::{PagedSource, PostgrestPages, RecordId, RecordSource};
use sentiment_forge::storage::{PostgrestClient, PostgrestRowStore, Row, RowStore};

// ============================================================================
// Fake server
// ============================================================================

struct Canned {
    status: u16,
    content_type: &'static str,
    body: String,
}

fn canned(status: u16, content_type: &'static str, body: impl Into<String>) -> Canned {
    Canned {
        status,
        content_type,
        body: body.into(),
    }
}

#[derive(Debug, Clone)]
struct SeenRequest {
    head: String,
    body: String,
}

impl SeenRequest {
    fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

async fn serve(responses: Vec<Canned>) -> (String, Arc<Mutex<Vec<SeenRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();

    tokio::spawn(async move {
        for canned in responses {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let header_end = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "client closed before sending headers");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let content_length = head
                .lines()
                .find_map(|line| {
                    let (key, value) = line.split_once(':')?;
                    key.trim()
                        .eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().unwrap())
                })
                .unwrap_or(0);
            while buf.len() < header_end + content_length {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
            log.lock().unwrap().push(SeenRequest { head, body });

            let response = format!(
                "HTTP/1.1 {} Scripted\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                canned.status,
                canned.content_type,
                canned.body.len(),
                canned.body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        }
    });

    (format!("http://{}", addr), seen)
}

fn payload() -> BatchPayload {
    BatchPayload {
        comments: vec![
            CommentPayload {
                id: RecordId::from("a"),
                body: "love it".to_string(),
            },
            CommentPayload {
                id: RecordId::from("b"),
                body: "meh".to_string(),
            },
        ],
    }
}

fn timeout() -> Duration {
    Duration::from_secs(5)
}

// ============================================================================
// Model client
// ============================================================================

#[tokio::test]
async fn test_model_client_unary_response() {
    let body = json!({
        "results": [
            {"id": "a", "sentiment": "positive", "sentiment_score": 0.93},
            {"id": "b", "sentiment": "neutral", "emotion": null},
            {"sentiment": "orphan"}
        ],
        "peak_memory_mb": 512.0,
        "data_size_mb": 0.01
    });
    let (base, seen) = serve(vec![canned(200, "application/json", body.to_string())]).await;
    let client = HttpModelClient::new(format!("{}/score", base), timeout()).unwrap();

    let reply = client.send(&payload()).await.unwrap();

    let ModelResponse::Unary {
        results,
        metrics,
        rejected,
    } = reply.response
    else {
        panic!("expected a unary response");
    };
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].sentiment(), Some("positive"));
    assert!(results[1].get("emotion").is_none());
    assert_eq!(rejected.len(), 1);
    assert_eq!(metrics["peak_memory_mb"], 512.0);
    assert_eq!(reply.bytes_received, body.to_string().len());

    let requests = seen.lock().unwrap();
    assert_eq!(requests[0].request_line(), "POST /score HTTP/1.1");
    let sent: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(sent["comments"][1], json!({"id": "b", "body": "meh"}));
    assert_eq!(reply.bytes_sent, requests[0].body.len());
}

#[tokio::test]
async fn test_model_client_detects_ndjson_stream() {
    let body = concat!(
        "{\"type\":\"result\",\"id\":\"a\",\"sentiment\":\"positive\"}\r\n",
        "\n",
        "{\"type\":\"progress\",\"done\":1}\n",
        "not json\n",
        "{\"type\":\"stats\",\"peak_memory_mb\":300}\n",
        "{\"type\":\"result\",\"id\":\"b\",\"sentiment\":\"negative\"}"
    );
    let (base, _) = serve(vec![canned(200, "application/x-ndjson", body)]).await;
    let client = HttpModelClient::new(base, timeout()).unwrap();

    let reply = client.send(&payload()).await.unwrap();

    let ModelResponse::Stream(lines) = reply.response else {
        panic!("expected a stream response");
    };
    assert_eq!(lines.len(), 5);
    assert!(matches!(&lines[0], StreamLine::Result(r) if r.id.as_str() == "a"));
    assert!(matches!(&lines[1], StreamLine::Unknown { tag } if tag == "progress"));
    assert!(matches!(&lines[2], StreamLine::Malformed(_)));
    assert!(matches!(&lines[3], StreamLine::Stats(s) if s["peak_memory_mb"] == 300.0));
    assert!(matches!(&lines[4], StreamLine::Result(r) if r.sentiment() == Some("negative")));
    assert_eq!(reply.bytes_received, body.len());
}

#[tokio::test]
async fn test_model_client_forced_stream_mode() {
    let body = "{\"type\":\"result\",\"id\":\"a\",\"sentiment\":\"positive\"}\n";
    let (base, _) = serve(vec![canned(200, "application/json", body)]).await;
    let client = HttpModelClient::new(base, timeout())
        .unwrap()
        .with_response_mode(ResponseMode::Stream);

    let reply = client.send(&payload()).await.unwrap();

    assert!(matches!(reply.response, ModelResponse::Stream(ref lines) if lines.len() == 1));
}

#[tokio::test]
async fn test_model_client_reads_ndjson_under_json_content_type() {
    let body = concat!(
        "{\"type\":\"result\",\"id\":\"a\",\"sentiment\":\"positive\"}\n",
        "{\"type\":\"result\",\"id\":\"b\",\"sentiment\":\"negative\"}\n"
    );
    let (base, _) = serve(vec![
        canned(200, "application/json", body),
        canned(200, "application/json", "{\"type\":\"result\",\"id\":\"a\"}\nnot json\n"),
    ])
    .await;
    let client = HttpModelClient::new(base, timeout()).unwrap();

    let reply = client.send(&payload()).await.unwrap();

    let ModelResponse::Stream(lines) = reply.response else {
        panic!("expected a stream response");
    };
    assert_eq!(lines.len(), 2);
    assert!(matches!(&lines[0], StreamLine::Result(r) if r.id.as_str() == "a"));
    assert!(matches!(&lines[1], StreamLine::Result(r) if r.sentiment() == Some("negative")));
    assert_eq!(reply.bytes_received, body.len());

    // A broken line is reported per line instead of failing the whole body.
    let reply = client.send(&payload()).await.unwrap();
    let ModelResponse::Stream(lines) = reply.response else {
        panic!("expected a stream response");
    };
    assert!(matches!(&lines[1], StreamLine::Malformed(_)));
}

#[tokio::test]
async fn test_model_client_unary_mode_does_not_fall_back() {
    let body = concat!(
        "{\"type\":\"result\",\"id\":\"a\"}\n",
        "{\"type\":\"result\",\"id\":\"b\"}\n"
    );
    let (base, _) = serve(vec![canned(200, "application/json", body)]).await;
    let client = HttpModelClient::new(base, timeout())
        .unwrap()
        .with_response_mode(ResponseMode::Unary);

    let err = client.send(&payload()).await.unwrap_err();

    assert!(matches!(err, DispatchError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_model_client_classifies_status_codes() {
    let (base, _) = serve(vec![
        canned(503, "text/plain", "warming up"),
        canned(429, "text/plain", "slow down"),
        canned(422, "text/plain", "bad batch"),
    ])
    .await;
    let client = HttpModelClient::new(base, timeout()).unwrap();

    let first = client.send(&payload()).await.unwrap_err();
    assert_eq!(
        first,
        DispatchError::Server {
            status: 503,
            message: "warming up".to_string()
        }
    );

    let second = client.send(&payload()).await.unwrap_err();
    assert!(matches!(second, DispatchError::RateLimited(_)));
    assert_eq!(second.status(), Some(429));
    assert!(!second.is_retryable());

    let third = client.send(&payload()).await.unwrap_err();
    assert_eq!(third.status(), Some(422));
    assert!(matches!(third, DispatchError::Rejected { .. }));
}

#[tokio::test]
async fn test_model_client_rejects_body_without_results() {
    let (base, _) = serve(vec![canned(200, "application/json", "{\"ok\":true}")]).await;
    let client = HttpModelClient::new(base, timeout()).unwrap();

    let err = client.send(&payload()).await.unwrap_err();

    assert!(matches!(err, DispatchError::InvalidResponse(_)));
}

// ============================================================================
// PostgREST source and store
// ============================================================================

#[tokio::test]
async fn test_postgrest_pages_read_until_short_page() {
    let (base, seen) = serve(vec![
        canned(
            200,
            "application/json",
            json!([{"id": 1, "body": "first"}, {"id": 2, "body": null}]).to_string(),
        ),
        canned(
            200,
            "application/json",
            json!([{"id": 3, "body": "third"}]).to_string(),
        ),
    ])
    .await;
    let client = PostgrestClient::new(&base, "service-key", timeout()).unwrap();
    let source = PagedSource::new(PostgrestPages::new(client, "comments"), 2);

    let outcome = source.fetch_all().await.unwrap();

    assert_eq!(outcome.records.len(), 3);
    assert_eq!(outcome.pages_fetched, 2);
    assert!(!outcome.is_partial());
    assert_eq!(outcome.records[0].id.as_str(), "1");
    assert_eq!(outcome.records[1].body, "");

    let requests = seen.lock().unwrap();
    assert_eq!(
        requests[0].request_line(),
        "GET /rest/v1/comments?select=id,body&order=id.asc&limit=2&offset=0 HTTP/1.1"
    );
    assert!(requests[1].request_line().contains("offset=2"));
    assert_eq!(requests[0].header("apikey").as_deref(), Some("service-key"));
    assert_eq!(
        requests[0].header("authorization").as_deref(),
        Some("Bearer service-key")
    );
}

#[tokio::test]
async fn test_postgrest_first_page_failure_is_unavailable() {
    let (base, _) = serve(vec![canned(500, "text/plain", "db down")]).await;
    let client = PostgrestClient::new(&base, "key", timeout()).unwrap();
    let source = PagedSource::new(PostgrestPages::new(client, "comments"), 10);

    let err = source.fetch_all().await.unwrap_err();

    assert!(matches!(err, SourceError::Unavailable(ref msg) if msg.contains("500")));
}

#[tokio::test]
async fn test_postgrest_row_store_upsert() {
    let (base, seen) = serve(vec![
        canned(201, "application/json", ""),
        canned(409, "application/json", "{\"message\":\"conflict\"}"),
    ])
    .await;
    let client = PostgrestClient::new(&base, "key", timeout()).unwrap();
    let store = PostgrestRowStore::new(client);
    let rows: Vec<Row> = vec![
        json!({"id": "a", "sentiment": "positive"})
            .as_object()
            .unwrap()
            .clone(),
        json!({"id": "b", "sentiment": "negative"})
            .as_object()
            .unwrap()
            .clone(),
    ];

    let written = store.upsert("comments", "id", &rows).await.unwrap();
    assert_eq!(written, 2);

    let err = store.upsert("comments", "id", &rows).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Rejected { status: 409, .. }));

    let requests = seen.lock().unwrap();
    assert_eq!(
        requests[0].request_line(),
        "POST /rest/v1/comments?on_conflict=id&columns=id%2Csentiment HTTP/1.1"
    );
    assert_eq!(
        requests[0].header("prefer").as_deref(),
        Some("resolution=merge-duplicates,return=minimal")
    );
    let sent: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(sent[1]["sentiment"], json!("negative"));
}

#[tokio::test]
async fn test_postgrest_row_store_skips_empty_batches() {
    let client = PostgrestClient::new("http://127.0.0.1:9", "key", timeout()).unwrap();
    let store = PostgrestRowStore::new(client);

    assert_eq!(store.upsert("comments", "id", &[]).await.unwrap(), 0);
}
