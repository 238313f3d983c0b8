//! End-to-end scenarios against a fake transport: header-driven quota
//! changes, priority precedence, retry-after-failure, token pre-rejection,
//! and queue-full behavior.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use admission_client::{
    ClientConfig, Error, EventStream, FilePart, HeaderBag, Message, Priority, RawResponse, Result,
    Transport,
};

#[derive(Debug, Default)]
struct ScriptedTransport {
    catalog: serde_json::Value,
    chat_headers: Mutex<Vec<HeaderBag>>,
    chat_calls: AtomicUsize,
    fail_chat_times: AtomicU32,
    dispatch_order: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn with_catalog() -> Self {
        Self {
            catalog: serde_json::json!({
                "data": [
                    {"id": "chat-small", "owned_by": "acme", "created": 0, "active": true, "context_window": 100, "max_completion_tokens": 50},
                    {"id": "chat-big", "owned_by": "acme", "created": 0, "active": true, "context_window": 1_000_000, "max_completion_tokens": 4096},
                    {"id": "whisper-mini", "owned_by": "acme", "created": 0, "active": true, "context_window": null, "max_completion_tokens": null}
                ]
            }),
            ..Default::default()
        }
    }

    fn queue_chat_response_headers(&self, headers: HeaderBag) {
        self.chat_headers.lock().unwrap().push(headers);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post_json(&self, endpoint: &str, payload: serde_json::Value) -> Result<RawResponse> {
        if endpoint == "/models" {
            return Ok(RawResponse {
                body: self.catalog.clone(),
                headers: HeaderBag::new(),
            });
        }

        if let Some(label) = payload["messages"][0]["content"].as_str() {
            self.dispatch_order.lock().unwrap().push(label.to_string());
        }

        let attempt = self.chat_calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_chat_times.load(Ordering::SeqCst) as usize {
            return Err(Error::Network("connection reset".to_string()));
        }

        let headers = self
            .chat_headers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(HeaderBag::new);
        Ok(RawResponse {
            body: serde_json::json!({"choices": [{"message": {"role": "assistant", "content": "ok"}}]}),
            headers,
        })
    }

    async fn post_multipart(
        &self,
        _endpoint: &str,
        _fields: Vec<(String, String)>,
        _files: Vec<FilePart>,
    ) -> Result<RawResponse> {
        unimplemented!("not exercised by these scenarios")
    }

    async fn post_stream(&self, _endpoint: &str, _payload: serde_json::Value) -> Result<EventStream> {
        unimplemented!("not exercised by these scenarios")
    }
}

fn bag(pairs: &[(&str, &str)]) -> HeaderBag {
    let mut bag = HeaderBag::new();
    for (k, v) in pairs {
        bag.insert(*k, *v);
    }
    bag
}

async fn client_with(transport: Arc<ScriptedTransport>) -> admission_client::Client {
    let config = ClientConfig::new("test-key", "https://api.example.com").unwrap();
    let client = admission_client::Client::with_transport(config, transport).unwrap();
    client.refresh_models().await.unwrap();
    client
}

#[tokio::test]
async fn header_ingestion_tightens_subsequent_admission() {
    let transport = Arc::new(ScriptedTransport::with_catalog());
    transport.queue_chat_response_headers(bag(&[
        ("x-ratelimit-limit-requests", "1"),
        ("x-ratelimit-remaining-requests", "0"),
        ("x-ratelimit-reset-requests", "120s"),
    ]));
    let client = client_with(transport).await;

    client
        .chat_complete("chat-small", &[Message::user("hi")], Some(5))
        .await
        .unwrap();

    let snapshot = client.rate_limit_snapshot().await;
    assert_eq!(snapshot.requests.limit, 1);
    assert_eq!(snapshot.requests.remaining, 0);
}

#[tokio::test]
async fn token_limit_pre_rejects_without_a_transport_call() {
    let transport = Arc::new(ScriptedTransport::with_catalog());
    let client = client_with(transport.clone()).await;

    let huge_message = vec![Message::user("x".repeat(2000))];
    let err = client
        .chat_complete("chat-small", &huge_message, Some(20))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TokenLimitExceeded { .. }));
    // Only the catalog fetch happened; no chat call was attempted.
    assert_eq!(transport.chat_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn priority_precedence_drains_urgent_before_normal() {
    let transport = Arc::new(ScriptedTransport::with_catalog());
    let client = client_with(transport.clone()).await;

    for (label, priority) in [("n1", Priority::Normal), ("u", Priority::Urgent), ("n2", Priority::Normal)] {
        client
            .enqueue_chat(priority, "chat-big", vec![Message::user(label)], Some(5), 0)
            .await
            .unwrap();
    }

    client.process_queue_blocking().await.unwrap();

    assert_eq!(*transport.dispatch_order.lock().unwrap(), vec!["u", "n1", "n2"]);
}

#[tokio::test]
async fn retry_after_transient_failure_eventually_succeeds() {
    let transport = Arc::new(ScriptedTransport::with_catalog());
    transport.fail_chat_times.store(2, Ordering::SeqCst);
    let client = client_with(transport).await;

    let (_id, rx) = client
        .enqueue_chat(Priority::Normal, "chat-big", vec![Message::user("flaky")], Some(5), 3)
        .await
        .unwrap();

    client.process_queue_blocking().await.unwrap();
    let outcome = rx.await.unwrap();
    assert!(outcome.is_ok());

    let status = client.queue_status().await;
    assert_eq!(status.stats.total_retries, 2);
    assert_eq!(status.stats.total_processed, 1);
}

#[tokio::test]
async fn queue_full_rejects_the_third_item() {
    let transport = Arc::new(ScriptedTransport::with_catalog());
    let config = ClientConfig::new("test-key", "https://api.example.com")
        .unwrap()
        .with_queue_capacity(2)
        .unwrap();
    let client = admission_client::Client::with_transport(config, transport).unwrap();
    client.refresh_models().await.unwrap();

    client
        .enqueue_chat(Priority::Normal, "chat-big", vec![Message::user("a")], Some(5), 0)
        .await
        .unwrap();
    client
        .enqueue_chat(Priority::Normal, "chat-big", vec![Message::user("b")], Some(5), 0)
        .await
        .unwrap();
    let err = client
        .enqueue_chat(Priority::Normal, "chat-big", vec![Message::user("c")], Some(5), 0)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::QueueFull { size: 2, max: 2 }));
}

#[tokio::test]
async fn transcription_model_kind_mismatch_is_rejected() {
    let transport = Arc::new(ScriptedTransport::with_catalog());
    let client = client_with(transport).await;

    let err = client
        .transcribe("chat-small", "clip.mp3", vec![0u8; 1024 * 1024], None, None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidModel { .. }));
}

#[tokio::test]
async fn unknown_priority_string_is_accepted_as_normal() {
    assert!(matches!(Priority::parse_or_normal("banana"), Priority::Normal));
}
