//! Test utilities for order-fanout
//!
//! In-memory sinks, a scripted secret provider, a recording stream client
//! factory and a scripted local HTTP server. Sinks share a [`CallLog`] so tests
//! can assert dispatch order.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::credentials::{CredentialError, SecretProvider, StreamClient, StreamClientFactory};
use crate::error::{Error, Result};
use crate::models::{Order, OrderEvent};
use crate::sinks::stream::StreamSendError;
use crate::sinks::topic::envelope_batch;
use crate::sinks::{DocumentSink, StreamSink, TopicSink};
use crate::trigger::{DeadLetter, DeadLetterSink};

/// Ordered record of which sinks were called
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<&'static str>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sink: &'static str) {
        self.calls.lock().unwrap().push(sink);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

/// Shared failure switch for the recording sinks
#[derive(Debug, Clone, Default)]
struct FailureMode {
    message: Arc<Mutex<Option<String>>>,
}

impl FailureMode {
    fn set(&self, message: &str) {
        *self.message.lock().unwrap() = Some(message.to_string());
    }

    fn current(&self) -> Option<String> {
        self.message.lock().unwrap().clone()
    }
}

/// Topic sink that keeps the serialized envelope batches
#[derive(Debug, Clone)]
pub struct RecordingTopicSink {
    batches: Arc<Mutex<Vec<serde_json::Value>>>,
    failure: FailureMode,
    log: CallLog,
}

impl RecordingTopicSink {
    pub fn new(log: CallLog) -> Self {
        Self {
            batches: Arc::new(Mutex::new(Vec::new())),
            failure: FailureMode::default(),
            log,
        }
    }

    /// Fail every publish from now on
    pub fn fail_with(&self, message: &str) {
        self.failure.set(message);
    }

    /// Envelope batches as they would have been posted
    pub fn batches(&self) -> Vec<serde_json::Value> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl TopicSink for RecordingTopicSink {
    async fn publish(&self, event: &OrderEvent) -> Result<()> {
        self.log.record("topic");
        if let Some(message) = self.failure.current() {
            return Err(Error::publish(message));
        }
        let batch = serde_json::to_value(envelope_batch(event))?;
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

/// Document sink that keeps appended events in memory
#[derive(Debug, Clone)]
pub struct RecordingDocumentSink {
    documents: Arc<Mutex<Vec<OrderEvent>>>,
    failure: FailureMode,
    delay: Option<Duration>,
    log: CallLog,
}

impl RecordingDocumentSink {
    pub fn new(log: CallLog) -> Self {
        Self {
            documents: Arc::new(Mutex::new(Vec::new())),
            failure: FailureMode::default(),
            delay: None,
            log,
        }
    }

    /// Sleep before every write
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_with(&self, message: &str) {
        self.failure.set(message);
    }

    pub fn documents(&self) -> Vec<OrderEvent> {
        self.documents.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentSink for RecordingDocumentSink {
    async fn add_document(&self, event: &OrderEvent) -> Result<()> {
        self.log.record("document_store");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.failure.current() {
            return Err(Error::store_write(message));
        }
        self.documents.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Stream sink that keeps sent events in memory
#[derive(Debug, Clone)]
pub struct RecordingStreamSink {
    events: Arc<Mutex<Vec<OrderEvent>>>,
    failure: FailureMode,
    log: CallLog,
}

impl RecordingStreamSink {
    pub fn new(log: CallLog) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            failure: FailureMode::default(),
            log,
        }
    }

    pub fn fail_with(&self, message: &str) {
        self.failure.set(message);
    }

    pub fn events(&self) -> Vec<OrderEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamSink for RecordingStreamSink {
    async fn send(&self, event: &OrderEvent) -> Result<()> {
        self.log.record("stream");
        if let Some(message) = self.failure.current() {
            return Err(StreamSendError::Transport(message).into());
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Secret provider with a scripted outcome
#[derive(Debug, Clone)]
pub struct FakeSecretProvider {
    outcome: std::result::Result<String, CredentialError>,
    delay: Option<Duration>,
    fetches: Arc<AtomicUsize>,
}

impl FakeSecretProvider {
    pub fn returning(connection_string: &str) -> Self {
        Self {
            outcome: Ok(connection_string.to_string()),
            delay: None,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(error: CredentialError) -> Self {
        Self {
            outcome: Err(error),
            delay: None,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Hold every fetch open for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of fetches started so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretProvider for FakeSecretProvider {
    async fn fetch_connection_string(&self) -> std::result::Result<String, CredentialError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outcome.clone()
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    built_with: Mutex<Vec<String>>,
    sent: Mutex<Vec<String>>,
    send_failure: Mutex<Option<String>>,
}

/// Stream client factory recording every build and every send
#[derive(Debug, Clone, Default)]
pub struct RecordingStreamClientFactory {
    state: Arc<FactoryState>,
    reject_with: Option<String>,
}

impl RecordingStreamClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every connection string
    pub fn rejecting(reason: &str) -> Self {
        Self {
            state: Arc::new(FactoryState::default()),
            reject_with: Some(reason.to_string()),
        }
    }

    /// Make clients fail every send from now on
    pub fn fail_sends(&self, message: &str) {
        *self.state.send_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Connection strings clients were built from
    pub fn built_with(&self) -> Vec<String> {
        self.state.built_with.lock().unwrap().clone()
    }

    /// Payloads sent through any built client, as text
    pub fn sent_payloads(&self) -> Vec<String> {
        self.state.sent.lock().unwrap().clone()
    }
}

impl StreamClientFactory for RecordingStreamClientFactory {
    fn build(
        &self,
        connection_string: &str,
    ) -> std::result::Result<Arc<dyn StreamClient>, CredentialError> {
        if let Some(reason) = &self.reject_with {
            return Err(CredentialError::InvalidConnectionString(reason.clone()));
        }
        self.state
            .built_with
            .lock()
            .unwrap()
            .push(connection_string.to_string());
        Ok(Arc::new(RecordingStreamClient {
            state: Arc::clone(&self.state),
        }))
    }
}

struct RecordingStreamClient {
    state: Arc<FactoryState>,
}

#[async_trait]
impl StreamClient for RecordingStreamClient {
    async fn send(&self, payload: &[u8]) -> std::result::Result<(), StreamSendError> {
        if let Some(message) = self.state.send_failure.lock().unwrap().clone() {
            return Err(StreamSendError::Transport(message));
        }
        self.state
            .sent
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(payload).into_owned());
        Ok(())
    }
}

/// Dead-letter sink that keeps letters in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
    failure: FailureMode,
}

impl RecordingDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, message: &str) {
        self.failure.set(message);
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetterSink {
    async fn send(&self, letter: &DeadLetter) -> Result<()> {
        if let Some(message) = self.failure.current() {
            return Err(Error::internal(message));
        }
        self.letters.lock().unwrap().push(letter.clone());
        Ok(())
    }
}

/// Canned response served by [`ScriptedHttpServer`]
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl ScriptedResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        self.body = body.to_string();
        self
    }

    pub fn text(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    fn to_bytes(&self) -> Vec<u8> {
        let reason = reqwest::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or("Unknown");

        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason);
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            self.body.len()
        ));

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(self.body.as_bytes());
        bytes
    }
}

/// Request received by [`ScriptedHttpServer`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    /// Path without the query string
    pub path: String,
    /// Header names are lowercased
    pub headers: HashMap<String, String>,
    pub body: String,
}

#[derive(Debug, Default)]
struct Routes {
    scripts: HashMap<(String, String), VecDeque<ScriptedResponse>>,
}

impl Routes {
    /// Next scripted response for a route; the last one repeats
    fn next(&mut self, method: &str, path: &str) -> ScriptedResponse {
        match self.scripts.get_mut(&(method.to_string(), path.to_string())) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(not_scripted),
            Some(queue) => queue.front().cloned().unwrap_or_else(not_scripted),
            None => not_scripted(),
        }
    }
}

fn not_scripted() -> ScriptedResponse {
    ScriptedResponse::status(404).text("no scripted response")
}

/// HTTP/1.1 server on an ephemeral local port answering from scripts
///
/// One request per connection, handled in arrival order.
#[derive(Debug)]
pub struct ScriptedHttpServer {
    base_url: String,
    routes: Arc<Mutex<Routes>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl ScriptedHttpServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let routes = Arc::new(Mutex::new(Routes::default()));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let routes = Arc::clone(&routes);
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    let Some(request) = read_request(&mut socket).await else {
                        continue;
                    };
                    let response = routes.lock().unwrap().next(&request.method, &request.path);
                    requests.lock().unwrap().push(request);

                    let _ = socket.write_all(&response.to_bytes()).await;
                    let _ = socket.shutdown().await;
                }
            })
        };

        Self {
            base_url,
            routes,
            requests,
            handle,
        }
    }

    /// `http://127.0.0.1:<port>`
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Script the responses for `method path`, served in order
    pub fn route(&self, method: &str, path: &str, responses: Vec<ScriptedResponse>) {
        self.routes
            .lock()
            .unwrap()
            .scripts
            .insert((method.to_string(), path.to_string()), responses.into());
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for ScriptedHttpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn read_request(socket: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        let read = socket.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?;
    let path = target.split('?').next().unwrap_or(target).to_string();

    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    while buffer.len() < head_end + content_length {
        let read = socket.read(&mut chunk).await.ok()?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
    let body_end = buffer.len().min(head_end + content_length);
    let body = String::from_utf8_lossy(&buffer[head_end..body_end]).to_string();

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

/// Build a test order event
pub fn create_test_event() -> OrderEvent {
    OrderEvent::from_order(Order::new("TEST-SKU", 5))
}

/// Raw message body for an order
pub fn order_body(sku: &str, quantity: i64) -> Vec<u8> {
    serde_json::json!({ "sku": sku, "quantity": quantity })
        .to_string()
        .into_bytes()
}
