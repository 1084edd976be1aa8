//! Shared fixtures for async room and connection tests.

use crate::config::AppConfig;
use crate::error::ReverseError;
use crate::monitor::Monitor;
use crate::room::client::RoomPayload;
use crate::room::RelayContext;
use crate::store::MemoryMessageStore;
use crate::translation::reverse::{ReverseRequest, ReverseTranslator};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, WebSocketStream};

pub type BackendPeer = WebSocketStream<TcpStream>;

/// A local WebSocket server standing in for the translation backend. Every
/// accepted connection is handed to the test through the receiver.
pub async fn fake_backend() -> (String, mpsc::UnboundedReceiver<BackendPeer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = accept_async(stream).await {
                if tx.send(ws).is_err() {
                    break;
                }
            }
        }
    });

    (format!("ws://{}/translate", addr), rx)
}

/// Defaults with short retry delays, pointed at `api_url`.
pub fn test_config(api_url: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.translation.api_url = api_url.to_string();
    config.translation.connect_retry_ms = 50;
    config.translation.reconnect_delay_ms = 50;
    config.reverse.retry_backoff_ms = 1;
    config
}

/// Always answers with the same text.
pub struct FixedTranslator(pub &'static str);

#[async_trait]
impl ReverseTranslator for FixedTranslator {
    async fn translate(&self, _request: &ReverseRequest) -> Result<String, ReverseError> {
        Ok(self.0.to_string())
    }
}

/// Answers with the same text and counts how often it was asked.
pub struct CountingTranslator {
    reply: &'static str,
    calls: AtomicUsize,
}

impl CountingTranslator {
    pub fn new(reply: &'static str) -> Arc<Self> {
        Arc::new(Self {
            reply,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReverseTranslator for CountingTranslator {
    async fn translate(&self, _request: &ReverseRequest) -> Result<String, ReverseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.to_string())
    }
}

pub fn test_context(config: AppConfig, reply: &'static str) -> (RelayContext, Arc<MemoryMessageStore>) {
    let store = Arc::new(MemoryMessageStore::new());
    let context = RelayContext {
        config: Arc::new(config),
        store: store.clone(),
        translator: Arc::new(FixedTranslator(reply)),
        monitor: Monitor::new(),
    };
    (context, store)
}

pub async fn next_payload(rx: &mut mpsc::Receiver<RoomPayload>) -> RoomPayload {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for payload")
        .expect("client queue closed")
}

pub async fn next_json(rx: &mut mpsc::Receiver<RoomPayload>) -> serde_json::Value {
    match next_payload(rx).await {
        RoomPayload::Text(json) => serde_json::from_str(&json).unwrap(),
        other => panic!("expected text payload, got {:?}", other),
    }
}

pub async fn next_peer(rx: &mut mpsc::UnboundedReceiver<BackendPeer>) -> BackendPeer {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("backend was never contacted")
        .expect("backend listener stopped")
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition never became true");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
