//! WebSocket `newHeads` subscription.
//!
//! Connects to a chain's WebSocket endpoint and runs an immediate scan pass
//! whenever the node announces a new head. The polling loop keeps running
//! alongside, so a dead feed only costs latency.

use crate::onchain::scanner::{BlockScanner, ScanError};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

const SUBSCRIBE_ID: u64 = 1;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("websocket connection failed: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("subscription rejected: {0}")]
    Rejected(String),
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
    #[error("feed-triggered scan failed: {0}")]
    Scan(ScanError),
    #[error("ingest queue closed")]
    QueueClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedSettings {
    /// Delay before reconnecting after the session ends or fails.
    pub reconnect_backoff: Duration,
    pub connect_timeout: Duration,
    /// A socket with no traffic for this long is treated as dead.
    pub idle_timeout: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// A message read off the subscription socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// Reply to `eth_subscribe` carrying the subscription id.
    Subscribed(String),
    /// A `newHeads` notification; the number is absent if the node omitted it.
    NewHead(Option<u64>),
    /// JSON-RPC error object.
    Error(String),
    Other,
}

pub fn subscribe_request() -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": SUBSCRIBE_ID,
        "method": "eth_subscribe",
        "params": ["newHeads"],
    })
    .to_string()
}

pub fn parse_message(text: &str) -> Result<FeedMessage, serde_json::Error> {
    let val: Value = serde_json::from_str(text)?;

    if let Some(err) = val.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Ok(FeedMessage::Error(message));
    }

    if let Some(result) = val.get("params").and_then(|p| p.get("result")) {
        let number = result
            .get("number")
            .and_then(|v| v.as_str())
            .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok());
        return Ok(FeedMessage::NewHead(number));
    }

    if val.get("id").and_then(|v| v.as_u64()) == Some(SUBSCRIBE_ID) {
        if let Some(id) = val.get("result").and_then(|v| v.as_str()) {
            return Ok(FeedMessage::Subscribed(id.to_string()));
        }
    }

    Ok(FeedMessage::Other)
}

pub struct LiveBlockFeed {
    scanner: Arc<BlockScanner>,
    settings: FeedSettings,
}

impl LiveBlockFeed {
    pub fn new(scanner: Arc<BlockScanner>, settings: FeedSettings) -> Self {
        Self { scanner, settings }
    }

    /// Reconnect loop. Returns at once if the chain has no WebSocket endpoint.
    ///
    /// A failed feed-triggered scan ends the session, so a dead RPC node is
    /// retried once per backoff rather than once per head.
    pub async fn run(self, shutdown: CancellationToken) {
        let descriptor = self.scanner.connection().descriptor().clone();
        let chain = descriptor.chain;
        if !descriptor.has_live_feed() {
            info!(chain = %chain, "no websocket endpoint, live feed disabled");
            return;
        }

        loop {
            info!(chain = %chain, url = %descriptor.ws_url, "connecting newHeads feed");

            match self.session(&descriptor.ws_url, &shutdown).await {
                Ok(()) if shutdown.is_cancelled() => break,
                Ok(()) => info!(chain = %chain, "newHeads feed closed"),
                Err(FeedError::QueueClosed) => {
                    info!(chain = %chain, "ingest queue closed, feed exiting");
                    return;
                }
                Err(e) => error!(chain = %chain, error = %e, "newHeads feed error"),
            }

            info!(
                chain = %chain,
                delay_secs = self.settings.reconnect_backoff.as_secs(),
                "reconnecting newHeads feed"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.reconnect_backoff) => {}
            }
        }

        info!(chain = %chain, "newHeads feed stopped");
    }

    async fn session(&self, ws_url: &str, shutdown: &CancellationToken) -> Result<(), FeedError> {
        let chain = self.scanner.chain();
        let connect_timeout = self.settings.connect_timeout;
        let (ws_stream, _response) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            connected = tokio::time::timeout(connect_timeout, connect_async(ws_url)) => match connected {
                Ok(result) => result?,
                Err(_) => return Err(FeedError::Timeout { stage: "connect", after: connect_timeout }),
            },
        };
        let (mut write, mut read) = ws_stream.split();

        write.send(Message::Text(subscribe_request())).await?;

        let idle_timeout = self.settings.idle_timeout;
        loop {
            let msg_result = tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                next = tokio::time::timeout(idle_timeout, read.next()) => match next {
                    Ok(Some(msg_result)) => msg_result,
                    Ok(None) => break,
                    Err(_) => return Err(FeedError::Timeout { stage: "read", after: idle_timeout }),
                },
            };

            match msg_result? {
                Message::Text(text) => match parse_message(&text) {
                    Ok(FeedMessage::NewHead(number)) => {
                        debug!(chain = %chain, head = ?number, "new head");
                        match self.scanner.poll_once().await {
                            Ok(_) => {}
                            Err(ScanError::QueueClosed(_)) => return Err(FeedError::QueueClosed),
                            Err(e) => {
                                let _ = write.send(Message::Close(None)).await;
                                return Err(FeedError::Scan(e));
                            }
                        }
                    }
                    Ok(FeedMessage::Subscribed(id)) => {
                        info!(chain = %chain, subscription = %id, "subscribed to newHeads");
                    }
                    Ok(FeedMessage::Error(message)) => return Err(FeedError::Rejected(message)),
                    Ok(FeedMessage::Other) => {}
                    Err(e) => warn!(chain = %chain, error = %e, "unparseable feed message"),
                },
                Message::Ping(data) => {
                    write.send(Message::Pong(data)).await?;
                }
                Message::Close(frame) => {
                    info!(chain = %chain, frame = ?frame, "feed received close frame");
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{ingest_queue, IngestReceiver};
    use crate::onchain::chain::{ChainConnection, ChainDescriptor, ChainKind};
    use crate::onchain::decoder::EventDecoder;
    use crate::onchain::registry::ContractRegistry;
    use crate::onchain::rpc::{ChainClient, MockChainClient, RawBlock, RawReceipt, RpcError};
    use crate::onchain::scanner::ScanSettings;
    use alloy::primitives::B256;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// What the in-process node does after acknowledging the subscription.
    #[derive(Debug, Clone, Copy)]
    enum Script {
        Heads(u64),
        Close,
        Silent,
    }

    fn head_notification(number: u64) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {"subscription": "0xfeed", "result": {"number": format!("0x{number:x}")}},
        })
        .to_string()
    }

    /// Local WebSocket node. Returns its url and a count of accepted connections.
    async fn spawn_node(script: Script) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let connections = Arc::new(AtomicUsize::new(0));
        let accepted = connections.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    let _ = ws.next().await;
                    let _ = ws
                        .send(Message::Text(r#"{"jsonrpc":"2.0","id":1,"result":"0xfeed"}"#.into()))
                        .await;
                    match script {
                        Script::Heads(n) => {
                            for number in 1..=n {
                                let _ = ws.send(Message::Text(head_notification(number))).await;
                            }
                            while let Some(Ok(_)) = ws.next().await {}
                        }
                        Script::Close => {
                            let _ = ws.close(None).await;
                        }
                        Script::Silent => while let Some(Ok(_)) = ws.next().await {},
                    }
                });
            }
        });

        (url, connections)
    }

    /// An RPC node that is down: every head request fails.
    #[derive(Default)]
    struct DownNode {
        head_requests: AtomicUsize,
    }

    #[async_trait]
    impl ChainClient for DownNode {
        async fn block_number(&self) -> Result<u64, RpcError> {
            self.head_requests.fetch_add(1, Ordering::SeqCst);
            Err(RpcError::Transport("connection refused".into()))
        }

        async fn block_with_transactions(&self, _number: u64) -> Result<Option<RawBlock>, RpcError> {
            Err(RpcError::Transport("connection refused".into()))
        }

        async fn receipt(&self, _tx_hash: B256) -> Result<Option<RawReceipt>, RpcError> {
            Err(RpcError::Transport("connection refused".into()))
        }
    }

    fn scanner(ws_url: &str, client: Arc<dyn ChainClient>) -> (Arc<BlockScanner>, IngestReceiver) {
        let (tx, rx) = ingest_queue(16);
        let connection = Arc::new(ChainConnection::new(ChainDescriptor::preset(
            ChainKind::Arbitrum,
            "http://localhost:8545",
            ws_url,
        )));
        let scanner = BlockScanner::new(
            connection,
            client,
            EventDecoder::new(Arc::new(ContractRegistry::new())),
            tx,
            ScanSettings::default(),
        );
        (Arc::new(scanner), rx)
    }

    fn settings(reconnect_ms: u64, idle_ms: u64) -> FeedSettings {
        FeedSettings {
            reconnect_backoff: Duration::from_millis(reconnect_ms),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_millis(idle_ms),
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_head_triggers_scan() {
        let (url, _) = spawn_node(Script::Heads(1)).await;
        let client = Arc::new(MockChainClient::new());
        client.set_head(5);
        let (scanner, _rx) = scanner(&url, client);
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            LiveBlockFeed::new(scanner.clone(), settings(60_000, 60_000)).run(token.clone()),
        );

        assert!(wait_for(|| scanner.connection().cursor() == Some(5)).await);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_scan_backs_off_instead_of_rescanning_every_head() {
        let (url, connections) = spawn_node(Script::Heads(10)).await;
        let node = Arc::new(DownNode::default());
        let (scanner, _rx) = scanner(&url, node.clone());
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            LiveBlockFeed::new(scanner, settings(60_000, 60_000)).run(token.clone()),
        );

        assert!(wait_for(|| node.head_requests.load(Ordering::SeqCst) >= 1).await);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(node.head_requests.load(Ordering::SeqCst), 1);
        assert_eq!(connections.load(Ordering::SeqCst), 1);

        // Cancel lands during the reconnect backoff.
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_close() {
        let (url, connections) = spawn_node(Script::Close).await;
        let (scanner, _rx) = scanner(&url, Arc::new(MockChainClient::new()));
        let token = CancellationToken::new();
        let handle = tokio::spawn(LiveBlockFeed::new(scanner, settings(10, 60_000)).run(token.clone()));

        assert!(wait_for(|| connections.load(Ordering::SeqCst) >= 2).await);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_silent_socket_is_dropped_after_idle_timeout() {
        let (url, connections) = spawn_node(Script::Silent).await;
        let (scanner, _rx) = scanner(&url, Arc::new(MockChainClient::new()));
        let token = CancellationToken::new();
        let handle = tokio::spawn(LiveBlockFeed::new(scanner, settings(10, 50)).run(token.clone()));

        assert!(wait_for(|| connections.load(Ordering::SeqCst) >= 2).await);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_exits_on_cancel_while_connected() {
        let (url, connections) = spawn_node(Script::Silent).await;
        let (scanner, _rx) = scanner(&url, Arc::new(MockChainClient::new()));
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            LiveBlockFeed::new(scanner, settings(60_000, 60_000)).run(token.clone()),
        );

        assert!(wait_for(|| connections.load(Ordering::SeqCst) == 1).await);
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_ws_url_returns_at_once() {
        let (scanner, _rx) = scanner("", Arc::new(MockChainClient::new()));
        tokio::time::timeout(
            Duration::from_secs(1),
            LiveBlockFeed::new(scanner, FeedSettings::default()).run(CancellationToken::new()),
        )
        .await
        .unwrap();
    }

    #[test]
    fn test_subscribe_request_shape() {
        let v: Value = serde_json::from_str(&subscribe_request()).unwrap();
        assert_eq!(v["method"], "eth_subscribe");
        assert_eq!(v["params"][0], "newHeads");
    }

    #[test]
    fn test_parse_head_notification() {
        let text = r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0xabc","result":{"number":"0x1b4","hash":"0x00"}}}"#;
        assert_eq!(parse_message(text).unwrap(), FeedMessage::NewHead(Some(436)));

        let text = r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0xabc","result":{}}}"#;
        assert_eq!(parse_message(text).unwrap(), FeedMessage::NewHead(None));
    }

    #[test]
    fn test_parse_replies() {
        assert_eq!(
            parse_message(r#"{"jsonrpc":"2.0","id":1,"result":"0xcd0c3e8af590364c09d0fa6a1210faf5"}"#).unwrap(),
            FeedMessage::Subscribed("0xcd0c3e8af590364c09d0fa6a1210faf5".into())
        );
        assert_eq!(
            parse_message(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}"#).unwrap(),
            FeedMessage::Error("method not found".into())
        );
        assert_eq!(parse_message(r#"{"foo":1}"#).unwrap(), FeedMessage::Other);
        assert!(parse_message("not json").is_err());
    }
}
