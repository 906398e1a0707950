use crate::config::EngineConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use chatdesk_core::wire::{
    decode_batch, encode_line, FrameError, HelloPayload, ProtocolVersion, SubscribePayload,
    WireEnvelope, WireMsg, DEFAULT_MAX_FRAME_BYTES,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

pub const SUBSCRIBE_TOPICS: &[&str] = &["conversations"];

#[derive(Debug, Clone, PartialEq)]
pub enum PushItem {
    Event(WireMsg),
    Malformed(FrameError),
}

/// Opens push sessions. One session lives until it fails or closes; the
/// coordinator asks for a new one after backoff.
#[async_trait]
pub trait PushSource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushSession>, TransportError>;
}

/// An established push channel.
///
/// `next_event` must be cancel-safe: the coordinator races it against other
/// work and may drop the future at any await point.
#[async_trait]
pub trait PushSession: Send {
    /// `Ok(None)` means the server closed the channel cleanly.
    async fn next_event(&mut self) -> Result<Option<PushItem>, TransportError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsPushSource {
    url: Url,
    session_id: String,
    client_id: String,
    connect_timeout: Duration,
    max_frame_bytes: usize,
}

impl WsPushSource {
    pub fn new(url: Url, config: &EngineConfig) -> Self {
        Self {
            url,
            session_id: config.session_id.clone(),
            client_id: config.client_id.clone(),
            connect_timeout: config.connect_timeout,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn envelope(&self, msg: WireMsg) -> Result<String, TransportError> {
        let envelope = WireEnvelope {
            version: ProtocolVersion::CURRENT,
            session_id: self.session_id.clone(),
            sender_id: self.client_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id: None,
            msg,
        };
        encode_line(&envelope, self.max_frame_bytes)
            .map_err(|err| TransportError::Handshake(err.to_string()))
    }

    async fn handshake(&self, stream: &mut WsStream) -> Result<(), TransportError> {
        let hello = self.envelope(WireMsg::Hello(HelloPayload {
            client_id: self.client_id.clone(),
            role: "subscriber".to_string(),
            capabilities: vec!["conversation_events".to_string(), "heartbeat".to_string()],
            operator_id: None,
        }))?;
        let subscribe = self.envelope(WireMsg::Subscribe(SubscribePayload {
            topics: SUBSCRIBE_TOPICS.iter().map(|topic| topic.to_string()).collect(),
        }))?;
        for text in [hello, subscribe] {
            stream
                .send(Message::Text(text))
                .await
                .map_err(|err| TransportError::Handshake(err.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl PushSource for WsPushSource {
    async fn connect(&self) -> Result<Box<dyn PushSession>, TransportError> {
        let (mut stream, _) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| TransportError::Timeout(self.connect_timeout))?
                .map_err(|err| TransportError::Unavailable(err.to_string()))?;
        self.handshake(&mut stream).await?;

        let mut session = WsPushSession {
            stream,
            session_id: self.session_id.clone(),
            max_frame_bytes: self.max_frame_bytes,
            pending: VecDeque::new(),
        };
        let reply = tokio::time::timeout(self.connect_timeout, session.next_event())
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??;
        match reply {
            Some(PushItem::Event(WireMsg::Hello(server))) => {
                info!(
                    event = "push_connected",
                    url = %self.url,
                    server_id = %server.client_id,
                    capabilities = ?server.capabilities
                );
                Ok(Box::new(session))
            }
            Some(other) => Err(TransportError::Handshake(format!(
                "expected hello, got {}",
                describe(&other)
            ))),
            None => Err(TransportError::Handshake(
                "closed before hello".to_string(),
            )),
        }
    }
}

fn describe(item: &PushItem) -> String {
    match item {
        PushItem::Event(msg) => msg.kind().to_string(),
        PushItem::Malformed(err) => err.to_string(),
    }
}

pub struct WsPushSession {
    stream: WsStream,
    session_id: String,
    max_frame_bytes: usize,
    pending: VecDeque<PushItem>,
}

impl WsPushSession {
    /// One text message may carry several newline-separated envelopes.
    fn enqueue_text(&mut self, text: &str) {
        let report = decode_batch(text, self.max_frame_bytes);
        for envelope in report.envelopes {
            if envelope.session_id != self.session_id {
                debug!(
                    event = "push_foreign_session",
                    session_id = %envelope.session_id,
                    kind = envelope.msg.kind()
                );
                continue;
            }
            self.pending.push_back(PushItem::Event(envelope.msg));
        }
        self.pending
            .extend(report.errors.into_iter().map(PushItem::Malformed));
    }
}

#[async_trait]
impl PushSession for WsPushSession {
    async fn next_event(&mut self) -> Result<Option<PushItem>, TransportError> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Ok(Some(item));
            }
            match self.stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => self.enqueue_text(&text),
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(TransportError::Unavailable(err.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatdesk_core::wire::{HeartbeatPayload, RawMessage};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::accept_async;

    fn frame(session: &str, msg: WireMsg) -> String {
        serde_json::to_string(&WireEnvelope {
            version: ProtocolVersion::CURRENT,
            session_id: session.to_string(),
            sender_id: "hub".to_string(),
            timestamp: "2026-01-01T10:00:00Z".to_string(),
            request_id: None,
            msg,
        })
        .expect("encode")
    }

    fn server_hello() -> String {
        frame(
            "s1",
            WireMsg::Hello(HelloPayload {
                client_id: "hub".to_string(),
                role: "hub".to_string(),
                capabilities: Vec::new(),
                operator_id: None,
            }),
        )
    }

    fn new_message(session: &str, id: &str) -> String {
        frame(
            session,
            WireMsg::NewMessage(RawMessage {
                id: Some(id.to_string()),
                contact: Some("A".to_string()),
                ..RawMessage::default()
            }),
        )
    }

    /// Accepts one connection, reads the client's hello and subscribe, then
    /// sends `replies` and closes.
    async fn scripted_server(replies: Vec<String>) -> (Url, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(tcp).await.expect("upgrade");
            let mut received = Vec::new();
            while received.len() < 2 {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => received.push(text),
                    Some(Ok(_)) => {}
                    _ => return received,
                }
            }
            for reply in replies {
                ws.send(Message::Text(reply)).await.expect("send");
            }
            let _ = ws.close(None).await;
            while let Some(Ok(_)) = ws.next().await {}
            received
        });
        let url = Url::parse(&format!("ws://{addr}")).expect("url");
        (url, handle)
    }

    fn source(url: Url) -> WsPushSource {
        let config = EngineConfig {
            session_id: "s1".to_string(),
            client_id: "desk-1".to_string(),
            connect_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        };
        WsPushSource::new(url, &config)
    }

    #[tokio::test]
    async fn handshake_then_batched_frames() {
        let batch = format!(
            "{}\n{{not json}}\n{}\n",
            new_message("s1", "1"),
            new_message("s1", "2")
        );
        let (url, server) = scripted_server(vec![server_hello(), batch]).await;
        let mut session = source(url).connect().await.expect("connect");

        let mut ids = Vec::new();
        let mut malformed = 0;
        while let Some(item) = session.next_event().await.expect("read") {
            match item {
                PushItem::Event(WireMsg::NewMessage(raw)) => ids.push(raw.id.expect("id")),
                PushItem::Malformed(_) => malformed += 1,
                other => panic!("unexpected item {other:?}"),
            }
        }
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(malformed, 1);

        let received = server.await.expect("server");
        let hello: WireEnvelope = serde_json::from_str(&received[0]).expect("hello");
        assert!(matches!(hello.msg, WireMsg::Hello(ref payload) if payload.client_id == "desk-1"));
        let subscribe: WireEnvelope = serde_json::from_str(&received[1]).expect("subscribe");
        assert_eq!(subscribe.msg.kind(), "subscribe");
    }

    #[tokio::test]
    async fn foreign_session_frames_are_skipped() {
        let heartbeat = frame("s1", WireMsg::Heartbeat(HeartbeatPayload { sent_at_ms: 1 }));
        let (url, _server) = scripted_server(vec![
            server_hello(),
            new_message("other", "7"),
            heartbeat,
        ])
        .await;
        let mut session = source(url).connect().await.expect("connect");
        let item = session.next_event().await.expect("read");
        assert!(matches!(item, Some(PushItem::Event(WireMsg::Heartbeat(_)))));
    }

    #[tokio::test]
    async fn missing_server_hello_fails_handshake() {
        let (url, _server) = scripted_server(vec![new_message("s1", "1")]).await;
        let result = source(url).connect().await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let url = Url::parse(&format!("ws://{addr}")).expect("url");
        let result = source(url).connect().await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }
}
