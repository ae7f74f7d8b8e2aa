//! WebSocket transport for [`ClientSession`].
//!
//! The socket is split into a writer task fed by an unbounded channel and a
//! reader task that reassembles fragments into messages. Replies are routed
//! to the request that is waiting on them (matched by `reqid`); anything
//! else goes to the application channel returned by
//! [`WebSocketConnection::take_message_rx`].

use std::collections::HashMap;
use std::sync::Arc;

use bokeh_core::{Document, ModelRegistry};
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use uuid::Uuid;

use crate::message::{Fragment, Message, MessageType, ProtocolError, Result};
use crate::receiver::Receiver;
use crate::session::{ClientSession, Connection};

/// Version of the wire protocol announced in the connection URL.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Websocket endpoint of the server, e.g. `ws://127.0.0.1:5006/ws`.
    pub url: String,
    /// Session to join; a fresh one is generated when absent.
    pub session_id: Option<String>,
    /// How long to wait for the `ACK` and for request replies.
    pub reply_timeout_secs: u64,
    /// Capacity of the incoming message channel.
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5006/ws".to_string(),
            session_id: None,
            reply_timeout_secs: 10,
            channel_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// The endpoint URL with protocol version and session id attached.
    pub fn versioned_url(&self, session_id: &str) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{separator}bokeh-protocol-version={PROTOCOL_VERSION}&bokeh-session-id={session_id}",
            self.url
        )
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Closed locally; never reopened.
    Closed,
}

enum Outgoing {
    Fragments(Vec<Fragment>),
    Close,
}

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

pub struct WebSocketConnection {
    session_id: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    pending: PendingReplies,
    message_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    reply_timeout: Duration,
}

impl WebSocketConnection {
    /// Open the socket and wait for the server's `ACK`.
    ///
    /// Spawns background tasks for reading and writing websocket frames.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let session_id = config
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        let reply_timeout = Duration::from_secs(config.reply_timeout_secs);

        let url = config.versioned_url(&session_id);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                log::info!("Failed to connect to server: {e}");
                *state.write() = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let mut receiver = Receiver::new();
        let ack = timeout(reply_timeout, read_message(&mut ws_reader, &mut receiver))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        if ack.msgtype() != &MessageType::Ack {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "{} instead of ACK",
                ack.msgtype()
            )));
        }
        *state.write() = ConnectionState::Connected;
        log::info!("Connected to {} as session {session_id}", config.url);

        // Writer task: forward outgoing fragments to the socket
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();
        tokio::spawn(async move {
            'outer: while let Some(outgoing) = outgoing_rx.recv().await {
                match outgoing {
                    Outgoing::Fragments(fragments) => {
                        for fragment in fragments {
                            let frame = match fragment {
                                Fragment::Text(text) => WsMessage::Text(text.into()),
                                Fragment::Binary(data) => WsMessage::Binary(data.into()),
                            };
                            if let Err(e) = ws_writer.send(frame).await {
                                log::warn!("Websocket write failed: {e}");
                                break 'outer;
                            }
                        }
                    }
                    Outgoing::Close => break,
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: reassemble messages and route them
        let (message_tx, message_rx) = mpsc::channel::<Message>(config.channel_capacity);
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let reader_state = state.clone();
        tokio::spawn(async move {
            loop {
                let message = match read_message(&mut ws_reader, &mut receiver).await {
                    Ok(message) => message,
                    Err(ProtocolError::ConnectionClosed) => break,
                    Err(e) => {
                        log::error!("Closing connection: {e}");
                        break;
                    }
                };
                let waiter = message
                    .reqid()
                    .and_then(|reqid| reader_pending.lock().remove(reqid));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(message);
                    }
                    None => {
                        if message_tx.send(message).await.is_err() {
                            log::debug!("No listener for incoming messages");
                        }
                    }
                }
            }

            // Connection lost: fail every outstanding request
            reader_pending.lock().clear();
            let mut state = reader_state.write();
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Disconnected;
            }
        });

        Ok(Self {
            session_id,
            state,
            outgoing_tx,
            pending,
            message_rx: Mutex::new(Some(message_rx)),
            reply_timeout,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Take the channel of unsolicited incoming messages (can only be
    /// called once).
    pub fn take_message_rx(&self) -> Option<mpsc::Receiver<Message>> {
        self.message_rx.lock().take()
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_replies(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Connection for WebSocketConnection {
    fn send(&self, message: Message) -> Result<()> {
        if !self.connected() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let fragments = message.fragments()?;
        self.outgoing_tx
            .send(Outgoing::Fragments(fragments))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn send_with_reply(&self, message: Message) -> Result<Message> {
        let msgid = message.msgid().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(msgid.clone(), reply_tx);
        if let Err(e) = self.send(message) {
            self.pending.lock().remove(&msgid);
            return Err(e);
        }

        match timeout(self.reply_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&msgid);
                Err(ProtocolError::Timeout)
            }
        }
    }

    fn close(&self) {
        let mut state = self.state.write();
        if *state == ConnectionState::Closed {
            return;
        }
        *state = ConnectionState::Closed;
        let _ = self.outgoing_tx.send(Outgoing::Close);
        log::info!("Closed connection for session {}", self.session_id);
    }
}

/// Read frames until `receiver` completes a message.
async fn read_message<S>(stream: &mut S, receiver: &mut Receiver) -> Result<Message>
where
    S: Stream<Item = std::result::Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let fragment = match frame? {
            WsMessage::Text(text) => Fragment::Text(text.as_str().to_owned()),
            WsMessage::Binary(data) => Fragment::Binary(data.to_vec()),
            WsMessage::Close(_) => break,
            _ => continue,
        };
        if let Some(message) = receiver.consume(fragment)? {
            return Ok(message);
        }
    }
    Err(ProtocolError::ConnectionClosed)
}

/// A session over a live connection, plus the messages it should handle.
pub type PulledSession = (
    ClientSession<WebSocketConnection>,
    mpsc::Receiver<Message>,
);

/// Connect, pull the server's document and bind a session to it.
///
/// Drive the session with [`ClientSession::run`] on the returned receiver.
pub async fn pull_session(
    config: &ClientConfig,
    registry: Arc<ModelRegistry>,
) -> Result<PulledSession> {
    let connection = Arc::new(WebSocketConnection::connect(config).await?);

    let reply = connection.send_with_reply(Message::pull_doc_req()).await?;
    match reply.msgtype() {
        MessageType::PullDocReply => {}
        MessageType::Error => {
            return Err(ProtocolError::Server(format!(
                "Failed to pull document: {}",
                reply.error_text().unwrap_or_default()
            )))
        }
        other => return Err(ProtocolError::UnexpectedMessage(other.to_string())),
    }

    let doc_json = reply.doc()?;
    let document = Document::from_json(&doc_json, registry)?;
    let patch = Document::compute_patch_since_json(&doc_json, &document)?;
    if !patch.is_empty() {
        log::debug!("Sending {} initialization events", patch.events.len());
        connection.send(Message::patch_doc(&patch, Vec::new())?)?;
    }

    let message_rx = connection
        .take_message_rx()
        .ok_or(ProtocolError::ConnectionClosed)?;
    let session_id = connection.session_id().to_string();
    Ok((ClientSession::new(session_id, document, connection), message_rx))
}

/// Connect and replace the server's document with `document`.
pub async fn push_session(config: &ClientConfig, document: Document) -> Result<PulledSession> {
    let connection = Arc::new(WebSocketConnection::connect(config).await?);

    let reply = connection
        .send_with_reply(Message::push_doc(&document.to_json(true)?)?)
        .await?;
    if reply.msgtype() == &MessageType::Error {
        return Err(ProtocolError::Server(format!(
            "Failed to push document: {}",
            reply.error_text().unwrap_or_default()
        )));
    }

    let message_rx = connection
        .take_message_rx()
        .ok_or(ProtocolError::ConnectionClosed)?;
    let session_id = connection.session_id().to_string();
    Ok((ClientSession::new(session_id, document, connection), message_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:5006/ws");
        assert!(config.session_id.is_none());
        assert!(config.reply_timeout_secs > 0);
    }

    #[test]
    fn test_versioned_url() {
        let config = ClientConfig::new("ws://host/app/ws");
        assert_eq!(
            config.versioned_url("abc"),
            "ws://host/app/ws?bokeh-protocol-version=1.0&bokeh-session-id=abc"
        );
        let config = ClientConfig::new("ws://host/ws?theme=dark");
        assert!(config.versioned_url("abc").starts_with("ws://host/ws?theme=dark&bokeh"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ClientConfig::new(format!("ws://127.0.0.1:{port}/ws"));
        let result = WebSocketConnection::connect(&config).await;
        assert!(matches!(result, Err(ProtocolError::WebSocket(_))));
    }

    #[tokio::test]
    async fn test_read_message_from_stream() {
        let mut frames = futures_util::stream::iter(
            Message::ok("r")
                .fragments()
                .unwrap()
                .into_iter()
                .map(|f| {
                    Ok::<_, tungstenite::Error>(match f {
                        Fragment::Text(t) => WsMessage::Text(t.into()),
                        Fragment::Binary(b) => WsMessage::Binary(b.into()),
                    })
                }),
        );
        let mut receiver = Receiver::new();
        let message = read_message(&mut frames, &mut receiver).await.unwrap();
        assert_eq!(message.reqid(), Some("r"));

        let err = read_message(&mut frames, &mut receiver).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }
}
