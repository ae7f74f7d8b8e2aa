//! A document bound to one server connection.
//!
//! Local changes flow out as `PATCH-DOC` messages; incoming `PATCH-DOC`
//! messages are applied under the session id, which is how the session
//! recognises (and drops) the echo of its own updates.

use std::future::Future;
use std::sync::Arc;

use bokeh_core::{Document, DocumentChange, DocumentChangedEvent, ModelEvent, Subscription};
use parking_lot::Mutex;
use serde_json::Value as Json;
use tokio::sync::mpsc;

use crate::message::{Message, MessageType, ProtocolError, Result};

/// What a session needs from its transport.
pub trait Connection: Send + Sync + 'static {
    /// Queue a message for transmission.
    fn send(&self, message: Message) -> Result<()>;

    /// Send a message and wait for the message whose `reqid` matches it.
    fn send_with_reply(&self, message: Message) -> impl Future<Output = Result<Message>> + Send;

    fn close(&self);
}

pub struct ClientSession<C: Connection> {
    id: String,
    document: Document,
    connection: Arc<C>,
    subscription: Mutex<Option<Subscription>>,
}

impl<C: Connection> ClientSession<C> {
    pub fn new(id: impl Into<String>, document: Document, connection: Arc<C>) -> Self {
        let id = id.into();

        let listener_id = id.clone();
        let listener_conn = connection.clone();
        let weak = document.downgrade();
        let subscription = document.on_change(move |event| {
            let Some(document) = weak.upgrade() else {
                return;
            };
            document_changed(&listener_id, &document, listener_conn.as_ref(), event);
        });

        let event_conn = connection.clone();
        document.event_manager().set_sender(Some(Arc::new(move |event: &ModelEvent| {
            if let Err(e) = send_model_event(event_conn.as_ref(), event) {
                log::error!("Failed to send event '{}': {e}", event.event_name);
            }
        })));

        Self {
            id,
            document,
            connection,
            subscription: Mutex::new(Some(subscription)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    /// Whether the change listener is still wired to the document.
    pub fn is_attached(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Dispatch one incoming message. Only patch failures are errors.
    pub fn handle(&self, message: &Message) -> Result<()> {
        match message.msgtype() {
            MessageType::PatchDoc => {
                self.document
                    .apply_json_patch(&message.content, &message.buffers, Some(&self.id))?;
            }
            MessageType::Ok => {
                log::trace!("Unhandled OK reply to {:?}", message.reqid());
            }
            MessageType::Error => {
                log::error!(
                    "Unhandled ERROR reply to {:?}: {}",
                    message.reqid(),
                    message.error_text().unwrap_or_default()
                );
            }
            other => {
                log::debug!("Doing nothing with message {other}");
            }
        }
        Ok(())
    }

    pub fn send_event(&self, event: &ModelEvent) -> Result<()> {
        send_model_event(self.connection.as_ref(), event)
    }

    pub async fn request_server_info(&self) -> Result<Json> {
        let reply = self
            .connection
            .send_with_reply(Message::server_info_req())
            .await?;
        match reply.msgtype() {
            MessageType::Error => Err(ProtocolError::Server(
                reply.error_text().unwrap_or_default().to_string(),
            )),
            _ => Ok(reply.content),
        }
    }

    /// Resolves once the server has processed everything sent before it.
    pub async fn force_roundtrip(&self) -> Result<()> {
        self.request_server_info().await.map(|_| ())
    }

    /// Feed incoming messages to [`handle`](Self::handle) until the channel
    /// closes or a patch fails to apply.
    pub async fn run(&self, mut message_rx: mpsc::Receiver<Message>) {
        while let Some(message) = message_rx.recv().await {
            if let Err(e) = self.handle(&message) {
                log::error!("Dropping connection for session {}: {e}", self.id);
                self.connection.close();
                break;
            }
        }
        self.connection_closed();
    }

    /// Stop mirroring document changes. The document keeps its contents.
    pub fn connection_closed(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            self.document.remove_on_change(subscription);
            self.document.event_manager().set_sender(None);
            log::info!("Session {} detached from its document", self.id);
        }
    }

    pub fn close(&self) {
        self.connection.close();
        self.connection_closed();
    }
}

fn document_changed<C: Connection>(
    session_id: &str,
    document: &Document,
    connection: &C,
    event: &DocumentChangedEvent,
) {
    if event.setter_id.as_deref() == Some(session_id) {
        return;
    }
    if let DocumentChange::ModelChanged { model, attr, .. } = &event.kind {
        if !model.attribute_is_serializable(attr) {
            return;
        }
    }

    let message = document
        .create_json_patch(std::slice::from_ref(event))
        .map_err(ProtocolError::from)
        .and_then(|patch| Message::patch_doc(&patch, Vec::new()));
    match message.and_then(|message| connection.send(message)) {
        Ok(()) => {}
        Err(e) => log::error!("Failed to send patch for session {session_id}: {e}"),
    }
}

fn send_model_event<C: Connection>(connection: &C, event: &ModelEvent) -> Result<()> {
    connection.send(Message::event(serde_json::to_value(event)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bokeh_core::{ModelRegistry, SetOptions, Value};
    use serde_json::json;

    /// Records outgoing messages and answers requests with `OK`.
    #[derive(Default)]
    struct MockConnection {
        sent: Mutex<Vec<Message>>,
        closed: Mutex<bool>,
    }

    impl MockConnection {
        fn sent_types(&self) -> Vec<MessageType> {
            self.sent.lock().iter().map(|m| m.msgtype().clone()).collect()
        }
    }

    impl Connection for MockConnection {
        fn send(&self, message: Message) -> Result<()> {
            self.sent.lock().push(message);
            Ok(())
        }

        async fn send_with_reply(&self, message: Message) -> Result<Message> {
            let reply = match message.msgtype() {
                MessageType::ServerInfoReq => Message::server_info_reply(message.msgid()),
                _ => Message::ok(message.msgid()),
            };
            self.sent.lock().push(message);
            Ok(reply)
        }

        fn close(&self) {
            *self.closed.lock() = true;
        }
    }

    fn session() -> (ClientSession<MockConnection>, Arc<MockConnection>) {
        let registry = Arc::new(ModelRegistry::with_builtins());
        let document = Document::new(registry.clone());
        let source = registry.create("ColumnDataSource").unwrap();
        source.set("name", "src").unwrap();
        document.add_root(&source).unwrap();
        let connection = Arc::new(MockConnection::default());
        let session = ClientSession::new("session-1", document, connection.clone());
        (session, connection)
    }

    fn source(session: &ClientSession<MockConnection>) -> bokeh_core::ModelRef {
        session.document().roots()[0].clone()
    }

    #[test]
    fn test_local_change_sends_patch() {
        let (session, conn) = session();
        source(&session).set("name", "renamed").unwrap();

        let sent = conn.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msgtype(), &MessageType::PatchDoc);
        assert_eq!(sent[0].content["events"][0]["kind"], "ModelChanged");
        assert_eq!(sent[0].content["events"][0]["new"], "renamed");
    }

    #[test]
    fn test_own_patch_not_echoed() {
        let (session, conn) = session();
        let src = source(&session);
        let patch = Message::patch_doc(
            &bokeh_core::Patch::from_json(&json!({
                "references": [],
                "events": [{
                    "kind": "ModelChanged",
                    "model": {"id": src.id().as_str(), "type": "ColumnDataSource"},
                    "attr": "name",
                    "new": "from-server",
                }],
            }))
            .unwrap(),
            Vec::new(),
        )
        .unwrap();

        session.handle(&patch).unwrap();
        assert_eq!(src.name().as_deref(), Some("from-server"));
        assert!(conn.sent.lock().is_empty());
    }

    #[test]
    fn test_other_setter_is_forwarded() {
        let (session, conn) = session();
        source(&session)
            .setv([("name", Value::from("x"))], SetOptions::with_setter(Some("someone-else")))
            .unwrap();
        assert_eq!(conn.sent_types(), vec![MessageType::PatchDoc]);
    }

    #[test]
    fn test_non_serializable_change_ignored() {
        let (session, conn) = session();
        let shapes = Value::Dict(
            [("x".to_string(), Value::from(vec![Value::Int(3)]))]
                .into_iter()
                .collect(),
        );
        source(&session)
            .setv([("_shapes", shapes)], SetOptions::default())
            .unwrap();
        assert!(conn.sent.lock().is_empty());
    }

    #[test]
    fn test_unhandled_types_are_not_errors() {
        let (session, _conn) = session();
        session.handle(&Message::ok("r")).unwrap();
        session.handle(&Message::error("r", "nope")).unwrap();
        session.handle(&Message::ack()).unwrap();
        session
            .handle(&Message::create(MessageType::Other("X".into()), json!({}), json!({})))
            .unwrap();
    }

    #[test]
    fn test_bad_patch_is_an_error() {
        let (session, _conn) = session();
        let patch = Message::create(
            MessageType::PatchDoc,
            json!({}),
            json!({"references": [], "events": [{"kind": "Exploded"}]}),
        );
        assert!(session.handle(&patch).is_err());
    }

    #[test]
    fn test_send_event() {
        let (session, conn) = session();
        let event = ModelEvent::new("button_click", json!({"x": 1}));
        session.send_event(&event).unwrap();
        assert!(session.document().send_event(&event));

        let sent = conn.sent.lock();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.msgtype() == &MessageType::Event));
        assert_eq!(sent[0].content["event_name"], "button_click");
    }

    #[test]
    fn test_connection_closed_detaches() {
        let (session, conn) = session();
        session.connection_closed();
        assert!(!session.is_attached());
        source(&session).set("name", "offline").unwrap();
        assert!(conn.sent.lock().is_empty());
        assert_eq!(session.document().roots().len(), 1);
        assert!(!session.document().event_manager().has_sender());
    }

    #[tokio::test]
    async fn test_request_server_info() {
        let (session, conn) = session();
        let info = session.request_server_info().await.unwrap();
        assert_eq!(info["version_info"]["bokeh"], bokeh_core::VERSION);
        session.force_roundtrip().await.unwrap();
        assert_eq!(
            conn.sent_types(),
            vec![MessageType::ServerInfoReq, MessageType::ServerInfoReq]
        );
    }

    #[tokio::test]
    async fn test_run_until_channel_closes() {
        let (session, conn) = session();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Message::ok("r")).await.unwrap();
        drop(tx);
        session.run(rx).await;
        assert!(!session.is_attached());
        assert!(!*conn.closed.lock());
    }

    #[tokio::test]
    async fn test_run_closes_on_bad_patch() {
        let (session, conn) = session();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Message::create(
            MessageType::PatchDoc,
            json!({}),
            json!({"events": [{"kind": "Exploded"}]}),
        ))
        .await
        .unwrap();
        session.run(rx).await;
        assert!(*conn.closed.lock());
        assert!(!session.is_attached());
    }
}
