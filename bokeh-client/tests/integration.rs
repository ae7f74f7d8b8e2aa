//! End-to-end tests against an in-process websocket server.
//!
//! The test server speaks just enough of the protocol: it sends `ACK` on
//! connect, answers `PULL-DOC-REQ` and `SERVER-INFO-REQ`, acknowledges
//! `PATCH-DOC` with `OK`, and forwards every message it receives to the
//! test through a channel.

use std::sync::Arc;

use bokeh_client::{
    pull_session, ClientConfig, Connection, ConnectionState, Fragment, Message, MessageType,
    ProtocolError, Receiver, WebSocketConnection,
};
use bokeh_core::{DocJson, Document, ModelRegistry, Patch};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// What the test server does once a client is connected.
#[derive(Clone)]
struct ServerScript {
    doc: DocJson,
    /// Push this patch to the client right after the pull reply.
    push_after_pull: Option<Patch>,
    send_ack: bool,
}

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn frames(message: &Message) -> Vec<WsMessage> {
    message
        .fragments()
        .unwrap()
        .into_iter()
        .map(|f| match f {
            Fragment::Text(t) => WsMessage::Text(t.into()),
            Fragment::Binary(b) => WsMessage::Binary(b.into()),
        })
        .collect()
}

/// Start a server on a free port. Returns the port and the channel of
/// messages the server received.
async fn start_test_server(script: ServerScript) -> (u16, mpsc::UnboundedReceiver<Message>) {
    let port = free_port().await;
    let listener = TcpListener::bind(format!("127.0.0.1:{port}")).await.unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let script = script.clone();
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let (mut writer, mut reader) = ws.split();
                if script.send_ack {
                    for frame in frames(&Message::ack()) {
                        writer.send(frame).await.unwrap();
                    }
                }

                let mut receiver = Receiver::new();
                while let Some(Ok(frame)) = reader.next().await {
                    let fragment = match frame {
                        WsMessage::Text(t) => Fragment::Text(t.as_str().to_owned()),
                        WsMessage::Binary(b) => Fragment::Binary(b.to_vec()),
                        WsMessage::Close(_) => break,
                        _ => continue,
                    };
                    let Some(message) = receiver.consume(fragment).unwrap() else {
                        continue;
                    };

                    let mut replies = Vec::new();
                    match message.msgtype() {
                        MessageType::PullDocReq => {
                            let reply = Message::pull_doc_reply(message.msgid(), &script.doc);
                            replies.push(reply.unwrap());
                            if let Some(patch) = &script.push_after_pull {
                                replies.push(Message::patch_doc(patch, Vec::new()).unwrap());
                            }
                        }
                        MessageType::ServerInfoReq => {
                            replies.push(Message::server_info_reply(message.msgid()));
                        }
                        MessageType::PatchDoc | MessageType::Event => {
                            replies.push(Message::ok(message.msgid()));
                        }
                        _ => {}
                    }
                    let _ = seen_tx.send(message);
                    for reply in replies {
                        for frame in frames(&reply) {
                            if writer.send(frame).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, seen_rx)
}

fn server_document() -> DocJson {
    let registry = Arc::new(ModelRegistry::with_builtins());
    let doc = Document::new(registry.clone());
    let source = registry.create("ColumnDataSource").unwrap();
    source.set("name", "source").unwrap();
    doc.add_root(&source).unwrap();
    doc.set_title("Served");
    doc.to_json(true).unwrap()
}

fn script() -> ServerScript {
    ServerScript {
        doc: server_document(),
        push_after_pull: None,
        send_ack: true,
    }
}

fn config(port: u16) -> ClientConfig {
    ClientConfig {
        url: format!("ws://127.0.0.1:{port}/ws"),
        reply_timeout_secs: 2,
        ..ClientConfig::default()
    }
}

/// Wait until the server has received a message of type `msgtype`.
async fn next_seen(seen: &mut mpsc::UnboundedReceiver<Message>, msgtype: MessageType) -> Message {
    loop {
        let message = timeout(Duration::from_secs(2), seen.recv())
            .await
            .expect("server should receive a message within timeout")
            .expect("server channel closed");
        if message.msgtype() == &msgtype {
            return message;
        }
    }
}

#[tokio::test]
async fn test_connect_waits_for_ack() {
    let (port, _seen) = start_test_server(script()).await;
    let connection = WebSocketConnection::connect(&config(port)).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(!connection.session_id().is_empty());
}

#[tokio::test]
async fn test_connect_without_ack_times_out() {
    let (port, _seen) = start_test_server(ServerScript {
        send_ack: false,
        ..script()
    })
    .await;
    let mut config = config(port);
    config.reply_timeout_secs = 1;
    let result = WebSocketConnection::connect(&config).await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));
}

#[tokio::test]
async fn test_pull_session_loads_document() {
    let (port, mut seen) = start_test_server(script()).await;
    let registry = Arc::new(ModelRegistry::with_builtins());
    let (session, _messages) = pull_session(&config(port), registry).await.unwrap();

    next_seen(&mut seen, MessageType::PullDocReq).await;
    let document = session.document();
    assert_eq!(document.title(), "Served");
    assert_eq!(document.roots().len(), 1);
    assert!(document.get_model_by_name("source").unwrap().is_some());
}

#[tokio::test]
async fn test_local_change_reaches_server() {
    let (port, mut seen) = start_test_server(script()).await;
    let registry = Arc::new(ModelRegistry::with_builtins());
    let (session, _messages) = pull_session(&config(port), registry).await.unwrap();

    let source = session.document().roots()[0].clone();
    source.set("name", "edited").unwrap();

    let patch = next_seen(&mut seen, MessageType::PatchDoc).await;
    let event = &patch.content["events"][0];
    assert_eq!(event["kind"], "ModelChanged");
    assert_eq!(event["attr"], "name");
    assert_eq!(event["new"], "edited");
    assert_eq!(event["model"]["id"], source.id().as_str());
}

#[tokio::test]
async fn test_server_patch_is_applied_without_echo() {
    let doc = server_document();
    let source_id = doc.roots.root_ids[0].clone();
    let patch = Patch::from_json(&json!({
        "references": [],
        "events": [{
            "kind": "ModelChanged",
            "model": {"id": source_id.as_str(), "type": "ColumnDataSource"},
            "attr": "name",
            "new": "from-server",
        }],
    }))
    .unwrap();
    let (port, mut seen) = start_test_server(ServerScript {
        doc,
        push_after_pull: Some(patch),
        send_ack: true,
    })
    .await;

    let registry = Arc::new(ModelRegistry::with_builtins());
    let (session, messages) = pull_session(&config(port), registry).await.unwrap();
    let session = Arc::new(session);
    let runner = session.clone();
    let run = tokio::spawn(async move { runner.run(messages).await });

    session.force_roundtrip().await.unwrap();
    let source = session.document().get_model_by_id(source_id.as_str()).unwrap();
    timeout(Duration::from_secs(2), async {
        while source.name().as_deref() != Some("from-server") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server patch should be applied");

    session.connection().close();
    timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
    assert!(!session.is_attached());

    while let Ok(message) = seen.try_recv() {
        assert_ne!(message.msgtype(), &MessageType::PatchDoc, "patch was echoed");
    }
}

#[tokio::test]
async fn test_request_server_info() {
    let (port, _seen) = start_test_server(script()).await;
    let registry = Arc::new(ModelRegistry::with_builtins());
    let (session, _messages) = pull_session(&config(port), registry).await.unwrap();

    let info = session.request_server_info().await.unwrap();
    assert_eq!(info["version_info"]["bokeh"], bokeh_core::VERSION);
}

#[tokio::test]
async fn test_send_event_reaches_server() {
    let (port, mut seen) = start_test_server(script()).await;
    let registry = Arc::new(ModelRegistry::with_builtins());
    let (session, _messages) = pull_session(&config(port), registry).await.unwrap();

    let event = bokeh_core::ModelEvent::new("button_click", json!({}));
    session.send_event(&event).unwrap();

    let message = next_seen(&mut seen, MessageType::Event).await;
    assert_eq!(message.content["event_name"], "button_click");
}

#[tokio::test]
async fn test_send_after_close_fails() {
    let (port, _seen) = start_test_server(script()).await;
    let connection = WebSocketConnection::connect(&config(port)).await.unwrap();
    connection.close();
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(matches!(
        connection.send(Message::server_info_req()),
        Err(ProtocolError::ConnectionClosed)
    ));
}
