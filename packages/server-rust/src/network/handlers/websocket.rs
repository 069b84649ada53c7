//! WebSocket transport for socket listeners.
//!
//! `/ws` joins the root namespace and `/ws/<namespace>` any other. Frames
//! are JSON text. Inbound frames are `{"event", "id", "payload"}`; each is
//! answered with `{"ack": id, "data": ...}` or `{"ack": id, "error": ...}`.
//! Events run concurrently and their acknowledgments go through the
//! connection's outbound queue, so ordering between acks is not preserved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header::{self, HeaderMap};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use switchyard_core::{Credentials, DispatchError};
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};

use super::AppState;
use crate::network::{ConnectionHandle, ConnectionMetadata, OutboundMessage};
use crate::service::{Application, SocketSession};

#[derive(Debug, Deserialize)]
struct InboundEvent {
    event: String,
    #[serde(default)]
    id: Value,
    #[serde(default)]
    payload: Value,
}

/// Upgrade into the root namespace.
pub async fn ws_root_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, "/", &params, &headers, ws).await
}

/// Upgrade into the namespace named by the rest of the path.
pub async fn ws_namespace_handler(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, &namespace, &params, &headers, ws).await
}

async fn upgrade(
    state: AppState,
    namespace: &str,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let connected = match socket_credentials(headers, params) {
        Ok(credentials) => state.app.connect_socket(namespace, credentials).await,
        Err(err) => Err(state.app.surface(&format!("connect {namespace}"), err)),
    };

    ws.on_upgrade(move |socket| async move {
        match connected {
            Ok(session) => serve_socket(socket, session, state).await,
            Err(err) => refuse(socket, err).await,
        }
    })
}

/// The `Authorization` header, or the `authorization` query parameter for
/// clients that cannot set headers on an upgrade.
fn socket_credentials(
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Result<Option<Credentials>, DispatchError> {
    let raw = match headers.get(header::AUTHORIZATION) {
        Some(value) => Some(value.to_str().map_err(|_| {
            DispatchError::Unauthorized("Authorization header is malformed".to_string())
        })?),
        None => params.get("authorization").map(String::as_str),
    };
    raw.map(Credentials::parse).transpose()
}

/// Tell the client why its connection was refused, then close.
async fn refuse(mut socket: WebSocket, err: DispatchError) {
    let frame = json!({"error": err.public_message()});
    let _ = socket.send(Message::Text(frame.to_string().into())).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "connection refused".into(),
        })))
        .await;
}

async fn serve_socket(socket: WebSocket, session: SocketSession, state: AppState) {
    let metadata = ConnectionMetadata {
        session_id: session.id,
        namespace: Arc::from(session.namespace()),
        owner: session.auth().map(|auth| auth.owner.clone()),
    };
    let (handle, outbound) = state.registry.register(metadata, &state.config.connection);
    let span = tracing::debug_span!(
        "socket",
        connection = handle.id.0,
        session = %session.id,
        namespace = session.namespace()
    );
    let session = Arc::new(session);

    async {
        debug!("socket connected");
        let (sink, mut stream) = socket.split();
        let mut writer = tokio::spawn(write_loop(sink, outbound).in_current_span());
        let mut writer_done = false;

        loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                _ = &mut writer => {
                    writer_done = true;
                    None
                }
            };
            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(_))) => {
                    let err = DispatchError::bad_request("Binary frames are not supported");
                    let ack = json!({"ack": null, "error": err.public_message()});
                    queue(&handle, &ack, state.config.connection.send_timeout).await;
                    continue;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    debug!(error = %err, "socket read failed");
                    break;
                }
            };

            let guard = state.shutdown.in_flight_guard();
            let app = state.app.clone();
            let session = Arc::clone(&session);
            let handle = Arc::clone(&handle);
            let send_timeout = state.config.connection.send_timeout;
            tokio::spawn(
                async move {
                    let _guard = guard;
                    let ack = answer(&app, &session, text.as_str()).await;
                    queue(&handle, &ack, send_timeout).await;
                }
                .in_current_span(),
            );
        }

        state.registry.remove(handle.id);
        drop(handle);
        if !writer_done {
            let _ = writer.await;
        }
        debug!("socket disconnected");
    }
    .instrument(span)
    .await;
}

/// Run one inbound frame and build its acknowledgment.
async fn answer(app: &Application, session: &SocketSession, text: &str) -> Value {
    let event: InboundEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(err) => {
            let err = DispatchError::bad_request(format!("Invalid event frame: {err}"));
            let err = app.surface(&format!("{} frame", session.namespace()), err);
            return json!({"ack": null, "error": err.public_message()});
        }
    };
    match session.dispatch(&event.event, event.payload).await {
        Ok(data) => json!({"ack": event.id, "data": data}),
        Err(err) => json!({"ack": event.id, "error": err.public_message()}),
    }
}

async fn queue(handle: &ConnectionHandle, frame: &Value, timeout: Duration) {
    let message = OutboundMessage::Text(frame.to_string());
    if let Err(err) = handle.send_timeout(message, timeout).await {
        warn!(connection = handle.id.0, error = %err, "acknowledgment dropped");
    }
}

/// Forward queued frames to the wire until a close frame is sent, the peer
/// goes away, or every sender is dropped.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let (frame, last) = match message {
            OutboundMessage::Text(text) => (Message::Text(text.into()), false),
            OutboundMessage::Close(reason) => (
                Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: reason.unwrap_or_default().into(),
                })),
                true,
            ),
        };
        if sink.send(frame).await.is_err() || last {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use switchyard_core::{EndpointConfig, ExecutionContext, Handler, Inputs};

    use super::*;
    use crate::service::SocketListener;

    async fn echo(inputs: Inputs, _ctx: ExecutionContext) -> anyhow::Result<Value> {
        Ok(Value::Object(inputs))
    }

    async fn quiet(_inputs: Inputs, _ctx: ExecutionContext) -> anyhow::Result<Value> {
        Ok(json!({"dropped": true}))
    }

    async fn chat_session() -> (Application, SocketSession) {
        let mut listener = SocketListener::new();
        listener
            .on("message", Handler::action(echo))
            .on("typing", EndpointConfig::new(quiet));
        let app = Application::builder()
            .listen("/chat", listener)
            .unwrap()
            .build();
        let session = app.connect_socket("/chat", None).await.unwrap();
        (app, session)
    }

    #[tokio::test]
    async fn event_is_acknowledged_with_data() {
        let (app, session) = chat_session().await;

        let ack = answer(
            &app,
            &session,
            r#"{"event": "message", "id": 1, "payload": {"text": "hi"}}"#,
        )
        .await;

        assert_eq!(ack, json!({"ack": 1, "data": {"text": "hi"}}));
    }

    #[tokio::test]
    async fn event_without_response_acks_null() {
        let (app, session) = chat_session().await;
        let ack = answer(&app, &session, r#"{"event": "typing", "id": "t-1"}"#).await;
        assert_eq!(ack, json!({"ack": "t-1", "data": null}));
    }

    #[tokio::test]
    async fn unknown_event_acks_client_error() {
        let (app, session) = chat_session().await;

        let ack = answer(&app, &session, r#"{"event": "shout", "id": 2}"#).await;

        assert_eq!(
            ack,
            json!({"ack": 2, "error": "Event shout is not supported"})
        );
    }

    #[tokio::test]
    async fn invalid_frame_is_reported_and_acked_without_id() {
        let (app, session) = chat_session().await;
        let mut events = app.subscribe();

        let ack = answer(&app, &session, "not json").await;

        assert_eq!(ack["ack"], Value::Null);
        assert!(ack["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid event frame"));
        assert!(events.try_recv().is_ok());
    }

    #[test]
    fn credentials_prefer_header_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("token header"));
        let params = HashMap::from([("authorization".to_string(), "token query".to_string())]);

        let credentials = socket_credentials(&headers, &params).unwrap().unwrap();
        assert_eq!(credentials, Credentials::new("token", "header"));

        let credentials = socket_credentials(&HeaderMap::new(), &params).unwrap().unwrap();
        assert_eq!(credentials, Credentials::new("token", "query"));

        assert_eq!(socket_credentials(&HeaderMap::new(), &HashMap::new()).unwrap(), None);
    }

    #[test]
    fn malformed_credentials_are_unauthorized() {
        let params = HashMap::from([("authorization".to_string(), "token".to_string())]);
        let err = socket_credentials(&HeaderMap::new(), &params).unwrap_err();
        assert_eq!(err.status(), 401);
    }
}
