//! WebSocket front end: connection lifecycle and request dispatch.
//!
//! Each connection authenticates with a `hello` frame, then sends JSON
//! requests and receives responses interleaved with events for the board it
//! subscribed to. Requests on one connection are handled in arrival order;
//! when a request causes an event, the connection sees that event before the
//! request's response.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use taskboard_proto::error::{ErrorBody, ErrorKind};
use taskboard_proto::ids::{ConnectionId, UserId};
use taskboard_proto::wire::{self, ClientMessage, Outcome, ServerMessage};
use tokio::sync::mpsc;

use crate::activity::ActivityLog;
use crate::auth::StaticTokens;
use crate::config::ServerConfig;
use crate::registry::Outbox;
use crate::service::{Actor, KanbanService};
use crate::store::Store;

/// Default maximum allowed client frame size in bytes (64 KB).
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Shared server state: the board service plus transport limits.
pub struct ServerState {
    pub service: KanbanService,
    /// Maximum allowed client frame size in bytes.
    max_message_size: usize,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new(KanbanService::default())
    }
}

impl ServerState {
    /// Wraps a service with the default frame size limit.
    #[must_use]
    pub const fn new(service: KanbanService) -> Self {
        Self {
            service,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Wraps a service with a custom frame size limit.
    #[must_use]
    pub const fn with_config(service: KanbanService, max_message_size: usize) -> Self {
        Self {
            service,
            max_message_size,
        }
    }

    /// Builds the service and its collaborators from resolved configuration.
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        let service = KanbanService::new(
            Store::with_lock_timeout(config.lock_timeout),
            Arc::new(ActivityLog::with_history(config.activity_history)),
            Arc::new(StaticTokens::from_users(&config.users)),
        );
        Self::with_config(service, config.max_message_size)
    }
}

/// What the first frame of a connection amounted to.
enum Handshake {
    Token(String),
    Invalid(ErrorBody),
    Closed,
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Wait for a `hello` frame and authenticate its token.
/// 2. Register the connection and send `welcome`.
/// 3. Run a writer task draining the connection's outbox and a reader task
///    executing requests.
/// 4. On disconnect, detach the connection, updating presence.
pub async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let token = match wait_for_hello(&mut ws_receiver, state.max_message_size).await {
        Handshake::Token(token) => token,
        Handshake::Invalid(err) => {
            reject(&mut ws_sender, err).await;
            return;
        }
        Handshake::Closed => {
            tracing::warn!("connection closed before hello");
            return;
        }
    };
    let Some(user_id) = state.service.authenticate(&token) else {
        tracing::warn!("rejected connection with unknown token");
        reject(
            &mut ws_sender,
            ErrorBody::new(ErrorKind::Unauthenticated, "invalid token"),
        )
        .await;
        return;
    };

    let connection_id = ConnectionId::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state
        .service
        .attach(connection_id, user_id.clone(), tx.clone())
        .await;

    let welcome = ServerMessage::Welcome {
        user_id: user_id.clone(),
        connection_id,
    };
    if let Err(e) = send_server_msg(&mut ws_sender, &welcome).await {
        tracing::error!(connection_id = %connection_id, error = %e, "failed to send welcome");
        state.service.detach(connection_id).await;
        return;
    }

    tracing::info!(connection_id = %connection_id, user_id = %user_id, "connection authenticated");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = send_server_msg(&mut ws_sender, &msg).await {
                tracing::warn!(connection_id = %connection_id, error = %e, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text_message(&reader_state, connection_id, &user_id, text.as_str(), &tx)
                        .await;
                }
                Message::Binary(_) => {
                    let _ = tx.send(ServerMessage::Error(ErrorBody::new(
                        ErrorKind::InvalidInput,
                        "binary frames are not supported",
                    )));
                }
                Message::Close(_) => {
                    tracing::info!(connection_id = %connection_id, "received close frame");
                    break;
                }
                _ => {
                    // Ping/pong are answered by axum.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.service.detach(connection_id).await;
    tracing::info!(connection_id = %connection_id, "connection closed");
}

/// Waits for the first data frame, expecting `hello`.
async fn wait_for_hello(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    max_message_size: usize,
) -> Handshake {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                if text.len() > max_message_size {
                    return Handshake::Invalid(too_large(text.len(), max_message_size));
                }
                return match wire::decode_client(text.as_str()) {
                    Ok(ClientMessage::Hello { token }) => Handshake::Token(token),
                    Ok(ClientMessage::Request { .. }) => Handshake::Invalid(ErrorBody::new(
                        ErrorKind::Unauthenticated,
                        "expected hello before any request",
                    )),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to decode hello");
                        Handshake::Invalid(ErrorBody::new(
                            ErrorKind::Unauthenticated,
                            format!("malformed hello: {e}"),
                        ))
                    }
                };
            }
            Message::Binary(_) => {
                return Handshake::Invalid(ErrorBody::new(
                    ErrorKind::InvalidInput,
                    "binary frames are not supported",
                ));
            }
            Message::Close(_) => return Handshake::Closed,
            _ => {}
        }
    }
    Handshake::Closed
}

/// Handles one text frame from an authenticated connection.
async fn handle_text_message(
    state: &ServerState,
    connection_id: ConnectionId,
    user_id: &UserId,
    text: &str,
    outbox: &Outbox,
) {
    if text.len() > state.max_message_size {
        tracing::warn!(
            connection_id = %connection_id,
            size = text.len(),
            max = state.max_message_size,
            "frame exceeds size limit"
        );
        let _ = outbox.send(ServerMessage::Error(too_large(
            text.len(),
            state.max_message_size,
        )));
        return;
    }

    let (request_id, request) = match wire::decode_client(text) {
        Ok(ClientMessage::Request {
            request_id,
            request,
        }) => (request_id, request),
        Ok(ClientMessage::Hello { .. }) => {
            tracing::warn!(connection_id = %connection_id, "duplicate hello");
            let _ = outbox.send(ServerMessage::Error(ErrorBody::new(
                ErrorKind::InvalidInput,
                "connection is already authenticated",
            )));
            return;
        }
        Err(e) => {
            tracing::warn!(connection_id = %connection_id, error = %e, "failed to decode frame");
            let _ = outbox.send(ServerMessage::Error(ErrorBody::new(
                ErrorKind::InvalidInput,
                format!("malformed frame: {e}"),
            )));
            return;
        }
    };

    let op = request.op_name();
    let actor = Actor::on_connection(user_id.clone(), connection_id, request_id);
    let outcome = match state.service.execute(&actor, request).await {
        Ok(reply) => Outcome::Ok(reply),
        Err(e) => {
            tracing::debug!(
                connection_id = %connection_id,
                request_id = %request_id,
                op,
                error = %e,
                "request failed"
            );
            Outcome::Error(e.into())
        }
    };
    let _ = outbox.send(ServerMessage::Response {
        request_id,
        outcome,
    });
}

fn too_large(size: usize, max: usize) -> ErrorBody {
    ErrorBody::new(
        ErrorKind::InvalidInput,
        format!("message too large: {size} bytes (max {max})"),
    )
}

/// Sends an error frame followed by a close frame.
async fn reject(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    err: ErrorBody,
) {
    if let Err(e) = send_server_msg(ws_sender, &ServerMessage::Error(err)).await {
        tracing::debug!(error = %e, "failed to send rejection");
    }
    let _ = ws_sender.send(Message::Close(None)).await;
}

/// Encodes and sends a server message directly on a WebSocket sender.
async fn send_server_msg(
    ws_sender: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    msg: &ServerMessage,
) -> Result<(), String> {
    let text = wire::encode_server(msg).map_err(|e| e.to_string())?;
    ws_sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

/// Starts the board server on the given address with default state and
/// returns the bound address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(ServerState::default())).await
}

/// Starts the board server with a pre-configured [`ServerState`].
///
/// This is the entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ServerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "board server error");
        }
    });

    Ok((bound_addr, handle))
}

/// Starts the board server in-process for testing, with users `alice`,
/// `bob` and `carol` whose tokens are `t-<name>`.
#[cfg(test)]
pub async fn start_test_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let auth = StaticTokens::new([
        ("t-alice", "alice"),
        ("t-bob", "bob"),
        ("t-carol", "carol"),
    ]);
    let service = KanbanService::new(Store::new(), Arc::new(ActivityLog::new()), Arc::new(auth));
    start_server_with_state("127.0.0.1:0", Arc::new(ServerState::with_config(service, 4096)))
        .await
        .expect("failed to start test server")
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<ServerState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use taskboard_proto::event::EventEnvelope;
    use taskboard_proto::ids::{BoardId, RequestId};
    use taskboard_proto::model::{BoardView, NewTask};
    use taskboard_proto::wire::{Reply, Request};
    use tokio_tungstenite::tungstenite;

    use super::*;

    type Ws =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn connect_raw(addr: std::net::SocketAddr) -> Ws {
        let url = format!("ws://{addr}/ws");
        let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws
    }

    /// Helper: connect a WebSocket client to the test server and say hello.
    async fn connect_and_hello(addr: std::net::SocketAddr, user: &str) -> (Ws, ConnectionId) {
        let mut ws = connect_raw(addr).await;
        ws_send(&mut ws, &ClientMessage::Hello {
            token: format!("t-{user}"),
        })
        .await;
        match ws_recv(&mut ws).await {
            ServerMessage::Welcome {
                user_id,
                connection_id,
            } => {
                assert_eq!(user_id, UserId::new(user));
                (ws, connection_id)
            }
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    async fn ws_send(ws: &mut Ws, msg: &ClientMessage) {
        let text = wire::encode_client(msg).unwrap();
        ws.send(tungstenite::Message::Text(text.into())).await.unwrap();
    }

    async fn ws_recv(ws: &mut Ws) -> ServerMessage {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .unwrap();
        wire::decode_server(msg.to_text().unwrap()).unwrap()
    }

    async fn request(ws: &mut Ws, id: u64, request: Request) {
        ws_send(ws, &ClientMessage::Request {
            request_id: RequestId(id),
            request,
        })
        .await;
    }

    /// Skips events until the response to `id` arrives.
    async fn response(ws: &mut Ws, id: u64) -> Outcome {
        loop {
            match ws_recv(ws).await {
                ServerMessage::Response {
                    request_id,
                    outcome,
                } if request_id == RequestId(id) => return outcome,
                ServerMessage::Event(_) => {}
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    /// Skips frames until an event named `name` arrives.
    async fn event(ws: &mut Ws, name: &str) -> EventEnvelope {
        loop {
            if let ServerMessage::Event(envelope) = ws_recv(ws).await
                && envelope.event.name() == name
            {
                return envelope;
            }
        }
    }

    async fn create_board(ws: &mut Ws) -> BoardView {
        request(ws, 1, Request::CreateBoard {
            name: "Roadmap".into(),
            background: None,
        })
        .await;
        match response(ws, 1).await {
            Outcome::Ok(Reply::Board(view)) => view,
            other => panic!("expected board, got {other:?}"),
        }
    }

    async fn subscribe(ws: &mut Ws, id: u64, board_id: BoardId) -> BoardView {
        request(ws, id, Request::Subscribe { board_id }).await;
        match response(ws, id).await {
            Outcome::Ok(Reply::Board(view)) => view,
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hello_with_valid_token_is_welcomed() {
        let (addr, _handle) = start_test_server().await;
        let (_ws, _id) = connect_and_hello(addr, "alice").await;
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let (addr, _handle) = start_test_server().await;
        let mut ws = connect_raw(addr).await;
        ws_send(&mut ws, &ClientMessage::Hello {
            token: "forged".into(),
        })
        .await;

        match ws_recv(&mut ws).await {
            ServerMessage::Error(err) => assert_eq!(err.kind, ErrorKind::Unauthenticated),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_before_hello_is_rejected() {
        let (addr, _handle) = start_test_server().await;
        let mut ws = connect_raw(addr).await;
        request(&mut ws, 1, Request::Viewers {
            board_id: BoardId::new(),
        })
        .await;

        match ws_recv(&mut ws).await {
            ServerMessage::Error(err) => assert_eq!(err.kind, ErrorKind::Unauthenticated),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_and_oversized_frames_get_errors() {
        let (addr, _handle) = start_test_server().await;
        let (mut ws, _) = connect_and_hello(addr, "alice").await;

        ws.send(tungstenite::Message::Text("{not json".into()))
            .await
            .unwrap();
        match ws_recv(&mut ws).await {
            ServerMessage::Error(err) => assert_eq!(err.kind, ErrorKind::InvalidInput),
            other => panic!("expected error, got {other:?}"),
        }

        request(&mut ws, 2, Request::CreateBoard {
            name: "x".repeat(8192),
            background: None,
        })
        .await;
        match ws_recv(&mut ws).await {
            ServerMessage::Error(err) => {
                assert_eq!(err.kind, ErrorKind::InvalidInput);
                assert!(err.message.contains("too large"));
            }
            other => panic!("expected error, got {other:?}"),
        }

        // The connection survives both.
        let view = create_board(&mut ws).await;
        assert_eq!(view.lists.len(), 3);
    }

    #[tokio::test]
    async fn failed_request_gets_error_outcome() {
        let (addr, _handle) = start_test_server().await;
        let (mut ws, _) = connect_and_hello(addr, "alice").await;

        request(&mut ws, 5, Request::GetBoard {
            board_id: BoardId::new(),
        })
        .await;
        match response(&mut ws, 5).await {
            Outcome::Error(err) => assert_eq!(err.kind, ErrorKind::NotFound),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn originator_sees_event_before_response() {
        let (addr, _handle) = start_test_server().await;
        let (mut ws, connection_id) = connect_and_hello(addr, "alice").await;
        let view = create_board(&mut ws).await;
        subscribe(&mut ws, 2, view.board.id).await;

        request(&mut ws, 3, Request::CreateTask {
            list_id: view.lists[0].id(),
            task: NewTask::titled("Ship"),
        })
        .await;

        let envelope = event(&mut ws, "task:create").await;
        let origin = envelope.origin.unwrap();
        assert_eq!(origin.connection_id, connection_id);
        assert_eq!(origin.request_id, RequestId(3));
        match response(&mut ws, 3).await {
            Outcome::Ok(Reply::Task(task)) => assert_eq!(task.task.title, "Ship"),
            other => panic!("expected task, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_viewers_receive_events_and_presence() {
        let (addr, _handle) = start_test_server().await;
        let (mut alice, _) = connect_and_hello(addr, "alice").await;
        let (mut bob, _) = connect_and_hello(addr, "bob").await;
        let view = create_board(&mut alice).await;

        request(&mut alice, 2, Request::AddMember {
            board_id: view.board.id,
            user_id: UserId::new("bob"),
        })
        .await;
        assert!(matches!(response(&mut alice, 2).await, Outcome::Ok(Reply::Member(_))));

        subscribe(&mut alice, 3, view.board.id).await;
        let snapshot = subscribe(&mut bob, 1, view.board.id).await;
        assert_eq!(
            snapshot.viewers,
            vec![UserId::new("alice"), UserId::new("bob")]
        );

        let presence = event(&mut alice, "presence:update").await;
        assert!(presence.origin.is_none());

        request(&mut alice, 4, Request::CreateList {
            board_id: view.board.id,
            name: "Backlog".into(),
        })
        .await;
        let created = event(&mut bob, "list:create").await;
        assert_eq!(created.revision, snapshot.revision + 1);
    }

    #[tokio::test]
    async fn disconnect_updates_presence() {
        let (addr, _handle) = start_test_server().await;
        let (mut alice, _) = connect_and_hello(addr, "alice").await;
        let (mut bob, _) = connect_and_hello(addr, "bob").await;
        let view = create_board(&mut alice).await;
        request(&mut alice, 2, Request::AddMember {
            board_id: view.board.id,
            user_id: UserId::new("bob"),
        })
        .await;
        response(&mut alice, 2).await;
        subscribe(&mut alice, 3, view.board.id).await;
        subscribe(&mut bob, 1, view.board.id).await;

        bob.close(None).await.unwrap();

        loop {
            let envelope = event(&mut alice, "presence:update").await;
            if let taskboard_proto::event::BoardEvent::PresenceChanged { viewers } = envelope.event
                && viewers == vec![UserId::new("alice")]
            {
                break;
            }
        }
    }
}
