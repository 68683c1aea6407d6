//! WebSocket connection to a board server.
//!
//! [`BoardClient::connect`] opens the socket, authenticates with a `hello`
//! frame and spawns a background reader. Responses are routed back to the
//! caller that sent the request by request id; board events are queued for
//! [`BoardClient::next_event`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use taskboard_proto::error::ErrorBody;
use taskboard_proto::event::EventEnvelope;
use taskboard_proto::ids::{BoardId, ConnectionId, ListId, RequestId, TaskId, UserId};
use taskboard_proto::model::{Board, BoardView, Comment, ListView, Member, NewTask, TaskView};
use taskboard_proto::wire::{self, ClientMessage, Outcome, Reply, Request, ServerMessage, WireError};

type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

type PendingReplies = Arc<parking_lot::Mutex<HashMap<RequestId, oneshot::Sender<Outcome>>>>;

/// Timeout for the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the server's `welcome` after sending `hello`.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a response to a single request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by [`BoardClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("timed out waiting for the server")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection closed")]
    Closed,

    /// The server refused the `hello`.
    #[error("authentication rejected: {0}")]
    Rejected(ErrorBody),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered the request with an error.
    #[error("request failed: {0}")]
    Request(ErrorBody),
}

/// An authenticated connection to a board server.
pub struct BoardClient {
    user_id: UserId,
    connection_id: ConnectionId,
    ws_sender: Arc<Mutex<WsSender>>,
    pending: PendingReplies,
    next_request: AtomicU64,
    events: Mutex<mpsc::UnboundedReceiver<EventEnvelope>>,
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl BoardClient {
    /// Connects to `url` (e.g. `ws://127.0.0.1:9100/ws`) and authenticates
    /// with `token`.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Timeout`] if the socket or the handshake times out.
    /// - [`ClientError::Connect`] if the server cannot be reached.
    /// - [`ClientError::Rejected`] if the token is not accepted.
    pub async fn connect(url: &str, token: &str) -> Result<Self, ClientError> {
        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "board server connect timed out");
                ClientError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "board server connect failed");
                ClientError::Connect(e.to_string())
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let hello = wire::encode_client(&ClientMessage::Hello {
            token: token.to_string(),
        })?;
        ws_sender
            .send(Message::Text(hello.into()))
            .await
            .map_err(|e| ClientError::Connect(format!("failed to send hello: {e}")))?;

        let (user_id, connection_id) = wait_for_welcome(&mut ws_reader).await?;
        tracing::info!(user_id = %user_id, connection_id = %connection_id, url, "connected to board server");

        let pending: PendingReplies = Arc::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(
            ws_reader,
            Arc::clone(&pending),
            tx,
            Arc::clone(&connected),
        ));

        Ok(Self {
            user_id,
            connection_id,
            ws_sender: Arc::new(Mutex::new(ws_sender)),
            pending,
            next_request: AtomicU64::new(1),
            events: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }

    /// The authenticated user.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Server-assigned id of this connection, as it appears in event
    /// origins.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Reserves a request id, for callers that need it before sending
    /// (optimistic moves).
    pub fn allocate_request_id(&self) -> RequestId {
        RequestId(self.next_request.fetch_add(1, Ordering::Relaxed))
    }

    /// Sends `request` under `request_id` and waits for its outcome.
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] if the connection is gone and
    /// [`ClientError::Timeout`] if no response arrives in time. A server-side
    /// failure is not an error here; it is returned as [`Outcome::Error`].
    pub async fn send(&self, request_id: RequestId, request: Request) -> Result<Outcome, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Closed);
        }
        let op = request.op_name();
        let text = wire::encode_client(&ClientMessage::Request {
            request_id,
            request,
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        let sent = self
            .ws_sender
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await;
        if let Err(e) = sent {
            tracing::warn!(err = %e, op, "request send failed");
            self.pending.lock().remove(&request_id);
            self.connected.store(false, Ordering::Relaxed);
            return Err(ClientError::Closed);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                tracing::warn!(request_id = %request_id, op, "request timed out");
                Err(ClientError::Timeout)
            }
        }
    }

    /// Sends `request` and returns its reply.
    ///
    /// # Errors
    ///
    /// As [`Self::send`], plus [`ClientError::Request`] when the server
    /// rejects the request.
    pub async fn request(&self, request: Request) -> Result<Reply, ClientError> {
        match self.send(self.allocate_request_id(), request).await? {
            Outcome::Ok(reply) => Ok(reply),
            Outcome::Error(err) => Err(ClientError::Request(err)),
        }
    }

    /// Waits for the next event on the subscribed board. Returns `None` once
    /// the connection is closed and every queued event has been taken.
    pub async fn next_event(&self) -> Option<EventEnvelope> {
        self.events.lock().await.recv().await
    }

    /// Subscribes to a board and returns its snapshot. Events after the
    /// snapshot's revision follow on [`Self::next_event`].
    ///
    /// # Errors
    ///
    /// See [`Self::request`].
    pub async fn subscribe(&self, board_id: BoardId) -> Result<BoardView, ClientError> {
        match self.request(Request::Subscribe { board_id }).await? {
            Reply::Board(view) => Ok(view),
            other => Err(unexpected(&other)),
        }
    }

    /// # Errors
    ///
    /// See [`Self::request`].
    pub async fn get_board(&self, board_id: BoardId) -> Result<BoardView, ClientError> {
        match self.request(Request::GetBoard { board_id }).await? {
            Reply::Board(view) => Ok(view),
            other => Err(unexpected(&other)),
        }
    }

    /// # Errors
    ///
    /// See [`Self::request`].
    pub async fn create_board(&self, name: &str) -> Result<BoardView, ClientError> {
        let request = Request::CreateBoard {
            name: name.to_string(),
            background: None,
        };
        match self.request(request).await? {
            Reply::Board(view) => Ok(view),
            other => Err(unexpected(&other)),
        }
    }

    /// # Errors
    ///
    /// See [`Self::request`].
    pub async fn add_member(&self, board_id: BoardId, user_id: UserId) -> Result<Member, ClientError> {
        match self.request(Request::AddMember { board_id, user_id }).await? {
            Reply::Member(member) => Ok(member),
            other => Err(unexpected(&other)),
        }
    }

    /// # Errors
    ///
    /// See [`Self::request`].
    pub async fn create_list(&self, board_id: BoardId, name: &str) -> Result<ListView, ClientError> {
        let request = Request::CreateList {
            board_id,
            name: name.to_string(),
        };
        match self.request(request).await? {
            Reply::List(list) => Ok(list),
            other => Err(unexpected(&other)),
        }
    }

    /// # Errors
    ///
    /// See [`Self::request`].
    pub async fn create_task(&self, list_id: ListId, task: NewTask) -> Result<TaskView, ClientError> {
        match self.request(Request::CreateTask { list_id, task }).await? {
            Reply::Task(task) => Ok(task),
            other => Err(unexpected(&other)),
        }
    }

    /// # Errors
    ///
    /// See [`Self::request`].
    pub async fn move_task(
        &self,
        task_id: TaskId,
        source_list_id: ListId,
        target_list_id: ListId,
        target_index: i64,
    ) -> Result<TaskView, ClientError> {
        let request = Request::MoveTask {
            task_id,
            source_list_id,
            target_list_id,
            target_index,
        };
        match self.request(request).await? {
            Reply::Task(task) => Ok(task),
            other => Err(unexpected(&other)),
        }
    }

    /// Live boards the user belongs to whose name contains `query`.
    ///
    /// # Errors
    ///
    /// See [`Self::request`].
    pub async fn list_boards(&self, query: Option<&str>) -> Result<Vec<Board>, ClientError> {
        let request = Request::ListBoards {
            archived: false,
            query: query.map(str::to_string),
        };
        match self.request(request).await? {
            Reply::Boards(boards) => Ok(boards),
            other => Err(unexpected(&other)),
        }
    }

    /// # Errors
    ///
    /// See [`Self::request`].
    pub async fn add_comment(&self, task_id: TaskId, body: &str) -> Result<Comment, ClientError> {
        let request = Request::AddComment {
            task_id,
            body: body.to_string(),
        };
        match self.request(request).await? {
            Reply::Comment(comment) => Ok(comment),
            other => Err(unexpected(&other)),
        }
    }

    /// Closes the connection. Pending requests fail with
    /// [`ClientError::Closed`].
    pub async fn close(&self) {
        if let Err(e) = self.ws_sender.lock().await.send(Message::Close(None)).await {
            tracing::debug!(err = %e, "close frame not sent");
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Drop for BoardClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

fn unexpected(reply: &Reply) -> ClientError {
    ClientError::Protocol(format!("unexpected reply: {reply:?}"))
}

async fn wait_for_welcome(ws_reader: &mut WsReader) -> Result<(UserId, ConnectionId), ClientError> {
    let frame = tokio::time::timeout(HELLO_TIMEOUT, ws_reader.next())
        .await
        .map_err(|_| {
            tracing::warn!("welcome timed out");
            ClientError::Timeout
        })?;

    match frame {
        Some(Ok(Message::Text(text))) => match wire::decode_server(text.as_str())? {
            ServerMessage::Welcome {
                user_id,
                connection_id,
            } => Ok((user_id, connection_id)),
            ServerMessage::Error(err) => {
                tracing::warn!(kind = %err.kind, "hello rejected");
                Err(ClientError::Rejected(err))
            }
            other => Err(ClientError::Protocol(format!(
                "expected welcome, got {other:?}"
            ))),
        },
        Some(Ok(Message::Close(_))) | None => Err(ClientError::Closed),
        Some(Ok(_)) => Err(ClientError::Protocol(
            "unexpected non-text frame during handshake".into(),
        )),
        Some(Err(e)) => Err(ClientError::Connect(e.to_string())),
    }
}

/// Reads server frames until the socket closes, routing responses to their
/// waiters and events to the event queue. Undecodable frames are logged and
/// skipped.
async fn reader_loop(
    mut ws_reader: WsReader,
    pending: PendingReplies,
    events: mpsc::UnboundedSender<EventEnvelope>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match wire::decode_server(text.as_str()) {
                Ok(ServerMessage::Response {
                    request_id,
                    outcome,
                }) => {
                    let waiter = pending.lock().remove(&request_id);
                    match waiter {
                        Some(tx) => {
                            // The caller may have timed out and gone away.
                            let _ = tx.send(outcome);
                        }
                        None => tracing::debug!(request_id = %request_id, "response for unknown request"),
                    }
                }
                Ok(ServerMessage::Event(envelope)) => {
                    if events.send(envelope).is_err() {
                        break;
                    }
                }
                Ok(ServerMessage::Error(err)) => {
                    tracing::warn!(kind = %err.kind, message = %err.message, "server error");
                }
                Ok(ServerMessage::Welcome { .. }) => {
                    tracing::debug!("duplicate welcome ignored");
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed server frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("board server closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "board server read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    // Dropping the waiters wakes every in-flight request with `Closed`.
    pending.lock().clear();
    tracing::info!("board reader task exiting");
}
