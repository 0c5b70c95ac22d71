//! One logical WebSocket connection per agent session.
//!
//! A single actor task owns the socket, the pending-command table, the
//! command counter and every timer. [`ConnectionHandle`]s talk to it through
//! an unbounded mailbox; push events come back on one channel in the order
//! the server sent them.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use agent_convo::protocol::{self, AgentCommand, CommandFrame, ServerEvent};

use crate::backoff::ReconnectPolicy;
use crate::error::{ApiError, CommandError};

/// Delivered once when the reconnect ceiling is reached.
pub const FATAL_CONNECTION_LOST: &str = "Connection lost. Maximum reconnection attempts reached.";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
pub type CommandResult = Result<Value, CommandError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// Waiting for, or performing, reconnect attempt `attempt` (one-based)
    Reconnecting { attempt: u32 },
    /// Closed by the user. Terminal.
    Closed,
    /// Reconnect ceiling reached. Terminal.
    GaveUp,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::GaveUp)
    }
}

/// What the consumer of a connection sees, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Event(ServerEvent),
    /// A pushed `{"type": "error"}` frame or an undecodable frame
    Error(String),
    ConnectionChanged { connected: bool },
    Fatal(String),
}

enum Request {
    Run {
        command: String,
        args: Map<String, Value>,
        timeout: Duration,
        respond_to: oneshot::Sender<CommandResult>,
    },
    Expire {
        command_id: u64,
    },
    Close,
}

struct Pending {
    command: String,
    respond_to: oneshot::Sender<CommandResult>,
    timer: Option<JoinHandle<()>>,
}

impl Pending {
    fn settle(self, result: CommandResult) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        let _ = self.respond_to.send(result);
    }
}

/// Resolves exactly once with the server's response frame or the reason
/// there will be none.
#[must_use = "a command's outcome is only observable by awaiting it"]
pub struct PendingCommand {
    rx: oneshot::Receiver<CommandResult>,
}

impl Future for PendingCommand {
    type Output = CommandResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| match result {
            Ok(outcome) => outcome,
            Err(_) => Err(CommandError::Closed),
        })
    }
}

/// Handle to communicate with a connection actor
#[derive(Clone)]
pub struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    closed_by_user: Arc<AtomicBool>,
    default_timeout: Duration,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        !self.closed_by_user.load(Ordering::SeqCst) && self.state() == ConnectionState::Open
    }

    /// Timeout used by [`ConnectionHandle::run`] callers that have no better idea.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Wait until the connection is open or has terminally stopped.
    pub async fn wait_open(&self) -> Result<(), CommandError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s == ConnectionState::Open || s.is_terminal())
            .await
            .map(|s| *s);
        match reached {
            Ok(ConnectionState::Open) => Ok(()),
            _ => Err(CommandError::Closed),
        }
    }

    /// Send `{command, command_id, ...args}`. Fails immediately unless the
    /// connection is open. A zero `timeout` waits for the response forever.
    pub fn run_command(
        &self,
        command: &str,
        args: Map<String, Value>,
        timeout: Duration,
    ) -> Result<PendingCommand, CommandError> {
        if !self.is_open() {
            return Err(CommandError::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Request::Run {
                command: command.to_string(),
                args,
                timeout,
                respond_to: tx,
            })
            .map_err(|_| CommandError::NotConnected)?;
        Ok(PendingCommand { rx })
    }

    pub fn run(
        &self,
        command: AgentCommand,
        timeout: Duration,
    ) -> Result<PendingCommand, CommandError> {
        let (name, args) = command
            .into_parts()
            .map_err(|e| CommandError::Encode(e.to_string()))?;
        self.run_command(&name, args, timeout)
    }

    /// Close for good. Pending commands resolve to [`CommandError::Closed`]
    /// and no further events are delivered.
    pub fn close(&self) {
        self.closed_by_user.store(true, Ordering::SeqCst);
        let _ = self.sender.send(Request::Close);
    }
}

/// Spawn the connection actor for `url`. Must be called inside a tokio runtime.
///
/// The actor stops when it is closed, when the reconnect ceiling is reached,
/// or when every handle has been dropped.
pub fn connect(
    url: impl Into<String>,
    policy: ReconnectPolicy,
    default_timeout: Duration,
) -> (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let (mailbox_tx, mailbox) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
    let closed_by_user = Arc::new(AtomicBool::new(false));

    let actor = ConnectionActor {
        url: url.into(),
        policy,
        mailbox,
        timer_mailbox: mailbox_tx.downgrade(),
        events: events_tx,
        state: state_tx,
        closed_by_user: closed_by_user.clone(),
        pending: HashMap::new(),
        command_counter: 0,
        attempt: 0,
    };
    tokio::spawn(actor.run());

    let handle = ConnectionHandle {
        sender: mailbox_tx,
        state: state_rx,
        closed_by_user,
        default_timeout,
    };
    (handle, events_rx)
}

enum Connect {
    Open(WsStream),
    Failed,
    UserClosed,
}

enum SessionEnd {
    Lost,
    UserClosed,
}

struct ConnectionActor {
    url: String,
    policy: ReconnectPolicy,
    mailbox: mpsc::UnboundedReceiver<Request>,
    /// Weak so that timers never keep the actor alive
    timer_mailbox: mpsc::WeakUnboundedSender<Request>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    closed_by_user: Arc<AtomicBool>,
    pending: HashMap<u64, Pending>,
    command_counter: u64,
    attempt: u32,
}

impl ConnectionActor {
    async fn run(mut self) {
        loop {
            self.set_state(if self.attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting {
                    attempt: self.attempt,
                }
            });

            match self.open().await {
                Connect::Open(ws) => {
                    self.attempt = 0;
                    self.set_state(ConnectionState::Open);
                    info!(url = %self.url, "websocket connected");
                    self.emit(ConnectionEvent::ConnectionChanged { connected: true });

                    match self.session(ws).await {
                        SessionEnd::UserClosed => break,
                        SessionEnd::Lost => {
                            if self.user_closed() {
                                break;
                            }
                            self.reject_all(CommandError::Disconnected);
                            warn!(url = %self.url, "websocket connection lost");
                            self.emit(ConnectionEvent::ConnectionChanged { connected: false });
                        }
                    }
                }
                Connect::Failed => {}
                Connect::UserClosed => break,
            }

            if self.user_closed() {
                break;
            }
            if self.attempt >= self.policy.max_attempts {
                error!(
                    url = %self.url,
                    attempts = self.attempt,
                    "giving up on websocket connection"
                );
                self.set_state(ConnectionState::GaveUp);
                self.reject_all(CommandError::Disconnected);
                self.emit(ConnectionEvent::Fatal(FATAL_CONNECTION_LOST.to_string()));
                return;
            }

            let delay = self.policy.delay(self.attempt);
            self.attempt += 1;
            self.set_state(ConnectionState::Reconnecting {
                attempt: self.attempt,
            });
            info!(
                attempt = self.attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            if !self.backoff(delay).await {
                break;
            }
        }

        self.reject_all(CommandError::Closed);
        self.set_state(ConnectionState::Closed);
        debug!(url = %self.url, "connection actor stopped");
    }

    fn user_closed(&self) -> bool {
        self.closed_by_user.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    async fn open(&mut self) -> Connect {
        let connecting = tokio_tungstenite::connect_async(self.url.clone());
        tokio::pin!(connecting);

        loop {
            tokio::select! {
                result = &mut connecting => {
                    return match result {
                        Ok((ws, _)) => Connect::Open(ws),
                        Err(e) => {
                            match ApiError::from_tungstenite(e) {
                                ApiError::Unavailable => {
                                    debug!(url = %self.url, "server unavailable");
                                }
                                other => warn!(url = %self.url, error = %other, "websocket connect failed"),
                            }
                            Connect::Failed
                        }
                    };
                }
                request = self.mailbox.recv() => {
                    if !self.handle_offline(request) {
                        return Connect::UserClosed;
                    }
                }
            }
        }
    }

    /// Sleep before the next attempt. Returns false if closed meanwhile.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return true,
                request = self.mailbox.recv() => {
                    if !self.handle_offline(request) {
                        return false;
                    }
                }
            }
        }
    }

    /// Mailbox handling while no socket is open. Returns false on close.
    fn handle_offline(&mut self, request: Option<Request>) -> bool {
        match request {
            Some(Request::Run { respond_to, .. }) => {
                let _ = respond_to.send(Err(CommandError::NotConnected));
                true
            }
            Some(Request::Expire { command_id }) => {
                self.expire(command_id);
                true
            }
            Some(Request::Close) | None => false,
        }
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "server closed websocket");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        return SessionEnd::Lost;
                    }
                    None => return SessionEnd::Lost,
                },
                request = self.mailbox.recv() => match request {
                    Some(Request::Run { command, args, timeout, respond_to }) => {
                        if !self.send_command(&mut write, command, args, timeout, respond_to).await {
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Request::Expire { command_id }) => self.expire(command_id),
                    Some(Request::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        let _ = write.close().await;
                        return SessionEnd::UserClosed;
                    }
                },
            }
        }
    }

    /// Returns false when the socket can no longer be written.
    async fn send_command(
        &mut self,
        write: &mut WsSink,
        command: String,
        args: Map<String, Value>,
        timeout: Duration,
        respond_to: oneshot::Sender<CommandResult>,
    ) -> bool {
        self.command_counter += 1;
        let command_id = self.command_counter;

        let frame = CommandFrame {
            command: command.clone(),
            command_id,
            args,
        };
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                let _ = respond_to.send(Err(CommandError::Encode(e.to_string())));
                return true;
            }
        };

        debug!(command_id, command = %command, "sending command");
        if let Err(e) = write.send(Message::Text(json.into())).await {
            warn!(command_id, error = %e, "failed to send command");
            let _ = respond_to.send(Err(CommandError::Transport(e.to_string())));
            return false;
        }

        let timer = (!timeout.is_zero()).then(|| self.spawn_timer(command_id, timeout));
        self.pending.insert(
            command_id,
            Pending {
                command,
                respond_to,
                timer,
            },
        );
        true
    }

    fn spawn_timer(&self, command_id: u64, timeout: Duration) -> JoinHandle<()> {
        let mailbox = self.timer_mailbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(Request::Expire { command_id });
            }
        })
    }

    fn expire(&mut self, command_id: u64) {
        if let Some(pending) = self.pending.remove(&command_id) {
            warn!(command_id, command = %pending.command, "command timed out");
            let command = pending.command.clone();
            pending.settle(Err(CommandError::Timeout { command }));
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "malformed websocket frame");
                self.emit(ConnectionEvent::Error(format!("Malformed frame: {e}")));
                return;
            }
        };

        if let Some(command_id) = protocol::response_command_id(&frame) {
            match self.pending.remove(&command_id) {
                Some(pending) => {
                    let result = match protocol::error_message(&frame) {
                        Some(message) => Err(CommandError::Server(message)),
                        None => Ok(frame),
                    };
                    debug!(command_id, ok = result.is_ok(), "command settled");
                    pending.settle(result);
                }
                None => debug!(command_id, "dropping response with no pending command"),
            }
            return;
        }

        match serde_json::from_value::<ServerEvent>(frame) {
            Ok(ServerEvent::Error { message }) => self.emit(ConnectionEvent::Error(message)),
            Ok(event) => self.emit(ConnectionEvent::Event(event)),
            Err(e) => {
                warn!(error = %e, "undecodable server event");
                self.emit(ConnectionEvent::Error(format!("Malformed event: {e}")));
            }
        }
    }

    fn reject_all(&mut self, error: CommandError) {
        for (_, pending) in self.pending.drain() {
            pending.settle(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_command_before_open_is_rejected() {
        // Nothing listens on port 1
        let (handle, _events) = connect(
            "ws://127.0.0.1:1/api/execution/ws/s1",
            ReconnectPolicy {
                max_attempts: 0,
                ..Default::default()
            },
            Duration::from_secs(1),
        );
        assert_eq!(
            handle
                .run_command("cancel", Map::new(), Duration::ZERO)
                .err(),
            Some(CommandError::NotConnected)
        );
    }

    #[tokio::test]
    async fn pending_command_resolves_closed_when_actor_is_gone() {
        let (tx, rx) = oneshot::channel::<CommandResult>();
        drop(tx);
        assert_eq!(PendingCommand { rx }.await, Err(CommandError::Closed));
    }

    #[test]
    fn terminal_states() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::GaveUp.is_terminal());
        assert!(!ConnectionState::Reconnecting { attempt: 1 }.is_terminal());
        assert!(!ConnectionState::Open.is_terminal());
    }
}
