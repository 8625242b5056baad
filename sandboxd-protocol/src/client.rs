//! Reconnecting PTY stream client
//!
//! One driver task owns the connection and walks the
//! `Disconnected -> Connecting -> Connected` state machine. Retries are
//! scheduled by that task alone and are cancelled through a single
//! [`CancellationToken`]. Input typed before the server's `ready` message
//! (on first connect or after a reconnect) is held back and flushed once
//! the server has attached the pty.

use std::collections::VecDeque;
use std::future::Future;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sandboxd_utils::{Result, SandboxError};

use crate::codec::FrameCodec;
use crate::frame::{ControlMessage, Frame};
use crate::reconnect::{ConnectionState, ReconnectPolicy};

/// Cap on input held back while not ready
const MAX_PENDING_INPUT_BYTES: usize = 64 * 1024;

/// Opens a fresh transport for each connection attempt
pub trait Connector: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self) -> impl Future<Output = std::io::Result<Self::Io>> + Send;
}

/// Plain TCP transport
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    type Io = TcpStream;

    fn connect(&self) -> impl Future<Output = std::io::Result<TcpStream>> + Send {
        let addr = self.addr.clone();
        async move { TcpStream::connect(addr).await }
    }
}

/// Terminal parameters sent in the `attach` message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachOptions {
    pub session_id: Option<Uuid>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            cols: 80,
            rows: 24,
        }
    }
}

/// Events surfaced to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connection state changed
    State(ConnectionState),
    /// Server attached the session; input is flowing
    Ready { session_id: Option<Uuid> },
    /// Terminal output (history replay or live)
    Output(Bytes),
    /// Server reported an error
    Error { message: String },
    /// The remote process exited; the client stops
    Exit { code: i32, signal: Option<String> },
    /// Reconnect attempts exhausted; the client stops
    GaveUp { attempts: u32 },
}

enum ClientCommand {
    Input(Bytes),
    Resize { cols: u16, rows: u16 },
}

enum SessionEnd {
    Exited,
    Cancelled,
    Disconnected,
}

/// Handle to a running reconnecting client
pub struct ReconnectingClient {
    commands: mpsc::Sender<ClientCommand>,
    events: mpsc::Receiver<ClientEvent>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconnectingClient {
    /// Start the driver task
    pub fn spawn<C: Connector>(connector: C, policy: ReconnectPolicy, attach: AttachOptions) -> Self {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = CancellationToken::new();

        let driver = ClientDriver {
            connector,
            policy,
            attach,
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            cancel: cancel.clone(),
            pending: VecDeque::new(),
            pending_bytes: 0,
        };
        let task = tokio::spawn(driver.run());

        Self {
            commands: command_tx,
            events: event_rx,
            state: state_rx,
            cancel,
            task,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Send keystrokes to the remote pty
    pub async fn send_input(&self, data: impl Into<Bytes>) -> Result<()> {
        self.commands
            .send(ClientCommand::Input(data.into()))
            .await
            .map_err(|_| SandboxError::ConnectionClosed)
    }

    /// Propagate new terminal geometry
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.commands
            .send(ClientCommand::Resize { cols, rows })
            .await
            .map_err(|_| SandboxError::ConnectionClosed)
    }

    /// Next event, or `None` once the driver has stopped
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Stop the driver, cancelling any scheduled retry
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

struct ClientDriver<C: Connector> {
    connector: C,
    policy: ReconnectPolicy,
    attach: AttachOptions,
    commands: mpsc::Receiver<ClientCommand>,
    events: mpsc::Sender<ClientEvent>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    pending: VecDeque<Bytes>,
    pending_bytes: usize,
}

impl<C: Connector> ClientDriver<C> {
    async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting).await;

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(io) => {
                    self.set_state(ConnectionState::Connected).await;
                    match self.run_session(io, &mut failures).await {
                        SessionEnd::Exited | SessionEnd::Cancelled => break,
                        SessionEnd::Disconnected => {
                            info!("PTY stream disconnected");
                        }
                    }
                }
                Err(e) => {
                    warn!(attempt = failures + 1, error = %e, "PTY stream connect failed");
                }
            }

            self.set_state(ConnectionState::Disconnected).await;

            if !self.policy.should_retry(failures) {
                warn!(attempts = failures, "Giving up on PTY stream reconnection");
                let _ = self.events.send(ClientEvent::GaveUp { attempts: failures }).await;
                break;
            }

            let delay = self.policy.delay_for(failures);
            failures += 1;
            debug!(attempt = failures, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let _ = self.state.send(ConnectionState::Disconnected);
    }

    async fn run_session(&mut self, io: C::Io, failures: &mut u32) -> SessionEnd {
        let mut framed = Framed::new(io, FrameCodec::new());
        let mut ready = false;

        let attach = ControlMessage::Attach {
            session_id: self.attach.session_id,
            cols: self.attach.cols,
            rows: self.attach.rows,
        };
        if !send_control(&mut framed, &attach).await {
            return SessionEnd::Disconnected;
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,

                incoming = framed.next() => {
                    let frame = match incoming {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            warn!(error = %e, "PTY stream decode error");
                            return SessionEnd::Disconnected;
                        }
                        None => return SessionEnd::Disconnected,
                    };

                    match frame {
                        Frame::Binary(data) => {
                            let _ = self.events.send(ClientEvent::Output(data)).await;
                        }
                        Frame::Text(text) => match serde_json::from_str::<ControlMessage>(&text) {
                            Ok(ControlMessage::Ready { session_id }) => {
                                ready = true;
                                *failures = 0;
                                if session_id.is_some() {
                                    self.attach.session_id = session_id;
                                }
                                if !self.flush_pending(&mut framed).await {
                                    return SessionEnd::Disconnected;
                                }
                                let _ = self.events.send(ClientEvent::Ready { session_id }).await;
                            }
                            Ok(ControlMessage::Exit { code, signal }) => {
                                let _ = self.events.send(ClientEvent::Exit { code, signal }).await;
                                return SessionEnd::Exited;
                            }
                            Ok(ControlMessage::Error { message }) => {
                                let _ = self.events.send(ClientEvent::Error { message }).await;
                            }
                            Ok(other) => {
                                debug!(message = ?other, "Ignoring control message from server");
                            }
                            Err(e) => {
                                warn!(error = %e, "Malformed control message from server");
                            }
                        },
                    }
                }

                command = self.commands.recv() => match command {
                    Some(ClientCommand::Input(data)) => {
                        if ready {
                            if framed.send(Frame::Binary(data)).await.is_err() {
                                return SessionEnd::Disconnected;
                            }
                        } else {
                            self.hold_input(data);
                        }
                    }
                    Some(ClientCommand::Resize { cols, rows }) => {
                        self.attach.cols = cols;
                        self.attach.rows = rows;
                        if ready && !send_control(&mut framed, &ControlMessage::Resize { cols, rows }).await {
                            return SessionEnd::Disconnected;
                        }
                    }
                    None => return SessionEnd::Cancelled,
                },
            }
        }
    }

    fn hold_input(&mut self, data: Bytes) {
        self.pending_bytes += data.len();
        self.pending.push_back(data);
        while self.pending_bytes > MAX_PENDING_INPUT_BYTES {
            match self.pending.pop_front() {
                Some(dropped) => self.pending_bytes -= dropped.len(),
                None => break,
            }
        }
    }

    async fn flush_pending(&mut self, framed: &mut Framed<C::Io, FrameCodec>) -> bool {
        while let Some(data) = self.pending.pop_front() {
            self.pending_bytes -= data.len();
            if framed.send(Frame::Binary(data)).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn set_state(&self, state: ConnectionState) {
        if *self.state.borrow() != state {
            let _ = self.state.send(state);
            let _ = self.events.send(ClientEvent::State(state)).await;
        }
    }
}

async fn send_control<T>(framed: &mut Framed<T, FrameCodec>, msg: &ControlMessage) -> bool
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match Frame::control(msg) {
        Ok(frame) => framed.send(frame).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode control message");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;

    /// Hands out pre-arranged transports, then refuses
    #[derive(Clone, Default)]
    struct ScriptedConnector {
        streams: Arc<Mutex<VecDeque<DuplexStream>>>,
        attempts: Arc<Mutex<u32>>,
    }

    impl ScriptedConnector {
        fn push(&self) -> Framed<DuplexStream, FrameCodec> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.streams.lock().unwrap().push_back(client);
            Framed::new(server, FrameCodec::new())
        }

        fn attempts(&self) -> u32 {
            *self.attempts.lock().unwrap()
        }
    }

    impl Connector for ScriptedConnector {
        type Io = DuplexStream;

        fn connect(&self) -> impl Future<Output = std::io::Result<DuplexStream>> + Send {
            *self.attempts.lock().unwrap() += 1;
            let next = self.streams.lock().unwrap().pop_front();
            async move {
                next.ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused")
                })
            }
        }
    }

    async fn next_non_state(client: &mut ReconnectingClient) -> ClientEvent {
        loop {
            match client.next_event().await.expect("driver stopped") {
                ClientEvent::State(_) => continue,
                other => return other,
            }
        }
    }

    async fn expect_control(server: &mut Framed<DuplexStream, FrameCodec>) -> ControlMessage {
        let frame = server.next().await.unwrap().unwrap();
        frame.parse_control().unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_input_held_until_ready() {
        let connector = ScriptedConnector::default();
        let mut server = connector.push();
        let mut client = ReconnectingClient::spawn(
            connector.clone(),
            ReconnectPolicy::default(),
            AttachOptions::default(),
        );

        assert_eq!(
            expect_control(&mut server).await,
            ControlMessage::Attach {
                session_id: None,
                cols: 80,
                rows: 24
            }
        );

        // Typed before the server is ready
        client.send_input(&b"echo early\r"[..]).await.unwrap();

        let session_id = Uuid::new_v4();
        server
            .send(Frame::control(&ControlMessage::Ready { session_id: Some(session_id) }).unwrap())
            .await
            .unwrap();

        assert_eq!(
            next_non_state(&mut client).await,
            ClientEvent::Ready { session_id: Some(session_id) }
        );
        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Frame::binary(&b"echo early\r"[..])
        );

        client.close().await;
    }

    #[tokio::test]
    async fn test_exit_stops_client() {
        let connector = ScriptedConnector::default();
        let mut server = connector.push();
        let mut client = ReconnectingClient::spawn(
            connector.clone(),
            ReconnectPolicy::default(),
            AttachOptions::default(),
        );

        expect_control(&mut server).await;
        server
            .send(Frame::control(&ControlMessage::Exit { code: 0, signal: None }).unwrap())
            .await
            .unwrap();

        assert_eq!(
            next_non_state(&mut client).await,
            ClientEvent::Exit { code: 0, signal: None }
        );
        // Driver ends without reconnecting
        while let Some(event) = client.next_event().await {
            assert!(matches!(event, ClientEvent::State(_)));
        }
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_reattaches_same_session() {
        let connector = ScriptedConnector::default();
        let mut first = connector.push();
        let mut second = connector.push();
        let mut client = ReconnectingClient::spawn(
            connector.clone(),
            ReconnectPolicy::default(),
            AttachOptions::default(),
        );

        expect_control(&mut first).await;
        let session_id = Uuid::new_v4();
        first
            .send(Frame::control(&ControlMessage::Ready { session_id: Some(session_id) }).unwrap())
            .await
            .unwrap();
        assert!(matches!(next_non_state(&mut client).await, ClientEvent::Ready { .. }));

        // Server side drops the connection
        drop(first);

        assert_eq!(
            expect_control(&mut second).await,
            ControlMessage::Attach {
                session_id: Some(session_id),
                cols: 80,
                rows: 24
            }
        );
        second.send(Frame::binary(&b"history"[..])).await.unwrap();
        assert_eq!(
            next_non_state(&mut client).await,
            ClientEvent::Output(Bytes::from_static(b"history"))
        );

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let connector = ScriptedConnector::default();
        let mut client = ReconnectingClient::spawn(
            connector.clone(),
            ReconnectPolicy::default(),
            AttachOptions::default(),
        );

        assert_eq!(
            next_non_state(&mut client).await,
            ClientEvent::GaveUp { attempts: 10 }
        );
        // Initial attempt plus ten retries
        assert_eq!(connector.attempts(), 11);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_cancels_pending_retry() {
        let connector = ScriptedConnector::default();
        let client = ReconnectingClient::spawn(
            connector.clone(),
            ReconnectPolicy::default(),
            AttachOptions::default(),
        );

        // The first attempt fails and a 1s+ retry is scheduled; close must not wait for it
        tokio::time::timeout(std::time::Duration::from_millis(500), client.close())
            .await
            .expect("close should cancel the scheduled retry");
    }
}
