//! Server side of the PTY stream protocol
//!
//! One connection carries one attached session. The first frame must be
//! an `attach` control message; the server answers with the session's
//! buffered history as a single binary frame followed by `ready`, after
//! which binary frames flow both ways and `resize` / `exit` travel as
//! control messages.

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sandboxd_protocol::{ControlMessage, Frame, FrameCodec};
use sandboxd_utils::{Result, SandboxError};

use crate::pty::{PtyExit, PtyManager, PtyOptions, PtySession};

/// How long a new connection may take to send `attach`
pub const ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

/// Output chunks queued for one slow client before it is cut loose
const OUTPUT_QUEUE_DEPTH: usize = 1024;

/// Serve one client connection until it disconnects or the session ends
///
/// Disconnecting leaves the session running so the client can re-attach
/// with the id it received in `ready`.
pub async fn serve_pty_connection<T>(io: T, manager: &PtyManager) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = Framed::new(io, FrameCodec::new());

    let first = match tokio::time::timeout(ATTACH_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(e))) => return Err(SandboxError::protocol(e.to_string())),
        Ok(None) => return Ok(()),
        Err(_) => {
            send_control(&mut framed, &ControlMessage::error("attach timeout")).await?;
            return Err(SandboxError::protocol("client did not attach in time"));
        }
    };

    let (requested, cols, rows) = match first.parse_control() {
        Some(Ok(ControlMessage::Attach {
            session_id,
            cols,
            rows,
        })) => (session_id, cols, rows),
        _ => {
            send_control(&mut framed, &ControlMessage::error("expected attach")).await?;
            return Err(SandboxError::protocol("first frame was not attach"));
        }
    };

    let session = resolve_session(manager, requested, cols, rows)?;
    let session_id = session.id();

    // Subscribe before attaching so an exit in between is not missed
    let mut exit_rx = session.subscribe_exit();
    let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(OUTPUT_QUEUE_DEPTH);
    let overflow = CancellationToken::new();
    let listener_overflow = overflow.clone();
    let (history, subscription) = session.attach(std::sync::Arc::new(move |data: &[u8]| {
        if output_tx.try_send(Bytes::copy_from_slice(data)).is_err() {
            listener_overflow.cancel();
        }
    }))?;

    if !history.is_empty() {
        framed
            .send(Frame::binary(history))
            .await
            .map_err(|e| SandboxError::connection(e.to_string()))?;
    }
    send_control(
        &mut framed,
        &ControlMessage::Ready {
            session_id: Some(session_id),
        },
    )
    .await?;
    info!(session_id = %session_id, "Client attached");

    let result = loop {
        tokio::select! {
            Some(data) = output_rx.recv() => {
                if let Err(e) = framed.send(Frame::Binary(data)).await {
                    break Err(SandboxError::connection(e.to_string()));
                }
            }
            frame = framed.next() => match frame {
                Some(Ok(Frame::Binary(data))) => {
                    if let Err(e) = session.write(&data) {
                        warn!(session_id = %session_id, error = %e, "Failed to write client input");
                        send_control(&mut framed, &ControlMessage::error(e.to_string())).await?;
                    }
                }
                Some(Ok(frame)) => handle_control(&mut framed, &session, &frame).await?,
                Some(Err(e)) => break Err(SandboxError::protocol(e.to_string())),
                None => {
                    debug!(session_id = %session_id, "Client disconnected");
                    break Ok(());
                }
            },
            changed = exit_rx.changed() => {
                let exit = exit_rx.borrow_and_update().clone();
                if changed.is_err() || exit.is_some() {
                    while let Ok(data) = output_rx.try_recv() {
                        framed
                            .send(Frame::Binary(data))
                            .await
                            .map_err(|e| SandboxError::connection(e.to_string()))?;
                    }
                    let PtyExit { code, signal } = exit.unwrap_or(PtyExit { code: None, signal: None });
                    send_control(
                        &mut framed,
                        &ControlMessage::Exit {
                            code: code.unwrap_or(-1),
                            signal,
                        },
                    )
                    .await?;
                    break Ok(());
                }
            }
            _ = overflow.cancelled() => {
                warn!(session_id = %session_id, "Client too slow, dropping connection");
                send_control(&mut framed, &ControlMessage::error("output overflow, reattach to resync")).await?;
                break Ok(());
            }
        }
    };

    drop(subscription);
    result
}

/// Attach to the requested session, or start a new one
fn resolve_session(
    manager: &PtyManager,
    requested: Option<Uuid>,
    cols: u16,
    rows: u16,
) -> Result<std::sync::Arc<PtySession>> {
    if let Some(id) = requested {
        match manager.get(id) {
            Ok(session) if !session.is_closed() => {
                if cols > 0 && rows > 0 && session.size() != (cols, rows) {
                    session.resize(cols, rows)?;
                }
                return Ok(session);
            }
            _ => debug!(session_id = %id, "Requested session is gone, starting a new one"),
        }
    }

    let mut options = PtyOptions::shell();
    if cols > 0 && rows > 0 {
        options = options.with_size(cols, rows);
    }
    manager.create(options)
}

async fn handle_control<T>(
    framed: &mut Framed<T, FrameCodec>,
    session: &PtySession,
    frame: &Frame,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match frame.parse_control() {
        Some(Ok(ControlMessage::Resize { cols, rows })) => {
            if let Err(e) = session.resize(cols, rows) {
                send_control(framed, &ControlMessage::error(e.to_string())).await?;
            }
        }
        Some(Ok(other)) => {
            debug!(session_id = %session.id(), message = ?other, "Ignoring control message");
        }
        Some(Err(e)) => {
            send_control(framed, &ControlMessage::error(format!("invalid control message: {}", e)))
                .await?;
        }
        None => {}
    }
    Ok(())
}

async fn send_control<T>(framed: &mut Framed<T, FrameCodec>, msg: &ControlMessage) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let frame = Frame::control(msg).map_err(|e| SandboxError::protocol(e.to_string()))?;
    framed
        .send(frame)
        .await
        .map_err(|e| SandboxError::connection(e.to_string()))
}
