//! Control-plane listener.
//!
//! Accepts connections on the configured `HOST:PORT` and speaks the framed
//! protocol from `nixherd_core::ipc`. The SSH front end authenticates users
//! and proxies each session into this listener; every connection carries one
//! request — a one-shot command vector or a long-lived event subscription.

use std::sync::Arc;

use nixherd_core::ipc::{self, IpcError, Request, Response};
use nixherd_core::session::SessionCoordinator;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::commands::{self, CommandContext, Outcome};

/// Accept connections until `shutdown` flips to `true`.
pub async fn run(
    listener: TcpListener,
    ctx: Arc<CommandContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("listener shutting down");
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, &ctx).await {
                            warn!(%peer, %err, "connection handler failed");
                        }
                    });
                }
                Err(err) => error!(%err, "accept failed"),
            },
        }
    }
}

async fn handle_connection(stream: TcpStream, ctx: &CommandContext) -> Result<(), IpcError> {
    let (mut reader, mut writer) = stream.into_split();

    let request = match ipc::read_frame::<_, Request>(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(err @ (IpcError::Json(_) | IpcError::FrameTooLarge { .. })) => {
            // Tell the peer why before hanging up on it.
            let _ = ipc::write_frame(
                &mut writer,
                &Response::Error {
                    message: err.to_string(),
                },
            )
            .await;
            return Err(err);
        }
        Err(err) => return Err(err),
    };

    match request {
        Request::Exec { argv } => match commands::dispatch(ctx, &argv).await {
            Outcome::Done(result) => {
                ipc::write_frame(
                    &mut writer,
                    &Response::Exec {
                        exit_code: result.exit_code,
                        stdout: result.stdout,
                        stderr: result.stderr,
                    },
                )
                .await
            }
            Outcome::Tail { key } => stream_tail(ctx, &key, &mut writer).await,
        },
        Request::Tail { key } => stream_tail(ctx, &key, &mut writer).await,
        Request::Attach { focus } => stream_events(ctx, focus, &mut reader, &mut writer).await,
    }
}

/// Copy a child's live stdout to the peer until the child exits.
async fn stream_tail(
    ctx: &CommandContext,
    key: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<(), IpcError> {
    let mut tail = match ctx.supervisor.tail(key) {
        Ok(tail) => tail,
        Err(err) => {
            return ipc::write_frame(
                writer,
                &Response::Exec {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("Error: {err}\n"),
                },
            )
            .await;
        }
    };

    let mut buf = [0u8; 4096];
    loop {
        let n = tail.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        ipc::write_frame(writer, &Response::Chunk { text }).await?;
    }
    ipc::write_frame(writer, &Response::End).await
}

/// Forward broadcast events until the peer hangs up.
async fn stream_events(
    ctx: &CommandContext,
    focus: Option<String>,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
) -> Result<(), IpcError> {
    let mut session = SessionCoordinator::attach(Arc::clone(&ctx.bus));
    session.set_focus(focus);

    loop {
        tokio::select! {
            event = session.next_focused() => match event {
                Some(event) => {
                    ipc::write_frame(writer, &Response::Event { event }).await?;
                }
                None => break,
            },
            hangup = ipc::read_frame::<_, Request>(reader) => {
                match hangup {
                    // Any further frame (or EOF, or garbage) ends the session.
                    Ok(None) | Err(_) => break,
                    Ok(Some(_)) => break,
                }
            }
        }
    }
    // SessionCoordinator deregisters from the bus on drop.
    Ok(())
}
