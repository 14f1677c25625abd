//! Wire protocol between the SSH front end and the daemon.
//!
//! Frames are a 4-byte big-endian length prefix followed by a JSON payload.
//! A connection carries exactly one request: a one-shot command vector
//! (`Exec`), a live stdout stream for one child (`Tail`), or a long-lived
//! event subscription (`Attach`).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bus::LogEvent;

/// Upper bound on a single frame's payload (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Requests a connection may open with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Execute a one-shot command vector, e.g. `["pks", "start", "web"]`.
    Exec {
        /// The command vector, without the application name.
        argv: Vec<String>,
    },

    /// Copy a running child's live stdout to the peer until it exits.
    ///
    /// `Exec` with `pks logs <key>` reaches the same stream after lazily
    /// materializing an empty supervisor map; this variant goes straight to
    /// the supervisor for front ends that already know the state exists.
    Tail {
        /// Package to follow.
        key: String,
    },

    /// Subscribe to the live event stream.
    Attach {
        /// Restrict forwarded events to one package key.
        focus: Option<String>,
    },
}

/// Responses the daemon writes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Result of an `Exec` request.
    Exec {
        /// Process-style exit code: 0 on success, 1 on any handled error.
        exit_code: i32,
        /// What the command printed to stdout.
        stdout: String,
        /// What the command printed to stderr.
        stderr: String,
    },

    /// A chunk of streamed log output (follows an `Exec` of `pks logs`).
    Chunk {
        /// Raw text, possibly spanning partial lines.
        text: String,
    },

    /// A broadcast event (follows an `Attach`).
    Event {
        /// The event.
        event: LogEvent,
    },

    /// The stream is complete.
    End,

    /// The connection failed at the protocol level.
    Error {
        /// Human-readable cause.
        message: String,
    },
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Socket read or write failed.
    #[error("transport error")]
    Io(#[from] std::io::Error),

    /// Payload was not valid JSON for the expected type.
    #[error("malformed frame")]
    Json(#[from] serde_json::Error),

    /// Peer announced a frame larger than [`MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds limit")]
    FrameTooLarge {
        /// Announced length.
        len: usize,
    },
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge { len: body.len() });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
///
/// Returns `Ok(None)` on a clean EOF before the length prefix (the peer hung
/// up between frames).
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, IpcError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge { len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let mut buf = std::io::Cursor::new(Vec::new());
        let request = Request::Exec {
            argv: vec!["pks".to_string(), "start".to_string(), "web".to_string()],
        };
        write_frame(&mut buf, &request).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf.into_inner());
        let decoded: Request = read_frame(&mut cursor).await.unwrap().unwrap();
        match decoded {
            Request::Exec { argv } => assert_eq!(argv, vec!["pks", "start", "web"]),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_between_frames_is_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let decoded: Option<Request> = read_frame(&mut cursor).await.unwrap();
        assert!(decoded.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame::<_, Request>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(b"{\"type\"");

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame::<_, Request>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, IpcError::Io(_)));
    }
}
