//! Byte-stream tailing of a child's stdout.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use crate::bus::{LogBus, LogStream, Subscription};

/// An [`AsyncRead`] over a child's current and future stdout lines.
///
/// Backed by a dedicated bus subscription filtered to one package key; the
/// stream reaches EOF when the child exits (the supervisor's system-stream
/// `exited` event closes it). Dropping the reader deregisters the
/// subscription.
pub struct TailReader {
    bus: Arc<LogBus>,
    subscription: Subscription,
    key: String,
    buffer: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl TailReader {
    pub(super) fn new(bus: Arc<LogBus>, subscription: Subscription, key: String) -> Self {
        Self {
            bus,
            subscription,
            key,
            buffer: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    /// The package key this reader follows.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl AsyncRead for TailReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.buffer.len() {
                let available = &this.buffer[this.pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            match this.subscription.poll_recv(cx) {
                Poll::Ready(Some(event)) => {
                    if event.package_key != this.key {
                        continue;
                    }
                    match event.stream {
                        LogStream::Stdout => {
                            let mut bytes = event.text.into_bytes();
                            bytes.push(b'\n');
                            this.buffer = bytes;
                            this.pos = 0;
                        }
                        LogStream::System if event.text.starts_with("exited") => {
                            this.eof = true;
                        }
                        _ => {}
                    }
                }
                Poll::Ready(None) => this.eof = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for TailReader {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription.id());
    }
}

impl std::fmt::Debug for TailReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailReader")
            .field("key", &self.key)
            .field("eof", &self.eof)
            .finish()
    }
}
