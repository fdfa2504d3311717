//! Connection transport — frames layered over an ordered byte stream.
//!
//! The read side is a free function so each connection's receive loop owns
//! its reader outright. The write side is a shared `Transport`: the
//! coordinator's dispatcher and a node's worker pool both write through it
//! concurrently, and the mutex around the writer keeps every frame
//! contiguous on the wire.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use strata_core::wire::{decode, encode, FrameError, Message, LENGTH_PREFIX};

/// Unique per-process connection identifier.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Initial buffer size for a frame body. Larger frames grow as bytes
/// actually arrive, so a bogus length prefix cannot force a huge allocation.
const INITIAL_FRAME_CAPACITY: usize = 64 * 1024;

// ── Read side ─────────────────────────────────────────────────────────────────

/// Read exactly one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
/// End of stream anywhere inside a frame is `FrameError::Truncated`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                field: "total_length",
                needed: LENGTH_PREFIX,
                remaining: filled,
            }
            .into());
        }
        filled += n;
    }

    let total = i32::from_be_bytes(prefix);
    if total < LENGTH_PREFIX as i32 {
        return Err(FrameError::LengthTooSmall(total as i64).into());
    }
    let total = total as usize;
    let body_len = total - LENGTH_PREFIX;

    let mut frame = Vec::with_capacity(total.min(INITIAL_FRAME_CAPACITY));
    frame.extend_from_slice(&prefix);
    let got = (&mut *reader)
        .take(body_len as u64)
        .read_to_end(&mut frame)
        .await?;
    if got < body_len {
        return Err(FrameError::Truncated {
            field: "frame",
            needed: body_len,
            remaining: got,
        }
        .into());
    }

    Ok(Some(decode(&frame)?))
}

// ── Write side ────────────────────────────────────────────────────────────────

/// The write half of one live link, shareable across tasks.
///
/// `is_closed` is the liveness signal the node registry sweeps on. It flips
/// when a write fails, when `close` is called, or when the link's receive
/// loop sees the peer hang up and calls `mark_closed`.
pub struct Transport {
    id: ConnectionId,
    peer: String,
    writer: Mutex<Pin<Box<dyn AsyncWrite + Send>>>,
    closed: AtomicBool,
}

impl Transport {
    pub fn new<W>(writer: W, peer: impl Into<String>) -> Arc<Self>
    where
        W: AsyncWrite + Send + 'static,
    {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            writer: Mutex::new(Box::pin(writer)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address or label, for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record that the link is dead without touching the writer.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Write one frame. The frame is encoded before the lock is taken and
    /// written and flushed while holding it.
    pub async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = encode(msg)?;

        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            self.mark_closed();
            return Err(e.into());
        }
        Ok(())
    }

    /// `send`, giving up at `deadline`.
    ///
    /// A write abandoned mid-frame leaves the stream unusable, so a send that
    /// runs out of time marks the link closed.
    pub async fn send_until(
        &self,
        msg: &Message,
        deadline: tokio::time::Instant,
    ) -> Result<(), TransportError> {
        match tokio::time::timeout_at(deadline, self.send(msg)).await {
            Ok(sent) => sent,
            Err(_) => {
                self.mark_closed();
                Err(TransportError::Stalled)
            }
        }
    }

    /// Mark closed and shut the write half down. Idempotent.
    pub async fn close(&self) {
        self.mark_closed();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::trace!(peer = %self.peer, error = %e, "shutdown on closed transport");
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport is closed")]
    Closed,

    #[error("peer stopped draining the link")]
    Stalled,
}
