//! Relays provider fragments to an HTTP client as SSE frames.
//!
//! `forward` runs on the tokio runtime and turns each non-empty fragment into
//! exactly one frame on a capacity-1 channel, so a slow reader stalls the
//! upstream read instead of buffering. `pump_frames` runs on the HTTP worker
//! thread and writes frames to the socket as they arrive. When the socket
//! write fails the receiver is dropped, `forward` notices, and the upstream
//! request is dropped with it.

use std::io::Write;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::provider::FragmentStream;
use crate::sse::encode_frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Upstream ended normally.
    Completed,
    /// Upstream reported an error mid-stream.
    UpstreamFailed,
    /// The outbound side went away.
    ClientGone,
    /// The request-duration ceiling was reached.
    DeadlineExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStats {
    pub outcome: ForwardOutcome,
    pub frames: usize,
    pub skipped_empty: usize,
}

pub fn frame_channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(1)
}

pub async fn forward(
    mut fragments: FragmentStream,
    frames: mpsc::Sender<String>,
    max_duration: Duration,
) -> ForwardStats {
    let deadline = Instant::now() + max_duration;
    let mut stats = ForwardStats {
        outcome: ForwardOutcome::Completed,
        frames: 0,
        skipped_empty: 0,
    };

    loop {
        let next = tokio::select! {
            next = fragments.next() => next,
            _ = frames.closed() => {
                info!("Client disconnected, cancelling upstream request");
                stats.outcome = ForwardOutcome::ClientGone;
                break;
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!("Stream deadline of {:?} reached, closing", max_duration);
                stats.outcome = ForwardOutcome::DeadlineExceeded;
                break;
            }
        };

        let fragment = match next {
            None => break,
            Some(Ok(fragment)) => fragment,
            Some(Err(e)) => {
                error!("Upstream stream failed: {}", e);
                stats.outcome = ForwardOutcome::UpstreamFailed;
                break;
            }
        };

        if fragment.is_empty() {
            stats.skipped_empty += 1;
            continue;
        }

        let sent = tokio::select! {
            sent = frames.send(encode_frame(&fragment)) => sent.is_ok(),
            _ = tokio::time::sleep_until(deadline) => {
                warn!("Stream deadline of {:?} reached while writing, closing", max_duration);
                stats.outcome = ForwardOutcome::DeadlineExceeded;
                break;
            }
        };
        if !sent {
            info!("Client disconnected, cancelling upstream request");
            stats.outcome = ForwardOutcome::ClientGone;
            break;
        }
        stats.frames += 1;
    }

    // Dropping `fragments` here releases the upstream connection.
    drop(fragments);
    debug!(
        "Forwarding closed: {:?}, {} frames, {} empty fragments skipped",
        stats.outcome, stats.frames, stats.skipped_empty
    );
    stats
}

pub const SSE_HEAD: &str = "HTTP/1.1 200 OK\r\n\
Content-Type: text/event-stream; charset=utf-8\r\n\
Cache-Control: no-cache\r\n\
Transfer-Encoding: chunked\r\n\
X-Accel-Buffering: no\r\n\
\r\n";

/// Chunked transfer framing so the body ends without closing a keep-alive
/// connection.
fn write_chunk<W: Write>(writer: &mut W, data: &str) -> std::io::Result<()> {
    let chunk = format!("{:x}\r\n{}\r\n", data.len(), data);
    writer.write_all(chunk.as_bytes())?;
    writer.flush()
}

/// Blocking side of the relay. Writes the response head, then every frame as
/// its own chunk, flushing after each. Returns the number of frames written;
/// a write error ends pumping and drops the receiver.
pub fn pump_frames<W: Write>(mut frames: mpsc::Receiver<String>, mut writer: W) -> usize {
    if let Err(e) = writer
        .write_all(SSE_HEAD.as_bytes())
        .and_then(|_| writer.flush())
    {
        error!("Failed to write SSE head: {}", e);
        return 0;
    }

    let mut written = 0;
    while let Some(frame) = frames.blocking_recv() {
        if let Err(e) = write_chunk(&mut writer, &frame) {
            warn!("Client write failed after {} frames: {}", written, e);
            return written;
        }
        written += 1;
    }

    if let Err(e) = writer.write_all(b"0\r\n\r\n").and_then(|_| writer.flush()) {
        warn!("Failed to terminate event stream: {}", e);
    }
    written
}
