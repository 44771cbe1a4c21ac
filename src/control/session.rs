//! Per-connection line protocol.
//!
//! Sessions do I/O only; every accepted line is round-tripped to the
//! supervisor and the reply written back prefixed with a blank line. A session
//! ends on `quit`/`.`, EOF, oversize input, idle timeout or I/O error.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;

use super::{ControlRequest, RequestKind, SessionReply};

/// Read and write buffers are this size; requests longer than this close
/// the connection.
pub(crate) const MAX_LINE_BYTES: usize = 64;
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs one control session to completion and reports the disconnect to the
/// supervisor.
pub(crate) async fn serve<S>(mut stream: S, conn: u64, requests: mpsc::Sender<ControlRequest>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match run_session(&mut stream, conn, &requests).await {
        Ok(()) => debug!(conn, "control session closed"),
        Err(err) => debug!(conn, error = %err, "control session aborted"),
    }
    let _ = requests
        .send(ControlRequest {
            conn,
            kind: RequestKind::Closed,
        })
        .await;
}

async fn run_session<S>(
    stream: &mut S,
    conn: u64,
    requests: &mpsc::Sender<ControlRequest>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut chunk = [0u8; MAX_LINE_BYTES];
    let mut pending: Vec<u8> = Vec::with_capacity(MAX_LINE_BYTES);

    loop {
        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos])
                .trim_end_matches('\r')
                .to_string();

            let Some(reply) = round_trip(requests, conn, line).await else {
                // supervisor is gone, nothing left to serve
                return Ok(());
            };
            match reply {
                SessionReply::Lines(lines) => {
                    let mut out = String::from("\n");
                    for line in &lines {
                        out.push_str(line);
                        out.push('\n');
                    }
                    // the write buffer is capped like the read side
                    for chunk in out.as_bytes().chunks(MAX_LINE_BYTES) {
                        stream.write_all(chunk).await?;
                    }
                    stream.flush().await?;
                }
                SessionReply::Close => {
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
            }
        }

        if pending.len() >= MAX_LINE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request line exceeds 64 bytes",
            ));
        }

        let read = timeout(IDLE_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))??;
        if read == 0 {
            return Ok(());
        }
        pending.extend_from_slice(&chunk[..read]);
    }
}

async fn round_trip(
    requests: &mpsc::Sender<ControlRequest>,
    conn: u64,
    line: String,
) -> Option<SessionReply> {
    let (reply_tx, reply_rx) = oneshot::channel();
    requests
        .send(ControlRequest {
            conn,
            kind: RequestKind::Line {
                line,
                reply: reply_tx,
            },
        })
        .await
        .ok()?;
    reply_rx.await.ok()
}
