//! Control socket: endpoint parsing, listener and per-connection sessions.

pub(crate) mod dispatch;
pub(crate) mod session;

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::oneshot;
use tracing::info;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control socket `{0}` already exists")]
    SocketExists(PathBuf),
    #[error("unable to bind `{addr}`: {source}")]
    Bind { addr: String, source: io::Error },
}

/// Listen endpoint: `unix/:<path>` for a unix stream socket, `<ip>:<port>`
/// for TCP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for ListenAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix/:") {
            if path.is_empty() {
                return Err(format!("empty unix socket path in `{s}`"));
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(ListenAddr::Tcp(s.to_string()))
            }
            _ => Err(format!("`{s}` is neither `unix/:<path>` nor `<ip>:<port>`")),
        }
    }
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddr::Unix(path) => write!(f, "unix/:{}", path.display()),
            ListenAddr::Tcp(addr) => f.write_str(addr),
        }
    }
}

/// The bound control socket.
#[derive(Debug)]
pub enum ControlListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ControlListener {
    /// Binds the configured endpoint. A pre-existing unix socket path refuses
    /// to bind so a second supervisor cannot steal a live socket.
    pub async fn bind(addr: &ListenAddr) -> Result<Self, ControlError> {
        let listener = match addr {
            ListenAddr::Unix(path) => {
                if path.exists() {
                    return Err(ControlError::SocketExists(path.clone()));
                }
                ControlListener::Unix(UnixListener::bind(path).map_err(|source| {
                    ControlError::Bind {
                        addr: addr.to_string(),
                        source,
                    }
                })?)
            }
            ListenAddr::Tcp(endpoint) => {
                ControlListener::Tcp(TcpListener::bind(endpoint).await.map_err(|source| {
                    ControlError::Bind {
                        addr: addr.to_string(),
                        source,
                    }
                })?)
            }
        };
        info!(addr = %addr, "control socket listening");
        Ok(listener)
    }

    pub async fn accept(&self) -> io::Result<ControlStream> {
        match self {
            ControlListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(ControlStream::Tcp(stream))
            }
            ControlListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(ControlStream::Unix(stream))
            }
        }
    }
}

/// An accepted control connection, TCP or unix.
pub enum ControlStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for ControlStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ControlStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ControlStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ControlStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ControlStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ControlStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ControlStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ControlStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ControlStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ControlStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Reply to one accepted request line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SessionReply {
    Lines(Vec<String>),
    Close,
}

/// Request round-tripped from a session task to the supervisor.
pub(crate) struct ControlRequest {
    pub(crate) conn: u64,
    pub(crate) kind: RequestKind,
}

pub(crate) enum RequestKind {
    Line {
        line: String,
        reply: oneshot::Sender<SessionReply>,
    },
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("unix/:/run/sv.sock", ListenAddr::Unix(PathBuf::from("/run/sv.sock")))]
    #[case("127.0.0.1:4440", ListenAddr::Tcp("127.0.0.1:4440".to_string()))]
    #[case("[::1]:4440", ListenAddr::Tcp("[::1]:4440".to_string()))]
    fn parses_listen_addresses(#[case] input: &str, #[case] expected: ListenAddr) {
        assert_eq!(input.parse::<ListenAddr>().unwrap(), expected);
    }

    #[rstest]
    #[case::no_port("localhost")]
    #[case::bad_port("localhost:http")]
    #[case::empty_unix_path("unix/:")]
    #[case::port_overflow("localhost:70000")]
    fn rejects_malformed_addresses(#[case] input: &str) {
        assert!(input.parse::<ListenAddr>().is_err());
    }

    #[tokio::test]
    async fn bind_refuses_existing_unix_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        std::fs::write(&path, b"").unwrap();

        let err = ControlListener::bind(&ListenAddr::Unix(path.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::SocketExists(p) if p == path));
    }

    #[tokio::test]
    async fn bind_creates_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");

        let listener = ControlListener::bind(&ListenAddr::Unix(path.clone()))
            .await
            .unwrap();
        assert!(path.exists());
        drop(listener);
    }
}
