//! Newline-framed TCP transport for one terminal channel.
//!
//! [`LineTransport`] owns one socket and exposes the minimal contract the
//! connection loop needs: async open and send, a *non-blocking* receive poll,
//! and a consuming best-effort close that sends the `quit` courtesy token
//! first. The connection serializes all calls through a per-channel lock, so
//! the transport itself carries no synchronization.

use std::io;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::protocol::QUIT;

const READ_CHUNK: usize = 4096;

/// One open channel socket with incremental line buffering.
pub struct LineTransport {
    stream: TcpStream,
    buf: Vec<u8>,
    // Prefix of `buf` already scanned and known to hold no newline.
    scanned: usize,
}

impl LineTransport {
    /// Connects to `host:port` with `TCP_NODELAY` set.
    pub async fn open(host: &str, port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, buf: Vec::new(), scanned: 0 })
    }

    /// Writes one frame followed by a newline.
    pub async fn send(&mut self, line: &str) -> io::Result<()> {
        let mut out = Vec::with_capacity(line.len() + 1);
        out.extend_from_slice(line.as_bytes());
        out.push(b'\n');
        self.stream.write_all(&out).await
    }

    /// Returns the next complete line if one is available *right now*.
    ///
    /// Never waits: drains whatever the socket has buffered, returns
    /// `Ok(None)` when no full line has arrived yet, and an error when the
    /// peer closed the socket (EOF) or the read failed. The trailing newline
    /// and an optional `\r` before it are stripped; bytes are decoded as
    /// UTF-8 with replacement.
    pub fn receive(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(nl) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=self.scanned + nl).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.scanned = 0;
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            self.scanned = self.buf.len();

            let mut chunk = [0u8; READ_CHUNK];
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ));
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Closes the socket, sending `quit` first; both steps are best-effort.
    pub async fn close(mut self) {
        let _ = self.send(QUIT).await;
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
    use tokio::net::TcpListener;

    async fn pair() -> (LineTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let transport = LineTransport::open("127.0.0.1", addr.port()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (transport, server)
    }

    /// Polls `receive` until a line shows up or two seconds pass.
    async fn recv_line(transport: &mut LineTransport) -> Option<String> {
        for _ in 0..400 {
            if let Some(line) = transport.receive().unwrap() {
                return Some(line);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    #[tokio::test]
    async fn receive_is_none_without_data() {
        let (mut transport, _server) = pair().await;
        assert_eq!(transport.receive().unwrap(), None);
    }

    #[tokio::test]
    async fn receive_waits_for_the_newline() {
        let (mut transport, mut server) = pair().await;
        server.write_all(b"hel").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.receive().unwrap(), None);
        server.write_all(b"lo\n").await.unwrap();
        assert_eq!(recv_line(&mut transport).await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn receive_splits_multiple_buffered_lines() {
        let (mut transport, mut server) = pair().await;
        server.write_all(b"a\nb\nc\n").await.unwrap();
        assert_eq!(recv_line(&mut transport).await.as_deref(), Some("a"));
        assert_eq!(transport.receive().unwrap().as_deref(), Some("b"));
        assert_eq!(transport.receive().unwrap().as_deref(), Some("c"));
        assert_eq!(transport.receive().unwrap(), None);
    }

    #[tokio::test]
    async fn receive_strips_carriage_return() {
        let (mut transport, mut server) = pair().await;
        server.write_all(b"pong\r\n").await.unwrap();
        assert_eq!(recv_line(&mut transport).await.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn receive_reports_eof_as_error() {
        let (mut transport, server) = pair().await;
        drop(server);
        let mut saw_error = false;
        for _ in 0..400 {
            match transport.receive() {
                Err(_) => {
                    saw_error = true;
                    break;
                }
                Ok(None) => tokio::time::sleep(Duration::from_millis(5)).await,
                Ok(Some(line)) => panic!("unexpected line {line:?}"),
            }
        }
        assert!(saw_error, "EOF never surfaced as an error");
    }

    #[tokio::test]
    async fn send_appends_newline() {
        let (mut transport, mut server) = pair().await;
        transport.send("ping").await.unwrap();
        let mut got = vec![0u8; 5];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, b"ping\n");
    }

    #[tokio::test]
    async fn close_sends_quit_first() {
        let (transport, server) = pair().await;
        transport.close().await;
        let mut lines = BufReader::new(server).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("quit"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }
}
