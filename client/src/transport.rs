//! Message framing over the byte channel to the CLI server.
//!
//! Both transports - child-process stdio pipes and a TCP socket - exchange
//! JSON messages framed with a `Content-Length: N\r\n\r\n` header. The framing
//! logic is written once over boxed read/write halves so the two transports
//! cannot drift apart.
//!
//! A malformed frame body is reported and skipped; it does not tear down the
//! channel. EOF or an I/O error ends the message stream, which the router
//! treats as connection loss.

use crate::error::{Error, Result};
use serde::Serialize;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Write half: serializes a message, frames it, writes and flushes.
/// Writes are serialized under a mutex so concurrent senders cannot
/// interleave frames.
pub(crate) struct FramedWriter {
    inner: Mutex<BufWriter<BoxedWrite>>,
}

impl FramedWriter {
    pub(crate) fn new(write: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: Mutex::new(BufWriter::new(Box::new(write))),
        }
    }

    pub(crate) async fn write_message<T: Serialize>(&self, message: &T) -> Result<()> {
        let json = serde_json::to_string(message)?;
        trace!("transport sending: {}", json);

        let mut writer = self.inner.lock().await;
        let header = format!("Content-Length: {}\r\n\r\n", json.len());
        let write = async {
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(json.as_bytes()).await?;
            writer.flush().await
        };
        write
            .await
            .map_err(|e| Error::ConnectionLost(format!("write failed: {e}")))
    }
}

/// Read half: yields decoded JSON messages until the channel closes.
pub(crate) struct FramedReader {
    reader: BufReader<BoxedRead>,
}

impl FramedReader {
    pub(crate) fn new(read: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: BufReader::new(Box::new(read)),
        }
    }

    /// Next decoded message, or `None` once the channel is closed.
    ///
    /// Frames whose body is not valid JSON are skipped with a warning.
    pub(crate) async fn next_message(&mut self) -> Option<serde_json::Value> {
        loop {
            let content_length = match self.read_content_length().await {
                Ok(Some(len)) => len,
                Ok(None) => {
                    debug!("transport closed");
                    return None;
                }
                Err(e) => {
                    warn!("transport read error in headers: {}", e);
                    return None;
                }
            };

            let mut body = vec![0u8; content_length];
            if let Err(e) = self.reader.read_exact(&mut body).await {
                warn!("transport read error in body: {}", e);
                return None;
            }

            match serde_json::from_slice(&body) {
                Ok(value) => {
                    trace!("transport received: {}", String::from_utf8_lossy(&body));
                    return Some(value);
                }
                Err(e) => {
                    warn!(
                        "skipping malformed frame ({}): {}",
                        e,
                        String::from_utf8_lossy(&body)
                    );
                }
            }
        }
    }

    /// Read headers up to and including the blank separator line, returning
    /// the Content-Length value. `Ok(None)` on clean EOF.
    async fn read_content_length(&mut self) -> std::io::Result<Option<usize>> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                return Ok(None);
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                // Blank line ends the headers once a length was seen;
                // stray blank lines before headers are tolerated.
                if let Some(len) = content_length {
                    return Ok(Some(len));
                }
                continue;
            }

            if let Some(len_str) = trimmed.strip_prefix("Content-Length:")
                && let Ok(len) = len_str.trim().parse::<usize>()
            {
                content_length = Some(len);
            }
        }
    }
}

/// A connected byte channel to the server, split into framed halves.
pub(crate) struct Transport {
    pub writer: FramedWriter,
    pub reader: FramedReader,
}

impl Transport {
    pub(crate) fn new(
        read: impl AsyncRead + Send + Unpin + 'static,
        write: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            writer: FramedWriter::new(write),
            reader: FramedReader::new(read),
        }
    }

    /// Pipe transport over a spawned child's stdio.
    pub(crate) fn from_stdio(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self::new(stdout, stdin)
    }

    /// Socket transport over a TCP connection.
    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self::new(read_half, write_half)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcRequest;

    fn pipe() -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (Transport::new(a_read, a_write), Transport::new(b_read, b_write))
    }

    #[tokio::test]
    async fn round_trips_a_request() {
        let (client, mut server) = pipe();

        let request = JsonRpcRequest::new("ping", Some(serde_json::json!({"message": "hi"})));
        client.writer.write_message(&request).await.unwrap();

        let received = server.reader.next_message().await.unwrap();
        assert_eq!(received["method"], "ping");
        assert_eq!(received["params"]["message"], "hi");
        assert_eq!(received["id"], request.id);
    }

    #[tokio::test]
    async fn interleaved_messages_arrive_in_order() {
        let (client, mut server) = pipe();

        for i in 0..10 {
            client
                .writer
                .write_message(&serde_json::json!({"seq": i}))
                .await
                .unwrap();
        }
        for i in 0..10 {
            let msg = server.reader.next_message().await.unwrap();
            assert_eq!(msg["seq"], i);
        }
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped_not_fatal() {
        let (raw, peer) = tokio::io::duplex(4096);
        let (_peer_read, mut peer_write) = tokio::io::split(peer);
        let (read, _write) = tokio::io::split(raw);
        let mut reader = FramedReader::new(read);

        let garbage = b"not json at all";
        let header = format!("Content-Length: {}\r\n\r\n", garbage.len());
        peer_write.write_all(header.as_bytes()).await.unwrap();
        peer_write.write_all(garbage).await.unwrap();

        let good = br#"{"ok":true}"#;
        let header = format!("Content-Length: {}\r\n\r\n", good.len());
        peer_write.write_all(header.as_bytes()).await.unwrap();
        peer_write.write_all(good).await.unwrap();
        peer_write.flush().await.unwrap();

        let msg = reader.next_message().await.unwrap();
        assert_eq!(msg["ok"], true);
    }

    #[tokio::test]
    async fn eof_ends_the_stream() {
        let (raw, peer) = tokio::io::duplex(4096);
        let (read, _write) = tokio::io::split(raw);
        let mut reader = FramedReader::new(read);
        drop(peer);
        assert!(reader.next_message().await.is_none());
    }
}
