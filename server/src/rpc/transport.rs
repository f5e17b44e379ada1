//! Line-delimited transport
//!
//! One JSON-RPC message per line. Production uses stdin/stdout; tests drive
//! the same code over in-memory buffers.

use super::protocol::{JsonRpcRequest, JsonRpcResponse};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::Mutex;

/// One line read from the client
#[derive(Debug)]
pub enum Incoming {
    Request(JsonRpcRequest),
    /// The line was not a JSON-RPC request
    Malformed(String),
}

/// Async line transport over any buffered reader and writer
pub struct LineTransport<R, W> {
    reader: R,
    writer: ResponseWriter<W>,
}

/// Shared handle on the write half. Each response is written and flushed
/// as one line while holding the lock, so concurrent writers never
/// interleave partial lines.
pub struct ResponseWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for ResponseWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    /// Write a response followed by a newline
    pub async fn write_response(&self, response: &JsonRpcResponse) -> io::Result<()> {
        let mut line = serde_json::to_vec(response)?;
        line.push(b'\n');

        let mut writer = self.inner.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await
    }
}

impl LineTransport<BufReader<Stdin>, Stdout> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer: ResponseWriter {
                inner: Arc::new(Mutex::new(writer)),
            },
        }
    }

    /// Read the next request, skipping blank lines. `None` at end of input.
    pub async fn read_request(&mut self) -> io::Result<Option<Incoming>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            return Ok(Some(match serde_json::from_str(trimmed) {
                Ok(request) => Incoming::Request(request),
                Err(e) => {
                    tracing::warn!("Failed to parse JSON-RPC request: {}", e);
                    Incoming::Malformed(e.to_string())
                }
            }));
        }
    }

    /// Handle for writing responses from other tasks
    pub fn writer(&self) -> ResponseWriter<W> {
        self.writer.clone()
    }

    pub async fn write_response(&self, response: &JsonRpcResponse) -> io::Result<()> {
        self.writer.write_response(response).await
    }

    /// The underlying writer, once no other handle on it is alive
    pub fn into_writer(self) -> Option<W> {
        Arc::try_unwrap(self.writer.inner)
            .ok()
            .map(Mutex::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reads_requests_and_skips_blank_lines() {
        let input = b"\n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"stats\"}\n\n" as &[u8];
        let mut transport = LineTransport::new(input, Vec::new());

        match transport.read_request().await.unwrap() {
            Some(Incoming::Request(request)) => assert_eq!(request.method, "stats"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(transport.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_end_stream() {
        let input = b"{not json\n{\"jsonrpc\":\"2.0\",\"method\":\"stats\"}\n" as &[u8];
        let mut transport = LineTransport::new(input, Vec::new());

        assert!(matches!(
            transport.read_request().await.unwrap(),
            Some(Incoming::Malformed(_))
        ));
        assert!(matches!(
            transport.read_request().await.unwrap(),
            Some(Incoming::Request(_))
        ));
    }

    #[tokio::test]
    async fn test_writes_one_line_per_response() {
        let transport = LineTransport::new(&b""[..], Vec::new());
        transport
            .write_response(&JsonRpcResponse::success(Some(json!(1)), json!("a")))
            .await
            .unwrap();
        transport
            .write_response(&JsonRpcResponse::success(Some(json!(2)), json!("b")))
            .await
            .unwrap();

        let output = String::from_utf8(transport.into_writer().unwrap()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: JsonRpcResponse = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.result, Some(json!("b")));
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_lines_whole() {
        let transport = LineTransport::new(&b""[..], Vec::new());

        let mut tasks = Vec::new();
        for id in 0..16 {
            let writer = transport.writer();
            tasks.push(tokio::spawn(async move {
                let payload = "x".repeat(4096);
                writer
                    .write_response(&JsonRpcResponse::success(Some(json!(id)), json!(payload)))
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let output = String::from_utf8(transport.into_writer().unwrap()).unwrap();
        let mut ids: Vec<i64> = output
            .lines()
            .map(|line| {
                let response: JsonRpcResponse = serde_json::from_str(line).unwrap();
                response.id.unwrap().as_i64().unwrap()
            })
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_writer_is_held_while_handles_live() {
        let transport = LineTransport::new(&b""[..], Vec::<u8>::new());
        let handle = transport.writer();
        assert!(transport.into_writer().is_none());
        drop(handle);
    }
}
