//! Newline-delimited JSON framing over a pair of byte streams.
//!
//! One JSON object per line in both directions. The write side resolves
//! only after the whole frame was accepted and flushed by the sink, so a
//! full pipe suspends the caller instead of dropping or queueing silently.
//! The read side yields frames as they arrive; end-of-stream yields `None`
//! and a read error is returned, so the channel never hangs.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Split};

use crate::api::types::ApiError;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One decoded line from the read side.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A JSON value (usually a JSON-RPC message)
    Message(serde_json::Value),
    /// A non-empty line that is not JSON (agent log noise)
    Noise(String),
}

/// Write half of the framed duplex.
pub struct FrameWriter {
    sink: BoxedWriter,
}

impl FrameWriter {
    pub fn new<W>(sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            sink: Box::new(sink),
        }
    }

    /// Write one message and wait until the sink has drained it.
    pub async fn send(&mut self, message: &serde_json::Value) -> Result<(), ApiError> {
        let mut line = serde_json::to_vec(message).map_err(|e| ApiError::ProtocolError {
            message: format!("Failed to serialize JSON-RPC message: {e}"),
        })?;
        line.push(b'\n');

        self.sink
            .write_all(&line)
            .await
            .map_err(|e| ApiError::IoError {
                message: format!("Failed to write to agent stdin: {e}"),
            })?;

        self.sink.flush().await.map_err(|e| ApiError::IoError {
            message: format!("Failed to flush agent stdin: {e}"),
        })
    }

    /// Close the write side; the agent sees end-of-file on its stdin.
    pub async fn close(&mut self) -> Result<(), ApiError> {
        self.sink.shutdown().await.map_err(|e| ApiError::IoError {
            message: format!("Failed to close agent stdin: {e}"),
        })
    }
}

/// Read half of the framed duplex.
pub struct FrameReader {
    lines: Split<BufReader<BoxedReader>>,
}

impl FrameReader {
    pub fn new<R>(source: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let source: BoxedReader = Box::new(source);
        Self {
            lines: BufReader::new(source).split(b'\n'),
        }
    }

    /// Next frame, `Ok(None)` at end of stream. Blank lines are skipped.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ApiError> {
        loop {
            let segment = self
                .lines
                .next_segment()
                .await
                .map_err(|e| ApiError::IoError {
                    message: format!("Failed to read from agent stdout: {e}"),
                })?;

            let Some(segment) = segment else {
                return Ok(None);
            };

            let line = String::from_utf8_lossy(&segment);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return Ok(Some(match serde_json::from_str(line) {
                Ok(value) => Frame::Message(value),
                Err(_) => Frame::Noise(line.to_string()),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::duplex;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_frames_round_trip_over_duplex() {
        let (client, agent) = duplex(1024);
        let (agent_read, _agent_write) = tokio::io::split(agent);
        let (_client_read, client_write) = tokio::io::split(client);

        let mut writer = FrameWriter::new(client_write);
        let mut reader = FrameReader::new(agent_read);

        writer.send(&json!({"jsonrpc": "2.0", "method": "a"})).await.unwrap();
        writer.send(&json!({"jsonrpc": "2.0", "method": "b"})).await.unwrap();

        let first = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(first, Frame::Message(json!({"jsonrpc": "2.0", "method": "a"})));
        let second = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(second, Frame::Message(json!({"jsonrpc": "2.0", "method": "b"})));
    }

    #[tokio::test]
    async fn test_non_json_lines_are_noise_and_eof_ends_stream() {
        let input: &[u8] = b"starting agent...\n\n{\"id\":1}\n";
        let mut reader = FrameReader::new(input);

        assert_eq!(
            reader.next_frame().await.unwrap(),
            Some(Frame::Noise("starting agent...".to_string()))
        );
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Some(Frame::Message(json!({"id": 1})))
        );
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_waits_for_reader_to_drain() {
        // A 64 byte pipe cannot hold the whole frame
        let (client, agent) = duplex(64);
        let (_client_read, client_write) = tokio::io::split(client);
        let (agent_read, _agent_write) = tokio::io::split(agent);

        let mut writer = FrameWriter::new(client_write);
        let mut reader = FrameReader::new(agent_read);
        let big = json!({"text": "x".repeat(1000)});

        let send = writer.send(&big);
        tokio::pin!(send);
        assert!(
            timeout(Duration::from_millis(100), &mut send).await.is_err(),
            "send resolved before the pipe drained"
        );

        let (sent, frame) = tokio::join!(send, reader.next_frame());
        sent.unwrap();
        assert_eq!(frame.unwrap(), Some(Frame::Message(big.clone())));
    }
}
