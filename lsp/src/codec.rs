//! `Content-Length` framing for JSON-RPC over a backend's stdio.
//!
//! Every message is `Content-Length: N\r\n\r\n` followed by exactly `N` bytes
//! of UTF-8 JSON. Other headers (`Content-Type`) are accepted and ignored.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single frame body (4 MiB).
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

/// Parse one header line. Returns the length for a `Content-Length` header,
/// `None` for any other header.
fn parse_header(line: &str) -> Result<Option<usize>> {
    let Some((key, value)) = line.split_once(':') else {
        bail!("malformed header line: {line:?}");
    };
    if !key.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Ok(None);
    }
    let len = value
        .trim()
        .parse::<usize>()
        .with_context(|| format!("invalid {CONTENT_LENGTH} value {:?}", value.trim()))?;
    Ok(Some(len))
}

/// Reads framed JSON-RPC messages from a backend's stdout.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Read the next frame.
    ///
    /// `Ok(None)` means the stream ended cleanly between frames. EOF inside a
    /// header block or body, a missing or oversized length, and an unparsable
    /// body are errors.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(body) = self.read_body().await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&body).context("parsing JSON-RPC body")?;
        Ok(Some(value))
    }

    /// Read the next frame body without parsing it.
    ///
    /// After `Ok(Some(_))` the stream is positioned at the next frame even if
    /// the body turns out not to be valid JSON.
    pub async fn read_body(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(len) = self.read_header_block().await? else {
            return Ok(None);
        };
        if len > MAX_FRAME_BYTES {
            bail!("{CONTENT_LENGTH} {len} exceeds maximum {MAX_FRAME_BYTES}");
        }

        let mut body = vec![0u8; len];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;
        Ok(Some(body))
    }

    async fn read_header_block(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut started = false;

        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .await
                .context("reading header line")?;
            if n == 0 {
                if started {
                    bail!("unexpected EOF inside header block");
                }
                return Ok(None);
            }
            started = true;

            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                break;
            }
            if let Some(len) = parse_header(trimmed)? {
                content_length = Some(len);
            }
        }

        content_length
            .map(Some)
            .with_context(|| format!("header block without {CONTENT_LENGTH}"))
    }
}

/// Writes framed JSON-RPC messages to a backend's stdin.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serialize `message` and write it as one frame. The length header counts bytes.
    pub async fn write_frame<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<()> {
        let body = serde_json::to_vec(message).context("serializing JSON-RPC message")?;
        let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());

        self.writer
            .write_all(header.as_bytes())
            .await
            .context("writing frame header")?;
        self.writer
            .write_all(&body)
            .await
            .context("writing frame body")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }

    /// Shut down the underlying stream, signalling EOF to the backend.
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await.context("closing backend stdin")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encode(messages: &[serde_json::Value]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        for msg in messages {
            writer.write_frame(msg).await.unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn test_reads_back_consecutive_frames() {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "textDocument/hover",
            "params": { "textDocument": { "uri": "file:///a.py" }, "position": { "line": 1, "character": 2 } }
        });
        let response = serde_json::json!({"jsonrpc": "2.0", "id": 3, "result": null});
        let buf = encode(&[request.clone(), response.clone()]).await;

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap(), Some(request));
        assert_eq!(reader.read_frame().await.unwrap(), Some(response));
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let mut reader = FrameReader::new(&b""[..]);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_header_key_is_case_insensitive_and_extra_headers_ignored() {
        let body = r#"{"jsonrpc":"2.0","id":9,"result":[]}"#;
        let frame = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: {}\r\n\r\n{body}",
            body.len()
        );
        let mut reader = FrameReader::new(frame.as_bytes());
        let value = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(value["id"], 9);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_errors() {
        let cases: [&[u8]; 6] = [
            b"Content-Type: application/json\r\n\r\n{}",
            b"Content-Length: 10\r\n",
            b"Content-Length: 100\r\n\r\n{\"a\":1}",
            b"Content-Length: twelve\r\n\r\n",
            b"Content-Length: 3\r\n\r\nnot",
            b"garbage without colon\r\n\r\n",
        ];
        for case in cases {
            let mut reader = FrameReader::new(case);
            assert!(
                reader.read_frame().await.is_err(),
                "expected error for {:?}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_allocation() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut reader = FrameReader::new(header.as_bytes());
        let err = reader.read_frame().await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_length_counts_bytes_not_chars() {
        let msg = serde_json::json!({"message": "variable 'é' is undefined"});
        let buf = encode(std::slice::from_ref(&msg)).await;
        let body = serde_json::to_vec(&msg).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with(&format!("Content-Length: {}\r\n\r\n", body.len())));

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap(), Some(msg));
    }

    #[tokio::test]
    async fn test_bad_body_does_not_desync_stream() {
        let good = serde_json::json!({"jsonrpc": "2.0", "id": 2, "result": {}});
        let mut buf = b"Content-Length: 5\r\n\r\n{oops".to_vec();
        buf.extend(encode(std::slice::from_ref(&good)).await);

        let mut reader = FrameReader::new(buf.as_slice());
        let bad = reader.read_body().await.unwrap().unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&bad).is_err());
        assert_eq!(reader.read_frame().await.unwrap(), Some(good));
    }

    #[tokio::test]
    async fn test_close_signals_eof() {
        let (client, server) = tokio::io::duplex(64);
        let writer = FrameWriter::new(client);
        writer.close().await.unwrap();

        let mut reader = FrameReader::new(server);
        assert!(reader.read_frame().await.unwrap().is_none());
    }
}
