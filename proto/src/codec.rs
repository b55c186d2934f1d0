//! `Content-Length` framing for JSON-RPC messages.
//!
//! Language servers frame every message as `Content-Length: N\r\n\r\n{json}`
//! over a byte stream. [`FrameReader`] and [`FrameWriter`] implement that
//! framing over any async reader/writer.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single frame body (8 MiB). Protects against a
/// misbehaving server streaming an absurd Content-Length.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Errors produced while reading or writing framed messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES}-byte limit")]
    FrameTooLarge(usize),
    #[error("stream ended in the middle of a frame")]
    UnexpectedEof,
    #[error("malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads framed JSON-RPC messages from an async byte stream.
pub struct FrameReader<R> {
    input: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: BufReader::new(input),
            line: String::new(),
        }
    }

    /// Read the next frame, or `Ok(None)` on a clean EOF between frames.
    ///
    /// EOF inside a header block or body is an error, not a clean close.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, CodecError> {
        let Some(length) = self.read_content_length().await? else {
            return Ok(None);
        };

        if length > MAX_FRAME_BYTES {
            return Err(CodecError::FrameTooLarge(length));
        }

        let mut body = vec![0u8; length];
        self.input
            .read_exact(&mut body)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => CodecError::UnexpectedEof,
                _ => CodecError::Io(e),
            })?;

        Ok(Some(serde_json::from_slice(&body)?))
    }

    /// Consume header lines up to the blank separator and return the
    /// Content-Length, or `None` if EOF arrives before any header byte.
    async fn read_content_length(&mut self) -> Result<Option<usize>, CodecError> {
        let mut length: Option<usize> = None;
        let mut in_headers = false;

        loop {
            self.line.clear();
            if self.input.read_line(&mut self.line).await? == 0 {
                if in_headers {
                    return Err(CodecError::UnexpectedEof);
                }
                return Ok(None);
            }
            in_headers = true;

            let header = self.line.trim_end_matches(['\r', '\n']);
            if header.is_empty() {
                break;
            }

            // Headers are nominally fixed-case; parse leniently.
            if let Some((name, value)) = header.split_once(':')
                && name.trim().eq_ignore_ascii_case("Content-Length")
            {
                let value = value.trim();
                length = Some(
                    value
                        .parse()
                        .map_err(|_| CodecError::InvalidContentLength(value.to_string()))?,
                );
            }
            // Other headers (Content-Type) carry no information we need.
        }

        length.map(Some).ok_or(CodecError::MissingContentLength)
    }
}

/// Writes framed JSON-RPC messages to an async byte stream.
pub struct FrameWriter<W> {
    output: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    /// Serialize `message` and write it with its Content-Length header.
    pub async fn write_frame(&mut self, message: &serde_json::Value) -> Result<(), CodecError> {
        let body = serde_json::to_vec(message)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        self.output.write_all(header.as_bytes()).await?;
        self.output.write_all(&body).await?;
        self.output.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(bytes: &[u8]) -> Result<Option<serde_json::Value>, CodecError> {
        FrameReader::new(bytes).read_frame().await
    }

    #[tokio::test]
    async fn writes_then_reads_back() {
        let message = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didOpen",
            "params": { "textDocument": { "uri": "file:///a.rs" } }
        });

        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write_frame(&message).await.unwrap();

        let echoed = read_all(&buf).await.unwrap().unwrap();
        assert_eq!(echoed, message);
    }

    #[tokio::test]
    async fn reads_consecutive_frames() {
        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&serde_json::json!({"id": 1})).await.unwrap();
        writer.write_frame(&serde_json::json!({"id": 2})).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap()["id"], 1);
        assert_eq!(reader.read_frame().await.unwrap().unwrap()["id"], 2);
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        assert!(read_all(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_headers_is_error() {
        let err = read_all(b"Content-Length: 10\r\n").await.unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedEof));
    }

    #[tokio::test]
    async fn eof_inside_body_is_error() {
        let err = read_all(b"Content-Length: 50\r\n\r\n{\"id\"").await.unwrap_err();
        assert!(matches!(err, CodecError::UnexpectedEof));
    }

    #[tokio::test]
    async fn missing_content_length_is_error() {
        let err = read_all(b"Content-Type: application/json\r\n\r\n{}")
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::MissingContentLength));
    }

    #[tokio::test]
    async fn unparsable_content_length_is_error() {
        let err = read_all(b"Content-Length: banana\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, CodecError::InvalidContentLength(_)));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_before_allocation() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let err = read_all(header.as_bytes()).await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn header_name_is_case_insensitive() {
        let body = r#"{"jsonrpc":"2.0","id":7}"#;
        let framed = format!("content-length: {}\r\n\r\n{body}", body.len());
        let value = read_all(framed.as_bytes()).await.unwrap().unwrap();
        assert_eq!(value["id"], 7);
    }

    #[tokio::test]
    async fn extra_headers_are_skipped() {
        let body = r#"{"id":1}"#;
        let framed = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
            body.len(),
        );
        let value = read_all(framed.as_bytes()).await.unwrap().unwrap();
        assert_eq!(value["id"], 1);
    }

    #[tokio::test]
    async fn content_length_counts_bytes_not_chars() {
        // "ß" is two bytes in UTF-8; the header must reflect bytes.
        let message = serde_json::json!({"s": "ß"});
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write_frame(&message).await.unwrap();

        let body = serde_json::to_string(&message).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with(&format!("Content-Length: {}\r\n\r\n", body.len())));
        assert_eq!(read_all(&buf).await.unwrap().unwrap()["s"], "ß");
    }

    #[tokio::test]
    async fn garbage_body_is_json_error() {
        let framed = b"Content-Length: 9\r\n\r\nnot-json!";
        let err = read_all(framed).await.unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }
}
