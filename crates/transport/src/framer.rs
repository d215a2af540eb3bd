//! Message Framer
//!
//! Splits a raw byte stream into JSON envelopes by tracking brace depth and
//! string/escape state, and writes envelopes back as newline-terminated JSON.
//!
//! Readers never rely on newlines: payloads may contain braces and newlines
//! inside strings. Scanning works on bytes; every structural character is
//! ASCII and UTF-8 continuation bytes never collide with ASCII.

use crate::error::RpcError;
use crate::types::{Message, Params};
use flowline_core::Result;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Frames larger than this are discarded (16 MiB)
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Request ids are unique for the lifetime of the process
static NEXT_REQUEST_ID: AtomicI64 = AtomicI64::new(1);

fn next_request_id() -> i64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Failed to parse message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Lexical state of the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Outside any string literal
    Idle,
    /// Inside a string literal
    InString,
    /// Right after a backslash inside a string; next byte is literal
    Escaped,
}

/// Incremental brace-depth frame scanner
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    depth: usize,
    state: ScanState,
    max_frame: usize,
    overflowed: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buffer: Vec::new(),
            depth: 0,
            state: ScanState::Idle,
            max_frame,
            overflowed: false,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// True while part of an envelope has been seen
    pub fn in_frame(&self) -> bool {
        self.depth > 0
    }

    /// Feed one byte; returns a result when it completes an envelope
    pub fn push(&mut self, byte: u8) -> Option<std::result::Result<Message, FrameError>> {
        match self.state {
            ScanState::Escaped => {
                self.state = ScanState::InString;
            }
            ScanState::InString => match byte {
                b'"' => self.state = ScanState::Idle,
                b'\\' => self.state = ScanState::Escaped,
                _ => {}
            },
            ScanState::Idle => {
                if self.depth == 0 && byte != b'{' {
                    if !byte.is_ascii_whitespace() {
                        debug!(byte = byte, "Skipping byte outside of an envelope");
                    }
                    return None;
                }
                match byte {
                    b'"' => self.state = ScanState::InString,
                    b'{' => self.depth += 1,
                    b'}' => self.depth -= 1,
                    _ => {}
                }
            }
        }

        self.append(byte);

        if self.depth == 0 {
            return Some(self.finish());
        }
        None
    }

    fn append(&mut self, byte: u8) {
        if self.overflowed {
            return;
        }
        if self.buffer.len() >= self.max_frame {
            self.overflowed = true;
            self.buffer = Vec::new();
            return;
        }
        self.buffer.push(byte);
    }

    fn finish(&mut self) -> std::result::Result<Message, FrameError> {
        let buffer = std::mem::take(&mut self.buffer);
        self.state = ScanState::Idle;

        if std::mem::take(&mut self.overflowed) {
            return Err(FrameError::TooLarge {
                limit: self.max_frame,
            });
        }
        Ok(serde_json::from_slice(&buffer)?)
    }
}

/// Read half: yields complete envelopes from a byte stream
pub struct FramedReader<R> {
    reader: BufReader<R>,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_decoder(reader, FrameDecoder::default())
    }

    pub fn with_decoder(reader: R, decoder: FrameDecoder) -> Self {
        Self {
            reader: BufReader::new(reader),
            decoder,
        }
    }

    /// Next complete envelope, or `None` at end of stream
    ///
    /// Malformed frames are logged and skipped. Only I/O failures are
    /// returned as errors. Cancel-safe: no input is lost if the future is
    /// dropped while waiting for bytes.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            let (consumed, frame) = {
                let buf = self.reader.fill_buf().await?;
                if buf.is_empty() {
                    if self.decoder.in_frame() {
                        warn!(
                            depth = self.decoder.depth(),
                            "Stream closed in the middle of an envelope"
                        );
                    }
                    return Ok(None);
                }

                let mut consumed = buf.len();
                let mut frame = None;
                for (i, byte) in buf.iter().enumerate() {
                    if let Some(result) = self.decoder.push(*byte) {
                        consumed = i + 1;
                        frame = Some(result);
                        break;
                    }
                }
                (consumed, frame)
            };
            self.reader.consume(consumed);

            match frame {
                Some(Ok(message)) => return Ok(Some(message)),
                Some(Err(e)) => warn!(error = %e, "Dropping undecodable frame"),
                None => {}
            }
        }
    }
}

/// Write half: serializes envelopes, one per line
///
/// Cloneable; clones share the underlying sink, so concurrent writers never
/// interleave bytes of different envelopes.
pub struct FramedWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for FramedWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Write one envelope plus a newline and flush
    pub async fn write_message(&self, message: &Message) -> Result<()> {
        let mut bytes = serde_json::to_vec(message)?;
        bytes.push(b'\n');

        let mut writer = self.inner.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send a request; returns its freshly assigned id
    pub async fn send(&self, method: &str, params: Option<Params>) -> Result<i64> {
        let id = next_request_id();
        self.write_message(&Message::request(id, method, params))
            .await?;
        Ok(id)
    }

    /// Send a response to `request_id`
    ///
    /// An `error` replaces any `result`; a response never carries both.
    /// With neither, a `null` result is sent so the envelope is still
    /// recognizable as a response.
    pub async fn send_response(
        &self,
        request_id: i64,
        result: Option<Value>,
        error: Option<RpcError>,
    ) -> Result<()> {
        let message = match error {
            Some(error) => {
                if result.is_some() {
                    debug!(id = request_id, "Dropping result from error response");
                }
                Message::error_response(request_id, error)
            }
            None => Message::response(request_id, result.unwrap_or(Value::Null)),
        };
        self.write_message(&message).await
    }

    pub async fn send_notification(&self, method: &str, params: Option<Params>) -> Result<()> {
        self.write_message(&Message::notification(method, params))
            .await
    }

    /// Flush and close the sink
    pub async fn shutdown(&self) -> Result<()> {
        let mut writer = self.inner.lock().await;
        writer.flush().await?;
        writer.shutdown().await?;
        Ok(())
    }
}

/// Split a stream pair into framed halves
pub fn framed<R, W>(reader: R, writer: W) -> (FramedReader<R>, FramedWriter<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FramedReader::new(reader), FramedWriter::new(writer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageKind;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    fn decode_all(input: &[u8]) -> Vec<std::result::Result<Message, FrameError>> {
        let mut decoder = FrameDecoder::default();
        input.iter().filter_map(|b| decoder.push(*b)).collect()
    }

    #[test]
    fn test_nested_braces_inside_string() {
        let input =
            b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\",\"params\":{\"note\":\"a{b}c\"}}\n";
        let frames = decode_all(input);

        assert_eq!(frames.len(), 1);
        let msg = frames.into_iter().next().unwrap().unwrap();
        assert_eq!(msg.method.as_deref(), Some("ping"));
        assert_eq!(msg.params.unwrap()["note"], json!("a{b}c"));
    }

    #[test]
    fn test_escaped_quote_does_not_close_string() {
        let input = br#"{"method":"say","params":{"text":"he said \"}\" and left"}}"#;
        let frames = decode_all(input);

        assert_eq!(frames.len(), 1);
        let msg = frames.into_iter().next().unwrap().unwrap();
        assert_eq!(msg.params.unwrap()["text"], json!("he said \"}\" and left"));
    }

    #[test]
    fn test_escaped_backslash_before_quote() {
        // "C:\\" ends with an escaped backslash, so the quote after it closes
        let input = br#"{"method":"open","params":{"path":"C:\\"}}{"method":"next"}"#;
        let frames = decode_all(input);

        assert_eq!(frames.len(), 2);
        let first = frames[0].as_ref().unwrap();
        assert_eq!(first.params.as_ref().unwrap()["path"], json!("C:\\"));
        assert_eq!(frames[1].as_ref().unwrap().method.as_deref(), Some("next"));
    }

    #[test]
    fn test_state_transitions() {
        let mut decoder = FrameDecoder::default();
        for b in br#"{"a":"x\"#.iter() {
            decoder.push(*b);
        }
        assert_eq!(decoder.state(), ScanState::Escaped);
        assert_eq!(decoder.depth(), 1);

        decoder.push(b'"');
        assert_eq!(decoder.state(), ScanState::InString);
        decoder.push(b'"');
        assert_eq!(decoder.state(), ScanState::Idle);
    }

    #[test]
    fn test_malformed_frame_is_reported_and_framing_continues() {
        let input = b"{\"id\":1,,}\n{\"id\":2,\"method\":\"ok\"}\n";
        let frames = decode_all(input);

        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Err(FrameError::Malformed(_))));
        assert_eq!(frames[1].as_ref().unwrap().id, Some(2));
    }

    #[test]
    fn test_junk_between_frames_is_skipped() {
        let input = b"  \r\n} garbage {\"method\":\"a\"}\n\n";
        let frames = decode_all(input);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap().method.as_deref(), Some("a"));
    }

    #[test]
    fn test_oversized_frame_discarded() {
        let mut decoder = FrameDecoder::new(16);
        let big = br#"{"method":"x","params":{"blob":"0123456789abcdef"}}"#;
        let small = br#"{"method":"y"}"#;

        let frames: Vec<_> = big
            .iter()
            .chain(small.iter())
            .filter_map(|b| decoder.push(*b))
            .collect();

        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Err(FrameError::TooLarge { limit: 16 })));
        assert_eq!(frames[1].as_ref().unwrap().method.as_deref(), Some("y"));
    }

    #[test]
    fn test_multibyte_text_passes_through() {
        let input = "{\"method\":\"note\",\"params\":{\"t\":\"caf\u{e9} \u{1f600} {\"}}".as_bytes();
        let frames = decode_all(input);

        assert_eq!(frames.len(), 1);
        let msg = frames.into_iter().next().unwrap().unwrap();
        assert_eq!(msg.params.unwrap()["t"], json!("caf\u{e9} \u{1f600} {"));
    }

    #[tokio::test]
    async fn test_round_trip_through_stream() {
        let (client, server) = tokio::io::duplex(64);
        let writer = FramedWriter::new(client);
        let mut reader = FramedReader::new(server);

        let mut params = Params::new();
        params.insert(
            "tree".to_string(),
            json!({"name": "a {b} \"c\"", "children": [{"x": [1, 2, {"y": null}]}]}),
        );
        let sent = Message::request(42, "outline.create", Some(params));

        let expected = sent.clone();
        let write = tokio::spawn(async move {
            writer.write_message(&sent).await.unwrap();
            writer.send_notification("done", None).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let first = reader.next_message().await.unwrap().unwrap();
        assert_eq!(first, expected);
        let second = reader.next_message().await.unwrap().unwrap();
        assert_eq!(second.kind(), MessageKind::Notification);
        assert!(reader.next_message().await.unwrap().is_none());
        write.await.unwrap();
    }

    #[tokio::test]
    async fn test_written_bytes_are_newline_terminated() {
        let (client, mut server) = tokio::io::duplex(1024);
        let writer = FramedWriter::new(client);

        writer
            .send_response(5, Some(json!({"ok": true})), None)
            .await
            .unwrap();
        writer.shutdown().await.unwrap();

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut out)
            .await
            .unwrap();
        assert_eq!(out, "{\"jsonrpc\":\"2.0\",\"id\":5,\"result\":{\"ok\":true}}\n");
    }

    #[tokio::test]
    async fn test_error_response_drops_result() {
        let (client, mut server) = tokio::io::duplex(1024);
        let writer = FramedWriter::new(client);

        writer
            .send_response(
                6,
                Some(json!({"partial": 1})),
                Some(RpcError::new(4001, "rejected")),
            )
            .await
            .unwrap();
        writer.shutdown().await.unwrap();

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut out)
            .await
            .unwrap();
        assert!(!out.contains("result"), "{}", out);

        let mut reader = FramedReader::new(out.as_bytes());
        let reply = reader.next_message().await.unwrap().unwrap();
        assert_eq!(reply.kind(), MessageKind::Response);
        assert_eq!(reply.id, Some(6));
        assert!(reply.result.is_none());
        assert_eq!(reply.error, Some(RpcError::new(4001, "rejected")));
    }

    #[tokio::test]
    async fn test_request_ids_increase() {
        let (client, _server) = tokio::io::duplex(4096);
        let writer = FramedWriter::new(client);

        let a = writer.send("a", None).await.unwrap();
        let b = writer.send("b", None).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let (mut client, server) = tokio::io::duplex(8);
        let mut reader = FramedReader::new(server);

        let feed = tokio::spawn(async move {
            for chunk in [
                &b"{\"id\":1,"[..],
                &b"\"method\":\"p"[..],
                &b"ing\"}"[..],
                &b"\n"[..],
            ] {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let msg = reader.next_message().await.unwrap().unwrap();
        assert_eq!(msg.method.as_deref(), Some("ping"));
        feed.await.unwrap();
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_error_is_returned() {
        let mock = tokio_test::io::Builder::new()
            .read(b"{\"id\":1,\"method\":\"a\"}{\"id\":")
            .read_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let mut reader = FramedReader::new(mock);

        let msg = reader.next_message().await.unwrap().unwrap();
        assert_eq!(msg.id, Some(1));
        let err = reader.next_message().await.unwrap_err();
        assert!(matches!(err, flowline_core::AppError::Io(_)));
    }
}
