//! Framed codec for worker communication.
//!
//! Every message in both directions is a header block followed by a JSON body:
//!
//! ```text
//! Content-Length: <decimal-byte-count>\r\n
//! \r\n
//! <json-body>
//! ```
//!
//! `ContentLengthCodec` does the framing, `JsonCodec` adds serde_json on top.
//! Works over any AsyncRead/AsyncWrite (pipes, in-memory duplex streams, etc).

use std::io;
use std::marker::PhantomData;

use futures::{Stream, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a declared body length.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// A header block that grows past this without a terminator is garbage.
const MAX_HEADER_LENGTH: usize = 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The stream closed (or would have to be read past the length limit)
    /// before a whole frame was available.
    #[error("incomplete message: {0}")]
    IncompleteMessage(String),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// The frame was complete but its body is not the expected JSON.
    #[error("malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CodecError {
    pub fn incomplete(reason: impl Into<String>) -> Self {
        Self::IncompleteMessage(reason.into())
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::IncompleteMessage(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Body(usize),
}

/// Content-Length framing. Yields raw frame bodies.
#[derive(Debug)]
pub struct ContentLengthCodec {
    max_length: usize,
    state: DecodeState,
}

impl Default for ContentLengthCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentLengthCodec {
    pub fn new() -> Self {
        Self {
            max_length: MAX_FRAME_LENGTH,
            state: DecodeState::Head,
        }
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<usize>, CodecError> {
        let Some(end) = find_terminator(src) else {
            if src.len() > MAX_HEADER_LENGTH {
                return Err(CodecError::MalformedHeader(format!(
                    "no header terminator within {} bytes",
                    MAX_HEADER_LENGTH
                )));
            }
            return Ok(None);
        };

        let head = src.split_to(end + HEADER_TERMINATOR.len());
        let length = parse_content_length(&head[..end])?;

        if length > self.max_length {
            return Err(CodecError::incomplete(format!(
                "declared length {} exceeds limit of {} bytes",
                length, self.max_length
            )));
        }

        Ok(Some(length))
    }
}

fn find_terminator(src: &[u8]) -> Option<usize> {
    src.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// Extract Content-Length from a header block (case-insensitive, other headers ignored).
fn parse_content_length(head: &[u8]) -> Result<usize, CodecError> {
    let head = std::str::from_utf8(head)
        .map_err(|_| CodecError::MalformedHeader("header is not valid UTF-8".to_string()))?;

    for line in head.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("Content-Length") {
            let value = value.trim();
            return value.parse().map_err(|_| {
                CodecError::MalformedHeader(format!("invalid Content-Length value: {}", value))
            });
        }
    }

    Err(CodecError::MalformedHeader(
        "missing Content-Length header".to_string(),
    ))
}

impl Decoder for ContentLengthCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match self.state {
            DecodeState::Head => match self.decode_head(src)? {
                Some(length) => {
                    self.state = DecodeState::Body(length);
                    src.reserve(length.saturating_sub(src.len()));
                    length
                }
                None => return Ok(None),
            },
            DecodeState::Body(length) => length,
        };

        if src.len() < length {
            return Ok(None);
        }

        self.state = DecodeState::Head;
        Ok(Some(src.split_to(length).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        match self.state {
            DecodeState::Head if src.is_empty() => Ok(None),
            DecodeState::Head => Err(CodecError::incomplete(format!(
                "stream closed inside a header ({} bytes buffered)",
                src.len()
            ))),
            DecodeState::Body(length) => Err(CodecError::incomplete(format!(
                "stream closed after {} of {} body bytes",
                src.len(),
                length
            ))),
        }
    }
}

impl Encoder<Bytes> for ContentLengthCodec {
    type Error = CodecError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if body.len() > self.max_length {
            return Err(CodecError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame of {} bytes exceeds limit of {} bytes",
                    body.len(),
                    self.max_length
                ),
            )));
        }

        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

/// Codec that frames messages with Content-Length and serializes with JSON.
///
/// Wraps ContentLengthCodec and adds serde_json serialization.
pub struct JsonCodec<T> {
    inner: ContentLengthCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: ContentLengthCodec::new(),
            _phantom: PhantomData,
        }
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.inner = self.inner.with_max_length(max_length);
        self
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode_eof(src)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 100_000 {
            tracing::debug!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// Serialize `body` into a complete frame.
pub fn encode_frame<T: Serialize>(body: &T) -> Result<BytesMut, CodecError> {
    let mut dst = BytesMut::new();
    ContentLengthCodec::new().encode(Bytes::from(serde_json::to_vec(body)?), &mut dst)?;
    Ok(dst)
}

/// Await the next frame; a stream that ends first is an incomplete message.
pub async fn next_frame<S, T>(frames: &mut S) -> Result<T, CodecError>
where
    S: Stream<Item = Result<T, CodecError>> + Unpin,
{
    match frames.next().await {
        Some(frame) => frame,
        None => Err(CodecError::incomplete(
            "stream closed before a frame arrived",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Params, Request, Response};
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    fn frames<T>(bytes: &'static [u8]) -> FramedRead<&'static [u8], JsonCodec<T>> {
        FramedRead::new(bytes, JsonCodec::new())
    }

    fn name_params(name: &str) -> Params {
        let mut params = Params::new();
        params.insert("name".to_string(), json!(name));
        params
    }

    #[test]
    fn encoded_frame_is_byte_exact() {
        let frame = encode_frame(&Request::new("model", None)).unwrap();
        assert_eq!(&frame[..], b"Content-Length: 18\r\n\r\n{\"method\":\"model\"}");
    }

    #[test]
    fn content_length_counts_bytes_not_chars() {
        let frame = encode_frame(&Response::Result(json!("héllo"))).unwrap();
        assert!(frame.starts_with(b"Content-Length: 19\r\n\r\n"));
        assert_eq!(frame.len(), "Content-Length: 19\r\n\r\n".len() + 19);
    }

    #[tokio::test]
    async fn request_survives_framing_with_params() {
        let request = Request::new("model", Some(name_params("User")));
        let bytes = encode_frame(&request).unwrap().freeze();

        let mut reader = FramedRead::new(&bytes[..], JsonCodec::<Request>::new());
        let decoded = next_frame(&mut reader).await.unwrap();

        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn request_survives_framing_without_params() {
        let request = Request::shutdown();
        let bytes = encode_frame(&request).unwrap().freeze();

        let mut reader = FramedRead::new(&bytes[..], JsonCodec::<Request>::new());
        let decoded = next_frame(&mut reader).await.unwrap();

        assert_eq!(decoded.method, "shutdown");
        assert!(decoded.params.is_none());
    }

    #[tokio::test]
    async fn back_to_back_frames_decode_in_order() {
        let mut reader = frames::<Response>(
            b"Content-Length: 12\r\n\r\n{\"result\":1}Content-Length: 15\r\n\r\n{\"error\":\"bad\"}",
        );

        assert_eq!(next_frame(&mut reader).await.unwrap(), Response::Result(json!(1)));
        assert_eq!(
            next_frame(&mut reader).await.unwrap(),
            Response::Error("bad".to_string())
        );
        assert!(next_frame(&mut reader).await.unwrap_err().is_incomplete());
    }

    #[tokio::test]
    async fn truncated_body_is_incomplete() {
        let mut reader = frames::<Response>(b"Content-Length: 50\r\n\r\n{\"result\"");
        let err = next_frame(&mut reader).await.unwrap_err();
        assert!(err.is_incomplete(), "expected incomplete, got: {}", err);
    }

    #[tokio::test]
    async fn closed_stream_without_header_is_incomplete() {
        let mut reader = frames::<Response>(b"");
        let err = next_frame(&mut reader).await.unwrap_err();
        assert!(err.is_incomplete(), "expected incomplete, got: {}", err);
    }

    #[tokio::test]
    async fn partial_header_is_incomplete() {
        let mut reader = frames::<Response>(b"Content-Len");
        let err = next_frame(&mut reader).await.unwrap_err();
        assert!(err.is_incomplete(), "expected incomplete, got: {}", err);
    }

    #[tokio::test]
    async fn malformed_json_is_distinct_from_incomplete() {
        let mut reader = frames::<Response>(b"Content-Length: 5\r\n\r\n{oops");
        let err = next_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, CodecError::Json(_)), "got: {}", err);
    }

    #[tokio::test]
    async fn missing_content_length_is_malformed() {
        let mut reader = frames::<Response>(b"Content-Type: application/json\r\n\r\n{}");
        let err = next_frame(&mut reader).await.unwrap_err();
        assert!(
            err.to_string().contains("missing Content-Length"),
            "got: {}",
            err
        );
    }

    #[tokio::test]
    async fn header_name_is_case_insensitive() {
        let mut reader = frames::<Response>(
            b"content-length: 12\r\nContent-Type: application/json\r\n\r\n{\"result\":1}",
        );
        assert_eq!(next_frame(&mut reader).await.unwrap(), Response::Result(json!(1)));
    }

    #[tokio::test]
    async fn oversized_declared_length_is_incomplete() {
        let mut reader = FramedRead::new(
            &b"Content-Length: 9\r\n\r\n{\"a\":123}"[..],
            JsonCodec::<Response>::new().with_max_length(8),
        );
        let err = next_frame(&mut reader).await.unwrap_err();
        assert!(err.is_incomplete(), "expected incomplete, got: {}", err);
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[tokio::test]
    async fn frame_split_across_writes_is_reassembled() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            for chunk in [&b"Content-Le"[..], b"ngth: 12\r\n", b"\r\n{\"res", b"ult\":1}"] {
                tx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            tx
        });

        let mut reader = FramedRead::new(rx, JsonCodec::<Response>::new());
        let decoded = next_frame(&mut reader).await.unwrap();
        assert_eq!(decoded, Response::Result(json!(1)));
        drop(writer.await.unwrap());
    }
}
