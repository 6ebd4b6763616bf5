//! Message envelope and wire framing shared by every Iris service container.
//!
//! A [`Message`] is immutable after construction (besides the body, which the owner may still
//! mutate before sending). [`Message::pack_frames`]/[`Message::unpack_frames`] convert to and
//! from the ordered frame sequence `[id, kind, subject, source, headers, body]`, the rendering
//! of the source system's peer-identified router socket atop a length-delimited TCP stream.
use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use iris_trace::Headers;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;
use tokio_util::codec::LengthDelimitedCodec;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed message frame: {0}")]
    BadFrame(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Number of frames a well-formed message unpacks into.
pub const FRAME_COUNT: usize = 6;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Req,
    Rep,
    Ack,
    Nack,
    Err,
}

/// A message in flight between two containers.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    /// For `Req`, `<service>.<method>`; for replies, the id of the originating `Req`.
    pub subject: String,
    pub source: String,
    pub headers: Headers,
    pub body: Value,
}

impl Message {
    /// Build a new request, tagged with the caller's current trace.
    pub fn request(subject: impl Into<String>, source: impl Into<String>, body: Value) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            kind: MessageKind::Req,
            subject: subject.into(),
            source: source.into(),
            headers: iris_trace::headers(),
            body,
        }
    }

    fn reply_like(kind: MessageKind, request: &Message, source: impl Into<String>, body: Value) -> Self {
        Message {
            id: Uuid::new_v4().to_string(),
            kind,
            subject: request.id.clone(),
            source: source.into(),
            headers: iris_trace::headers(),
            body,
        }
    }

    /// Build a successful reply correlated with `request`.
    pub fn reply(request: &Message, source: impl Into<String>, body: Value) -> Self {
        Self::reply_like(MessageKind::Rep, request, source, body)
    }

    /// Build a bare acknowledgement correlated with `request`.
    pub fn ack(request: &Message, source: impl Into<String>) -> Self {
        Self::reply_like(MessageKind::Ack, request, source, Value::Null)
    }

    /// Build a negative acknowledgement; `requeue` asks the peer to redeliver.
    pub fn nack(request: &Message, source: impl Into<String>, requeue: bool) -> Self {
        Self::reply_like(
            MessageKind::Nack,
            request,
            source,
            serde_json::json!({ "requeue": requeue }),
        )
    }

    /// Build an error reply correlated with `request`.
    pub fn error(request: &Message, source: impl Into<String>, kind: &str, detail: impl Into<String>) -> Self {
        Self::reply_like(
            MessageKind::Err,
            request,
            source,
            serde_json::json!({ "kind": kind, "detail": detail.into() }),
        )
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, MessageKind::Req)
    }

    pub fn is_reply(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::Rep | MessageKind::Ack | MessageKind::Nack | MessageKind::Err
        )
    }

    /// Whether this message is a reply correlated with the given request.
    pub fn correlates_with(&self, request: &Message) -> bool {
        self.is_reply() && self.subject == request.id
    }

    /// Serialize to the ordered frame sequence. Each frame is independently JSON-encoded.
    pub fn pack_frames(&self) -> Result<Vec<Bytes>> {
        Ok(vec![
            serde_json::to_vec(&self.id)
                .map_err(|e| Error::BadFrame(format!("encoding id: {e}")))?
                .into(),
            serde_json::to_vec(&self.kind)
                .map_err(|e| Error::BadFrame(format!("encoding kind: {e}")))?
                .into(),
            serde_json::to_vec(&self.subject)
                .map_err(|e| Error::BadFrame(format!("encoding subject: {e}")))?
                .into(),
            serde_json::to_vec(&self.source)
                .map_err(|e| Error::BadFrame(format!("encoding source: {e}")))?
                .into(),
            serde_json::to_vec(&self.headers)
                .map_err(|e| Error::BadFrame(format!("encoding headers: {e}")))?
                .into(),
            serde_json::to_vec(&self.body)
                .map_err(|e| Error::BadFrame(format!("encoding body: {e}")))?
                .into(),
        ])
    }

    /// Parse the ordered frame sequence back into a message.
    ///
    /// The id frame is decoded first so later failures can still be logged with a correlation
    /// id when the frame set is otherwise malformed.
    pub fn unpack_frames(frames: &[Bytes]) -> Result<Self> {
        if frames.len() != FRAME_COUNT {
            return Err(Error::BadFrame(format!(
                "expected {FRAME_COUNT} frames, got {}",
                frames.len()
            )));
        }
        let id: String = serde_json::from_slice(&frames[0])
            .map_err(|e| Error::BadFrame(format!("malformed id frame: {e}")))?;
        let kind: MessageKind = serde_json::from_slice(&frames[1])
            .map_err(|e| Error::BadFrame(format!("id={id}: malformed kind frame: {e}")))?;
        let subject: String = serde_json::from_slice(&frames[2])
            .map_err(|e| Error::BadFrame(format!("id={id}: malformed subject frame: {e}")))?;
        let source: String = serde_json::from_slice(&frames[3])
            .map_err(|e| Error::BadFrame(format!("id={id}: malformed source frame: {e}")))?;
        let headers: Headers = serde_json::from_slice(&frames[4])
            .map_err(|e| Error::BadFrame(format!("id={id}: malformed headers frame: {e}")))?;
        let body: Value = serde_json::from_slice(&frames[5])
            .map_err(|e| Error::BadFrame(format!("id={id}: malformed body frame: {e}")))?;
        Ok(Message {
            id,
            kind,
            subject,
            source,
            headers,
            body,
        })
    }
}

fn encode_subframes(frames: &[Bytes]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u16(frames.len() as u16);
    for frame in frames {
        buf.put_u32(frame.len() as u32);
        buf.extend_from_slice(frame);
    }
    buf
}

fn decode_subframes(mut buf: Bytes) -> Result<Vec<Bytes>> {
    if buf.remaining() < 2 {
        return Err(Error::BadFrame("truncated frame count".to_string()));
    }
    let count = buf.get_u16() as usize;
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.remaining() < 4 {
            return Err(Error::BadFrame("truncated frame length prefix".to_string()));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(Error::BadFrame("truncated frame body".to_string()));
        }
        frames.push(buf.split_to(len));
    }
    Ok(frames)
}

/// Codec for a [`Message`] atop a length-delimited byte stream.
///
/// Each on-wire record is one outer length-delimited frame whose payload is the message's
/// sub-frames, each itself length-prefixed, so a whole message is read or written atomically.
pub struct MessageCodec(LengthDelimitedCodec);

impl Default for MessageCodec {
    fn default() -> Self {
        MessageCodec(
            LengthDelimitedCodec::builder()
                .big_endian()
                .length_field_length(4)
                .max_frame_length(1 << 24)
                .new_codec(),
        )
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        let frames = message.pack_frames()?;
        let payload = encode_subframes(&frames).freeze();
        self.0
            .encode(payload, dst)
            .map_err(|e| Error::BadFrame(e.to_string()))
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match self.0.decode(src).map_err(|e| Error::BadFrame(e.to_string()))? {
            Some(payload) => {
                let frames = decode_subframes(payload.freeze())?;
                Message::unpack_frames(&frames).map(Some)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_reply_round_trip_through_frames() {
        let request = Message::request("echo.ping", "tcp://127.0.0.1:4000", serde_json::json!({"n": 1}));
        let frames = request.pack_frames().expect("pack");
        let unpacked = Message::unpack_frames(&frames).expect("unpack");
        assert_eq!(request, unpacked);
    }

    #[test]
    fn reply_subject_is_request_id() {
        let request = Message::request("echo.ping", "tcp://a", Value::Null);
        let reply = Message::reply(&request, "tcp://b", serde_json::json!("pong"));
        assert_eq!(reply.subject, request.id);
        assert!(reply.correlates_with(&request));
        assert!(!request.correlates_with(&request));
    }

    #[test]
    fn wrong_frame_count_is_bad_frame() {
        let frames = vec![Bytes::from_static(b"\"only-one\"")];
        let err = Message::unpack_frames(&frames).unwrap_err();
        assert!(matches!(err, Error::BadFrame(_)));
    }

    #[test]
    fn malformed_frame_after_id_mentions_id_in_error() {
        let id = serde_json::to_vec(&"req-123").unwrap();
        let frames = vec![
            id.into(),
            Bytes::from_static(b"not json"),
            Bytes::from_static(b"\"s\""),
            Bytes::from_static(b"\"src\""),
            Bytes::from_static(b"{}"),
            Bytes::from_static(b"null"),
        ];
        let err = Message::unpack_frames(&frames).unwrap_err();
        let Error::BadFrame(message) = err;
        assert!(message.contains("req-123"), "error should mention id: {message}");
    }

    #[test]
    fn codec_round_trips_through_bytes() {
        let message = Message::request("echo.ping", "tcp://127.0.0.1:4000", serde_json::json!([1, 2, 3]));
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(message.clone(), &mut buf).expect("encode");
        let decoded = codec.decode(&mut buf).expect("decode").expect("complete frame");
        assert_eq!(message, decoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_waits_for_more_bytes_on_partial_frame() {
        let message = Message::request("echo.ping", "tcp://127.0.0.1:4000", Value::Null);
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(message, &mut buf).expect("encode");
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).expect("decode").is_none());
    }
}
