//! Bridge wire format
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON envelope of len bytes]
//! ```
//!
//! The envelope is `{type, address, correlation_id, payload, error,
//! timeout_ms}`; fields a frame type does not use are omitted.

use crate::bus::{CorrelationId, Reply, ReplyError};
use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    Ping,
    Pong,
    Send,
    Publish,
    Reply,
    Register,
    Unregister,
    Error,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Ping => "PING",
            FrameType::Pong => "PONG",
            FrameType::Send => "SEND",
            FrameType::Publish => "PUBLISH",
            FrameType::Reply => "REPLY",
            FrameType::Register => "REGISTER",
            FrameType::Unregister => "UNREGISTER",
            FrameType::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Frame {
    fn bare(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            address: None,
            correlation_id: None,
            payload: Value::Null,
            error: None,
            timeout_ms: None,
        }
    }

    pub fn ping() -> Self {
        Self::bare(FrameType::Ping)
    }

    pub fn pong() -> Self {
        Self::bare(FrameType::Pong)
    }

    pub fn send(
        address: impl Into<String>,
        correlation_id: CorrelationId,
        payload: Value,
        timeout_ms: Option<u64>,
    ) -> Self {
        Self {
            address: Some(address.into()),
            correlation_id: Some(correlation_id),
            payload,
            timeout_ms,
            ..Self::bare(FrameType::Send)
        }
    }

    pub fn publish(address: impl Into<String>, correlation_id: CorrelationId, payload: Value) -> Self {
        Self {
            address: Some(address.into()),
            correlation_id: Some(correlation_id),
            payload,
            ..Self::bare(FrameType::Publish)
        }
    }

    pub fn reply(reply: &Reply) -> Self {
        Self {
            correlation_id: Some(reply.correlation_id.clone()),
            payload: reply.payload.clone().unwrap_or(Value::Null),
            error: reply.error.clone(),
            ..Self::bare(FrameType::Reply)
        }
    }

    pub fn register(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::bare(FrameType::Register)
        }
    }

    pub fn unregister(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::bare(FrameType::Unregister)
        }
    }

    pub fn error(correlation_id: Option<CorrelationId>, err: &CoreError) -> Self {
        Self {
            correlation_id,
            error: Some(ReplyError::from(err)),
            ..Self::bare(FrameType::Error)
        }
    }

    /// Address, or a protocol error naming the frame type
    pub fn require_address(&self) -> Result<&str, FrameError> {
        self.address
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| FrameError::Malformed(format!("{} frame without address", self.frame_type)))
    }

    pub fn require_correlation_id(&self) -> Result<&CorrelationId, FrameError> {
        self.correlation_id.as_ref().ok_or_else(|| {
            FrameError::Malformed(format!("{} frame without correlation_id", self.frame_type))
        })
    }

    /// Interpret a REPLY or ERROR frame as a bus reply
    pub fn into_reply(self) -> Result<Reply, FrameError> {
        let correlation_id = self.require_correlation_id()?.clone();
        Ok(match self.error {
            None => Reply::ok(correlation_id, self.payload),
            Some(error) => Reply::failed(
                correlation_id,
                &CoreError::from_kind(error.kind, error.message),
            ),
        })
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

impl FrameError {
    /// Whether the stream is still aligned on a frame boundary
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Malformed(_))
    }
}

impl From<FrameError> for CoreError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => CoreError::DependencyFailure(format!("bridge io: {e}")),
            other => CoreError::ProtocolError(other.to_string()),
        }
    }
}

pub fn encode_frame(frame: &Frame, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(frame)
        .map_err(|e| FrameError::Malformed(format!("unserialisable frame: {e}")))?;
    if body.len() > max_frame_bytes {
        return Err(FrameError::TooLarge {
            size: body.len(),
            max: max_frame_bytes,
        });
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Read one frame; `None` on clean EOF at a frame boundary
///
/// An oversized length prefix is rejected before the body is read, which
/// leaves the stream misaligned. A body that is not a valid envelope has
/// been consumed in full, so the stream stays usable.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<Frame>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_bytes {
        return Err(FrameError::TooLarge {
            size: len,
            max: max_frame_bytes,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| FrameError::Malformed(e.to_string()))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
    max_frame_bytes: usize,
) -> Result<(), FrameError> {
    let buf = encode_frame(frame, max_frame_bytes)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;
    use serde_json::json;

    const MAX: usize = 64 * 1024;

    #[test]
    fn test_envelope_uses_wire_names_and_omits_unused_fields() {
        let frame = Frame::send("todo.get", CorrelationId::new("c-1"), json!({"id": 7}), Some(250));
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "SEND",
                "address": "todo.get",
                "correlation_id": "c-1",
                "payload": {"id": 7},
                "timeout_ms": 250
            })
        );
        assert_eq!(serde_json::to_value(Frame::ping()).unwrap(), json!({"type": "PING"}));
    }

    #[tokio::test]
    async fn test_frames_share_a_stream() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Frame::ping(), MAX).await.unwrap();
        write_frame(&mut wire, &Frame::register("todo.changed"), MAX).await.unwrap();

        let mut reader = wire.as_slice();
        assert_eq!(read_frame(&mut reader, MAX).await.unwrap(), Some(Frame::ping()));
        assert_eq!(
            read_frame(&mut reader, MAX).await.unwrap(),
            Some(Frame::register("todo.changed"))
        );
        assert_eq!(read_frame(&mut reader, MAX).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_prefix_rejected_before_body() {
        let mut wire = (MAX as u32 + 1).to_be_bytes().to_vec();
        wire.extend_from_slice(b"{}");

        let err = read_frame(&mut wire.as_slice(), MAX).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_unknown_type_is_recoverable() {
        let body = br#"{"type":"TELEPORT"}"#;
        let mut wire = (body.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(body);
        write_frame(&mut wire, &Frame::pong(), MAX).await.unwrap();

        let mut reader = wire.as_slice();
        let err = read_frame(&mut reader, MAX).await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(read_frame(&mut reader, MAX).await.unwrap(), Some(Frame::pong()));
    }

    #[test]
    fn test_error_frame_becomes_failed_reply() {
        let frame = Frame::error(
            Some(CorrelationId::new("c-9")),
            &CoreError::BreakerOpen {
                operation_key: "store:todo_by_id".to_string(),
            },
        );
        let reply = frame.into_reply().unwrap();
        assert_eq!(reply.error_kind(), Some(ErrorKind::BreakerOpen));
    }

    #[test]
    fn test_send_without_address_is_malformed() {
        let frame = Frame {
            address: None,
            ..Frame::send("x", CorrelationId::new("c"), Value::Null, None)
        };
        assert!(matches!(frame.require_address(), Err(FrameError::Malformed(_))));
    }

    proptest! {
        #[test]
        fn prop_arbitrary_bodies_never_panic_and_stay_aligned(body in proptest::collection::vec(any::<u8>(), 0..256)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let mut wire = (body.len() as u32).to_be_bytes().to_vec();
                wire.extend_from_slice(&body);
                write_frame(&mut wire, &Frame::ping(), MAX).await.unwrap();

                let mut reader = wire.as_slice();
                match read_frame(&mut reader, MAX).await {
                    Ok(_) => {}
                    Err(err) => prop_assert!(err.is_recoverable()),
                }
                prop_assert_eq!(read_frame(&mut reader, MAX).await.unwrap(), Some(Frame::ping()));
                Ok(())
            })?;
        }
    }
}
