//! Commands, replies and the identifiers that correlate them

use crate::error::{CoreError, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

const CORRELATION_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Opaque token pairing a command with its reply
///
/// Unique for as long as the reply is outstanding; the dispatcher rejects a
/// second command carrying an id that is still awaiting its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a request id: `yyyyMMddHHmmss`, six digits, one uppercase
    /// letter, then sixteen characters from `[A-Z0-9]` (37 characters)
    pub fn generate() -> Self {
        let mut id = chrono::Utc::now().format("%Y%m%d%H%M%S").to_string();
        id.push_str(&format!("{:06}", fastrand::u32(0..1_000_000)));
        id.push(fastrand::uppercase());
        for _ in 0..16 {
            id.push(CORRELATION_ALPHABET[fastrand::usize(..CORRELATION_ALPHABET.len())] as char);
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Authenticated identity attached to a command by the ingress collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
        }
    }

    /// Identity used for internal traffic and bridge peers
    pub fn system() -> Self {
        Self::new("system")
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// How a command reaches its subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Exactly one subscriber handles it and replies
    #[default]
    PointToPoint,
    /// Every subscriber receives a copy, no reply
    Broadcast,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::PointToPoint => f.write_str("point_to_point"),
            DeliveryMode::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// A validated, authenticated request addressed to a bus handler
#[derive(Debug, Clone)]
pub struct Command {
    pub address: String,
    pub correlation_id: CorrelationId,
    pub principal: Principal,
    pub payload: Value,
    pub deadline: Instant,
    /// Set by the dispatcher when the command is delivered
    pub delivery: DeliveryMode,
}

impl Command {
    /// Create a command with a fresh correlation id and the system principal
    pub fn new(address: impl Into<String>, payload: Value, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            correlation_id: CorrelationId::generate(),
            principal: Principal::system(),
            payload,
            deadline: Instant::now() + timeout,
            delivery: DeliveryMode::PointToPoint,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = principal;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Deserialize the payload into a typed request
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, CoreError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            CoreError::ValidationFailed(format!("payload for {}: {e}", self.address))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Failed,
    Timeout,
}

/// Error carried by a failed reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&CoreError> for ReplyError {
    fn from(err: &CoreError) -> Self {
        // NoHandler and BreakerOpen carry their subject, not a sentence
        let message = match err {
            CoreError::NoHandler { address } => address.clone(),
            CoreError::BreakerOpen { operation_key } => operation_key.clone(),
            CoreError::ValidationFailed(m)
            | CoreError::Timeout(m)
            | CoreError::Backpressure(m)
            | CoreError::DependencyFailure(m)
            | CoreError::ProtocolError(m)
            | CoreError::Configuration(m)
            | CoreError::Serialization(m)
            | CoreError::Internal(m) => m.clone(),
        };
        Self {
            kind: err.kind(),
            message,
        }
    }
}

/// Outcome of a point-to-point command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub correlation_id: CorrelationId,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl Reply {
    pub fn ok(correlation_id: CorrelationId, payload: Value) -> Self {
        Self {
            correlation_id,
            status: ReplyStatus::Ok,
            payload: Some(payload),
            error: None,
        }
    }

    /// Failed reply; timeouts get the `timeout` status
    pub fn failed(correlation_id: CorrelationId, err: &CoreError) -> Self {
        let status = match err {
            CoreError::Timeout(_) => ReplyStatus::Timeout,
            _ => ReplyStatus::Failed,
        };
        Self {
            correlation_id,
            status,
            payload: None,
            error: Some(ReplyError::from(err)),
        }
    }

    pub fn timeout(correlation_id: CorrelationId, message: impl Into<String>) -> Self {
        Self::failed(correlation_id, &CoreError::Timeout(message.into()))
    }

    pub fn from_result(correlation_id: CorrelationId, result: Result<Value, CoreError>) -> Self {
        match result {
            Ok(payload) => Self::ok(correlation_id, payload),
            Err(err) => Self::failed(correlation_id, &err),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Convert back into a result, rebuilding the error from its kind
    pub fn into_result(self) -> Result<Value, CoreError> {
        match (self.status, self.error) {
            (ReplyStatus::Ok, _) => Ok(self.payload.unwrap_or(Value::Null)),
            (_, Some(error)) => Err(CoreError::from_kind(error.kind, error.message)),
            (ReplyStatus::Timeout, None) => Err(CoreError::Timeout(self.correlation_id.0)),
            (ReplyStatus::Failed, None) => Err(CoreError::Internal(format!(
                "reply {} failed without an error",
                self.correlation_id
            ))),
        }
    }
}

/// Result of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    /// Subscribers whose queue accepted the copy
    pub delivered: usize,
    /// Subscribers skipped because their queue was full or closed
    pub dropped: usize,
}

impl PublishReport {
    /// Delivered count, or `Backpressure` if any subscriber missed its copy
    pub fn into_result(self, address: &str) -> Result<usize, CoreError> {
        if self.dropped == 0 {
            return Ok(self.delivered);
        }
        Err(CoreError::Backpressure(format!(
            "publish to {address} reached {} of {} subscribers",
            self.delivered,
            self.delivered + self.dropped
        )))
    }
}
