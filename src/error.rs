//! Error types surfaced by network callers and the query layer.

/// Server codes meaning the session is no longer valid.
const AUTH_EXPIRED_CODES: &[&str] = &["TOKEN_EXPIRED", "INVALID_TOKEN"];

/// Failure reported by a [`crate::api::NetworkCaller`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
  /// Transport-level failure (connection refused, bad status, undecodable body).
  #[error("network error: {0}")]
  Network(String),

  /// Logical failure reported by the backend.
  #[error("{message}")]
  Server {
    code: Option<String>,
    message: String,
  },
}

impl CallError {
  pub fn server(code: Option<&str>, message: impl Into<String>) -> Self {
    Self::Server {
      code: code.map(String::from),
      message: message.into(),
    }
  }

  /// Whether the caller should log the user out.
  ///
  /// The query layer never acts on this itself.
  pub fn is_auth_expired(&self) -> bool {
    match self {
      Self::Server {
        code: Some(code), ..
      } => AUTH_EXPIRED_CODES.contains(&code.as_str()),
      _ => false,
    }
  }
}

/// Failure of a query as seen by its caller.
///
/// Cloneable so one outcome can be handed to every waiter on a key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
  #[error(transparent)]
  Call(#[from] CallError),

  /// The network call, or the wait on another caller's call, took too long.
  #[error("request for {key} timed out after {waited_ms}ms")]
  Timeout { key: String, waited_ms: u64 },

  /// The in-flight request was dropped before it settled.
  #[error("request for {key} was abandoned before it settled")]
  Abandoned { key: String },
}

impl QueryError {
  pub fn is_auth_expired(&self) -> bool {
    matches!(self, Self::Call(e) if e.is_auth_expired())
  }
}
