use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::NetworkCaller;
use crate::error::CallError;

/// Response envelope returned by the backend for every action.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
  #[serde(default)]
  pub success: bool,
  #[serde(default)]
  pub data: Option<Value>,
  #[serde(default)]
  pub error: Option<String>,
  #[serde(default)]
  pub code: Option<String>,
}

impl Envelope {
  /// Unwrap the payload or turn the failure into a [`CallError::Server`].
  pub fn into_result(self) -> Result<Value, CallError> {
    if self.success {
      return Ok(self.data.unwrap_or(Value::Null));
    }

    Err(CallError::Server {
      code: self.code,
      message: self.error.unwrap_or_else(|| "Unknown error".to_string()),
    })
  }
}

#[derive(Serialize)]
struct RequestBody<'a> {
  action: &'a str,
  data: &'a Value,
  token: Option<&'a str>,
}

/// Network caller posting `{action, data, token}` to a single endpoint.
#[derive(Clone)]
pub struct HttpCaller {
  client: reqwest::Client,
  endpoint: Url,
  token: Option<String>,
}

impl HttpCaller {
  pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
    let endpoint =
      Url::parse(endpoint).map_err(|e| eyre!("Invalid API URL {}: {}", endpoint, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      endpoint,
      token: None,
    })
  }

  /// Session token sent with every call. Obtaining it is the caller's job.
  pub fn with_token(mut self, token: Option<String>) -> Self {
    self.token = token;
    self
  }

  async fn post(
    client: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
    action: String,
    params: Value,
  ) -> Result<Value, CallError> {
    let body = RequestBody {
      action: &action,
      data: &params,
      token: token.as_deref(),
    };

    let response = client
      .post(endpoint)
      .json(&body)
      .send()
      .await
      .map_err(|e| CallError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      return Err(CallError::Network(format!("HTTP error: {}", status)));
    }

    let envelope: Envelope = response
      .json()
      .await
      .map_err(|e| CallError::Network(format!("Failed to decode response: {}", e)))?;

    envelope.into_result()
  }
}

impl NetworkCaller for HttpCaller {
  fn call(&self, action: &str, params: &Value) -> BoxFuture<'static, Result<Value, CallError>> {
    Box::pin(Self::post(
      self.client.clone(),
      self.endpoint.clone(),
      self.token.clone(),
      action.to_string(),
      params.clone(),
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_success_envelope() {
    let envelope: Envelope =
      serde_json::from_value(json!({"success": true, "data": [{"id": 1}]})).unwrap();
    assert_eq!(envelope.into_result(), Ok(json!([{"id": 1}])));
  }

  #[test]
  fn test_success_without_data_is_null() {
    let envelope: Envelope = serde_json::from_value(json!({"success": true})).unwrap();
    assert_eq!(envelope.into_result(), Ok(Value::Null));
  }

  #[test]
  fn test_failure_envelope_keeps_code_and_message() {
    let envelope: Envelope = serde_json::from_value(
      json!({"success": false, "error": "Sessão expirada", "code": "TOKEN_EXPIRED"}),
    )
    .unwrap();

    let err = envelope.into_result().unwrap_err();
    assert!(err.is_auth_expired());
    assert_eq!(err.to_string(), "Sessão expirada");
  }

  #[test]
  fn test_failure_without_message() {
    let envelope: Envelope = serde_json::from_value(json!({"success": false})).unwrap();
    assert_eq!(
      envelope.into_result(),
      Err(CallError::server(None, "Unknown error"))
    );
  }

  #[test]
  fn test_rejects_invalid_endpoint() {
    assert!(HttpCaller::new("not a url", Duration::from_secs(1)).is_err());
  }
}
