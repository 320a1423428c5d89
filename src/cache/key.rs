//! Cache key construction.

use serde_json::Value;

/// Build the cache key for `action` called with `params`: `"<action>_<json>"`.
///
/// `serde_json` maps keep their keys sorted, so two parameter objects with
/// the same content always produce the same key.
pub fn cache_key(action: &str, params: &Value) -> String {
  format!("{}_{}", action, params)
}

/// Key prefix shared by every parameter variant of `action`.
pub fn action_prefix(action: &str) -> String {
  format!("{}_", action)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_empty_params() {
    assert_eq!(cache_key("clientes", &json!({})), "clientes_{}");
  }

  #[test]
  fn test_param_order_does_not_matter() {
    let a: Value = serde_json::from_str(r#"{"status":"ativo","tipo":"civel"}"#).unwrap();
    let b: Value = serde_json::from_str(r#"{"tipo":"civel","status":"ativo"}"#).unwrap();
    assert_eq!(cache_key("listarProcessos", &a), cache_key("listarProcessos", &b));
  }

  #[test]
  fn test_prefix_matches_all_variants() {
    let prefix = action_prefix("listarProcessos");
    assert!(cache_key("listarProcessos", &json!({"tipo": "civel"})).starts_with(&prefix));
    assert!(!cache_key("listarProcessosArquivados", &json!({})).starts_with(&prefix));
  }
}
