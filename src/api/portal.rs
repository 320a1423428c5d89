//! Typed, cached access to the case-management backend.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::warn;

use crate::cache::{CacheLayer, Origin, Prefetch, QueryOptions, QueryOutcome};
use crate::error::QueryError;

const LIST_CLIENTS: &str = "listarClientes";
const LIST_CASES: &str = "listarProcessos";
const DASHBOARD: &str = "getDashboard";
const LIST_MOVEMENTS: &str = "listarMovimentacoes";

/// Client record as listed by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
  #[serde(default, deserialize_with = "string_or_number")]
  pub id: String,
  #[serde(default)]
  pub nome_completo: String,
  #[serde(default)]
  pub cpf: Option<String>,
  #[serde(default)]
  pub email: Option<String>,
  #[serde(default)]
  pub telefone: Option<String>,
  #[serde(default)]
  pub status: Option<String>,
}

/// Legal case summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
  #[serde(default, deserialize_with = "string_or_number")]
  pub id: String,
  #[serde(default)]
  pub numero_processo: String,
  #[serde(default)]
  pub parte_nome: Option<String>,
  #[serde(default)]
  pub tipo: Option<String>,
  #[serde(default)]
  pub status: Option<String>,
  #[serde(default)]
  pub data_entrada: Option<String>,
}

/// Progress entry on a case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
  #[serde(default, deserialize_with = "string_or_number")]
  pub id: String,
  #[serde(default, deserialize_with = "string_or_number")]
  pub processo_id: String,
  #[serde(default)]
  pub tipo: Option<String>,
  #[serde(default)]
  pub descricao: Option<String>,
  #[serde(default)]
  pub data: Option<String>,
}

/// Dashboard counters; the backend decides which ones exist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dashboard {
  #[serde(flatten)]
  pub stats: BTreeMap<String, Value>,
}

/// Backend ids arrive as strings or numbers depending on the sheet.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(match Value::deserialize(deserializer)? {
    Value::String(s) => s,
    Value::Null => String::new(),
    other => other.to_string(),
  })
}

/// Decode a list payload; `null` counts as an empty list.
fn decode_list<T: DeserializeOwned>(data: &Value) -> Result<Vec<T>, serde_json::Error> {
  if data.is_null() {
    return Ok(Vec::new());
  }
  serde_json::from_value(data.clone())
}

/// Client for the portal backend with transparent caching.
///
/// Lists are served cache-then-network; writes go straight to the network
/// and invalidate the lists they affect.
#[derive(Clone)]
pub struct PortalClient {
  layer: CacheLayer,
}

impl PortalClient {
  pub fn new(layer: CacheLayer) -> Self {
    Self { layer }
  }

  pub fn layer(&self) -> &CacheLayer {
    &self.layer
  }

  /// Client directory. A stale copy is shown while the fresh one loads.
  pub async fn list_clients<F>(
    &self,
    silent: bool,
    mut on_result: F,
  ) -> Result<QueryOutcome, QueryError>
  where
    F: FnMut(Vec<Client>, Origin),
  {
    let mut opts = QueryOptions::new().allowing_stale();
    opts.silent = silent;

    self
      .layer
      .query(LIST_CLIENTS, &json!({}), &opts, |data, origin| {
        match decode_list(data) {
          Ok(clients) => on_result(clients, origin),
          Err(e) => warn!(action = LIST_CLIENTS, %origin, error = %e, "unexpected payload"),
        }
      })
      .await
  }

  /// Cases matching `filters` (an object, `{}` for all).
  pub async fn list_cases<F>(
    &self,
    filters: &Value,
    silent: bool,
    mut on_result: F,
  ) -> Result<QueryOutcome, QueryError>
  where
    F: FnMut(Vec<Case>, Origin),
  {
    let mut opts = QueryOptions::new();
    opts.silent = silent;

    self
      .layer
      .query(LIST_CASES, filters, &opts, |data, origin| {
        match decode_list(data) {
          Ok(cases) => on_result(cases, origin),
          Err(e) => warn!(action = LIST_CASES, %origin, error = %e, "unexpected payload"),
        }
      })
      .await
  }

  /// Dashboard counters. Expired counters are never shown.
  pub async fn dashboard<F>(
    &self,
    silent: bool,
    mut on_result: F,
  ) -> Result<QueryOutcome, QueryError>
  where
    F: FnMut(Dashboard, Origin),
  {
    let mut opts = QueryOptions::new();
    opts.silent = silent;

    self
      .layer
      .query(DASHBOARD, &json!({}), &opts, |data, origin| {
        match serde_json::from_value::<Option<Dashboard>>(data.clone()) {
          Ok(dashboard) => on_result(dashboard.unwrap_or_default(), origin),
          Err(e) => warn!(action = DASHBOARD, %origin, error = %e, "unexpected payload"),
        }
      })
      .await
  }

  /// Movements recorded on one case.
  pub async fn list_movements<F>(
    &self,
    case_id: &str,
    silent: bool,
    mut on_result: F,
  ) -> Result<QueryOutcome, QueryError>
  where
    F: FnMut(Vec<Movement>, Origin),
  {
    let mut opts = QueryOptions::new();
    opts.silent = silent;

    self
      .layer
      .query(
        LIST_MOVEMENTS,
        &json!({ "processo_id": case_id }),
        &opts,
        |data, origin| match decode_list(data) {
          Ok(movements) => on_result(movements, origin),
          Err(e) => warn!(action = LIST_MOVEMENTS, %origin, error = %e, "unexpected payload"),
        },
      )
      .await
  }

  pub async fn create_client(&self, client: &Value) -> Result<Value, QueryError> {
    self
      .layer
      .mutate("cadastrarCliente", client, &[LIST_CLIENTS])
      .await
  }

  /// Create a case. A case without `cliente_id` also registers a new client.
  pub async fn create_case(&self, case: &Value) -> Result<Value, QueryError> {
    let has_client = case
      .get("cliente_id")
      .map(|id| !id.is_null() && id.as_str() != Some(""))
      .unwrap_or(false);

    let mut invalidates = vec![LIST_CASES, DASHBOARD];
    if !has_client {
      invalidates.push(LIST_CLIENTS);
    }

    self.layer.mutate("criarProcesso", case, &invalidates).await
  }

  pub async fn add_movement(&self, movement: &Value) -> Result<Value, QueryError> {
    self
      .layer
      .mutate("adicionarMovimentacao", movement, &[LIST_MOVEMENTS])
      .await
  }

  /// Warm the lists every page needs, right after login.
  pub async fn warm_up(&self) -> usize {
    self
      .layer
      .prefetch(&[
        Prefetch::new(DASHBOARD, json!({})),
        Prefetch::new(LIST_CASES, json!({})),
        Prefetch::new(LIST_CLIENTS, json!({})),
      ])
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{LayerSettings, MemoryStorage, TtlStore};
  use crate::clock::SystemClock;
  use crate::error::CallError;
  use crate::sync::{ContextId, SyncBroadcaster};
  use std::sync::{Arc, Mutex};

  /// Portal whose backend answers from a fixed action table and logs calls.
  fn portal(log: Arc<Mutex<Vec<String>>>) -> PortalClient {
    let clock = Arc::new(SystemClock);
    let store = TtlStore::new(Arc::new(MemoryStorage::new()), clock.clone());
    let caller = move |action: String, _params: Value| {
      log.lock().unwrap().push(action.clone());
      async move {
        match action.as_str() {
          "listarClientes" => Ok(json!([
            {"id": 1, "nome_completo": "Ana Souza", "cpf": "123.456.789-00"},
            {"id": "c2", "nome_completo": "Beto Lima"}
          ])),
          "listarProcessos" => Ok(Value::Null),
          "getDashboard" => Ok(json!({"total_processos": 4, "ativos": 3})),
          "criarProcesso" => Ok(json!({"id": 77})),
          _ => Err(CallError::server(Some("UNKNOWN_ACTION"), "Ação desconhecida")),
        }
      }
    };

    PortalClient::new(CacheLayer::new(
      store,
      Arc::new(caller),
      SyncBroadcaster::disconnected(ContextId::new(), clock),
      LayerSettings::default(),
    ))
  }

  #[tokio::test]
  async fn test_list_clients_decodes_mixed_ids() {
    let portal = portal(Arc::default());
    let mut lists = Vec::new();
    portal
      .list_clients(true, |clients, origin| lists.push((clients, origin)))
      .await
      .unwrap();

    assert_eq!(lists.len(), 1);
    let (clients, origin) = &lists[0];
    assert_eq!(*origin, Origin::Network);
    assert_eq!(clients[0].id, "1");
    assert_eq!(clients[1].id, "c2");
    assert_eq!(clients[1].cpf, None);
  }

  #[tokio::test]
  async fn test_null_list_is_empty() {
    let portal = portal(Arc::default());
    let mut seen = None;
    portal
      .list_cases(&json!({}), true, |cases, _| seen = Some(cases))
      .await
      .unwrap();
    assert_eq!(seen, Some(Vec::new()));
  }

  #[tokio::test]
  async fn test_dashboard_stats() {
    let portal = portal(Arc::default());
    let mut stats = Dashboard::default();
    portal
      .dashboard(true, |d, _| stats = d)
      .await
      .unwrap();
    assert_eq!(stats.stats["ativos"], json!(3));
  }

  #[tokio::test]
  async fn test_create_case_for_new_client_invalidates_clients() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let portal = portal(Arc::clone(&log));
    assert_eq!(portal.warm_up().await, 3);

    portal
      .create_case(&json!({"cliente_id": "", "numero_processo": "0001"}))
      .await
      .unwrap();

    let mut calls = log.lock().unwrap().clone();
    assert_eq!(calls.pop().as_deref(), Some("criarProcesso"));
    calls.sort();
    assert_eq!(calls, vec!["getDashboard", "listarClientes", "listarProcessos"]);
    assert!(portal.layer().store().keys().is_empty());
  }

  #[tokio::test]
  async fn test_create_case_for_existing_client_keeps_clients() {
    let portal = portal(Arc::default());
    portal.warm_up().await;

    portal
      .create_case(&json!({"cliente_id": "c2", "numero_processo": "0002"}))
      .await
      .unwrap();

    assert_eq!(portal.layer().store().keys(), vec!["listarClientes_{}"]);
  }

  #[tokio::test]
  async fn test_unknown_action_error_is_verbatim() {
    let portal = portal(Arc::default());
    let err = portal.create_client(&json!({})).await.unwrap_err();
    assert_eq!(err.to_string(), "Ação desconhecida");
  }
}
