//! Boundary to the remote backend.
//!
//! The query layer only knows the [`NetworkCaller`] trait. `HttpCaller` is
//! the production implementation; tests plug in closures.

mod client;
mod portal;

pub use client::{Envelope, HttpCaller};
pub use portal::{Case, Client, Dashboard, Movement, PortalClient};

use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;

use crate::error::CallError;

/// Remote call abstraction: `(action, params) -> payload`.
pub trait NetworkCaller: Send + Sync {
  fn call(&self, action: &str, params: &Value) -> BoxFuture<'static, Result<Value, CallError>>;
}

impl<F, Fut> NetworkCaller for F
where
  F: Fn(String, Value) -> Fut + Send + Sync,
  Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
{
  fn call(&self, action: &str, params: &Value) -> BoxFuture<'static, Result<Value, CallError>> {
    Box::pin(self(action.to_string(), params.clone()))
  }
}
