//! JSON-RPC 2.0 over HTTP POST.
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::debug;

use crate::{dataset::RpcMethod, error::FetchError};

/// One request/response exchange with the upstream node. No retries at this layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Call `method` with positional `params` and return the `result` member.
    ///
    /// Non-2xx, network errors, malformed bodies, a JSON-RPC `error` member and a
    /// null `result` are all reported as transient [`FetchError`]s.
    async fn call(&self, method: RpcMethod, params: Vec<Value>) -> Result<Value, FetchError>;
}

#[async_trait]
impl<T: RpcTransport + ?Sized> RpcTransport for Arc<T> {
    async fn call(&self, method: RpcMethod, params: Vec<Value>) -> Result<Value, FetchError> {
        (**self).call(method, params).await
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'a str,
    method: &'a str,
    params: &'a [Value],
}

#[derive(Debug, Deserialize)]
pub(crate) struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Pull the `result` out of a response envelope.
pub(crate) fn unwrap_envelope(method: RpcMethod, resp: RpcResponse) -> Result<Value, FetchError> {
    if let Some(err) = resp.error {
        return Err(FetchError::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    match resp.result {
        None | Some(Value::Null) => Err(FetchError::EmptyResult(method.to_string())),
        Some(v) => Ok(v),
    }
}

/// reqwest-backed transport with optional bearer auth.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpTransport {
    /// Transport for `url`; `token` is sent as `Authorization: Bearer <token>` when set.
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            token: token.filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn call(&self, method: RpcMethod, params: Vec<Value>) -> Result<Value, FetchError> {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: method.as_str(),
            method: method.as_str(),
            params: &params,
        };
        debug!(%method, ?params, url = %self.url, "rpc request");

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
            });
        }
        let envelope: RpcResponse = resp.json().await?;
        unwrap_envelope(method, envelope)
    }
}
