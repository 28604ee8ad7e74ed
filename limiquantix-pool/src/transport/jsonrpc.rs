//! JSON-RPC 2.0 transport over HTTP(S).
//!
//! Requests go to `POST {address}/jsonrpc`. The session reference is the first
//! positional parameter of every call except login.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, instrument, trace};

use super::{PoolTransport, RpcResult};
use crate::error::RpcFault;
use crate::types::SessionRef;

/// Originator string sent with login, shows up in the pool's session list.
const ORIGINATOR: &str = "limiquantix-pool-agent";

/// HTTP JSON-RPC transport.
pub struct JsonRpcTransport {
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcTransport {
    /// Create a transport with the given per-request timeout.
    ///
    /// Pool hosts commonly run with self-signed certificates, so
    /// `accept_invalid_certs` is exposed rather than hard-coded.
    pub fn new(request_timeout: Duration, accept_invalid_certs: bool) -> RpcResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| RpcFault::Client(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn post(&self, address: &str, method: &str, params: Vec<Value>) -> RpcResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let url = endpoint_url(address);
        trace!(url = %url, method = %method, id, "Sending JSON-RPC request");

        let response = self.client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        check_status(&url, response.status())?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| RpcFault::Client(format!("undecodable response body: {}", e)))?;

        decode_response(body)
    }
}

#[async_trait]
impl PoolTransport for JsonRpcTransport {
    #[instrument(skip(self, password), fields(address = %address, username = %username))]
    async fn login(
        &self,
        address: &str,
        username: &str,
        password: &str,
        api_version: &str,
    ) -> RpcResult<SessionRef> {
        let params = vec![
            json!(username),
            json!(password),
            json!(api_version),
            json!(ORIGINATOR),
        ];
        let value = self.post(address, "session.login_with_password", params).await?;

        match value {
            Value::String(s) => {
                debug!("Login succeeded");
                Ok(SessionRef(s))
            }
            other => Err(RpcFault::Client(format!("login returned non-string session: {}", other))),
        }
    }

    async fn logout(&self, address: &str, session: &SessionRef) -> RpcResult<()> {
        self.post(address, "session.logout", vec![json!(session.as_str())]).await?;
        Ok(())
    }

    async fn call(
        &self,
        address: &str,
        session: &SessionRef,
        method: &str,
        args: Vec<Value>,
    ) -> RpcResult<Value> {
        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(json!(session.as_str()));
        params.extend(args);
        self.post(address, method, params).await
    }
}

/// 5xx is worth retrying, any other 4xx means the request itself is wrong.
pub fn check_status(url: &str, status: reqwest::StatusCode) -> RpcResult<()> {
    if status.is_server_error() {
        return Err(RpcFault::Transient(format!("{} returned {}", url, status)));
    }
    if status.is_client_error() {
        return Err(RpcFault::Client(format!("{} returned {}", url, status)));
    }
    Ok(())
}

/// Build the JSON-RPC URL for a pool address. Bare hosts default to HTTPS.
pub fn endpoint_url(address: &str) -> String {
    let base = address.trim_end_matches('/');
    if base.contains("://") {
        format!("{}/jsonrpc", base)
    } else {
        format!("https://{}/jsonrpc", base)
    }
}

/// Split a JSON-RPC response body into a result or a tagged fault.
pub fn decode_response(body: Value) -> RpcResult<Value> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Err(fault_from_error(error));
    }

    body.get("result")
        .cloned()
        .ok_or_else(|| RpcFault::Client("response has neither result nor error".to_string()))
}

/// Map a JSON-RPC error object onto [`RpcFault`].
pub fn fault_from_error(error: &Value) -> RpcFault {
    let code = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN_ERROR")
        .to_string();

    let params: Vec<String> = error
        .get("data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect()
        })
        .unwrap_or_default();

    match code.as_str() {
        "SESSION_INVALID" => RpcFault::SessionInvalid,
        "SESSION_AUTHENTICATION_FAILED" => RpcFault::AuthenticationFailed,
        "HOST_IS_SLAVE" => match params.first() {
            Some(master) => RpcFault::HostIsSlave(master.clone()),
            None => RpcFault::Client("HOST_IS_SLAVE without master address".to_string()),
        },
        "MESSAGE_PARAMETER_COUNT_MISMATCH" | "MESSAGE_METHOD_UNKNOWN" => {
            RpcFault::Client(format!("{} {:?}", code, params))
        }
        _ => RpcFault::Api { code, params },
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> RpcFault {
    if e.is_builder() {
        RpcFault::Client(e.to_string())
    } else {
        // connect, timeout, reset and body errors are all worth retrying
        RpcFault::Transient(e.to_string())
    }
}
