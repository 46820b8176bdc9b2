use serde_json::Value;

/// How a JSON-RPC round trip went wrong. Callers map these onto their own error kinds.
#[derive(Debug)]
pub(crate) enum RpcFailure {
    /// Connection, timeout, or an HTTP error without a JSON-RPC error body.
    Transport(String),
    /// The service answered with a JSON-RPC `error` object.
    Rejected(Value),
    /// The service answered, but not with JSON-RPC.
    Malformed(String),
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcFailure::Transport(msg) => write!(f, "{msg}"),
            RpcFailure::Rejected(err) => write!(f, "RPC error: {err}"),
            RpcFailure::Malformed(msg) => write!(f, "{msg}"),
        }
    }
}

/// Bare JSON-RPC 2.0 over HTTP POST, one request per call.
#[derive(Debug, Clone)]
pub(crate) struct JsonRpcHttp {
    url: String,
    http: reqwest::Client,
}

impl JsonRpcHttp {
    pub(crate) fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    pub(crate) async fn call(&self, method: &str, params: Value) -> Result<Value, RpcFailure> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        tracing::debug!(method, "json-rpc request");

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RpcFailure::Transport(format!("POST {method} failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| RpcFailure::Transport(format!("reading {method} response: {e}")))?;

        classify_response(status, &text)
    }
}

fn classify_response(status: reqwest::StatusCode, text: &str) -> Result<Value, RpcFailure> {
    let body: Value = match serde_json::from_str(text) {
        Ok(body) => body,
        Err(_) if !status.is_success() => {
            return Err(RpcFailure::Transport(format!("HTTP {status}: {text}")))
        }
        Err(e) => return Err(RpcFailure::Malformed(format!("invalid JSON: {e}"))),
    };

    // Some services report rejections with a 4xx status and a regular error body.
    if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
        return Err(RpcFailure::Rejected(err.clone()));
    }
    if !status.is_success() {
        return Err(RpcFailure::Transport(format!("HTTP {status}: {body}")));
    }

    body.get("result")
        .cloned()
        .ok_or_else(|| RpcFailure::Malformed("missing result field".into()))
}
