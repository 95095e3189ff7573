/// Upstream node client
///
/// Thin REST + JSON-RPC wrapper around the node's HTTP interface. GET/POST
/// return the parsed JSON body; any non-200 status becomes an error carrying
/// the response text. JSON-RPC uses basic auth where the password is the
/// algorithm id, and unwraps the `result` field.

use serde_json::{json, Value};
use thiserror::Error;

use crate::algorithm::Algorithm;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("node returned {status}: {body}")]
    Status { status: u16, body: String },
}

pub type NodeResult<T> = Result<T, NodeError>;

pub struct NodeClient {
    base: String,
    client: reqwest::Client,
}

impl NodeClient {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        let base = base.trim_end_matches('/').to_string();
        Self {
            base,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Websocket endpoint derived from the REST base URL.
    pub fn ws_url(&self, path: &str) -> String {
        let ws_base = if let Some(rest) = self.base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{}", self.base)
        };
        format!("{ws_base}{path}")
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> NodeResult<Value> {
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .query(query)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            let data = response.json().await?;
            tracing::debug!(path, "REST GET success");
            Ok(data)
        } else {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(path, %status, %body, "REST GET failed");
            Err(NodeError::Status { status: status.as_u16(), body })
        }
    }

    pub async fn post(&self, path: &str, body: &Value) -> NodeResult<Value> {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            let data = response.json().await?;
            tracing::debug!(path, "REST POST success");
            Ok(data)
        } else {
            let text = response.text().await.unwrap_or_default();
            tracing::error!(path, %status, %text, "REST POST failed");
            Err(NodeError::Status { status: status.as_u16(), body: text })
        }
    }

    /// JSON-RPC against the REST base, returning only the `result` field.
    pub async fn json_rpc(
        &self,
        method: &str,
        params: Value,
        user: &str,
        pwd: &str,
    ) -> NodeResult<Value> {
        let payload = json!({ "method": method, "params": params, "id": null });
        let response = self
            .client
            .post(&self.base)
            .basic_auth(user, Some(pwd))
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            let mut data: Value = response.json().await?;
            tracing::debug!(method, "JSON-RPC success");
            Ok(data.get_mut("result").map(Value::take).unwrap_or(Value::Null))
        } else {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(method, %status, %body, "JSON-RPC failed");
            Err(NodeError::Status { status: status.as_u16(), body })
        }
    }

    // node operations used by the pool

    pub async fn get_chain_info(&self) -> NodeResult<Value> {
        self.get("/public/getchaininfo", &[]).await
    }

    pub async fn get_block_by_hash(&self, hash: &str) -> NodeResult<Value> {
        self.get(
            "/public/getblockbyhash",
            &[("hash", hash.to_string()), ("txinfo", "true".to_string())],
        )
        .await
    }

    pub async fn get_block_by_height(&self, height: u64) -> NodeResult<Value> {
        self.get(
            "/public/getblockbyheight",
            &[("height", height.to_string()), ("txinfo", "true".to_string())],
        )
        .await
    }

    pub async fn get_tx_by_hash(&self, hash: &str) -> NodeResult<Value> {
        self.get("/public/gettxbyhash", &[("hash", hash.to_string())]).await
    }

    /// `pairs` is a list of `[address, coin_id, amount]` triples.
    pub async fn send_many(&self, pairs: &Value) -> NodeResult<Value> {
        self.post("/private/sendmany", &json!({ "pairs": pairs })).await
    }

    pub async fn get_block_template(&self, algorithm: Algorithm) -> NodeResult<Value> {
        let params = json!([{ "capabilities": ["coinbasetxn", "messagenonce"] }]);
        self.json_rpc("getblocktemplate", params, "user", &algorithm.id().to_string())
            .await
    }

    pub async fn submit_block(&self, payload_hex: &str, algorithm: Algorithm) -> NodeResult<Value> {
        self.json_rpc(
            "submitblock",
            json!([payload_hex]),
            "user",
            &algorithm.id().to_string(),
        )
        .await
    }
}
