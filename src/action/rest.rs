use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Client, Method};
use serde_json::{json, Map, Value};

use super::{Action, ActionResult};
use crate::error::{FlowError, Result};

/// HTTP exchange. Reads `url`, `method` (default GET), `headers` (object or
/// JSON text) and `body`, and returns `{status, body, headers}`.
pub struct RestAction {
    client: Client,
}

impl RestAction {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FlowError::Other(anyhow!(e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn headers(args: &Map<String, Value>) -> Result<HeaderMap> {
        let raw = match args.get("headers") {
            Some(Value::String(text)) => serde_json::from_str(text)?,
            Some(value) => value.clone(),
            None => Value::Null,
        };
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Value::Object(entries) = raw {
            for (name, value) in entries {
                let text = match value {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| FlowError::Other(anyhow!(e)))?;
                let value =
                    HeaderValue::from_str(&text).map_err(|e| FlowError::Other(anyhow!(e)))?;
                headers.insert(name, value);
            }
        }
        Ok(headers)
    }
}

#[async_trait]
impl Action for RestAction {
    async fn execute(&self, _globals: &Value, args: &Map<String, Value>) -> Result<ActionResult> {
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| FlowError::NotValidObject("rest requires a `url` argument".to_string()))?;
        let method = args
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("get")
            .to_uppercase();
        let method = Method::from_bytes(method.as_bytes()).map_err(|e| FlowError::Other(anyhow!(e)))?;

        let mut request = self
            .client
            .request(method, url)
            .headers(Self::headers(args)?);
        match args.get("body") {
            Some(Value::String(body)) => request = request.body(body.clone()),
            Some(Value::Null) | None => {}
            Some(other) => request = request.json(other),
        }

        let response = request.send().await.map_err(|e| FlowError::Other(anyhow!(e)))?;
        let status = response.status().as_u16();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    Value::String(value.to_str().unwrap_or_default().to_string()),
                )
            })
            .collect();
        let body = response.text().await.map_err(|e| FlowError::Other(anyhow!(e)))?;

        Ok(ActionResult::Value(json!({
            "status": status,
            "body": body,
            "headers": headers,
        })))
    }
}
