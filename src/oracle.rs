//! Reasoning Oracle interface.
//!
//! Provides the [`Oracle`] trait — the single narrow seam through which the
//! pipeline asks an external language model for routing, structuring, and
//! relationship judgements — and [`HttpOracle`], a client for an
//! Ollama-style `/api/generate` endpoint.
//!
//! The Oracle is untrusted and fallible by contract: any transport failure
//! degrades to the literal empty-object text `"{}"`, so callers can
//! uniformly attempt to parse-and-fallback instead of handling errors.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::config::OracleConfig;

/// The single reasoning call the core depends on.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Generate a completion. Must never fail: implementations return `"{}"`
    /// on transport errors or timeouts.
    async fn generate(&self, prompt: &str, system_prompt: Option<&str>, json_mode: bool)
        -> String;
}

/// Ollama-style HTTP client implementing [`Oracle`].
pub struct HttpOracle {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl HttpOracle {
    pub fn new(config: &OracleConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl Oracle for HttpOracle {
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        json_mode: bool,
    ) -> String {
        let full_prompt = match system_prompt {
            Some(system) => format!("System: {system}\nUser: {prompt}"),
            None => prompt.to_string(),
        };

        let mut payload = serde_json::json!({
            "model": self.model,
            "prompt": full_prompt,
            "stream": false,
        });
        if json_mode {
            payload["format"] = serde_json::Value::String("json".into());
        }

        let result = self
            .client
            .post(&self.base_url)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) => match response.error_for_status() {
                Ok(response) => match response.json::<GenerateResponse>().await {
                    Ok(body) => body.response,
                    Err(err) => {
                        warn!(error = %err, "oracle returned unreadable body");
                        "{}".to_string()
                    }
                },
                Err(err) => {
                    warn!(error = %err, "oracle returned error status");
                    "{}".to_string()
                }
            },
            Err(err) => {
                warn!(url = %self.base_url, error = %err, "oracle unreachable");
                "{}".to_string()
            }
        }
    }
}

/// Strip markdown code fences some models wrap around JSON output.
///
/// Handles both ```` ```json ```` and bare ```` ``` ```` fences; returns the
/// input unchanged when no fence is present.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        return rest.split("```").next().unwrap_or(rest).trim();
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        return rest.split("```").next().unwrap_or(rest).trim();
    }
    trimmed
}
