//! Gemini API client for structured extraction calls.
//!
//! The sole externally rate-limited call in the pipeline: bounded retry with
//! backoff on transient network/5xx errors, no retry on 4xx or parse
//! failures. Every call is capped by the client-level timeout.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, warn};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MODEL: &str = "gemini-1.5-flash";
const MAX_RETRIES: u32 = 2;
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Gemini client for text generation.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    /// Create a client, reading the API key from GEMINI_API_KEY. The model
    /// defaults to a fast variant and can be overridden via GEMINI_MODEL.
    pub fn from_env(call_timeout: Duration) -> Result<Self> {
        let api_key =
            env::var("GEMINI_API_KEY").context("GEMINI_API_KEY environment variable not set")?;
        if api_key.is_empty() || api_key == "yourapikey" {
            anyhow::bail!("GEMINI_API_KEY is not set properly");
        }

        let model = env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key,
            model,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Send a single-turn generation request and return the response text.
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                max_output_tokens: 8192,
            },
        };

        let url = format!(
            "{}/{}:generateContent?key={}",
            GEMINI_API_BASE, self.model, self.api_key
        );

        let mut attempt = 0;
        loop {
            match self.send_once(&url, &request).await {
                Ok(text) => return Ok(text),
                Err(e) if e.retryable && attempt < MAX_RETRIES => {
                    attempt += 1;
                    let delay = Duration::from_millis(RETRY_BASE_DELAY_MS * (1 << attempt));
                    warn!(
                        "Gemini call failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt, MAX_RETRIES, delay, e.message
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => anyhow::bail!("Gemini API error: {}", e.message),
            }
        }
    }

    async fn send_once(
        &self,
        url: &str,
        request: &GenerateContentRequest,
    ) -> std::result::Result<String, CallError> {
        debug!("Sending request to Gemini: model={}", self.model);

        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| CallError {
                // Connection/timeout errors are transient by assumption.
                retryable: true,
                message: format!("request failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError {
                retryable: status.is_server_error(),
                message: format!("HTTP {}: {}", status, body),
            });
        }

        let parsed: GenerateContentResponse = response.json().await.map_err(|e| CallError {
            retryable: false,
            message: format!("malformed response body: {}", e),
        })?;

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .unwrap_or_default();

        if text.is_empty() {
            return Err(CallError {
                retryable: false,
                message: "response contained no text candidate".to_string(),
            });
        }

        debug!("Gemini response: {} chars", text.len());
        Ok(text)
    }
}

struct CallError {
    retryable: bool,
    message: String,
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}
