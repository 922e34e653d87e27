//! Content-generation client.
//!
//! The engine treats the text generator as a black box behind the
//! [`ContentSource`] trait: given a prompt and generation parameters it
//! returns text or fails. Failures never propagate as protocol errors;
//! the engine renders them as inline transcript text and the cycle
//! proceeds, so replays and demos never hang on a dead generator.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Request timeout for a single generation call.
const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Tuning parameters passed with every generation request.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GenerationParams {
    /// Maximum tokens in the response.
    pub max_tokens: u32,
    /// Sampling temperature (0.0 - 1.0).
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 300,
            temperature: 0.8,
        }
    }
}

/// Black-box text generator invoked once per cycle.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Generate text for `prompt`.
    ///
    /// # Errors
    ///
    /// Returns an error if the service is unreachable, rejects the request,
    /// or responds with an unexpected payload.
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    generated_text: String,
}

/// HTTP-backed [`ContentSource`].
///
/// POSTs `{prompt, max_tokens, temperature}` to the configured endpoint
/// and reads `generated_text` from the JSON response.
#[derive(Debug, Clone)]
pub struct HttpContentSource {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpContentSource {
    /// Create a client for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: String, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(GENERATE_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url,
            api_key,
        })
    }

    /// Endpoint URL this source posts to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ContentSource for HttpContentSource {
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        log::debug!(
            "[content] requesting generation ({} prompt chars)",
            prompt.chars().count()
        );

        let mut request = self.client.post(&self.url).json(&GenerateRequest {
            prompt,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("content generation request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("content service returned {}", response.status());
        }

        let body: GenerateResponse = response
            .json()
            .await
            .context("content service returned unexpected payload")?;

        log::debug!(
            "[content] received {} chars of generated text",
            body.generated_text.chars().count()
        );
        Ok(body.generated_text)
    }
}
