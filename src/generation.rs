use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cli::Provider;
use crate::config::RuntimeConfig;

pub const GENERATION_CAPABILITY: &str = "generation";
pub const FALLBACK_ANSWER: &str = "I don't know from the provided documents.";
pub const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.2";
pub const DEFAULT_MAX_NEW_TOKENS: u32 = 220;

/// Text generation backend. One prompt in, one completion out.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Prompt that restricts the model to the retrieved context.
pub fn grounded_prompt(context: &str, query: &str) -> String {
    format!(
        "Answer the question strictly using the context below.\n\
         If the answer is not present in the context, say: \"{FALLBACK_ANSWER}\"\n\
         \n\
         Context:\n\
         {context}\n\
         \n\
         Question: {query}\n\
         Answer:"
    )
}

#[derive(Debug, Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[derive(Debug, Clone)]
pub struct OllamaGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    max_new_tokens: u32,
}

impl OllamaGenerator {
    pub fn new(host: &str, model: &str, max_new_tokens: u32, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Ollama HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", host.trim_end_matches('/')),
            model: model.to_string(),
            max_new_tokens,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = OllamaGenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: OllamaOptions {
                num_predict: self.max_new_tokens,
            },
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Ollama request to '{}' failed", self.endpoint))?
            .error_for_status()
            .context("Ollama returned an error status")?;
        let bytes = response
            .bytes()
            .await
            .context("failed to read Ollama response body")?;
        decode_generate_response(&bytes)
    }
}

/// The model's text exactly as returned, whitespace included.
fn decode_generate_response(bytes: &[u8]) -> Result<String> {
    let body = serde_json::from_slice::<OllamaGenerateResponse>(bytes)
        .context("failed to decode Ollama response")?;
    Ok(body.response)
}

/// Builds the configured backend. `disabled` yields no capability at all.
pub fn build_generator(cfg: &RuntimeConfig) -> Result<Option<Arc<dyn Generator>>> {
    match cfg.provider {
        Provider::Disabled => Ok(None),
        Provider::Ollama => {
            let model = cfg.model.as_deref().unwrap_or(DEFAULT_OLLAMA_MODEL);
            if model.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "provider 'ollama' requires a non-empty --model"
                ));
            }
            let generator = OllamaGenerator::new(
                &cfg.ollama_host,
                model,
                cfg.max_new_tokens,
                Duration::from_secs(cfg.generation_timeout_secs),
            )?;
            tracing::info!(
                model,
                endpoint = generator.endpoint(),
                "initialized Ollama generator"
            );
            let generator: Arc<dyn Generator> = Arc::new(generator);
            Ok(Some(generator))
        }
    }
}
