//! Inference calls: one payload plus instruction in, raw model text out.
//!
//! This module is intentionally thin. Retries, timeouts and backoff belong
//! to [`crate::pipeline::worker`]; prompts live in [`crate::prompts`]. The
//! client's only job is to build the request, make exactly one call, and
//! classify the provider's [`LlmError`] into a [`CallError`].
//!
//! ## Message Layout
//!
//! A single user turn:
//! * image payloads: the instruction as text plus the page PNG attached
//! * text payloads: the instruction, then the chunk fenced by `---` lines

use crate::config::ExtractionConfig;
use crate::error::{CallError, ExtractError};
use crate::pipeline::encode;
use crate::unit::Payload;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, LlmError, ProviderFactory};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Makes one inference call for one payload.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn call(&self, payload: &Payload, instruction: &str) -> Result<String, CallError>;
}

/// [`InferenceClient`] backed by an edgequake-llm provider.
pub struct LlmInferenceClient {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    call_timeout: Duration,
}

impl LlmInferenceClient {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ExtractionConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
            call_timeout: config.retry_policy().call_timeout,
        }
    }
}

#[async_trait]
impl InferenceClient for LlmInferenceClient {
    async fn call(&self, payload: &Payload, instruction: &str) -> Result<String, CallError> {
        let message = build_message(payload, instruction);
        match self.provider.chat(&[message], Some(&self.options)).await {
            Ok(response) => {
                debug!(
                    "{} input tokens, {} output tokens",
                    response.prompt_tokens, response.completion_tokens
                );
                Ok(response.content)
            }
            Err(e) => Err(classify_error(&e, self.call_timeout)),
        }
    }
}

/// The single user turn for one payload.
fn build_message(payload: &Payload, instruction: &str) -> ChatMessage {
    match payload {
        Payload::Image { bytes, mime } => {
            ChatMessage::user_with_images(instruction, vec![encode::image_data(bytes, mime)])
        }
        Payload::Text(text) => {
            ChatMessage::user(format!("{}\n\n---\n{}\n---", instruction, text))
        }
    }
}

/// Map a provider error onto a [`CallError`].
///
/// Errors the provider marks as unrecoverable (authentication, unknown
/// model, invalid request, configuration) are rejections. Rate limits and
/// provider timeouts keep their kind; the rest are service errors.
/// `call_timeout` is reported for timeouts raised by the provider's own
/// HTTP client, which carry no duration.
pub fn classify_error(error: &LlmError, call_timeout: Duration) -> CallError {
    match error {
        LlmError::RateLimited(_) => CallError::RateLimited { retry_after: None },
        LlmError::Timeout => CallError::Timeout(call_timeout),
        e if !e.is_recoverable() => CallError::Rejected(e.to_string()),
        e => CallError::ServiceError(e.to_string()),
    }
}

/// Build `CompletionOptions` from the extraction config.
fn build_options(config: &ExtractionConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

fn default_model(provider: &str) -> &'static str {
    match provider {
        "anthropic" => "claude-sonnet-4-20250514",
        "gemini" => "gemini-2.0-flash",
        _ => "gpt-4.1",
    }
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ExtractError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`), used as-is.
/// 2. **Named provider** (`config.provider_name`) with `config.model` or
///    that provider's default model.
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **Anthropic** when `ANTHROPIC_API_KEY` is set; scanned pages with
///    small diacritics read best on Claude.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_provider(config: &ExtractionConfig) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or_else(|| default_model(name));
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_provider(&prov, &model);
        }
    }

    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        if !key.is_empty() {
            let model = config
                .model
                .as_deref()
                .unwrap_or_else(|| default_model("anthropic"));
            return create_provider("anthropic", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ExtractError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set ANTHROPIC_API_KEY, OPENAI_API_KEY, or pass --provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
