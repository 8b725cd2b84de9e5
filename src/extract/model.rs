//! Model-assisted extraction through a chat completion provider.
//!
//! The page's visible text and an extraction instruction are sent to the
//! provider, which is expected to answer with a JSON array of product objects.
//!
//! # Architecture
//!
//! - [`CompletionProvider`]: core trait defining an async completion call
//! - [`AwfulCompletion`]: wraps the `awful_aj` library's `ask` function
//! - [`RetryCompletion`]: decorator that adds retry logic to any provider
//!
//! A response that fails to parse with an EOF error was most likely cut off by
//! a token limit; it is asked for once more before giving up.

use crate::error::ExtractionFailure;
use crate::fetch::Document;
use crate::models::RawRecord;
use crate::utils::{collapse_whitespace, looks_truncated, truncate_for_log};
use awful_aj::api::ask;
use awful_aj::{config, config_dir, config::AwfulJadeConfig, template, template::ChatTemplate};
use rand::{Rng, rng};
use scraper::Html;
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// Instruction used when a source has no prompt of its own.
pub const DEFAULT_INSTRUCTION: &str = "Extract all women's health at-home test products from this page. \
For each product return: name, price (numeric USD), original_price (if discounted), \
url, image_url, description, in_stock. Return only a JSON array.";

/// Trait for async completion calls.
pub trait CompletionProvider {
    async fn complete(&self, prompt: &str) -> Result<String, Box<dyn Error>>;
}

impl<T: CompletionProvider> CompletionProvider for &T {
    async fn complete(&self, prompt: &str) -> Result<String, Box<dyn Error>> {
        (**self).complete(prompt).await
    }
}

/// `awful_aj` client owning its configuration and chat template.
pub struct AwfulCompletion {
    config: AwfulJadeConfig,
    template: ChatTemplate,
}

impl AwfulCompletion {
    /// Load `config.yaml` from the `awful_aj` config directory and the named template.
    #[instrument(level = "info")]
    pub async fn load(template_name: &str) -> Result<Self, Box<dyn Error>> {
        let template = template::load_template(template_name).await?;
        let conf_file = config_dir()?.join("config.yaml");
        let config_path = conf_file
            .to_str()
            .ok_or("awful_aj config path is not valid UTF-8")?;
        let config = config::load_config(config_path)?;
        info!(config_path, template = template_name, "Loaded completion provider");
        Ok(Self { config, template })
    }
}

impl fmt::Debug for AwfulCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwfulCompletion").finish_non_exhaustive()
    }
}

impl CompletionProvider for AwfulCompletion {
    #[instrument(level = "info", skip_all)]
    async fn complete(&self, prompt: &str) -> Result<String, Box<dyn Error>> {
        let t0 = Instant::now();
        let res = ask(&self.config, prompt.to_string(), &self.template, None, None).await;
        if let Err(e) = &res {
            warn!(elapsed_ms = t0.elapsed().as_millis(), error = %e, "API call failed");
        }
        res
    }
}

/// Wrapper that adds exponential backoff retry logic to any [`CompletionProvider`].
///
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
/// ```
pub struct RetryCompletion<T> {
    inner: T,
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T: CompletionProvider> RetryCompletion<T> {
    pub fn new(inner: T, max_retries: usize, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl<T> fmt::Debug for RetryCompletion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryCompletion")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl<T: CompletionProvider> CompletionProvider for RetryCompletion<T> {
    #[instrument(level = "info", skip_all)]
    async fn complete(&self, prompt: &str) -> Result<String, Box<dyn Error>> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            match self.inner.complete(prompt).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_total = total_t0.elapsed().as_millis(),
                            error = %e,
                            "complete() exhausted retries"
                        );
                        return Err(e);
                    }

                    let mut delay = self.base_delay.saturating_mul(1 << (attempt - 1));
                    if delay > self.max_delay {
                        delay = self.max_delay;
                    }
                    let jitter_ms: u64 = rng().random_range(0..=250);
                    let delay = delay + Duration::from_millis(jitter_ms);

                    warn!(
                        attempt,
                        max = self.max_retries,
                        ?delay,
                        error = %e,
                        "complete() attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Text a reader would see: script, style and template contents dropped,
/// whitespace collapsed.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut parts: Vec<&str> = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| matches!(e.name(), "script" | "style" | "noscript" | "template"))
        });
        if !hidden {
            parts.push(text);
        }
    }
    collapse_whitespace(&parts.join(" "))
}

fn build_prompt(instruction: &str, document: &Document, max_chars: usize) -> String {
    let text: String = visible_text(&document.html).chars().take(max_chars).collect();
    format!("{instruction}\n\nPage URL: {}\n\nPage text:\n{text}", document.url)
}

/// The body of a completion with an optional Markdown code fence removed.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json) up to the first newline.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn is_truncated(completion: &str) -> bool {
    serde_json::from_str::<Value>(strip_code_fence(completion))
        .err()
        .is_some_and(|e| looks_truncated(&e))
}

/// Decode a completion into candidate records.
///
/// Accepts a JSON array of objects or an object with a `products` array.
/// Elements that are not objects, or that lack a name or price, are dropped.
pub fn parse_completion(completion: &str) -> Result<Vec<RawRecord>, ExtractionFailure> {
    let body = strip_code_fence(completion);
    let value: Value = serde_json::from_str(body).map_err(|e| ExtractionFailure::MalformedOutput {
        message: format!("{e} in `{}`", truncate_for_log(body, 200)),
    })?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("products") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ExtractionFailure::MalformedOutput {
                    message: "object without a `products` array".to_string(),
                });
            }
        },
        other => {
            return Err(ExtractionFailure::MalformedOutput {
                message: format!("expected an array, got `{}`", truncate_for_log(&other.to_string(), 80)),
            });
        }
    };

    let total = items.len();
    let records: Vec<RawRecord> = items
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|item| serde_json::from_value::<RawRecord>(item).ok())
        .filter(RawRecord::has_required_fields)
        .collect();
    debug!(total, kept = records.len(), "Decoded completion");
    Ok(records)
}

/// Run model-assisted extraction over one document.
#[instrument(level = "info", skip_all, fields(url = %document.url))]
pub async fn extract_with_model<P: CompletionProvider>(
    document: &Document,
    instruction: &str,
    provider: Option<&P>,
    max_chars: usize,
) -> Result<Vec<RawRecord>, ExtractionFailure> {
    let provider = provider.ok_or(ExtractionFailure::ProviderUnavailable)?;
    let prompt = build_prompt(instruction, document, max_chars);

    let mut completion = provider
        .complete(&prompt)
        .await
        .map_err(|e| ExtractionFailure::Provider(e.to_string()))?;
    if is_truncated(&completion) {
        warn!(
            response = %truncate_for_log(&completion, 200),
            "EOF while parsing completion; re-asking once"
        );
        completion = provider
            .complete(&prompt)
            .await
            .map_err(|e| ExtractionFailure::Provider(e.to_string()))?;
    }
    parse_completion(&completion)
}

/// Provider answering from a fixed script, for tests.
#[cfg(test)]
pub struct ScriptedCompletion {
    responses: std::sync::Mutex<std::collections::VecDeque<String>>,
    pub prompts: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl ScriptedCompletion {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().map(Into::into).collect()),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
impl CompletionProvider for ScriptedCompletion {
    async fn complete(&self, prompt: &str) -> Result<String, Box<dyn Error>> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| "script exhausted".into())
    }
}
