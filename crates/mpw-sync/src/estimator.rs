//! Batch price estimation through a text-generation model.
//!
//! One prompt per batch, one model call per prompt. The reply is expected to be
//! a `||`-delimited list of numbers in input order; anything else is parsed
//! leniently and aligned to the batch by position.

use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use mpw_core::ListingRecord;
use mpw_storage::{FetchError, HttpFetcher};
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

use crate::config::ModelSettings;

pub const ESTIMATE_DELIMITER: &str = "||";

/// A digit run with any embedded `.`/`,` separators, so `1,299.99` stays one token.
static NUMBER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d.,]*").expect("number pattern compiles"));

#[derive(Debug, Error)]
pub enum EstimateError {
    #[error("model request failed: {0}")]
    Fetch(#[from] FetchError),
}

/// One position of a parsed model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEstimate {
    Value(Decimal),
    /// A token was present at this position but is not a number.
    Unparseable(String),
    /// The reply ran out before this position.
    Missing,
}

impl ParsedEstimate {
    pub fn value(&self) -> Option<Decimal> {
        match self {
            Self::Value(v) => Some(*v),
            Self::Unparseable(_) | Self::Missing => None,
        }
    }
}

/// Single-shot text generation.
#[async_trait]
pub trait PriceModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, EstimateError>;
}

/// Gemini `generateContent` client.
#[derive(Debug, Clone)]
pub struct GeminiModel {
    http: HttpFetcher,
    settings: ModelSettings,
}

impl GeminiModel {
    pub fn new(http: HttpFetcher, settings: ModelSettings) -> Self {
        Self { http, settings }
    }

    fn endpoint(&self) -> String {
        let model = self.settings.model.trim_start_matches("models/");
        format!(
            "{}/v1beta/models/{model}:generateContent",
            self.settings.api_base.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl PriceModel for GeminiModel {
    async fn generate(&self, prompt: &str) -> Result<String, EstimateError> {
        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}]
        });
        let response = self
            .http
            .post_json(&self.endpoint(), &[("key", self.settings.api_key.as_str())], &body)
            .await?;
        Ok(response_text(&response))
    }
}

/// Concatenated text parts of the first candidate; empty when there are none.
fn response_text(response: &JsonValue) -> String {
    response
        .pointer("/candidates/0/content/parts")
        .and_then(JsonValue::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(JsonValue::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Price-estimate requester. Without a model every estimate is [`ParsedEstimate::Missing`].
#[derive(Clone, Default)]
pub struct PriceEstimator {
    model: Option<Arc<dyn PriceModel>>,
}

impl PriceEstimator {
    pub fn new(model: Arc<dyn PriceModel>) -> Self {
        Self { model: Some(model) }
    }

    pub fn disabled() -> Self {
        Self { model: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.model.is_some()
    }

    /// One estimate per record, in input order.
    pub async fn estimate(
        &self,
        batch: &[ListingRecord],
    ) -> Result<Vec<ParsedEstimate>, EstimateError> {
        let Some(model) = &self.model else {
            return Ok(vec![ParsedEstimate::Missing; batch.len()]);
        };
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let raw = model.generate(&build_price_prompt(batch)).await?;
        debug!(items = batch.len(), reply = %raw.trim(), "model reply");
        Ok(parse_estimates(&raw, batch.len()))
    }
}

pub fn build_price_prompt(batch: &[ListingRecord]) -> String {
    let mut prompt = format!(
        "Estimate the current fair market price for each of the marketplace listings below. \
         Reply with only the numbers, one per listing in the same order, \
         separated by '{ESTIMATE_DELIMITER}'. \
         Write nothing else.\n\
         Example: 320{ESTIMATE_DELIMITER}28.5{ESTIMATE_DELIMITER}290\n\n"
    );
    for record in batch {
        let title = record.title.as_deref().unwrap_or("untitled listing");
        let price = record
            .price_value
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let currency = record.price_currency.as_deref().unwrap_or("");
        let listed = format!("{price} {currency}");
        prompt.push_str(&format!("- {title} (listed: {})\n", listed.trim_end()));
    }
    prompt
}

/// Aligns a free-text reply to `expected` positions. Never fails.
pub fn parse_estimates(raw: &str, expected: usize) -> Vec<ParsedEstimate> {
    let raw = raw.trim();
    let tokens: Vec<&str> = if raw.contains(ESTIMATE_DELIMITER) {
        raw.split(ESTIMATE_DELIMITER).map(str::trim).collect()
    } else {
        NUMBER_TOKEN.find_iter(raw).map(|m| m.as_str()).collect()
    };

    let mut estimates: Vec<ParsedEstimate> = tokens
        .into_iter()
        .take(expected)
        .map(parse_token)
        .collect();
    estimates.resize(expected, ParsedEstimate::Missing);
    estimates
}

fn parse_token(token: &str) -> ParsedEstimate {
    let cleaned = token
        .trim_matches(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .trim_end_matches(['.', ',']);
    match Decimal::from_str(&normalize_separators(cleaned)) {
        Ok(value) => ParsedEstimate::Value(value),
        Err(_) => ParsedEstimate::Unparseable(token.to_string()),
    }
}

/// The last separator is the decimal point unless its kind repeats; every
/// other separator groups thousands and is dropped.
fn normalize_separators(number: &str) -> String {
    let Some(last) = number.rfind(['.', ',']) else {
        return number.to_string();
    };
    let mark = char::from(number.as_bytes()[last]);
    let grouping_only = number.matches(mark).count() > 1;
    number
        .char_indices()
        .filter_map(|(index, c)| match c {
            '.' | ',' if index == last && !grouping_only => Some('.'),
            '.' | ',' => None,
            c => Some(c),
        })
        .collect()
}
