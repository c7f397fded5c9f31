//! HTTP client for the processor's balance endpoint.

use super::{ProcessorClient, ProcessorError};
use crate::domain::{Cents, Currency};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Processor balance API over HTTPS.
///
/// Expects `GET {base}/v1/balance` scoped to a sub-account via the
/// `Processor-Account` header, answering
/// `{"available": [{"amount": 1234, "currency": "usd"}, ...]}`.
#[derive(Debug, Clone)]
pub struct HttpProcessorClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    rate_limit_budget: Duration,
}

impl HttpProcessorClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            rate_limit_budget: Duration::from_secs(10),
        }
    }

    async fn get_balance_json(
        &self,
        merchant_account_id: &str,
    ) -> Result<serde_json::Value, ProcessorError> {
        let url = format!("{}/v1/balance", self.base_url.trim_end_matches('/'));
        // Only rate limiting is retried here; every other failure is handed
        // back so the caller can skip this account for the run.
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.rate_limit_budget),
            ..Default::default()
        };

        retry(backoff, || async {
            let mut request = self
                .client
                .get(&url)
                .header("Processor-Account", merchant_account_id);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = request.send().await.map_err(|e| {
                backoff::Error::permanent(ProcessorError::NetworkError(e.to_string()))
            })?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(backoff::Error::transient(ProcessorError::RateLimited));
            }

            let text = response.text().await.map_err(|e| {
                backoff::Error::permanent(ProcessorError::NetworkError(e.to_string()))
            })?;
            decode_response(status, &text).map_err(backoff::Error::permanent)
        })
        .await
    }
}

#[async_trait]
impl ProcessorClient for HttpProcessorClient {
    async fn fetch_available_balance(
        &self,
        merchant_account_id: &str,
        currency: &Currency,
    ) -> Result<Cents, ProcessorError> {
        debug!(
            merchant_account_id = %merchant_account_id,
            currency = %currency,
            "Fetching processor balance"
        );
        let body = self.get_balance_json(merchant_account_id).await?;
        parse_available(&body, currency)
    }
}

/// Decode a response body. Error statuses are classified even when the body
/// is not JSON (a proxy's HTML 502, say).
fn decode_response(status: StatusCode, text: &str) -> Result<serde_json::Value, ProcessorError> {
    if !status.is_success() {
        let body = serde_json::from_str(text).unwrap_or(serde_json::Value::Null);
        return Err(classify_error(status, &body));
    }
    serde_json::from_str(text).map_err(|e| ProcessorError::ParseError(e.to_string()))
}

/// Map an error response onto a typed outcome using the structured error code.
fn classify_error(status: StatusCode, body: &serde_json::Value) -> ProcessorError {
    let code = body
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str());

    match code {
        Some("account_deauthorized") | Some("account_invalid") => {
            ProcessorError::AlreadyDeauthorized
        }
        Some("livemode_mismatch") => ProcessorError::KeyModeMismatch,
        _ => ProcessorError::HttpError {
            status: status.as_u16(),
            message: body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or(if status.is_server_error() {
                    "Server error"
                } else {
                    "Client error"
                })
                .to_string(),
        },
    }
}

/// Sum the `available` entries in `currency`. No entry for the currency reads as zero.
fn parse_available(body: &serde_json::Value, currency: &Currency) -> Result<Cents, ProcessorError> {
    let available = body
        .get("available")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ProcessorError::ParseError("Missing available array".to_string()))?;

    let mut total = Cents::ZERO;
    for item in available {
        let item_currency = item
            .get("currency")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProcessorError::ParseError("Missing currency field".to_string()))?;
        if Currency::new(item_currency) != *currency {
            continue;
        }
        let amount = item
            .get("amount")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ProcessorError::ParseError("Missing amount field".to_string()))?;
        total = total.checked_add(Cents::new(amount)).ok_or_else(|| {
            ProcessorError::ParseError("Available balance overflows".to_string())
        })?;
    }
    Ok(total)
}
