//! Payment-processor balance API used by the external-balance check.

use crate::domain::{Cents, Currency};
use async_trait::async_trait;
use std::fmt;

pub mod http;
pub mod mock;

pub use http::HttpProcessorClient;
pub use mock::MockProcessorClient;

/// Reads the processor's view of a merchant sub-account.
///
/// Implementations do not retry failures beyond rate limiting; the next
/// scheduled run is the retry.
#[async_trait]
pub trait ProcessorClient: Send + Sync + fmt::Debug {
    /// Currently available balance of `merchant_account_id` in `currency`, in minor units.
    async fn fetch_available_balance(
        &self,
        merchant_account_id: &str,
        currency: &Currency,
    ) -> Result<Cents, ProcessorError>;
}

/// Outcome of a failed processor call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// The platform's access to the sub-account has been revoked.
    #[error("Account already deauthorized")]
    AlreadyDeauthorized,
    /// A test-mode key was used against a live account, or vice versa.
    #[error("Test/live key mismatch")]
    KeyModeMismatch,
    /// Network error (e.g., connection timeout, DNS failure)
    #[error("Network error: {0}")]
    NetworkError(String),
    /// HTTP error not covered by a more specific variant
    #[error("HTTP error {status}: {message}")]
    HttpError { status: u16, message: String },
    /// Parsing error (invalid JSON or malformed response)
    #[error("Parse error: {0}")]
    ParseError(String),
    /// Rate limit exceeded
    #[error("Rate limited")]
    RateLimited,
    #[error("Error: {0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_error_display() {
        let err = ProcessorError::NetworkError("connection timeout".to_string());
        assert_eq!(err.to_string(), "Network error: connection timeout");

        let err = ProcessorError::HttpError {
            status: 500,
            message: "Server error".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP error 500: Server error");

        assert_eq!(
            ProcessorError::AlreadyDeauthorized.to_string(),
            "Account already deauthorized"
        );
        assert_eq!(ProcessorError::KeyModeMismatch.to_string(), "Test/live key mismatch");
    }
}
