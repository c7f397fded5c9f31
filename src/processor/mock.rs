//! Mock processor client for testing without network calls.

use super::{ProcessorClient, ProcessorError};
use crate::domain::{Cents, Currency};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Mock processor that returns predefined balances or failures.
#[derive(Debug, Clone, Default)]
pub struct MockProcessorClient {
    balances: HashMap<(String, Currency), Cents>,
    failures: HashMap<String, ProcessorError>,
    calls: Arc<AtomicUsize>,
}

impl MockProcessorClient {
    /// Create a new mock with no accounts. Unknown accounts report zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the available balance reported for a sub-account.
    pub fn with_balance(
        mut self,
        merchant_account_id: impl Into<String>,
        currency: Currency,
        available: Cents,
    ) -> Self {
        self.balances
            .insert((merchant_account_id.into(), currency), available);
        self
    }

    /// Make every call for a sub-account fail with `error`.
    pub fn with_failure(
        mut self,
        merchant_account_id: impl Into<String>,
        error: ProcessorError,
    ) -> Self {
        self.failures.insert(merchant_account_id.into(), error);
        self
    }

    /// Number of balance fetches served so far, across clones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessorClient for MockProcessorClient {
    async fn fetch_available_balance(
        &self,
        merchant_account_id: &str,
        currency: &Currency,
    ) -> Result<Cents, ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.get(merchant_account_id) {
            return Err(error.clone());
        }
        Ok(self
            .balances
            .get(&(merchant_account_id.to_string(), currency.clone()))
            .copied()
            .unwrap_or(Cents::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_returns_configured_balance() {
        let mock = MockProcessorClient::new().with_balance("acct_1", Currency::usd(), Cents(700));

        let balance = mock
            .fetch_available_balance("acct_1", &Currency::usd())
            .await
            .unwrap();
        assert_eq!(balance, Cents(700));

        let other = mock
            .fetch_available_balance("acct_2", &Currency::usd())
            .await
            .unwrap();
        assert_eq!(other, Cents::ZERO);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_failure() {
        let mock = MockProcessorClient::new()
            .with_failure("acct_gone", ProcessorError::AlreadyDeauthorized);

        let result = mock
            .fetch_available_balance("acct_gone", &Currency::usd())
            .await;
        assert_eq!(result, Err(ProcessorError::AlreadyDeauthorized));
    }
}
