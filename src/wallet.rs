//! Wallet connector boundary.
//!
//! Strictly informational: the dialogue core never depends on wallet state.
//! A concrete connector (e.g. a CKB wallet bridge) implements the trait; the
//! CLI ships with the no-op connector.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("no wallet connector configured")]
    NotConfigured,
    #[error("wallet not connected")]
    NotConnected,
    #[error("wallet error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait WalletConnector: Send + Sync {
    async fn connect(&mut self) -> Result<(), WalletError>;
    async fn disconnect(&mut self) -> Result<(), WalletError>;
    fn is_connected(&self) -> bool;
    async fn address(&self) -> Result<String, WalletError>;
    /// Human-readable balance string, denominated by the backend.
    async fn balance(&self) -> Result<String, WalletError>;
}

/// Placeholder connector for builds without a wallet backend.
pub struct NoWallet;

#[async_trait]
impl WalletConnector for NoWallet {
    async fn connect(&mut self) -> Result<(), WalletError> {
        Err(WalletError::NotConfigured)
    }

    async fn disconnect(&mut self) -> Result<(), WalletError> {
        Err(WalletError::NotConfigured)
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn address(&self) -> Result<String, WalletError> {
        Err(WalletError::NotConfigured)
    }

    async fn balance(&self) -> Result<String, WalletError> {
        Err(WalletError::NotConfigured)
    }
}
