//! Error types for the tresdice settlement engine.
//!
//! Validation errors (`InvalidInput`, `InsufficientBalance`,
//! `InvalidGameState`) are always raised before any mutation.
//! `ExternalSendFailure` is raised only after the compensating refund has
//! committed, so callers never observe a stranded debit. `DuplicateEvent`
//! is not an error in the HTTP sense; handlers map it to a no-op success.

pub type CasinoResult<T> = Result<T, CasinoError>;

#[derive(Debug, thiserror::Error)]
pub enum CasinoError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: u64, available: u64 },

    #[error("Invalid game state: {0}")]
    InvalidGameState(String),

    #[error("External send failed after compensation: {0}")]
    ExternalSendFailure(String),

    #[error("Duplicate event: {reference}")]
    DuplicateEvent { reference: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CasinoError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn invalid_game_state(msg: impl Into<String>) -> Self {
        Self::InvalidGameState(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn external_send(msg: impl Into<String>) -> Self {
        Self::ExternalSendFailure(msg.into())
    }

    pub fn duplicate(reference: impl Into<String>) -> Self {
        Self::DuplicateEvent {
            reference: reference.into(),
        }
    }

    /// True for failures the caller may safely retry (the ledger has already
    /// been compensated).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalSendFailure(_))
    }
}

impl From<rocksdb::Error> for CasinoError {
    fn from(e: rocksdb::Error) -> Self {
        CasinoError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for CasinoError {
    fn from(e: serde_json::Error) -> Self {
        CasinoError::Storage(format!("codec: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = CasinoError::InsufficientBalance {
            needed: 100,
            available: 40,
        };
        assert!(e.to_string().contains("need 100"));
        assert!(e.to_string().contains("have 40"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CasinoError::ExternalSendFailure("timeout".into()).is_retryable());
        assert!(!CasinoError::invalid_input("bad stake").is_retryable());
    }
}
