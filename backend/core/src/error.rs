use thiserror::Error;
use uuid::Uuid;

use crate::traits::StoreError;

/// Top-level error type for the Keystone trust backend.
///
/// Every public operation returns either a fully valid result or exactly one
/// of these variants.
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("unknown onboarding certificate")]
    UnknownCertificate,

    #[error("unknown serial: {0}")]
    InvalidSerial(String),

    #[error("serial already used for onboarding certificate: {0}")]
    SerialAlreadyUsed(String),

    #[error("device already registered as {0}")]
    AlreadyRegistered(Uuid),

    #[error("unregistered device UUID {0}")]
    UnregisteredDevice(Uuid),

    #[error("mismatched UUID: target {expected}, document carries {found}")]
    MismatchedIdentity { expected: Uuid, found: String },

    #[error("backing store error ({context}, {failed_keys} key(s) failed): {message}")]
    BackingStore {
        context: String,
        failed_keys: usize,
        message: String,
    },
}

impl TrustError {
    /// Wrap a single failed store call with the operation context.
    pub fn store(context: impl Into<String>, err: StoreError) -> Self {
        TrustError::BackingStore {
            context: context.into(),
            failed_keys: 1,
            message: err.to_string(),
        }
    }

    pub fn decode(what: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        TrustError::Decode(format!("{}: {}", what.into(), detail))
    }

    /// True for errors produced by validation alone, before touching the store.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TrustError::InvalidInput(_)
                | TrustError::InvalidSerial(_)
                | TrustError::MismatchedIdentity { .. }
        )
    }
}

pub type TrustResult<T> = Result<T, TrustError>;
