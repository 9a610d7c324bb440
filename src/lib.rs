//! Stele covenant protocol core.
//!
//! This crate provides the protocol primitives for building, signing,
//! verifying, countersigning and chaining covenant documents, together with
//! the Covenant Constraint Language (CCL) those documents embed:
//!
//! - **crypto**: Ed25519 signing/verification, SHA-256 hashing, JCS canonicalization, codecs
//! - **ccl**: CCL tokenizer, parser, evaluator, rate limits, merge and narrowing
//! - **covenant**: canonical form, document identity, build, verify, countersign
//! - **chain**: delegation chain validation, effective constraints, chain resolution
//! - **schema**: structural validation of the wire format with a warnings channel
//! - **store**: the read-only document store boundary and an in-memory store

pub mod ccl;
pub mod chain;
pub mod covenant;
pub mod crypto;
pub mod schema;
pub mod store;

pub use covenant::{MAX_CHAIN_DEPTH, PROTOCOL_VERSION};

/// Errors that can occur throughout the Stele protocol.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SteleError {
    /// An input to a builder or codec was rejected.
    #[error("invalid {field}: {reason}")]
    InvalidInput {
        /// The offending field, in wire-format notation (e.g. `chain.depth`).
        field: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A cryptographic primitive failed or was handed malformed key material.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// CCL source text is not syntactically valid.
    #[error("CCL syntax error at line {line}, column {column}: {message}")]
    CclSyntax {
        line: usize,
        column: usize,
        message: String,
    },

    /// A CCL statement parsed but is semantically invalid.
    #[error("CCL validation error at line {line}: {message}")]
    CclValidation { line: usize, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl SteleError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SteleError::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for both kinds of CCL error (syntax and validation).
    pub fn is_ccl_error(&self) -> bool {
        matches!(
            self,
            SteleError::CclSyntax { .. } | SteleError::CclValidation { .. }
        )
    }
}
