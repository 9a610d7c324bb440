//! Structural validation of the covenant wire format.
//!
//! Unlike `verify_covenant`, these checks need no cryptography: they confirm
//! that every field has the shape the protocol requires. Findings that do
//! not make a document unusable are reported as warnings, which strict mode
//! promotes to failures.

use crate::covenant::{needs_upgrade, parse_version, CovenantDocument, Party};
use crate::crypto::{self, NONCE_LENGTH, SIGNATURE_LENGTH};
use std::fmt;

/// A single schema finding, located by wire-format field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    pub field: String,
    pub message: String,
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaReport {
    pub valid: bool,
    pub errors: Vec<SchemaIssue>,
    pub warnings: Vec<SchemaIssue>,
}

#[derive(Default)]
struct Collector {
    errors: Vec<SchemaIssue>,
    warnings: Vec<SchemaIssue>,
}

impl Collector {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(SchemaIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(SchemaIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    fn hex(&mut self, field: &str, value: &str, bytes: usize) {
        if !crypto::is_hex_of_len(value, bytes) {
            self.error(field, format!("expected {} lowercase hex characters", bytes * 2));
        }
    }

    fn timestamp(&mut self, field: &str, value: &str) {
        if !crypto::is_protocol_timestamp(value) {
            self.error(field, "expected YYYY-MM-DDTHH:MM:SS.sssZ");
        }
    }

    fn party(&mut self, field: &str, party: &Party) {
        if party.id.trim().is_empty() {
            self.error(format!("{field}.id"), "must not be empty");
        }
        if party.role.trim().is_empty() {
            self.error(format!("{field}.role"), "must not be empty");
        }
        self.hex(&format!("{field}.publicKey"), &party.public_key, 32);
    }
}

/// Check a document's structure.
///
/// With `strict` set, any warning also makes the report invalid.
pub fn validate_schema(doc: &CovenantDocument, strict: bool) -> SchemaReport {
    let mut c = Collector::default();

    c.hex("id", &doc.id, 32);
    if parse_version(&doc.version).is_none() {
        c.error("version", "expected MAJOR.MINOR");
    }
    c.party("issuer", &doc.issuer);
    c.party("beneficiary", &doc.beneficiary);
    if doc.constraints.trim().is_empty() {
        c.error("constraints", "must not be empty");
    }
    c.hex("nonce", &doc.nonce, NONCE_LENGTH);
    c.timestamp("createdAt", &doc.created_at);
    c.hex("signature", &doc.signature, SIGNATURE_LENGTH);

    if let Some(chain) = &doc.chain {
        if chain.parent_id.trim().is_empty() {
            c.error("chain.parentId", "must not be empty");
        }
        if chain.relation.trim().is_empty() {
            c.error("chain.relation", "must not be empty");
        }
        if chain.depth == 0 {
            c.error("chain.depth", "must be at least 1");
        }
    }

    match &doc.expires_at {
        Some(ts) => c.timestamp("expiresAt", ts),
        None => c.warn("expiresAt", "document never expires"),
    }
    if let Some(ts) = &doc.activates_at {
        c.timestamp("activatesAt", ts);
    }

    for (i, cs) in doc.countersignatures().iter().enumerate() {
        let at = format!("countersignatures[{i}]");
        c.hex(&format!("{at}.signerPublicKey"), &cs.signer_public_key, 32);
        c.hex(&format!("{at}.signature"), &cs.signature, SIGNATURE_LENGTH);
        c.timestamp(&format!("{at}.timestamp"), &cs.timestamp);
        if cs.signer_role.trim().is_empty() {
            c.error(format!("{at}.signerRole"), "must not be empty");
        }
    }

    if doc.metadata.is_none() {
        c.warn("metadata", "no metadata present");
    }
    if parse_version(&doc.version).is_some() && needs_upgrade(doc) {
        c.warn("version", format!("{} predates the current protocol version", doc.version));
    }

    let valid = c.errors.is_empty() && (!strict || c.warnings.is_empty());
    SchemaReport {
        valid,
        errors: c.errors,
        warnings: c.warnings,
    }
}
