//! Covenant documents: canonical form, identity, build, verify, countersign.
//!
//! A covenant binds an issuer and a beneficiary to a CCL policy. Its id is
//! the SHA-256 of its canonical form and its signature is the issuer's
//! Ed25519 signature over the same bytes, so any change to a signed field
//! breaks both. Countersignatures sign the same canonical form and can be
//! appended without touching `id` or `signature`.

use crate::ccl;
use crate::crypto::{self, KeyPair};
use crate::SteleError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

pub use crate::crypto::NONCE_LENGTH;

/// Current covenant protocol version (`MAJOR.MINOR`).
pub const PROTOCOL_VERSION: &str = "1.0";

/// Maximum number of CCL statements in a single covenant.
pub const MAX_CONSTRAINTS: usize = 256;

/// Maximum depth of a delegation chain.
pub const MAX_CHAIN_DEPTH: usize = 16;

/// Maximum serialized document size in bytes (1 MiB).
pub const MAX_DOCUMENT_SIZE: usize = 1_048_576;

/// Recognized `enforcement.type` values.
pub const ENFORCEMENT_TYPES: &[&str] = &["capability", "monitor", "audit", "bond", "composite"];

/// Recognized `proof.type` values.
pub const PROOF_TYPES: &[&str] = &["tee", "capability_manifest", "audit_log", "zkp", "composite"];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A participant in a covenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Party {
    pub id: String,
    pub public_key: String,
    pub role: String,
}

impl Party {
    pub fn new(id: impl Into<String>, public_key: impl Into<String>, role: impl Into<String>) -> Self {
        Party {
            id: id.into(),
            public_key: public_key.into(),
            role: role.into(),
        }
    }

    pub fn issuer(id: impl Into<String>, public_key: impl Into<String>) -> Self {
        Party::new(id, public_key, "issuer")
    }

    pub fn beneficiary(id: impl Into<String>, public_key: impl Into<String>) -> Self {
        Party::new(id, public_key, "beneficiary")
    }
}

/// Link from a delegated covenant to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChainReference {
    pub parent_id: String,
    pub relation: String,
    /// Distance from the root; the first delegation has depth 1.
    pub depth: usize,
}

impl ChainReference {
    pub fn new(parent_id: impl Into<String>, relation: impl Into<String>, depth: usize) -> Self {
        ChainReference {
            parent_id: parent_id.into(),
            relation: relation.into(),
            depth,
        }
    }
}

/// A third-party signature over the document's canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Countersignature {
    pub signer_public_key: String,
    pub signer_role: String,
    pub signature: String,
    pub timestamp: String,
}

/// How the covenant is enforced at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnforcementConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,
}

/// How compliance with the covenant is attested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProofConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,
}

/// A complete, signed covenant document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CovenantDocument {
    pub id: String,
    pub version: String,
    pub issuer: Party,
    pub beneficiary: Party,
    pub constraints: String,
    pub nonce: String,
    pub created_at: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activates_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforcement: Option<EnforcementConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<ProofConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countersignatures: Option<Vec<Countersignature>>,
}

impl CovenantDocument {
    /// A document without a chain reference is a root.
    pub fn is_root(&self) -> bool {
        self.chain.is_none()
    }

    pub fn countersignatures(&self) -> &[Countersignature] {
        self.countersignatures.as_deref().unwrap_or_default()
    }
}

/// One named verification check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationCheck {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
}

/// Outcome of `verify_covenant`: every check, in a fixed order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub valid: bool,
    pub checks: Vec<VerificationCheck>,
}

impl VerificationResult {
    pub fn check(&self, name: &str) -> Option<&VerificationCheck> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn failed(&self) -> impl Iterator<Item = &VerificationCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// Clock and limits used during verification.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Instant to evaluate expiry and activation against; `None` reads the system clock.
    pub now: Option<DateTime<Utc>>,
    pub max_document_size: usize,
    pub max_constraints: usize,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            now: None,
            max_document_size: MAX_DOCUMENT_SIZE,
            max_constraints: MAX_CONSTRAINTS,
        }
    }
}

impl VerifyOptions {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Some(now),
            ..Self::default()
        }
    }
}

/// Inputs to `build_covenant`.
#[derive(Clone)]
pub struct CovenantBuilderOptions {
    pub issuer: Party,
    pub beneficiary: Party,
    pub constraints: String,
    pub signing_key: ed25519_dalek::SigningKey,
    /// Raw nonce bytes; generated when absent.
    pub nonce: Option<Vec<u8>>,
    pub chain: Option<ChainReference>,
    pub expires_at: Option<String>,
    pub activates_at: Option<String>,
    pub enforcement: Option<EnforcementConfig>,
    pub proof: Option<ProofConfig>,
    pub metadata: Option<Map<String, Value>>,
}

impl CovenantBuilderOptions {
    pub fn new(
        issuer: Party,
        beneficiary: Party,
        constraints: impl Into<String>,
        signing_key: &ed25519_dalek::SigningKey,
    ) -> Self {
        CovenantBuilderOptions {
            issuer,
            beneficiary,
            constraints: constraints.into(),
            signing_key: signing_key.clone(),
            nonce: None,
            chain: None,
            expires_at: None,
            activates_at: None,
            enforcement: None,
            proof: None,
            metadata: None,
        }
    }

    pub fn with_nonce(mut self, nonce: impl Into<Vec<u8>>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    pub fn with_chain(mut self, chain: ChainReference) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_expires_at(mut self, expires_at: impl Into<String>) -> Self {
        self.expires_at = Some(expires_at.into());
        self
    }

    pub fn with_activates_at(mut self, activates_at: impl Into<String>) -> Self {
        self.activates_at = Some(activates_at.into());
        self
    }

    pub fn with_enforcement(mut self, enforcement: EnforcementConfig) -> Self {
        self.enforcement = Some(enforcement);
        self
    }

    pub fn with_proof(mut self, proof: ProofConfig) -> Self {
        self.proof = Some(proof);
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ---------------------------------------------------------------------------
// Canonical form and identity
// ---------------------------------------------------------------------------

/// The canonical JSON of a document, excluding `id`, `signature` and
/// `countersignatures`. These are the exact bytes hashed and signed.
pub fn canonical_form(doc: &CovenantDocument) -> Result<String, SteleError> {
    let value = serde_json::to_value(doc).map_err(|e| SteleError::Serialization(e.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(SteleError::Serialization("document is not a JSON object".to_string()));
    };
    fields.remove("id");
    fields.remove("signature");
    fields.remove("countersignatures");
    Ok(crypto::canonicalize_json(&Value::Object(fields)))
}

/// SHA-256 hex of the canonical form.
pub fn compute_id(doc: &CovenantDocument) -> Result<String, SteleError> {
    Ok(crypto::sha256_string(&canonical_form(doc)?))
}

pub(crate) fn parse_version(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.split_once('.')?;
    let part = |s: &str| {
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            s.parse().ok()
        } else {
            None
        }
    };
    Some((part(major)?, part(minor)?))
}

/// Whether the document predates `PROTOCOL_VERSION` or carries an
/// unparseable version.
pub fn needs_upgrade(doc: &CovenantDocument) -> bool {
    match (parse_version(&doc.version), parse_version(PROTOCOL_VERSION)) {
        (Some(have), Some(current)) => have < current,
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

fn check_party(party: &Party, field: &str, role: &str) -> Result<(), SteleError> {
    if party.id.trim().is_empty() {
        return Err(SteleError::invalid(format!("{field}.id"), "must not be empty"));
    }
    if party.role != role {
        return Err(SteleError::invalid(
            format!("{field}.role"),
            format!("must be \"{role}\", got \"{}\"", party.role),
        ));
    }
    if !crypto::is_hex_of_len(&party.public_key, 32) {
        return Err(SteleError::invalid(
            format!("{field}.publicKey"),
            "must be 64 lowercase hex characters",
        ));
    }
    Ok(())
}

fn check_timestamp(value: Option<&str>, field: &str) -> Result<(), SteleError> {
    match value {
        Some(ts) if !crypto::is_protocol_timestamp(ts) => Err(SteleError::invalid(
            field,
            format!("expected YYYY-MM-DDTHH:MM:SS.sssZ, got \"{ts}\""),
        )),
        _ => Ok(()),
    }
}

fn check_chain(chain: &ChainReference) -> Result<(), SteleError> {
    if chain.parent_id.trim().is_empty() {
        return Err(SteleError::invalid("chain.parentId", "must not be empty"));
    }
    if chain.relation.trim().is_empty() {
        return Err(SteleError::invalid("chain.relation", "must not be empty"));
    }
    if chain.depth < 1 || chain.depth > MAX_CHAIN_DEPTH {
        return Err(SteleError::invalid(
            "chain.depth",
            format!("must be between 1 and {MAX_CHAIN_DEPTH}, got {}", chain.depth),
        ));
    }
    Ok(())
}

fn check_kind(kind: &str, known: &[&str], field: &str) -> Result<(), SteleError> {
    if known.contains(&kind) {
        Ok(())
    } else {
        Err(SteleError::invalid(field, format!("unknown type \"{kind}\"")))
    }
}

/// Build and sign a new covenant.
///
/// All inputs are validated before any cryptographic work; the error names
/// the offending field in wire-format notation.
///
/// # Errors
/// `SteleError::InvalidInput` for rejected fields, or the CCL error raised
/// while parsing `constraints`.
#[instrument(skip_all, fields(issuer = %opts.issuer.id, beneficiary = %opts.beneficiary.id))]
pub fn build_covenant(opts: CovenantBuilderOptions) -> Result<CovenantDocument, SteleError> {
    check_party(&opts.issuer, "issuer", "issuer")?;
    check_party(&opts.beneficiary, "beneficiary", "beneficiary")?;

    let signer_hex = crypto::to_hex(opts.signing_key.verifying_key().as_bytes());
    if signer_hex != opts.issuer.public_key {
        return Err(SteleError::invalid(
            "issuer.publicKey",
            "does not match the signing key",
        ));
    }

    if opts.constraints.trim().is_empty() {
        return Err(SteleError::invalid("constraints", "must not be empty"));
    }
    let policy = ccl::parse(&opts.constraints)?;
    if policy.len() > MAX_CONSTRAINTS {
        return Err(SteleError::invalid(
            "constraints",
            format!("{} statements exceed the maximum of {MAX_CONSTRAINTS}", policy.len()),
        ));
    }

    if let Some(chain) = &opts.chain {
        check_chain(chain)?;
    }
    if let Some(nonce) = &opts.nonce {
        if nonce.len() != NONCE_LENGTH {
            return Err(SteleError::invalid(
                "nonce",
                format!("must be {NONCE_LENGTH} bytes, got {}", nonce.len()),
            ));
        }
    }
    check_timestamp(opts.expires_at.as_deref(), "expiresAt")?;
    check_timestamp(opts.activates_at.as_deref(), "activatesAt")?;
    if let Some(enforcement) = &opts.enforcement {
        check_kind(&enforcement.kind, ENFORCEMENT_TYPES, "enforcement.type")?;
    }
    if let Some(proof) = &opts.proof {
        check_kind(&proof.kind, PROOF_TYPES, "proof.type")?;
    }

    let nonce = match opts.nonce {
        Some(bytes) => crypto::to_hex(&bytes),
        None => crypto::to_hex(&crypto::generate_nonce()),
    };

    let mut doc = CovenantDocument {
        id: String::new(),
        version: PROTOCOL_VERSION.to_string(),
        issuer: opts.issuer,
        beneficiary: opts.beneficiary,
        constraints: opts.constraints,
        nonce,
        created_at: crypto::timestamp(),
        signature: String::new(),
        chain: opts.chain,
        expires_at: opts.expires_at,
        activates_at: opts.activates_at,
        enforcement: opts.enforcement,
        proof: opts.proof,
        metadata: opts.metadata,
        countersignatures: None,
    };

    let canonical = canonical_form(&doc)?;
    doc.id = crypto::sha256_string(&canonical);
    doc.signature = crypto::to_hex(&crypto::sign(canonical.as_bytes(), &opts.signing_key));

    let size = serialized_size(&doc)?;
    if size > MAX_DOCUMENT_SIZE {
        return Err(SteleError::invalid(
            "document",
            format!("{size} bytes exceed the maximum of {MAX_DOCUMENT_SIZE}"),
        ));
    }

    info!(id = %doc.id, statements = policy.len(), "covenant built");
    Ok(doc)
}

fn serialized_size(doc: &CovenantDocument) -> Result<usize, SteleError> {
    serde_json::to_string(doc)
        .map(|s| s.len())
        .map_err(|e| SteleError::Serialization(e.to_string()))
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

fn check(name: &'static str, passed: bool, message: impl Into<String>) -> VerificationCheck {
    let message = message.into();
    debug!(check = name, passed, %message);
    VerificationCheck {
        name,
        passed,
        message,
    }
}

fn time_check(
    name: &'static str,
    value: Option<&str>,
    now: DateTime<Utc>,
    holds: fn(DateTime<Utc>, DateTime<Utc>) -> bool,
) -> VerificationCheck {
    match value {
        None => check(name, true, "not set"),
        Some(raw) => match crypto::parse_timestamp(raw) {
            None => check(name, false, format!("unparseable timestamp \"{raw}\"")),
            Some(at) if holds(now, at) => check(name, true, format!("satisfied at {raw}")),
            Some(_) => check(name, false, format!("not satisfied at {raw}")),
        },
    }
}

fn kind_check(name: &'static str, kind: Option<&str>, known: &[&str]) -> VerificationCheck {
    match kind {
        None => check(name, true, "not present"),
        Some(k) if known.contains(&k) => check(name, true, format!("type \"{k}\" recognized")),
        Some(k) => check(name, false, format!("unknown type \"{k}\"")),
    }
}

/// Verify a covenant against the system clock and default limits.
pub fn verify_covenant(doc: &CovenantDocument) -> VerificationResult {
    verify_covenant_with(doc, &VerifyOptions::default())
}

/// Run every verification check and report each one.
///
/// Checks, always in this order: `document_size`, `ccl_parses`, `id_match`,
/// `signature_valid`, `nonce_present`, `not_expired`, `active`,
/// `chain_depth`, `countersignatures`, `enforcement_valid`, `proof_valid`.
/// No check short-circuits another; `valid` is their conjunction.
#[instrument(skip_all, fields(id = %doc.id))]
pub fn verify_covenant_with(doc: &CovenantDocument, options: &VerifyOptions) -> VerificationResult {
    let now = options.now.unwrap_or_else(Utc::now);
    let mut checks = Vec::with_capacity(11);

    checks.push(match serialized_size(doc) {
        Ok(size) if size <= options.max_document_size => {
            check("document_size", true, format!("{size} bytes"))
        }
        Ok(size) => check(
            "document_size",
            false,
            format!("{size} bytes exceed the maximum of {}", options.max_document_size),
        ),
        Err(e) => check("document_size", false, e.to_string()),
    });

    checks.push(match ccl::parse(&doc.constraints) {
        Ok(policy) if policy.len() <= options.max_constraints => {
            check("ccl_parses", true, format!("{} statement(s)", policy.len()))
        }
        Ok(policy) => check(
            "ccl_parses",
            false,
            format!("{} statements exceed the maximum of {}", policy.len(), options.max_constraints),
        ),
        Err(e) => check("ccl_parses", false, e.to_string()),
    });

    let canonical = canonical_form(doc);
    checks.push(match &canonical {
        Ok(c) => {
            let expected = crypto::sha256_string(c);
            if expected == doc.id {
                check("id_match", true, "id matches canonical hash")
            } else {
                check("id_match", false, format!("expected {expected}"))
            }
        }
        Err(e) => check("id_match", false, e.to_string()),
    });

    checks.push(match &canonical {
        Ok(c) if crypto::verify_hex(c.as_bytes(), &doc.signature, &doc.issuer.public_key) => {
            check("signature_valid", true, "issuer signature verifies")
        }
        Ok(_) => check("signature_valid", false, "issuer signature does not verify"),
        Err(e) => check("signature_valid", false, e.to_string()),
    });

    checks.push(if crypto::is_hex_of_len(&doc.nonce, NONCE_LENGTH) {
        check("nonce_present", true, "32-byte nonce present")
    } else {
        check("nonce_present", false, format!("expected {} hex characters", NONCE_LENGTH * 2))
    });

    checks.push(time_check("not_expired", doc.expires_at.as_deref(), now, |now, at| now <= at));
    checks.push(time_check("active", doc.activates_at.as_deref(), now, |now, at| now >= at));

    checks.push(match &doc.chain {
        None => check("chain_depth", true, "root document"),
        Some(chain) if (1..=MAX_CHAIN_DEPTH).contains(&chain.depth) => {
            check("chain_depth", true, format!("depth {}", chain.depth))
        }
        Some(chain) => check(
            "chain_depth",
            false,
            format!("depth {} outside 1..={MAX_CHAIN_DEPTH}", chain.depth),
        ),
    });

    let signatures = doc.countersignatures();
    checks.push(match &canonical {
        Ok(c) => {
            let bad: Vec<&str> = signatures
                .iter()
                .filter(|cs| !crypto::verify_hex(c.as_bytes(), &cs.signature, &cs.signer_public_key))
                .map(|cs| cs.signer_role.as_str())
                .collect();
            if bad.is_empty() {
                check("countersignatures", true, format!("{} verified", signatures.len()))
            } else {
                check("countersignatures", false, format!("invalid from: {}", bad.join(", ")))
            }
        }
        Err(_) if signatures.is_empty() => check("countersignatures", true, "none present"),
        Err(e) => check("countersignatures", false, e.to_string()),
    });

    checks.push(kind_check(
        "enforcement_valid",
        doc.enforcement.as_ref().map(|e| e.kind.as_str()),
        ENFORCEMENT_TYPES,
    ));
    checks.push(kind_check("proof_valid", doc.proof.as_ref().map(|p| p.kind.as_str()), PROOF_TYPES));

    let valid = checks.iter().all(|c| c.passed);
    if valid {
        info!("covenant verified");
    } else {
        let failed: Vec<&str> = checks.iter().filter(|c| !c.passed).map(|c| c.name).collect();
        warn!(?failed, "covenant failed verification");
    }
    VerificationResult { valid, checks }
}

// ---------------------------------------------------------------------------
// Countersign
// ---------------------------------------------------------------------------

/// Append a countersignature over the canonical form. The input document is
/// left untouched; `id` and `signature` carry over unchanged.
pub fn countersign_covenant(
    doc: &CovenantDocument,
    key_pair: &KeyPair,
    role: &str,
) -> Result<CovenantDocument, SteleError> {
    if role.trim().is_empty() {
        return Err(SteleError::invalid("signerRole", "must not be empty"));
    }
    let canonical = canonical_form(doc)?;
    let signature = crypto::sign(canonical.as_bytes(), &key_pair.signing_key);

    let mut signed = doc.clone();
    signed
        .countersignatures
        .get_or_insert_with(Vec::new)
        .push(Countersignature {
            signer_public_key: key_pair.public_key_hex.clone(),
            signer_role: role.to_string(),
            signature: crypto::to_hex(&signature),
            timestamp: crypto::timestamp(),
        });
    debug!(id = %doc.id, role, "countersignature appended");
    Ok(signed)
}

/// Check one countersignature against the document's canonical form,
/// using only the key the countersignature claims.
pub fn verify_countersignature(doc: &CovenantDocument, countersignature: &Countersignature) -> bool {
    canonical_form(doc).is_ok_and(|canonical| {
        crypto::verify_hex(
            canonical.as_bytes(),
            &countersignature.signature,
            &countersignature.signer_public_key,
        )
    })
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Serialize a document to pretty-printed JSON.
pub fn serialize_covenant(doc: &CovenantDocument) -> Result<String, SteleError> {
    serde_json::to_string_pretty(doc).map_err(|e| SteleError::Serialization(e.to_string()))
}

/// Parse a document from JSON. Unknown fields and inputs over
/// `MAX_DOCUMENT_SIZE` are rejected.
pub fn deserialize_covenant(json: &str) -> Result<CovenantDocument, SteleError> {
    if json.len() > MAX_DOCUMENT_SIZE {
        return Err(SteleError::Serialization(format!(
            "input of {} bytes exceeds the maximum of {MAX_DOCUMENT_SIZE}",
            json.len()
        )));
    }
    serde_json::from_str(json).map_err(|e| SteleError::Serialization(e.to_string()))
}
