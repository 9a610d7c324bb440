//! Delegation chains: validation, effective constraints and resolution.
//!
//! A chain is a root-first sequence of covenants in which each child points
//! at its parent through `chain.parentId` and may only narrow the parent's
//! policy.

use crate::ccl::{self, CclDocument, NarrowingResult, NarrowingViolation};
use crate::covenant::{
    verify_covenant_with, CovenantDocument, VerificationCheck, VerificationResult, VerifyOptions,
    MAX_CHAIN_DEPTH,
};
use crate::store::DocumentStore;
use crate::SteleError;
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

/// Narrowing outcome for one parent/child link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkNarrowing {
    /// Position of the child in the validated sequence.
    pub child_index: usize,
    pub child_id: String,
    pub parent_id: String,
    pub valid: bool,
    pub violations: Vec<NarrowingViolation>,
}

/// Report produced by `validate_chain`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainValidationResult {
    pub valid: bool,
    /// `documents_valid`, `chain_length`, `parent_links`, `depth_sequence`, `narrowing`.
    pub checks: Vec<VerificationCheck>,
    /// Per-document verification, in sequence order.
    pub documents: Vec<VerificationResult>,
    pub narrowing: Vec<LinkNarrowing>,
    pub errors: Vec<String>,
}

impl ChainValidationResult {
    pub fn check(&self, name: &str) -> Option<&VerificationCheck> {
        self.checks.iter().find(|c| c.name == name)
    }
}

fn chain_check(name: &'static str, errors: &[String]) -> VerificationCheck {
    let passed = errors.is_empty();
    debug!(check = name, passed);
    VerificationCheck {
        name,
        passed,
        message: if passed { "ok".to_string() } else { errors.join("; ") },
    }
}

/// Check that `child` only narrows `parent`.
///
/// # Errors
/// The CCL error of whichever document's constraints fail to parse.
pub fn validate_chain_narrowing(
    child: &CovenantDocument,
    parent: &CovenantDocument,
) -> Result<NarrowingResult, SteleError> {
    let parent_policy = ccl::parse(&parent.constraints)?;
    let child_policy = ccl::parse(&child.constraints)?;
    Ok(ccl::validate_narrowing(&parent_policy, &child_policy))
}

/// Validate a root-first chain with default verification options.
pub fn validate_chain(docs: &[CovenantDocument]) -> ChainValidationResult {
    validate_chain_with(docs, &VerifyOptions::default())
}

/// Validate a root-first chain.
///
/// Every check is computed and every link's narrowing result is reported,
/// even after an earlier failure. An empty sequence yields an invalid report
/// with a single error.
#[instrument(skip_all, fields(length = docs.len()))]
pub fn validate_chain_with(docs: &[CovenantDocument], options: &VerifyOptions) -> ChainValidationResult {
    if docs.is_empty() {
        warn!("chain validation called with no documents");
        return ChainValidationResult {
            valid: false,
            checks: Vec::new(),
            documents: Vec::new(),
            narrowing: Vec::new(),
            errors: vec!["chain is empty".to_string()],
        };
    }

    let documents: Vec<VerificationResult> = docs.iter().map(|d| verify_covenant_with(d, options)).collect();
    let doc_errors: Vec<String> = documents
        .iter()
        .zip(docs)
        .enumerate()
        .filter(|(_, (result, _))| !result.valid)
        .map(|(i, (result, doc))| {
            let failed: Vec<&str> = result.failed().map(|c| c.name).collect();
            format!("document {i} ({}) failed: {}", doc.id, failed.join(", "))
        })
        .collect();

    let mut length_errors = Vec::new();
    if docs.len() > MAX_CHAIN_DEPTH {
        length_errors.push(format!(
            "chain of {} documents exceeds the maximum of {MAX_CHAIN_DEPTH}",
            docs.len()
        ));
    }

    let mut link_errors = Vec::new();
    let mut depth_errors = Vec::new();
    if docs[0].chain.is_some() {
        depth_errors.push(format!("document 0 ({}) is not a root", docs[0].id));
    }
    for (i, pair) in docs.windows(2).enumerate() {
        let (parent, child) = (&pair[0], &pair[1]);
        let index = i + 1;
        match &child.chain {
            None => {
                link_errors.push(format!("document {index} ({}) has no chain reference", child.id));
                depth_errors.push(format!("document {index} ({}) has no depth", child.id));
            }
            Some(link) => {
                if link.parent_id != parent.id {
                    link_errors.push(format!(
                        "document {index} points at {} instead of {}",
                        link.parent_id, parent.id
                    ));
                }
                if link.depth != index {
                    depth_errors.push(format!(
                        "document {index} has depth {}, expected {index}",
                        link.depth
                    ));
                }
            }
        }
    }

    let mut narrowing = Vec::with_capacity(docs.len().saturating_sub(1));
    let mut narrowing_errors = Vec::new();
    for (i, pair) in docs.windows(2).enumerate() {
        let (parent, child) = (&pair[0], &pair[1]);
        let (valid, violations) = match validate_chain_narrowing(child, parent) {
            Ok(result) => (result.valid, result.violations),
            Err(e) => {
                narrowing_errors.push(format!("link {} could not be compared: {e}", i + 1));
                (false, Vec::new())
            }
        };
        for violation in &violations {
            narrowing_errors.push(format!("link {}: {violation}", i + 1));
        }
        debug!(child = %child.id, parent = %parent.id, valid, "link narrowing");
        narrowing.push(LinkNarrowing {
            child_index: i + 1,
            child_id: child.id.clone(),
            parent_id: parent.id.clone(),
            valid,
            violations,
        });
    }

    let checks = vec![
        chain_check("documents_valid", &doc_errors),
        chain_check("chain_length", &length_errors),
        chain_check("parent_links", &link_errors),
        chain_check("depth_sequence", &depth_errors),
        chain_check("narrowing", &narrowing_errors),
    ];
    let valid = checks.iter().all(|c| c.passed);
    let errors: Vec<String> = [doc_errors, length_errors, link_errors, depth_errors, narrowing_errors].concat();

    if valid {
        info!("chain validated");
    } else {
        warn!(errors = errors.len(), "chain failed validation");
    }

    ChainValidationResult {
        valid,
        checks,
        documents,
        narrowing,
        errors,
    }
}

/// The policy in force for `doc`: `merge` folded from the root down.
///
/// `ancestors` are nearest-parent-first, as `resolve_chain` returns them.
///
/// # Errors
/// The CCL error of the first document whose constraints fail to parse.
pub fn compute_effective_constraints(
    doc: &CovenantDocument,
    ancestors: &[CovenantDocument],
) -> Result<CclDocument, SteleError> {
    let mut lineage = ancestors.iter().rev().chain(std::iter::once(doc));
    let mut effective = match lineage.next() {
        Some(root) => ccl::parse(&root.constraints)?,
        None => CclDocument::default(),
    };
    for next in lineage {
        effective = ccl::merge(&effective, &ccl::parse(&next.constraints)?);
    }
    Ok(effective)
}

/// Walk `chain.parentId` links upward through `store`.
///
/// Returns the ancestors nearest-parent-first, and nothing for a root. The
/// walk ends at a root, at a parent the store does not have, after
/// `MAX_CHAIN_DEPTH` steps, or on an id already visited.
///
/// # Errors
/// Whatever the store returns.
#[instrument(skip_all, fields(id = %doc.id))]
pub fn resolve_chain<S: DocumentStore + ?Sized>(
    doc: &CovenantDocument,
    store: &S,
) -> Result<Vec<CovenantDocument>, SteleError> {
    let mut ancestors: Vec<CovenantDocument> = Vec::new();
    let mut seen: HashSet<String> = HashSet::from([doc.id.clone()]);
    let mut next = doc.chain.as_ref().map(|c| c.parent_id.clone());

    while let Some(parent_id) = next {
        if ancestors.len() >= MAX_CHAIN_DEPTH {
            warn!(steps = ancestors.len(), "chain resolution stopped at depth limit");
            break;
        }
        if !seen.insert(parent_id.clone()) {
            warn!(%parent_id, "chain resolution found a cycle");
            break;
        }
        let Some(parent) = store.get(&parent_id)? else {
            debug!(%parent_id, "ancestor not in store");
            break;
        };
        next = parent.chain.as_ref().map(|c| c.parent_id.clone());
        ancestors.push(parent);
    }

    debug!(ancestors = ancestors.len(), "chain resolved");
    Ok(ancestors)
}
