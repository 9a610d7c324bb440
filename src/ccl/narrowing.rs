//! Policy intersection and parent/child narrowing checks.

use super::{CclDocument, Condition, LimitRule, Pattern, Rule, Segment, Severity, Statement};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::warn;

/// Most permits a merged policy keeps. Dropping further intersections only
/// removes grants.
pub const MAX_MERGED_PERMITS: usize = 1024;

/// One way a child policy broadens its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct NarrowingViolation {
    pub message: String,
    pub child: Statement,
    pub parent: Option<Statement>,
}

impl fmt::Display for NarrowingViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NarrowingResult {
    pub valid: bool,
    pub violations: Vec<NarrowingViolation>,
}

// True when `child` holding guarantees `parent` holds. Recognized forms:
// no parent condition, equal conditions, or every parent conjunct appearing
// among the child's conjuncts.
fn implies(child: Option<&Condition>, parent: Option<&Condition>) -> bool {
    match (child, parent) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(c), Some(p)) => {
            if c == p {
                return true;
            }
            let have = c.conjuncts();
            p.conjuncts().iter().all(|term| have.contains(term))
        }
    }
}

fn conjoin(a: Option<&Condition>, b: Option<&Condition>) -> Option<Condition> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.clone().and(b.clone())),
        (Some(c), None) | (None, Some(c)) => Some(c.clone()),
        (None, None) => None,
    }
}

fn covers(outer: &Rule, inner: &Rule) -> bool {
    inner.action.is_subset_of(&outer.action)
        && inner.resource.is_subset_of(&outer.resource)
        && implies(inner.condition.as_ref(), outer.condition.as_ref())
}

fn overlaps(a: &Rule, b: &Rule) -> bool {
    a.action.overlaps(&b.action) && a.resource.overlaps(&b.resource)
}

// Rate comparison by cross-multiplication: count_a/period_a > count_b/period_b.
fn looser(a: &LimitRule, b: &LimitRule) -> bool {
    u128::from(a.count) * u128::from(b.period_seconds) > u128::from(b.count) * u128::from(a.period_seconds)
}

type RuleKey = (Pattern, Pattern, Option<Severity>, Option<String>);

fn rule_key(rule: &Rule) -> RuleKey {
    (
        rule.action.clone(),
        rule.resource.clone(),
        rule.severity,
        rule.condition.as_ref().map(ToString::to_string),
    )
}

// First segment when it is a literal. A rule can only be covered by rules
// whose leads are equal to its own or absent.
fn lead(pattern: &Pattern) -> Option<&str> {
    match pattern.segments().first() {
        Some(Segment::Literal(s)) => Some(s.as_str()),
        _ => None,
    }
}

// Indices of `rules` grouped by (action lead, resource lead).
struct LeadIndex<'a> {
    buckets: HashMap<(Option<&'a str>, Option<&'a str>), Vec<usize>>,
}

impl<'a> LeadIndex<'a> {
    fn new(rules: &'a [Rule]) -> Self {
        let mut buckets: HashMap<_, Vec<usize>> = HashMap::new();
        for (i, rule) in rules.iter().enumerate() {
            buckets
                .entry((lead(&rule.action), lead(&rule.resource)))
                .or_default()
                .push(i);
        }
        LeadIndex { buckets }
    }

    fn possible_covers<'r>(&'r self, rule: &'r Rule) -> impl Iterator<Item = usize> + 'r {
        let (a, r) = (lead(&rule.action), lead(&rule.resource));
        let mut keys = vec![(None, None)];
        if a.is_some() {
            keys.push((a, None));
        }
        if r.is_some() {
            keys.push((None, r));
        }
        if a.is_some() && r.is_some() {
            keys.push((a, r));
        }
        let buckets: &'r HashMap<(Option<&'r str>, Option<&'r str>), Vec<usize>> = &self.buckets;
        keys.into_iter()
            .filter_map(move |key| buckets.get(&key))
            .flatten()
            .copied()
    }
}

fn permit_intersections(a: &Rule, b: &Rule) -> Vec<Rule> {
    let actions = a.action.intersect(&b.action);
    let resources = a.resource.intersect(&b.resource);
    let condition = conjoin(a.condition.as_ref(), b.condition.as_ref());
    let severity = a.severity.max(b.severity);
    let mut out = Vec::new();
    for action in &actions {
        for resource in &resources {
            out.push(Rule {
                action: action.clone(),
                resource: resource.clone(),
                condition: condition.clone(),
                severity,
                line: a.line,
            });
        }
    }
    out
}

/// Intersect two policies.
///
/// The result grants an action/resource pair only if both inputs grant it.
/// Permits are pairwise pattern intersections carrying the conjunction of
/// both conditions and the stricter severity. Denies and requires are the
/// deduplicated union. Limits are combined per subject, keeping the lower
/// count (the longer period on equal counts).
pub fn merge(a: &CclDocument, b: &CclDocument) -> CclDocument {
    let inputs: HashSet<RuleKey> = a.permits().chain(b.permits()).map(rule_key).collect();

    let mut seen = HashSet::new();
    let mut candidates: Vec<Rule> = Vec::new();
    for pa in a.permits() {
        for pb in b.permits() {
            for rule in permit_intersections(pa, pb) {
                if seen.insert(rule_key(&rule)) {
                    candidates.push(rule);
                }
            }
        }
    }

    // Drop results already covered by another result, except rules copied
    // straight from an input so that merging a policy with itself preserves
    // its statements. Of two results covering each other the first is kept.
    let index = LeadIndex::new(&candidates);
    let mut permits: Vec<Rule> = candidates
        .iter()
        .enumerate()
        .filter(|&(i, rule)| {
            let key = rule_key(rule);
            inputs.contains(&key)
                || !index.possible_covers(rule).any(|j| {
                    let other = &candidates[j];
                    i != j
                        && other.severity == rule.severity
                        && covers(other, rule)
                        && (!covers(rule, other) || j < i)
                })
        })
        .map(|(_, rule)| rule.clone())
        .collect();
    if permits.len() > MAX_MERGED_PERMITS {
        permits.sort_by_key(|rule| !inputs.contains(&rule_key(rule)));
        warn!(
            permits = permits.len(),
            kept = MAX_MERGED_PERMITS,
            "merged policy truncated"
        );
        permits.truncate(MAX_MERGED_PERMITS);
    }

    let mut seen = HashSet::new();
    let denies: Vec<Rule> = a.denies().chain(b.denies()).filter(|r| seen.insert(rule_key(r))).cloned().collect();
    let mut seen = HashSet::new();
    let requires: Vec<Rule> = a
        .obligations()
        .chain(b.obligations())
        .filter(|r| seen.insert(rule_key(r)))
        .cloned()
        .collect();

    let mut limits: Vec<LimitRule> = Vec::new();
    for limit in a.limits().chain(b.limits()) {
        match limits.iter_mut().find(|l| l.subject == limit.subject) {
            Some(existing) => {
                let tighter = limit.count < existing.count
                    || (limit.count == existing.count && limit.period_seconds > existing.period_seconds);
                if tighter {
                    *existing = limit.clone();
                }
            }
            None => limits.push(limit.clone()),
        }
    }

    let mut statements = Vec::with_capacity(permits.len() + denies.len() + requires.len() + limits.len());
    statements.extend(permits.into_iter().map(Statement::Permit));
    statements.extend(denies.into_iter().map(Statement::Deny));
    statements.extend(requires.into_iter().map(Statement::Require));
    statements.extend(limits.into_iter().map(Statement::Limit));
    CclDocument::new(statements)
}

/// Check that `child` grants nothing `parent` does not.
///
/// Every child permit must sit inside some parent permit whose condition it
/// implies, and must not reach into a parent deny unless the child denies
/// that area itself. A child limit allowing a higher rate than the parent's
/// limit on the same subject is also a violation. Denies and requires added
/// by the child only tighten and are always accepted.
pub fn validate_narrowing(parent: &CclDocument, child: &CclDocument) -> NarrowingResult {
    let mut violations = Vec::new();

    for permit in child.permits() {
        let child_stmt = || Statement::Permit(permit.clone());
        if !parent.permits().any(|p| covers(p, permit)) {
            let nearest = parent.permits().find(|p| overlaps(p, permit));
            violations.push(NarrowingViolation {
                message: format!(
                    "child permit '{} on {}' is not within any parent permit",
                    permit.action, permit.resource
                ),
                child: child_stmt(),
                parent: nearest.map(|p| Statement::Permit(p.clone())),
            });
        }

        for deny in parent.denies().filter(|d| overlaps(d, permit)) {
            if child.denies().any(|d| covers(d, deny)) {
                continue;
            }
            violations.push(NarrowingViolation {
                message: format!(
                    "child permit '{} on {}' overlaps parent deny '{} on {}'",
                    permit.action, permit.resource, deny.action, deny.resource
                ),
                child: child_stmt(),
                parent: Some(Statement::Deny(deny.clone())),
            });
        }
    }

    for limit in child.limits() {
        for parent_limit in parent.limits().filter(|l| l.subject == limit.subject) {
            if looser(limit, parent_limit) {
                violations.push(NarrowingViolation {
                    message: format!(
                        "child limit on '{}' ({} per {}s) is looser than parent limit ({} per {}s)",
                        limit.subject,
                        limit.count,
                        limit.period_seconds,
                        parent_limit.count,
                        parent_limit.period_seconds
                    ),
                    child: Statement::Limit(limit.clone()),
                    parent: Some(Statement::Limit(parent_limit.clone())),
                });
            }
        }
    }

    NarrowingResult {
        valid: violations.is_empty(),
        violations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccl::{evaluate, parse, serialize, Context};
    use serde_json::json;

    fn p(src: &str) -> CclDocument {
        parse(src).unwrap()
    }

    #[test]
    fn test_subset_child_is_valid() {
        let parent = p("permit read on '/data/**'");
        let result = validate_narrowing(&parent, &p("permit read on '/data/users/*'"));
        assert!(result.valid, "{:?}", result.violations);
        assert!(validate_narrowing(&parent, &p("permit read on '/data/**'")).valid);
    }

    #[test]
    fn test_new_action_is_a_violation() {
        let parent = p("permit read on '/data/**'");
        let result = validate_narrowing(&parent, &p("permit write on '/data/**'"));
        assert!(!result.valid);
        assert!(result.violations[0].message.contains("write"));
        assert!(result.violations[0].parent.is_none());
    }

    #[test]
    fn test_wider_resource_names_nearest_parent() {
        let parent = p("permit read on '/data/public/**'");
        let result = validate_narrowing(&parent, &p("permit read on '/data/**'"));
        assert!(!result.valid);
        assert!(matches!(result.violations[0].parent, Some(Statement::Permit(_))));
    }

    #[test]
    fn test_parent_deny_needs_child_deny() {
        let parent = p("permit read on '/data/**'\ndeny read on '/data/secret/**'");
        let leaky = validate_narrowing(&parent, &p("permit read on '/data/**'"));
        assert!(!leaky.valid);
        assert!(matches!(leaky.violations[0].parent, Some(Statement::Deny(_))));

        let sealed = validate_narrowing(
            &parent,
            &p("permit read on '/data/**'\ndeny read on '/data/secret/**'"),
        );
        assert!(sealed.valid, "{:?}", sealed.violations);

        let disjoint = validate_narrowing(&parent, &p("permit read on '/data/public/*'"));
        assert!(disjoint.valid);
    }

    #[test]
    fn test_child_conditions_must_imply_parent() {
        let parent = p("permit read on '/x' when role = 'admin'");
        assert!(!validate_narrowing(&parent, &p("permit read on '/x'")).valid);
        assert!(validate_narrowing(&parent, &p("permit read on '/x' when role = 'admin'")).valid);
        assert!(
            validate_narrowing(&parent, &p("permit read on '/x' when role = 'admin' and mfa = true")).valid
        );
        assert!(!validate_narrowing(&parent, &p("permit read on '/x' when role = 'admin' or mfa = true")).valid);
    }

    #[test]
    fn test_new_denies_and_requires_never_violate() {
        let parent = p("permit read on '/data/**'");
        let child = p("permit read on '/data/a'\ndeny write on '**'\nrequire audit on '**'");
        assert!(validate_narrowing(&parent, &child).valid);
    }

    #[test]
    fn test_looser_limit_is_a_violation() {
        let parent = p("limit api.call 100 per 1 hours");
        assert!(validate_narrowing(&parent, &p("limit api.call 50 per 1 hours")).valid);
        assert!(validate_narrowing(&parent, &p("limit api.call 200 per 2 hours")).valid);
        let loose = validate_narrowing(&parent, &p("limit api.call 100 per 30 minutes"));
        assert!(!loose.valid);
        assert!(matches!(loose.violations[0].child, Statement::Limit(_)));
    }

    #[test]
    fn test_merge_intersects_permits() {
        let a = p("permit read on '/data/**'");
        let b = p("permit read on '/data/users/*' when role = 'admin' severity high");
        let merged = merge(&a, &b);
        assert_eq!(
            serialize(&merged),
            "permit read on '/data/users/*' when role = 'admin' severity high"
        );
        assert!(merge(&a, &p("permit write on '/data/**'")).permits().next().is_none());
    }

    #[test]
    fn test_merge_conjoins_conditions() {
        let merged = merge(
            &p("permit read on '/x' when a = 1"),
            &p("permit read on '/x' when b = 2"),
        );
        assert_eq!(serialize(&merged), "permit read on '/x' when a = 1 and b = 2");
    }

    #[test]
    fn test_merge_unions_denies_and_tightens_limits() {
        let a = p("deny write on '**'\nlimit api.call 100 per 1 hours\nrequire log on '**'");
        let b = p("deny write on '**'\ndeny delete on '/x'\nlimit api.call 10 per 1 hours\nlimit send 5 per 1 days");
        let merged = merge(&a, &b);
        assert_eq!(merged.denies().count(), 2);
        assert_eq!(merged.obligations().count(), 1);
        let limits: Vec<_> = merged.limits().map(|l| (l.subject.to_string(), l.count)).collect();
        assert_eq!(limits, vec![("api.call".to_string(), 10), ("send".to_string(), 5)]);

        let equal = merge(&p("limit x 5 per 1 hours"), &p("limit x 5 per 1 days"));
        assert_eq!(equal.limits().next().unwrap().period_seconds, 86_400);
    }

    #[test]
    fn test_merge_with_self_is_identity() {
        let a = p("permit read on '/data/**'\npermit read on '/data/x'\ndeny read on '/data/secret'\nlimit read 5 per 1 minutes");
        let merged = merge(&a, &a);
        assert_eq!(merged, a);
        let ctx = Context::new();
        for resource in ["/data/x", "/data/y", "/data/secret", "/other"] {
            let (before, after) = (evaluate(&a, "read", resource, &ctx), evaluate(&merged, "read", resource, &ctx));
            assert_eq!(before.permitted, after.permitted, "{resource}");
            assert_eq!(before.matched_rule, after.matched_rule, "{resource}");
        }
    }

    #[test]
    fn test_large_merge_is_capped() {
        let lines = |f: &dyn Fn(usize) -> String| (0..64).map(f).collect::<Vec<_>>().join("\n");
        let a = p(&lines(&|i| format!("permit read on '/a{i}/**'")));
        let b = p(&lines(&|j| format!("permit read on '/*/b{j}'")));
        let merged = merge(&a, &b);
        assert_eq!(merged.permits().count(), MAX_MERGED_PERMITS);
        let ctx = Context::new();
        assert!(evaluate(&merged, "read", "/a0/b0", &ctx).permitted);
        assert!(!evaluate(&merged, "read", "/a0/c", &ctx).permitted);
        assert!(!evaluate(&merged, "read", "/a63/b63", &ctx).permitted);
    }

    #[test]
    fn test_merge_never_exceeds_either_input() {
        let a = p("permit file.* on '/a/**' when role = 'admin'\npermit read on '**'");
        let b = p("permit file.read on '/a/b/*'\npermit **  on '/a/**'\ndeny read on '/a/b/secret'");
        let merged = merge(&a, &b);
        let contexts = [json!({}), json!({"role": "admin"}), json!({"role": "guest"})];
        for value in contexts {
            let ctx = value.as_object().cloned().unwrap_or_default();
            for action in ["file.read", "file.write", "read", "write"] {
                for resource in ["/a", "/a/b/c", "/a/b/secret", "/z"] {
                    if evaluate(&merged, action, resource, &ctx).permitted {
                        assert!(evaluate(&a, action, resource, &ctx).permitted, "{action} {resource}");
                        assert!(evaluate(&b, action, resource, &ctx).permitted, "{action} {resource}");
                    }
                }
            }
        }
    }
}
