//! Access decisions, condition evaluation and rate-limit checks.

use super::{CclDocument, Condition, Context, LimitRule, Literal, Operator, Rule, Severity, Statement};
use serde_json::Value;
use std::cmp::Ordering;

/// Result of evaluating a policy against an action/resource pair.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub permitted: bool,
    /// The rule that decided the outcome, if any permit or deny matched.
    pub matched_rule: Option<Statement>,
    /// Every matching permit, deny and require statement.
    pub all_matches: Vec<Statement>,
    pub reason: String,
    pub severity: Option<Severity>,
}

impl EvaluationResult {
    /// The `require` statements that apply to this request.
    pub fn obligations(&self) -> impl Iterator<Item = &Rule> {
        self.all_matches.iter().filter_map(|s| match s {
            Statement::Require(r) => Some(r),
            _ => None,
        })
    }
}

/// Result of checking a rate limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub exceeded: bool,
    /// Occurrences still allowed in the current window; `u64::MAX` when unlimited.
    pub remaining: u64,
    /// The applicable limit's count, if a limit matched.
    pub limit: Option<u64>,
    pub period_seconds: Option<u64>,
}

fn rule_applies(rule: &Rule, action: &str, resource: &str, context: &Context) -> bool {
    rule.matches(action, resource)
        && rule
            .condition
            .as_ref()
            .map_or(true, |c| evaluate_condition(c, context) == Some(true))
}

// Most specific first. Serialized text breaks ties between rules that share
// patterns but differ in condition or severity.
fn rank(a: &Rule, b: &Rule, render: impl Fn(&Rule) -> String) -> Ordering {
    a.specificity()
        .cmp(&b.specificity())
        .then_with(|| render(b).cmp(&render(a)))
}

fn most_specific<'a>(rules: &[&'a Rule], wrap: fn(Rule) -> Statement) -> Option<&'a Rule> {
    rules
        .iter()
        .copied()
        .max_by(|a, b| rank(a, b, |r| wrap(r.clone()).to_string()))
}

/// Evaluate a policy against an action/resource pair.
///
/// 1. Collect permits and denies whose patterns match and whose condition holds.
/// 2. No match: default deny.
/// 3. Any matching deny: denied, reporting the most specific deny.
/// 4. Otherwise permitted, reporting the most specific permit.
///
/// Matching `require` statements are reported in `all_matches` only.
pub fn evaluate(doc: &CclDocument, action: &str, resource: &str, context: &Context) -> EvaluationResult {
    let permits: Vec<&Rule> = doc
        .permits()
        .filter(|r| rule_applies(r, action, resource, context))
        .collect();
    let denies: Vec<&Rule> = doc
        .denies()
        .filter(|r| rule_applies(r, action, resource, context))
        .collect();

    let mut all_matches: Vec<Statement> = Vec::new();
    all_matches.extend(permits.iter().map(|r| Statement::Permit((*r).clone())));
    all_matches.extend(denies.iter().map(|r| Statement::Deny((*r).clone())));
    all_matches.extend(
        doc.obligations()
            .filter(|r| rule_applies(r, action, resource, context))
            .map(|r| Statement::Require(r.clone())),
    );

    if let Some(deny) = most_specific(&denies, Statement::Deny) {
        let reason = format!(
            "denied by rule 'deny {} on {}' (line {})",
            deny.action, deny.resource, deny.line
        );
        return EvaluationResult {
            permitted: false,
            matched_rule: Some(Statement::Deny(deny.clone())),
            all_matches,
            reason,
            severity: deny.severity,
        };
    }

    if let Some(permit) = most_specific(&permits, Statement::Permit) {
        let reason = format!(
            "permitted by rule 'permit {} on {}' (line {})",
            permit.action, permit.resource, permit.line
        );
        return EvaluationResult {
            permitted: true,
            matched_rule: Some(Statement::Permit(permit.clone())),
            all_matches,
            reason,
            severity: permit.severity,
        };
    }

    EvaluationResult {
        permitted: false,
        matched_rule: None,
        all_matches,
        reason: "no matching rule; default deny".to_string(),
        severity: None,
    }
}

/// Evaluate a condition with three-valued logic.
///
/// Returns `None` when the outcome depends on a field that is absent from the
/// context or not a scalar; callers treat anything but `Some(true)` as a
/// failed condition.
pub fn evaluate_condition(condition: &Condition, context: &Context) -> Option<bool> {
    match condition {
        Condition::Compare { field, op, value } => compare(lookup(context, field)?, *op, value),
        Condition::All(terms) => {
            let mut unknown = false;
            for term in terms {
                match evaluate_condition(term, context) {
                    Some(false) => return Some(false),
                    None => unknown = true,
                    Some(true) => {}
                }
            }
            if unknown {
                None
            } else {
                Some(true)
            }
        }
        Condition::Any(terms) => {
            let mut unknown = false;
            for term in terms {
                match evaluate_condition(term, context) {
                    Some(true) => return Some(true),
                    None => unknown = true,
                    Some(false) => {}
                }
            }
            if unknown {
                None
            } else {
                Some(false)
            }
        }
        Condition::Not(inner) => evaluate_condition(inner, context).map(|b| !b),
    }
}

fn lookup<'a>(context: &'a Context, field: &str) -> Option<&'a Value> {
    if let Some(value) = context.get(field) {
        return Some(value);
    }
    let mut parts = field.split('.');
    let mut current = context.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

// Scalar view of a value: its text and, when numeric, its number.
struct Scalar {
    text: String,
    number: Option<f64>,
}

impl Scalar {
    fn of_value(value: &Value) -> Option<Scalar> {
        match value {
            Value::String(s) => Some(Scalar {
                number: s.trim().parse().ok(),
                text: s.clone(),
            }),
            Value::Number(n) => Some(Scalar {
                number: n.as_f64(),
                text: n.to_string(),
            }),
            Value::Bool(b) => Some(Scalar {
                text: b.to_string(),
                number: None,
            }),
            _ => None,
        }
    }

    fn of_literal(literal: &Literal) -> Option<Scalar> {
        match literal {
            Literal::Str(s) => Some(Scalar {
                number: s.trim().parse().ok(),
                text: s.clone(),
            }),
            Literal::Number(n) => Some(Scalar {
                number: Some(*n),
                text: literal.to_string(),
            }),
            Literal::Bool(b) => Some(Scalar {
                text: b.to_string(),
                number: None,
            }),
            Literal::List(_) => None,
        }
    }

    fn equals(&self, other: &Scalar) -> bool {
        match (self.number, other.number) {
            (Some(a), Some(b)) => a == b,
            _ => self.text == other.text,
        }
    }
}

fn compare(actual: &Value, op: Operator, expected: &Literal) -> Option<bool> {
    if let (Value::Array(items), Operator::Contains | Operator::NotContains) = (actual, op) {
        let wanted = Scalar::of_literal(expected)?;
        let found = items
            .iter()
            .filter_map(Scalar::of_value)
            .any(|item| item.equals(&wanted));
        return Some(found == (op == Operator::Contains));
    }

    let left = Scalar::of_value(actual)?;
    if let Literal::List(options) = expected {
        let found = options
            .iter()
            .filter_map(Scalar::of_literal)
            .any(|option| left.equals(&option));
        return match op {
            Operator::In => Some(found),
            Operator::NotIn => Some(!found),
            _ => Some(false),
        };
    }

    let right = Scalar::of_literal(expected)?;
    let ordered = |f: fn(f64, f64) -> bool| match (left.number, right.number) {
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    };
    let result = match op {
        Operator::Eq => left.equals(&right),
        Operator::Ne => !left.equals(&right),
        Operator::Lt => ordered(|a, b| a < b),
        Operator::Le => ordered(|a, b| a <= b),
        Operator::Gt => ordered(|a, b| a > b),
        Operator::Ge => ordered(|a, b| a >= b),
        Operator::Contains => left.text.contains(&right.text),
        Operator::NotContains => !left.text.contains(&right.text),
        Operator::StartsWith => left.text.starts_with(&right.text),
        Operator::EndsWith => left.text.ends_with(&right.text),
        Operator::In | Operator::NotIn => false,
    };
    Some(result)
}

fn limit_rank(a: &LimitRule, b: &LimitRule) -> Ordering {
    let axis = super::Pattern::resource("");
    super::specificity(&a.subject, &axis)
        .cmp(&super::specificity(&b.subject, &axis))
        .then_with(|| b.count.cmp(&a.count))
}

/// Check a subject's cumulative count against its applicable rate limit.
///
/// The most specific limit whose subject pattern matches applies. The window
/// starts at `window_start_ms` (default `now_ms`); once more than the limit's
/// period has elapsed the window is expired and the check passes with the
/// full allowance.
pub fn check_rate_limit(
    doc: &CclDocument,
    subject: &str,
    cumulative_count: u64,
    now_ms: i64,
    window_start_ms: Option<i64>,
) -> RateLimitResult {
    let Some(limit) = doc
        .limits()
        .filter(|l| l.subject.matches(subject))
        .max_by(|a, b| limit_rank(a, b))
    else {
        return RateLimitResult {
            exceeded: false,
            remaining: u64::MAX,
            limit: None,
            period_seconds: None,
        };
    };

    let elapsed_ms = i128::from(now_ms) - i128::from(window_start_ms.unwrap_or(now_ms));
    let period_ms = i128::from(limit.period_seconds) * 1000;
    if elapsed_ms > period_ms {
        return RateLimitResult {
            exceeded: false,
            remaining: limit.count,
            limit: Some(limit.count),
            period_seconds: Some(limit.period_seconds),
        };
    }

    RateLimitResult {
        exceeded: cumulative_count >= limit.count,
        remaining: limit.count.saturating_sub(cumulative_count),
        limit: Some(limit.count),
        period_seconds: Some(limit.period_seconds),
    }
}
