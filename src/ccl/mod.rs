//! Covenant Constraint Language (CCL).
//!
//! CCL expresses the access policy a covenant binds its parties to. It has
//! four statement types:
//!
//! - `permit <action> on '<resource>' [when <condition>] [severity <level>]`
//! - `deny <action> on '<resource>' [when <condition>] [severity <level>]`
//! - `require <action> on '<resource>' [when <condition>] [severity <level>]`
//! - `limit <action> <count> per <period> <unit>` -- rate limit
//!
//! Evaluation semantics: default deny, any matching deny wins, the most
//! specific matching rule is reported, and `require` statements are
//! obligations that never grant or revoke access.
//!
//! ```
//! use stele_covenant::ccl;
//! let policy = ccl::parse("permit read on '/data/**'").unwrap();
//! let result = ccl::evaluate(&policy, "read", "/data/users/42", &ccl::Context::new());
//! assert!(result.permitted);
//! ```

mod evaluate;
mod lexer;
mod narrowing;
mod parser;
mod pattern;

pub use evaluate::{check_rate_limit, evaluate, evaluate_condition, EvaluationResult, RateLimitResult};
pub use narrowing::{merge, validate_narrowing, NarrowingResult, NarrowingViolation};
pub use pattern::{match_action, match_resource, specificity, Pattern, PatternKind, Segment, Specificity};

use crate::SteleError;
use std::fmt;

/// Scalar facts a condition is evaluated against. Dotted condition fields
/// resolve either to a flat key or by walking nested objects.
pub type Context = serde_json::Map<String, serde_json::Value>;

/// Deepest nesting of `not` and parentheses a condition may use.
pub const MAX_CONDITION_DEPTH: usize = 64;

/// Most segments a single action or resource pattern may have.
pub const MAX_PATTERN_SEGMENTS: usize = 64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The four CCL statement kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Permit,
    Deny,
    Require,
    Limit,
}

impl StatementKind {
    /// The statement keyword.
    pub fn as_str(self) -> &'static str {
        match self {
            StatementKind::Permit => "permit",
            StatementKind::Deny => "deny",
            StatementKind::Require => "require",
            StatementKind::Limit => "limit",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity tag attached to a statement. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// The lowercase level name.
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Parse a level name, ignoring case.
    pub fn from_name(name: &str) -> Option<Severity> {
        match name.to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison operators usable in a `when` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
}

impl Operator {
    /// The operator as written in CCL source.
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::In => "in",
            Operator::NotIn => "not_in",
        }
    }

    /// Look up an operator by its source spelling.
    pub fn from_symbol(symbol: &str) -> Option<Operator> {
        let op = match symbol.to_ascii_lowercase().as_str() {
            "=" | "==" => Operator::Eq,
            "!=" => Operator::Ne,
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "contains" => Operator::Contains,
            "not_contains" => Operator::NotContains,
            "starts_with" => Operator::StartsWith,
            "ends_with" => Operator::EndsWith,
            "in" => Operator::In,
            "not_in" => Operator::NotIn,
            _ => return None,
        };
        Some(op)
    }

    /// Whether the right-hand side must be a list.
    pub fn takes_list(self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A literal on the right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Number(f64),
    Bool(bool),
    List(Vec<Literal>),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => write!(f, "{}", quote(s)),
            Literal::Number(n) => f.write_str(&format_number(*n)),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// A boolean condition over context fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        field: String,
        op: Operator,
        value: Literal,
    },
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// Conjunction of two conditions, flattening nested `All`s and
    /// collapsing identical operands.
    pub fn and(self, other: Condition) -> Condition {
        if self == other {
            return self;
        }
        let mut terms = Vec::new();
        for side in [self, other] {
            match side {
                Condition::All(inner) => terms.extend(inner),
                c => terms.push(c),
            }
        }
        let mut unique: Vec<Condition> = Vec::with_capacity(terms.len());
        for term in terms {
            if !unique.contains(&term) {
                unique.push(term);
            }
        }
        Condition::All(unique)
    }

    /// The top-level conjuncts of this condition.
    pub fn conjuncts(&self) -> Vec<&Condition> {
        match self {
            Condition::All(terms) => terms.iter().collect(),
            c => vec![c],
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::All(_) | Condition::Any(_) => write!(f, "({self})"),
            c => write!(f, "{c}"),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Compare { field, op, value } => write!(f, "{field} {op} {value}"),
            Condition::All(terms) | Condition::Any(terms) => {
                let joiner = if matches!(self, Condition::All(_)) { " and " } else { " or " };
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        f.write_str(joiner)?;
                    }
                    term.fmt_operand(f)?;
                }
                Ok(())
            }
            Condition::Not(inner) => {
                f.write_str("not ")?;
                inner.fmt_operand(f)
            }
        }
    }
}

/// The body of a permit, deny or require statement.
///
/// Equality ignores the source line.
#[derive(Debug, Clone)]
pub struct Rule {
    pub action: Pattern,
    pub resource: Pattern,
    pub condition: Option<Condition>,
    pub severity: Option<Severity>,
    pub line: usize,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.action == other.action
            && self.resource == other.resource
            && self.condition == other.condition
            && self.severity == other.severity
    }
}

impl Rule {
    /// Whether this rule's action and resource patterns both match.
    pub fn matches(&self, action: &str, resource: &str) -> bool {
        self.action.matches(action) && self.resource.matches(resource)
    }

    /// Specificity of this rule's action and resource pair.
    pub fn specificity(&self) -> Specificity {
        specificity(&self.action, &self.resource)
    }
}

/// A rate limit: at most `count` occurrences of `subject` per `period_seconds`.
///
/// Equality ignores the source line.
#[derive(Debug, Clone)]
pub struct LimitRule {
    pub subject: Pattern,
    pub count: u64,
    pub period_seconds: u64,
    pub severity: Option<Severity>,
    pub line: usize,
}

impl PartialEq for LimitRule {
    fn eq(&self, other: &Self) -> bool {
        self.subject == other.subject
            && self.count == other.count
            && self.period_seconds == other.period_seconds
            && self.severity == other.severity
    }
}

/// A single CCL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Permit(Rule),
    Deny(Rule),
    Require(Rule),
    Limit(LimitRule),
}

impl Statement {
    /// Which of the four statement kinds this is.
    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::Permit(_) => StatementKind::Permit,
            Statement::Deny(_) => StatementKind::Deny,
            Statement::Require(_) => StatementKind::Require,
            Statement::Limit(_) => StatementKind::Limit,
        }
    }

    /// The access rule, for every kind except `limit`.
    pub fn rule(&self) -> Option<&Rule> {
        match self {
            Statement::Permit(r) | Statement::Deny(r) | Statement::Require(r) => Some(r),
            Statement::Limit(_) => None,
        }
    }

    /// Source line the statement was parsed from.
    pub fn line(&self) -> usize {
        match self {
            Statement::Permit(r) | Statement::Deny(r) | Statement::Require(r) => r.line,
            Statement::Limit(l) => l.line,
        }
    }

    /// The severity tag, if one was given.
    pub fn severity(&self) -> Option<Severity> {
        match self {
            Statement::Permit(r) | Statement::Deny(r) | Statement::Require(r) => r.severity,
            Statement::Limit(l) => l.severity,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Permit(rule) | Statement::Deny(rule) | Statement::Require(rule) => {
                write!(
                    f,
                    "{} {} on {}",
                    self.kind(),
                    rule.action.as_str(),
                    quote(rule.resource.as_str())
                )?;
                if let Some(condition) = &rule.condition {
                    write!(f, " when {condition}")?;
                }
            }
            Statement::Limit(limit) => {
                let (period, unit) = best_time_unit(limit.period_seconds);
                write!(
                    f,
                    "limit {} {} per {} {}",
                    limit.subject.as_str(),
                    limit.count,
                    period,
                    unit
                )?;
            }
        }
        if let Some(severity) = self.severity() {
            write!(f, " severity {severity}")?;
        }
        Ok(())
    }
}

/// A parsed CCL policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CclDocument {
    pub statements: Vec<Statement>,
}

impl CclDocument {
    pub fn new(statements: Vec<Statement>) -> Self {
        CclDocument { statements }
    }

    /// Permit rules in source order.
    pub fn permits(&self) -> impl Iterator<Item = &Rule> {
        self.statements.iter().filter_map(|s| match s {
            Statement::Permit(r) => Some(r),
            _ => None,
        })
    }

    /// Deny rules in source order.
    pub fn denies(&self) -> impl Iterator<Item = &Rule> {
        self.statements.iter().filter_map(|s| match s {
            Statement::Deny(r) => Some(r),
            _ => None,
        })
    }

    /// Require rules in source order.
    pub fn obligations(&self) -> impl Iterator<Item = &Rule> {
        self.statements.iter().filter_map(|s| match s {
            Statement::Require(r) => Some(r),
            _ => None,
        })
    }

    /// Limit statements in source order.
    pub fn limits(&self) -> impl Iterator<Item = &LimitRule> {
        self.statements.iter().filter_map(|s| match s {
            Statement::Limit(l) => Some(l),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Parse / serialize
// ---------------------------------------------------------------------------

/// Parse CCL source text into a `CclDocument`.
///
/// # Errors
/// `SteleError::CclSyntax` for malformed text and `SteleError::CclValidation`
/// for statements that parse but carry invalid values. Both name the line.
pub fn parse(source: &str) -> Result<CclDocument, SteleError> {
    let tokens = lexer::tokenize(source)?;
    parser::Parser::new(tokens).parse_document()
}

/// Serialize a policy back to CCL source text, one statement per line.
pub fn serialize(doc: &CclDocument) -> String {
    doc.statements
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('\'');
    out
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}

fn best_time_unit(seconds: u64) -> (u64, &'static str) {
    if seconds > 0 && seconds % 86_400 == 0 {
        (seconds / 86_400, "days")
    } else if seconds > 0 && seconds % 3_600 == 0 {
        (seconds / 3_600, "hours")
    } else if seconds > 0 && seconds % 60 == 0 {
        (seconds / 60, "minutes")
    } else {
        (seconds, "seconds")
    }
}
