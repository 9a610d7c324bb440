//! Recursive-descent parser from CCL tokens to a `CclDocument`.

use super::lexer::{Token, TokenKind};
use super::{
    CclDocument, Condition, LimitRule, Literal, Operator, Pattern, Rule, Severity, Statement, MAX_CONDITION_DEPTH,
    MAX_PATTERN_SEGMENTS,
};
use crate::SteleError;

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    eof: Token,
}

impl Parser {
    pub(crate) fn new(tokens: Vec<Token>) -> Self {
        let (line, column) = tokens.last().map_or((1, 1), |t| (t.line, t.column));
        Parser {
            tokens,
            pos: 0,
            eof: Token {
                kind: TokenKind::Eof,
                value: String::new(),
                line,
                column,
            },
        }
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&self.eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.current().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current().kind == kind
    }

    fn syntax_error(&self, expected: &str) -> SteleError {
        let tok = self.current();
        SteleError::CclSyntax {
            line: tok.line,
            column: tok.column,
            message: format!("expected {expected}, got {}", tok.describe()),
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<Token, SteleError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.syntax_error(expected))
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(TokenKind::Newline) {
            self.advance();
        }
    }

    pub(crate) fn parse_document(mut self) -> Result<CclDocument, SteleError> {
        let mut statements = Vec::new();
        loop {
            self.skip_newlines();
            if self.check(TokenKind::Eof) {
                break;
            }
            statements.push(self.parse_statement()?);
            if !self.check(TokenKind::Newline) && !self.check(TokenKind::Eof) {
                return Err(self.syntax_error("end of statement"));
            }
        }
        Ok(CclDocument::new(statements))
    }

    fn parse_statement(&mut self) -> Result<Statement, SteleError> {
        match self.current().kind {
            TokenKind::Permit => Ok(Statement::Permit(self.parse_rule()?)),
            TokenKind::Deny => Ok(Statement::Deny(self.parse_rule()?)),
            TokenKind::Require => Ok(Statement::Require(self.parse_rule()?)),
            TokenKind::Limit => Ok(Statement::Limit(self.parse_limit()?)),
            _ => Err(self.syntax_error("statement keyword (permit, deny, require, or limit)")),
        }
    }

    fn parse_rule(&mut self) -> Result<Rule, SteleError> {
        let line = self.advance().line;
        let action = self.parse_action(line)?;
        self.expect(TokenKind::On, "'on' after action")?;
        let resource = self.parse_resource(line)?;

        let condition = if self.check(TokenKind::When) {
            self.advance();
            Some(self.parse_or(line, 0)?)
        } else {
            None
        };
        let severity = self.parse_severity(line)?;

        Ok(Rule {
            action,
            resource,
            condition,
            severity,
            line,
        })
    }

    fn parse_limit(&mut self) -> Result<LimitRule, SteleError> {
        let line = self.advance().line;
        let subject = self.parse_action(line)?;
        let count = self.parse_positive_integer(line, "limit count")?;
        self.expect(TokenKind::Per, "'per' in limit statement")?;
        let period = self.parse_positive_integer(line, "limit period")?;
        let unit = self.expect(TokenKind::TimeUnit, "time unit (seconds, minutes, hours, days)")?;
        let period_seconds = period
            .checked_mul(seconds_per_unit(&unit.value))
            .ok_or_else(|| SteleError::CclValidation {
                line,
                message: format!("limit period {period} {} overflows", unit.value),
            })?;
        let severity = self.parse_severity(line)?;

        Ok(LimitRule {
            subject,
            count,
            period_seconds,
            severity,
            line,
        })
    }

    fn parse_positive_integer(&mut self, line: usize, what: &str) -> Result<u64, SteleError> {
        let tok = self.expect(TokenKind::Number, &format!("{what} number"))?;
        match tok.value.parse::<u64>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(SteleError::CclValidation {
                line,
                message: format!("{what} must be a positive integer, got '{}'", tok.value),
            }),
        }
    }

    fn parse_severity(&mut self, line: usize) -> Result<Option<Severity>, SteleError> {
        if !self.check(TokenKind::Severity) {
            return Ok(None);
        }
        self.advance();
        let level = self.expect(TokenKind::Identifier, "severity level")?;
        Severity::from_name(&level.value)
            .map(Some)
            .ok_or_else(|| SteleError::CclValidation {
                line,
                message: format!(
                    "unknown severity level '{}' (expected critical, high, medium, or low)",
                    level.value
                ),
            })
    }

    fn parse_action(&mut self, line: usize) -> Result<Pattern, SteleError> {
        let mut parts = vec![self.parse_action_segment()?];
        while self.check(TokenKind::Dot) {
            self.advance();
            parts.push(self.parse_action_segment()?);
        }
        let pattern = Pattern::action(&parts.join("."));
        check_pattern_size(&pattern, line)?;
        Ok(pattern)
    }

    // Keywords are plain words inside an action, so `schedule.day` or
    // `limit.on` are valid action paths.
    fn parse_action_segment(&mut self) -> Result<String, SteleError> {
        let tok = self.current();
        if matches!(tok.kind, TokenKind::Wildcard | TokenKind::DoubleWildcard) || tok.is_word() {
            Ok(self.advance().value)
        } else {
            Err(self.syntax_error("action identifier or wildcard"))
        }
    }

    fn parse_resource(&mut self, line: usize) -> Result<Pattern, SteleError> {
        let pattern = match self.current().kind {
            TokenKind::Str
            | TokenKind::Path
            | TokenKind::Wildcard
            | TokenKind::DoubleWildcard
            | TokenKind::Identifier => Pattern::resource(&self.advance().value),
            _ => return Err(self.syntax_error("resource (quoted string or path pattern)")),
        };
        check_pattern_size(&pattern, line)?;
        Ok(pattern)
    }

    fn parse_or(&mut self, line: usize, depth: usize) -> Result<Condition, SteleError> {
        let first = self.parse_and(line, depth)?;
        if !self.check(TokenKind::Or) {
            return Ok(first);
        }
        let mut terms = vec![first];
        while self.check(TokenKind::Or) {
            self.advance();
            terms.push(self.parse_and(line, depth)?);
        }
        Ok(Condition::Any(terms))
    }

    fn parse_and(&mut self, line: usize, depth: usize) -> Result<Condition, SteleError> {
        let first = self.parse_unary(line, depth)?;
        if !self.check(TokenKind::And) {
            return Ok(first);
        }
        let mut terms = vec![first];
        while self.check(TokenKind::And) {
            self.advance();
            terms.push(self.parse_unary(line, depth)?);
        }
        Ok(Condition::All(terms))
    }

    fn parse_unary(&mut self, line: usize, depth: usize) -> Result<Condition, SteleError> {
        let nests = matches!(self.current().kind, TokenKind::Not | TokenKind::LParen);
        if nests && depth >= MAX_CONDITION_DEPTH {
            return Err(SteleError::CclValidation {
                line,
                message: format!("condition nests deeper than {MAX_CONDITION_DEPTH} levels"),
            });
        }
        match self.current().kind {
            TokenKind::Not => {
                self.advance();
                Ok(Condition::Not(Box::new(self.parse_unary(line, depth + 1)?)))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_or(line, depth + 1)?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            _ => self.parse_comparison(line),
        }
    }

    fn parse_comparison(&mut self, line: usize) -> Result<Condition, SteleError> {
        let mut field = self.expect(TokenKind::Identifier, "condition field")?.value;
        while self.check(TokenKind::Dot) {
            self.advance();
            field.push('.');
            field.push_str(&self.expect(TokenKind::Identifier, "identifier after '.' in field")?.value);
        }

        let op_tok = self.expect(TokenKind::Operator, &format!("operator after field '{field}'"))?;
        let op = Operator::from_symbol(&op_tok.value).ok_or_else(|| SteleError::CclSyntax {
            line: op_tok.line,
            column: op_tok.column,
            message: format!("unknown operator '{}'", op_tok.value),
        })?;

        let value = if self.check(TokenKind::LBracket) {
            self.parse_list()?
        } else {
            self.parse_scalar()?
        };

        let is_list = matches!(value, Literal::List(_));
        if op.takes_list() && !is_list {
            return Err(SteleError::CclValidation {
                line,
                message: format!("operator '{op}' on field '{field}' requires a list value"),
            });
        }
        if !op.takes_list() && is_list {
            return Err(SteleError::CclValidation {
                line,
                message: format!("operator '{op}' on field '{field}' does not accept a list"),
            });
        }

        Ok(Condition::Compare { field, op, value })
    }

    fn parse_list(&mut self) -> Result<Literal, SteleError> {
        self.advance();
        let mut items = Vec::new();
        if !self.check(TokenKind::RBracket) {
            items.push(self.parse_scalar()?);
            while self.check(TokenKind::Comma) {
                self.advance();
                items.push(self.parse_scalar()?);
            }
        }
        self.expect(TokenKind::RBracket, "']' or ','")?;
        Ok(Literal::List(items))
    }

    fn parse_scalar(&mut self) -> Result<Literal, SteleError> {
        match self.current().kind {
            TokenKind::Str => Ok(Literal::Str(self.advance().value)),
            TokenKind::Number => {
                let tok = self.advance();
                tok.value
                    .parse::<f64>()
                    .map(Literal::Number)
                    .map_err(|_| SteleError::CclSyntax {
                        line: tok.line,
                        column: tok.column,
                        message: format!("invalid number '{}'", tok.value),
                    })
            }
            TokenKind::Identifier => {
                let word = self.advance().value;
                Ok(match word.to_ascii_lowercase().as_str() {
                    "true" => Literal::Bool(true),
                    "false" => Literal::Bool(false),
                    _ => Literal::Str(word),
                })
            }
            _ => Err(self.syntax_error("value (string, number, boolean, or identifier)")),
        }
    }
}

fn check_pattern_size(pattern: &Pattern, line: usize) -> Result<(), SteleError> {
    if pattern.segments().len() > MAX_PATTERN_SEGMENTS {
        return Err(SteleError::CclValidation {
            line,
            message: format!(
                "pattern '{pattern}' has more than {MAX_PATTERN_SEGMENTS} segments"
            ),
        });
    }
    Ok(())
}

fn seconds_per_unit(unit: &str) -> u64 {
    match unit.to_ascii_lowercase().as_str() {
        "minute" | "minutes" => 60,
        "hour" | "hours" => 3_600,
        "day" | "days" => 86_400,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use crate::ccl::{
        parse, Condition, Literal, Operator, Severity, Statement, MAX_CONDITION_DEPTH, MAX_PATTERN_SEGMENTS,
    };
    use crate::SteleError;

    #[test]
    fn test_parse_permit() {
        let doc = parse("permit read on '/data/**'").unwrap();
        let rule = doc.permits().next().unwrap();
        assert_eq!(rule.action.as_str(), "read");
        assert_eq!(rule.resource.as_str(), "/data/**");
        assert_eq!(rule.line, 1);
    }

    #[test]
    fn test_parse_bare_path_and_keyword_case() {
        let doc = parse("PERMIT read ON /data/*").unwrap();
        assert_eq!(doc.permits().next().unwrap().resource.as_str(), "/data/*");
    }

    #[test]
    fn test_parse_limit_normalizes_units() {
        for (unit, seconds) in [("seconds", 30), ("minute", 1_800), ("hours", 108_000), ("days", 2_592_000)] {
            let doc = parse(&format!("limit api.call 100 per 30 {unit}")).unwrap();
            let limit = doc.limits().next().unwrap();
            assert_eq!(limit.count, 100);
            assert_eq!(limit.period_seconds, seconds, "unit {unit}");
        }
    }

    #[test]
    fn test_parse_condition_precedence() {
        let doc = parse("permit read on '/x' when a = 1 or b = 2 and not c = 3").unwrap();
        let cond = doc.permits().next().unwrap().condition.clone().unwrap();
        let Condition::Any(terms) = cond else {
            panic!("expected disjunction");
        };
        assert_eq!(terms.len(), 2);
        assert!(matches!(&terms[1], Condition::All(inner) if matches!(inner[1], Condition::Not(_))));
    }

    #[test]
    fn test_parse_values() {
        let doc = parse("permit r on '/x' when tier in ['gold', 2, true] and name = bob").unwrap();
        let Some(Condition::All(terms)) = doc.permits().next().unwrap().condition.clone() else {
            panic!("expected conjunction");
        };
        assert_eq!(
            terms[0],
            Condition::Compare {
                field: "tier".into(),
                op: Operator::In,
                value: Literal::List(vec![
                    Literal::Str("gold".into()),
                    Literal::Number(2.0),
                    Literal::Bool(true)
                ]),
            }
        );
        assert!(matches!(&terms[1], Condition::Compare { value: Literal::Str(s), .. } if s == "bob"));
    }

    #[test]
    fn test_parse_severity() {
        let doc = parse("deny delete on '**' severity critical").unwrap();
        assert_eq!(doc.statements[0].severity(), Some(Severity::Critical));
    }

    #[test]
    fn test_syntax_error_names_token_and_line() {
        let err = parse("permit read on '/a'\ndeny write '/b'").unwrap_err();
        match err {
            SteleError::CclSyntax { line, message, .. } => {
                assert_eq!(line, 2);
                assert!(message.contains("'on'"), "{message}");
                assert!(message.contains("/b"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_trailing_tokens_are_rejected() {
        let err = parse("permit read on '/a' '/b'").unwrap_err();
        assert!(matches!(err, SteleError::CclSyntax { line: 1, .. }));
    }

    #[test]
    fn test_validation_errors_are_distinct() {
        let negative = parse("permit a on '/x'\nlimit api -5 per 1 hours").unwrap_err();
        assert!(matches!(negative, SteleError::CclValidation { line: 2, .. }));

        let zero_period = parse("limit api 5 per 0 hours").unwrap_err();
        assert!(matches!(zero_period, SteleError::CclValidation { line: 1, .. }));

        let severity = parse("permit a on '/x' severity extreme").unwrap_err();
        assert!(matches!(severity, SteleError::CclValidation { .. }));

        let list = parse("permit a on '/x' when role = ['a']").unwrap_err();
        assert!(matches!(list, SteleError::CclValidation { .. }));
    }

    #[test]
    fn test_condition_nesting_is_bounded() {
        let at_limit = format!("permit a on '/x' when {}a = 1", "not ".repeat(MAX_CONDITION_DEPTH));
        assert!(parse(&at_limit).is_ok());

        let deep_not = format!("permit a on '/x' when {}a = 1", "not ".repeat(100_000));
        assert!(matches!(parse(&deep_not), Err(SteleError::CclValidation { line: 1, .. })));

        let deep_parens = format!("permit a on '/x' when {}a = 1{}", "(".repeat(200_000), ")".repeat(200_000));
        assert!(matches!(parse(&deep_parens), Err(SteleError::CclValidation { line: 1, .. })));
    }

    #[test]
    fn test_pattern_length_is_bounded() {
        let long = format!("permit read on '{}'", "/a".repeat(MAX_PATTERN_SEGMENTS + 1));
        assert!(matches!(parse(&long), Err(SteleError::CclValidation { .. })));
        let action = vec!["x"; MAX_PATTERN_SEGMENTS + 1].join(".");
        assert!(parse(&format!("permit {action} on '/a'")).is_err());
        assert!(parse(&format!("permit read on '{}'", "/a".repeat(MAX_PATTERN_SEGMENTS))).is_ok());
    }

    #[test]
    fn test_keywords_are_literal_action_segments() {
        let doc = parse("permit schedule.day on '/x'
limit report.per.on 5 per 1 days
permit on on '/y'").unwrap();
        let actions: Vec<String> = doc.permits().map(|r| r.action.to_string()).collect();
        assert_eq!(actions, vec!["schedule.day", "on"]);
        assert_eq!(doc.limits().next().unwrap().subject.as_str(), "report.per.on");
        assert!(parse("permit schedule.= on '/x'").is_err());
    }

    #[test]
    fn test_empty_and_comment_only_sources() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("# nothing here\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_no_statement_dropped() {
        let doc = parse("permit a on '/1'\n\n# c\npermit b on '/2'\ndeny c on '/3'\nrequire d on '/4'").unwrap();
        assert_eq!(doc.len(), 4);
        assert!(matches!(doc.statements[3], Statement::Require(_)));
        assert_eq!(doc.statements[3].line(), 6);
    }
}
