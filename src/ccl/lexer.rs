//! CCL tokenizer.

use crate::SteleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Permit,
    Deny,
    Require,
    Limit,
    On,
    When,
    Severity,
    Per,
    TimeUnit,
    And,
    Or,
    Not,
    Identifier,
    Number,
    Str,
    Path,
    Operator,
    Dot,
    Wildcard,
    DoubleWildcard,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Newline,
    Eof,
}

#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    /// A bare word, whether or not it is a keyword.
    pub fn is_word(&self) -> bool {
        !matches!(self.kind, TokenKind::Str | TokenKind::Path | TokenKind::Number)
            && self
                .value
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    }

    /// How the token reads in an error message.
    pub fn describe(&self) -> String {
        match self.kind {
            TokenKind::Eof => "end of input".to_string(),
            TokenKind::Newline => "end of line".to_string(),
            _ => format!("'{}'", self.value),
        }
    }
}

fn keyword(word: &str) -> Option<TokenKind> {
    let kind = match word.to_ascii_lowercase().as_str() {
        "permit" => TokenKind::Permit,
        "deny" => TokenKind::Deny,
        "require" => TokenKind::Require,
        "limit" => TokenKind::Limit,
        "on" => TokenKind::On,
        "when" => TokenKind::When,
        "severity" => TokenKind::Severity,
        "per" => TokenKind::Per,
        "second" | "seconds" | "minute" | "minutes" | "hour" | "hours" | "day" | "days" => {
            TokenKind::TimeUnit
        }
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "contains" | "not_contains" | "starts_with" | "ends_with" | "in" | "not_in" => {
            TokenKind::Operator
        }
        _ => return None,
    };
    Some(kind)
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    // Newlines inside () or [] do not end a statement.
    nesting: usize,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Lexer {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            nesting: 0,
            tokens: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek(0)?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn push(&mut self, kind: TokenKind, value: impl Into<String>, line: usize, column: usize) {
        self.tokens.push(Token {
            kind,
            value: value.into(),
            line,
            column,
        });
    }

    fn error(&self, line: usize, column: usize, message: String) -> SteleError {
        SteleError::CclSyntax {
            line,
            column,
            message,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, SteleError> {
        while let Some(ch) = self.peek(0) {
            let (line, column) = (self.line, self.column);
            match ch {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '\n' => {
                    self.bump();
                    let after_content = self
                        .tokens
                        .last()
                        .is_some_and(|t| t.kind != TokenKind::Newline);
                    if self.nesting == 0 && after_content {
                        self.push(TokenKind::Newline, "\n", line, column);
                    }
                }
                '#' => {
                    while self.peek(0).is_some_and(|c| c != '\n') {
                        self.bump();
                    }
                }
                '\'' => self.string(line, column)?,
                '(' | '[' => {
                    self.bump();
                    self.nesting += 1;
                    let kind = if ch == '(' { TokenKind::LParen } else { TokenKind::LBracket };
                    self.push(kind, ch.to_string(), line, column);
                }
                ')' | ']' => {
                    self.bump();
                    self.nesting = self.nesting.saturating_sub(1);
                    let kind = if ch == ')' { TokenKind::RParen } else { TokenKind::RBracket };
                    self.push(kind, ch.to_string(), line, column);
                }
                ',' => {
                    self.bump();
                    self.push(TokenKind::Comma, ",", line, column);
                }
                '.' => {
                    self.bump();
                    self.push(TokenKind::Dot, ".", line, column);
                }
                '!' | '<' | '>' | '=' => self.operator(ch, line, column)?,
                '*' => {
                    self.bump();
                    if self.peek(0) == Some('*') {
                        self.bump();
                        self.push(TokenKind::DoubleWildcard, "**", line, column);
                    } else {
                        self.push(TokenKind::Wildcard, "*", line, column);
                    }
                }
                '/' => {
                    let mut path = String::new();
                    while let Some(c) = self.peek(0).filter(|c| !c.is_whitespace()) {
                        path.push(c);
                        self.bump();
                    }
                    self.push(TokenKind::Path, path, line, column);
                }
                c if c.is_ascii_digit() => self.number(line, column),
                '-' if self.peek(1).is_some_and(|c| c.is_ascii_digit()) => self.number(line, column),
                c if c.is_ascii_alphabetic() || c == '_' => self.word(line, column),
                other => {
                    return Err(self.error(line, column, format!("unexpected character {other:?}")));
                }
            }
        }

        let (line, column) = (self.line, self.column);
        self.push(TokenKind::Eof, "", line, column);
        Ok(self.tokens)
    }

    fn string(&mut self, line: usize, column: usize) -> Result<(), SteleError> {
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(self.error(line, column, "unterminated string literal".to_string()));
                }
                Some('\'') => break,
                Some('\\') => match self.bump() {
                    Some(escaped @ ('\'' | '\\')) => value.push(escaped),
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => {
                        return Err(self.error(line, column, "unterminated string literal".to_string()));
                    }
                },
                Some(c) => value.push(c),
            }
        }
        self.push(TokenKind::Str, value, line, column);
        Ok(())
    }

    fn operator(&mut self, first: char, line: usize, column: usize) -> Result<(), SteleError> {
        self.bump();
        let symbol = match (first, self.peek(0)) {
            ('!', Some('=')) | ('<', Some('=')) | ('>', Some('=')) | ('=', Some('=')) => {
                self.bump();
                format!("{first}=")
            }
            ('!', _) => {
                return Err(self.error(line, column, "expected '=' after '!'".to_string()));
            }
            _ => first.to_string(),
        };
        self.push(TokenKind::Operator, symbol, line, column);
        Ok(())
    }

    fn number(&mut self, line: usize, column: usize) {
        let mut num = String::new();
        if self.peek(0) == Some('-') {
            num.push('-');
            self.bump();
        }
        while let Some(c) = self.peek(0).filter(char::is_ascii_digit) {
            num.push(c);
            self.bump();
        }
        if self.peek(0) == Some('.') && self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            num.push('.');
            self.bump();
            while let Some(c) = self.peek(0).filter(char::is_ascii_digit) {
                num.push(c);
                self.bump();
            }
        }
        self.push(TokenKind::Number, num, line, column);
    }

    fn word(&mut self, line: usize, column: usize) {
        let mut word = String::new();
        while let Some(c) = self
            .peek(0)
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        {
            word.push(c);
            self.bump();
        }
        let kind = keyword(&word).unwrap_or(TokenKind::Identifier);
        self.push(kind, word, line, column);
    }
}

/// Split CCL source into tokens, terminated by a single `Eof`.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, SteleError> {
    Lexer::new(source).run()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_tokenize_statement() {
        assert_eq!(
            kinds("permit file.* on '/data/**'"),
            vec![
                TokenKind::Permit,
                TokenKind::Identifier,
                TokenKind::Dot,
                TokenKind::Wildcard,
                TokenKind::On,
                TokenKind::Str,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_blank_lines_collapse() {
        assert_eq!(
            kinds("# header\n\n\npermit a on '/x' # trailing\n\n"),
            vec![
                TokenKind::Permit,
                TokenKind::Identifier,
                TokenKind::On,
                TokenKind::Str,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_newlines_inside_brackets_are_ignored() {
        let tokens = kinds("x in [\n'a',\n'b'\n]");
        assert!(!tokens.contains(&TokenKind::Newline));
    }

    #[test]
    fn test_operators_and_numbers() {
        let tokens = tokenize("a >= -1.5 b != 2 c == 3").unwrap();
        let values: Vec<&str> = tokens.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(values, vec!["a", ">=", "-1.5", "b", "!=", "2", "c", "==", "3", ""]);
    }

    #[test]
    fn test_string_escapes() {
        let tokens = tokenize(r"'it\'s a \\ path'").unwrap();
        assert_eq!(tokens[0].value, r"it's a \ path");
    }

    #[test]
    fn test_unterminated_string_is_an_error() {
        let err = tokenize("permit read on '/data").unwrap_err();
        assert!(matches!(err, SteleError::CclSyntax { line: 1, column: 16, .. }));
    }

    #[test]
    fn test_unknown_character_reports_position() {
        let err = tokenize("permit read on '/x'\npermit @ on '/y'").unwrap_err();
        assert!(matches!(err, SteleError::CclSyntax { line: 2, column: 8, .. }));
    }
}
