//! C1: byte stream → token stream (§4.1).

use snapsql_core::directive::Directive;
use snapsql_core::errors::{ErrorPosition, LexError};
use snapsql_core::pos::{Position, Span};
use snapsql_core::token::{Token, TokenKind};

/// SQL keywords recognized across postgresql/mysql/sqlite; anything else
/// lexes as a plain identifier. Not exhaustive — dialect-specific keyword
/// lists are an optimizer/dialect concern the core does not own.
const KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "GROUP", "BY", "HAVING", "ORDER", "LIMIT", "OFFSET", "INSERT",
    "INTO", "VALUES", "UPDATE", "SET", "DELETE", "AND", "OR", "NOT", "AS", "JOIN", "ON", "WITH",
    "DISTINCT", "NULL", "TRUE", "FALSE", "CASE", "WHEN", "THEN", "ELSE", "END", "ASC", "DESC",
    "LEFT", "RIGHT", "INNER", "OUTER", "FULL", "CROSS", "UNION", "ALL", "EXISTS", "BETWEEN",
    "LIKE", "IN", "IS", "RETURNING", "DEFAULT", "PRIMARY", "KEY", "REFERENCES", "CONSTRAINT",
    "TABLE", "USING",
];

pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

/// A recognized top-of-file interface-metadata block, removed from the
/// downstream token stream (§4.1).
#[derive(Debug, Clone)]
pub struct MetadataBlock {
    pub raw_yaml: String,
    pub span: Span,
}

pub struct TokenizeOutput {
    pub tokens: Vec<Token>,
    pub metadata: Option<MetadataBlock>,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
    /// Becomes `Some` right after a `Variable`/`Const` directive, holding
    /// the paren depth (0 = not yet inside a parenthesized dummy) until the
    /// dummy payload is fully consumed.
    pending_dummy: Option<u32>,
    saw_code_token: bool,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
            pending_dummy: None,
            saw_code_token: false,
        }
    }

    fn here(&self) -> Position {
        Position::new(self.line, self.col, self.pos)
    }

    fn peek_byte(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_byte_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let rest = &self.src[self.pos..];
        let ch = rest.chars().next()?;
        self.pos += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn span_from(&self, start: Position) -> Span {
        Span::new(start, self.pos)
    }

    fn slice(&self, start: usize) -> &'a str {
        &self.src[start..self.pos]
    }

    fn apply_dummy(&mut self, token: Token) -> Token {
        if !token.is_code() {
            return token;
        }
        match self.pending_dummy {
            None => token,
            Some(depth) => {
                let token = token.as_dummy();
                if token.literal == "(" {
                    self.pending_dummy = Some(depth + 1);
                    token
                } else if token.literal == ")" {
                    if depth <= 1 {
                        self.pending_dummy = None;
                    } else {
                        self.pending_dummy = Some(depth - 1);
                    }
                    token
                } else if depth == 0 {
                    self.pending_dummy = None;
                    token
                } else {
                    token
                }
            }
        }
    }

    fn tokenize(mut self) -> Result<TokenizeOutput, LexError> {
        let mut tokens = Vec::new();
        let mut metadata = None;

        while self.pos < self.bytes.len() {
            let start = self.here();
            let start_byte = self.pos;
            let b = self.peek_byte().unwrap();

            let token = match b {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    while matches!(self.peek_byte(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
                        self.advance();
                    }
                    Token::new(TokenKind::Whitespace, self.slice(start_byte), self.span_from(start))
                }
                b'-' if self.peek_byte_at(1) == Some(b'-') => {
                    while !matches!(self.peek_byte(), None | Some(b'\n')) {
                        self.advance();
                    }
                    Token::new(TokenKind::LineComment, self.slice(start_byte), self.span_from(start))
                }
                b'/' if self.peek_byte_at(1) == Some(b'*') => {
                    self.lex_block_comment(start, start_byte, &mut metadata, tokens.is_empty() && !self.saw_code_token)?
                }
                b'\'' => self.lex_quoted(start, start_byte, b'\'', TokenKind::StringLiteral)?,
                b'"' => self.lex_quoted(start, start_byte, b'"', TokenKind::QuotedIdentifier)?,
                b'`' => self.lex_quoted(start, start_byte, b'`', TokenKind::QuotedIdentifier)?,
                b'0'..=b'9' => self.lex_number(start, start_byte),
                b'_' | b'a'..=b'z' | b'A'..=b'Z' => self.lex_word(start, start_byte),
                _ => self.lex_operator(start, start_byte),
            };

            let is_code = token.is_code();
            let token = self.apply_dummy(token);

            if let Some(Directive::Variable { .. } | Directive::Const { .. }) = &token.directive {
                self.pending_dummy = Some(0);
            }

            if is_code {
                self.saw_code_token = true;
            }

            tokens.push(token);
        }

        tokens.push(Token::new(TokenKind::Eof, "", Span::new(self.here(), self.pos)));

        Ok(TokenizeOutput { tokens, metadata })
    }

    fn lex_quoted(
        &mut self,
        start: Position,
        start_byte: usize,
        quote: u8,
        kind: TokenKind,
    ) -> Result<Token, LexError> {
        self.advance(); // opening quote
        loop {
            match self.peek_byte() {
                None => {
                    return Err(LexError::UnterminatedString { start: ErrorPosition::from(start) })
                }
                Some(b) if b == quote => {
                    self.advance();
                    if self.peek_byte() == Some(quote) {
                        self.advance();
                        continue;
                    }
                    break;
                }
                Some(b'\\') if quote == b'\'' => {
                    self.advance();
                    if self.peek_byte().is_some() {
                        self.advance();
                    }
                }
                _ => {
                    self.advance();
                }
            }
        }
        Ok(Token::new(kind, self.slice(start_byte), self.span_from(start)))
    }

    fn lex_number(&mut self, start: Position, start_byte: usize) -> Token {
        while matches!(self.peek_byte(), Some(b'0'..=b'9')) {
            self.advance();
        }
        if self.peek_byte() == Some(b'.') && matches!(self.peek_byte_at(1), Some(b'0'..=b'9')) {
            self.advance();
            while matches!(self.peek_byte(), Some(b'0'..=b'9')) {
                self.advance();
            }
        }
        if matches!(self.peek_byte(), Some(b'e' | b'E')) {
            let save = (self.pos, self.line, self.col);
            self.advance();
            if matches!(self.peek_byte(), Some(b'+' | b'-')) {
                self.advance();
            }
            if matches!(self.peek_byte(), Some(b'0'..=b'9')) {
                while matches!(self.peek_byte(), Some(b'0'..=b'9')) {
                    self.advance();
                }
            } else {
                (self.pos, self.line, self.col) = save;
            }
        }
        Token::new(TokenKind::NumericLiteral, self.slice(start_byte), self.span_from(start))
    }

    fn lex_word(&mut self, start: Position, start_byte: usize) -> Token {
        while matches!(self.peek_byte(), Some(b'_' | b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9')) {
            self.advance();
        }
        let text = self.slice(start_byte);
        let kind = if is_keyword(text) { TokenKind::Keyword } else { TokenKind::Identifier };
        Token::new(kind, text, self.span_from(start))
    }

    fn lex_operator(&mut self, start: Position, start_byte: usize) -> Token {
        const TWO_CHAR: &[&str] = &["<=", ">=", "<>", "!=", "::", "||"];
        if let Some(b0) = self.peek_byte() {
            if let Some(b1) = self.peek_byte_at(1) {
                let two = [b0, b1];
                if let Ok(s) = std::str::from_utf8(&two) {
                    if TWO_CHAR.contains(&s) {
                        self.advance();
                        self.advance();
                        return Token::new(
                            TokenKind::Operator,
                            self.slice(start_byte),
                            self.span_from(start),
                        );
                    }
                }
            }
        }
        self.advance();
        Token::new(TokenKind::Operator, self.slice(start_byte), self.span_from(start))
    }

    /// Scans a `/* … */` comment, classifying it per §4.1: plain comment
    /// (no sigil), reserved `@` block (passed through inert), or a
    /// structured/variable/const directive.
    fn lex_block_comment(
        &mut self,
        start: Position,
        start_byte: usize,
        metadata: &mut Option<MetadataBlock>,
        maybe_leading: bool,
    ) -> Result<Token, LexError> {
        self.advance(); // '/'
        self.advance(); // '*'
        let body_start = self.pos;
        loop {
            match self.peek_byte() {
                None => {
                    return Err(LexError::UnterminatedComment { start: ErrorPosition::from(start) })
                }
                Some(b'*') if self.peek_byte_at(1) == Some(b'/') => break,
                _ => {
                    self.advance();
                }
            }
        }
        let body_end = self.pos;
        let body = &self.src[body_start..body_end];
        self.advance(); // '*'
        self.advance(); // '/'
        let full_span = self.span_from(start);
        let raw_text = self.slice(start_byte);

        let trimmed = body.trim();
        let Some(first) = trimmed.as_bytes().first().copied() else {
            return Ok(Token::new(TokenKind::BlockCommentRaw, raw_text, full_span));
        };

        let sigil = match first {
            b'#' => '#',
            b'=' => '=',
            b'$' => '$',
            b'@' => '@',
            _ => return Ok(Token::new(TokenKind::BlockCommentRaw, raw_text, full_span)),
        };
        let rest = trimmed[1..].trim();

        match sigil {
            '@' => Ok(Token::new(TokenKind::BlockCommentRaw, raw_text, full_span)),
            '=' => {
                if rest.is_empty() {
                    return Err(LexError::InvalidDirective {
                        reason: "variable directive has an empty expression".into(),
                        at: ErrorPosition::from(start),
                    });
                }
                let directive = Directive::Variable { expr: rest.to_string(), expr_span: full_span };
                Ok(Token::new(TokenKind::BlockCommentDirective, raw_text, full_span)
                    .with_directive(directive))
            }
            '$' => {
                if rest.is_empty() {
                    return Err(LexError::InvalidDirective {
                        reason: "const directive has an empty expression".into(),
                        at: ErrorPosition::from(start),
                    });
                }
                let directive = Directive::Const { expr: rest.to_string(), expr_span: full_span };
                Ok(Token::new(TokenKind::BlockCommentDirective, raw_text, full_span)
                    .with_directive(directive))
            }
            '#' => {
                if maybe_leading && metadata.is_none() && looks_like_metadata(rest) {
                    *metadata = Some(MetadataBlock { raw_yaml: rest.to_string(), span: full_span });
                    return Ok(Token::new(TokenKind::Whitespace, "", full_span));
                }
                self.classify_structured(rest, start, raw_text, full_span)
            }
            _ => unreachable!(),
        }
    }

    fn classify_structured(
        &self,
        rest: &str,
        start: Position,
        raw_text: &'a str,
        full_span: Span,
    ) -> Result<Token, LexError> {
        let lower = rest.to_ascii_lowercase();
        let directive = if lower == "else" {
            Directive::Else
        } else if lower == "end" || lower == "end for" || lower == "endfor" {
            Directive::End
        } else if let Some(expr) = lower.strip_prefix("if ").map(|_| &rest[3..]) {
            Directive::If { expr: expr.trim().to_string(), expr_span: full_span }
        } else if let Some(expr) = lower.strip_prefix("elif ").map(|_| &rest[5..]) {
            Directive::ElIf { expr: expr.trim().to_string(), expr_span: full_span }
        } else if let Some(rem) = lower.strip_prefix("for ").map(|_| &rest[4..]) {
            let Some((var_part, iter_part)) = rem.split_once(':') else {
                return Err(LexError::InvalidDirective {
                    reason: format!("`for` directive `{rest}` is missing `:`"),
                    at: ErrorPosition::from(start),
                });
            };
            Directive::For {
                var_name: var_part.trim().to_string(),
                iterable_expr: iter_part.trim().to_string(),
                expr_span: full_span,
            }
        } else {
            return Err(LexError::InvalidDirective {
                reason: format!("unrecognized structured directive `{rest}`"),
                at: ErrorPosition::from(start),
            });
        };
        Ok(Token::new(TokenKind::BlockCommentDirective, raw_text, full_span).with_directive(directive))
    }
}

fn looks_like_metadata(body: &str) -> bool {
    match serde_yaml::from_str::<serde_yaml::Value>(body) {
        Ok(serde_yaml::Value::Mapping(map)) => {
            map.contains_key("function_name") || map.contains_key("parameters")
        }
        _ => false,
    }
}

pub fn tokenize(source: &str) -> Result<TokenizeOutput, LexError> {
    Lexer::new(source).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_tokens(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().tokens.into_iter().filter(|t| t.is_code()).collect()
    }

    #[test]
    fn static_template_has_no_directives() {
        let tokens = code_tokens("SELECT id FROM users WHERE id = 1");
        assert!(tokens.iter().all(|t| t.directive.is_none()));
        assert_eq!(tokens.first().unwrap().kind, TokenKind::Keyword);
    }

    #[test]
    fn variable_directive_marks_its_dummy() {
        let out = tokenize("WHERE id = /*= user_id */1").unwrap();
        let dummy = out.tokens.iter().find(|t| t.literal == "1").unwrap();
        assert!(dummy.dummy);
        let directive_token = out.tokens.iter().find(|t| t.directive.is_some()).unwrap();
        assert!(matches!(directive_token.directive, Some(Directive::Variable { .. })));
    }

    #[test]
    fn for_directive_splits_var_and_iterable() {
        let out = tokenize("/*# for v : vs */").unwrap();
        let directive = out.tokens[0].directive.clone().unwrap();
        match directive {
            Directive::For { var_name, iterable_expr, .. } => {
                assert_eq!(var_name, "v");
                assert_eq!(iterable_expr, "vs");
            }
            other => panic!("unexpected directive: {other:?}"),
        }
    }

    #[test]
    fn leading_metadata_block_is_extracted() {
        let out = tokenize("/*# function_name: get_user\nparameters:\n  id: int */\nSELECT 1").unwrap();
        assert!(out.metadata.is_some());
        assert!(out.tokens.iter().all(|t| t.directive.is_none()));
    }

    #[test]
    fn unterminated_comment_is_an_error() {
        let err = tokenize("SELECT 1 /* oops").unwrap_err();
        assert!(matches!(err, LexError::UnterminatedComment { .. }));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = tokenize("SELECT 'oops").unwrap_err();
        assert!(matches!(err, LexError::UnterminatedString { .. }));
    }

    #[test]
    fn dummy_list_in_parens_is_fully_marked() {
        let out = tokenize("dept IN (/*= depts */'x')").unwrap();
        let open_paren = out.tokens.iter().find(|t| t.literal == "(").unwrap();
        let literal = out.tokens.iter().find(|t| t.literal == "'x'").unwrap();
        let close_paren = out.tokens.iter().rev().find(|t| t.literal == ")").unwrap();
        assert!(!open_paren.dummy, "the author's own `(` must not be treated as dummy");
        assert!(literal.dummy);
        assert!(!close_paren.dummy, "the author's own `)` must not be treated as dummy");
    }
}
