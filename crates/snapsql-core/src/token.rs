use smol_str::SmolStr;

use crate::directive::Directive;
use crate::pos::Span;

/// Partition of token text per §3 "Token".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Keyword,
    Identifier,
    QuotedIdentifier,
    NumericLiteral,
    StringLiteral,
    Operator,
    Whitespace,
    LineComment,
    BlockCommentRaw,
    BlockCommentDirective,
    Eof,
}

impl TokenKind {
    pub fn is_trivia(self) -> bool {
        matches!(
            self,
            TokenKind::Whitespace | TokenKind::LineComment | TokenKind::BlockCommentRaw
        )
    }
}

/// `{kind, literal, line, column, byte_offset}` plus, for a directive
/// comment, the parsed payload it carries.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub literal: SmolStr,
    pub span: Span,
    pub directive: Option<Directive>,
    /// Set on the literal token(s) a `Variable`/`Const` directive carries
    /// forward so the surrounding SQL stays parseable (§4.1). The emitter
    /// must never emit a token with `dummy: true`.
    pub dummy: bool,
}

impl Token {
    pub fn new(kind: TokenKind, literal: impl Into<SmolStr>, span: Span) -> Self {
        Self { kind, literal: literal.into(), span, directive: None, dummy: false }
    }

    pub fn with_directive(mut self, directive: Directive) -> Self {
        self.directive = Some(directive);
        self
    }

    pub fn as_dummy(mut self) -> Self {
        self.dummy = true;
        self
    }

    pub fn is_code(&self) -> bool {
        !self.kind.is_trivia()
    }
}
