use snapsql_core::errors::{Diagnostic, ErrorPosition, IrError, LexError, StructuralError};
use thiserror::Error;

/// §7 "Semantic", plus parser-local constructs §4.3 rejects.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unsupported construct at {at}: {reason}")]
    UnsupportedConstruct { reason: String, at: ErrorPosition },
    #[error("unexpected end of input while parsing {context} (started at {at})")]
    UnexpectedEof { context: String, at: ErrorPosition },
    #[error("unexpected token `{found}` at {at}, expected {expected}")]
    UnexpectedToken { found: String, expected: String, at: ErrorPosition },
}

impl Diagnostic for ParseError {
    fn kind(&self) -> &'static str {
        match self {
            ParseError::UnsupportedConstruct { .. } => "UnsupportedConstruct",
            ParseError::UnexpectedEof { .. } => "UnexpectedEof",
            ParseError::UnexpectedToken { .. } => "UnexpectedToken",
        }
    }

    fn position(&self) -> Option<ErrorPosition> {
        Some(match self {
            ParseError::UnsupportedConstruct { at, .. } => *at,
            ParseError::UnexpectedEof { at, .. } => *at,
            ParseError::UnexpectedToken { at, .. } => *at,
        })
    }
}

/// §7 "Semantic": unknown column / type mismatch / response-affinity
/// conflict, raised only in strict mode (§4.4 "Failure semantics").
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown column `{column}` at {at}")]
    UnknownColumn { column: String, at: ErrorPosition },
    #[error("unknown table `{table}` at {at}")]
    UnknownTable { table: String, at: ErrorPosition },
    #[error("type mismatch for `{name}`: expected {expected}, found {found}")]
    TypeMismatch { name: String, expected: String, found: String, at: ErrorPosition },
    #[error("response-affinity conflict for `{name}`: {reason}")]
    ResponseAffinityConflict { name: String, reason: String },
    #[error("invalid interface metadata: {reason}")]
    InvalidMetadata { reason: String },
    #[error("const directive at {at} references undefined constant `{name}`")]
    UndefinedConstant { name: String, at: ErrorPosition },
}

impl Diagnostic for ResolveError {
    fn kind(&self) -> &'static str {
        match self {
            ResolveError::UnknownColumn { .. } => "UnknownColumn",
            ResolveError::UnknownTable { .. } => "UnknownTable",
            ResolveError::TypeMismatch { .. } => "TypeMismatch",
            ResolveError::ResponseAffinityConflict { .. } => "ResponseAffinityConflict",
            ResolveError::InvalidMetadata { .. } => "InvalidMetadata",
            ResolveError::UndefinedConstant { .. } => "UndefinedConstant",
        }
    }

    fn position(&self) -> Option<ErrorPosition> {
        match self {
            ResolveError::UnknownColumn { at, .. } => Some(*at),
            ResolveError::UnknownTable { at, .. } => Some(*at),
            ResolveError::TypeMismatch { at, .. } => Some(*at),
            ResolveError::ResponseAffinityConflict { .. } => None,
            ResolveError::InvalidMetadata { .. } => None,
            ResolveError::UndefinedConstant { at, .. } => Some(*at),
        }
    }
}

/// The facade-level sum of every compile-time error kind (§6 "Compile entry
/// point"). Compilation errors abort at the earliest detecting component
/// and are returned unchanged to the caller (§7 "Propagation policy").
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Ir(#[from] IrError),
}

impl CompileError {
    pub fn kind(&self) -> &'static str {
        match self {
            CompileError::Lex(e) => e.kind(),
            CompileError::Structural(e) => e.kind(),
            CompileError::Parse(e) => e.kind(),
            CompileError::Resolve(e) => e.kind(),
            CompileError::Ir(e) => e.kind(),
        }
    }

    pub fn position(&self) -> Option<ErrorPosition> {
        match self {
            CompileError::Lex(e) => e.position(),
            CompileError::Structural(e) => e.position(),
            CompileError::Parse(e) => e.position(),
            CompileError::Resolve(e) => e.position(),
            CompileError::Ir(e) => e.position(),
        }
    }
}
