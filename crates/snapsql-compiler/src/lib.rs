//! C1–C5: tokenizer, directive parser, SQL parser, schema/type resolver,
//! lowerer. Pure functions from bytes (plus a table-metadata map) to an
//! [`snapsql_core::ir::IntermediateFormat`] (§5 "Scheduling model").

pub mod dialect;
pub mod directives;
pub mod errors;
pub mod lexer;
pub mod lowerer;
pub mod parser;
pub mod resolver;

use ahash::AHashMap;
use snapsql_core::ir::IntermediateFormat;
use snapsql_core::table::TableMetadata;
use snapsql_core::types::TypeSpec;
use snapsql_core::value::Value;

pub use dialect::Dialect;
pub use errors::CompileError;

/// `options` of the compile entry point (§6).
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub dialect_hint: Option<Dialect>,
    pub constants: AHashMap<String, Value>,
    pub table_metadata: AHashMap<String, TableMetadata>,
    pub strict: bool,
    /// File name recorded into `IntermediateFormat::source` for diagnostics.
    pub file_name: Option<String>,
}

/// A non-fatal finding attached to an otherwise-successful compile
/// (§7 "Warnings (schema partial, advisory) are attached to the successful
/// result as a diagnostics list").
#[derive(Debug, Clone, PartialEq)]
pub struct CompileWarning {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub intermediate: IntermediateFormat,
    pub warnings: Vec<CompileWarning>,
}

/// `compile(source_bytes, options) -> IntermediateFormat | CompileError` (§6).
pub fn compile(source: &str, options: &CompileOptions) -> Result<CompileOutput, CompileError> {
    log::debug!("compile: {} bytes", source.len());

    let lexed = lexer::tokenize(source)?;
    log::trace!("C1 tokenizer: {} tokens", lexed.tokens.len());

    let directives = directives::check_balance(&lexed.tokens)?;
    log::trace!("C2 directive parser: {directives} directive(s) balanced");

    let program = parser::parse(source, &lexed.tokens, lexed.metadata.clone())?;
    log::trace!("C3 SQL parser: {} top-level node(s)", program.root.len());

    let mut warnings = Vec::new();
    let resolved = resolver::resolve(source, &program, &options.table_metadata, options.strict, &mut warnings)?;
    log::trace!(
        "C4 resolver: {} response field(s), {} warning(s)",
        resolved.response_fields.len(),
        warnings.len()
    );

    let lowered = lowerer::lower(source, &program, &resolved, &lexed.metadata, options)?;
    log::trace!(
        "C5 lowerer: {} instruction(s), {} expression(s)",
        lowered.instructions.len(),
        lowered.cel_expressions.len()
    );

    lowered.validate().map_err(CompileError::Ir)?;

    Ok(CompileOutput { intermediate: lowered, warnings })
}

/// A parsed interface-metadata YAML fragment, used when the caller has
/// already peeled a markdown fixture (§6 "Markdown files").
pub fn parse_parameter_types(yaml: &str) -> Result<indexmap::IndexMap<String, TypeSpec>, CompileError> {
    resolver::parse_parameters_yaml(yaml)
}
