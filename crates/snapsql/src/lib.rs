//! Public facade over the compile/optimize/evaluate pipeline (§6 "External
//! interfaces"): `snapsql_compiler` turns template source into a persisted
//! [`IntermediateFormat`], `snapsql_runtime` turns that plus bound
//! parameters into ready-to-execute SQL.
//!
//! ```ignore
//! let compiled = snapsql::compile(source, &CompileOptions::default())?;
//! let optimized = snapsql::optimize(&compiled.intermediate, Dialect::PostgreSql);
//! let result = snapsql::evaluate(&optimized, Dialect::PostgreSql, &params, None)?;
//! ```
//!
//! `optimize` is cheap to run once per compiled template and reuse: the same
//! `optimized` value can back any number of `evaluate` calls (§5 "optimize
//! once, evaluate many").

pub use snapsql_compiler::{dialect::Dialect, CompileError, CompileOptions, CompileOutput, CompileWarning};
pub use snapsql_core::ir::IntermediateFormat;
pub use snapsql_core::value::Value;
pub use snapsql_core::IndexMap;
pub use snapsql_runtime::{EvaluateOutput, EvaluationError};

/// C1–C5: source bytes plus table/constant metadata to a persisted IR.
pub fn compile(source: &str, options: &CompileOptions) -> Result<CompileOutput, CompileError> {
    snapsql_compiler::compile(source, options)
}

/// C6 optimizer passes, run once per compiled template (§4.6 "Optimizer").
pub fn optimize(intermediate: &IntermediateFormat, dialect: Dialect) -> IntermediateFormat {
    snapsql_runtime::optimize(intermediate, to_runtime_dialect(dialect))
}

/// C6 evaluator: binds `parameters` against an (ideally already-optimized)
/// IR and renders dialect-ready SQL plus its positional arguments.
pub fn evaluate(
    intermediate: &IntermediateFormat,
    dialect: Dialect,
    parameters: &IndexMap<String, Value>,
    cancel: Option<&dyn Fn() -> bool>,
) -> Result<EvaluateOutput, EvaluationError> {
    snapsql_runtime::evaluate(intermediate, to_runtime_dialect(dialect), parameters, cancel)
}

/// `snapsql-runtime` has no dependency on `snapsql-compiler` (see
/// `DESIGN.md`), so the two crates carry independent `Dialect` enums with
/// the same variants; this is the one place that bridges them.
fn to_runtime_dialect(dialect: Dialect) -> snapsql_runtime::Dialect {
    match dialect {
        Dialect::PostgreSql => snapsql_runtime::Dialect::PostgreSql,
        Dialect::MySql => snapsql_runtime::Dialect::MySql,
        Dialect::Sqlite => snapsql_runtime::Dialect::Sqlite,
    }
}

/// Serializes an [`IntermediateFormat`] to its persisted JSON form (§6
/// "Intermediate Format (persisted)").
pub fn to_json(intermediate: &IntermediateFormat) -> serde_json::Result<String> {
    serde_json::to_string_pretty(intermediate)
}

/// Parses a persisted [`IntermediateFormat`] back from JSON.
pub fn from_json(json: &str) -> serde_json::Result<IntermediateFormat> {
    serde_json::from_str(json)
}
