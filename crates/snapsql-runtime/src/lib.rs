//! C6: the dialect-aware optimizer and CEL-backed evaluator that turn a
//! compiled [`snapsql_core::ir::IntermediateFormat`] plus bound parameters
//! into ready-to-execute SQL (§4.6).
//!
//! This crate has no dependency on `snapsql-compiler` — it consumes
//! [`IntermediateFormat`] values however they were produced (compiled
//! in-process, deserialized from a persisted file, across a process
//! boundary) and never needs the compiler's AST or directive types.

pub mod cel;
pub mod dialect;
pub mod errors;
pub mod evaluator;
pub mod optimizer;

pub use dialect::Dialect;
pub use errors::EvaluationError;
pub use evaluator::{evaluate, EvaluateOutput};
pub use optimizer::optimize;

#[cfg(test)]
mod tests {
    use snapsql_core::ir::{
        CelExpressionEntry, Dependencies, IntermediateFormat, Instruction, InterfaceSchema, Op, SourceInfo,
        CURRENT_FORMAT_VERSION,
    };
    use pretty_assertions::assert_eq;
    use snapsql_core::pos::Position;
    use snapsql_core::value::Value;
    use snapsql_core::IndexMap;

    use super::*;

    fn ir_with(instructions: Vec<Instruction>, cel_expressions: Vec<CelExpressionEntry>) -> IntermediateFormat {
        IntermediateFormat {
            format_version: CURRENT_FORMAT_VERSION,
            source: SourceInfo { file: None, content_hash: "0".to_string(), content: None },
            interface_schema: InterfaceSchema::default(),
            dependencies: Dependencies::default(),
            cel_expressions,
            instructions,
            response_affinity: None,
        }
    }

    /// Exercises the full `optimize -> evaluate` composition: whitespace
    /// normalization and adjacent-EMIT_STATIC merging happen once at
    /// `optimize` time and the evaluator still produces correct output.
    #[test]
    fn optimize_then_evaluate_round_trips_a_simple_template() {
        let ir = ir_with(
            vec![
                Instruction::new(Op::EmitStatic, Position::START).with_value("SELECT  "),
                Instruction::new(Op::EmitStatic, Position::START).with_value("id "),
                Instruction::new(Op::EmitStatic, Position::START).with_value("FROM users WHERE id = "),
                Instruction::new(Op::AddParam, Position::START).with_expr_index(0),
            ],
            vec![CelExpressionEntry { expression: "user_id".to_string(), result_type: None }],
        );
        let optimized = optimize(&ir, Dialect::PostgreSql);
        assert_eq!(optimized.instructions.len(), 2);

        let mut params = IndexMap::default();
        params.insert("user_id".to_string(), Value::Int(9));
        let out = evaluate(&optimized, Dialect::PostgreSql, &params, None).unwrap();
        assert_eq!(
            out,
            EvaluateOutput {
                sql: "SELECT id FROM users WHERE id = $1".to_string(),
                args: vec![Value::Int(9)],
                dangerous_query: false,
            }
        );
    }

    /// An already-optimized `IntermediateFormat` can be evaluated repeatedly
    /// with different parameters, producing the same SQL shape each time
    /// (§5 "optimize once, evaluate many").
    #[test]
    fn a_single_optimized_ir_serves_many_evaluate_calls() {
        let ir = ir_with(
            vec![
                Instruction::new(Op::EmitStatic, Position::START).with_value("SELECT 1 WHERE id = "),
                Instruction::new(Op::AddParam, Position::START).with_expr_index(0),
            ],
            vec![CelExpressionEntry { expression: "id".to_string(), result_type: None }],
        );
        let optimized = optimize(&ir, Dialect::MySql);

        for n in 0..3i64 {
            let mut params = IndexMap::default();
            params.insert("id".to_string(), Value::Int(n));
            let out = evaluate(&optimized, Dialect::MySql, &params, None).unwrap();
            assert_eq!(out.sql, "SELECT 1 WHERE id = ?");
            assert_eq!(out.args, vec![Value::Int(n)]);
        }
    }
}
