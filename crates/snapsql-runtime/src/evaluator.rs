//! C6 evaluator (§4.6 "Evaluator", state diagram `INIT -> READY -> EMIT ->
//! DONE/FAILED`). `evaluate` walks an (optimized) [`IntermediateFormat`]
//! once per call, binding `parameters` and producing a ready-to-execute SQL
//! string plus its positional argument vector.
//!
//! The boundary mechanism (`EMIT_UNLESS_BOUNDARY` / `BOUNDARY`) is carried
//! here as a single pending-text buffer: real content (`EMIT_STATIC`,
//! `ADD_PARAM`, `EMIT_EVAL`) flushes whatever is pending before it runs;
//! `BOUNDARY` discards it unflushed. That single rule is what makes a loop
//! with zero iterations, or a conditional whose branch wasn't taken,
//! disappear — deferred prefix and all — with no special-casing at the call
//! site.

use std::collections::HashMap;

use snapsql_core::errors::ErrorPosition;
use snapsql_core::ir::{CelExpressionEntry, IntermediateFormat, Instruction, Op};
use snapsql_core::types::TypeSpec;
use snapsql_core::value::Value;
use snapsql_core::IndexMap;

use crate::cel;
use crate::dialect::Dialect;
use crate::errors::EvaluationError;

/// Result of one `evaluate` call: a dialect-ready SQL string, its positional
/// arguments in placeholder order, and the dangerous-query advisory (§4.6
/// "Dangerous query detection").
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluateOutput {
    pub sql: String,
    pub args: Vec<Value>,
    pub dangerous_query: bool,
}

pub fn evaluate(
    ir: &IntermediateFormat,
    dialect: Dialect,
    parameters: &IndexMap<String, Value>,
    cancel: Option<&dyn Fn() -> bool>,
) -> Result<EvaluateOutput, EvaluationError> {
    log::debug!("evaluate: {} instruction(s), {} parameter(s), dialect {dialect:?}", ir.instructions.len(), parameters.len());
    validate_required_parameters(ir, parameters)?;

    let mut evaluator = Evaluator {
        params: parameters,
        scope: Vec::new(),
        sql: String::new(),
        pending: String::new(),
        args: Vec::new(),
        cel_cache: HashMap::new(),
        cancel,
    };

    evaluator.exec(&ir.instructions, &ir.cel_expressions, 0, ir.instructions.len())?;
    evaluator.flush_pending();

    let dangerous_query = is_dangerous_query(&evaluator.sql);
    if dangerous_query {
        log::warn!("evaluate: dangerous query advisory triggered (DELETE/UPDATE with no top-level WHERE)");
    }
    let sql = match dialect {
        Dialect::PostgreSql => rewrite_postgres_placeholders(&evaluator.sql),
        Dialect::MySql | Dialect::Sqlite => evaluator.sql,
    };
    log::trace!("evaluate: produced {} byte(s) of SQL, {} argument(s)", sql.len(), evaluator.args.len());

    Ok(EvaluateOutput { sql, args: evaluator.args, dangerous_query })
}

fn validate_required_parameters(
    ir: &IntermediateFormat,
    parameters: &IndexMap<String, Value>,
) -> Result<(), EvaluationError> {
    for (name, type_spec) in &ir.interface_schema.parameters {
        if matches!(type_spec, TypeSpec::Nullable(_)) {
            continue;
        }
        let missing = parameters.get(name).is_none_or(Value::is_null);
        if missing {
            return Err(EvaluationError::MissingRequiredParameter { name: name.clone(), type_spec: type_spec.clone() });
        }
    }
    Ok(())
}

struct Evaluator<'p> {
    params: &'p IndexMap<String, Value>,
    /// Innermost-last loop variable bindings, consulted before `params`.
    scope: Vec<(String, Value)>,
    sql: String,
    pending: String,
    args: Vec<Value>,
    cel_cache: HashMap<usize, cel::Program>,
    cancel: Option<&'p dyn Fn() -> bool>,
}

impl Evaluator<'_> {
    fn check_cancel(&self) -> Result<(), EvaluationError> {
        if let Some(cancel) = self.cancel {
            if cancel() {
                return Err(EvaluationError::Cancelled);
            }
        }
        Ok(())
    }

    fn flush_pending(&mut self) {
        if !self.pending.is_empty() {
            self.sql.push_str(&self.pending);
            self.pending.clear();
        }
    }

    fn exec(
        &mut self,
        instrs: &[Instruction],
        pool: &[CelExpressionEntry],
        start: usize,
        end: usize,
    ) -> Result<(), EvaluationError> {
        let mut i = start;
        while i < end {
            self.check_cancel()?;
            let instr = &instrs[i];
            match instr.op {
                Op::EmitStatic => {
                    self.flush_pending();
                    self.sql.push_str(instr.value.as_deref().unwrap_or(""));
                    i += 1;
                }
                Op::EmitUnlessBoundary => {
                    self.pending.push_str(instr.value.as_deref().unwrap_or(""));
                    i += 1;
                }
                Op::Boundary => {
                    self.pending.clear();
                    i += 1;
                }
                Op::AddParam => {
                    self.flush_pending();
                    let expr_index = instr
                        .expr_index
                        .ok_or(EvaluationError::UnknownExpressionIndex { instruction_index: i, expr_index: 0 })?;
                    let value = self.eval_expr(pool, expr_index, instr.pos)?;
                    self.sql.push('?');
                    self.args.push(value);
                    i += 1;
                }
                Op::EmitEval => {
                    self.flush_pending();
                    let expr_index = instr
                        .expr_index
                        .ok_or(EvaluationError::UnknownExpressionIndex { instruction_index: i, expr_index: 0 })?;
                    let value = self.eval_expr(pool, expr_index, instr.pos)?;
                    self.sql.push_str(&render_inline(&value));
                    i += 1;
                }
                Op::If => {
                    i = self.exec_conditional(instrs, pool, i)?;
                }
                Op::LoopStart => {
                    i = self.exec_loop(instrs, pool, i)?;
                }
                Op::ElIf | Op::Else | Op::EndIf | Op::LoopEnd => {
                    return Err(EvaluationError::UnbalancedFrameStack { instruction_index: i });
                }
            }
        }
        Ok(())
    }

    fn exec_conditional(
        &mut self,
        instrs: &[Instruction],
        pool: &[CelExpressionEntry],
        if_idx: usize,
    ) -> Result<usize, EvaluationError> {
        let end_if_idx = matching_closer(instrs, if_idx);
        let headers = collect_branch_headers(instrs, if_idx, end_if_idx);

        for (k, &h) in headers.iter().enumerate() {
            let body_start = h + 1;
            let body_end = headers.get(k + 1).copied().unwrap_or(end_if_idx);
            let taken = match instrs[h].op {
                Op::If | Op::ElIf => {
                    let expr_index = instrs[h]
                        .expr_index
                        .ok_or(EvaluationError::UnknownExpressionIndex { instruction_index: h, expr_index: 0 })?;
                    self.eval_expr(pool, expr_index, instrs[h].pos)?.to_bool()
                }
                Op::Else => true,
                _ => unreachable!("collect_branch_headers only returns If/ElIf/Else"),
            };
            if taken {
                self.exec(instrs, pool, body_start, body_end)?;
                break;
            }
        }
        Ok(end_if_idx + 1)
    }

    fn exec_loop(
        &mut self,
        instrs: &[Instruction],
        pool: &[CelExpressionEntry],
        loop_start_idx: usize,
    ) -> Result<usize, EvaluationError> {
        let loop_end_idx = matching_closer(instrs, loop_start_idx);
        let instr = &instrs[loop_start_idx];
        let expr_index = instr
            .expr_index
            .ok_or(EvaluationError::UnknownExpressionIndex { instruction_index: loop_start_idx, expr_index: 0 })?;
        let var_name = instr.name.clone().unwrap_or_default();

        let iterable = self.eval_expr(pool, expr_index, instr.pos)?;
        let items = match iterable {
            Value::Array(items) => items,
            other => {
                return Err(EvaluationError::NonIterableLoopArgument {
                    expr: pool[expr_index].expression.clone(),
                    found_type: other.type_name(),
                    at: pos_from_triple(instr.pos),
                })
            }
        };

        let body_start = loop_start_idx + 1;
        for item in items {
            self.check_cancel()?;
            self.scope.push((var_name.clone(), item));
            let result = self.exec(instrs, pool, body_start, loop_end_idx);
            self.scope.pop();
            result?;
        }
        Ok(loop_end_idx + 1)
    }

    fn eval_expr(&mut self, pool: &[CelExpressionEntry], expr_index: usize, pos: [i64; 3]) -> Result<Value, EvaluationError> {
        let expr_text = pool[expr_index].expression.trim().to_string();
        if let Some(name) = bare_identifier(&expr_text) {
            return Ok(self.resolve_ident(name));
        }
        if !self.cel_cache.contains_key(&expr_index) {
            let program = cel::compile(&expr_text).map_err(|e| EvaluationError::CelCompileError {
                expr: expr_text.clone(),
                reason: e.0,
                at: pos_from_triple(pos),
            })?;
            self.cel_cache.insert(expr_index, program);
        }
        let program = self.cel_cache.get(&expr_index).expect("inserted just above");
        let env = cel::Env { params: self.params, scope: &self.scope };
        program
            .eval(&env)
            .map_err(|e| EvaluationError::CelRuntimeError { expr: expr_text, reason: e.0, at: pos_from_triple(pos) })
    }

    fn resolve_ident(&self, name: &str) -> Value {
        for (bound_name, value) in self.scope.iter().rev() {
            if bound_name == name {
                return value.clone();
            }
        }
        self.params.get(name).cloned().unwrap_or(Value::Null)
    }
}

fn bare_identifier(s: &str) -> Option<&str> {
    let mut chars = s.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if first_ok && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some(s)
    } else {
        None
    }
}

fn pos_from_triple(pos: [i64; 3]) -> ErrorPosition {
    ErrorPosition { line: pos[0].max(0) as u32, column: pos[1].max(0) as u32, byte: pos[2].max(0) as usize }
}

fn render_inline(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => s.clone(),
        Value::Bytes(b) => format!("0x{}", b.iter().map(|byte| format!("{byte:02x}")).collect::<String>()),
        Value::Array(_) | Value::Map(_) => String::new(),
    }
}

/// Finds the `END_IF`/`LOOP_END` that matches the `If`/`LoopStart` at
/// `opener_idx`, treating both openers and both closers as depth markers —
/// the same rule `IntermediateFormat::validate` uses.
fn matching_closer(instrs: &[Instruction], opener_idx: usize) -> usize {
    let mut depth = 0i32;
    let mut i = opener_idx;
    loop {
        match instrs[i].op {
            Op::If | Op::LoopStart => depth += 1,
            Op::EndIf | Op::LoopEnd => {
                depth -= 1;
                if depth == 0 {
                    return i;
                }
            }
            _ => {}
        }
        i += 1;
    }
}

/// `If`/`ElIf`/`Else` header indices at the conditional's own nesting depth,
/// in source order, `if_idx` included.
fn collect_branch_headers(instrs: &[Instruction], if_idx: usize, end_if_idx: usize) -> Vec<usize> {
    let mut headers = vec![if_idx];
    let mut depth = 0i32;
    let mut i = if_idx + 1;
    while i < end_if_idx {
        match instrs[i].op {
            Op::If | Op::LoopStart => depth += 1,
            Op::EndIf | Op::LoopEnd => depth -= 1,
            Op::ElIf | Op::Else if depth == 0 => headers.push(i),
            _ => {}
        }
        i += 1;
    }
    headers
}

/// §4.6 "Dangerous query detection": a top-level `DELETE`/`UPDATE` (outside
/// any parentheses, so not a subquery) with no top-level `WHERE` anywhere
/// after it. Deliberately does not attempt to understand subquery-qualified
/// forms (§9 Q3).
fn is_dangerous_query(sql: &str) -> bool {
    let lower = sql.to_ascii_lowercase();
    let trimmed = lower.trim_start();
    if !(starts_with_word(trimmed, "delete") || starts_with_word(trimmed, "update")) {
        return false;
    }

    let bytes = lower.as_bytes();
    let mut depth: i32 = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {}
        }
        if depth == 0 && lower[i..].starts_with("where") {
            let before_ok = i == 0 || !is_ident_byte(bytes[i - 1]);
            let after_ok = bytes.get(i + 5).is_none_or(|b| !is_ident_byte(*b));
            if before_ok && after_ok {
                return false;
            }
        }
        i += 1;
    }
    true
}

fn is_ident_byte(b: u8) -> bool {
    (b as char).is_ascii_alphanumeric() || b == b'_'
}

fn starts_with_word(haystack: &str, word: &str) -> bool {
    haystack.starts_with(word) && haystack.as_bytes().get(word.len()).is_none_or(|b| !is_ident_byte(*b))
}

fn rewrite_postgres_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut n = 0u32;
    for c in sql.chars() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '?' => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapsql_core::ir::{CURRENT_FORMAT_VERSION, Dependencies, InterfaceSchema, SourceInfo};
    use snapsql_core::pos::Position;

    fn pos() -> Position {
        Position::START
    }

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

    fn expr(text: &str) -> CelExpressionEntry {
        CelExpressionEntry { expression: text.to_string(), result_type: None }
    }

    #[test]
    fn static_text_and_add_param_render_with_placeholder() {
        let ir = ir_with(
            vec![
                Instruction::new(Op::EmitStatic, pos()).with_value("SELECT id FROM users WHERE id = "),
                Instruction::new(Op::AddParam, pos()).with_expr_index(0),
            ],
            vec![expr("user_id")],
        );
        let mut params = IndexMap::default();
        params.insert("user_id".to_string(), Value::Int(7));
        let out = evaluate(&ir, Dialect::MySql, &params, None).unwrap();
        assert_eq!(out.sql, "SELECT id FROM users WHERE id = ?");
        assert_eq!(out.args, vec![Value::Int(7)]);
    }

    #[test]
    fn postgres_dialect_rewrites_placeholders_in_order() {
        let ir = ir_with(
            vec![
                Instruction::new(Op::EmitStatic, pos()).with_value("WHERE a = "),
                Instruction::new(Op::AddParam, pos()).with_expr_index(0),
                Instruction::new(Op::EmitStatic, pos()).with_value(" AND b = "),
                Instruction::new(Op::AddParam, pos()).with_expr_index(1),
            ],
            vec![expr("a"), expr("b")],
        );
        let mut params = IndexMap::default();
        params.insert("a".to_string(), Value::Int(1));
        params.insert("b".to_string(), Value::Int(2));
        let out = evaluate(&ir, Dialect::PostgreSql, &params, None).unwrap();
        assert_eq!(out.sql, "WHERE a = $1 AND b = $2");
    }

    #[test]
    fn conditional_branch_not_taken_elides_deferred_prefix() {
        let ir = ir_with(
            vec![
                Instruction::new(Op::EmitUnlessBoundary, pos()).with_value("WHERE "),
                Instruction::new(Op::If, pos()).with_expr_index(0),
                Instruction::new(Op::EmitStatic, pos()).with_value("x = 1"),
                Instruction::new(Op::EndIf, pos()),
                Instruction::new(Op::Boundary, pos()),
            ],
            vec![expr("show_filter")],
        );
        let params = IndexMap::default();
        let out = evaluate(&ir, Dialect::MySql, &params, None).unwrap();
        assert_eq!(out.sql, "");
    }

    #[test]
    fn conditional_branch_taken_flushes_deferred_prefix() {
        let ir = ir_with(
            vec![
                Instruction::new(Op::EmitUnlessBoundary, pos()).with_value("WHERE "),
                Instruction::new(Op::If, pos()).with_expr_index(0),
                Instruction::new(Op::EmitStatic, pos()).with_value("x = 1"),
                Instruction::new(Op::EndIf, pos()),
                Instruction::new(Op::Boundary, pos()),
            ],
            vec![expr("show_filter")],
        );
        let mut params = IndexMap::default();
        params.insert("show_filter".to_string(), Value::Bool(true));
        let out = evaluate(&ir, Dialect::MySql, &params, None).unwrap();
        assert_eq!(out.sql, "WHERE x = 1");
    }

    #[test]
    fn loop_emits_comma_separated_values_with_no_trailing_separator() {
        let ir = ir_with(
            vec![
                Instruction::new(Op::LoopStart, pos()).with_expr_index(0).with_name("v"),
                Instruction::new(Op::EmitStatic, pos()).with_value("("),
                Instruction::new(Op::AddParam, pos()).with_expr_index(1),
                Instruction::new(Op::EmitStatic, pos()).with_value(")"),
                Instruction::new(Op::EmitUnlessBoundary, pos()).with_value(", "),
                Instruction::new(Op::LoopEnd, pos()),
                Instruction::new(Op::Boundary, pos()),
            ],
            vec![expr("items"), expr("v")],
        );
        let mut params = IndexMap::default();
        params.insert("items".to_string(), Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
        let out = evaluate(&ir, Dialect::MySql, &params, None).unwrap();
        assert_eq!(out.sql, "(?), (?), (?)");
        assert_eq!(out.args, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn empty_loop_elides_its_own_deferred_prefix_entirely() {
        let ir = ir_with(
            vec![
                Instruction::new(Op::EmitUnlessBoundary, pos()).with_value(" AND id IN ("),
                Instruction::new(Op::LoopStart, pos()).with_expr_index(0).with_name("v"),
                Instruction::new(Op::AddParam, pos()).with_expr_index(1),
                Instruction::new(Op::EmitUnlessBoundary, pos()).with_value(", "),
                Instruction::new(Op::LoopEnd, pos()),
                Instruction::new(Op::Boundary, pos()),
            ],
            vec![expr("items"), expr("v")],
        );
        let mut params = IndexMap::default();
        params.insert("items".to_string(), Value::Array(vec![]));
        let out = evaluate(&ir, Dialect::MySql, &params, None).unwrap();
        assert_eq!(out.sql, "");
    }

    #[test]
    fn missing_required_parameter_is_reported_with_name_and_type() {
        use snapsql_core::types::PrimitiveType;

        let mut ir = ir_with(vec![], vec![]);
        ir.interface_schema.parameters.insert("pid".to_string(), TypeSpec::Primitive(PrimitiveType::Int));
        let params = IndexMap::default();
        let err = evaluate(&ir, Dialect::MySql, &params, None).unwrap_err();
        assert!(err.to_string().contains("pid (int)"));
    }

    #[test]
    fn non_iterable_loop_argument_is_an_error() {
        let ir = ir_with(
            vec![Instruction::new(Op::LoopStart, pos()).with_expr_index(0).with_name("v")],
            vec![expr("items")],
        );
        let mut params = IndexMap::default();
        params.insert("items".to_string(), Value::Int(1));
        let err = evaluate(&ir, Dialect::MySql, &params, None).unwrap_err();
        assert!(matches!(err, EvaluationError::NonIterableLoopArgument { .. }));
    }

    #[test]
    fn delete_without_top_level_where_is_flagged_dangerous() {
        let ir = ir_with(vec![Instruction::new(Op::EmitStatic, pos()).with_value("DELETE FROM users")], vec![]);
        let params = IndexMap::default();
        let out = evaluate(&ir, Dialect::MySql, &params, None).unwrap();
        assert!(out.dangerous_query);
    }

    #[test]
    fn delete_with_top_level_where_is_not_flagged() {
        let ir = ir_with(
            vec![Instruction::new(Op::EmitStatic, pos()).with_value("DELETE FROM users WHERE id = 1")],
            vec![],
        );
        let params = IndexMap::default();
        let out = evaluate(&ir, Dialect::MySql, &params, None).unwrap();
        assert!(!out.dangerous_query);
    }

    #[test]
    fn cancellation_is_observed_before_each_instruction() {
        let ir = ir_with(vec![Instruction::new(Op::EmitStatic, pos()).with_value("SELECT 1")], vec![]);
        let params = IndexMap::default();
        let cancel: &dyn Fn() -> bool = &|| true;
        let err = evaluate(&ir, Dialect::MySql, &params, Some(cancel)).unwrap_err();
        assert!(matches!(err, EvaluationError::Cancelled));
    }
}
