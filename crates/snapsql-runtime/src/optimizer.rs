//! C6 optimizer passes (§4.6 "Optimizer"), run once per compiled template
//! and then reused across any number of `evaluate` calls.
//!
//! Three of the four transformations the spec lists are implemented here as
//! static instruction-sequence rewrites:
//!
//! 1. constant folding — `Const` directives are already resolved at
//!    lower-time (`snapsql-compiler::lowerer`), against the constants the
//!    caller supplied to `compile()`; there is no expression left at this
//!    point that references "only module-level constants", so this reduces
//!    to merging adjacent `EMIT_STATIC` instructions.
//! 2. whitespace normalization inside `EMIT_STATIC` text.
//! 3. static boundary resolution, collapsing an `EMIT_UNLESS_BOUNDARY` /
//!    `BOUNDARY` pair that sits in a straight-line run with no control
//!    instruction between them.
//!
//! The fourth — placeholder rewrite (`?` to `$1, $2, ...`) — is NOT done
//! here. Evaluation order through loops and conditionals can't be known
//! until parameters are bound, so it runs as a post-pass over the rendered
//! SQL string inside `evaluator::evaluate` instead.

use itertools::Itertools;
use snapsql_core::ir::{IntermediateFormat, Instruction, Op};

use crate::dialect::Dialect;

pub fn optimize(ir: &IntermediateFormat, dialect: Dialect) -> IntermediateFormat {
    log::debug!("optimize: {} instruction(s), dialect {dialect:?}", ir.instructions.len());
    let mut instructions = merge_adjacent_static(ir.instructions.clone());
    normalize_whitespace(&mut instructions);
    resolve_static_boundaries(&mut instructions);
    log::trace!("optimize: {} instruction(s) after folding", instructions.len());

    let mut out = ir.clone();
    out.instructions = instructions;
    out
}

fn merge_adjacent_static(instructions: Vec<Instruction>) -> Vec<Instruction> {
    instructions
        .into_iter()
        .coalesce(|a, b| {
            if a.op == Op::EmitStatic && b.op == Op::EmitStatic {
                let mut merged = a;
                let text = format!("{}{}", merged.value.as_deref().unwrap_or(""), b.value.as_deref().unwrap_or(""));
                merged.value = Some(text);
                Ok(merged)
            } else {
                Err((a, b))
            }
        })
        .collect()
}

/// Collapses runs of ASCII horizontal whitespace to a single space inside
/// `EMIT_STATIC` text, leaving newlines and the contents of quoted string /
/// identifier literals untouched.
fn normalize_whitespace(instructions: &mut [Instruction]) {
    for instr in instructions.iter_mut() {
        if instr.op != Op::EmitStatic {
            continue;
        }
        if let Some(text) = &instr.value {
            instr.value = Some(normalize_text(text));
        }
    }
}

fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut chars = text.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        if c == '\'' || c == '"' {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            quote = Some(c);
            out.push(c);
            continue;
        }
        if c == '\n' {
            if pending_space {
                pending_space = false;
            }
            out.push(c);
            continue;
        }
        if c == ' ' || c == '\t' || c == '\r' {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }
    if pending_space {
        out.push(' ');
    }
    out
}

/// §4.6 item 4: resolves an `EMIT_UNLESS_BOUNDARY`/`BOUNDARY` pair that sits
/// in a straight-line run — no `If`/`ElIf`/`Else`/`EndIf`/`LoopStart`/
/// `LoopEnd` between them — into a plain `EMIT_STATIC`, since in that case
/// the deferred text's fate is already known statically: it always has
/// content after it (otherwise the run would have contained a control
/// instruction feeding the decision). This essentially never fires on the
/// lowerer's own output, since every synthesized `EMIT_UNLESS_BOUNDARY`
/// there is paired with its `BOUNDARY` across a control instruction by
/// construction — it exists for IR built some other way.
fn resolve_static_boundaries(instructions: &mut Vec<Instruction>) {
    let is_control = |op: Op| {
        matches!(op, Op::If | Op::ElIf | Op::Else | Op::EndIf | Op::LoopStart | Op::LoopEnd)
    };

    let mut out = Vec::with_capacity(instructions.len());
    let mut i = 0;
    while i < instructions.len() {
        let instr = &instructions[i];
        if instr.op == Op::EmitUnlessBoundary {
            let mut j = i + 1;
            let mut hit_control = false;
            let mut hit_boundary = false;
            while j < instructions.len() {
                match instructions[j].op {
                    Op::Boundary => {
                        hit_boundary = true;
                        break;
                    }
                    op if is_control(op) => {
                        hit_control = true;
                        break;
                    }
                    _ => j += 1,
                }
            }
            if hit_boundary && !hit_control {
                // Between the deferred text and its boundary there is at
                // least one more instruction (otherwise it would have
                // resolved to nothing) — safe to promote to EMIT_STATIC and
                // drop the BOUNDARY marker.
                let mut resolved = instr.clone();
                resolved.op = Op::EmitStatic;
                out.push(resolved);
                for k in (i + 1)..j {
                    out.push(instructions[k].clone());
                }
                i = j + 1;
                continue;
            }
        }
        out.push(instr.clone());
        i += 1;
    }
    *instructions = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapsql_core::pos::Position;

    fn pos() -> Position {
        Position::START
    }

    fn ir_with(instructions: Vec<Instruction>) -> IntermediateFormat {
        IntermediateFormat {
            format_version: snapsql_core::ir::CURRENT_FORMAT_VERSION,
            source: snapsql_core::ir::SourceInfo { file: None, content_hash: "0".to_string(), content: None },
            interface_schema: Default::default(),
            dependencies: Default::default(),
            cel_expressions: Vec::new(),
            instructions,
            response_affinity: None,
        }
    }

    #[test]
    fn merges_adjacent_emit_static() {
        let ir = ir_with(vec![
            Instruction::new(Op::EmitStatic, pos()).with_value("SELECT "),
            Instruction::new(Op::EmitStatic, pos()).with_value("* "),
            Instruction::new(Op::EmitStatic, pos()).with_value("FROM t"),
        ]);
        let out = optimize(&ir, Dialect::PostgreSql);
        assert_eq!(out.instructions.len(), 1);
        assert_eq!(out.instructions[0].value.as_deref(), Some("SELECT * FROM t"));
    }

    #[test]
    fn collapses_horizontal_whitespace_but_keeps_newlines() {
        let ir = ir_with(vec![Instruction::new(Op::EmitStatic, pos()).with_value("SELECT   id\nFROM    t")]);
        let out = optimize(&ir, Dialect::PostgreSql);
        assert_eq!(out.instructions[0].value.as_deref(), Some("SELECT id\nFROM t"));
    }

    #[test]
    fn does_not_touch_whitespace_inside_quoted_strings() {
        let ir = ir_with(vec![Instruction::new(Op::EmitStatic, pos()).with_value("WHERE name = 'a  b'")]);
        let out = optimize(&ir, Dialect::PostgreSql);
        assert_eq!(out.instructions[0].value.as_deref(), Some("WHERE name = 'a  b'"));
    }

    #[test]
    fn resolves_boundary_in_a_straight_line_run() {
        let ir = ir_with(vec![
            Instruction::new(Op::EmitUnlessBoundary, pos()).with_value(", "),
            Instruction::new(Op::EmitStatic, pos()).with_value("x"),
            Instruction::new(Op::Boundary, pos()),
        ]);
        let out = optimize(&ir, Dialect::PostgreSql);
        assert!(out.instructions.iter().all(|i| i.op != Op::EmitUnlessBoundary && i.op != Op::Boundary));
        assert_eq!(out.instructions.len(), 2);
        assert_eq!(out.instructions[0].value.as_deref(), Some(", "));
    }

    #[test]
    fn does_not_resolve_across_a_control_instruction() {
        let ir = ir_with(vec![
            Instruction::new(Op::EmitUnlessBoundary, pos()).with_value("WHERE "),
            Instruction::new(Op::If, pos()).with_expr_index(0),
            Instruction::new(Op::EmitStatic, pos()).with_value("x = 1"),
            Instruction::new(Op::EndIf, pos()),
            Instruction::new(Op::Boundary, pos()),
        ]);
        let out = optimize(&ir, Dialect::PostgreSql);
        assert!(out.instructions.iter().any(|i| i.op == Op::EmitUnlessBoundary));
        assert!(out.instructions.iter().any(|i| i.op == Op::Boundary));
    }
}
