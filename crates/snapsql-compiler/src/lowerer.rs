//! C5: lowers the AST into the flat instruction sequence and CEL-expression
//! pool that make up an [`IntermediateFormat`] (§5 "Scheduling model").
//!
//! Two boundary rules fall out of the template semantics and are applied
//! uniformly here rather than being derived from what the source text
//! happens to contain:
//!
//! - Every `for` loop synthesizes an `EMIT_UNLESS_BOUNDARY(", ")` as the
//!   last instruction of its body, and a `BOUNDARY` right after `LOOP_END`.
//!   That is what turns N iterations into `(v1), (v2), (v3)` with no
//!   trailing separator, for any N including zero, without the template
//!   author writing a comma anywhere.
//! - A conditional or loop carrying a `deferred_prefix` (a clause keyword
//!   or list separator the parser folded into it, see `ast::DeferredPrefix`)
//!   emits that prefix through the same `EMIT_UNLESS_BOUNDARY` mechanism,
//!   with a `BOUNDARY` placed after `END_IF`/`LOOP_END` so the whole header
//!   disappears along with the body when the body contributes nothing.
//!
//! Real CEL parsing is deliberately out of scope here: expressions are
//! pooled as opaque text and compiled lazily by the runtime evaluator. The
//! one exception is `Const` directives, which are plain compile-time
//! lookups against `CompileOptions::constants` and get folded straight into
//! `EMIT_STATIC`/`EMIT_EVAL` rather than surviving into the instruction
//! stream as an expression reference.

use snapsql_core::ast::{Annotations, Clause, Conditional, Loop, Node, Program};
use snapsql_core::ir::{
    CelExpressionEntry, Dependencies, IntermediateFormat, Instruction, InterfaceSchema, Op, SourceInfo,
    CURRENT_FORMAT_VERSION,
};
use snapsql_core::value::Value;
use snapsql_core::IndexSet;

use crate::errors::ResolveError;
use crate::resolver::Resolved;
use crate::{CompileError, CompileOptions};

pub fn lower(
    source: &str,
    program: &Program,
    resolved: &Resolved,
    metadata: &Option<crate::lexer::MetadataBlock>,
    options: &CompileOptions,
) -> Result<IntermediateFormat, CompileError> {
    let mut ctx = Context::new(options);

    let mut instructions = Vec::new();
    ctx.lower_nodes(&program.root, &mut instructions)?;

    let interface_schema = ctx.build_interface_schema(&resolved.annotations, metadata, &resolved.response_fields)?;

    let dependencies = Dependencies {
        cache_key_template: ctx.all_variables.iter().cloned().collect::<Vec<_>>().join(":"),
        all_variables: ctx.all_variables.into_iter().collect(),
        structural_variables: ctx.structural_variables.into_iter().collect(),
        parameter_variables: ctx.parameter_variables.into_iter().collect(),
    };

    let source_info = SourceInfo {
        file: options.file_name.clone(),
        content_hash: content_hash(source),
        content: Some(source.to_string()),
    };

    Ok(IntermediateFormat {
        format_version: CURRENT_FORMAT_VERSION,
        source: source_info,
        interface_schema,
        dependencies,
        cel_expressions: ctx.pool,
        instructions,
        response_affinity: None,
    })
}

/// FNV-1a: stable across platforms and builds, which is all `content_hash`
/// needs — it keys cache invalidation, not anything cryptographic.
fn content_hash(source: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in source.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}

/// First identifier-shaped run in a CEL expression, used as a coarse
/// dependency name. Full identifier extraction belongs to the runtime's CEL
/// parser; this is only precise enough to drive cache-key composition.
fn leading_identifier(expr: &str) -> String {
    let trimmed = expr.trim();
    let ident_end = trimmed
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_alphanumeric() || *c == '_' || (*i == 0 && *c == '_'))
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    if ident_end == 0 {
        trimmed.to_string()
    } else {
        trimmed[..ident_end].to_string()
    }
}

struct Context<'a> {
    options: &'a CompileOptions,
    pool: Vec<CelExpressionEntry>,
    expr_index: std::collections::HashMap<String, usize>,
    all_variables: IndexSet<String>,
    structural_variables: IndexSet<String>,
    parameter_variables: IndexSet<String>,
}

impl<'a> Context<'a> {
    fn new(options: &'a CompileOptions) -> Self {
        Self {
            options,
            pool: Vec::new(),
            expr_index: std::collections::HashMap::new(),
            all_variables: IndexSet::default(),
            structural_variables: IndexSet::default(),
            parameter_variables: IndexSet::default(),
        }
    }

    fn push_expr(&mut self, expr: &str) -> usize {
        if let Some(&idx) = self.expr_index.get(expr) {
            return idx;
        }
        let idx = self.pool.len();
        self.pool.push(CelExpressionEntry { expression: expr.to_string(), result_type: None });
        self.expr_index.insert(expr.to_string(), idx);
        idx
    }

    fn track(&mut self, expr: &str, structural: bool) {
        let name = leading_identifier(expr);
        if name.is_empty() {
            return;
        }
        self.all_variables.insert(name.clone());
        if structural {
            self.structural_variables.insert(name);
        } else {
            self.parameter_variables.insert(name);
        }
    }

    fn lower_nodes(&mut self, nodes: &[Node], out: &mut Vec<Instruction>) -> Result<(), CompileError> {
        for node in nodes {
            self.lower_node(node, out)?;
        }
        Ok(())
    }

    fn lower_node(&mut self, node: &Node, out: &mut Vec<Instruction>) -> Result<(), CompileError> {
        match node {
            Node::Text { text, span } => {
                if !text.is_empty() {
                    out.push(Instruction::new(Op::EmitStatic, span.start).with_value(text.clone()));
                }
            }
            Node::ColumnRef { raw, span, .. } | Node::TableRef { raw, span, .. } => {
                out.push(Instruction::new(Op::EmitStatic, span.start).with_value(raw.clone()));
            }
            Node::ListSeparator { span } => {
                out.push(Instruction::new(Op::EmitStatic, span.start).with_value(", "));
            }
            Node::Conditional(c) => self.lower_conditional(c, out)?,
            Node::Loop(l) => self.lower_loop(l, out)?,
            Node::ParamExpr { expr, expr_span, .. } => {
                self.track(expr, false);
                let idx = self.push_expr(expr);
                out.push(Instruction::new(Op::AddParam, expr_span.start).with_expr_index(idx));
            }
            Node::IdentEval { expr, expr_span, .. } => {
                self.track(expr, false);
                let idx = self.push_expr(expr);
                out.push(Instruction::new(Op::EmitEval, expr_span.start).with_expr_index(idx));
            }
            Node::ConstEval { expr, expr_span } => {
                self.lower_const(expr, *expr_span, out)?;
            }
            Node::Clause(clause) => self.lower_clause(clause, out)?,
        }
        Ok(())
    }

    fn lower_const(&mut self, expr: &str, expr_span: snapsql_core::pos::Span, out: &mut Vec<Instruction>) -> Result<(), CompileError> {
        let name = expr.trim();
        let value = self.options.constants.get(name).ok_or_else(|| {
            CompileError::Resolve(ResolveError::UndefinedConstant { name: name.to_string(), at: expr_span.start.into() })
        })?;
        out.push(Instruction::new(Op::EmitStatic, expr_span.start).with_value(render_constant(value)));
        Ok(())
    }

    fn lower_clause(&mut self, clause: &Clause, out: &mut Vec<Instruction>) -> Result<(), CompileError> {
        if !clause.keyword_folded {
            let text = format!("{} ", crate::parser::keyword_text(clause.kind));
            out.push(Instruction::new(Op::EmitStatic, clause.keyword_span.start).with_value(text));
        }
        self.lower_nodes(&clause.body, out)
    }

    fn lower_conditional(&mut self, c: &Conditional, out: &mut Vec<Instruction>) -> Result<(), CompileError> {
        let has_prefix = c.deferred_prefix.is_some();
        if let Some(prefix) = &c.deferred_prefix {
            out.push(Instruction::new(Op::EmitUnlessBoundary, prefix.span.start).with_value(prefix.text.clone()));
        }

        let first = &c.branches[0];
        self.track(&first.expr, true);
        let idx = self.push_expr(&first.expr);
        out.push(Instruction::new(Op::If, c.span.start).with_expr_index(idx));
        self.lower_nodes(&first.body, out)?;

        for branch in &c.branches[1..] {
            self.track(&branch.expr, true);
            let idx = self.push_expr(&branch.expr);
            out.push(Instruction::new(Op::ElIf, branch.expr_span.start).with_expr_index(idx));
            self.lower_nodes(&branch.body, out)?;
        }

        if let Some(else_body) = &c.else_branch {
            out.push(Instruction::new(Op::Else, c.span.start));
            self.lower_nodes(else_body, out)?;
        }

        out.push(Instruction::new(Op::EndIf, c.span.start));
        if has_prefix {
            out.push(Instruction::new(Op::Boundary, c.span.start));
        }
        Ok(())
    }

    fn lower_loop(&mut self, l: &Loop, out: &mut Vec<Instruction>) -> Result<(), CompileError> {
        if let Some(prefix) = &l.deferred_prefix {
            out.push(Instruction::new(Op::EmitUnlessBoundary, prefix.span.start).with_value(prefix.text.clone()));
        }

        self.track(&l.iterable_expr, true);
        let idx = self.push_expr(&l.iterable_expr);
        out.push(Instruction::new(Op::LoopStart, l.span.start).with_expr_index(idx).with_name(l.var_name.clone()));

        self.lower_nodes(&l.body, out)?;
        // Synthesized for every loop regardless of template text: this is
        // what elides the trailing separator after the last iteration (and
        // the whole thing, leading prefix included, when there are none).
        out.push(Instruction::new(Op::EmitUnlessBoundary, l.span.start).with_value(", "));
        out.push(Instruction::new(Op::LoopEnd, l.span.start));
        out.push(Instruction::new(Op::Boundary, l.span.start));
        Ok(())
    }

    fn build_interface_schema(
        &self,
        annotations: &Annotations,
        metadata: &Option<crate::lexer::MetadataBlock>,
        response_fields: &[snapsql_core::ir::ResponseField],
    ) -> Result<InterfaceSchema, CompileError> {
        let mut name = None;
        let mut function_name = None;
        let mut parameters = indexmap::IndexMap::new();

        if let Some(block) = metadata {
            let doc: serde_yaml::Value = serde_yaml::from_str(&block.raw_yaml)
                .map_err(|e| CompileError::Resolve(ResolveError::InvalidMetadata { reason: e.to_string() }))?;
            if let Some(mapping) = doc.as_mapping() {
                name = mapping
                    .get(serde_yaml::Value::String("name".to_string()))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                function_name = mapping
                    .get(serde_yaml::Value::String("function_name".to_string()))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
            }
            parameters = crate::resolver::parse_parameters_yaml(&block.raw_yaml)?;
        }

        for (param_name, inferred) in &annotations.inferred_param_types {
            parameters.entry(param_name.clone()).or_insert_with(|| inferred.clone());
        }

        Ok(InterfaceSchema { name, function_name, parameters, response_fields: response_fields.to_vec() })
    }
}

fn render_constant(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => s.clone(),
        Value::Bytes(b) => format!("0x{}", b.iter().map(|byte| format!("{byte:02x}")).collect::<String>()),
        Value::Array(_) | Value::Map(_) => String::new(),
    }
}
