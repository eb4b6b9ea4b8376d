//! The persisted Intermediate Format (§3, §6).

use serde::{Deserialize, Serialize};

use crate::pos::Position;
use crate::types::TypeSpec;
use crate::IndexMap;

/// Flat instruction op set (§3 "Instruction").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Op {
    EmitStatic,
    AddParam,
    EmitUnlessBoundary,
    Boundary,
    If,
    ElIf,
    Else,
    EndIf,
    LoopStart,
    LoopEnd,
    EmitEval,
}

/// `{op, pos:[line,col,byte], value?, expr_index?, name?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Op,
    pub pos: [i64; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr_index: Option<usize>,
    /// Loop variable name, present only on `LOOP_START`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Instruction {
    pub fn new(op: Op, pos: Position) -> Self {
        Self { op, pos: pos.as_triple(), value: None, expr_index: None, name: None }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_expr_index(mut self, idx: usize) -> Self {
        self.expr_index = Some(idx);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CelExpressionEntry {
    pub expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_type: Option<TypeSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseField {
    pub name: String,
    pub type_spec: TypeSpec,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_column: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    pub parameters: IndexMap<String, TypeSpec>,
    #[serde(default)]
    pub response_fields: Vec<ResponseField>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dependencies {
    pub all_variables: Vec<String>,
    pub structural_variables: Vec<String>,
    pub parameter_variables: Vec<String>,
    pub cache_key_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// The single persistent artifact of compilation (§3 "Lifecycle").
/// Immutable after construction and safe to share across concurrent
/// evaluators without synchronization (§5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntermediateFormat {
    pub format_version: u32,
    pub source: SourceInfo,
    pub interface_schema: InterfaceSchema,
    pub dependencies: Dependencies,
    pub cel_expressions: Vec<CelExpressionEntry>,
    pub instructions: Vec<Instruction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_affinity: Option<Vec<ResponseField>>,
}

pub const CURRENT_FORMAT_VERSION: u32 = 1;

impl IntermediateFormat {
    /// Validates the structural invariants from §3 "Invariants": every
    /// `expr_index` is in range, every `IF` has a matching `END_IF` at the
    /// same depth, every `LOOP_START` has a matching `LOOP_END`.
    pub fn validate(&self) -> Result<(), crate::errors::IrError> {
        use crate::errors::IrError;

        if self.format_version != CURRENT_FORMAT_VERSION {
            return Err(IrError::VersionMismatch {
                found: self.format_version,
                expected: CURRENT_FORMAT_VERSION,
            });
        }

        #[derive(PartialEq)]
        enum Frame {
            Cond,
            Loop,
        }
        let mut stack = Vec::new();

        for (idx, instr) in self.instructions.iter().enumerate() {
            if let Some(expr_index) = instr.expr_index {
                if expr_index >= self.cel_expressions.len() {
                    return Err(IrError::ExprIndexOutOfRange { instruction_index: idx, expr_index });
                }
            }
            match instr.op {
                Op::If => stack.push(Frame::Cond),
                Op::ElIf | Op::Else => {
                    if stack.last() != Some(&Frame::Cond) {
                        return Err(IrError::UnbalancedControl { instruction_index: idx });
                    }
                }
                Op::EndIf => {
                    if stack.pop() != Some(Frame::Cond) {
                        return Err(IrError::UnbalancedControl { instruction_index: idx });
                    }
                }
                Op::LoopStart => stack.push(Frame::Loop),
                Op::LoopEnd => {
                    if stack.pop() != Some(Frame::Loop) {
                        return Err(IrError::UnbalancedControl { instruction_index: idx });
                    }
                }
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(IrError::UnbalancedControl { instruction_index: self.instructions.len() });
        }

        Ok(())
    }
}
