use snapsql_core::errors::{Diagnostic, ErrorPosition};
use snapsql_core::types::TypeSpec;
use thiserror::Error;

/// §7 "Evaluation".
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("missing required parameter {name} ({type_spec})")]
    MissingRequiredParameter { name: String, type_spec: TypeSpec },
    #[error("loop argument `{expr}` at {at} is not an iterable sequence (found {found_type})")]
    NonIterableLoopArgument { expr: String, found_type: &'static str, at: ErrorPosition },
    #[error("failed to compile expression `{expr}` at {at}: {reason}")]
    CelCompileError { expr: String, reason: String, at: ErrorPosition },
    #[error("failed to evaluate expression `{expr}` at {at}: {reason}")]
    CelRuntimeError { expr: String, reason: String, at: ErrorPosition },
    #[error("instruction {instruction_index} references out-of-range expression index {expr_index}")]
    UnknownExpressionIndex { instruction_index: usize, expr_index: usize },
    #[error("unbalanced control-frame stack at instruction {instruction_index}")]
    UnbalancedFrameStack { instruction_index: usize },
    #[error("evaluation cancelled")]
    Cancelled,
}

impl Diagnostic for EvaluationError {
    fn kind(&self) -> &'static str {
        match self {
            EvaluationError::MissingRequiredParameter { .. } => "MissingRequiredParameter",
            EvaluationError::NonIterableLoopArgument { .. } => "NonIterableLoopArgument",
            EvaluationError::CelCompileError { .. } => "CelCompileError",
            EvaluationError::CelRuntimeError { .. } => "CelRuntimeError",
            EvaluationError::UnknownExpressionIndex { .. } => "UnknownExpressionIndex",
            EvaluationError::UnbalancedFrameStack { .. } => "UnbalancedFrameStack",
            EvaluationError::Cancelled => "Cancelled",
        }
    }

    fn position(&self) -> Option<ErrorPosition> {
        match self {
            EvaluationError::MissingRequiredParameter { .. } => None,
            EvaluationError::NonIterableLoopArgument { at, .. } => Some(*at),
            EvaluationError::CelCompileError { at, .. } => Some(*at),
            EvaluationError::CelRuntimeError { at, .. } => Some(*at),
            EvaluationError::UnknownExpressionIndex { .. } => None,
            EvaluationError::UnbalancedFrameStack { .. } => None,
            EvaluationError::Cancelled => None,
        }
    }
}
