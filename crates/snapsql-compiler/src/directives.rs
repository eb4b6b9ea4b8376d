//! C2: verifies directive blocks are locally well-formed (§4.2).
//!
//! The sigil body is already fully classified into [`Directive`] by the
//! tokenizer (recognizing `if`/`elif`/`else`/`end`/`for` is a keyword match,
//! not a parse); this stage's job is the structural check spec §4.2
//! actually calls out: balanced `if/end`, balanced `for/end`.

use snapsql_core::directive::Directive;
use snapsql_core::errors::{ErrorPosition, StructuralError};
use snapsql_core::pos::Position;
use snapsql_core::token::Token;

#[derive(Clone, Copy)]
enum BlockKind {
    Cond,
    Loop,
}

/// Returns the number of directives seen, or the first structural
/// imbalance found.
pub fn check_balance(tokens: &[Token]) -> Result<usize, StructuralError> {
    let mut stack: Vec<(BlockKind, Position)> = Vec::new();
    let mut count = 0;

    for token in tokens {
        let Some(directive) = &token.directive else { continue };
        count += 1;
        match directive {
            Directive::If { .. } => stack.push((BlockKind::Cond, token.span.start)),
            Directive::For { .. } => stack.push((BlockKind::Loop, token.span.start)),
            Directive::ElIf { .. } | Directive::Else => match stack.last() {
                Some((BlockKind::Cond, _)) => {}
                _ => {
                    return Err(StructuralError::UnbalancedDirectives {
                        start: ErrorPosition::from(token.span.start),
                    })
                }
            },
            Directive::End => {
                if stack.pop().is_none() {
                    return Err(StructuralError::UnbalancedDirectives {
                        start: ErrorPosition::from(token.span.start),
                    });
                }
            }
            Directive::Variable { .. } | Directive::Const { .. } | Directive::InterfaceMetadata { .. } => {}
        }
    }

    if let Some((_, start)) = stack.first() {
        return Err(StructuralError::UnbalancedDirectives { start: ErrorPosition::from(*start) });
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    #[test]
    fn balanced_if_end_is_ok() {
        let tokens = tokenize("/*# if a */x/*# end */").unwrap().tokens;
        assert_eq!(check_balance(&tokens).unwrap(), 2);
    }

    #[test]
    fn dangling_if_is_rejected() {
        let tokens = tokenize("/*# if a */x").unwrap().tokens;
        assert!(check_balance(&tokens).is_err());
    }

    #[test]
    fn elif_outside_if_is_rejected() {
        let tokens = tokenize("/*# elif a */x").unwrap().tokens;
        assert!(check_balance(&tokens).is_err());
    }

    #[test]
    fn nested_loop_inside_conditional_is_ok() {
        let src = "/*# if a */ /*# for v : vs */x/*# end */ /*# end */";
        let tokens = tokenize(src).unwrap().tokens;
        assert!(check_balance(&tokens).is_ok());
    }
}
