//! C3: builds the unified SQL-plus-template AST from the token stream
//! (§4.3). A hand-written recursive-descent walk, not a grammar-combinator
//! table: boundary handling around directives (dangling separators, elided
//! clause headers) is easier to get right as a direct, linear pass over the
//! token stream than as a declarative grammar.

use snapsql_core::ast::{
    Branch, Clause, ClauseKind, Conditional, DeferredPrefix, InterfaceMetadataBlock, Loop, Node,
    NodeId, Program, StatementKind, SubstitutionSlot,
};
use snapsql_core::directive::Directive;
use snapsql_core::pos::{Position, Span};
use snapsql_core::token::{Token, TokenKind};

use crate::errors::ParseError;
use crate::lexer::MetadataBlock;

const CLAUSE_KEYWORDS: &[(&[&str], ClauseKind)] = &[
    (&["select"], ClauseKind::Select),
    (&["from"], ClauseKind::From),
    (&["where"], ClauseKind::Where),
    (&["group", "by"], ClauseKind::GroupBy),
    (&["having"], ClauseKind::Having),
    (&["order", "by"], ClauseKind::OrderBy),
    (&["limit"], ClauseKind::Limit),
    (&["offset"], ClauseKind::Offset),
    (&["values"], ClauseKind::Values),
    (&["set"], ClauseKind::Set),
    (&["returning"], ClauseKind::Returning),
];

fn list_mode(kind: ClauseKind) -> bool {
    matches!(
        kind,
        ClauseKind::Select | ClauseKind::Values | ClauseKind::GroupBy | ClauseKind::OrderBy | ClauseKind::Set
    )
}

/// Clauses whose keyword is elided along with its body when the body is a
/// single conditional/loop that contributes nothing (§8 "Boundary behaviors").
fn header_foldable(kind: ClauseKind) -> bool {
    matches!(
        kind,
        ClauseKind::Where
            | ClauseKind::Having
            | ClauseKind::GroupBy
            | ClauseKind::OrderBy
            | ClauseKind::Limit
            | ClauseKind::Offset
    )
}

pub(crate) fn keyword_text(kind: ClauseKind) -> String {
    match kind {
        ClauseKind::Select => "SELECT",
        ClauseKind::From => "FROM",
        ClauseKind::Where => "WHERE",
        ClauseKind::GroupBy => "GROUP BY",
        ClauseKind::Having => "HAVING",
        ClauseKind::OrderBy => "ORDER BY",
        ClauseKind::Limit => "LIMIT",
        ClauseKind::Offset => "OFFSET",
        ClauseKind::Values => "VALUES",
        ClauseKind::Set => "SET",
        ClauseKind::Returning => "RETURNING",
        ClauseKind::Into => "INTO",
    }
    .to_string()
}

pub fn parse(source: &str, tokens: &[Token], metadata: Option<MetadataBlock>) -> Result<Program, ParseError> {
    let statement_kind = detect_statement_kind(tokens);
    let mut parser = Parser { source, tokens, pos: 0, next_id: 0, depth: 0, in_list: false, pending_separator: None };
    let root = parser.parse_top_level()?;
    Ok(Program {
        statement_kind,
        interface_metadata: metadata.map(|m| InterfaceMetadataBlock { raw_yaml: m.raw_yaml }),
        root,
    })
}

fn detect_statement_kind(tokens: &[Token]) -> StatementKind {
    for t in tokens {
        if !t.is_code() || t.dummy {
            continue;
        }
        if t.kind != TokenKind::Keyword {
            return StatementKind::Other;
        }
        return match t.literal.to_ascii_lowercase().as_str() {
            "select" => StatementKind::Select,
            "insert" => StatementKind::Insert,
            "update" => StatementKind::Update,
            "delete" => StatementKind::Delete,
            _ => StatementKind::Other,
        };
    }
    StatementKind::Other
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Stop {
    /// Stop before the next top-level clause keyword (or EOF).
    Clause,
    /// Stop at `elif`/`else`/`end` belonging to the block being parsed.
    Block,
}

struct Parser<'a> {
    source: &'a str,
    tokens: &'a [Token],
    pos: usize,
    next_id: u32,
    depth: i32,
    in_list: bool,
    /// A `,` (or folded clause keyword) seen immediately before a
    /// conditional/loop, to be attached as that node's `deferred_prefix`.
    pending_separator: Option<DeferredPrefix>,
}

impl<'a> Parser<'a> {
    fn fresh_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn next_code_index_from(&self, from: usize) -> Option<usize> {
        let mut i = from;
        while i < self.tokens.len() {
            let t = &self.tokens[i];
            if t.kind == TokenKind::Eof {
                return None;
            }
            if !t.kind.is_trivia() && !t.dummy {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// If a clause keyword (possibly two words, e.g. `GROUP BY`) starts at
    /// `idx`, returns its kind and the index of its last keyword token.
    fn match_clause_at(&self, idx: usize) -> Option<(ClauseKind, usize)> {
        if self.depth != 0 {
            return None;
        }
        let first = &self.tokens[idx];
        if first.kind != TokenKind::Keyword {
            return None;
        }
        let first_lower = first.literal.to_ascii_lowercase();
        for (words, kind) in CLAUSE_KEYWORDS {
            if words[0] != first_lower.as_str() {
                continue;
            }
            if words.len() == 1 {
                return Some((*kind, idx));
            }
            let Some(second_idx) = self.next_code_index_from(idx + 1) else { continue };
            let second = &self.tokens[second_idx];
            if second.kind == TokenKind::Keyword && second.literal.eq_ignore_ascii_case(words[1]) {
                return Some((*kind, second_idx));
            }
        }
        None
    }

    fn parse_top_level(&mut self) -> Result<Vec<Node>, ParseError> {
        let mut root = Vec::new();
        loop {
            let leading = self.parse_node_sequence(Stop::Clause)?;
            root.extend(leading);
            match self.next_code_index_from(self.pos).and_then(|idx| self.match_clause_at(idx)) {
                Some((kind, _)) => root.push(Node::Clause(self.parse_clause(kind)?)),
                None => break,
            }
        }
        Ok(root)
    }

    fn parse_clause(&mut self, kind: ClauseKind) -> Result<Clause, ParseError> {
        let first_idx = self.next_code_index_from(self.pos).expect("caller verified a clause keyword is next");
        let keyword_start = self.tokens[first_idx].span.start;
        let (_, last_idx) = self.match_clause_at(first_idx).expect("caller verified a clause keyword is next");
        let keyword_end = self.tokens[last_idx].span.end_byte;
        self.pos = last_idx + 1;
        let keyword_span = Span::new(keyword_start, keyword_end);

        let saved_in_list = self.in_list;
        self.in_list = list_mode(kind);
        let mut body = self.parse_node_sequence(Stop::Clause)?;
        self.in_list = saved_in_list;

        let mut keyword_folded = false;
        if header_foldable(kind) {
            if let Some(node) = sole_directive_mut(&mut body) {
                attach_deferred_prefix(node, format!("{} ", keyword_text(kind)), keyword_span);
                keyword_folded = true;
            }
        }

        let span_end = body.last().map(|n| n.span().end_byte).unwrap_or(keyword_span.end_byte);
        Ok(Clause { kind, keyword_span, body, span: Span::new(keyword_start, span_end), keyword_folded })
    }

    fn parse_conditional(&mut self, leading: Option<DeferredPrefix>) -> Result<Conditional, ParseError> {
        let start_pos = self.tokens[self.pos].span.start;
        let Some(Directive::If { expr, expr_span }) = self.tokens[self.pos].directive.clone() else {
            unreachable!("parse_conditional called on a non-`if` token")
        };
        self.pos += 1;

        let mut branches = vec![Branch { expr, expr_span, body: self.parse_node_sequence(Stop::Block)? }];
        let mut else_branch = None;

        loop {
            if self.pos >= self.tokens.len() {
                return Err(ParseError::UnexpectedEof { context: "if/elif/else/end".into(), at: start_pos.into() });
            }
            let token = &self.tokens[self.pos];
            match token.directive.clone() {
                Some(Directive::ElIf { expr, expr_span }) if else_branch.is_none() => {
                    self.pos += 1;
                    branches.push(Branch { expr, expr_span, body: self.parse_node_sequence(Stop::Block)? });
                }
                Some(Directive::Else) if else_branch.is_none() => {
                    self.pos += 1;
                    else_branch = Some(self.parse_node_sequence(Stop::Block)?);
                }
                Some(Directive::End) => {
                    self.pos += 1;
                    break;
                }
                _ => {
                    return Err(ParseError::UnexpectedToken {
                        found: token.literal.to_string(),
                        expected: "elif, else or end".into(),
                        at: token.span.start.into(),
                    })
                }
            }
        }

        let end_byte = self.tokens[self.pos - 1].span.end_byte;
        Ok(Conditional { branches, else_branch, span: Span::new(start_pos, end_byte), deferred_prefix: leading })
    }

    fn parse_loop(&mut self, leading: Option<DeferredPrefix>) -> Result<Loop, ParseError> {
        let start_pos = self.tokens[self.pos].span.start;
        let Some(Directive::For { var_name, iterable_expr, expr_span }) = self.tokens[self.pos].directive.clone()
        else {
            unreachable!("parse_loop called on a non-`for` token")
        };
        self.pos += 1;
        let id = self.fresh_id();
        let body = self.parse_node_sequence(Stop::Block)?;

        if self.pos >= self.tokens.len() {
            return Err(ParseError::UnexpectedEof { context: "for/end".into(), at: start_pos.into() });
        }
        let token = &self.tokens[self.pos];
        if !matches!(token.directive, Some(Directive::End)) {
            return Err(ParseError::UnexpectedToken {
                found: token.literal.to_string(),
                expected: "end".into(),
                at: token.span.start.into(),
            });
        }
        let end_byte = token.span.end_byte;
        self.pos += 1;
        Ok(Loop { id, var_name, iterable_expr, expr_span, body, span: Span::new(start_pos, end_byte), deferred_prefix: leading })
    }

    /// Where a `Variable` directive at the current position sits, judged by
    /// byte-adjacency to a preceding identifier with no separating trivia
    /// (e.g. `users_/*= suffix */`) (§4.3).
    fn classify_slot(&self) -> SubstitutionSlot {
        if self.pos == 0 {
            return SubstitutionSlot::Value;
        }
        let prev = &self.tokens[self.pos - 1];
        let cur = &self.tokens[self.pos];
        if prev.kind == TokenKind::Identifier && prev.span.end_byte == cur.span.start.byte {
            SubstitutionSlot::Identifier
        } else {
            SubstitutionSlot::Value
        }
    }

    /// Advances past the directive token at `self.pos` and its dummy
    /// payload, returning the payload's span.
    fn consume_dummy_span(&mut self) -> Span {
        let directive_end = self.tokens[self.pos].span.end_byte;
        let directive_start = self.tokens[self.pos].span.start;
        self.pos += 1;
        let mut start: Option<Position> = None;
        let mut end = directive_end;
        while self.pos < self.tokens.len() {
            let t = &self.tokens[self.pos];
            if t.dummy {
                if start.is_none() {
                    start = Some(t.span.start);
                }
                end = t.span.end_byte;
                self.pos += 1;
                continue;
            }
            if t.kind.is_trivia() && start.is_none() {
                self.pos += 1;
                continue;
            }
            break;
        }
        Span::new(start.unwrap_or(directive_start), end)
    }

    fn parse_node_sequence(&mut self, stop: Stop) -> Result<Vec<Node>, ParseError> {
        let mut nodes = Vec::new();
        let mut text_start: Option<Position> = None;
        let mut text_end: usize = 0;

        macro_rules! flush_text {
            () => {
                if let Some(start) = text_start.take() {
                    if text_end > start.byte {
                        nodes.push(Node::Text { text: self.source[start.byte..text_end].to_string(), span: Span::new(start, text_end) });
                    }
                }
            };
        }

        // A block's trailing trivia (the run of whitespace sitting right
        // before its closing `elif`/`else`/`end` directive) is never
        // meaningful template text — it only separates the directive comment
        // from the preceding SQL in the source. Trimming it here keeps a
        // taken conditional/loop body from leaving a dangling space behind.
        macro_rules! flush_block_text {
            () => {
                if let Some(start) = text_start.take() {
                    let trimmed_end = start.byte + self.source[start.byte..text_end].trim_end().len();
                    if trimmed_end > start.byte {
                        nodes.push(Node::Text { text: self.source[start.byte..trimmed_end].to_string(), span: Span::new(start, trimmed_end) });
                    }
                }
            };
        }

        loop {
            if self.pos >= self.tokens.len() || self.tokens[self.pos].kind == TokenKind::Eof {
                break;
            }

            if stop == Stop::Clause
                && self.depth == 0
                && !self.tokens[self.pos].kind.is_trivia()
                && !self.tokens[self.pos].dummy
                && self.match_clause_at(self.pos).is_some()
            {
                break;
            }

            let token = self.tokens[self.pos].clone();

            if token.kind.is_trivia() {
                if text_start.is_some() {
                    text_end = token.span.end_byte;
                }
                self.pos += 1;
                continue;
            }

            if token.dummy {
                self.pos += 1;
                continue;
            }

            if let Some(directive) = token.directive.clone() {
                match directive {
                    Directive::If { .. } => {
                        flush_text!();
                        let leading = self.pending_separator.take();
                        nodes.push(Node::Conditional(self.parse_conditional(leading)?));
                        continue;
                    }
                    Directive::For { .. } => {
                        flush_text!();
                        let leading = self.pending_separator.take();
                        nodes.push(Node::Loop(self.parse_loop(leading)?));
                        continue;
                    }
                    Directive::ElIf { .. } | Directive::Else | Directive::End => {
                        if stop == Stop::Block {
                            flush_block_text!();
                            break;
                        }
                        return Err(ParseError::UnexpectedToken {
                            found: token.literal.to_string(),
                            expected: "clause content".into(),
                            at: token.span.start.into(),
                        });
                    }
                    Directive::Variable { expr, expr_span } => {
                        flush_text!();
                        let slot = self.classify_slot();
                        let dummy_span = self.consume_dummy_span();
                        let id = self.fresh_id();
                        nodes.push(match slot {
                            SubstitutionSlot::Value => Node::ParamExpr { id, expr, expr_span, dummy_span },
                            SubstitutionSlot::Identifier => Node::IdentEval { id, expr, expr_span, dummy_span },
                        });
                        continue;
                    }
                    Directive::Const { expr, expr_span } => {
                        flush_text!();
                        self.consume_dummy_span();
                        nodes.push(Node::ConstEval { expr, expr_span });
                        continue;
                    }
                    Directive::InterfaceMetadata { .. } => {
                        self.pos += 1;
                        continue;
                    }
                }
            }

            if self.in_list && self.depth == 0 && token.kind == TokenKind::Operator && token.literal.as_str() == "," {
                flush_text!();
                if let Some(next_idx) = self.next_code_index_from(self.pos + 1) {
                    let next = &self.tokens[next_idx];
                    if matches!(next.directive, Some(Directive::If { .. }) | Some(Directive::For { .. })) {
                        // The canonical single space is restored here rather than
                        // carried from the source: the optimizer's whitespace
                        // normalization pass re-settles spacing everywhere else too.
                        self.pending_separator = Some(DeferredPrefix { text: ", ".to_string(), span: token.span });
                        self.pos += 1;
                        continue;
                    }
                }
                nodes.push(Node::ListSeparator { span: token.span });
                self.pos += 1;
                continue;
            }

            if token.kind == TokenKind::Operator {
                match token.literal.as_str() {
                    "(" => self.depth += 1,
                    ")" if self.depth > 0 => self.depth -= 1,
                    _ => {}
                }
            }

            if text_start.is_none() {
                text_start = Some(token.span.start);
            }
            text_end = token.span.end_byte;
            self.pos += 1;
        }

        flush_text!();
        Ok(nodes)
    }
}

fn sole_directive_mut(body: &mut [Node]) -> Option<&mut Node> {
    let mut found = None;
    for (i, n) in body.iter().enumerate() {
        if matches!(n, Node::Text { text, .. } if text.trim().is_empty()) {
            continue;
        }
        if found.is_some() {
            return None;
        }
        found = Some(i);
    }
    match &body[found?] {
        Node::Conditional(_) | Node::Loop(_) => Some(&mut body[found?]),
        _ => None,
    }
}

fn attach_deferred_prefix(node: &mut Node, text: String, span: Span) {
    match node {
        Node::Conditional(c) => c.deferred_prefix = Some(DeferredPrefix { text, span }),
        Node::Loop(l) => l.deferred_prefix = Some(DeferredPrefix { text, span }),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_src(src: &str) -> Program {
        let lexed = tokenize(src).unwrap();
        parse(src, &lexed.tokens, lexed.metadata).unwrap()
    }

    #[test]
    fn static_select_has_select_from_where_clauses() {
        let program = parse_src("SELECT id, name FROM users WHERE active = true");
        assert_eq!(program.statement_kind, StatementKind::Select);
        let kinds: Vec<_> = program
            .root
            .iter()
            .filter_map(|n| match n {
                Node::Clause(c) => Some(c.kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![ClauseKind::Select, ClauseKind::From, ClauseKind::Where]);
    }

    #[test]
    fn variable_in_where_predicate_is_a_param_expr() {
        let program = parse_src("SELECT id FROM users WHERE id = /*= user_id */1");
        let where_clause = program
            .root
            .iter()
            .find_map(|n| match n {
                Node::Clause(c) if c.kind == ClauseKind::Where => Some(c),
                _ => None,
            })
            .unwrap();
        assert!(where_clause.body.iter().any(|n| matches!(n, Node::ParamExpr { .. })));
    }

    #[test]
    fn variable_directly_after_identifier_is_ident_eval() {
        let program = parse_src("SELECT * FROM users_/*= suffix */x");
        let from_clause = program
            .root
            .iter()
            .find_map(|n| match n {
                Node::Clause(c) if c.kind == ClauseKind::From => Some(c),
                _ => None,
            })
            .unwrap();
        assert!(from_clause.body.iter().any(|n| matches!(n, Node::IdentEval { .. })));
    }

    #[test]
    fn where_clause_folded_entirely_into_conditional_gets_deferred_keyword() {
        let program = parse_src("SELECT * FROM t WHERE /*# if cond */x = 1/*# end */");
        let where_clause = program
            .root
            .iter()
            .find_map(|n| match n {
                Node::Clause(c) if c.kind == ClauseKind::Where => Some(c),
                _ => None,
            })
            .unwrap();
        assert!(where_clause.keyword_folded);
        let Node::Conditional(cond) = &where_clause.body.iter().find(|n| matches!(n, Node::Conditional(_))).unwrap()
        else {
            unreachable!()
        };
        assert_eq!(cond.deferred_prefix.as_ref().unwrap().text, "WHERE ");
    }

    #[test]
    fn comma_before_optional_column_is_deferred_not_a_list_separator() {
        let program = parse_src("SELECT id, /*# if with_email */email/*# end */ FROM users");
        let select_clause = program
            .root
            .iter()
            .find_map(|n| match n {
                Node::Clause(c) if c.kind == ClauseKind::Select => Some(c),
                _ => None,
            })
            .unwrap();
        let cond = select_clause.body.iter().find_map(|n| match n {
            Node::Conditional(c) => Some(c),
            _ => None,
        });
        let cond = cond.expect("expected a conditional in the select list");
        assert_eq!(cond.deferred_prefix.as_ref().unwrap().text, ", ");
        assert!(!select_clause.body.iter().any(|n| matches!(n, Node::ListSeparator { .. })));
    }

    #[test]
    fn comma_inside_conditional_body_is_plain_text_not_deferred() {
        let program = parse_src("SELECT id /*# if with_email */, email/*# end */ FROM users");
        let select_clause = program
            .root
            .iter()
            .find_map(|n| match n {
                Node::Clause(c) if c.kind == ClauseKind::Select => Some(c),
                _ => None,
            })
            .unwrap();
        let cond = select_clause.body.iter().find_map(|n| match n {
            Node::Conditional(c) => Some(c),
            _ => None,
        });
        assert!(cond.unwrap().deferred_prefix.is_none());
    }

    #[test]
    fn conditional_body_text_does_not_carry_the_whitespace_before_end() {
        let program = parse_src("SELECT id FROM users WHERE active = true /*# if depts */ AND dept IN (/*= depts */'x') /*# end */");
        let where_clause = program
            .root
            .iter()
            .find_map(|n| match n {
                Node::Clause(c) if c.kind == ClauseKind::Where => Some(c),
                _ => None,
            })
            .unwrap();
        let Node::Conditional(cond) = where_clause.body.iter().find(|n| matches!(n, Node::Conditional(_))).unwrap()
        else {
            unreachable!()
        };
        let last_text = cond.branches[0]
            .body
            .iter()
            .rev()
            .find_map(|n| match n {
                Node::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .unwrap();
        assert!(!last_text.ends_with(' '), "trailing text {last_text:?} should be trimmed before `/*# end */`");
    }

    #[test]
    fn loop_body_parses_value_slot_inside_tuple() {
        let program = parse_src("INSERT INTO t(a) VALUES /*# for v : vs */ (/*= v */0) /*# end */");
        let values_clause = program
            .root
            .iter()
            .find_map(|n| match n {
                Node::Clause(c) if c.kind == ClauseKind::Values => Some(c),
                _ => None,
            })
            .unwrap();
        let lp = values_clause.body.iter().find_map(|n| match n {
            Node::Loop(l) => Some(l),
            _ => None,
        });
        let lp = lp.expect("expected a loop in the values clause");
        assert_eq!(lp.var_name, "v");
        assert!(lp.body.iter().any(|n| matches!(n, Node::ParamExpr { .. })));
    }
}
