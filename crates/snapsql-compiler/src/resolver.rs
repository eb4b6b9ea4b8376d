//! C4: schema and type resolution (§4.4).
//!
//! Column/table resolution here is deliberately shallow: the parser does not
//! build a full expression grammar inside a clause body (§4.3 scopes control
//! flow and substitutions, not general SQL expressions), so this stage works
//! from the textual select-list / from-list the parser already split out
//! rather than a typed expression tree. Joins and multi-table statements
//! degrade to unresolved (`Any`, nullable) response fields with a warning
//! rather than a hard failure, even in strict mode.

use ahash::AHashMap;
use indexmap::IndexMap;

use snapsql_core::ast::{Annotations, ClauseKind, Node, Program, StatementKind};
use snapsql_core::ir::ResponseField;
use snapsql_core::table::TableMetadata;
use snapsql_core::types::{PrimitiveType, TypeSpec};

use crate::errors::ResolveError;
use crate::{CompileError, CompileWarning};

#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub annotations: Annotations,
    pub response_fields: Vec<ResponseField>,
}

pub fn resolve(
    source: &str,
    program: &Program,
    tables: &AHashMap<String, TableMetadata>,
    strict: bool,
    warnings: &mut Vec<CompileWarning>,
) -> Result<Resolved, ResolveError> {
    let mut annotations = Annotations::default();
    collect_parameter_types(source, &program.root, &mut annotations);

    let table = primary_table(program, tables, strict, warnings)?;
    let response_fields = if program.statement_kind == StatementKind::Select {
        select_list_fields(program, table, strict, warnings)?
    } else {
        Vec::new()
    };

    Ok(Resolved { annotations, response_fields })
}

/// A parsed interface-metadata YAML fragment's `parameters:` map, used when
/// the caller has already peeled the block from a markdown fixture (§6).
pub fn parse_parameters_yaml(yaml: &str) -> Result<IndexMap<String, TypeSpec>, CompileError> {
    let doc: serde_yaml::Value =
        serde_yaml::from_str(yaml).map_err(|e| ResolveError::InvalidMetadata { reason: e.to_string() })?;
    let mapping = doc
        .as_mapping()
        .ok_or_else(|| ResolveError::InvalidMetadata { reason: "metadata root is not a mapping".to_string() })?;

    let mut out = IndexMap::new();
    if let Some(serde_yaml::Value::Mapping(params)) = mapping.get(serde_yaml::Value::String("parameters".to_string()))
    {
        for (k, v) in params {
            let name = k
                .as_str()
                .ok_or_else(|| ResolveError::InvalidMetadata { reason: "parameter name must be a string".to_string() })?
                .to_string();
            let spelling = v.as_str().ok_or_else(|| ResolveError::InvalidMetadata {
                reason: format!("parameter `{name}` type must be a string spelling"),
            })?;
            out.insert(name, TypeSpec::parse(spelling));
        }
    }
    Ok(out)
}

fn primary_table<'a>(
    program: &Program,
    tables: &'a AHashMap<String, TableMetadata>,
    strict: bool,
    warnings: &mut Vec<CompileWarning>,
) -> Result<Option<&'a TableMetadata>, ResolveError> {
    let Some(from_clause) = program.root.iter().find_map(|n| match n {
        Node::Clause(c) if c.kind == ClauseKind::From => Some(c),
        _ => None,
    }) else {
        return Ok(None);
    };
    let Some(name) = first_identifier_word(&from_clause.body) else {
        return Ok(None);
    };
    match tables.values().find(|t| t.name.eq_ignore_ascii_case(&name)) {
        Some(t) => Ok(Some(t)),
        None if strict => {
            Err(ResolveError::UnknownTable { table: name, at: from_clause.keyword_span.start.into() })
        }
        None => {
            warnings.push(CompileWarning {
                kind: "UnknownTable",
                message: format!("table `{name}` not found in table metadata"),
            });
            Ok(None)
        }
    }
}

fn first_identifier_word(body: &[Node]) -> Option<String> {
    for node in body {
        let Node::Text { text, .. } = node else { break };
        if let Some(word) = text.split(|c: char| c.is_whitespace() || c == ',' || c == '(').find(|w| !w.is_empty()) {
            return Some(word.trim_matches(|c: char| c == '"' || c == '`').to_string());
        }
    }
    None
}

fn split_items(body: &[Node]) -> Vec<&[Node]> {
    let mut items = Vec::new();
    let mut start = 0;
    for (i, n) in body.iter().enumerate() {
        if matches!(n, Node::ListSeparator { .. }) {
            items.push(&body[start..i]);
            start = i + 1;
        }
    }
    items.push(&body[start..]);
    items
}

/// Derives a response-field name (and whether the item is conditionally
/// present) from a select-list item, recursing one level into a
/// conditional/loop's first branch to find the static column text a
/// template author almost always writes even for an optional column.
fn item_name_and_optional(item: &[Node]) -> Option<(String, bool)> {
    fn collect<'a>(nodes: &'a [Node], out: &mut Vec<&'a str>, optional: &mut bool) {
        for n in nodes {
            match n {
                Node::Text { text, .. } => out.push(text),
                Node::Conditional(c) => {
                    *optional = true;
                    if let Some(first) = c.branches.first() {
                        collect(&first.body, out, optional);
                    }
                }
                Node::Loop(l) => {
                    *optional = true;
                    collect(&l.body, out, optional);
                }
                _ => {}
            }
        }
    }
    let mut parts = Vec::new();
    let mut optional = false;
    collect(item, &mut parts, &mut optional);
    let text = parts.concat();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    let name = if let Some(idx) = lower.rfind(" as ") {
        trimmed[idx + 4..].trim()
    } else {
        trimmed.rsplit(|c: char| c == '.' || c.is_whitespace()).find(|w| !w.is_empty()).unwrap_or(trimmed)
    };
    Some((name.trim_matches(|c: char| c == '"' || c == '`').to_string(), optional))
}

fn select_list_fields(
    program: &Program,
    table: Option<&TableMetadata>,
    strict: bool,
    warnings: &mut Vec<CompileWarning>,
) -> Result<Vec<ResponseField>, ResolveError> {
    let Some(select_clause) = program.root.iter().find_map(|n| match n {
        Node::Clause(c) if c.kind == ClauseKind::Select => Some(c),
        _ => None,
    }) else {
        return Ok(Vec::new());
    };

    let mut fields = Vec::new();
    for item in split_items(&select_clause.body) {
        let Some((name, optional)) = item_name_and_optional(item) else { continue };

        if name == "*" {
            if let Some(t) = table {
                for col in &t.columns {
                    fields.push(ResponseField {
                        name: col.name.clone(),
                        type_spec: col.type_spec.clone(),
                        nullable: col.nullable,
                        source_table: Some(t.qualified_name()),
                        source_column: Some(col.name.clone()),
                    });
                }
            }
            continue;
        }

        match table.and_then(|t| t.column(&name)) {
            Some(col) => fields.push(ResponseField {
                name: name.clone(),
                type_spec: col.type_spec.clone(),
                nullable: optional || col.nullable,
                source_table: table.map(|t| t.qualified_name()),
                source_column: Some(col.name.clone()),
            }),
            None if table.is_some() && strict => {
                return Err(ResolveError::UnknownColumn { column: name, at: select_clause.keyword_span.start.into() })
            }
            None => {
                warnings.push(CompileWarning {
                    kind: "UnknownColumn",
                    message: format!("column `{name}` not found in table metadata; response type left unresolved"),
                });
                fields.push(ResponseField {
                    name,
                    type_spec: TypeSpec::Primitive(PrimitiveType::Any),
                    nullable: true,
                    source_table: None,
                    source_column: None,
                });
            }
        }
    }
    Ok(fields)
}

/// Best-effort scalar type from a dummy literal's source text (§4.3's
/// `/*= expr */dummy` payload), used to seed parameter types the interface
/// metadata block doesn't already pin down.
fn infer_from_literal(text: &str) -> TypeSpec {
    let t = text.trim();
    if t.eq_ignore_ascii_case("true") || t.eq_ignore_ascii_case("false") {
        return TypeSpec::Primitive(PrimitiveType::Bool);
    }
    if t.eq_ignore_ascii_case("null") {
        return TypeSpec::Nullable(Box::new(TypeSpec::Primitive(PrimitiveType::Any)));
    }
    if (t.starts_with('\'') && t.ends_with('\'')) || (t.starts_with('"') && t.ends_with('"')) {
        return TypeSpec::Primitive(PrimitiveType::String);
    }
    if t.starts_with('(') && t.ends_with(')') {
        return TypeSpec::Array(Box::new(TypeSpec::Primitive(PrimitiveType::Any)));
    }
    if t.parse::<i64>().is_ok() {
        return TypeSpec::Primitive(PrimitiveType::Int);
    }
    if t.parse::<f64>().is_ok() {
        return TypeSpec::Primitive(PrimitiveType::Float);
    }
    TypeSpec::Primitive(PrimitiveType::Any)
}

fn collect_parameter_types(source: &str, nodes: &[Node], annotations: &mut Annotations) {
    for node in nodes {
        match node {
            Node::ParamExpr { expr, dummy_span, .. } | Node::IdentEval { expr, dummy_span, .. } => {
                let literal = &source[dummy_span.byte_range()];
                let ty = infer_from_literal(literal);
                annotations.inferred_param_types.entry(expr.clone()).or_insert(ty);
            }
            Node::Conditional(c) => {
                for b in &c.branches {
                    collect_parameter_types(source, &b.body, annotations);
                }
                if let Some(e) = &c.else_branch {
                    collect_parameter_types(source, e, annotations);
                }
            }
            Node::Loop(l) => collect_parameter_types(source, &l.body, annotations),
            Node::Clause(c) => collect_parameter_types(source, &c.body, annotations),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapsql_core::table::ColumnMetadata;

    fn users_table() -> TableMetadata {
        TableMetadata {
            schema: None,
            name: "users".to_string(),
            columns: vec![
                ColumnMetadata {
                    name: "id".to_string(),
                    type_spec: TypeSpec::Primitive(PrimitiveType::Int),
                    nullable: false,
                    primary_key: true,
                    default: None,
                },
                ColumnMetadata {
                    name: "email".to_string(),
                    type_spec: TypeSpec::Primitive(PrimitiveType::String),
                    nullable: true,
                    primary_key: false,
                    default: None,
                },
            ],
            constraints: vec![],
            indexes: vec![],
        }
    }

    fn resolve_src(src: &str, tables: &AHashMap<String, TableMetadata>, strict: bool) -> (Resolved, Vec<CompileWarning>) {
        let lexed = crate::lexer::tokenize(src).unwrap();
        let program = crate::parser::parse(src, &lexed.tokens, lexed.metadata).unwrap();
        let mut warnings = Vec::new();
        let resolved = resolve(src, &program, tables, strict, &mut warnings).unwrap();
        (resolved, warnings)
    }

    #[test]
    fn resolves_known_columns_with_metadata_type() {
        let mut tables = AHashMap::default();
        tables.insert("users".to_string(), users_table());
        let (resolved, warnings) = resolve_src("SELECT id, email FROM users", &tables, true);
        assert!(warnings.is_empty());
        assert_eq!(resolved.response_fields.len(), 2);
        assert_eq!(resolved.response_fields[0].name, "id");
        assert!(!resolved.response_fields[0].nullable);
        assert_eq!(resolved.response_fields[1].name, "email");
        assert!(resolved.response_fields[1].nullable);
    }

    #[test]
    fn unknown_column_is_fatal_in_strict_mode() {
        let mut tables = AHashMap::default();
        tables.insert("users".to_string(), users_table());
        let lexed = crate::lexer::tokenize("SELECT ghost FROM users").unwrap();
        let program = crate::parser::parse("SELECT ghost FROM users", &lexed.tokens, lexed.metadata).unwrap();
        let mut warnings = Vec::new();
        let err = resolve("SELECT ghost FROM users", &program, &tables, true, &mut warnings).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownColumn { .. }));
    }

    #[test]
    fn unknown_column_is_a_warning_in_partial_mode() {
        let mut tables = AHashMap::default();
        tables.insert("users".to_string(), users_table());
        let (resolved, warnings) = resolve_src("SELECT ghost FROM users", &tables, false);
        assert_eq!(warnings.len(), 1);
        assert_eq!(resolved.response_fields[0].name, "ghost");
        assert!(resolved.response_fields[0].nullable);
    }

    #[test]
    fn optional_column_is_marked_nullable() {
        let mut tables = AHashMap::default();
        tables.insert("users".to_string(), users_table());
        let (resolved, _) =
            resolve_src("SELECT id /*# if with_email */, email/*# end */ FROM users", &tables, true);
        let email = resolved.response_fields.iter().find(|f| f.name == "email").unwrap();
        assert!(email.nullable);
    }

    #[test]
    fn parameter_type_is_inferred_from_dummy_literal() {
        let tables = AHashMap::default();
        let (resolved, _) = resolve_src("SELECT id FROM users WHERE id = /*= user_id */1", &tables, false);
        let ty = resolved.annotations.inferred_param_types.get("user_id").unwrap();
        assert_eq!(*ty, TypeSpec::Primitive(PrimitiveType::Int));
    }

    #[test]
    fn parses_parameters_yaml_block() {
        let yaml = "function_name: get_user\nparameters:\n  id: int\n  tags: string[]\n";
        let params = parse_parameters_yaml(yaml).unwrap();
        assert_eq!(params.get("id"), Some(&TypeSpec::Primitive(PrimitiveType::Int)));
        assert_eq!(
            params.get("tags"),
            Some(&TypeSpec::Array(Box::new(TypeSpec::Primitive(PrimitiveType::String))))
        );
    }
}
