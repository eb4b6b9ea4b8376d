//! The concrete scenarios and universal invariants a `compile -> optimize ->
//! evaluate` round trip must satisfy, dialect = PostgreSQL unless noted.

use pretty_assertions::assert_eq;
use snapsql::{compile, evaluate, optimize, CompileOptions, Dialect, IndexMap, Value};

fn run(source: &str, params: IndexMap<String, Value>) -> (String, Vec<Value>) {
    let compiled = compile(source, &CompileOptions::default()).unwrap();
    let optimized = optimize(&compiled.intermediate, Dialect::PostgreSql);
    let out = evaluate(&optimized, Dialect::PostgreSql, &params, None).unwrap();
    (out.sql, out.args)
}

#[test]
fn scenario_1_static_template() {
    let (sql, args) = run("SELECT id FROM users WHERE id = 1", IndexMap::default());
    assert_eq!(sql, "SELECT id FROM users WHERE id = 1");
    assert_eq!(args, Vec::<Value>::new());
}

#[test]
fn scenario_2_variable_substitution() {
    let mut params = IndexMap::default();
    params.insert("user_id".to_string(), Value::Int(42));
    let (sql, args) = run("SELECT id FROM users WHERE id = /*= user_id */1", params);
    assert_eq!(sql, "SELECT id FROM users WHERE id = $1");
    assert_eq!(args, vec![Value::Int(42)]);
}

#[test]
fn scenario_3_optional_column_dropped() {
    let mut params = IndexMap::default();
    params.insert("include_email".to_string(), Value::Bool(false));
    let (sql, args) = run("SELECT id /*# if include_email */, email /*# end */ FROM users", params);
    assert_eq!(sql, "SELECT id FROM users");
    assert_eq!(args, Vec::<Value>::new());
}

#[test]
fn scenario_4_optional_filter_list_present() {
    let source = "SELECT id FROM users WHERE active = true /*# if depts */ AND dept IN (/*= depts */'x') /*# end */";
    let mut params = IndexMap::default();
    params.insert(
        "depts".to_string(),
        Value::Array(vec![Value::String("eng".to_string()), Value::String("design".to_string())]),
    );
    let (sql, args) = run(source, params);
    assert_eq!(sql, "SELECT id FROM users WHERE active = true AND dept IN ($1)");
    assert_eq!(args, vec![Value::Array(vec![Value::String("eng".to_string()), Value::String("design".to_string())])]);
}

#[test]
fn scenario_4_optional_filter_list_absent() {
    let source = "SELECT id FROM users WHERE active = true /*# if depts */ AND dept IN (/*= depts */'x') /*# end */";
    let (sql, args) = run(source, IndexMap::default());
    assert_eq!(sql, "SELECT id FROM users WHERE active = true");
    assert_eq!(args, Vec::<Value>::new());
}

#[test]
fn scenario_5_loop_over_values() {
    let mut params = IndexMap::default();
    params.insert("vs".to_string(), Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
    let (sql, args) = run("INSERT INTO t(a) VALUES /*# for v : vs */ (/*= v */0) /*# end */", params);
    assert_eq!(sql, "INSERT INTO t(a) VALUES ($1), ($2), ($3)");
    assert_eq!(args, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
}

#[test]
fn scenario_6_missing_required_parameter() {
    let compiled = compile(
        "/*# function_name: get_user\nparameters:\n  pid: int */\nSELECT id FROM users WHERE id = /*= pid */1",
        &CompileOptions::default(),
    )
    .unwrap();
    let optimized = optimize(&compiled.intermediate, Dialect::PostgreSql);
    let err = evaluate(&optimized, Dialect::PostgreSql, &IndexMap::default(), None).unwrap_err();
    assert!(err.to_string().contains("pid (int)"));
}

#[test]
fn universal_invariant_add_param_count_matches_args_len() {
    let mut params = IndexMap::default();
    params.insert("vs".to_string(), Value::Array(vec![Value::Int(1), Value::Int(2)]));
    let compiled =
        compile("INSERT INTO t(a) VALUES /*# for v : vs */ (/*= v */0) /*# end */", &CompileOptions::default())
            .unwrap();
    let optimized = optimize(&compiled.intermediate, Dialect::PostgreSql);
    let out = evaluate(&optimized, Dialect::PostgreSql, &params, None).unwrap();
    assert_eq!(out.args.len(), 2);
}

#[test]
fn universal_invariant_recompiling_the_same_source_is_deterministic() {
    let source = "SELECT id FROM users WHERE id = /*= user_id */1";
    let first = compile(source, &CompileOptions::default()).unwrap();
    let second = compile(source, &CompileOptions::default()).unwrap();
    assert_eq!(snapsql::to_json(&first.intermediate).unwrap(), snapsql::to_json(&second.intermediate).unwrap());
}

#[test]
fn universal_invariant_structural_parameters_change_topology_value_parameters_do_not() {
    let source = "SELECT id FROM users /*# if active */ WHERE active = /*= active */true /*# end */";
    let mut on = IndexMap::default();
    on.insert("active".to_string(), Value::Bool(true));
    let mut off = on.clone();
    off.insert("active".to_string(), Value::Bool(false));

    let (sql_on, _) = run(source, on);
    let (sql_off, _) = run(source, off);
    assert_eq!(sql_on, "SELECT id FROM users WHERE active = $1");
    assert_eq!(sql_off, "SELECT id FROM users");
}
