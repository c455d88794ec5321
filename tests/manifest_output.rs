//! Output formats: JSON layout, string output, multi-file, and stream modes.

use tuff::ast::*;
use tuff::test_support::{assert_error_with, assert_json, eval_json, eval_json_with};
use tuff::{ErrorKind, EvalOptions, Interpreter};

// ============================================================================
// JSON layout
// ============================================================================

#[test]
fn empty_containers() {
    assert_json(&array(Vec::new()), "[ ]");
    assert_json(&object(Vec::new(), Vec::new()), "{ }");
}

#[test]
fn arrays_indent_with_three_spaces() {
    assert_json(&array(vec![num(1.0), num(2.0)]), "[\n   1,\n   2\n]");
}

#[test]
fn nesting_accumulates_indent() {
    let e = obj(vec![(
        "a",
        array(vec![num(1.0), obj(vec![("b", null())])]),
    )]);
    assert_json(
        &e,
        "{\n   \"a\": [\n      1,\n      {\n         \"b\": null\n      }\n   ]\n}",
    );
}

#[test]
fn keys_are_sorted() {
    let e = obj(vec![("b", num(1.0)), ("a", num(2.0)), ("c", num(3.0))]);
    assert_json(&e, "{\n   \"a\": 2,\n   \"b\": 1,\n   \"c\": 3\n}");
}

#[test]
fn keys_and_strings_are_escaped() {
    let e = object(
        vec![obj_field(Hide::Visible, text("we\"ird"), text("line\nbreak"))],
        Vec::new(),
    );
    assert_json(&e, "{\n   \"we\\\"ird\": \"line\\nbreak\"\n}");
}

#[test]
fn numbers_use_shortest_form() {
    assert_json(&num(1.0), "1");
    assert_json(&num(-0.75), "-0.75");
    assert_json(&num(9007199254740992.0), "9007199254740992");
}

#[test]
fn functions_do_not_manifest() {
    assert_error_with(EvalOptions::default(), &func(&["x"], var("x")), |k| {
        *k == ErrorKind::ManifestFunction
    });
    let e = obj(vec![("f", func(&["x"], var("x")))]);
    assert_error_with(EvalOptions::default(), &e, |k| {
        *k == ErrorKind::ManifestFunction
    });
}

#[test]
fn manifestation_is_deterministic() {
    let program = || {
        obj(vec![
            ("z", array(vec![num(1.0), text("two")])),
            ("a", obj(vec![("nested", boolean(true))])),
        ])
    };
    let first = eval_json(&program()).unwrap();
    let second = eval_json(&program()).unwrap();
    assert_eq!(first, second);
}

// ============================================================================
// String output mode
// ============================================================================

#[test]
fn string_output_is_verbatim() {
    let options = EvalOptions::default().with_string_output(true);
    let out = eval_json_with(options, &text("hello\nworld\n")).unwrap();
    assert_eq!(out, "hello\nworld\n");
}

#[test]
fn string_output_rejects_non_strings() {
    let options = EvalOptions::default().with_string_output(true);
    assert_error_with(options, &num(1.0), |k| {
        matches!(k, ErrorKind::TypeMismatch(m) if m.contains("expected string result"))
    });
}

// ============================================================================
// Multi-file mode
// ============================================================================

#[test]
fn multi_mode_splits_by_field() {
    let program = obj(vec![
        ("a.json", obj(vec![("x", num(1.0))])),
        ("b.json", array(vec![num(1.0)])),
    ]);
    let docs = Interpreter::new(EvalOptions::default())
        .run_multi(&program)
        .unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs["a.json"], "{\n   \"x\": 1\n}");
    assert_eq!(docs["b.json"], "[\n   1\n]");
}

#[test]
fn multi_mode_orders_files_by_name() {
    let program = obj(vec![
        ("z.json", num(1.0)),
        ("a.json", num(2.0)),
        ("m.json", num(3.0)),
    ]);
    let docs = Interpreter::new(EvalOptions::default())
        .run_multi(&program)
        .unwrap();
    let names: Vec<&str> = docs.keys().map(|s| s.as_str()).collect();
    assert_eq!(names, vec!["a.json", "m.json", "z.json"]);
}

#[test]
fn multi_mode_requires_an_object() {
    let err = Interpreter::new(EvalOptions::default())
        .run_multi(&array(Vec::new()))
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::TopLevelShape(m) if m.contains("multi mode")));
}

#[test]
fn multi_mode_with_string_output() {
    let options = EvalOptions::default().with_string_output(true);
    let program = obj(vec![("a.txt", text("raw text\n"))]);
    let docs = Interpreter::new(options).run_multi(&program).unwrap();
    assert_eq!(docs["a.txt"], "raw text\n");
}

// ============================================================================
// Stream mode
// ============================================================================

#[test]
fn stream_mode_yields_documents_in_order() {
    let program = array(vec![num(1.0), obj(vec![("a", num(1.0))]), text("s")]);
    let docs = Interpreter::new(EvalOptions::default())
        .run_stream(&program)
        .unwrap();
    assert_eq!(docs, vec!["1", "{\n   \"a\": 1\n}", "\"s\""]);
}

#[test]
fn stream_mode_requires_an_array() {
    let err = Interpreter::new(EvalOptions::default())
        .run_stream(&obj(vec![("a", num(1.0))]))
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::TopLevelShape(m) if m.contains("stream mode")));
}

#[test]
fn stream_elements_share_bindings() {
    let program = local(
        vec![("base", num(10.0))],
        array(vec![var("base"), add(var("base"), num(1.0))]),
    );
    let docs = Interpreter::new(EvalOptions::default())
        .run_stream(&program)
        .unwrap();
    assert_eq!(docs, vec!["10", "11"]);
}

// ============================================================================
// Collector interaction
// ============================================================================

#[test]
fn manifestation_survives_an_aggressive_collector() {
    // Manifesting allocates; with a tiny floor the collector runs mid-walk,
    // which must not disturb the containers being printed.
    let options = EvalOptions::default().with_gc(16, 1.1);
    let program = obj(vec![
        (
            "xs",
            std_make_array(64.0),
        ),
        ("s", add(text("a"), num(1.0))),
    ]);
    let out = eval_json_with(options, &program).unwrap();
    assert!(out.starts_with("{\n   \"s\": \"a1\",\n   \"xs\": [\n      0,"));
    assert!(out.ends_with("63\n   ]\n}"));
}

fn std_make_array(n: f64) -> std::rc::Rc<Expr> {
    apply(
        field(var("std"), "makeArray"),
        vec![num(n), func(&["i"], var("i"))],
    )
}
