//! Functions, closures, and tail-call trimming.
//!
//! Tail-call trimming keeps `tailstrict` recursion at O(1) call frames:
//! before a new call frame is pushed, an idle tailstrict frame under the
//! top of the stack is popped along with any local frames above it.

use tuff::ast::*;
use tuff::test_support::{assert_error_with, assert_json, assert_json_with, eval_json};
use tuff::{ErrorKind, EvalOptions};

// ============================================================================
// Application and closures
// ============================================================================

#[test]
fn immediate_application() {
    let e = apply(func(&["x"], add(var("x"), num(1.0))), vec![num(5.0)]);
    assert_json(&e, "6");
}

#[test]
fn closures_capture_their_environment() {
    let e = local(
        vec![("a", num(1.0))],
        apply(func(&["x"], add(var("x"), var("a"))), vec![num(2.0)]),
    );
    assert_json(&e, "3");
}

#[test]
fn higher_order_functions() {
    // local twice = function(f, x) f(f(x)); twice(function(n) n + 3, 1)
    let e = local(
        vec![(
            "twice",
            func(&["f", "x"], apply(var("f"), vec![apply(var("f"), vec![var("x")])])),
        )],
        apply(
            var("twice"),
            vec![func(&["n"], add(var("n"), num(3.0))), num(1.0)],
        ),
    );
    assert_json(&e, "7");
}

#[test]
fn nested_closures_return_functions() {
    // local mk = function(n) function(x) x + n; (mk(10))(5)
    let e = local(
        vec![("mk", func(&["n"], func(&["x"], add(var("x"), var("n")))))],
        apply(apply(var("mk"), vec![num(10.0)]), vec![num(5.0)]),
    );
    assert_json(&e, "15");
}

#[test]
fn wrong_arity_is_an_error() {
    let e = apply(func(&["x"], var("x")), vec![num(1.0), num(2.0)]);
    assert_error_with(EvalOptions::default(), &e, |k| {
        matches!(k, ErrorKind::TypeMismatch(m) if m.contains("expected 1 arguments, got 2"))
    });
}

#[test]
fn calling_a_non_function_is_an_error() {
    let e = apply(num(1.0), Vec::new());
    assert_error_with(EvalOptions::default(), &e, |k| {
        matches!(k, ErrorKind::TypeMismatch(m) if m.contains("only functions can be called"))
    });
}

#[test]
fn arguments_are_lazy_by_default() {
    let e = apply(func(&["x"], num(1.0)), vec![error(text("boom"))]);
    assert_json(&e, "1");
}

#[test]
fn tailstrict_forces_arguments() {
    let e = apply_tailstrict(func(&["x"], num(1.0)), vec![error(text("boom"))]);
    assert_error_with(EvalOptions::default(), &e, |k| {
        *k == ErrorKind::UserError("boom".to_string())
    });
}

// ============================================================================
// Recursion
// ============================================================================

fn countdown(n: f64, tail: bool) -> std::rc::Rc<Expr> {
    // local f = function(n) if n == 0 then 0 else f(n - 1) [tailstrict]; f(n)
    let rec = if tail {
        apply_tailstrict(var("f"), vec![sub(var("n"), num(1.0))])
    } else {
        apply(var("f"), vec![sub(var("n"), num(1.0))])
    };
    local(
        vec![(
            "f",
            func(&["n"], cond(eq(var("n"), num(0.0)), num(0.0), rec)),
        )],
        apply(var("f"), vec![num(n)]),
    )
}

#[test]
fn recursive_functions_via_local() {
    // factorial 5
    let e = local(
        vec![(
            "fac",
            func(
                &["n"],
                cond(
                    eq(var("n"), num(0.0)),
                    num(1.0),
                    binary(
                        BinaryOp::Mul,
                        var("n"),
                        apply(var("fac"), vec![sub(var("n"), num(1.0))]),
                    ),
                ),
            ),
        )],
        apply(var("fac"), vec![num(5.0)]),
    );
    assert_json(&e, "120");
}

#[test]
fn mutual_recursion() {
    // even/odd
    let e = local(
        vec![
            (
                "even",
                func(
                    &["n"],
                    cond(
                        eq(var("n"), num(0.0)),
                        boolean(true),
                        apply(var("odd"), vec![sub(var("n"), num(1.0))]),
                    ),
                ),
            ),
            (
                "odd",
                func(
                    &["n"],
                    cond(
                        eq(var("n"), num(0.0)),
                        boolean(false),
                        apply(var("even"), vec![sub(var("n"), num(1.0))]),
                    ),
                ),
            ),
        ],
        apply(var("even"), vec![num(10.0)]),
    );
    assert_json(&e, "true");
}

#[test]
fn tail_calls_keep_depth_bounded() {
    let options = EvalOptions::default().with_max_stack(500);
    assert_json_with(options, &countdown(20000.0, true), "0");
}

#[test]
fn deep_recursion_without_tailstrict_overflows() {
    let options = EvalOptions::default().with_max_stack(500);
    assert_error_with(options, &countdown(1000.0, false), |k| {
        *k == ErrorKind::StackOverflow
    });
}

#[test]
fn tail_recursion_survives_an_aggressive_collector() {
    // A tiny heap floor makes the collector run constantly; the result must
    // not change.
    let options = EvalOptions::default().with_max_stack(500).with_gc(64, 1.1);
    assert_json_with(options, &countdown(5000.0, true), "0");
}

#[test]
fn stack_trace_names_the_recursive_call() {
    let options = EvalOptions::default().with_max_stack(100);
    let err = tuff::Interpreter::new(options)
        .run(&countdown(1000.0, false))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::StackOverflow);
    assert!(err.trace.len() > 10);
    // Frames forced through the binding for f pick up its name.
    assert!(err
        .trace
        .iter()
        .any(|f| f.name.as_deref() == Some("function <f>")));
}

// ============================================================================
// Functions as values
// ============================================================================

#[test]
fn functions_are_first_class() {
    let e = local(
        vec![("apply2", func(&["g"], apply(var("g"), vec![num(2.0)])))],
        apply(var("apply2"), vec![func(&["x"], add(var("x"), var("x")))]),
    );
    assert_json(&e, "4");
}

#[test]
fn builtins_are_first_class() {
    // local f = std.floor; f(2.9)
    let e = local(
        vec![("f", field(var("std"), "floor"))],
        apply(var("f"), vec![num(2.9)]),
    );
    assert_json(&e, "2");
}

#[test]
fn comparing_functions_is_an_error() {
    let e = eq(func(&["x"], var("x")), func(&["x"], var("x")));
    let err = eval_json(&e).unwrap_err();
    assert!(matches!(
        err.kind,
        ErrorKind::TypeMismatch(m) if m.contains("equality of functions")
    ));
}
