//! Core expression evaluation: literals, operators, locals, laziness.

use tuff::ast::*;
use tuff::test_support::{assert_error, assert_json};
use tuff::ErrorKind;

// ============================================================================
// Literals and arithmetic
// ============================================================================

#[test]
fn literals() {
    assert_json(&num(42.0), "42");
    assert_json(&num(2.5), "2.5");
    assert_json(&boolean(true), "true");
    assert_json(&boolean(false), "false");
    assert_json(&null(), "null");
    assert_json(&text("hi"), "\"hi\"");
}

#[test]
fn arithmetic() {
    assert_json(&add(num(1.0), binary(BinaryOp::Mul, num(2.0), num(3.0))), "7");
    assert_json(&sub(num(10.0), num(4.0)), "6");
    assert_json(&binary(BinaryOp::Div, num(7.0), num(2.0)), "3.5");
}

#[test]
fn division_by_zero() {
    assert_error(&binary(BinaryOp::Div, num(1.0), num(0.0)), |k| {
        *k == ErrorKind::NumericError("division by zero".to_string())
    });
}

#[test]
fn overflow_to_infinity_is_an_error() {
    assert_error(&add(num(1e308), num(1e308)), |k| {
        *k == ErrorKind::NumericError("overflow".to_string())
    });
}

#[test]
fn nan_is_an_error() {
    // sqrt of a negative number
    let e = apply(field(var("std"), "sqrt"), vec![num(-1.0)]);
    assert_error(&e, |k| *k == ErrorKind::NumericError("not a number".to_string()));
}

#[test]
fn bitwise_and_shifts_truncate_to_integers() {
    assert_json(&binary(BinaryOp::ShiftL, num(1.0), num(4.0)), "16");
    assert_json(&binary(BinaryOp::ShiftR, num(-16.0), num(2.0)), "-4");
    assert_json(&binary(BinaryOp::BitAnd, num(6.0), num(3.0)), "2");
    assert_json(&binary(BinaryOp::BitOr, num(6.0), num(3.0)), "7");
    assert_json(&binary(BinaryOp::BitXor, num(6.0), num(3.0)), "5");
}

#[test]
fn comparisons() {
    assert_json(&lt(num(1.0), num(2.0)), "true");
    assert_json(&binary(BinaryOp::Gte, num(2.0), num(2.0)), "true");
    assert_json(&binary(BinaryOp::Gt, num(1.0), num(2.0)), "false");
}

#[test]
fn string_ordering_is_codepoint_wise() {
    assert_json(&binary(BinaryOp::Lt, text("a"), text("b")), "true");
    // 'Z' (90) sorts before 'a' (97)
    assert_json(&binary(BinaryOp::Lt, text("Z"), text("a")), "true");
    assert_json(&binary(BinaryOp::Lte, text("ab"), text("ab")), "true");
}

#[test]
fn unary_operators() {
    assert_json(&unary(UnaryOp::Minus, num(5.0)), "-5");
    assert_json(&unary(UnaryOp::Plus, num(5.0)), "5");
    assert_json(&unary(UnaryOp::Not, boolean(true)), "false");
    assert_json(&unary(UnaryOp::BitNot, num(5.0)), "-6");
}

#[test]
fn unary_type_errors() {
    assert_error(&unary(UnaryOp::Not, num(1.0)), |k| {
        matches!(k, ErrorKind::TypeMismatch(_))
    });
    assert_error(&unary(UnaryOp::Minus, text("x")), |k| {
        matches!(k, ErrorKind::TypeMismatch(_))
    });
}

#[test]
fn mismatched_operand_types() {
    assert_error(&add(num(1.0), boolean(true)), |k| {
        matches!(k, ErrorKind::TypeMismatch(m) if m.contains("matching types"))
    });
}

// ============================================================================
// Booleans and short-circuiting
// ============================================================================

#[test]
fn boolean_operators() {
    assert_json(&binary(BinaryOp::And, boolean(true), boolean(false)), "false");
    assert_json(&binary(BinaryOp::Or, boolean(false), boolean(true)), "true");
}

#[test]
fn and_short_circuits() {
    // The right side would raise if evaluated.
    let e = binary(BinaryOp::And, boolean(false), error(text("boom")));
    assert_json(&e, "false");
}

#[test]
fn or_short_circuits() {
    let e = binary(BinaryOp::Or, boolean(true), error(text("boom")));
    assert_json(&e, "true");
}

#[test]
fn conditional_branches() {
    assert_json(&cond(boolean(true), num(1.0), num(2.0)), "1");
    assert_json(&cond(boolean(false), num(1.0), num(2.0)), "2");
}

#[test]
fn conditional_requires_boolean() {
    assert_error(&cond(num(1.0), num(1.0), num(2.0)), |k| {
        matches!(k, ErrorKind::TypeMismatch(m) if m.contains("boolean"))
    });
}

#[test]
fn untaken_branch_is_not_evaluated() {
    assert_json(&cond(boolean(true), num(1.0), error(text("no"))), "1");
}

// ============================================================================
// Strings and coercion
// ============================================================================

#[test]
fn string_concatenation() {
    assert_json(&add(text("foo"), text("bar")), "\"foobar\"");
}

#[test]
fn plus_coerces_non_strings_next_to_strings() {
    assert_json(&add(text("a"), num(1.0)), "\"a1\"");
    assert_json(&add(num(1.0), text("a")), "\"1a\"");
    assert_json(&add(text("v="), boolean(true)), "\"v=true\"");
    assert_json(&add(null(), text("!")), "\"null!\"");
}

#[test]
fn object_coerces_compactly_inside_strings() {
    let e = add(text("x"), obj(vec![("a", num(1.0))]));
    assert_json(&e, "\"x{\\\"a\\\": 1}\"");
}

#[test]
fn array_coerces_compactly_inside_strings() {
    let e = add(array(vec![num(1.0), num(2.0)]), text("!"));
    assert_json(&e, "\"[1, 2]!\"");
}

// ============================================================================
// Locals and laziness
// ============================================================================

#[test]
fn local_binding() {
    assert_json(&local(vec![("x", num(10.0))], add(var("x"), num(5.0))), "15");
}

#[test]
fn locals_are_mutually_recursive() {
    // local x = y, y = 1; x
    let e = local(vec![("x", var("y")), ("y", num(1.0))], var("x"));
    assert_json(&e, "1");
}

#[test]
fn unused_bindings_never_evaluate() {
    let e = local(vec![("x", error(text("boom")))], num(1.0));
    assert_json(&e, "1");
}

#[test]
fn binding_forced_once_observed_via_equality() {
    // local x = 1 + 2; x + x
    let e = local(vec![("x", add(num(1.0), num(2.0)))], add(var("x"), var("x")));
    assert_json(&e, "6");
}

#[test]
fn shadowing_prefers_the_nearest_binding() {
    let e = local(
        vec![("x", num(1.0))],
        local(vec![("x", num(2.0))], var("x")),
    );
    assert_json(&e, "2");
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn error_expression_raises() {
    assert_error(&error(text("boom")), |k| {
        *k == ErrorKind::UserError("boom".to_string())
    });
}

#[test]
fn error_message_coerces_via_concat_only() {
    // A non-string message is a type error, not a user error.
    assert_error(&error(num(1.0)), |k| {
        matches!(k, ErrorKind::TypeMismatch(m) if m.contains("error message"))
    });
}

#[test]
fn errors_carry_a_trace() {
    let program = local(
        vec![("f", func(&["x"], error(text("inside"))))],
        apply(var("f"), vec![num(1.0)]),
    );
    let err = tuff::test_support::eval_json(&program).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UserError("inside".to_string()));
    // Newest-first trace with at least the raise site and the call.
    assert!(err.trace.len() >= 2);
    let rendered = err.to_string();
    assert!(rendered.contains("inside"));
}

// ============================================================================
// Equality (desugared to std.equals)
// ============================================================================

#[test]
fn primitive_equality() {
    assert_json(&eq(num(1.0), num(1.0)), "true");
    assert_json(&eq(num(1.0), num(2.0)), "false");
    assert_json(&eq(text("a"), text("a")), "true");
    assert_json(&eq(null(), null()), "true");
    assert_json(&eq(num(1.0), text("1")), "false");
    assert_json(&neq(num(1.0), num(2.0)), "true");
}

#[test]
fn structural_equality() {
    let a = array(vec![num(1.0), array(vec![num(2.0)])]);
    let b = array(vec![num(1.0), array(vec![num(2.0)])]);
    assert_json(&eq(a, b), "true");

    let o1 = obj(vec![("a", num(1.0)), ("b", num(2.0))]);
    let o2 = obj(vec![("b", num(2.0)), ("a", num(1.0))]);
    assert_json(&eq(o1, o2), "true");

    assert_json(
        &eq(obj(vec![("a", num(1.0))]), obj(vec![("a", num(2.0))])),
        "false",
    );
    assert_json(
        &eq(array(vec![num(1.0)]), array(vec![num(1.0), num(2.0)])),
        "false",
    );
}
