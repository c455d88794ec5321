//! The synthesized `std` object.
//!
//! Programs evaluate under `local std = { ... };` where every builtin is
//! exposed as a hidden field. `std.equals` is the one member written in the
//! language itself (as a constructed AST): deep structural equality, which
//! the front end targets when it desugars `==` and `!=`.

use std::rc::Rc;

use crate::ast::{
    self, add, apply, boolean, cond, field, func, index, local, num, obj_field, object, text,
    unary, var, Expr, Hide, UnaryOp,
};
use crate::builtins::Builtin;

fn std_call(name: &str, args: Vec<Rc<Expr>>) -> Rc<Expr> {
    apply(field(var("std"), name), args)
}

fn prim_eq(a: Rc<Expr>, b: Rc<Expr>) -> Rc<Expr> {
    std_call("primitiveEquals", vec![a, b])
}

fn not(e: Rc<Expr>) -> Rc<Expr> {
    unary(UnaryOp::Not, e)
}

/// Deep equality over manifested structure: arrays element-wise, objects by
/// their visible fields, primitives via `primitiveEquals` (which rejects
/// functions).
fn equals_fn() -> Rc<Expr> {
    let arr_go = func(
        &["i"],
        cond(
            prim_eq(var("i"), var("la")),
            boolean(true),
            cond(
                ast::eq(index(var("a"), var("i")), index(var("b"), var("i"))),
                apply(var("go"), vec![add(var("i"), num(1.0))]),
                boolean(false),
            ),
        ),
    );
    let array_branch = local(
        vec![
            ("la", std_call("length", vec![var("a")])),
            ("lb", std_call("length", vec![var("b")])),
        ],
        cond(
            not(prim_eq(var("la"), var("lb"))),
            boolean(false),
            local(vec![("go", arr_go)], apply(var("go"), vec![num(0.0)])),
        ),
    );

    let obj_go = func(
        &["i"],
        cond(
            prim_eq(var("i"), std_call("length", vec![var("fa")])),
            boolean(true),
            cond(
                ast::eq(
                    index(var("a"), index(var("fa"), var("i"))),
                    index(var("b"), index(var("fa"), var("i"))),
                ),
                apply(var("go"), vec![add(var("i"), num(1.0))]),
                boolean(false),
            ),
        ),
    );
    let object_branch = local(
        vec![
            (
                "fa",
                std_call("objectFieldsEx", vec![var("a"), boolean(false)]),
            ),
            (
                "fb",
                std_call("objectFieldsEx", vec![var("b"), boolean(false)]),
            ),
        ],
        cond(
            not(ast::eq(var("fa"), var("fb"))),
            boolean(false),
            local(vec![("go", obj_go)], apply(var("go"), vec![num(0.0)])),
        ),
    );

    func(
        &["a", "b"],
        local(
            vec![
                ("ta", std_call("type", vec![var("a")])),
                ("tb", std_call("type", vec![var("b")])),
            ],
            cond(
                not(prim_eq(var("ta"), var("tb"))),
                boolean(false),
                cond(
                    prim_eq(var("ta"), text("array")),
                    array_branch,
                    cond(
                        prim_eq(var("ta"), text("object")),
                        object_branch,
                        prim_eq(var("a"), var("b")),
                    ),
                ),
            ),
        ),
    )
}

/// Build the `std` object: one hidden field per builtin, plus `equals`.
pub fn std_object() -> Rc<Expr> {
    let mut fields = Vec::new();
    for b in Builtin::ALL {
        fields.push(obj_field(Hide::Hidden, text(b.name()), ast::builtin_fn(b)));
    }
    fields.push(obj_field(Hide::Hidden, text("equals"), equals_fn()));
    object(fields, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ident, ExprKind};

    #[test]
    fn std_has_a_field_per_builtin_plus_equals() {
        let std = std_object();
        let ExprKind::Object { fields, asserts } = &std.kind else {
            panic!("std is an object literal");
        };
        assert_eq!(fields.len(), Builtin::ALL.len() + 1);
        assert!(asserts.is_empty());
        assert!(fields.iter().all(|f| f.hide == Hide::Hidden));
    }

    #[test]
    fn equals_refers_back_to_std() {
        // The self-reference is what makes `local std = ...` tie the knot.
        let std = std_object();
        assert_eq!(std.free_vars, vec![ident("std")]);
    }
}
