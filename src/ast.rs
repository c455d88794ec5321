//! Desugared abstract syntax tree for Tuff.
//!
//! The evaluator consumes programs in this already-desugared form: object
//! sugar, `==`/`!=`, and `$` have been rewritten by the front end before an
//! `Expr` reaches it. Every node carries its source span and its cached set
//! of free variables; the builders below compute the free-variable sets
//! bottom-up so a constructed tree always arrives analyzed.

use std::fmt;
use std::rc::Rc;

use internment::Intern;

use crate::builtins::Builtin;

/// Interned identifier. Compared and hashed by pointer.
pub type Ident = Intern<String>;

/// Intern an identifier.
pub fn ident(name: &str) -> Ident {
    Intern::new(name.to_string())
}

/// A line/column position, 1-based. Zero means "unknown".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Location {
    pub line: u32,
    pub col: u32,
}

/// Source location for error reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub file: Rc<str>,
    pub begin: Location,
    pub end: Location,
}

impl Span {
    pub fn new(file: &str, begin: Location, end: Location) -> Self {
        Span {
            file: Rc::from(file),
            begin,
            end,
        }
    }

    /// A span that names a file (or phase) but no position, e.g. the
    /// synthetic location used while manifesting.
    pub fn file_only(file: &str) -> Self {
        Span {
            file: Rc::from(file),
            begin: Location::default(),
            end: Location::default(),
        }
    }
}

impl Default for Span {
    fn default() -> Self {
        Span::file_only("")
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = if self.file.is_empty() {
            "<input>"
        } else {
            &*self.file
        };
        if self.begin.line == 0 {
            return write!(f, "{}", file);
        }
        write!(f, "{}:{}:{}", file, self.begin.line, self.begin.col)?;
        if self.end != self.begin && self.end.line != 0 {
            if self.end.line == self.begin.line {
                write!(f, "-{}", self.end.col)?;
            } else {
                write!(f, "-{}:{}", self.end.line, self.end.col)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// Field visibility attribute.
///
/// `Inherit` defers to an older occurrence of the same field along the
/// inheritance chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hide {
    Visible,
    Hidden,
    Inherit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    ShiftL,
    ShiftR,
    BitAnd,
    BitXor,
    BitOr,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::ShiftL => "<<",
            BinaryOp::ShiftR => ">>",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitXor => "^",
            BinaryOp::BitOr => "|",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
    BitNot,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnaryOp::Plus => "+",
            UnaryOp::Minus => "-",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
        };
        write!(f, "{}", s)
    }
}

/// A `local` binding. Bindings in one `local` are mutually recursive.
#[derive(Debug, Clone)]
pub struct Bind {
    pub var: Ident,
    pub body: Rc<Expr>,
}

/// One field of a desugared object literal. The name is an expression; a
/// name evaluating to `null` drops the field.
#[derive(Debug, Clone)]
pub struct ObjectField {
    pub hide: Hide,
    pub name: Rc<Expr>,
    pub body: Rc<Expr>,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Function application: `target(args...)`.
    Apply {
        target: Rc<Expr>,
        args: Vec<Rc<Expr>>,
        tailstrict: bool,
    },

    /// Array literal: `[a, b, c]`. Elements evaluate lazily.
    Array(Vec<Rc<Expr>>),

    Binary {
        op: BinaryOp,
        left: Rc<Expr>,
        right: Rc<Expr>,
    },

    /// A primitive function, dispatched by id at call time.
    Builtin(Builtin),

    Conditional {
        cond: Rc<Expr>,
        then_branch: Rc<Expr>,
        else_branch: Rc<Expr>,
    },

    /// `error e` — force the message to a string and abort.
    Error(Rc<Expr>),

    Function {
        params: Vec<Ident>,
        body: Rc<Expr>,
    },

    /// `import "path"` — load, analyze, and evaluate another document.
    Import(String),

    /// `importstr "path"` — load another file verbatim as a string.
    ImportStr(String),

    Index {
        target: Rc<Expr>,
        index: Rc<Expr>,
    },

    Local {
        binds: Vec<Bind>,
        body: Rc<Expr>,
    },

    LiteralBool(bool),
    LiteralNull,
    LiteralNumber(f64),
    LiteralString(String),

    /// Desugared object literal.
    Object {
        fields: Vec<ObjectField>,
        asserts: Vec<Rc<Expr>>,
    },

    /// `{ [field]: value for id in array }`.
    ObjectComp {
        field: Rc<Expr>,
        value: Rc<Expr>,
        id: Ident,
        array: Rc<Expr>,
    },

    SelfExpr,

    /// `super[e]` — field lookup skipping the newest leaves of `self`.
    SuperIndex(Rc<Expr>),

    Unary {
        op: UnaryOp,
        expr: Rc<Expr>,
    },

    Var(Ident),
}

/// An expression with its span and cached free-variable set.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
    pub free_vars: Vec<Ident>,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        let free_vars = free_vars(&kind);
        Expr {
            kind,
            span,
            free_vars,
        }
    }
}

// ============================================================================
// Free-variable analysis
// ============================================================================

fn union(out: &mut Vec<Ident>, more: &[Ident]) {
    for id in more {
        if !out.contains(id) {
            out.push(*id);
        }
    }
}

fn remove(out: &mut Vec<Ident>, bound: &[Ident]) {
    out.retain(|id| !bound.contains(id));
}

fn free_vars(kind: &ExprKind) -> Vec<Ident> {
    let mut out = Vec::new();
    match kind {
        ExprKind::Var(id) => out.push(*id),

        ExprKind::SelfExpr
        | ExprKind::Builtin(_)
        | ExprKind::Import(_)
        | ExprKind::ImportStr(_)
        | ExprKind::LiteralBool(_)
        | ExprKind::LiteralNull
        | ExprKind::LiteralNumber(_)
        | ExprKind::LiteralString(_) => {}

        ExprKind::Apply { target, args, .. } => {
            union(&mut out, &target.free_vars);
            for arg in args {
                union(&mut out, &arg.free_vars);
            }
        }

        ExprKind::Array(elements) => {
            for el in elements {
                union(&mut out, &el.free_vars);
            }
        }

        ExprKind::Binary { left, right, .. } => {
            union(&mut out, &left.free_vars);
            union(&mut out, &right.free_vars);
        }

        ExprKind::Conditional {
            cond,
            then_branch,
            else_branch,
        } => {
            union(&mut out, &cond.free_vars);
            union(&mut out, &then_branch.free_vars);
            union(&mut out, &else_branch.free_vars);
        }

        ExprKind::Error(expr) | ExprKind::Unary { expr, .. } | ExprKind::SuperIndex(expr) => {
            union(&mut out, &expr.free_vars);
        }

        ExprKind::Function { params, body } => {
            union(&mut out, &body.free_vars);
            remove(&mut out, params);
        }

        ExprKind::Index { target, index } => {
            union(&mut out, &target.free_vars);
            union(&mut out, &index.free_vars);
        }

        ExprKind::Local { binds, body } => {
            for bind in binds {
                union(&mut out, &bind.body.free_vars);
            }
            union(&mut out, &body.free_vars);
            let bound: Vec<Ident> = binds.iter().map(|b| b.var).collect();
            remove(&mut out, &bound);
        }

        ExprKind::Object { fields, asserts } => {
            for field in fields {
                union(&mut out, &field.name.free_vars);
                union(&mut out, &field.body.free_vars);
            }
            for a in asserts {
                union(&mut out, &a.free_vars);
            }
        }

        ExprKind::ObjectComp {
            field,
            value,
            id,
            array,
        } => {
            union(&mut out, &field.free_vars);
            union(&mut out, &value.free_vars);
            remove(&mut out, &[*id]);
            union(&mut out, &array.free_vars);
        }
    }
    out
}

// ============================================================================
// Builders
// ============================================================================

fn mk(kind: ExprKind) -> Rc<Expr> {
    Rc::new(Expr::new(kind, Span::default()))
}

pub fn null() -> Rc<Expr> {
    mk(ExprKind::LiteralNull)
}

pub fn boolean(b: bool) -> Rc<Expr> {
    mk(ExprKind::LiteralBool(b))
}

pub fn num(v: f64) -> Rc<Expr> {
    mk(ExprKind::LiteralNumber(v))
}

pub fn text(s: &str) -> Rc<Expr> {
    mk(ExprKind::LiteralString(s.to_string()))
}

pub fn var(name: &str) -> Rc<Expr> {
    mk(ExprKind::Var(ident(name)))
}

pub fn array(elements: Vec<Rc<Expr>>) -> Rc<Expr> {
    mk(ExprKind::Array(elements))
}

pub fn binary(op: BinaryOp, left: Rc<Expr>, right: Rc<Expr>) -> Rc<Expr> {
    mk(ExprKind::Binary { op, left, right })
}

pub fn unary(op: UnaryOp, expr: Rc<Expr>) -> Rc<Expr> {
    mk(ExprKind::Unary { op, expr })
}

pub fn add(left: Rc<Expr>, right: Rc<Expr>) -> Rc<Expr> {
    binary(BinaryOp::Add, left, right)
}

pub fn sub(left: Rc<Expr>, right: Rc<Expr>) -> Rc<Expr> {
    binary(BinaryOp::Sub, left, right)
}

pub fn lt(left: Rc<Expr>, right: Rc<Expr>) -> Rc<Expr> {
    binary(BinaryOp::Lt, left, right)
}

pub fn cond(c: Rc<Expr>, then_branch: Rc<Expr>, else_branch: Rc<Expr>) -> Rc<Expr> {
    mk(ExprKind::Conditional {
        cond: c,
        then_branch,
        else_branch,
    })
}

pub fn error(expr: Rc<Expr>) -> Rc<Expr> {
    mk(ExprKind::Error(expr))
}

pub fn func(params: &[&str], body: Rc<Expr>) -> Rc<Expr> {
    mk(ExprKind::Function {
        params: params.iter().map(|p| ident(p)).collect(),
        body,
    })
}

pub fn apply(target: Rc<Expr>, args: Vec<Rc<Expr>>) -> Rc<Expr> {
    mk(ExprKind::Apply {
        target,
        args,
        tailstrict: false,
    })
}

pub fn apply_tailstrict(target: Rc<Expr>, args: Vec<Rc<Expr>>) -> Rc<Expr> {
    mk(ExprKind::Apply {
        target,
        args,
        tailstrict: true,
    })
}

pub fn local(binds: Vec<(&str, Rc<Expr>)>, body: Rc<Expr>) -> Rc<Expr> {
    mk(ExprKind::Local {
        binds: binds
            .into_iter()
            .map(|(name, body)| Bind {
                var: ident(name),
                body,
            })
            .collect(),
        body,
    })
}

pub fn index(target: Rc<Expr>, idx: Rc<Expr>) -> Rc<Expr> {
    mk(ExprKind::Index { target, index: idx })
}

/// `target.name` convenience.
pub fn field(target: Rc<Expr>, name: &str) -> Rc<Expr> {
    index(target, text(name))
}

pub fn self_() -> Rc<Expr> {
    mk(ExprKind::SelfExpr)
}

pub fn super_index(idx: Rc<Expr>) -> Rc<Expr> {
    mk(ExprKind::SuperIndex(idx))
}

/// `super.name` convenience.
pub fn super_field(name: &str) -> Rc<Expr> {
    super_index(text(name))
}

pub fn object(fields: Vec<ObjectField>, asserts: Vec<Rc<Expr>>) -> Rc<Expr> {
    mk(ExprKind::Object { fields, asserts })
}

pub fn obj_field(hide: Hide, name: Rc<Expr>, body: Rc<Expr>) -> ObjectField {
    ObjectField { hide, name, body }
}

/// Object literal with statically-named visible fields and no asserts.
pub fn obj(fields: Vec<(&str, Rc<Expr>)>) -> Rc<Expr> {
    object(
        fields
            .into_iter()
            .map(|(name, body)| obj_field(Hide::Visible, text(name), body))
            .collect(),
        Vec::new(),
    )
}

pub fn object_comp(field: Rc<Expr>, value: Rc<Expr>, id: &str, arr: Rc<Expr>) -> Rc<Expr> {
    mk(ExprKind::ObjectComp {
        field,
        value,
        id: ident(id),
        array: arr,
    })
}

pub fn import(path: &str) -> Rc<Expr> {
    mk(ExprKind::Import(path.to_string()))
}

pub fn import_str(path: &str) -> Rc<Expr> {
    mk(ExprKind::ImportStr(path.to_string()))
}

pub fn builtin_fn(b: Builtin) -> Rc<Expr> {
    mk(ExprKind::Builtin(b))
}

/// Deep equality, desugared to a `std.equals` call.
pub fn eq(left: Rc<Expr>, right: Rc<Expr>) -> Rc<Expr> {
    apply(field(var("std"), "equals"), vec![left, right])
}

/// Deep inequality: `!std.equals(...)`.
pub fn neq(left: Rc<Expr>, right: Rc<Expr>) -> Rc<Expr> {
    unary(UnaryOp::Not, eq(left, right))
}
