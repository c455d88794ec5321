//! Built-in functions, dispatched by numeric id.
//!
//! The evaluator forces every argument thunk before a builtin runs; each
//! arm then validates arity and argument tags. The declarations here give
//! each builtin its name and parameter identifiers so that builtin closures
//! carry an arity and errors can name what was called.

/// Identifier of a built-in function. The discriminant is the wire id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    MakeArray = 0,
    Pow,
    Floor,
    Ceil,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Type,
    Filter,
    ObjectHasEx,
    Length,
    ObjectFieldsEx,
    Codepoint,
    Char,
    Log,
    Exp,
    Mantissa,
    Exponent,
    Modulo,
    ExtVar,
    PrimitiveEquals,
}

impl Builtin {
    pub const ALL: [Builtin; 25] = [
        Builtin::MakeArray,
        Builtin::Pow,
        Builtin::Floor,
        Builtin::Ceil,
        Builtin::Sqrt,
        Builtin::Sin,
        Builtin::Cos,
        Builtin::Tan,
        Builtin::Asin,
        Builtin::Acos,
        Builtin::Atan,
        Builtin::Type,
        Builtin::Filter,
        Builtin::ObjectHasEx,
        Builtin::Length,
        Builtin::ObjectFieldsEx,
        Builtin::Codepoint,
        Builtin::Char,
        Builtin::Log,
        Builtin::Exp,
        Builtin::Mantissa,
        Builtin::Exponent,
        Builtin::Modulo,
        Builtin::ExtVar,
        Builtin::PrimitiveEquals,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::MakeArray => "makeArray",
            Builtin::Pow => "pow",
            Builtin::Floor => "floor",
            Builtin::Ceil => "ceil",
            Builtin::Sqrt => "sqrt",
            Builtin::Sin => "sin",
            Builtin::Cos => "cos",
            Builtin::Tan => "tan",
            Builtin::Asin => "asin",
            Builtin::Acos => "acos",
            Builtin::Atan => "atan",
            Builtin::Type => "type",
            Builtin::Filter => "filter",
            Builtin::ObjectHasEx => "objectHasEx",
            Builtin::Length => "length",
            Builtin::ObjectFieldsEx => "objectFieldsEx",
            Builtin::Codepoint => "codepoint",
            Builtin::Char => "char",
            Builtin::Log => "log",
            Builtin::Exp => "exp",
            Builtin::Mantissa => "mantissa",
            Builtin::Exponent => "exponent",
            Builtin::Modulo => "modulo",
            Builtin::ExtVar => "extVar",
            Builtin::PrimitiveEquals => "primitiveEquals",
        }
    }

    /// Parameter names, which also fix the arity.
    pub fn params(self) -> &'static [&'static str] {
        match self {
            Builtin::MakeArray => &["sz", "func"],
            Builtin::Pow => &["x", "n"],
            Builtin::Floor
            | Builtin::Ceil
            | Builtin::Sqrt
            | Builtin::Sin
            | Builtin::Cos
            | Builtin::Tan
            | Builtin::Asin
            | Builtin::Acos
            | Builtin::Atan
            | Builtin::Type
            | Builtin::Length
            | Builtin::Log
            | Builtin::Exp
            | Builtin::Mantissa
            | Builtin::Exponent => &["x"],
            Builtin::Filter => &["func", "arr"],
            Builtin::ObjectHasEx => &["obj", "fname", "hidden"],
            Builtin::ObjectFieldsEx => &["obj", "hidden"],
            Builtin::Codepoint => &["str"],
            Builtin::Char => &["n"],
            Builtin::Modulo => &["a", "b"],
            Builtin::ExtVar => &["x"],
            Builtin::PrimitiveEquals => &["a", "b"],
        }
    }
}

/// Decompose `x` into mantissa and exponent with `x = m × 2^e` and
/// `0.5 ≤ |m| < 1` (zero maps to `(0, 0)`).
pub fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || x.is_nan() || x.is_infinite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let exp_field = ((bits >> 52) & 0x7ff) as i32;
    if exp_field == 0 {
        // Subnormal: scale into the normal range first.
        let (m, e) = frexp(x * 2f64.powi(64));
        return (m, e - 64);
    }
    let e = exp_field - 1022;
    let m = f64::from_bits((bits & !(0x7ffu64 << 52)) | (1022u64 << 52));
    (m, e)
}
