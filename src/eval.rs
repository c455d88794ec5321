//! The Tuff evaluator.
//!
//! Rather than recursing natively, [`Interpreter::evaluate`] maintains an
//! explicit stack of partially-evaluated constructs. Descending into an
//! expression pushes a frame recording what to do with the result; once a
//! subterm has produced a value (held in the `scratch` register) the top
//! frame is resumed. The loop ends when the stack returns to the depth it
//! had on entry. This keeps recursion depth bounded by the configured call
//! limit, lets tail calls trim their frames, and gives the collector an
//! exact root set at every allocation.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::ast::{self, ident, Bind, BinaryOp, Expr, ExprKind, Ident, Span, UnaryOp};
use crate::builtins::{frexp, Builtin};
use crate::error::{ErrorKind, RuntimeError};
use crate::heap::{
    Bindings, Closure, CompObject, Entity, Heap, ObjField, Ref, SimpleObject, Tag, Thunk, Value,
};
use crate::import::{dir_name, FoundImport, ImportCache};
use crate::stack::{Frame, FrameKind, Stack};
use crate::stdlib;
use crate::{EvalOptions, ExtVar};

fn as_num(v: Value) -> f64 {
    match v {
        Value::Num(n) => n,
        _ => unreachable!("argument tag was checked"),
    }
}

fn as_heap(v: Value) -> Ref {
    v.heap_ref().expect("argument tag was checked")
}

/// Holds all interpreter state and implements the language semantics.
pub struct Interpreter {
    pub(crate) heap: Heap,
    /// The value most recently computed.
    pub(crate) scratch: Value,
    pub(crate) stack: Stack,
    ext_vars: HashMap<String, ExtVar>,
    resolver: Box<dyn crate::import::ImportResolver>,
    loader: Box<dyn crate::import::SourceLoader>,
    imports: ImportCache,
    string_output: bool,
    /// Names thunks created for array elements.
    id_array_element: Ident,
    /// Names thunks created to execute invariants.
    id_invariant: Ident,
    std_ast: Rc<Expr>,
}

impl Interpreter {
    pub fn new(options: EvalOptions) -> Self {
        Interpreter {
            heap: Heap::new(options.gc_min_objects, options.gc_growth_trigger),
            scratch: Value::Null,
            stack: Stack::new(options.max_stack),
            ext_vars: options.ext_vars,
            resolver: options.resolver,
            loader: options.loader,
            imports: ImportCache::default(),
            string_output: options.string_output,
            id_array_element: ident("array_element"),
            id_invariant: ident("object_assert"),
            std_ast: stdlib::std_object(),
        }
    }

    /// Evaluate a program and manifest the result as a single document.
    pub fn run(&mut self, program: &Rc<Expr>) -> Result<String, RuntimeError> {
        let wrapped = self.with_std(program);
        self.scratch = Value::Null;
        self.evaluate(wrapped, 0)?;
        let span = Span::file_only("during manifestation");
        if self.string_output {
            self.manifest_string(&span)
        } else {
            self.manifest_json(&span, true, "")
        }
    }

    /// Evaluate a program whose top-level object maps file names to
    /// documents; manifest each field separately.
    pub fn run_multi(&mut self, program: &Rc<Expr>) -> Result<BTreeMap<String, String>, RuntimeError> {
        let wrapped = self.with_std(program);
        self.scratch = Value::Null;
        self.evaluate(wrapped, 0)?;
        let string_output = self.string_output;
        self.manifest_multi(string_output)
    }

    /// Evaluate a program whose top-level array holds a stream of
    /// documents; manifest each element separately.
    pub fn run_stream(&mut self, program: &Rc<Expr>) -> Result<Vec<String>, RuntimeError> {
        let wrapped = self.with_std(program);
        self.scratch = Value::Null;
        self.evaluate(wrapped, 0)?;
        self.manifest_stream()
    }

    /// `local std = <std object>; program`, the binding every document
    /// evaluates under.
    fn with_std(&self, program: &Rc<Expr>) -> Rc<Expr> {
        Rc::new(Expr::new(
            ExprKind::Local {
                binds: vec![Bind {
                    var: ident("std"),
                    body: self.std_ast.clone(),
                }],
                body: program.clone(),
            },
            program.span.clone(),
        ))
    }

    // ========================================================================
    // Infrastructure
    // ========================================================================

    pub(crate) fn error(&self, span: &Span, kind: ErrorKind) -> RuntimeError {
        self.stack.make_error(&self.heap, span, kind)
    }

    /// Allocate, then collect if the heap has grown past its trigger. Any
    /// value not reachable from the scratch register or a frame slot at
    /// this point is garbage.
    pub(crate) fn alloc(&mut self, entity: Entity) -> Ref {
        let r = self.heap.alloc(entity);
        if self.heap.wants_gc() {
            let mut roots = Vec::with_capacity(64);
            roots.push(r);
            if let Some(s) = self.scratch.heap_ref() {
                roots.push(s);
            }
            self.stack.roots(&mut roots);
            self.heap.collect(&roots);
        }
        r
    }

    fn check_double(&self, span: &Span, v: f64) -> Result<Value, RuntimeError> {
        if v.is_nan() {
            Err(self.error(span, ErrorKind::NumericError("not a number".to_string())))
        } else if v.is_infinite() {
            Err(self.error(span, ErrorKind::NumericError("overflow".to_string())))
        } else {
            Ok(Value::Num(v))
        }
    }

    /// Capture the in-scope thunks for the given free variables.
    fn capture(&self, free_vars: &[Ident]) -> Bindings {
        let mut env = Bindings::new();
        for fv in free_vars {
            if let Some(th) = self.stack.look_up(*fv) {
                env.insert(*fv, th);
            }
        }
        env
    }

    /// Push the call frame that forces a thunk and return its body.
    pub(crate) fn push_thunk_call(&mut self, span: Span, th: Ref) -> Result<Rc<Expr>, RuntimeError> {
        let t = self.heap.thunk(th);
        let (self_obj, offset) = (t.self_obj, t.offset);
        let body = t.body.clone().expect("unfilled thunk has a body");
        let up_values = t.up_values.clone();
        self.stack
            .new_call(&self.heap, span, Some(th), self_obj, offset, up_values)?;
        Ok(body)
    }

    // ========================================================================
    // Objects
    // ========================================================================

    fn count_leaves(&self, obj: Ref) -> usize {
        match self.heap.entity(obj) {
            Entity::Extended { left, right, .. } => {
                self.count_leaves(*left) + self.count_leaves(*right)
            }
            _ => 1,
        }
    }

    /// Walk the composition tree newest (right) to oldest, skipping the
    /// first `start` leaves, and return the first leaf with field `f`.
    /// `counter` ends at the hit leaf's newest-first index.
    fn find_field(&self, curr: Ref, f: Ident, start: usize, counter: &mut usize) -> Option<Ref> {
        match self.heap.entity(curr) {
            Entity::Extended { left, right, .. } => {
                let (left, right) = (*left, *right);
                if let Some(hit) = self.find_field(right, f, start, counter) {
                    return Some(hit);
                }
                self.find_field(left, f, start, counter)
            }
            Entity::Simple(s) => {
                if *counter >= start && s.fields.contains_key(&f) {
                    return Some(curr);
                }
                *counter += 1;
                None
            }
            Entity::Comp(c) => {
                if *counter >= start && c.elements.contains_key(&f) {
                    return Some(curr);
                }
                *counter += 1;
                None
            }
            _ => unreachable!("object tree holds only object entities"),
        }
    }

    /// Merged visibility of every field along the inheritance chain. The
    /// newest occurrence's hide wins unless it is `Inherit`, which carries
    /// the older occurrence's hide forward. With `manifesting` false, every
    /// field reports visible.
    fn field_visibility(&self, obj: Ref, manifesting: bool) -> HashMap<Ident, ast::Hide> {
        match self.heap.entity(obj) {
            Entity::Simple(s) => s
                .fields
                .iter()
                .map(|(id, fld)| {
                    let hide = if manifesting { fld.hide } else { ast::Hide::Visible };
                    (*id, hide)
                })
                .collect(),
            Entity::Comp(c) => c
                .elements
                .keys()
                .map(|id| (*id, ast::Hide::Visible))
                .collect(),
            Entity::Extended { left, right, .. } => {
                let (left, right) = (*left, *right);
                let mut merged = self.field_visibility(right, manifesting);
                for (id, hide) in self.field_visibility(left, manifesting) {
                    match merged.get(&id) {
                        None => {
                            merged.insert(id, hide);
                        }
                        Some(ast::Hide::Inherit) => {
                            merged.insert(id, hide);
                        }
                        Some(_) => {}
                    }
                }
                merged
            }
            _ => unreachable!("object tree holds only object entities"),
        }
    }

    /// Field names that survive visibility filtering.
    pub(crate) fn visible_fields(&self, obj: Ref, manifesting: bool) -> Vec<Ident> {
        self.field_visibility(obj, manifesting)
            .into_iter()
            .filter(|(_, hide)| *hide != ast::Hide::Hidden)
            .map(|(id, _)| id)
            .collect()
    }

    /// Resolve `obj[f]` starting `offset` leaves in from the newest side.
    /// On a hit, pushes the call frame for the field body (self bound to the
    /// root composite, offset to the hit leaf's super level) and returns the
    /// body to evaluate.
    pub(crate) fn object_index(
        &mut self,
        span: &Span,
        obj: Ref,
        f: Ident,
        offset: usize,
    ) -> Result<Rc<Expr>, RuntimeError> {
        let mut counter = 0;
        let Some(leaf) = self.find_field(obj, f, offset, &mut counter) else {
            return Err(self.error(span, ErrorKind::MissingField(f.as_ref().clone())));
        };
        match self.heap.entity(leaf) {
            Entity::Simple(s) => {
                let body = s.fields.get(&f).expect("hit leaf has the field").body.clone();
                let up_values = s.up_values.clone();
                self.stack
                    .new_call(&self.heap, span.clone(), Some(leaf), Some(obj), counter, up_values)?;
                Ok(body)
            }
            Entity::Comp(c) => {
                let th = *c.elements.get(&f).expect("hit leaf has the field");
                let mut bindings = c.up_values.clone();
                bindings.insert(c.id, th);
                let value = c.value.clone();
                self.stack
                    .new_call(&self.heap, span.clone(), Some(leaf), Some(obj), counter, bindings)?;
                Ok(value)
            }
            _ => unreachable!("find_field returns leaves"),
        }
    }

    fn leaves_newest_first(&self, obj: Ref, out: &mut Vec<Ref>) {
        match self.heap.entity(obj) {
            Entity::Extended { left, right, .. } => {
                let (left, right) = (*left, *right);
                self.leaves_newest_first(right, out);
                self.leaves_newest_first(left, out);
            }
            _ => out.push(obj),
        }
    }

    /// Allocate assert thunks for every leaf into the top frame's thunk
    /// list, each bound to the root as `self` with the leaf's super level
    /// as offset, ordered oldest leaf first.
    fn collect_invariants(&mut self, root: Ref) {
        let mut leaves = Vec::new();
        self.leaves_newest_first(root, &mut leaves);
        for (idx, leaf) in leaves.iter().enumerate().rev() {
            let (asserts, up_values) = match self.heap.entity(*leaf) {
                Entity::Simple(s) => (s.asserts.clone(), s.up_values.clone()),
                _ => continue,
            };
            for assert in asserts {
                let th = self.alloc(Entity::Thunk(Thunk::suspended(
                    self.id_invariant,
                    Some(root),
                    idx,
                    assert,
                )));
                self.stack.top_mut().thunks.push(th);
                self.heap.thunk_mut(th).up_values = up_values.clone();
            }
        }
    }

    /// Run an object's invariants now (first manifestation path). The
    /// scratch register is preserved across the run.
    pub(crate) fn run_invariants(&mut self, span: &Span, obj: Ref) -> Result<(), RuntimeError> {
        if self.heap.object_checked(obj) || self.stack.executing_invariants(obj) {
            return Ok(());
        }
        self.heap.set_object_checked(obj);
        let initial_depth = self.stack.len();
        let mut frame = Frame::at(FrameKind::Invariants, span.clone());
        frame.self_obj = Some(obj);
        self.stack.push(frame);
        self.collect_invariants(obj);
        if self.stack.top().thunks.is_empty() {
            self.stack.pop();
            return Ok(());
        }
        let saved = self.scratch;
        let th = self.stack.top().thunks[0];
        self.stack.top_mut().element_id = 1;
        let body = self.push_thunk_call(span.clone(), th)?;
        self.evaluate(body, initial_depth)?;
        self.scratch = saved;
        Ok(())
    }

    // ========================================================================
    // Imports
    // ========================================================================

    fn import_source(&mut self, span: &Span, path: &str) -> Result<Rc<FoundImport>, RuntimeError> {
        let dir = dir_name(&span.file);
        if let Some(found) = self.imports.entry(&dir, path) {
            return Ok(found);
        }
        let found = match self.resolver.resolve(&dir, path) {
            Ok(found) => Rc::new(found),
            Err(reason) => {
                return Err(self.error(
                    span,
                    ErrorKind::ImportFailure {
                        path: path.to_string(),
                        reason,
                    },
                ))
            }
        };
        self.imports.insert_entry(dir, path.to_string(), found.clone());
        Ok(found)
    }

    fn import_file(&mut self, span: &Span, path: &str) -> Result<Rc<Expr>, RuntimeError> {
        let found = self.import_source(span, path)?;
        if let Some(parsed) = self.imports.parsed(&found.found_at) {
            return Ok(parsed);
        }
        let parsed = match self.loader.load(&found.found_at, &found.content) {
            Ok(expr) => expr,
            Err(reason) => return Err(self.error(span, ErrorKind::Parse(reason))),
        };
        // Every document evaluates under its own std binding.
        let wrapped = self.with_std(&parsed);
        self.imports.insert_parsed(found.found_at.clone(), wrapped.clone());
        Ok(wrapped)
    }

    // ========================================================================
    // Builtins
    // ========================================================================

    fn check_builtin_args(
        &self,
        span: &Span,
        b: Builtin,
        args: &[Value],
        expected: &[Tag],
    ) -> Result<(), RuntimeError> {
        let ok = args.len() == expected.len()
            && args.iter().zip(expected).all(|(a, t)| a.tag() == *t);
        if ok {
            return Ok(());
        }
        let want: Vec<&str> = expected.iter().map(|t| t.name()).collect();
        let got: Vec<&str> = args.iter().map(|a| a.type_name()).collect();
        Err(self.error(
            span,
            ErrorKind::TypeMismatch(format!(
                "builtin function {} expected ({}) but got ({})",
                b.name(),
                want.join(", "),
                got.join(", ")
            )),
        ))
    }

    /// All builtins that complete in one step (everything except `filter`
    /// and code external variables, which re-enter the driver loop).
    fn run_builtin(&mut self, span: &Span, b: Builtin, args: &[Value]) -> Result<(), RuntimeError> {
        match b {
            Builtin::MakeArray => {
                self.check_builtin_args(span, b, args, &[Tag::Num, Tag::Func])?;
                let sz = as_num(args[0]) as i64;
                if sz < 0 {
                    return Err(self.error(
                        span,
                        ErrorKind::BoundsError(format!("makeArray requires size >= 0, got {}", sz)),
                    ));
                }
                let func_ref = as_heap(args[1]);
                let func = self.heap.closure(func_ref).clone();
                if func.params.len() != 1 {
                    return Err(self.error(
                        span,
                        ErrorKind::TypeMismatch(format!(
                            "makeArray function must take 1 param, got: {}",
                            func.params.len()
                        )),
                    ));
                }
                let Some(body) = func.body.clone() else {
                    return Err(self.error(
                        span,
                        ErrorKind::TypeMismatch(
                            "makeArray function cannot be a builtin".to_string(),
                        ),
                    ));
                };
                let param = func.params[0];
                let mut elements = Vec::with_capacity(sz as usize);
                for i in 0..sz {
                    let th = self.alloc(Entity::Thunk(Thunk::suspended(
                        self.id_array_element,
                        func.self_obj,
                        func.offset,
                        body.clone(),
                    )));
                    // Keep each new thunk rooted across later allocations.
                    self.stack.top_mut().thunks.push(th);
                    self.heap.thunk_mut(th).up_values = func.up_values.clone();
                    let el = self.alloc(Entity::Thunk(Thunk::filled(param, Value::Num(i as f64))));
                    self.heap.thunk_mut(th).up_values.insert(param, el);
                    elements.push(th);
                }
                self.scratch = Value::Array(self.alloc(Entity::Array(elements)));
            }

            Builtin::Pow => {
                self.check_builtin_args(span, b, args, &[Tag::Num, Tag::Num])?;
                self.scratch = self.check_double(span, as_num(args[0]).powf(as_num(args[1])))?;
            }

            Builtin::Floor
            | Builtin::Ceil
            | Builtin::Sqrt
            | Builtin::Sin
            | Builtin::Cos
            | Builtin::Tan
            | Builtin::Asin
            | Builtin::Acos
            | Builtin::Atan
            | Builtin::Log
            | Builtin::Exp => {
                self.check_builtin_args(span, b, args, &[Tag::Num])?;
                let x = as_num(args[0]);
                let v = match b {
                    Builtin::Floor => x.floor(),
                    Builtin::Ceil => x.ceil(),
                    Builtin::Sqrt => x.sqrt(),
                    Builtin::Sin => x.sin(),
                    Builtin::Cos => x.cos(),
                    Builtin::Tan => x.tan(),
                    Builtin::Asin => x.asin(),
                    Builtin::Acos => x.acos(),
                    Builtin::Atan => x.atan(),
                    Builtin::Log => x.ln(),
                    Builtin::Exp => x.exp(),
                    _ => unreachable!(),
                };
                self.scratch = self.check_double(span, v)?;
            }

            Builtin::Type => {
                let name = args[0].type_name().to_string();
                self.scratch = Value::Str(self.alloc(Entity::Str(name)));
            }

            Builtin::ObjectHasEx => {
                self.check_builtin_args(span, b, args, &[Tag::Object, Tag::Str, Tag::Bool])?;
                let obj = as_heap(args[0]);
                let name = self.heap.string(as_heap(args[1])).to_string();
                let include_hidden = matches!(args[2], Value::Bool(true));
                let found = self
                    .visible_fields(obj, !include_hidden)
                    .iter()
                    .any(|id| id.as_ref() == &name);
                self.scratch = Value::Bool(found);
            }

            Builtin::Length => {
                let n = match args[0] {
                    Value::Object(o) => self.visible_fields(o, true).len(),
                    Value::Array(a) => self.heap.array(a).len(),
                    Value::Str(s) => self.heap.string(s).chars().count(),
                    Value::Func(f) => self.heap.closure(f).params.len(),
                    v => {
                        return Err(self.error(
                            span,
                            ErrorKind::TypeMismatch(format!(
                                "length operates on strings, objects, and arrays, got {}",
                                v.type_name()
                            )),
                        ))
                    }
                };
                self.scratch = Value::Num(n as f64);
            }

            Builtin::ObjectFieldsEx => {
                self.check_builtin_args(span, b, args, &[Tag::Object, Tag::Bool])?;
                let obj = as_heap(args[0]);
                let include_hidden = matches!(args[1], Value::Bool(true));
                let mut names: Vec<String> = self
                    .visible_fields(obj, !include_hidden)
                    .iter()
                    .map(|id| id.as_ref().clone())
                    .collect();
                names.sort();
                let arr = self.alloc(Entity::Array(Vec::new()));
                self.scratch = Value::Array(arr);
                for name in names {
                    let th = self.alloc(Entity::Thunk(Thunk::filled(
                        self.id_array_element,
                        Value::Null,
                    )));
                    self.heap.array_mut(arr).push(th);
                    let s = self.alloc(Entity::Str(name));
                    self.heap.thunk_mut(th).content = Value::Str(s);
                }
            }

            Builtin::Codepoint => {
                self.check_builtin_args(span, b, args, &[Tag::Str])?;
                let s = self.heap.string(as_heap(args[0]));
                let n = s.chars().count();
                if n != 1 {
                    return Err(self.error(
                        span,
                        ErrorKind::TypeMismatch(format!(
                            "codepoint takes a string of length 1, got length {}",
                            n
                        )),
                    ));
                }
                let c = s.chars().next().expect("length checked");
                self.scratch = Value::Num(c as u32 as f64);
            }

            Builtin::Char => {
                self.check_builtin_args(span, b, args, &[Tag::Num])?;
                let n = as_num(args[0]) as i64;
                if n < 0 {
                    return Err(self.error(
                        span,
                        ErrorKind::BoundsError(format!("codepoints must be >= 0, got {}", n)),
                    ));
                }
                let c = u32::try_from(n).ok().and_then(char::from_u32);
                let Some(c) = c else {
                    return Err(self.error(
                        span,
                        ErrorKind::BoundsError(format!("invalid unicode codepoint, got {}", n)),
                    ));
                };
                self.scratch = Value::Str(self.alloc(Entity::Str(c.to_string())));
            }

            Builtin::Mantissa => {
                self.check_builtin_args(span, b, args, &[Tag::Num])?;
                let (m, _) = frexp(as_num(args[0]));
                self.scratch = self.check_double(span, m)?;
            }

            Builtin::Exponent => {
                self.check_builtin_args(span, b, args, &[Tag::Num])?;
                let (_, e) = frexp(as_num(args[0]));
                self.scratch = Value::Num(e as f64);
            }

            Builtin::Modulo => {
                self.check_builtin_args(span, b, args, &[Tag::Num, Tag::Num])?;
                let (a, m) = (as_num(args[0]), as_num(args[1]));
                if m == 0.0 {
                    return Err(self.error(
                        span,
                        ErrorKind::NumericError("division by zero".to_string()),
                    ));
                }
                self.scratch = self.check_double(span, a % m)?;
            }

            Builtin::PrimitiveEquals => {
                if args[0].tag() != args[1].tag() {
                    self.scratch = Value::Bool(false);
                    return Ok(());
                }
                let r = match (args[0], args[1]) {
                    (Value::Bool(a), Value::Bool(b)) => a == b,
                    (Value::Num(a), Value::Num(b)) => a == b,
                    (Value::Str(a), Value::Str(b)) => self.heap.string(a) == self.heap.string(b),
                    (Value::Null, Value::Null) => true,
                    (Value::Func(_), _) => {
                        return Err(self.error(
                            span,
                            ErrorKind::TypeMismatch(
                                "cannot test equality of functions".to_string(),
                            ),
                        ))
                    }
                    (v, _) => {
                        return Err(self.error(
                            span,
                            ErrorKind::TypeMismatch(format!(
                                "primitiveEquals operates on primitive types, got {}",
                                v.type_name()
                            )),
                        ))
                    }
                };
                self.scratch = Value::Bool(r);
            }

            Builtin::Filter | Builtin::ExtVar => {
                unreachable!("handled directly by the driver loop")
            }
        }
        Ok(())
    }

    // ========================================================================
    // The driver loop
    // ========================================================================

    /// Evaluate `ast` to a value in the scratch register, returning once the
    /// stack is back down to `initial_depth`.
    pub(crate) fn evaluate(
        &mut self,
        ast: Rc<Expr>,
        initial_depth: usize,
    ) -> Result<(), RuntimeError> {
        let mut cur = ast;
        'recurse: loop {
            let node = cur.clone();

            // Descend: handle the expression, pushing a frame and recursing
            // when a subterm must be evaluated first.
            match &node.kind {
                ExprKind::Apply { target, .. } => {
                    self.stack.push(Frame::new(FrameKind::ApplyTarget, &node));
                    cur = target.clone();
                    continue 'recurse;
                }

                ExprKind::Array(elements) => {
                    let (self_obj, offset) = self.stack.self_binding();
                    let arr = self.alloc(Entity::Array(Vec::new()));
                    self.scratch = Value::Array(arr);
                    for el in elements {
                        let th = self.alloc(Entity::Thunk(Thunk::suspended(
                            self.id_array_element,
                            self_obj,
                            offset,
                            el.clone(),
                        )));
                        // Root through the array before the next allocation.
                        self.heap.array_mut(arr).push(th);
                        let captured = self.capture(&el.free_vars);
                        self.heap.thunk_mut(th).up_values = captured;
                    }
                }

                ExprKind::Binary { left, .. } => {
                    self.stack.push(Frame::new(FrameKind::BinaryLeft, &node));
                    cur = left.clone();
                    continue 'recurse;
                }

                ExprKind::Builtin(b) => {
                    let params = b.params().iter().map(|p| ident(p)).collect();
                    let r = self.alloc(Entity::Closure(Closure {
                        up_values: Bindings::new(),
                        self_obj: None,
                        offset: 0,
                        params,
                        body: None,
                        builtin: Some(*b),
                    }));
                    self.scratch = Value::Func(r);
                }

                ExprKind::Conditional { cond, .. } => {
                    self.stack.push(Frame::new(FrameKind::If, &node));
                    cur = cond.clone();
                    continue 'recurse;
                }

                ExprKind::Error(expr) => {
                    self.stack.push(Frame::new(FrameKind::Error, &node));
                    cur = expr.clone();
                    continue 'recurse;
                }

                ExprKind::Function { params, body } => {
                    let env = self.capture(&node.free_vars);
                    let (self_obj, offset) = self.stack.self_binding();
                    let r = self.alloc(Entity::Closure(Closure {
                        up_values: env,
                        self_obj,
                        offset,
                        params: params.clone(),
                        body: Some(body.clone()),
                        builtin: None,
                    }));
                    self.scratch = Value::Func(r);
                }

                ExprKind::Import(path) => {
                    let expr = self.import_file(&node.span, path)?;
                    // An imported document evaluates in its own scope.
                    self.stack.new_call(
                        &self.heap,
                        node.span.clone(),
                        None,
                        None,
                        0,
                        Bindings::new(),
                    )?;
                    cur = expr;
                    continue 'recurse;
                }

                ExprKind::ImportStr(path) => {
                    let found = self.import_source(&node.span, path)?;
                    let content = found.content.clone();
                    self.scratch = Value::Str(self.alloc(Entity::Str(content)));
                }

                ExprKind::Index { target, .. } => {
                    self.stack.push(Frame::new(FrameKind::IndexTarget, &node));
                    cur = target.clone();
                    continue 'recurse;
                }

                ExprKind::Local { binds, body } => {
                    let (self_obj, offset) = self.stack.self_binding();
                    self.stack.push(Frame::new(FrameKind::Local, &node));
                    // Allocate and bind all the thunks first, then capture
                    // their environments, so the bindings can refer to each
                    // other (and to themselves).
                    for bind in binds {
                        let th = self.alloc(Entity::Thunk(Thunk::suspended(
                            bind.var,
                            self_obj,
                            offset,
                            bind.body.clone(),
                        )));
                        self.stack.top_mut().bindings.insert(bind.var, th);
                    }
                    for bind in binds {
                        let captured = self.capture(&bind.body.free_vars);
                        let th = *self
                            .stack
                            .top()
                            .bindings
                            .get(&bind.var)
                            .expect("just bound");
                        self.heap.thunk_mut(th).up_values = captured;
                    }
                    cur = body.clone();
                    continue 'recurse;
                }

                ExprKind::LiteralBool(b) => self.scratch = Value::Bool(*b),
                ExprKind::LiteralNull => self.scratch = Value::Null,
                ExprKind::LiteralNumber(v) => {
                    self.scratch = self.check_double(&node.span, *v)?;
                }
                ExprKind::LiteralString(s) => {
                    let s = s.clone();
                    self.scratch = Value::Str(self.alloc(Entity::Str(s)));
                }

                ExprKind::Object { fields, asserts } => {
                    if fields.is_empty() {
                        let env = self.capture(&node.free_vars);
                        let r = self.alloc(Entity::Simple(SimpleObject {
                            up_values: env,
                            fields: HashMap::new(),
                            asserts: asserts.clone(),
                            checked: false,
                        }));
                        self.scratch = Value::Object(r);
                    } else {
                        self.stack.push(Frame::new(FrameKind::Object, &node));
                        cur = fields[0].name.clone();
                        continue 'recurse;
                    }
                }

                ExprKind::ObjectComp { array, .. } => {
                    self.stack.push(Frame::new(FrameKind::ObjectCompArray, &node));
                    cur = array.clone();
                    continue 'recurse;
                }

                ExprKind::SelfExpr => {
                    let (self_obj, _) = self.stack.self_binding();
                    let obj =
                        self_obj.unwrap_or_else(|| unreachable!("self outside any object"));
                    self.scratch = Value::Object(obj);
                }

                ExprKind::SuperIndex(idx) => {
                    self.stack.push(Frame::new(FrameKind::SuperIndex, &node));
                    cur = idx.clone();
                    continue 'recurse;
                }

                ExprKind::Unary { expr, .. } => {
                    self.stack.push(Frame::new(FrameKind::Unary, &node));
                    cur = expr.clone();
                    continue 'recurse;
                }

                ExprKind::Var(id) => {
                    let th = match self.stack.look_up(*id) {
                        Some(th) => th,
                        None => unreachable!(
                            "variable {} should have been bound during analysis",
                            id.as_ref()
                        ),
                    };
                    let t = self.heap.thunk(th);
                    if t.filled {
                        self.scratch = t.content;
                    } else {
                        cur = self.push_thunk_call(node.span.clone(), th)?;
                        continue 'recurse;
                    }
                }
            }

            // Unwind: complete frames with the value in scratch until the
            // stack is back to its entry depth, recursing again whenever a
            // frame needs another subterm.
            'unwind: while self.stack.len() > initial_depth {
                let kind = self.stack.top().kind;
                match kind {
                    FrameKind::ApplyTarget => {
                        let frame_ast = self.stack.top().ast.clone().expect("apply frame");
                        let ExprKind::Apply { args, tailstrict, .. } = &frame_ast.kind else {
                            unreachable!()
                        };
                        let span = frame_ast.span.clone();
                        let func_ref = match self.scratch {
                            Value::Func(r) => r,
                            v => {
                                return Err(self.error(
                                    &span,
                                    ErrorKind::TypeMismatch(format!(
                                        "only functions can be called, got {}",
                                        v.type_name()
                                    )),
                                ))
                            }
                        };
                        let func = self.heap.closure(func_ref).clone();
                        if args.len() != func.params.len() {
                            return Err(self.error(
                                &span,
                                ErrorKind::TypeMismatch(format!(
                                    "expected {} arguments, got {}",
                                    func.params.len(),
                                    args.len()
                                )),
                            ));
                        }

                        // Thunks for the arguments, capturing the caller's
                        // environment.
                        let (self_obj, offset) = self.stack.self_binding();
                        for (i, arg) in args.iter().enumerate() {
                            let th = self.alloc(Entity::Thunk(Thunk::suspended(
                                func.params[i],
                                self_obj,
                                offset,
                                arg.clone(),
                            )));
                            self.stack.top_mut().thunks.push(th);
                            let captured = self.capture(&arg.free_vars);
                            self.heap.thunk_mut(th).up_values = captured;
                        }
                        let arg_thunks = std::mem::take(&mut self.stack.top_mut().thunks);
                        self.stack.pop();

                        match func.body.clone() {
                            None => {
                                // A builtin: force the arguments first.
                                let mut frame =
                                    Frame::new(FrameKind::BuiltinForceThunks, &frame_ast);
                                frame.thunks = arg_thunks;
                                frame.val = self.scratch;
                                self.stack.push(frame);
                                continue 'unwind;
                            }
                            Some(body) => {
                                let mut bindings = func.up_values.clone();
                                for (p, th) in func.params.iter().zip(&arg_thunks) {
                                    bindings.insert(*p, *th);
                                }
                                self.stack.new_call(
                                    &self.heap,
                                    span,
                                    Some(func_ref),
                                    func.self_obj,
                                    func.offset,
                                    bindings,
                                )?;
                                if *tailstrict {
                                    self.stack.top_mut().tail_call = true;
                                    if arg_thunks.is_empty() {
                                        cur = body;
                                        continue 'recurse;
                                    }
                                    let frame = self.stack.top_mut();
                                    frame.thunks = arg_thunks;
                                    frame.val = self.scratch;
                                    continue 'unwind;
                                }
                                cur = body;
                                continue 'recurse;
                            }
                        }
                    }

                    FrameKind::BinaryLeft => {
                        let frame_ast = self.stack.top().ast.clone().expect("binary frame");
                        let ExprKind::Binary { op, right, .. } = &frame_ast.kind else {
                            unreachable!()
                        };
                        let lhs = self.scratch;
                        let mut short_circuit = false;
                        if let Value::Bool(b) = lhs {
                            match op {
                                BinaryOp::And if !b => {
                                    self.scratch = Value::Bool(false);
                                    short_circuit = true;
                                }
                                BinaryOp::Or if b => {
                                    self.scratch = Value::Bool(true);
                                    short_circuit = true;
                                }
                                _ => {}
                            }
                        }
                        if !short_circuit {
                            let frame = self.stack.top_mut();
                            frame.kind = FrameKind::BinaryRight;
                            frame.val = lhs;
                            cur = right.clone();
                            continue 'recurse;
                        }
                    }

                    FrameKind::BinaryRight => {
                        let frame_ast = self.stack.top().ast.clone().expect("binary frame");
                        let ExprKind::Binary { op, .. } = &frame_ast.kind else {
                            unreachable!()
                        };
                        let op = *op;
                        let span = frame_ast.span.clone();
                        let lhs = self.stack.top().val;
                        let rhs = self.scratch;

                        // `+` with a string on either side coerces the other.
                        if (lhs.tag() == Tag::Str || rhs.tag() == Tag::Str)
                            && op == BinaryOp::Add
                        {
                            let frame = self.stack.top_mut();
                            frame.kind = FrameKind::StringConcat;
                            frame.val2 = rhs;
                            continue 'unwind;
                        }

                        if lhs.tag() != rhs.tag() {
                            return Err(self.error(
                                &span,
                                ErrorKind::TypeMismatch(format!(
                                    "binary operator {} requires matching types, got {} and {}",
                                    op,
                                    lhs.type_name(),
                                    rhs.type_name()
                                )),
                            ));
                        }

                        match (lhs, rhs) {
                            (Value::Array(l), Value::Array(r)) => {
                                if op != BinaryOp::Add {
                                    return Err(self.binop_error(&span, op, "arrays"));
                                }
                                let mut elements = self.heap.array(l).clone();
                                elements.extend_from_slice(self.heap.array(r));
                                self.scratch = Value::Array(self.alloc(Entity::Array(elements)));
                            }

                            (Value::Bool(a), Value::Bool(b)) => {
                                self.scratch = match op {
                                    BinaryOp::And => Value::Bool(a && b),
                                    BinaryOp::Or => Value::Bool(a || b),
                                    _ => return Err(self.binop_error(&span, op, "booleans")),
                                };
                            }

                            (Value::Num(a), Value::Num(b)) => {
                                self.scratch = match op {
                                    BinaryOp::Add => self.check_double(&span, a + b)?,
                                    BinaryOp::Sub => self.check_double(&span, a - b)?,
                                    BinaryOp::Mul => self.check_double(&span, a * b)?,
                                    BinaryOp::Div => {
                                        if b == 0.0 {
                                            return Err(self.error(
                                                &span,
                                                ErrorKind::NumericError(
                                                    "division by zero".to_string(),
                                                ),
                                            ));
                                        }
                                        self.check_double(&span, a / b)?
                                    }
                                    // Shifts and bitwise ops truncate to i64;
                                    // shift amounts are masked to 0..64.
                                    BinaryOp::ShiftL => {
                                        Value::Num(((a as i64) << ((b as i64) & 63)) as f64)
                                    }
                                    BinaryOp::ShiftR => {
                                        Value::Num(((a as i64) >> ((b as i64) & 63)) as f64)
                                    }
                                    BinaryOp::BitAnd => {
                                        Value::Num(((a as i64) & (b as i64)) as f64)
                                    }
                                    BinaryOp::BitXor => {
                                        Value::Num(((a as i64) ^ (b as i64)) as f64)
                                    }
                                    BinaryOp::BitOr => {
                                        Value::Num(((a as i64) | (b as i64)) as f64)
                                    }
                                    BinaryOp::Lt => Value::Bool(a < b),
                                    BinaryOp::Lte => Value::Bool(a <= b),
                                    BinaryOp::Gt => Value::Bool(a > b),
                                    BinaryOp::Gte => Value::Bool(a >= b),
                                    _ => return Err(self.binop_error(&span, op, "numbers")),
                                };
                            }

                            (Value::Func(_), _) => {
                                return Err(self.binop_error(&span, op, "functions"))
                            }
                            (Value::Null, _) => {
                                return Err(self.binop_error(&span, op, "null"))
                            }

                            (Value::Object(l), Value::Object(r)) => {
                                if op != BinaryOp::Add {
                                    return Err(self.binop_error(&span, op, "objects"));
                                }
                                self.scratch = Value::Object(self.alloc(Entity::Extended {
                                    left: l,
                                    right: r,
                                    checked: false,
                                }));
                            }

                            (Value::Str(l), Value::Str(r)) => {
                                self.scratch = match op {
                                    BinaryOp::Add => {
                                        let joined = format!(
                                            "{}{}",
                                            self.heap.string(l),
                                            self.heap.string(r)
                                        );
                                        Value::Str(self.alloc(Entity::Str(joined)))
                                    }
                                    // Ordering on strings is codepoint-wise.
                                    BinaryOp::Lt => {
                                        Value::Bool(self.heap.string(l) < self.heap.string(r))
                                    }
                                    BinaryOp::Lte => {
                                        Value::Bool(self.heap.string(l) <= self.heap.string(r))
                                    }
                                    BinaryOp::Gt => {
                                        Value::Bool(self.heap.string(l) > self.heap.string(r))
                                    }
                                    BinaryOp::Gte => {
                                        Value::Bool(self.heap.string(l) >= self.heap.string(r))
                                    }
                                    _ => return Err(self.binop_error(&span, op, "strings")),
                                };
                            }

                            _ => unreachable!("tags already matched"),
                        }
                    }

                    FrameKind::BuiltinFilter => {
                        let frame_ast = self.stack.top().ast.clone().expect("filter frame");
                        let span = frame_ast.span.clone();
                        let keep = match self.scratch {
                            Value::Bool(b) => b,
                            v => {
                                return Err(self.error(
                                    &span,
                                    ErrorKind::TypeMismatch(format!(
                                        "filter function must return boolean, got: {}",
                                        v.type_name()
                                    )),
                                ))
                            }
                        };
                        let pred_ref = as_heap(self.stack.top().val);
                        let arr_ref = as_heap(self.stack.top().val2);
                        if keep {
                            let element_id = self.stack.top().element_id;
                            let el = self.heap.array(arr_ref)[element_id];
                            self.stack.top_mut().thunks.push(el);
                        }
                        self.stack.top_mut().element_id += 1;
                        let element_id = self.stack.top().element_id;
                        if element_id == self.heap.array(arr_ref).len() {
                            let kept = self.stack.top().thunks.clone();
                            self.scratch = Value::Array(self.alloc(Entity::Array(kept)));
                        } else {
                            let el = self.heap.array(arr_ref)[element_id];
                            let pred = self.heap.closure(pred_ref).clone();
                            let mut bindings = pred.up_values.clone();
                            bindings.insert(pred.params[0], el);
                            self.stack.new_call(
                                &self.heap,
                                span,
                                Some(pred_ref),
                                pred.self_obj,
                                pred.offset,
                                bindings,
                            )?;
                            cur = pred.body.clone().expect("filter predicate is user code");
                            continue 'recurse;
                        }
                    }

                    FrameKind::BuiltinForceThunks => {
                        let frame_ast = self.stack.top().ast.clone().expect("builtin frame");
                        let span = frame_ast.span.clone();
                        let element_id = self.stack.top().element_id;
                        let n_args = self.stack.top().thunks.len();
                        if element_id < n_args {
                            let th = self.stack.top().thunks[element_id];
                            self.stack.top_mut().element_id += 1;
                            if !self.heap.thunk(th).filled {
                                cur = self.push_thunk_call(span, th)?;
                                continue 'recurse;
                            }
                            continue 'unwind;
                        }

                        // All arguments are strict now; dispatch.
                        let func_ref = as_heap(self.stack.top().val);
                        let builtin = self.heap.closure(func_ref).builtin.expect("builtin");
                        let args: Vec<Value> = self
                            .stack
                            .top()
                            .thunks
                            .iter()
                            .map(|th| self.heap.thunk(*th).content)
                            .collect();

                        match builtin {
                            Builtin::Filter => {
                                self.check_builtin_args(
                                    &span,
                                    builtin,
                                    &args,
                                    &[Tag::Func, Tag::Array],
                                )?;
                                let pred_ref = as_heap(args[0]);
                                let arr_ref = as_heap(args[1]);
                                let pred = self.heap.closure(pred_ref).clone();
                                if pred.params.len() != 1 {
                                    return Err(self.error(
                                        &span,
                                        ErrorKind::TypeMismatch(
                                            "filter function takes 1 parameter".to_string(),
                                        ),
                                    ));
                                }
                                let Some(body) = pred.body.clone() else {
                                    return Err(self.error(
                                        &span,
                                        ErrorKind::TypeMismatch(
                                            "filter function cannot be a builtin".to_string(),
                                        ),
                                    ));
                                };
                                if self.heap.array(arr_ref).is_empty() {
                                    self.scratch =
                                        Value::Array(self.alloc(Entity::Array(Vec::new())));
                                } else {
                                    let frame = self.stack.top_mut();
                                    frame.kind = FrameKind::BuiltinFilter;
                                    frame.val = args[0];
                                    frame.val2 = args[1];
                                    frame.thunks.clear();
                                    frame.element_id = 0;
                                    let el = self.heap.array(arr_ref)[0];
                                    let mut bindings = pred.up_values.clone();
                                    bindings.insert(pred.params[0], el);
                                    self.stack.new_call(
                                        &self.heap,
                                        span,
                                        Some(pred_ref),
                                        pred.self_obj,
                                        pred.offset,
                                        bindings,
                                    )?;
                                    cur = body;
                                    continue 'recurse;
                                }
                            }

                            Builtin::ExtVar => {
                                self.check_builtin_args(&span, builtin, &args, &[Tag::Str])?;
                                let name = self.heap.string(as_heap(args[0])).to_string();
                                let Some(ext) = self.ext_vars.get(&name) else {
                                    return Err(
                                        self.error(&span, ErrorKind::UndefinedExtVar(name))
                                    );
                                };
                                let (is_code, value) = (ext.is_code, ext.value.clone());
                                if is_code {
                                    let filename = format!("<extvar:{}>", name);
                                    let expr = match self.loader.load(&filename, &value) {
                                        Ok(expr) => expr,
                                        Err(reason) => {
                                            return Err(
                                                self.error(&span, ErrorKind::Parse(reason))
                                            )
                                        }
                                    };
                                    self.stack.pop();
                                    cur = self.with_std(&expr);
                                    continue 'recurse;
                                }
                                self.scratch = Value::Str(self.alloc(Entity::Str(value)));
                            }

                            other => self.run_builtin(&span, other, &args)?,
                        }
                    }

                    FrameKind::Call => {
                        let ctx = self.stack.top().context;
                        if let Some(c) = ctx {
                            let is_thunk = matches!(self.heap.entity(c), Entity::Thunk(_));
                            let is_closure = matches!(self.heap.entity(c), Entity::Closure(_));
                            if is_thunk {
                                // Called a thunk: cache its result.
                                let v = self.scratch;
                                self.heap.thunk_mut(c).fill(v);
                            } else if is_closure {
                                let element_id = self.stack.top().element_id;
                                let n_thunks = self.stack.top().thunks.len();
                                if element_id < n_thunks {
                                    // tailstrict: force arguments in turn.
                                    let th = self.stack.top().thunks[element_id];
                                    self.stack.top_mut().element_id += 1;
                                    if !self.heap.thunk(th).filled {
                                        let span = self.stack.top().span.clone();
                                        cur = self.push_thunk_call(span, th)?;
                                        continue 'recurse;
                                    }
                                    continue 'unwind;
                                } else if n_thunks == 0 {
                                    // The body has executed; result is in
                                    // scratch.
                                } else {
                                    // Arguments forced; now the body.
                                    self.stack.top_mut().thunks.clear();
                                    self.stack.top_mut().element_id = 0;
                                    let body = self
                                        .heap
                                        .closure(c)
                                        .body
                                        .clone()
                                        .expect("user closure");
                                    cur = body;
                                    continue 'recurse;
                                }
                            }
                        }
                    }

                    FrameKind::Error => {
                        let span = self.stack.top().span.clone();
                        let msg = match self.scratch {
                            Value::Str(r) => self.heap.string(r).to_string(),
                            v => {
                                return Err(self.error(
                                    &span,
                                    ErrorKind::TypeMismatch(format!(
                                        "error message must be string, got {}",
                                        v.type_name()
                                    )),
                                ))
                            }
                        };
                        return Err(self.error(&span, ErrorKind::UserError(msg)));
                    }

                    FrameKind::If => {
                        let frame_ast = self.stack.top().ast.clone().expect("if frame");
                        let ExprKind::Conditional {
                            then_branch,
                            else_branch,
                            ..
                        } = &frame_ast.kind
                        else {
                            unreachable!()
                        };
                        let b = match self.scratch {
                            Value::Bool(b) => b,
                            v => {
                                return Err(self.error(
                                    &frame_ast.span,
                                    ErrorKind::TypeMismatch(format!(
                                        "condition must be boolean, got {}",
                                        v.type_name()
                                    )),
                                ))
                            }
                        };
                        self.stack.pop();
                        cur = if b {
                            then_branch.clone()
                        } else {
                            else_branch.clone()
                        };
                        continue 'recurse;
                    }

                    FrameKind::SuperIndex => {
                        let span = self.stack.top().span.clone();
                        let (self_obj, offset) = self.stack.self_binding();
                        let self_obj =
                            self_obj.unwrap_or_else(|| unreachable!("super outside any object"));
                        let offset = offset + 1;
                        if offset >= self.count_leaves(self_obj) {
                            return Err(self.error(&span, ErrorKind::SuperAtRoot));
                        }
                        let fid = match self.scratch {
                            Value::Str(r) => ident(self.heap.string(r)),
                            v => {
                                return Err(self.error(
                                    &span,
                                    ErrorKind::TypeMismatch(format!(
                                        "super index must be string, got {}",
                                        v.type_name()
                                    )),
                                ))
                            }
                        };
                        self.stack.pop();
                        cur = self.object_index(&span, self_obj, fid, offset)?;
                        continue 'recurse;
                    }

                    FrameKind::IndexIndex => {
                        let frame_ast = self.stack.top().ast.clone().expect("index frame");
                        let span = frame_ast.span.clone();
                        let target = self.stack.top().val;
                        match target {
                            Value::Array(arr) => {
                                let i = match self.scratch {
                                    Value::Num(d) => d as i64,
                                    v => {
                                        return Err(self.error(
                                            &span,
                                            ErrorKind::TypeMismatch(format!(
                                                "array index must be number, got {}",
                                                v.type_name()
                                            )),
                                        ))
                                    }
                                };
                                let sz = self.heap.array(arr).len() as i64;
                                if i < 0 || i >= sz {
                                    return Err(self.error(
                                        &span,
                                        ErrorKind::BoundsError(format!(
                                            "array bounds error: {} not within [0, {})",
                                            i, sz
                                        )),
                                    ));
                                }
                                let th = self.heap.array(arr)[i as usize];
                                if self.heap.thunk(th).filled {
                                    self.scratch = self.heap.thunk(th).content;
                                } else {
                                    self.stack.pop();
                                    cur = self.push_thunk_call(span, th)?;
                                    continue 'recurse;
                                }
                            }
                            Value::Object(obj) => {
                                let fid = match self.scratch {
                                    Value::Str(r) => ident(self.heap.string(r)),
                                    v => {
                                        return Err(self.error(
                                            &span,
                                            ErrorKind::TypeMismatch(format!(
                                                "object index must be string, got {}",
                                                v.type_name()
                                            )),
                                        ))
                                    }
                                };
                                self.stack.pop();
                                cur = self.object_index(&span, obj, fid, 0)?;
                                continue 'recurse;
                            }
                            Value::Str(s) => {
                                let i = match self.scratch {
                                    Value::Num(d) => d as i64,
                                    v => {
                                        return Err(self.error(
                                            &span,
                                            ErrorKind::TypeMismatch(format!(
                                                "string index must be a number, got {}",
                                                v.type_name()
                                            )),
                                        ))
                                    }
                                };
                                let sz = self.heap.string(s).chars().count() as i64;
                                if i < 0 || i >= sz {
                                    return Err(self.error(
                                        &span,
                                        ErrorKind::BoundsError(format!(
                                            "string bounds error: {} not within [0, {})",
                                            i, sz
                                        )),
                                    ));
                                }
                                let c = self
                                    .heap
                                    .string(s)
                                    .chars()
                                    .nth(i as usize)
                                    .expect("bounds checked");
                                self.scratch =
                                    Value::Str(self.alloc(Entity::Str(c.to_string())));
                            }
                            _ => unreachable!("index target was checked"),
                        }
                    }

                    FrameKind::IndexTarget => {
                        let frame_ast = self.stack.top().ast.clone().expect("index frame");
                        let ExprKind::Index { index, .. } = &frame_ast.kind else {
                            unreachable!()
                        };
                        let span = frame_ast.span.clone();
                        match self.scratch.tag() {
                            Tag::Array | Tag::Object | Tag::Str => {}
                            t => {
                                return Err(self.error(
                                    &span,
                                    ErrorKind::TypeMismatch(format!(
                                        "can only index objects, strings, and arrays, got {}",
                                        t.name()
                                    )),
                                ))
                            }
                        }
                        {
                            let frame = self.stack.top_mut();
                            frame.val = self.scratch;
                            frame.kind = FrameKind::IndexIndex;
                        }
                        // First access of an object runs its invariants
                        // before the index is even evaluated.
                        if let Value::Object(obj) = self.scratch {
                            if !self.heap.object_checked(obj)
                                && !self.stack.executing_invariants(obj)
                            {
                                self.heap.set_object_checked(obj);
                                let mut frame =
                                    Frame::at(FrameKind::Invariants, span.clone());
                                frame.self_obj = Some(obj);
                                self.stack.push(frame);
                                self.collect_invariants(obj);
                                if !self.stack.top().thunks.is_empty() {
                                    let th = self.stack.top().thunks[0];
                                    self.stack.top_mut().element_id = 1;
                                    cur = self.push_thunk_call(span, th)?;
                                    continue 'recurse;
                                }
                                self.stack.pop();
                            }
                        }
                        cur = index.clone();
                        continue 'recurse;
                    }

                    FrameKind::Invariants => {
                        let element_id = self.stack.top().element_id;
                        let n_thunks = self.stack.top().thunks.len();
                        if element_id >= n_thunks {
                            if self.stack.len() == initial_depth + 1 {
                                // Invoked by run_invariants: popping this
                                // frame finishes the run.
                            } else {
                                self.stack.pop();
                                let below =
                                    self.stack.top().ast.clone().expect("index under invariants");
                                let ExprKind::Index { index, .. } = &below.kind else {
                                    unreachable!()
                                };
                                cur = index.clone();
                                continue 'recurse;
                            }
                        } else {
                            let th = self.stack.top().thunks[element_id];
                            self.stack.top_mut().element_id += 1;
                            let span = self.stack.top().span.clone();
                            cur = self.push_thunk_call(span, th)?;
                            continue 'recurse;
                        }
                    }

                    FrameKind::Local => {
                        // Result of the body is already in scratch.
                    }

                    FrameKind::Object => {
                        let frame_ast = self.stack.top().ast.clone().expect("object frame");
                        let ExprKind::Object { fields, asserts } = &frame_ast.kind else {
                            unreachable!()
                        };
                        let span = frame_ast.span.clone();
                        if !matches!(self.scratch, Value::Null) {
                            let name = match self.scratch {
                                Value::Str(r) => self.heap.string(r).to_string(),
                                v => {
                                    return Err(self.error(
                                        &span,
                                        ErrorKind::TypeMismatch(format!(
                                            "field name must be a string, got {}",
                                            v.type_name()
                                        )),
                                    ))
                                }
                            };
                            let fid = ident(&name);
                            if self.stack.top().object_fields.contains_key(&fid) {
                                return Err(self.error(&span, ErrorKind::DuplicateField(name)));
                            }
                            let idx = self.stack.top().field_idx;
                            let entry = ObjField {
                                hide: fields[idx].hide,
                                body: fields[idx].body.clone(),
                            };
                            self.stack.top_mut().object_fields.insert(fid, entry);
                        }
                        self.stack.top_mut().field_idx += 1;
                        let idx = self.stack.top().field_idx;
                        if idx < fields.len() {
                            cur = fields[idx].name.clone();
                            continue 'recurse;
                        }
                        let env = self.capture(&frame_ast.free_vars);
                        let object_fields =
                            std::mem::take(&mut self.stack.top_mut().object_fields);
                        let r = self.alloc(Entity::Simple(SimpleObject {
                            up_values: env,
                            fields: object_fields,
                            asserts: asserts.clone(),
                            checked: false,
                        }));
                        self.scratch = Value::Object(r);
                    }

                    FrameKind::ObjectCompArray => {
                        let frame_ast = self.stack.top().ast.clone().expect("comp frame");
                        let ExprKind::ObjectComp {
                            field, value, id, ..
                        } = &frame_ast.kind
                        else {
                            unreachable!()
                        };
                        let arr = match self.scratch {
                            Value::Array(arr) => arr,
                            v => {
                                return Err(self.error(
                                    &frame_ast.span,
                                    ErrorKind::TypeMismatch(format!(
                                        "object comprehension needs array, got {}",
                                        v.type_name()
                                    )),
                                ))
                            }
                        };
                        if self.heap.array(arr).is_empty() {
                            let r = self.alloc(Entity::Comp(CompObject {
                                up_values: Bindings::new(),
                                value: value.clone(),
                                id: *id,
                                elements: HashMap::new(),
                                checked: false,
                            }));
                            self.scratch = Value::Object(r);
                        } else {
                            let first = self.heap.array(arr)[0];
                            let frame = self.stack.top_mut();
                            frame.kind = FrameKind::ObjectCompElement;
                            frame.val = self.scratch;
                            frame.bindings.insert(*id, first);
                            frame.element_id = 0;
                            cur = field.clone();
                            continue 'recurse;
                        }
                    }

                    FrameKind::ObjectCompElement => {
                        let frame_ast = self.stack.top().ast.clone().expect("comp frame");
                        let ExprKind::ObjectComp {
                            field, value, id, ..
                        } = &frame_ast.kind
                        else {
                            unreachable!()
                        };
                        let span = frame_ast.span.clone();
                        let arr = as_heap(self.stack.top().val);
                        let name = match self.scratch {
                            Value::Str(r) => self.heap.string(r).to_string(),
                            v => {
                                return Err(self.error(
                                    &span,
                                    ErrorKind::TypeMismatch(format!(
                                        "field must be string, got: {}",
                                        v.type_name()
                                    )),
                                ))
                            }
                        };
                        let fid = ident(&name);
                        if self.stack.top().elements.contains_key(&fid) {
                            return Err(self.error(&span, ErrorKind::DuplicateField(name)));
                        }
                        let element_id = self.stack.top().element_id;
                        let el = self.heap.array(arr)[element_id];
                        self.stack.top_mut().elements.insert(fid, el);
                        self.stack.top_mut().element_id += 1;
                        let element_id = self.stack.top().element_id;
                        if element_id == self.heap.array(arr).len() {
                            let env = self.capture(&frame_ast.free_vars);
                            let elements = std::mem::take(&mut self.stack.top_mut().elements);
                            let r = self.alloc(Entity::Comp(CompObject {
                                up_values: env,
                                value: value.clone(),
                                id: *id,
                                elements,
                                checked: false,
                            }));
                            self.scratch = Value::Object(r);
                        } else {
                            let el = self.heap.array(arr)[element_id];
                            self.stack.top_mut().bindings.insert(*id, el);
                            cur = field.clone();
                            continue 'recurse;
                        }
                    }

                    FrameKind::StringConcat => {
                        let frame_ast = self.stack.top().ast.clone().expect("concat frame");
                        let ExprKind::Binary { left, right, .. } = &frame_ast.kind else {
                            unreachable!()
                        };
                        let lhs = self.stack.top().val;
                        let rhs = self.stack.top().val2;
                        let ls = match lhs {
                            Value::Str(r) => self.heap.string(r).to_string(),
                            v => {
                                self.scratch = v;
                                self.manifest_json(&left.span, false, "")?
                            }
                        };
                        let rs = match rhs {
                            Value::Str(r) => self.heap.string(r).to_string(),
                            v => {
                                self.scratch = v;
                                self.manifest_json(&right.span, false, "")?
                            }
                        };
                        self.scratch =
                            Value::Str(self.alloc(Entity::Str(format!("{}{}", ls, rs))));
                    }

                    FrameKind::Unary => {
                        let frame_ast = self.stack.top().ast.clone().expect("unary frame");
                        let ExprKind::Unary { op, .. } = &frame_ast.kind else {
                            unreachable!()
                        };
                        let op = *op;
                        let span = frame_ast.span.clone();
                        match self.scratch {
                            Value::Bool(b) => {
                                if op != UnaryOp::Not {
                                    return Err(self.unop_error(&span, op, "booleans"));
                                }
                                self.scratch = Value::Bool(!b);
                            }
                            Value::Num(v) => match op {
                                UnaryOp::Plus => {}
                                UnaryOp::Minus => self.scratch = Value::Num(-v),
                                UnaryOp::BitNot => {
                                    self.scratch = Value::Num(!(v as i64) as f64)
                                }
                                UnaryOp::Not => {
                                    return Err(self.unop_error(&span, op, "numbers"))
                                }
                            },
                            v => {
                                return Err(self.error(
                                    &span,
                                    ErrorKind::TypeMismatch(format!(
                                        "unary operator {} does not operate on type {}",
                                        op,
                                        v.type_name()
                                    )),
                                ))
                            }
                        }
                    }
                }

                self.stack.pop();
            }

            return Ok(());
        }
    }

    fn binop_error(&self, span: &Span, op: BinaryOp, what: &str) -> RuntimeError {
        self.error(
            span,
            ErrorKind::TypeMismatch(format!(
                "binary operator {} does not operate on {}",
                op, what
            )),
        )
    }

    fn unop_error(&self, span: &Span, op: UnaryOp, what: &str) -> RuntimeError {
        self.error(
            span,
            ErrorKind::TypeMismatch(format!(
                "unary operator {} does not operate on {}",
                op, what
            )),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{add, num, text, var};

    fn vm() -> Interpreter {
        Interpreter::new(EvalOptions::default())
    }

    #[test]
    fn literals_evaluate_to_scratch() {
        let mut vm = vm();
        vm.evaluate(num(2.5), 0).unwrap();
        assert_eq!(vm.scratch, Value::Num(2.5));
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn arithmetic_unwinds() {
        let mut vm = vm();
        vm.evaluate(add(num(1.0), num(2.0)), 0).unwrap();
        assert_eq!(vm.scratch, Value::Num(3.0));
    }

    #[test]
    fn overflow_is_a_numeric_error() {
        let mut vm = vm();
        let err = vm.evaluate(add(num(1e308), num(1e308)), 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NumericError("overflow".to_string()));
    }

    #[test]
    fn thunk_forcing_is_memoized() {
        let mut vm = vm();
        let th = vm.heap.alloc(Entity::Thunk(Thunk::suspended(
            ident("s"),
            None,
            0,
            add(text("a"), text("b")),
        )));
        let mut frame = Frame::at(FrameKind::Local, Span::default());
        frame.bindings.insert(ident("s"), th);
        vm.stack.push(frame);
        let depth = vm.stack.len();

        vm.evaluate(var("s"), depth).unwrap();
        let first = vm.scratch;
        assert!(vm.heap.thunk(th).filled);

        // The second force returns the cached content: the very same heap
        // entity, not an equal copy.
        vm.evaluate(var("s"), depth).unwrap();
        assert_eq!(first, vm.scratch);
    }

    #[test]
    fn filled_thunks_release_their_environment() {
        let mut vm = vm();
        let th = vm.heap.alloc(Entity::Thunk(Thunk::suspended(
            ident("t"),
            None,
            0,
            num(7.0),
        )));
        let mut frame = Frame::at(FrameKind::Local, Span::default());
        frame.bindings.insert(ident("t"), th);
        vm.stack.push(frame);
        vm.evaluate(var("t"), 1).unwrap();
        let t = vm.heap.thunk(th);
        assert!(t.filled);
        assert!(t.body.is_none());
        assert!(t.up_values.is_empty());
    }
}
