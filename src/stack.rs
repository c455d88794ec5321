//! The explicit continuation stack.
//!
//! Every time a subterm must be evaluated, the evaluator pushes a frame
//! recording what to do with the result. Only `Call` frames count toward the
//! stack limit; they exist wherever control jumps to a different piece of
//! user code (forcing a thunk, evaluating a field, applying a function), and
//! they are the only frames an error trace shows.

use std::rc::Rc;

use crate::ast::{Expr, Ident, Span};
use crate::error::{ErrorKind, RuntimeError, TraceFrame};
use crate::heap::{Bindings, Entity, Heap, ObjField, Ref, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `e` in `e(...)`.
    ApplyTarget,
    /// `a` in `a + b`.
    BinaryLeft,
    /// `b` in `a + b`.
    BinaryRight,
    /// Intermediate state while running `std.filter`.
    BuiltinFilter,
    /// Forcing builtin arguments strictly, one at a time.
    BuiltinForceThunks,
    /// A landing frame at every switch of user-code location.
    Call,
    /// `e` in `error e`.
    Error,
    /// `e` in `if e then a else b`.
    If,
    /// `e` in `e[x]`.
    IndexTarget,
    /// `e` in `x[e]`.
    IndexIndex,
    /// Holds the assert thunks being executed one at a time.
    Invariants,
    /// Holds thunk bindings while executing `e` in `local ...; e`.
    Local,
    /// Intermediate state while evaluating object field names.
    Object,
    /// `e` in `{ [f]: v for x in e }`.
    ObjectCompArray,
    /// Intermediate state while building a comprehension object.
    ObjectCompElement,
    /// Coercing one or both `+` operands to strings.
    StringConcat,
    /// `e` in `super[e]`.
    SuperIndex,
    /// `e` in `-e`.
    Unary,
}

/// A stack frame. Which slots are meaningful depends on `kind`; the unused
/// ones stay at their defaults and cost nothing but space.
#[derive(Debug)]
pub struct Frame {
    pub kind: FrameKind,
    /// The expression this frame resumes, when it came from one.
    pub ast: Option<Rc<Expr>>,
    /// Location, equal to the expression's span when `ast` is set.
    pub span: Span,
    /// Whether this call frame may be trimmed by the tail-call optimizer.
    pub tail_call: bool,
    pub val: Value,
    pub val2: Value,
    /// Cursor into an object literal's field list.
    pub field_idx: usize,
    /// Accumulated fields of an object literal under construction.
    pub object_fields: std::collections::HashMap<Ident, ObjField>,
    pub element_id: usize,
    /// Accumulated name → element-thunk map of a comprehension.
    pub elements: std::collections::HashMap<Ident, Ref>,
    pub thunks: Vec<Ref>,
    /// The heap entity being executed, used to name trace frames.
    pub context: Option<Ref>,
    /// The lexically nearest object, for `self`.
    pub self_obj: Option<Ref>,
    /// The super level of `self_obj` (leaves of the newest side to skip).
    pub offset: usize,
    pub bindings: Bindings,
}

impl Frame {
    pub fn new(kind: FrameKind, ast: &Rc<Expr>) -> Self {
        Frame {
            kind,
            ast: Some(ast.clone()),
            span: ast.span.clone(),
            ..Frame::at(kind, Span::default())
        }
    }

    pub fn at(kind: FrameKind, span: Span) -> Self {
        Frame {
            kind,
            ast: None,
            span,
            tail_call: false,
            val: Value::Null,
            val2: Value::Null,
            field_idx: 0,
            object_fields: std::collections::HashMap::new(),
            element_id: 0,
            elements: std::collections::HashMap::new(),
            thunks: Vec::new(),
            context: None,
            self_obj: None,
            offset: 0,
            bindings: Bindings::new(),
        }
    }

    pub fn is_call(&self) -> bool {
        self.kind == FrameKind::Call
    }

    /// Every heap reference visible from this frame.
    pub fn roots(&self, out: &mut Vec<Ref>) {
        if let Some(r) = self.val.heap_ref() {
            out.push(r);
        }
        if let Some(r) = self.val2.heap_ref() {
            out.push(r);
        }
        if let Some(r) = self.context {
            out.push(r);
        }
        if let Some(r) = self.self_obj {
            out.push(r);
        }
        out.extend(self.bindings.values().copied());
        out.extend(self.elements.values().copied());
        out.extend(self.thunks.iter().copied());
    }
}

/// The frame stack, enforcing the call-depth limit.
pub struct Stack {
    frames: Vec<Frame>,
    calls: usize,
    limit: usize,
}

impl Stack {
    pub fn new(limit: usize) -> Self {
        Stack {
            frames: Vec::new(),
            calls: 0,
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn top(&self) -> &Frame {
        self.frames.last().expect("empty stack")
    }

    pub fn top_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("empty stack")
    }

    /// Push a non-call frame.
    pub fn push(&mut self, frame: Frame) {
        debug_assert!(frame.kind != FrameKind::Call);
        self.frames.push(frame);
    }

    pub fn pop(&mut self) {
        if self.top().is_call() {
            self.calls -= 1;
        }
        self.frames.pop();
    }

    /// Nearest binding for `id`, scanning newest to oldest and stopping
    /// after the first call frame.
    pub fn look_up(&self, id: Ident) -> Option<Ref> {
        for frame in self.frames.iter().rev() {
            if let Some(r) = frame.bindings.get(&id) {
                return Some(*r);
            }
            if frame.is_call() {
                break;
            }
        }
        None
    }

    /// If the top call frame is tail-call eligible and idle (no outstanding
    /// forced thunks) and only local frames sit above it, pop them all.
    fn tail_call_trim(&mut self) {
        for i in (0..self.frames.len()).rev() {
            match self.frames[i].kind {
                FrameKind::Call => {
                    if self.frames[i].tail_call && self.frames[i].thunks.is_empty() {
                        self.frames.truncate(i);
                        self.calls -= 1;
                    }
                    return;
                }
                FrameKind::Local => {}
                _ => return,
            }
        }
    }

    /// Push a call frame, trimming first and enforcing the depth limit.
    pub fn new_call(
        &mut self,
        heap: &Heap,
        span: Span,
        context: Option<Ref>,
        self_obj: Option<Ref>,
        offset: usize,
        bindings: Bindings,
    ) -> Result<(), RuntimeError> {
        self.tail_call_trim();
        if self.calls >= self.limit {
            return Err(self.make_error(heap, &span, ErrorKind::StackOverflow));
        }
        let mut frame = Frame::at(FrameKind::Call, span);
        frame.context = context;
        frame.self_obj = self_obj;
        frame.offset = offset;
        frame.bindings = bindings;
        self.frames.push(frame);
        self.calls += 1;
        Ok(())
    }

    /// The `self`/`offset` pair of the nearest call frame.
    pub fn self_binding(&self) -> (Option<Ref>, usize) {
        for frame in self.frames.iter().rev() {
            if frame.is_call() {
                return (frame.self_obj, frame.offset);
            }
        }
        (None, 0)
    }

    /// Whether asserts for this object are already running somewhere below.
    pub fn executing_invariants(&self, obj: Ref) -> bool {
        self.frames
            .iter()
            .rev()
            .any(|f| f.kind == FrameKind::Invariants && f.self_obj == Some(obj))
    }

    pub fn roots(&self, out: &mut Vec<Ref>) {
        for frame in &self.frames {
            frame.roots(out);
        }
    }

    /// Attempt to find a name for a heap entity by scanning the bindings in
    /// the frames below `from` (staying within the current call) for a
    /// filled thunk whose content is that entity.
    fn name_of(&self, heap: &Heap, from: usize, entity: Ref) -> String {
        let mut name = String::new();
        for i in (0..from).rev() {
            for (id, th) in &self.frames[i].bindings {
                let thunk = heap.thunk(*th);
                if !thunk.filled {
                    continue;
                }
                if thunk.content.heap_ref() == Some(entity) {
                    name = id.as_ref().clone();
                }
            }
            if self.frames[i].is_call() {
                break;
            }
        }
        if name.is_empty() {
            name = "anonymous".to_string();
        }
        match heap.entity(entity) {
            Entity::Simple(_) | Entity::Comp(_) | Entity::Extended { .. } => {
                format!("object <{}>", name)
            }
            Entity::Thunk(t) => format!("thunk <{}>", t.name.as_ref()),
            Entity::Closure(c) => match c.builtin {
                Some(b) => format!("builtin function <{}>", b.name()),
                None => format!("function <{}>", name),
            },
            _ => name,
        }
    }

    /// Build an error carrying the stack trace, newest frame first.
    pub fn make_error(&self, heap: &Heap, span: &Span, kind: ErrorKind) -> RuntimeError {
        let mut trace = vec![TraceFrame {
            span: span.clone(),
            name: None,
        }];
        for i in (0..self.frames.len()).rev() {
            let frame = &self.frames[i];
            if frame.is_call() {
                if let Some(ctx) = frame.context {
                    let name = self.name_of(heap, i, ctx);
                    trace.last_mut().expect("trace is never empty").name = Some(name);
                }
                trace.push(TraceFrame {
                    span: frame.span.clone(),
                    name: None,
                });
            }
        }
        RuntimeError { kind, trace }
    }
}
