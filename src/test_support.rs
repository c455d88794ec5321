//! Helpers shared by the integration tests: one-call evaluation, error
//! assertions, and instrumented resolver/loader stubs.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{self, Expr};
use crate::error::{ErrorKind, RuntimeError};
use crate::eval::Interpreter;
use crate::import::{FoundImport, ImportResolver, MemoryResolver, SourceLoader};
use crate::EvalOptions;

/// Evaluate a program with default options and manifest it as JSON.
pub fn eval_json(program: &Rc<Expr>) -> Result<String, RuntimeError> {
    Interpreter::new(EvalOptions::default()).run(program)
}

pub fn eval_json_with(options: EvalOptions, program: &Rc<Expr>) -> Result<String, RuntimeError> {
    Interpreter::new(options).run(program)
}

pub fn assert_json(program: &Rc<Expr>, expected: &str) {
    match eval_json(program) {
        Ok(actual) => assert_eq!(actual, expected),
        Err(e) => panic!("evaluation failed: {}", e),
    }
}

pub fn assert_json_with(options: EvalOptions, program: &Rc<Expr>, expected: &str) {
    match eval_json_with(options, program) {
        Ok(actual) => assert_eq!(actual, expected),
        Err(e) => panic!("evaluation failed: {}", e),
    }
}

/// Assert evaluation fails and the error kind satisfies `check`.
pub fn assert_error<F>(program: &Rc<Expr>, check: F)
where
    F: FnOnce(&ErrorKind) -> bool,
{
    match eval_json(program) {
        Ok(v) => panic!("expected an error, got: {}", v),
        Err(e) => assert!(check(&e.kind), "wrong error: {}", e),
    }
}

pub fn assert_error_with<F>(options: EvalOptions, program: &Rc<Expr>, check: F)
where
    F: FnOnce(&ErrorKind) -> bool,
{
    match eval_json_with(options, program) {
        Ok(v) => panic!("expected an error, got: {}", v),
        Err(e) => assert!(check(&e.kind), "wrong error: {}", e),
    }
}

/// Loader stub: serves pre-registered expressions by exact content, falling
/// back to parsing the content as a number literal. Counts its calls so
/// tests can observe AST-cache hits.
pub struct TableLoader {
    table: HashMap<String, Rc<Expr>>,
    loads: Rc<Cell<usize>>,
}

impl TableLoader {
    pub fn new() -> Self {
        TableLoader {
            table: HashMap::new(),
            loads: Rc::new(Cell::new(0)),
        }
    }

    pub fn with(mut self, content: &str, expr: Rc<Expr>) -> Self {
        self.table.insert(content.to_string(), expr);
        self
    }

    /// Shared call counter, still readable after the loader moves into the
    /// interpreter.
    pub fn counter(&self) -> Rc<Cell<usize>> {
        self.loads.clone()
    }
}

impl Default for TableLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceLoader for TableLoader {
    fn load(&mut self, _filename: &str, content: &str) -> Result<Rc<Expr>, String> {
        self.loads.set(self.loads.get() + 1);
        if let Some(expr) = self.table.get(content) {
            return Ok(expr.clone());
        }
        content
            .trim()
            .parse::<f64>()
            .map(ast::num)
            .map_err(|_| format!("unparseable content: {:?}", content))
    }
}

/// Resolver wrapper that counts resolver invocations, for asserting that
/// the import cache keeps resolution referentially transparent.
pub struct CountingResolver {
    inner: MemoryResolver,
    calls: Rc<Cell<usize>>,
}

impl CountingResolver {
    pub fn new(inner: MemoryResolver) -> Self {
        CountingResolver {
            inner,
            calls: Rc::new(Cell::new(0)),
        }
    }

    pub fn counter(&self) -> Rc<Cell<usize>> {
        self.calls.clone()
    }
}

impl ImportResolver for CountingResolver {
    fn resolve(&mut self, base_dir: &str, path: &str) -> Result<FoundImport, String> {
        self.calls.set(self.calls.get() + 1);
        self.inner.resolve(base_dir, path)
    }
}
