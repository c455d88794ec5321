//! Tuff — evaluator for a pure, lazily-evaluated configuration language
//! whose values manifest as JSON.
//!
//! The crate consumes a desugared, analyzed AST (see [`ast`]) together with
//! external variables, an import resolver, and heap/stack limits, and
//! produces a single JSON document, a map from file name to document, or an
//! ordered stream of documents.

pub mod ast;
pub mod builtins;
pub mod error;
pub mod eval;
pub mod heap;
pub mod import;
pub mod manifest;
pub mod stack;
pub mod stdlib;
pub mod test_support;

pub use error::{ErrorKind, RuntimeError, TraceFrame};
pub use eval::Interpreter;
pub use heap::{Tag, Value};
pub use import::{
    FoundImport, ImportResolver, MemoryResolver, NoImports, NoLoader, SourceLoader,
};

use std::collections::HashMap;

/// An external variable: either a plain string, or code loaded through the
/// configured [`SourceLoader`] and evaluated where `std.extVar` is called.
#[derive(Debug, Clone)]
pub struct ExtVar {
    pub value: String,
    pub is_code: bool,
}

/// Evaluator configuration.
pub struct EvalOptions {
    /// Call-frame limit; exceeding it raises a stack-overflow error.
    pub max_stack: usize,
    /// Floor below which the collector never runs.
    pub gc_min_objects: usize,
    /// Ratio of live entities to last survivor count that triggers a
    /// collection. Must be above 1.
    pub gc_growth_trigger: f64,
    /// If set, the top-level result must be a string and is emitted
    /// verbatim instead of being JSON-manifested.
    pub string_output: bool,
    pub ext_vars: HashMap<String, ExtVar>,
    pub resolver: Box<dyn ImportResolver>,
    pub loader: Box<dyn SourceLoader>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            max_stack: 500,
            gc_min_objects: 1000,
            gc_growth_trigger: 2.0,
            string_output: false,
            ext_vars: HashMap::new(),
            resolver: Box::new(NoImports),
            loader: Box::new(NoLoader),
        }
    }
}

impl EvalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_stack(mut self, limit: usize) -> Self {
        self.max_stack = limit;
        self
    }

    pub fn with_gc(mut self, min_objects: usize, growth_trigger: f64) -> Self {
        self.gc_min_objects = min_objects;
        self.gc_growth_trigger = growth_trigger;
        self
    }

    pub fn with_string_output(mut self, on: bool) -> Self {
        self.string_output = on;
        self
    }

    pub fn with_ext_var(mut self, name: &str, value: &str) -> Self {
        self.ext_vars.insert(
            name.to_string(),
            ExtVar {
                value: value.to_string(),
                is_code: false,
            },
        );
        self
    }

    pub fn with_ext_code(mut self, name: &str, code: &str) -> Self {
        self.ext_vars.insert(
            name.to_string(),
            ExtVar {
                value: code.to_string(),
                is_code: true,
            },
        );
        self
    }

    pub fn with_resolver(mut self, resolver: impl ImportResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn with_loader(mut self, loader: impl SourceLoader + 'static) -> Self {
        self.loader = Box::new(loader);
        self
    }
}
