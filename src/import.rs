//! Import resolution and caching.
//!
//! The evaluator never touches the filesystem. A caller-supplied
//! [`ImportResolver`] maps `(importing directory, path)` to file content,
//! and a [`SourceLoader`] turns loaded text into an analyzed expression.
//! Both caches below exist to keep imports referentially transparent: the
//! resolver is consulted at most once per site key, and a parsed document is
//! shared across every site that resolves to the same path.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::Expr;

/// A successfully resolved import.
#[derive(Debug, Clone)]
pub struct FoundImport {
    /// The path the content was actually found at, used as the AST cache
    /// key and as the file name of spans inside the imported document.
    pub found_at: String,
    pub content: String,
}

/// Locates imported files on behalf of the evaluator.
pub trait ImportResolver {
    /// Resolve `path` as imported from a file in `base_dir`. `base_dir` is
    /// empty for the root document. Errors are human-readable reasons.
    fn resolve(&mut self, base_dir: &str, path: &str) -> Result<FoundImport, String>;
}

/// Turns source text into a desugared, analyzed expression. Used for
/// `import` and for code external variables.
pub trait SourceLoader {
    fn load(&mut self, filename: &str, content: &str) -> Result<Rc<Expr>, String>;
}

/// Resolver for configurations that must not import anything.
pub struct NoImports;

impl ImportResolver for NoImports {
    fn resolve(&mut self, _base_dir: &str, _path: &str) -> Result<FoundImport, String> {
        Err("imports are not available".to_string())
    }
}

/// Loader used when no front end is wired in.
pub struct NoLoader;

impl SourceLoader for NoLoader {
    fn load(&mut self, _filename: &str, _content: &str) -> Result<Rc<Expr>, String> {
        Err("no source loader configured".to_string())
    }
}

/// Resolver over an in-memory path → content table.
#[derive(Default)]
pub struct MemoryResolver {
    files: HashMap<String, String>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.to_string(), content.to_string());
        self
    }
}

impl ImportResolver for MemoryResolver {
    fn resolve(&mut self, base_dir: &str, path: &str) -> Result<FoundImport, String> {
        let joined = format!("{}{}", base_dir, path);
        let (found_at, content) = if let Some(c) = self.files.get(&joined) {
            (joined, c)
        } else if let Some(c) = self.files.get(path) {
            (path.to_string(), c)
        } else {
            return Err("no such file".to_string());
        };
        Ok(FoundImport {
            found_at,
            content: content.clone(),
        })
    }
}

/// Memoized import state owned by one interpreter.
#[derive(Default)]
pub struct ImportCache {
    /// `(importing directory, path)` → resolved file. One resolver call per
    /// key for the interpreter's lifetime.
    entries: HashMap<(String, String), Rc<FoundImport>>,
    /// Resolved path → analyzed document, shared across import sites.
    parsed: HashMap<String, Rc<Expr>>,
}

impl ImportCache {
    pub fn entry(&self, dir: &str, path: &str) -> Option<Rc<FoundImport>> {
        self.entries
            .get(&(dir.to_string(), path.to_string()))
            .cloned()
    }

    pub fn insert_entry(&mut self, dir: String, path: String, found: Rc<FoundImport>) {
        self.entries.insert((dir, path), found);
    }

    pub fn parsed(&self, resolved: &str) -> Option<Rc<Expr>> {
        self.parsed.get(resolved).cloned()
    }

    pub fn insert_parsed(&mut self, resolved: String, ast: Rc<Expr>) {
        self.parsed.insert(resolved, ast);
    }
}

/// Directory of a path, including the trailing slash; empty when the path
/// has no directory component.
pub fn dir_name(path: &str) -> String {
    match path.rfind('/') {
        Some(i) => path[..=i].to_string(),
        None => String::new(),
    }
}
