//! JSON manifestation: forcing values all the way down to text.
//!
//! Manifesting means evaluating and binding the remaining lazy parts of a
//! value, which can trigger a collection at any point. Containers being
//! walked are therefore stashed into the value slot of the call frame pushed
//! for each element or field, so they stay rooted while their contents
//! evaluate.

use std::collections::BTreeMap;

use crate::ast::{Ident, Span};
use crate::error::{ErrorKind, RuntimeError};
use crate::eval::Interpreter;
use crate::heap::{Bindings, Value};

/// Render a number the way the language prints it: the shortest decimal
/// form that round-trips, with no trailing `.0` on integral values.
pub fn unparse_number(v: f64) -> String {
    format!("{}", v)
}

/// Quote and escape a string as a JSON string literal.
pub fn escape_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

impl Interpreter {
    /// Manifest the scratch value as JSON text. With `multiline`, arrays
    /// and objects nest with three-space indentation; otherwise they print
    /// on one line with `", "` separators.
    pub(crate) fn manifest_json(
        &mut self,
        span: &Span,
        multiline: bool,
        indent: &str,
    ) -> Result<String, RuntimeError> {
        let mut out = String::new();
        match self.scratch {
            Value::Array(arr) => {
                let elements = self.heap.array(arr).clone();
                if elements.is_empty() {
                    out.push_str("[ ]");
                } else {
                    let indent2 = if multiline {
                        format!("{}   ", indent)
                    } else {
                        indent.to_string()
                    };
                    let mut prefix = if multiline { "[\n" } else { "[" };
                    for th in elements {
                        let tspan = self
                            .heap
                            .thunk(th)
                            .body
                            .as_ref()
                            .map(|b| b.span.clone())
                            .unwrap_or_else(|| span.clone());
                        if self.heap.thunk(th).filled {
                            let content = self.heap.thunk(th).content;
                            self.stack.new_call(
                                &self.heap,
                                span.clone(),
                                Some(th),
                                None,
                                0,
                                Bindings::new(),
                            )?;
                            // Keep the array alive while scratch holds the
                            // element.
                            self.stack.top_mut().val = self.scratch;
                            self.scratch = content;
                        } else {
                            let body = self.push_thunk_call(span.clone(), th)?;
                            self.stack.top_mut().val = self.scratch;
                            let depth = self.stack.len();
                            self.evaluate(body, depth)?;
                        }
                        let element = self.manifest_json(&tspan, multiline, &indent2)?;
                        self.scratch = self.stack.top().val;
                        self.stack.pop();
                        out.push_str(prefix);
                        out.push_str(&indent2);
                        out.push_str(&element);
                        prefix = if multiline { ",\n" } else { ", " };
                    }
                    out.push_str(if multiline { "\n" } else { "" });
                    out.push_str(indent);
                    out.push(']');
                }
            }

            Value::Bool(b) => out.push_str(if b { "true" } else { "false" }),

            Value::Num(v) => out.push_str(&unparse_number(v)),

            Value::Func(_) => return Err(self.error(span, ErrorKind::ManifestFunction)),

            Value::Null => out.push_str("null"),

            Value::Object(obj) => {
                self.run_invariants(span, obj)?;
                let mut fields: Vec<(String, Ident)> = self
                    .visible_fields(obj, true)
                    .into_iter()
                    .map(|id| (id.as_ref().clone(), id))
                    .collect();
                fields.sort_by(|a, b| a.0.cmp(&b.0));
                if fields.is_empty() {
                    out.push_str("{ }");
                } else {
                    let indent2 = if multiline {
                        format!("{}   ", indent)
                    } else {
                        indent.to_string()
                    };
                    let mut prefix = if multiline { "{\n" } else { "{" };
                    for (name, fid) in fields {
                        let body = self.object_index(span, obj, fid, 0)?;
                        self.stack.top_mut().val = self.scratch;
                        let depth = self.stack.len();
                        self.evaluate(body.clone(), depth)?;
                        let vstr = self.manifest_json(&body.span, multiline, &indent2)?;
                        self.scratch = self.stack.top().val;
                        self.stack.pop();
                        out.push_str(prefix);
                        out.push_str(&indent2);
                        out.push_str(&escape_json(&name));
                        out.push_str(": ");
                        out.push_str(&vstr);
                        prefix = if multiline { ",\n" } else { ", " };
                    }
                    out.push_str(if multiline { "\n" } else { "" });
                    out.push_str(indent);
                    out.push('}');
                }
            }

            Value::Str(s) => out.push_str(&escape_json(self.heap.string(s))),
        }
        Ok(out)
    }

    /// String-output mode: the top-level value must already be a string and
    /// is emitted verbatim.
    pub(crate) fn manifest_string(&mut self, span: &Span) -> Result<String, RuntimeError> {
        match self.scratch {
            Value::Str(s) => Ok(self.heap.string(s).to_string()),
            v => Err(self.error(
                span,
                ErrorKind::TypeMismatch(format!(
                    "expected string result, got {}",
                    v.type_name()
                )),
            )),
        }
    }

    /// Multi-file mode: the top-level object maps file names to documents.
    pub(crate) fn manifest_multi(
        &mut self,
        string_output: bool,
    ) -> Result<BTreeMap<String, String>, RuntimeError> {
        let span = Span::file_only("during manifestation");
        let obj = match self.scratch {
            Value::Object(obj) => obj,
            v => {
                return Err(self.error(
                    &span,
                    ErrorKind::TopLevelShape(format!(
                        "multi mode: top-level value was a {}, should be an object whose \
                         keys are filenames and values hold the data for that file",
                        v.type_name()
                    )),
                ))
            }
        };
        self.run_invariants(&span, obj)?;
        let mut fields: Vec<(String, Ident)> = self
            .visible_fields(obj, true)
            .into_iter()
            .map(|id| (id.as_ref().clone(), id))
            .collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));

        let mut documents = BTreeMap::new();
        for (name, fid) in fields {
            let body = self.object_index(&span, obj, fid, 0)?;
            self.stack.top_mut().val = self.scratch;
            let depth = self.stack.len();
            self.evaluate(body.clone(), depth)?;
            let doc = if string_output {
                self.manifest_string(&body.span)?
            } else {
                self.manifest_json(&body.span, true, "")?
            };
            self.scratch = self.stack.top().val;
            self.stack.pop();
            documents.insert(name, doc);
        }
        Ok(documents)
    }

    /// Stream mode: the top-level array holds one document per element.
    pub(crate) fn manifest_stream(&mut self) -> Result<Vec<String>, RuntimeError> {
        let span = Span::file_only("during manifestation");
        let arr = match self.scratch {
            Value::Array(arr) => arr,
            v => {
                return Err(self.error(
                    &span,
                    ErrorKind::TopLevelShape(format!(
                        "stream mode: top-level value was a {}, should be an array whose \
                         elements hold the data for each document in the stream",
                        v.type_name()
                    )),
                ))
            }
        };
        let elements = self.heap.array(arr).clone();
        let mut documents = Vec::with_capacity(elements.len());
        for th in elements {
            let tspan = self
                .heap
                .thunk(th)
                .body
                .as_ref()
                .map(|b| b.span.clone())
                .unwrap_or_else(|| span.clone());
            if self.heap.thunk(th).filled {
                let content = self.heap.thunk(th).content;
                self.stack
                    .new_call(&self.heap, span.clone(), Some(th), None, 0, Bindings::new())?;
                self.stack.top_mut().val = self.scratch;
                self.scratch = content;
            } else {
                let body = self.push_thunk_call(span.clone(), th)?;
                self.stack.top_mut().val = self.scratch;
                let depth = self.stack.len();
                self.evaluate(body, depth)?;
            }
            let doc = self.manifest_json(&tspan, true, "")?;
            self.scratch = self.stack.top().val;
            self.stack.pop();
            documents.push(doc);
        }
        Ok(documents)
    }
}
