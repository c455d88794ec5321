//! Import resolution, caching, and referential transparency.

use std::rc::Rc;

use tuff::ast::*;
use tuff::test_support::{CountingResolver, TableLoader};
use tuff::{ErrorKind, EvalOptions, Interpreter, MemoryResolver};

fn run(options: EvalOptions, program: &Rc<Expr>) -> Result<String, tuff::RuntimeError> {
    Interpreter::new(options).run(program)
}

#[test]
fn import_evaluates_the_document() {
    let resolver = MemoryResolver::new().add("x.tf", "21");
    let options = EvalOptions::default()
        .with_resolver(resolver)
        .with_loader(TableLoader::new());
    let program = add(import("x.tf"), import("x.tf"));
    assert_eq!(run(options, &program).unwrap(), "42");
}

#[test]
fn resolver_is_called_once_per_site_key() {
    let resolver = CountingResolver::new(MemoryResolver::new().add("x.tf", "21"));
    let calls = resolver.counter();
    let options = EvalOptions::default()
        .with_resolver(resolver)
        .with_loader(TableLoader::new());
    // Two sites, same importing directory: one resolution.
    let program = local(
        vec![("a", import("x.tf")), ("b", import("x.tf"))],
        add(var("a"), var("b")),
    );
    assert_eq!(run(options, &program).unwrap(), "42");
    assert_eq!(calls.get(), 1);
}

#[test]
fn parsed_documents_are_shared_by_resolved_path() {
    // The same file imported from two directories resolves twice but is
    // loaded (parsed) only once.
    let resolver = CountingResolver::new(MemoryResolver::new().add("x.tf", "21"));
    let calls = resolver.counter();
    let loader = TableLoader::new();
    let loads = loader.counter();
    let options = EvalOptions::default()
        .with_resolver(resolver)
        .with_loader(loader);

    let from_sub = Rc::new(Expr::new(
        ExprKind::Import("x.tf".to_string()),
        Span::file_only("sub/main.tf"),
    ));
    let program = add(import("x.tf"), from_sub);
    assert_eq!(run(options, &program).unwrap(), "42");
    assert_eq!(calls.get(), 2);
    assert_eq!(loads.get(), 1);
}

#[test]
fn import_failure_carries_the_path() {
    let options = EvalOptions::default()
        .with_resolver(MemoryResolver::new())
        .with_loader(TableLoader::new());
    let err = run(options, &import("missing.tf")).unwrap_err();
    match err.kind {
        ErrorKind::ImportFailure { path, reason } => {
            assert_eq!(path, "missing.tf");
            assert_eq!(reason, "no such file");
        }
        k => panic!("wrong error kind: {}", k),
    }
}

#[test]
fn unparseable_content_is_a_parse_error() {
    let resolver = MemoryResolver::new().add("bad.tf", "certainly not a number");
    let options = EvalOptions::default()
        .with_resolver(resolver)
        .with_loader(TableLoader::new());
    let err = run(options, &import("bad.tf")).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Parse(_)));
}

#[test]
fn import_str_yields_the_raw_content() {
    let resolver = MemoryResolver::new().add("data.txt", "hello");
    let options = EvalOptions::default().with_resolver(resolver);
    assert_eq!(run(options, &import_str("data.txt")).unwrap(), "\"hello\"");
}

#[test]
fn import_str_does_not_parse() {
    // No loader configured: importstr must still work.
    let resolver = MemoryResolver::new().add("data.txt", "{not valid");
    let options = EvalOptions::default().with_resolver(resolver);
    assert_eq!(
        run(options, &import_str("data.txt")).unwrap(),
        "\"{not valid\""
    );
}

#[test]
fn imported_documents_may_use_std() {
    let doc = apply(field(var("std"), "length"), vec![text("abcd")]);
    let resolver = MemoryResolver::new().add("lib.tf", "LIB");
    let loader = TableLoader::new().with("LIB", doc);
    let options = EvalOptions::default()
        .with_resolver(resolver)
        .with_loader(loader);
    assert_eq!(run(options, &import("lib.tf")).unwrap(), "4");
}

#[test]
fn imported_objects_compose_with_local_ones() {
    let doc = obj(vec![("base", num(1.0))]);
    let resolver = MemoryResolver::new().add("base.tf", "BASE");
    let loader = TableLoader::new().with("BASE", doc);
    let options = EvalOptions::default()
        .with_resolver(resolver)
        .with_loader(loader);
    let program = add(import("base.tf"), obj(vec![("extra", num(2.0))]));
    assert_eq!(
        run(options, &program).unwrap(),
        "{\n   \"base\": 1,\n   \"extra\": 2\n}"
    );
}

#[test]
fn no_imports_resolver_refuses() {
    let err = run(EvalOptions::default(), &import("x.tf")).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::ImportFailure { .. }));
}
