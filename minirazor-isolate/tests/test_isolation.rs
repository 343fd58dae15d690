use std::fs;
use std::time::Duration;

use minirazor::value::Value;
use minirazor::{model, EngineConfig, ErrorKind, ViewBag};
use minirazor_isolate::{IsolatedEngine, IsolationBuilder};
use serde::Serialize;
use similar_asserts::assert_eq;

fn builder() -> IsolationBuilder {
    IsolationBuilder::new(EngineConfig::default())
        .worker_program(env!("CARGO_BIN_EXE_minirazor-worker"))
        .shutdown_grace(Duration::from_secs(5))
}

fn spawn() -> IsolatedEngine {
    builder().spawn().unwrap()
}

#[derive(Serialize)]
struct Page {
    title: &'static str,
    items: Vec<&'static str>,
}

#[test]
fn test_run_across_the_boundary() {
    let engine = spawn();
    engine
        .add_template(
            "_layout",
            "<title>@ViewBag.Title</title>@RenderBody()@RenderSection(\"Foot\", false)",
        )
        .unwrap();
    engine
        .add_template(
            "page",
            "@model Page\n@{ Layout = \"_layout\"; ViewBag.Title = Model.title; }\
             @foreach (var item in Model.items) {<li>@item</li>}@section Foot {<hr>}",
        )
        .unwrap();
    let rv = engine
        .run(
            "page",
            Page {
                title: "Hi",
                items: vec!["a", "<b>"],
            },
        )
        .unwrap();
    insta::assert_snapshot!(rv, @"<title>Hi</title><li>a</li><li>&lt;b&gt;</li><hr>");
    engine.teardown().unwrap();
}

#[test]
fn test_record_types_survive() {
    let engine = spawn();
    engine.add_template("typed", "@model Page\n@Model.title").unwrap();
    let err = engine
        .run("typed", model! { title => "anonymous" })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    assert_eq!(
        engine
            .run(
                "typed",
                Page {
                    title: "typed",
                    items: vec![]
                }
            )
            .unwrap(),
        "typed"
    );
}

#[test]
fn test_view_bag_round_trip() {
    let engine = spawn();
    engine
        .add_template("page", "@{ ViewBag.Out = ViewBag.In + 1; }done")
        .unwrap();
    let bag = ViewBag::new();
    bag.set("In", 41);
    assert_eq!(engine.run_with_bag("page", (), &bag).unwrap(), "done");
    assert_eq!(bag.get("Out"), Some(Value::from(42)));
    assert_eq!(bag.get("In"), Some(Value::from(41)));
}

#[test]
fn test_worker_errors_keep_kind_and_context() {
    let engine = spawn();
    engine.add_template("broken", "line one\n@Model.Nope").unwrap();
    let err = engine.run("broken", model! { Yes => 1 }).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UndefinedError);
    assert_eq!(err.name(), Some("broken"));
    assert_eq!(err.line(), Some(2));

    let err = engine.run("missing", ()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TemplateNotFound);

    let err = engine.render_str("@if (", ()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SyntaxError);
    assert_eq!(err.template_source(), Some("@if ("));
}

#[test]
fn test_unserializable_model_fails_before_dispatch() {
    struct Handle;

    impl Serialize for Handle {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("handles cannot be serialized"))
        }
    }

    let engine = spawn();
    engine.add_template("page", "@Model").unwrap();
    let pid = engine.ping().unwrap();
    let err = engine.run("page", Handle).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    insta::assert_snapshot!(err.to_string(), @"invalid configuration: model cannot cross the process boundary");
    // the worker was not touched
    assert_eq!(engine.ping().unwrap(), pid);
}

#[test]
fn test_batch_keeps_order_and_outcomes() {
    let engine = spawn();
    engine.add_template("item", "<@Model>").unwrap();
    let names = ["item", "item", "nope", "item"];
    let models = (0..4).map(Value::from).collect::<Vec<_>>();
    let err = engine.run_many(&names, models, true).unwrap_err();
    assert_eq!(err.failures(), 1);
    assert_eq!(err.first_error().kind(), ErrorKind::TemplateNotFound);
    let outputs = err
        .outcomes()
        .iter()
        .map(|x| x.as_deref().unwrap_or("ERR"))
        .collect::<Vec<_>>();
    assert_eq!(outputs, vec!["<0>", "<1>", "ERR", "<3>"]);

    let rv = engine
        .run_many(&["item", "item"], vec![Value::from("a"), Value::from("b")], false)
        .unwrap();
    assert_eq!(rv, vec!["<a>".to_string(), "<b>".to_string()]);
}

#[test]
fn test_invalidate_and_hot_reload() {
    let engine = spawn();
    engine.add_template("page", "v1").unwrap();
    assert_eq!(engine.run("page", ()).unwrap(), "v1");
    assert_eq!(engine.invalidate("page").unwrap(), 1);
    assert_eq!(engine.invalidate("page").unwrap(), 0);
    engine.add_template("page", "v2").unwrap();
    assert_eq!(engine.run("page", ()).unwrap(), "v2");
}

#[test]
fn test_recycle_replays_templates() {
    let engine = spawn();
    engine.add_template("page", "still @Model").unwrap();
    let first = engine.ping().unwrap();
    engine.recycle().unwrap();
    assert_eq!(engine.run("page", "here").unwrap(), "still here");
    assert_ne!(engine.ping().unwrap(), first);
}

#[test]
fn test_teardown_is_idempotent() {
    let engine = spawn();
    engine.teardown().unwrap();
    engine.teardown().unwrap();
    assert!(engine.is_torn_down());
    let err = engine.run("page", ()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
}

#[test]
fn test_template_dir() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("hello.cshtml"), "Hello @Model!").unwrap();
    let engine = builder().template_dir(dir.path()).spawn().unwrap();
    assert_eq!(engine.run("hello.cshtml", "disk").unwrap(), "Hello disk!");
    let err = engine.add_template("other", "x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
}

#[cfg(unix)]
#[test]
fn test_crashing_worker_is_a_runtime_error() {
    let err = builder().worker_program("true").spawn().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);
}

#[cfg(unix)]
#[test]
fn test_protocol_garbage_is_a_runtime_error() {
    // cat echoes the request back, which is not a response
    let err = builder().worker_program("cat").spawn().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);
}
