use std::fmt;
use std::io;

use minirazor::value::Value;
use minirazor::{model, Encoding, Engine, ErrorKind, ModelType, ViewBag};
use serde::Serialize;
use serde_json::json;

use similar_asserts::assert_eq;

fn render(engine: &Engine, source: &str, model: impl Serialize) -> String {
    engine.add_template("t", source).unwrap();
    engine.run("t", model).unwrap()
}

#[test]
fn test_null_writes_nothing() {
    let engine = Engine::new();
    let model = json!({"Person": {"Forename": null}});
    assert_eq!(
        render(&engine, "<h1>Hello @Model.Person.Forename</h1>", model),
        "<h1>Hello </h1>"
    );
}

#[test]
fn test_missing_property_tolerance() {
    let mut engine = Engine::new();
    engine
        .add_template("t", "Missing: @Model.Something.SomethingElse")
        .unwrap();
    let model = json!({"Other": 1});

    let err = engine.run("t", &model).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UndefinedError);
    assert!(err.kind().is_runtime());
    assert_eq!(err.line(), Some(1));
    insta::assert_snapshot!(err.to_string(), @r###"variable or attribute undefined: object has no property "Something" (in t:1)"###);

    engine.set_allow_missing_properties_on_dynamic_model(true);
    assert_eq!(engine.run("t", &model).unwrap(), "Missing: ");
}

#[test]
fn test_typed_models_are_strict() {
    #[derive(Serialize)]
    struct Person {
        #[serde(rename = "Name")]
        name: String,
    }

    let mut engine = Engine::new();
    engine.set_allow_missing_properties_on_dynamic_model(true);
    engine
        .add_template("t", "@model Person\n@Model.Name/@Model.Age")
        .unwrap();
    let err = engine
        .run(
            "t",
            Person {
                name: "Ana".into(),
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UndefinedError);

    engine
        .add_template("t", "@Model.Name/@Model.Age")
        .unwrap();
    let rv = engine
        .run(
            "t",
            Person {
                name: "Ana".into(),
            },
        )
        .unwrap();
    assert_eq!(rv, "Ana/");
}

#[test]
fn test_model_type_is_checked() {
    #[derive(Serialize)]
    struct Order {
        id: u32,
    }

    let engine = Engine::new();
    engine.add_template("t", "@model App.Person\nhi").unwrap();
    assert_eq!(engine.run("t", ()).unwrap(), "hi");
    let err = engine.run("t", Order { id: 1 }).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    let err = engine.run("t", model! { id => 1 }).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);

    let tmpl = engine.compile("t", ModelType::Named("App.Person".into())).unwrap();
    assert_eq!(tmpl.render(()).unwrap(), "hi");
}

#[test]
fn test_control_flow() {
    let engine = Engine::new();
    let source = "@foreach (var item in Model.Items) {@if (item.Done) {[x]} else if (item.Skipped) {[-]} else {[ ]}@item.Name;}";
    let model = json!({
        "Items": [
            {"Name": "a", "Done": true, "Skipped": false},
            {"Name": "b", "Done": false, "Skipped": true},
            {"Name": "c", "Done": false, "Skipped": false},
        ]
    });
    assert_eq!(render(&engine, source, model), "[x]a;[-]b;[ ]c;");
}

#[test]
fn test_code_blocks_and_locals() {
    let engine = Engine::new();
    let source = "@{ var total = 0; var label = \"sum\"; }@foreach (var n in Model) {@{ total = total + n; }}@label=@total";
    assert_eq!(render(&engine, source, vec![1, 2, 3]), "sum=6");
}

#[test]
fn test_encoding() {
    let mut engine = Engine::new();
    let source = "@Model|@Raw(Model)|@Html.Raw(Model)";
    assert_eq!(
        render(&engine, source, "<b>"),
        "&lt;b&gt;|<b>|<b>"
    );
    engine.set_encoding(Encoding::Raw);
    assert_eq!(render(&engine, source, "<b>"), "<b>|<b>|<b>");
}

#[test]
fn test_user_functions() {
    let mut engine = Engine::new();
    engine.add_function("Upper", |_, args| {
        Ok(Value::from(args[0].to_string().to_uppercase()))
    });
    engine.add_function("Fail", |_, _| {
        Err(minirazor::Error::new(ErrorKind::InvalidOperation, "nope"))
    });
    engine.add_function("Where", |instance, _| {
        Ok(Value::from(format!("{}@{}", instance.name(), instance.level())))
    });
    assert_eq!(render(&engine, "@Upper(Model) @Where()", "hi"), "HI t@0");

    engine.add_template("t", "@Fail()").unwrap();
    let err = engine.run("t", ()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeError);
    assert!(std::error::Error::source(&err).is_some());

    engine.add_template("t", "@Nope()").unwrap();
    let err = engine.run("t", ()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UndefinedError);
}

#[test]
fn test_render_str() {
    let engine = Engine::new();
    engine.add_template("partial", "(@Model)").unwrap();
    assert_eq!(
        engine
            .render_str("@Include(\"partial\", Model * 2)", 21)
            .unwrap(),
        "(42)"
    );
    assert_eq!(engine.render_str("@Model", 1).unwrap(), "1");
    assert_eq!(engine.cached_templates(), 3);
}

#[test]
fn test_run_to_write() {
    let engine = Engine::new();
    engine.add_template("t", "Hello @Model!").unwrap();
    let mut buf = Vec::new();
    engine.run_to_write("t", "World", &mut buf).unwrap();
    assert_eq!(String::from_utf8(buf).unwrap(), "Hello World!");

    struct Closed;

    impl io::Write for Closed {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let err = engine.run_to_write("t", "World", Closed).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteFailure);
}

#[test]
fn test_render_to_fmt() {
    let engine = Engine::new();
    engine.add_template("t", "Hello @Model!").unwrap();
    let tmpl = engine.compile("t", ModelType::Dynamic).unwrap();
    let mut out = String::from("> ");
    tmpl.render_to_fmt("World", &mut out).unwrap();
    assert_eq!(out, "> Hello World!");
}

#[test]
fn test_view_bag_from_caller() {
    let engine = Engine::new();
    engine
        .add_template("t", "@ViewBag.Greeting @Model@{ ViewBag.Count = ViewBag.Count + 1; }")
        .unwrap();
    let bag = ViewBag::from_value(&Value::from_bag([
        ("Greeting", Value::from("Hi")),
        ("Count", Value::from(1)),
    ]))
    .unwrap();
    assert_eq!(engine.run_with_bag("t", "you", &bag).unwrap(), "Hi you");
    assert_eq!(bag.get("Count"), Some(Value::from(2)));
}

#[test]
fn test_debug_error_display() {
    struct Alternate<'a>(&'a minirazor::Error);

    impl fmt::Display for Alternate<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:#}", self.0)
        }
    }

    let mut engine = Engine::new();
    engine.set_debug(true);
    engine
        .add_template("t", "one\ntwo\n@Model.Name\nfour\n")
        .unwrap();
    let err = engine.run("t", model! { Other => 1 }).unwrap_err();
    insta::assert_snapshot!(Alternate(&err).to_string(), @r###"
    variable or attribute undefined: object has no property "Name" (in t:3)
    ---------------------------- Template Source -----------------------------
       1 | one
       2 | two
       3 > @Model.Name
       4 | four
    --------------------------------------------------------------------------
    "###);
}

#[test]
fn test_deep_nesting_is_a_syntax_error() {
    let engine = Engine::new();
    let source = format!("@({}1{})", "(".repeat(100_000), ")".repeat(100_000));
    engine.add_template("deep", &source).unwrap();
    let err = engine.run("deep", ()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SyntaxError);
    assert_eq!(err.name(), Some("deep"));
}
