use minirazor::value::Value;
use minirazor::{Engine, ErrorKind, LoaderManager, TemplateKey, ViewBag};
use serde::Serialize;

use similar_asserts::assert_eq;

fn engine(templates: &[(&str, &str)]) -> Engine {
    let engine = Engine::new();
    for (name, source) in templates {
        engine.add_template(name, source).unwrap();
    }
    engine
}

#[derive(Serialize)]
struct Page {
    #[serde(rename = "Title")]
    title: String,
}

#[test]
fn test_bag_written_before_layout_is_visible() {
    let engine = engine(&[
        ("_layout", "<title>@ViewBag.Title</title>@RenderBody()"),
        (
            "page",
            "@{ Layout = \"_layout\"; ViewBag.Title = \"Home\"; }<p>body</p>",
        ),
    ]);
    assert_eq!(
        engine.run("page", ()).unwrap(),
        "<title>Home</title><p>body</p>"
    );
}

#[test]
fn test_bag_written_in_include_is_visible_after_it() {
    let engine = engine(&[
        ("counter", "@{ ViewBag.Hits = ViewBag.Hits + 1; }"),
        (
            "page",
            "@{ ViewBag.Hits = 0; }@Include(\"counter\")@Include(\"counter\")@ViewBag.Hits",
        ),
    ]);
    assert_eq!(engine.run("page", ()).unwrap(), "2");
}

#[test]
fn test_bags_are_not_shared_between_runs() {
    let engine = engine(&[(
        "page",
        "@if (ViewBag.Seen) {seen}@{ ViewBag.Seen = true; }",
    )]);
    assert_eq!(engine.run("page", ()).unwrap(), "");
    assert_eq!(engine.run("page", ()).unwrap(), "");

    let bag = ViewBag::new();
    assert_eq!(engine.run_with_bag("page", (), &bag).unwrap(), "");
    assert_eq!(engine.run_with_bag("page", (), &bag).unwrap(), "seen");
}

#[test]
fn test_layout_gets_the_same_model() {
    let engine = engine(&[
        ("_layout", "@model Page\n<h1>@Model.Title</h1>@RenderBody()"),
        (
            "page",
            "@model Page\n@{ Layout = \"_layout\"; }<p>@Model.Title</p>",
        ),
    ]);
    let rv = engine
        .run(
            "page",
            Page {
                title: "Hi".into(),
            },
        )
        .unwrap();
    assert_eq!(rv, "<h1>Hi</h1><p>Hi</p>");
}

#[test]
fn test_incompatible_layout_model() {
    let engine = engine(&[
        ("_layout", "@model Order\n@RenderBody()"),
        ("page", "@model Page\n@{ Layout = \"_layout\"; }x"),
    ]);
    let err = engine
        .run(
            "page",
            Page {
                title: "Hi".into(),
            },
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
}

#[test]
fn test_sections() {
    let engine = engine(&[
        (
            "_layout",
            "<head>@RenderSection(\"Head\", required: false)</head>\
             @if (IsSectionDefined(\"Scripts\")) {<s>@RenderSection(\"Scripts\")</s>}\
             <body>@RenderBody()</body>",
        ),
        (
            "with",
            "@{ Layout = \"_layout\"; }@section Scripts {app.js}main",
        ),
        ("without", "@{ Layout = \"_layout\"; }main"),
    ]);
    assert_eq!(
        engine.run("with", ()).unwrap(),
        "<head></head><s>app.js</s><body>main</body>"
    );
    assert_eq!(
        engine.run("without", ()).unwrap(),
        "<head></head><body>main</body>"
    );
}

#[test]
fn test_required_section_missing() {
    let engine = engine(&[
        ("_layout", "@RenderSection(\"Scripts\")"),
        ("page", "@{ Layout = \"_layout\"; }main"),
    ]);
    let err = engine.run("page", ()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingSection);
    assert_eq!(err.name(), Some("_layout"));
}

#[test]
fn test_render_body_outside_layout() {
    let engine = engine(&[("page", "@RenderBody()")]);
    let err = engine.run("page", ()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
}

#[test]
fn test_layout_directive_and_conditional_layout() {
    let engine = engine(&[
        ("a", "A(@RenderBody())"),
        ("b", "B(@RenderBody())"),
        ("fixed", "@layout a\nx"),
        (
            "dynamic",
            "@if (Model) {@{ Layout = \"a\"; }} else {@{ Layout = \"b\"; }}x",
        ),
    ]);
    assert_eq!(engine.run("fixed", ()).unwrap(), "A(x)");
    assert_eq!(engine.run("dynamic", true).unwrap(), "A(x)");
    assert_eq!(engine.run("dynamic", false).unwrap(), "B(x)");
}

#[test]
fn test_include_with_layout() {
    let engine = engine(&[
        ("_card", "<div>@RenderBody()</div>"),
        ("card", "@{ Layout = \"_card\"; }@Model"),
        ("page", "@foreach (var x in Model) {@Include(\"card\", x)}"),
    ]);
    assert_eq!(
        engine.run("page", vec!["a", "b"]).unwrap(),
        "<div>a</div><div>b</div>"
    );
}

#[test]
fn test_keys_keep_their_context() {
    let mut engine = Engine::new();
    engine.set_manager(LoaderManager::new(|name| {
        Ok(match name {
            "shared" => Some("[shared]".into()),
            "a" => Some("a:@Include(\"shared\")".into()),
            "b" => Some("b:@Include(\"shared\")".into()),
            _ => None,
        })
    }));
    assert_eq!(engine.run("a", ()).unwrap(), "a:[shared]");
    assert_eq!(engine.run("b", ()).unwrap(), "b:[shared]");

    // the include is compiled once per including template
    let mut keys = engine
        .cached_keys()
        .iter()
        .map(TemplateKey::to_string)
        .collect::<Vec<_>>();
    keys.sort();
    insta::assert_debug_snapshot!(keys, @r###"
    [
        "a",
        "b",
        "shared (include of a)",
        "shared (include of b)",
    ]
    "###);
}

#[test]
fn test_include_missing_template() {
    let engine = engine(&[("page", "@Include(\"nope\")")]);
    let err = engine.run("page", Value::NONE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TemplateNotFound);
}
