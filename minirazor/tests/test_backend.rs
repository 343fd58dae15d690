use std::fs;

use minirazor::{
    ArtifactBackend, CompileRequest, Engine, Error, ErrorKind, GeneratedProgram, ModelType,
};

use similar_asserts::assert_eq;

fn artifact_engine(dir: &std::path::Path) -> Engine {
    let mut engine = Engine::new();
    engine.set_backend(ArtifactBackend::with_dir(dir));
    engine.add_template("page", "Hello @Model!").unwrap();
    engine
}

fn artifacts(dir: &std::path::Path) -> usize {
    fs::read_dir(dir).unwrap().count()
}

#[test]
fn test_locked_artifacts_live_with_the_cache_entry() {
    let dir = tempfile::tempdir().unwrap();
    let engine = artifact_engine(dir.path());
    assert_eq!(engine.run("page", "World").unwrap(), "Hello World!");
    assert_eq!(artifacts(dir.path()), 1);

    let path = engine
        .compile("page", ModelType::Dynamic)
        .unwrap()
        .compiled()
        .artifact_path()
        .map(|x| x.to_path_buf())
        .unwrap();
    assert!(path.exists());

    engine.invalidate("page");
    assert!(!path.exists());
    assert_eq!(artifacts(dir.path()), 0);
}

#[test]
fn test_unlocked_artifacts_are_deleted_right_away() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = artifact_engine(dir.path());
    engine.set_disable_artifact_locking(true);
    let tmpl = engine.compile("page", ModelType::Dynamic).unwrap();
    assert_eq!(tmpl.compiled().artifact_path(), None);
    assert_eq!(artifacts(dir.path()), 0);
    assert_eq!(tmpl.render("again").unwrap(), "Hello again!");
}

#[test]
fn test_dispose_deletes_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let engine = artifact_engine(dir.path());
    engine.add_template("other", "x").unwrap();
    engine.run("page", ()).unwrap();
    engine.run("other", ()).unwrap();
    assert_eq!(artifacts(dir.path()), 2);
    engine.dispose();
    assert_eq!(artifacts(dir.path()), 0);
    assert!(engine.is_disposed());
}

fn broken_listing(req: &CompileRequest<'_>) -> Result<GeneratedProgram, Error> {
    Ok(GeneratedProgram {
        text: format!(
            ".template {:?}\n.main\n   1 emit_raw \"ok\"\n   1 frobnicate\n.end\n",
            req.key.name()
        ),
        diagnostics: Vec::new(),
    })
}

#[test]
fn test_compile_error_carries_everything() {
    let mut engine = Engine::new();
    engine.set_code_generator(broken_listing);
    engine.add_template("page", "the source").unwrap();
    let err = engine.run("page", ()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CompileError);
    assert_eq!(err.template_source(), Some("the source"));
    assert!(err.program_text().unwrap().contains("frobnicate"));
    assert_eq!(err.diagnostics().len(), 1);
    assert_eq!(err.diagnostics()[0].line, 4);
    insta::assert_snapshot!(format!("{:#}", err), @r###"
    template compilation failed: program assembly failed with 1 error(s)
    ------------------------------ Diagnostics -------------------------------
    error at 4:6: unknown opcode "frobnicate"
         |    1 frobnicate
    --------------------------------------------------------------------------
    ---------------------------- Template Source -----------------------------
       1 > the source
    --------------------------------------------------------------------------
    "###);
}

#[test]
fn test_generator_warnings_are_kept() {
    let engine = Engine::new();
    engine
        .add_template("page", "@section Head {x}body")
        .unwrap();
    let tmpl = engine.compile("page", ModelType::Dynamic).unwrap();
    let messages = tmpl
        .compiled()
        .diagnostics()
        .iter()
        .map(|x| x.to_string())
        .collect::<Vec<_>>();
    insta::assert_debug_snapshot!(messages, @r###"
    [
        "warning at 1:1: sections are defined but the template never declares a layout",
    ]
    "###);
    assert!(tmpl.compiled().program_text().starts_with(".template \"page\""));
    assert_eq!(tmpl.compiled().source(), "@section Head {x}body");
}
