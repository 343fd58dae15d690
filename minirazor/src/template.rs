use std::path::Path;
use std::sync::Arc;
use std::{fmt, io};

use serde::Serialize;

use crate::backend::Artifact;
use crate::compiler::instructions::Program;
use crate::engine::Engine;
use crate::error::{Diagnostic, Error};
use crate::generator::ModelType;
use crate::key::TemplateKey;
use crate::output::{Output, WriteWrapper};
use crate::value::Value;
use crate::vm::ViewBag;

/// A template that went through code generation and the compiler backend.
///
/// Compiled templates are what the cache stores.  They are immutable and
/// shared between all concurrent runs.  If the backend produced an artifact
/// it lives as long as the compiled template.
pub struct CompiledTemplate {
    key: TemplateKey,
    program: Program,
    source: Arc<str>,
    program_text: Arc<str>,
    diagnostics: Vec<Diagnostic>,
    artifact: Option<Artifact>,
}

impl fmt::Debug for CompiledTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledTemplate")
            .field("key", &self.key)
            .field("model_type", &self.program.model_type)
            .field("diagnostics", &self.diagnostics)
            .field("artifact", &self.artifact)
            .finish()
    }
}

impl CompiledTemplate {
    pub(crate) fn new(
        key: TemplateKey,
        program: Program,
        source: Arc<str>,
        program_text: Arc<str>,
        diagnostics: Vec<Diagnostic>,
        artifact: Option<Artifact>,
    ) -> CompiledTemplate {
        CompiledTemplate {
            key,
            program,
            source,
            program_text,
            diagnostics,
            artifact,
        }
    }

    /// Returns the key the template was compiled for.
    pub fn key(&self) -> &TemplateKey {
        &self.key
    }

    /// Returns the template source.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn source_arc(&self) -> Arc<str> {
        self.source.clone()
    }

    /// Returns the program listing the code generator produced.
    pub fn program_text(&self) -> &str {
        &self.program_text
    }

    /// Returns the warnings reported while compiling.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Returns the path of the backing artifact if one is kept.
    pub fn artifact_path(&self) -> Option<&Path> {
        self.artifact.as_ref().map(|x| x.path())
    }

    /// Returns the model type the template was compiled for.
    pub fn model_type(&self) -> &ModelType {
        &self.program.model_type
    }

    pub(crate) fn program(&self) -> &Program {
        &self.program
    }
}

/// A handle to a compiled template bound to its engine.
///
/// Handles are cheap to clone.  Layouts and includes are resolved through
/// the engine every time the template runs.
///
/// ```
/// # use minirazor::{Engine, ModelType};
/// let engine = Engine::new();
/// engine.add_template("greet", "Hi @Model.Name").unwrap();
/// let tmpl = engine.compile("greet", ModelType::Dynamic).unwrap();
/// let model = serde_json::json!({"Name": "Ana"});
/// assert_eq!(tmpl.render(&model).unwrap(), "Hi Ana");
/// ```
#[derive(Clone)]
pub struct Template<'env> {
    engine: &'env Engine,
    compiled: Arc<CompiledTemplate>,
}

impl fmt::Debug for Template<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("key", self.key())
            .field("model_type", self.compiled.model_type())
            .finish()
    }
}

impl<'env> Template<'env> {
    pub(crate) fn new(engine: &'env Engine, compiled: Arc<CompiledTemplate>) -> Template<'env> {
        Template { engine, compiled }
    }

    /// Returns the name of the template.
    pub fn name(&self) -> &str {
        self.compiled.key().name()
    }

    /// Returns the key of the template.
    pub fn key(&self) -> &TemplateKey {
        self.compiled.key()
    }

    /// Returns the underlying compiled template.
    pub fn compiled(&self) -> &Arc<CompiledTemplate> {
        &self.compiled
    }

    /// Renders the template with a fresh view bag.
    ///
    /// **Note on values:** The [`Value`] type implements `Serialize` and can be
    /// efficiently passed to render.  It does not undergo actual serialization.
    pub fn render<S: Serialize>(&self, model: S) -> Result<String, Error> {
        self._render(Value::from_serialize(&model), ViewBag::new())
    }

    /// Renders the template with a caller supplied view bag.
    ///
    /// Everything the run writes into the bag is visible through `bag`
    /// afterwards.
    pub fn render_with_bag<S: Serialize>(&self, model: S, bag: &ViewBag) -> Result<String, Error> {
        self._render(Value::from_serialize(&model), bag.clone())
    }

    fn _render(&self, model: Value, bag: ViewBag) -> Result<String, Error> {
        let mut rv = String::new();
        ok!(self
            .engine
            .render_into(&self.compiled, model, bag, &mut Output::new(&mut rv)));
        Ok(rv)
    }

    /// Renders the template into a [`fmt::Write`].
    pub fn render_to_fmt<S: Serialize, W: fmt::Write>(&self, model: S, w: &mut W) -> Result<(), Error> {
        self.engine.render_into(
            &self.compiled,
            Value::from_serialize(&model),
            ViewBag::new(),
            &mut Output::new(w),
        )
    }

    /// Renders the template into an [`io::Write`].
    ///
    /// Layouts need the complete output of the templates they wrap, so the
    /// output of a run with a layout reaches the writer once the outermost
    /// layout runs.
    pub fn render_to_write<S: Serialize, W: io::Write>(&self, model: S, w: W) -> Result<(), Error> {
        let mut wrapper = WriteWrapper::new(w);
        self.engine
            .render_into(
                &self.compiled,
                Value::from_serialize(&model),
                ViewBag::new(),
                &mut Output::new(&mut wrapper),
            )
            .map_err(|err| wrapper.take_err(err))
    }
}
