//! Code generators turn template sources into program listings.
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::compiler::ast::ModelDecl;
use crate::compiler::codegen::Emitter;
use crate::compiler::listing::write_listing;
use crate::compiler::parser::parse;
use crate::config::Encoding;
use crate::error::{Diagnostic, Error, ErrorKind};
use crate::key::TemplateKey;

/// The model type a template is compiled for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// Any model is accepted and walked structurally.
    #[default]
    Dynamic,
    /// Only records of this type (or no model at all) are accepted.
    Named(String),
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelType::Dynamic => f.write_str("dynamic"),
            ModelType::Named(name) => f.write_str(name),
        }
    }
}

/// Everything a code generator gets to see about a template.
#[derive(Debug, Clone)]
pub struct CompileRequest<'a> {
    /// The key the template is compiled for.
    pub key: &'a TemplateKey,
    /// The template source.
    pub source: &'a str,
    /// The encoding emitted values are written with.
    pub encoding: Encoding,
    /// The model type the caller asked for.  [`ModelType::Dynamic`] lets
    /// the template decide.
    pub model_type: ModelType,
}

/// The output of a code generator.
#[derive(Debug, Clone, Default)]
pub struct GeneratedProgram {
    /// The program listing handed to the compiler backend.
    pub text: String,
    /// Warnings produced while generating.
    pub diagnostics: Vec<Diagnostic>,
}

/// Turns template sources into program text.
///
/// Generators are shared between threads and may be called concurrently
/// for different templates.
pub trait CodeGenerator: Send + Sync {
    /// Generates the program for a template.
    ///
    /// Rejected sources fail with [`ErrorKind::SyntaxError`].
    fn generate(&self, req: &CompileRequest<'_>) -> Result<GeneratedProgram, Error>;
}

impl<F> CodeGenerator for F
where
    F: Fn(&CompileRequest<'_>) -> Result<GeneratedProgram, Error> + Send + Sync,
{
    fn generate(&self, req: &CompileRequest<'_>) -> Result<GeneratedProgram, Error> {
        self(req)
    }
}

/// The built-in generator for Razor style templates.
#[derive(Debug, Default, Clone, Copy)]
pub struct RazorGenerator;

impl RazorGenerator {
    fn resolve_model_type(
        declared: Option<ModelType>,
        requested: &ModelType,
        name: &str,
        line: usize,
    ) -> Result<ModelType, Error> {
        match (declared, requested) {
            (None, requested) => Ok(requested.clone()),
            (Some(declared), ModelType::Dynamic) => Ok(declared),
            (Some(declared), requested) if declared == *requested => Ok(declared),
            (Some(declared), requested) => Err(Error::new(
                ErrorKind::CompileError,
                format!(
                    "template declares model type {} but was compiled for {}",
                    declared, requested
                ),
            )
            .with_location(name, line)),
        }
    }
}

impl CodeGenerator for RazorGenerator {
    fn generate(&self, req: &CompileRequest<'_>) -> Result<GeneratedProgram, Error> {
        let now = Instant::now();
        let name = req.key.name();
        let tmpl = ok!(parse(req.source, name));
        let (declared, line) = match tmpl.model {
            Some((ModelDecl::Dynamic, span)) => (Some(ModelType::Dynamic), span.line),
            Some((ModelDecl::Named(type_name), span)) => {
                (Some(ModelType::Named(type_name.to_string())), span.line)
            }
            None => (None, 0),
        };
        let model_type = ok!(Self::resolve_model_type(
            declared,
            &req.model_type,
            name,
            line as usize
        ));
        let (program, mut diagnostics) =
            Emitter::new(req.source).compile(&tmpl, name, model_type, req.encoding);
        if !program.sections.is_empty() && !tmpl.assigns_layout {
            diagnostics.push(Diagnostic::warning(
                "sections are defined but the template never declares a layout",
                1,
                1,
            ));
        }
        let text = ok!(write_listing(&program));
        tracing::trace!(
            template = %req.key,
            elapsed = ?now.elapsed(),
            "generated razor program"
        );
        Ok(GeneratedProgram { text, diagnostics })
    }
}

/// The syntax dialect of an engine.
///
/// The dialect decides which code generator is used.  Custom generators
/// cannot cross a process boundary, which is why isolated engines only
/// accept the built-in dialects.
#[derive(Clone, Default)]
pub enum Dialect {
    /// The built-in Razor syntax.
    #[default]
    Razor,
    /// A user supplied code generator.
    Custom(Arc<dyn CodeGenerator>),
}

impl fmt::Debug for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Razor => f.write_str("Razor"),
            Dialect::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Dialect {
    /// Returns the code generator for this dialect.
    pub fn generator(&self) -> &dyn CodeGenerator {
        match self {
            Dialect::Razor => &RazorGenerator,
            Dialect::Custom(generator) => &**generator,
        }
    }

    /// Can the dialect be recreated in another process?
    pub fn is_portable(&self) -> bool {
        matches!(self, Dialect::Razor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    fn generate(source: &str, model_type: ModelType) -> Result<GeneratedProgram, Error> {
        let key = TemplateKey::global("page");
        RazorGenerator.generate(&CompileRequest {
            key: &key,
            source,
            encoding: Encoding::Html,
            model_type,
        })
    }

    #[test]
    fn test_generate_listing() {
        let program = generate("@model Person\n<p>@Model.Name</p>", ModelType::Dynamic).unwrap();
        insta::assert_snapshot!(program.text, @r###"
        .template "page"
        .model "Person"
        .encoding html
        .main
           2 emit_raw "<p>"
           2 lookup "Model"
           2 get_attr "Name"
           2 emit
           2 emit_raw "</p>"
        .end
        "###);
    }

    #[test]
    fn test_model_type_mismatch() {
        let err = generate("@model Person\nhi", ModelType::Named("Order".into())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompileError);
        assert_eq!(err.line(), Some(1));
        assert_eq!(
            err.detail(),
            Some("template declares model type Person but was compiled for Order")
        );
        generate("hi", ModelType::Named("Order".into())).unwrap();
    }

    #[test]
    fn test_section_without_layout_warns() {
        let program = generate("@section Scripts {x}", ModelType::Dynamic).unwrap();
        assert_eq!(program.diagnostics.len(), 1);
        assert_eq!(program.diagnostics[0].kind, crate::error::DiagnosticKind::Warning);
    }

    #[test]
    fn test_closure_generator() {
        let dialect = Dialect::Custom(Arc::new(|req: &CompileRequest<'_>| {
            Ok(GeneratedProgram {
                text: format!(".template {:?}\n.main\n.end\n", req.key.name()),
                diagnostics: Vec::new(),
            })
        }));
        assert!(!dialect.is_portable());
        let key = TemplateKey::global("x");
        let rv = dialect
            .generator()
            .generate(&CompileRequest {
                key: &key,
                source: "",
                encoding: Encoding::Raw,
                model_type: ModelType::Dynamic,
            })
            .unwrap();
        assert_eq!(rv.text, ".template \"x\"\n.main\n.end\n");
    }
}
