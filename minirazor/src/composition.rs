//! Layouts, sections and includes.
//!
//! A run starts with the template the caller asked for at composition
//! level 0.  Its output is buffered.  If it declared a layout the layout is
//! resolved relative to it and runs at the next level in the same
//! [`ExecuteContext`], wrapping the buffered output (`RenderBody()`) and the
//! sections captured so far (`RenderSection()`).  This repeats until a
//! template declares no further layout, whose output is the result of the
//! run.
//!
//! Includes run in a nested context that shares the view bag but starts
//! with no sections and no bodies.
use std::sync::Arc;

use crate::engine::Engine;
use crate::error::{Error, ErrorKind};
use crate::generator::ModelType;
use crate::key::{ResolvePurpose, TemplateKey};
use crate::output::Output;
use crate::template::CompiledTemplate;
use crate::value::Value;
use crate::vm::{ExecuteContext, Vm};

/// The maximum number of templates in a layout chain.
const MAX_LAYOUT_DEPTH: usize = 64;

/// The model an included template runs with.
///
/// `@Include("name")` inherits the model of the including template and
/// `@Include("name", expr)` passes an explicit one, which can be `null`.
#[derive(Debug, Clone, PartialEq)]
pub enum IncludeModel {
    /// The model of the including template.
    Inherit,
    /// A model chosen at the call site.
    Explicit(Value),
}

impl Engine {
    /// Runs a template and its layout chain.
    pub(crate) fn render_chain(
        &self,
        compiled: &Arc<CompiledTemplate>,
        ctx: &mut ExecuteContext,
        out: &mut Output,
    ) -> Result<(), Error> {
        let vm = Vm::new(self);
        let mut current = compiled.clone();
        loop {
            let level = ctx.push_level();
            if level >= MAX_LAYOUT_DEPTH {
                return Err(Error::new(
                    ErrorKind::InvalidOperation,
                    format!(
                        "layout chain of {} is too deep, layouts probably form a cycle",
                        compiled.key()
                    ),
                ));
            }

            let mut buffer = String::new();
            let layout = ok!(vm.eval(&current, ctx, level, &mut Output::new(&mut buffer)));
            let layout = match layout {
                Some(layout) => layout,
                None => return out.write_str(&buffer).map_err(Error::from),
            };

            ctx.set_body(level, buffer);
            let key = self
                .manager()
                .get_key(&layout, ResolvePurpose::Layout, Some(current.key()));
            tracing::trace!(template = %current.key(), layout = %key, "entering layout");
            current = ok!(self.get_compiled(&key, &ModelType::Dynamic, None));
        }
    }

    /// Runs an include and returns its output as a safe string.
    pub(crate) fn include(
        &self,
        name: &str,
        model: IncludeModel,
        ctx: &ExecuteContext,
        parent: &TemplateKey,
    ) -> Result<Value, Error> {
        let key = self
            .manager()
            .get_key(name, ResolvePurpose::Include, Some(parent));
        let compiled = ok!(self.get_compiled(&key, &ModelType::Dynamic, None));
        let model = match model {
            IncludeModel::Inherit => ctx.model().clone(),
            IncludeModel::Explicit(model) => model,
        };
        ok!(model.validate());
        let mut nested = ok!(ctx.for_include(model));
        let mut rv = String::new();
        ok!(self.render_chain(&compiled, &mut nested, &mut Output::new(&mut rv)));
        Ok(Value::from_safe_string(rv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    use crate::vm::ViewBag;

    fn engine(templates: &[(&str, &str)]) -> Engine {
        let engine = Engine::new();
        for (name, source) in templates {
            engine.add_template(name, source).unwrap();
        }
        engine
    }

    #[test]
    fn test_layout_chain() {
        let engine = engine(&[
            ("outer", "<html>@RenderBody()</html>"),
            ("inner", "@{ Layout = \"outer\"; }<body>@RenderBody()</body>"),
            ("page", "@{ Layout = \"inner\"; }hi"),
        ]);
        assert_eq!(
            engine.run("page", ()).unwrap(),
            "<html><body>hi</body></html>"
        );
    }

    #[test]
    fn test_sections_accumulate_along_the_chain() {
        let engine = engine(&[
            (
                "outer",
                "@RenderSection(\"Head\")|@RenderSection(\"Scripts\", false)|@RenderBody()",
            ),
            (
                "inner",
                "@{ Layout = \"outer\"; }@section Scripts {s}[@RenderBody()]",
            ),
            ("page", "@{ Layout = \"inner\"; }@section Head {h}body"),
        ]);
        assert_eq!(engine.run("page", ()).unwrap(), "h|s|[body]");
    }

    #[test]
    fn test_missing_required_section() {
        let engine = engine(&[
            ("layout", "@RenderSection(\"Head\")"),
            ("page", "@{ Layout = \"layout\"; }body"),
        ]);
        let err = engine.run("page", ()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingSection);
    }

    #[test]
    fn test_layout_cycle() {
        let engine = engine(&[
            ("a", "@{ Layout = \"b\"; }a"),
            ("b", "@{ Layout = \"a\"; }b"),
        ]);
        let err = engine.run("a", ()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_include_does_not_see_sections() {
        let engine = engine(&[
            ("layout", "@RenderBody()"),
            ("partial", "[@IsSectionDefined(\"Head\")]"),
            (
                "page",
                "@{ Layout = \"layout\"; }@section Head {h}@Include(\"partial\")",
            ),
        ]);
        assert_eq!(engine.run("page", ()).unwrap(), "[false]");
    }

    #[test]
    fn test_include_model_forwarding() {
        let engine = engine(&[
            ("partial", "<@Model>"),
            ("page", "@Include(\"partial\")@Include(\"partial\", 42)@Include(\"partial\", null)"),
        ]);
        assert_eq!(engine.run("page", "x").unwrap(), "<x><42><>");
    }

    #[test]
    fn test_include_recursion_limit() {
        let engine = engine(&[("loop", "@Include(\"loop\")")]);
        let err = engine.run("loop", ()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_include_writes_reach_parent_bag() {
        let engine = engine(&[
            ("partial", "@{ ViewBag.FromPartial = \"yes\"; }"),
            ("page", "@Include(\"partial\")@ViewBag.FromPartial"),
        ]);
        let bag = ViewBag::new();
        assert_eq!(engine.run_with_bag("page", (), &bag).unwrap(), "yes");
        assert_eq!(bag.get("FromPartial"), Some(Value::from("yes")));
    }
}
