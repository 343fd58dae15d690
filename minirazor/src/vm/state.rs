use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, ErrorKind};
use crate::key::TemplateKey;
use crate::template::CompiledTemplate;
use crate::value::{Lookup, Value};
use crate::vm::context::ViewBag;

/// One execution of a compiled template.
///
/// An instance is created for every template a run executes (the template
/// itself, each layout and each include) and is dropped when that template
/// finishes.  Functions registered with
/// [`Engine::add_function`](crate::Engine::add_function) receive the
/// calling instance.
pub struct TemplateInstance<'t> {
    pub(crate) compiled: &'t CompiledTemplate,
    pub(crate) model: Value,
    pub(crate) bag: ViewBag,
    pub(crate) level: usize,
    pub(crate) layout: Option<Arc<str>>,
    pub(crate) locals: BTreeMap<Arc<str>, Value>,
    pub(crate) loops: Vec<std::vec::IntoIter<Value>>,
    pub(crate) lookup: Lookup,
}

impl<'t> fmt::Debug for TemplateInstance<'t> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateInstance")
            .field("name", &self.name())
            .field("model", &self.model)
            .field("level", &self.level)
            .field("layout", &self.layout)
            .field("locals", &self.locals)
            .finish()
    }
}

impl<'t> TemplateInstance<'t> {
    pub(crate) fn new(
        compiled: &'t CompiledTemplate,
        model: Value,
        bag: ViewBag,
        level: usize,
        lookup: Lookup,
    ) -> TemplateInstance<'t> {
        TemplateInstance {
            compiled,
            model,
            bag,
            level,
            layout: None,
            locals: BTreeMap::new(),
            loops: Vec::new(),
            lookup,
        }
    }

    /// Returns the name of the running template.
    pub fn name(&self) -> &str {
        self.compiled.key().name()
    }

    /// Returns the key of the running template.
    pub fn key(&self) -> &TemplateKey {
        self.compiled.key()
    }

    /// Returns the model bound to this instance.
    pub fn model(&self) -> &Value {
        &self.model
    }

    /// Returns the view bag of the run.
    pub fn bag(&self) -> &ViewBag {
        &self.bag
    }

    /// Returns the layout declared so far.
    pub fn layout(&self) -> Option<&str> {
        self.layout.as_deref()
    }

    /// Returns the composition level, `0` for the template that was run.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Looks up a variable.
    pub fn lookup(&self, name: &str) -> Result<Value, Error> {
        if let Some(value) = self.locals.get(name) {
            return Ok(value.clone());
        }
        match name {
            "Model" => Ok(self.model.clone()),
            "ViewBag" => Ok(self.bag.snapshot()),
            "Layout" => Ok(self.layout.clone().map_or(Value::NONE, Value::from)),
            _ => Err(Error::new(
                ErrorKind::UndefinedError,
                format!("{:?} is not defined", name),
            )),
        }
    }

    /// Reads a view bag property the way `ViewBag.Name` does.
    ///
    /// Absent properties are `null`, or the missing placeholder when
    /// missing properties are tolerated.
    pub(crate) fn lookup_bag(&self, name: &str) -> Value {
        match self.bag.get(name) {
            Some(value) => value,
            None if self.lookup.tolerant => Value::MISSING,
            None => Value::NONE,
        }
    }
}
