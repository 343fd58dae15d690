use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorKind};
use crate::utils::lock;
use crate::value::{MapType, Value, ValueMap};

/// The maximum include nesting.
const MAX_INCLUDE_DEPTH: usize = 64;

/// A mutable bag of values shared by everything one run composes.
///
/// The bag is a cheap handle: clones refer to the same storage.  Layouts
/// and includes of a run see the bag of the run, separate runs get
/// separate bags unless the caller hands the same bag to both.
///
/// ```
/// # use minirazor::{Engine, ViewBag};
/// let engine = Engine::new();
/// engine.add_template("page", "@{ ViewBag.Seen = true; }").unwrap();
/// let bag = ViewBag::new();
/// engine.run_with_bag("page", (), &bag).unwrap();
/// assert_eq!(bag.get("Seen"), Some(true.into()));
/// ```
#[derive(Clone, Default)]
pub struct ViewBag(Arc<Mutex<ValueMap>>);

impl ViewBag {
    /// Creates an empty bag.
    pub fn new() -> ViewBag {
        ViewBag::default()
    }

    /// Creates a bag from the entries of a map value.
    pub fn from_value(value: &Value) -> Result<ViewBag, Error> {
        if value.is_none() || value.is_missing() {
            return Ok(ViewBag::new());
        }
        match value.as_map() {
            Some(map) => Ok(ViewBag(Arc::new(Mutex::new(map.clone())))),
            None => Err(Error::new(
                ErrorKind::InvalidOperation,
                format!("cannot create a view bag from {}", value.kind()),
            )),
        }
    }

    /// Returns a value from the bag.
    pub fn get(&self, name: &str) -> Option<Value> {
        lock(&self.0).get(name).cloned()
    }

    /// Sets a value in the bag.
    pub fn set<V: Into<Value>>(&self, name: &str, value: V) {
        lock(&self.0).insert(Arc::from(name), value.into());
    }

    /// Removes a value from the bag.
    pub fn remove(&self, name: &str) -> Option<Value> {
        #[cfg(feature = "preserve_order")]
        {
            lock(&self.0).shift_remove(name)
        }
        #[cfg(not(feature = "preserve_order"))]
        {
            lock(&self.0).remove(name)
        }
    }

    /// Returns the number of values in the bag.
    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    /// Is the bag empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current contents as a bag value.
    pub fn snapshot(&self) -> Value {
        Value::from_map(lock(&self.0).clone(), MapType::Bag)
    }

    /// Do both handles refer to the same bag?
    pub fn ptr_eq(&self, other: &ViewBag) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ViewBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ViewBag").field(&self.snapshot()).finish()
    }
}

/// Per-run state shared by a template, its layouts and their sections.
///
/// Composition levels count from the template the caller asked for
/// (level 0) through its layout chain.  Every level owns the sections it
/// defined and the body it produced.
pub(crate) struct ExecuteContext {
    model: Value,
    bag: ViewBag,
    sections: Vec<BTreeMap<Arc<str>, String>>,
    bodies: Vec<String>,
    depth: usize,
}

impl ExecuteContext {
    pub fn new(model: Value, bag: ViewBag) -> ExecuteContext {
        ExecuteContext {
            model,
            bag,
            sections: Vec::new(),
            bodies: Vec::new(),
            depth: 0,
        }
    }

    /// Creates the context for an include: same bag, fresh sections.
    pub fn for_include(&self, model: Value) -> Result<ExecuteContext, Error> {
        if self.depth + 1 >= MAX_INCLUDE_DEPTH {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                "recursion limit exceeded: includes are nested too deeply",
            ));
        }
        Ok(ExecuteContext {
            depth: self.depth + 1,
            ..ExecuteContext::new(model, self.bag.clone())
        })
    }

    pub fn model(&self) -> &Value {
        &self.model
    }

    pub fn bag(&self) -> &ViewBag {
        &self.bag
    }

    /// Starts a new composition level and returns its index.
    pub fn push_level(&mut self) -> usize {
        self.sections.push(BTreeMap::new());
        self.sections.len() - 1
    }

    /// Records the output of a level, which is the body of the next level.
    pub fn set_body(&mut self, level: usize, body: String) {
        self.bodies.truncate(level);
        self.bodies.push(body);
    }

    /// Returns the body a layout at `level` wraps.
    pub fn body(&self, level: usize) -> Option<&str> {
        level
            .checked_sub(1)
            .and_then(|idx| self.bodies.get(idx))
            .map(|x| x.as_str())
    }

    pub fn define_section(&mut self, level: usize, name: Arc<str>, body: String) {
        if let Some(sections) = self.sections.get_mut(level) {
            sections.insert(name, body);
        }
    }

    /// Finds a section defined by one of the templates wrapped by the
    /// template at `level`, nearest first.
    pub fn find_section(&self, level: usize, name: &str) -> Option<&str> {
        self.sections[..level.min(self.sections.len())]
            .iter()
            .rev()
            .find_map(|sections| sections.get(name))
            .map(|x| x.as_str())
    }
}
