//! Template managers resolve template keys to template sources.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{Error, ErrorKind};
use crate::key::{ResolvePurpose, TemplateKey};

type LoadFunc = dyn for<'a> Fn(&'a str) -> Result<Option<String>, Error> + Send + Sync;

/// Resolves template keys into template sources.
///
/// The engine asks the manager for keys whenever a template is run, used as
/// a layout or included, and it asks the manager to resolve those keys to
/// source text when a key is not compiled yet.  Managers are shared between
/// threads and must therefore handle their own synchronization.
pub trait TemplateManager: Send + Sync {
    /// Resolves a key into the template source.
    ///
    /// Unknown templates must fail with
    /// [`ErrorKind::TemplateNotFound`](crate::ErrorKind::TemplateNotFound).
    fn resolve(&self, key: &TemplateKey) -> Result<Arc<str>, Error>;

    /// Builds the key for a template name.
    ///
    /// `context` is the key of the referencing template for layouts and
    /// includes.  The default implementation keeps the context in the key
    /// so that the same name referenced from different templates produces
    /// different keys.  Managers whose names are absolute can drop it.
    fn get_key(
        &self,
        name: &str,
        purpose: ResolvePurpose,
        context: Option<&TemplateKey>,
    ) -> TemplateKey {
        TemplateKey::new(name, purpose, context.cloned())
    }

    /// Registers a template source for a key at runtime.
    fn add_dynamic(&self, key: &TemplateKey, source: Arc<str>) -> Result<(), Error> {
        let _ = (key, source);
        Err(Error::new(
            ErrorKind::InvalidOperation,
            "this template manager does not support adding templates",
        ))
    }
}

impl<T: TemplateManager + ?Sized> TemplateManager for Arc<T> {
    fn resolve(&self, key: &TemplateKey) -> Result<Arc<str>, Error> {
        (**self).resolve(key)
    }

    fn get_key(
        &self,
        name: &str,
        purpose: ResolvePurpose,
        context: Option<&TemplateKey>,
    ) -> TemplateKey {
        (**self).get_key(name, purpose, context)
    }

    fn add_dynamic(&self, key: &TemplateKey, source: Arc<str>) -> Result<(), Error> {
        (**self).add_dynamic(key, source)
    }
}

/// Keeps template sources in memory.
///
/// Template names are absolute: a name resolves to the same source no
/// matter which template references it, so keys for the same name and
/// purpose are shared between all referencing templates.
///
/// ```
/// # use minirazor::{Engine, MemoryManager};
/// let manager = MemoryManager::new();
/// manager.add_template("hello", "Hello @Model!");
/// let mut engine = Engine::new();
/// engine.set_manager(manager);
/// assert_eq!(engine.run("hello", "World").unwrap(), "Hello World!");
/// ```
#[derive(Default)]
pub struct MemoryManager {
    templates: RwLock<BTreeMap<Arc<str>, Arc<str>>>,
    dynamic: RwLock<HashMap<TemplateKey, Arc<str>>>,
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let templates = self.templates.read().unwrap_or_else(|x| x.into_inner());
        f.debug_list().entries(templates.keys()).finish()
    }
}

impl MemoryManager {
    /// Creates an empty manager.
    pub fn new() -> MemoryManager {
        MemoryManager::default()
    }

    /// Adds or replaces a template by name.
    pub fn add_template(&self, name: &str, source: impl Into<Arc<str>>) {
        self.templates
            .write()
            .unwrap_or_else(|x| x.into_inner())
            .insert(Arc::from(name), source.into());
    }

    /// Removes a template by name.
    pub fn remove_template(&self, name: &str) -> bool {
        self.templates
            .write()
            .unwrap_or_else(|x| x.into_inner())
            .remove(name)
            .is_some()
    }
}

impl TemplateManager for MemoryManager {
    fn resolve(&self, key: &TemplateKey) -> Result<Arc<str>, Error> {
        if let Some(source) = self
            .dynamic
            .read()
            .unwrap_or_else(|x| x.into_inner())
            .get(key)
        {
            return Ok(source.clone());
        }
        self.templates
            .read()
            .unwrap_or_else(|x| x.into_inner())
            .get(key.name())
            .cloned()
            .ok_or_else(|| Error::new_not_found(key.name()))
    }

    fn get_key(
        &self,
        name: &str,
        purpose: ResolvePurpose,
        _context: Option<&TemplateKey>,
    ) -> TemplateKey {
        TemplateKey::new(name, purpose, None)
    }

    fn add_dynamic(&self, key: &TemplateKey, source: Arc<str>) -> Result<(), Error> {
        if key.purpose() == ResolvePurpose::Global && key.context().is_none() {
            self.add_template(key.name(), source);
        } else {
            self.dynamic
                .write()
                .unwrap_or_else(|x| x.into_inner())
                .insert(key.clone(), source);
        }
        Ok(())
    }
}

/// Joins a template name onto a base path.
///
/// Segments starting with a dot and backslashes are rejected so that
/// templates cannot escape the base directory.
pub(crate) fn safe_join(base: &Path, template: &str) -> Option<PathBuf> {
    let mut rv = base.to_path_buf();
    for segment in template.split('/') {
        if segment.starts_with('.') || segment.contains('\\') {
            return None;
        }
        rv.push(segment);
    }
    Some(rv)
}

/// Loads templates from a directory.
///
/// Template names are paths relative to the directory using forward
/// slashes.  Templates that start with a dot (`.`) or are contained in a
/// folder starting with a dot cannot be loaded.
#[derive(Debug, Clone)]
pub struct PathManager {
    dir: PathBuf,
}

impl PathManager {
    /// Creates a manager for a template directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> PathManager {
        PathManager {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl TemplateManager for PathManager {
    fn resolve(&self, key: &TemplateKey) -> Result<Arc<str>, Error> {
        let path = match safe_join(&self.dir, key.name()) {
            Some(path) => path,
            None => return Err(Error::new_not_found(key.name())),
        };
        match fs::read_to_string(path) {
            Ok(result) => Ok(Arc::from(result)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(Error::new_not_found(key.name()))
            }
            Err(err) => Err(
                Error::new(ErrorKind::InvalidOperation, "could not read template").with_source(err),
            ),
        }
    }

    fn get_key(
        &self,
        name: &str,
        purpose: ResolvePurpose,
        _context: Option<&TemplateKey>,
    ) -> TemplateKey {
        TemplateKey::new(name, purpose, None)
    }
}

/// Resolves templates through a callback.
///
/// The callback is invoked with the template name and returns `Ok(None)`
/// for unknown templates.  Keys keep the referencing template as context,
/// and sources registered at runtime take precedence over the callback.
///
/// ```
/// # use minirazor::{Engine, LoaderManager};
/// let mut engine = Engine::new();
/// engine.set_manager(LoaderManager::new(|name| {
///     Ok(match name {
///         "hello" => Some("Hello!".into()),
///         _ => None,
///     })
/// }));
/// assert_eq!(engine.run("hello", ()).unwrap(), "Hello!");
/// ```
pub struct LoaderManager {
    loader: Arc<LoadFunc>,
    dynamic: RwLock<HashMap<TemplateKey, Arc<str>>>,
}

impl fmt::Debug for LoaderManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderManager").finish_non_exhaustive()
    }
}

impl LoaderManager {
    /// Creates a manager from a load callback.
    pub fn new<F>(f: F) -> LoaderManager
    where
        F: Fn(&str) -> Result<Option<String>, Error> + Send + Sync + 'static,
    {
        LoaderManager {
            loader: Arc::new(f),
            dynamic: RwLock::default(),
        }
    }
}

impl TemplateManager for LoaderManager {
    fn resolve(&self, key: &TemplateKey) -> Result<Arc<str>, Error> {
        if let Some(source) = self
            .dynamic
            .read()
            .unwrap_or_else(|x| x.into_inner())
            .get(key)
        {
            return Ok(source.clone());
        }
        match ok!((self.loader)(key.name())) {
            Some(source) => Ok(Arc::from(source)),
            None => Err(Error::new_not_found(key.name())),
        }
    }

    fn add_dynamic(&self, key: &TemplateKey, source: Arc<str>) -> Result<(), Error> {
        self.dynamic
            .write()
            .unwrap_or_else(|x| x.into_inner())
            .insert(key.clone(), source);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    #[test]
    fn test_safe_join() {
        assert_eq!(
            safe_join(Path::new("foo"), "bar/baz"),
            Some(PathBuf::from("foo").join("bar").join("baz"))
        );
        assert_eq!(safe_join(Path::new("foo"), ".bar/baz"), None);
        assert_eq!(safe_join(Path::new("foo"), "bar/.baz"), None);
        assert_eq!(safe_join(Path::new("foo"), "bar/../baz"), None);
        assert_eq!(safe_join(Path::new("foo"), "bar\\baz"), None);
    }

    #[test]
    fn test_memory_manager() {
        let manager = MemoryManager::new();
        manager.add_template("index", "hello");
        let key = manager.get_key("index", ResolvePurpose::Layout, Some(&TemplateKey::global("x")));
        assert_eq!(key.context(), None);
        assert_eq!(&*manager.resolve(&key).unwrap(), "hello");
        assert!(manager.remove_template("index"));
        let err = manager.resolve(&key).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateNotFound);
    }

    #[test]
    fn test_memory_manager_dynamic_override() {
        let manager = MemoryManager::new();
        manager.add_template("part", "shared");
        let key = TemplateKey::new("part", ResolvePurpose::Include, Some(TemplateKey::global("a")));
        manager.add_dynamic(&key, Arc::from("override")).unwrap();
        assert_eq!(&*manager.resolve(&key).unwrap(), "override");
        assert_eq!(&*manager.resolve(&TemplateKey::global("part")).unwrap(), "shared");
    }

    #[test]
    fn test_loader_manager_keeps_context() {
        let manager = LoaderManager::new(|name| Ok(Some(format!("source of {}", name))));
        let parent = TemplateKey::global("page");
        let key = manager.get_key("part", ResolvePurpose::Include, Some(&parent));
        assert_eq!(key.context(), Some(&parent));
        assert_eq!(&*manager.resolve(&key).unwrap(), "source of part");
    }

    #[test]
    fn test_path_manager() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("page.cshtml"), "<p>hi</p>").unwrap();
        let manager = PathManager::new(dir.path());
        let key = TemplateKey::global("page.cshtml");
        assert_eq!(&*manager.resolve(&key).unwrap(), "<p>hi</p>");
        let err = manager.resolve(&TemplateKey::global("../page.cshtml")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateNotFound);
        assert!(manager
            .add_dynamic(&key, Arc::from("x"))
            .is_err());
    }
}
