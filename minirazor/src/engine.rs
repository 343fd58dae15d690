use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::backend::{AssemblerBackend, BackendOptions, CompilerBackend};
use crate::cache::{CacheKey, CachingProvider, TemplateCache};
use crate::config::{BatchPolicy, Encoding, EngineConfig};
use crate::error::{Error, ErrorKind};
use crate::generator::{CodeGenerator, CompileRequest, Dialect, GeneratedProgram, ModelType};
use crate::key::{ResolvePurpose, TemplateKey};
use crate::manager::{MemoryManager, TemplateManager};
use crate::output::{Output, WriteWrapper};
use crate::template::{CompiledTemplate, Template};
use crate::value::Value;
use crate::vm::{ExecuteContext, TemplateInstance, ViewBag};

pub(crate) type FunctionFn =
    dyn Fn(&TemplateInstance<'_>, &[Value]) -> Result<Value, Error> + Send + Sync;

/// The template engine.
///
/// An engine owns the configuration, the collaborators that turn sources
/// into programs (template manager, dialect and compiler backend) and the
/// cache of compiled templates.  It is meant to be created once and shared:
/// every method used for rendering takes `&self` and the engine is `Sync`,
/// so it can be put into an [`Arc`] or a static and used from many threads
/// at once.
///
/// ```
/// # use minirazor::Engine;
/// let engine = Engine::new();
/// engine.add_template("_layout", "<main>@RenderBody()</main>").unwrap();
/// engine.add_template("page", "@{ Layout = \"_layout\"; }Hi @Model!").unwrap();
/// assert_eq!(engine.run("page", "you").unwrap(), "<main>Hi you!</main>");
/// ```
pub struct Engine {
    config: EngineConfig,
    manager: Arc<dyn TemplateManager>,
    dialect: Dialect,
    backend: Arc<dyn CompilerBackend>,
    cache: TemplateCache,
    functions: BTreeMap<Arc<str>, Arc<FunctionFn>>,
    pool: OnceLock<rayon::ThreadPool>,
    disposed: AtomicBool,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("dialect", &self.dialect)
            .field("cache", &self.cache)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Engine {
    /// Creates an engine with the default configuration.
    ///
    /// Templates are kept in memory (see [`add_template`](Self::add_template)),
    /// compiled with the Razor dialect and assembled in memory.
    pub fn new() -> Engine {
        Engine {
            config: EngineConfig::default(),
            manager: Arc::new(MemoryManager::new()),
            dialect: Dialect::default(),
            backend: Arc::new(AssemblerBackend),
            cache: TemplateCache::default(),
            functions: BTreeMap::new(),
            pool: OnceLock::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Creates an engine from a configuration.
    ///
    /// Isolated configurations are rejected with
    /// [`ErrorKind::InvalidConfiguration`].  Those are served by the
    /// `minirazor-isolate` crate.
    pub fn with_config(config: EngineConfig) -> Result<Engine, Error> {
        ok!(config.validate_local());
        Ok(Engine {
            config,
            ..Engine::new()
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Sets the template manager.
    ///
    /// This clears the cache.
    pub fn set_manager<M: TemplateManager + 'static>(&mut self, manager: M) {
        self.manager = Arc::new(manager);
        self.cache.clear();
    }

    /// Sets the dialect templates are written in.
    ///
    /// This clears the cache.
    pub fn set_dialect(&mut self, dialect: Dialect) {
        self.dialect = dialect;
        self.cache.clear();
    }

    /// Shortcut for setting a [`Dialect::Custom`] code generator.
    pub fn set_code_generator<G: CodeGenerator + 'static>(&mut self, generator: G) {
        self.set_dialect(Dialect::Custom(Arc::new(generator)));
    }

    /// Returns the dialect.
    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    /// Sets the compiler backend.
    ///
    /// This clears the cache and disposes the previous backend.
    pub fn set_backend<B: CompilerBackend + 'static>(&mut self, backend: B) {
        self.cache.clear();
        self.backend.dispose();
        self.backend = Arc::new(backend);
    }

    /// Replaces the storage of compiled templates.
    ///
    /// Templates compiled so far are dropped.
    pub fn set_caching_provider<P: CachingProvider + 'static>(&mut self, provider: P) {
        self.cache.clear();
        self.cache = TemplateCache::new(Box::new(provider));
    }

    /// Registers a function callable from templates.
    ///
    /// ```
    /// # use minirazor::{Engine, value::Value};
    /// let mut engine = Engine::new();
    /// engine.add_function("Shout", |_, args| {
    ///     Ok(Value::from(args[0].to_string().to_uppercase()))
    /// });
    /// engine.add_template("x", "@Shout(Model)").unwrap();
    /// assert_eq!(engine.run("x", "hey").unwrap(), "HEY");
    /// ```
    pub fn add_function<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&TemplateInstance<'_>, &[Value]) -> Result<Value, Error> + Send + Sync + 'static,
    {
        self.functions.insert(Arc::from(name), Arc::new(f));
    }

    /// Removes a function by name.
    pub fn remove_function(&mut self, name: &str) {
        self.functions.remove(name);
    }

    pub(crate) fn get_function(&self, name: &str) -> Option<&FunctionFn> {
        self.functions.get(name).map(|x| &**x)
    }

    /// Missing properties of anonymous models render empty instead of
    /// failing.
    pub fn set_allow_missing_properties_on_dynamic_model(&mut self, yes: bool) {
        self.config.allow_missing_properties_on_dynamic_model = yes;
    }

    /// Sets the encoding of emitted values.
    ///
    /// The encoding is compiled into the programs, so this clears the
    /// cache.
    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.config.encoding = encoding;
        self.cache.clear();
    }

    /// Sets the number of threads used by parallel batch runs.
    pub fn set_parallel_degree(&mut self, degree: usize) {
        self.config.parallel_degree = degree;
        self.pool = OnceLock::new();
    }

    /// Sets the batch policy.
    pub fn set_batch_policy(&mut self, policy: BatchPolicy) {
        self.config.batch_policy = policy;
    }

    /// Enables or disables artifact locking.
    ///
    /// This clears the cache.
    pub fn set_disable_artifact_locking(&mut self, yes: bool) {
        self.config.disable_artifact_locking = yes;
        self.cache.clear();
    }

    /// Enables or disables debug mode.
    ///
    /// In debug mode runtime errors carry the source of the failing
    /// template which is shown by the alternate display of the error:
    ///
    /// ```
    /// # use minirazor::Engine;
    /// let mut engine = Engine::new();
    /// engine.set_debug(true);
    /// engine.add_template("x", "a\n@Model.Name\n").unwrap();
    /// let err = engine.run("x", ()).unwrap_err();
    /// assert!(format!("{:#}", err).contains("@Model.Name"));
    /// ```
    pub fn set_debug(&mut self, enabled: bool) {
        self.config.debug = enabled;
    }

    /// Returns the key the manager assigns to a template name run by the
    /// caller.
    pub fn get_key(&self, name: &str) -> TemplateKey {
        self.manager.get_key(name, ResolvePurpose::Global, None)
    }

    /// Adds or replaces a template.
    ///
    /// The source is registered with the template manager and every cached
    /// compilation of a template with that name is invalidated, including
    /// its uses as layout or include.
    pub fn add_template(&self, name: &str, source: &str) -> Result<(), Error> {
        let key = self.get_key(name);
        ok!(self.manager.add_dynamic(&key, Arc::from(source)));
        let removed = self.cache.invalidate_name(name);
        if removed > 0 {
            tracing::info!(template = name, removed, "replaced template source");
        }
        Ok(())
    }

    fn check_disposed(&self) -> Result<(), Error> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::new(
                ErrorKind::InvalidOperation,
                "engine has been disposed",
            ))
        } else {
            Ok(())
        }
    }

    /// Compiles a template by name.
    ///
    /// With [`ModelType::Dynamic`] the template decides: a `@model`
    /// directive wins, templates without one accept any model.  A named
    /// model type compiles a template without `@model` for that type and
    /// fails with [`ErrorKind::CompileError`] if the template declares a
    /// different one.  Each model type is cached separately, so a typed
    /// compile never changes what [`run`](Self::run) gets and the other
    /// way round.
    pub fn compile(&self, name: &str, model_type: ModelType) -> Result<Template<'_>, Error> {
        self.compile_key(&self.get_key(name), model_type)
    }

    /// Compiles a template by key.
    ///
    /// Compiling a key that is already cached for the model type returns
    /// the cached template.
    pub fn compile_key(&self, key: &TemplateKey, model_type: ModelType) -> Result<Template<'_>, Error> {
        self.get_compiled(key, &model_type, None)
            .map(|compiled| Template::new(self, compiled))
    }

    /// Like [`compile_key`](Self::compile_key) but gives up waiting for a
    /// compilation another caller started after `timeout`.
    ///
    /// Giving up does not cancel that compilation, it finishes and is
    /// cached for later callers.
    pub fn compile_key_timeout(
        &self,
        key: &TemplateKey,
        model_type: ModelType,
        timeout: Duration,
    ) -> Result<Template<'_>, Error> {
        self.get_compiled(key, &model_type, Some(timeout))
            .map(|compiled| Template::new(self, compiled))
    }

    /// Returns a template compiled for any model.
    pub fn get_template(&self, name: &str) -> Result<Template<'_>, Error> {
        self.compile(name, ModelType::Dynamic)
    }

    pub(crate) fn get_compiled(
        &self,
        key: &TemplateKey,
        model_type: &ModelType,
        timeout: Option<Duration>,
    ) -> Result<Arc<CompiledTemplate>, Error> {
        ok!(self.check_disposed());
        // a template that declares the requested type is already cached
        // under its dynamic entry
        if let ModelType::Named(_) = model_type {
            let dynamic = CacheKey::new(key.clone(), ModelType::Dynamic);
            if let Some(compiled) = self.cache.get(&dynamic) {
                if compiled.model_type() == model_type {
                    return Ok(compiled);
                }
            }
        }
        let cache_key = CacheKey::new(key.clone(), model_type.clone());
        self.cache.get_or_compile(&cache_key, timeout, || {
            self.compile_uncached(key, model_type, None)
        })
    }

    fn compile_uncached(
        &self,
        key: &TemplateKey,
        model_type: &ModelType,
        source_override: Option<&str>,
    ) -> Result<CompiledTemplate, Error> {
        let now = Instant::now();
        let source = match source_override {
            Some(source) => Arc::from(source),
            None => ok!(self.manager.resolve(key)),
        };
        tracing::debug!(template = %key, model_type = %model_type, "compiling template");

        let generated = ok!(self
            .dialect
            .generator()
            .generate(&CompileRequest {
                key,
                source: &source,
                encoding: self.config.encoding,
                model_type: model_type.clone(),
            })
            .map_err(|err| err.with_template_source(source.clone())));
        for diagnostic in &generated.diagnostics {
            tracing::warn!(template = %key, "{}", diagnostic);
        }

        let options = BackendOptions {
            disable_artifact_locking: self.config.disable_artifact_locking,
        };
        let unit = ok!(self.backend.compile(&generated, &options).map_err(|err| {
            err.with_program_text(Arc::from(generated.text.as_str()))
                .with_template_source(source.clone())
        }));
        for diagnostic in &unit.diagnostics {
            tracing::warn!(template = %key, "{}", diagnostic);
        }

        let GeneratedProgram {
            text,
            mut diagnostics,
        } = generated;
        diagnostics.extend(unit.diagnostics);
        tracing::debug!(
            template = %key,
            elapsed = ?now.elapsed(),
            artifact = unit.artifact.is_some(),
            "compiled template"
        );
        Ok(CompiledTemplate::new(
            key.clone(),
            unit.program,
            source,
            Arc::from(text),
            diagnostics,
            unit.artifact,
        ))
    }

    /// Runs a template by name with a fresh view bag.
    ///
    /// The model can be anything that implements [`Serialize`].  Structs
    /// become typed records that can be checked against `@model`, maps and
    /// [`model!`](crate::model!) values are anonymous.
    ///
    /// **Note on values:** The [`Value`] type implements `Serialize` and can be
    /// efficiently passed to run.  It does not undergo actual serialization.
    pub fn run<S: Serialize>(&self, name: &str, model: S) -> Result<String, Error> {
        self.run_key(&self.get_key(name), Value::from_serialize(&model), None)
    }

    /// Runs a template by name with a caller supplied view bag.
    pub fn run_with_bag<S: Serialize>(
        &self,
        name: &str,
        model: S,
        bag: &ViewBag,
    ) -> Result<String, Error> {
        self.run_key(&self.get_key(name), Value::from_serialize(&model), Some(bag))
    }

    /// Runs a template by key.
    ///
    /// Without a bag the run gets a fresh one.
    pub fn run_key(
        &self,
        key: &TemplateKey,
        model: Value,
        bag: Option<&ViewBag>,
    ) -> Result<String, Error> {
        let compiled = ok!(self.get_compiled(key, &ModelType::Dynamic, None));
        let mut rv = String::new();
        ok!(self.render_into(
            &compiled,
            model,
            bag.cloned().unwrap_or_default(),
            &mut Output::new(&mut rv)
        ));
        Ok(rv)
    }

    /// Runs a template by name into an [`io::Write`].
    pub fn run_to_write<S: Serialize, W: io::Write>(
        &self,
        name: &str,
        model: S,
        w: W,
    ) -> Result<(), Error> {
        let compiled = ok!(self.get_compiled(&self.get_key(name), &ModelType::Dynamic, None));
        let mut wrapper = WriteWrapper::new(w);
        self.render_into(
            &compiled,
            Value::from_serialize(&model),
            ViewBag::new(),
            &mut Output::new(&mut wrapper),
        )
        .map_err(|err| wrapper.take_err(err))
    }

    /// Renders a template from a string.
    ///
    /// The template is compiled under a name derived from its source, so
    /// rendering the same source again is served from the cache.  It can
    /// declare layouts and includes which are resolved like those of any
    /// other template.
    ///
    /// ```
    /// # use minirazor::Engine;
    /// let engine = Engine::new();
    /// assert_eq!(engine.render_str("1 + 2 = @(1 + 2)", ()).unwrap(), "1 + 2 = 3");
    /// ```
    pub fn render_str<S: Serialize>(&self, source: &str, model: S) -> Result<String, Error> {
        ok!(self.check_disposed());
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        let key = TemplateKey::global(&format!("<string:{:016x}>", hasher.finish()));
        let cache_key = CacheKey::new(key.clone(), ModelType::Dynamic);
        let mut compiled = ok!(self.cache.get_or_compile(&cache_key, None, || {
            self.compile_uncached(&key, &ModelType::Dynamic, Some(source))
        }));
        if compiled.source() != source {
            compiled = Arc::new(ok!(self.compile_uncached(
                &key,
                &ModelType::Dynamic,
                Some(source)
            )));
        }
        let mut rv = String::new();
        ok!(self.render_into(
            &compiled,
            Value::from_serialize(&model),
            ViewBag::new(),
            &mut Output::new(&mut rv)
        ));
        Ok(rv)
    }

    pub(crate) fn render_into(
        &self,
        compiled: &Arc<CompiledTemplate>,
        model: Value,
        bag: ViewBag,
        out: &mut Output,
    ) -> Result<(), Error> {
        ok!(self.check_disposed());
        ok!(model.validate());
        let now = Instant::now();
        let mut ctx = ExecuteContext::new(model, bag);
        let rv = self.render_chain(compiled, &mut ctx, out);
        tracing::trace!(template = %compiled.key(), elapsed = ?now.elapsed(), "rendered template");
        rv
    }

    /// Invalidates every compiled template with the given name and returns
    /// how many were removed.
    pub fn invalidate(&self, name: &str) -> usize {
        let removed = self.cache.invalidate_name(name);
        tracing::info!(template = name, removed, "invalidated template");
        removed
    }

    /// Invalidates a single key, whatever model types it was compiled
    /// for.
    pub fn invalidate_key(&self, key: &TemplateKey) -> bool {
        let removed = self.cache.invalidate(key);
        tracing::info!(template = %key, removed, "invalidated template key");
        removed > 0
    }

    /// Returns the number of cached compiled templates.
    ///
    /// A template compiled for more than one model type counts once per
    /// model type.
    pub fn cached_templates(&self) -> usize {
        self.cache.len()
    }

    /// Returns the keys of all cached compiled templates.
    pub fn cached_keys(&self) -> Vec<TemplateKey> {
        let mut keys = self
            .cache
            .keys()
            .into_iter()
            .map(|key| key.template().clone())
            .collect::<Vec<_>>();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Releases everything the engine holds.
    ///
    /// Compiled templates are dropped, which deletes their artifacts unless
    /// a template handle is still alive somewhere, and the backend is
    /// disposed.  Compiling or running templates afterwards fails.  Calling
    /// this more than once is harmless.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed = self.cache.clear();
        self.backend.dispose();
        tracing::info!(removed, "disposed engine");
    }

    /// Was [`dispose`](Self::dispose) called?
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn manager(&self) -> &dyn TemplateManager {
        &*self.manager
    }

    pub(crate) fn pool_slot(&self) -> &OnceLock<rayon::ThreadPool> {
        &self.pool
    }
}
