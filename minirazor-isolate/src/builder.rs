use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use minirazor::value::Value;
use minirazor::{BatchError, Dialect, Engine, EngineConfig, Error, ErrorKind, ViewBag};
use serde::Serialize;

use crate::host::{IsolatedEngine, WorkerOptions};

/// The name of the worker binary.
pub const WORKER_BINARY: &str = "minirazor-worker";

/// Configures and starts an [`IsolatedEngine`].
///
/// ```no_run
/// use minirazor::EngineConfig;
/// use minirazor_isolate::IsolationBuilder;
///
/// let engine = IsolationBuilder::new(EngineConfig::default())
///     .worker_program("target/debug/minirazor-worker")
///     .spawn()
///     .unwrap();
/// engine.add_template("hello", "Hello @Model!").unwrap();
/// assert_eq!(engine.run("hello", "World").unwrap(), "Hello World!");
/// engine.teardown().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct IsolationBuilder {
    config: EngineConfig,
    dialect: Dialect,
    template_dir: Option<PathBuf>,
    program: Option<PathBuf>,
    grace: Duration,
}

impl IsolationBuilder {
    /// Creates a builder for a configuration.
    pub fn new(config: EngineConfig) -> IsolationBuilder {
        IsolationBuilder {
            config,
            dialect: Dialect::Razor,
            template_dir: None,
            program: None,
            grace: Duration::from_secs(2),
        }
    }

    /// Sets the dialect.
    ///
    /// Only the built-in dialects can be recreated inside the worker,
    /// [`spawn`](Self::spawn) rejects custom code generators.
    pub fn dialect(mut self, dialect: Dialect) -> IsolationBuilder {
        self.dialect = dialect;
        self
    }

    /// Loads templates from a directory inside the worker.
    ///
    /// Without a template directory templates are registered with
    /// [`IsolatedEngine::add_template`].
    pub fn template_dir<P: AsRef<Path>>(mut self, dir: P) -> IsolationBuilder {
        self.template_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Sets the path of the worker binary.
    ///
    /// By default `minirazor-worker` is looked up next to the current
    /// executable and then on the `PATH`.
    pub fn worker_program<P: AsRef<Path>>(mut self, program: P) -> IsolationBuilder {
        self.program = Some(program.as_ref().to_path_buf());
        self
    }

    /// Sets how long a worker gets to exit after `shutdown` before it is
    /// killed.
    pub fn shutdown_grace(mut self, grace: Duration) -> IsolationBuilder {
        self.grace = grace;
        self
    }

    /// Starts the worker.
    pub fn spawn(self) -> Result<IsolatedEngine, Error> {
        if !self.dialect.is_portable() {
            return Err(Error::new(
                ErrorKind::InvalidConfiguration,
                "custom code generators cannot cross the process boundary",
            ));
        }
        let mut config = self.config;
        config.isolated = true;
        IsolatedEngine::start(WorkerOptions {
            program: self.program.unwrap_or_else(default_program),
            config,
            template_dir: self.template_dir,
            grace: self.grace,
        })
    }
}

fn default_program() -> PathBuf {
    let exe = format!("{}{}", WORKER_BINARY, env::consts::EXE_SUFFIX);
    env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|dir| dir.join(&exe)))
        .filter(|path| path.is_file())
        .unwrap_or_else(|| PathBuf::from(exe))
}

/// An engine that runs in process or isolated, decided by configuration.
///
/// This is the entry point for applications that read
/// [`EngineConfig::isolated`] from their settings.
#[derive(Debug)]
pub enum EngineHandle {
    /// An engine in this process.
    Local(Engine),
    /// An engine in a worker process.
    Isolated(IsolatedEngine),
}

impl EngineHandle {
    /// Creates the engine the configuration asks for.
    ///
    /// Isolated engines use the default worker binary.
    pub fn new(config: EngineConfig) -> Result<EngineHandle, Error> {
        if config.isolated {
            IsolationBuilder::new(config)
                .spawn()
                .map(EngineHandle::Isolated)
        } else {
            Engine::with_config(config).map(EngineHandle::Local)
        }
    }

    /// Is this engine isolated?
    pub fn is_isolated(&self) -> bool {
        matches!(self, EngineHandle::Isolated(_))
    }

    /// See [`Engine::add_template`].
    pub fn add_template(&self, name: &str, source: &str) -> Result<(), Error> {
        match self {
            EngineHandle::Local(engine) => engine.add_template(name, source),
            EngineHandle::Isolated(engine) => engine.add_template(name, source),
        }
    }

    /// See [`Engine::run`].
    pub fn run<S: Serialize>(&self, name: &str, model: S) -> Result<String, Error> {
        match self {
            EngineHandle::Local(engine) => engine.run(name, model),
            EngineHandle::Isolated(engine) => engine.run(name, model),
        }
    }

    /// See [`Engine::run_with_bag`].
    pub fn run_with_bag<S: Serialize>(
        &self,
        name: &str,
        model: S,
        bag: &ViewBag,
    ) -> Result<String, Error> {
        match self {
            EngineHandle::Local(engine) => engine.run_with_bag(name, model, bag),
            EngineHandle::Isolated(engine) => engine.run_with_bag(name, model, bag),
        }
    }

    /// See [`Engine::render_str`].
    pub fn render_str<S: Serialize>(&self, source: &str, model: S) -> Result<String, Error> {
        match self {
            EngineHandle::Local(engine) => engine.render_str(source, model),
            EngineHandle::Isolated(engine) => engine.render_str(source, model),
        }
    }

    /// See [`Engine::run_many`].
    pub fn run_many<S: AsRef<str> + Sync>(
        &self,
        names: &[S],
        models: Vec<Value>,
        parallel: bool,
    ) -> Result<Vec<String>, BatchError> {
        match self {
            EngineHandle::Local(engine) => engine.run_many(names, models, parallel),
            EngineHandle::Isolated(engine) => engine.run_many(names, models, parallel),
        }
    }

    /// See [`Engine::invalidate`].
    pub fn invalidate(&self, name: &str) -> Result<usize, Error> {
        match self {
            EngineHandle::Local(engine) => Ok(engine.invalidate(name)),
            EngineHandle::Isolated(engine) => engine.invalidate(name),
        }
    }

    /// Releases compiled artifacts.
    ///
    /// Disposes a local engine or tears down the worker of an isolated
    /// one.
    pub fn dispose(&self) -> Result<(), Error> {
        match self {
            EngineHandle::Local(engine) => {
                engine.dispose();
                Ok(())
            }
            EngineHandle::Isolated(engine) => engine.teardown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use minirazor::{CodeGenerator, CompileRequest, GeneratedProgram, RazorGenerator};

    struct Passthrough;

    impl CodeGenerator for Passthrough {
        fn generate(&self, req: &CompileRequest<'_>) -> Result<GeneratedProgram, Error> {
            RazorGenerator.generate(req)
        }
    }

    #[test]
    fn test_custom_dialect_rejected() {
        let err = IsolationBuilder::new(EngineConfig::default())
            .dialect(Dialect::Custom(Arc::new(Passthrough)))
            .spawn()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_missing_worker_binary() {
        let err = IsolationBuilder::new(EngineConfig::default())
            .worker_program("/this/worker/does/not/exist")
            .spawn()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_local_handle() {
        let handle = EngineHandle::new(EngineConfig::default()).unwrap();
        assert!(!handle.is_isolated());
        handle.add_template("hi", "Hi @Model").unwrap();
        assert_eq!(handle.run("hi", "there").unwrap(), "Hi there");
        assert_eq!(handle.invalidate("hi").unwrap(), 1);
        handle.dispose().unwrap();
    }
}
