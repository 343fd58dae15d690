use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use minirazor::value::Value;
use minirazor::{BatchError, EngineConfig, Error, ErrorKind, ViewBag};
use serde::Serialize;

use crate::protocol::{encode_message, read_message, Outcome, Request, Response};
use crate::wire::WireValue;

/// How the host starts and stops workers.
#[derive(Debug, Clone)]
pub(crate) struct WorkerOptions {
    pub program: PathBuf,
    pub config: EngineConfig,
    pub template_dir: Option<PathBuf>,
    pub grace: Duration,
}

/// An engine that runs inside a worker process.
///
/// The API mirrors [`Engine`](minirazor::Engine).  Every call is sent to
/// the worker and calls are serialized: one request is in flight at a
/// time.  Concurrency inside the worker comes from
/// [`run_many`](Self::run_many).
///
/// If the worker dies the call that was in flight fails with
/// [`ErrorKind::RuntimeError`] and the next call starts a fresh worker.
/// Templates registered with [`add_template`](Self::add_template) are
/// registered again with the new worker.  Compiled templates are not
/// carried over, they compile again on first use.
///
/// Call [`teardown`](Self::teardown) to stop the worker deterministically.
/// Dropping the engine does the same.
pub struct IsolatedEngine {
    options: WorkerOptions,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    worker: Option<WorkerProcess>,
    templates: BTreeMap<String, String>,
    torn_down: bool,
}

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl fmt::Debug for IsolatedEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("IsolatedEngine")
            .field("program", &self.options.program)
            .field("config", &self.options.config)
            .field("pid", &state.worker.as_ref().map(|w| w.child.id()))
            .field("templates", &state.templates.keys().collect::<Vec<_>>())
            .field("torn_down", &state.torn_down)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

fn to_wire<S: Serialize>(what: &str, value: &S) -> Result<WireValue, Error> {
    WireValue::from_value(&Value::from_serialize(value)).map_err(|err| {
        Error::new(
            ErrorKind::InvalidConfiguration,
            format!("{} cannot cross the process boundary", what),
        )
        .with_source(err)
    })
}

fn encode(req: &Request) -> Result<Vec<u8>, Error> {
    encode_message(req).map_err(|err| {
        Error::new(
            ErrorKind::InvalidConfiguration,
            format!("could not encode {} request", req.op()),
        )
        .with_source(err)
    })
}

fn unexpected(op: &str, resp: Response) -> Error {
    Error::new(
        ErrorKind::RuntimeError,
        format!("worker sent an unexpected response to {}: {:?}", op, resp),
    )
}

impl IsolatedEngine {
    /// Starts the worker and configures it.
    pub(crate) fn start(options: WorkerOptions) -> Result<IsolatedEngine, Error> {
        let engine = IsolatedEngine {
            options,
            state: Mutex::new(State::default()),
        };
        let worker = engine.spawn(&BTreeMap::new())?;
        lock(&engine.state).worker = Some(worker);
        Ok(engine)
    }

    /// Returns the configuration the worker runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.options.config
    }

    /// Adds or replaces a template in the worker.
    pub fn add_template(&self, name: &str, source: &str) -> Result<(), Error> {
        let req = Request::AddTemplate {
            name: name.into(),
            source: source.into(),
        };
        let mut state = lock(&self.state);
        match self.call(&mut state, &req)? {
            Response::Done => {
                state.templates.insert(name.into(), source.into());
                Ok(())
            }
            resp => Err(unexpected(req.op(), resp)),
        }
    }

    /// Runs a template by name with a fresh view bag.
    pub fn run<S: Serialize>(&self, name: &str, model: S) -> Result<String, Error> {
        let req = Request::Run {
            name: name.into(),
            model: to_wire("model", &model)?,
            bag: None,
        };
        self.output(&req).map(|(output, _)| output)
    }

    /// Runs a template by name with a caller supplied view bag.
    ///
    /// The bag is sent along and its contents after the run are written
    /// back, so writes made by the templates are visible through `bag` as
    /// with an in-process engine.
    pub fn run_with_bag<S: Serialize>(
        &self,
        name: &str,
        model: S,
        bag: &ViewBag,
    ) -> Result<String, Error> {
        let req = Request::Run {
            name: name.into(),
            model: to_wire("model", &model)?,
            bag: Some(to_wire("view bag", &bag.snapshot())?),
        };
        let (output, after) = self.output(&req)?;
        if let Some(after) = after {
            sync_bag(bag, &after.into_value());
        }
        Ok(output)
    }

    /// Renders a template from a string inside the worker.
    pub fn render_str<S: Serialize>(&self, source: &str, model: S) -> Result<String, Error> {
        let req = Request::RenderStr {
            source: source.into(),
            model: to_wire("model", &model)?,
        };
        self.output(&req).map(|(output, _)| output)
    }

    /// Runs many templates inside the worker.
    ///
    /// See [`Engine::run_many`](minirazor::Engine::run_many).  Failures of
    /// the boundary itself are reported as a [`BatchError`] with a single
    /// outcome.
    pub fn run_many<S: AsRef<str>>(
        &self,
        names: &[S],
        models: Vec<Value>,
        parallel: bool,
    ) -> Result<Vec<String>, BatchError> {
        self.try_run_many(names, models, parallel)
            .unwrap_or_else(|err| Err(BatchError::new(vec![Err(err.clone())], err)))
    }

    fn try_run_many<S: AsRef<str>>(
        &self,
        names: &[S],
        models: Vec<Value>,
        parallel: bool,
    ) -> Result<Result<Vec<String>, BatchError>, Error> {
        let req = Request::RunMany {
            names: names.iter().map(|x| x.as_ref().to_string()).collect(),
            models: models
                .iter()
                .map(|model| to_wire("model", model))
                .collect::<Result<_, _>>()?,
            parallel,
        };
        let mut state = lock(&self.state);
        let (outcomes, error) = match self.call(&mut state, &req)? {
            Response::Batch { outcomes, error } => (outcomes, error),
            resp => return Err(unexpected(req.op(), resp)),
        };
        let outcomes = outcomes
            .into_iter()
            .map(|outcome| match outcome {
                Outcome::Ok { output } => Ok(output),
                Outcome::Err { error } => Err(error.into_error()),
            })
            .collect::<Vec<_>>();
        Ok(match error {
            Some(error) => Err(BatchError::new(outcomes, error.into_error())),
            None => Ok(outcomes.into_iter().filter_map(Result::ok).collect()),
        })
    }

    /// Drops every compiled template with the given name in the worker and
    /// returns how many were dropped.
    pub fn invalidate(&self, name: &str) -> Result<usize, Error> {
        let req = Request::Invalidate { name: name.into() };
        let mut state = lock(&self.state);
        match self.call(&mut state, &req)? {
            Response::Invalidated { removed } => Ok(removed),
            resp => Err(unexpected(req.op(), resp)),
        }
    }

    /// Checks that the worker is alive and returns its process id.
    pub fn ping(&self) -> Result<u32, Error> {
        let mut state = lock(&self.state);
        match self.call(&mut state, &Request::Ping)? {
            Response::Pong { pid } => Ok(pid),
            resp => Err(unexpected("ping", resp)),
        }
    }

    /// Stops the current worker.  The next call starts a fresh one.
    ///
    /// This releases everything the worker accumulated, for instance after
    /// many templates were compiled and invalidated.
    pub fn recycle(&self) -> Result<(), Error> {
        let mut state = lock(&self.state);
        match state.worker.take() {
            Some(worker) => worker.shutdown(self.options.grace),
            None => Ok(()),
        }
    }

    /// Stops the worker and waits for it to exit.
    ///
    /// The worker disposes its engine first, which deletes all compiled
    /// artifacts.  A worker that does not exit within the grace period is
    /// killed.  Calling this again does nothing, every other call fails
    /// with [`ErrorKind::InvalidOperation`] afterwards.
    pub fn teardown(&self) -> Result<(), Error> {
        let mut state = lock(&self.state);
        if state.torn_down {
            return Ok(());
        }
        state.torn_down = true;
        tracing::info!("tearing down isolated engine");
        match state.worker.take() {
            Some(worker) => worker.shutdown(self.options.grace),
            None => Ok(()),
        }
    }

    /// Was the engine torn down?
    pub fn is_torn_down(&self) -> bool {
        lock(&self.state).torn_down
    }

    fn output(&self, req: &Request) -> Result<(String, Option<WireValue>), Error> {
        let mut state = lock(&self.state);
        match self.call(&mut state, req)? {
            Response::Output { output, bag } => Ok((output, bag)),
            resp => Err(unexpected(req.op(), resp)),
        }
    }

    fn call(&self, state: &mut State, req: &Request) -> Result<Response, Error> {
        let line = encode(req)?;
        if state.torn_down {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                "isolated engine has been torn down",
            ));
        }
        let mut worker = match state.worker.take() {
            Some(worker) => worker,
            None => self.spawn(&state.templates)?,
        };
        match worker.roundtrip(&line) {
            Ok(Response::Error { error }) => {
                state.worker = Some(worker);
                Err(error.into_error())
            }
            Ok(resp) => {
                state.worker = Some(worker);
                Ok(resp)
            }
            Err(err) => {
                let status = worker.kill();
                tracing::warn!(op = req.op(), error = %err, status = ?status, "worker failed");
                Err(Error::new(
                    ErrorKind::RuntimeError,
                    format!("worker process failed during {}", req.op()),
                )
                .with_source(err))
            }
        }
    }

    fn spawn(&self, templates: &BTreeMap<String, String>) -> Result<WorkerProcess, Error> {
        let now = Instant::now();
        let mut child = Command::new(&self.options.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| {
                Error::new(
                    ErrorKind::InvalidConfiguration,
                    format!(
                        "could not start worker {}",
                        self.options.program.display()
                    ),
                )
                .with_source(err)
            })?;
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::new(
                    ErrorKind::RuntimeError,
                    "worker pipes are not available",
                ));
            }
        };
        let mut worker = WorkerProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };

        let mut handshake = vec![Request::Configure {
            config: self.options.config.clone(),
            template_dir: self.options.template_dir.clone(),
        }];
        handshake.extend(templates.iter().map(|(name, source)| Request::AddTemplate {
            name: name.clone(),
            source: source.clone(),
        }));
        for req in &handshake {
            let line = encode(req)?;
            match worker.roundtrip(&line) {
                Ok(Response::Done) => {}
                Ok(Response::Error { error }) => {
                    let _ = worker.kill();
                    return Err(error.into_error());
                }
                Ok(resp) => {
                    let _ = worker.kill();
                    return Err(unexpected(req.op(), resp));
                }
                Err(err) => {
                    let status = worker.kill();
                    return Err(Error::new(
                        ErrorKind::RuntimeError,
                        format!(
                            "worker process failed during {} (exit status: {:?})",
                            req.op(),
                            status.ok().flatten()
                        ),
                    )
                    .with_source(err));
                }
            }
        }

        tracing::debug!(
            pid = worker.child.id(),
            replayed = templates.len(),
            elapsed = ?now.elapsed(),
            "started worker"
        );
        Ok(worker)
    }
}

impl Drop for IsolatedEngine {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            tracing::warn!(error = %err, "failed to tear down isolated engine");
        }
    }
}

impl WorkerProcess {
    fn roundtrip(&mut self, line: &[u8]) -> io::Result<Response> {
        self.stdin.write_all(line)?;
        self.stdin.flush()?;
        match read_message(&mut self.stdout)? {
            Some(resp) => Ok(resp),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "worker closed its output",
            )),
        }
    }

    /// Kills the process and returns its exit status if it had exited.
    fn kill(mut self) -> io::Result<Option<std::process::ExitStatus>> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(Some(status));
        }
        self.child.kill()?;
        self.child.wait()?;
        Ok(None)
    }

    fn shutdown(mut self, grace: Duration) -> Result<(), Error> {
        let pid = self.child.id();
        match encode_message(&Request::Shutdown) {
            Ok(line) => match self.roundtrip(&line) {
                Ok(Response::Bye) => {}
                Ok(resp) => tracing::warn!(pid, ?resp, "unexpected response to shutdown"),
                Err(err) => tracing::debug!(pid, error = %err, "worker gone before shutdown"),
            },
            Err(err) => tracing::warn!(pid, error = %err, "could not encode shutdown"),
        }
        let WorkerProcess {
            mut child, stdin, ..
        } = self;
        drop(stdin);

        let deadline = Instant::now() + grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(pid, %status, "worker exited");
                    return Ok(());
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Ok(None) => break,
                Err(err) => {
                    return Err(Error::new(
                        ErrorKind::RuntimeError,
                        "could not wait for the worker",
                    )
                    .with_source(err))
                }
            }
        }

        tracing::warn!(pid, ?grace, "worker did not exit in time, killing it");
        child
            .kill()
            .and_then(|_| child.wait())
            .map(|_| ())
            .map_err(|err| {
                Error::new(ErrorKind::RuntimeError, "could not kill the worker").with_source(err)
            })
    }
}

fn sync_bag(bag: &ViewBag, after: &Value) {
    let before = bag.snapshot();
    let after_map = after.as_map();
    if let Some(map) = before.as_map() {
        for key in map.keys() {
            if !after_map.map_or(false, |m| m.contains_key(key)) {
                bag.remove(key);
            }
        }
    }
    if let Some(map) = after_map {
        for (key, value) in map {
            bag.set(key, value.clone());
        }
    }
}
