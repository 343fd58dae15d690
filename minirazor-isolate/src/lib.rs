//! Runs [MiniRazor](minirazor) engines inside a worker process.
//!
//! Compiled templates run code that was generated at runtime.  To keep a
//! misbehaving template from taking down the application, the engine can
//! live in a separate `minirazor-worker` process.  The host talks to it
//! over the worker's stdin and stdout, one line of JSON per message (see
//! [`protocol`]).  Only serializable data crosses the boundary: template
//! names and sources, models and view bags (see [`WireValue`]), and the
//! rendered output.
//!
//! ```no_run
//! use minirazor::EngineConfig;
//! use minirazor_isolate::EngineHandle;
//!
//! let config = EngineConfig {
//!     isolated: true,
//!     ..EngineConfig::default()
//! };
//! let engine = EngineHandle::new(config).unwrap();
//! engine.add_template("hello", "Hello @Model.name!").unwrap();
//! let rv = engine.run("hello", minirazor::model! { name => "World" }).unwrap();
//! assert_eq!(rv, "Hello World!");
//! engine.dispose().unwrap();
//! ```
//!
//! # Errors
//!
//! Errors reported by the worker's engine keep their [`ErrorKind`] and
//! their context.  Failures of the boundary itself are translated:
//!
//! * a model or view bag that cannot be serialized, a custom dialect or a
//!   worker binary that cannot be started fails with
//!   [`ErrorKind::InvalidConfiguration`] before anything is sent.
//! * a worker that crashes or answers with garbage fails the call in flight
//!   with [`ErrorKind::RuntimeError`].  The next call starts a new worker.
//!
//! [`ErrorKind`]: minirazor::ErrorKind
//! [`ErrorKind::InvalidConfiguration`]: minirazor::ErrorKind::InvalidConfiguration
//! [`ErrorKind::RuntimeError`]: minirazor::ErrorKind::RuntimeError
#![deny(missing_docs)]

mod builder;
mod host;
pub mod protocol;
mod wire;
mod worker;

pub use self::builder::{EngineHandle, IsolationBuilder, WORKER_BINARY};
pub use self::host::IsolatedEngine;
pub use self::wire::{RemoteCause, WireError, WireValue};
pub use self::worker::serve;
