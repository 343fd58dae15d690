//! MiniRazor is a compile-once, run-many template engine for Razor style
//! templates.
//!
//! Templates mix literal markup with `@` expressions and blocks:
//!
//! ```razor
//! @model Page
//! @{ Layout = "_layout"; ViewBag.Title = Model.Title; }
//! <ul>
//! @foreach (var item in Model.Items) {
//!   <li>@item.Name</li>
//! }
//! </ul>
//! @section Scripts { <script src="page.js"></script> }
//! ```
//!
//! The interesting part of the engine is not the syntax but what happens
//! around it:
//!
//! * Every template is compiled exactly once per [`TemplateKey`].  Callers
//!   that ask for a template that is currently compiling wait for that
//!   compilation instead of starting their own, and failed compilations are
//!   never cached so a fixed template compiles on the next call.
//! * Templates compose: a template can declare a layout that wraps its
//!   output (`@RenderBody()`) and the sections it defined
//!   (`@RenderSection("Scripts")`), and it can include other templates
//!   (`@Include("partial")`).  A [`ViewBag`] is shared by everything one run
//!   composes.
//! * Many templates can be run at once on a bounded thread pool with
//!   [`Engine::run_many`] which keeps the input order.
//! * The `minirazor-isolate` crate runs all of this inside a worker process.
//!
//! # Example
//!
//! ```
//! use minirazor::{Engine, model};
//!
//! let engine = Engine::new();
//! engine.add_template("_layout", "<title>@ViewBag.Title</title>@RenderBody()").unwrap();
//! engine.add_template(
//!     "hello",
//!     "@{ Layout = \"_layout\"; ViewBag.Title = \"Hi\"; }Hello @Model.name!",
//! ).unwrap();
//! let rv = engine.run("hello", model! { name => "World" }).unwrap();
//! assert_eq!(rv, "<title>Hi</title>Hello World!");
//! ```
//!
//! # Models
//!
//! Anything that implements [`Serialize`](serde::Serialize) can be used as
//! a model.  Structs keep their type name which is checked against a
//! template's `@model` directive, maps and [`model!`] values are anonymous
//! and are walked structurally.  With
//! [`allow_missing_properties_on_dynamic_model`](EngineConfig::allow_missing_properties_on_dynamic_model)
//! missing properties of anonymous models render as empty.
//!
//! # Collaborators
//!
//! Where sources come from, how they are turned into programs and how
//! programs are compiled are all pluggable: see [`TemplateManager`],
//! [`CodeGenerator`] / [`Dialect`], [`CompilerBackend`] and
//! [`CachingProvider`].
//!
//! # Optional Features
//!
//! - `preserve_order`: keeps the order of map keys in models and the view
//!   bag.
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::new_without_default)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]

#[macro_use]
mod macros;

mod backend;
mod batch;
mod cache;
mod compiler;
mod composition;
mod config;
mod engine;
mod error;
mod generator;
mod key;
mod manager;
mod output;
mod template;
mod utils;
mod vm;

pub mod value;

pub use self::backend::{
    Artifact, ArtifactBackend, AssemblerBackend, BackendOptions, CompiledUnit, CompilerBackend,
};
pub use self::batch::BatchError;
pub use self::cache::{CacheKey, CachingProvider, MemoryCachingProvider};
pub use self::composition::IncludeModel;
pub use self::config::{BatchPolicy, Encoding, EngineConfig};
pub use self::engine::Engine;
pub use self::error::{Diagnostic, DiagnosticKind, Error, ErrorKind};
pub use self::generator::{
    CodeGenerator, CompileRequest, Dialect, GeneratedProgram, ModelType, RazorGenerator,
};
pub use self::key::{ResolvePurpose, TemplateKey};
pub use self::manager::{LoaderManager, MemoryManager, PathManager, TemplateManager};
pub use self::template::{CompiledTemplate, Template};
pub use self::value::Value;
pub use self::vm::{TemplateInstance, ViewBag};

#[doc(hidden)]
pub use self::macros::__model;

/// Access to the program format used between code generators and backends.
///
/// Custom [`CodeGenerator`]s that wrap the built-in one and custom
/// [`CompilerBackend`]s need to read and write program listings.  The
/// listing format is documented on [`assemble`](listing::assemble).
pub mod listing {
    pub use crate::compiler::instructions::Program;
    pub use crate::compiler::listing::{assemble, write_listing};
}
