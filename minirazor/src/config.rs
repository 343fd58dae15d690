use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// Controls how emitted values are encoded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Values are HTML encoded unless they are safe strings.
    #[default]
    Html,
    /// Values are written verbatim.
    Raw,
}

impl Encoding {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Encoding::Html => "html",
            Encoding::Raw => "raw",
        }
    }
}

/// What a batch run does after an item failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// Every item runs, all outcomes are reported.
    #[default]
    Aggregate,
    /// Items that have not started yet are skipped after the first failure.
    FailFast,
}

/// The configuration of an [`Engine`](crate::Engine).
///
/// The configuration can be deserialized which is also how it crosses the
/// process boundary for isolated engines.  All fields are optional when
/// deserializing.
///
/// ```
/// # use minirazor::EngineConfig;
/// let config: EngineConfig = serde_json::from_str(r#"{"encoding": "raw"}"#).unwrap();
/// assert!(!config.allow_missing_properties_on_dynamic_model);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Missing properties on anonymous models render as empty instead of
    /// failing.
    pub allow_missing_properties_on_dynamic_model: bool,
    /// The number of threads used for parallel batch runs.  `0` picks the
    /// number of available CPUs.
    pub parallel_degree: usize,
    /// Compiled artifacts are loaded into memory and deleted right away
    /// instead of being kept open for the lifetime of the template.
    pub disable_artifact_locking: bool,
    /// Templates run inside a separate worker process.
    pub isolated: bool,
    /// The encoding applied to emitted values.
    pub encoding: Encoding,
    /// The behavior of batch runs after a failure.
    pub batch_policy: BatchPolicy,
    /// Runtime errors carry the template source.
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            allow_missing_properties_on_dynamic_model: false,
            parallel_degree: 0,
            disable_artifact_locking: false,
            isolated: false,
            encoding: Encoding::Html,
            batch_policy: BatchPolicy::Aggregate,
            debug: cfg!(debug_assertions),
        }
    }
}

impl EngineConfig {
    /// Checks that the configuration can be used for an in-process engine.
    pub fn validate_local(&self) -> Result<(), Error> {
        if self.isolated {
            return Err(Error::new(
                ErrorKind::InvalidConfiguration,
                "an isolated configuration cannot create an in-process engine, \
                 use the minirazor-isolate crate instead",
            ));
        }
        Ok(())
    }

    /// Returns the number of threads for parallel batch runs.
    pub fn effective_parallel_degree(&self) -> usize {
        match self.parallel_degree {
            0 => std::thread::available_parallelism()
                .map(|x| x.get())
                .unwrap_or(1),
            n => n,
        }
    }
}
