use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;

use crate::config::BatchPolicy;
use crate::engine::Engine;
use crate::error::{Error, ErrorKind};
use crate::value::Value;

/// The error of a batch run with at least one failed item.
///
/// Outcomes are kept in input order, so the output of the items that
/// succeeded can still be used.
///
/// ```
/// # use minirazor::{Engine, value::Value};
/// let engine = Engine::new();
/// engine.add_template("ok", "@Model").unwrap();
/// let err = engine
///     .run_many(&["ok", "missing", "ok"], vec![Value::from(1), Value::NONE, Value::from(3)], false)
///     .unwrap_err();
/// assert_eq!(err.failures(), 1);
/// assert_eq!(err.outcomes()[2].as_deref().ok(), Some("3"));
/// ```
#[derive(Debug, Clone)]
pub struct BatchError {
    outcomes: Vec<Result<String, Error>>,
    error: Error,
}

enum Outcome {
    Done(Result<String, Error>),
    Skipped,
}

impl BatchError {
    /// Creates a batch error from per-item outcomes and the failure that is
    /// reported first.
    ///
    /// This is primarily useful for code that rebuilds batch results, for
    /// instance after they crossed a process boundary.
    pub fn new(outcomes: Vec<Result<String, Error>>, error: Error) -> BatchError {
        BatchError { outcomes, error }
    }

    /// Returns the outcome of every item in input order.
    ///
    /// Items skipped under [`BatchPolicy::FailFast`] are reported as
    /// [`ErrorKind::InvalidOperation`] errors.
    pub fn outcomes(&self) -> &[Result<String, Error>] {
        &self.outcomes
    }

    /// Consumes the error and returns the outcomes.
    pub fn into_outcomes(self) -> Vec<Result<String, Error>> {
        self.outcomes
    }

    /// Returns the first real failure in input order.
    pub fn first_error(&self) -> &Error {
        &self.error
    }

    /// Returns the number of items that did not produce output.
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|x| x.is_err()).count()
    }

    fn from_outcomes(outcomes: Vec<Outcome>) -> Result<Vec<String>, BatchError> {
        let first = outcomes.iter().find_map(|outcome| match outcome {
            Outcome::Done(Err(err)) => Some(err.clone()),
            _ => None,
        });
        let error = match first {
            Some(error) => error,
            None => {
                return Ok(outcomes
                    .into_iter()
                    .filter_map(|outcome| match outcome {
                        Outcome::Done(Ok(rv)) => Some(rv),
                        _ => None,
                    })
                    .collect())
            }
        };
        Err(BatchError {
            outcomes: outcomes
                .into_iter()
                .map(|outcome| match outcome {
                    Outcome::Done(rv) => rv,
                    Outcome::Skipped => Err(Error::new(
                        ErrorKind::InvalidOperation,
                        "skipped because another batch item failed",
                    )),
                })
                .collect(),
            error,
        })
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} batch items failed, first error: {}",
            self.failures(),
            self.outcomes.len(),
            self.error
        )
    }
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl Engine {
    /// Runs many templates, each with its own model and a fresh view bag.
    ///
    /// `names[i]` runs with `models[i]` and the outputs come back in input
    /// order.  With `parallel` the items are spread over a thread pool of
    /// [`parallel_degree`](crate::EngineConfig::parallel_degree) threads
    /// which is created on first use and kept by the engine.
    ///
    /// If any item fails the whole call fails with a [`BatchError`] that
    /// still carries the output of the successful items.  What happens to
    /// the remaining items after a failure is decided by the
    /// [`BatchPolicy`].
    pub fn run_many<S: AsRef<str> + Sync>(
        &self,
        names: &[S],
        models: Vec<Value>,
        parallel: bool,
    ) -> Result<Vec<String>, BatchError> {
        if names.len() != models.len() {
            let error = Error::new(
                ErrorKind::InvalidOperation,
                format!(
                    "batch has {} templates but {} models",
                    names.len(),
                    models.len()
                ),
            );
            return Err(BatchError {
                outcomes: vec![Err(error.clone())],
                error,
            });
        }

        let now = Instant::now();
        let fail_fast = self.config().batch_policy == BatchPolicy::FailFast;
        let failed = AtomicBool::new(false);
        let run_one = |(name, model): (&S, Value)| {
            if fail_fast && failed.load(Ordering::Acquire) {
                return Outcome::Skipped;
            }
            let rv = self.run_key(&self.get_key(name.as_ref()), model, None);
            if rv.is_err() && fail_fast {
                failed.store(true, Ordering::Release);
            }
            Outcome::Done(rv)
        };

        let outcomes: Vec<Outcome> = if parallel && names.len() > 1 {
            let pool = match self.batch_pool() {
                Ok(pool) => pool,
                Err(error) => {
                    return Err(BatchError {
                        outcomes: vec![Err(error.clone())],
                        error,
                    })
                }
            };
            pool.install(|| {
                names
                    .par_iter()
                    .zip(models.into_par_iter())
                    .map(run_one)
                    .collect()
            })
        } else {
            names.iter().zip(models).map(run_one).collect()
        };

        tracing::debug!(
            items = outcomes.len(),
            parallel,
            elapsed = ?now.elapsed(),
            "finished batch run"
        );
        BatchError::from_outcomes(outcomes)
    }

    fn batch_pool(&self) -> Result<&rayon::ThreadPool, Error> {
        if let Some(pool) = self.pool_slot().get() {
            return Ok(pool);
        }
        let threads = self.config().effective_parallel_degree();
        let pool = ok!(rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("minirazor-batch-{}", idx))
            .build()
            .map_err(|err| {
                Error::new(
                    ErrorKind::InvalidConfiguration,
                    "could not create the batch thread pool",
                )
                .with_source(err)
            }));
        tracing::debug!(threads, "created batch thread pool");
        // a concurrent caller may have won, its pool is used and ours dropped
        Ok(self.pool_slot().get_or_init(|| pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use similar_asserts::assert_eq;

    fn engine() -> Engine {
        let engine = Engine::new();
        engine.add_template("item", "<@Model>").unwrap();
        engine.add_template("boom", "@Model.Nope").unwrap();
        engine
    }

    #[test]
    fn test_sequential_and_parallel_agree() {
        let engine = engine();
        let names = vec!["item"; 5];
        let models = (0..5).map(Value::from).collect::<Vec<_>>();
        let a = engine.run_many(&names, models.clone(), false).unwrap();
        let b = engine.run_many(&names, models, true).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[4], "<4>");
    }

    #[test]
    fn test_aggregate_runs_everything() {
        let engine = engine();
        let err = engine
            .run_many(
                &["item", "boom", "item"],
                vec![Value::from(1), Value::from(2), Value::from(3)],
                true,
            )
            .unwrap_err();
        assert_eq!(err.failures(), 1);
        assert_eq!(err.first_error().kind(), ErrorKind::UndefinedError);
        assert_eq!(err.outcomes()[0].as_deref().ok(), Some("<1>"));
        assert_eq!(err.outcomes()[2].as_deref().ok(), Some("<3>"));
    }

    #[test]
    fn test_fail_fast_skips_the_rest() {
        let mut engine = engine();
        engine.set_batch_policy(BatchPolicy::FailFast);
        let err = engine
            .run_many(
                &["boom", "item", "item"],
                vec![Value::from(1), Value::from(2), Value::from(3)],
                false,
            )
            .unwrap_err();
        assert_eq!(err.failures(), 3);
        assert_eq!(err.first_error().kind(), ErrorKind::UndefinedError);
        assert_eq!(
            err.outcomes()[1].as_ref().unwrap_err().kind(),
            ErrorKind::InvalidOperation
        );
    }

    #[test]
    fn test_length_mismatch() {
        let err = engine()
            .run_many(&["item"], Vec::new(), false)
            .unwrap_err();
        assert_eq!(err.first_error().kind(), ErrorKind::InvalidOperation);
    }
}
