//! The compiled template cache.
//!
//! Storage is delegated to a [`CachingProvider`].  In front of it sits a
//! single-flight table that makes sure a key is compiled at most once at a
//! time: the first caller that misses becomes the leader of a flight and
//! compiles, every other caller for the same key joins the flight and waits
//! for its result.
//!
//! What a template compiles to depends on the model type it was requested
//! for, so entries are stored under a [`CacheKey`] that pairs the template
//! key with that model type.  The table lock is only held for bookkeeping, never while
//! compiling, so unrelated keys compile concurrently.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind};
use crate::generator::ModelType;
use crate::key::TemplateKey;
use crate::template::CompiledTemplate;
use crate::utils::lock;

/// The identity a compiled template is cached under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    template: TemplateKey,
    model_type: ModelType,
}

impl CacheKey {
    /// Creates a cache key for a template requested with a model type.
    pub fn new(template: TemplateKey, model_type: ModelType) -> CacheKey {
        CacheKey {
            template,
            model_type,
        }
    }

    /// Returns the template key.
    pub fn template(&self) -> &TemplateKey {
        &self.template
    }

    /// Returns the requested model type.
    pub fn model_type(&self) -> &ModelType {
        &self.model_type
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.model_type {
            ModelType::Dynamic => write!(f, "{}", self.template),
            ref model_type => write!(f, "{} as {}", self.template, model_type),
        }
    }
}

/// Pluggable storage for compiled templates.
///
/// Providers only store successfully compiled templates.  They are called
/// concurrently and have to synchronize internally.
pub trait CachingProvider: Send + Sync {
    /// Returns the compiled template for a key.
    fn get(&self, key: &CacheKey) -> Option<Arc<CompiledTemplate>>;

    /// Stores a compiled template.
    fn insert(&self, key: CacheKey, template: Arc<CompiledTemplate>);

    /// Removes the compiled template for a key.
    fn remove(&self, key: &CacheKey) -> Option<Arc<CompiledTemplate>>;

    /// Keeps only the entries for which the predicate returns `true` and
    /// returns the number of removed entries.
    fn retain(&self, f: &mut dyn FnMut(&CacheKey) -> bool) -> usize;

    /// Removes all entries.
    fn clear(&self);

    /// Returns the keys of all stored entries.
    fn keys(&self) -> Vec<CacheKey>;

    /// Returns the number of stored entries.
    fn len(&self) -> usize;

    /// Is the provider empty?
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The default in-memory caching provider.
#[derive(Default)]
pub struct MemoryCachingProvider {
    entries: RwLock<HashMap<CacheKey, Arc<CompiledTemplate>>>,
}

impl MemoryCachingProvider {
    /// Creates an empty provider.
    pub fn new() -> MemoryCachingProvider {
        MemoryCachingProvider::default()
    }
}

impl fmt::Debug for MemoryCachingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCachingProvider")
            .field("len", &self.len())
            .finish()
    }
}

impl CachingProvider for MemoryCachingProvider {
    fn get(&self, key: &CacheKey) -> Option<Arc<CompiledTemplate>> {
        self.entries
            .read()
            .unwrap_or_else(|x| x.into_inner())
            .get(key)
            .cloned()
    }

    fn insert(&self, key: CacheKey, template: Arc<CompiledTemplate>) {
        self.entries
            .write()
            .unwrap_or_else(|x| x.into_inner())
            .insert(key, template);
    }

    fn remove(&self, key: &CacheKey) -> Option<Arc<CompiledTemplate>> {
        self.entries
            .write()
            .unwrap_or_else(|x| x.into_inner())
            .remove(key)
    }

    fn retain(&self, f: &mut dyn FnMut(&CacheKey) -> bool) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|x| x.into_inner());
        let before = entries.len();
        entries.retain(|key, _| f(key));
        before - entries.len()
    }

    fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|x| x.into_inner())
            .clear();
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.entries
            .read()
            .unwrap_or_else(|x| x.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|x| x.into_inner()).len()
    }
}

type FlightResult = Result<Arc<CompiledTemplate>, Error>;

/// One in-flight compilation.
#[derive(Default)]
struct Flight {
    state: Mutex<Option<FlightResult>>,
    cond: Condvar,
    /// Set when the key was invalidated while compiling.
    stale: AtomicBool,
}

impl Flight {
    fn wait(&self, key: &CacheKey, timeout: Option<Duration>) -> FlightResult {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = lock(&self.state);
        loop {
            if let Some(ref result) = *state {
                return result.clone();
            }
            state = match deadline {
                None => self.cond.wait(state).unwrap_or_else(|x| x.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!(template = %key, "gave up waiting for compilation");
                        return Err(Error::new(
                            ErrorKind::Timeout,
                            format!("timed out waiting for the compilation of {}", key),
                        ));
                    }
                    self.cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|x| x.into_inner())
                        .0
                }
            };
        }
    }
}

/// Resolves a flight when the leader is done, also when it panics.
struct FlightGuard<'c> {
    cache: &'c TemplateCache,
    key: CacheKey,
    flight: Arc<Flight>,
    done: bool,
}

impl FlightGuard<'_> {
    fn finish(mut self, result: FlightResult) -> FlightResult {
        self.done = true;
        self.publish(result.clone());
        result
    }

    fn publish(&self, result: FlightResult) {
        {
            let mut in_flight = lock(&self.cache.in_flight);
            if let Ok(ref compiled) = result {
                if !self.flight.stale.load(Ordering::Acquire) {
                    self.cache
                        .provider
                        .insert(self.key.clone(), compiled.clone());
                }
            }
            if in_flight
                .get(&self.key)
                .map_or(false, |flight| Arc::ptr_eq(flight, &self.flight))
            {
                in_flight.remove(&self.key);
            }
        }
        *lock(&self.flight.state) = Some(result);
        self.flight.cond.notify_all();
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.publish(Err(Error::new(
                ErrorKind::CompileError,
                format!("compilation of {} panicked", self.key),
            )));
        }
    }
}

/// Single-flight compilation in front of a caching provider.
pub(crate) struct TemplateCache {
    provider: Box<dyn CachingProvider>,
    in_flight: Mutex<HashMap<CacheKey, Arc<Flight>>>,
}

impl Default for TemplateCache {
    fn default() -> TemplateCache {
        TemplateCache::new(Box::new(MemoryCachingProvider::new()))
    }
}

impl fmt::Debug for TemplateCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateCache")
            .field("len", &self.provider.len())
            .field("in_flight", &lock(&self.in_flight).len())
            .finish()
    }
}

enum Role {
    Leader(Arc<Flight>),
    Follower(Arc<Flight>),
}

impl TemplateCache {
    pub fn new(provider: Box<dyn CachingProvider>) -> TemplateCache {
        TemplateCache {
            provider,
            in_flight: Mutex::default(),
        }
    }

    /// Returns the cached template or compiles it.
    ///
    /// Concurrent callers for the same key share one compilation and all
    /// observe its result.  Failures are handed to every waiter but never
    /// stored.  A follower that runs into `timeout` gets an
    /// [`ErrorKind::Timeout`] error while the flight keeps going.
    pub fn get_or_compile<F>(
        &self,
        key: &CacheKey,
        timeout: Option<Duration>,
        compile: F,
    ) -> Result<Arc<CompiledTemplate>, Error>
    where
        F: FnOnce() -> Result<CompiledTemplate, Error>,
    {
        if let Some(rv) = self.provider.get(key) {
            tracing::trace!(template = %key, "cache hit");
            return Ok(rv);
        }

        let role = {
            let mut in_flight = lock(&self.in_flight);
            // a flight may have finished between the first lookup and
            // taking the lock
            if let Some(rv) = self.provider.get(key) {
                return Ok(rv);
            }
            match in_flight.get(key) {
                Some(flight) => Role::Follower(flight.clone()),
                None => {
                    let flight = Arc::new(Flight::default());
                    in_flight.insert(key.clone(), flight.clone());
                    Role::Leader(flight)
                }
            }
        };

        match role {
            Role::Follower(flight) => {
                tracing::trace!(template = %key, "joining in-flight compilation");
                flight.wait(key, timeout)
            }
            Role::Leader(flight) => {
                let guard = FlightGuard {
                    cache: self,
                    key: key.clone(),
                    flight,
                    done: false,
                };
                let result = compile().map(Arc::new);
                guard.finish(result)
            }
        }
    }

    /// Returns the cached template without compiling.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CompiledTemplate>> {
        self.provider.get(key)
    }

    fn mark_stale(in_flight: &mut HashMap<CacheKey, Arc<Flight>>, f: impl Fn(&CacheKey) -> bool) {
        in_flight.retain(|key, flight| {
            if f(key) {
                flight.stale.store(true, Ordering::Release);
                false
            } else {
                true
            }
        });
    }

    /// Removes a template key, whatever model types it was compiled for,
    /// and marks its in-flight compilations stale.
    pub fn invalidate(&self, key: &TemplateKey) -> usize {
        let mut in_flight = lock(&self.in_flight);
        Self::mark_stale(&mut in_flight, |other| other.template() == key);
        self.provider.retain(&mut |other| other.template() != key)
    }

    /// Removes every key with the given name, whatever its purpose and
    /// context.
    pub fn invalidate_name(&self, name: &str) -> usize {
        let mut in_flight = lock(&self.in_flight);
        Self::mark_stale(&mut in_flight, |key| key.template().name() == name);
        self.provider.retain(&mut |key| key.template().name() != name)
    }

    /// Removes everything.
    pub fn clear(&self) -> usize {
        let mut in_flight = lock(&self.in_flight);
        Self::mark_stale(&mut in_flight, |_| true);
        let rv = self.provider.len();
        self.provider.clear();
        rv
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.provider.keys()
    }

    pub fn len(&self) -> usize {
        self.provider.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    use crate::compiler::instructions::Program;

    fn global(name: &str) -> CacheKey {
        CacheKey::new(TemplateKey::global(name), ModelType::Dynamic)
    }

    fn dummy(key: &CacheKey) -> CompiledTemplate {
        CompiledTemplate::new(
            key.template().clone(),
            Program::new(key.template().name(), key.model_type().clone(), Default::default()),
            Arc::from(""),
            Arc::from(""),
            Vec::new(),
            None,
        )
    }

    #[test]
    fn test_single_flight() {
        let cache = TemplateCache::default();
        let key = global("page");
        let calls = AtomicUsize::new(0);
        let barrier = Barrier::new(8);
        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        cache
                            .get_or_compile(&key, None, || {
                                calls.fetch_add(1, Ordering::SeqCst);
                                thread::sleep(Duration::from_millis(50));
                                Ok(dummy(&key))
                            })
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|rv| Arc::ptr_eq(rv, &results[0])));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let cache = TemplateCache::default();
        let key = global("page");
        let err = cache
            .get_or_compile(&key, None, || {
                Err(Error::new(ErrorKind::SyntaxError, "bad"))
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SyntaxError);
        assert_eq!(cache.len(), 0);
        cache.get_or_compile(&key, None, || Ok(dummy(&key))).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_follower_timeout_does_not_cancel() {
        let cache = TemplateCache::default();
        let key = global("slow");
        let started = Barrier::new(2);
        thread::scope(|s| {
            let leader = s.spawn(|| {
                cache.get_or_compile(&key, None, || {
                    started.wait();
                    thread::sleep(Duration::from_millis(200));
                    Ok(dummy(&key))
                })
            });
            started.wait();
            let err = cache
                .get_or_compile(&key, Some(Duration::from_millis(10)), || {
                    panic!("follower must not compile")
                })
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Timeout);
            leader.join().unwrap().unwrap();
        });
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn test_panicking_leader_releases_followers() {
        let cache = TemplateCache::default();
        let key = global("boom");
        let rv = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.get_or_compile(&key, None, || panic!("oops"))
        }));
        assert!(rv.is_err());
        assert_eq!(lock(&cache.in_flight).len(), 0);
        cache.get_or_compile(&key, None, || Ok(dummy(&key))).unwrap();
    }

    #[test]
    fn test_invalidation_during_flight() {
        let cache = TemplateCache::default();
        let key = global("page");
        cache
            .get_or_compile(&key, None, || {
                cache.invalidate_name("page");
                Ok(dummy(&key))
            })
            .unwrap();
        assert_eq!(cache.len(), 0);
        cache.get_or_compile(&key, None, || Ok(dummy(&key))).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate_name("page"), 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_model_types_are_cached_apart() {
        let cache = TemplateCache::default();
        let dynamic = global("page");
        let typed = CacheKey::new(
            TemplateKey::global("page"),
            ModelType::Named("Order".into()),
        );
        let a = cache.get_or_compile(&dynamic, None, || Ok(dummy(&dynamic))).unwrap();
        let b = cache.get_or_compile(&typed, None, || Ok(dummy(&typed))).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.model_type(), &ModelType::Named("Order".into()));
        assert_eq!(cache.len(), 2);
        assert_eq!(typed.to_string(), "page as Order");
        assert_eq!(cache.invalidate(dynamic.template()), 2);
        assert_eq!(cache.len(), 0);
    }
}
