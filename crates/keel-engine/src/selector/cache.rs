//! Bounded LRU caches with TTL for compiled selector programs and regexes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use regex::Regex;

use super::cel::{CompileError, Program};

/// Default number of cached entries per cache.
pub const DEFAULT_CAPACITY: usize = 5_000;
/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct Entry<V> {
    value: Arc<V>,
    inserted_at: Instant,
    last_used: u64,
}

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    tick: u64,
}

/// A thread-safe LRU cache keyed by source text.
#[derive(Debug)]
pub struct CompileCache<V> {
    inner: Mutex<Inner<V>>,
    capacity: usize,
    ttl: Duration,
}

impl<V> CompileCache<V> {
    /// Creates a cache holding at most `capacity` entries for `ttl`.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Returns the cached value for `key`, compiling it on a miss.
    ///
    /// # Errors
    ///
    /// Propagates the compile error; failures are not cached.
    pub fn get_or_compile<E>(
        &self,
        key: &str,
        compile: impl FnOnce(&str) -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.tick += 1;
            let tick = inner.tick;
            if let Some(entry) = inner.entries.get_mut(key) {
                if entry.inserted_at.elapsed() < self.ttl {
                    entry.last_used = tick;
                    return Ok(Arc::clone(&entry.value));
                }
                inner.entries.remove(key);
            }
        }

        // Compile outside the lock; a racing compile of the same key is harmless.
        let value = Arc::new(compile(key)?);

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.entries.len() >= self.capacity {
            let ttl = self.ttl;
            inner.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        }
        if inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
            }
        }
        let tick = inner.tick;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: Arc::clone(&value),
                inserted_at: Instant::now(),
                last_used: tick,
            },
        );
        Ok(value)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Returns true when the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn programs() -> &'static CompileCache<Program> {
    static CACHE: OnceLock<CompileCache<Program>> = OnceLock::new();
    CACHE.get_or_init(|| CompileCache::new(DEFAULT_CAPACITY, DEFAULT_TTL))
}

fn regexes() -> &'static CompileCache<Regex> {
    static CACHE: OnceLock<CompileCache<Regex>> = OnceLock::new();
    CACHE.get_or_init(|| CompileCache::new(DEFAULT_CAPACITY, DEFAULT_TTL))
}

/// Compiles an expression through the process-wide program cache.
///
/// # Errors
///
/// Returns the compile error for malformed expressions.
pub fn program(source: &str) -> Result<Arc<Program>, CompileError> {
    programs().get_or_compile(source, Program::compile)
}

/// Compiles a regex through the process-wide regex cache.
///
/// # Errors
///
/// Returns the regex error for malformed patterns.
pub fn regex(pattern: &str) -> Result<Arc<Regex>, regex::Error> {
    regexes().get_or_compile(pattern, Regex::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn hits_do_not_recompile() {
        let cache: CompileCache<String> = CompileCache::new(10, DEFAULT_TTL);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let v = cache
                .get_or_compile::<()>("k", |k| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(k.to_uppercase())
                })
                .unwrap();
            assert_eq!(v.as_str(), "K");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache: CompileCache<usize> = CompileCache::new(2, DEFAULT_TTL);
        let ok = |k: &str| Ok::<_, ()>(k.len());
        cache.get_or_compile("a", ok).unwrap();
        cache.get_or_compile("bb", ok).unwrap();
        cache.get_or_compile("a", ok).unwrap();
        cache.get_or_compile("ccc", ok).unwrap();
        assert_eq!(cache.len(), 2);

        let recompiled = AtomicUsize::new(0);
        cache
            .get_or_compile::<()>("a", |k| {
                recompiled.fetch_add(1, Ordering::SeqCst);
                Ok(k.len())
            })
            .unwrap();
        assert_eq!(recompiled.load(Ordering::SeqCst), 0, "recently used entry survived");
    }

    #[test]
    fn expired_entries_are_recompiled() {
        let cache: CompileCache<usize> = CompileCache::new(4, Duration::ZERO);
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            cache
                .get_or_compile::<()>("x", |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failures_are_not_cached() {
        assert!(program("a ==").is_err());
        assert!(regex("(").is_err());
        assert!(program("a == 1").is_ok());
    }
}
