//! Ahead-of-time lowering of guest snippets and the process-wide cache of
//! lowered code.
//!
//! A snippet is lowered once per `updated_at` value. The cache is an explicit
//! object handed to [`Compiler::new`]; it is populated lazily, an entry is
//! valid only while its stored timestamp equals the snippet's, and entries are
//! never cleared except by replacement or [`CompiledCache::invalidate`].

mod lower;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

pub use lower::lower_module;

/// Lowering failure carrying the first diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Everything the compiler needs to know about a snippet.
#[derive(Debug, Clone, Copy)]
pub struct CompileUnit<'a> {
    pub id: &'a str,
    pub reference: &'a str,
    pub name: &'a str,
    pub source: &'a str,
    /// Last-modified timestamp in milliseconds; the only invalidation signal.
    pub updated_at: i64,
}

impl CompileUnit<'_> {
    /// Synthetic file name used in diagnostics, e.g. `blog/hello.ts`.
    pub fn label(&self) -> String {
        format!("{}/{}.ts", self.reference, self.name)
    }
}

struct CacheEntry {
    compiled_at: i64,
    code: Arc<str>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// Lowered code keyed by snippet id.
#[derive(Default)]
pub struct CompiledCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl CompiledCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, id: &str, updated_at: i64) -> Option<Arc<str>> {
        let guard = self.entries.read().unwrap_or_else(|e| e.into_inner());
        guard
            .get(id)
            .filter(|entry| entry.compiled_at == updated_at)
            .map(|entry| Arc::clone(&entry.code))
    }

    fn store(&self, id: &str, compiled_at: i64, code: Arc<str>) {
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        guard.insert(id.to_string(), CacheEntry { compiled_at, code });
    }

    /// Drop the entry for a deleted or reset snippet.
    pub fn invalidate(&self, id: &str) -> bool {
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let removed = guard.remove(id).is_some();
        if removed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self
            .entries
            .read()
            .map(|guard| guard.len())
            .unwrap_or_else(|e| e.into_inner().len());
        CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct Compiler {
    cache: Arc<CompiledCache>,
}

impl Compiler {
    pub fn new(cache: Arc<CompiledCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<CompiledCache> {
        &self.cache
    }

    /// Return executable code for `unit`, lowering only when the cached entry
    /// is missing or was built from a different `updated_at`.
    ///
    /// Lowering runs outside the write lock. Two callers may lower the same
    /// snippet concurrently; the later store wins and both results are
    /// equivalent.
    pub fn compile(&self, unit: &CompileUnit<'_>) -> Result<Arc<str>, CompileError> {
        if let Some(code) = self.cache.lookup(unit.id, unit.updated_at) {
            self.cache.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(code);
        }

        self.cache.misses.fetch_add(1, Ordering::Relaxed);
        let label = unit.label();
        let code: Arc<str> = lower_module(&label, unit.source)?.into();
        tracing::debug!("compiled {} ({} bytes)", label, code.len());
        self.cache.store(unit.id, unit.updated_at, Arc::clone(&code));
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit<'a>(source: &'a str, updated_at: i64) -> CompileUnit<'a> {
        CompileUnit {
            id: "snippet-1",
            reference: "blog",
            name: "hello",
            source,
            updated_at,
        }
    }

    #[test]
    fn unchanged_timestamp_returns_cached_code() {
        let compiler = Compiler::new(Arc::new(CompiledCache::new()));
        let source = "export default async function handler() { return 1 }";

        let first = compiler.compile(&unit(source, 10)).expect("compile");
        let second = compiler.compile(&unit(source, 10)).expect("compile");

        assert!(Arc::ptr_eq(&first, &second));
        let stats = compiler.cache().stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn changed_timestamp_forces_recompile_even_with_same_source() {
        let compiler = Compiler::new(Arc::new(CompiledCache::new()));
        let source = "export default function handler() { return 1 }";

        let first = compiler.compile(&unit(source, 10)).expect("compile");
        let second = compiler.compile(&unit(source, 11)).expect("compile");

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(&*first, &*second);
        assert_eq!(compiler.cache().stats().misses, 2);
        assert_eq!(compiler.cache().stats().entries, 1);
    }

    #[test]
    fn syntax_error_surfaces_first_diagnostic() {
        let compiler = Compiler::new(Arc::new(CompiledCache::new()));
        let err = compiler
            .compile(&unit("export default function(", 1))
            .expect_err("should fail");
        assert!(err.message.contains("blog/hello.ts"));
        assert_eq!(compiler.cache().stats().entries, 0);
    }

    #[test]
    fn invalidate_drops_entry() {
        let compiler = Compiler::new(Arc::new(CompiledCache::new()));
        compiler
            .compile(&unit("export default () => 1", 1))
            .expect("compile");
        assert!(compiler.cache().invalidate("snippet-1"));
        assert!(!compiler.cache().invalidate("snippet-1"));
        assert_eq!(compiler.cache().stats().entries, 0);
        assert_eq!(compiler.cache().stats().invalidations, 1);
    }

    #[test]
    fn concurrent_compiles_converge_on_one_entry() {
        let compiler = Compiler::new(Arc::new(CompiledCache::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let compiler = compiler.clone();
                std::thread::spawn(move || {
                    compiler
                        .compile(&unit("export default () => 42", 7))
                        .map(|code| code.to_string())
                })
            })
            .collect();

        let outputs: Vec<String> = handles
            .into_iter()
            .map(|handle| handle.join().expect("join").expect("compile"))
            .collect();
        assert!(outputs.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(compiler.cache().stats().entries, 1);
    }
}
