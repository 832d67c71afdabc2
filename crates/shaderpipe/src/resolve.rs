use std::fs;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::includes::IncludeDependencies;
use crate::path::{PathError, PathMappings, VirtualPath};
use crate::strip::strip_comments;

#[derive(Clone, Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("failed to read shader source `{0}`")]
    FileNotFound(String),
    #[error("{0}")]
    Path(#[from] PathError),
}

/// A Resolver maps a validated virtual path to the contents of the shader
/// source file it identifies.
pub trait Resolver: Send + Sync {
    fn resolve_source(&self, path: &VirtualPath) -> Result<String, ResolveError>;
}

impl<T: Resolver + ?Sized> Resolver for Box<T> {
    fn resolve_source(&self, path: &VirtualPath) -> Result<String, ResolveError> {
        (**self).resolve_source(path)
    }
}

impl<T: Resolver + ?Sized> Resolver for &T {
    fn resolve_source(&self, path: &VirtualPath) -> Result<String, ResolveError> {
        (**self).resolve_source(path)
    }
}

/// Resolves through the registered directory mappings to physical files.
pub struct FileResolver {
    mappings: Arc<PathMappings>,
}

impl FileResolver {
    pub fn new(mappings: Arc<PathMappings>) -> Self {
        Self { mappings }
    }
}

impl Resolver for FileResolver {
    fn resolve_source(&self, path: &VirtualPath) -> Result<String, ResolveError> {
        let physical = self.mappings.resolve(path)?;
        fs::read_to_string(&physical)
            .map_err(|_| ResolveError::FileNotFound(format!("{path} ({})", physical.display())))
    }
}

/// In-memory resolver, used by tests and by generated-source injection.
#[derive(Default)]
pub struct VirtualFileResolver {
    files: FxHashMap<String, String>,
}

impl VirtualFileResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, path: impl Into<String>, source: impl Into<String>) {
        self.files.insert(path.into(), source.into());
    }
}

impl Resolver for VirtualFileResolver {
    fn resolve_source(&self, path: &VirtualPath) -> Result<String, ResolveError> {
        self.files
            .get(path.as_str())
            .cloned()
            .ok_or_else(|| ResolveError::FileNotFound(format!("{path} (virtual file)")))
    }
}

/// A loaded shader source file, shared read-only across all jobs that
/// reference it.
pub struct SourceEntry {
    pub source: String,
    stripped: OnceLock<Arc<str>>,
    dependencies: OnceLock<Arc<IncludeDependencies>>,
}

impl SourceEntry {
    fn new(source: String) -> Self {
        Self {
            source,
            stripped: OnceLock::new(),
            dependencies: OnceLock::new(),
        }
    }

    /// Comment-stripped copy, computed on first use.
    pub fn stripped(&self) -> Arc<str> {
        self.stripped
            .get_or_init(|| Arc::from(strip_comments(&self.source)))
            .clone()
    }

    pub fn dependencies(&self) -> Option<Arc<IncludeDependencies>> {
        self.dependencies.get().cloned()
    }

    /// Publishes the include-dependency record for this root file. Another
    /// thread may have finished the same scan first; the first record wins
    /// and later ones are dropped.
    pub fn set_dependencies(&self, deps: Arc<IncludeDependencies>) {
        let _ = self.dependencies.set(deps);
    }
}

/// Shared cache of loaded source files, keyed by fixed-up virtual path.
///
/// Read-heavy: lookups take a shared lock; on miss a writer takes the
/// exclusive lock, re-checks for a concurrent insert, and only then performs
/// the load. A flag-guarded negative cache remembers failed lookups during
/// bulk parallel loading and is purged afterwards so dynamically generated
/// files are not permanently treated as missing.
#[derive(Default)]
pub struct SourceFileCache {
    entries: RwLock<FxHashMap<String, Arc<SourceEntry>>>,
    missing: RwLock<Option<FxHashSet<String>>>,
}

impl SourceFileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &VirtualPath) -> Option<Arc<SourceEntry>> {
        self.entries.read().get(path.as_str()).cloned()
    }

    pub fn load(
        &self,
        resolver: &dyn Resolver,
        path: &VirtualPath,
    ) -> Result<Arc<SourceEntry>, ResolveError> {
        if let Some(entry) = self.entries.read().get(path.as_str()) {
            return Ok(entry.clone());
        }
        if let Some(missing) = self.missing.read().as_ref() {
            if missing.contains(path.as_str()) {
                return Err(ResolveError::FileNotFound(format!("{path} (cached miss)")));
            }
        }

        let mut entries = self.entries.write();
        // re-check: another thread may have inserted while we waited
        if let Some(entry) = entries.get(path.as_str()) {
            return Ok(entry.clone());
        }
        match resolver.resolve_source(path) {
            Ok(source) => {
                let entry = Arc::new(SourceEntry::new(source));
                entries.insert(path.to_string(), entry.clone());
                log::debug!("loaded shader source {path}");
                Ok(entry)
            }
            Err(err) => {
                if let Some(missing) = self.missing.write().as_mut() {
                    missing.insert(path.to_string());
                }
                Err(err)
            }
        }
    }

    /// Invalidates a single file, e.g. after it changed on disk.
    pub fn flush(&self, path: &VirtualPath) {
        self.entries.write().remove(path.as_str());
    }

    pub fn flush_all(&self) {
        self.entries.write().clear();
    }

    /// Enables negative-lookup caching for a bulk loading phase.
    pub fn begin_missing_file_cache(&self) {
        *self.missing.write() = Some(FxHashSet::default());
    }

    /// Purges remembered misses recorded since `begin_missing_file_cache`.
    pub fn end_missing_file_cache(&self) {
        *self.missing.write() = None;
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mappings() -> Arc<PathMappings> {
        let mut m = PathMappings::new();
        m.add_mapping("/Game", "/nonexistent");
        Arc::new(m)
    }

    #[test]
    fn cache_load_is_memoized() {
        let m = mappings();
        let mut resolver = VirtualFileResolver::new();
        resolver.add_file("/Game/A.usf", "float a;");
        let cache = SourceFileCache::new();
        let path = VirtualPath::new("/Game/A.usf", &m).unwrap();

        let first = cache.load(&resolver, &path).unwrap();
        let second = cache.load(&resolver, &path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn missing_cache_remembers_and_purges() {
        let m = mappings();
        let mut resolver = VirtualFileResolver::new();
        let cache = SourceFileCache::new();
        let path = VirtualPath::new("/Game/Gen.usf", &m).unwrap();

        cache.begin_missing_file_cache();
        assert!(cache.load(&resolver, &path).is_err());

        // now the file appears (e.g. generated); the negative cache still
        // reports it missing until purged
        resolver.add_file("/Game/Gen.usf", "float g;");
        assert!(cache.load(&resolver, &path).is_err());

        cache.end_missing_file_cache();
        assert!(cache.load(&resolver, &path).is_ok());
    }

    #[test]
    fn flush_invalidates_entry() {
        let m = mappings();
        let mut resolver = VirtualFileResolver::new();
        resolver.add_file("/Game/A.usf", "float a;");
        let cache = SourceFileCache::new();
        let path = VirtualPath::new("/Game/A.usf", &m).unwrap();

        let first = cache.load(&resolver, &path).unwrap();
        cache.flush(&path);
        let second = cache.load(&resolver, &path).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
