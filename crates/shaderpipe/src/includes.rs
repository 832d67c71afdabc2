//! Recursive `#include` dependency tracking.
//!
//! The scan works on comment-stripped source so commented-out includes are
//! never followed. Discovery order is depth-first, matching the order the
//! backend preprocessor will actually expand files in.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::hash::ContentHash;
use crate::path::{collapse_relative, PathMappings, VirtualPath};
use crate::resolve::{ResolveError, Resolver, SourceFileCache};

/// Hard cap on `#include` directive searches per file. Pathological files
/// terminate the scan early with a warning instead of failing the job.
pub const MAX_INCLUDE_SEARCHES: usize = 200;

/// Maximum include nesting depth.
pub const MAX_INCLUDE_DEPTH: u32 = 100;

/// Generated includes under this stem receive their contents from the
/// compile environment, not from the resolver.
const GENERATED_STEM: &str = "/Engine/Generated/";

/// The generated material include is a stand-in for the material template;
/// the scan follows the template so material edits invalidate dependents.
const MATERIAL_ALIAS: (&str, &str) = (
    "/Engine/Generated/Material.ush",
    "/Engine/Private/MaterialTemplate.ush",
);

/// One discovered include edge.
#[derive(Clone, Debug)]
pub struct IncludeEntry {
    /// The literal text between the quotes in the directive.
    pub path_in_source: String,
    /// Virtual path of the including file.
    pub parent: String,
    /// Fixed-up virtual path the directive resolved to.
    pub resolved: String,
    /// Hash of the resolved file's stripped contents.
    pub hash: ContentHash,
}

/// The include closure of one root file: an append-only edge list plus two
/// lookup indexes for O(1) dedup, one over the literal source strings and
/// one over resolved paths.
#[derive(Debug, Default)]
pub struct IncludeDependencies {
    entries: Vec<IncludeEntry>,
    by_source: FxHashMap<(String, String), usize>,
    by_result: FxHashMap<String, usize>,
    /// Set when an iteration or depth cap cut the scan short.
    pub truncated: bool,
}

impl IncludeDependencies {
    /// Resolved paths in discovery order, each exactly once.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.resolved.as_str())
    }

    pub fn entries(&self) -> &[IncludeEntry] {
        &self.entries
    }

    pub fn contains(&self, resolved: &str) -> bool {
        self.by_result.contains_key(resolved)
    }

    /// True when the (parent, literal) edge was already recorded.
    fn seen_edge(&self, parent: &str, literal: &str) -> bool {
        self.by_source
            .contains_key(&(parent.to_string(), literal.to_string()))
    }

    fn record(&mut self, entry: IncludeEntry) -> bool {
        let source_key = (entry.parent.clone(), entry.path_in_source.clone());
        if let Some(&existing) = self.by_result.get(&entry.resolved) {
            self.by_source.insert(source_key, existing);
            return false;
        }
        let index = self.entries.len();
        self.by_source.insert(source_key, index);
        self.by_result.insert(entry.resolved.clone(), index);
        self.entries.push(entry);
        true
    }
}

/// Finds the next `#include "..."` directive in `text`.
///
/// The token rule is strict: `#`, optional whitespace, `include`, then
/// required whitespace before the quoted name. A bare substring match would
/// also hit identifiers containing "include".
///
/// Returns the quoted name and the offset just past its closing quote.
pub fn find_first_include(text: &str) -> Option<(&str, usize)> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'#' {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
            j += 1;
        }
        if !text[j..].starts_with("include") {
            i += 1;
            continue;
        }
        let mut k = j + "include".len();
        if !matches!(bytes.get(k), Some(b' ') | Some(b'\t')) {
            i = k;
            continue;
        }
        while k < bytes.len() && (bytes[k] == b' ' || bytes[k] == b'\t') {
            k += 1;
        }
        if bytes.get(k) != Some(&b'"') {
            i = k;
            continue;
        }
        let start = k + 1;
        let end = start + text[start..].find('"')?;
        return Some((&text[start..end], end + 1));
    }
    None
}

/// Walks the `#include` closure of root files for one target platform.
pub struct IncludeScanner<'a> {
    mappings: &'a PathMappings,
    resolver: &'a dyn Resolver,
    cache: &'a SourceFileCache,
    platform: &'a str,
    /// Injected in-memory contents for generated includes, by virtual path.
    include_contents: Option<&'a BTreeMap<String, String>>,
}

impl<'a> IncludeScanner<'a> {
    pub fn new(
        mappings: &'a PathMappings,
        resolver: &'a dyn Resolver,
        cache: &'a SourceFileCache,
        platform: &'a str,
    ) -> Self {
        Self {
            mappings,
            resolver,
            cache,
            platform,
            include_contents: None,
        }
    }

    pub fn with_include_contents(mut self, contents: &'a BTreeMap<String, String>) -> Self {
        self.include_contents = Some(contents);
        self
    }

    /// Returns the include closure of `root`, scanning it if the root's
    /// cache entry does not already hold a published record.
    pub fn get_includes(
        &self,
        root: &VirtualPath,
    ) -> Result<Arc<IncludeDependencies>, ResolveError> {
        let entry = self.cache.load(self.resolver, root)?;
        if let Some(deps) = entry.dependencies() {
            return Ok(deps);
        }

        let mut deps = IncludeDependencies::default();
        self.scan_file(root.as_str(), &entry.stripped(), &mut deps, MAX_INCLUDE_DEPTH);
        let deps = Arc::new(deps);
        entry.set_dependencies(deps.clone());
        Ok(entry.dependencies().unwrap_or(deps))
    }

    fn scan_file(&self, parent: &str, text: &str, deps: &mut IncludeDependencies, depth: u32) {
        if depth == 0 {
            log::warn!("include depth limit reached scanning {parent}, truncating");
            deps.truncated = true;
            return;
        }

        let mut cursor = 0;
        let mut searches = 0;
        while let Some((literal, next)) = find_first_include(&text[cursor..]) {
            searches += 1;
            if searches > MAX_INCLUDE_SEARCHES {
                log::warn!("include search limit reached scanning {parent}, truncating");
                deps.truncated = true;
                return;
            }
            let literal = literal.to_string();
            cursor += next;
            self.follow_include(parent, &literal, deps, depth);
        }
    }

    fn follow_include(
        &self,
        parent: &str,
        literal: &str,
        deps: &mut IncludeDependencies,
        depth: u32,
    ) {
        if deps.seen_edge(parent, literal) {
            return;
        }

        let parent_dir = match parent.rfind('/') {
            Some(0) | None => "/",
            Some(idx) => &parent[..idx],
        };
        let mut resolved = if literal.starts_with('/') {
            literal.to_string()
        } else {
            match collapse_relative(parent_dir, literal) {
                Some(path) => path,
                None => {
                    log::warn!("include `{literal}` in {parent} escapes the virtual root");
                    return;
                }
            }
        };

        if resolved == MATERIAL_ALIAS.0 {
            resolved = MATERIAL_ALIAS.1.to_string();
        }
        self.mappings.fixup(&mut resolved, self.platform);
        if self.mappings.is_foreign_platform_include(&resolved, self.platform) {
            return;
        }

        // generated files without injected contents are produced later in the
        // pipeline; their text reaches the hash through the environment
        let injected = self
            .include_contents
            .and_then(|contents| contents.get(&resolved));
        if injected.is_none() && resolved.starts_with(GENERATED_STEM) {
            return;
        }

        let stripped: Arc<str> = match injected {
            Some(contents) => Arc::from(crate::strip::strip_comments(contents)),
            None => {
                let path = match VirtualPath::new(resolved.clone(), self.mappings) {
                    Ok(path) => path,
                    Err(err) => {
                        log::warn!("skipping include `{literal}` in {parent}: {err}");
                        return;
                    }
                };
                match self.cache.load(self.resolver, &path) {
                    Ok(entry) => entry.stripped(),
                    Err(err) => {
                        log::warn!("skipping include `{literal}` in {parent}: {err}");
                        return;
                    }
                }
            }
        };

        let first_visit = deps.record(IncludeEntry {
            path_in_source: literal.to_string(),
            parent: parent.to_string(),
            resolved: resolved.clone(),
            hash: ContentHash::digest(stripped.as_bytes()),
        });
        if first_visit {
            self.scan_file(&resolved, &stripped, deps, depth - 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::VirtualFileResolver;

    fn mappings() -> PathMappings {
        let mut m = PathMappings::new();
        m.add_mapping("/Game", "/unused");
        m.add_mapping("/Engine", "/unused");
        m
    }

    #[test]
    fn include_token_rule() {
        assert_eq!(find_first_include("#include \"A.ush\"").map(|(n, _)| n), Some("A.ush"));
        assert_eq!(find_first_include("#  include\t\"A.ush\"").map(|(n, _)| n), Some("A.ush"));
        // no whitespace after the keyword, or no hash at all
        assert_eq!(find_first_include("#include_next \"A.ush\""), None);
        assert_eq!(find_first_include("reinclude \"A.ush\""), None);
        assert_eq!(find_first_include("#include \"A.ush\" #include \"B.ush\"").map(|(n, _)| n), Some("A.ush"));
    }

    #[test]
    fn closure_is_depth_first_and_unique() {
        let m = mappings();
        let mut resolver = VirtualFileResolver::new();
        resolver.add_file("/Game/Root.usf", "#include \"A.ush\"\n#include \"B.ush\"\n");
        resolver.add_file("/Game/A.ush", "#include \"C.ush\"\n");
        resolver.add_file("/Game/B.ush", "#include \"C.ush\"\n");
        resolver.add_file("/Game/C.ush", "float c;\n");
        let cache = SourceFileCache::new();
        let scanner = IncludeScanner::new(&m, &resolver, &cache, "TestPlatform");

        let root = VirtualPath::new("/Game/Root.usf", &m).unwrap();
        let deps = scanner.get_includes(&root).unwrap();
        let paths: Vec<&str> = deps.paths().collect();
        assert_eq!(paths, vec!["/Game/A.ush", "/Game/C.ush", "/Game/B.ush"]);
        assert!(!deps.truncated);
    }

    #[test]
    fn relative_includes_collapse() {
        let m = mappings();
        let mut resolver = VirtualFileResolver::new();
        resolver.add_file("/Engine/Private/Root.usf", "#include \"../Public/Common.ush\"\n");
        resolver.add_file("/Engine/Public/Common.ush", "float c;\n");
        let cache = SourceFileCache::new();
        let scanner = IncludeScanner::new(&m, &resolver, &cache, "TestPlatform");

        let root = VirtualPath::new("/Engine/Private/Root.usf", &m).unwrap();
        let deps = scanner.get_includes(&root).unwrap();
        assert!(deps.contains("/Engine/Public/Common.ush"));
    }

    #[test]
    fn commented_out_includes_are_ignored() {
        let m = mappings();
        let mut resolver = VirtualFileResolver::new();
        resolver.add_file("/Game/Root.usf", "// #include \"A.ush\"\n/* #include \"B.ush\" */\n");
        let cache = SourceFileCache::new();
        let scanner = IncludeScanner::new(&m, &resolver, &cache, "TestPlatform");

        let root = VirtualPath::new("/Game/Root.usf", &m).unwrap();
        let deps = scanner.get_includes(&root).unwrap();
        assert_eq!(deps.entries().len(), 0);
    }

    #[test]
    fn mutually_recursive_includes_are_deduped() {
        let m = mappings();
        let mut resolver = VirtualFileResolver::new();
        resolver.add_file("/Game/Ping.ush", "#include \"Pong.ush\"\n");
        resolver.add_file("/Game/Pong.ush", "#include \"Ping.ush\"\n");
        let cache = SourceFileCache::new();
        let scanner = IncludeScanner::new(&m, &resolver, &cache, "TestPlatform");

        let root = VirtualPath::new("/Game/Ping.ush", &m).unwrap();
        let deps = scanner.get_includes(&root).unwrap();
        // Pong -> Ping -> Pong is deduped by resolved path, not by depth
        assert_eq!(deps.entries().len(), 2);
    }

    #[test]
    fn deep_include_chain_truncates_at_the_depth_limit() {
        let m = mappings();
        let mut resolver = VirtualFileResolver::new();
        let chain = MAX_INCLUDE_DEPTH as usize + 20;
        for i in 0..chain {
            resolver.add_file(
                format!("/Game/Level{i}.ush"),
                format!("#include \"Level{}.ush\"\n", i + 1),
            );
        }
        resolver.add_file(format!("/Game/Level{chain}.ush"), "float end;\n");
        let cache = SourceFileCache::new();
        let scanner = IncludeScanner::new(&m, &resolver, &cache, "TestPlatform");

        let root = VirtualPath::new("/Game/Level0.ush", &m).unwrap();
        let deps = scanner.get_includes(&root).unwrap();
        assert!(deps.truncated);
        // one edge per level until the walk ran out of depth
        assert_eq!(deps.entries().len(), MAX_INCLUDE_DEPTH as usize);
    }

    #[test]
    fn search_cap_truncates_pathological_files() {
        let m = mappings();
        let mut resolver = VirtualFileResolver::new();
        resolver.add_file(
            "/Game/Root.usf",
            "#include \"A.ush\"\n".repeat(MAX_INCLUDE_SEARCHES + 1),
        );
        resolver.add_file("/Game/A.ush", "float a;\n");
        let cache = SourceFileCache::new();
        let scanner = IncludeScanner::new(&m, &resolver, &cache, "TestPlatform");

        let root = VirtualPath::new("/Game/Root.usf", &m).unwrap();
        let deps = scanner.get_includes(&root).unwrap();
        assert!(deps.truncated);
        assert_eq!(deps.entries().len(), 1);
    }

    #[test]
    fn generated_material_include_follows_the_template() {
        let m = mappings();
        let mut resolver = VirtualFileResolver::new();
        resolver.add_file(
            "/Game/M.usf",
            "#include \"/Engine/Generated/Material.ush\"\n#include \"/Engine/Generated/Uniforms.ush\"\n",
        );
        resolver.add_file("/Engine/Private/MaterialTemplate.ush", "float t;\n");
        let cache = SourceFileCache::new();
        let scanner = IncludeScanner::new(&m, &resolver, &cache, "TestPlatform");

        let root = VirtualPath::new("/Game/M.usf", &m).unwrap();
        let deps = scanner.get_includes(&root).unwrap();
        let paths: Vec<&str> = deps.paths().collect();
        // the other generated include has no injected contents and is skipped
        assert_eq!(paths, vec!["/Engine/Private/MaterialTemplate.ush"]);
    }

    #[test]
    fn scan_record_is_published_once() {
        let m = mappings();
        let mut resolver = VirtualFileResolver::new();
        resolver.add_file("/Game/Root.usf", "#include \"A.ush\"\n");
        resolver.add_file("/Game/A.ush", "float a;\n");
        let cache = SourceFileCache::new();
        let scanner = IncludeScanner::new(&m, &resolver, &cache, "TestPlatform");

        let root = VirtualPath::new("/Game/Root.usf", &m).unwrap();
        let first = scanner.get_includes(&root).unwrap();
        let second = scanner.get_includes(&root).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
