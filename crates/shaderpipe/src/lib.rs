mod backend;
mod cache;
mod diagnostics;
mod dispatch;
mod env;
mod hash;
mod includes;
mod job;
mod path;
mod preprocess;
mod resolve;
mod strip;

pub use backend::{Backend, BackendRegistry, RawPreprocess, SourceLookup};
pub use cache::{read_job_dump, write_job_dump, JobCache};
pub use diagnostics::{BatchDiagnostics, CompilerDiagnostic, Severity};
pub use dispatch::{
    combine_outputs, dispatch, CancelToken, DispatchReport, JobReport, OrderedWriter,
};
pub use env::{
    CompileEnvironment, CompilerFlag, ResourceTableEntry, UniformBufferEntry,
};
pub use hash::{ContentHash, CACHE_FORMAT_VERSION};
pub use includes::{
    find_first_include, IncludeDependencies, IncludeEntry, IncludeScanner, MAX_INCLUDE_DEPTH,
    MAX_INCLUDE_SEARCHES,
};
pub use job::{
    attach_worker_output, serialize_worker_input, serialize_worker_output, CompileJob, Job,
    JobInput, JobKey, JobOutput, JobState, JobStatus, PipelineJob, PreprocessOutput,
    ShaderFrequency, ShaderTarget, SourceBlob, WorkerInput, WorkerOutput,
};
pub use path::{collapse_relative, PathError, PathMappings, PlatformDesc, VirtualPath};
pub use preprocess::preprocess_job;
pub use resolve::{
    FileResolver, ResolveError, Resolver, SourceEntry, SourceFileCache, VirtualFileResolver,
};
pub use strip::{
    patch_debug_hash, strip_comments, strip_preprocessed, LineOrigin, StrippedSource,
    DEBUG_HASH_MARKER, METADATA_DIRECTIVE_PREFIX,
};

use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Resolve(#[from] ResolveError),
    #[error("{0}")]
    Path(#[from] PathError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Serialize(#[from] bincode::Error),
}

pub struct CompileConfig {
    pub worker_threads: usize,
    /// Compress compiled code blobs when finalizing outputs.
    pub compress_output: bool,
    /// Name recorded in the worker wire format and job dumps.
    pub compression_format: String,
    /// Collect warnings from otherwise-successful jobs.
    pub show_warnings: bool,
    /// Ask backends to dump per-job debug artifacts.
    pub dump_debug_info: bool,
    /// Directory named in the one-time debug-info banner.
    pub debug_info_path: Option<String>,
    pub working_dir: PathBuf,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            compress_output: true,
            compression_format: "zlib".to_string(),
            show_warnings: false,
            dump_debug_info: false,
            debug_info_path: None,
            working_dir: std::env::temp_dir(),
        }
    }
}

/// Owns every shared piece of pipeline state: path mappings, the source
/// file cache, registered backends, the job result cache and configuration.
/// There are deliberately no process-wide singletons; everything is scoped
/// to one context.
pub struct CompilationContext {
    pub mappings: Arc<PathMappings>,
    pub resolver: Box<dyn Resolver>,
    pub sources: SourceFileCache,
    pub backends: BackendRegistry,
    pub job_cache: JobCache,
    /// Batch-wide environment merged into every job before preprocessing.
    pub shared_environment: Option<Arc<CompileEnvironment>>,
    pub config: CompileConfig,
}

impl CompilationContext {
    pub fn new(mappings: Arc<PathMappings>, resolver: Box<dyn Resolver>, config: CompileConfig) -> Self {
        Self {
            mappings,
            resolver,
            sources: SourceFileCache::new(),
            backends: BackendRegistry::new(),
            job_cache: JobCache::new(),
            shared_environment: None,
            config,
        }
    }

    /// A context resolving through the directory mappings to the local
    /// filesystem.
    pub fn with_file_resolver(mappings: Arc<PathMappings>, config: CompileConfig) -> Self {
        let resolver = Box::new(FileResolver::new(mappings.clone()));
        Self::new(mappings, resolver, config)
    }

    /// Compiles a batch of jobs and aggregates their diagnostics.
    pub fn compile(&self, jobs: &mut [Job], cancel: &CancelToken) -> CompileResults {
        let report = dispatch(self, jobs, cancel);
        let diagnostics = BatchDiagnostics::aggregate(
            jobs,
            self.config.show_warnings,
            self.config.debug_info_path.as_deref(),
        );
        CompileResults { report, diagnostics }
    }

    /// Include closure of one root file for `platform`.
    pub fn scan_includes(
        &self,
        root: &VirtualPath,
        platform: &str,
    ) -> Result<Arc<IncludeDependencies>, ResolveError> {
        let scanner = IncludeScanner::new(&self.mappings, &*self.resolver, &self.sources, platform);
        match self.shared_environment.as_deref() {
            Some(env) => scanner
                .with_include_contents(&env.include_contents)
                .get_includes(root),
            None => scanner.get_includes(root),
        }
    }
}

pub struct CompileResults {
    pub report: DispatchReport,
    pub diagnostics: BatchDiagnostics,
}
