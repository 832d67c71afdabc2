//! The backend compiler seam.
//!
//! A backend turns preprocessed source into machine code for one shader
//! format. Everything behind this trait is opaque to the pipeline; the
//! pipeline only cares about format identity, versioning and the dual-output
//! capability queries.

use std::io;
use std::path::Path;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::diagnostics::CompilerDiagnostic;
use crate::job::{JobInput, JobOutput, PreprocessOutput};
use crate::path::{PathMappings, VirtualPath};
use crate::resolve::{ResolveError, Resolver, SourceFileCache};

/// Source access handed to a backend's preprocessor.
pub struct SourceLookup<'a> {
    pub mappings: &'a PathMappings,
    pub resolver: &'a dyn Resolver,
    pub cache: &'a SourceFileCache,
}

impl SourceLookup<'_> {
    /// Fixes up and loads one virtual path for `platform`.
    pub fn load(&self, path: &str, platform: &str) -> Result<Arc<crate::resolve::SourceEntry>, ResolveError> {
        let mut fixed = path.to_string();
        self.mappings.fixup(&mut fixed, platform);
        let path = VirtualPath::new(fixed, self.mappings)?;
        self.cache.load(self.resolver, &path)
    }
}

/// Raw result of a backend preprocessor pass, before stripping.
#[derive(Debug, Default)]
pub struct RawPreprocess {
    pub succeeded: bool,
    /// The flattened text: all macros expanded, all includes inlined.
    pub text: String,
    pub diagnostics: Vec<CompilerDiagnostic>,
}

pub trait Backend: Send + Sync {
    /// Shader format name this backend compiles, e.g. `SF_METAL`.
    fn format_name(&self) -> &str;

    /// Bumped whenever the backend's output changes for identical input.
    fn format_version(&self) -> u32;

    /// Target platform name, as it appears in `ShaderTarget::platform`.
    fn platform_name(&self) -> &str {
        self.format_name()
    }

    /// Platform include directory used for `/Platform/...` substitution,
    /// with leading and trailing slash.
    fn platform_include_directory(&self) -> Option<&str> {
        None
    }

    /// Key written into the header of a packed dual-output blob.
    fn packed_shader_key(&self) -> i32;

    /// Expands macros and includes into one flattened text. `secondary`
    /// requests the second pass for dual-output artifacts.
    fn preprocess(&self, input: &JobInput, sources: &SourceLookup, secondary: bool)
        -> RawPreprocess;

    /// Whether this input needs a secondary preprocess and compile pass.
    fn requires_secondary_compile(&self, _input: &JobInput, _primary: &PreprocessOutput) -> bool {
        false
    }

    /// Compiles preprocessed source. Diagnostics and the success flag are
    /// recorded on `output`; when `secondary` text is given the secondary
    /// artifact goes to `secondary_output`.
    fn compile(
        &self,
        input: &JobInput,
        primary: &str,
        secondary: Option<&str>,
        output: &mut JobOutput,
        secondary_output: Option<&mut JobOutput>,
        working_dir: &Path,
    );

    /// Dumps backend-specific debug artifacts for a finished job.
    fn output_debug_data(
        &self,
        _input: &JobInput,
        _output: &JobOutput,
        _dir: &Path,
    ) -> io::Result<()> {
        Ok(())
    }
}

/// Registered backends, selected by shader format name.
#[derive(Default)]
pub struct BackendRegistry {
    backends: FxHashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends
            .insert(backend.format_name().to_string(), backend);
    }

    pub fn get(&self, format: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(format).cloned()
    }

    /// Registers each backend's platform include directory, enabling
    /// `/Platform/...` substitution for its platform.
    pub fn declare_platforms(&self, mappings: &mut PathMappings) {
        for backend in self.backends.values() {
            mappings.add_platform(
                backend.platform_name(),
                crate::path::PlatformDesc {
                    include_directory: backend
                        .platform_include_directory()
                        .map(str::to_string),
                },
            );
        }
    }
}
