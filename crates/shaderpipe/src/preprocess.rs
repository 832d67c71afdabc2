//! The preprocessing stage: environment merge, backend macro expansion,
//! stripping, input hashing and in-memory compression.

use std::io;
use std::time::Instant;

use crate::backend::{Backend, RawPreprocess, SourceLookup};
use crate::env::{CompileEnvironment, CompilerFlag};
use crate::job::{CompileJob, PreprocessOutput, SourceBlob};
use crate::strip::{patch_debug_hash, strip_preprocessed};

/// Runs the full preprocessing flow for one job. Idempotent: a job that
/// already carries preprocess output is left untouched.
///
/// On preprocessor failure the diagnostics are appended to the job output,
/// the job is marked failed, and no compile will be attempted. On success
/// the stripped source carries a debug-hash marker that is patched with the
/// freshly computed input hash before the text is compressed.
pub fn preprocess_job(
    job: &mut CompileJob,
    shared_env: Option<&CompileEnvironment>,
    backend: &dyn Backend,
    sources: &SourceLookup,
) -> io::Result<()> {
    if job.preprocess.is_some() {
        return Ok(());
    }

    if !job.shared_environment_merged {
        if let Some(shared) = shared_env {
            job.input.environment.merge(shared);
        }
        job.shared_environment_merged = true;
    }

    let started = Instant::now();
    let raw = backend.preprocess(&job.input, sources, false);
    if !raw.succeeded {
        fail_preprocess(job, raw, started);
        return Ok(());
    }
    job.preprocess = Some(build_output(job, raw, started));

    let needs_secondary = job
        .preprocess
        .as_ref()
        .is_some_and(|primary| backend.requires_secondary_compile(&job.input, primary));
    if needs_secondary {
        let started = Instant::now();
        let raw = backend.preprocess(&job.input, sources, true);
        if !raw.succeeded {
            fail_preprocess(job, raw, started);
            return Ok(());
        }
        job.secondary_preprocess = Some(build_output(job, raw, started));
    }

    // the hash covers the marker placeholder; the marker is then rewritten
    // in place so the stored text self-identifies its cache entry
    let hash = job.input_hash().to_hex();
    for pass in [job.preprocess.as_mut(), job.secondary_preprocess.as_mut()]
        .into_iter()
        .flatten()
    {
        if let SourceBlob::Plain(text) = &mut pass.source {
            patch_debug_hash(text, &hash);
        }
        pass.source.compress()?;
    }
    Ok(())
}

fn build_output(job: &CompileJob, raw: RawPreprocess, started: Instant) -> PreprocessOutput {
    let strip = !job
        .input
        .environment
        .has_flag(CompilerFlag::DisableSourceStripping);
    let (text, directives, line_origins) = if strip {
        let stripped = strip_preprocessed(&raw.text, job.input.source_path.as_str());
        (stripped.text, stripped.directives, stripped.line_origins)
    } else {
        (raw.text, vec![], vec![])
    };
    PreprocessOutput {
        succeeded: true,
        source: SourceBlob::Plain(text),
        directives,
        line_origins,
        diagnostics: raw.diagnostics,
        elapsed: started.elapsed(),
    }
}

fn fail_preprocess(job: &mut CompileJob, raw: RawPreprocess, started: Instant) {
    log::debug!(
        "preprocessing {} failed with {} diagnostics",
        job.input.source_path,
        raw.diagnostics.len()
    );
    job.output.succeeded = false;
    job.output.diagnostics.extend(raw.diagnostics.iter().cloned());
    job.preprocess = Some(PreprocessOutput {
        succeeded: false,
        source: SourceBlob::Plain(String::new()),
        directives: vec![],
        line_origins: vec![],
        diagnostics: raw.diagnostics,
        elapsed: started.elapsed(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SourceLookup;
    use crate::diagnostics::CompilerDiagnostic;
    use crate::hash::ContentHash;
    use crate::job::{CompileJob, JobInput, JobKey, ShaderFrequency, ShaderTarget};
    use crate::path::{PathMappings, VirtualPath};
    use crate::resolve::{SourceFileCache, VirtualFileResolver};
    use crate::strip::DEBUG_HASH_MARKER;

    struct EchoBackend {
        fail: bool,
    }

    impl Backend for EchoBackend {
        fn format_name(&self) -> &str {
            "TEST_FORMAT"
        }
        fn format_version(&self) -> u32 {
            1
        }
        fn packed_shader_key(&self) -> i32 {
            7
        }
        fn preprocess(
            &self,
            input: &JobInput,
            sources: &SourceLookup,
            _secondary: bool,
        ) -> RawPreprocess {
            if self.fail {
                return RawPreprocess {
                    succeeded: false,
                    text: String::new(),
                    diagnostics: vec![CompilerDiagnostic::error("bad macro")],
                };
            }
            let entry = sources
                .load(input.source_path.as_str(), &input.target.platform)
                .unwrap();
            RawPreprocess {
                succeeded: true,
                text: entry.source.clone(),
                diagnostics: vec![],
            }
        }
        fn compile(
            &self,
            _input: &JobInput,
            _primary: &str,
            _secondary: Option<&str>,
            _output: &mut crate::job::JobOutput,
            _secondary_output: Option<&mut crate::job::JobOutput>,
            _working_dir: &std::path::Path,
        ) {
        }
    }

    fn job(mappings: &PathMappings) -> CompileJob {
        CompileJob::new(
            JobKey { shader_type: 1, vertex_factory: 0, permutation: 0 },
            JobInput {
                target: ShaderTarget {
                    platform: "TestPlatform".into(),
                    frequency: ShaderFrequency::Pixel,
                },
                shader_format: "TEST_FORMAT".into(),
                format_version: 1,
                source_path: VirtualPath::new("/Game/A.usf", mappings).unwrap(),
                entry_point: "Main".into(),
                environment: CompileEnvironment::new(),
                is_pipeline_job: false,
                layout_signature: None,
                debug_info_path: None,
            },
        )
    }

    fn fixture() -> (PathMappings, VirtualFileResolver, SourceFileCache) {
        let mut mappings = PathMappings::new();
        mappings.add_mapping("/Game", "/unused");
        let mut resolver = VirtualFileResolver::new();
        resolver.add_file("/Game/A.usf", "// header\nfloat4 Main() { return 0; }\n");
        (mappings, resolver, SourceFileCache::new())
    }

    #[test]
    fn success_strips_patches_and_compresses() {
        let (mappings, resolver, cache) = fixture();
        let sources = SourceLookup { mappings: &mappings, resolver: &resolver, cache: &cache };
        let mut job = job(&mappings);
        preprocess_job(&mut job, None, &EchoBackend { fail: false }, &sources).unwrap();

        let pass = job.preprocess.as_ref().unwrap();
        assert!(pass.succeeded);
        assert!(pass.source.is_compressed());
        let text = pass.source.text().unwrap().into_owned();
        assert!(!text.contains("// header"));
        assert!(text.contains(DEBUG_HASH_MARKER));
        assert!(text.contains(&job.input_hash().to_hex()));
    }

    #[test]
    fn failure_marks_job_and_keeps_diagnostics() {
        let (mappings, resolver, cache) = fixture();
        let sources = SourceLookup { mappings: &mappings, resolver: &resolver, cache: &cache };
        let mut job = job(&mappings);
        preprocess_job(&mut job, None, &EchoBackend { fail: true }, &sources).unwrap();

        assert!(!job.output.succeeded);
        assert!(!job.preprocess.as_ref().unwrap().succeeded);
        assert_eq!(job.output.diagnostics.len(), 1);
    }

    #[test]
    fn preprocessing_twice_is_byte_identical() {
        let (mappings, resolver, cache) = fixture();
        let sources = SourceLookup { mappings: &mappings, resolver: &resolver, cache: &cache };
        let mut a = job(&mappings);
        let mut b = job(&mappings);
        preprocess_job(&mut a, None, &EchoBackend { fail: false }, &sources).unwrap();
        preprocess_job(&mut b, None, &EchoBackend { fail: false }, &sources).unwrap();
        assert_eq!(
            a.preprocess.as_ref().unwrap().source.text().unwrap(),
            b.preprocess.as_ref().unwrap().source.text().unwrap()
        );
        assert_eq!(a.input_hash(), b.input_hash());
    }

    #[test]
    fn shared_environment_merges_once() {
        let (mappings, resolver, cache) = fixture();
        let sources = SourceLookup { mappings: &mappings, resolver: &resolver, cache: &cache };
        let mut shared = CompileEnvironment::new();
        shared.set_define("SHARED", 1);
        let mut job = job(&mappings);
        job.input.environment.set_define("LOCAL", 1);
        preprocess_job(&mut job, Some(&shared), &EchoBackend { fail: false }, &sources).unwrap();

        assert!(job.shared_environment_merged);
        assert_eq!(job.input.environment.definitions["SHARED"], "1");
        assert_eq!(job.input.environment.definitions["LOCAL"], "1");
    }

    #[test]
    fn input_hash_is_unaffected_by_marker_patch() {
        // two identical jobs hash equal even though each patched its own
        // marker after hashing
        let (mappings, resolver, cache) = fixture();
        let sources = SourceLookup { mappings: &mappings, resolver: &resolver, cache: &cache };
        let mut a = job(&mappings);
        preprocess_job(&mut a, None, &EchoBackend { fail: false }, &sources).unwrap();
        let hash = a.input_hash();
        assert!(a.input_hash_set());
        assert_eq!(a.input_hash(), hash);
    }
}
