#![cfg_attr(not(test), allow(dead_code, unused_imports))]

//! End-to-end tests driving the whole pipeline through an in-memory
//! resolver and a reference backend that inlines includes and emits the
//! content hash of its input as "compiled code".

use std::path::Path;
use std::sync::Arc;

use shaderpipe::{
    find_first_include, Backend, CancelToken, CompilationContext, CompileConfig, CompileEnvironment,
    CompileJob, ContentHash, Job, JobInput, JobKey, JobOutput, JobState, PathMappings, PipelineJob,
    PreprocessOutput, RawPreprocess, ShaderFrequency, ShaderTarget, SourceLookup, VirtualFileResolver,
    VirtualPath, CompilerDiagnostic,
};

const FORMAT: &str = "TEST_SF";
const PLATFORM: &str = "TestPlatform";
const PACKED_KEY: i32 = 0x5454;

/// Reference backend: preprocessing inlines `#include` directives
/// recursively; compilation emits the hash of the preprocessed text.
struct TestBackend {
    dual_output: bool,
}

impl TestBackend {
    fn expand(&self, sources: &SourceLookup, platform: &str, path: &str, out: &mut String, diags: &mut Vec<CompilerDiagnostic>) {
        let entry = match sources.load(path, platform) {
            Ok(entry) => entry,
            Err(err) => {
                diags.push(CompilerDiagnostic::error(format!("{path}(1): cannot open include: {err}")));
                return;
            }
        };
        let text = entry.stripped();
        for line in text.lines() {
            let Some((name, _)) = find_first_include(line) else {
                out.push_str(line);
                out.push('\n');
                continue;
            };
            let target = if name.starts_with('/') {
                name.to_string()
            } else {
                let parent = match path.rfind('/') {
                    Some(0) | None => "",
                    Some(idx) => &path[..idx],
                };
                format!("{parent}/{name}")
            };
            self.expand(sources, platform, &target, out, diags);
        }
    }
}

impl Backend for TestBackend {
    fn format_name(&self) -> &str {
        FORMAT
    }
    fn platform_name(&self) -> &str {
        PLATFORM
    }
    fn format_version(&self) -> u32 {
        1
    }
    fn packed_shader_key(&self) -> i32 {
        PACKED_KEY
    }

    fn preprocess(&self, input: &JobInput, sources: &SourceLookup, secondary: bool) -> RawPreprocess {
        let mut text = String::new();
        for (name, value) in &input.environment.definitions {
            text.push_str(&format!("#define {name} {value}\n"));
        }
        let mut diags = Vec::new();
        self.expand(
            sources,
            &input.target.platform,
            input.source_path.as_str(),
            &mut text,
            &mut diags,
        );
        if secondary {
            text.push_str("SECONDARY_VARIANT\n");
        }
        if !diags.is_empty() || text.contains("#error") {
            if text.contains("#error") {
                diags.push(CompilerDiagnostic::error(format!(
                    "{}(1,1): forced preprocessor error",
                    input.source_path
                )));
            }
            return RawPreprocess { succeeded: false, text: String::new(), diagnostics: diags };
        }
        RawPreprocess { succeeded: true, text, diagnostics: vec![] }
    }

    fn requires_secondary_compile(&self, _input: &JobInput, _primary: &PreprocessOutput) -> bool {
        self.dual_output
    }

    fn compile(
        &self,
        _input: &JobInput,
        primary: &str,
        secondary: Option<&str>,
        output: &mut JobOutput,
        secondary_output: Option<&mut JobOutput>,
        _working_dir: &Path,
    ) {
        if primary.contains("FORCE_COMPILE_FAIL") {
            output.succeeded = false;
            output
                .diagnostics
                .push(CompilerDiagnostic::error("compile failed: forced failure"));
            return;
        }
        output.succeeded = true;
        output.code = ContentHash::digest(primary.as_bytes()).as_bytes().to_vec();
        if let (Some(secondary), Some(secondary_output)) = (secondary, secondary_output) {
            secondary_output.succeeded = true;
            secondary_output.code = ContentHash::digest(secondary.as_bytes()).as_bytes().to_vec();
        }
    }
}

fn context(files: &[(&str, &str)], dual_output: bool) -> CompilationContext {
    let mut mappings = PathMappings::new();
    mappings.add_mapping("/Game", "/unused");
    mappings.add_mapping("/Engine", "/unused");
    let mut resolver = VirtualFileResolver::new();
    for (path, source) in files {
        resolver.add_file(*path, *source);
    }
    let config = CompileConfig {
        worker_threads: 4,
        compress_output: false,
        ..CompileConfig::default()
    };
    let mut ctx = CompilationContext::new(Arc::new(mappings), Box::new(resolver), config);
    ctx.backends.register(Arc::new(TestBackend { dual_output }));
    ctx
}

fn job(ctx: &CompilationContext, path: &str, entry_point: &str, permutation: i32) -> CompileJob {
    CompileJob::new(
        JobKey { shader_type: 1, vertex_factory: 0, permutation },
        JobInput {
            target: ShaderTarget {
                platform: PLATFORM.into(),
                frequency: ShaderFrequency::Pixel,
            },
            shader_format: FORMAT.into(),
            format_version: 1,
            source_path: VirtualPath::new(path, &ctx.mappings).unwrap(),
            entry_point: entry_point.into(),
            environment: CompileEnvironment::new(),
            is_pipeline_job: false,
            layout_signature: None,
            debug_info_path: None,
        },
    )
}

#[test]
fn single_job_compiles_end_to_end() {
    let ctx = context(
        &[
            ("/Game/Main.usf", "#include \"Common.ush\"\nfloat4 Main() { return 0; }\n"),
            ("/Game/Common.ush", "float4 CommonHelper() { return 1; }\n"),
        ],
        false,
    );
    let mut jobs = vec![Job::Single(job(&ctx, "/Game/Main.usf", "Main", 0))];
    let results = ctx.compile(&mut jobs, &CancelToken::new());

    assert_eq!(results.report.compiled, 1);
    assert_eq!(results.report.failed, 0);
    let unit = &jobs[0].units()[0];
    assert!(unit.output.succeeded);
    assert_eq!(unit.status.state(), JobState::CompleteLocalExecution);
    assert!(!unit.output.code.is_empty());
    // the output was stamped for later integrity validation
    unit.output.validate(&unit.input.target, unit.input_hash());
    assert_eq!(ctx.job_cache.len(), 1);
}

#[test]
fn identical_jobs_compile_once() {
    let files = [("/Game/Main.usf", "float4 Main() { return 0; }\n")];
    let ctx = context(&files, false);
    let mut jobs: Vec<Job> = (0..4)
        .map(|_| Job::Single(job(&ctx, "/Game/Main.usf", "Main", 0)))
        .collect();
    let results = ctx.compile(&mut jobs, &CancelToken::new());

    assert_eq!(results.report.compiled, 1);
    assert_eq!(results.report.cache_hits, 3);
    let first = jobs[0].units()[0].output.code.clone();
    for j in &jobs {
        assert_eq!(j.units()[0].output.code, first);
    }
    assert_eq!(ctx.job_cache.len(), 1);
}

#[test]
fn distinct_permutations_compile_separately() {
    let files = [("/Game/Main.usf", "float4 Main() { return 0; }\n")];
    let ctx = context(&files, false);
    let mut a = job(&ctx, "/Game/Main.usf", "Main", 0);
    let mut b = job(&ctx, "/Game/Main.usf", "Main", 1);
    a.input.environment.set_define("PERMUTATION", 0);
    b.input.environment.set_define("PERMUTATION", 1);
    let mut jobs = vec![Job::Single(a), Job::Single(b)];
    let results = ctx.compile(&mut jobs, &CancelToken::new());

    assert_eq!(results.report.compiled, 2);
    assert_ne!(jobs[0].input_hash(), jobs[1].input_hash());
    assert_ne!(jobs[0].units()[0].output.code, jobs[1].units()[0].output.code);
}

#[test]
fn cancelled_batch_compiles_nothing() {
    let files = [("/Game/Main.usf", "float4 Main() { return 0; }\n")];
    let ctx = context(&files, false);
    let mut jobs = vec![Job::Single(job(&ctx, "/Game/Main.usf", "Main", 0))];
    let cancel = CancelToken::new();
    cancel.cancel();
    let results = ctx.compile(&mut jobs, &cancel);

    assert_eq!(results.report.cancelled, 1);
    assert_eq!(jobs[0].units()[0].status.state(), JobState::Cancelled);
    assert!(ctx.job_cache.is_empty());
}

#[test]
fn preprocess_failure_fails_the_job_without_compiling() {
    let files = [("/Game/Broken.usf", "#error\nfloat4 Main() { return 0; }\n")];
    let ctx = context(&files, false);
    let mut jobs = vec![Job::Single(job(&ctx, "/Game/Broken.usf", "Main", 0))];
    let results = ctx.compile(&mut jobs, &CancelToken::new());

    assert_eq!(results.report.failed, 1);
    let unit = &jobs[0].units()[0];
    assert!(!unit.output.succeeded);
    assert!(unit.output.code.is_empty());
    assert!(!results.diagnostics.errors.is_empty());
}

#[test]
fn duplicate_errors_are_reported_once() {
    let files = [("/Game/Broken.usf", "#error\n")];
    let ctx = context(&files, false);
    let mut jobs = vec![
        Job::Single(job(&ctx, "/Game/Broken.usf", "Main", 0)),
        Job::Single(job(&ctx, "/Game/Broken.usf", "Main", 0)),
    ];
    let results = ctx.compile(&mut jobs, &CancelToken::new());

    assert_eq!(results.report.failed, 2);
    assert_eq!(results.diagnostics.errors.len(), 1);
    assert_eq!(results.diagnostics.affected_platforms, vec![PLATFORM.to_string()]);
}

#[test]
fn dual_output_blob_is_packed() {
    let files = [("/Game/Main.usf", "float4 Main() { return 0; }\n")];
    let ctx = context(&files, true);
    let mut jobs = vec![Job::Single(job(&ctx, "/Game/Main.usf", "Main", 0))];
    let results = ctx.compile(&mut jobs, &CancelToken::new());
    assert_eq!(results.report.compiled, 1);

    let code = &jobs[0].units()[0].output.code;
    assert_eq!(&code[0..4], &PACKED_KEY.to_le_bytes());
    let primary_len = u32::from_le_bytes(code[4..8].try_into().unwrap()) as usize;
    let secondary_len = u32::from_le_bytes(code[8..12].try_into().unwrap()) as usize;
    assert_eq!(primary_len, 32);
    assert_eq!(secondary_len, 32);
    assert_eq!(code.len(), 12 + primary_len + secondary_len);
    // primary and secondary passes saw different text
    assert_ne!(&code[12..12 + 32], &code[12 + 32..]);
}

#[test]
fn pipeline_failure_aborts_later_stages() {
    let files = [
        ("/Game/VS.usf", "void MainVS() {}\n"),
        ("/Game/PS.usf", "FORCE_COMPILE_FAIL\n"),
        ("/Game/GS.usf", "void MainGS() {}\n"),
    ];
    let ctx = context(&files, false);
    let stages = vec![
        job(&ctx, "/Game/VS.usf", "MainVS", 0),
        job(&ctx, "/Game/PS.usf", "MainPS", 0),
        job(&ctx, "/Game/GS.usf", "MainGS", 0),
    ];
    let mut jobs = vec![Job::Pipeline(PipelineJob::new("TestPipeline", stages))];
    let results = ctx.compile(&mut jobs, &CancelToken::new());
    assert_eq!(results.report.failed, 1);

    let stages = jobs[0].units();
    assert!(stages[0].output.succeeded);
    assert!(!stages[1].output.succeeded);
    // the aborted stage never compiled but is stamped for bookkeeping
    let aborted = &stages[2];
    assert!(!aborted.output.succeeded);
    assert!(aborted.output.code.is_empty());
    assert_eq!(aborted.output.validate_input_hash, aborted.input_hash());
    aborted.output.validate(&aborted.input.target, aborted.input_hash());
}

#[test]
fn pipeline_hash_combines_stage_hashes() {
    let files = [
        ("/Game/VS.usf", "void MainVS() {}\n"),
        ("/Game/PS.usf", "void MainPS() {}\n"),
    ];
    let ctx = context(&files, false);
    let stages = vec![
        job(&ctx, "/Game/VS.usf", "MainVS", 0),
        job(&ctx, "/Game/PS.usf", "MainPS", 0),
    ];
    let mut jobs = vec![Job::Pipeline(PipelineJob::new("TestPipeline", stages))];
    let results = ctx.compile(&mut jobs, &CancelToken::new());
    assert_eq!(results.report.failed, 0);

    let stages = jobs[0].units();
    let expected = stages[0]
        .input_hash()
        .wide_add(&stages[1].input_hash());
    assert_eq!(jobs[0].input_hash(), expected);
    // every stage was marked as a pipeline member before hashing
    assert!(stages.iter().all(|s| s.input.is_pipeline_job));
}

#[test]
fn reports_come_back_in_submission_order() {
    let files = [("/Game/Main.usf", "float4 Main() { return 0; }\n")];
    let ctx = context(&files, false);
    let mut jobs: Vec<Job> = (0..16)
        .map(|i| {
            let mut unit = job(&ctx, "/Game/Main.usf", "Main", i);
            unit.input.environment.set_define("PERMUTATION", i);
            Job::Single(unit)
        })
        .collect();
    let results = ctx.compile(&mut jobs, &CancelToken::new());

    let indices: Vec<usize> = results.report.reports.iter().map(|r| r.index).collect();
    assert_eq!(indices, (0..16).collect::<Vec<_>>());
    assert_eq!(results.report.compiled, 16);
}

#[test]
fn job_dump_survives_a_round_trip() {
    let files = [("/Game/Main.usf", "float4 Main() { return 0; }\n")];
    let ctx = context(&files, false);
    let mut jobs = vec![Job::Single(job(&ctx, "/Game/Main.usf", "Main", 0))];
    ctx.compile(&mut jobs, &CancelToken::new());

    let unit = &jobs[0].units()[0];
    let mut dump = Vec::new();
    shaderpipe::write_job_dump(unit, "none", &mut dump).unwrap();
    let (input, output) = shaderpipe::read_job_dump(dump.as_slice()).unwrap();
    assert_eq!(input.input_hash, unit.input_hash());
    assert_eq!(output.code, unit.output.code);
}

#[test]
fn include_closure_via_context() {
    let ctx = context(
        &[
            ("/Game/Root.usf", "#include \"A.ush\"\n#include \"/Engine/B.ush\"\n"),
            ("/Game/A.ush", "#include \"/Engine/B.ush\"\n"),
            ("/Engine/B.ush", "float b;\n"),
        ],
        false,
    );
    let root = VirtualPath::new("/Game/Root.usf", &ctx.mappings).unwrap();
    let deps = ctx.scan_includes(&root, PLATFORM).unwrap();
    let paths: Vec<&str> = deps.paths().collect();
    assert_eq!(paths, vec!["/Game/A.ush", "/Engine/B.ush"]);
}
