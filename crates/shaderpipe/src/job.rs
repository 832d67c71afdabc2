//! Compile jobs, pipelines, status tracking and the worker wire format.

use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::diagnostics::CompilerDiagnostic;
use crate::env::CompileEnvironment;
use crate::hash::{ContentHash, CACHE_FORMAT_VERSION};
use crate::path::VirtualPath;
use crate::strip::LineOrigin;

/// Terminates the process on a result-integrity violation. A mismatched
/// output attached to a job means the wrong result reached the wrong job, a
/// pipeline defect that must never be silently absorbed.
pub(crate) fn integrity_failure(msg: &str) -> ! {
    log::error!("{msg}");
    panic!("{msg}");
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderFrequency {
    Vertex,
    Pixel,
    Geometry,
    Compute,
}

/// The platform and pipeline stage a job compiles for.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShaderTarget {
    pub platform: String,
    pub frequency: ShaderFrequency,
}

/// Logical identity of a compile request: which shader, for which vertex
/// factory, in which permutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub shader_type: u32,
    pub vertex_factory: u32,
    pub permutation: i32,
}

/// Everything a compile needs as input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobInput {
    pub target: ShaderTarget,
    /// Backend format name; selects the backend in the registry.
    pub shader_format: String,
    /// The selected backend's format version, folded into the input hash so
    /// backend upgrades invalidate cached results.
    pub format_version: u32,
    pub source_path: VirtualPath,
    pub entry_point: String,
    pub environment: CompileEnvironment,
    pub is_pipeline_job: bool,
    /// Layout signature of the referenced parameter struct, when any.
    pub layout_signature: Option<ContentHash>,
    pub debug_info_path: Option<String>,
}

/// Preprocessed source, either still plain or zlib-compressed in memory.
/// Jobs can sit queued for a long time; compression keeps large flattened
/// sources cheap to hold.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SourceBlob {
    Plain(String),
    Compressed { raw_len: usize, data: Vec<u8> },
}

impl SourceBlob {
    pub fn text(&self) -> io::Result<Cow<'_, str>> {
        match self {
            SourceBlob::Plain(text) => Ok(Cow::Borrowed(text)),
            SourceBlob::Compressed { raw_len, data } => {
                let mut text = String::with_capacity(*raw_len);
                ZlibDecoder::new(data.as_slice()).read_to_string(&mut text)?;
                Ok(Cow::Owned(text))
            }
        }
    }

    pub fn compress(&mut self) -> io::Result<()> {
        if let SourceBlob::Plain(text) = self {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
            encoder.write_all(text.as_bytes())?;
            *self = SourceBlob::Compressed {
                raw_len: text.len(),
                data: encoder.finish()?,
            };
        }
        Ok(())
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, SourceBlob::Compressed { .. })
    }
}

/// Result of one preprocessor pass over a job's source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreprocessOutput {
    pub succeeded: bool,
    pub source: SourceBlob,
    /// `UESHADERMETADATA_` directives captured while stripping; folded into
    /// the input hash since they can alter compile behavior.
    pub directives: Vec<String>,
    pub line_origins: Vec<LineOrigin>,
    pub diagnostics: Vec<CompilerDiagnostic>,
    pub elapsed: Duration,
}

/// The compiled result attached back to a job.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobOutput {
    pub succeeded: bool,
    /// Stamped from the input before compilation so mismatched results can
    /// be detected after any deserialization boundary.
    pub target: Option<ShaderTarget>,
    pub validate_input_hash: ContentHash,
    pub code: Vec<u8>,
    pub code_compressed: bool,
    pub output_hash: ContentHash,
    pub diagnostics: Vec<CompilerDiagnostic>,
    /// Accumulated debug-symbol buffer, kept separate from the code blob.
    pub debug_data: Vec<u8>,
}

impl JobOutput {
    pub fn stamp(&mut self, target: &ShaderTarget, input_hash: ContentHash) {
        self.target = Some(target.clone());
        self.validate_input_hash = input_hash;
    }

    /// Fatal when the output does not belong to the given input. Called
    /// after every worker or cache deserialization.
    pub fn validate(&self, target: &ShaderTarget, input_hash: ContentHash) {
        if self.target.as_ref() != Some(target) {
            integrity_failure(&format!(
                "shader output target {:?} does not match job target {target:?}",
                self.target
            ));
        }
        if self.validate_input_hash != input_hash {
            integrity_failure(&format!(
                "shader output hash {} does not match job input hash {input_hash}",
                self.validate_input_hash
            ));
        }
    }

    /// Computes the output content hash and optionally compresses the code.
    pub fn finalize(&mut self, compress: bool) -> io::Result<()> {
        if !self.succeeded {
            return Ok(());
        }
        self.output_hash = ContentHash::digest(&self.code);
        if compress && !self.code_compressed {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&self.code)?;
            self.code = encoder.finish()?;
            self.code_compressed = true;
        }
        Ok(())
    }

    pub fn errors(&self) -> impl Iterator<Item = &CompilerDiagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == crate::diagnostics::Severity::Error)
    }
}

/// Lifecycle states, ordered so later states compare greater. Transitions
/// only ever move forward.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobState {
    Unset = 0,
    Ready = 1,
    Skipped = 2,
    Cancelled = 3,
    PendingCacheQuery = 4,
    Queued = 5,
    PendingDistributedExecution = 6,
    PendingLocalExecution = 7,
    CompleteDistributedExecution = 8,
    CompleteFoundInCache = 9,
    CompleteFoundInCacheQuery = 10,
    CompleteLocalExecution = 11,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unset,
            1 => Self::Ready,
            2 => Self::Skipped,
            3 => Self::Cancelled,
            4 => Self::PendingCacheQuery,
            5 => Self::Queued,
            6 => Self::PendingDistributedExecution,
            7 => Self::PendingLocalExecution,
            8 => Self::CompleteDistributedExecution,
            9 => Self::CompleteFoundInCache,
            10 => Self::CompleteFoundInCacheQuery,
            _ => Self::CompleteLocalExecution,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Skipped | Self::Cancelled) || self >= Self::CompleteDistributedExecution
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "Unset",
            Self::Ready => "Ready",
            Self::Skipped => "Skipped",
            Self::Cancelled => "Cancelled",
            Self::PendingCacheQuery => "PendingCacheQuery",
            Self::Queued => "Queued",
            Self::PendingDistributedExecution => "PendingDistributedExecution",
            Self::PendingLocalExecution => "PendingLocalExecution",
            Self::CompleteDistributedExecution => "CompleteDistributedExecution",
            Self::CompleteFoundInCache => "CompleteFoundInCache",
            Self::CompleteFoundInCacheQuery => "CompleteFoundInCacheQuery",
            Self::CompleteLocalExecution => "CompleteLocalExecution",
        }
    }
}

/// Shared, lock-free status of one job. Observers hold an `Arc` and poll;
/// no observer can force a backward transition.
#[derive(Debug, Default)]
pub struct JobStatus {
    state: AtomicU8,
    duplicate: AtomicBool,
}

impl JobStatus {
    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advances to `next` unless the job already moved past it; returns the
    /// state after the attempt. A losing backward attempt is a no-op.
    pub fn advance(&self, next: JobState) -> JobState {
        let prev = self.state.fetch_max(next as u8, Ordering::AcqRel);
        JobState::from_u8(prev.max(next as u8))
    }

    pub fn mark_duplicate(&self) {
        self.duplicate.store(true, Ordering::Release);
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate.load(Ordering::Acquire)
    }
}

/// A single compile unit.
#[derive(Debug)]
pub struct CompileJob {
    pub key: JobKey,
    pub input: JobInput,
    pub preprocess: Option<PreprocessOutput>,
    /// Second pass for backends that need a dual-stage artifact.
    pub secondary_preprocess: Option<PreprocessOutput>,
    pub output: JobOutput,
    pub status: Arc<JobStatus>,
    pub shared_environment_merged: bool,
    input_hash: OnceLock<ContentHash>,
}

impl CompileJob {
    pub fn new(key: JobKey, input: JobInput) -> Self {
        Self {
            key,
            input,
            preprocess: None,
            secondary_preprocess: None,
            output: JobOutput::default(),
            status: Arc::new(JobStatus::default()),
            shared_environment_merged: false,
            input_hash: OnceLock::new(),
        }
    }

    /// The deterministic content hash over every input that can affect the
    /// compiled output. Computed once after preprocessing and memoized; the
    /// value is the cache key and the cross-process dedup key.
    pub fn input_hash(&self) -> ContentHash {
        if let Some(hash) = self.input_hash.get() {
            return *hash;
        }
        let hash = self.compute_input_hash();
        *self.input_hash.get_or_init(|| hash)
    }

    pub fn input_hash_set(&self) -> bool {
        self.input_hash.get().is_some()
    }

    /// Hash field order is load-bearing: changing it silently invalidates
    /// every existing cache entry, which is exactly what bumping
    /// `CACHE_FORMAT_VERSION` is for.
    fn compute_input_hash(&self) -> ContentHash {
        let Some(preprocess) = self.preprocess.as_ref() else {
            integrity_failure(&format!(
                "input hash of {} requested before preprocessing",
                self.input.source_path
            ));
        };

        let mut hasher = blake3::Hasher::new();
        hasher.update(CACHE_FORMAT_VERSION.as_bytes());
        hasher.update(&self.input.format_version.to_le_bytes());
        hasher.update(self.input.target.platform.as_bytes());
        hasher.update(&[self.input.target.frequency as u8]);
        hasher.update(self.input.entry_point.as_bytes());
        hasher.update(&[self.input.is_pipeline_job as u8]);
        self.input.environment.hash_dependencies(&mut hasher);
        for directive in &preprocess.directives {
            hasher.update(directive.as_bytes());
        }
        for pass in [Some(preprocess), self.secondary_preprocess.as_ref()]
            .into_iter()
            .flatten()
        {
            match pass.source.text() {
                Ok(text) => hasher.update(text.as_bytes()),
                Err(err) => integrity_failure(&format!(
                    "preprocessed source of {} is unreadable: {err}",
                    self.input.source_path
                )),
            };
        }
        if let Some(signature) = &self.input.layout_signature {
            hasher.update(signature.as_bytes());
        }
        hasher.finalize().into()
    }
}

/// An ordered sequence of stages compiled together, e.g. vertex then pixel.
#[derive(Debug)]
pub struct PipelineJob {
    pub name: String,
    pub stages: Vec<CompileJob>,
    input_hash: OnceLock<ContentHash>,
}

impl PipelineJob {
    pub fn new(name: impl Into<String>, mut stages: Vec<CompileJob>) -> Self {
        for stage in &mut stages {
            stage.input.is_pipeline_job = true;
        }
        Self {
            name: name.into(),
            stages,
            input_hash: OnceLock::new(),
        }
    }

    /// Wide-integer sum of the stage hashes. Addition is order-independent,
    /// so the pipeline identity does not depend on stage-list ordering.
    pub fn input_hash(&self) -> ContentHash {
        if let Some(hash) = self.input_hash.get() {
            return *hash;
        }
        let hash = self
            .stages
            .iter()
            .map(CompileJob::input_hash)
            .fold(ContentHash::ZERO, |acc, h| acc.wide_add(&h));
        *self.input_hash.get_or_init(|| hash)
    }
}

/// A dispatchable unit of work.
#[derive(Debug)]
pub enum Job {
    Single(CompileJob),
    Pipeline(PipelineJob),
}

impl Job {
    pub fn units(&self) -> &[CompileJob] {
        match self {
            Job::Single(job) => std::slice::from_ref(job),
            Job::Pipeline(pipeline) => &pipeline.stages,
        }
    }

    pub fn units_mut(&mut self) -> &mut [CompileJob] {
        match self {
            Job::Single(job) => std::slice::from_mut(job),
            Job::Pipeline(pipeline) => &mut pipeline.stages,
        }
    }

    pub fn input_hash(&self) -> ContentHash {
        match self {
            Job::Single(job) => job.input_hash(),
            Job::Pipeline(pipeline) => pipeline.input_hash(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.units().iter().all(|unit| unit.output.succeeded)
    }
}

/// What a worker process needs to run one compile. Field order is the wire
/// order. The shared environment is deliberately absent: it is transmitted
/// once per batch and merged into each job's environment before this point.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerInput {
    pub target: ShaderTarget,
    pub shader_format: String,
    pub compression_format: String,
    pub source_path: VirtualPath,
    pub entry_point: String,
    pub debug_info_path: Option<String>,
    pub is_pipeline_job: bool,
    pub input_hash: ContentHash,
    pub environment: CompileEnvironment,
}

impl WorkerInput {
    pub fn from_job(job: &CompileJob, compression_format: &str) -> Self {
        Self {
            target: job.input.target.clone(),
            shader_format: job.input.shader_format.clone(),
            compression_format: compression_format.to_string(),
            source_path: job.input.source_path.clone(),
            entry_point: job.input.entry_point.clone(),
            debug_info_path: job.input.debug_info_path.clone(),
            is_pipeline_job: job.input.is_pipeline_job,
            input_hash: job.input_hash(),
            environment: job.input.environment.clone(),
        }
    }
}

/// What a worker returns, reattached to the originating job by index.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub index: u32,
    pub output: JobOutput,
}

pub fn serialize_worker_input(
    job: &CompileJob,
    compression_format: &str,
) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(&WorkerInput::from_job(job, compression_format))
}

pub fn serialize_worker_output(index: u32, output: &JobOutput) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(&WorkerOutput {
        index,
        output: output.clone(),
    })
}

/// Reattaches a deserialized worker result. Validation failure is fatal:
/// it means the worker communication is corrupted or misindexed.
pub fn attach_worker_output(job: &mut CompileJob, bytes: &[u8]) -> Result<(), bincode::Error> {
    let wire: WorkerOutput = bincode::deserialize(bytes)?;
    wire.output.validate(&job.input.target, job.input_hash());
    job.output = wire.output;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathMappings;

    fn test_input(entry_point: &str) -> JobInput {
        let mut mappings = PathMappings::new();
        mappings.add_mapping("/Game", "/unused");
        JobInput {
            target: ShaderTarget {
                platform: "TestPlatform".into(),
                frequency: ShaderFrequency::Pixel,
            },
            shader_format: "TEST_FORMAT".into(),
            format_version: 1,
            source_path: VirtualPath::new("/Game/Test.usf", &mappings).unwrap(),
            entry_point: entry_point.into(),
            environment: CompileEnvironment::new(),
            is_pipeline_job: false,
            layout_signature: None,
            debug_info_path: None,
        }
    }

    fn preprocessed_job(entry_point: &str, source: &str) -> CompileJob {
        let key = JobKey {
            shader_type: 1,
            vertex_factory: 0,
            permutation: 0,
        };
        let mut job = CompileJob::new(key, test_input(entry_point));
        job.preprocess = Some(PreprocessOutput {
            succeeded: true,
            source: SourceBlob::Plain(source.to_string()),
            directives: vec![],
            line_origins: vec![],
            diagnostics: vec![],
            elapsed: Duration::ZERO,
        });
        job
    }

    #[test]
    fn status_only_moves_forward() {
        let status = JobStatus::default();
        assert_eq!(status.state(), JobState::Unset);
        assert_eq!(status.advance(JobState::Queued), JobState::Queued);
        // a stale observer cannot move the job backward
        assert_eq!(status.advance(JobState::Ready), JobState::Queued);
        assert_eq!(
            status.advance(JobState::CompleteLocalExecution),
            JobState::CompleteLocalExecution
        );
        assert!(status.state().is_terminal());
    }

    #[test]
    fn input_hash_is_stable_and_sensitive() {
        let a = preprocessed_job("Main", "float4 Main() { return 0; }");
        let b = preprocessed_job("Main", "float4 Main() { return 0; }");
        assert_eq!(a.input_hash(), b.input_hash());

        let other_entry = preprocessed_job("OtherMain", "float4 Main() { return 0; }");
        let other_source = preprocessed_job("Main", "float4 Main() { return 1; }");
        assert_ne!(a.input_hash(), other_entry.input_hash());
        assert_ne!(a.input_hash(), other_source.input_hash());

        // memoized
        assert!(a.input_hash_set());
        assert_eq!(a.input_hash(), b.input_hash());
    }

    #[test]
    fn pipeline_hash_ignores_stage_order() {
        let vs = || preprocessed_job("MainVS", "void MainVS() {}");
        let ps = || preprocessed_job("MainPS", "void MainPS() {}");
        let forward = PipelineJob::new("P", vec![vs(), ps()]);
        let reversed = PipelineJob::new("P", vec![ps(), vs()]);
        assert_eq!(forward.input_hash(), reversed.input_hash());
    }

    #[test]
    fn source_blob_round_trip() {
        let text = "float4 Main() { return 0; }\n".repeat(100);
        let mut blob = SourceBlob::Plain(text.clone());
        blob.compress().unwrap();
        assert!(blob.is_compressed());
        assert_eq!(blob.text().unwrap(), text);
    }

    #[test]
    fn worker_round_trip_reattaches_output() {
        let mut job = preprocessed_job("Main", "float4 Main() { return 0; }");
        let mut output = JobOutput {
            succeeded: true,
            code: vec![1, 2, 3],
            ..JobOutput::default()
        };
        output.stamp(&job.input.target, job.input_hash());
        let bytes = serialize_worker_output(0, &output).unwrap();
        attach_worker_output(&mut job, &bytes).unwrap();
        assert_eq!(job.output.code, vec![1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "does not match job input hash")]
    fn mismatched_output_hash_is_fatal() {
        let mut job = preprocessed_job("Main", "float4 Main() { return 0; }");
        let other = preprocessed_job("Other", "float4 Other() { return 0; }");
        let mut output = JobOutput::default();
        output.stamp(&job.input.target, other.input_hash());
        let bytes = serialize_worker_output(0, &output).unwrap();
        let _ = attach_worker_output(&mut job, &bytes);
    }

    #[test]
    #[should_panic(expected = "does not match job target")]
    fn mismatched_output_target_is_fatal() {
        let mut job = preprocessed_job("Main", "float4 Main() { return 0; }");
        let hash = job.input_hash();
        let mut output = JobOutput::default();
        output.stamp(
            &ShaderTarget {
                platform: "OtherPlatform".into(),
                frequency: ShaderFrequency::Vertex,
            },
            hash,
        );
        let bytes = serialize_worker_output(0, &output).unwrap();
        let _ = attach_worker_output(&mut job, &bytes);
    }

    #[test]
    fn finalize_hashes_and_compresses() {
        let mut output = JobOutput {
            succeeded: true,
            code: vec![0u8; 256],
            ..JobOutput::default()
        };
        output.finalize(true).unwrap();
        assert!(output.code_compressed);
        assert_eq!(output.output_hash, ContentHash::digest(&[0u8; 256]));
    }
}
