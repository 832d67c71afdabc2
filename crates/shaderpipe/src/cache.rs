//! In-memory job result cache keyed by input hash, plus the binary job dump
//! used for post-mortem analysis.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::hash::ContentHash;
use crate::job::{CompileJob, JobOutput, WorkerInput};

/// Shared cache of finished job outputs. Two jobs with equal input hash are
/// guaranteed to produce identical output, so a hit replaces a compile.
#[derive(Default)]
pub struct JobCache {
    entries: RwLock<FxHashMap<ContentHash, Arc<JobOutput>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl JobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, hash: &ContentHash) -> Option<Arc<JobOutput>> {
        let found = self.entries.read().get(hash).cloned();
        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// First insert wins; a concurrent duplicate compile of the same hash
    /// produced identical output by definition.
    pub fn insert(&self, hash: ContentHash, output: Arc<JobOutput>) {
        self.entries.write().entry(hash).or_insert(output);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// (hits, misses) counters since construction.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

/// Writes a finished job as worker input followed by worker output, the
/// layout read back by [`read_job_dump`].
pub fn write_job_dump(
    job: &CompileJob,
    compression_format: &str,
    mut writer: impl Write,
) -> Result<(), bincode::Error> {
    bincode::serialize_into(&mut writer, &WorkerInput::from_job(job, compression_format))?;
    bincode::serialize_into(&mut writer, &job.output)
}

/// Reads a job dump back, re-validating output integrity against the input.
/// The dump may have been written by a different process or build; a
/// mismatch is fatal, the same as for live worker results.
pub fn read_job_dump(mut reader: impl Read) -> Result<(WorkerInput, JobOutput), bincode::Error> {
    let input: WorkerInput = bincode::deserialize_from(&mut reader)?;
    let output: JobOutput = bincode::deserialize_from(&mut reader)?;
    output.validate(&input.target, input.input_hash);
    Ok((input, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::CompileEnvironment;
    use crate::job::{JobInput, JobKey, PreprocessOutput, ShaderFrequency, ShaderTarget, SourceBlob};
    use crate::path::{PathMappings, VirtualPath};
    use std::time::Duration;

    fn finished_job() -> CompileJob {
        let mut mappings = PathMappings::new();
        mappings.add_mapping("/Game", "/unused");
        let mut job = CompileJob::new(
            JobKey { shader_type: 1, vertex_factory: 0, permutation: 0 },
            JobInput {
                target: ShaderTarget {
                    platform: "TestPlatform".into(),
                    frequency: ShaderFrequency::Pixel,
                },
                shader_format: "TEST_FORMAT".into(),
                format_version: 1,
                source_path: VirtualPath::new("/Game/A.usf", &mappings).unwrap(),
                entry_point: "Main".into(),
                environment: CompileEnvironment::new(),
                is_pipeline_job: false,
                layout_signature: None,
                debug_info_path: None,
            },
        );
        job.preprocess = Some(PreprocessOutput {
            succeeded: true,
            source: SourceBlob::Plain("float4 Main() { return 0; }".into()),
            directives: vec![],
            line_origins: vec![],
            diagnostics: vec![],
            elapsed: Duration::ZERO,
        });
        job.output.succeeded = true;
        job.output.code = vec![0xAA, 0xBB];
        let hash = job.input_hash();
        job.output.stamp(&job.input.target, hash);
        job
    }

    #[test]
    fn cache_counts_hits_and_misses() {
        let cache = JobCache::new();
        let job = finished_job();
        let hash = job.input_hash();

        assert!(cache.find(&hash).is_none());
        cache.insert(hash, Arc::new(job.output.clone()));
        assert!(cache.find(&hash).is_some());
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn job_dump_round_trip() {
        let job = finished_job();
        let mut dump = Vec::new();
        write_job_dump(&job, "zlib", &mut dump).unwrap();

        let (input, output) = read_job_dump(dump.as_slice()).unwrap();
        assert_eq!(input.input_hash, job.input_hash());
        assert_eq!(input.compression_format, "zlib");
        assert_eq!(output.code, vec![0xAA, 0xBB]);
    }

    #[test]
    #[should_panic(expected = "does not match job input hash")]
    fn corrupted_dump_is_fatal() {
        let job = finished_job();
        let mut dump = Vec::new();
        write_job_dump(&job, "zlib", &mut dump).unwrap();
        // flip a byte inside the serialized validation hash: counting back
        // from the end of the output record, debug_data (8) + diagnostics (8)
        // + output_hash (32) + code_compressed (1) + code (8 + 2) puts the
        // validation hash at len-91..len-59
        let len = dump.len();
        dump[len - 60] ^= 0xFF;
        let _ = read_job_dump(dump.as_slice());
    }
}
