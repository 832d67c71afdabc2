//! The compile dispatcher: a bounded worker pool that takes ready jobs
//! through preprocessing, cache lookup, in-flight deduplication and backend
//! compilation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::backend::{Backend, SourceLookup};
use crate::diagnostics::CompilerDiagnostic;
use crate::hash::ContentHash;
use crate::job::{integrity_failure, CompileJob, Job, JobOutput, JobState};
use crate::preprocess::preprocess_job;
use crate::CompilationContext;

/// Cooperative cancellation. Checked between jobs; in-flight work finishes.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

struct OrderedState<T> {
    next: usize,
    out: Vec<T>,
}

/// Commits per-index results in index order even when workers finish out of
/// order: a worker committing index N blocks until indices below N are in.
pub struct OrderedWriter<T> {
    state: Mutex<OrderedState<T>>,
    cond: Condvar,
}

impl<T> OrderedWriter<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OrderedState { next: 0, out: Vec::new() }),
            cond: Condvar::new(),
        }
    }

    pub fn commit(&self, index: usize, value: T) {
        let mut state = self.state.lock();
        while state.next != index {
            self.cond.wait(&mut state);
        }
        state.out.push(value);
        state.next += 1;
        self.cond.notify_all();
    }

    pub fn into_inner(self) -> Vec<T> {
        self.state.into_inner().out
    }
}

impl<T> Default for OrderedWriter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Packs primary and secondary compiled code into one blob:
/// `[packed key][primary len][secondary len][primary][secondary]`, all
/// length fields little-endian.
pub fn combine_outputs(packed_key: i32, primary: &[u8], secondary: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + primary.len() + secondary.len());
    out.extend_from_slice(&packed_key.to_le_bytes());
    out.extend_from_slice(&(primary.len() as u32).to_le_bytes());
    out.extend_from_slice(&(secondary.len() as u32).to_le_bytes());
    out.extend_from_slice(primary);
    out.extend_from_slice(secondary);
    out
}

/// Completion slot other threads with the same input hash wait on.
#[derive(Default)]
struct InFlight {
    slot: Mutex<Option<Arc<JobOutput>>>,
    cond: Condvar,
}

impl InFlight {
    fn publish(&self, output: Arc<JobOutput>) {
        *self.slot.lock() = Some(output);
        self.cond.notify_all();
    }

    fn wait(&self) -> Arc<JobOutput> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(output) = slot.as_ref() {
                return output.clone();
            }
            self.cond.wait(&mut slot);
        }
    }
}

type InFlightMap = Mutex<FxHashMap<ContentHash, Arc<InFlight>>>;

/// One line of the dispatch report, in job submission order.
#[derive(Debug)]
pub struct JobReport {
    pub index: usize,
    /// Unset when the job never reached preprocessing, e.g. on cancellation.
    pub input_hash: Option<ContentHash>,
    pub state: JobState,
    pub succeeded: bool,
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub reports: Vec<JobReport>,
    pub compiled: usize,
    pub cache_hits: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Compiles every job in `jobs` on a bounded worker pool.
///
/// Reports come back in submission order regardless of completion order.
/// Jobs whose input hash matches an in-flight or cached compile are not
/// executed again; they copy the existing output.
pub fn dispatch(
    ctx: &CompilationContext,
    jobs: &mut [Job],
    cancel: &CancelToken,
) -> DispatchReport {
    if jobs.is_empty() {
        return DispatchReport::default();
    }

    let slots: Vec<Mutex<&mut Job>> = jobs.iter_mut().map(Mutex::new).collect();
    let (tx, rx) = flume::unbounded();
    for index in 0..slots.len() {
        let _ = tx.send(index);
    }
    drop(tx);

    let ordered = OrderedWriter::new();
    let in_flight: InFlightMap = Mutex::new(FxHashMap::default());
    let workers = ctx.config.worker_threads.clamp(1, slots.len());
    log::debug!("dispatching {} jobs on {workers} workers", slots.len());

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let rx = rx.clone();
            let (slots, ordered, in_flight) = (&slots, &ordered, &in_flight);
            scope.spawn(move || {
                for index in rx.iter() {
                    let mut job = slots[index].lock();
                    process_job(ctx, &mut job, cancel, in_flight);
                    let hashed = job.units().iter().all(CompileJob::input_hash_set);
                    let report = JobReport {
                        index,
                        input_hash: hashed.then(|| job.input_hash()),
                        state: job.units()[0].status.state(),
                        succeeded: job.succeeded(),
                    };
                    ordered.commit(index, report);
                }
            });
        }
    });

    let mut report = DispatchReport {
        reports: ordered.into_inner(),
        ..DispatchReport::default()
    };
    for line in &report.reports {
        match line.state {
            JobState::Cancelled => report.cancelled += 1,
            JobState::CompleteFoundInCache => report.cache_hits += 1,
            _ if line.succeeded => report.compiled += 1,
            _ => report.failed += 1,
        }
    }
    report
}

fn process_job(ctx: &CompilationContext, job: &mut Job, cancel: &CancelToken, in_flight: &InFlightMap) {
    for unit in job.units() {
        unit.status.advance(JobState::Ready);
    }
    if cancel.is_cancelled() {
        for unit in job.units() {
            unit.status.advance(JobState::Cancelled);
        }
        return;
    }
    for unit in job.units() {
        unit.status.advance(JobState::Queued);
    }

    match job {
        Job::Single(unit) => {
            process_unit(ctx, unit, in_flight);
        }
        Job::Pipeline(pipeline) => {
            // preprocess every stage first so aborted stages can still be
            // stamped with their input hash for validation bookkeeping
            for stage in &mut pipeline.stages {
                run_preprocess(ctx, stage);
            }
            let mut aborted = false;
            for stage in &mut pipeline.stages {
                if aborted {
                    stage
                        .output
                        .diagnostics
                        .push(CompilerDiagnostic::error("aborted: an earlier pipeline stage failed"));
                    stage.output.succeeded = false;
                    let hash = stage.input_hash();
                    stage.output.stamp(&stage.input.target, hash);
                    stage.status.advance(JobState::CompleteLocalExecution);
                    continue;
                }
                process_unit(ctx, stage, in_flight);
                aborted = !stage.output.succeeded;
            }
        }
    }
}

fn backend_for(ctx: &CompilationContext, unit: &CompileJob) -> Arc<dyn Backend> {
    let Some(backend) = ctx.backends.get(&unit.input.shader_format) else {
        integrity_failure(&format!(
            "no backend registered for shader format `{}`",
            unit.input.shader_format
        ));
    };
    backend
}

fn run_preprocess(ctx: &CompilationContext, unit: &mut CompileJob) {
    let backend = backend_for(ctx, unit);
    let sources = SourceLookup {
        mappings: &ctx.mappings,
        resolver: &*ctx.resolver,
        cache: &ctx.sources,
    };
    if let Err(err) = preprocess_job(unit, ctx.shared_environment.as_deref(), &*backend, &sources) {
        unit.output.succeeded = false;
        unit.output
            .diagnostics
            .push(CompilerDiagnostic::error(format!("preprocessing failed: {err}")));
    }
}

fn process_unit(ctx: &CompilationContext, unit: &mut CompileJob, in_flight: &InFlightMap) {
    run_preprocess(ctx, unit);
    let preprocess_failed = unit.preprocess.as_ref().is_none_or(|p| !p.succeeded);
    let hash = unit.input_hash();
    if preprocess_failed {
        unit.output.succeeded = false;
        unit.output.stamp(&unit.input.target, hash);
        unit.status.advance(JobState::CompleteLocalExecution);
        return;
    }

    if let Some(cached) = ctx.job_cache.find(&hash) {
        cached.validate(&unit.input.target, hash);
        unit.output = (*cached).clone();
        unit.status.advance(JobState::CompleteFoundInCache);
        return;
    }

    // first thread with this hash compiles; the rest subscribe to its result
    let waiter = {
        let mut map = in_flight.lock();
        match map.get(&hash) {
            Some(flight) => Some(flight.clone()),
            None => {
                map.insert(hash, Arc::new(InFlight::default()));
                None
            }
        }
    };
    if let Some(flight) = waiter {
        unit.status.mark_duplicate();
        let output = flight.wait();
        output.validate(&unit.input.target, hash);
        unit.output = (*output).clone();
        unit.status.advance(JobState::CompleteFoundInCache);
        return;
    }

    unit.status.advance(JobState::PendingLocalExecution);
    compile_unit(ctx, unit, hash);

    let output = Arc::new(unit.output.clone());
    ctx.job_cache.insert(hash, output.clone());
    let flight = in_flight.lock().remove(&hash);
    if let Some(flight) = flight {
        flight.publish(output);
    }
    unit.status.advance(JobState::CompleteLocalExecution);
}

fn compile_unit(ctx: &CompilationContext, unit: &mut CompileJob, hash: ContentHash) {
    let backend = backend_for(ctx, unit);
    let (primary, secondary) = {
        let read = |pass: &crate::job::PreprocessOutput| match pass.source.text() {
            Ok(text) => Some(text.into_owned()),
            Err(err) => {
                integrity_failure(&format!(
                    "preprocessed source of {} is unreadable: {err}",
                    unit.input.source_path
                ));
            }
        };
        (
            unit.preprocess.as_ref().and_then(&read),
            unit.secondary_preprocess.as_ref().and_then(&read),
        )
    };
    let Some(primary) = primary else {
        return;
    };

    if let Some(secondary) = secondary {
        let mut secondary_output = JobOutput::default();
        backend.compile(
            &unit.input,
            &primary,
            Some(&secondary),
            &mut unit.output,
            Some(&mut secondary_output),
            &ctx.config.working_dir,
        );
        if unit.output.succeeded && secondary_output.succeeded {
            unit.output.code = combine_outputs(
                backend.packed_shader_key(),
                &unit.output.code,
                &secondary_output.code,
            );
            unit.output.debug_data.extend_from_slice(&secondary_output.debug_data);
        } else {
            unit.output.succeeded = false;
            unit.output.diagnostics.extend(secondary_output.diagnostics);
        }
    } else {
        backend.compile(
            &unit.input,
            &primary,
            None,
            &mut unit.output,
            None,
            &ctx.config.working_dir,
        );
    }

    unit.output.stamp(&unit.input.target, hash);
    if let Err(err) = unit.output.finalize(ctx.config.compress_output) {
        unit.output.succeeded = false;
        unit.output
            .diagnostics
            .push(CompilerDiagnostic::error(format!("failed to finalize output: {err}")));
    }
    if ctx.config.dump_debug_info {
        if let Some(dir) = unit.input.debug_info_path.as_deref() {
            if let Err(err) = backend.output_debug_data(&unit.input, &unit.output, dir.as_ref()) {
                log::warn!("failed to dump debug data for {}: {err}", unit.input.source_path);
            }
        }
    }
}
