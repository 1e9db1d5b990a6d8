// Copyright 2024 the Tectonic Project
// Licensed under the MIT License

//! One position in the pipeline: a plugin, its filter stack, and the
//! per-stage worker fan that runs it.

use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Mutex};

use tectonic_errors::prelude::*;
use tectonic_status_base::tt_warning;

use crate::cache::FileCache;
use crate::engine::Fault;
use crate::file::File;
use crate::filter::Filter;
use crate::plugin::Plugin;
use crate::worker_status::WorkerStatusBackend;

/// Engine-wide cache hit/miss tallies, reported in aggregate once a run
/// completes. Not exposed to plugins; purely ambient diagnostics.
#[derive(Default)]
pub struct CacheTally {
    pub hits: AtomicUsize,
    pub misses: AtomicUsize,
}

/// The operations a [`crate::plugin::Plugin`] or [`Filter`] is given access
/// to while a stage runs.
pub struct StageContext {
    src_dir: PathBuf,
    dst_dir: PathBuf,
    plugin_name: String,
    fingerprint: u32,
    output: SyncSender<File>,
    cache: Arc<FileCache>,
}

impl StageContext {
    pub fn src_dir(&self) -> &Path {
        &self.src_dir
    }

    pub fn dst_dir(&self) -> &Path {
        &self.dst_dir
    }

    /// Emit a file downstream. Must be called, if at all, before the current
    /// `Process` invocation returns: the core does not support plugins that
    /// stash this context and dispatch from a detached thread later.
    pub fn dispatch(&self, file: File) -> Result<()> {
        self.output
            .send(file)
            .map_err(|_| anyhow!("stage output stream is closed"))
    }

    pub fn cache_store(
        &self,
        input: &mut File,
        output: &mut File,
        dep_paths: &[String],
    ) -> Result<()> {
        self.cache
            .store_file(self.fingerprint, &self.plugin_name, input, output, dep_paths)
    }

    pub fn cache_retrieve(&self, input: &mut File) -> Result<Option<File>> {
        self.cache
            .retrieve_file(self.fingerprint, &self.plugin_name, input)
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> (StageContext, Receiver<File>) {
        Self::for_test_rooted(PathBuf::from("."))
    }

    #[cfg(test)]
    pub(crate) fn for_test_rooted(src_dir: PathBuf) -> (StageContext, Receiver<File>) {
        let (tx, rx) = std::sync::mpsc::sync_channel(64);
        let ctx = StageContext {
            src_dir,
            dst_dir: PathBuf::from("."),
            plugin_name: "test".into(),
            fingerprint: 0,
            output: tx,
            cache: Arc::new(FileCache::disabled()),
        };
        (ctx, rx)
    }
}

/// The static topology of one pipeline position: a plugin plus the ambient
/// filter stack it was chained with.
pub struct Stage {
    pub(crate) name: String,
    pub(crate) plugin: Arc<dyn Plugin>,
    pub(crate) ambient_filters: Vec<Arc<dyn Filter>>,
    pub(crate) fingerprint: u32,
}

impl Stage {
    pub(crate) fn new(
        plugin: Arc<dyn Plugin>,
        ambient_filters: Vec<Arc<dyn Filter>>,
        fingerprint: u32,
    ) -> Self {
        let name = plugin.name().to_string();
        Stage {
            name,
            plugin,
            ambient_filters,
            fingerprint,
        }
    }
}

/// Run one stage's full lifecycle (initialize, process, finalize) to
/// completion, feeding faults into the shared engine-wide list. `input` is
/// `None` for the head (loader) stage. The output sender is always dropped
/// by the time this returns, closing the stream for the next stage.
pub(crate) fn run_stage(
    stage: &Stage,
    input: Option<Receiver<File>>,
    output: SyncSender<File>,
    src_dir: &Path,
    dst_dir: &Path,
    cache: Arc<FileCache>,
    faults: Arc<Mutex<Vec<Fault>>>,
    tally: Arc<CacheTally>,
    worker_count: usize,
) {
    let ctx = StageContext {
        src_dir: src_dir.to_path_buf(),
        dst_dir: dst_dir.to_path_buf(),
        plugin_name: stage.name.clone(),
        fingerprint: stage.fingerprint,
        output,
        cache,
    };

    let mut local_filters: Vec<Arc<dyn Filter>> = Vec::new();

    if stage.plugin.has_initializer() {
        match stage.plugin.initialize(&ctx) {
            Ok(fs) => local_filters = fs,
            Err(e) => {
                record_fault(&faults, &stage.name, None, e);
                return;
            }
        }
    }

    if let Some(input) = input {
        if stage.plugin.has_processor() {
            run_workers(
                stage,
                &ctx,
                input,
                &local_filters,
                &faults,
                &tally,
                worker_count,
            );
        } else {
            // No processor capability: the stage is a pure pass-through and
            // the filter chain is never consulted.
            while let Ok(file) = input.recv() {
                if ctx.dispatch(file).is_err() {
                    break;
                }
            }
        }
    }

    if stage.plugin.has_finalizer() {
        if let Err(e) = stage.plugin.finalize(&ctx) {
            record_fault(&faults, &stage.name, None, e);
        }
    }
}

fn run_workers(
    stage: &Stage,
    ctx: &StageContext,
    input: Receiver<File>,
    local_filters: &[Arc<dyn Filter>],
    faults: &Arc<Mutex<Vec<Fault>>>,
    tally: &Arc<CacheTally>,
    worker_count: usize,
) {
    let filters: Vec<&Arc<dyn Filter>> = stage
        .ambient_filters
        .iter()
        .chain(local_filters.iter())
        .collect();

    let input = Mutex::new(input);
    let n = worker_count.max(1);

    std::thread::scope(|scope| {
        for _ in 0..n {
            let input = &input;
            let filters = &filters;
            let faults = faults.clone();
            let tally = tally.clone();

            scope.spawn(move || {
                // Per-worker-thread status backend: `StatusBackend` is not
                // assumed `Sync`, so each worker gets its own rather than
                // sharing one across the stage.
                let mut worker_status = WorkerStatusBackend::new(&stage.name);

                loop {
                    let received = {
                        let rx = input.lock().unwrap();
                        rx.recv()
                    };

                    let mut file = match received {
                        Ok(f) => f,
                        Err(_) => break,
                    };

                    let mut accepted = true;
                    let mut faulted = false;

                    for f in filters.iter() {
                        match f.accept(ctx, &file) {
                            Ok(true) => {}
                            Ok(false) => {
                                accepted = false;
                                break;
                            }
                            Err(e) => {
                                tt_warning!(
                                    worker_status,
                                    "filter `{}` faulted on `{}`, aborting this worker",
                                    f.name(),
                                    file.rel_path()
                                );
                                record_fault(
                                    &faults,
                                    f.name(),
                                    Some(file.rel_path().to_string()),
                                    e,
                                );
                                faulted = true;
                                break;
                            }
                        }
                    }

                    // A filter predicate erroring (as opposed to plainly
                    // rejecting) aborts this worker outright: the file is
                    // dropped, not forwarded, and the worker stops pulling
                    // further input. Other workers are unaffected.
                    if faulted {
                        break;
                    }

                    if !accepted {
                        if ctx.dispatch(file).is_err() {
                            break;
                        }
                        continue;
                    }

                    // Best-effort rewind; unloaded assets stay unloaded per
                    // the seek-zero fast path, loaded files land back at the
                    // start.
                    let _ = file.seek(SeekFrom::Start(0));

                    match ctx.cache_retrieve(&mut file) {
                        Ok(Some(cached)) => {
                            tally.hits.fetch_add(1, Ordering::Relaxed);
                            if ctx.dispatch(cached).is_err() {
                                break;
                            }
                            continue;
                        }
                        Ok(None) => {
                            tally.misses.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            tt_warning!(
                                worker_status,
                                "cache lookup failed for `{}`",
                                file.rel_path()
                            );
                            record_fault(&faults, "core", Some(file.rel_path().to_string()), e);
                        }
                    }

                    let path = file.rel_path().to_string();
                    if let Err(e) = stage.plugin.process(ctx, file) {
                        tt_warning!(worker_status, "`{}` failed on `{}`", stage.name, path);
                        record_fault(&faults, &stage.name, Some(path), e);
                    }
                }
            });
        }
    });
}

fn record_fault(faults: &Arc<Mutex<Vec<Fault>>>, name: &str, path: Option<String>, cause: Error) {
    faults.lock().unwrap().push(Fault::new(name, path, cause));
}
