// Copyright 2024 the Tectonic Project
// Licensed under the MIT License

//! The engine driver: `Begin`/`Chain`/`FilterPush`/`FilterPop`/`End`, output
//! export, and unreferenced-file cleanup.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};

use tectonic_errors::{anyhow::Context, prelude::*};
use tectonic_status_base::{tt_note, StatusBackend};

use crate::cache::FileCache;
use crate::file::File;
use crate::filter::Filter;
use crate::fingerprint::Fingerprint;
use crate::plugin::Plugin;
use crate::stage::{run_stage, CacheTally, Stage};

/// A recorded, non-fatal failure attributed to a named component and,
/// usually, a file path.
pub struct Fault {
    pub name: String,
    pub path: Option<String>,
    pub cause: Error,
}

impl Fault {
    pub(crate) fn new(name: &str, path: Option<String>, cause: Error) -> Self {
        Fault {
            name: name.to_string(),
            path,
            cause,
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => write!(f, "[{}@{}]: {}", self.name, p, self.cause),
            None => write!(f, "[{}]: {}", self.name, self.cause),
        }
    }
}

/// Options controlling how a run's stages are scheduled. Only the worker
/// count is exposed; it defaults to the host's logical CPU count and exists
/// as an override mainly so tests get deterministic, low concurrency.
#[derive(Clone, Copy)]
pub struct EngineOptions {
    pub workers: Option<usize>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions { workers: None }
    }
}

/// The pipeline driver. Owns the stage list, the ambient filter stack, the
/// cache, and the accumulated faults. `Begin` attaches the loader as stage 0;
/// `End` runs every stage concurrently and drains the tail into the target
/// directory.
pub struct Engine {
    src_dir: PathBuf,
    cache: Arc<FileCache>,
    stages: Vec<Stage>,
    ambient_filters: Vec<Arc<dyn Filter>>,
    fingerprint: Fingerprint,
    options: EngineOptions,
    ended: bool,
}

impl Engine {
    /// Start a new pipeline rooted at `src_dir`, with no cache.
    pub fn begin(src_dir: impl Into<PathBuf>) -> Self {
        Self::begin_with_options(src_dir, None, EngineOptions::default())
    }

    /// Start a new pipeline with a cache directory.
    pub fn begin_cached(src_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self::begin_with_options(src_dir, Some(cache_dir.into()), EngineOptions::default())
    }

    pub fn begin_with_options(
        src_dir: impl Into<PathBuf>,
        cache_dir: Option<PathBuf>,
        options: EngineOptions,
    ) -> Self {
        let cache = Arc::new(match cache_dir {
            Some(d) => FileCache::new(d),
            None => FileCache::disabled(),
        });

        let mut fingerprint = Fingerprint::new();
        let loader_fp = fingerprint.chain("loader");

        let stages = vec![Stage::new(Arc::new(crate::loader::Loader), Vec::new(), loader_fp)];

        Engine {
            src_dir: src_dir.into(),
            cache,
            stages,
            ambient_filters: Vec::new(),
            fingerprint,
            options,
            ended: false,
        }
    }

    /// Push an ambient filter. Affects every stage chained from this point
    /// forward, not stages already chained.
    pub fn filter_push(&mut self, filter: Arc<dyn Filter>) {
        assert!(!self.ended, "FilterPush called after End");
        self.ambient_filters.push(filter);
    }

    /// Pop the most recently pushed ambient filter. A programmer error to
    /// call on an empty stack or after `End`.
    pub fn filter_pop(&mut self) {
        assert!(!self.ended, "FilterPop called after End");
        assert!(
            self.ambient_filters.pop().is_some(),
            "FilterPop called with an empty ambient filter stack"
        );
    }

    /// Append a stage running `plugin`, snapshotting the current ambient
    /// filter stack and computing its pipeline fingerprint.
    pub fn chain(&mut self, plugin: Arc<dyn Plugin>) {
        assert!(!self.ended, "Chain called after End");
        let fp = self.fingerprint.chain(plugin.name());
        self.stages
            .push(Stage::new(plugin, self.ambient_filters.clone(), fp));
    }

    /// Seal the engine, run every stage concurrently, export the tail
    /// stream's files into `dst_dir`, garbage-collect anything in `dst_dir`
    /// that wasn't referenced by this run, and return the accumulated
    /// faults.
    pub fn end(mut self, dst_dir: impl AsRef<Path>, status: &mut dyn StatusBackend) -> Vec<Fault> {
        assert!(!self.ended, "End called more than once");
        self.ended = true;

        let dst_dir = dst_dir.as_ref();
        if let Err(e) = fs::create_dir_all(dst_dir) {
            return vec![Fault::new(
                "core",
                None,
                anyhow!(e).context(format!(
                    "failed to create target directory `{}`",
                    dst_dir.display()
                )),
            )];
        }

        self.cache.warn_if_unusable(status);

        let faults: Arc<Mutex<Vec<Fault>>> = Arc::new(Mutex::new(Vec::new()));
        let tally = Arc::new(CacheTally::default());
        let worker_count = self.options.workers.unwrap_or_else(|| num_cpus::get().max(1));

        tt_note!(status, "running {} pipeline stage(s)", self.stages.len());

        // Build one unbuffered channel per stage boundary (N stages -> N
        // channels; the loader has no input, the tail has no downstream
        // consumer but the engine itself).
        let mut senders = Vec::with_capacity(self.stages.len());
        let mut receivers: Vec<Option<std::sync::mpsc::Receiver<File>>> =
            Vec::with_capacity(self.stages.len());

        for _ in 0..self.stages.len() {
            let (tx, rx) = sync_channel(0);
            senders.push(tx);
            receivers.push(Some(rx));
        }

        let tail_rx = std::thread::scope(|scope| {
            // Stage i reads from the previous stage's output receiver (None
            // for i == 0, the loader) and writes to senders[i]. After the
            // loop, `input_for_next` holds the tail stage's own output
            // receiver, which the engine drains directly.
            let mut input_for_next: Option<std::sync::mpsc::Receiver<File>> = None;

            for (i, stage) in self.stages.iter().enumerate() {
                let input = if i == 0 {
                    None
                } else {
                    input_for_next.take()
                };

                let output = senders[i].clone();
                let cache = self.cache.clone();
                let faults = faults.clone();
                let tally = tally.clone();
                let src_dir = &self.src_dir;

                scope.spawn(move || {
                    run_stage(
                        stage,
                        input,
                        output,
                        src_dir,
                        dst_dir,
                        cache,
                        faults,
                        tally,
                        worker_count,
                    );
                });

                input_for_next = receivers[i].take();
            }

            input_for_next
        });

        // Every stage holds its own clone of its sender plus we hold the
        // originals in `senders`; drop ours now so the tail channel closes
        // once every stage's internal clone has also dropped.
        drop(senders);

        let mut referenced: HashSet<String> = HashSet::new();

        if let Some(rx) = tail_rx {
            for mut file in rx {
                for prefix in path_prefixes(file.rel_path()) {
                    referenced.insert(prefix);
                }

                if let Err(e) = file.export(dst_dir) {
                    faults
                        .lock()
                        .unwrap()
                        .push(Fault::new("core", Some(file.rel_path().to_string()), e));
                }
            }
        }

        match cleanup_unreferenced(dst_dir, &referenced) {
            Ok(removed) => {
                tt_note!(status, "garbage-collected {} unreferenced path(s)", removed);
            }
            Err(e) => {
                faults.lock().unwrap().push(Fault::new("core", None, e));
            }
        }

        tt_note!(
            status,
            "cache: {} hit(s), {} miss(es)",
            tally.hits.load(Ordering::Relaxed),
            tally.misses.load(Ordering::Relaxed)
        );

        Arc::try_unwrap(faults)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_else(|arc| arc.lock().unwrap().drain(..).collect())
    }
}

/// All ancestor path prefixes of `rel_path`, including the full path and
/// `.` for the root, used to decide what the garbage collector may keep.
fn path_prefixes(rel_path: &str) -> Vec<String> {
    let mut prefixes = vec![".".to_string()];
    let segments: Vec<&str> = rel_path.split('/').collect();

    for i in 1..=segments.len() {
        prefixes.push(segments[..i].join("/"));
    }

    prefixes
}

fn cleanup_unreferenced(dst_dir: &Path, referenced: &HashSet<String>) -> Result<usize> {
    let mut to_remove = Vec::new();

    for entry in walkdir::WalkDir::new(dst_dir).min_depth(1) {
        let entry = atry!(
            entry;
            ["failed to walk target directory `{}`", dst_dir.display()]
        );

        let rel = atry!(
            entry.path().strip_prefix(dst_dir);
            ["failed to compute relative path for `{}`", entry.path().display()]
        );

        let rel_str = rel.to_string_lossy().replace('\\', "/");

        if !referenced.contains(&rel_str) {
            to_remove.push(entry.path().to_path_buf());
        }
    }

    // Remove deepest paths first so a directory doesn't get removed before
    // its still-unreferenced children do (those are already queued too, but
    // this keeps `remove_dir`/`remove_file` from racing each other's parent).
    to_remove.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

    let mut removed = 0;

    for path in to_remove {
        let meta = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(_) => continue, // already removed as another path's descendant
        };

        let result = if meta.is_dir() {
            fs::remove_dir(&path)
        } else {
            fs::remove_file(&path)
        };

        match result {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow!(e).context(format!(
                    "failed to remove unreferenced path `{}`",
                    path.display()
                )));
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_prefixes_cover_every_ancestor() {
        let prefixes = path_prefixes("a/b/c.txt");
        assert_eq!(
            prefixes,
            vec![
                ".".to_string(),
                "a".to_string(),
                "a/b".to_string(),
                "a/b/c.txt".to_string(),
            ]
        );
    }

    #[test]
    #[should_panic(expected = "FilterPop called with an empty ambient filter stack")]
    fn filter_pop_on_empty_stack_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::begin(dir.path());
        engine.filter_pop();
    }
}
