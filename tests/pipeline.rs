// Copyright 2024 the Tectonic Project
// Licensed under the MIT License

//! End-to-end scenarios exercising the engine as a whole: a real source
//! tree on disk, a real pipeline of plugins, a real target directory.

use std::fs;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use kiln::{Engine, EngineOptions, File, Filter, Named, Plugin, StageContext};
use tectonic_errors::prelude::*;

/// A do-nothing status backend for tests that don't care about diagnostics.
struct NullStatus;

impl tectonic_status_base::StatusBackend for NullStatus {
    fn report(
        &mut self,
        _kind: tectonic_status_base::MessageKind,
        _args: std::fmt::Arguments<'_>,
        _err: Option<&Error>,
    ) {
    }

    fn dump_error_logs(&mut self, _output: &[u8]) {}
}

fn read_to_string(path: &std::path::Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

/// Uppercases the bytes of every file it processes, counting how many times
/// it actually ran `process` (as opposed to serving a cache hit).
struct UppercasePlugin {
    calls: AtomicUsize,
}

impl UppercasePlugin {
    fn new() -> Arc<Self> {
        Arc::new(UppercasePlugin {
            calls: AtomicUsize::new(0),
        })
    }
}

impl Named for UppercasePlugin {
    fn name(&self) -> &str {
        "uppercase"
    }
}

impl Plugin for UppercasePlugin {
    fn has_processor(&self) -> bool {
        true
    }

    fn process(&self, ctx: &StageContext, mut file: File) -> Result<()> {
        // The scheduler already tried a cache lookup before calling us, so
        // reaching this point means it was a miss.
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let upper = String::from_utf8_lossy(&bytes).to_uppercase();

        let mut output = File::from_bytes(
            file.rel_path().to_string(),
            upper.into_bytes(),
            SystemTime::now(),
        );

        ctx.cache_store(&mut file, &mut output, &[])?;
        ctx.dispatch(output)?;
        Ok(())
    }
}

/// Renames every `.md` file it sees to `.html`, wrapping the body in a `<p>`.
struct RenameToHtmlPlugin;

impl Named for RenameToHtmlPlugin {
    fn name(&self) -> &str {
        "rename-to-html"
    }
}

impl Plugin for RenameToHtmlPlugin {
    fn has_processor(&self) -> bool {
        true
    }

    fn process(&self, ctx: &StageContext, mut file: File) -> Result<()> {
        if !file.rel_path().ends_with(".md") {
            ctx.dispatch(file)?;
            return Ok(());
        }

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let body = String::from_utf8_lossy(&bytes);
        let new_path = file.rel_path().trim_end_matches(".md").to_string() + ".html";

        let output = File::from_bytes(
            new_path,
            format!("<p>{body}</p>").into_bytes(),
            SystemTime::now(),
        );

        ctx.dispatch(output)?;
        Ok(())
    }
}

/// Fails on exactly one specific input path, passing every other file
/// through unchanged.
struct FailOnPlugin {
    target: String,
}

impl Named for FailOnPlugin {
    fn name(&self) -> &str {
        "fail-on"
    }
}

impl Plugin for FailOnPlugin {
    fn has_processor(&self) -> bool {
        true
    }

    fn process(&self, ctx: &StageContext, file: File) -> Result<()> {
        if file.rel_path() == self.target {
            bail!("intentional failure on `{}`", self.target);
        }

        ctx.dispatch(file)?;
        Ok(())
    }
}

struct ExtensionFilter {
    ext: &'static str,
}

impl Named for ExtensionFilter {
    fn name(&self) -> &str {
        "ext-filter"
    }
}

impl Filter for ExtensionFilter {
    fn accept(&self, _ctx: &StageContext, file: &File) -> Result<bool> {
        Ok(file.rel_path().ends_with(self.ext))
    }
}

fn single_worker() -> EngineOptions {
    EngineOptions { workers: Some(1) }
}

#[test]
fn scenario_empty_pipeline_through_loader_only() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();

    fs::write(src.path().join("a.txt"), b"hi").unwrap();
    fs::create_dir(src.path().join("sub")).unwrap();
    fs::write(src.path().join("sub/b.md"), b"#x").unwrap();

    let engine = Engine::begin(src.path());
    let faults = engine.end(dst.path(), &mut NullStatus);

    assert!(faults.is_empty());
    assert_eq!(read_to_string(&dst.path().join("a.txt")), "hi");
    assert_eq!(read_to_string(&dst.path().join("sub/b.md")), "#x");
}

#[test]
fn scenario_filter_short_circuit() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();

    fs::write(src.path().join("a.txt"), b"hi").unwrap();
    fs::write(src.path().join("b.md"), b"hi").unwrap();

    let mut engine = Engine::begin_with_options(src.path(), None, single_worker());
    engine.filter_push(Arc::new(ExtensionFilter { ext: ".txt" }));
    engine.chain(UppercasePlugin::new());

    let faults = engine.end(dst.path(), &mut NullStatus);

    assert!(faults.is_empty());
    assert_eq!(read_to_string(&dst.path().join("a.txt")), "HI");
    assert_eq!(read_to_string(&dst.path().join("b.md")), "hi");
}

#[test]
fn scenario_rename_via_plugin() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();

    fs::write(src.path().join("x.md"), b"x").unwrap();

    let mut engine = Engine::begin_with_options(src.path(), None, single_worker());
    engine.chain(Arc::new(RenameToHtmlPlugin));

    let faults = engine.end(dst.path(), &mut NullStatus);

    assert!(faults.is_empty());
    assert_eq!(read_to_string(&dst.path().join("x.html")), "<p>x</p>");
    assert!(!dst.path().join("x.md").exists());
}

#[test]
fn scenario_cache_hit_skips_reprocessing() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    fs::write(src.path().join("a.txt"), b"hi").unwrap();

    let plugin = UppercasePlugin::new();

    let mut engine1 = Engine::begin_with_options(
        src.path(),
        Some(cache.path().to_path_buf()),
        single_worker(),
    );
    engine1.chain(plugin.clone());
    let faults = engine1.end(dst.path(), &mut NullStatus);
    assert!(faults.is_empty());
    assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
    assert_eq!(read_to_string(&dst.path().join("a.txt")), "HI");

    let mut engine2 = Engine::begin_with_options(
        src.path(),
        Some(cache.path().to_path_buf()),
        single_worker(),
    );
    engine2.chain(plugin.clone());
    let faults = engine2.end(dst.path(), &mut NullStatus);
    assert!(faults.is_empty());
    // The scheduler serves the cached artifact before ever calling
    // `process`, so the call count stays at 1 from run 1.
    assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
    assert_eq!(read_to_string(&dst.path().join("a.txt")), "HI");
}

#[test]
fn scenario_cache_invalidation_by_input_mtime() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let input_path = src.path().join("a.txt");

    fs::write(&input_path, b"hi").unwrap();
    let old = SystemTime::now() - Duration::from_secs(120);
    filetime::set_file_mtime(&input_path, filetime::FileTime::from_system_time(old)).unwrap();

    let mut engine1 = Engine::begin_with_options(
        src.path(),
        Some(cache.path().to_path_buf()),
        single_worker(),
    );
    engine1.chain(Arc::new(RecordingEcho::default()));
    let _ = engine1.end(dst.path(), &mut NullStatus);

    // Bump the source file's mtime forward; content is unchanged but the
    // cache must still be considered stale.
    fs::write(&input_path, b"hi").unwrap();
    let newer = SystemTime::now();
    filetime::set_file_mtime(&input_path, filetime::FileTime::from_system_time(newer)).unwrap();

    let recorder = Arc::new(RecordingEcho::default());
    let mut engine2 = Engine::begin_with_options(
        src.path(),
        Some(cache.path().to_path_buf()),
        single_worker(),
    );
    engine2.chain(recorder.clone());
    let _ = engine2.end(dst.path(), &mut NullStatus);

    assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
}

/// An echo plugin that counts how many times the scheduler actually called
/// `process` on it. The scheduler serves a cache hit itself, without calling
/// `process` at all, so an unchanged count across runs indicates a hit.
#[derive(Default)]
struct RecordingEcho {
    calls: AtomicUsize,
}

impl Named for RecordingEcho {
    fn name(&self) -> &str {
        "recording-echo"
    }
}

impl Plugin for RecordingEcho {
    fn has_processor(&self) -> bool {
        true
    }

    fn process(&self, ctx: &StageContext, mut file: File) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let mut output =
            File::from_bytes(file.rel_path().to_string(), bytes, SystemTime::now());
        ctx.cache_store(&mut file, &mut output, &[])?;
        ctx.dispatch(output)?;
        Ok(())
    }
}

#[test]
fn scenario_cache_invalidation_by_pipeline_position() {
    // Run 1: loader -> B (recording-echo). Run 2: loader -> X -> B, same
    // cache dir. B's entry from run 1 must be ignored: its fingerprint now
    // includes the extra upstream plugin X.
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    fs::write(src.path().join("a.txt"), b"hi").unwrap();

    let mut engine1 = Engine::begin_with_options(
        src.path(),
        Some(cache.path().to_path_buf()),
        single_worker(),
    );
    engine1.chain(Arc::new(RecordingEcho::default()));
    let _ = engine1.end(dst.path(), &mut NullStatus);

    let recorder = Arc::new(RecordingEcho::default());
    let mut engine2 = Engine::begin_with_options(
        src.path(),
        Some(cache.path().to_path_buf()),
        single_worker(),
    );
    engine2.chain(Arc::new(RenameToHtmlPlugin));
    engine2.chain(recorder.clone());
    let _ = engine2.end(dst.path(), &mut NullStatus);

    assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn scenario_fault_isolation() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();

    fs::write(src.path().join("a.txt"), b"hi").unwrap();
    fs::write(src.path().join("b.txt"), b"hi").unwrap();
    fs::write(src.path().join("c.txt"), b"hi").unwrap();

    let mut engine = Engine::begin_with_options(src.path(), None, single_worker());
    engine.chain(Arc::new(FailOnPlugin {
        target: "b.txt".to_string(),
    }));
    engine.chain(UppercasePlugin::new());

    let faults = engine.end(dst.path(), &mut NullStatus);

    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].name, "fail-on");
    assert_eq!(faults[0].path.as_deref(), Some("b.txt"));

    assert_eq!(read_to_string(&dst.path().join("a.txt")), "HI");
    assert_eq!(read_to_string(&dst.path().join("c.txt")), "HI");
    assert!(!dst.path().join("b.txt").exists());
}

#[test]
fn scenario_cleanup_removes_unreferenced_files() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();

    fs::write(src.path().join("fresh.txt"), b"hi").unwrap();
    fs::write(dst.path().join("stale.txt"), b"old").unwrap();

    let engine = Engine::begin(src.path());
    let faults = engine.end(dst.path(), &mut NullStatus);

    assert!(faults.is_empty());
    assert!(dst.path().join("fresh.txt").exists());
    assert!(!dst.path().join("stale.txt").exists());
}

#[test]
fn ambient_filter_snapshot_does_not_affect_earlier_stages() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();

    fs::write(src.path().join("a.txt"), b"hi").unwrap();
    fs::write(src.path().join("a.md"), b"hi").unwrap();

    let mut engine = Engine::begin_with_options(src.path(), None, single_worker());
    engine.chain(UppercasePlugin::new());
    engine.filter_push(Arc::new(ExtensionFilter { ext: ".md" }));
    engine.chain(UppercasePlugin::new());
    engine.filter_pop();

    let faults = engine.end(dst.path(), &mut NullStatus);

    assert!(faults.is_empty());
    // Both files were already uppercased by the first, unfiltered stage, so
    // the second stage's filter (which only re-admits `.md`) has nothing
    // further to do to either of them.
    assert_eq!(read_to_string(&dst.path().join("a.txt")), "HI");
    assert_eq!(read_to_string(&dst.path().join("a.md")), "HI");
}
