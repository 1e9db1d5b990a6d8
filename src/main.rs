// Copyright 2024 the Tectonic Project
// Licensed under the MIT License

use std::io::Write;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use kiln::{Engine, EngineOptions};
use tectonic_errors::prelude::*;
use tectonic_status_base::{MessageKind, StatusBackend};
use termcolor::{Color, ColorSpec, StandardStream, WriteColor};

fn main() {
    let args = ToplevelArgs::parse();
    let mut status = TermStatusBackend::new();

    if let Err(e) = args.exec(&mut status) {
        status.report_error(&e);
        std::process::exit(1);
    }
}

#[derive(Debug, Parser)]
struct ToplevelArgs {
    #[command(subcommand)]
    action: Action,
}

impl ToplevelArgs {
    fn exec(self, status: &mut dyn StatusBackend) -> Result<()> {
        match self.action {
            Action::Build(a) => a.exec(status),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Run the pipeline once: load `--src`, run every chained stage, write
    /// to `--dst`.
    Build(BuildArgs),
}

#[derive(Args, Debug)]
struct BuildArgs {
    #[arg(long)]
    src: Option<PathBuf>,

    #[arg(long)]
    dst: Option<PathBuf>,

    #[arg(long)]
    workers: Option<usize>,
}

impl BuildArgs {
    fn exec(self, status: &mut dyn StatusBackend) -> Result<()> {
        let root = atry!(
            kiln::config::get_root();
            ["failed to determine the project root"]
        );

        let config = atry!(
            kiln::config::Config::load(&root);
            ["failed to load configuration"]
        );

        let src_dir = self.src.unwrap_or_else(|| config.src_dir(&root));
        let dst_dir = self.dst.unwrap_or_else(|| config.dst_dir(&root));
        let workers = self.workers.or(config.workers);
        let cache_dir = config.cache_dir(&root);

        let options = EngineOptions { workers };
        let engine = Engine::begin_with_options(src_dir, cache_dir, options);

        // A minimal smoke-run: no plugins chained beyond the built-in
        // loader, so this just mirrors `--src` into `--dst` unchanged. Any
        // real site uses this crate as a library and chains its own plugins
        // before calling `end`.
        let faults = engine.end(&dst_dir, status);

        for fault in &faults {
            status.report_error(&anyhow!("{}", fault));
        }

        ensure!(faults.is_empty(), "build completed with {} fault(s)", faults.len());

        Ok(())
    }
}

/// A plain termcolor-backed [`StatusBackend`] for the CLI's own top-level
/// reporting. Per-worker-thread reporting during a run uses
/// [`kiln::worker_status::WorkerStatusBackend`] instead.
struct TermStatusBackend {
    stream: StandardStream,
}

impl TermStatusBackend {
    fn new() -> Self {
        TermStatusBackend {
            stream: StandardStream::stderr(termcolor::ColorChoice::Auto),
        }
    }
}

impl StatusBackend for TermStatusBackend {
    fn report(&mut self, kind: MessageKind, args: std::fmt::Arguments<'_>, err: Option<&Error>) {
        let (color, label) = match kind {
            MessageKind::Note => (Color::Blue, "note"),
            MessageKind::Warning => (Color::Yellow, "warning"),
            MessageKind::Error => (Color::Red, "error"),
        };

        let mut lock = self.stream.lock();
        let _ = lock.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true));
        let _ = write!(lock, "{label}");
        let _ = lock.reset();
        let _ = writeln!(lock, ": {args}");

        if let Some(e) = err {
            for item in e.chain() {
                let _ = writeln!(lock, "  {item}");
            }
        }
    }

    fn dump_error_logs(&mut self, output: &[u8]) {
        eprintln!("{}", String::from_utf8_lossy(output));
    }
}
