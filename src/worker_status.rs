// Copyright 2024 the Tectonic Project
// Licensed under the MIT License

//! Per-worker-thread status reporting.
//!
//! A [`tectonic_status_base::StatusBackend`] is not assumed `Sync`, so a
//! stage's worker threads cannot share one. Each worker instead builds its
//! own `WorkerStatusBackend`, which prefixes every message with the name of
//! the file currently in flight and writes straight to stderr through
//! `termcolor`.

use std::io::Write;

use tectonic_errors::Error;
use termcolor::{Color, ColorSpec, StandardStream, StandardStreamLock, WriteColor};
use tectonic_status_base::{MessageKind, StatusBackend};

pub struct WorkerStatusBackend {
    context: String,
    stream: StandardStream,
}

impl WorkerStatusBackend {
    pub fn new<C: ToString>(context: C) -> WorkerStatusBackend {
        WorkerStatusBackend {
            context: context.to_string(),
            stream: StandardStream::stderr(termcolor::ColorChoice::Auto),
        }
    }

    fn write_line(&mut self, color: Color, label: &str, text: &str) {
        let mut lock: StandardStreamLock<'_> = self.stream.lock();
        let _ = lock.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true));
        let _ = write!(lock, "{label}");
        let _ = lock.reset();
        let _ = writeln!(lock, " ({}): {}", self.context, text);
    }
}

impl StatusBackend for WorkerStatusBackend {
    fn report(&mut self, kind: MessageKind, args: std::fmt::Arguments<'_>, err: Option<&Error>) {
        let (color, label) = match kind {
            MessageKind::Note => (Color::Blue, "note"),
            MessageKind::Warning => (Color::Yellow, "warning"),
            MessageKind::Error => (Color::Red, "error"),
        };

        self.write_line(color, label, &format!("{args}"));

        if let Some(e) = err {
            for item in e.chain() {
                self.write_line(color, label, &format!("  {item}"));
            }
        }
    }

    fn dump_error_logs(&mut self, output: &[u8]) {
        self.write_line(
            Color::Red,
            "error",
            &format!("(raw output follows)\n{}", String::from_utf8_lossy(output)),
        );
    }
}
