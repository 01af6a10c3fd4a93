// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Logging glue: [`tracing`] layer setup plus a reopenable file writer.
//!
//! The server rotates logs in place on `USR1` / the `Reopen` channel
//! command: the writer re-opens its path and swaps the fd under a lock, so
//! neither the master nor the workers restart to pick up a rotated file.

use std::{fs::{File, OpenOptions},
          io::Write,
          path::{Path, PathBuf},
          sync::{Arc, Mutex}};

use miette::IntoDiagnostic;
use tracing_subscriber::{Layer, fmt::MakeWriter, layer::SubscriberExt,
                         util::SubscriberInitExt};

/// A `MakeWriter` whose underlying file can be re-opened at runtime.
#[derive(Debug, Clone)]
pub struct ReopenableWriter {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl ReopenableWriter {
    /// Open (appending, creating) the log file.
    ///
    /// # Errors
    ///
    /// Propagates the open failure.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = open_append(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Re-open the path and swap the fd in place.
    ///
    /// # Errors
    ///
    /// Propagates the open failure; the old fd stays installed on error.
    pub fn reopen(&self) -> std::io::Result<()> {
        let fresh = open_append(&self.path)?;
        let mut guard = self.file.lock().expect("log writer lock poisoned");
        *guard = fresh;
        Ok(())
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// The writer handed to tracing for each event.
#[derive(Debug)]
pub struct ReopenableWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for ReopenableWriterGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file
            .lock()
            .expect("log writer lock poisoned")
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file
            .lock()
            .expect("log writer lock poisoned")
            .flush()
    }
}

impl<'a> MakeWriter<'a> for ReopenableWriter {
    type Writer = ReopenableWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        ReopenableWriterGuard {
            file: self.file.clone(),
        }
    }
}

/// Install the tracing subscriber: a compact stderr layer, plus a file
/// layer when `error_log` is configured.
///
/// Returns the file writer so the signal plumbing can
/// [`reopen`](ReopenableWriter::reopen) it.
///
/// # Errors
///
/// Returns an error if the log file cannot be opened or a subscriber is
/// already installed.
pub fn try_init_tracing(
    error_log: Option<&Path>,
    filter: tracing::level_filters::LevelFilter,
) -> miette::Result<Option<ReopenableWriter>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);

    match error_log {
        Some(path) => {
            let writer = ReopenableWriter::open(path).into_diagnostic()?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer.clone())
                .with_ansi(false)
                .with_filter(filter);
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
                .into_diagnostic()?;
            Ok(Some(writer))
        }
        None => {
            tracing_subscriber::registry()
                .with(stderr_layer)
                .try_init()
                .into_diagnostic()?;
            Ok(None)
        }
    }
}
