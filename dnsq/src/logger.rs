use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use parking_lot::Mutex;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Clone)]
struct TracingWriter {
    file_rotate: Arc<Mutex<FileRotate<AppendCount>>>,
}

impl io::Write for TracingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file_rotate.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file_rotate.lock().flush()
    }
}

fn env_filter(verbose: bool) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = if verbose { "debug" } else { "warn" };
    Ok(EnvFilter::new(format!("dnsq={level}"))
        .add_directive(format!("dnsquery={level}").parse()?)
        .add_directive("store=info".parse()?))
}

/// Logs to a rotated file when `log_path` is set, to stderr otherwise.
/// `RUST_LOG` overrides the default filter.
pub fn setup_logger(log_path: Option<&Path>, verbose: bool) -> Result<()> {
    let env_filter = env_filter(verbose)?;

    if let Some(log_path) = log_path {
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let logger = Arc::new(Mutex::new(FileRotate::new(
            log_path,
            AppendCount::new(20),
            ContentLimit::Lines(100_000),
            Compression::None,
            #[cfg(unix)]
            None,
        )));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(env_filter)
            .with_ansi(false)
            .with_writer(move || TracingWriter {
                file_rotate: logger.clone(),
            })
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("setting tracing default failed")?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .compact()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("setting tracing default failed")?;
    }
    Ok(())
}
