//! Console and file logging.
//!
//! Both layers share one filter: `debug` with `--verbose`, `info`
//! otherwise, and `RUST_LOG` overrides either.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// `logs/<document file name>_<YYYYmmddHHMMSS>.log`
pub fn log_file_path(document: &Path, now: DateTime<Local>) -> PathBuf {
    let name = document.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "loffice".to_string());
    PathBuf::from("logs")
        .join(format!("{name}_{}.log", now.format("%Y%m%d%H%M%S")))
}

pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("cannot create {}", dir.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            Some(fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("cannot install the log subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn log_file_is_named_after_document() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 17, 5, 1).unwrap();
        let path = log_file_path(Path::new("samples/invoice.doc"), now);
        assert_eq!(path, Path::new("logs").join("invoice.doc_20240309170501.log"));
    }
}
