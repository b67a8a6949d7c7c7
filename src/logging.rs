//! Tracing setup for the docvault server.
//!
//! Two sinks are installed: a compact stdout layer for operators and a non-blocking file layer
//! that also records span close events, so every `ingest` and `search` leaves one timed line
//! tagged with its session id. `DOCVAULT_LOG_FILE` selects a fixed file; otherwise logs roll
//! daily under `logs/`.
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::Span;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, fmt::format::FmtSpan, prelude::*};
use uuid::Uuid;

/// Directives used when `RUST_LOG` is absent or unparsable.
///
/// The PDF crates report every recoverable parse oddity, which drowns out ingestion events
/// on real-world uploads.
pub const DEFAULT_DIRECTIVES: &str = "info,lopdf=warn,pdf_extract=error,hyper=warn";

const LOG_DIR: &str = "logs";
const LOG_FILE_PREFIX: &str = "docvault.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Call once, before the server starts.
pub fn init_tracing() {
    let directives = resolve_directives(std::env::var("RUST_LOG").ok().as_deref());
    let stdout_layer = fmt::layer().with_target(false).compact();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::new(directives))
        .with(stdout_layer);

    match open_file_writer(file_target(std::env::var("DOCVAULT_LOG_FILE").ok())) {
        Some(writer) => {
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE)
                .compact();
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }
}

/// Span wrapping one session-scoped operation.
///
/// Events emitted inside carry `session_id` without repeating it at each call site.
pub fn session_span(operation: &'static str, session_id: Uuid) -> Span {
    tracing::info_span!("session", op = operation, session_id = %session_id)
}

/// Pick the filter directives, falling back to [`DEFAULT_DIRECTIVES`] on a bad `RUST_LOG`.
fn resolve_directives(from_env: Option<&str>) -> String {
    match from_env.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) if EnvFilter::try_new(value).is_ok() => value.to_string(),
        Some(value) => {
            eprintln!("Ignoring invalid RUST_LOG value {value:?}");
            DEFAULT_DIRECTIVES.to_string()
        }
        None => DEFAULT_DIRECTIVES.to_string(),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FileTarget {
    Fixed(PathBuf),
    DailyRolling { dir: PathBuf, prefix: &'static str },
}

fn file_target(configured: Option<String>) -> FileTarget {
    match configured.filter(|path| !path.trim().is_empty()) {
        Some(path) => FileTarget::Fixed(PathBuf::from(path)),
        None => FileTarget::DailyRolling {
            dir: PathBuf::from(LOG_DIR),
            prefix: LOG_FILE_PREFIX,
        },
    }
}

/// Returns `None` when the target cannot be opened; stdout logging still works.
fn open_file_writer(target: FileTarget) -> Option<NonBlocking> {
    let (non_blocking, guard) = match target {
        FileTarget::Fixed(path) => {
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
            {
                Ok(file) => tracing_appender::non_blocking(file),
                Err(err) => {
                    eprintln!("Failed to open log file {}: {err}", path.display());
                    return None;
                }
            }
        }
        FileTarget::DailyRolling { dir, prefix } => {
            if let Err(err) = std::fs::create_dir_all(&dir) {
                eprintln!("Failed to create log directory {}: {err}", dir.display());
                return None;
            }
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, prefix))
        }
    };
    let _ = LOG_GUARD.set(guard);
    Some(non_blocking)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_parse_and_quiet_pdf_crates() {
        assert!(EnvFilter::try_new(DEFAULT_DIRECTIVES).is_ok());
        assert!(DEFAULT_DIRECTIVES.contains("lopdf=warn"));
        assert!(DEFAULT_DIRECTIVES.contains("pdf_extract=error"));
    }

    #[test]
    fn rust_log_overrides_unless_invalid() {
        assert_eq!(resolve_directives(Some("docvault=debug")), "docvault=debug");
        assert_eq!(resolve_directives(None), DEFAULT_DIRECTIVES);
        assert_eq!(resolve_directives(Some("   ")), DEFAULT_DIRECTIVES);
        assert_eq!(resolve_directives(Some("docvault=loud")), DEFAULT_DIRECTIVES);
    }

    #[test]
    fn log_file_env_selects_fixed_path() {
        assert_eq!(
            file_target(Some("/var/log/docvault.log".into())),
            FileTarget::Fixed(PathBuf::from("/var/log/docvault.log"))
        );
        assert_eq!(
            file_target(None),
            FileTarget::DailyRolling {
                dir: PathBuf::from("logs"),
                prefix: "docvault.log"
            }
        );
    }

    #[test]
    fn fixed_log_file_is_created() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("service.log");
        assert!(open_file_writer(FileTarget::Fixed(path.clone())).is_some());
        assert!(path.is_file());
    }

    #[test]
    fn session_span_records_operation_and_id() {
        let id = Uuid::new_v4();
        tracing::subscriber::with_default(tracing_subscriber::registry(), || {
            let span = session_span("ingest", id);
            let metadata = span.metadata().expect("span enabled");
            assert_eq!(metadata.name(), "session");
            assert!(metadata.fields().field("session_id").is_some());
            assert!(metadata.fields().field("op").is_some());
        });
    }
}
