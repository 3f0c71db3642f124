use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

/// Keeps the log file handle alive for the lifetime of the process.
pub struct LogGuard {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

impl LogGuard {
    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub level: String,
    pub log_dir: Option<PathBuf>,
    pub stderr: bool,
    pub component: String,
}

impl LogSettings {
    pub fn from_env(component: &str) -> Self {
        Self {
            level: resolve_log_level(),
            log_dir: resolve_log_dir(),
            stderr: resolve_log_stderr(),
            component: component.to_string(),
        }
    }
}

/// The terminal belongs to the renderer, so logs go to a file and only to
/// stderr when asked for.
pub fn init_logging(settings: &LogSettings) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.clone()));
    let guard = match open_log_file(settings.log_dir.as_ref(), &settings.component) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let stderr_enabled = settings.stderr;
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), stderr_enabled));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

struct MultiWriter {
    stderr_enabled: bool,
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<StdMutex<std::fs::File>>>, stderr_enabled: bool) -> Self {
        Self {
            stderr_enabled,
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stderr_enabled {
            let _ = io::stderr().write_all(buf);
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stderr_enabled {
            let _ = io::stderr().flush();
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: Option<&PathBuf>, component: &str) -> io::Result<LogGuard> {
    let Some(dir) = log_dir else {
        return Ok(LogGuard { file: None });
    };
    if std::fs::create_dir_all(dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join(format!("codeverse-{}.log", sanitize_component(component)));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(StdMutex::new(file))),
    })
}

fn sanitize_component(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "cli".to_string()
    } else {
        cleaned
    }
}

fn resolve_log_level() -> String {
    if let Ok(value) = env::var("CODEVERSE_LOG_LEVEL") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "info".to_string()
}

fn resolve_log_dir() -> Option<PathBuf> {
    if let Ok(value) = env::var("CODEVERSE_LOG_DIR") {
        let trimmed = value.trim();
        if trimmed == "-" || trimmed.eq_ignore_ascii_case("off") {
            return None;
        }
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    dirs::home_dir().map(|home| home.join(".codeverse").join("logs"))
}

fn resolve_log_stderr() -> bool {
    if let Ok(value) = env::var("CODEVERSE_LOG_STDERR") {
        match value.trim() {
            "1" | "true" | "TRUE" | "yes" | "YES" => return true,
            "0" | "false" | "FALSE" | "no" | "NO" => return false,
            _ => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_component_replaces_path_characters() {
        assert_eq!(sanitize_component("chat/../repl"), "chat____repl");
        assert_eq!(sanitize_component(""), "cli");
        assert_eq!(sanitize_component("sync-watch_1"), "sync-watch_1");
    }

    #[test]
    fn log_file_is_created_in_requested_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_dir = dir.path().join("logs");
        let guard = open_log_file(Some(&log_dir), "chat").expect("open");
        assert!(guard.has_file());
        assert!(log_dir.join("codeverse-chat.log").exists());

        let none = open_log_file(None, "chat").expect("no dir");
        assert!(!none.has_file());
    }
}
