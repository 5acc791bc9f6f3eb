use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

const MAX_LOG_FILES_PER_MODEL: usize = 10;

/// Process-wide diagnostic logging, independent of the per-model log files
/// below. Level is whatever `program.log_level`/`LOG_LEVEL` resolves to at
/// the point this is called; call once, before anything else runs.
pub fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Reads `LOG_LEVEL` for the bootstrap window before a config file has been
/// loaded (config's own `log_level` wins once it loads).
pub fn bootstrap_log_level() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

pub fn safe_name(model_name: &str) -> String {
    model_name.replace([':', '/', '\\'], "_")
}

/// Captures a model's own child-process stdout/stderr into a rotating text
/// log file, and fans the same lines out to any live `/logs/stream`
/// subscribers. A file is opened once per `start_model` attempt; retention
/// keeps the 10 most recent files per model.
pub struct ModelLogWriter {
    file: File,
    broadcaster: broadcast::Sender<String>,
}

impl ModelLogWriter {
    pub fn open(logs_root: &Path, model_name: &str) -> std::io::Result<Self> {
        let dir = logs_root.join("model_logs").join(safe_name(model_name));
        fs::create_dir_all(&dir)?;
        rotate(&dir)?;

        let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("{timestamp}.log"));
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(
            file,
            "=== Log Start: {model_name} at {} ===",
            Utc::now().to_rfc3339()
        )?;

        let (tx, _rx) = broadcast::channel(256);
        Ok(Self {
            file,
            broadcaster: tx,
        })
    }

    pub fn write_line(&mut self, stream: &str, text: &str) {
        let timestamp = Utc::now().format("%H:%M:%S");
        let line = format!("[{timestamp}] [{stream}] {text}");
        let _ = writeln!(self.file, "{line}");
        // No receivers is the common case; broadcast::send only errors then.
        let _ = self.broadcaster.send(line);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.broadcaster.subscribe()
    }
}

fn rotate(dir: &Path) -> std::io::Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("log"))
        .collect();
    entries.sort_by_key(|p| fs::metadata(p).and_then(|m| m.modified()).ok());

    while entries.len() >= MAX_LOG_FILES_PER_MODEL {
        let oldest = entries.remove(0);
        let _ = fs::remove_file(oldest);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_name_replaces_path_separators_and_colons() {
        assert_eq!(safe_name("org/model:v1\\x"), "org_model_v1_x");
    }

    #[test]
    fn rotation_keeps_at_most_ten_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let logs_root = dir.path();
        for i in 0..15 {
            let mut writer = ModelLogWriter::open(logs_root, "m").unwrap();
            writer.write_line("stdout", &format!("line {i}"));
            // ensure distinct mtimes across iterations on coarse filesystems
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let dir_path = logs_root.join("model_logs").join("m");
        let count = fs::read_dir(&dir_path).unwrap().count();
        assert!(count <= MAX_LOG_FILES_PER_MODEL, "count was {count}");
    }
}
