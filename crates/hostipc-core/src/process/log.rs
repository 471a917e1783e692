//! Launch event log.
//!
//! Records one line per launched child so that process trees can be
//! reconstructed after the fact. The destination is chosen once, at startup,
//! from an environment variable.

use crate::config::ProcessConfig;
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Sink for launch events, injected into the launcher.
pub trait LaunchEventLog: Send + Sync {
    fn record_launch(&self, parent: Pid, child: Pid);

    fn flush(&self) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLog;

impl LaunchEventLog for NullLog {
    fn record_launch(&self, _parent: Pid, _child: Pid) {}
}

type Sink = Box<dyn Write + Send>;

/// Line-oriented log written to stderr or appended to a file.
pub struct EnvironmentLog {
    sink: Mutex<Option<Sink>>,
}

impl EnvironmentLog {
    /// Configure from `var`: unset or empty disables the log, `-` selects
    /// stderr, anything else is a file path opened for append.
    pub fn from_env(var: &str) -> Self {
        match std::env::var_os(var) {
            None => Self::disabled(),
            Some(value) if value.is_empty() => Self::disabled(),
            Some(value) if value == "-" => Self::stderr(),
            Some(value) => match Self::open(&value) {
                Ok(log) => log,
                Err(e) => {
                    warn!("Could not open process log {:?}: {}", value, e);
                    Self::disabled()
                }
            },
        }
    }

    /// Configure from `HOSTIPC_PROCESS_LOG`.
    pub fn from_default_env() -> Self {
        Self::from_env(ProcessConfig::PROCESS_LOG_ENV)
    }

    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        debug!("Process log appending to {}", path.as_ref().display());
        Ok(Self::with_sink(Box::new(file)))
    }

    pub fn stderr() -> Self {
        Self::with_sink(Box::new(io::stderr()))
    }

    pub fn disabled() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    fn with_sink(sink: Sink) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink
            .lock()
            .map(|sink| sink.is_some())
            .unwrap_or(false)
    }
}

impl LaunchEventLog for EnvironmentLog {
    fn record_launch(&self, parent: Pid, child: Pid) {
        let Ok(mut guard) = self.sink.lock() else {
            return;
        };
        if let Some(sink) = guard.as_mut() {
            if let Err(e) = writeln!(
                sink,
                "==> process {} launched child process {}",
                parent, child
            ) {
                debug!("Failed to write process log entry: {}", e);
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut guard) = self.sink.lock() {
            if let Some(sink) = guard.as_mut() {
                let _ = sink.flush();
            }
        }
    }
}

impl Drop for EnvironmentLog {
    fn drop(&mut self) {
        LaunchEventLog::flush(self);
    }
}

impl std::fmt::Debug for EnvironmentLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentLog")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_log_appends_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("process.log");

        {
            let log = EnvironmentLog::open(&path).unwrap();
            log.record_launch(Pid::from_raw(10), Pid::from_raw(11));
        }
        {
            let log = EnvironmentLog::open(&path).unwrap();
            log.record_launch(Pid::from_raw(10), Pid::from_raw(12));
            log.flush();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "==> process 10 launched child process 11\n\
             ==> process 10 launched child process 12\n"
        );
    }

    #[test]
    fn test_from_env_unset_is_disabled() {
        let log = EnvironmentLog::from_env("HOSTIPC_TEST_LOG_UNSET_VARIABLE");
        assert!(!log.is_enabled());
        log.record_launch(Pid::from_raw(1), Pid::from_raw(2));
    }

    #[test]
    fn test_from_env_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("from-env.log");
        std::env::set_var("HOSTIPC_TEST_LOG_PATH", &path);

        let log = EnvironmentLog::from_env("HOSTIPC_TEST_LOG_PATH");
        assert!(log.is_enabled());
        log.record_launch(Pid::from_raw(3), Pid::from_raw(4));
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("==> process 3 launched child process 4"));
    }

    #[test]
    fn test_from_env_dash_is_stderr() {
        std::env::set_var("HOSTIPC_TEST_LOG_DASH", "-");
        assert!(EnvironmentLog::from_env("HOSTIPC_TEST_LOG_DASH").is_enabled());
    }

    #[test]
    fn test_unopenable_path_disables() {
        std::env::set_var("HOSTIPC_TEST_LOG_BAD", "/nonexistent-dir/sub/process.log");
        assert!(!EnvironmentLog::from_env("HOSTIPC_TEST_LOG_BAD").is_enabled());
    }
}
