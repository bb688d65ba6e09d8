//! Pool and worker launch configuration.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ipc::DEFAULT_MAX_FRAME_LEN;
use crate::signal::Signal;

/// Environment variable that overrides worker binary discovery.
pub const WORKER_PATH_ENV: &str = "GALLEY_WORKER_PATH";

/// How to start one worker process.
///
/// The program is an entrypoint binary with the handler compiled in; it must
/// call [`crate::serve_stdin`] with the same codec the pool uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    /// Run `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Find a worker binary by name.
    ///
    /// Looks in the following order:
    /// 1. `GALLEY_WORKER_PATH` environment variable
    /// 2. Same directory as the current executable
    /// 3. Parent of that directory (test binaries live in `target/*/deps`)
    /// 4. System PATH
    pub fn locate(name: &str) -> Result<Self> {
        if let Some(path) = std::env::var_os(WORKER_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Self::new(path));
            }
            tracing::warn!(
                "{} points at {}, which does not exist",
                WORKER_PATH_ENV,
                path.display()
            );
        }

        let file_name = if cfg!(windows) {
            format!("{}.exe", name)
        } else {
            name.to_string()
        };

        if let Ok(exe_path) = std::env::current_exe()
            && let Some(exe_dir) = exe_path.parent()
        {
            let candidates = [Some(exe_dir), exe_dir.parent()];
            for dir in candidates.into_iter().flatten() {
                let path = dir.join(&file_name);
                if path.is_file() {
                    return Ok(Self::new(path));
                }
            }
        }

        if let Ok(path) = which::which(&file_name) {
            return Ok(Self::new(path));
        }

        Err(Error::Spawn(format!(
            "Could not find {} binary. Set {} or ensure it's in PATH.",
            name, WORKER_PATH_ENV
        )))
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the worker.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Path of the worker binary.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments passed to the worker.
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// Extra environment for the worker.
    pub fn environment(&self) -> &[(OsString, OsString)] {
        &self.env
    }
}

/// Configuration for a [`crate::Pool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker entrypoint.
    pub worker: WorkerCommand,
    /// Workers to spawn before `Pool::new` returns.
    pub worker_count: Option<usize>,
    /// Signal `Pool::shutdown` sends to every worker.
    pub shutdown_signal: Signal,
    /// Largest frame accepted or sent on any worker connection.
    pub max_frame_len: usize,
    /// How long `spawn` waits for a worker's readiness announcement.
    /// `None` waits forever.
    pub handshake_timeout: Option<Duration>,
}

impl PoolConfig {
    /// Configuration with defaults and no initial workers.
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            worker,
            worker_count: None,
            shutdown_signal: Signal::TERM,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            handshake_timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Spawn `count` workers at construction.
    pub fn workers(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    /// Signal used by `shutdown`.
    pub fn shutdown_signal(mut self, signal: Signal) -> Self {
        self.shutdown_signal = signal;
        self
    }

    /// Frame size limit.
    pub fn max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::new(WorkerCommand::new("galley-worker"));
        assert_eq!(config.worker_count, None);
        assert_eq!(config.shutdown_signal, Signal::TERM);
        assert_eq!(config.max_frame_len, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(config.handshake_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_pool_config_builders() {
        let config = PoolConfig::new(WorkerCommand::new("w"))
            .workers(3)
            .shutdown_signal(Signal::KILL)
            .max_frame_len(1024)
            .handshake_timeout(None);
        assert_eq!(config.worker_count, Some(3));
        assert_eq!(config.shutdown_signal, Signal::KILL);
        assert_eq!(config.max_frame_len, 1024);
        assert_eq!(config.handshake_timeout, None);
    }

    #[test]
    fn test_worker_command_builders() {
        let command = WorkerCommand::new("/usr/bin/galley-worker")
            .arg("--handler")
            .args(["identity", "--codec", "json"])
            .env("RUST_LOG", "debug");
        assert_eq!(command.program(), Path::new("/usr/bin/galley-worker"));
        assert_eq!(command.arguments().len(), 4);
        assert_eq!(command.environment()[0].0, OsString::from("RUST_LOG"));
    }

    #[test]
    fn test_locate_from_path() {
        // `sh` is on PATH everywhere these tests run.
        let command = WorkerCommand::locate("sh").unwrap();
        assert!(command.program().ends_with("sh"));
    }

    #[test]
    fn test_locate_missing() {
        let err = WorkerCommand::locate("galley-no-such-worker").unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }
}
