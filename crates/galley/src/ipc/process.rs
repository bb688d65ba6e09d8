//! Launching worker processes and managing their lifetime from the pool side.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, ExitStatus, Stdio};

use crate::error::{Error, Result};
use crate::pool::WorkerCommand;
use crate::signal::Signal;

/// A running worker process, as seen by the pool.
///
/// Holds the `Child` for reaping. The connection to the worker is not kept
/// here; it belongs to the worker's dispatcher thread.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    exit_status: Option<ExitStatus>,
}

/// Launch a worker process connected to the returned stream.
///
/// A socket pair is created and one end becomes the child's stdin; the
/// parent's copy of that end is closed before this function returns, so the
/// returned stream reports end of file as soon as the worker exits.
pub fn launch(command: &WorkerCommand) -> Result<(WorkerProcess, UnixStream)> {
    let (parent_end, child_end) = UnixStream::pair()
        .map_err(|e| Error::Spawn(format!("Failed to create socket pair: {}", e)))?;

    // The Command owns the child end and drops it when this block ends.
    let child = {
        let mut cmd = Command::new(command.program());
        cmd.args(command.arguments())
            .envs(command.environment().iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::from(OwnedFd::from(child_end)))
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit()); // Worker logs go to the parent's stderr
        cmd.spawn().map_err(|e| {
            Error::Spawn(format!(
                "Failed to spawn worker process '{}': {}",
                command.program().display(),
                e
            ))
        })?
    };

    tracing::debug!(
        "Launched worker process {} from {}",
        child.id(),
        command.program().display()
    );

    Ok((
        WorkerProcess {
            child,
            exit_status: None,
        },
        parent_end,
    ))
}

impl WorkerProcess {
    /// Process id of the worker.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Send a signal to the worker.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if self.exit_status.is_some() {
            return Err(Error::Signal(format!(
                "worker {} has already been reaped",
                self.pid()
            )));
        }
        signal.send(self.pid())
    }

    /// Reap the worker if it has exited, without blocking.
    pub fn try_reap(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.exit_status = Some(status),
                Ok(None) => {}
                Err(e) => tracing::debug!("try_wait on worker {} failed: {}", self.pid(), e),
            }
        }
        self.exit_status
    }

    /// Check if the worker process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.try_reap().is_none()
    }

    /// Exit status, if the worker has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Kill a worker that never became usable and wait for it.
    pub(crate) fn abandon(&mut self) {
        if self.exit_status.is_some() {
            return;
        }
        if let Err(e) = self.child.kill() {
            tracing::debug!("Failed to kill worker {}: {}", self.pid(), e);
        }
        match self.child.wait() {
            Ok(status) => self.exit_status = Some(status),
            Err(e) => tracing::warn!("Failed to reap worker {}: {}", self.pid(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;

    fn wait_for_exit(process: &mut WorkerProcess) -> Option<ExitStatus> {
        for _ in 0..100 {
            if let Some(status) = process.try_reap() {
                return Some(status);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        None
    }

    #[test]
    fn test_child_receives_socket_on_stdin() {
        // The child writes what it reads back onto fd 0, which only works if
        // fd 0 is the bidirectional socket.
        let command = WorkerCommand::new("sh").args(["-c", "head -c 5 >&0"]);
        let (mut process, mut stream) = launch(&command).unwrap();
        assert!(process.pid() > 0);

        stream.write_all(b"hello").unwrap();
        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"hello");

        assert!(wait_for_exit(&mut process).unwrap().success());
    }

    #[test]
    fn test_stream_sees_eof_after_exit() {
        let command = WorkerCommand::new("true");
        let (mut process, mut stream) = launch(&command).unwrap();
        wait_for_exit(&mut process).unwrap();

        let mut buf = Vec::new();
        assert_eq!(stream.read_to_end(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_signal_and_reap() {
        let command = WorkerCommand::new("sleep").arg("60");
        let (mut process, _stream) = launch(&command).unwrap();
        assert!(process.is_alive());

        process.signal(Signal::TERM).unwrap();
        let status = wait_for_exit(&mut process).expect("worker did not exit");
        assert!(!status.success());
        assert!(process.signal(Signal::TERM).is_err());
    }

    #[test]
    fn test_abandon() {
        let command = WorkerCommand::new("sleep").arg("60");
        let (mut process, _stream) = launch(&command).unwrap();
        process.abandon();
        assert!(process.exit_status().is_some());
        assert!(!process.is_alive());
    }

    #[test]
    fn test_missing_program() {
        let command = WorkerCommand::new("/nonexistent/galley-worker");
        let err = launch(&command).unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
    }
}
