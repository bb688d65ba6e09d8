//! Signal names and delivery to worker processes.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A POSIX signal that can be sent to a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signal(libc::c_int);

/// Signals accepted by name.
const NAMED: &[(&str, libc::c_int)] = &[
    ("HUP", libc::SIGHUP),
    ("INT", libc::SIGINT),
    ("QUIT", libc::SIGQUIT),
    ("KILL", libc::SIGKILL),
    ("USR1", libc::SIGUSR1),
    ("USR2", libc::SIGUSR2),
    ("TERM", libc::SIGTERM),
];

impl Signal {
    /// `SIGTERM`, the default shutdown signal.
    pub const TERM: Signal = Signal(libc::SIGTERM);
    /// `SIGKILL`, which a worker cannot catch or ignore.
    pub const KILL: Signal = Signal(libc::SIGKILL);
    /// `SIGINT`.
    pub const INT: Signal = Signal(libc::SIGINT);

    /// Raw signal number.
    pub fn as_raw(self) -> libc::c_int {
        self.0
    }

    /// Canonical short name (`"TERM"`), if the signal is one of the named ones.
    pub fn name(self) -> Option<&'static str> {
        NAMED
            .iter()
            .find(|(_, num)| *num == self.0)
            .map(|(name, _)| *name)
    }

    /// Send this signal to `pid`.
    pub fn send(self, pid: u32) -> Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| Error::Signal(format!("pid {} out of range", pid)))?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, self.0) };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::Signal(format!(
                "Failed to send {} to {}: {}",
                self,
                pid,
                std::io::Error::last_os_error()
            )))
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::TERM
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "SIG{}", name),
            None => write!(f, "signal {}", self.0),
        }
    }
}

impl FromStr for Signal {
    type Err = Error;

    /// Accepts `"TERM"`, `"SIGTERM"`, `"term"` or a bare number such as `"15"`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Ok(num) = trimmed.parse::<libc::c_int>() {
            if num > 0 {
                return Ok(Signal(num));
            }
            return Err(Error::Signal(format!("invalid signal number: {}", num)));
        }

        let upper = trimmed.to_ascii_uppercase();
        let short = upper.strip_prefix("SIG").unwrap_or(&upper);
        NAMED
            .iter()
            .find(|(name, _)| *name == short)
            .map(|(_, num)| Signal(*num))
            .ok_or_else(|| Error::Signal(format!("unknown signal name: {}", s)))
    }
}
