use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// How the wrapped program ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitOutcome {
    Code(i32),
    Signaled(i32),
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Code(code),
            (None, Some(signal)) => Self::Signaled(signal),
            (None, None) => Self::Code(1),
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Code(code) => Some(*code),
            Self::Signaled(_) => None,
        }
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            Self::Code(_) => None,
            Self::Signaled(signal) => Some(*signal),
        }
    }

    /// Status a shell would report: the code itself, or `128 + n`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Code(code) => *code,
            Self::Signaled(signal) => 128 + signal,
        }
    }

    /// Leave the current process the way the child left: same exit code,
    /// or death by the same signal with its default disposition.
    pub fn propagate(self) -> ! {
        if let Self::Signaled(signal) = self {
            unsafe {
                libc::signal(signal, libc::SIG_DFL);
                let mut set = std::mem::zeroed::<libc::sigset_t>();
                libc::sigemptyset(&mut set);
                libc::sigaddset(&mut set, signal);
                libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
                libc::raise(signal);
            }
        }
        // Reached for exit codes and for signals whose default is to continue.
        std::process::exit(self.exit_code())
    }
}
