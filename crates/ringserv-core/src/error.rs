//! ringserv error types.

use std::fmt;

#[derive(Debug)]
pub enum ServError {
    /// io_uring setup failed.
    RingSetup(i32),
    /// io_uring submission failed.
    RingSubmit(i32),
    /// Submission queue full even after a flush-and-retry.
    SqFull,
    /// Listener socket setup failed (socket/bind/listen/setsockopt).
    ListenerSetup(std::io::Error),
    /// The running kernel's io_uring does not support a required opcode.
    OpcodeUnsupported(&'static str),
    /// OS error with errno.
    Os(i32),
}

impl fmt::Display for ServError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RingSetup(e) => write!(f, "io_uring setup: errno {}", e),
            Self::RingSubmit(e) => write!(f, "io_uring submit: errno {}", e),
            Self::SqFull => write!(f, "submission queue full"),
            Self::ListenerSetup(e) => write!(f, "listener setup: {}", e),
            Self::OpcodeUnsupported(op) => write!(f, "kernel lacks io_uring opcode {}", op),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for ServError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ListenerSetup(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ServError {
    fn from(e: std::io::Error) -> Self {
        Self::Os(e.raw_os_error().unwrap_or(-1))
    }
}

pub type Result<T> = std::result::Result<T, ServError>;
