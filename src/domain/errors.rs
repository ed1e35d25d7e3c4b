//! Structured error types for fiotop
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Only errors that abort the program live here; recoverable per-tid ptrace
//! failures are logged at the call site and the tid is dropped instead.

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Process {0} has no traceable threads")]
    NoThreads(Pid),

    #[error("Failed to read /proc/{pid}/task: {source}")]
    TaskDirUnreadable { pid: Pid, source: std::io::Error },

    #[error("Failed to attach to thread {tid}: {source}")]
    AttachFailed { tid: Pid, source: Errno },

    #[error("Failed to fork tracee: {0}")]
    ForkFailed(Errno),

    #[error("Command line is empty or contains an interior NUL byte")]
    BadCmdline,

    #[error("Unexpected wait status for tracee {pid}: {status:?}")]
    UnexpectedStop { pid: Pid, status: nix::sys::wait::WaitStatus },

    #[error("ptrace ({op}) failed for {tid}: {source}")]
    PtraceFailed { op: &'static str, tid: Pid, source: Errno },

    #[error("waitpid failed: {0}")]
    WaitFailed(Errno),

    #[error("Failed to install signal handler: {0}")]
    SignalHandler(Errno),
}
