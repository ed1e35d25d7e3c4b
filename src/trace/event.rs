//! Typed file-I/O events emitted by the tracer.
//!
//! Events are the only data crossing the tracer→aggregator boundary. Paths
//! are already absolute and normalised when an event is enqueued; fds that
//! could not be resolved carry a `*`-prefixed sentinel path instead.

use nix::unistd::Pid;

/// One observed file-descriptor-centric syscall, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// A new fd was created for `path` (creat/open/openat/openat2).
    Open { tid: Pid, path: String },
    /// An fd for `path` was closed; the path was resolved at syscall entry,
    /// before the fd became invalid.
    Close { tid: Pid, path: String },
    /// `bytes` were read from `path`.
    Read { tid: Pid, path: String, bytes: u64 },
    /// `bytes` were written to `path`.
    Write { tid: Pid, path: String, bytes: u64 },
    /// `path` was memory-mapped (file-backed mmap only).
    Map { tid: Pid, path: String },
    /// `from` was renamed to `to`; both resolved against the per-call dirfd.
    Rename { tid: Pid, from: String, to: String },
    /// `path` was unlinked.
    Unlink { tid: Pid, path: String },
}

impl FileEvent {
    /// The thread that issued the syscall.
    #[must_use]
    pub fn tid(&self) -> Pid {
        match *self {
            FileEvent::Open { tid, .. }
            | FileEvent::Close { tid, .. }
            | FileEvent::Read { tid, .. }
            | FileEvent::Write { tid, .. }
            | FileEvent::Map { tid, .. }
            | FileEvent::Rename { tid, .. }
            | FileEvent::Unlink { tid, .. } => tid,
        }
    }
}
