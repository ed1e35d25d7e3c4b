//! Syscall entry/exit pairing and event decoding.
//!
//! ptrace reports syscall entry and exit as two separate stops. The decoder
//! keeps one in-flight frame per tid, captures the arguments at entry and
//! produces a [`FileEvent`] at exit once the return value is known.
//!
//! The stop phase is taken from `PTRACE_GET_SYSCALL_INFO` where the kernel
//! supports it (5.3+). When the first query fails the decoder latches a
//! fallback to raw registers, inferring the phase from frame presence the
//! way classic tracers do.
//!
//! `close` is special: its fd must be resolved at entry, because by the
//! time the exit stop arrives the fd no longer exists.

use std::collections::HashMap;

use log::warn;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;

use super::event::FileEvent;
use super::resolve::{peek_string, resolve_at, resolve_fd};

/// One in-flight syscall for a tid, captured at the entry stop.
#[derive(Debug, Clone)]
struct SyscallFrame {
    nr: u64,
    args: [u64; 6],
    /// Path of the fd being closed, resolved before the close takes effect.
    close_path: Option<String>,
}

/// The two halves of a syscall-stop, as reported by the kernel.
#[derive(Debug)]
enum Phase {
    Entry { nr: u64, args: [u64; 6] },
    Exit { rval: i64 },
    /// Seccomp or otherwise uninteresting stop.
    Other,
}

/// Per-tid syscall state machine.
#[derive(Debug)]
pub struct SyscallDecoder {
    frames: HashMap<Pid, SyscallFrame>,
    use_syscall_info: bool,
}

impl Default for SyscallDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallDecoder {
    #[must_use]
    pub fn new() -> Self {
        SyscallDecoder { frames: HashMap::new(), use_syscall_info: true }
    }

    /// Handle one syscall-stop for `tid`, returning a decoded event when the
    /// stop completes a syscall the monitor cares about.
    pub fn handle_stop(&mut self, tid: Pid) -> nix::Result<Option<FileEvent>> {
        match self.query_phase(tid)? {
            Phase::Entry { nr, args } => {
                self.on_entry(tid, nr, args);
                Ok(None)
            }
            Phase::Exit { rval } => Ok(self.on_exit(tid, rval)),
            Phase::Other => Ok(None),
        }
    }

    /// Discard any in-flight frame for a tid that exited.
    pub fn forget(&mut self, tid: Pid) {
        self.frames.remove(&tid);
    }

    fn on_entry(&mut self, tid: Pid, nr: u64, args: [u64; 6]) {
        let close_path = if nr as i64 == libc::SYS_close {
            Some(resolve_fd(tid, fd_arg(args[0])))
        } else {
            None
        };
        if self
            .frames
            .insert(tid, SyscallFrame { nr, args, close_path })
            .is_some()
        {
            warn!("{tid}: syscall entry while another syscall is in flight, dropping stale frame");
        }
    }

    fn on_exit(&mut self, tid: Pid, rval: i64) -> Option<FileEvent> {
        let Some(frame) = self.frames.remove(&tid) else {
            warn!("{tid}: syscall exit without a matching entry");
            return None;
        };
        decode(tid, &frame, rval)
    }

    fn query_phase(&mut self, tid: Pid) -> nix::Result<Phase> {
        if self.use_syscall_info {
            match syscall_info(tid) {
                Ok(phase) => return Ok(phase),
                Err(Errno::EIO | Errno::EINVAL | Errno::ENOSYS) => {
                    self.use_syscall_info = false;
                    warn!("PTRACE_GET_SYSCALL_INFO unavailable, using registers");
                }
                Err(err) => return Err(err),
            }
        }
        // Register fallback: the kernel does not tell us which half this is,
        // so the phase alternates with frame presence.
        let regs = ptrace::getregs(tid)?;
        if self.frames.contains_key(&tid) {
            Ok(Phase::Exit { rval: regs.rax as i64 })
        } else {
            Ok(Phase::Entry {
                nr: regs.orig_rax,
                args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
            })
        }
    }
}

/// Decode a completed syscall into an event.
///
/// Only close survives a failed syscall: its path snapshot was taken at
/// entry and the fd is gone either way.
fn decode(tid: Pid, frame: &SyscallFrame, rval: i64) -> Option<FileEvent> {
    let nr = frame.nr as i64;
    let args = &frame.args;

    if nr == libc::SYS_close {
        return frame.close_path.clone().map(|path| FileEvent::Close { tid, path });
    }
    if rval < 0 {
        return None;
    }

    match nr {
        n if n == libc::SYS_read
            || n == libc::SYS_readv
            || n == libc::SYS_preadv
            || n == libc::SYS_preadv2
            || n == libc::SYS_pread64 =>
        {
            Some(FileEvent::Read {
                tid,
                path: resolve_fd(tid, fd_arg(args[0])),
                bytes: rval as u64,
            })
        }
        n if n == libc::SYS_write
            || n == libc::SYS_writev
            || n == libc::SYS_pwritev
            || n == libc::SYS_pwritev2
            || n == libc::SYS_pwrite64 =>
        {
            Some(FileEvent::Write {
                tid,
                path: resolve_fd(tid, fd_arg(args[0])),
                bytes: rval as u64,
            })
        }
        n if n == libc::SYS_creat
            || n == libc::SYS_open
            || n == libc::SYS_openat
            || n == libc::SYS_openat2 =>
        {
            Some(FileEvent::Open { tid, path: resolve_fd(tid, rval) })
        }
        n if n == libc::SYS_mmap => {
            let flags = args[3] as i64;
            if flags & i64::from(libc::MAP_ANONYMOUS) == 0 {
                Some(FileEvent::Map { tid, path: resolve_fd(tid, fd_arg(args[4])) })
            } else {
                None
            }
        }
        n if n == libc::SYS_rename || n == libc::SYS_renameat || n == libc::SYS_renameat2 => {
            let (dir_from, ptr_from, dir_to, ptr_to) = if n == libc::SYS_rename {
                (i64::from(libc::AT_FDCWD), args[0], i64::from(libc::AT_FDCWD), args[1])
            } else {
                (fd_arg(args[0]), args[1], fd_arg(args[2]), args[3])
            };
            let from = resolve_at(tid, dir_from, &peek_string(tid, ptr_from));
            let to = resolve_at(tid, dir_to, &peek_string(tid, ptr_to));
            Some(FileEvent::Rename { tid, from, to })
        }
        n if n == libc::SYS_unlink || n == libc::SYS_unlinkat => {
            let (dir, ptr) = if n == libc::SYS_unlink {
                (i64::from(libc::AT_FDCWD), args[0])
            } else {
                (fd_arg(args[0]), args[1])
            };
            Some(FileEvent::Unlink { tid, path: resolve_at(tid, dir, &peek_string(tid, ptr)) })
        }
        _ => None,
    }
}

/// Sign-extend a raw syscall argument into an fd (AT_FDCWD arrives as a
/// 32-bit negative value zero-extended to 64 bits).
fn fd_arg(raw: u64) -> i64 {
    i64::from(raw as i32)
}

/// Ask the kernel which half of a syscall this stop is.
fn syscall_info(tid: Pid) -> nix::Result<Phase> {
    let mut info: libc::ptrace_syscall_info = unsafe { std::mem::zeroed() };
    Errno::clear();
    // SAFETY: the kernel writes at most `size` bytes into `info`, which is
    // a properly aligned, zeroed ptrace_syscall_info.
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GET_SYSCALL_INFO,
            tid.as_raw(),
            std::mem::size_of::<libc::ptrace_syscall_info>(),
            std::ptr::addr_of_mut!(info),
        )
    };
    if ret < 0 {
        return Err(Errno::last());
    }
    match info.op {
        libc::PTRACE_SYSCALL_INFO_ENTRY => {
            // SAFETY: op == ENTRY selects the `entry` union member.
            let entry = unsafe { info.u.entry };
            Ok(Phase::Entry { nr: entry.nr, args: entry.args })
        }
        libc::PTRACE_SYSCALL_INFO_EXIT => {
            // SAFETY: op == EXIT selects the `exit` union member.
            let exit = unsafe { info.u.exit };
            Ok(Phase::Exit { rval: exit.sval })
        }
        _ => Ok(Phase::Other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::fd::AsRawFd;

    fn self_pid() -> Pid {
        nix::unistd::getpid()
    }

    fn frame(nr: i64, args: [u64; 6]) -> SyscallFrame {
        SyscallFrame { nr: nr as u64, args, close_path: None }
    }

    #[test]
    fn test_decode_write_resolves_fd_and_bytes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let expected = file.path().canonicalize().unwrap();
        let fd = u64::try_from(file.as_file().as_raw_fd()).unwrap();

        let ev = decode(self_pid(), &frame(libc::SYS_write, [fd, 0, 0, 0, 0, 0]), 5);
        match ev {
            Some(FileEvent::Write { path, bytes, .. }) => {
                assert_eq!(path, expected.to_string_lossy());
                assert_eq!(bytes, 5);
            }
            other => panic!("expected Write, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_failed_read_is_suppressed() {
        let ev = decode(self_pid(), &frame(libc::SYS_read, [3, 0, 0, 0, 0, 0]), -(libc::EBADF as i64));
        assert!(ev.is_none());
    }

    #[test]
    fn test_decode_open_resolves_returned_fd() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let expected = file.path().canonicalize().unwrap();
        let fd = i64::from(file.as_file().as_raw_fd());

        let ev = decode(self_pid(), &frame(libc::SYS_openat, [0, 0, 0, 0, 0, 0]), fd);
        match ev {
            Some(FileEvent::Open { path, .. }) => assert_eq!(path, expected.to_string_lossy()),
            other => panic!("expected Open, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_close_emits_entry_snapshot_even_on_failure() {
        let f = SyscallFrame {
            nr: libc::SYS_close as u64,
            args: [9, 0, 0, 0, 0, 0],
            close_path: Some("/tmp/snap".to_string()),
        };
        let ev = decode(self_pid(), &f, -(libc::EINTR as i64));
        assert_eq!(
            ev,
            Some(FileEvent::Close { tid: self_pid(), path: "/tmp/snap".to_string() })
        );
    }

    #[test]
    fn test_decode_anonymous_mmap_is_ignored() {
        let flags = (libc::MAP_ANONYMOUS | libc::MAP_PRIVATE) as u64;
        let ev = decode(
            self_pid(),
            &frame(libc::SYS_mmap, [0, 4096, 0, flags, u64::MAX, 0]),
            0x7f00_0000_0000,
        );
        assert!(ev.is_none());
    }

    #[test]
    fn test_decode_file_backed_mmap_emits_map() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let expected = file.path().canonicalize().unwrap();
        let fd = u64::try_from(file.as_file().as_raw_fd()).unwrap();
        let flags = libc::MAP_PRIVATE as u64;

        let ev = decode(
            self_pid(),
            &frame(libc::SYS_mmap, [0, 4096, 0, flags, fd, 0]),
            0x7f00_0000_0000,
        );
        match ev {
            Some(FileEvent::Map { path, .. }) => assert_eq!(path, expected.to_string_lossy()),
            other => panic!("expected Map, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unlink_peeks_and_joins_cwd() {
        // peek_string works against the calling process, so a pointer into
        // our own memory stands in for a tracee argument
        let rel = CString::new("some/victim").unwrap();
        let ev = decode(
            self_pid(),
            &frame(libc::SYS_unlink, [rel.as_ptr() as u64, 0, 0, 0, 0, 0]),
            0,
        );
        let cwd = std::env::current_dir().unwrap();
        match ev {
            Some(FileEvent::Unlink { path, .. }) => {
                assert_eq!(path, format!("{}/some/victim", cwd.to_string_lossy()));
            }
            other => panic!("expected Unlink, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rename_resolves_both_operands() {
        let from = CString::new("/tmp/a").unwrap();
        let to = CString::new("/tmp/b").unwrap();
        let ev = decode(
            self_pid(),
            &frame(libc::SYS_rename, [from.as_ptr() as u64, to.as_ptr() as u64, 0, 0, 0, 0]),
            0,
        );
        assert_eq!(
            ev,
            Some(FileEvent::Rename {
                tid: self_pid(),
                from: "/tmp/a".to_string(),
                to: "/tmp/b".to_string(),
            })
        );
    }

    #[test]
    fn test_decode_uninteresting_syscall_is_ignored() {
        assert!(decode(self_pid(), &frame(libc::SYS_getpid, [0; 6]), 1234).is_none());
    }

    #[test]
    fn test_entry_entry_drops_stale_frame() {
        let mut dec = SyscallDecoder::new();
        let tid = self_pid();
        dec.on_entry(tid, libc::SYS_getpid as u64, [1; 6]);
        dec.on_entry(tid, libc::SYS_getpid as u64, [2; 6]);
        // only the most recent frame survives
        assert_eq!(dec.frames.len(), 1);
        assert_eq!(dec.frames[&tid].args, [2; 6]);
    }

    #[test]
    fn test_exit_without_entry_is_ignored() {
        let mut dec = SyscallDecoder::new();
        assert!(dec.on_exit(self_pid(), 0).is_none());
    }

    #[test]
    fn test_close_entry_takes_snapshot() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let expected = file.path().canonicalize().unwrap();
        let fd = u64::try_from(file.as_file().as_raw_fd()).unwrap();

        let mut dec = SyscallDecoder::new();
        let tid = self_pid();
        dec.on_entry(tid, libc::SYS_close as u64, [fd, 0, 0, 0, 0, 0]);
        assert_eq!(
            dec.frames[&tid].close_path.as_deref(),
            Some(expected.to_string_lossy().as_ref())
        );

        // the snapshot survives the close failing
        let ev = dec.on_exit(tid, -(libc::EBADF as i64));
        assert!(matches!(ev, Some(FileEvent::Close { .. })));
        assert!(dec.frames.is_empty());
    }
}
