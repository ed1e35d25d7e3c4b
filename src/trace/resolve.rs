//! Path resolution for tracee file descriptors.
//!
//! Every resolver is a pure function of a task id plus an fd or a
//! dirfd/relative-path pair, answered from the `/proc/<tid>/` views the
//! kernel maintains for the tracee. Resolution never fails: unresolvable
//! fds map to the `*INVALID FD*` sentinel so downstream aggregation treats
//! them like any other path.
//!
//! Resolution goes through the tid that issued the syscall rather than the
//! main pid. Threads share one fd table, so the answer is identical, and
//! forked children whose tables have diverged resolve correctly.

use std::io::IoSliceMut;
use std::path::Path;

use log::{debug, warn};
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use regex::Regex;

/// Sentinel for fds that cannot be resolved (negative, closed, readlink failure).
pub const INVALID_FD: &str = "*INVALID FD*";

const STD_FDS: [&str; 3] = ["*STDIN*", "*STDOUT*", "*STDERR*"];

const PATH_MAX: usize = libc::PATH_MAX as usize;

/// Resolve an fd to an absolute path via `/proc/<tid>/fd/<fd>`.
///
/// fds 0-2 map to fixed `*STDIN*`/`*STDOUT*`/`*STDERR*` sentinels rather
/// than the tty device, which would lump unrelated console traffic into
/// one row.
#[must_use]
pub fn resolve_fd(tid: Pid, fd: i64) -> String {
    if fd < 0 {
        return INVALID_FD.to_string();
    }
    if fd <= 2 {
        return STD_FDS[fd as usize].to_string();
    }
    read_link_or_sentinel(&format!("/proc/{tid}/fd/{fd}"))
}

/// Resolve a `(dirfd, relative path)` pair as the `*at` syscalls do.
///
/// Absolute paths pass through untouched; `AT_FDCWD` resolves against the
/// tracee's `/proc/<tid>/cwd`. An empty relative path propagates as empty
/// (the aggregator drops it).
#[must_use]
pub fn resolve_at(tid: Pid, dirfd: i64, rel: &str) -> String {
    if rel.is_empty() || rel.starts_with('/') {
        return rel.to_string();
    }
    let dir = if dirfd == i64::from(libc::AT_FDCWD) {
        read_link_or_sentinel(&format!("/proc/{tid}/cwd"))
    } else {
        resolve_fd(tid, dirfd)
    };
    if dir.is_empty() {
        return rel.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), rel)
}

static CURRENT_DIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"/\./").unwrap());
static PARENT_DIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"/[^./]+/\.\./").unwrap());

/// Collapse `/./` and `/<seg>/../` segments until a fixpoint is reached.
///
/// `<seg>` must not itself contain a dot, so `/a./../` is left alone. The
/// rewrite is purely lexical; symlinks are not chased.
#[must_use]
pub fn normalize(path: &str) -> String {
    let mut s = path.to_string();
    while CURRENT_DIR.is_match(&s) {
        s = CURRENT_DIR.replace_all(&s, "/").into_owned();
    }
    while PARENT_DIR.is_match(&s) {
        s = PARENT_DIR.replace_all(&s, "/").into_owned();
    }
    s
}

/// Read the tracee's command line, with argv separators rewritten to spaces.
#[must_use]
pub fn cmdline(pid: Pid) -> String {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).unwrap_or_default();
    let text: String =
        raw.iter().map(|&b| if b == 0 { ' ' } else { char::from(b) }).collect();
    text.trim_end().to_string()
}

/// Read a NUL-terminated string from the tracee's address space.
///
/// Prefers `process_vm_readv` in page-bounded chunks; falls back to
/// word-by-word `PTRACE_PEEKDATA` when the vm-readv interface is denied.
/// Returns an empty string on failure, which callers treat as an
/// undecodable path.
#[must_use]
pub fn peek_string(tid: Pid, addr: u64) -> String {
    if addr == 0 {
        return String::new();
    }
    match peek_vm(tid, addr) {
        Ok(s) => s,
        Err(nix::errno::Errno::EPERM | nix::errno::Errno::ENOSYS) => {
            debug!("process_vm_readv unavailable for {tid}, falling back to PEEKDATA");
            peek_words(tid, addr)
        }
        Err(err) => {
            warn!("process_vm_readv failed for {tid}: {err}");
            String::new()
        }
    }
}

/// Chunked `process_vm_readv` terminating at NUL or `PATH_MAX`.
///
/// Chunks never cross a page boundary: the string may end just before an
/// unmapped page, and a straddling read would fault the whole request.
fn peek_vm(tid: Pid, addr: u64) -> nix::Result<String> {
    const CHUNK: usize = 256;
    let page = page_size();
    let mut out: Vec<u8> = Vec::new();
    let mut addr = addr as usize;

    while out.len() < PATH_MAX {
        let len = CHUNK.min(page - addr % page).min(PATH_MAX - out.len());
        let mut local = [0u8; CHUNK];
        let mut local_iov = [IoSliceMut::new(&mut local[..len])];
        let remote_iov = [RemoteIoVec { base: addr, len }];
        let n = process_vm_readv(tid, &mut local_iov, &remote_iov)?;
        if n == 0 {
            break;
        }
        if let Some(nul) = local[..n].iter().position(|&b| b == 0) {
            out.extend_from_slice(&local[..nul]);
            return Ok(String::from_utf8_lossy(&out).into_owned());
        }
        out.extend_from_slice(&local[..n]);
        addr += n;
    }
    out.truncate(PATH_MAX - 1);
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// `PTRACE_PEEKDATA` fallback, one machine word at a time.
fn peek_words(tid: Pid, addr: u64) -> String {
    const WORD: usize = std::mem::size_of::<libc::c_long>();
    let mut out: Vec<u8> = Vec::with_capacity(64);
    let mut addr = addr as usize;

    while out.len() < PATH_MAX {
        let word = match nix::sys::ptrace::read(tid, addr as *mut libc::c_void) {
            Ok(w) => w,
            Err(err) => {
                warn!("ptrace (PEEKDATA) failed for {tid}: {err}");
                return String::new();
            }
        };
        let bytes = word.to_ne_bytes();
        if let Some(nul) = bytes.iter().position(|&b| b == 0) {
            out.extend_from_slice(&bytes[..nul]);
            break;
        }
        out.extend_from_slice(&bytes);
        addr += WORD;
    }
    out.truncate(PATH_MAX - 1);
    String::from_utf8_lossy(&out).into_owned()
}

fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// Readlink with the kernel's ` (deleted)` marker stripped.
///
/// The suffix is only stripped when no file by the literal marked name
/// exists; a file really called `x (deleted)` keeps its name.
fn read_link_or_sentinel(link: &str) -> String {
    match std::fs::read_link(link) {
        Ok(target) => {
            let target = target.to_string_lossy().into_owned();
            const DELETED: &str = " (deleted)";
            if target.ends_with(DELETED) && !Path::new(&target).exists() {
                target[..target.len() - DELETED.len()].to_string()
            } else {
                target
            }
        }
        Err(err) => {
            debug!("readlink {link}: {err}");
            INVALID_FD.to_string()
        }
    }
}
