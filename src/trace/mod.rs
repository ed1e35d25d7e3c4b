//! ptrace-based syscall tracing.
//!
//! The tracer attaches to an existing process (every thread listed under
//! `/proc/<pid>/task/`) or spawns a command under `PTRACE_TRACEME`, then
//! runs a single-threaded `waitpid(-1, __WALL)` loop on the control thread.
//! Each syscall-stop is fed to the [`decoder`]; decoded events are
//! normalised and pushed by value into a bounded channel towards the
//! aggregator.
//!
//! New threads and children announce themselves via `PTRACE_EVENT_CLONE` /
//! `FORK` / `VFORK` stops; the kernel attaches them implicitly, the tracer
//! only has to track the tid set. A tid that fails an individual ptrace
//! operation is dropped from the set and tracing continues for the rest.
//!
//! Termination is signal-driven: SIGINT/SIGTERM handlers (installed before
//! the first attach) store an atomic flag and `waitpid` returns EINTR.

pub mod decoder;
pub mod event;
pub mod resolve;

use std::collections::HashSet;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use log::{info, warn};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{kill, raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};

use crate::domain::TraceError;
use decoder::SyscallDecoder;
pub use event::FileEvent;

/// Set by the SIGINT/SIGTERM handler; checked whenever `waitpid` is
/// interrupted.
static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_sig: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

/// Whether a termination signal has been received.
#[must_use]
pub fn terminate_requested() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}

fn trace_options() -> Options {
    Options::PTRACE_O_TRACESYSGOOD
        | Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACEEXEC
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Attached,
    Spawned,
}

/// The syscall tracer. Owns the tid set and the per-tid decoder state;
/// nothing here is shared with other threads except the outgoing channel.
pub struct Tracer {
    mode: Mode,
    main_pid: Pid,
    cmdline: String,
    decoder: SyscallDecoder,
    attached: HashSet<Pid>,
    events: Sender<FileEvent>,
    torn_down: bool,
}

impl Tracer {
    /// Attach to every thread of a running process.
    ///
    /// On a mid-startup failure every tid attached so far is detached
    /// before the error propagates.
    pub fn attach(pid: Pid, events: Sender<FileEvent>) -> Result<Self, TraceError> {
        install_signal_handlers()?;
        let tids = proc_threads(pid)?;
        if tids.is_empty() {
            return Err(TraceError::NoThreads(pid));
        }

        let mut attached = HashSet::new();
        for &tid in &tids {
            if let Err(err) = attach_tid(tid) {
                for &done in &attached {
                    let _ = ptrace::detach(done, None);
                }
                return Err(err);
            }
            attached.insert(tid);
        }

        info!("Attached to process {pid} [{} thread(s)]", attached.len());
        Ok(Tracer {
            mode: Mode::Attached,
            main_pid: pid,
            cmdline: resolve::cmdline(pid),
            decoder: SyscallDecoder::new(),
            attached,
            events,
            torn_down: false,
        })
    }

    /// Fork and exec `argv` with tracing armed from the first instruction.
    pub fn spawn(argv: &[String], events: Sender<FileEvent>) -> Result<Self, TraceError> {
        install_signal_handlers()?;
        if argv.is_empty() {
            return Err(TraceError::BadCmdline);
        }

        // CStrings are built before forking: the child must not allocate.
        let cargs: Vec<CString> = argv
            .iter()
            .map(|a| CString::new(a.as_str()).map_err(|_| TraceError::BadCmdline))
            .collect::<Result<_, _>>()?;

        // SAFETY: the child branch only calls async-signal-safe functions
        // (traceme, raise, execvp, _exit) and never returns.
        let child = match unsafe { fork() }.map_err(TraceError::ForkFailed)? {
            ForkResult::Child => {
                if ptrace::traceme().is_err() {
                    // without a tracer attached the SIGSTOP below would park
                    // the child forever
                    unsafe { libc::_exit(127) }
                }
                let _ = raise(Signal::SIGSTOP);
                let _ = execvp(&cargs[0], &cargs);
                unsafe { libc::_exit(127) }
            }
            ForkResult::Parent { child } => child,
        };

        let status = waitpid(child, None).map_err(TraceError::WaitFailed)?;
        if !matches!(status, WaitStatus::Stopped(_, Signal::SIGSTOP)) {
            return Err(TraceError::UnexpectedStop { pid: child, status });
        }
        ptrace::setoptions(child, trace_options())
            .map_err(|source| TraceError::PtraceFailed { op: "SETOPTIONS", tid: child, source })?;
        ptrace::syscall(child, None)
            .map_err(|source| TraceError::PtraceFailed { op: "SYSCALL", tid: child, source })?;

        info!("Forked tracee (pid {child})");
        Ok(Tracer {
            mode: Mode::Spawned,
            main_pid: child,
            cmdline: resolve::cmdline(child),
            decoder: SyscallDecoder::new(),
            attached: HashSet::from([child]),
            events,
            torn_down: false,
        })
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.main_pid
    }

    #[must_use]
    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    /// Run the wait loop until a termination signal arrives or the tracee
    /// is gone. Returns `Ok` for both of those clean exits.
    pub fn run(&mut self) -> Result<(), TraceError> {
        loop {
            if terminate_requested() {
                info!("Termination requested");
                return Ok(());
            }
            match waitpid(None, Some(WaitPidFlag::__WALL)) {
                Ok(status) => self.dispatch(status),
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => {
                    info!("Tracee exited");
                    self.torn_down = true;
                    return Ok(());
                }
                Err(err) => return Err(TraceError::WaitFailed(err)),
            }
        }
    }

    fn dispatch(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::PtraceSyscall(tid) => {
                self.attached.insert(tid);
                match self.decoder.handle_stop(tid) {
                    Ok(Some(ev)) => self.emit(ev),
                    Ok(None) => {}
                    Err(err) => {
                        warn!("{tid}: syscall-stop handling failed ({err}), dropping thread");
                        self.drop_tid(tid);
                        // leave the thread running untraced rather than
                        // frozen in its ptrace-stop
                        if let Err(err) = ptrace::detach(tid, None) {
                            warn!("{tid}: ptrace (DETACH) failed: {err}");
                        }
                        return;
                    }
                }
                self.restart(tid, None);
            }
            WaitStatus::PtraceEvent(tid, _, event) => {
                if matches!(
                    event,
                    libc::PTRACE_EVENT_CLONE | libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK
                ) {
                    match ptrace::getevent(tid) {
                        Ok(new_tid) => {
                            let new_tid = Pid::from_raw(new_tid as libc::pid_t);
                            info!("{tid} created task {new_tid}");
                            self.attached.insert(new_tid);
                        }
                        Err(err) => warn!("{tid}: ptrace (GETEVENTMSG) failed: {err}"),
                    }
                }
                self.restart(tid, None);
            }
            WaitStatus::Stopped(tid, sig) => {
                // Deliver the original signal unless it is a synthetic trap.
                let deliver = if sig == Signal::SIGTRAP { None } else { Some(sig) };
                self.restart(tid, deliver);
            }
            WaitStatus::Exited(tid, _) | WaitStatus::Signaled(tid, _, _) => {
                self.decoder.forget(tid);
                self.attached.remove(&tid);
            }
            _ => {}
        }
    }

    /// Normalise outgoing paths once, then enqueue. A closed channel means
    /// the aggregator is gone and tracing has no consumer left.
    fn emit(&self, ev: FileEvent) {
        if self.events.send(normalized(ev)).is_err() {
            TERMINATE.store(true, Ordering::SeqCst);
        }
    }

    fn restart(&mut self, tid: Pid, sig: Option<Signal>) {
        if let Err(err) = ptrace::syscall(tid, sig) {
            warn!("{tid}: ptrace (SYSCALL) failed ({err}), dropping thread");
            self.drop_tid(tid);
        }
    }

    fn drop_tid(&mut self, tid: Pid) {
        self.attached.remove(&tid);
        self.decoder.forget(tid);
    }

    /// Release the tracee: SIGTERM for a spawned child, per-tid
    /// stop/detach/continue for an attached process. Per-tid failures are
    /// logged and skipped so one dead tid cannot pin the rest.
    pub fn shutdown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        match self.mode {
            Mode::Spawned => {
                if let Err(err) = kill(self.main_pid, Signal::SIGTERM) {
                    warn!("kill (SIGTERM) failed for {}: {err}", self.main_pid);
                } else {
                    info!("Sent SIGTERM to tracee (pid {})", self.main_pid);
                }
            }
            Mode::Attached => {
                let mut detached = 0usize;
                let tids: Vec<Pid> = self.attached.drain().collect();
                for tid in tids {
                    if let Err(err) = tgkill(self.main_pid, tid, Signal::SIGSTOP) {
                        warn!("tgkill (SIGSTOP) failed for {tid}: {err}");
                        continue;
                    }
                    let _ = waitpid(tid, Some(WaitPidFlag::__WALL));
                    if let Err(err) = ptrace::detach(tid, None) {
                        warn!("ptrace (DETACH) failed for {tid}: {err}");
                        continue;
                    }
                    if let Err(err) = tgkill(self.main_pid, tid, Signal::SIGCONT) {
                        warn!("tgkill (SIGCONT) failed for {tid}: {err}");
                    } else {
                        detached += 1;
                    }
                }
                info!("Detached from process {} [{detached} thread(s)]", self.main_pid);
            }
        }
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn install_signal_handlers() -> Result<(), TraceError> {
    // No SA_RESTART: the wait loop relies on EINTR to notice the flag.
    let action =
        SigAction::new(SigHandler::Handler(on_terminate), SaFlags::empty(), SigSet::empty());
    // SAFETY: the handler only performs an atomic store.
    unsafe {
        sigaction(Signal::SIGINT, &action).map_err(TraceError::SignalHandler)?;
        sigaction(Signal::SIGTERM, &action).map_err(TraceError::SignalHandler)?;
    }
    Ok(())
}

/// Attach one tid and leave it running in syscall-stop mode.
fn attach_tid(tid: Pid) -> Result<(), TraceError> {
    ptrace::attach(tid).map_err(|source| TraceError::AttachFailed { tid, source })?;
    waitpid(tid, Some(WaitPidFlag::__WALL)).map_err(TraceError::WaitFailed)?;
    ptrace::setoptions(tid, trace_options())
        .map_err(|source| TraceError::PtraceFailed { op: "SETOPTIONS", tid, source })?;
    ptrace::syscall(tid, None)
        .map_err(|source| TraceError::PtraceFailed { op: "SYSCALL", tid, source })?;
    Ok(())
}

/// Enumerate the tids of a process from `/proc/<pid>/task/`.
///
/// Tasks that vanish between readdir and use are handled later by per-tid
/// error paths; this only snapshots the directory.
fn proc_threads(pid: Pid) -> Result<Vec<Pid>, TraceError> {
    let task_dir = format!("/proc/{pid}/task");
    let entries = std::fs::read_dir(&task_dir)
        .map_err(|source| TraceError::TaskDirUnreadable { pid, source })?;
    Ok(entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let tid = entry.file_name().to_string_lossy().parse::<libc::pid_t>().ok()?;
            Some(Pid::from_raw(tid))
        })
        .collect())
}

/// Thread-directed signal; nix has no tgkill wrapper.
fn tgkill(tgid: Pid, tid: Pid, sig: Signal) -> nix::Result<()> {
    // SAFETY: tgkill only inspects its scalar arguments.
    let rc = unsafe {
        libc::syscall(libc::SYS_tgkill, tgid.as_raw(), tid.as_raw(), sig as libc::c_int)
    };
    Errno::result(rc).map(drop)
}

/// Apply path normalisation to every path an event carries.
fn normalized(ev: FileEvent) -> FileEvent {
    use resolve::normalize;
    match ev {
        FileEvent::Open { tid, path } => FileEvent::Open { tid, path: normalize(&path) },
        FileEvent::Close { tid, path } => FileEvent::Close { tid, path: normalize(&path) },
        FileEvent::Read { tid, path, bytes } => {
            FileEvent::Read { tid, path: normalize(&path), bytes }
        }
        FileEvent::Write { tid, path, bytes } => {
            FileEvent::Write { tid, path: normalize(&path), bytes }
        }
        FileEvent::Map { tid, path } => FileEvent::Map { tid, path: normalize(&path) },
        FileEvent::Rename { tid, from, to } => {
            FileEvent::Rename { tid, from: normalize(&from), to: normalize(&to) }
        }
        FileEvent::Unlink { tid, path } => FileEvent::Unlink { tid, path: normalize(&path) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proc_threads_lists_self() {
        let me = nix::unistd::getpid();
        let tids = proc_threads(me).unwrap();
        assert!(tids.contains(&me));
    }

    #[test]
    fn test_proc_threads_unknown_pid_fails() {
        assert!(proc_threads(Pid::from_raw(-2)).is_err());
    }

    #[test]
    fn test_spawn_rejects_empty_argv() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        assert!(matches!(Tracer::spawn(&[], tx), Err(TraceError::BadCmdline)));
    }

    #[test]
    fn test_normalized_rewrites_every_path() {
        let tid = nix::unistd::getpid();
        let ev = normalized(FileEvent::Rename {
            tid,
            from: "/a/x/../b".to_string(),
            to: "/c/./d".to_string(),
        });
        assert_eq!(
            ev,
            FileEvent::Rename { tid, from: "/a/b".to_string(), to: "/c/d".to_string() }
        );

        let ev = normalized(FileEvent::Read {
            tid,
            path: "/x/./y".to_string(),
            bytes: 7,
        });
        assert_eq!(ev, FileEvent::Read { tid, path: "/x/y".to_string(), bytes: 7 });
    }
}
