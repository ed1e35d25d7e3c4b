//! Keyboard input thread.
//!
//! Runs only when rendering to a terminal. The tty is switched out of
//! canonical mode (no line buffering, no echo) for the lifetime of the
//! thread and restored by a drop guard on every exit path. Keys are read
//! one byte at a time behind a short poll timeout so the stop flag is
//! noticed promptly.

use std::io::Read;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::warn;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, SpecialCharacterIndices, Termios};

use crate::control::{key_to_command, Controller};

const POLL_INTERVAL_MS: u8 = 100;

/// Restores the saved terminal attributes on drop.
struct TermiosGuard {
    saved: Termios,
}

impl TermiosGuard {
    fn configure() -> Option<TermiosGuard> {
        let stdin = std::io::stdin();
        let saved = match tcgetattr(&stdin) {
            Ok(attrs) => attrs,
            Err(err) => {
                warn!("tcgetattr failed: {err}");
                return None;
            }
        };
        let mut keyed = saved.clone();
        keyed.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
        keyed.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        keyed.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        if let Err(err) = tcsetattr(&stdin, SetArg::TCSANOW, &keyed) {
            warn!("tcsetattr failed: {err}");
            return None;
        }
        Some(TermiosGuard { saved })
    }
}

impl Drop for TermiosGuard {
    fn drop(&mut self) {
        if let Err(err) = tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &self.saved) {
            warn!("Failed to restore terminal attributes: {err}");
        }
    }
}

/// Start the input thread; it exits when `stop` is raised.
pub fn spawn(controller: Controller, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || run(&controller, &stop))
}

fn run(controller: &Controller, stop: &AtomicBool) {
    let _guard = TermiosGuard::configure();
    let stdin = std::io::stdin();

    while !stop.load(Ordering::SeqCst) {
        let mut fds = [PollFd::new(stdin.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(0) => {}
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
                if revents.contains(PollFlags::POLLIN) {
                    let mut byte = [0u8; 1];
                    match stdin.lock().read(&mut byte) {
                        Ok(1) => {
                            if let Some(cmd) = key_to_command(char::from(byte[0])) {
                                controller.dispatch(cmd);
                            }
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!("stdin read failed: {err}");
                            break;
                        }
                    }
                } else if !revents.is_empty() {
                    warn!("Unexpected poll events on stdin: {revents:?}");
                    break;
                }
            }
            Err(Errno::EINTR) => {}
            Err(err) => {
                warn!("poll failed: {err}");
                break;
            }
        }
    }
}
