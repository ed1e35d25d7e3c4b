//! Frame sinks: terminal or file.
//!
//! A sink is the capability set the renderer needs — clear the target,
//! report its dimensions, say whether it pages and shows hints, hand out a
//! byte stream. The terminal variant clears with cursor-home + erase
//! escapes and honours scrolling; the file variant is truncated and
//! rewritten from offset zero each frame and always renders every row.
//!
//! The terminal size is cached and only re-queried after SIGWINCH; the
//! handler does nothing but an atomic flag store.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Stdout, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Fallback dimensions when the size query fails (not a tty).
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

static WINCH: AtomicBool = AtomicBool::new(false);

extern "C" fn on_winch(_sig: libc::c_int) {
    WINCH.store(true, Ordering::SeqCst);
}

pub enum Sink {
    Terminal { out: Stdout, cols: u16, rows: u16 },
    File { file: File },
}

impl Sink {
    /// Stdout sink with a SIGWINCH-refreshed viewport.
    pub fn terminal() -> io::Result<Sink> {
        let action =
            SigAction::new(SigHandler::Handler(on_winch), SaFlags::empty(), SigSet::empty());
        // SAFETY: the handler only performs an atomic store.
        if let Err(err) = unsafe { sigaction(Signal::SIGWINCH, &action) } {
            warn!("Failed to install SIGWINCH handler: {err}");
        }
        let (cols, rows) = query_size();
        Ok(Sink::Terminal { out: io::stdout(), cols, rows })
    }

    /// File sink; the file is created (or emptied) up front so a missing
    /// directory fails at startup, not on the first frame.
    pub fn file(path: &Path) -> io::Result<Sink> {
        Ok(Sink::File { file: File::create(path)? })
    }

    /// Re-read the viewport dimensions if a resize signal arrived.
    pub fn refresh_size(&mut self) {
        if let Sink::Terminal { cols, rows, .. } = self {
            if WINCH.swap(false, Ordering::SeqCst) {
                let (c, r) = query_size();
                *cols = c;
                *rows = r;
            }
        }
    }

    /// Prepare the target for a fresh frame.
    pub fn clear(&mut self) -> io::Result<()> {
        match self {
            Sink::Terminal { out, .. } => out.write_all(b"\x1b[H\x1b[J"),
            Sink::File { file } => {
                file.set_len(0)?;
                file.seek(SeekFrom::Start(0)).map(drop)
            }
        }
    }

    /// Usable width in columns; `None` means unbounded.
    #[must_use]
    pub fn width(&self) -> Option<usize> {
        match self {
            Sink::Terminal { cols, .. } => Some(usize::from(*cols)),
            Sink::File { .. } => None,
        }
    }

    /// Viewport height in rows; `None` means every row is rendered.
    #[must_use]
    pub fn rows(&self) -> Option<usize> {
        match self {
            Sink::Terminal { rows, .. } => Some(usize::from(*rows)),
            Sink::File { .. } => None,
        }
    }

    /// Only interactive sinks show the key-binding hint line.
    #[must_use]
    pub fn show_hints(&self) -> bool {
        matches!(self, Sink::Terminal { .. })
    }

    pub fn stream(&mut self) -> &mut dyn Write {
        match self {
            Sink::Terminal { out, .. } => out,
            Sink::File { file } => file,
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.stream().flush()
    }
}

fn query_size() -> (u16, u16) {
    crossterm::terminal::size().unwrap_or((DEFAULT_COLS, DEFAULT_ROWS))
}
