//! Command dispatch.
//!
//! The controller fans one decoded keypress out to whichever component
//! handles it: sort changes go to the aggregator's parameters followed by a
//! redraw request, paging goes to the render thread over the control
//! channel, and quit interrupts the tracer's `waitpid` by signalling its
//! thread — the same path SIGINT from the outside takes.

use std::sync::Arc;

use crossbeam_channel::Sender;
use log::warn;
use nix::sys::pthread::{pthread_kill, Pthread};
use nix::sys::signal::Signal;

use crate::aggregate::Aggregator;
use crate::columns::Column;

/// A user command decoded from one keypress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Quit,
    ToggleSortOrder,
    SortColumn(Column),
    PageUp,
    PageDown,
}

/// Messages consumed by the aggregator/render thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMsg {
    Redraw,
    PageUp,
    PageDown,
    Shutdown,
}

pub struct Controller {
    aggregator: Arc<Aggregator>,
    ctrl: Sender<ControlMsg>,
    tracer_thread: Pthread,
}

impl Controller {
    #[must_use]
    pub fn new(aggregator: Arc<Aggregator>, ctrl: Sender<ControlMsg>, tracer_thread: Pthread) -> Self {
        Controller { aggregator, ctrl, tracer_thread }
    }

    pub fn dispatch(&self, cmd: Command) {
        match cmd {
            Command::Quit => {
                if let Err(err) = pthread_kill(self.tracer_thread, Signal::SIGTERM) {
                    warn!("pthread_kill (SIGTERM) failed: {err}");
                }
            }
            Command::ToggleSortOrder => {
                self.aggregator.toggle_sort_order();
                self.request_update();
            }
            Command::SortColumn(column) => {
                self.aggregator.set_sort_column(column);
                self.request_update();
            }
            Command::PageUp => {
                let _ = self.ctrl.send(ControlMsg::PageUp);
            }
            Command::PageDown => {
                let _ = self.ctrl.send(ControlMsg::PageDown);
            }
        }
    }

    fn request_update(&self) {
        let _ = self.ctrl.send(ControlMsg::Redraw);
    }
}

/// Key bindings: `Q` quit, `S` order, `P`/`N` paging, digits pick the sort
/// column by canonical index.
#[must_use]
pub fn key_to_command(ch: char) -> Option<Command> {
    match ch.to_ascii_uppercase() {
        'Q' => Some(Command::Quit),
        'S' => Some(Command::ToggleSortOrder),
        'P' => Some(Command::PageUp),
        'N' => Some(Command::PageDown),
        digit @ '0'..='9' => {
            Column::from_index(digit as usize - '0' as usize).map(Command::SortColumn)
        }
        _ => None,
    }
}
