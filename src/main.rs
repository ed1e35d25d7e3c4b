//! Entry point: wires the tracer, aggregator and input threads together.
//!
//! Thread layout (see the crate docs): the tracer keeps the main thread and
//! blocks in `waitpid`; the aggregator thread owns the table and the
//! renderer; the input thread exists only in terminal mode. Shutdown is
//! one-way — a termination signal (or `Q`) interrupts the tracer, the
//! tracer detaches and drops its event sender, the aggregator drains the
//! queue, renders a final frame and exits, and every thread is joined
//! before the process ends.
//!
//! Exit status: 0 after a clean termination (signal or tracee exit),
//! 1 for any startup failure.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, unbounded};
use log::warn;
use nix::unistd::Pid;

use fiotop::aggregate::Aggregator;
use fiotop::cli::Args;
use fiotop::control::{ControlMsg, Controller};
use fiotop::input;
use fiotop::render::{Renderer, Sink};
use fiotop::trace::Tracer;

/// Backpressure bound on the tracer→aggregator queue.
const EVENT_QUEUE_DEPTH: usize = 1000;

fn main() -> ExitCode {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            // --help/--version land here too and are not failures
            return if err.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
        }
    };
    if let Err(msg) = args.validate() {
        eprintln!("fiotop: {msg}");
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fiotop: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let (events_tx, events_rx) = bounded(EVENT_QUEUE_DEPTH);

    let mut tracer = match (args.pid, &args.cmdline) {
        (Some(pid), None) => Tracer::attach(Pid::from_raw(pid), events_tx)
            .with_context(|| format!("Failed to attach to pid {pid}"))?,
        (None, Some(cmdline)) => {
            Tracer::spawn(cmdline, events_tx).context("Failed to spawn tracee")?
        }
        _ => unreachable!("clap enforces exactly one of --pid/--cmdline"),
    };

    let aggregator =
        Arc::new(Aggregator::new(args.sort.column, args.sort.reverse, args.filter_pattern()));

    let interactive = args.output.is_none();
    let sink = match &args.output {
        Some(path) => Sink::file(path)
            .with_context(|| format!("Failed to create output file {}", path.display()))?,
        None => Sink::terminal().context("Failed to set up terminal output")?,
    };
    let mut renderer = Renderer::new(sink, tracer.pid(), tracer.cmdline().to_string());

    let (ctrl_tx, ctrl_rx) = unbounded();
    let delay = Duration::from_secs(args.delay);

    let agg_worker = Arc::clone(&aggregator);
    let agg_thread = std::thread::Builder::new()
        .name("aggregator".to_string())
        .spawn(move || agg_worker.run(&events_rx, &ctrl_rx, &mut renderer, delay))
        .context("Failed to start aggregator thread")?;

    let stop_input = Arc::new(AtomicBool::new(false));
    let input_thread = interactive.then(|| {
        let controller = Controller::new(
            Arc::clone(&aggregator),
            ctrl_tx.clone(),
            nix::sys::pthread::pthread_self(),
        );
        input::spawn(controller, Arc::clone(&stop_input))
    });

    // The tracer keeps this thread until a termination signal arrives or
    // the tracee is gone.
    let outcome = tracer.run();
    tracer.shutdown();
    drop(tracer); // closes the event channel; the aggregator drains and stops

    let _ = ctrl_tx.send(ControlMsg::Shutdown);
    if agg_thread.join().is_err() {
        warn!("Aggregator thread panicked");
    }

    stop_input.store(true, Ordering::SeqCst);
    if let Some(handle) = input_thread {
        if handle.join().is_err() {
            warn!("Input thread panicked");
        }
    }

    outcome.map_err(Into::into)
}
