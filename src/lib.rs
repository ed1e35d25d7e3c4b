//! # fiotop - per-process file I/O monitor
//!
//! fiotop attaches to a running process (or spawns one) as a ptrace
//! syscall tracer and shows, top-style, which files the process and all of
//! its threads and children are touching: bytes read and written, open and
//! close counts, mmap/rename/unlink markers, the last thread to touch each
//! path and when.
//!
//! ## Architecture Overview
//!
//! ```text
//!  control thread            aggregator thread           input thread
//! ┌───────────────┐  events ┌────────────────────┐      ┌────────────┐
//! │    Tracer     │────────▶│     Aggregator     │      │  key reads │
//! │ waitpid loop  │ bounded │  path → counters   │      └─────┬──────┘
//! │ SyscallDecoder│ channel │  sort / filter     │   commands  │
//! │ PathResolver  │         │      Renderer      │◀────────────┘
//! └───────────────┘         │   Sink (tty/file)  │
//!                           └────────────────────┘
//! ```
//!
//! - [`trace`]: ptrace attach/spawn, the wait loop, syscall decoding and
//!   path resolution via `/proc`
//! - [`aggregate`]: the per-path counter table, rename merging, glob
//!   filtering, sorted snapshots
//! - [`render`]: frame composition and the terminal/file sinks
//! - [`control`] / [`input`]: key decoding and command dispatch
//! - [`cli`] / [`columns`]: argument surface and the column model
//!
//! Events flow strictly one way (tracer → aggregator → renderer); control
//! flows the other way as signals into the tracer and commands into the
//! aggregator and renderer.

pub mod aggregate;
pub mod cli;
pub mod columns;
pub mod control;
pub mod domain;
pub mod input;
pub mod render;
pub mod trace;
