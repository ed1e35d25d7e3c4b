//! Event aggregation into the per-path counter table.
//!
//! The aggregator owns the only mutable copy of the table and runs on its
//! own worker thread so tracee bursts never block a render. It consumes
//! events FIFO from the tracer channel, applies their counter effects and
//! serves sorted, filtered views to the renderer under its lock.
//!
//! Lock layout follows the contention split: the table has its own mutex
//! (held by ingest and for the duration of a render frame), sort/filter
//! parameters have a separate one so controller commands do not contend
//! with event ingest, and `filtered_count` has a third so the control-hint
//! line can read it cheaply.
//!
//! A rename adds the source's counters into the destination and keeps the
//! source row (flagged `renamed`) so the rename history stays visible. The
//! source counters are not zeroed, so a path reopened after being renamed
//! away is double-counted in aggregate totals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam_channel::{select, tick, Receiver};
use glob::Pattern;

use crate::columns::Column;
use crate::control::ControlMsg;
use crate::render::Renderer;
use crate::trace::FileEvent;

/// One-shot event markers for a path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialFlags {
    pub mapped: bool,
    pub renamed: bool,
    pub unlinked: bool,
}

impl SpecialFlags {
    /// Compact cell label: one letter per flag, `-` when none are set.
    #[must_use]
    pub fn label(self) -> String {
        let mut s = String::new();
        if self.mapped {
            s.push('m');
        }
        if self.renamed {
            s.push('r');
        }
        if self.unlinked {
            s.push('u');
        }
        if s.is_empty() {
            s.push('-');
        }
        s
    }

    fn rank(self) -> u8 {
        u8::from(self.mapped) | u8::from(self.renamed) << 1 | u8::from(self.unlinked) << 2
    }
}

/// Aggregated counters for one absolute path. Created on the first event
/// that references the path, never removed for the rest of the run.
#[derive(Debug, Clone)]
pub struct PathEntry {
    pub path: String,
    pub write_bytes: u64,
    pub read_bytes: u64,
    pub write_count: u64,
    pub read_count: u64,
    pub open_count: u64,
    pub close_count: u64,
    pub special: SpecialFlags,
    pub last_thread: libc::pid_t,
    pub last_access: DateTime<Local>,
    pub filtered: bool,
    /// Creation order, the final sort tiebreak.
    seq: u64,
}

impl PathEntry {
    fn new(path: String, seq: u64, filtered: bool) -> Self {
        PathEntry {
            path,
            write_bytes: 0,
            read_bytes: 0,
            write_count: 0,
            read_count: 0,
            open_count: 0,
            close_count: 0,
            special: SpecialFlags::default(),
            last_thread: 0,
            last_access: Local::now(),
            filtered,
            seq,
        }
    }
}

/// Sort and filter parameters, adjustable from the controller.
#[derive(Debug, Clone)]
pub struct SortParams {
    pub column: Column,
    pub reverse: bool,
    pub filter: Option<Pattern>,
}

#[derive(Default)]
struct Table {
    entries: Vec<PathEntry>,
    /// path → position in `entries`; rebuilt after every sort.
    index: HashMap<String, usize>,
    max_path_width: usize,
    next_seq: u64,
}

impl Table {
    fn get_or_create(&mut self, path: String, filter: Option<&Pattern>) -> usize {
        if let Some(&idx) = self.index.get(&path) {
            return idx;
        }
        let filtered = matches_filter(filter, &path);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(PathEntry::new(path.clone(), seq, filtered));
        let idx = self.entries.len() - 1;
        self.index.insert(path, idx);
        idx
    }
}

/// A read view of the sorted table, valid while the table lock is held.
pub struct TableView<'a> {
    pub entries: &'a [PathEntry],
    /// Width in characters of the longest visible path.
    pub max_path_width: usize,
}

/// The path table plus its sort/filter state.
pub struct Aggregator {
    table: Mutex<Table>,
    params: Mutex<SortParams>,
    filtered_count: Mutex<usize>,
    changed: AtomicBool,
}

impl Aggregator {
    #[must_use]
    pub fn new(column: Column, reverse: bool, filter: Option<Pattern>) -> Self {
        Aggregator {
            table: Mutex::new(Table::default()),
            params: Mutex::new(SortParams { column, reverse, filter }),
            filtered_count: Mutex::new(0),
            changed: AtomicBool::new(false),
        }
    }

    /// Worker loop: ingest events, honour control messages, redraw on the
    /// refresh tick and flush one final frame before returning.
    pub fn run(
        &self,
        events: &Receiver<FileEvent>,
        ctrl: &Receiver<ControlMsg>,
        renderer: &mut Renderer,
        delay: Duration,
    ) {
        let ticker = tick(delay);
        loop {
            select! {
                recv(events) -> msg => match msg {
                    Ok(ev) => {
                        self.ingest(ev);
                        // drain the burst before going back to sleep
                        while let Ok(ev) = events.try_recv() {
                            self.ingest(ev);
                        }
                    }
                    Err(_) => break,
                },
                recv(ctrl) -> msg => match msg {
                    Ok(ControlMsg::Redraw) => renderer.draw(self),
                    Ok(ControlMsg::PageUp) => {
                        renderer.page_up(self);
                        renderer.draw(self);
                    }
                    Ok(ControlMsg::PageDown) => {
                        renderer.page_down(self);
                        renderer.draw(self);
                    }
                    Ok(ControlMsg::Shutdown) | Err(_) => break,
                },
                recv(ticker) -> _ => renderer.draw(self),
            }
        }

        // pick up whatever the tracer enqueued before stopping
        while let Ok(ev) = events.try_recv() {
            self.ingest(ev);
        }
        renderer.draw(self);
    }

    /// Apply one event to the table.
    ///
    /// Paths that are empty or neither absolute nor a `*` sentinel are
    /// dropped; a rename needs both endpoints to be usable.
    pub fn ingest(&self, ev: FileEvent) {
        let tid = ev.tid().as_raw();
        match ev {
            FileEvent::Open { path, .. } => self.touch(tid, path, |e| e.open_count += 1),
            FileEvent::Close { path, .. } => self.touch(tid, path, |e| e.close_count += 1),
            FileEvent::Read { path, bytes, .. } => self.touch(tid, path, |e| {
                e.read_count += 1;
                e.read_bytes += bytes;
            }),
            FileEvent::Write { path, bytes, .. } => self.touch(tid, path, |e| {
                e.write_count += 1;
                e.write_bytes += bytes;
            }),
            FileEvent::Map { path, .. } => self.touch(tid, path, |e| e.special.mapped = true),
            FileEvent::Unlink { path, .. } => {
                self.touch(tid, path, |e| e.special.unlinked = true);
            }
            FileEvent::Rename { from, to, .. } => self.rename(tid, &from, &to),
        }
    }

    fn touch<F: FnOnce(&mut PathEntry)>(&self, tid: libc::pid_t, path: String, apply: F) {
        if !usable_path(&path) {
            return;
        }
        let mut table = self.lock_table();
        let params = self.lock_params();
        let idx = table.get_or_create(path, params.filter.as_ref());
        let entry = &mut table.entries[idx];
        apply(entry);
        entry.last_thread = tid;
        entry.last_access = Local::now();
        entry.filtered = matches_filter(params.filter.as_ref(), &entry.path);
        self.changed.store(true, Ordering::Release);
    }

    fn rename(&self, tid: libc::pid_t, from: &str, to: &str) {
        if !usable_path(from) || !usable_path(to) {
            return;
        }
        let mut table = self.lock_table();
        let params = self.lock_params();
        let now = Local::now();

        let from_idx = table.get_or_create(from.to_string(), params.filter.as_ref());
        let src = &mut table.entries[from_idx];
        src.special.renamed = true;
        src.last_thread = tid;
        src.last_access = now;
        let carried = (
            src.write_bytes,
            src.read_bytes,
            src.write_count,
            src.read_count,
            src.open_count,
            src.close_count,
        );

        let to_idx = table.get_or_create(to.to_string(), params.filter.as_ref());
        let dst = &mut table.entries[to_idx];
        dst.write_bytes += carried.0;
        dst.read_bytes += carried.1;
        dst.write_count += carried.2;
        dst.read_count += carried.3;
        dst.open_count += carried.4;
        dst.close_count += carried.5;
        dst.last_thread = tid;
        dst.last_access = now;
        self.changed.store(true, Ordering::Release);
    }

    /// Serve a read view, re-sorting first if anything changed since the
    /// last one. The table lock is held for the duration of `f`.
    pub fn with_view<R>(&self, f: impl FnOnce(TableView<'_>) -> R) -> R {
        let mut table = self.lock_table();
        if self.changed.swap(false, Ordering::AcqRel) {
            let params = self.lock_params().clone();
            let filtered = sort_table(&mut table, &params);
            *self.lock_filtered_count() = filtered;
        }
        f(TableView { entries: &table.entries, max_path_width: table.max_path_width })
    }

    /// Number of entries matching the filter, for hints and paging.
    #[must_use]
    pub fn filtered_count(&self) -> usize {
        *self.lock_filtered_count()
    }

    /// Current sort column and direction, for the hint line.
    #[must_use]
    pub fn sort_state(&self) -> (Column, bool) {
        let params = self.lock_params();
        (params.column, params.reverse)
    }

    pub fn set_sort_column(&self, column: Column) {
        let mut params = self.lock_params();
        if params.column != column {
            params.column = column;
            drop(params);
            self.changed.store(true, Ordering::Release);
        }
    }

    pub fn toggle_sort_order(&self) {
        let mut params = self.lock_params();
        params.reverse = !params.reverse;
        drop(params);
        self.changed.store(true, Ordering::Release);
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().expect("table lock poisoned")
    }

    fn lock_params(&self) -> std::sync::MutexGuard<'_, SortParams> {
        self.params.lock().expect("params lock poisoned")
    }

    fn lock_filtered_count(&self) -> std::sync::MutexGuard<'_, usize> {
        self.filtered_count.lock().expect("filtered count lock poisoned")
    }
}

/// Stable sort: filtered-in entries first regardless of column, then the
/// chosen column (reversed on demand), then creation order.
/// Returns the filtered-in count and refreshes the width cache.
fn sort_table(table: &mut Table, params: &SortParams) -> usize {
    let column = params.column;
    let reverse = params.reverse;
    table.entries.sort_by(|a, b| {
        b.filtered
            .cmp(&a.filtered)
            .then_with(|| {
                let ord = compare_column(a, b, column);
                if reverse {
                    ord.reverse()
                } else {
                    ord
                }
            })
            .then_with(|| a.seq.cmp(&b.seq))
    });

    table.index.clear();
    for (idx, entry) in table.entries.iter().enumerate() {
        table.index.insert(entry.path.clone(), idx);
    }

    table.max_path_width = table
        .entries
        .iter()
        .filter(|e| e.filtered)
        .map(|e| e.path.chars().count())
        .max()
        .unwrap_or(0);

    table.entries.iter().filter(|e| e.filtered).count()
}

fn compare_column(a: &PathEntry, b: &PathEntry, column: Column) -> std::cmp::Ordering {
    match column {
        Column::Path => a.path.cmp(&b.path),
        Column::WriteSize => a.write_bytes.cmp(&b.write_bytes),
        Column::ReadSize => a.read_bytes.cmp(&b.read_bytes),
        Column::WriteCount => a.write_count.cmp(&b.write_count),
        Column::ReadCount => a.read_count.cmp(&b.read_count),
        Column::OpenCount => a.open_count.cmp(&b.open_count),
        Column::CloseCount => a.close_count.cmp(&b.close_count),
        Column::Special => a.special.rank().cmp(&b.special.rank()),
        Column::LastThread => a.last_thread.cmp(&b.last_thread),
        Column::LastAccess => a.last_access.cmp(&b.last_access),
    }
}

fn matches_filter(filter: Option<&Pattern>, path: &str) -> bool {
    filter.map_or(true, |p| p.matches(path))
}

/// Absolute paths and `*`-sentinels aggregate; everything else is noise
/// from undecodable arguments.
fn usable_path(path: &str) -> bool {
    path.starts_with('/') || path.starts_with('*')
}
