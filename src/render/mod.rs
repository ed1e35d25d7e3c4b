//! Table rendering.
//!
//! A frame is composed as one string and written to the sink in a single
//! pass: header (pid, command line, column titles, plus a hint line on
//! terminals), then the visible slice of the sorted table. Fixed-width
//! columns take their widths from [`Column::width`]; the path column gets
//! whatever is left, and when even the minimum does not fit the table is
//! replaced by an `[insufficient width]` marker.
//!
//! Draw failures are logged and swallowed — one bad frame must not take
//! the monitor down.

pub mod format;
pub mod sink;

use log::warn;
use nix::unistd::Pid;

use crate::aggregate::{Aggregator, PathEntry};
use crate::columns::Column;
use format::{format_size, format_time, truncate_left, truncate_right};
pub use sink::Sink;

/// pid line + command line + column titles.
const FIXED_HEADER_HEIGHT: usize = 3;
/// Below this the path column is unreadable and the table is skipped.
const MIN_PATH_COL_WIDTH: usize = 10;

pub struct Renderer {
    sink: Sink,
    scroll: usize,
    pid: Pid,
    cmdline: String,
}

impl Renderer {
    #[must_use]
    pub fn new(sink: Sink, pid: Pid, cmdline: String) -> Self {
        Renderer { sink, scroll: 0, pid, cmdline }
    }

    /// Render one frame; errors are logged, never propagated.
    pub fn draw(&mut self, agg: &Aggregator) {
        if let Err(err) = self.try_draw(agg) {
            warn!("Frame rendering failed: {err}");
        }
    }

    fn try_draw(&mut self, agg: &Aggregator) -> std::io::Result<()> {
        self.sink.refresh_size();
        let frame = self.compose(agg);
        self.sink.clear()?;
        self.sink.stream().write_all(frame.as_bytes())?;
        self.sink.flush()
    }

    /// Scroll towards the end of the table, at most one viewport and never
    /// past the last full window.
    pub fn page_up(&mut self, agg: &Aggregator) {
        if let Some(rows) = self.sink.rows() {
            self.scroll +=
                page_up_delta(self.scroll, rows, self.header_height(), agg.filtered_count());
        }
    }

    /// Scroll back towards the top, at most one viewport.
    pub fn page_down(&mut self, agg: &Aggregator) {
        if let Some(rows) = self.sink.rows() {
            self.scroll -= page_down_delta(self.scroll, rows, self.header_height());
        }
    }

    fn header_height(&self) -> usize {
        FIXED_HEADER_HEIGHT + usize::from(self.sink.show_hints())
    }

    fn compose(&mut self, agg: &Aggregator) -> String {
        let width = self.sink.width();
        let rows = self.sink.rows();
        let header_height = self.header_height();
        let scroll = self.scroll;

        // The table section is built first: serving the view re-sorts the
        // table and refreshes the filtered count the hint line shows.
        let mut table_section = String::new();
        agg.with_view(|view| {
            let fixed = fixed_columns_width();
            let path_width = match width {
                Some(w) if w < fixed + MIN_PATH_COL_WIDTH => {
                    table_section.push_str("[insufficient width]\n");
                    return;
                }
                Some(w) => view.max_path_width.max(4).min(w - fixed),
                None => view.max_path_width.max(4),
            };

            push_cell(&mut table_section, "path", path_width);
            for col in &Column::ALL[1..] {
                push_cell(&mut table_section, col.name(), col.width().unwrap_or(0));
            }
            table_section.push('\n');

            let count = agg.filtered_count();
            let (begin, end) = visible_range(scroll, rows, header_height, count);
            for entry in &view.entries[begin..end] {
                push_cell(&mut table_section, &truncate_left(&entry.path, path_width), path_width);
                for col in &Column::ALL[1..] {
                    push_cell(&mut table_section, &cell(entry, *col), col.width().unwrap_or(0));
                }
                table_section.push('\n');
            }
        });

        let mut frame = String::new();
        frame.push_str(&format!("PID: {}\n", self.pid));
        let cmd = format!("Command line: {}", self.cmdline);
        match width {
            Some(w) => frame.push_str(&truncate_right(&cmd, w)),
            None => frame.push_str(&cmd),
        }
        frame.push('\n');
        if self.sink.show_hints() {
            let (column, reverse) = agg.sort_state();
            frame.push_str(&format!(
                "Q:quit  S:order  P:up  N:down  0-9:column  sort:{}{}  files:{}\n",
                column.name(),
                if reverse { '-' } else { '+' },
                agg.filtered_count(),
            ));
        }
        frame.push_str(&table_section);
        frame
    }
}

fn push_cell(frame: &mut String, text: &str, width: usize) {
    use std::fmt::Write;
    let _ = write!(frame, "{text:>width$}");
}

fn cell(entry: &PathEntry, column: Column) -> String {
    match column {
        Column::Path => entry.path.clone(),
        Column::WriteSize => format_size(entry.write_bytes),
        Column::ReadSize => format_size(entry.read_bytes),
        Column::WriteCount => entry.write_count.to_string(),
        Column::ReadCount => entry.read_count.to_string(),
        Column::OpenCount => entry.open_count.to_string(),
        Column::CloseCount => entry.close_count.to_string(),
        Column::Special => entry.special.label(),
        Column::LastThread => entry.last_thread.to_string(),
        Column::LastAccess => format_time(&entry.last_access),
    }
}

fn fixed_columns_width() -> usize {
    Column::ALL.iter().filter_map(|c| c.width()).sum()
}

/// Rows visible at the current scroll position: the viewport intersected
/// with the filtered entries. `None` rows means an unpaged sink.
fn visible_range(scroll: usize, rows: Option<usize>, header: usize, count: usize) -> (usize, usize) {
    match rows {
        None => (0, count),
        Some(rows) if rows <= header => (0, 0),
        Some(rows) => {
            let begin = scroll.min(count);
            let end = (scroll + (rows - header)).min(count);
            (begin, end)
        }
    }
}

fn page_up_delta(scroll: usize, rows: usize, header: usize, count: usize) -> usize {
    if rows <= header {
        return 0;
    }
    let viewport = rows - header;
    let shown_through = rows + scroll;
    let total = count + header;
    if shown_through < total {
        viewport.min(total - shown_through)
    } else {
        0
    }
}

fn page_down_delta(scroll: usize, rows: usize, header: usize) -> usize {
    if rows <= header {
        return 0;
    }
    scroll.min(rows - header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::FileEvent;
    use nix::unistd::Pid;
    use std::io::Read;

    fn sample_aggregator() -> Aggregator {
        let agg = Aggregator::new(Column::WriteSize, true, None);
        let tid = Pid::from_raw(42);
        agg.ingest(FileEvent::Open { tid, path: "/tmp/x".into() });
        agg.ingest(FileEvent::Write { tid, path: "/tmp/x".into(), bytes: 3 });
        agg.ingest(FileEvent::Close { tid, path: "/tmp/x".into() });
        agg.ingest(FileEvent::Write { tid, path: "/tmp/big".into(), bytes: 2048 });
        agg
    }

    #[test]
    fn test_file_frame_contains_header_and_sorted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.txt");
        let agg = sample_aggregator();
        let mut renderer = Renderer::new(
            Sink::file(&path).unwrap(),
            Pid::from_raw(1234),
            "sh -c demo".to_string(),
        );
        renderer.draw(&agg);

        let mut content = String::new();
        std::fs::File::open(&path).unwrap().read_to_string(&mut content).unwrap();

        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "PID: 1234");
        assert_eq!(lines[1], "Command line: sh -c demo");
        assert!(lines[2].starts_with(&format!("{:>8}", "path")));
        assert!(lines[2].contains("wsize"));
        assert!(lines[2].contains("laccess"));
        // descending by wsize: the 2 KiB row first
        assert!(lines[3].contains("/tmp/big"));
        assert!(lines[3].contains("2.0K"));
        assert!(lines[4].contains("/tmp/x"));
        assert!(lines[4].contains("3b"));
        assert_eq!(lines.len(), 5); // file sinks render every row, no hints
    }

    #[test]
    fn test_file_frame_is_rewritten_not_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.txt");
        let agg = sample_aggregator();
        let mut renderer =
            Renderer::new(Sink::file(&path).unwrap(), Pid::from_raw(1), String::new());
        renderer.draw(&agg);
        renderer.draw(&agg);

        let mut content = String::new();
        std::fs::File::open(&path).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content.matches("PID: 1").count(), 1);
    }

    #[test]
    fn test_fixed_columns_leave_room_on_80_cols() {
        // six size/count columns of 7, spec 5, lthread 11, laccess 12
        assert_eq!(fixed_columns_width(), 70);
        // an 80-column terminal must still fit the minimum path column
        assert!(80 >= fixed_columns_width() + MIN_PATH_COL_WIDTH);
    }

    // ── windowing math (24x80 terminal, 100 entries, 4 header lines) ────

    #[test]
    fn test_initial_window_shows_first_page() {
        assert_eq!(visible_range(0, Some(24), 4, 100), (0, 20));
    }

    #[test]
    fn test_page_up_advances_one_viewport() {
        let d = page_up_delta(0, 24, 4, 100);
        assert_eq!(d, 20);
        assert_eq!(visible_range(d, Some(24), 4, 100), (20, 40));
    }

    #[test]
    fn test_page_up_clamps_at_last_window() {
        let mut scroll = 0;
        for _ in 0..10 {
            scroll += page_up_delta(scroll, 24, 4, 100);
        }
        assert_eq!(scroll, 80); // last full window: entries 80..100
        assert_eq!(page_up_delta(scroll, 24, 4, 100), 0); // further paging is a no-op
    }

    #[test]
    fn test_page_down_clamps_at_zero() {
        assert_eq!(page_down_delta(0, 24, 4), 0);
        assert_eq!(page_down_delta(7, 24, 4), 7);
        assert_eq!(page_down_delta(50, 24, 4), 20);
    }

    #[test]
    fn test_tiny_viewport_renders_nothing() {
        assert_eq!(visible_range(0, Some(3), 4, 100), (0, 0));
        assert_eq!(page_up_delta(0, 3, 4, 100), 0);
    }

    #[test]
    fn test_short_table_fits_in_one_window() {
        assert_eq!(visible_range(0, Some(24), 4, 5), (0, 5));
        assert_eq!(page_up_delta(0, 24, 4, 5), 0);
    }
}
