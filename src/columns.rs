//! Table columns and sort-specification parsing.
//!
//! Column tokens are stable CLI/UI surface: their canonical order defines
//! the numeric indices bound to the digit keys, so new columns must only
//! ever be appended.

use std::fmt;
use std::str::FromStr;

/// A sortable table column, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Column {
    Path,
    WriteSize,
    ReadSize,
    WriteCount,
    ReadCount,
    OpenCount,
    CloseCount,
    Special,
    LastThread,
    LastAccess,
}

impl Column {
    /// All columns in canonical order (index == digit key binding).
    pub const ALL: [Column; 10] = [
        Column::Path,
        Column::WriteSize,
        Column::ReadSize,
        Column::WriteCount,
        Column::ReadCount,
        Column::OpenCount,
        Column::CloseCount,
        Column::Special,
        Column::LastThread,
        Column::LastAccess,
    ];

    /// The CLI token and column title.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Column::Path => "path",
            Column::WriteSize => "wsize",
            Column::ReadSize => "rsize",
            Column::WriteCount => "wcount",
            Column::ReadCount => "rcount",
            Column::OpenCount => "ocount",
            Column::CloseCount => "ccount",
            Column::Special => "spec",
            Column::LastThread => "lthread",
            Column::LastAccess => "laccess",
        }
    }

    /// Fixed display width; `None` for the elastic path column.
    #[must_use]
    pub fn width(self) -> Option<usize> {
        match self {
            Column::Path => None,
            Column::WriteSize
            | Column::ReadSize
            | Column::WriteCount
            | Column::ReadCount
            | Column::OpenCount
            | Column::CloseCount => Some(7),
            Column::Special => Some(5),
            Column::LastThread => Some(11),
            Column::LastAccess => Some(12),
        }
    }

    /// Column for a digit key (`0` = path .. `9` = laccess).
    #[must_use]
    pub fn from_index(idx: usize) -> Option<Column> {
        Self::ALL.get(idx).copied()
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Column {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name() == s)
            .ok_or_else(|| format!("unknown column name: {s}"))
    }
}

/// A `COLUMN[-]` sort specification as accepted by `--sort`.
///
/// A trailing `-` reverses the order (descending).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub column: Column,
    pub reverse: bool,
}

impl Default for SortSpec {
    fn default() -> Self {
        SortSpec { column: Column::Path, reverse: false }
    }
}

impl FromStr for SortSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, reverse) = match s.strip_suffix('-') {
            Some(rest) => (rest, true),
            None => (s, false),
        };
        Ok(SortSpec { column: name.parse()?, reverse })
    }
}
