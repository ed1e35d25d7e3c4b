//! CLI argument definitions

use clap::Parser;
use glob::Pattern;
use std::path::PathBuf;

use crate::columns::SortSpec;

#[derive(Parser, Debug)]
#[command(name = "fiotop", version, about = "Interactive per-process file I/O monitor")]
pub struct Args {
    /// Write the table to FILE instead of the terminal
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Sort column; append '-' for descending order (e.g. wsize-).
    /// Columns: path wsize rsize wcount rcount ocount ccount spec lthread laccess
    #[arg(short, long, value_name = "COLUMN[-]", default_value = "path")]
    pub sort: SortSpec,

    /// Show only paths matching this shell glob
    #[arg(short, long, value_name = "GLOB")]
    pub filter: Option<String>,

    /// Refresh interval in seconds
    #[arg(
        short,
        long,
        value_name = "SECONDS",
        default_value_t = 1,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub delay: u64,

    /// Attach to a running process
    #[arg(
        short,
        long,
        value_name = "PID",
        conflicts_with = "cmdline",
        required_unless_present = "cmdline"
    )]
    pub pid: Option<i32>,

    /// Spawn and trace a command; everything after -c is the tracee's argv
    #[arg(
        short,
        long,
        value_name = "CMDLINE",
        num_args = 1..,
        allow_hyphen_values = true
    )]
    pub cmdline: Option<Vec<String>>,
}

impl Args {
    /// Checks clap cannot express: pid sanity and glob syntax.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(pid) = self.pid {
            if pid <= 0 {
                return Err("--pid must be a positive integer".to_string());
            }
            if pid == std::process::id() as i32 {
                return Err("--pid must not be the monitor's own pid".to_string());
            }
        }
        if let Some(filter) = &self.filter {
            Pattern::new(filter).map_err(|err| format!("invalid --filter glob: {err}"))?;
        }
        Ok(())
    }

    /// The compiled filter glob, if one was given. Call after `validate`.
    #[must_use]
    pub fn filter_pattern(&self) -> Option<Pattern> {
        self.filter.as_ref().and_then(|f| Pattern::new(f).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::Column;

    #[test]
    fn test_attach_mode() {
        let args = Args::try_parse_from(["fiotop", "-p", "1234"]).unwrap();
        assert_eq!(args.pid, Some(1234));
        assert!(args.cmdline.is_none());
        assert_eq!(args.delay, 1);
        assert_eq!(args.sort.column, Column::Path);
    }

    #[test]
    fn test_cmdline_swallows_everything_after_c() {
        let args =
            Args::try_parse_from(["fiotop", "-c", "sh", "-c", "echo hi > /tmp/x"]).unwrap();
        assert_eq!(
            args.cmdline,
            Some(vec!["sh".to_string(), "-c".to_string(), "echo hi > /tmp/x".to_string()])
        );
        assert!(args.pid.is_none());
    }

    #[test]
    fn test_exactly_one_of_pid_and_cmdline() {
        assert!(Args::try_parse_from(["fiotop"]).is_err());
        assert!(Args::try_parse_from(["fiotop", "-p", "1", "-c", "ls"]).is_err());
    }

    #[test]
    fn test_sort_spec_with_reverse() {
        let args = Args::try_parse_from(["fiotop", "-p", "1", "-s", "wsize-"]).unwrap();
        assert_eq!(args.sort.column, Column::WriteSize);
        assert!(args.sort.reverse);
    }

    #[test]
    fn test_unknown_sort_column_rejected() {
        assert!(Args::try_parse_from(["fiotop", "-p", "1", "-s", "bogus"]).is_err());
    }

    #[test]
    fn test_delay_must_be_positive() {
        assert!(Args::try_parse_from(["fiotop", "-p", "1", "-d", "0"]).is_err());
        let args = Args::try_parse_from(["fiotop", "-p", "1", "-d", "5"]).unwrap();
        assert_eq!(args.delay, 5);
    }

    #[test]
    fn test_self_trace_rejected() {
        let me = std::process::id().to_string();
        let args = Args::try_parse_from(["fiotop", "-p", me.as_str()]).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_bad_glob_rejected() {
        let args = Args::try_parse_from(["fiotop", "-p", "1", "-f", "[unclosed"]).unwrap();
        assert!(args.validate().is_err());

        let args = Args::try_parse_from(["fiotop", "-p", "1", "-f", "*.log"]).unwrap();
        assert!(args.validate().is_ok());
        assert!(args.filter_pattern().is_some());
    }
}
