use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use loffice::ExitPolicy;

/// loffice - trace what an Office document or script does when opened
#[derive(Debug, Parser)]
#[command(name = "loffice", version, about, long_about = None)]
pub struct Cli {
    /// Program used to open the document.
    #[arg(value_enum, value_name = "TYPE")]
    pub program: ProgramType,

    /// When to kill the traced process.
    #[arg(value_enum, value_name = "EXIT-ON")]
    pub exit_on: ExitOn,

    /// Document or script to analyze.
    #[arg(value_name = "FILENAME")]
    pub filename: PathBuf,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long)]
    pub verbose: bool,

    /// Log file writes only (exclude reads).
    #[arg(short, long)]
    pub writes_only: bool,

    /// Path to the Microsoft Office suite.
    #[arg(short, long, value_name = "DIR")]
    pub path: Option<PathBuf>,

    /// Keep tracing when an interception cannot be installed.
    #[arg(long)]
    pub skip_unresolved: bool,

    /// Emit the report as JSON instead of human-readable text.
    #[arg(long)]
    pub json: bool,

    /// Do not write a log file under logs/.
    #[arg(long)]
    pub no_log_file: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProgramType {
    /// Detect the program from the file extension.
    Auto,
    /// Word document.
    Word,
    /// Excel spreadsheet.
    Excel,
    /// PowerPoint document.
    Power,
    /// VBScript and JScript.
    Script,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExitOn {
    /// After first URL extraction (no remote fetching).
    Url,
    /// Before process creation (allow remote fetching).
    Proc,
    /// Allow uninterrupted execution (dangerous).
    #[value(name = "none")]
    Never,
}

impl From<ExitOn> for ExitPolicy {
    fn from(exit_on: ExitOn) -> Self {
        match exit_on {
            ExitOn::Url => ExitPolicy::StopOnUrl,
            ExitOn::Proc => ExitPolicy::StopOnProcess,
            ExitOn::Never => ExitPolicy::RunToCompletion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_arguments() {
        let cli = Cli::try_parse_from(["loffice", "-w", "word", "none",
                                       "invoice.doc"]).unwrap();
        assert_eq!(cli.program, ProgramType::Word);
        assert_eq!(ExitPolicy::from(cli.exit_on), ExitPolicy::RunToCompletion);
        assert!(cli.writes_only && !cli.verbose && !cli.json);
        assert_eq!(cli.path, None);
    }

    #[test]
    fn rejects_unknown_exit_on() {
        assert!(Cli::try_parse_from(["loffice", "auto", "later", "a.doc"])
            .is_err());
        assert!(Cli::try_parse_from(["loffice", "auto", "url"]).is_err());
    }
}
