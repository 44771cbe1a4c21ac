use std::path::PathBuf;

use clap::Parser;

/// Command line arguments for the `procsup` binary.
#[derive(Debug, Parser)]
#[command(name = "procsup", version, about = "Supervise a set of long-running commands")]
pub struct Cli {
    /// Path to the YAML run file.
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,

    /// Validate the run file and exit without starting anything.
    #[arg(long)]
    pub check: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_flag() {
        let cli = Cli::parse_from(["procsup", "-c", "/etc/procsup.yaml"]);
        assert_eq!(cli.config, PathBuf::from("/etc/procsup.yaml"));
        assert!(!cli.check);
    }

    #[test]
    fn parses_check_flag() {
        let cli = Cli::parse_from(["procsup", "--config", "run.yaml", "--check"]);
        assert!(cli.check);
    }
}
