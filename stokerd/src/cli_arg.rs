// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// More info:
/// - <https://docs.rs/clap/latest/clap/_derive/#overview>
#[derive(Debug, Parser)]
#[command(bin_name = "stokerd")]
#[command(about = "Event-driven multi-process HTTP server")]
#[command(version)]
#[command(next_line_help = true)]
pub struct CLIArg {
    /// Configuration file path.
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Prefix directory that relative paths resolve against.
    #[arg(short = 'p', long = "prefix", value_name = "DIR")]
    pub prefix: Option<PathBuf>,

    /// Extra configuration directives, applied after the file.
    #[arg(short = 'g', long = "directives", value_name = "DIRECTIVES")]
    pub directives: Option<String>,

    /// Send a signal to the running master (via the pid file) and exit.
    #[arg(short = 's', long = "signal", value_name = "SIGNAL")]
    pub signal: Option<SignalCommand>,

    /// Parse and validate the configuration, then exit.
    #[arg(short = 't', long = "test-config")]
    pub test_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SignalCommand {
    /// Fast shutdown (TERM).
    Stop,
    /// Graceful shutdown (QUIT).
    Quit,
    /// Reopen log files (USR1).
    Reopen,
    /// Reload configuration (HUP).
    Reload,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_all_flags() {
        let cli = CLIArg::parse_from([
            "stokerd",
            "-c",
            "stoker.conf",
            "-p",
            "/srv/stoker",
            "-g",
            "worker_processes 2;",
            "-t",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("stoker.conf")));
        assert_eq!(cli.prefix, Some(PathBuf::from("/srv/stoker")));
        assert_eq!(cli.directives, Some("worker_processes 2;".into()));
        assert!(cli.test_config);
        assert_eq!(cli.signal, None);
    }

    #[test]
    fn test_parse_signal() {
        let cli = CLIArg::parse_from(["stokerd", "-s", "reload"]);
        assert_eq!(cli.signal, Some(SignalCommand::Reload));
    }
}
