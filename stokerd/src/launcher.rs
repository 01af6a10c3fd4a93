// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! From parsed CLI to a running master (or a one-shot action): load and
//! validate the configuration, dispatch `-s` signals, bind or inherit the
//! listeners, and hand over to [`stoker::process::master`].

use std::net::TcpListener;

use miette::{IntoDiagnostic, miette};
use stoker::{core::config::Config,
             process::{master::{self, Master},
                       pidfile::{self, PidFile}}};
use tracing::info;

use crate::cli_arg::{CLIArg, SignalCommand};

/// Environment variables the master re-reads on `HUP`.
pub const CONFIG_FILE_ENV: &str = "STOKER_CONFIG_FILE";
pub const CONFIG_INLINE_ENV: &str = "STOKER_CONFIG_INLINE";

/// Load the configuration named by the CLI.
///
/// # Errors
///
/// Returns a diagnostic for unreadable files or invalid directives.
pub fn load_config(cli: &CLIArg) -> miette::Result<Config> {
    let prefix = match &cli.prefix {
        Some(p) => p.clone(),
        None => std::env::current_dir().into_diagnostic()?,
    };

    let file_src = match &cli.config {
        Some(path) => {
            let resolved = if path.is_absolute() {
                path.clone()
            } else {
                prefix.join(path)
            };
            Some(
                std::fs::read_to_string(&resolved)
                    .map_err(|e| miette!("cannot read {}: {e}", resolved.display()))?,
            )
        }
        None => None,
    };

    Config::from_sources(prefix, file_src.as_deref(), cli.directives.as_deref())
        .into_diagnostic()
}

/// Run whatever the CLI asked for. Only returns for the one-shot actions
/// (`-t`, `-s`); otherwise this becomes the master process and never
/// returns.
///
/// # Errors
///
/// Any startup failure; the binary maps it to exit code 2.
pub fn try_run(cli: CLIArg) -> miette::Result<()> {
    let cfg = load_config(&cli)?;

    if cli.test_config {
        println!("stokerd: configuration test is successful");
        return Ok(());
    }

    if let Some(signal) = cli.signal {
        return send_signal(&cfg, signal);
    }

    let log_writer = stoker::core::log::try_init_tracing(
        cfg.error_log.as_ref().map(|p| cfg.resolve(p)).as_deref(),
        tracing::level_filters::LevelFilter::INFO,
    )?;

    // The master re-reads these on reconfigure.
    publish_config_env(&cli);

    let listeners = match master::inherited_listeners() {
        Some(inherited) => {
            info!(count = inherited.len(), "inherited listening sockets");
            inherited
        }
        None => bind_listeners(&cfg)?,
    };

    if cfg.daemon {
        master::daemonize().into_diagnostic()?;
    }

    let pid_path = cfg.resolve(&cfg.pid_path);
    let pid_file = PidFile::create(&pid_path).into_diagnostic()?;

    let argv: Vec<String> = std::env::args().collect();

    info!(
        pid = std::process::id(),
        listeners = listeners.len(),
        workers = cfg.worker_processes,
        "starting master process"
    );
    Master::new(cfg, listeners, pid_file, log_writer, argv).run()
}

fn publish_config_env(cli: &CLIArg) {
    // SAFETY: single-threaded startup, before any worker exists.
    unsafe {
        match &cli.config {
            Some(path) => std::env::set_var(CONFIG_FILE_ENV, path),
            None => std::env::remove_var(CONFIG_FILE_ENV),
        }
        match &cli.directives {
            Some(d) => std::env::set_var(CONFIG_INLINE_ENV, d),
            None => std::env::remove_var(CONFIG_INLINE_ENV),
        }
    }
}

fn bind_listeners(cfg: &Config) -> miette::Result<Vec<TcpListener>> {
    let mut listeners = vec![];
    for addr in &cfg.listen {
        let listener = TcpListener::bind(addr)
            .map_err(|e| miette!("bind() to {addr} failed: {e}"))?;
        listener.set_nonblocking(true).into_diagnostic()?;
        info!(%addr, "listening");
        listeners.push(listener);
    }
    Ok(listeners)
}

fn send_signal(cfg: &Config, signal: SignalCommand) -> miette::Result<()> {
    let sig = match signal {
        SignalCommand::Stop => pidfile::ControlSignal::Stop,
        SignalCommand::Quit => pidfile::ControlSignal::Quit,
        SignalCommand::Reopen => pidfile::ControlSignal::Reopen,
        SignalCommand::Reload => pidfile::ControlSignal::Reload,
    };
    let pid_path = cfg.resolve(&cfg.pid_path);
    let pid = pidfile::signal_running_master(&pid_path, sig).into_diagnostic()?;
    println!("stokerd: signalled master {pid}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use clap::Parser;

    #[test]
    fn test_load_config_with_inline_directives() {
        let cli = CLIArg::parse_from([
            "stokerd",
            "-p",
            "/tmp",
            "-g",
            "worker_processes 3; listen 127.0.0.1:9999;",
        ]);
        let cfg = load_config(&cli).unwrap();
        assert_eq!(cfg.worker_processes, 3);
        assert_eq!(cfg.listen, vec!["127.0.0.1:9999".parse().unwrap()]);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("stoker.conf");
        std::fs::write(&conf, "worker_processes 2;\npid run/stoker.pid;\n").unwrap();

        let cli = CLIArg::parse_from([
            "stokerd",
            "-p",
            dir.path().to_str().unwrap(),
            "-c",
            "stoker.conf",
        ]);
        let cfg = load_config(&cli).unwrap();
        assert_eq!(cfg.worker_processes, 2);
        assert_eq!(cfg.resolve(&cfg.pid_path), dir.path().join("run/stoker.pid"));
    }

    #[test]
    fn test_invalid_config_is_a_diagnostic() {
        let cli = CLIArg::parse_from(["stokerd", "-g", "bogus_directive on;"]);
        assert!(load_config(&cli).is_err());
    }
}
