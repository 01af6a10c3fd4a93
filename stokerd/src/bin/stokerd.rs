// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

use clap::Parser;
use stokerd::{cli_arg::CLIArg, launcher::try_run};

fn main() {
    let cli_arg = CLIArg::parse();

    if let Err(report) = try_run(cli_arg) {
        eprintln!("{report:?}");
        // Fatal startup error.
        std::process::exit(2);
    }
}
