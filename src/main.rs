//! `kwd` binary entry point.

use std::process::ExitCode;

use clap::Parser;

use kiosk_watchdog::cli_app::{run, Cli};

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("kwd: {err}");
            if err.is_fatal() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
