#![forbid(unsafe_code)]

//! irondome: IronDome CLI entry point.

use clap::Parser;

mod cli_app;

fn main() {
    let args = cli_app::Cli::parse();
    if let Err(e) = cli_app::run(&args) {
        if e.needs_report() {
            eprintln!("irondome: {e}");
        }
        std::process::exit(e.exit_code());
    }
}
