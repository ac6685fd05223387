use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = mission_control_cli::Cli::parse();
    match mission_control_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", mission_control_cli::error_envelope(&err));
            ExitCode::FAILURE
        }
    }
}
