use std::process::ExitCode;

use shm_eventbus::cli;

fn main() -> ExitCode {
    match cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("shm-eventbus: {err}");
            ExitCode::FAILURE
        }
    }
}
