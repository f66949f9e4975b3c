use std::process::ExitCode;

fn main() -> ExitCode {
    returndesk_cli::run()
}
