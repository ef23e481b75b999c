use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = cohort_metrics_cli::Cli::parse();
    cohort_metrics_cli::init_tracing(cli.verbose());
    let json = cli.wants_json();

    match cohort_metrics_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            if json {
                println!("{}", cohort_metrics_cli::error_payload(&err));
            }
            ExitCode::FAILURE
        }
    }
}
