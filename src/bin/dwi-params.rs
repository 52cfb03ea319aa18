use clap::Parser;
use dwi_models::logging::init_tracing;
use dwi_models::Params;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Debug, Parser)]
struct Args {
    /// path to the parameter file to write
    parameter_file: PathBuf,
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();
    let filename = args.parameter_file.with_extension("toml");
    match Params::default().write(&filename) {
        Ok(()) => {
            println!("wrote default parameter file to {}", filename.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("failed to write {}: {e}", filename.display());
            ExitCode::FAILURE
        }
    }
}
