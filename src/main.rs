// ENCLAVE-BENCH -- BENCHMARK ORCHESTRATION FOR ENCLAVE RUNTIMES
// BUILDS BENCHMARK IMAGES, RUNS THEM UNDER SUPERVISION, CAPTURES THEIR JSON
// REPORTS, AND KEEPS A RESUMABLE COLUMNAR LEDGER OF THE RESULTS.
//
// STDOUT CARRIES THE OPERATOR LOG AND THE LIVE BENCHMARK OUTPUT.
// DIAGNOSTICS GO THROUGH tracing ON STDERR (RUST_LOG OVERRIDES --verbose).

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use enclave_bench::supervisor;

#[derive(Parser)]
#[command(name = "enclave-bench")]
#[command(about = "ENCLAVE-BENCH -- STORAGE AND NETWORK BENCHMARKS FOR ENCLAVE RUNTIMES")]
struct Cli {
    // DEBUG-LEVEL DIAGNOSTICS
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    // STORAGE SWEEP: FIO ACROSS BACKENDS
    Fio(cli::fio::FioArgs),

    // NETWORK SWEEP: IPERF AGAINST A REMOTE PEER
    Iperf(cli::iperf::IperfArgs),

    // RUN ONE COMMAND INSIDE AN IMAGE (OR NONE FOR NATIVE)
    RunImage(cli::run_image::RunImageArgs),

    // VERIFY EXTERNAL TOOLS ARE INSTALLED
    Check,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "enclave_bench=debug" } else { "enclave_bench=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let opts = Cli::parse();
    init_logging(opts.verbose);

    // RECORD THE ABORT, FORWARD SIGINT TO THE ACTIVE CHILD'S GROUP, SIGKILL IT
    // AFTER THE GRACE PERIOD. THE SWEEP SEES EOF ON THE CHILD'S OUTPUT AND
    // UNWINDS NORMALLY.
    ctrlc::set_handler(supervisor::request_shutdown)?;

    match opts.command {
        Commands::Fio(args) => cli::fio::run_fio(args),
        Commands::Iperf(args) => cli::iperf::run_iperf(args),
        Commands::RunImage(args) => {
            let code = cli::run_image::run_image(args)?;
            std::process::exit(code);
        }
        Commands::Check => {
            if !cli::check::run_check() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
