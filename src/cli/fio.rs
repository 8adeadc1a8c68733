// STORAGE SWEEP
// RUNS THE FIO IMAGE FOR EACH STORAGE BACKEND, EXTRACTS THE JSON REPORT FROM
// THE LIVE OUTPUT, APPENDS ONE ROW PER FIO JOB TO THE LEDGER.
//
// FAILURE POLICY:
//   BUILD / LAUNCH FAILURE          -> ABORT THE WHOLE SWEEP
//   NO RESULT / BAD RESULT          -> LOG, NOTHING APPENDED, NEXT SYSTEM
// THE LEDGER IS PERSISTED AFTER EVERY COMPLETED SYSTEM SO A RESTART SKIPS IT.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};

use enclave_bench::artifact::{ArtifactBuilder, NixBuilder};
use enclave_bench::environment::{compose, parse_assignment, EnvRequest, Mode};
use enclave_bench::export::write_tsv;
use enclave_bench::launcher::{EnvMap, FeatureFlags};
use enclave_bench::ledger::ResultLedger;
use enclave_bench::measure::measure;
use enclave_bench::normalize::append_storage;
use enclave_bench::supervisor::{shutdown_requested, LaunchSpec, OutputMode};

use super::{banner, now_stamp, override_map};

const JOB_FILE: &str = "fio-rand-RW.job";
const EXPORT_PREFIX: &str = "fio-throughput";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StorageSystem {
    Native,
    SgxIo,
    Scone,
    SgxLkl,
}

impl StorageSystem {
    pub fn label(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::SgxIo => "sgx-io",
            Self::Scone => "scone",
            Self::SgxLkl => "sgx-lkl",
        }
    }

    pub fn attr(self) -> String {
        format!("fio-{}", self.label())
    }
}

#[derive(Args)]
pub struct FioArgs {
    // DIRECTORY ON THE PREPARED STORAGE BACKEND (EXPORTED AS SGXLKL_CWD)
    #[arg(long)]
    pub workdir: PathBuf,

    // SYSTEMS TO MEASURE, IN ORDER
    #[arg(long, value_enum, value_delimiter = ',', default_value = "native,sgx-io,scone,sgx-lkl")]
    pub systems: Vec<StorageSystem>,

    // EXTRA CHILD ENVIRONMENT, WINS OVER EVERYTHING ELSE
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_assignment)]
    pub set: Vec<(String, String)>,

    // RESULTS LEDGER, RESUMED ACROSS INVOCATIONS
    #[arg(long, default_value = "fio.json")]
    pub ledger: PathBuf,

    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,

    // NIX EXPRESSION PROVIDING THE fio-* ATTRIBUTES
    #[arg(long, default_value = ".")]
    pub nix_root: PathBuf,

    // WHERE PER-RUN FLAMEGRAPHS LAND WHEN PROFILING
    #[arg(long, default_value = ".")]
    pub profile_dir: PathBuf,
}

// THREAD COUNT AND SGX-IO TOGGLE PER BACKEND
pub fn backend_env(system: StorageSystem) -> EnvMap {
    let sgx_io = system == StorageSystem::SgxIo;
    let mut env = EnvMap::new();
    env.insert("SGXLKL_ENABLE_SGXIO".into(), if sgx_io { "1" } else { "0" }.into());
    env.insert("SGXLKL_ETHREADS".into(), if sgx_io { "8" } else { "2" }.into());
    env
}

pub fn fio_command(fio: &Path) -> Vec<String> {
    vec![
        fio.display().to_string(),
        "bin/fio".into(),
        "--output-format=json".into(),
        "--eta=always".into(),
        JOB_FILE.into(),
    ]
}

pub fn run_fio(args: FioArgs) -> Result<()> {
    let stamp = now_stamp();
    let base = FeatureFlags::process_env();
    let flags = FeatureFlags::from_env(&base);
    let builder = NixBuilder::new(&args.nix_root);
    let overrides = override_map(&args.set);

    let mut ledger = ResultLedger::load(&args.ledger)?;
    let done = ledger.systems();
    let mut failed: Vec<&'static str> = Vec::new();

    banner("ENCLAVE-BENCH STORAGE SWEEP (FIO)");

    for &system in &args.systems {
        let label = system.label();
        if shutdown_requested() {
            println!("INTERRUPTED -- SKIPPING REMAINING SYSTEMS");
            break;
        }
        if done.contains(label) {
            println!("SKIP {} BENCHMARK", label);
            continue;
        }

        let fio = builder.build(&system.attr())?;
        let run_name = format!("fio-{}-{}", label, stamp);
        let backend = backend_env(system);
        let env = compose(&EnvRequest {
            mode: Mode::Storage,
            base: &base,
            workdir: Some(&args.workdir),
            run_name: &run_name,
            profile_dir: &args.profile_dir,
            backend: &backend,
            overrides: &overrides,
        });
        let output = if flags.captures_output() {
            OutputMode::Capture
        } else {
            OutputMode::Terminal
        };

        println!("[BENCHMARK]: {}", label);
        let spec = LaunchSpec::new(label, fio_command(&fio), env).output(output);
        let measurement = match measure(spec, io::stdout()) {
            Ok(m) => m,
            Err(e) if e.is_run_local() => {
                println!("[BENCHMARK]: {} FAILED: {}", label, e);
                tracing::error!(system = label, "no usable measurement: {}", e);
                failed.push(label);
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("launching fio for {}", label)),
        };

        let Some(doc) = measurement.document else {
            println!("[BENCHMARK]: {} RAN WITHOUT CAPTURE, NOTHING RECORDED", label);
            continue;
        };
        match append_storage(&doc, label, &mut ledger) {
            Ok(jobs) => {
                println!("[BENCHMARK]: {} OK ({} JOB{})", label, jobs, if jobs == 1 { "" } else { "S" });
                ledger.persist(&args.ledger)?;
            }
            Err(e) => {
                println!("[BENCHMARK]: {} FAILED: {}", label, e);
                tracing::error!(system = label, "unusable result document: {}", e);
                failed.push(label);
            }
        }
    }

    let (stamped, _latest) = write_tsv(&ledger, &args.out_dir, EXPORT_PREFIX, &stamp)?;
    println!("{}", stamped.display());
    if !failed.is_empty() {
        println!("FAILED SYSTEMS: {}", failed.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sgx_io_gets_more_threads() {
        let env = backend_env(StorageSystem::SgxIo);
        assert_eq!(env["SGXLKL_ENABLE_SGXIO"], "1");
        assert_eq!(env["SGXLKL_ETHREADS"], "8");

        let env = backend_env(StorageSystem::Scone);
        assert_eq!(env["SGXLKL_ENABLE_SGXIO"], "0");
        assert_eq!(env["SGXLKL_ETHREADS"], "2");
    }

    #[test]
    fn command_runs_job_file_with_json_output() {
        let argv = fio_command(Path::new("/nix/store/abc-fio-native"));
        assert_eq!(argv[0], "/nix/store/abc-fio-native");
        assert!(argv.contains(&"--output-format=json".to_string()));
        assert_eq!(argv.last().map(String::as_str), Some(JOB_FILE));
    }

    #[test]
    fn attrs_follow_labels() {
        assert_eq!(StorageSystem::SgxLkl.attr(), "fio-sgx-lkl");
        assert_eq!(StorageSystem::Native.label(), "native");
    }
}
