// IMAGE RUNNER
// RUNS ONE COMMAND INSIDE A FILESYSTEM IMAGE (OR NATIVELY FOR NONE) WITH THE
// WRAPPER THE FEATURE FLAGS SELECT. EVERYTHING LIVES IN A PRIVATE TEMP
// DIRECTORY; TEARDOWN ORDER IS CHILD -> DEBUG MOUNT -> FLAMEGRAPH -> DIRECTORY.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use enclave_bench::debug_mount::{DebugMount, SudoMounter};
use enclave_bench::launcher::FeatureFlags;
use enclave_bench::profiling::ProfilingSession;
use enclave_bench::supervisor::{exit_code, BenchmarkRun, LaunchSpec, OutputMode};

use super::now_stamp;

pub const NATIVE_IMAGE: &str = "NONE";
const RUNNER: &str = "sgx-lkl-run";
const FS_IMAGE: &str = "fs.img";

#[derive(Args)]
pub struct RunImageArgs {
    // FILESYSTEM IMAGE, OR NONE TO RUN THE COMMAND ON THE HOST
    pub image: String,

    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub cmd: Vec<String>,
}

pub fn image_command(fs_image: Option<&Path>, cmd: &[String]) -> Vec<String> {
    let mut argv = Vec::with_capacity(cmd.len() + 2);
    if let Some(img) = fs_image {
        argv.push(RUNNER.to_string());
        argv.push(img.display().to_string());
    }
    argv.extend(cmd.iter().cloned());
    argv
}

// RETURNS THE CHILD'S EXIT CODE; THE CALLER EXITS WITH IT AFTER ALL GUARDS DROP
pub fn run_image(args: RunImageArgs) -> Result<i32> {
    let stamp = now_stamp();
    let mut env = FeatureFlags::process_env();
    let flags = FeatureFlags::from_env(&env);
    let image = (args.image != NATIVE_IMAGE).then(|| PathBuf::from(&args.image));

    let scope = tempfile::Builder::new()
        .prefix("run-image-")
        .tempdir()
        .context("creating run directory")?;
    let mut session = ProfilingSession::arm(&flags, scope.path(), &stamp);
    let mounter = SudoMounter;
    let mount = DebugMount::open(&mounter, flags.flamegraph, image.as_deref())?;
    mount.apply(&mut env);

    // THE RUNNER MAY WRITE TO THE IMAGE; WORK ON A COPY
    let fs_image = match &image {
        Some(src) => {
            let dst = scope.path().join(FS_IMAGE);
            fs::copy(src, &dst)
                .with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
            Some(dst)
        }
        None => None,
    };

    let argv = session.wrap(&flags, image_command(fs_image.as_deref(), &args.cmd));
    let output = if flags.gdb {
        OutputMode::Terminal
    } else {
        OutputMode::Passthrough
    };
    tracing::info!(wrapper = flags.wrapper().label(), "run-image {}", argv.join(" "));

    let status = {
        let mut run = BenchmarkRun::start(LaunchSpec::new("run-image", argv, env).output(output))?;
        run.wait_for_exit()?
    };

    drop(mount);
    match session.finish() {
        Ok(Some(svg)) => println!("FLAMEGRAPH: {}", svg.display()),
        Ok(None) => {}
        Err(e) => tracing::error!("flamegraph rendering failed: {}", e),
    }
    Ok(exit_code(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd() -> Vec<String> {
        vec!["bin/redis-server".into(), "--port".into(), "6379".into()]
    }

    #[test]
    fn native_runs_command_directly() {
        assert_eq!(image_command(None, &cmd()), cmd());
    }

    #[test]
    fn image_runs_under_runner() {
        let argv = image_command(Some(Path::new("/tmp/run-image-x/fs.img")), &cmd());
        assert_eq!(argv[0], "sgx-lkl-run");
        assert_eq!(argv[1], "/tmp/run-image-x/fs.img");
        assert_eq!(&argv[2..], cmd().as_slice());
    }
}
