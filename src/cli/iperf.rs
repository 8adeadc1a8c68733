// NETWORK SWEEP
// PER SYSTEM AND DIRECTION: START THE LOCAL IPERF SERVER, WAIT FOR THE PEER
// TO REACH IT, RUN THE REMOTE CLIENT, NORMALIZE ITS JSON REPORT.
// THE SERVER IS A SUPERVISED RUN; IT IS SHUT DOWN GRACEFULLY AFTER EVERY
// DIRECTION, ALSO WHEN THE REMOTE SIDE FAILS.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, ValueEnum};
use serde_json::Value;

use enclave_bench::artifact::{ArtifactBuilder, NixBuilder};
use enclave_bench::environment::{compose, parse_assignment, EnvRequest, Mode};
use enclave_bench::export::write_tsv;
use enclave_bench::launcher::{self, EnvMap, FeatureFlags, Wrapper};
use enclave_bench::ledger::ResultLedger;
use enclave_bench::normalize::append_throughput;
use enclave_bench::remote::{RemoteCommand, SshRemote};
use enclave_bench::retry::{print_dot, retry_until_ready, RetryPolicy};
use enclave_bench::supervisor::{shutdown_requested, BenchmarkRun, LaunchSpec, OutputMode};

use super::{banner, now_stamp, override_map};

const REMOTE_ATTR: &str = "iperf-remote";
const REMOTE_BINARY: &str = "bin/iperf";
const PARALLEL_STREAMS: &str = "4";
const PROBE_BYTES: &str = "1024";
const MTU: &str = "9000";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum NetworkSystem {
    SgxIo,
    Native,
    SgxLkl,
}

impl NetworkSystem {
    pub fn label(self) -> &'static str {
        match self {
            Self::SgxIo => "sgx-io",
            Self::Native => "native",
            Self::SgxLkl => "sgx-lkl",
        }
    }

    // NATIVE HAS ITS OWN BUILD; BOTH ENCLAVE BACKENDS SHARE ONE IMAGE
    pub fn attr(self) -> &'static str {
        match self {
            Self::Native => "iperf-native",
            Self::SgxIo | Self::SgxLkl => "iperf",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Send, Direction::Receive];

    pub fn label(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Receive => "receive",
        }
    }
}

#[derive(Args)]
pub struct IperfArgs {
    // PEER THAT RUNS THE IPERF CLIENT
    #[arg(long)]
    pub remote_host: String,

    // ADDRESS OF THE LOCAL SERVER AS SEEN BY THE PEER
    #[arg(long)]
    pub local_ip6: String,

    #[arg(long, value_enum, value_delimiter = ',', default_value = "sgx-io,native,sgx-lkl")]
    pub systems: Vec<NetworkSystem>,

    // GIVE UP ON THE PEER AFTER N PROBES (DEFAULT: NEVER)
    #[arg(long)]
    pub probe_attempts: Option<u32>,

    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_assignment)]
    pub set: Vec<(String, String)>,

    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,

    #[arg(long, default_value = ".")]
    pub nix_root: PathBuf,

    #[arg(long, default_value = ".")]
    pub profile_dir: PathBuf,
}

impl IperfArgs {
    fn retry_policy(&self) -> RetryPolicy {
        match self.probe_attempts {
            Some(n) => RetryPolicy::capped(n),
            None => RetryPolicy::unbounded(),
        }
    }
}

// PASSED TO THE LOCAL SERVER AND TO THE REMOTE CLIENT ALIKE
pub fn backend_env(system: NetworkSystem, local_ip6: &str) -> EnvMap {
    let mut env = EnvMap::new();
    match system {
        NetworkSystem::SgxLkl => {
            env.insert("SGXLKL_IP6".into(), local_ip6.into());
            env.insert("SGXLKL_TAP_OFFLOAD".into(), "1".into());
            env.insert("SGXLKL_TAP_MTU".into(), MTU.into());
        }
        NetworkSystem::SgxIo => {
            env.insert("SGXLKL_DPDK_MTU".into(), MTU.into());
        }
        NetworkSystem::Native => {}
    }
    env
}

pub fn probe_args(local_ip6: &str) -> Vec<String> {
    vec!["-c".into(), local_ip6.into(), "-n".into(), PROBE_BYTES.into()]
}

// SEND IS MEASURED WITH THE PEER IN REVERSE MODE (LOCAL SERVER TRANSMITS)
pub fn client_args(local_ip6: &str, direction: Direction) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-P".into(),
        PARALLEL_STREAMS.into(),
        "-c".into(),
        local_ip6.into(),
        "--json".into(),
    ];
    if direction == Direction::Send {
        args.push("-R".into());
    }
    args
}

// THE SERVER IMAGE ITSELF; ONLY INTERACTIVE WRAPPERS APPLY, SAMPLING IS
// DRIVEN THROUGH THE INSTRUMENTATION VARIABLES
fn server_command(flags: &FeatureFlags, server: &Path, profile_dir: &Path) -> Vec<String> {
    let cmd = vec![server.display().to_string()];
    match flags.wrapper() {
        Wrapper::Debugger | Wrapper::Tracer => {
            let prefix = launcher::command_prefix(flags, &profile_dir.join("perf.data"));
            launcher::wrap(&prefix, &cmd)
        }
        Wrapper::None | Wrapper::Profiler => cmd,
    }
}

struct Sweep<'a, R: RemoteCommand> {
    args: &'a IperfArgs,
    remote: &'a R,
    base: EnvMap,
    flags: FeatureFlags,
    overrides: EnvMap,
    stamp: String,
}

impl<R: RemoteCommand> Sweep<'_, R> {
    // Ok(None): INTERRUPTED WHILE WAITING FOR THE PEER
    fn measure_direction(
        &self,
        server: &Path,
        system: NetworkSystem,
        direction: Direction,
    ) -> Result<Option<Value>> {
        let label = system.label();
        let run_name = format!("iperf-{}-{}-{}", direction.label(), label, self.stamp);
        let backend = backend_env(system, &self.args.local_ip6);
        let env = compose(&EnvRequest {
            mode: Mode::Network,
            base: &self.base,
            workdir: None,
            run_name: &run_name,
            profile_dir: &self.args.profile_dir,
            backend: &backend,
            overrides: &self.overrides,
        });
        let output = if self.flags.gdb {
            OutputMode::Terminal
        } else {
            OutputMode::Passthrough
        };
        let spec = LaunchSpec::new(
            format!("iperf-server-{}", label),
            server_command(&self.flags, server, &self.args.profile_dir),
            env,
        )
        .output(output);

        let mut run = BenchmarkRun::start(spec)
            .with_context(|| format!("starting iperf server for {}", label))?;

        let probe = probe_args(&self.args.local_ip6);
        let no_env = EnvMap::new();
        let ready = retry_until_ready(
            self.args.retry_policy(),
            || {
                if shutdown_requested() {
                    return Ok(false);
                }
                self.remote.run(REMOTE_BINARY, &probe, &no_env).map(|_| true)
            },
            print_dot,
        )
        .map_err(|e| anyhow!("{}: {}", self.args.remote_host, e))?;
        println!();
        if !ready {
            return Ok(None);
        }

        let report = self.remote.run(
            REMOTE_BINARY,
            &client_args(&self.args.local_ip6, direction),
            &backend,
        )?;

        println!("STOP {}...", run.label());
        let outcome = run.shutdown()?;
        if outcome.was_forced() {
            tracing::warn!(system = label, "iperf server needed a forced kill");
        }

        let doc: Value = serde_json::from_str(&report)
            .with_context(|| format!("iperf report for {} {}", label, direction.label()))?;
        Ok(Some(doc))
    }
}

pub fn run_iperf(args: IperfArgs) -> Result<()> {
    let stamp = now_stamp();
    let base = FeatureFlags::process_env();
    let flags = FeatureFlags::from_env(&base);
    let builder = NixBuilder::new(&args.nix_root);

    banner("ENCLAVE-BENCH NETWORK SWEEP (IPERF)");

    let remote = SshRemote::new(&args.remote_host, builder.build(REMOTE_ATTR)?);
    let sweep = Sweep {
        args: &args,
        remote: &remote,
        base,
        flags,
        overrides: override_map(&args.set),
        stamp,
    };

    let mut ledger = ResultLedger::new();
    let mut failed: Vec<&'static str> = Vec::new();

    'systems: for &system in &args.systems {
        let label = system.label();
        if shutdown_requested() {
            println!("INTERRUPTED -- SKIPPING REMAINING SYSTEMS");
            break;
        }
        let server = builder.build(system.attr())?;

        for direction in Direction::ALL {
            println!("[BENCHMARK]: {} {}", label, direction.label());
            let doc = match sweep.measure_direction(&server, system, direction) {
                Ok(Some(doc)) => doc,
                Ok(None) => break 'systems,
                Err(e) => {
                    println!("[BENCHMARK]: {} {} FAILED: {:#}", label, direction.label(), e);
                    tracing::error!(system = label, direction = direction.label(), "{:#}", e);
                    failed.push(label);
                    continue 'systems;
                }
            };
            match append_throughput(&doc, direction.label(), label, &mut ledger) {
                Ok(n) => println!("[BENCHMARK]: {} {} OK ({} INTERVALS)", label, direction.label(), n),
                Err(e) => {
                    println!("[BENCHMARK]: {} {} FAILED: {}", label, direction.label(), e);
                    tracing::error!(system = label, "unusable iperf report: {}", e);
                    failed.push(label);
                    continue 'systems;
                }
            }
        }
    }

    let (stamped, _latest) = write_tsv(&ledger, &args.out_dir, "iperf", &sweep.stamp)?;
    println!("{}", stamped.display());
    if !failed.is_empty() {
        println!("FAILED SYSTEMS: {}", failed.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    // PEER THAT IS UNREACHABLE FOR THE FIRST `warmup` PROBES
    struct FakeRemote {
        warmup: usize,
        calls: RefCell<Vec<(Vec<String>, EnvMap)>>,
    }

    impl RemoteCommand for FakeRemote {
        fn run(&self, binary: &str, args: &[String], extra_env: &EnvMap) -> Result<String> {
            assert_eq!(binary, REMOTE_BINARY);
            let mut calls = self.calls.borrow_mut();
            calls.push((args.to_vec(), extra_env.clone()));
            if args.iter().any(|a| a == "-n") {
                if calls.len() <= self.warmup {
                    return Err(anyhow!("connection refused"));
                }
                return Ok(String::new());
            }
            Ok(r#"{"intervals": [], "end": {"cpu_utilization_percent": {}}}"#.to_string())
        }
    }

    fn iperf_args(probe_attempts: Option<u32>) -> IperfArgs {
        IperfArgs {
            remote_host: "peer".into(),
            local_ip6: "fd00::1".into(),
            systems: vec![NetworkSystem::SgxLkl],
            probe_attempts,
            set: Vec::new(),
            out_dir: PathBuf::from("."),
            nix_root: PathBuf::from("."),
            profile_dir: PathBuf::from("."),
        }
    }

    fn sweep<'a>(args: &'a IperfArgs, remote: &'a FakeRemote) -> Sweep<'a, FakeRemote> {
        Sweep {
            args,
            remote,
            base: FeatureFlags::process_env(),
            flags: FeatureFlags::default(),
            overrides: EnvMap::new(),
            stamp: "20260101-000000".into(),
        }
    }

    #[test]
    fn measures_once_peer_answers_probe() {
        let args = iperf_args(None);
        let remote = FakeRemote { warmup: 2, calls: RefCell::new(Vec::new()) };
        let doc = sweep(&args, &remote)
            .measure_direction(Path::new("true"), NetworkSystem::SgxLkl, Direction::Send)
            .unwrap();
        assert!(doc.is_some());

        let calls = remote.calls.borrow();
        assert_eq!(calls.len(), 4);
        assert!(calls[..3].iter().all(|(a, env)| a == &probe_args("fd00::1") && env.is_empty()));
        let (measure_args, measure_env) = &calls[3];
        assert_eq!(measure_args, &client_args("fd00::1", Direction::Send));
        assert_eq!(measure_env, &backend_env(NetworkSystem::SgxLkl, "fd00::1"));
    }

    #[test]
    fn capped_probe_gives_up() {
        let args = iperf_args(Some(2));
        let remote = FakeRemote { warmup: usize::MAX, calls: RefCell::new(Vec::new()) };
        let err = sweep(&args, &remote)
            .measure_direction(Path::new("true"), NetworkSystem::SgxIo, Direction::Receive)
            .unwrap_err();
        assert!(err.to_string().contains("after 2 attempts"), "{err}");
        assert_eq!(remote.calls.borrow().len(), 2);
    }

    #[test]
    fn send_runs_peer_in_reverse() {
        let send = client_args("fd00::1", Direction::Send);
        assert_eq!(send, ["-P", "4", "-c", "fd00::1", "--json", "-R"]);
        let recv = client_args("fd00::1", Direction::Receive);
        assert!(!recv.iter().any(|a| a == "-R"));
    }

    #[test]
    fn probe_moves_one_kilobyte() {
        assert_eq!(probe_args("fd00::1"), ["-c", "fd00::1", "-n", "1024"]);
    }

    #[test]
    fn backend_env_per_system() {
        let lkl = backend_env(NetworkSystem::SgxLkl, "fd00::1");
        assert_eq!(lkl["SGXLKL_IP6"], "fd00::1");
        assert_eq!(lkl["SGXLKL_TAP_OFFLOAD"], "1");
        assert_eq!(lkl["SGXLKL_TAP_MTU"], "9000");

        let io = backend_env(NetworkSystem::SgxIo, "fd00::1");
        assert_eq!(io.len(), 1);
        assert_eq!(io["SGXLKL_DPDK_MTU"], "9000");

        assert!(backend_env(NetworkSystem::Native, "fd00::1").is_empty());
    }

    #[test]
    fn native_has_its_own_build() {
        assert_eq!(NetworkSystem::Native.attr(), "iperf-native");
        assert_eq!(NetworkSystem::SgxLkl.attr(), NetworkSystem::SgxIo.attr());
    }

    #[test]
    fn plain_server_command_without_wrappers() {
        let flags = FeatureFlags::default();
        let cmd = server_command(&flags, Path::new("/s/iperf"), Path::new("/tmp"));
        assert_eq!(cmd, ["/s/iperf"]);
    }
}
