// ENCLAVE-BENCH LAUNCHER FLAGS
// ENVIRONMENT-DRIVEN FEATURE FLAGS AND THE COMMAND PREFIX THEY SELECT.
// READ ONCE FROM THE BASE ENVIRONMENT; NOTHING DEEPER CONSULTS std::env.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const GDB_FLAG: &str = "SGXLKL_ENABLE_GDB";
pub const STRACE_FLAG: &str = "SGXLKL_ENABLE_STRACE";
pub const FLAMEGRAPH_FLAG: &str = "SGXLKL_ENABLE_FLAMEGRAPH";
pub const FLAMEGRAPH_FILENAME: &str = "FLAMEGRAPH_FILENAME";
pub const PERF_FILENAME: &str = "PERF_FILENAME";

// SAMPLING FREQUENCY PASSED TO THE PROFILER
pub const SAMPLE_FREQ: &str = "-F99";

pub type EnvMap = BTreeMap<String, String>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    pub gdb: bool,
    pub strace: bool,
    pub flamegraph: bool,
    pub flamegraph_path: Option<PathBuf>,
    pub perf_path: Option<PathBuf>,
}

// A FLAG IS SET WHEN PRESENT WITH ANY VALUE OTHER THAN "0"
fn flag_set(env: &EnvMap, key: &str) -> bool {
    env.get(key).map(|v| v != "0").unwrap_or(false)
}

fn path_var(env: &EnvMap, key: &str) -> Option<PathBuf> {
    env.get(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

impl FeatureFlags {
    pub fn from_env(env: &EnvMap) -> Self {
        Self {
            gdb: flag_set(env, GDB_FLAG),
            strace: flag_set(env, STRACE_FLAG),
            flamegraph: flag_set(env, FLAMEGRAPH_FLAG),
            flamegraph_path: path_var(env, FLAMEGRAPH_FILENAME),
            perf_path: path_var(env, PERF_FILENAME),
        }
    }

    // CAPTURE THE CALLING PROCESS ENVIRONMENT AS AN ORDERED MAP
    pub fn process_env() -> EnvMap {
        std::env::vars().collect()
    }

    pub fn wrapper(&self) -> Wrapper {
        if self.gdb {
            Wrapper::Debugger
        } else if self.strace {
            Wrapper::Tracer
        } else if self.flamegraph {
            Wrapper::Profiler
        } else {
            Wrapper::None
        }
    }

    // OUTPUT CAPTURE IS SKIPPED UNDER AN INTERACTIVE DEBUGGER
    pub fn captures_output(&self) -> bool {
        !self.gdb
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wrapper {
    None,
    Debugger,
    Tracer,
    Profiler,
}

impl Wrapper {
    pub fn label(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Debugger => "GDB",
            Self::Tracer => "STRACE",
            Self::Profiler => "PERF",
        }
    }
}

// COMMAND PREFIX FOR THE SELECTED WRAPPER. ONLY ONE WRAPPER EVER APPLIES:
// DEBUGGER > TRACER > PROFILER.
pub fn command_prefix(flags: &FeatureFlags, raw_samples: &Path) -> Vec<String> {
    match flags.wrapper() {
        Wrapper::None => Vec::new(),
        Wrapper::Debugger => vec!["sgx-lkl-gdb".into(), "--args".into()],
        Wrapper::Tracer => vec!["strace".into()],
        Wrapper::Profiler => profiler_prefix("perf", raw_samples),
    }
}

pub fn profiler_prefix(sampler: &str, raw_samples: &Path) -> Vec<String> {
    vec![
        sampler.to_string(),
        "record".into(),
        "-o".into(),
        raw_samples.display().to_string(),
        "-a".into(),
        "-g".into(),
        SAMPLE_FREQ.into(),
        "--".into(),
    ]
}

pub fn wrap(prefix: &[String], cmd: &[String]) -> Vec<String> {
    prefix.iter().chain(cmd.iter()).cloned().collect()
}
