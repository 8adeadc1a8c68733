// ENCLAVE-BENCH ENVIRONMENT COMPOSER
// BUILDS THE EXACT VARIABLE SET HANDED TO A MEASUREMENT CHILD.
// PURE FUNCTION OF ITS INPUTS. RULES APPLY IN ORDER, LATER RULES WIN:
//   BASE ENV -> DROP NETWORK TAP (OFFLINE MODES) -> WORKDIR ->
//   PROFILING PATHS -> BACKEND OVERRIDES -> CALLER OVERRIDES

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::launcher::{EnvMap, FeatureFlags, FLAMEGRAPH_FILENAME, PERF_FILENAME};

pub const TAP_VAR: &str = "SGXLKL_TAP";
pub const CWD_VAR: &str = "SGXLKL_CWD";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Storage,
    Network,
}

impl Mode {
    pub fn needs_network(self) -> bool {
        match self {
            Self::Storage => false,
            Self::Network => true,
        }
    }
}

pub struct EnvRequest<'a> {
    pub mode: Mode,
    pub base: &'a EnvMap,
    pub workdir: Option<&'a Path>,
    pub run_name: &'a str,
    pub profile_dir: &'a Path,
    pub backend: &'a EnvMap,
    pub overrides: &'a EnvMap,
}

// RUN NAMES END UP IN FILE NAMES
pub fn sanitize_run_name(name: &str) -> String {
    match Regex::new(r"[^A-Za-z0-9._-]+") {
        Ok(re) => re.replace_all(name, "_").into_owned(),
        Err(_) => name.to_string(),
    }
}

// PER-RUN PROFILE OUTPUT PATHS. EMPTY UNLESS PROFILING IS ON.
pub fn instrumentation_env(flags: &FeatureFlags, profile_dir: &Path, run_name: &str) -> EnvMap {
    let mut env = EnvMap::new();
    if !flags.flamegraph {
        return env;
    }
    let stem = sanitize_run_name(run_name);
    let svg: PathBuf = profile_dir.join(format!("{stem}.svg"));
    let raw: PathBuf = profile_dir.join(format!("{stem}.perf.data"));
    env.insert(FLAMEGRAPH_FILENAME.into(), svg.display().to_string());
    env.insert(PERF_FILENAME.into(), raw.display().to_string());
    env
}

pub fn compose(req: &EnvRequest<'_>) -> EnvMap {
    let mut env = req.base.clone();

    // A TAP DEVICE WITH NO ATTACHED NETWORK IS A LATENT HAZARD
    if !req.mode.needs_network() {
        env.remove(TAP_VAR);
    }

    if let Some(dir) = req.workdir {
        env.insert(CWD_VAR.into(), dir.display().to_string());
    }

    let flags = FeatureFlags::from_env(req.base);
    env.extend(instrumentation_env(&flags, req.profile_dir, req.run_name));

    env.extend(req.backend.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(req.overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

// PARSE KEY=VALUE PAIRS FROM THE COMMAND LINE
pub fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}
