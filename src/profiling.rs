// ENCLAVE-BENCH PROFILING SESSION
// DISABLED -> ARMED -> CAPTURING -> RENDERING -> DONE
//
// ARMED WHEN THE FLAMEGRAPH FLAG SELECTS THE PROFILER WRAPPER. WHILE
// CAPTURING, THE MEASUREMENT COMMAND RUNS UNDER `perf record` WRITING RAW
// SAMPLES INTO THE SESSION SCOPE. ON FINISH (OR DROP) THE SAMPLES GO THROUGH
//   perf script | stackcollapse-perf.pl | flamegraph.pl > <svg>
// AND THE RAW FILE MOVES TO ITS CONFIGURED DESTINATION, IF ANY, WHETHER OR
// NOT RENDERING SUCCEEDED.
// RENDERING FAILURES ARE REPORTED, NEVER PROPAGATED INTO THE MEASUREMENT.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use thiserror::Error;

use crate::launcher::{self, FeatureFlags, Wrapper};

pub const RAW_SAMPLES_NAME: &str = "perf.data";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileState {
    Disabled,
    Armed,
    Capturing,
    Rendering,
    Done,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProfilerTools {
    pub sampler: String,
    pub collapse: String,
    pub render: String,
}

impl Default for ProfilerTools {
    fn default() -> Self {
        Self {
            sampler: "perf".into(),
            collapse: "stackcollapse-perf.pl".into(),
            render: "flamegraph.pl".into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to start {stage}: {source}")]
    Spawn {
        stage: String,
        #[source]
        source: io::Error,
    },

    #[error("{stage} exited with {status}")]
    Stage { stage: String, status: ExitStatus },

    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub struct ProfilingSession {
    state: ProfileState,
    raw: PathBuf,
    render_dest: PathBuf,
    raw_dest: Option<PathBuf>,
    tools: ProfilerTools,
}

impl ProfilingSession {
    // `scope` IS A PRIVATE DIRECTORY THAT OUTLIVES THE SESSION
    pub fn arm(flags: &FeatureFlags, scope: &Path, stamp: &str) -> Self {
        let state = if flags.wrapper() == Wrapper::Profiler {
            ProfileState::Armed
        } else {
            ProfileState::Disabled
        };
        let render_dest = flags
            .flamegraph_path
            .clone()
            .unwrap_or_else(|| scope.join(format!("flamegraph-{stamp}.svg")));
        Self {
            state,
            raw: scope.join(RAW_SAMPLES_NAME),
            render_dest,
            raw_dest: flags.perf_path.clone(),
            tools: ProfilerTools::default(),
        }
    }

    pub fn with_tools(mut self, tools: ProfilerTools) -> Self {
        self.tools = tools;
        self
    }

    pub fn state(&self) -> ProfileState {
        self.state
    }

    pub fn raw_samples(&self) -> &Path {
        &self.raw
    }

    pub fn render_dest(&self) -> &Path {
        &self.render_dest
    }

    // PREFIX THE COMMAND FOR WHICHEVER WRAPPER THE FLAGS SELECT.
    // ONLY AN ARMED SESSION ADDS THE PROFILER AND STARTS CAPTURING.
    pub fn wrap(&mut self, flags: &FeatureFlags, cmd: Vec<String>) -> Vec<String> {
        if self.state == ProfileState::Armed {
            self.state = ProfileState::Capturing;
            let prefix = launcher::profiler_prefix(&self.tools.sampler, &self.raw);
            return launcher::wrap(&prefix, &cmd);
        }
        match flags.wrapper() {
            Wrapper::Debugger | Wrapper::Tracer => {
                launcher::wrap(&launcher::command_prefix(flags, &self.raw), &cmd)
            }
            Wrapper::None | Wrapper::Profiler => cmd,
        }
    }

    // RENDER AND RELOCATE. RETURNS THE RENDERED PATH WHEN SOMETHING WAS CAPTURED.
    pub fn finish(&mut self) -> Result<Option<PathBuf>, ProfileError> {
        match self.state {
            ProfileState::Disabled | ProfileState::Done => {
                self.state = ProfileState::Done;
                return Ok(None);
            }
            ProfileState::Armed => {
                tracing::warn!("profiling armed but nothing was captured");
                self.state = ProfileState::Done;
                return Ok(None);
            }
            ProfileState::Capturing | ProfileState::Rendering => {}
        }

        // RAW SAMPLES ARE KEPT EVEN WHEN RENDERING FAILS
        self.state = ProfileState::Rendering;
        let rendered = self.render();
        let relocated = self.relocate_raw();
        self.state = ProfileState::Done;
        rendered.and(relocated).map(|_| Some(self.render_dest.clone()))
    }

    fn render(&self) -> Result<(), ProfileError> {
        ensure_parent(&self.render_dest)?;
        let out = File::create(&self.render_dest).map_err(|source| ProfileError::Io {
            action: "create",
            path: self.render_dest.clone(),
            source,
        })?;

        let raw = self.raw.display().to_string();
        let mut script = spawn_stage(
            Command::new(&self.tools.sampler)
                .args(["script", "-i", raw.as_str()])
                .stdout(Stdio::piped()),
            &self.tools.sampler,
        )?;
        let mut stages: Vec<(String, Child)> = Vec::with_capacity(3);
        let script_out = script.stdout.take();
        stages.push((format!("{} script", self.tools.sampler), script));

        let collapse = Command::new(&self.tools.collapse)
            .stdin(script_out.map(Stdio::from).unwrap_or_else(Stdio::null))
            .stdout(Stdio::piped())
            .spawn();
        let mut collapse = match collapse {
            Ok(c) => c,
            Err(source) => {
                reap(stages);
                return Err(ProfileError::Spawn {
                    stage: self.tools.collapse.clone(),
                    source,
                });
            }
        };
        let collapse_out = collapse.stdout.take();
        stages.push((self.tools.collapse.clone(), collapse));

        let render = Command::new(&self.tools.render)
            .stdin(collapse_out.map(Stdio::from).unwrap_or_else(Stdio::null))
            .stdout(Stdio::from(out))
            .spawn();
        match render {
            Ok(r) => stages.push((self.tools.render.clone(), r)),
            Err(source) => {
                reap(stages);
                return Err(ProfileError::Spawn {
                    stage: self.tools.render.clone(),
                    source,
                });
            }
        }

        // WAIT FOR EVERY STAGE, REPORT THE FIRST FAILURE
        let mut first_err = None;
        for (stage, mut child) in stages {
            match child.wait() {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    first_err.get_or_insert(ProfileError::Stage { stage, status });
                }
                Err(source) => {
                    first_err.get_or_insert(ProfileError::Spawn { stage, source });
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                tracing::info!("flamegraph written to {}", self.render_dest.display());
                Ok(())
            }
        }
    }

    fn relocate_raw(&self) -> Result<(), ProfileError> {
        let Some(dest) = &self.raw_dest else {
            return Ok(());
        };
        ensure_parent(dest)?;
        move_file(&self.raw, dest).map_err(|source| ProfileError::Io {
            action: "move raw samples to",
            path: dest.clone(),
            source,
        })
    }
}

impl Drop for ProfilingSession {
    fn drop(&mut self) {
        if self.state != ProfileState::Done {
            if let Err(e) = self.finish() {
                tracing::error!("flamegraph rendering failed: {}", e);
            }
        }
    }
}

fn spawn_stage(cmd: &mut Command, stage: &str) -> Result<Child, ProfileError> {
    cmd.spawn().map_err(|source| ProfileError::Spawn {
        stage: stage.to_string(),
        source,
    })
}

fn reap(stages: Vec<(String, Child)>) {
    for (_, mut child) in stages {
        let _ = child.kill();
        let _ = child.wait();
    }
}

fn ensure_parent(path: &Path) -> Result<(), ProfileError> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => fs::create_dir_all(parent).map_err(|source| ProfileError::Io {
            action: "create",
            path: parent.to_path_buf(),
            source,
        }),
        None => Ok(()),
    }
}

// RENAME, FALLING BACK TO COPY+REMOVE ACROSS FILESYSTEMS
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{EnvMap, FLAMEGRAPH_FLAG, GDB_FLAG};

    fn flags(pairs: &[(&str, &str)]) -> FeatureFlags {
        let env: EnvMap = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        FeatureFlags::from_env(&env)
    }

    fn cmd() -> Vec<String> {
        vec!["fio".into(), "job".into()]
    }

    #[test]
    fn disabled_passes_command_through() {
        let mut s = ProfilingSession::arm(&flags(&[]), Path::new("/tmp/s"), "t");
        assert_eq!(s.state(), ProfileState::Disabled);
        assert_eq!(s.wrap(&flags(&[]), cmd()), cmd());
        assert_eq!(s.finish().unwrap(), None);
        assert_eq!(s.state(), ProfileState::Done);
    }

    #[test]
    fn armed_session_captures_into_scope() {
        let f = flags(&[(FLAMEGRAPH_FLAG, "1")]);
        let mut s = ProfilingSession::arm(&f, Path::new("/tmp/s"), "20260101-000000");
        assert_eq!(s.state(), ProfileState::Armed);
        assert_eq!(s.render_dest(), Path::new("/tmp/s/flamegraph-20260101-000000.svg"));
        let argv = s.wrap(&f, cmd());
        assert_eq!(s.state(), ProfileState::Capturing);
        assert_eq!(argv[..4], ["perf", "record", "-o", "/tmp/s/perf.data"]);
        assert_eq!(argv[argv.len() - 2..], cmd()[..]);
        // NOTHING TO RENDER HERE; MARK DONE SO DROP STAYS QUIET
        s.state = ProfileState::Done;
    }

    #[test]
    fn debugger_disables_profiling() {
        let f = flags(&[(FLAMEGRAPH_FLAG, "1"), (GDB_FLAG, "1")]);
        let mut s = ProfilingSession::arm(&f, Path::new("/tmp/s"), "t");
        assert_eq!(s.state(), ProfileState::Disabled);
        let argv = s.wrap(&f, cmd());
        assert_eq!(argv[0], "sgx-lkl-gdb");
    }

    #[test]
    fn armed_without_capture_renders_nothing() {
        let f = flags(&[(FLAMEGRAPH_FLAG, "1")]);
        let mut s = ProfilingSession::arm(&f, Path::new("/nonexistent"), "t");
        assert_eq!(s.finish().unwrap(), None);
    }

    #[test]
    fn destination_override_from_flags() {
        let f = flags(&[(FLAMEGRAPH_FLAG, "1"), ("FLAMEGRAPH_FILENAME", "/out/x.svg")]);
        let mut s = ProfilingSession::arm(&f, Path::new("/tmp/s"), "t");
        assert_eq!(s.render_dest(), Path::new("/out/x.svg"));
        s.state = ProfileState::Done;
    }

    #[test]
    fn move_file_within_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        fs::write(&from, "samples").unwrap();
        move_file(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read_to_string(&to).unwrap(), "samples");
    }
}
