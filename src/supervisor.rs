// ENCLAVE-BENCH PROCESS SUPERVISOR
// OWNS THE LIFETIME OF EXACTLY ONE EXTERNAL MEASUREMENT PROCESS:
// START, STREAM CONSUMPTION, GRACEFUL INTERRUPT, FORCED KILL, EXIT STATUS.
//
// SHUTDOWN PROTOCOL (MANDATORY ORDER):
//   1. SIGINT  -- LETS THE CHILD FLUSH BUFFERED MEASUREMENTS
//   2. WAIT UP TO GRACEFUL_TIMEOUT FOR VOLUNTARY EXIT
//   3. SIGKILL -- ONCE, ONLY IF STEP 2 TIMED OUT
//   4. WAIT UNCONDITIONALLY
//
// SHUTDOWN RUNS FROM Drop IF THE CALLER NEVER ASKED FOR IT, SO EVERY EXIT
// PATH (EXTRACTION FAILURE, PANIC, OPERATOR ABORT) REAPS THE CHILD.
//
// OPERATOR ABORT: THE CTRL+C HANDLER ONLY FORWARDS SIGINT TO THE REGISTERED
// CHILD. IT NEVER TOUCHES THE OUTPUT PIPE. THE CONTROL THREAD SEES EOF AND
// UNWINDS THROUGH THE SAME GUARDED PATH.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::launcher::EnvMap;

pub const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

// PROCESS GROUP OF THE CHILD THAT AN OPERATOR ABORT SHOULD INTERRUPT (0 = NONE)
static ACTIVE_PGID: AtomicI32 = AtomicI32::new(0);
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

// CALLED FROM THE CTRL+C HANDLER (ITS OWN THREAD, SO BLOCKING IS FINE).
// SIGINT FIRST; IF THE SAME GROUP IS STILL REGISTERED AFTER THE GRACE
// PERIOD, SIGKILL IT. THE CONTROL THREAD MAY BE BLOCKED READING THE CHILD'S
// OUTPUT; THE KILL CLOSES THE PIPE AND IT UNWINDS THROUGH shutdown().
pub fn request_shutdown() {
    request_shutdown_within(GRACEFUL_TIMEOUT);
}

pub fn request_shutdown_within(graceful_timeout: Duration) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    let pgid = ACTIVE_PGID.load(Ordering::SeqCst);
    if pgid <= 0 {
        return;
    }
    unsafe {
        libc::killpg(pgid, libc::SIGINT);
    }

    let deadline = Instant::now() + graceful_timeout;
    while Instant::now() < deadline {
        if ACTIVE_PGID.load(Ordering::SeqCst) != pgid {
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    if ACTIVE_PGID.load(Ordering::SeqCst) == pgid {
        tracing::warn!(pgid, "no exit {:?} after operator abort, sending SIGKILL", graceful_timeout);
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

#[derive(Debug, Error)]
pub enum SuperviseError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("output of {0} is not captured")]
    NoOutput(String),

    #[error("failed to signal {label}: {source}")]
    Signal {
        label: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for {label}: {source}")]
    Wait {
        label: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    // STDOUT PIPED TO THE EXTRACTOR, CHILD IN ITS OWN PROCESS GROUP
    Capture,
    // STDOUT INHERITED, CHILD IN ITS OWN PROCESS GROUP
    Passthrough,
    // INTERACTIVE DEBUGGER: TERMINAL AND PROCESS GROUP INHERITED
    Terminal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    AlreadyExited(ExitStatus),
    Graceful(ExitStatus),
    Forced(ExitStatus),
}

impl ShutdownOutcome {
    pub fn status(self) -> ExitStatus {
        match self {
            Self::AlreadyExited(s) | Self::Graceful(s) | Self::Forced(s) => s,
        }
    }

    pub fn was_forced(self) -> bool {
        matches!(self, Self::Forced(_))
    }
}

pub struct LaunchSpec {
    pub label: String,
    pub argv: Vec<String>,
    pub env: EnvMap,
    pub output: OutputMode,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(label: impl Into<String>, argv: Vec<String>, env: EnvMap) -> Self {
        Self {
            label: label.into(),
            argv,
            env,
            output: OutputMode::Capture,
            cwd: None,
        }
    }

    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

// ONE MEASUREMENT ATTEMPT. EXCLUSIVELY OWNED UNTIL SHUTDOWN RECONCILES IT.
pub struct BenchmarkRun {
    label: String,
    argv: Vec<String>,
    env: EnvMap,
    child: Child,
    stdout: Option<ChildStdout>,
    // Some(pgid) WHEN THE CHILD LEADS ITS OWN PROCESS GROUP
    pgid: Option<i32>,
    graceful_timeout: Duration,
    outcome: Option<ShutdownOutcome>,
}

impl BenchmarkRun {
    pub fn start(spec: LaunchSpec) -> Result<Self, SuperviseError> {
        let (program, args) = spec.argv.split_first().ok_or(SuperviseError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args).env_clear().envs(&spec.env).stdin(Stdio::inherit());
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        match spec.output {
            OutputMode::Capture => {
                cmd.stdout(Stdio::piped()).process_group(0);
            }
            OutputMode::Passthrough => {
                cmd.stdout(Stdio::inherit()).process_group(0);
            }
            OutputMode::Terminal => {
                cmd.stdout(Stdio::inherit());
            }
        }

        let mut child = cmd.spawn().map_err(|source| SuperviseError::Spawn {
            program: program.clone(),
            source,
        })?;
        tracing::debug!(label = %spec.label, pid = child.id(), "started {}", spec.argv.join(" "));

        let pgid = match spec.output {
            OutputMode::Capture | OutputMode::Passthrough => {
                let pgid = child.id() as i32;
                // FIRST REGISTERED CHILD OWNS THE ABORT PATH
                let _ = ACTIVE_PGID.compare_exchange(0, pgid, Ordering::SeqCst, Ordering::SeqCst);
                Some(pgid)
            }
            OutputMode::Terminal => None,
        };

        Ok(Self {
            label: spec.label,
            argv: spec.argv,
            env: spec.env,
            stdout: child.stdout.take(),
            child,
            pgid,
            graceful_timeout: GRACEFUL_TIMEOUT,
            outcome: None,
        })
    }

    pub fn with_graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = timeout;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn env(&self) -> &EnvMap {
        &self.env
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    // HAND THE RAW OUTPUT TO A CONSUMER, ECHOING EVERY LINE TO `echo`.
    // CAN BE TAKEN ONCE.
    pub fn lines<W: Write>(
        &mut self,
        echo: W,
    ) -> Result<OutputStream<BufReader<ChildStdout>, W>, SuperviseError> {
        let stdout = self
            .stdout
            .take()
            .ok_or_else(|| SuperviseError::NoOutput(self.label.clone()))?;
        Ok(OutputStream::new(BufReader::new(stdout), echo))
    }

    fn send(&self, sig: libc::c_int) -> Result<(), SuperviseError> {
        let rc = unsafe {
            match self.pgid {
                Some(pgid) => libc::killpg(pgid, sig),
                None => libc::kill(self.child.id() as libc::pid_t, sig),
            }
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            // ALREADY GONE: THE FOLLOWING WAIT REAPS IT
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(SuperviseError::Signal {
                label: self.label.clone(),
                source: err,
            });
        }
        Ok(())
    }

    fn wait_err(&self, source: io::Error) -> SuperviseError {
        SuperviseError::Wait {
            label: self.label.clone(),
            source,
        }
    }

    fn settle(&mut self, outcome: ShutdownOutcome) -> ShutdownOutcome {
        if let Some(pgid) = self.pgid {
            let _ = ACTIVE_PGID.compare_exchange(pgid, 0, Ordering::SeqCst, Ordering::SeqCst);
        }
        self.outcome = Some(outcome);
        outcome
    }

    // INTERRUPT, WAIT, ESCALATE. IDEMPOTENT: LATER CALLS RETURN THE FIRST OUTCOME.
    pub fn shutdown(&mut self) -> Result<ShutdownOutcome, SuperviseError> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        if let Some(status) = self.child.try_wait().map_err(|e| self.wait_err(e))? {
            return Ok(self.settle(ShutdownOutcome::AlreadyExited(status)));
        }

        self.send(libc::SIGINT)?;
        let deadline = Instant::now() + self.graceful_timeout;
        loop {
            if let Some(status) = self.child.try_wait().map_err(|e| self.wait_err(e))? {
                return Ok(self.settle(ShutdownOutcome::Graceful(status)));
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        tracing::warn!(
            label = %self.label,
            "no exit {:?} after SIGINT, sending SIGKILL",
            self.graceful_timeout
        );
        self.send(libc::SIGKILL)?;
        let status = self.child.wait().map_err(|e| self.wait_err(e))?;
        Ok(self.settle(ShutdownOutcome::Forced(status)))
    }

    // BLOCK UNTIL THE CHILD EXITS ON ITS OWN (INTERACTIVE DEBUGGER, IMAGE RUNS).
    // AN OPERATOR ABORT ON A GROUP LEADER ESCALATES TO THE GUARDED SHUTDOWN;
    // TERMINAL CHILDREN HANDLE CTRL+C THEMSELVES.
    pub fn wait_for_exit(&mut self) -> Result<ExitStatus, SuperviseError> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome.status());
        }
        loop {
            if let Some(status) = self.child.try_wait().map_err(|e| self.wait_err(e))? {
                return Ok(self.settle(ShutdownOutcome::AlreadyExited(status)).status());
            }
            if self.pgid.is_some() && shutdown_requested() {
                return Ok(self.shutdown()?.status());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn outcome(&self) -> Option<ShutdownOutcome> {
        self.outcome
    }
}

impl Drop for BenchmarkRun {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            if let Err(e) = self.shutdown() {
                tracing::error!(label = %self.label, "shutdown failed: {}", e);
            }
        }
    }
}

// EXIT CODE FOR THE CALLING PROCESS: CHILD CODE, OR 128+SIGNAL
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

// FORWARD-ONLY LINE STREAM. EVERY LINE IS WRITTEN TO `echo` BEFORE IT IS
// YIELDED, SO THE ECHO AND THE CONSUMER SEE THE SAME LINES IN THE SAME ORDER.
pub struct OutputStream<R, W> {
    reader: R,
    echo: W,
    buf: Vec<u8>,
}

impl<R: BufRead, W: Write> OutputStream<R, W> {
    pub fn new(reader: R, echo: W) -> Self {
        Self {
            reader,
            echo,
            buf: Vec::with_capacity(256),
        }
    }

    pub fn into_echo(self) -> W {
        self.echo
    }
}

impl<R: BufRead, W: Write> Iterator for OutputStream<R, W> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => None,
            Ok(_) => {
                let line = String::from_utf8_lossy(&self.buf).into_owned();
                if let Err(e) = self.echo.write_all(line.as_bytes()).and_then(|_| self.echo.flush()) {
                    tracing::debug!("echo failed: {}", e);
                }
                Some(Ok(line))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
