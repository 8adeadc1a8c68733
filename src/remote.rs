// ENCLAVE-BENCH REMOTE COMMAND
// RUNS A BINARY FROM A STORE PATH ON THE PEER HOST AND RETURNS ITS STDOUT.
// NON-ZERO EXIT IS AN ERROR CARRYING THE LAST LINE OF STDERR.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::launcher::EnvMap;

pub trait RemoteCommand {
    fn run(&self, binary: &str, args: &[String], extra_env: &EnvMap) -> Result<String>;
}

pub struct SshRemote {
    host: String,
    store_path: PathBuf,
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

impl SshRemote {
    pub fn new(host: impl Into<String>, store_path: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            store_path: store_path.into(),
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    // REMOTE SHELL LINE: env K=V ... <store>/<binary> ARGS...
    pub fn remote_line(&self, binary: &str, args: &[String], extra_env: &EnvMap) -> String {
        let mut parts: Vec<String> = Vec::new();
        if !extra_env.is_empty() {
            parts.push("env".into());
            parts.extend(extra_env.iter().map(|(k, v)| shell_quote(&format!("{k}={v}"))));
        }
        parts.push(shell_quote(&self.store_path.join(binary).display().to_string()));
        parts.extend(args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

impl RemoteCommand for SshRemote {
    fn run(&self, binary: &str, args: &[String], extra_env: &EnvMap) -> Result<String> {
        let line = self.remote_line(binary, args, extra_env);
        tracing::debug!(host = %self.host, "ssh {}", line);
        let output = Command::new("ssh")
            .args(["-o", "BatchMode=yes", self.host.as_str(), "--", line.as_str()])
            .output()
            .context("failed to run ssh")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no stderr");
            bail!("{} on {} exited with {}: {}", binary, self.host, output.status, tail);
        }
        String::from_utf8(output.stdout).context("remote output is not UTF-8")
    }
}
