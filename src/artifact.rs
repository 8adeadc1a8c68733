// ENCLAVE-BENCH ARTIFACT BUILDER
// SYMBOLIC ATTRIBUTE -> EXECUTABLE PATH. A BUILD FAILURE IS FATAL.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

pub trait ArtifactBuilder {
    fn build(&self, attr: &str) -> Result<PathBuf>;
}

pub struct NixBuilder {
    root: PathBuf,
}

impl NixBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

// nix-build PRINTS ONE STORE PATH PER OUTPUT; THE LAST ONE IS THE ARTIFACT
pub fn parse_store_path(stdout: &str) -> Option<PathBuf> {
    stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .map(PathBuf::from)
}

impl ArtifactBuilder for NixBuilder {
    fn build(&self, attr: &str) -> Result<PathBuf> {
        println!("BUILD {}", attr);
        let output = Command::new("nix-build")
            .arg(&self.root)
            .args(["-A", attr, "--no-out-link"])
            .stderr(Stdio::inherit())
            .output()
            .context("failed to run nix-build")?;
        if !output.status.success() {
            bail!("nix-build -A {} failed ({})", attr, output.status);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_store_path(&stdout).with_context(|| format!("nix-build -A {} printed no path", attr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_nonempty_line_wins() {
        let out = "/nix/store/aaa-fio-dev\n/nix/store/bbb-fio\n\n";
        assert_eq!(parse_store_path(out), Some(PathBuf::from("/nix/store/bbb-fio")));
    }

    #[test]
    fn empty_output_has_no_path() {
        assert_eq!(parse_store_path("\n  \n"), None);
    }
}
