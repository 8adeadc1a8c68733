// ENCLAVE-BENCH DEBUG MOUNT
// SCOPED READ-ONLY MOUNT OF THE FILESYSTEM IMAGE FOR INSPECTION DURING A RUN.
// THE MOUNTPOINT IS A PRIVATE TEMP DIRECTORY EXPOSED VIA SGXLKL_DEBUGMOUNT.
// UNMOUNT HAPPENS IN Drop, BEFORE THE TEMP DIRECTORY IS REMOVED, ON EVERY
// EXIT PATH. DISABLED SESSIONS DO NOTHING AT ALL.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;
use thiserror::Error;

use crate::launcher::EnvMap;

pub const DEBUGMOUNT_VAR: &str = "SGXLKL_DEBUGMOUNT";

#[derive(Debug, Error)]
pub enum MountError {
    #[error("creating mountpoint: {0}")]
    Mountpoint(#[source] io::Error),

    #[error("mounting {image} on {target}: {source}")]
    Mount {
        image: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub trait Mounter {
    fn mount(&self, image: &Path, target: &Path) -> io::Result<()>;
    fn unmount(&self, target: &Path) -> io::Result<()>;
}

// PRIVILEGED MOUNT THROUGH sudo
pub struct SudoMounter;

fn run_checked(cmd: &mut Command) -> io::Result<()> {
    let status = cmd.status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{:?} exited with {}", cmd, status),
        ))
    }
}

impl Mounter for SudoMounter {
    fn mount(&self, image: &Path, target: &Path) -> io::Result<()> {
        run_checked(Command::new("sudo").args(["mount", "-o", "ro"]).arg(image).arg(target))
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        run_checked(Command::new("sudo").arg("umount").arg(target))
    }
}

pub struct DebugMount<'m, M: Mounter> {
    mounter: &'m M,
    dir: Option<TempDir>,
}

impl<'m, M: Mounter> DebugMount<'m, M> {
    // `image` IS None FOR NATIVE RUNS (NO FILESYSTEM IMAGE)
    pub fn open(mounter: &'m M, enabled: bool, image: Option<&Path>) -> Result<Self, MountError> {
        let image = match image {
            Some(image) if enabled => image,
            _ => return Ok(Self { mounter, dir: None }),
        };

        let dir = tempfile::Builder::new()
            .prefix("dbgmount-")
            .tempdir()
            .map_err(MountError::Mountpoint)?;
        mounter
            .mount(image, dir.path())
            .map_err(|source| MountError::Mount {
                image: image.to_path_buf(),
                target: dir.path().to_path_buf(),
                source,
            })?;
        tracing::info!("debug mount {} at {}", image.display(), dir.path().display());
        Ok(Self {
            mounter,
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    pub fn is_mounted(&self) -> bool {
        self.dir.is_some()
    }

    pub fn apply(&self, env: &mut EnvMap) {
        if let Some(path) = self.path() {
            env.insert(DEBUGMOUNT_VAR.into(), path.display().to_string());
        }
    }
}

impl<M: Mounter> Drop for DebugMount<'_, M> {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = self.mounter.unmount(dir.path()) {
                // STILL MOUNTED: LEAVE THE DIRECTORY RATHER THAN RECURSE INTO THE IMAGE
                tracing::error!("unmounting {}: {}", dir.path().display(), e);
                let _ = dir.keep();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<String>>,
        fail_mount: bool,
        fail_unmount: bool,
    }

    impl Mounter for Recorder {
        fn mount(&self, image: &Path, target: &Path) -> io::Result<()> {
            self.calls
                .borrow_mut()
                .push(format!("mount {} {}", image.display(), target.display()));
            if self.fail_mount {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
            }
            Ok(())
        }

        fn unmount(&self, target: &Path) -> io::Result<()> {
            self.calls.borrow_mut().push(format!("umount {}", target.display()));
            if self.fail_unmount {
                return Err(io::Error::new(io::ErrorKind::Other, "busy"));
            }
            Ok(())
        }
    }

    #[test]
    fn disabled_is_a_no_op() {
        let rec = Recorder::default();
        let mut env = EnvMap::new();
        {
            let m = DebugMount::open(&rec, false, Some(Path::new("/img/fs.img"))).unwrap();
            m.apply(&mut env);
            assert!(!m.is_mounted());
        }
        assert!(env.get(DEBUGMOUNT_VAR).is_none());
        assert!(rec.calls.borrow().is_empty());
    }

    #[test]
    fn native_run_without_image_is_a_no_op() {
        let rec = Recorder::default();
        let m = DebugMount::open(&rec, true, None).unwrap();
        assert!(m.path().is_none());
        drop(m);
        assert!(rec.calls.borrow().is_empty());
    }

    #[test]
    fn mounts_then_unmounts_on_scope_exit() {
        let rec = Recorder::default();
        let mut env = EnvMap::new();
        let mountpoint;
        {
            let m = DebugMount::open(&rec, true, Some(Path::new("/img/fs.img"))).unwrap();
            m.apply(&mut env);
            mountpoint = m.path().unwrap().to_path_buf();
            assert!(mountpoint.is_dir());
        }
        assert_eq!(env[DEBUGMOUNT_VAR], mountpoint.display().to_string());
        let calls = rec.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("mount /img/fs.img "));
        assert_eq!(calls[1], format!("umount {}", mountpoint.display()));
        assert!(!mountpoint.exists());
    }

    #[test]
    fn unmount_runs_on_error_path() {
        fn failing_run(rec: &Recorder) -> Result<(), String> {
            let _m = DebugMount::open(rec, true, Some(Path::new("/img/fs.img")))
                .map_err(|e| e.to_string())?;
            Err("extraction failed".into())
        }
        let rec = Recorder::default();
        assert!(failing_run(&rec).is_err());
        assert!(rec.calls.borrow()[1].starts_with("umount "));
    }

    #[test]
    fn failed_unmount_keeps_mountpoint() {
        let rec = Recorder {
            fail_unmount: true,
            ..Default::default()
        };
        let m = DebugMount::open(&rec, true, Some(Path::new("/img/fs.img"))).unwrap();
        let mountpoint = m.path().unwrap().to_path_buf();
        drop(m);
        assert!(mountpoint.is_dir());
        std::fs::remove_dir(&mountpoint).unwrap();
    }

    #[test]
    fn failed_mount_cleans_mountpoint() {
        let rec = Recorder {
            fail_mount: true,
            ..Default::default()
        };
        let err = DebugMount::open(&rec, true, Some(Path::new("/img/fs.img")));
        assert!(matches!(err, Err(MountError::Mount { .. })));
        assert_eq!(rec.calls.borrow().len(), 1);
    }
}
