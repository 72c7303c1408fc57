//! Mount and unmount lifecycle.
//!
//! [`mount`] starts the fuser session in the background and wires the
//! kernel notifier into the node tree once the mount is live. [`MountSession::unmount`]
//! retries the system unmount tool until the mount is released, since a
//! player holding a file open keeps the mount busy.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use fuser::{BackgroundSession, MountOption};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::filesystem::MediaFs;

/// Delay between unmount attempts.
pub const UNMOUNT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// A warning is logged every this many failed unmount attempts.
pub const UNMOUNT_WARN_EVERY: u32 = 10;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("mountpoint {0} does not exist or is not a directory")]
    InvalidMountpoint(PathBuf),

    #[error("mount failed: {0}")]
    Mount(#[source] io::Error),
}

/// Result of one unmount attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnmountAttempt {
    /// The mount is gone.
    Done,
    /// The mount is still in use.
    Busy(String),
}

/// Builds the mount options for a read-only media mount.
pub fn mount_options(allow_other: bool) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName("mediafs".to_string()),
        MountOption::Subtype("mediafs".to_string()),
        MountOption::RO,
        MountOption::NoAtime,
        MountOption::DefaultPermissions,
    ];
    if allow_other {
        options.push(MountOption::AllowOther);
    }
    #[cfg(target_os = "macos")]
    {
        options.push(MountOption::CUSTOM("volname=Media".to_string()));
        options.push(MountOption::CUSTOM("daemon_timeout=30".to_string()));
    }
    options
}

/// A live mount.
pub struct MountSession {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
}

/// Mounts `fs` at `mountpoint` and installs the kernel notifier.
pub fn mount(fs: MediaFs, mountpoint: &Path, options: &[MountOption]) -> Result<MountSession, MountError> {
    if !mountpoint.is_dir() {
        return Err(MountError::InvalidMountpoint(mountpoint.to_path_buf()));
    }

    // spawn_mount2 takes ownership of fs
    let tree = Arc::clone(fs.tree());
    let session = fuser::spawn_mount2(fs, mountpoint, options).map_err(MountError::Mount)?;

    if tree.set_notifier(Arc::new(session.notifier())) {
        debug!("kernel notifier installed");
    } else {
        warn!("kernel notifier already installed");
    }

    info!(mountpoint = %mountpoint.display(), "mounted");
    Ok(MountSession {
        session: Some(session),
        mountpoint: mountpoint.to_path_buf(),
    })
}

impl MountSession {
    /// Unmounts, retrying while the mount is busy, then joins the session.
    ///
    /// Blocks until the mount is released.
    pub fn unmount(mut self) {
        let attempts = retry_unmount(&self.mountpoint, UNMOUNT_RETRY_INTERVAL, try_unmount);
        if let Some(session) = self.session.take() {
            session.join();
        }
        info!(mountpoint = %self.mountpoint.display(), attempts, "unmounted");
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        // Dropping the session unmounts through fuser
        if let Some(session) = self.session.take() {
            debug!(mountpoint = %self.mountpoint.display(), "dropping mount session");
            drop(session);
        }
    }
}

/// Calls `attempt` until it reports [`UnmountAttempt::Done`], sleeping
/// `interval` in between. Returns the number of attempts made.
pub fn retry_unmount<F>(mountpoint: &Path, interval: Duration, mut attempt: F) -> u32
where
    F: FnMut(&Path) -> io::Result<UnmountAttempt>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match attempt(mountpoint) {
            Ok(UnmountAttempt::Done) => return attempts,
            Ok(UnmountAttempt::Busy(reason)) => {
                if attempts % UNMOUNT_WARN_EVERY == 0 {
                    warn!(mountpoint = %mountpoint.display(), attempts, reason = %reason, "mount still busy");
                } else {
                    debug!(attempts, reason = %reason, "unmount failed, retrying");
                }
            }
            Err(e) => {
                if attempts % UNMOUNT_WARN_EVERY == 0 {
                    warn!(mountpoint = %mountpoint.display(), attempts, error = %e, "cannot run unmount");
                } else {
                    debug!(attempts, error = %e, "unmount command failed, retrying");
                }
            }
        }
        std::thread::sleep(interval);
    }
}

/// One unmount attempt with the platform's unmount tool.
pub fn try_unmount(mountpoint: &Path) -> io::Result<UnmountAttempt> {
    #[cfg(target_os = "linux")]
    let output = Command::new("fusermount").arg("-u").arg(mountpoint).output()?;
    #[cfg(not(target_os = "linux"))]
    let output = Command::new("umount").arg(mountpoint).output()?;

    if output.status.success() {
        return Ok(UnmountAttempt::Done);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Ok(classify_unmount_failure(stderr.trim()))
}

/// Treats "not mounted" failures as success; anything else is busy.
fn classify_unmount_failure(stderr: &str) -> UnmountAttempt {
    let lower = stderr.to_lowercase();
    if lower.contains("not mounted") || lower.contains("not found in") || lower.contains("not currently mounted") {
        UnmountAttempt::Done
    } else {
        UnmountAttempt::Busy(stderr.to_string())
    }
}
