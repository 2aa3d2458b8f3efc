//! FUSE availability checks.

#[cfg(any(target_os = "linux", target_os = "macos"))]
use std::path::Path;

#[cfg(target_os = "linux")]
mod paths {
    pub const FUSE_DEVICE: &str = "/dev/fuse";
    pub const MOUNT_HELPERS: [&str; 2] = ["fusermount3", "fusermount"];
}

#[cfg(target_os = "macos")]
mod paths {
    pub const FS_BUNDLES: [&str; 2] = [
        "/Library/Filesystems/macfuse.fs",
        "/Library/Filesystems/osxfuse.fs",
    ];
}

/// Errors that can occur when verifying FUSE availability.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    /// The kernel module is not loaded, or the device node is missing.
    #[error(
        "{0} does not exist. Load the fuse kernel module (modprobe fuse) or install FUSE for \
         your distribution."
    )]
    DeviceMissing(&'static str),

    /// No setuid mount helper on `PATH`.
    #[error("Neither fusermount3 nor fusermount was found on PATH. Install fuse3.")]
    MountHelperMissing,

    /// macFUSE is not installed at all.
    #[error(
        "macFUSE is not installed. drive-fs requires macFUSE to mount filesystems.\n\
         Install it from: https://macfuse.github.io/"
    )]
    NotInstalled,
}

#[cfg(target_os = "linux")]
fn on_path(binary: &str) -> bool {
    std::env::var_os("PATH")
        .is_some_and(|path| std::env::split_paths(&path).any(|dir| dir.join(binary).is_file()))
}

/// Verify that FUSE is installed and usable on the current platform.
#[cfg(target_os = "linux")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if !Path::new(paths::FUSE_DEVICE).exists() {
        return Err(FuseCheckError::DeviceMissing(paths::FUSE_DEVICE));
    }

    if !paths::MOUNT_HELPERS.iter().any(|helper| on_path(helper)) {
        return Err(FuseCheckError::MountHelperMissing);
    }

    Ok(())
}

/// Verify that FUSE is installed and usable on the current platform.
#[cfg(target_os = "macos")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if paths::FS_BUNDLES.iter().any(|b| Path::new(b).is_dir()) {
        Ok(())
    } else {
        Err(FuseCheckError::NotInstalled)
    }
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// On other platforms this is a no-op.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    Ok(())
}
