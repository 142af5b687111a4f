//! TOCTOU-free file reading rooted at a plugin directory.
//!
//! Validating a path and opening it later leaves a window where an attacker
//! can swap a component for a symbolic link. This module closes that window
//! on POSIX hosts by resolving every path segment with a descriptor-relative
//! `openat` carrying `O_NOFOLLOW`, and reading from the final descriptor.
//! There is deliberately no "validate and return a path" API.
//!
//! On non-POSIX hosts the implementation degrades to `symlink_metadata`
//! checks per segment; a window between the check and the open remains. A
//! native equivalent using reparse-point protection is a follow-on.

use crate::error::{HostError, HostResult};
use crate::manifest::{is_path_escape, PluginManifest};
use crate::permissions::{parse_permissions, PermissionGrant};
use std::collections::HashSet;
use std::path::Path;

/// Entry file content paired with the permissions the manifest declares for
/// it. Produced in one step so callers cannot read first and decide on
/// stale permissions later.
#[derive(Debug)]
pub struct EntrySource {
    pub content: String,
    pub permissions: HashSet<PermissionGrant>,
}

/// Read a plugin's entry file and its declared permissions.
pub fn read_entry(plugin_root: &Path, manifest: &PluginManifest) -> HostResult<EntrySource> {
    let bytes = read_file_at(plugin_root, &manifest.entry)?;
    let content = String::from_utf8(bytes)
        .map_err(|_| HostError::RuntimeInit("entry file is not valid UTF-8".into()))?;
    let permissions = parse_permissions(&manifest.permissions)?;
    Ok(EntrySource {
        content,
        permissions,
    })
}

/// Read any file under `root` at a validated relative path.
pub fn read_file_at(root: &Path, relative: &str) -> HostResult<Vec<u8>> {
    if relative.is_empty() || is_path_escape(relative) {
        return Err(HostError::PathTraversal(relative.to_string()));
    }
    read_no_follow(root, relative)
}

// ---------------------------------------------------------------------------
// POSIX: descriptor-chain resolution
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn read_no_follow(root: &Path, relative: &str) -> HostResult<Vec<u8>> {
    use std::ffi::CString;
    use std::fs::File;
    use std::io::Read;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::os::unix::ffi::OsStrExt;

    fn errno_to_error(path: &str) -> HostError {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ELOOP) | Some(libc::EMLINK) => HostError::SymlinkRejected(path.to_string()),
            _ => HostError::Io(err),
        }
    }

    let root_c = CString::new(root.as_os_str().as_bytes())
        .map_err(|_| HostError::PathTraversal(relative.to_string()))?;
    // The root itself must be a real directory, not a link to one.
    let fd = unsafe {
        libc::open(
            root_c.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(errno_to_error(&root.to_string_lossy()));
    }
    let mut dir = unsafe { OwnedFd::from_raw_fd(fd) };

    let segments: Vec<&std::ffi::OsStr> = Path::new(relative)
        .components()
        .map(|c| c.as_os_str())
        .collect();

    for (i, segment) in segments.iter().enumerate() {
        let is_last = i + 1 == segments.len();
        let seg_c = CString::new(segment.as_bytes())
            .map_err(|_| HostError::PathTraversal(relative.to_string()))?;
        let flags = if is_last {
            libc::O_RDONLY | libc::O_NOFOLLOW | libc::O_CLOEXEC
        } else {
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW | libc::O_CLOEXEC
        };
        let next = unsafe { libc::openat(dir.as_raw_fd(), seg_c.as_ptr(), flags) };
        if next < 0 {
            return Err(errno_to_error(relative));
        }
        dir = unsafe { OwnedFd::from_raw_fd(next) };
    }

    let mut file = File::from(dir);
    let mut content = Vec::new();
    file.read_to_end(&mut content)?;
    Ok(content)
}

// ---------------------------------------------------------------------------
// Non-POSIX fallback
// ---------------------------------------------------------------------------

#[cfg(not(unix))]
fn read_no_follow(root: &Path, relative: &str) -> HostResult<Vec<u8>> {
    // Best effort without openat: reject a symlink at any prefix before
    // opening. A swap between the metadata check and the read remains
    // possible on these hosts.
    let root_meta = std::fs::symlink_metadata(root)?;
    if root_meta.file_type().is_symlink() {
        return Err(HostError::SymlinkRejected(root.to_string_lossy().into()));
    }

    let mut current = root.to_path_buf();
    for segment in Path::new(relative).components() {
        current.push(segment.as_os_str());
        let meta = std::fs::symlink_metadata(&current)?;
        if meta.file_type().is_symlink() {
            return Err(HostError::SymlinkRejected(relative.to_string()));
        }
    }
    Ok(std::fs::read(current)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
