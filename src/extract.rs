//! Path-safe archive extraction and atomic plugin installs.
//!
//! Plugin archives are untrusted input. Extraction validates every entry
//! before a single byte reaches disk: enclosed relative paths only, no
//! symbolic links, an extension allow-list, and bounded entry counts. The
//! write pass enforces size caps on actually-written bytes; archive
//! metadata is treated as a hint at best. Installs are atomic: content is
//! written to a sibling temp directory and renamed into place, with prior
//! versions kept for rollback.

use crate::error::{HostError, HostResult};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Largest single extracted file.
const MAX_ENTRY_BYTES: u64 = 10 * 1024 * 1024;
/// Largest total extracted size.
const MAX_TOTAL_BYTES: u64 = 50 * 1024 * 1024;
/// Most entries one archive may contain.
const MAX_ENTRIES: usize = 1000;
/// Extensions a plugin archive may contain.
const ALLOWED_EXTENSIONS: &[&str] = &["js", "json", "png", "svg"];
/// Prior versions kept per plugin for rollback.
const KEPT_BACKUPS: usize = 2;

/// Extract `archive_path` into `target_dir` atomically.
///
/// If `target_dir` already exists its current content is rotated into the
/// backup store before the rename, so a failed extraction never leaves a
/// half-written plugin and the previous version stays recoverable.
pub fn extract_archive(archive_path: &Path, target_dir: &Path) -> HostResult<()> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| HostError::ManifestParse(format!("unreadable archive: {e}")))?;

    validate_entries(&mut archive)?;

    // Sibling temp dir so the final rename stays on one filesystem.
    let parent = target_dir
        .parent()
        .ok_or_else(|| HostError::PathTraversal(target_dir.to_string_lossy().into()))?;
    std::fs::create_dir_all(parent)?;
    let temp_dir = parent.join(format!(
        ".extract-{}",
        uuid::Uuid::new_v4().simple()
    ));
    std::fs::create_dir(&temp_dir)?;

    let result = write_entries(&mut archive, &temp_dir);
    if let Err(e) = result {
        let _ = std::fs::remove_dir_all(&temp_dir);
        return Err(e);
    }

    if target_dir.exists() {
        rotate_backup(target_dir)?;
    }
    std::fs::rename(&temp_dir, target_dir)?;
    Ok(())
}

/// First pass: reject bad archives before any byte is written.
fn validate_entries<R: Read + std::io::Seek>(archive: &mut zip::ZipArchive<R>) -> HostResult<()> {
    if archive.len() > MAX_ENTRIES {
        return Err(HostError::TooManyEntries {
            count: archive.len(),
            max: MAX_ENTRIES,
        });
    }

    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| HostError::ManifestParse(format!("unreadable archive entry: {e}")))?;
        let raw_name = entry.name().to_string();

        // The library's enclosed-name check covers absolute paths, `..`
        // segments, and prefix escapes in one place.
        if entry.enclosed_name().is_none() {
            return Err(HostError::PathTraversal(raw_name));
        }

        if mode_is_symlink(entry.unix_mode()) {
            return Err(HostError::SymlinkRejected(raw_name));
        }

        if entry.is_dir() {
            continue;
        }

        let allowed = Path::new(&raw_name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                ALLOWED_EXTENSIONS
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(ext))
            });
        if !allowed {
            return Err(HostError::ForbiddenExtension(raw_name));
        }
    }
    Ok(())
}

/// Second pass: write with caps enforced on real byte counts.
fn write_entries<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    temp_dir: &Path,
) -> HostResult<()> {
    let mut total_written: u64 = 0;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| HostError::ManifestParse(format!("unreadable archive entry: {e}")))?;
        // Validated above; treat a surprise as traversal anyway.
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| HostError::PathTraversal(entry.name().to_string()))?;
        let out_path = temp_dir.join(&relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(dir) = out_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        // Size-capped reader: one byte past the limit proves the overflow
        // without buffering an unbounded body.
        let mut content = Vec::new();
        let mut capped = entry.by_ref().take(MAX_ENTRY_BYTES + 1);
        capped
            .read_to_end(&mut content)
            .map_err(|e| HostError::ReadError(e.to_string()))?;
        if content.len() as u64 > MAX_ENTRY_BYTES {
            return Err(HostError::EntryTooLarge {
                path: entry.name().to_string(),
                size: content.len() as u64,
                max: MAX_ENTRY_BYTES,
            });
        }

        total_written += content.len() as u64;
        if total_written > MAX_TOTAL_BYTES {
            return Err(HostError::ArchiveTooLarge {
                written: total_written,
                max: MAX_TOTAL_BYTES,
            });
        }

        std::fs::write(&out_path, &content)?;
    }
    Ok(())
}

fn mode_is_symlink(mode: Option<u32>) -> bool {
    mode.is_some_and(|mode| mode & 0o170000 == 0o120000)
}

// ---------------------------------------------------------------------------
// Backups & rollback
// ---------------------------------------------------------------------------

/// Backups live in a `.backups/{id}/` sibling of the plugin directory, so
/// rotation and rollback are same-filesystem renames.
fn backup_slot_dir(plugin_dir: &Path) -> HostResult<PathBuf> {
    let parent = plugin_dir
        .parent()
        .ok_or_else(|| HostError::PathTraversal(plugin_dir.to_string_lossy().into()))?;
    let id = plugin_dir
        .file_name()
        .ok_or_else(|| HostError::PathTraversal(plugin_dir.to_string_lossy().into()))?;
    Ok(parent.join(".backups").join(id))
}

/// Move the current plugin directory into the backup store, pruning old
/// versions beyond the keep limit.
fn rotate_backup(plugin_dir: &Path) -> HostResult<()> {
    let slot = backup_slot_dir(plugin_dir)?;
    std::fs::create_dir_all(&slot)?;

    let stamp = chrono::Utc::now().timestamp_millis();
    std::fs::rename(plugin_dir, slot.join(stamp.to_string()))?;

    // Prune oldest backups past the keep limit.
    let mut versions: Vec<PathBuf> = std::fs::read_dir(&slot)?
        .flatten()
        .map(|e| e.path())
        .collect();
    versions.sort();
    while versions.len() > KEPT_BACKUPS {
        let oldest = versions.remove(0);
        let _ = std::fs::remove_dir_all(oldest);
    }
    Ok(())
}

/// Promote a validated staging directory into its final plugin slot,
/// rotating any existing version into the backup store first.
pub fn promote(staged: &Path, plugin_dir: &Path) -> HostResult<()> {
    if plugin_dir.exists() {
        rotate_backup(plugin_dir)?;
    }
    if let Some(parent) = plugin_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(staged, plugin_dir)?;
    Ok(())
}

/// Restore the most recent backed-up version of a plugin directory. The
/// currently installed version, if any, is discarded.
pub fn rollback(plugin_dir: &Path) -> HostResult<()> {
    let slot = backup_slot_dir(plugin_dir)?;
    let mut versions: Vec<PathBuf> = match std::fs::read_dir(&slot) {
        Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    };
    versions.sort();
    let newest = versions
        .pop()
        .ok_or_else(|| HostError::UnknownPlugin(format!(
            "no backup available for {}",
            plugin_dir.to_string_lossy()
        )))?;

    if plugin_dir.exists() {
        std::fs::remove_dir_all(plugin_dir)?;
    }
    std::fs::rename(newest, plugin_dir)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
