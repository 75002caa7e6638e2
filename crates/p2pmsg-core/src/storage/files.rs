//! Attachment storage with path-traversal defence.
//!
//! Received files land under `files/<peer_fingerprint>/<sanitized_name>`.
//! The peer chooses the logical name, so it is treated as hostile:
//! separators and dot-dot components are rejected before any path is
//! built, and the final path is checked to stay inside the attachments
//! root.

use crate::error::{Result, StorageError, UserError};
use crate::identity::Fingerprint;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Characters allowed in a stored file name, besides alphanumerics.
const ALLOWED_PUNCT: &[char] = &['-', '_', '.', ' '];

/// Validate a peer-supplied file name.
///
/// Accepts names made of alphanumerics, `-`, `_`, `.`, and spaces.
/// Rejects empty names, separators, and anything that could resolve to a
/// parent directory.
pub fn sanitize_filename(name: &str) -> Result<String> {
    let invalid = || UserError::InvalidFilename(name.chars().take(64).collect());

    if name.is_empty() || name.len() > 255 {
        return Err(invalid().into());
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(invalid().into());
    }
    if name == "." || name == ".." || name.starts_with('.') {
        return Err(invalid().into());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || ALLOWED_PUNCT.contains(&c))
    {
        return Err(invalid().into());
    }
    Ok(name.to_string())
}

/// The attachment store rooted at `data/files`.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Store over `root` (created on first save).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Save a received attachment, returning the path it was written to.
    ///
    /// An existing file with the same name is kept; the new one gets a
    /// numeric suffix.
    pub fn save(&self, peer: &Fingerprint, name: &str, data: &[u8]) -> Result<PathBuf> {
        let clean = sanitize_filename(name)?;

        let dir = self.root.join(peer.to_hex());
        std::fs::create_dir_all(&dir)
            .map_err(|e| StorageError::Io(format!("create attachment dir: {e}")))?;

        let path = self.available_path(&dir, &clean);
        self.check_containment(&path)?;

        std::fs::write(&path, data)
            .map_err(|e| StorageError::Io(format!("write attachment: {e}")))?;
        debug!(bytes = data.len(), "attachment stored");
        Ok(path)
    }

    /// Path of an attachment, relative to the data directory, for log rows.
    pub fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .map(|p| format!("files/{}", p.display()))
            .unwrap_or_else(|_| path.display().to_string())
    }

    fn available_path(&self, dir: &Path, name: &str) -> PathBuf {
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
            _ => (name.to_string(), String::new()),
        };
        for n in 1u32.. {
            let candidate = dir.join(format!("{stem}-{n}{ext}"));
            if !candidate.exists() {
                return candidate;
            }
        }
        unreachable!("u32 suffix space exhausted")
    }

    /// Defence in depth: even after sanitization, refuse any path whose
    /// components would leave the attachments root.
    fn check_containment(&self, path: &Path) -> Result<()> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| UserError::InvalidFilename(path.display().to_string()))?;
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(UserError::InvalidFilename(path.display().to_string()).into()),
            }
        }
        Ok(())
    }
}
