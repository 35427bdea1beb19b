//! Per-token blob storage on the local filesystem.
//!
//! Each share owns one directory named after its token. Blobs are written to
//! a dot-prefixed temporary file and published with a no-clobber hard link,
//! so readers never see a partial file under its final name and concurrent
//! saves of the same name never overwrite each other.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use protocol::ShareToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ShareError, ShareResult};
use crate::registry::ShareRecord;

/// Longest stored filename, leaving room for a collision suffix.
pub const MAX_FILENAME_LEN: usize = 200;

/// Upper bound on collision suffixes tried before giving up.
const MAX_COLLISION_ATTEMPTS: u32 = 10_000;

const TEMP_PREFIX: &str = ".upload-";
const TRASH_PREFIX: &str = ".trash-";

/// Reduce a client-supplied filename to a safe single path component.
///
/// Only the last path component is kept. Characters outside
/// `[A-Za-z0-9._-]` become `_`, and leading dots and underscores are
/// trimmed. Returns `PathTraversalRejected` when nothing usable remains.
pub fn sanitize_filename(name: &str) -> ShareResult<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();

    let mapped: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = mapped.trim_start_matches(['.', '_']);
    if trimmed.is_empty() {
        return Err(ShareError::PathTraversalRejected(
            name.chars().take(64).collect(),
        ));
    }

    // Mapped text is ASCII, so byte truncation is safe.
    let mut safe = trimmed.to_string();
    safe.truncate(MAX_FILENAME_LEN);
    Ok(safe)
}

/// Build the `attempt`-th candidate for `name`: `a.txt`, `a_1.txt`, ...
fn candidate_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &name[..dot], attempt, &name[dot..]),
        _ => format!("{}_{}", name, attempt),
    }
}

/// Filesystem store of share blobs.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new<P: Into<PathBuf>>(root: P) -> ShareResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            ShareError::Storage(format!(
                "failed to create upload directory {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding a share's blobs.
    pub fn token_dir(&self, token: &ShareToken) -> PathBuf {
        self.root.join(token.as_str())
    }

    /// Store the bytes read from `reader` under a sanitized form of
    /// `desired_name`, renaming on collision.
    ///
    /// Returns the name the blob was stored under.
    pub fn save<R: Read + ?Sized>(
        &self,
        token: &ShareToken,
        desired_name: &str,
        reader: &mut R,
    ) -> ShareResult<String> {
        let name = sanitize_filename(desired_name)?;
        let dir = self.token_dir(token);
        fs::create_dir_all(&dir)?;

        let temp_path = dir.join(format!("{}{}.tmp", TEMP_PREFIX, Uuid::new_v4()));
        if let Err(e) = write_temp(&temp_path, reader) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        let published = publish(&temp_path, &dir, &name);
        if let Err(e) = fs::remove_file(&temp_path) {
            warn!(path = ?temp_path, error = %e, "Failed to remove upload temp file");
        }
        let stored = published?;

        debug!(
            token = token.short(),
            desired = desired_name,
            stored = %stored,
            "Stored blob"
        );
        Ok(stored)
    }

    /// Open a blob for reading.
    ///
    /// The filename must be recorded for the share and must already be in
    /// sanitized form; anything else is `NotFound`.
    pub fn read(&self, record: &ShareRecord, filename: &str) -> ShareResult<File> {
        let not_found = || {
            ShareError::NotFound(format!(
                "file {:?} in share {}",
                filename,
                record.token.short()
            ))
        };

        if !record.has_file(filename) {
            return Err(not_found());
        }
        match sanitize_filename(filename) {
            Ok(safe) if safe == filename => {}
            _ => return Err(not_found()),
        }

        let path = self.token_dir(&record.token).join(filename);
        match File::open(&path) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }

    /// Size of one blob, or `None` when it does not exist.
    pub fn size_of(&self, token: &ShareToken, filename: &str) -> ShareResult<Option<u64>> {
        let path = self.token_dir(token).join(filename);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Sum of blob sizes, skipping files that do not exist.
    pub fn total_size(&self, token: &ShareToken, filenames: &[String]) -> ShareResult<u64> {
        let mut total = 0u64;
        for filename in filenames {
            total += self.size_of(token, filename)?.unwrap_or(0);
        }
        Ok(total)
    }

    /// Remove a single blob. Returns whether it existed.
    pub fn remove_file(&self, token: &ShareToken, filename: &str) -> ShareResult<bool> {
        let safe = sanitize_filename(filename)?;
        match fs::remove_file(self.token_dir(token).join(safe)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a share's directory and everything in it.
    ///
    /// Returns `false` when the directory did not exist.
    pub fn delete_all(&self, token: &ShareToken) -> ShareResult<bool> {
        self.remove_dir_named(token.as_str())
    }

    /// Remove a top-level directory by name.
    ///
    /// The directory is first renamed to a hidden trash name so it vanishes
    /// from enumeration atomically, then removed recursively.
    pub fn remove_dir_named(&self, name: &str) -> ShareResult<bool> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(ShareError::PathTraversalRejected(name.to_string()));
        }

        let dir = self.root.join(name);
        let trash = self
            .root
            .join(format!("{}{}", TRASH_PREFIX, Uuid::new_v4().simple()));

        match fs::rename(&dir, &trash) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        fs::remove_dir_all(&trash)?;
        debug!(dir = name, "Removed share directory");
        Ok(true)
    }

    /// Names of the share directories, sorted.
    ///
    /// Dot-prefixed entries (temporary and trash) are skipped.
    pub fn list_token_dirs(&self) -> ShareResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = ?entry.path(), "Skipping non UTF-8 directory name");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// Remove trash directories left behind by an interrupted delete.
    pub fn purge_trash(&self) -> ShareResult<usize> {
        let mut purged = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let is_trash = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(TRASH_PREFIX));
            if !is_trash {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => purged += 1,
                Err(e) => warn!(path = ?entry.path(), error = %e, "Failed to purge trash"),
            }
        }
        Ok(purged)
    }
}

fn write_temp<R: Read + ?Sized>(path: &Path, reader: &mut R) -> io::Result<u64> {
    let file = File::options().write(true).create_new(true).open(path)?;
    let mut writer = BufWriter::new(file);
    let written = io::copy(reader, &mut writer)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(written)
}

fn publish(temp_path: &Path, dir: &Path, name: &str) -> ShareResult<String> {
    for attempt in 0..MAX_COLLISION_ATTEMPTS {
        let candidate = candidate_name(name, attempt);
        match fs::hard_link(temp_path, dir.join(&candidate)) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(ShareError::Storage(format!(
        "no free name for {:?} after {} attempts",
        name, MAX_COLLISION_ATTEMPTS
    )))
}
