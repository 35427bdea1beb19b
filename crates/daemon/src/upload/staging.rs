//! On-disk layout of upload sessions.
//!
//! Each session owns `staging/<session id>/`, holding one file per received
//! chunk named `chunk_NNNNN` (1-based, zero padded). Chunk writes go through
//! a hidden temporary file and a rename, so a chunk is either fully present
//! or absent.
//!
//! The first chunk of a session also records `session.json`, fixing the
//! token, filename and chunk total every later chunk must repeat.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const CHUNK_PREFIX: &str = "chunk_";
const SESSION_META_FILE: &str = "session.json";

/// Longest accepted session identifier.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Whether `id` can be used as a staging directory name.
pub fn is_valid_session_id(id: &str) -> bool {
    (1..=MAX_SESSION_ID_LEN).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// File name of chunk `index`.
pub fn chunk_file_name(index: u32) -> String {
    format!("{}{:05}", CHUNK_PREFIX, index)
}

fn parse_chunk_file_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(CHUNK_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Atomically write chunk `index` into `dir`, replacing any earlier copy.
pub fn write_chunk(dir: &Path, index: u32, data: &[u8]) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    let final_path = dir.join(chunk_file_name(index));
    let temp_path = dir.join(format!(".{}.{}.tmp", chunk_file_name(index), Uuid::new_v4()));

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, &final_path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

/// What the first chunk of a session declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub token: String,
    pub filename: String,
    pub total: u32,
}

/// Record `meta` for the session in `dir` unless a record already exists.
///
/// Returns the record that is in effect afterwards. The file is published
/// with a hard link, so concurrent first chunks agree on a single winner.
pub fn ensure_meta(dir: &Path, meta: &SessionMeta) -> io::Result<SessionMeta> {
    fs::create_dir_all(dir)?;

    let final_path = dir.join(SESSION_META_FILE);
    if final_path.is_file() {
        return read_meta(&final_path);
    }

    let temp_path = dir.join(format!(".{}.{}.tmp", SESSION_META_FILE, Uuid::new_v4()));
    let published = (|| {
        let mut file = File::create(&temp_path)?;
        serde_json::to_writer(&mut file, meta)?;
        file.sync_all()?;
        fs::hard_link(&temp_path, &final_path)
    })();
    let _ = fs::remove_file(&temp_path);

    match published {
        Ok(()) => Ok(meta.clone()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => read_meta(&final_path),
        Err(e) => Err(e),
    }
}

fn read_meta(path: &Path) -> io::Result<SessionMeta> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Sorted indices of the chunks present in `dir`.
///
/// A missing directory has no chunks.
pub fn received_indices(dir: &Path) -> io::Result<Vec<u32>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut indices = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(index) = entry.file_name().to_str().and_then(parse_chunk_file_name) {
            indices.push(index);
        }
    }
    indices.sort_unstable();
    indices.dedup();
    Ok(indices)
}

/// Number of indices in `1..=total` present in `dir`.
pub fn count_received(dir: &Path, total: u32) -> io::Result<u32> {
    let count = received_indices(dir)?
        .into_iter()
        .filter(|i| (1..=total).contains(i))
        .count();
    Ok(count as u32)
}

/// First index in `1..=total` with no chunk file, if any.
pub fn first_missing(dir: &Path, total: u32) -> Option<u32> {
    (1..=total).find(|&i| !dir.join(chunk_file_name(i)).is_file())
}

/// Reader that yields chunk files back to back, hashing as it goes.
///
/// Files are opened lazily so long uploads do not hold every chunk open.
pub struct ChunkReader {
    pending: VecDeque<(u32, PathBuf)>,
    current: Option<File>,
    missing: Option<u32>,
    hasher: Sha256,
    size: u64,
}

impl ChunkReader {
    /// Read chunks `1..=total` from `dir` in index order.
    pub fn new(dir: &Path, total: u32) -> Self {
        Self {
            pending: (1..=total)
                .map(|i| (i, dir.join(chunk_file_name(i))))
                .collect(),
            current: None,
            missing: None,
            hasher: Sha256::new(),
            size: 0,
        }
    }

    /// Index of the chunk that had vanished when the reader reached it.
    pub fn missing_chunk(&self) -> Option<u32> {
        self.missing
    }

    /// Bytes yielded so far and their lowercase hex SHA-256.
    pub fn finish(self) -> (u64, String) {
        (self.size, hex::encode(self.hasher.finalize()))
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.current.is_none() {
                let Some((index, path)) = self.pending.pop_front() else {
                    return Ok(0);
                };
                match File::open(path) {
                    Ok(file) => self.current = Some(file),
                    Err(e) => {
                        if e.kind() == io::ErrorKind::NotFound {
                            self.missing = Some(index);
                        }
                        return Err(e);
                    }
                }
            }

            let Some(file) = self.current.as_mut() else {
                return Ok(0);
            };
            let n = file.read(buf)?;
            if n == 0 {
                self.current = None;
                continue;
            }
            self.hasher.update(&buf[..n]);
            self.size += n as u64;
            return Ok(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_session_ids() {
        assert!(is_valid_session_id("upload-1_abc"));
        assert!(is_valid_session_id(&"a".repeat(MAX_SESSION_ID_LEN)));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("../x"));
        assert!(!is_valid_session_id("a.b"));
        assert!(!is_valid_session_id(&"a".repeat(MAX_SESSION_ID_LEN + 1)));
    }

    #[test]
    fn test_chunk_file_names() {
        assert_eq!(chunk_file_name(1), "chunk_00001");
        assert_eq!(chunk_file_name(123456), "chunk_123456");
        assert_eq!(parse_chunk_file_name("chunk_00042"), Some(42));
        assert_eq!(parse_chunk_file_name(".chunk_00042.x.tmp"), None);
        assert_eq!(parse_chunk_file_name("chunk_"), None);
        assert_eq!(parse_chunk_file_name("chunk_1a"), None);
    }

    #[test]
    fn test_write_chunk_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("s1");

        write_chunk(&dir, 2, b"first").unwrap();
        write_chunk(&dir, 2, b"second").unwrap();

        assert_eq!(fs::read(dir.join("chunk_00002")).unwrap(), b"second");
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[test]
    fn test_received_and_missing() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("s1");
        assert!(received_indices(&dir).unwrap().is_empty());

        write_chunk(&dir, 3, b"c").unwrap();
        write_chunk(&dir, 1, b"a").unwrap();
        write_chunk(&dir, 9, b"z").unwrap();

        assert_eq!(received_indices(&dir).unwrap(), vec![1, 3, 9]);
        assert_eq!(count_received(&dir, 3).unwrap(), 2);
        assert_eq!(first_missing(&dir, 3), Some(2));

        write_chunk(&dir, 2, b"b").unwrap();
        assert_eq!(first_missing(&dir, 3), None);
    }

    #[test]
    fn test_chunk_reader_concatenates_and_hashes() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        write_chunk(dir, 1, b"hello ").unwrap();
        write_chunk(dir, 2, b"").unwrap();
        write_chunk(dir, 3, b"world").unwrap();

        let mut reader = ChunkReader::new(dir, 3);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");

        let (size, digest) = reader.finish();
        assert_eq!(size, 11);
        assert_eq!(digest, hex::encode(Sha256::digest(b"hello world")));
    }

    #[test]
    fn test_chunk_reader_reports_vanished_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        write_chunk(dir, 1, b"a").unwrap();
        write_chunk(dir, 2, b"b").unwrap();
        write_chunk(dir, 3, b"c").unwrap();

        let mut reader = ChunkReader::new(dir, 3);
        fs::remove_file(dir.join(chunk_file_name(2))).unwrap();

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(reader.missing_chunk(), Some(2));
        assert_eq!(out, b"a");
    }

    #[test]
    fn test_ensure_meta_keeps_first_record() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("s1");
        let first = SessionMeta {
            token: "tok".to_string(),
            filename: "a.txt".to_string(),
            total: 3,
        };
        let second = SessionMeta {
            total: 1,
            ..first.clone()
        };

        assert_eq!(ensure_meta(&dir, &first).unwrap(), first);
        assert_eq!(ensure_meta(&dir, &second).unwrap(), first);

        // The record is not mistaken for a chunk and leaves no temp files
        assert!(received_indices(&dir).unwrap().is_empty());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[test]
    fn test_ensure_meta_rejects_corrupt_record() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join(SESSION_META_FILE), b"{not json").unwrap();

        let meta = SessionMeta {
            token: "tok".to_string(),
            filename: "a.txt".to_string(),
            total: 1,
        };
        let err = ensure_meta(dir, &meta).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
