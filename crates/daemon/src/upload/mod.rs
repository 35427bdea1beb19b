//! Resumable chunked uploads.
//!
//! Clients split a file into numbered chunks and send them in any order,
//! possibly more than once. [`ChunkAssembler`] persists each chunk into the
//! session's staging directory and, once every chunk is present, rebuilds
//! the file into the [`ObjectStore`] and records it in the
//! [`TokenRegistry`]. Assembly happens at most once per session, even when
//! several final chunks race.

pub mod staging;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use protocol::{ChunkUpload, ChunkUploadResponse, ShareToken};
use tracing::{debug, info, warn};

use crate::error::{ShareError, ShareResult};
use crate::registry::TokenRegistry;
use crate::store::{sanitize_filename, ObjectStore};

use staging::{ChunkReader, SessionMeta};

/// A file rebuilt from its chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFile {
    /// Name the file was stored under.
    pub stored_name: String,
    /// Size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the content.
    pub sha256: String,
}

/// Result of accepting one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// More chunks are needed.
    Pending { received: u32, total: u32 },
    /// The upload has been assembled and recorded.
    Complete {
        token: ShareToken,
        file: AssembledFile,
    },
}

impl ChunkOutcome {
    /// Whether the upload is finished.
    pub fn is_complete(&self) -> bool {
        matches!(self, ChunkOutcome::Complete { .. })
    }

    /// Response body for the uploading client.
    pub fn to_response(&self) -> ChunkUploadResponse {
        match self {
            ChunkOutcome::Pending { .. } => ChunkUploadResponse::pending(),
            ChunkOutcome::Complete { token, file } => {
                ChunkUploadResponse::done(token.as_str(), file.stored_name.as_str())
            }
        }
    }
}

#[derive(Debug)]
struct CompletedUpload {
    token: ShareToken,
    file: AssembledFile,
    finished_at: Instant,
}

/// Per-session completion slot. Its mutex is the assembly claim.
#[derive(Debug, Default)]
struct SessionSlot {
    completed: Option<CompletedUpload>,
}

/// Rebuilds chunked uploads and hands them to the object store.
pub struct ChunkAssembler {
    staging_root: PathBuf,
    registry: Arc<TokenRegistry>,
    store: Arc<ObjectStore>,
    sessions: DashMap<String, Arc<Mutex<SessionSlot>>>,
}

impl ChunkAssembler {
    /// Create an assembler staging chunks under `staging_root`.
    pub fn new<P: Into<PathBuf>>(
        staging_root: P,
        registry: Arc<TokenRegistry>,
        store: Arc<ObjectStore>,
    ) -> ShareResult<Self> {
        let staging_root = staging_root.into();
        std::fs::create_dir_all(&staging_root).map_err(|e| {
            ShareError::Storage(format!(
                "failed to create staging directory {}: {}",
                staging_root.display(),
                e
            ))
        })?;

        Ok(Self {
            staging_root,
            registry,
            store,
            sessions: DashMap::new(),
        })
    }

    /// Root of the staging area.
    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    fn session_dir(&self, session: &str) -> PathBuf {
        self.staging_root.join(session)
    }

    /// Accept one chunk.
    ///
    /// Everything is validated before any byte is written: the chunk index,
    /// the filename, and the destination token (which must exist and not be
    /// expired). A chunk for a session that already finished returns the
    /// earlier result without touching staging.
    pub fn upload_chunk(&self, chunk: &ChunkUpload) -> ShareResult<ChunkOutcome> {
        let session = chunk.file_id.as_str();
        let (index, total) = (chunk.chunk_number, chunk.total_chunks);

        if !staging::is_valid_session_id(session) {
            return Err(ShareError::InvalidSessionId(
                session.chars().take(64).collect(),
            ));
        }
        if total == 0 || index == 0 || index > total {
            return Err(ShareError::InvalidChunkIndex { index, total });
        }
        sanitize_filename(&chunk.filename)?;
        let token = ShareToken::parse(&chunk.share_token)?;
        self.registry.open_share(&token)?;

        if let Some(done) = self.completed_outcome(session, &token)? {
            debug!(session, chunk = index, "Chunk for finished upload ignored");
            return Ok(done);
        }

        let dir = self.session_dir(session);
        let declared = SessionMeta {
            token: token.as_str().to_string(),
            filename: chunk.filename.clone(),
            total,
        };
        let recorded = staging::ensure_meta(&dir, &declared)?;
        if recorded.total != total {
            warn!(
                session,
                chunk = index,
                total,
                expected = recorded.total,
                "Chunk total disagrees with session"
            );
            return Err(ShareError::InvalidChunkIndex { index, total });
        }
        if recorded != declared {
            warn!(session, chunk = index, "Chunk token or filename disagrees with session");
            return Err(ShareError::InvalidSessionId(session.to_string()));
        }

        staging::write_chunk(&dir, index, &chunk.data)?;

        let received = staging::count_received(&dir, total)?;
        debug!(session, chunk = index, total, received, "Stored chunk");
        if received < total {
            // A concurrent assembly marks completion before clearing staging,
            // so a short count may just mean this chunk arrived too late.
            if let Some(done) = self.completed_outcome(session, &token)? {
                self.remove_staging(session);
                return Ok(done);
            }
            return Ok(ChunkOutcome::Pending { received, total });
        }

        self.claim_and_assemble(session, &token, &chunk.filename, total)
    }

    fn slot(&self, session: &str) -> Arc<Mutex<SessionSlot>> {
        Arc::clone(self.sessions.entry(session.to_string()).or_default().value())
    }

    fn completed_outcome(
        &self,
        session: &str,
        token: &ShareToken,
    ) -> ShareResult<Option<ChunkOutcome>> {
        let Some(slot) = self.sessions.get(session).map(|s| Arc::clone(s.value())) else {
            return Ok(None);
        };
        let guard = slot
            .lock()
            .map_err(|_| ShareError::Storage("upload session lock poisoned".to_string()))?;
        completed_for(&guard, session, token)
    }

    fn claim_and_assemble(
        &self,
        session: &str,
        token: &ShareToken,
        filename: &str,
        total: u32,
    ) -> ShareResult<ChunkOutcome> {
        let slot = self.slot(session);
        let mut guard = slot
            .lock()
            .map_err(|_| ShareError::Storage("upload session lock poisoned".to_string()))?;

        // The racer that lost the claim sees the winner's result.
        if let Some(done) = completed_for(&guard, session, token)? {
            drop(guard);
            self.remove_staging(session);
            return Ok(done);
        }

        let file = self.assemble(session, token, filename, total)?;
        info!(
            session,
            token = token.short(),
            stored = %file.stored_name,
            size = file.size,
            "Assembled chunked upload"
        );

        guard.completed = Some(CompletedUpload {
            token: token.clone(),
            file: file.clone(),
            finished_at: Instant::now(),
        });
        drop(guard);

        self.remove_staging(session);
        Ok(ChunkOutcome::Complete {
            token: token.clone(),
            file,
        })
    }

    fn assemble(
        &self,
        session: &str,
        token: &ShareToken,
        filename: &str,
        total: u32,
    ) -> ShareResult<AssembledFile> {
        let dir = self.session_dir(session);
        if let Some(missing) = staging::first_missing(&dir, total) {
            return Err(ShareError::IncompleteUpload {
                session: session.to_string(),
                missing,
            });
        }

        let mut reader = ChunkReader::new(&dir, total);
        let stored_name = match self.store.save(token, filename, &mut reader) {
            Ok(name) => name,
            Err(e) => {
                return Err(match reader.missing_chunk() {
                    Some(missing) => ShareError::IncompleteUpload {
                        session: session.to_string(),
                        missing,
                    },
                    None => e,
                })
            }
        };
        let (size, sha256) = reader.finish();

        if let Err(e) = self
            .registry
            .record_files(token, std::slice::from_ref(&stored_name))
        {
            if let Err(cleanup) = self.store.remove_file(token, &stored_name) {
                warn!(
                    token = token.short(),
                    stored = %stored_name,
                    error = %cleanup,
                    "Failed to remove unrecorded blob"
                );
            }
            return Err(e);
        }

        Ok(AssembledFile {
            stored_name,
            size,
            sha256,
        })
    }

    fn remove_staging(&self, session: &str) {
        let dir = self.session_dir(session);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(session, error = %e, "Failed to remove staging directory"),
        }
    }

    /// Chunk indices received so far for a session.
    pub fn received_chunks(&self, session: &str) -> ShareResult<Vec<u32>> {
        if !staging::is_valid_session_id(session) {
            return Err(ShareError::InvalidSessionId(session.to_string()));
        }
        Ok(staging::received_indices(&self.session_dir(session))?)
    }

    /// Drop a session's staged chunks. Returns whether anything was staged.
    pub fn abort(&self, session: &str) -> ShareResult<bool> {
        if !staging::is_valid_session_id(session) {
            return Err(ShareError::InvalidSessionId(session.to_string()));
        }
        let dir = self.session_dir(session);
        let existed = dir.exists();
        if existed {
            std::fs::remove_dir_all(&dir)?;
            debug!(session, "Aborted upload session");
        }
        Ok(existed)
    }

    /// Remove staging directories untouched for at least `max_age`, and
    /// forget completed sessions older than that.
    ///
    /// Returns the number of staging directories removed.
    pub fn sweep_stale(&self, max_age: Duration) -> ShareResult<usize> {
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.staging_root)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Cannot read staging directory age");
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age < max_age {
                continue;
            }

            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    removed += 1;
                    debug!(path = ?path, age_secs = age.as_secs(), "Removed stale upload session");
                }
                Err(e) => warn!(path = ?path, error = %e, "Failed to remove stale upload session"),
            }
        }

        self.sessions.retain(|session, slot| match slot.try_lock() {
            Ok(guard) => match &guard.completed {
                Some(done) => done.finished_at.elapsed() < max_age,
                None => self.session_dir(session).exists(),
            },
            Err(TryLockError::WouldBlock) => true,
            Err(TryLockError::Poisoned(_)) => false,
        });

        if removed > 0 {
            info!(removed, "Swept stale upload sessions");
        }
        Ok(removed)
    }
}

fn completed_for(
    slot: &SessionSlot,
    session: &str,
    token: &ShareToken,
) -> ShareResult<Option<ChunkOutcome>> {
    match &slot.completed {
        None => Ok(None),
        Some(done) if &done.token == token => Ok(Some(ChunkOutcome::Complete {
            token: done.token.clone(),
            file: done.file.clone(),
        })),
        Some(_) => Err(ShareError::InvalidSessionId(format!(
            "{} already completed for another share",
            session
        ))),
    }
}
