//! Share operations composed from the registry, the object store and the
//! chunk assembler.
//!
//! This is the surface the web layer calls. It applies the configured
//! retention and keeps download bookkeeping in step with file access.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use protocol::{ChunkUpload, ChunkUploadResponse, ShareToken};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ShareError, ShareResult};
use crate::registry::{ShareRecord, TokenRegistry};
use crate::store::ObjectStore;
use crate::upload::ChunkAssembler;

/// One file of a share, as shown on the download page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    /// `None` when the blob is missing from disk.
    pub size: Option<u64>,
    pub downloaded: bool,
}

/// What a recipient sees when opening a share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShareSummary {
    pub record: ShareRecord,
    pub files: Vec<FileEntry>,
    pub total_size: u64,
}

/// An open blob ready to stream.
#[derive(Debug)]
pub struct Download {
    pub file: File,
    pub filename: String,
    pub size: u64,
}

/// Facade over the share store components.
#[derive(Clone)]
pub struct ShareService {
    registry: Arc<TokenRegistry>,
    store: Arc<ObjectStore>,
    assembler: Arc<ChunkAssembler>,
    retention_hours: u32,
}

impl ShareService {
    pub fn new(
        registry: Arc<TokenRegistry>,
        store: Arc<ObjectStore>,
        assembler: Arc<ChunkAssembler>,
        retention_hours: u32,
    ) -> Self {
        Self {
            registry,
            store,
            assembler,
            retention_hours,
        }
    }

    pub fn registry(&self) -> &Arc<TokenRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub fn assembler(&self) -> &Arc<ChunkAssembler> {
        &self.assembler
    }

    pub fn retention_hours(&self) -> u32 {
        self.retention_hours
    }

    /// Create a share, optionally addressed to a recipient.
    pub fn create_share(&self, recipient: Option<&str>) -> ShareResult<ShareToken> {
        self.registry.create(recipient, self.retention_hours)
    }

    /// Store a whole file in one request and record it.
    pub fn upload<R: Read + ?Sized>(
        &self,
        token: &ShareToken,
        filename: &str,
        reader: &mut R,
    ) -> ShareResult<String> {
        self.registry.open_share(token)?;

        let stored = self.store.save(token, filename, reader)?;
        if let Err(e) = self
            .registry
            .record_files(token, std::slice::from_ref(&stored))
        {
            if let Err(cleanup) = self.store.remove_file(token, &stored) {
                warn!(token = token.short(), error = %cleanup, "Failed to remove unrecorded blob");
            }
            return Err(e);
        }

        info!(token = token.short(), stored = %stored, "Uploaded file");
        Ok(stored)
    }

    /// Accept one chunk of a resumable upload.
    pub fn upload_chunk(&self, chunk: &ChunkUpload) -> ShareResult<ChunkUploadResponse> {
        Ok(self.assembler.upload_chunk(chunk)?.to_response())
    }

    /// Open a share's download page.
    pub fn open_download(&self, token: &ShareToken) -> ShareResult<ShareSummary> {
        self.registry.open_share(token)?;
        self.registry.mark_download_attempt(token)?;
        let record = self.registry.get(token)?;

        let mut files = Vec::with_capacity(record.files.len());
        let mut total_size = 0;
        for name in &record.files {
            let size = self.store.size_of(token, name)?;
            total_size += size.unwrap_or(0);
            files.push(FileEntry {
                name: name.clone(),
                size,
                downloaded: record.downloaded_files.contains(name),
            });
        }

        debug!(token = token.short(), files = files.len(), "Opened share");
        Ok(ShareSummary {
            record,
            files,
            total_size,
        })
    }

    /// Open one file for download and account for it.
    pub fn download_file(&self, token: &ShareToken, filename: &str) -> ShareResult<Download> {
        let record = self.registry.open_share(token)?;
        let file = self.store.read(&record, filename)?;
        let size = file.metadata()?.len();

        self.registry.mark_file_downloaded(token, filename)?;
        self.registry.mark_downloaded(token)?;
        self.registry.add_bytes_transferred(token, size)?;

        info!(token = token.short(), file = filename, size, "Serving download");
        Ok(Download {
            file,
            filename: filename.to_string(),
            size,
        })
    }

    /// Assign a recipient, restarting the retention period.
    pub fn assign_recipient(&self, token: &ShareToken, recipient: &str) -> ShareResult<()> {
        self.registry
            .set_recipient(token, recipient, self.retention_hours)
    }

    /// Restart the retention period. Returns the new deadline.
    pub fn reactivate(&self, token: &ShareToken) -> ShareResult<Option<i64>> {
        self.registry.reactivate(token, self.retention_hours)
    }

    /// Delete a share's files and record.
    pub fn delete_share(&self, token: &ShareToken) -> ShareResult<()> {
        let removed_dir = self.store.delete_all(token)?;
        let removed_record = self.registry.delete(token)?;
        if !removed_dir && !removed_record {
            return Err(ShareError::NotFound(format!("share {}", token.short())));
        }
        info!(token = token.short(), "Deleted share");
        Ok(())
    }
}
