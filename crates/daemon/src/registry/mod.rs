//! Durable share metadata backed by SQLite.
//!
//! The registry owns the lifecycle of [`ShareRecord`]s: creation, recipient
//! assignment, file bookkeeping, download accounting and deletion. Every
//! operation runs as a single transaction on one connection guarded by a
//! mutex, so callers never observe partial writes.
//!
//! A share without a recipient never expires, whatever `expires_at` holds.
//! It stays pinned until it is explicitly deleted.

mod migrations;

pub use migrations::LATEST_SCHEMA_VERSION;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use protocol::ShareToken;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock, SECS_PER_HOUR};
use crate::error::{ShareError, ShareResult};

/// Largest page size served by [`TokenRegistry::list_all`].
pub const MAX_PAGE_SIZE: u32 = 500;

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata for one share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    /// Share token.
    pub token: ShareToken,
    /// Recipient address; `None` pins the share.
    pub recipient: Option<String>,
    /// Stored filenames, in upload order.
    pub files: Vec<String>,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Unix timestamp of the deadline, meaningful only with a recipient.
    pub expires_at: Option<i64>,
    /// Whether any download completed.
    pub downloaded: bool,
    /// Number of completed downloads.
    pub download_count: u64,
    /// Files downloaded at least once.
    pub downloaded_files: BTreeSet<String>,
    /// Unix timestamp of the last time the download page was opened.
    pub last_download_attempt: Option<i64>,
    /// Unix timestamp of the last completed download.
    pub last_download_completed: Option<i64>,
    /// Bytes served for this share.
    pub bytes_transferred: u64,
}

impl ShareRecord {
    /// Whether a recipient is assigned.
    pub fn has_recipient(&self) -> bool {
        self.recipient.as_deref().is_some_and(|r| !r.is_empty())
    }

    /// Whether the share is past its deadline at `now`.
    pub fn is_expired_at(&self, now: i64) -> bool {
        if !self.has_recipient() {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => now >= expires_at,
            None => false,
        }
    }

    /// Whether `filename` is recorded for this share.
    pub fn has_file(&self, filename: &str) -> bool {
        self.files.iter().any(|f| f == filename)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// 1-based page number.
    pub page: u32,
    /// Requested page size.
    pub per_page: u32,
    /// Total number of items across all pages.
    pub total: u64,
    /// Items on this page.
    pub items: Vec<T>,
}

impl<T> Page<T> {
    /// Number of pages.
    pub fn pages(&self) -> u32 {
        if self.per_page == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.per_page)) as u32
    }

    /// Whether a previous page exists.
    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    /// Whether a next page exists.
    pub fn has_next(&self) -> bool {
        self.page < self.pages()
    }
}

/// Token-keyed share registry.
pub struct TokenRegistry {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl TokenRegistry {
    /// Open or create a registry database at the given path.
    ///
    /// Pending migrations are applied before the registry is returned.
    pub fn open<P: AsRef<Path>>(path: P) -> ShareResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ShareError::Storage(format!(
                        "failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        let registry = Self::from_connection(conn)?;

        info!(path = %path.display(), "Share registry opened");
        Ok(registry)
    }

    /// Open an in-memory registry.
    pub fn open_in_memory() -> ShareResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> ShareResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        migrations::run_migrations(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current time according to the registry's clock.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Get the current schema version.
    pub fn schema_version(&self) -> ShareResult<i32> {
        let conn = self.lock()?;
        migrations::schema_version(&conn)
    }

    fn lock(&self) -> ShareResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ShareError::Storage("registry lock poisoned".to_string()))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a new share with an empty file list.
    ///
    /// `expires_at` is only set when a non-empty recipient is given.
    pub fn create(&self, recipient: Option<&str>, retention_hours: u32) -> ShareResult<ShareToken> {
        validate_retention(retention_hours)?;

        let token = ShareToken::generate();
        let recipient = normalize_recipient(recipient);
        let now = self.now();
        let expires_at = recipient
            .as_ref()
            .map(|_| now + i64::from(retention_hours) * SECS_PER_HOUR);

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO shares (token, recipient, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![token.as_str(), recipient, now, expires_at],
        )?;

        info!(
            token = token.short(),
            pinned = recipient.is_none(),
            "Created share"
        );
        Ok(token)
    }

    /// Get a share by token.
    pub fn get(&self, token: &ShareToken) -> ShareResult<ShareRecord> {
        let conn = self.lock()?;
        load_record(&conn, token.as_str())?.ok_or_else(|| not_found(token))
    }

    /// Get a share by token, refusing shares that are past their deadline.
    pub fn open_share(&self, token: &ShareToken) -> ShareResult<ShareRecord> {
        let record = self.get(token)?;
        if record.is_expired_at(self.now()) {
            return Err(ShareError::Expired(token.short().to_string()));
        }
        Ok(record)
    }

    /// Whether a share exists.
    pub fn exists(&self, token: &ShareToken) -> ShareResult<bool> {
        let conn = self.lock()?;
        share_exists(&conn, token.as_str())
    }

    /// Assign a recipient and restart the retention period from now.
    ///
    /// An empty recipient clears the assignment, which pins the share again.
    pub fn set_recipient(
        &self,
        token: &ShareToken,
        recipient: &str,
        retention_hours: u32,
    ) -> ShareResult<()> {
        validate_retention(retention_hours)?;

        let recipient = normalize_recipient(Some(recipient));
        let expires_at = recipient
            .as_ref()
            .map(|_| self.now() + i64::from(retention_hours) * SECS_PER_HOUR);

        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE shares SET recipient = ?1, expires_at = ?2 WHERE token = ?3",
            params![recipient, expires_at, token.as_str()],
        )?;
        if rows == 0 {
            return Err(not_found(token));
        }

        debug!(token = token.short(), "Assigned share recipient");
        Ok(())
    }

    /// Restart the retention period of a share with a recipient.
    ///
    /// Returns the new deadline, or `None` when the share is pinned and has
    /// nothing to extend.
    pub fn reactivate(&self, token: &ShareToken, retention_hours: u32) -> ShareResult<Option<i64>> {
        validate_retention(retention_hours)?;

        let expires_at = self.now() + i64::from(retention_hours) * SECS_PER_HOUR;
        let conn = self.lock()?;
        let rows = conn.execute(
            r#"
            UPDATE shares SET expires_at = ?1
            WHERE token = ?2 AND recipient IS NOT NULL AND recipient != ''
            "#,
            params![expires_at, token.as_str()],
        )?;

        if rows > 0 {
            info!(token = token.short(), expires_at, "Reactivated share");
            return Ok(Some(expires_at));
        }
        if share_exists(&conn, token.as_str())? {
            Ok(None)
        } else {
            Err(not_found(token))
        }
    }

    /// Append filenames to the share's file list.
    ///
    /// Names already present are left where they are.
    pub fn record_files(&self, token: &ShareToken, filenames: &[String]) -> ShareResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if !share_exists(&tx, token.as_str())? {
            return Err(not_found(token));
        }

        let mut position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM share_files WHERE token = ?1",
            params![token.as_str()],
            |row| row.get(0),
        )?;

        for filename in filenames {
            let inserted = tx.execute(
                r#"
                INSERT OR IGNORE INTO share_files (token, position, filename)
                VALUES (?1, ?2, ?3)
                "#,
                params![token.as_str(), position, filename],
            )?;
            position += inserted as i64;
        }

        tx.commit()?;
        debug!(token = token.short(), count = filenames.len(), "Recorded share files");
        Ok(())
    }

    // =========================================================================
    // Download Accounting
    // =========================================================================

    /// Record that the download page for a share was opened.
    pub fn mark_download_attempt(&self, token: &ShareToken) -> ShareResult<()> {
        let now = self.now();
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE shares SET last_download_attempt = ?1 WHERE token = ?2",
            params![now, token.as_str()],
        )?;
        if rows == 0 {
            return Err(not_found(token));
        }
        Ok(())
    }

    /// Add a file to the share's downloaded set.
    ///
    /// Marking the same file twice is a no-op. Download counters are left
    /// alone; see [`TokenRegistry::mark_downloaded`].
    pub fn mark_file_downloaded(&self, token: &ShareToken, filename: &str) -> ShareResult<()> {
        let now = self.now();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let recorded = tx
            .query_row(
                "SELECT 1 FROM share_files WHERE token = ?1 AND filename = ?2",
                params![token.as_str(), filename],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !recorded {
            return if share_exists(&tx, token.as_str())? {
                Err(ShareError::NotFound(format!(
                    "file {:?} in share {}",
                    filename,
                    token.short()
                )))
            } else {
                Err(not_found(token))
            };
        }

        tx.execute(
            r#"
            INSERT OR IGNORE INTO share_downloads (token, filename, downloaded_at)
            VALUES (?1, ?2, ?3)
            "#,
            params![token.as_str(), filename, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Record a completed download.
    pub fn mark_downloaded(&self, token: &ShareToken) -> ShareResult<()> {
        let now = self.now();
        let conn = self.lock()?;
        let rows = conn.execute(
            r#"
            UPDATE shares
            SET downloaded = 1,
                download_count = download_count + 1,
                last_download_completed = ?1
            WHERE token = ?2
            "#,
            params![now, token.as_str()],
        )?;
        if rows == 0 {
            return Err(not_found(token));
        }
        Ok(())
    }

    /// Add served bytes to the share's transfer total.
    pub fn add_bytes_transferred(&self, token: &ShareToken, bytes: u64) -> ShareResult<()> {
        let bytes = i64::try_from(bytes)
            .map_err(|_| ShareError::Storage(format!("byte count {} out of range", bytes)))?;
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE shares SET bytes_transferred = bytes_transferred + ?1 WHERE token = ?2",
            params![bytes, token.as_str()],
        )?;
        if rows == 0 {
            return Err(not_found(token));
        }
        Ok(())
    }

    /// Remove a share's metadata.
    ///
    /// The share's directory in the object store is not touched.
    pub fn delete(&self, token: &ShareToken) -> ShareResult<bool> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM shares WHERE token = ?1", params![token.as_str()])?;
        if rows > 0 {
            debug!(token = token.short(), "Deleted share record");
        }
        Ok(rows > 0)
    }

    // =========================================================================
    // Listings
    // =========================================================================

    /// List shares that are not expired, newest first.
    pub fn list_active(&self) -> ShareResult<Vec<ShareRecord>> {
        let now = self.now();
        let conn = self.lock()?;
        let tokens = query_tokens(
            &conn,
            r#"
            SELECT token FROM shares
            WHERE recipient IS NULL OR recipient = '' OR expires_at IS NULL OR expires_at > ?1
            ORDER BY created_at DESC, token
            "#,
            params![now],
        )?;
        load_records(&conn, &tokens)
    }

    /// List shares past their deadline, oldest deadline first.
    pub fn list_expired(&self) -> ShareResult<Vec<ShareRecord>> {
        let now = self.now();
        let conn = self.lock()?;
        let tokens = query_tokens(
            &conn,
            r#"
            SELECT token FROM shares
            WHERE recipient IS NOT NULL AND recipient != ''
              AND expires_at IS NOT NULL AND expires_at <= ?1
            ORDER BY expires_at, token
            "#,
            params![now],
        )?;
        load_records(&conn, &tokens)
    }

    /// List all shares, newest first, one page at a time.
    ///
    /// `page` is 1-based; 0 is treated as 1. `page_size` is clamped to
    /// `1..=MAX_PAGE_SIZE`.
    pub fn list_all(&self, page: u32, page_size: u32) -> ShareResult<Page<ShareRecord>> {
        let page = page.max(1);
        let per_page = page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = i64::from(page - 1) * i64::from(per_page);

        let conn = self.lock()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM shares", [], |row| row.get(0))?;
        let tokens = query_tokens(
            &conn,
            r#"
            SELECT token FROM shares
            ORDER BY created_at DESC, token
            LIMIT ?1 OFFSET ?2
            "#,
            params![i64::from(per_page), offset],
        )?;
        let items = load_records(&conn, &tokens)?;

        Ok(Page {
            page,
            per_page,
            total: total.max(0) as u64,
            items,
        })
    }

    /// Total number of shares.
    pub fn count_total(&self) -> ShareResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM shares", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Number of shares that are not expired.
    pub fn count_active(&self) -> ShareResult<u64> {
        let now = self.now();
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM shares
            WHERE recipient IS NULL OR recipient = '' OR expires_at IS NULL OR expires_at > ?1
            "#,
            params![now],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

fn validate_retention(retention_hours: u32) -> ShareResult<()> {
    if retention_hours == 0 {
        return Err(ShareError::InvalidRetention(retention_hours));
    }
    Ok(())
}

fn normalize_recipient(recipient: Option<&str>) -> Option<String> {
    recipient
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
}

fn not_found(token: &ShareToken) -> ShareError {
    ShareError::NotFound(format!("share {}", token.short()))
}

fn share_exists(conn: &Connection, token: &str) -> ShareResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM shares WHERE token = ?1",
            params![token],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn query_tokens(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> ShareResult<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let tokens = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tokens)
}

fn load_records(conn: &Connection, tokens: &[String]) -> ShareResult<Vec<ShareRecord>> {
    let mut records = Vec::with_capacity(tokens.len());
    for token in tokens {
        if let Some(record) = load_record(conn, token)? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Raw `shares` row before the child tables are attached.
struct ShareRow {
    token: String,
    recipient: Option<String>,
    created_at: i64,
    expires_at: Option<i64>,
    downloaded: bool,
    download_count: i64,
    last_download_attempt: Option<i64>,
    last_download_completed: Option<i64>,
    bytes_transferred: i64,
}

fn load_record(conn: &Connection, token: &str) -> ShareResult<Option<ShareRecord>> {
    let row = conn
        .query_row(
            r#"
            SELECT token, recipient, created_at, expires_at, downloaded, download_count,
                   last_download_attempt, last_download_completed, bytes_transferred
            FROM shares
            WHERE token = ?1
            "#,
            params![token],
            |row| {
                Ok(ShareRow {
                    token: row.get(0)?,
                    recipient: row.get(1)?,
                    created_at: row.get(2)?,
                    expires_at: row.get(3)?,
                    downloaded: row.get::<_, i64>(4)? != 0,
                    download_count: row.get(5)?,
                    last_download_attempt: row.get(6)?,
                    last_download_completed: row.get(7)?,
                    bytes_transferred: row.get(8)?,
                })
            },
        )
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT filename FROM share_files WHERE token = ?1 ORDER BY position, filename",
    )?;
    let files = stmt
        .query_map(params![token], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = conn.prepare("SELECT filename FROM share_downloads WHERE token = ?1")?;
    let downloaded_files = stmt
        .query_map(params![token], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<BTreeSet<_>>>()?;

    let token = ShareToken::parse(&row.token)
        .map_err(|e| ShareError::Storage(format!("corrupt token in registry: {}", e)))?;

    Ok(Some(ShareRecord {
        token,
        recipient: row.recipient,
        files,
        created_at: row.created_at,
        expires_at: row.expires_at,
        downloaded: row.downloaded,
        download_count: row.download_count.max(0) as u64,
        downloaded_files,
        last_download_attempt: row.last_download_attempt,
        last_download_completed: row.last_download_completed,
        bytes_transferred: row.bytes_transferred.max(0) as u64,
    }))
}
