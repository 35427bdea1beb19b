//! Request and response types of the operator control channel.

use serde::{Deserialize, Serialize};

use crate::registry::ShareRecord;

/// Requests sent by the operator CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get daemon and registry counters.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// Run an eviction sweep now.
    Sweep,
    /// List shares, newest first.
    ListShares {
        /// 1-based page number.
        page: u32,
        /// Shares per page.
        per_page: u32,
    },
    /// Create a share.
    CreateShare {
        /// Recipient address; `None` creates a pinned share.
        recipient: Option<String>,
    },
    /// Delete a share's files and record.
    DeleteShare { token: String },
    /// Restart a share's retention period.
    Reactivate { token: String },
}

/// Responses sent by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Shares in the registry.
        total_shares: u64,
        /// Shares that have not expired.
        active_shares: u64,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// A sweep finished.
    SweepCompleted {
        /// Shares reclaimed by the sweep.
        removed: usize,
    },
    /// One page of shares.
    Shares {
        page: u32,
        pages: u32,
        total: u64,
        shares: Vec<IpcShareInfo>,
    },
    /// A share was created.
    ShareCreated { token: String },
    /// A share was deleted.
    ShareDeleted { token: String },
    /// A share's retention was restarted.
    ShareReactivated {
        token: String,
        /// New deadline, `None` for a share without recipient.
        expires_at: Option<i64>,
    },
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

impl IpcResponse {
    /// Error response from anything displayable.
    pub fn error(message: impl ToString) -> Self {
        IpcResponse::Error {
            message: message.to_string(),
        }
    }
}

/// Share listing entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcShareInfo {
    pub token: String,
    pub recipient: Option<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub expired: bool,
    pub files: usize,
    pub download_count: u64,
    pub bytes_transferred: u64,
}

impl IpcShareInfo {
    /// Listing entry for `record` as seen at `now`.
    pub fn from_record(record: &ShareRecord, now: i64) -> Self {
        Self {
            token: record.token.to_string(),
            recipient: record.recipient.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at,
            expired: record.is_expired_at(now),
            files: record.files.len(),
            download_count: record.download_count,
            bytes_transferred: record.bytes_transferred,
        }
    }
}
