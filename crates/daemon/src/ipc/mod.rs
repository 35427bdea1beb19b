//! Operator control channel over a Unix Domain Socket.
//!
//! The running daemon answers status queries, manual eviction requests and
//! share administration commands from the `sharebox-daemon` CLI. Messages
//! are newline-delimited JSON: one request object per line, answered by one
//! response object per line.
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{get_socket_path, IpcClient, IpcResponse};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!
//!     if let IpcResponse::SweepCompleted { removed } = client.sweep().await? {
//!         println!("reclaimed {} shares", removed);
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse, IpcShareInfo};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Location of the daemon's control socket.
///
/// `$XDG_RUNTIME_DIR/sharebox/daemon.sock` when the runtime directory is
/// known, `/tmp/sharebox-$UID/daemon.sock` otherwise.
#[cfg(unix)]
pub fn get_socket_path() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => {
            PathBuf::from(runtime_dir).join("sharebox").join("daemon.sock")
        }
        _ => {
            let uid = std::fs::metadata("/proc/self")
                .map(|m| m.uid())
                .unwrap_or(0);
            PathBuf::from(format!("/tmp/sharebox-{}", uid)).join("daemon.sock")
        }
    }
}

#[cfg(not(unix))]
pub fn get_socket_path() -> PathBuf {
    PathBuf::from("/tmp/sharebox-unsupported/daemon.sock")
}
