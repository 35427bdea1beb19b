//! Listening side of the control socket.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use super::messages::{IpcRequest, IpcResponse};

/// Longest request line accepted from a client.
const MAX_REQUEST_LINE: usize = 64 * 1024;

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Parent directories are created, a stale socket file is replaced, and
    /// the socket is made accessible to its owner only.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        debug!(path = %path.display(), "Control socket bound");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Path the server is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A connection to an IPC client.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = (&mut self.reader)
            .take(MAX_REQUEST_LINE as u64 + 1)
            .read_line(&mut line)
            .await?;

        if bytes_read == 0 {
            return Ok(None);
        }
        if bytes_read > MAX_REQUEST_LINE {
            return Err(IpcError::RequestTooLarge(bytes_read));
        }

        let request = serde_json::from_str(line.trim())?;
        Ok(Some(request))
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A request line exceeded the size limit.
    #[error("request too large: more than {0} bytes")]
    RequestTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_bind_creates_parent_dirs_and_restricts_mode() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nested").join("daemon.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        drop(server);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let _server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_request_response_exchange() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let client_path = socket_path.clone();
        let client = tokio::spawn(async move {
            let stream = UnixStream::connect(&client_path).await.unwrap();
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut reader = BufReader::new(read_half);

            let request = serde_json::to_string(&IpcRequest::Sweep).unwrap();
            write_half
                .write_all(format!("{}\n", request).as_bytes())
                .await
                .unwrap();

            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            serde_json::from_str::<IpcResponse>(line.trim()).unwrap()
        });

        let mut conn = server.accept().await.unwrap();
        assert_eq!(conn.read_request().await.unwrap(), Some(IpcRequest::Sweep));
        conn.send_response(&IpcResponse::SweepCompleted { removed: 2 })
            .await
            .unwrap();

        assert_eq!(
            client.await.unwrap(),
            IpcResponse::SweepCompleted { removed: 2 }
        );
    }

    #[tokio::test]
    async fn test_malformed_request_is_json_error() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let client_path = socket_path.clone();
        tokio::spawn(async move {
            let mut stream = UnixStream::connect(&client_path).await.unwrap();
            stream.write_all(b"{not json}\n").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        });

        let mut conn = server.accept().await.unwrap();
        assert!(matches!(conn.read_request().await, Err(IpcError::Json(_))));
    }

    #[tokio::test]
    async fn test_read_returns_none_on_disconnect() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let client_path = socket_path.clone();
        tokio::spawn(async move {
            let _stream = UnixStream::connect(&client_path).await.unwrap();
        });

        let mut conn = server.accept().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(conn.read_request().await.unwrap().is_none());
    }
}
