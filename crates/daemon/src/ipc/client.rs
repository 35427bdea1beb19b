//! Client side of the control socket, used by the operator CLI.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Minimum timeout for sweep requests.
const SWEEP_TIMEOUT_SECS: u64 = 300;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// Fails when nothing listens there, which usually means the daemon is
    /// not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to the daemon with a custom timeout.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request and wait for the response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let timeout = match &request {
            IpcRequest::Sweep => self.timeout.max(Duration::from_secs(SWEEP_TIMEOUT_SECS)),
            _ => self.timeout,
        };
        tokio::time::timeout(timeout, self.send_internal(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn send_internal(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Returns `true` if the daemon answers with a Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    /// Trigger an eviction sweep and wait for it to finish.
    pub async fn sweep(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Sweep).await
    }

    pub async fn list_shares(&mut self, page: u32, per_page: u32) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::ListShares { page, per_page }).await
    }

    pub async fn create_share(
        &mut self,
        recipient: Option<String>,
    ) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::CreateShare { recipient }).await
    }

    pub async fn delete_share(&mut self, token: String) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::DeleteShare { token }).await
    }

    pub async fn reactivate(&mut self, token: String) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Reactivate { token }).await
    }
}

fn timed_out(message: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::IpcServer;
    use tempfile::tempdir;

    /// Serve exactly one request with a canned response.
    async fn serve_once(
        socket_path: &Path,
        expected: IpcRequest,
        response: IpcResponse,
    ) -> tokio::task::JoinHandle<()> {
        let server = IpcServer::bind(socket_path).await.unwrap();
        tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let request = conn.read_request().await.unwrap().unwrap();
            assert_eq!(request, expected);
            conn.send_response(&response).await.unwrap();
        })
    }

    #[tokio::test]
    async fn test_connect_fails_when_daemon_not_running() {
        let temp_dir = tempdir().unwrap();
        let result = IpcClient::connect(&temp_dir.path().join("missing.sock")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ping() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = serve_once(&socket_path, IpcRequest::Ping, IpcResponse::Pong).await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert!(client.ping().await.unwrap());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_status() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let status = IpcResponse::Status {
            running: true,
            uptime_secs: 100,
            total_shares: 7,
            active_shares: 5,
        };
        let server = serve_once(&socket_path, IpcRequest::Status, status.clone()).await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert_eq!(client.status().await.unwrap(), status);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = serve_once(
            &socket_path,
            IpcRequest::Sweep,
            IpcResponse::SweepCompleted { removed: 4 },
        )
        .await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert_eq!(
            client.sweep().await.unwrap(),
            IpcResponse::SweepCompleted { removed: 4 }
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_share() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = serve_once(
            &socket_path,
            IpcRequest::DeleteShare {
                token: "abc".to_string(),
            },
            IpcResponse::ShareDeleted {
                token: "abc".to_string(),
            },
        )
        .await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let response = client.delete_share("abc".to_string()).await.unwrap();
        assert_eq!(
            response,
            IpcResponse::ShareDeleted {
                token: "abc".to_string()
            }
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        // Accepts but never answers
        let _handle = tokio::spawn(async move {
            let _conn = server.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut client = IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(client.ping().await.is_err());
    }
}
