//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that opens the token
//! registry, the object store and the chunk assembler, runs the eviction
//! scheduler, and answers operator requests on the control socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use protocol::ShareToken;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ShareError, ShareResult};
use crate::eviction::{EvictionScheduler, EvictionSettings};
use crate::ipc::{get_socket_path, IpcConnection, IpcRequest, IpcResponse, IpcServer, IpcShareInfo};
use crate::registry::TokenRegistry;
use crate::service::ShareService;
use crate::store::ObjectStore;
use crate::upload::ChunkAssembler;

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting requests.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// An operator-triggered sweep finished.
    SweepCompleted { reclaimed: usize },
    /// A share was created over the control socket.
    ShareCreated { token: String },
    /// A share was deleted over the control socket.
    ShareDeleted { token: String },
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Share operations over registry, store and assembler.
    service: ShareService,
    /// Background eviction.
    scheduler: Arc<EvictionScheduler>,
    /// Control socket location.
    socket_path: PathBuf,
    /// Control socket accept loop.
    ipc_task: Mutex<Option<JoinHandle<()>>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    ///
    /// Opens (and migrates) the registry database and creates the upload
    /// and staging directories.
    pub fn new(config: Config) -> Result<Self> {
        let database_path = config.database_path();
        let registry = Arc::new(TokenRegistry::open(&database_path).with_context(|| {
            format!("Failed to open share registry: {}", database_path.display())
        })?);

        let upload_dir = config.upload_dir();
        let store = Arc::new(ObjectStore::new(&upload_dir).with_context(|| {
            format!("Failed to open upload directory: {}", upload_dir.display())
        })?);

        let staging_dir = config.staging_dir();
        let assembler = Arc::new(
            ChunkAssembler::new(&staging_dir, Arc::clone(&registry), Arc::clone(&store))
                .with_context(|| {
                    format!("Failed to open staging directory: {}", staging_dir.display())
                })?,
        );

        let scheduler = Arc::new(
            EvictionScheduler::new(
                Arc::clone(&registry),
                Arc::clone(&store),
                EvictionSettings::from(&config.eviction),
            )
            .with_assembler(Arc::clone(&assembler)),
        );

        let service = ShareService::new(registry, store, assembler, config.shares.retention_hours);

        info!(
            database = %database_path.display(),
            uploads = %upload_dir.display(),
            retention_hours = config.shares.retention_hours,
            "Share store opened"
        );

        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            service,
            scheduler,
            socket_path: get_socket_path(),
            ipc_task: Mutex::new(None),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Listen on `path` instead of the default control socket.
    pub fn with_socket_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the daemon orchestrator.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let server = match IpcServer::bind(&self.socket_path).await {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                return Err(e).with_context(|| {
                    format!(
                        "Failed to bind control socket: {}",
                        self.socket_path.display()
                    )
                });
            }
        };
        info!(path = %server.path().display(), "Control socket listening");

        if self.scheduler.start() {
            debug!("Started eviction scheduler");
        }

        let handler = RequestHandler {
            service: self.service.clone(),
            scheduler: Arc::clone(&self.scheduler),
            started_at: Instant::now(),
            shutdown_token: self.shutdown_token.clone(),
            event_tx: self.event_tx.clone(),
        };
        let shutdown_token = self.shutdown_token.clone();
        let handle = tokio::spawn(async move {
            Self::accept_loop(server, handler, shutdown_token).await;
        });
        *self.ipc_task.lock().await = Some(handle);

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    /// Accepts control connections until shutdown.
    async fn accept_loop(
        server: IpcServer,
        handler: RequestHandler,
        shutdown_token: CancellationToken,
    ) {
        let handler = Arc::new(handler);
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    debug!("Control socket loop received shutdown signal");
                    break;
                }
                accepted = server.accept() => match accepted {
                    Ok(conn) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            handler.serve(conn).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept control connection");
                    }
                },
            }
        }
        // Dropping the server removes the socket file.
    }

    /// Stops the daemon orchestrator gracefully.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        if let Some(handle) = self.ipc_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Control socket task ended abnormally");
            }
        }

        self.scheduler.stop().await;

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the configuration the daemon runs with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the share service.
    pub fn service(&self) -> &ShareService {
        &self.service
    }

    /// Returns the eviction scheduler.
    pub fn scheduler(&self) -> &Arc<EvictionScheduler> {
        &self.scheduler
    }

    /// Returns the control socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    ///
    /// A `Stop` request on the control socket cancels it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

/// Answers control socket requests.
struct RequestHandler {
    service: ShareService,
    scheduler: Arc<EvictionScheduler>,
    started_at: Instant,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl RequestHandler {
    async fn serve(&self, mut conn: IpcConnection) {
        loop {
            let request = match conn.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Dropping control connection");
                    let _ = conn.send_response(&IpcResponse::error(&e)).await;
                    break;
                }
            };

            let stopping = request == IpcRequest::Stop;
            let response = self.handle(request).await;
            if let Err(e) = conn.send_response(&response).await {
                debug!(error = %e, "Failed to send control response");
                break;
            }
            if stopping {
                self.shutdown_token.cancel();
                break;
            }
        }
    }

    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        debug!(?request, "Control request");
        let result = match request {
            IpcRequest::Ping => Ok(IpcResponse::Pong),
            IpcRequest::Stop => {
                info!("Shutdown requested over control socket");
                Ok(IpcResponse::Stopping)
            }
            IpcRequest::Status => self.status().await,
            IpcRequest::Sweep => self.sweep().await,
            IpcRequest::ListShares { page, per_page } => self.list_shares(page, per_page).await,
            IpcRequest::CreateShare { recipient } => self.create_share(recipient).await,
            IpcRequest::DeleteShare { token } => self.delete_share(token).await,
            IpcRequest::Reactivate { token } => self.reactivate(token).await,
        };

        result.unwrap_or_else(|e| {
            warn!(error = %e, "Control request failed");
            let _ = self.event_tx.send(OrchestratorEvent::Error {
                message: e.to_string(),
            });
            IpcResponse::error(e)
        })
    }

    async fn status(&self) -> ShareResult<IpcResponse> {
        let registry = Arc::clone(self.service.registry());
        let (total_shares, active_shares) =
            blocking(move || Ok((registry.count_total()?, registry.count_active()?))).await?;

        Ok(IpcResponse::Status {
            running: true,
            uptime_secs: self.started_at.elapsed().as_secs(),
            total_shares,
            active_shares,
        })
    }

    async fn sweep(&self) -> ShareResult<IpcResponse> {
        let report = self.scheduler.run_now().await?;
        let reclaimed = report.reclaimed();
        info!(
            reclaimed,
            failures = report.failures,
            "Manual eviction sweep finished"
        );
        let _ = self
            .event_tx
            .send(OrchestratorEvent::SweepCompleted { reclaimed });
        Ok(IpcResponse::SweepCompleted { removed: reclaimed })
    }

    async fn list_shares(&self, page: u32, per_page: u32) -> ShareResult<IpcResponse> {
        let registry = Arc::clone(self.service.registry());
        blocking(move || {
            let listing = registry.list_all(page, per_page)?;
            let now = registry.now();
            Ok(IpcResponse::Shares {
                page: listing.page,
                pages: listing.pages(),
                total: listing.total,
                shares: listing
                    .items
                    .iter()
                    .map(|record| IpcShareInfo::from_record(record, now))
                    .collect(),
            })
        })
        .await
    }

    async fn create_share(&self, recipient: Option<String>) -> ShareResult<IpcResponse> {
        let service = self.service.clone();
        let token = blocking(move || service.create_share(recipient.as_deref())).await?;
        info!(token = token.short(), "Created share over control socket");
        let _ = self.event_tx.send(OrchestratorEvent::ShareCreated {
            token: token.to_string(),
        });
        Ok(IpcResponse::ShareCreated {
            token: token.into(),
        })
    }

    async fn delete_share(&self, token: String) -> ShareResult<IpcResponse> {
        let token = ShareToken::parse(&token)?;
        let service = self.service.clone();
        let deleted = token.clone();
        blocking(move || service.delete_share(&deleted)).await?;
        let _ = self.event_tx.send(OrchestratorEvent::ShareDeleted {
            token: token.to_string(),
        });
        Ok(IpcResponse::ShareDeleted {
            token: token.into(),
        })
    }

    async fn reactivate(&self, token: String) -> ShareResult<IpcResponse> {
        let token = ShareToken::parse(&token)?;
        let service = self.service.clone();
        let reactivated = token.clone();
        let expires_at = blocking(move || service.reactivate(&reactivated)).await?;
        Ok(IpcResponse::ShareReactivated {
            token: token.into(),
            expires_at,
        })
    }
}

/// Run registry or filesystem work on the blocking pool.
async fn blocking<T, F>(work: F) -> ShareResult<T>
where
    F: FnOnce() -> ShareResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| {
        error!(error = %e, "Blocking task failed");
        ShareError::Storage(format!("task failed: {}", e))
    })?
}
