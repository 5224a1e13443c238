use crate::config::Settings;
use crate::error::ServerError;
use crate::flight::{HangarFlightService, ServiceOptions};
use arrow_flight::flight_service_server::FlightServiceServer;
use hangar_engine::QueryEngine;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Bound,
    Serving,
    ShuttingDown,
    Closed,
}

type AcceptLoop = JoinHandle<Result<(), tonic::transport::Error>>;

/// How long cancelled connections get to close before the accept loop is aborted.
const CANCEL_DRAIN: Duration = Duration::from_millis(500);

/// Owns the listener, the accept loop and the engine's lifetime.
pub struct FlightServer {
    state: ServerState,
    settings: Settings,
    service: HangarFlightService,
    engine: Arc<dyn QueryEngine>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    stop_accepting: Option<oneshot::Sender<()>>,
    accept_loop: Option<AcceptLoop>,
}

impl FlightServer {
    /// Validates `settings` and builds the service. Nothing is bound yet.
    pub fn new(settings: Settings, engine: Arc<dyn QueryEngine>) -> Result<Self, ServerError> {
        settings.validate()?;
        let service = HangarFlightService::new(
            settings.dataset_names().map(str::to_string).collect::<Vec<_>>(),
            engine.clone(),
            ServiceOptions::from(&settings),
        );
        Ok(Self {
            state: ServerState::Created,
            settings,
            service,
            engine,
            listener: None,
            local_addr: None,
            stop_accepting: None,
            accept_loop: None,
        })
    }

    /// Builds the server and opens its listener.
    pub async fn bind(settings: Settings, engine: Arc<dyn QueryEngine>) -> Result<Self, ServerError> {
        let mut server = Self::new(settings, engine)?;
        server.listen().await?;
        Ok(server)
    }

    /// Opens the TCP listener. Port 0 picks a free port, see [`Self::local_addr`].
    pub async fn listen(&mut self) -> Result<SocketAddr, ServerError> {
        if self.state != ServerState::Created {
            return Err(ServerError::Internal(format!(
                "cannot bind a server in state {:?}",
                self.state
            )));
        }
        let addr = self.settings.server_address()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        info!("Bound Flight listener on {}", local_addr);
        self.listener = Some(listener);
        self.local_addr = Some(local_addr);
        self.state = ServerState::Bound;
        Ok(local_addr)
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn service(&self) -> &HangarFlightService {
        &self.service
    }

    /// Completes when a client asks the server to shut down.
    pub fn shutdown_requested(&self) -> impl Future<Output = ()> + Send + 'static {
        let requests: Arc<Notify> = self.service.shutdown_requests();
        async move { requests.notified().await }
    }

    /// Starts accepting connections in the background.
    pub fn serve(&mut self) -> Result<(), ServerError> {
        match self.state {
            ServerState::Bound => {}
            ServerState::Created => return Err(ServerError::NotBound),
            _ => return Err(ServerError::AlreadyServing),
        }
        let listener = self.listener.take().ok_or(ServerError::NotBound)?;
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let router = Server::builder().add_service(FlightServiceServer::new(self.service.clone()));
        let accept_loop = tokio::spawn(async move {
            router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = stop_rx.await;
                })
                .await
        });

        info!(
            "Serving {} datasets on {}",
            self.service.catalog().list_datasets().len(),
            self.local_addr
                .map(|addr| addr.to_string())
                .unwrap_or_default()
        );
        self.stop_accepting = Some(stop_tx);
        self.accept_loop = Some(accept_loop);
        self.state = ServerState::Serving;
        Ok(())
    }

    /// Stops accepting, drains in-flight calls for up to the grace period,
    /// then closes the engine.
    ///
    /// DoGet streams still open when the grace period ends are cut off with
    /// `Unavailable` and their engine streams released before the engine closes.
    pub async fn shutdown(&mut self) -> Result<(), ServerError> {
        if self.state != ServerState::Serving {
            return Err(ServerError::NotServing);
        }
        self.state = ServerState::ShuttingDown;
        info!("Shutting down Flight server");

        if let Some(stop) = self.stop_accepting.take() {
            let _ = stop.send(());
        }

        if let Some(mut accept_loop) = self.accept_loop.take() {
            let grace = self.settings.shutdown_grace();
            match tokio::time::timeout(grace, &mut accept_loop).await {
                Ok(Ok(Ok(()))) => info!("All in-flight calls finished"),
                Ok(Ok(Err(e))) => error!("Flight transport failed: {}", e),
                Ok(Err(e)) => error!("Accept loop panicked: {}", e),
                Err(_) => {
                    warn!(
                        "In-flight calls still running after {:?}, cancelling them",
                        grace
                    );
                    self.service.cancel_streams();
                    if tokio::time::timeout(CANCEL_DRAIN, &mut accept_loop)
                        .await
                        .is_err()
                    {
                        accept_loop.abort();
                        let _ = accept_loop.await;
                    }
                }
            }
        }

        self.service.cancel_streams();
        let closed = self.engine.close().await;
        self.state = ServerState::Closed;
        closed?;
        info!("Flight server closed");
        Ok(())
    }
}
