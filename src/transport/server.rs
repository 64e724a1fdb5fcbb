//! Hub TCP server
//!
//! Handles the accept loop and spawns one task per connection.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::protocol::{Request, Response};
use super::ServerConfig;
use crate::directory::HubDirectory;
use crate::error::Result;
use crate::frame;
use crate::hub::{EventSink, SinkClosed};
use crate::types::EventRecord;

/// Serves subscribe streams and broker publishes for a [`HubDirectory`].
///
/// Start it only after [`initialize_with_retry`](crate::boot::initialize_with_retry)
/// has returned `Ready`.
pub struct HubServer {
    directory: Arc<HubDirectory>,
    config: ServerConfig,
    next_connection_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl HubServer {
    pub fn new(directory: Arc<HubDirectory>, config: ServerConfig) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            directory,
            config,
            next_connection_id: AtomicU64::new(1),
            connection_semaphore,
        }
    }

    pub fn directory(&self) -> &Arc<HubDirectory> {
        &self.directory
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves or the
    /// directory's shutdown token fires.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Hub server listening");

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
            }
            _ = self.directory.shutdown_token().cancelled() => {
                tracing::info!("Hub shutdown, closing listener");
            }
            _ = self.accept_loop(&listener) => {}
        }

        Ok(())
    }

    async fn accept_loop(&self, listener: &TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let permit = match self.connection_semaphore {
            Some(ref sem) => match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            },
            None => None,
        };

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(connection_id = connection_id, peer = %peer_addr, "New connection");

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let connection = Connection {
            id: connection_id,
            directory: Arc::clone(&self.directory),
            config: self.config.clone(),
            _permit: permit,
        };

        tokio::spawn(async move {
            let shutdown = connection.directory.shutdown_token().clone();
            let result = tokio::select! {
                result = connection.run(socket) => result,
                _ = shutdown.cancelled() => Ok(()),
            };
            if let Err(e) = result {
                tracing::debug!(connection_id = connection_id, error = %e, "Connection error");
            }
            tracing::debug!(connection_id = connection_id, "Connection closed");
        });
    }
}

struct Connection {
    id: u64,
    directory: Arc<HubDirectory>,
    config: ServerConfig,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Connection {
    async fn run(&self, socket: TcpStream) -> Result<()> {
        let (mut reader, writer) = socket.into_split();
        let mut writer = BufWriter::with_capacity(self.config.write_buffer_size, writer);

        loop {
            let request = match frame::read_async::<_, Request>(&mut reader, self.config.max_frame_size).await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(e) => {
                    let _ = frame::write_async(&mut writer, &Response::error(e.to_string())).await;
                    return Err(e.into());
                }
            };

            match request {
                Request::Publish {
                    event_type,
                    payload,
                } => {
                    let response = self.accept_publish(event_type, payload);
                    frame::write_async(&mut writer, &response).await?;
                }
                Request::Subscribe {
                    event_type,
                    subscriber_id,
                } => {
                    return self
                        .stream_events(&event_type, &subscriber_id, reader, writer)
                        .await;
                }
            }
        }
    }

    /// Hand a publish to its hub and acknowledge without waiting for delivery.
    fn accept_publish(&self, event_type: String, payload: Vec<u8>) -> Response {
        if !self.directory.config().mode.is_broker() {
            tracing::debug!(
                connection_id = self.id,
                event_type = %event_type,
                "Publish rejected: hub is not a broker"
            );
            return Response::error("publish not accepted: hub is not running as a broker");
        }

        if self.directory.hub(&event_type).is_none() {
            return Response::error(format!("no hub registered for event type: {event_type}"));
        }

        let directory = Arc::clone(&self.directory);
        tokio::spawn(async move {
            if let Err(e) = directory
                .route_raw(&event_type, payload, CancellationToken::new())
                .await
            {
                tracing::warn!(event_type = %event_type, error = %e, "Failed to route published event");
            }
        });

        Response::Ack
    }

    async fn stream_events(
        &self,
        event_type: &str,
        subscriber_id: &str,
        mut reader: OwnedReadHalf,
        mut writer: BufWriter<OwnedWriteHalf>,
    ) -> Result<()> {
        let Some(hub) = self.directory.hub(event_type) else {
            let message = format!("no hub registered for event type: {event_type}");
            frame::write_async(&mut writer, &Response::error(message)).await?;
            return Ok(());
        };

        // A subscribe connection sends nothing more; EOF means the client left.
        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                loop {
                    tokio::select! {
                        read = reader.read(&mut buf) => match read {
                            Ok(0) | Err(_) => break,
                            Ok(_) => continue,
                        },
                        _ = cancel.cancelled() => break,
                    }
                }
                cancel.cancel();
            })
        };

        let mut sink = FrameSink { writer };
        hub.run_subscriber(subscriber_id, &mut sink, cancel.clone())
            .await;

        cancel.cancel();
        let _ = watcher.await;
        Ok(())
    }
}

/// Writes each record as a `Response::Event` frame.
struct FrameSink {
    writer: BufWriter<OwnedWriteHalf>,
}

#[async_trait]
impl EventSink for FrameSink {
    async fn send(&mut self, record: &EventRecord) -> std::result::Result<(), SinkClosed> {
        let response = Response::Event {
            payload: record.payload.clone(),
        };
        frame::write_async(&mut self.writer, &response)
            .await
            .map_err(|_| SinkClosed)
    }
}
