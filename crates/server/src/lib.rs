//! Relay buffer server
//!
//! An in-memory relay that sits between one publishing operator and any
//! number of subscribing operators, decoupling their execution rates,
//! replicating a stream to every subscriber and retaining tuples for
//! replay until every subscriber has consumed past them.
//!
//! One lightweight task serves each connection. The first frame must be a
//! registration or control request naming a stream identifier; the
//! connection then becomes a publisher session (inbound tuples) or a
//! subscriber session (outbound tuples), or performs a one-shot purge or
//! reset.

pub mod config;
pub mod error;
pub mod registry;

mod publisher;
mod subscriber;

use std::net::SocketAddr;
use std::sync::Arc;

use relay_wire::{MessageType, Tuple, decode, encode_error, read_frame};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info, warn};

pub use config::ServerConfig;
pub use error::ServerError;
pub use registry::{StreamRegistry, StreamStatsSnapshot};

/// The buffer server: a TCP listener, the stream registry and the idle
/// stream reaper.
pub struct Server {
    /// Configuration
    config: ServerConfig,
    /// Stream registry shared with every session task
    registry: Arc<StreamRegistry>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Listener task handle
    listener_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
    /// Reaper task handle
    reaper_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl Server {
    /// Create a server; nothing is bound until [`start`](Self::start).
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registry: Arc::new(StreamRegistry::new(config.storage.clone())),
            config,
            shutdown_tx,
            listener_handle: Arc::new(RwLock::new(None)),
            reaper_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Bind the listener and spawn the accept loop and reaper. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("buffer server listening on {local_addr}");

        let registry = self.registry.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let accept_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, addr)) => {
                                let registry = registry.clone();
                                let config = config.clone();
                                tokio::spawn(async move {
                                    handle_connection(stream, addr, registry, config).await;
                                });
                            }
                            Err(err) => {
                                error!("failed to accept connection: {err}");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("buffer server listener shutting down");
                        break;
                    }
                }
            }
        });
        *self.listener_handle.write().await = Some(accept_handle);

        let registry = self.registry.clone();
        let reap_interval = self.config.reap_interval;
        let idle_timeout = self.config.idle_stream_timeout;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let reaper_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.reap_idle(idle_timeout);
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        *self.reaper_handle.write().await = Some(reaper_handle);

        Ok(local_addr)
    }

    /// The shared stream registry.
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    /// Snapshot of one stream's counters, if it exists.
    pub fn stream_stats(&self, identifier: &str) -> Option<StreamStatsSnapshot> {
        self.registry.get(identifier).map(|entry| entry.stats())
    }

    /// Stop accepting connections and stop the reaper. Established sessions
    /// end when their transports close.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.listener_handle.write().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.reaper_handle.write().await.take() {
            handle.abort();
        }
    }
}

/// Dispatch a fresh connection by its registration frame.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<StreamRegistry>,
    config: ServerConfig,
) {
    debug!(%addr, "accepted connection");
    let (mut reader, mut writer) = stream.into_split();

    let first = match read_frame(&mut reader, config.max_frame_size).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return,
        Err(err) => {
            warn!(%addr, %err, "failed to read registration frame");
            report_error(&mut writer, &ServerError::Wire(err)).await;
            return;
        }
    };

    let request = match decode(first) {
        Ok(Tuple::Request(request)) => request,
        Ok(other) => {
            let err = ServerError::Wire(relay_wire::WireError::protocol(format!(
                "expected a request, got {:?}",
                other.message_type()
            )));
            warn!(%addr, %err, "connection rejected");
            report_error(&mut writer, &err).await;
            return;
        }
        Err(err) => {
            warn!(%addr, %err, "undecodable registration frame");
            report_error(&mut writer, &ServerError::Wire(err)).await;
            return;
        }
    };

    match request.request_type {
        MessageType::PublisherRequest => {
            publisher::run(registry, request, reader, writer, config.max_frame_size).await;
        }
        MessageType::SubscriberRequest => {
            subscriber::run(registry, request, reader, writer, &config).await;
        }
        MessageType::PurgeRequest => {
            registry.purge(&request.identifier, request.starting_window_id);
        }
        MessageType::ResetRequest => {
            if let Err(err) = registry.reset(&request.identifier, request.starting_window_id) {
                warn!(%addr, identifier = %request.identifier, %err, "reset request failed");
                report_error(&mut writer, &err).await;
            }
        }
        other => {
            // decode only produces request tuples for the four request
            // types; anything else here is a bug
            error!(%addr, ?other, "non-request type routed as request");
        }
    }
}

/// Best-effort error report to the peer before the connection closes.
pub(crate) async fn report_error(writer: &mut OwnedWriteHalf, err: &ServerError) {
    let frame = encode_error(err.error_code(), &err.to_string());
    if let Err(write_err) = relay_wire::write_frame(writer, &frame).await {
        debug!(%write_err, "failed to report session error");
    }
}
