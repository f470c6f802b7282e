// Relay server: TCP and Unix socket listeners feeding the broker

use crate::relay::broker::{ConnectionState, MessageBroker};
use crate::relay::client::{handle_client_stream, ClientConnection};
use crate::relay::config::RelayConfig;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A running relay server
pub struct RelayServer {
    broker: MessageBroker,
    tcp_addr: Option<SocketAddr>,
    socket_path: Option<PathBuf>,
    shutdown_tx: watch::Sender<bool>,
    listeners: Vec<JoinHandle<()>>,
}

impl RelayServer {
    /// Bind the configured listeners and start accepting connections
    pub async fn start(config: &RelayConfig, broker: MessageBroker) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut listeners = Vec::new();

        let mut tcp_addr = None;
        if let Some(addr) = &config.listen_addr {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind TCP listener on {}", addr))?;
            let local = listener.local_addr().context("Failed to read local address")?;
            tracing::info!("Listening on tcp://{}", local);
            tcp_addr = Some(local);

            listeners.push(tokio::spawn(Self::run_tcp_listener(
                listener,
                broker.clone(),
                config.outbox_capacity,
                shutdown_rx.clone(),
            )));
        }

        if let Some(path) = &config.socket_path {
            // Remove old socket if exists
            let _ = std::fs::remove_file(path);

            let listener = UnixListener::bind(path)
                .with_context(|| format!("Failed to bind Unix socket {:?}", path))?;
            tracing::info!("Listening on {:?}", path);

            listeners.push(tokio::spawn(Self::run_unix_listener(
                listener,
                broker.clone(),
                config.outbox_capacity,
                shutdown_rx.clone(),
            )));
        }

        Ok(Self {
            broker,
            tcp_addr,
            socket_path: config.socket_path.clone(),
            shutdown_tx,
            listeners,
        })
    }

    /// Bound TCP address (useful with port 0)
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    pub fn socket_path(&self) -> Option<&PathBuf> {
        self.socket_path.as_ref()
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    async fn run_tcp_listener(
        listener: TcpListener,
        broker: MessageBroker,
        outbox_capacity: usize,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tracing::debug!("Accepted tcp connection from {}", addr);
                            tokio::spawn(Self::handle_connection(
                                stream,
                                broker.clone(),
                                outbox_capacity,
                                shutdown_rx.clone(),
                            ));
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::info!("TCP listener shutting down");
                    break;
                }
            }
        }
    }

    async fn run_unix_listener(
        listener: UnixListener,
        broker: MessageBroker,
        outbox_capacity: usize,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            tokio::spawn(Self::handle_connection(
                                stream,
                                broker.clone(),
                                outbox_capacity,
                                shutdown_rx.clone(),
                            ));
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::info!("Unix socket listener shutting down");
                    break;
                }
            }
        }
    }

    /// Serve one client until it disconnects or the server shuts down
    async fn handle_connection<S>(
        stream: S,
        broker: MessageBroker,
        outbox_capacity: usize,
        mut shutdown_rx: watch::Receiver<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (connection, outgoing_rx) = ClientConnection::new(outbox_capacity);
        let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();
        let connection_id = connection.id();

        let stream_task = tokio::spawn(async move {
            if let Err(e) = handle_client_stream(stream, outgoing_rx, incoming_tx).await {
                tracing::error!("Client stream error: {}", e);
            }
        });

        // Frames from one connection are handled strictly in arrival order
        let mut state = ConnectionState::new(connection);
        loop {
            tokio::select! {
                frame = incoming_rx.recv() => {
                    match frame {
                        Some(frame) => broker.handle_client_message(&mut state, frame).await,
                        None => break,
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        broker.on_disconnect(&mut state).await;
        // Dropping the last outbox sender lets the writer flush and close
        drop(state);
        if *shutdown_rx.borrow() {
            stream_task.abort();
        }
        tracing::debug!("Connection {} closed", connection_id);
    }

    /// Stop accepting, disconnect every client and release all sessions
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);

        for listener in self.listeners {
            if let Err(e) = listener.await {
                tracing::warn!("Listener task ended abnormally: {}", e);
            }
        }

        self.broker.shutdown().await;

        // Cleanup
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }

        Ok(())
    }
}
