//! TCP server for inbound Raft and migration RPCs.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, Envelope};
use crate::types::NodeId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

/// Handler for incoming envelopes.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a request and optionally return a response.
    async fn handle(&self, envelope: Envelope) -> Option<Envelope>;
}

/// TCP server that answers one request frame with one response frame.
pub struct NetworkServer {
    listener: TcpListener,
    node_id: NodeId,
    handler: Arc<dyn MessageHandler>,
    max_frame_size: usize,
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Bind the listener. The returned sender stops the server.
    pub async fn bind(
        bind_addr: SocketAddr,
        node_id: NodeId,
        handler: Arc<dyn MessageHandler>,
        max_frame_size: usize,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(NetworkError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            node_id,
            handler,
            max_frame_size,
            shutdown_rx,
        };
        Ok((server, shutdown_tx))
    }

    /// Address actually bound, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Accept connections until shut down.
    pub async fn run(mut self) -> Result<()> {
        info!(node_id = %self.node_id, addr = ?self.listener.local_addr().ok(), "Network server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            let max = self.max_frame_size;
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler, max).await {
                                    debug!(peer = %peer_addr, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!(node_id = %self.node_id, "Network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn MessageHandler>,
        max_frame_size: usize,
    ) -> Result<()> {
        stream.set_nodelay(true).map_err(NetworkError::Io)?;
        while let Some(request) = read_frame(&mut stream, max_frame_size).await? {
            trace!(from = %request.from, term = request.term, kind = request.message.kind(), "Request");
            if let Some(response) = handler.handle(request).await {
                write_frame(&mut stream, &response, max_frame_size).await?;
            }
        }
        Ok(())
    }
}
