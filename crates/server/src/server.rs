//! WebSocket listener binding consumers to the router

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use ticker_core::{ClientMessage, ServerSettings};

use crate::router::FanOutRouter;

/// Server configuration
#[derive(Debug, Clone)]
pub struct EndpointServerConfig {
    pub host: String,
    pub port: u16,
    pub endpoint_buffer: usize,
}

impl Default for EndpointServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9001,
            endpoint_buffer: 256,
        }
    }
}

impl From<&ServerSettings> for EndpointServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            endpoint_buffer: settings.endpoint_buffer,
        }
    }
}

/// WebSocket server: one endpoint per accepted connection
pub struct EndpointServer {
    config: EndpointServerConfig,
    router: Arc<FanOutRouter>,
    open_connections: Arc<AtomicUsize>,
}

impl EndpointServer {
    pub fn new(config: EndpointServerConfig, router: Arc<FanOutRouter>) -> Self {
        Self {
            config,
            router,
            open_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn start_with_shutdown(&self, shutdown: oneshot::Receiver<()>) -> anyhow::Result<()> {
        let addr: SocketAddr = self.address().parse()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        info!("Endpoint server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let router = Arc::clone(&self.router);
                            let buffer = self.config.endpoint_buffer;
                            let guard = ConnectionGuard::enter(&self.open_connections);
                            debug!("Accepted {} ({} open)", peer, self.open_connections());
                            tokio::spawn(handle_connection(router, stream, peer, buffer, guard));
                        }
                        Err(e) => error!("Accept failed: {}", e),
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Connections whose task has not finished yet, handshakes included
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Relaxed)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

/// Counts a connection for as long as its task is alive
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn enter(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(open))
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn handle_connection(
    router: Arc<FanOutRouter>,
    stream: TcpStream,
    peer: SocketAddr,
    buffer: usize,
    _guard: ConnectionGuard,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };
    let (mut write, mut read) = ws.split();

    let (endpoint, mut outbound) = router.registry().open(buffer);
    let id = endpoint.id();
    let evicted = endpoint.evicted();
    if !router.on_connect(endpoint) {
        return;
    }
    debug!("{} bound to {}", peer, id);

    // A peer that stopped reading can park `write.send` forever, so every
    // await here also watches for eviction.
    let writer = tokio::spawn({
        let evicted = evicted.clone();
        async move {
            loop {
                let msg = tokio::select! {
                    () = evicted.cancelled() => break,
                    msg = outbound.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let text = match msg.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode {} message: {}", msg.kind(), e);
                        continue;
                    }
                };
                tokio::select! {
                    () = evicted.cancelled() => break,
                    sent = write.send(Message::Text(text)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    loop {
        let frame = tokio::select! {
            () = evicted.cancelled() => {
                debug!("{} evicted; closing socket to {}", id, peer);
                break;
            }
            frame = read.next() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        match frame {
            Ok(Message::Text(text)) => match ClientMessage::parse(&text) {
                Ok(msg) => {
                    let closing = matches!(msg, ClientMessage::Close);
                    router.handle_client_message(id, msg);
                    if closing {
                        break;
                    }
                }
                Err(e) => warn!("Ignoring frame from {}: {}", id, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Socket error on {}: {}", id, e);
                break;
            }
        }
    }

    router.on_disconnect(id);
    // The writer owns the sink half; dropping both halves closes the socket
    writer.abort();
    let _ = writer.await;
}

/// Builder for server configuration
pub struct EndpointServerBuilder {
    config: EndpointServerConfig,
}

impl EndpointServerBuilder {
    pub fn new() -> Self {
        Self {
            config: EndpointServerConfig::default(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn endpoint_buffer(mut self, buffer: usize) -> Self {
        self.config.endpoint_buffer = buffer;
        self
    }

    pub fn build(self, router: Arc<FanOutRouter>) -> EndpointServer {
        EndpointServer::new(self.config, router)
    }
}

impl Default for EndpointServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EndpointRegistry;
    use ticker_price_feed::AggregationEngine;

    fn router() -> Arc<FanOutRouter> {
        Arc::new(FanOutRouter::new(
            Arc::new(AggregationEngine::default()),
            Arc::new(EndpointRegistry::new()),
        ))
    }

    #[test]
    fn test_default_config() {
        let config = EndpointServerConfig::default();
        assert_eq!(config.port, 9001);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_builder() {
        let server = EndpointServerBuilder::new()
            .host("0.0.0.0")
            .port(9000)
            .endpoint_buffer(4)
            .build(router());

        assert_eq!(server.address(), "0.0.0.0:9000");
        assert_eq!(server.open_connections(), 0);
    }

    #[test]
    fn test_config_from_settings() {
        let settings = ServerSettings {
            host: "10.0.0.1".to_string(),
            port: 7000,
            endpoint_buffer: 8,
        };
        let config = EndpointServerConfig::from(&settings);
        assert_eq!(config.endpoint_buffer, 8);
        assert_eq!(config.port, 7000);
    }
}
