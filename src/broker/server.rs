//! MQTT broker listener service
//!
//! [`MqttBroker`] binds the configured listeners, wires the subscription
//! router and the optional cluster synchronizer to the event bus, and spawns
//! one [`ClientHandler`] per accepted connection.

use crate::broker::auth::{AllowAllAuthProvider, AuthProvider};
use crate::broker::client_handler::ClientHandler;
use crate::broker::cluster::{ClusterSynchronizer, EventLog};
use crate::broker::config::{BrokerConfig, WebSocketConfig};
use crate::broker::event::{EventBus, EventKind, EventMask};
use crate::broker::router::SubscriptionRouter;
use crate::broker::stats::{BrokerStats, StatsSnapshot};
use crate::broker::tls_acceptor::{accept_tls_connection, TlsAcceptorConfig};
use crate::broker::transport::BrokerTransport;
use crate::broker::websocket_server::accept_websocket_connection;
use crate::error::{MqttError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// How a listener turns an accepted socket into a [`BrokerTransport`]
#[derive(Clone)]
enum ListenerKind {
    Tcp,
    Tls(TlsAcceptor),
    WebSocket(Arc<WebSocketConfig>),
}

impl ListenerKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tls(_) => "tls",
            Self::WebSocket(_) => "ws",
        }
    }
}

/// Releases a `max_clients` slot when the connection is gone
struct ConnectionSlot(Arc<BrokerStats>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

/// Everything a session needs, cloned into each accept task
#[derive(Clone)]
struct SessionContext {
    config: Arc<BrokerConfig>,
    router: Arc<SubscriptionRouter>,
    bus: Arc<EventBus>,
    auth_provider: Arc<dyn AuthProvider>,
    stats: Arc<BrokerStats>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SessionContext {
    /// Handshakes the socket according to `kind` and runs a session on it
    fn spawn_connection(&self, kind: ListenerKind, stream: TcpStream, addr: SocketAddr) {
        if !self.stats.try_open_connection(self.config.max_clients) {
            warn!(addr = %addr, max_clients = self.config.max_clients, "Connection refused, broker full");
            return;
        }
        let slot = ConnectionSlot(Arc::clone(&self.stats));
        let ctx = self.clone();

        tokio::spawn(async move {
            let handshake = async {
                match kind {
                    ListenerKind::Tcp => Ok(BrokerTransport::tcp(stream)),
                    ListenerKind::Tls(acceptor) => accept_tls_connection(&acceptor, stream, addr)
                        .await
                        .map(BrokerTransport::tls),
                    ListenerKind::WebSocket(ws) => accept_websocket_connection(stream, &ws, addr)
                        .await
                        .map(BrokerTransport::websocket),
                }
            };
            let transport = match timeout(ctx.config.connect_timeout, handshake).await {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    debug!(addr = %addr, error = %e, "Handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(addr = %addr, "Handshake timed out");
                    return;
                }
            };

            let handler = ClientHandler::new(
                transport,
                addr,
                ctx.config,
                ctx.router,
                ctx.bus,
                ctx.auth_provider,
                ctx.stats,
                ctx.shutdown_tx.subscribe(),
            );
            match handler.run().await {
                Ok(()) | Err(MqttError::ClientClosed) => debug!(addr = %addr, "Session finished"),
                Err(e) => info!(addr = %addr, error = %e, "Session ended with error"),
            }
            drop(slot);
        });
    }
}

/// Accepts connections until the broker shuts down
async fn accept_loop(listener: TcpListener, kind: ListenerKind, ctx: SessionContext) {
    let mut shutdown_rx = ctx.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(addr = %addr, listener = kind.name(), "New connection");
                    ctx.spawn_connection(kind.clone(), stream, addr);
                }
                Err(e) => error!(listener = kind.name(), error = %e, "Accept error"),
            },
            _ = shutdown_rx.recv() => {
                debug!(listener = kind.name(), "Listener shutting down");
                break;
            }
        }
    }
}

/// Cloneable trigger that stops a running [`MqttBroker`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Stops the listeners and ends every session
    pub fn shutdown(&self) {
        // No receivers just means nothing is running
        let _ = self.shutdown_tx.send(());
    }
}

/// MQTT broker
pub struct MqttBroker {
    config: Arc<BrokerConfig>,
    router: Arc<SubscriptionRouter>,
    bus: Arc<EventBus>,
    auth_provider: Arc<dyn AuthProvider>,
    stats: Arc<BrokerStats>,
    cluster: Option<Arc<ClusterSynchronizer>>,
    local_addr: SocketAddr,
    tls_addr: Option<SocketAddr>,
    ws_addr: Option<SocketAddr>,
    listener: Option<TcpListener>,
    tls_listener: Option<(TcpListener, TlsAcceptor)>,
    ws_listener: Option<(TcpListener, Arc<WebSocketConfig>)>,
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for MqttBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBroker")
            .field("node_id", &self.config.node_id)
            .field("local_addr", &self.local_addr)
            .field("tls_addr", &self.tls_addr)
            .field("ws_addr", &self.ws_addr)
            .field("clustered", &self.cluster.is_some())
            .finish_non_exhaustive()
    }
}

impl MqttBroker {
    /// Creates a broker with default configuration on `addr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or binding fails
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self> {
        let addr = addr
            .as_ref()
            .parse::<SocketAddr>()
            .map_err(|e| MqttError::Configuration(format!("Invalid address: {e}")))?;
        Self::with_config(BrokerConfig::default().with_bind_address(addr)).await
    }

    /// Validates `config` and binds every configured listener
    ///
    /// When no node id is configured the bound TCP address becomes the node id,
    /// so brokers started on port 0 still get distinct cluster identities.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, TLS material cannot
    /// be loaded or a listener cannot be bound
    pub async fn with_config(mut config: BrokerConfig) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        if config.node_id.is_empty() {
            config.node_id = local_addr.to_string();
        }
        info!(addr = %local_addr, node = %config.node_id, "MQTT broker listening");

        let tls_listener = match &config.tls_config {
            Some(tls) => {
                let acceptor = TlsAcceptorConfig::from_config(tls).await?.build_acceptor()?;
                let tls_listener = TcpListener::bind(tls.bind_address).await?;
                info!(addr = %tls_listener.local_addr()?, "MQTT broker TLS listening");
                Some((tls_listener, acceptor))
            }
            None => None,
        };

        let ws_listener = match &config.websocket_config {
            Some(ws) => {
                let ws_listener = TcpListener::bind(ws.bind_address).await?;
                info!(addr = %ws_listener.local_addr()?, path = %ws.path, "MQTT broker WebSocket listening");
                Some((ws_listener, Arc::new(ws.clone())))
            }
            None => None,
        };

        let tls_addr = tls_listener
            .as_ref()
            .map(|(l, _)| l.local_addr())
            .transpose()?;
        let ws_addr = ws_listener
            .as_ref()
            .map(|(l, _)| l.local_addr())
            .transpose()?;

        let stats = Arc::new(BrokerStats::new());
        let router = Arc::new(SubscriptionRouter::from_config(&config, Arc::clone(&stats)));
        let bus = Arc::new(EventBus::new());
        bus.subscribe(
            EventKind::TopicSubscribed
                | EventKind::TopicUnsubscribed
                | EventKind::TopicPublished
                | EventKind::SessionDestroyed,
            Arc::clone(&router) as _,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config: Arc::new(config),
            router,
            bus,
            auth_provider: Arc::new(AllowAllAuthProvider),
            stats,
            cluster: None,
            local_addr,
            tls_addr,
            ws_addr,
            listener: Some(listener),
            tls_listener,
            ws_listener,
            shutdown_tx,
        })
    }

    /// Sets the provider that authenticates clients and authorizes topics
    #[must_use]
    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth_provider = provider;
        self
    }

    /// Joins the cluster that shares `log`
    ///
    /// Local session and subscription events are replicated to the log, and
    /// events of other nodes read from it are applied to this broker's router.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster configuration is invalid, the log
    /// refuses a consumer, or a cluster was already joined
    pub async fn with_cluster(mut self, log: Arc<dyn EventLog>) -> Result<Self> {
        if self.cluster.is_some() {
            return Err(MqttError::InvalidState("Cluster already configured".to_string()));
        }
        let addresses = [Some(self.local_addr), self.tls_addr, self.ws_addr]
            .into_iter()
            .flatten()
            .map(|addr| addr.to_string());
        let cluster = ClusterSynchronizer::start(
            &self.config.cluster,
            self.config.node_id.clone(),
            addresses,
            log,
            Arc::clone(&self.router),
        )
        .await?;
        self.bus.subscribe(EventMask::ALL, Arc::clone(&cluster) as _);
        self.cluster = Some(cluster);
        Ok(self)
    }

    /// Accepts connections on every listener until shutdown
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is already running
    pub async fn run(&mut self) -> Result<()> {
        let Some(listener) = self.listener.take() else {
            return Err(MqttError::InvalidState("Broker already running".to_string()));
        };

        let ctx = SessionContext {
            config: Arc::clone(&self.config),
            router: Arc::clone(&self.router),
            bus: Arc::clone(&self.bus),
            auth_provider: Arc::clone(&self.auth_provider),
            stats: Arc::clone(&self.stats),
            shutdown_tx: self.shutdown_tx.clone(),
        };

        if let Some((tls_listener, acceptor)) = self.tls_listener.take() {
            tokio::spawn(accept_loop(tls_listener, ListenerKind::Tls(acceptor), ctx.clone()));
        }
        if let Some((ws_listener, ws)) = self.ws_listener.take() {
            tokio::spawn(accept_loop(ws_listener, ListenerKind::WebSocket(ws), ctx.clone()));
        }

        info!(node = %self.config.node_id, "Broker ready");
        accept_loop(listener, ListenerKind::Tcp, ctx).await;
        info!(node = %self.config.node_id, "Broker stopped");
        Ok(())
    }

    /// Signals every listener and session to stop
    pub fn shutdown(&self) {
        self.shutdown_handle().shutdown();
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Address of the plain TCP listener
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn tls_addr(&self) -> Option<SocketAddr> {
        self.tls_addr
    }

    #[must_use]
    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_addr
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn router(&self) -> Arc<SubscriptionRouter> {
        Arc::clone(&self.router)
    }

    #[must_use]
    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        if let Some(cluster) = &self.cluster {
            cluster.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::cluster::MemoryEventLog;
    use crate::broker::config::TlsConfig;
    use std::path::PathBuf;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bind_assigns_node_id() {
        let broker = MqttBroker::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(broker.local_addr().port(), 0);
        assert_eq!(broker.node_id(), broker.local_addr().to_string());
        assert!(broker.tls_addr().is_none());
        assert!(broker.ws_addr().is_none());
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let err = MqttBroker::bind("not-an-address").await.unwrap_err();
        assert!(matches!(err, MqttError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_missing_tls_material() {
        let config = BrokerConfig::default()
            .with_bind_address(([127, 0, 0, 1], 0))
            .with_tls(
                TlsConfig::new(
                    PathBuf::from("/nonexistent/cert.pem"),
                    PathBuf::from("/nonexistent/key.pem"),
                )
                .with_bind_address(([127, 0, 0, 1], 0)),
            );
        assert!(MqttBroker::with_config(config).await.is_err());
    }

    #[tokio::test]
    async fn test_websocket_listener_bound() {
        let config = BrokerConfig::default()
            .with_bind_address(([127, 0, 0, 1], 0))
            .with_websocket(WebSocketConfig::new().with_bind_address(([127, 0, 0, 1], 0)));
        let broker = MqttBroker::with_config(config).await.unwrap();
        assert!(broker.ws_addr().is_some_and(|addr| addr.port() != 0));
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let mut broker = MqttBroker::bind("127.0.0.1:0").await.unwrap();
        let handle = broker.shutdown_handle();
        let addr = broker.local_addr();

        let running = tokio::spawn(async move {
            let result = broker.run().await;
            (broker, result)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        TcpStream::connect(addr).await.unwrap();

        handle.shutdown();
        let (mut broker, result) = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(matches!(broker.run().await, Err(MqttError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_cluster_joined_once() {
        let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(4));
        let broker = MqttBroker::bind("127.0.0.1:0")
            .await
            .unwrap()
            .with_cluster(Arc::clone(&log))
            .await
            .unwrap();
        assert_eq!(broker.event_bus().handler_count(), 2);
        assert!(broker.with_cluster(log).await.is_err());
    }

    #[tokio::test]
    async fn test_max_clients_refuses() {
        let config = BrokerConfig::default()
            .with_bind_address(([127, 0, 0, 1], 0))
            .with_max_clients(1);
        let mut broker = MqttBroker::with_config(config).await.unwrap();
        let handle = broker.shutdown_handle();
        let addr = broker.local_addr();
        let stats = Arc::clone(&broker.stats);
        tokio::spawn(async move { broker.run().await });

        let _first = TcpStream::connect(addr).await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_open, 1);
        assert_eq!(snapshot.connections_rejected, 1);
        handle.shutdown();
    }
}
