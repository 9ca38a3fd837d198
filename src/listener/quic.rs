use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_shutdown::ShutdownManager;
use async_trait::async_trait;
use natquic_core::filter::quic::QuicSocket;
use natquic_core::filter::{
    FilteredConn, PacketConn, PacketFilter, StunFilter, QUIC_FILTER_PRIORITY, STUN_FILTER_PRIORITY,
};
use natquic_core::nat::NatType;
use natquic_core::socket::{bind_udp, Family};
use natquic_core::stun::StunClient;
use parking_lot::RwLock;
use quinn::crypto::rustls::QuicServerConfig;
use quinn::{ConnectionError, Endpoint, EndpointConfig, IdleTimeout, TransportConfig};
use tokio::sync::{mpsc, Semaphore};
use url::{Host, Url};

use super::maintain;
use super::{fixup_port, GenericListener, ListenerFactory};
use crate::config::{ConfigWrapper, Options, DEFAULT_QUIC_PORT};
use crate::conn::{ConnectionType, InternalConn, QuicTlsConn, QUIC_PRIORITY};
use crate::error::{Error, Result};
use crate::notify::{AddressesChangedHandler, AddressesChangedNotifier};
use crate::registry;

const CONNECTION_ID_LEN: usize = 4;
/// Upper bound on waiting for closed connections to drain when serving ends.
const ENDPOINT_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct ListenerState {
    err: Option<Arc<Error>>,
    address: Option<Url>,
    nat_type: NatType,
    local_addr: Option<SocketAddr>,
}

/// What a call to [`QuicListener::publish`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Publication {
    pub(crate) nat_type_changed: bool,
    pub(crate) address_changed: bool,
}

impl Publication {
    pub(crate) fn changed(&self) -> bool {
        self.nat_type_changed || self.address_changed
    }
}

/// QUIC listener sharing its UDP socket with a STUN client.
pub struct QuicListener {
    uri: Url,
    family: Family,
    cfg: ConfigWrapper,
    tls_cfg: Arc<rustls::ServerConfig>,
    conns: mpsc::Sender<InternalConn>,
    notifier: AddressesChangedNotifier,
    shutdown_manager: ShutdownManager<()>,
    serving: AtomicBool,
    state: RwLock<ListenerState>,
}

struct Serving<'a>(&'a AtomicBool);

impl Drop for Serving<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Bound {
    filter: PacketFilter,
    quic_conn: Arc<FilteredConn>,
    stun_conn: Arc<FilteredConn>,
    local_addr: SocketAddr,
}

impl QuicListener {
    pub fn new(
        uri: &Url,
        cfg: ConfigWrapper,
        tls_cfg: Arc<rustls::ServerConfig>,
        conns: mpsc::Sender<InternalConn>,
    ) -> Result<Self> {
        let uri = fixup_port(uri, DEFAULT_QUIC_PORT)?;
        if ListenerFactory::from_scheme(uri.scheme()).is_none() {
            return Err(Error::UnsupportedScheme(uri.scheme().to_string()));
        }
        Ok(Self {
            family: Family::from_scheme(uri.scheme()),
            uri,
            cfg,
            tls_cfg,
            conns,
            notifier: AddressesChangedNotifier::default(),
            shutdown_manager: ShutdownManager::new(),
            serving: AtomicBool::new(false),
            state: RwLock::new(ListenerState::default()),
        })
    }

    /// Address of the bound socket while serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.read().local_addr
    }

    pub(crate) fn family(&self) -> Family {
        self.family
    }

    pub(crate) fn config(&self) -> &ConfigWrapper {
        &self.cfg
    }

    /// Replace the published NAT type and external address in one step.
    pub(crate) fn publish(&self, nat_type: NatType, address: Option<SocketAddr>) -> Publication {
        let address = address.and_then(|addr| self.external_uri(addr));
        let mut state = self.state.write();
        let mut publication = Publication::default();
        if state.nat_type != nat_type {
            log::info!("{} detected NAT type: {nat_type}", self.uri);
            state.nat_type = nat_type;
            publication.nat_type_changed = true;
        }
        if state.address != address {
            if let Some(address) = &address {
                log::info!("{} resolved external address {address}", self.uri);
            }
            state.address = address;
            publication.address_changed = true;
        }
        publication
    }

    /// Must not be called with the state lock held.
    pub(crate) fn notify_addresses_changed(&self) {
        self.notifier.notify(self);
    }

    fn external_uri(&self, addr: SocketAddr) -> Option<Url> {
        let mut uri = self.uri.clone();
        let host = match addr.ip() {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{ip}]"),
        };
        if uri.set_host(Some(&host)).is_err() || uri.set_port(Some(addr.port())).is_err() {
            log::warn!("{} cannot express external address {addr}", self.uri);
            return None;
        }
        Some(uri)
    }

    async fn bind_addr(&self) -> Result<SocketAddr> {
        let port = self.uri.port().unwrap_or(DEFAULT_QUIC_PORT);
        let ip = match self.uri.host() {
            Some(Host::Ipv4(ip)) => Some(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => Some(IpAddr::V6(ip)),
            // Hosts of non-special schemes stay opaque, including IPv4 literals.
            Some(Host::Domain(domain)) => match domain.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    let addr = tokio::net::lookup_host((domain, port))
                        .await?
                        .find(|addr| self.family.accepts(addr))
                        .ok_or_else(|| Error::InvalidUri(self.uri.to_string()))?;
                    return Ok(addr);
                }
            },
            None => None,
        };
        let ip = ip.unwrap_or(match self.family {
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        });
        let addr = SocketAddr::new(ip, port);
        if !self.family.accepts(&addr) {
            return Err(Error::InvalidUri(self.uri.to_string()));
        }
        Ok(addr)
    }

    async fn bind(&self) -> Result<Bound> {
        let addr = self.bind_addr().await?;
        let socket = bind_udp(addr, self.family).map_err(Error::Bind)?;
        let local_addr = socket.local_addr()?;
        let filter = PacketFilter::new(socket);
        let quic_conn = filter.new_conn(QUIC_FILTER_PRIORITY, None);
        let stun_conn = filter.new_conn(STUN_FILTER_PRIORITY, Some(Arc::new(StunFilter::new())));
        filter.start();
        Ok(Bound {
            filter,
            quic_conn,
            stun_conn,
            local_addr,
        })
    }

    fn endpoint(&self, quic_conn: Arc<FilteredConn>, options: &Options) -> Result<Endpoint> {
        let crypto = QuicServerConfig::try_from(self.tls_cfg.clone())
            .map_err(|e| Error::Tls(e.to_string()))?;
        let mut transport = TransportConfig::default();
        transport.keep_alive_interval(Some(options.quic_keep_alive_interval));
        let idle_timeout = IdleTimeout::try_from(options.quic_max_idle_timeout)
            .map_err(|e| Error::Transport(e.to_string()))?;
        transport.max_idle_timeout(Some(idle_timeout));
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(transport));

        let mut endpoint_config = EndpointConfig::default();
        endpoint_config.cid_generator(|| {
            Box::new(quinn_proto::RandomConnectionIdGenerator::new(CONNECTION_ID_LEN))
                as Box<dyn quinn_proto::ConnectionIdGenerator>
        });
        let endpoint = Endpoint::new_with_abstract_socket(
            endpoint_config,
            Some(server_config),
            Arc::new(QuicSocket::new(quic_conn)),
            Arc::new(quinn::TokioRuntime),
        )?;
        Ok(endpoint)
    }

    fn record_error(&self, err: Error) {
        log::info!("Listen (quic) {}: {err}", self.uri);
        self.state.write().err = Some(Arc::new(err));
    }

    /// Accept connections while fewer than `backlog` earlier ones are still
    /// on their way to the intake channel.
    async fn accept_loop(&self, endpoint: &Endpoint, stream_window: Duration, backlog: usize) {
        let in_flight = Arc::new(Semaphore::new(backlog.max(1)));
        loop {
            let permit = match self
                .shutdown_manager
                .wrap_cancel(in_flight.clone().acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) | Err(_) => return,
            };
            let incoming = match self.shutdown_manager.wrap_cancel(endpoint.accept()).await {
                Ok(Some(incoming)) => incoming,
                Ok(None) => {
                    log::debug!("{} endpoint closed", self.uri);
                    return;
                }
                Err(_) => return,
            };
            log::debug!("connect from {}", incoming.remote_address());
            let conns = self.conns.clone();
            let shutdown_manager = self.shutdown_manager.clone();
            tokio::spawn(async move {
                accept_connection(incoming, stream_window, conns, shutdown_manager).await;
                drop(permit);
            });
        }
    }

    async fn serve_impl(&self) {
        if self.shutdown_manager.is_shutdown_triggered() {
            log::debug!("{} was stopped, not serving", self.uri);
            return;
        }
        if self.serving.swap(true, Ordering::AcqRel) {
            log::warn!("{} is already serving", self.uri);
            return;
        }
        let _serving = Serving(&self.serving);
        self.state.write().err = None;

        let options = self.cfg.options();
        let Bound {
            filter,
            quic_conn,
            stun_conn,
            local_addr,
        } = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                self.record_error(e);
                return;
            }
        };
        let registered: Arc<dyn PacketConn> = quic_conn.clone();
        registry::default_registry().register(self.uri.scheme(), registered.clone());

        match self.endpoint(quic_conn.clone(), &options) {
            Ok(endpoint) => {
                self.state.write().local_addr = Some(local_addr);
                log::info!("QUIC listener ({local_addr}) starting");
                let client = StunClient::new(stun_conn.clone());
                let discovery = maintain::stun_keepalive_loop(self, client);
                tokio::select! {
                    _ = discovery => {}
                    _ = self.accept_loop(
                        &endpoint,
                        options.stream_accept_timeout,
                        options.accept_backlog,
                    ) => {}
                }
                endpoint.close(0u32.into(), b"");
                // The socket must outlive the close frames.
                if tokio::time::timeout(ENDPOINT_DRAIN_TIMEOUT, endpoint.wait_idle())
                    .await
                    .is_err()
                {
                    log::debug!("{} connections still draining on shutdown", self.uri);
                }
                log::info!("QUIC listener ({local_addr}) shutting down");
            }
            Err(e) => self.record_error(e),
        }

        registry::default_registry().unregister(self.uri.scheme(), &registered);
        stun_conn.close();
        quic_conn.close();
        filter.close();
        self.state.write().local_addr = None;
    }
}

/// Complete the handshake and wait a bounded time for the first stream.
async fn accept_connection(
    incoming: quinn::Incoming,
    stream_window: Duration,
    conns: mpsc::Sender<InternalConn>,
    shutdown_manager: ShutdownManager<()>,
) {
    let remote = incoming.remote_address();
    let connecting = match incoming.accept() {
        Ok(connecting) => connecting,
        Err(e) => {
            log::debug!("refused connection from {remote}: {e}");
            return;
        }
    };
    let connection = match shutdown_manager.wrap_cancel(connecting).await {
        Ok(Ok(connection)) => connection,
        Ok(Err(ConnectionError::TimedOut)) => {
            log::debug!("handshake with {remote} timed out");
            return;
        }
        Ok(Err(e)) => {
            log::warn!("Listen (quic): accepting connection from {remote}: {e}");
            return;
        }
        Err(_) => return,
    };

    let stream = tokio::select! {
        _ = shutdown_manager.wait_shutdown_triggered() => {
            connection.close(0u32.into(), b"");
            return;
        }
        rs = tokio::time::timeout(stream_window, connection.accept_bi()) => rs,
    };
    let (send, recv) = match stream {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            log::debug!("failed to accept stream from {remote}: {e}");
            connection.close(0u32.into(), b"");
            return;
        }
        Err(_) => {
            log::debug!("timed out waiting for a stream from {remote}");
            connection.close(0u32.into(), b"");
            return;
        }
    };

    let closer = connection.clone();
    let conn = InternalConn::new(
        QuicTlsConn::new(connection, send, recv),
        ConnectionType::QuicServer,
        QUIC_PRIORITY,
    );
    tokio::select! {
        _ = shutdown_manager.wait_shutdown_triggered() => {
            closer.close(0u32.into(), b"");
        }
        rs = conns.send(conn) => {
            if let Err(mpsc::error::SendError(mut conn)) = rs {
                log::debug!("intake closed, dropping connection from {remote}");
                conn.close();
            }
        }
    }
}

#[async_trait]
impl GenericListener for QuicListener {
    async fn serve(&self) {
        self.serve_impl().await
    }

    fn stop(&self) {
        _ = self.shutdown_manager.trigger_shutdown(());
    }

    fn uri(&self) -> &Url {
        &self.uri
    }

    fn wan_addresses(&self) -> Vec<Url> {
        let mut uris = self.lan_addresses();
        if let Some(address) = &self.state.read().address {
            uris.push(address.clone());
        }
        uris
    }

    fn lan_addresses(&self) -> Vec<Url> {
        vec![self.uri.clone()]
    }

    fn error(&self) -> Option<Arc<Error>> {
        self.state.read().err.clone()
    }

    fn factory(&self) -> ListenerFactory {
        ListenerFactory::Quic
    }

    fn nat_type(&self) -> String {
        match self.state.read().nat_type {
            NatType::Unknown | NatType::Error => "unknown".to_string(),
            nat_type => nat_type.to_string(),
        }
    }

    fn on_addresses_changed(&self, handler: Arc<dyn AddressesChangedHandler>) {
        self.notifier.register(handler);
    }
}

impl fmt::Display for QuicListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.uri.fmt(f)
    }
}
