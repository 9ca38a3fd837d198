//! Transport listeners.
//!
//! Every listener exposes the same [`GenericListener`] surface so callers can
//! treat transports alike. The set of transports is closed and known at build
//! time, see [`ListenerFactory`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::config::{ConfigWrapper, Options};
use crate::conn::InternalConn;
use crate::error::{Error, Result};
use crate::notify::AddressesChangedHandler;

pub(crate) mod maintain;
mod quic;

pub use quic::QuicListener;

pub const QUIC_SCHEMES: &[&str] = &["quic", "quic4", "quic6"];

#[async_trait]
pub trait GenericListener: fmt::Display + Send + Sync {
    /// Run until [`GenericListener::stop`] is called or binding fails.
    async fn serve(&self);
    fn stop(&self);
    fn uri(&self) -> &Url;
    /// LAN addresses plus the discovered external address, if any.
    fn wan_addresses(&self) -> Vec<Url>;
    fn lan_addresses(&self) -> Vec<Url>;
    /// The last bind or listen error. Cleared when serving starts again.
    fn error(&self) -> Option<Arc<Error>>;
    fn factory(&self) -> ListenerFactory;
    /// Human readable NAT classification, `"unknown"` when none is known.
    fn nat_type(&self) -> String;
    fn on_addresses_changed(&self, handler: Arc<dyn AddressesChangedHandler>);
}

/// Port mapping service handed to listeners that manage their own mappings.
pub trait NatService: Send + Sync {
    fn external_addresses(&self) -> Vec<SocketAddr>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerFactory {
    Quic,
}

impl ListenerFactory {
    pub fn from_scheme(scheme: &str) -> Option<ListenerFactory> {
        if QUIC_SCHEMES.contains(&scheme) {
            Some(ListenerFactory::Quic)
        } else {
            None
        }
    }

    pub fn valid(&self, _options: &Options) -> Result<()> {
        match self {
            ListenerFactory::Quic => Ok(()),
        }
    }

    pub fn enabled(&self, _options: &Options) -> bool {
        match self {
            ListenerFactory::Quic => true,
        }
    }

    pub fn new_listener(
        &self,
        uri: &Url,
        cfg: ConfigWrapper,
        tls_cfg: Arc<rustls::ServerConfig>,
        conns: mpsc::Sender<InternalConn>,
        _nat_service: Option<Arc<dyn NatService>>,
    ) -> Result<Arc<dyn GenericListener>> {
        match self {
            ListenerFactory::Quic => Ok(Arc::new(QuicListener::new(uri, cfg, tls_cfg, conns)?)),
        }
    }
}

/// Build a listener for `uri`, picking the factory from its scheme.
pub fn new_listener(
    uri: &Url,
    cfg: ConfigWrapper,
    tls_cfg: Arc<rustls::ServerConfig>,
    conns: mpsc::Sender<InternalConn>,
    nat_service: Option<Arc<dyn NatService>>,
) -> Result<Arc<dyn GenericListener>> {
    let factory = ListenerFactory::from_scheme(uri.scheme())
        .ok_or_else(|| Error::UnsupportedScheme(uri.scheme().to_string()))?;
    let options = cfg.options();
    factory.valid(&options)?;
    if !factory.enabled(&options) {
        return Err(Error::UnsupportedScheme(uri.scheme().to_string()));
    }
    factory.new_listener(uri, cfg, tls_cfg, conns, nat_service)
}

/// Apply `default_port` when `uri` carries no port.
pub(crate) fn fixup_port(uri: &Url, default_port: u16) -> Result<Url> {
    let mut uri = uri.clone();
    if uri.host_str().map_or(true, str::is_empty) {
        return Err(Error::InvalidUri(uri.to_string()));
    }
    if uri.port().is_none() {
        uri.set_port(Some(default_port))
            .map_err(|_| Error::InvalidUri(uri.to_string()))?;
    }
    Ok(uri)
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Arc;

    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    pub(crate) fn provider() -> Arc<rustls::crypto::CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    pub(crate) fn self_signed() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        (cert.der().clone(), key)
    }

    pub(crate) fn server_tls(
        cert: CertificateDer<'static>,
        key: PrivateKeyDer<'static>,
    ) -> Arc<rustls::ServerConfig> {
        let config = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();
        Arc::new(config)
    }

    pub(crate) fn tls_config() -> Arc<rustls::ServerConfig> {
        let (cert, key) = self_signed();
        server_tls(cert, key)
    }
}
