use env_logger::Env;
use natquic::config::{ConfigWrapper, Options};
use natquic::listener::{new_listener, GenericListener};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

// Accepts QUIC connections, echoes the first stream and logs address changes.
// Usage: quic_server [uri] [stun server...]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let mut args = std::env::args().skip(1);
    let uri = Url::parse(&args.next().unwrap_or("quic://0.0.0.0:22000".to_string()))?;
    let mut stun_servers: Vec<String> = args.collect();
    if stun_servers.is_empty() {
        stun_servers.push("default".to_string());
    }

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
    let tls = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])?
    .with_no_client_auth()
    .with_single_cert(vec![cert.cert.der().clone()], key)?;

    let cfg = ConfigWrapper::new(Options::default().set_stun_servers(stun_servers));
    let (conns, mut intake) = tokio::sync::mpsc::channel(16);
    let listener = new_listener(&uri, cfg, Arc::new(tls), conns, None)?;
    listener.on_addresses_changed(Arc::new(|l: &dyn GenericListener| {
        log::info!("addresses changed: nat={} wan={:?}", l.nat_type(), l.wan_addresses());
    }));
    {
        let listener = listener.clone();
        tokio::spawn(async move { listener.serve().await });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            conn = intake.recv() => {
                let Some(conn) = conn else { break };
                log::info!("accepted {conn}");
                tokio::spawn(async move {
                    let mut stream = conn.into_inner();
                    let mut buf = [0u8; 4096];
                    while let Ok(len) = stream.read(&mut buf).await {
                        if len == 0 || stream.write_all(&buf[..len]).await.is_err() {
                            break;
                        }
                    }
                    stream.close();
                });
            }
        }
    }
    listener.stop();
    if let Some(err) = listener.error() {
        log::warn!("listener error: {err}");
    }
    Ok(())
}
