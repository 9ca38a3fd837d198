use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid uri {0}")]
    InvalidUri(String),
    #[error("unsupported scheme {0}")]
    UnsupportedScheme(String),
    #[error("bind: {0:#}")]
    Bind(anyhow::Error),
    #[error("tls: {0}")]
    Tls(String),
    #[error("quic transport: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
