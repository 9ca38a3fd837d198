use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("stun: {0}")]
    Stun(String),
    #[error("stun request timed out")]
    Timeout,
    #[error("no mapped address in stun response")]
    NoMappedAddress,
    #[error("no stun server address set")]
    NoServer,
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
