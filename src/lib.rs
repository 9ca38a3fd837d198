//! # natquic - QUIC listener with NAT discovery
//!
//! `natquic` accepts QUIC connections on a UDP socket that it shares with a
//! STUN client. While the listener serves, the STUN client classifies the NAT
//! in front of the socket, keeps the external mapping alive and publishes the
//! external address next to the local one.
//!
//! ## Architecture
//!
//! - [`listener`] - [`GenericListener`](listener::GenericListener),
//!   the closed [`ListenerFactory`](listener::ListenerFactory) set and
//!   [`QuicListener`](listener::QuicListener)
//! - [`config`] - shared configuration handle, re-read on every loop round
//! - [`conn`] - accepted connection types handed to the intake channel
//! - [`notify`] - address change callbacks
//! - [`registry`] - packet connections currently served, per scheme
//!
//! Socket sharing, STUN and NAT types live in [`natquic_core`].
//!
//! ## Serving
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use natquic::config::{ConfigWrapper, Options};
//! use natquic::listener::{new_listener, GenericListener};
//! use url::Url;
//!
//! # async fn example(tls: Arc<rustls::ServerConfig>) -> natquic::error::Result<()> {
//! let (conns, mut intake) = tokio::sync::mpsc::channel(16);
//! let cfg = ConfigWrapper::new(Options::default());
//! let uri = Url::parse("quic://0.0.0.0:22000")
//!     .map_err(|e| natquic::error::Error::InvalidUri(e.to_string()))?;
//! let listener = new_listener(&uri, cfg, tls, conns, None)?;
//! {
//!     let listener = listener.clone();
//!     tokio::spawn(async move { listener.serve().await });
//! }
//! while let Some(conn) = intake.recv().await {
//!     println!("accepted {conn}, wan addresses {:?}", listener.wan_addresses());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conn;
pub mod error;
pub mod listener;
pub mod notify;
pub mod registry;

pub use natquic_core::nat::NatType;
