//! # natquic-core - NAT discovery and socket sharing
//!
//! `natquic-core` holds the pieces a QUIC listener needs to stay reachable
//! from behind a NAT while sharing a single UDP port:
//!
//! - [`filter`] - splits one UDP socket into prioritized virtual connections,
//!   with a STUN transaction filter and a quinn socket adapter
//! - [`stun`] - STUN binding client that classifies the NAT and refreshes
//!   the external mapping
//! - [`nat`] - NAT type taxonomy
//! - [`socket`] - UDP socket creation
//!
//! ## Sharing a socket
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use natquic_core::filter::{
//!     PacketFilter, StunFilter, QUIC_FILTER_PRIORITY, STUN_FILTER_PRIORITY,
//! };
//! use natquic_core::socket::{bind_udp, Family};
//! use natquic_core::stun::{NatDiscoverer, StunClient};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let socket = bind_udp("0.0.0.0:22000".parse()?, Family::V4)?;
//! let filter = PacketFilter::new(socket);
//! let _quic = filter.new_conn(QUIC_FILTER_PRIORITY, None);
//! let stun = filter.new_conn(STUN_FILTER_PRIORITY, Some(Arc::new(StunFilter::new())));
//! filter.start();
//!
//! let mut client = StunClient::new(stun);
//! client.set_server_addr("192.0.2.10:3478".parse()?);
//! let (nat_type, mapped) = client.discover().await?;
//! println!("{nat_type} {mapped:?}");
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod filter;
pub mod nat;
pub mod socket;
pub mod stun;
