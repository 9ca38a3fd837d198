//! NAT (Network Address Translation) classification.
//!
//! The classification follows the classic RFC 3489 taxonomy, which is what a
//! STUN discovery run against a server with a second address can tell apart.
//!
//! # Examples
//!
//! ```rust
//! use natquic_core::nat::NatType;
//!
//! let nat = NatType::PortRestricted;
//! assert!(nat.is_punchable());
//! assert_eq!(nat.to_string(), "Port restricted NAT");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of NAT the local socket sits behind.
///
/// # Variants
///
/// - `Error` - the discovery exchange produced inconsistent answers
/// - `Unknown` - nothing is known yet
/// - `None` - the mapped address equals the local address
/// - `Blocked` - no STUN response at all
/// - `Full` - any external host can send to the mapping
/// - `Symmetric` - the mapping changes per destination
/// - `Restricted` - only hosts we sent to may reply
/// - `PortRestricted` - only the exact host:port we sent to may reply
/// - `SymmetricUdpFirewall` - public address, but inbound is filtered
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Default, Hash)]
pub enum NatType {
    Error,
    #[default]
    Unknown,
    None,
    Blocked,
    Full,
    Symmetric,
    Restricted,
    PortRestricted,
    SymmetricUdpFirewall,
}

impl NatType {
    /// Returns true if an external mapping for this NAT can be kept alive
    /// and reached by peers.
    #[inline]
    pub fn is_punchable(&self) -> bool {
        matches!(
            self,
            NatType::None | NatType::PortRestricted | NatType::Restricted | NatType::Full
        )
    }

    /// Returns true if the discovery run did not produce a usable answer.
    #[inline]
    pub fn is_inconclusive(&self) -> bool {
        matches!(self, NatType::Error | NatType::Unknown | NatType::Blocked)
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatType::Error => "Error",
            NatType::Unknown => "Unknown",
            NatType::None => "Not behind a NAT",
            NatType::Blocked => "UDP is blocked",
            NatType::Full => "Full cone NAT",
            NatType::Symmetric => "Symmetric NAT",
            NatType::Restricted => "Restricted NAT",
            NatType::PortRestricted => "Port restricted NAT",
            NatType::SymmetricUdpFirewall => "Symmetric UDP firewall",
        };
        f.write_str(s)
    }
}
