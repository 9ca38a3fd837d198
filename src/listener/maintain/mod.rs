use std::time::Duration;

mod stun_keepalive;

pub(crate) use stun_keepalive::stun_keepalive_loop;

/// Wait before retrying once every STUN server failed or the NAT cannot be punched.
pub(crate) const STUN_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// How often a disabled discovery loop checks whether it was re-enabled.
pub(crate) const DISABLED_POLL_INTERVAL: Duration = Duration::from_secs(1);
