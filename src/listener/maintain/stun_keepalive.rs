use std::net::SocketAddr;

use natquic_core::nat::NatType;
use natquic_core::socket::Family;
use natquic_core::stun::NatDiscoverer;

use super::{DISABLED_POLL_INTERVAL, STUN_RETRY_INTERVAL};
use crate::listener::QuicListener;

/// Rounds observed before the address change rate is judged.
const MIN_JUDGED_ROUNDS: u64 = 3;

enum Exit {
    Disabled,
    Retry,
}

enum SessionEnd {
    Disabled,
    Abandoned,
}

/// State of one discovery attempt against one server.
struct DiscoverySession {
    server: SocketAddr,
    nat_type: NatType,
    address: SocketAddr,
    rounds: u64,
    address_changes: u64,
}

impl DiscoverySession {
    fn new(server: SocketAddr, nat_type: NatType, address: SocketAddr) -> Self {
        Self {
            server,
            nat_type,
            address,
            rounds: 1,
            address_changes: 1,
        }
    }

    /// The address changed on nearly every round.
    fn is_flapping(&self) -> bool {
        self.rounds > MIN_JUDGED_ROUNDS && self.rounds / self.address_changes < 2
    }

    async fn keepalive<D: NatDiscoverer>(
        &mut self,
        listener: &QuicListener,
        discoverer: &mut D,
    ) -> SessionEnd {
        loop {
            let publication = listener.publish(self.nat_type, Some(self.address));
            if publication.address_changed {
                self.address_changes += 1;
            }
            if publication.changed() {
                listener.notify_addresses_changed();
            }
            if self.is_flapping() {
                log::info!(
                    "{listener} external address via {} changed {} times in {} rounds, trying the next server",
                    self.server,
                    self.address_changes - 1,
                    self.rounds
                );
                return SessionEnd::Abandoned;
            }

            tokio::time::sleep(listener.config().options().stun_keepalive()).await;
            if !listener.config().options().discovery_enabled() {
                return SessionEnd::Disabled;
            }

            match discoverer.keepalive().await {
                Ok(address) => self.address = address,
                Err(e) => {
                    log::debug!(
                        "{listener} stun keepalive on {}: {e} ({})",
                        self.server,
                        self.address
                    );
                    return SessionEnd::Abandoned;
                }
            }
            self.rounds += 1;
        }
    }
}

/// Classify the NAT and keep the external mapping alive, forever.
///
/// Configuration is re-read on every round. The caller cancels the loop by
/// dropping it.
pub(crate) async fn stun_keepalive_loop<D: NatDiscoverer>(
    listener: &QuicListener,
    mut discoverer: D,
) {
    loop {
        if !listener.config().options().discovery_enabled() {
            if listener.publish(NatType::Unknown, None).changed() {
                listener.notify_addresses_changed();
            }
            tokio::time::sleep(DISABLED_POLL_INTERVAL).await;
            continue;
        }
        match discover(listener, &mut discoverer).await {
            Exit::Disabled => {}
            Exit::Retry => {
                log::debug!(
                    "{listener} no usable stun server, retrying in {STUN_RETRY_INTERVAL:?}"
                );
                tokio::time::sleep(STUN_RETRY_INTERVAL).await;
            }
        }
    }
}

/// Try each configured server in turn until one yields a punchable NAT.
///
/// A NAT that cannot be punched is published together with an empty external
/// address, so a previously discovered address is withdrawn rather than kept.
async fn discover<D: NatDiscoverer>(listener: &QuicListener, discoverer: &mut D) -> Exit {
    let local_addr = listener.local_addr();
    for server in listener.config().stun_servers() {
        // Resolve once per attempt so the mapping is kept against a single IP.
        let Some(server_addr) = resolve(&server, listener.family(), local_addr).await else {
            continue;
        };
        discoverer.set_server_addr(server_addr);

        let (nat_type, address) = match discoverer.discover().await {
            Ok((nat_type, Some(address))) => (nat_type, address),
            Ok((nat_type, None)) => {
                log::debug!(
                    "{listener} stun discovery on {server} resolved to {nat_type} without an address"
                );
                continue;
            }
            Err(e) => {
                log::debug!("{listener} stun discovery on {server}: {e}");
                continue;
            }
        };
        if nat_type.is_inconclusive() {
            log::debug!("{listener} stun discovery on {server} resolved to {nat_type}");
            continue;
        }
        if !nat_type.is_punchable() {
            if listener.publish(nat_type, None).changed() {
                listener.notify_addresses_changed();
            }
            return Exit::Retry;
        }

        let mut session = DiscoverySession::new(server_addr, nat_type, address);
        match session.keepalive(listener, discoverer).await {
            SessionEnd::Disabled => return Exit::Disabled,
            SessionEnd::Abandoned => {}
        }
    }
    Exit::Retry
}

async fn resolve(
    server: &str,
    family: Family,
    local_addr: Option<SocketAddr>,
) -> Option<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Some(addr);
    }
    let reachable =
        |addr: &SocketAddr| local_addr.map_or(true, |local| family.reaches(&local, addr));
    match tokio::net::lookup_host(server).await {
        Ok(mut addrs) => {
            let addr = addrs.find(reachable);
            if addr.is_none() {
                log::debug!("stun addr resolution on {server}: no usable address");
            }
            addr
        }
        Err(e) => {
            log::debug!("stun addr resolution on {server}: {e}");
            None
        }
    }
}
