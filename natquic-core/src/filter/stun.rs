use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::Filter;

pub const MAGIC_COOKIE: [u8; 4] = [0x21, 0x12, 0xA4, 0x42];
pub const HEADER_LEN: usize = 20;

/// How long an outgoing transaction stays claimable.
pub const DEFAULT_TRANSACTION_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_TRANSACTIONS: usize = 1024;

pub type TransactionId = [u8; 12];

/// Returns true if `data` looks like a STUN message carrying the magic cookie.
pub fn is_stun_payload(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN && data[0] & 0xC0 == 0 && data[4..8] == MAGIC_COOKIE
}

pub fn transaction_id(data: &[u8]) -> Option<TransactionId> {
    if !is_stun_payload(data) {
        return None;
    }
    let mut id = [0u8; 12];
    id.copy_from_slice(&data[8..HEADER_LEN]);
    Some(id)
}

/// Claims inbound STUN responses whose transaction was sent through the
/// same connection and has not expired yet.
pub struct StunFilter {
    ids: Mutex<HashMap<TransactionId, Instant>>,
    ttl: Duration,
    capacity: usize,
}

impl Default for StunFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl StunFilter {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_TRANSACTION_TTL, DEFAULT_MAX_TRANSACTIONS)
    }
    pub fn with_limits(ttl: Duration, capacity: usize) -> Self {
        Self {
            ids: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }
    /// Number of transactions currently tracked.
    pub fn outstanding(&self) -> usize {
        let mut ids = self.ids.lock();
        reap(&mut ids, Instant::now());
        ids.len()
    }
}

fn reap(ids: &mut HashMap<TransactionId, Instant>, now: Instant) {
    ids.retain(|_, deadline| *deadline > now);
}

impl Filter for StunFilter {
    fn outgoing(&self, buf: &[u8], _addr: SocketAddr) {
        let Some(id) = transaction_id(buf) else {
            log::debug!("non-stun payload written on the stun connection");
            return;
        };
        let now = Instant::now();
        let mut ids = self.ids.lock();
        reap(&mut ids, now);
        if ids.len() >= self.capacity && !ids.contains_key(&id) {
            let oldest = ids
                .iter()
                .min_by_key(|(_, deadline)| **deadline)
                .map(|(id, _)| *id);
            if let Some(oldest) = oldest {
                ids.remove(&oldest);
            }
        }
        ids.insert(id, now + self.ttl);
    }

    fn claim_incoming(&self, buf: &[u8], _addr: SocketAddr) -> bool {
        let Some(id) = transaction_id(buf) else {
            return false;
        };
        let mut ids = self.ids.lock();
        reap(&mut ids, Instant::now());
        ids.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stun_packet(id: u8) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[1] = 0x01;
        buf[4..8].copy_from_slice(&MAGIC_COOKIE);
        for b in &mut buf[8..HEADER_LEN] {
            *b = id;
        }
        buf
    }

    fn addr() -> SocketAddr {
        "192.0.2.1:3478".parse().unwrap()
    }

    #[test]
    fn payload_detection() {
        assert!(is_stun_payload(&stun_packet(1)));
        assert!(!is_stun_payload(&stun_packet(1)[..19]));
        let mut quic_like = stun_packet(1);
        quic_like[0] = 0xC3;
        assert!(!is_stun_payload(&quic_like));
        let mut no_cookie = stun_packet(1);
        no_cookie[4] = 0;
        assert!(!is_stun_payload(&no_cookie));
    }

    #[tokio::test]
    async fn claims_only_outstanding_transactions() {
        let filter = StunFilter::new();
        assert!(!filter.claim_incoming(&stun_packet(1), addr()));
        filter.outgoing(&stun_packet(1), addr());
        assert!(filter.claim_incoming(&stun_packet(1), addr()));
        assert!(!filter.claim_incoming(&stun_packet(2), addr()));
        assert!(!filter.claim_incoming(b"not stun at all, longer than twenty", addr()));
    }

    #[tokio::test(start_paused = true)]
    async fn transactions_expire() {
        let filter = StunFilter::new();
        filter.outgoing(&stun_packet(3), addr());
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(filter.claim_incoming(&stun_packet(3), addr()));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!filter.claim_incoming(&stun_packet(3), addr()));
        assert_eq!(filter.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_the_oldest() {
        let filter = StunFilter::with_limits(Duration::from_secs(60), 2);
        filter.outgoing(&stun_packet(1), addr());
        tokio::time::advance(Duration::from_millis(10)).await;
        filter.outgoing(&stun_packet(2), addr());
        tokio::time::advance(Duration::from_millis(10)).await;
        filter.outgoing(&stun_packet(3), addr());
        assert_eq!(filter.outstanding(), 2);
        assert!(!filter.claim_incoming(&stun_packet(1), addr()));
        assert!(filter.claim_incoming(&stun_packet(2), addr()));
        assert!(filter.claim_incoming(&stun_packet(3), addr()));
    }
}
