//! Packet demultiplexing for a single UDP socket.
//!
//! A [`PacketFilter`] owns one bound socket and hands out any number of
//! virtual connections ([`FilteredConn`]). Every inbound datagram is offered
//! to the virtual connections in ascending priority order and delivered to
//! the first one whose [`Filter`] claims it. A connection without a filter
//! claims everything, so it should carry the largest priority value.
//!
//! ```text
//!                 ┌──────────────┐
//!   UdpSocket ───►│ PacketFilter │
//!                 └──────┬───────┘
//!            prio 10     │     prio 100
//!          ┌─────────────┴─────────────┐
//!          ▼                           ▼
//!   FilteredConn (STUN)        FilteredConn (QUIC)
//! ```

use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_shutdown::ShutdownManager;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub mod quic;
pub mod stun;

pub use self::stun::StunFilter;

/// Priority of the discovery connection.
pub const STUN_FILTER_PRIORITY: i32 = 10;
/// Priority of the catch-all transport connection.
pub const QUIC_FILTER_PRIORITY: i32 = 100;

pub const DEFAULT_BACKLOG: usize = 128;

const MAX_DATAGRAM_SIZE: usize = 65535;

/// A received datagram and its source.
pub type Datagram = (Bytes, SocketAddr);

/// Something that behaves like an unconnected datagram socket.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn close(&self);
}

/// Decides which datagrams belong to a virtual connection.
pub trait Filter: Send + Sync {
    /// Called with every datagram written through the connection.
    fn outgoing(&self, buf: &[u8], addr: SocketAddr);
    /// Returns true if the inbound datagram belongs to the connection.
    fn claim_incoming(&self, buf: &[u8], addr: SocketAddr) -> bool;
}

struct ConnSlot {
    id: usize,
    priority: i32,
    filter: Option<Arc<dyn Filter>>,
    sender: mpsc::Sender<Datagram>,
}

struct Shared {
    socket: Arc<UdpSocket>,
    conns: RwLock<Vec<ConnSlot>>,
    next_id: AtomicUsize,
    dropped: AtomicU64,
    started: AtomicBool,
    backlog: usize,
    shutdown_manager: ShutdownManager<()>,
}

impl Shared {
    fn dispatch(&self, buf: &[u8], addr: SocketAddr) {
        let conns = self.conns.read();
        for slot in conns.iter() {
            let claimed = match &slot.filter {
                None => true,
                Some(filter) => filter.claim_incoming(buf, addr),
            };
            if !claimed {
                continue;
            }
            match slot.sender.try_send((Bytes::copy_from_slice(buf), addr)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    log::trace!("backlog full on conn {}, dropping datagram from {addr}", slot.id);
                }
                Err(TrySendError::Closed(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            return;
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        log::trace!("unclaimed datagram from {addr}");
    }
    fn remove(&self, id: usize) {
        self.conns.write().retain(|slot| slot.id != id);
    }
    fn close(&self) {
        _ = self.shutdown_manager.trigger_shutdown(());
        // Dropping the senders wakes every pending reader.
        self.conns.write().clear();
    }
    fn is_closed(&self) -> bool {
        self.shutdown_manager.is_shutdown_triggered()
    }
}

/// Splits one UDP socket into several virtual packet connections.
#[derive(Clone)]
pub struct PacketFilter {
    shared: Arc<Shared>,
}

impl PacketFilter {
    pub fn new(socket: UdpSocket) -> Self {
        Self::with_backlog(socket, DEFAULT_BACKLOG)
    }
    pub fn with_backlog(socket: UdpSocket, backlog: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                socket: Arc::new(socket),
                conns: RwLock::new(Vec::new()),
                next_id: AtomicUsize::new(0),
                dropped: AtomicU64::new(0),
                started: AtomicBool::new(false),
                backlog: backlog.max(1),
                shutdown_manager: ShutdownManager::new(),
            }),
        }
    }

    /// Create a virtual connection. Lower `priority` values see packets first.
    pub fn new_conn(&self, priority: i32, filter: Option<Arc<dyn Filter>>) -> Arc<FilteredConn> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.shared.backlog);
        {
            let mut conns = self.shared.conns.write();
            conns.push(ConnSlot {
                id,
                priority,
                filter: filter.clone(),
                sender,
            });
            conns.sort_by_key(|slot| slot.priority);
        }
        Arc::new(FilteredConn {
            id,
            priority,
            shared: self.shared.clone(),
            filter,
            receiver: Mutex::new(receiver),
            closed: AtomicBool::new(false),
        })
    }

    /// Start the reader task. Calling it more than once has no effect.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = self.shared.clone();
        let fut = self.shared.shutdown_manager.wrap_cancel(recv_loop(shared));
        tokio::spawn(async move {
            if fut.await.is_err() {
                log::debug!("recv shutdown signal: packet filter reader stopped");
            }
        });
    }

    /// Close every virtual connection and stop reading from the socket.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Datagrams discarded because nobody claimed them or a backlog was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }
}

async fn recv_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, addr) = match shared.socket.recv_from(&mut buf).await {
            Ok(rs) => rs,
            Err(e) => {
                if should_ignore_error(&e) {
                    continue;
                }
                log::debug!("packet filter recv_from {e:?}");
                break;
            }
        };
        shared.dispatch(&buf[..len], addr);
    }
    shared.close();
}

fn should_ignore_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
    )
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

/// One virtual connection of a [`PacketFilter`].
pub struct FilteredConn {
    id: usize,
    priority: i32,
    shared: Arc<Shared>,
    filter: Option<Arc<dyn Filter>>,
    receiver: Mutex<mpsc::Receiver<Datagram>>,
    closed: AtomicBool,
}

impl FilteredConn {
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.shared.is_closed()
    }

    pub fn poll_recv_datagram(&self, cx: &mut Context<'_>) -> Poll<io::Result<Datagram>> {
        if self.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(closed_error()));
        }
        match self.receiver.lock().poll_recv(cx) {
            Poll::Ready(Some(datagram)) => Poll::Ready(Ok(datagram)),
            Poll::Ready(None) => Poll::Ready(Err(closed_error())),
            Poll::Pending => Poll::Pending,
        }
    }

    pub fn poll_send_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.socket.poll_send_ready(cx)
    }

    pub fn try_send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        if let Some(filter) = &self.filter {
            filter.outgoing(buf, addr);
        }
        self.shared.socket.try_send_to(buf, addr)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.receiver.lock().close();
        self.shared.remove(self.id);
    }
}

#[async_trait]
impl PacketConn for FilteredConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (data, addr) = poll_fn(|cx| self.poll_recv_datagram(cx)).await?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, addr))
    }
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        if let Some(filter) = &self.filter {
            filter.outgoing(buf, addr);
        }
        self.shared.socket.send_to(buf, addr).await
    }
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }
    fn close(&self) {
        FilteredConn::close(self)
    }
}

impl fmt::Debug for FilteredConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilteredConn")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("local_addr", &self.shared.socket.local_addr().ok())
            .finish_non_exhaustive()
    }
}

impl Drop for FilteredConn {
    fn drop(&mut self) {
        self.shared.remove(self.id);
    }
}

#[async_trait]
impl<T: PacketConn + ?Sized> PacketConn for Arc<T> {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        (**self).recv_from(buf).await
    }
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        (**self).send_to(buf, addr).await
    }
    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
    fn close(&self) {
        (**self).close()
    }
}

#[async_trait]
impl PacketConn for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr).await
    }
    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct PrefixFilter(u8);

    impl Filter for PrefixFilter {
        fn outgoing(&self, _buf: &[u8], _addr: SocketAddr) {}
        fn claim_incoming(&self, buf: &[u8], _addr: SocketAddr) -> bool {
            buf.first() == Some(&self.0)
        }
    }

    async fn local_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn each_datagram_has_exactly_one_destination() {
        let filter = PacketFilter::new(local_socket().await);
        let catch_all = filter.new_conn(100, None);
        let tagged = filter.new_conn(10, Some(Arc::new(PrefixFilter(7))));
        filter.start();
        let dest = filter.local_addr().unwrap();

        let peer = local_socket().await;
        peer.send_to(&[7, 1], dest).await.unwrap();
        peer.send_to(&[8, 2], dest).await.unwrap();
        peer.send_to(&[7, 3], dest).await.unwrap();

        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        for _ in 0..2 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(1), tagged.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            got.push(buf[..len].to_vec());
        }
        assert_eq!(got, vec![vec![7, 1], vec![7, 3]]);

        let (len, from) =
            tokio::time::timeout(Duration::from_secs(1), catch_all.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
        assert_eq!(&buf[..len], &[8, 2]);
        assert_eq!(from, peer.local_addr().unwrap());

        assert!(
            tokio::time::timeout(Duration::from_millis(100), catch_all.recv_from(&mut buf))
                .await
                .is_err()
        );
        filter.close();
    }

    #[tokio::test]
    async fn priority_order_is_independent_of_creation_order() {
        let filter = PacketFilter::new(local_socket().await);
        let low = filter.new_conn(50, Some(Arc::new(PrefixFilter(1))));
        let high = filter.new_conn(5, Some(Arc::new(PrefixFilter(1))));
        filter.start();
        let peer = local_socket().await;
        peer.send_to(&[1], filter.local_addr().unwrap()).await.unwrap();

        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(1), high.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), low.recv_from(&mut buf))
                .await
                .is_err()
        );
        filter.close();
    }

    #[tokio::test]
    async fn closing_the_filter_fails_pending_reads() {
        let filter = PacketFilter::new(local_socket().await);
        let conn = filter.new_conn(100, None);
        filter.start();
        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                conn.recv_from(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        filter.close();
        let rs = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rs.unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert!(conn.send_to(&[0], "127.0.0.1:9".parse().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn closed_conn_yields_packets_to_the_next_one() {
        let filter = PacketFilter::new(local_socket().await);
        let first = filter.new_conn(10, None);
        let second = filter.new_conn(20, None);
        filter.start();
        first.close();

        let peer = local_socket().await;
        peer.send_to(&[9], filter.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 4];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), second.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &[9]);
        assert!(first.recv_from(&mut buf).await.is_err());
        filter.close();
    }

    #[tokio::test]
    async fn unclaimed_datagrams_are_counted() {
        let filter = PacketFilter::new(local_socket().await);
        let _only = filter.new_conn(10, Some(Arc::new(PrefixFilter(1))));
        filter.start();
        let peer = local_socket().await;
        peer.send_to(&[2], filter.local_addr().unwrap()).await.unwrap();
        for _ in 0..50 {
            if filter.dropped() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(filter.dropped(), 1);
        filter.close();
    }
}
