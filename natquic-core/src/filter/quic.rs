use std::fmt::{self, Debug};
use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};

use super::FilteredConn;

/// Lets a quinn endpoint run on top of a [`FilteredConn`].
pub struct QuicSocket {
    conn: Arc<FilteredConn>,
}

impl QuicSocket {
    pub fn new(conn: Arc<FilteredConn>) -> Self {
        Self { conn }
    }
}

impl Debug for QuicSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicSocket")
            .field("conn", &self.conn)
            .finish()
    }
}

struct QuicSocketPoller {
    conn: Arc<FilteredConn>,
}

impl Debug for QuicSocketPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicSocketPoller").finish_non_exhaustive()
    }
}

impl UdpPoller for QuicSocketPoller {
    fn poll_writable(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        self.conn.poll_send_ready(cx)
    }
}

impl AsyncUdpSocket for QuicSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(QuicSocketPoller {
            conn: self.conn.clone(),
        })
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        self.conn
            .try_send_to(transmit.contents, transmit.destination)
            .map(|_| ())
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        debug_assert!(!bufs.is_empty() && !meta.is_empty());
        let (data, addr) = match self.conn.poll_recv_datagram(cx) {
            Poll::Ready(Ok(datagram)) => datagram,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };
        let len = data.len().min(bufs[0].len());
        bufs[0][..len].copy_from_slice(&data[..len]);
        meta[0] = RecvMeta {
            addr,
            len,
            stride: len,
            ecn: None,
            dst_ip: None,
        };
        Poll::Ready(Ok(1))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        crate::filter::PacketConn::local_addr(self.conn.as_ref())
    }

    fn max_transmit_segments(&self) -> usize {
        1
    }

    fn max_receive_segments(&self) -> usize {
        1
    }

    fn may_fragment(&self) -> bool {
        true
    }
}
