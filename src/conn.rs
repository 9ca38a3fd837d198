use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Priority of QUIC connections when several transports reach the same peer.
/// Lower is better.
pub const QUIC_PRIORITY: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    QuicServer,
}

impl ConnectionType {
    pub fn transport(&self) -> &'static str {
        match self {
            ConnectionType::QuicServer => "quic",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::QuicServer => f.write_str("quic-server"),
        }
    }
}

/// A QUIC connection together with its first bidirectional stream.
pub struct QuicTlsConn {
    connection: quinn::Connection,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl QuicTlsConn {
    pub fn new(
        connection: quinn::Connection,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
    ) -> Self {
        Self {
            connection,
            send,
            recv,
        }
    }
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }
    pub fn connection(&self) -> &quinn::Connection {
        &self.connection
    }
    /// Finish the stream and close the connection.
    pub fn close(&mut self) {
        _ = self.send.finish();
        self.connection.close(0u32.into(), b"");
    }
}

impl fmt::Debug for QuicTlsConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicTlsConn")
            .field("remote_addr", &self.connection.remote_address())
            .field("stream", &self.send.id())
            .finish()
    }
}

impl AsyncRead for QuicTlsConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for QuicTlsConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

/// A fully accepted connection handed to the intake channel.
#[derive(Debug)]
pub struct InternalConn {
    conn: QuicTlsConn,
    conn_type: ConnectionType,
    priority: i32,
}

impl InternalConn {
    pub fn new(conn: QuicTlsConn, conn_type: ConnectionType, priority: i32) -> Self {
        Self {
            conn,
            conn_type,
            priority,
        }
    }
    pub fn conn_type(&self) -> ConnectionType {
        self.conn_type
    }
    pub fn priority(&self) -> i32 {
        self.priority
    }
    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }
    pub fn conn(&mut self) -> &mut QuicTlsConn {
        &mut self.conn
    }
    pub fn into_inner(self) -> QuicTlsConn {
        self.conn
    }
    pub fn close(&mut self) {
        self.conn.close()
    }
}

impl fmt::Display for InternalConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, priority {})",
            self.conn.remote_addr(),
            self.conn_type,
            self.priority
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_type_names() {
        assert_eq!(ConnectionType::QuicServer.to_string(), "quic-server");
        assert_eq!(ConnectionType::QuicServer.transport(), "quic");
    }
}
