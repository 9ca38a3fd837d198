//! STUN client used for NAT classification and mapping keepalive.
//!
//! Classification runs the RFC 3489 test sequence against a server that
//! advertises a second address (`OTHER-ADDRESS`, or the older
//! `CHANGED-ADDRESS`):
//!
//! 1. Test I: plain binding request, learns the mapped address.
//! 2. Test II: ask the server to answer from its other IP and port.
//! 3. Test I again, against the other address, to spot symmetric mappings.
//! 4. Test III: ask the server to answer from its other port only.
//!
//! The client works over any [`PacketConn`], so it can share a socket with
//! other traffic through a [`crate::filter::PacketFilter`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use ::stun::agent::TransactionId;
use ::stun::attributes::AttrType;
use ::stun::message::{Getter, Message, BINDING_REQUEST, BINDING_SUCCESS};
use ::stun::xoraddr::XorMappedAddress;
use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::filter::PacketConn;
use crate::nat::NatType;

pub const DEFAULT_PORT: u16 = 3478;

const INITIAL_RTO: Duration = Duration::from_millis(100);
const MAX_RTO: Duration = Duration::from_millis(1600);
const MAX_TRANSMISSIONS: usize = 9;
const RECV_BUFFER_SIZE: usize = 1500;

const CHANGE_IP: u8 = 0x04;
const CHANGE_PORT: u8 = 0x02;

pub const ATTR_MAPPED_ADDRESS: AttrType = AttrType(0x0001);
pub const ATTR_CHANGE_REQUEST: AttrType = AttrType(0x0003);
pub const ATTR_CHANGED_ADDRESS: AttrType = AttrType(0x0005);
pub const ATTR_OTHER_ADDRESS: AttrType = AttrType(0x802C);

/// Capability used by the discovery loop.
#[async_trait]
pub trait NatDiscoverer: Send {
    fn set_server_addr(&mut self, addr: SocketAddr);
    /// Classify the NAT and return the externally mapped address, if any.
    async fn discover(&mut self) -> Result<(NatType, Option<SocketAddr>)>;
    /// Refresh the mapping and return the currently mapped address.
    async fn keepalive(&mut self) -> Result<SocketAddr>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingResponse {
    pub mapped: SocketAddr,
    pub other: Option<SocketAddr>,
    pub source: SocketAddr,
}

pub struct StunClient<C> {
    conn: C,
    server: Option<SocketAddr>,
    initial_rto: Duration,
    max_rto: Duration,
    max_transmissions: usize,
}

impl<C: PacketConn> StunClient<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            server: None,
            initial_rto: INITIAL_RTO,
            max_rto: MAX_RTO,
            max_transmissions: MAX_TRANSMISSIONS,
        }
    }
    pub fn set_retransmission(
        mut self,
        initial_rto: Duration,
        max_rto: Duration,
        max_transmissions: usize,
    ) -> Self {
        self.initial_rto = initial_rto;
        self.max_rto = max_rto.max(initial_rto);
        self.max_transmissions = max_transmissions.max(1);
        self
    }
    pub fn conn(&self) -> &C {
        &self.conn
    }

    /// Send one binding request with retransmissions.
    ///
    /// `Ok(None)` means the server never answered.
    pub async fn binding_request(
        &self,
        dest: SocketAddr,
        change: u8,
    ) -> Result<Option<BindingResponse>> {
        let request = build_request(change)?;
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let mut rto = self.initial_rto;
        for _ in 0..self.max_transmissions {
            self.conn.send_to(&request.raw, dest).await?;
            let deadline = Instant::now() + rto;
            loop {
                let (len, source) =
                    match tokio::time::timeout_at(deadline, self.conn.recv_from(&mut buf)).await {
                        Ok(rs) => rs?,
                        Err(_) => break,
                    };
                // Dual stack sockets report IPv4 peers as mapped IPv6 addresses.
                let source = SocketAddr::new(source.ip().to_canonical(), source.port());
                match parse_response(&buf[..len], &request.transaction_id) {
                    Ok(Some((mapped, other))) => {
                        return Ok(Some(BindingResponse {
                            mapped,
                            other,
                            source,
                        }))
                    }
                    Ok(None) => {}
                    Err(e) => log::debug!("stun response from {source}: {e}"),
                }
            }
            rto = (rto * 2).min(self.max_rto);
        }
        Ok(None)
    }

    async fn classify(&self, server: SocketAddr) -> Result<(NatType, Option<SocketAddr>)> {
        let local = self.conn.local_addr()?;

        let Some(test1) = self.binding_request(server, 0).await? else {
            return Ok((NatType::Blocked, None));
        };
        let mapped = test1.mapped;
        let Some(other) = test1.other else {
            log::debug!("stun server {server} did not report a changed address");
            return Ok((NatType::Error, Some(mapped)));
        };
        let identical = mapped == local;

        let test2 = self.binding_request(server, CHANGE_IP | CHANGE_PORT).await?;
        if let Some(resp) = &test2 {
            if resp.source.ip() == server.ip() || resp.source.port() == server.port() {
                log::debug!("stun server {server} ignored the change request");
                return Ok((NatType::Error, Some(mapped)));
            }
        }
        if identical {
            let nat_type = if test2.is_some() {
                NatType::None
            } else {
                NatType::SymmetricUdpFirewall
            };
            return Ok((nat_type, Some(mapped)));
        }
        if test2.is_some() {
            return Ok((NatType::Full, Some(mapped)));
        }

        let Some(test1_other) = self.binding_request(other, 0).await? else {
            return Ok((NatType::Unknown, Some(mapped)));
        };
        if test1_other.mapped != mapped {
            return Ok((NatType::Symmetric, Some(mapped)));
        }

        let test3 = self.binding_request(server, CHANGE_PORT).await?;
        match test3 {
            Some(resp) if resp.source.port() == server.port() => {
                log::debug!("stun server {server} ignored the change port request");
                Ok((NatType::Error, Some(mapped)))
            }
            Some(_) => Ok((NatType::Restricted, Some(mapped))),
            None => Ok((NatType::PortRestricted, Some(mapped))),
        }
    }
}

#[async_trait]
impl<C: PacketConn> NatDiscoverer for StunClient<C> {
    fn set_server_addr(&mut self, addr: SocketAddr) {
        self.server = Some(addr);
    }
    async fn discover(&mut self) -> Result<(NatType, Option<SocketAddr>)> {
        let server = self.server.ok_or(Error::NoServer)?;
        self.classify(server).await
    }
    async fn keepalive(&mut self) -> Result<SocketAddr> {
        let server = self.server.ok_or(Error::NoServer)?;
        let resp = self.binding_request(server, 0).await?.ok_or(Error::Timeout)?;
        Ok(resp.mapped)
    }
}

fn stun_error(e: impl std::fmt::Display) -> Error {
    Error::Stun(e.to_string())
}

fn build_request(change: u8) -> Result<Message> {
    let mut msg = Message::new();
    msg.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])
        .map_err(stun_error)?;
    if change != 0 {
        msg.add(ATTR_CHANGE_REQUEST, &[0, 0, 0, change]);
    }
    Ok(msg)
}

/// Returns `Ok(None)` for responses that belong to another transaction.
fn parse_response(
    data: &[u8],
    id: &TransactionId,
) -> Result<Option<(SocketAddr, Option<SocketAddr>)>> {
    let mut msg = Message::new();
    msg.write(data).map_err(stun_error)?;
    if msg.transaction_id != *id {
        return Ok(None);
    }
    if msg.typ != BINDING_SUCCESS {
        return Err(Error::Stun(format!("unexpected message type {}", msg.typ)));
    }
    let mapped = mapped_address(&msg)?;
    let other = msg
        .get(ATTR_OTHER_ADDRESS)
        .or_else(|_| msg.get(ATTR_CHANGED_ADDRESS))
        .ok()
        .and_then(|value| decode_address(&value));
    Ok(Some((mapped, other)))
}

fn mapped_address(msg: &Message) -> Result<SocketAddr> {
    let mut xor_addr = XorMappedAddress::default();
    if xor_addr.get_from(msg).is_ok() {
        return Ok(SocketAddr::new(xor_addr.ip, xor_addr.port));
    }
    msg.get(ATTR_MAPPED_ADDRESS)
        .ok()
        .and_then(|value| decode_address(&value))
        .ok_or(Error::NoMappedAddress)
}

/// Decode a plain (non-XOR) address attribute value.
pub fn decode_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = match value[1] {
        0x01 if value.len() >= 8 => {
            IpAddr::V4(Ipv4Addr::new(value[4], value[5], value[6], value[7]))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Encode a plain (non-XOR) address attribute value.
pub fn encode_address(addr: SocketAddr) -> Vec<u8> {
    let mut value = Vec::with_capacity(20);
    value.push(0);
    match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(0x01);
            value.extend_from_slice(&addr.port().to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            value.push(0x02);
            value.extend_from_slice(&addr.port().to_be_bytes());
            value.extend_from_slice(&ip.octets());
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{PacketFilter, StunFilter, STUN_FILTER_PRIORITY};
    use ::stun::message::Setter;
    use std::sync::Arc;
    use tokio::net::UdpSocket;

    #[derive(Clone, Copy, Default)]
    struct Behaviour {
        report_other: bool,
        answer_change_both: bool,
        answer_change_port: bool,
        /// Added to the observed port when reporting the mapped address.
        primary_offset: u16,
        other_offset: u16,
        silent: bool,
    }

    struct FakeServer {
        primary: SocketAddr,
    }

    fn reply(request: &Message, mapped: SocketAddr, other: Option<SocketAddr>) -> Vec<u8> {
        let mut msg = Message::new();
        let xor = XorMappedAddress {
            ip: mapped.ip(),
            port: mapped.port(),
        };
        msg.build(&[
            Box::new(request.transaction_id),
            Box::new(BINDING_SUCCESS),
        ])
        .unwrap();
        xor.add_to(&mut msg).unwrap();
        if let Some(other) = other {
            msg.add(ATTR_OTHER_ADDRESS, &encode_address(other));
        }
        msg.raw.clone()
    }

    async fn serve(
        socket: Arc<UdpSocket>,
        offset: u16,
        both: Arc<UdpSocket>,
        port_only: Arc<UdpSocket>,
        other: SocketAddr,
        behaviour: Behaviour,
    ) {
        let mut buf = [0u8; 1500];
        while let Ok((len, src)) = socket.recv_from(&mut buf).await {
            if behaviour.silent {
                continue;
            }
            let mut request = Message::new();
            if request.write(&buf[..len]).is_err() {
                continue;
            }
            let change = request
                .get(ATTR_CHANGE_REQUEST)
                .ok()
                .and_then(|v| v.get(3).copied())
                .unwrap_or(0);
            let mapped = SocketAddr::new(src.ip(), src.port().wrapping_add(offset));
            let other = behaviour.report_other.then_some(other);
            let data = reply(&request, mapped, other);
            let from = if change & CHANGE_IP != 0 {
                if !behaviour.answer_change_both {
                    continue;
                }
                &both
            } else if change & CHANGE_PORT != 0 {
                if !behaviour.answer_change_port {
                    continue;
                }
                &port_only
            } else {
                &socket
            };
            _ = from.send_to(&data, src).await;
        }
    }

    impl FakeServer {
        async fn start(behaviour: Behaviour) -> FakeServer {
            let primary = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
            let port_only = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
            let other = Arc::new(UdpSocket::bind("127.0.0.2:0").await.unwrap());
            let other_addr = other.local_addr().unwrap();
            tokio::spawn(serve(
                primary.clone(),
                behaviour.primary_offset,
                other.clone(),
                port_only.clone(),
                other_addr,
                behaviour,
            ));
            tokio::spawn(serve(
                other.clone(),
                behaviour.other_offset,
                other.clone(),
                port_only,
                other_addr,
                behaviour,
            ));
            FakeServer {
                primary: primary.local_addr().unwrap(),
            }
        }
    }

    async fn client(server: &FakeServer) -> StunClient<UdpSocket> {
        _ = env_logger::builder().is_test(true).try_init();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = StunClient::new(socket).set_retransmission(
            Duration::from_millis(20),
            Duration::from_millis(40),
            3,
        );
        client.set_server_addr(server.primary);
        client
    }

    #[test]
    fn address_codec() {
        let v4: SocketAddr = "198.51.100.7:22000".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:3478".parse().unwrap();
        assert_eq!(decode_address(&encode_address(v4)), Some(v4));
        assert_eq!(decode_address(&encode_address(v6)), Some(v6));
        assert_eq!(decode_address(&[0, 1, 0]), None);
        assert_eq!(decode_address(&[0, 9, 0, 1, 1, 2, 3, 4]), None);
    }

    #[test]
    fn request_carries_change_flags() {
        let msg = build_request(CHANGE_IP | CHANGE_PORT).unwrap();
        assert_eq!(msg.get(ATTR_CHANGE_REQUEST).unwrap(), vec![0, 0, 0, 0x06]);
        assert!(crate::filter::stun::is_stun_payload(&msg.raw));
        let plain = build_request(0).unwrap();
        assert!(plain.get(ATTR_CHANGE_REQUEST).is_err());
    }

    #[tokio::test]
    async fn not_behind_a_nat() {
        let server = FakeServer::start(Behaviour {
            report_other: true,
            answer_change_both: true,
            ..Default::default()
        })
        .await;
        let mut client = client(&server).await;
        let local = client.conn().local_addr().unwrap();
        let (nat_type, mapped) = client.discover().await.unwrap();
        assert_eq!(nat_type, NatType::None);
        assert_eq!(mapped, Some(local));
    }

    #[tokio::test]
    async fn full_cone() {
        let server = FakeServer::start(Behaviour {
            report_other: true,
            answer_change_both: true,
            primary_offset: 1000,
            other_offset: 1000,
            ..Default::default()
        })
        .await;
        let mut client = client(&server).await;
        let local = client.conn().local_addr().unwrap();
        let (nat_type, mapped) = client.discover().await.unwrap();
        assert_eq!(nat_type, NatType::Full);
        assert_eq!(mapped.unwrap().port(), local.port().wrapping_add(1000));
    }

    #[tokio::test]
    async fn restricted_and_port_restricted() {
        let base = Behaviour {
            report_other: true,
            primary_offset: 7,
            other_offset: 7,
            ..Default::default()
        };
        let server = FakeServer::start(Behaviour {
            answer_change_port: true,
            ..base
        })
        .await;
        let mut c = client(&server).await;
        assert_eq!(c.discover().await.unwrap().0, NatType::Restricted);

        let server = FakeServer::start(base).await;
        let mut c = client(&server).await;
        assert_eq!(c.discover().await.unwrap().0, NatType::PortRestricted);
    }

    #[tokio::test]
    async fn symmetric() {
        let server = FakeServer::start(Behaviour {
            report_other: true,
            primary_offset: 1,
            other_offset: 2,
            ..Default::default()
        })
        .await;
        let mut c = client(&server).await;
        assert_eq!(c.discover().await.unwrap().0, NatType::Symmetric);
    }

    #[tokio::test]
    async fn blocked_and_missing_other_address() {
        let server = FakeServer::start(Behaviour {
            silent: true,
            ..Default::default()
        })
        .await;
        let mut c = client(&server).await;
        assert_eq!(c.discover().await.unwrap(), (NatType::Blocked, None));
        assert!(c.keepalive().await.unwrap_err().is_timeout());

        let server = FakeServer::start(Behaviour::default()).await;
        let mut c = client(&server).await;
        let (nat_type, mapped) = c.discover().await.unwrap();
        assert_eq!(nat_type, NatType::Error);
        assert!(mapped.is_some());
    }

    #[tokio::test]
    async fn discovery_without_server_fails() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut c = StunClient::new(socket);
        assert!(matches!(c.discover().await, Err(Error::NoServer)));
    }

    #[tokio::test]
    async fn keepalive_through_packet_filter() {
        let server = FakeServer::start(Behaviour {
            primary_offset: 3,
            ..Default::default()
        })
        .await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        let filter = PacketFilter::new(socket);
        let transport = filter.new_conn(100, None);
        let stun_conn = filter.new_conn(STUN_FILTER_PRIORITY, Some(Arc::new(StunFilter::new())));
        filter.start();

        let mut c = StunClient::new(stun_conn).set_retransmission(
            Duration::from_millis(50),
            Duration::from_millis(100),
            3,
        );
        c.set_server_addr(server.primary);
        let mapped = c.keepalive().await.unwrap();
        assert_eq!(mapped, SocketAddr::new(local.ip(), local.port().wrapping_add(3)));

        // A stray STUN-looking packet with an unknown transaction goes to transport.
        let stray = build_request(0).unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&stray.raw, local).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), transport.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &stray.raw[..]);
        filter.close();
    }
}
