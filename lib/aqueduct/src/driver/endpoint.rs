use crate::concurrent::position::Position;
use crate::driver::resolver::NameResolver;
use crate::driver::uri::{ChannelUri, ControlMode, Media};
use crate::error::{DriverError, DriverResult, ErrorKind};
use mio::net::UdpSocket;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Channel endpoint status values published through the status counter.
pub const STATUS_INITIALIZING: i64 = 0;
pub const STATUS_ACTIVE: i64 = 1;
pub const STATUS_CLOSING: i64 = 2;
pub const STATUS_ERRORED: i64 = -1;

/// A channel URI resolved against the name resolver into concrete socket
/// addresses, plus the canonical form used to share endpoints between
/// registrations.
#[derive(Debug, Clone)]
pub struct UdpChannel {
    pub uri: ChannelUri,
    pub control_mode: ControlMode,
    pub endpoint: Option<SocketAddr>,
    pub control: Option<SocketAddr>,
    pub interface: Option<Ipv4Addr>,
    pub is_multicast: bool,
    pub ttl: Option<u32>,
    pub canonical: String,
}

impl UdpChannel {
    pub fn resolve(uri: ChannelUri, resolver: &mut dyn NameResolver) -> DriverResult<UdpChannel> {
        if uri.media() != Media::Udp {
            return Err(DriverError::Fatal(ErrorKind::InvalidChannel(format!(
                "not a udp channel: {}",
                uri.original()
            ))));
        }

        let control_mode = uri.control_mode()?;
        let endpoint = match uri.endpoint() {
            Some(name) => Some(resolver.resolve(name)?),
            None => None,
        };
        let control = match uri.control() {
            Some(name) => Some(resolver.resolve(name)?),
            None => None,
        };

        if endpoint.is_none() && control.is_none() {
            return Err(DriverError::Fatal(ErrorKind::InvalidChannel(format!(
                "udp channel needs endpoint or control: {}",
                uri.original()
            ))));
        }

        if control_mode != ControlMode::None && control.is_none() {
            return Err(DriverError::Fatal(ErrorKind::InvalidChannel(format!(
                "control-mode without control address: {}",
                uri.original()
            ))));
        }

        let interface = match uri.interface() {
            Some(raw) => Some(raw.parse::<Ipv4Addr>().map_err(|_| {
                DriverError::Fatal(ErrorKind::InvalidChannel(format!(
                    "interface must be an IPv4 address: {}",
                    uri.original()
                )))
            })?),
            None => None,
        };

        let is_multicast = endpoint
            .map(|addr| addr.ip().is_multicast())
            .unwrap_or(false);
        let ttl = uri.ttl()?;

        let canonical = format!(
            "udp:ep={}:ctl={}",
            endpoint
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            control
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );

        Ok(UdpChannel {
            uri,
            control_mode,
            endpoint,
            control,
            interface,
            is_multicast,
            ttl,
            canonical,
        })
    }

    /// Is this channel a sender-side fan-out (multi-destination cast)?
    #[inline]
    pub fn is_multi_destination(&self) -> bool {
        self.control_mode != ControlMode::None
    }
}

/// One bound and non-blocking UDP socket. The owning agent drains it each
/// duty cycle; `WouldBlock` folds to `Wait`/`None` so callers never stall.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub fn bind(bind_addr: &SocketAddr) -> DriverResult<UdpTransport> {
        let socket = UdpSocket::bind(bind_addr)?;
        let local_addr = socket.local_addr()?;

        Ok(UdpTransport { socket, local_addr })
    }

    /// Bind for a multicast group: bind the wildcard on the group's port
    /// and join on the given interface.
    pub fn bind_multicast(
        group: &SocketAddr,
        interface: Option<Ipv4Addr>,
        ttl: Option<u32>,
    ) -> DriverResult<UdpTransport> {
        let group_ip = match group.ip() {
            IpAddr::V4(ip) if ip.is_multicast() => ip,
            other => {
                return Err(DriverError::Fatal(ErrorKind::InvalidChannel(format!(
                    "not an IPv4 multicast group: {}",
                    other
                ))))
            }
        };

        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port());
        let socket = UdpSocket::bind(&bind_addr)?;
        socket.join_multicast_v4(&group_ip, &interface.unwrap_or(Ipv4Addr::UNSPECIFIED))?;
        if let Some(ttl) = ttl {
            socket.set_multicast_ttl_v4(ttl)?;
        }
        let local_addr = socket.local_addr()?;

        Ok(UdpTransport { socket, local_addr })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns bytes sent; zero means the socket could not take the
    /// datagram (short send).
    #[inline]
    pub fn send_to(&self, buf: &[u8], dst: &SocketAddr) -> DriverResult<usize> {
        match self.socket.send_to(buf, dst) {
            Ok(sent) => Ok(sent),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// One datagram, or `None` when the socket is dry.
    #[inline]
    pub fn recv_from(&self, buf: &mut [u8]) -> DriverResult<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, src)) => Ok(Some((len, src))),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    #[inline]
    pub fn register(&self, poll: &mio::Poll, token: mio::Token) -> DriverResult<()> {
        poll.register(
            &self.socket,
            token,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )
        .map_err(Into::into)
    }

    #[inline]
    pub fn deregister(&self, poll: &mio::Poll) -> DriverResult<()> {
        poll.deregister(&self.socket).map_err(Into::into)
    }
}

/// Send side of one bound socket, shared by every publication on the same
/// canonical channel. The sender polls its socket for SM/NAK/RTTM; the
/// conductor owns lifecycle and the reference count.
pub struct SendChannelEndpoint {
    pub id: usize,
    pub udp_channel: UdpChannel,
    pub transport: UdpTransport,
    pub status: Position,
}

impl SendChannelEndpoint {
    pub fn new(id: usize, udp_channel: UdpChannel, status: Position) -> DriverResult<SendChannelEndpoint> {
        status.set_ordered(STATUS_INITIALIZING);

        // MDC listens for SMs on the control address; plain publications
        // use an ephemeral port.
        let transport = match (udp_channel.is_multi_destination(), udp_channel.control) {
            (true, Some(control)) => UdpTransport::bind(&control)?,
            _ => {
                let wildcard: SocketAddr = "0.0.0.0:0".parse().expect("static addr parses");
                UdpTransport::bind(&wildcard)?
            }
        };

        if let (true, Some(ttl)) = (udp_channel.is_multicast, udp_channel.ttl) {
            // Multicast publications respect an explicit ttl.
            let _ = transport.socket.set_multicast_ttl_v4(ttl);
        }

        status.set_ordered(STATUS_ACTIVE);

        Ok(SendChannelEndpoint {
            id,
            udp_channel,
            transport,
            status,
        })
    }

    /// Destination for unicast/multicast sends; MDC channels have none and
    /// fan out through their destination tracker instead.
    #[inline]
    pub fn default_destination(&self) -> Option<SocketAddr> {
        if self.udp_channel.is_multi_destination() {
            None
        } else {
            self.udp_channel.endpoint
        }
    }
}

/// Receive side of one bound socket: data, setup and RTTM in; SM and NAK
/// out. The receiver polls it; the conductor owns lifecycle.
pub struct ReceiveChannelEndpoint {
    pub id: usize,
    pub udp_channel: UdpChannel,
    pub transport: UdpTransport,
    pub status: Position,
}

impl ReceiveChannelEndpoint {
    pub fn new(
        id: usize,
        udp_channel: UdpChannel,
        status: Position,
    ) -> DriverResult<ReceiveChannelEndpoint> {
        status.set_ordered(STATUS_INITIALIZING);

        let endpoint = udp_channel.endpoint.ok_or_else(|| {
            DriverError::Fatal(ErrorKind::InvalidChannel(format!(
                "subscription channel needs an endpoint: {}",
                udp_channel.uri.original()
            )))
        })?;

        let transport = if udp_channel.is_multicast {
            UdpTransport::bind_multicast(&endpoint, udp_channel.interface, udp_channel.ttl)?
        } else {
            UdpTransport::bind(&endpoint)?
        };

        status.set_ordered(STATUS_ACTIVE);

        Ok(ReceiveChannelEndpoint {
            id,
            udp_channel,
            transport,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::buffer::OwnedBuffer;
    use crate::driver::resolver::StdNameResolver;

    fn channel(uri: &str) -> UdpChannel {
        let parsed = ChannelUri::parse(uri).unwrap();
        UdpChannel::resolve(parsed, &mut StdNameResolver::new()).unwrap()
    }

    fn status_position(mem: &OwnedBuffer) -> Position {
        Position::new(mem.buffer(), 0, 1)
    }

    #[test]
    fn test_resolve_unicast_channel() {
        let channel = channel("aqueduct:udp?endpoint=127.0.0.1:24325");

        assert_eq!(channel.endpoint.unwrap().port(), 24325);
        assert_eq!(channel.control, None);
        assert!(!channel.is_multicast);
        assert!(!channel.is_multi_destination());
        assert_eq!(channel.canonical, "udp:ep=127.0.0.1:24325:ctl=-");
    }

    #[test]
    fn test_resolve_mdc_channel() {
        let channel =
            channel("aqueduct:udp?control=127.0.0.1:24326|control-mode=manual");

        assert!(channel.is_multi_destination());
        assert_eq!(channel.control.unwrap().port(), 24326);
    }

    #[test]
    fn test_resolve_rejects_empty_channel() {
        let parsed = ChannelUri::parse("aqueduct:udp?mtu=1408").unwrap();
        assert!(UdpChannel::resolve(parsed, &mut StdNameResolver::new()).is_err());
    }

    #[test]
    fn test_resolve_rejects_control_mode_without_control() {
        let parsed =
            ChannelUri::parse("aqueduct:udp?endpoint=127.0.0.1:0|control-mode=dynamic").unwrap();
        assert!(UdpChannel::resolve(parsed, &mut StdNameResolver::new()).is_err());
    }

    #[test]
    fn test_transport_loopback_roundtrip() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let receiver = UdpTransport::bind(&addr).unwrap();
        let sender = UdpTransport::bind(&addr).unwrap();

        let dst = receiver.local_addr();
        sender.send_to(b"frame", &dst).unwrap();

        let mut buf = [0u8; 64];
        let mut received = None;
        for _ in 0..1000 {
            if let Some((len, src)) = receiver.recv_from(&mut buf).unwrap() {
                received = Some((len, src));
                break;
            }
            std::thread::yield_now();
        }

        let (len, src) = received.expect("datagram did not arrive on loopback");
        assert_eq!(&buf[..len], b"frame");
        assert_eq!(src.port(), sender.local_addr().port());
    }

    #[test]
    fn test_empty_socket_returns_none() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let transport = UdpTransport::bind(&addr).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(transport.recv_from(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_send_endpoint_binds_ephemeral_for_unicast() {
        let mem = OwnedBuffer::new(128);
        let endpoint = SendChannelEndpoint::new(
            0,
            channel("aqueduct:udp?endpoint=127.0.0.1:24325"),
            status_position(&mem),
        )
        .unwrap();

        assert!(endpoint.transport.local_addr().port() != 0);
        assert_eq!(endpoint.default_destination().unwrap().port(), 24325);
        assert_eq!(mem.buffer().get_i64(0), STATUS_ACTIVE);
    }

    #[test]
    fn test_receive_endpoint_binds_endpoint() {
        let mem = OwnedBuffer::new(128);
        let endpoint = ReceiveChannelEndpoint::new(
            0,
            channel("aqueduct:udp?endpoint=127.0.0.1:0"),
            status_position(&mem),
        )
        .unwrap();

        assert!(endpoint.transport.local_addr().port() != 0);
        assert_eq!(mem.buffer().get_i64(0), STATUS_ACTIVE);
    }
}
