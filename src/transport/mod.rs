//! [STUN]/[TURN] transport definitions.
//!
//! [STUN]: https://en.wikipedia.org/wiki/STUN
//! [TURN]: https://en.wikipedia.org/wiki/TURN

mod framing;
mod tcp;

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
};

use async_trait::async_trait;
use derive_more::with_trait::{Display, Error as StdError, From};
use tokio::net::UdpSocket;

use crate::{
    chandata::{self, ChannelData},
    message::{DecodeError, StunMessage},
};

pub use self::{
    framing::{Framing, WriteQueue},
    tcp::Server as TcpServer,
};

/// MTU used for UDP connections.
pub(crate) const INBOUND_MTU: usize = 1500;

/// Kind of a transport carrying [STUN]/[TURN] traffic.
///
/// [STUN]: https://en.wikipedia.org/wiki/STUN
/// [TURN]: https://en.wikipedia.org/wiki/TURN
#[derive(Clone, Copy, Debug, Default, Display, Eq, Hash, PartialEq)]
pub enum TransportType {
    /// UDP datagrams.
    #[display("UDP")]
    Udp,

    /// TCP stream.
    #[display("TCP")]
    Tcp,

    /// TLS over TCP.
    #[display("TLS")]
    Tls,

    /// Unknown or not yet assigned.
    #[default]
    #[display("NONE")]
    None,
}

impl TransportType {
    /// Indicates whether this [`TransportType`] is stream-oriented.
    #[must_use]
    pub const fn is_stream(self) -> bool {
        matches!(self, Self::Tcp | Self::Tls)
    }
}

/// Transport endpoint: a [`TransportType`] with a [`SocketAddr`].
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[display("{transport}:{addr}")]
pub struct StunTuple {
    /// [`TransportType`] of this endpoint.
    pub transport: TransportType,

    /// Address of this endpoint.
    pub addr: SocketAddr,
}

impl StunTuple {
    /// Creates a new [`StunTuple`].
    #[must_use]
    pub const fn new(transport: TransportType, addr: SocketAddr) -> Self {
        Self { transport, addr }
    }
}

impl Default for StunTuple {
    fn default() -> Self {
        Self {
            transport: TransportType::None,
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        }
    }
}

/// Parsed ingress [STUN]/[TURN] message.
///
/// [STUN]: https://en.wikipedia.org/wiki/STUN
/// [TURN]: https://en.wikipedia.org/wiki/TURN
#[derive(Debug)]
pub enum Request {
    /// [STUN Message].
    ///
    /// [STUN Message]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
    Message(Box<StunMessage>),

    /// [TURN ChannelData Message][1].
    ///
    /// [1]: https://datatracker.ietf.org/doc/html/rfc5766#section-11.4
    ChannelData(ChannelData),

    /// [STUN Message] which failed to decode.
    ///
    /// [STUN Message]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
    Malformed(DecodeError),

    /// Stream connection with the remote peer was closed.
    Disconnected,
}

impl Request {
    /// Decodes a single datagram (or stream frame) into a [`Request`].
    ///
    /// # Errors
    ///
    /// If the `buf` looks like a [`ChannelData`] message, but is malformed.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if ChannelData::is_channel_data(buf) {
            return Ok(Self::ChannelData(ChannelData::decode(buf)?));
        }
        Ok(match StunMessage::parse(buf) {
            Ok(msg) => Self::Message(Box::new(msg)),
            Err(e) => Self::Malformed(e),
        })
    }
}

/// Abstraction of [STUN]/[TURN] transport implementation.
///
/// [STUN]: https://en.wikipedia.org/wiki/STUN
/// [TURN]: https://en.wikipedia.org/wiki/TURN
#[async_trait]
pub trait Transport {
    /// Receives a [`Request`] datagram message.
    ///
    /// # Errors
    ///
    /// See the [`Error`] for details.
    async fn recv_from(&self) -> Result<(Request, SocketAddr), Error>;

    /// Sends `data` to the provided [`SocketAddr`].
    ///
    /// Stream transports only enqueue the `data`, preserving the order of
    /// writes to the same destination.
    ///
    /// # Errors
    ///
    /// See the [`Error`] for details.
    async fn send_to(
        &self,
        data: Vec<u8>,
        target: SocketAddr,
    ) -> Result<(), Error>;

    /// Returns the local [`SocketAddr`] of this [`Transport`].
    fn local_addr(&self) -> SocketAddr;

    /// Returns the [`TransportType`] of this [`Transport`].
    fn transport_type(&self) -> TransportType;

    /// Returns the [`Framing`] of messages written to this [`Transport`].
    fn framing(&self) -> Framing;

    /// Returns the local [`StunTuple`] of this [`Transport`].
    fn local_tuple(&self) -> StunTuple {
        StunTuple::new(self.transport_type(), self.local_addr())
    }
}

/// UDP [`Transport`].
#[derive(Debug)]
pub struct Udp {
    /// Underlying [`UdpSocket`].
    socket: UdpSocket,

    /// Local [`SocketAddr`] the `socket` is bound to.
    local_addr: SocketAddr,
}

impl Udp {
    /// Wraps the provided bound [`UdpSocket`].
    ///
    /// # Errors
    ///
    /// If the local address of the `socket` cannot be resolved.
    pub fn new(socket: UdpSocket) -> Result<Self, Error> {
        let local_addr = socket.local_addr()?;
        Ok(Self { socket, local_addr })
    }
}

#[async_trait]
impl Transport for Udp {
    async fn recv_from(&self) -> Result<(Request, SocketAddr), Error> {
        let mut buf = vec![0u8; INBOUND_MTU];
        let (n, addr) = self.socket.recv_from(&mut buf).await?;

        Ok((Request::decode(&buf[..n])?, addr))
    }

    async fn send_to(
        &self,
        data: Vec<u8>,
        target: SocketAddr,
    ) -> Result<(), Error> {
        Ok(self.socket.send_to(&data, target).await.map(drop)?)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Udp
    }

    fn framing(&self) -> Framing {
        Framing::None
    }
}

/// Possible errors of a [`Transport`].
#[derive(Debug, Display, From, Eq, PartialEq, StdError)]
pub enum Error {
    /// Tried to use a dead [`Transport`].
    #[display("Underlying TCP/UDP transport is dead")]
    TransportIsDead,

    /// Failed to decode message.
    #[display("Failed to decode STUN/TURN message: {_0}")]
    #[from]
    Decode(DecodeError),

    /// [TURN ChannelData][1] format error.
    ///
    /// [1]: https://datatracker.ietf.org/doc/html/rfc5766#section-11.4
    #[display("Malformed ChannelData: {_0}")]
    #[from]
    ChannelData(chandata::FormatError),

    /// I/O error of the [`Transport`].
    #[display("I/O error: {_0}")]
    #[from(io::Error, IoError)]
    Io(IoError),
}

/// [`io::Error`] implementing [`Eq`] and [`PartialEq`] by its [`kind`].
///
/// [`kind`]: io::Error::kind()
#[derive(Debug, Display, From, StdError)]
pub struct IoError(pub io::Error);

impl Eq for IoError {}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}
