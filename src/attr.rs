//! [STUN] and [TURN] attribute codepoints and value types.
//!
//! [STUN]: https://en.wikipedia.org/wiki/STUN
//! [TURN]: https://en.wikipedia.org/wiki/TURN

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use derive_more::with_trait::Display;

use crate::message::{DecodeError, MAGIC_COOKIE, TransactionId};

/// UDP protocol number according to [IANA].
///
/// [IANA]: https://tinyurl.com/iana-protocol-numbers
pub const PROTO_UDP: u8 = 17;

/// TCP protocol number according to [IANA].
///
/// [IANA]: https://tinyurl.com/iana-protocol-numbers
pub const PROTO_TCP: u8 = 6;

pub const MAPPED_ADDRESS: u16 = 0x0001;
pub const RESPONSE_ADDRESS: u16 = 0x0002;
pub const CHANGE_REQUEST: u16 = 0x0003;
pub const SOURCE_ADDRESS: u16 = 0x0004;
pub const CHANGED_ADDRESS: u16 = 0x0005;
pub const USERNAME: u16 = 0x0006;
pub const PASSWORD: u16 = 0x0007;
pub const MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ERROR_CODE: u16 = 0x0009;
pub const UNKNOWN_ATTRIBUTES: u16 = 0x000A;
pub const REFLECTED_FROM: u16 = 0x000B;
pub const CHANNEL_NUMBER: u16 = 0x000C;
pub const LIFETIME: u16 = 0x000D;
pub const BANDWIDTH: u16 = 0x0010;
pub const XOR_PEER_ADDRESS: u16 = 0x0012;
pub const DATA: u16 = 0x0013;
pub const REALM: u16 = 0x0014;
pub const NONCE: u16 = 0x0015;
pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
pub const REQUESTED_ADDRESS_FAMILY: u16 = 0x0017;
pub const EVEN_PORT: u16 = 0x0018;
pub const REQUESTED_TRANSPORT: u16 = 0x0019;
pub const DONT_FRAGMENT: u16 = 0x001A;
pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const RESERVATION_TOKEN: u16 = 0x0022;
pub const CONNECT_STAT: u16 = 0x0023;
pub const PRIORITY: u16 = 0x0024;
pub const USE_CANDIDATE: u16 = 0x0025;

/// Pre-RFC 5389 codepoint of `XOR-MAPPED-ADDRESS`, still sent by some
/// clients.
pub const XOR_MAPPED_ADDRESS_OLD: u16 = 0x8020;
pub const SOFTWARE: u16 = 0x8022;
pub const ALTERNATE_SERVER: u16 = 0x8023;
pub const FINGERPRINT: u16 = 0x8028;
pub const ICE_CONTROLLED: u16 = 0x8029;
pub const ICE_CONTROLLING: u16 = 0x802A;

/// Non-standard `SECONDARY-ADDRESS` extension.
pub const SECONDARY_ADDRESS: u16 = 0x8050;

/// Maximum length of `USERNAME` and `PASSWORD` values.
pub(crate) const MAX_USERNAME_LEN: usize = 512;

/// Maximum length of `REALM`, `NONCE`, `SOFTWARE` values and error reasons.
pub(crate) const MAX_TEXT_LEN: usize = 763;

/// Maximum number of `XOR-PEER-ADDRESS` attributes kept from one message.
pub(crate) const MAX_PEER_ADDRESSES: usize = 8;

/// `CHANGE-REQUEST` flag asking to respond from the alternate IP.
pub const CHANGE_IP: u32 = 0x04;

/// `CHANGE-REQUEST` flag asking to respond from the alternate port.
pub const CHANGE_PORT: u32 = 0x02;

/// Lowest [channel number][1] available for binding.
///
/// [1]: https://datatracker.ietf.org/doc/html/rfc5766#section-11
pub const CHANNEL_NUMBER_MIN: u16 = 0x4000;

/// Highest [channel number][1] available for binding.
///
/// [1]: https://datatracker.ietf.org/doc/html/rfc5766#section-11
pub const CHANNEL_NUMBER_MAX: u16 = 0x7FFF;

/// Indicates whether the provided `number` may be used for a channel binding.
#[must_use]
pub const fn is_valid_channel_number(number: u16) -> bool {
    number >= CHANNEL_NUMBER_MIN && number <= CHANNEL_NUMBER_MAX
}

/// Family byte of an IPv4 address attribute.
const FAMILY_IPV4: u8 = 0x01;

/// Family byte of an IPv6 address attribute.
const FAMILY_IPV6: u8 = 0x02;

/// `ERROR-CODE` attribute value.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
#[display("{code} {reason}")]
pub struct ErrorCode {
    /// Three-digit error code (`300..=699`).
    pub code: u16,

    /// Human-readable reason phrase.
    pub reason: String,
}

impl ErrorCode {
    /// Creates a new [`ErrorCode`].
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self { code, reason: reason.into() }
    }

    /// Returns the hundreds digit of this [`ErrorCode`].
    #[must_use]
    pub const fn class(&self) -> u8 {
        #[expect(clippy::as_conversions, reason = "always less than 8")]
        let class = ((self.code / 100) & 0x07) as u8;
        class
    }

    /// Returns the remainder of this [`ErrorCode`] modulo 100.
    #[must_use]
    pub const fn number(&self) -> u8 {
        #[expect(clippy::as_conversions, reason = "always less than 100")]
        let number = (self.code % 100) as u8;
        number
    }
}

/// `REQUESTED-ADDRESS-FAMILY` attribute value.
///
/// See [RFC 6156](https://datatracker.ietf.org/doc/html/rfc6156#section-4.1.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressFamily {
    /// IPv4 family.
    V4,

    /// IPv6 family.
    V6,
}

impl AddressFamily {
    /// Returns the [`AddressFamily`] of the provided [`SocketAddr`].
    #[must_use]
    pub const fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::V4,
            SocketAddr::V6(_) => Self::V6,
        }
    }

    /// Returns the wire representation of this [`AddressFamily`].
    pub(crate) const fn to_byte(self) -> u8 {
        match self {
            Self::V4 => FAMILY_IPV4,
            Self::V6 => FAMILY_IPV6,
        }
    }

    /// Parses an [`AddressFamily`] from its wire representation.
    pub(crate) const fn from_byte(b: u8) -> Option<Self> {
        match b {
            FAMILY_IPV4 => Some(Self::V4),
            FAMILY_IPV6 => Some(Self::V6),
            _ => None,
        }
    }
}

/// `EVEN-PORT` attribute value.
///
/// See [RFC 5766](https://datatracker.ietf.org/doc/html/rfc5766#section-14.6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EvenPort {
    /// Whether the next-higher port should be reserved as well.
    pub reserve_next: bool,
}

/// Decodes a plain address attribute value.
pub(crate) fn decode_address(
    attr: u16,
    value: &[u8],
) -> Result<SocketAddr, DecodeError> {
    let (port, ip) = match value {
        [_, FAMILY_IPV4, p0, p1, a, b, c, d] => (
            u16::from_be_bytes([*p0, *p1]),
            IpAddr::V4(Ipv4Addr::new(*a, *b, *c, *d)),
        ),
        [_, FAMILY_IPV6, p0, p1, rest @ ..] if rest.len() == 16 => {
            let mut octets = [0; 16];
            octets.copy_from_slice(rest);
            (u16::from_be_bytes([*p0, *p1]), IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => return Err(DecodeError::InvalidAttribute(attr)),
    };

    Ok(SocketAddr::new(ip, port))
}

/// Encodes a plain address attribute value.
pub(crate) fn encode_address(addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.push(0);
    out.push(AddressFamily::of(addr).to_byte());
    out.extend_from_slice(&addr.port().to_be_bytes());
    match addr.ip() {
        IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out
}

/// XORs the provided [`SocketAddr`] with the magic cookie and the
/// [`TransactionId`].
///
/// Applying it twice yields the original address.
#[must_use]
pub fn xor_address(addr: SocketAddr, tid: &TransactionId) -> SocketAddr {
    #[expect(clippy::as_conversions, reason = "takes the high 16 bits")]
    let port = addr.port() ^ ((MAGIC_COOKIE >> 16) as u16);
    let ip = match addr.ip() {
        IpAddr::V4(ip) => IpAddr::V4(Ipv4Addr::from(
            u32::from(ip) ^ MAGIC_COOKIE,
        )),
        IpAddr::V6(ip) => {
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(tid.as_bytes());
            let mut octets = ip.octets();
            for (o, m) in octets.iter_mut().zip(mask.iter()) {
                *o ^= m;
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };
    SocketAddr::new(ip, port)
}

/// Decodes a XOR-ed address attribute value.
pub(crate) fn decode_xor_address(
    attr: u16,
    value: &[u8],
    tid: &TransactionId,
) -> Result<SocketAddr, DecodeError> {
    decode_address(attr, value).map(|a| xor_address(a, tid))
}

/// Encodes a XOR-ed address attribute value.
pub(crate) fn encode_xor_address(
    addr: &SocketAddr,
    tid: &TransactionId,
) -> Vec<u8> {
    encode_address(&xor_address(*addr, tid))
}
