//! [STUN] message codec.
//!
//! [STUN]: https://datatracker.ietf.org/doc/html/rfc5389#section-6

use std::{fmt, net::SocketAddr};

use bytes::Bytes;
use derive_more::with_trait::{Display, Error as StdError};

use crate::{
    attr::{
        self, AddressFamily, ErrorCode, EvenPort, MAX_PEER_ADDRESSES,
        MAX_TEXT_LEN, MAX_USERNAME_LEN,
    },
    chandata::nearest_padded_value_length,
    integrity::{self, IntegrityKey},
    transport::StunTuple,
};

/// Fixed value of the [magic cookie][1] field.
///
/// [1]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Size of a [STUN] message header.
///
/// [STUN]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
pub const HEADER_LEN: usize = 20;

/// Size of an attribute header (type + length).
const ATTR_HEADER_LEN: usize = 4;

/// Size of a `MESSAGE-INTEGRITY` value.
pub(crate) const INTEGRITY_LEN: usize = 20;

/// Size of a `FINGERPRINT` value.
const FINGERPRINT_LEN: usize = 4;

/// Mask of the class bits inside a message type.
const CLASS_MASK: u16 = 0x0110;

/// Possible errors of [`StunMessage::parse()`].
#[derive(Clone, Debug, Display, Eq, PartialEq, StdError)]
pub enum DecodeError {
    /// Buffer is shorter than a [STUN] header.
    ///
    /// [STUN]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
    #[display("buffer is too short for a STUN header")]
    TooShort,

    /// Header length field doesn't match the buffer size.
    #[display("message length doesn't match the buffer size")]
    LengthMismatch,

    /// Attribute value runs past the end of the message.
    #[display("attribute overflows the message")]
    AttributeOverflow,

    /// Attribute value of the provided type is malformed.
    #[display("malformed attribute 0x{_0:04X}")]
    InvalidAttribute(#[error(not(source))] u16),

    /// Message contains comprehension-required attributes this codec doesn't
    /// know.
    #[display("unknown comprehension-required attributes: {types:?}")]
    UnknownAttributes {
        /// Header of the rejected message, so it can be answered.
        header: Header,

        /// Types of the unknown attributes.
        types: Vec<u16>,
    },
}

/// [Class][1] of a [STUN] message.
///
/// [1]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
/// [STUN]: https://datatracker.ietf.org/doc/html/rfc5389
#[derive(Clone, Copy, Debug, Default, Display, Eq, Hash, PartialEq)]
pub enum Class {
    /// Request expecting a response.
    #[default]
    Request,

    /// Indication, never answered.
    Indication,

    /// Success response.
    SuccessResponse,

    /// Error response.
    ErrorResponse,
}

impl Class {
    /// Returns the class bits of this [`Class`].
    const fn bits(self) -> u16 {
        match self {
            Self::Request => 0x0000,
            Self::Indication => 0x0010,
            Self::SuccessResponse => 0x0100,
            Self::ErrorResponse => 0x0110,
        }
    }

    /// Extracts the [`Class`] out of a message type.
    const fn from_type(typ: u16) -> Self {
        match typ & CLASS_MASK {
            0x0000 => Self::Request,
            0x0010 => Self::Indication,
            0x0100 => Self::SuccessResponse,
            _ => Self::ErrorResponse,
        }
    }
}

/// [STUN]/[TURN] method of a message.
///
/// [STUN]: https://datatracker.ietf.org/doc/html/rfc5389#section-18.1
/// [TURN]: https://datatracker.ietf.org/doc/html/rfc5766#section-13
#[derive(Clone, Copy, Debug, Default, Display, Eq, Hash, PartialEq)]
pub enum Method {
    #[default]
    Binding,
    SharedSecret,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,

    /// Method this codec doesn't handle.
    #[display("Unknown(0x{_0:03X})")]
    Unknown(u16),
}

impl Method {
    /// Returns the 12-bit code of this [`Method`].
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Binding => 0x001,
            Self::SharedSecret => 0x002,
            Self::Allocate => 0x003,
            Self::Refresh => 0x004,
            Self::Send => 0x006,
            Self::Data => 0x007,
            Self::CreatePermission => 0x008,
            Self::ChannelBind => 0x009,
            Self::Unknown(code) => code & 0x0FFF,
        }
    }

    /// Resolves a 12-bit method code.
    #[must_use]
    pub const fn from_code(code: u16) -> Self {
        match code {
            0x001 => Self::Binding,
            0x002 => Self::SharedSecret,
            0x003 => Self::Allocate,
            0x004 => Self::Refresh,
            0x006 => Self::Send,
            0x007 => Self::Data,
            0x008 => Self::CreatePermission,
            0x009 => Self::ChannelBind,
            c => Self::Unknown(c),
        }
    }
}

/// Combines a [`Method`] and a [`Class`] into a message type.
///
/// Method bits `M0-M3` occupy type bits `0-3`, `M4-M6` bits `5-7` and
/// `M7-M11` bits `9-13`, leaving room for the class bits.
const fn message_type(method: Method, class: Class) -> u16 {
    let m = method.code();
    (m & 0x000F) | ((m & 0x0070) << 1) | ((m & 0x0F80) << 2) | class.bits()
}

/// Extracts the [`Method`] out of a message type.
const fn method_from_type(typ: u16) -> Method {
    Method::from_code(
        (typ & 0x000F) | ((typ & 0x00E0) >> 1) | ((typ & 0x3E00) >> 2),
    )
}

/// 96-bit [transaction ID][1] of a [STUN] message.
///
/// [1]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
/// [STUN]: https://datatracker.ietf.org/doc/html/rfc5389
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Wraps the provided raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Generates a new random [`TransactionId`].
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Returns raw bytes of this [`TransactionId`].
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", hex::encode(self.0))
    }
}

/// Decoded header of a [STUN] message.
///
/// [STUN]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Header {
    /// [`Class`] of the message.
    pub class: Class,

    /// [`Method`] of the message.
    pub method: Method,

    /// [`TransactionId`] of the message.
    pub transaction_id: TransactionId,

    /// First four transaction bytes of an [RFC 3489] message, which carries
    /// no magic cookie.
    ///
    /// [RFC 3489]: https://datatracker.ietf.org/doc/html/rfc3489
    pub legacy_cookie: Option<u32>,
}

/// Parsed or to-be-encoded [STUN]/[TURN] message.
///
/// Every attribute is stored as an owned value, so a parsed message never
/// borrows the receive buffer.
///
/// [STUN]: https://datatracker.ietf.org/doc/html/rfc5389
/// [TURN]: https://datatracker.ietf.org/doc/html/rfc5766
#[derive(Clone, Debug, Default)]
pub struct StunMessage {
    pub class: Class,
    pub method: Method,
    pub transaction_id: TransactionId,

    /// Non-magic cookie value of an [RFC 3489] message.
    ///
    /// [RFC 3489]: https://datatracker.ietf.org/doc/html/rfc3489
    pub legacy_cookie: Option<u32>,

    /// Local endpoint the message was received on (or is sent from).
    pub local_tuple: StunTuple,

    /// Remote endpoint the message was received from (or is sent to).
    pub remote_tuple: StunTuple,

    pub mapped_address: Option<SocketAddr>,
    pub response_address: Option<SocketAddr>,
    pub change_request: Option<u32>,
    pub source_address: Option<SocketAddr>,
    pub changed_address: Option<SocketAddr>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub message_integrity: Option<[u8; INTEGRITY_LEN]>,
    pub error_code: Option<ErrorCode>,
    pub unknown_attributes: Vec<u16>,
    pub reflected_from: Option<SocketAddr>,
    pub realm: Option<String>,
    pub nonce: Option<String>,
    pub xor_mapped_address: Option<SocketAddr>,
    pub software: Option<String>,
    pub alternate_server: Option<SocketAddr>,
    pub secondary_address: Option<SocketAddr>,

    pub ice_priority: Option<u32>,
    pub ice_use_candidate: bool,
    pub ice_controlled: Option<u64>,
    pub ice_controlling: Option<u64>,

    pub channel_number: Option<u16>,
    pub lifetime: Option<u32>,
    pub bandwidth: Option<u32>,

    /// Peer addresses, in the order they appeared (at most 8 are kept).
    pub xor_peer_addresses: Vec<SocketAddr>,
    pub data: Option<Bytes>,
    pub xor_relayed_address: Option<SocketAddr>,
    pub requested_address_family: Option<AddressFamily>,
    pub even_port: Option<EvenPort>,

    /// Protocol number of the `REQUESTED-TRANSPORT` attribute.
    pub requested_transport: Option<u8>,
    pub dont_fragment: bool,
    pub reservation_token: Option<u64>,
    pub connect_stat: Option<u32>,

    /// Parsed `FINGERPRINT` value.
    ///
    /// When set on an outgoing message, [`StunMessage::encode()`] appends a
    /// freshly computed fingerprint, regardless of the stored value.
    pub fingerprint: Option<u32>,

    /// Key to sign an outgoing message with.
    pub hmac_key: Option<IntegrityKey>,

    /// Value of the header length field covering `MESSAGE-INTEGRITY`, as
    /// received.
    pub integrity_msg_len: Option<usize>,

    /// Raw bytes of a parsed message.
    pub raw: Bytes,
}

/// Stores the decoded value into an empty `slot`, keeping the first
/// occurrence of a duplicated attribute.
fn set_once<T>(
    slot: &mut Option<T>,
    decode: impl FnOnce() -> Result<T, DecodeError>,
) -> Result<(), DecodeError> {
    if slot.is_none() {
        *slot = Some(decode()?);
    }
    Ok(())
}

/// Decodes a big-endian `u32` attribute value.
fn decode_u32(typ: u16, v: &[u8]) -> Result<u32, DecodeError> {
    <[u8; 4]>::try_from(v)
        .map(u32::from_be_bytes)
        .map_err(|_| DecodeError::InvalidAttribute(typ))
}

/// Decodes a big-endian `u64` attribute value.
fn decode_u64(typ: u16, v: &[u8]) -> Result<u64, DecodeError> {
    <[u8; 8]>::try_from(v)
        .map(u64::from_be_bytes)
        .map_err(|_| DecodeError::InvalidAttribute(typ))
}

/// Decodes a UTF-8 attribute value not longer than `max` bytes.
fn decode_text(typ: u16, v: &[u8], max: usize) -> Result<String, DecodeError> {
    if v.len() > max {
        return Err(DecodeError::InvalidAttribute(typ));
    }
    String::from_utf8(v.to_vec()).map_err(|_| DecodeError::InvalidAttribute(typ))
}

/// Decodes an `ERROR-CODE` attribute value.
fn decode_error_code(v: &[u8]) -> Result<ErrorCode, DecodeError> {
    let [_, _, class, number, reason @ ..] = v else {
        return Err(DecodeError::InvalidAttribute(attr::ERROR_CODE));
    };
    let code = u16::from(class & 0x07) * 100 + u16::from(*number);
    if !(300..700).contains(&code) || *number > 99 {
        return Err(DecodeError::InvalidAttribute(attr::ERROR_CODE));
    }
    let reason = decode_text(attr::ERROR_CODE, reason, MAX_TEXT_LEN)?;

    Ok(ErrorCode { code, reason })
}

/// Appends a single TLV attribute to `out`, zero-padded to 4 bytes.
fn put_attr(out: &mut Vec<u8>, typ: u16, value: &[u8]) {
    // Values are bounded by the datagram size, so they always fit.
    let len = u16::try_from(value.len()).unwrap_or(u16::MAX);
    out.extend_from_slice(&typ.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value);
    out.resize(out.len() + nearest_padded_value_length(value.len()) - value.len(), 0);
}

/// Writes the message length field of the header in `out`.
fn set_length(out: &mut [u8], len: usize) {
    let len = u16::try_from(len).unwrap_or(u16::MAX).to_be_bytes();
    if let Some(field) = out.get_mut(2..4) {
        field.copy_from_slice(&len);
    }
}

impl StunMessage {
    /// Creates a new empty [`StunMessage`].
    #[must_use]
    pub fn new(class: Class, method: Method, transaction_id: TransactionId) -> Self {
        Self { class, method, transaction_id, ..Self::default() }
    }

    /// Creates a new [`Class::Request`] with a random [`TransactionId`].
    #[must_use]
    pub fn request(method: Method) -> Self {
        Self::new(Class::Request, method, TransactionId::random())
    }

    /// Creates an empty response of the provided [`Class`] to the provided
    /// `request`.
    ///
    /// Endpoints are swapped so the response is addressed back to the
    /// request's sender.
    #[must_use]
    pub fn response_to(request: &Self, class: Class) -> Self {
        Self {
            class,
            method: request.method,
            transaction_id: request.transaction_id,
            legacy_cookie: request.legacy_cookie,
            local_tuple: request.local_tuple,
            remote_tuple: request.remote_tuple,
            ..Self::default()
        }
    }

    /// Returns the [`Header`] of this [`StunMessage`].
    #[must_use]
    pub const fn header(&self) -> Header {
        Header {
            class: self.class,
            method: self.method,
            transaction_id: self.transaction_id,
            legacy_cookie: self.legacy_cookie,
        }
    }

    /// Indicates whether this [`StunMessage`] carries the [RFC 5389] magic
    /// cookie.
    ///
    /// [RFC 5389]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
    #[must_use]
    pub const fn has_magic_cookie(&self) -> bool {
        self.legacy_cookie.is_none()
    }

    /// Sets the `ERROR-CODE` attribute.
    pub fn set_error_code(&mut self, code: u16, reason: &str) {
        self.error_code = Some(ErrorCode::new(code, reason));
    }

    /// Indicates whether the provided buffer looks like a [STUN] message.
    ///
    /// [STUN]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
    #[must_use]
    pub fn is_stun(buf: &[u8]) -> bool {
        buf.len() >= HEADER_LEN && buf.first().is_some_and(|b| b & 0xC0 == 0)
    }

    /// Parses the provided buffer into a [`StunMessage`].
    ///
    /// # Errors
    ///
    /// With a [`DecodeError`] if the buffer is not a well-formed message, or
    /// carries unknown comprehension-required attributes.
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        let Some((hdr, mut rest)) = buf.split_first_chunk::<HEADER_LEN>() else {
            return Err(DecodeError::TooShort);
        };
        let typ = u16::from_be_bytes([hdr[0], hdr[1]]);
        let msg_len = usize::from(u16::from_be_bytes([hdr[2], hdr[3]]));
        if msg_len + HEADER_LEN != buf.len() {
            return Err(DecodeError::LengthMismatch);
        }
        let cookie = u32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
        let mut tid = [0; 12];
        tid.copy_from_slice(&hdr[8..HEADER_LEN]);

        let mut msg = Self {
            class: Class::from_type(typ),
            method: method_from_type(typ),
            transaction_id: TransactionId(tid),
            legacy_cookie: (cookie != MAGIC_COOKIE).then_some(cookie),
            raw: Bytes::copy_from_slice(buf),
            ..Self::default()
        };

        let mut unknown = Vec::new();
        let mut offset = HEADER_LEN;
        while !rest.is_empty() {
            let Some((tlv, body)) = rest.split_first_chunk::<ATTR_HEADER_LEN>()
            else {
                return Err(DecodeError::AttributeOverflow);
            };
            let attr_type = u16::from_be_bytes([tlv[0], tlv[1]]);
            let attr_len = usize::from(u16::from_be_bytes([tlv[2], tlv[3]]));
            let padded = nearest_padded_value_length(attr_len);
            if padded > body.len() {
                return Err(DecodeError::AttributeOverflow);
            }
            let value = &body[..attr_len];
            rest = &body[padded..];
            offset += ATTR_HEADER_LEN + padded;

            if msg.message_integrity.is_some() && attr_type != attr::FINGERPRINT {
                log::trace!(
                    "Ignoring attribute 0x{attr_type:04X} after \
                     MESSAGE-INTEGRITY",
                );
                continue;
            }
            if attr_type == attr::MESSAGE_INTEGRITY {
                msg.integrity_msg_len = Some(offset - HEADER_LEN);
            }
            if !msg.decode_attribute(attr_type, value)? {
                if attr_type <= 0x7FFF {
                    unknown.push(attr_type);
                } else {
                    log::debug!(
                        "Skipping unknown optional attribute 0x{attr_type:04X}",
                    );
                }
            }
        }

        if !unknown.is_empty() {
            return Err(DecodeError::UnknownAttributes {
                header: msg.header(),
                types: unknown,
            });
        }

        Ok(msg)
    }

    /// Decodes a single attribute value into this [`StunMessage`].
    ///
    /// Returns `false` if the attribute type is unknown.
    fn decode_attribute(
        &mut self,
        typ: u16,
        v: &[u8],
    ) -> Result<bool, DecodeError> {
        let tid = self.transaction_id;
        match typ {
            attr::MAPPED_ADDRESS => {
                set_once(&mut self.mapped_address, || attr::decode_address(typ, v))
            }
            attr::RESPONSE_ADDRESS => set_once(&mut self.response_address, || {
                attr::decode_address(typ, v)
            }),
            attr::CHANGE_REQUEST => {
                set_once(&mut self.change_request, || decode_u32(typ, v))
            }
            attr::SOURCE_ADDRESS => {
                set_once(&mut self.source_address, || attr::decode_address(typ, v))
            }
            attr::CHANGED_ADDRESS => set_once(&mut self.changed_address, || {
                attr::decode_address(typ, v)
            }),
            attr::USERNAME => set_once(&mut self.username, || {
                decode_text(typ, v, MAX_USERNAME_LEN)
            }),
            attr::PASSWORD => set_once(&mut self.password, || {
                decode_text(typ, v, MAX_USERNAME_LEN)
            }),
            attr::MESSAGE_INTEGRITY => set_once(&mut self.message_integrity, || {
                <[u8; INTEGRITY_LEN]>::try_from(v)
                    .map_err(|_| DecodeError::InvalidAttribute(typ))
            }),
            attr::ERROR_CODE => {
                set_once(&mut self.error_code, || decode_error_code(v))
            }
            attr::UNKNOWN_ATTRIBUTES => {
                if v.len() % 2 != 0 {
                    return Err(DecodeError::InvalidAttribute(typ));
                }
                if self.unknown_attributes.is_empty() {
                    self.unknown_attributes = v
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect();
                }
                Ok(())
            }
            attr::REFLECTED_FROM => set_once(&mut self.reflected_from, || {
                attr::decode_address(typ, v)
            }),
            attr::REALM => {
                set_once(&mut self.realm, || decode_text(typ, v, MAX_TEXT_LEN))
            }
            attr::NONCE => {
                set_once(&mut self.nonce, || decode_text(typ, v, MAX_TEXT_LEN))
            }
            attr::XOR_MAPPED_ADDRESS | attr::XOR_MAPPED_ADDRESS_OLD => {
                set_once(&mut self.xor_mapped_address, || {
                    attr::decode_xor_address(typ, v, &tid)
                })
            }
            attr::SOFTWARE => set_once(&mut self.software, || {
                decode_text(typ, v, MAX_TEXT_LEN)
            }),
            attr::ALTERNATE_SERVER => set_once(&mut self.alternate_server, || {
                attr::decode_address(typ, v)
            }),
            attr::SECONDARY_ADDRESS => {
                set_once(&mut self.secondary_address, || {
                    attr::decode_address(typ, v)
                })
            }
            attr::PRIORITY => {
                set_once(&mut self.ice_priority, || decode_u32(typ, v))
            }
            attr::USE_CANDIDATE => {
                self.ice_use_candidate = true;
                Ok(())
            }
            attr::ICE_CONTROLLED => {
                set_once(&mut self.ice_controlled, || decode_u64(typ, v))
            }
            attr::ICE_CONTROLLING => {
                set_once(&mut self.ice_controlling, || decode_u64(typ, v))
            }
            attr::CHANNEL_NUMBER => set_once(&mut self.channel_number, || {
                decode_u32(typ, v).map(|n| {
                    #[expect(clippy::as_conversions, reason = "high 16 bits")]
                    let num = (n >> 16) as u16;
                    num
                })
            }),
            attr::LIFETIME => {
                set_once(&mut self.lifetime, || decode_u32(typ, v))
            }
            attr::BANDWIDTH => {
                set_once(&mut self.bandwidth, || decode_u32(typ, v))
            }
            attr::XOR_PEER_ADDRESS => {
                let addr = attr::decode_xor_address(typ, v, &tid)?;
                if self.xor_peer_addresses.len() < MAX_PEER_ADDRESSES {
                    self.xor_peer_addresses.push(addr);
                } else {
                    log::debug!("Dropping excess XOR-PEER-ADDRESS {addr}");
                }
                Ok(())
            }
            attr::DATA => {
                set_once(&mut self.data, || Ok(Bytes::copy_from_slice(v)))
            }
            attr::XOR_RELAYED_ADDRESS => {
                set_once(&mut self.xor_relayed_address, || {
                    attr::decode_xor_address(typ, v, &tid)
                })
            }
            attr::REQUESTED_ADDRESS_FAMILY => {
                set_once(&mut self.requested_address_family, || {
                    let family = match v {
                        [family, _, _, _] => AddressFamily::from_byte(*family),
                        _ => None,
                    };
                    family.ok_or(DecodeError::InvalidAttribute(typ))
                })
            }
            attr::EVEN_PORT => set_once(&mut self.even_port, || {
                v.first()
                    .map(|b| EvenPort { reserve_next: b & 0x80 != 0 })
                    .ok_or(DecodeError::InvalidAttribute(typ))
            }),
            attr::REQUESTED_TRANSPORT => {
                set_once(&mut self.requested_transport, || match v {
                    [proto, _, _, _] => Ok(*proto),
                    _ => Err(DecodeError::InvalidAttribute(typ)),
                })
            }
            attr::DONT_FRAGMENT => {
                self.dont_fragment = true;
                Ok(())
            }
            attr::RESERVATION_TOKEN => {
                set_once(&mut self.reservation_token, || decode_u64(typ, v))
            }
            attr::CONNECT_STAT => {
                set_once(&mut self.connect_stat, || decode_u32(typ, v))
            }
            attr::FINGERPRINT => {
                set_once(&mut self.fingerprint, || decode_u32(typ, v))
            }
            _ => return Ok(false),
        }?;
        Ok(true)
    }

    /// Encodes this [`StunMessage`] into bytes.
    ///
    /// `MESSAGE-INTEGRITY` is appended when [`StunMessage::hmac_key`] is set,
    /// and `FINGERPRINT` when [`StunMessage::fingerprint`] is set.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(
            &message_type(self.method, self.class).to_be_bytes(),
        );
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(
            &self.legacy_cookie.unwrap_or(MAGIC_COOKIE).to_be_bytes(),
        );
        out.extend_from_slice(self.transaction_id.as_bytes());

        self.encode_attributes(&mut out);
        let len = out.len() - HEADER_LEN;
        set_length(&mut out, len);

        if let Some(key) = &self.hmac_key {
            let len =
                out.len() - HEADER_LEN + ATTR_HEADER_LEN + INTEGRITY_LEN;
            set_length(&mut out, len);
            let mac = integrity::compute_hmac(key, &out);
            put_attr(&mut out, attr::MESSAGE_INTEGRITY, &mac);
        }
        if self.fingerprint.is_some() {
            let len =
                out.len() - HEADER_LEN + ATTR_HEADER_LEN + FINGERPRINT_LEN;
            set_length(&mut out, len);
            let crc = integrity::fingerprint(&out);
            put_attr(&mut out, attr::FINGERPRINT, &crc.to_be_bytes());
        }

        out
    }

    /// Encodes this [`StunMessage`] behind a 4-byte framing header: the
    /// channel number and the big-endian length of the message.
    ///
    /// [STUN] messages are framed with channel `0`.
    ///
    /// [STUN]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
    #[must_use]
    pub fn encode_framed(&self, channel: u16) -> Vec<u8> {
        let msg = self.encode();
        let len = u16::try_from(msg.len()).unwrap_or(u16::MAX);
        let mut out = Vec::with_capacity(msg.len() + 4);
        out.extend_from_slice(&channel.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&msg);
        out
    }

    /// Appends all the present attributes, in their canonical order.
    fn encode_attributes(&self, out: &mut Vec<u8>) {
        let tid = &self.transaction_id;
        let plain = [
            (attr::MAPPED_ADDRESS, self.mapped_address),
            (attr::RESPONSE_ADDRESS, self.response_address),
        ];
        for (typ, addr) in plain {
            if let Some(a) = addr {
                put_attr(out, typ, &attr::encode_address(&a));
            }
        }
        if let Some(flags) = self.change_request {
            put_attr(out, attr::CHANGE_REQUEST, &flags.to_be_bytes());
        }
        for (typ, addr) in [
            (attr::SOURCE_ADDRESS, self.source_address),
            (attr::CHANGED_ADDRESS, self.changed_address),
        ] {
            if let Some(a) = addr {
                put_attr(out, typ, &attr::encode_address(&a));
            }
        }
        if let Some(name) = &self.username {
            put_attr(out, attr::USERNAME, name.as_bytes());
        }
        if let Some(pass) = &self.password {
            put_attr(out, attr::PASSWORD, pass.as_bytes());
        }
        if let Some(e) = &self.error_code {
            let mut v = vec![0, 0, e.class(), e.number()];
            v.extend_from_slice(e.reason.as_bytes());
            put_attr(out, attr::ERROR_CODE, &v);
        }
        if !self.unknown_attributes.is_empty() {
            let v: Vec<u8> = self
                .unknown_attributes
                .iter()
                .flat_map(|t| t.to_be_bytes())
                .collect();
            put_attr(out, attr::UNKNOWN_ATTRIBUTES, &v);
        }
        if let Some(a) = self.reflected_from {
            put_attr(out, attr::REFLECTED_FROM, &attr::encode_address(&a));
        }
        if let Some(realm) = &self.realm {
            put_attr(out, attr::REALM, realm.as_bytes());
        }
        if let Some(nonce) = &self.nonce {
            put_attr(out, attr::NONCE, nonce.as_bytes());
        }
        if let Some(a) = self.xor_mapped_address {
            put_attr(
                out,
                attr::XOR_MAPPED_ADDRESS,
                &attr::encode_xor_address(&a, tid),
            );
        }
        if let Some(software) = &self.software {
            put_attr(out, attr::SOFTWARE, software.as_bytes());
        }
        for (typ, addr) in [
            (attr::ALTERNATE_SERVER, self.alternate_server),
            (attr::SECONDARY_ADDRESS, self.secondary_address),
        ] {
            if let Some(a) = addr {
                put_attr(out, typ, &attr::encode_address(&a));
            }
        }

        if let Some(p) = self.ice_priority {
            put_attr(out, attr::PRIORITY, &p.to_be_bytes());
        }
        if self.ice_use_candidate {
            put_attr(out, attr::USE_CANDIDATE, &[]);
        }
        if let Some(t) = self.ice_controlled {
            put_attr(out, attr::ICE_CONTROLLED, &t.to_be_bytes());
        }
        if let Some(t) = self.ice_controlling {
            put_attr(out, attr::ICE_CONTROLLING, &t.to_be_bytes());
        }

        if let Some(n) = self.channel_number {
            put_attr(out, attr::CHANNEL_NUMBER, &(u32::from(n) << 16).to_be_bytes());
        }
        if let Some(l) = self.lifetime {
            put_attr(out, attr::LIFETIME, &l.to_be_bytes());
        }
        if let Some(b) = self.bandwidth {
            put_attr(out, attr::BANDWIDTH, &b.to_be_bytes());
        }
        for a in &self.xor_peer_addresses {
            put_attr(out, attr::XOR_PEER_ADDRESS, &attr::encode_xor_address(a, tid));
        }
        if let Some(data) = &self.data {
            put_attr(out, attr::DATA, data);
        }
        if let Some(a) = self.xor_relayed_address {
            put_attr(
                out,
                attr::XOR_RELAYED_ADDRESS,
                &attr::encode_xor_address(&a, tid),
            );
        }
        if let Some(family) = self.requested_address_family {
            put_attr(
                out,
                attr::REQUESTED_ADDRESS_FAMILY,
                &[family.to_byte(), 0, 0, 0],
            );
        }
        if let Some(even) = self.even_port {
            put_attr(
                out,
                attr::EVEN_PORT,
                &[if even.reserve_next { 0x80 } else { 0 }],
            );
        }
        if let Some(proto) = self.requested_transport {
            put_attr(out, attr::REQUESTED_TRANSPORT, &[proto, 0, 0, 0]);
        }
        if self.dont_fragment {
            put_attr(out, attr::DONT_FRAGMENT, &[]);
        }
        if let Some(token) = self.reservation_token {
            put_attr(out, attr::RESERVATION_TOKEN, &token.to_be_bytes());
        }
        if let Some(stat) = self.connect_stat {
            put_attr(out, attr::CONNECT_STAT, &stat.to_be_bytes());
        }
    }
}


#[cfg(test)]
mod message_test {
    use std::net::SocketAddr;

    use super::{vectors, *};

    fn decode_hex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn parses_rfc5769_request() {
        let msg = StunMessage::parse(&decode_hex(vectors::REQUEST)).unwrap();

        assert_eq!(msg.class, Class::Request);
        assert_eq!(msg.method, Method::Binding);
        assert!(msg.has_magic_cookie());
        assert_eq!(
            msg.transaction_id.as_bytes(),
            &decode_hex("b7e7a701bc34d686fa87dfae")[..],
        );
        assert_eq!(msg.software.as_deref(), Some("STUN test client"));
        assert_eq!(msg.ice_priority, Some(0x6e00_01ff));
        assert_eq!(msg.ice_controlled, Some(0x932f_f9b1_5126_3b36));
        assert_eq!(msg.username.as_deref(), Some("evtj:h6vY"));
        assert_eq!(msg.fingerprint, Some(0xe57a_3bcf));
        assert_eq!(msg.integrity_msg_len, Some(0x50));
    }

    #[test]
    fn parses_rfc5769_responses() {
        let v4 = StunMessage::parse(&decode_hex(vectors::RESPONSE_IPV4)).unwrap();
        assert_eq!(v4.class, Class::SuccessResponse);
        assert_eq!(v4.software.as_deref(), Some("test vector"));
        assert_eq!(
            v4.xor_mapped_address,
            Some("192.0.2.1:32853".parse().unwrap()),
        );

        let v6 = StunMessage::parse(&decode_hex(vectors::RESPONSE_IPV6)).unwrap();
        assert_eq!(
            v6.xor_mapped_address,
            Some(
                "[2001:db8:1234:5678:11:2233:4455:6677]:32853"
                    .parse()
                    .unwrap(),
            ),
        );
    }

    #[test]
    fn parses_rfc5769_long_term_request() {
        let msg =
            StunMessage::parse(&decode_hex(vectors::LONG_TERM_REQUEST)).unwrap();

        assert_eq!(msg.username.as_deref(), Some("マトリックス"));
        assert_eq!(msg.nonce.as_deref(), Some("f//499k954d6OL34oL9FSTvy64sA"));
        assert_eq!(msg.realm.as_deref(), Some("example.org"));
        assert!(msg.message_integrity.is_some());
        assert_eq!(msg.fingerprint, None);
    }

    #[test]
    fn encodes_method_and_class_bits() {
        let tid = TransactionId::new([7; 12]);
        for (method, class, typ) in [
            (Method::Binding, Class::Request, 0x0001),
            (Method::Binding, Class::SuccessResponse, 0x0101),
            (Method::Allocate, Class::ErrorResponse, 0x0113),
            (Method::Send, Class::Indication, 0x0016),
            (Method::ChannelBind, Class::SuccessResponse, 0x0109),
        ] {
            let bytes = StunMessage::new(class, method, tid).encode();
            assert_eq!(u16::from_be_bytes([bytes[0], bytes[1]]), typ);

            let parsed = StunMessage::parse(&bytes).unwrap();
            assert_eq!((parsed.method, parsed.class), (method, class));
        }
    }

    #[test]
    fn encodes_turn_attributes() {
        let peer: SocketAddr = "10.0.0.7:4000".parse().unwrap();
        let relay: SocketAddr = "[::1]:50000".parse().unwrap();
        let mut msg = StunMessage::request(Method::Allocate);
        msg.lifetime = Some(600);
        msg.requested_transport = Some(attr::PROTO_UDP);
        msg.even_port = Some(EvenPort { reserve_next: true });
        msg.xor_peer_addresses = vec![peer, relay];
        msg.xor_relayed_address = Some(relay);
        msg.channel_number = Some(0x4001);
        msg.data = Some(Bytes::from_static(b"hello"));
        msg.set_error_code(486, "Allocation Quota Reached");
        msg.fingerprint = Some(0);

        let parsed = StunMessage::parse(&msg.encode()).unwrap();

        assert_eq!(parsed.lifetime, Some(600));
        assert_eq!(parsed.requested_transport, Some(attr::PROTO_UDP));
        assert_eq!(parsed.even_port, Some(EvenPort { reserve_next: true }));
        assert_eq!(parsed.xor_peer_addresses, vec![peer, relay]);
        assert_eq!(parsed.xor_relayed_address, Some(relay));
        assert_eq!(parsed.channel_number, Some(0x4001));
        assert_eq!(parsed.data.as_deref(), Some(&b"hello"[..]));
        assert_eq!(
            parsed.error_code,
            Some(ErrorCode::new(486, "Allocation Quota Reached")),
        );
        assert!(integrity::check_fingerprint(&parsed));
    }

    #[test]
    fn keeps_first_duplicate_attribute() {
        let mut msg = StunMessage::request(Method::Refresh);
        msg.lifetime = Some(10);
        let mut bytes = msg.encode();
        bytes.extend_from_slice(&[0x00, 0x0D, 0x00, 0x04, 0, 0, 0, 20]);
        let len = bytes.len() - HEADER_LEN;
        set_length(&mut bytes, len);

        let parsed = StunMessage::parse(&bytes).unwrap();

        assert_eq!(parsed.lifetime, Some(10));
    }

    #[test]
    fn accepts_rfc3489_message() {
        let mut bytes = StunMessage::request(Method::Binding).encode();
        bytes[4..8].copy_from_slice(&[1, 2, 3, 4]);

        let parsed = StunMessage::parse(&bytes).unwrap();

        assert!(!parsed.has_magic_cookie());
        assert_eq!(parsed.legacy_cookie, Some(0x0102_0304));
        assert_eq!(parsed.encode(), bytes);
    }

    #[test]
    fn rejects_malformed_input() {
        let ok = StunMessage::request(Method::Binding).encode();
        assert_eq!(
            StunMessage::parse(&ok[..19]).unwrap_err(),
            DecodeError::TooShort,
        );

        let mut longer = ok.clone();
        longer.push(0);
        assert_eq!(
            StunMessage::parse(&longer).unwrap_err(),
            DecodeError::LengthMismatch,
        );

        let mut overflow = ok.clone();
        overflow.extend_from_slice(&[0x00, 0x06, 0x00, 0x08, b'a', b'b', b'c', b'd']);
        let len = overflow.len() - HEADER_LEN;
        set_length(&mut overflow, len);
        assert_eq!(
            StunMessage::parse(&overflow).unwrap_err(),
            DecodeError::AttributeOverflow,
        );

        let mut bad_lifetime = ok;
        bad_lifetime.extend_from_slice(&[0x00, 0x0D, 0x00, 0x02, 0, 1, 0, 0]);
        let len = bad_lifetime.len() - HEADER_LEN;
        set_length(&mut bad_lifetime, len);
        assert_eq!(
            StunMessage::parse(&bad_lifetime).unwrap_err(),
            DecodeError::InvalidAttribute(attr::LIFETIME),
        );
    }

    #[test]
    fn reports_unknown_required_attributes() {
        let req = StunMessage::request(Method::Allocate);
        let mut bytes = req.encode();
        bytes.extend_from_slice(&[0x00, 0x7E, 0x00, 0x00]);
        bytes.extend_from_slice(&[0xC0, 0x01, 0x00, 0x00]);
        let len = bytes.len() - HEADER_LEN;
        set_length(&mut bytes, len);

        let err = StunMessage::parse(&bytes).unwrap_err();

        assert_eq!(
            err,
            DecodeError::UnknownAttributes {
                header: req.header(),
                types: vec![0x007E],
            },
        );
    }

    #[test]
    fn skips_unknown_optional_attributes() {
        let mut bytes = StunMessage::request(Method::Binding).encode();
        bytes.extend_from_slice(&[0xC0, 0x57, 0x00, 0x04, 0, 1, 0, 0]);
        let len = bytes.len() - HEADER_LEN;
        set_length(&mut bytes, len);

        assert!(StunMessage::parse(&bytes).is_ok());
    }

    #[test]
    fn ignores_attributes_after_integrity() {
        let mut msg = StunMessage::request(Method::Binding);
        msg.hmac_key = Some(IntegrityKey::short_term("secret"));
        let mut bytes = msg.encode();
        bytes.extend_from_slice(&[0x00, 0x0D, 0x00, 0x04, 0, 0, 0, 5]);
        let len = bytes.len() - HEADER_LEN;
        set_length(&mut bytes, len);

        let parsed = StunMessage::parse(&bytes).unwrap();

        assert_eq!(parsed.lifetime, None);
        assert_eq!(parsed.integrity_msg_len, Some(24));
    }

    #[test]
    fn frames_message() {
        let msg = StunMessage::request(Method::Binding);
        let plain = msg.encode();

        let framed = msg.encode_framed(0);

        assert_eq!(&framed[..4], &[0, 0, 0, 20]);
        assert_eq!(&framed[4..], &plain[..]);
    }
}
