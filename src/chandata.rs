//! [`ChannelData`] message implementation.

use bytes::Bytes;
use derive_more::with_trait::{Display, Error as StdError};

use crate::attr::is_valid_channel_number;

/// [`ChannelData`] message MUST be padded to a multiple of four bytes in order
/// to ensure the alignment of subsequent messages.
const PADDING: usize = 4;

/// [Channel Number] field size.
///
/// [Channel Number]: https://datatracker.ietf.org/doc/html/rfc5766#section-11.4
const CHANNEL_DATA_NUMBER_SIZE: usize = 2;

/// [ChannelData] message header size.
///
/// [ChannelData]: https://datatracker.ietf.org/doc/html/rfc5766#section-11.4
pub(crate) const CHANNEL_DATA_HEADER_SIZE: usize = 4;

/// Possible errors of decoding a [`ChannelData`] message.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, StdError)]
pub enum FormatError {
    /// Buffer is shorter than the [`ChannelData`] header.
    #[display("unexpected EOF")]
    UnexpectedEof,

    /// Channel number is outside the `0x4000..=0x7FFF` range.
    #[display("channel number not in [0x4000, 0x7FFF]")]
    InvalidChannelNumber,

    /// Length field exceeds the buffer.
    #[display("channelData length != len(Data)")]
    BadChannelDataLength,
}

/// [`ChannelData`] represents the `ChannelData` Message defined in
/// [RFC 5766](https://www.rfc-editor.org/rfc/rfc5766#section-11.4).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelData {
    /// [Channel Number][1] of this message.
    ///
    /// [1]: https://datatracker.ietf.org/doc/html/rfc5766#section-11.4
    pub number: u16,

    /// Application payload, without padding.
    pub data: Bytes,
}

impl ChannelData {
    /// Returns `true` if `buf` looks like the `ChannelData` Message.
    #[must_use]
    pub fn is_channel_data(buf: &[u8]) -> bool {
        let Some(hdr) = buf.first_chunk::<CHANNEL_DATA_HEADER_SIZE>() else {
            return false;
        };
        let len = usize::from(u16::from_be_bytes([hdr[2], hdr[3]]));

        len <= buf.len() - CHANNEL_DATA_HEADER_SIZE
            && is_valid_channel_number(u16::from_be_bytes([hdr[0], hdr[1]]))
    }

    /// Decodes the given raw message as [`ChannelData`].
    ///
    /// Trailing padding is discarded.
    ///
    /// # Errors
    ///
    /// With a [`FormatError`] if the message is malformed.
    pub fn decode(raw: &[u8]) -> Result<Self, FormatError> {
        let Some((hdr, payload)) =
            raw.split_first_chunk::<CHANNEL_DATA_HEADER_SIZE>()
        else {
            return Err(FormatError::UnexpectedEof);
        };

        let number = u16::from_be_bytes([hdr[0], hdr[1]]);
        if !is_valid_channel_number(number) {
            return Err(FormatError::InvalidChannelNumber);
        }

        let l = usize::from(u16::from_be_bytes([
            hdr[CHANNEL_DATA_NUMBER_SIZE],
            hdr[CHANNEL_DATA_NUMBER_SIZE + 1],
        ]));
        let data =
            payload.get(..l).ok_or(FormatError::BadChannelDataLength)?;

        Ok(Self { number, data: Bytes::copy_from_slice(data) })
    }

    /// Encodes the provided payload and channel number to bytes.
    ///
    /// Stream transports require the message to be `padded`.
    #[must_use]
    pub fn encode(data: &[u8], number: u16, padded: bool) -> Vec<u8> {
        // Callers never pass payloads above the datagram size.
        let len = u16::try_from(data.len()).unwrap_or(u16::MAX);
        let total = CHANNEL_DATA_HEADER_SIZE + usize::from(len);
        let mut out = Vec::with_capacity(nearest_padded_value_length(total));
        out.extend_from_slice(&number.to_be_bytes());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(data.get(..usize::from(len)).unwrap_or(data));
        if padded {
            out.resize(nearest_padded_value_length(out.len()), 0);
        }
        out
    }
}

/// Calculates nearest padded length for the [`ChannelData`] and [STUN]
/// attribute values.
///
/// [STUN]: https://datatracker.ietf.org/doc/html/rfc5389#section-15
pub(crate) const fn nearest_padded_value_length(l: usize) -> usize {
    let mut n = PADDING * (l / PADDING);
    if n < l {
        n += PADDING;
    }
    n
}
