//! [STUN] message integrity, fingerprints and credentials.
//!
//! [STUN]: https://datatracker.ietf.org/doc/html/rfc5389#section-15.4

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac as _};
use md5::{Digest as _, Md5};
use secrecy::{ExposeSecret as _, SecretString};
use sha1::Sha1;
use subtle::ConstantTimeEq as _;

use crate::{
    attr,
    message::{HEADER_LEN, INTEGRITY_LEN, StunMessage},
};

/// HMAC-SHA1 used for `MESSAGE-INTEGRITY`.
type HmacSha1 = Hmac<Sha1>;

/// CRC-32 used for `FINGERPRINT`.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Value XOR-ed into the CRC-32 of a [`FINGERPRINT`][1].
///
/// [1]: https://datatracker.ietf.org/doc/html/rfc5389#section-15.5
const FINGERPRINT_XOR: u32 = 0x5354_554E;

/// Granularity of the timestamp embedded into generated usernames.
const USERNAME_TIME_STEP: u64 = 20 * 60;

/// Length of a generated username for an IPv4 client.
pub const GENERATED_USERNAME_LEN_V4: usize = 92;

/// Length of a generated username for an IPv6 client.
pub const GENERATED_USERNAME_LEN_V6: usize = 108;

/// Padding applied to the input of the `MESSAGE-INTEGRITY` HMAC.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HmacPadding {
    /// No padding, as [RFC 5389] mandates.
    ///
    /// [RFC 5389]: https://datatracker.ietf.org/doc/html/rfc5389#section-15.4
    #[default]
    Rfc5389,

    /// Zero padding to a 64-byte boundary, used by RFC 3489bis drafts.
    Legacy,
}

/// Key for computing `MESSAGE-INTEGRITY`.
#[derive(Clone)]
pub struct IntegrityKey {
    /// Raw key bytes.
    key: Vec<u8>,

    /// [`HmacPadding`] this key signs with.
    padding: HmacPadding,
}

impl IntegrityKey {
    /// Creates a [short-term][1] key out of the provided password.
    ///
    /// [1]: https://datatracker.ietf.org/doc/html/rfc5389#section-15.4
    #[must_use]
    pub fn short_term(password: &str) -> Self {
        Self { key: password.as_bytes().to_vec(), padding: HmacPadding::default() }
    }

    /// Creates a [long-term][1] key: `MD5(username ":" realm ":" password)`.
    ///
    /// [1]: https://datatracker.ietf.org/doc/html/rfc5389#section-15.4
    #[must_use]
    pub fn long_term(username: &str, realm: &str, password: &str) -> Self {
        let mut md5 = Md5::new();
        md5.update(username.as_bytes());
        md5.update(b":");
        md5.update(realm.as_bytes());
        md5.update(b":");
        md5.update(password.as_bytes());
        Self { key: md5.finalize().to_vec(), padding: HmacPadding::default() }
    }

    /// Switches this [`IntegrityKey`] to the provided [`HmacPadding`].
    #[must_use]
    pub const fn with_padding(mut self, padding: HmacPadding) -> Self {
        self.padding = padding;
        self
    }

    /// Returns the [`HmacPadding`] of this [`IntegrityKey`].
    #[must_use]
    pub const fn padding(&self) -> HmacPadding {
        self.padding
    }
}

impl fmt::Debug for IntegrityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrityKey")
            .field("key", &"[REDACTED]")
            .field("padding", &self.padding)
            .finish()
    }
}

impl PartialEq for IntegrityKey {
    fn eq(&self, other: &Self) -> bool {
        self.padding == other.padding && bool::from(self.key.ct_eq(&other.key))
    }
}

impl Eq for IntegrityKey {}

/// Computes the HMAC-SHA1 of the provided `data`.
pub(crate) fn compute_hmac(key: &IntegrityKey, data: &[u8]) -> [u8; INTEGRITY_LEN] {
    let mut out = [0; INTEGRITY_LEN];
    // HMAC accepts keys of any length.
    if let Ok(mut mac) = HmacSha1::new_from_slice(&key.key) {
        mac.update(data);
        if key.padding == HmacPadding::Legacy {
            let rem = data.len() % 64;
            if rem != 0 {
                mac.update(&[0; 64][..64 - rem]);
            }
        }
        out.copy_from_slice(&mac.finalize().into_bytes());
    }
    out
}

/// Computes the `FINGERPRINT` value of the provided `data`.
pub(crate) fn fingerprint(data: &[u8]) -> u32 {
    CRC32.checksum(data) ^ FINGERPRINT_XOR
}

/// Hex-encoded HMAC-SHA1 of `data` keyed with `secret`.
fn hmac_hex(secret: &[u8], data: &[u8]) -> String {
    hex::encode(compute_hmac(
        &IntegrityKey { key: secret.to_vec(), padding: HmacPadding::Rfc5389 },
        data,
    ))
}

/// Checks the `MESSAGE-INTEGRITY` of the provided parsed [`StunMessage`]
/// against the provided [`IntegrityKey`].
///
/// The HMAC is recomputed over the raw bytes preceding the attribute, with
/// the header length field rewritten to cover it.
#[must_use]
pub fn check_message_integrity(msg: &StunMessage, key: &IntegrityKey) -> bool {
    let (Some(expected), Some(msg_len)) =
        (msg.message_integrity, msg.integrity_msg_len)
    else {
        return false;
    };
    let Some(covered) = (HEADER_LEN + msg_len)
        .checked_sub(4 + INTEGRITY_LEN)
        .and_then(|end| msg.raw.get(..end))
    else {
        return false;
    };

    let mut buf = covered.to_vec();
    let Ok(len) = u16::try_from(msg_len) else {
        return false;
    };
    if let Some(field) = buf.get_mut(2..4) {
        field.copy_from_slice(&len.to_be_bytes());
    }

    compute_hmac(key, &buf).ct_eq(&expected).into()
}

/// Checks the trailing `FINGERPRINT` of the provided parsed [`StunMessage`].
#[must_use]
pub fn check_fingerprint(msg: &StunMessage) -> bool {
    let raw = &msg.raw;
    let Some(start) = raw.len().checked_sub(8).filter(|s| *s >= HEADER_LEN)
    else {
        return false;
    };
    let Some(tlv) = raw.get(start..) else {
        return false;
    };
    if u16::from_be_bytes([tlv[0], tlv[1]]) != attr::FINGERPRINT {
        return false;
    }
    let value = u32::from_be_bytes([tlv[4], tlv[5], tlv[6], tlv[7]]);

    raw.get(..start).is_some_and(|covered| fingerprint(covered) == value)
}

/// Secrets used to issue short-term credentials.
#[derive(Debug)]
pub struct ShortTermSecrets {
    /// Secret signing generated usernames.
    pub username: SecretString,

    /// Secret deriving passwords out of usernames.
    pub password: SecretString,
}

impl ShortTermSecrets {
    /// Generates random [`ShortTermSecrets`].
    #[must_use]
    pub fn random() -> Self {
        Self {
            username: hex::encode(rand::random::<[u8; 16]>()).into(),
            password: hex::encode(rand::random::<[u8; 16]>()).into(),
        }
    }

    /// Derives the short-term password of the provided `username`:
    /// `hex(HMAC-SHA1(password secret, username))`.
    #[must_use]
    pub fn password_for(&self, username: &str) -> String {
        hmac_hex(self.password.expose_secret().as_bytes(), username.as_bytes())
    }

    /// Derives the short-term [`IntegrityKey`] of the provided `username`.
    #[must_use]
    pub fn key_for(&self, username: &str) -> IntegrityKey {
        IntegrityKey::short_term(&self.password_for(username))
    }

    /// Issues a new username and password for the client at `remote`.
    ///
    /// The username embeds the client address, so it can be recovered with
    /// [`tuple_from_username()`].
    #[must_use]
    pub fn create_username_and_password(
        &self,
        remote: SocketAddr,
    ) -> (String, SecretString) {
        let ip = match remote.ip() {
            IpAddr::V4(ip) => BASE64.encode(ip.octets()),
            IpAddr::V6(ip) => BASE64.encode(ip.octets()),
        };
        let port = BASE64.encode(u32::from(remote.port()).to_be_bytes());
        let salt = hex::encode(rand::random::<[u8; 8]>());
        let now = unix_time().as_secs();
        let time = hex::encode(
            (now / USERNAME_TIME_STEP * USERNAME_TIME_STEP).to_be_bytes(),
        );

        let mut username = format!("{ip}:{port}:{salt}:{time}");
        let mac = hmac_hex(
            self.username.expose_secret().as_bytes(),
            username.as_bytes(),
        );
        username.push(':');
        username.push_str(&mac);

        let password = self.password_for(&username).into();
        (username, password)
    }
}

/// Recovers the client address embedded into a username generated by
/// [`ShortTermSecrets::create_username_and_password()`].
#[must_use]
pub fn tuple_from_username(username: &str) -> Option<SocketAddr> {
    if username.len() != GENERATED_USERNAME_LEN_V4
        && username.len() != GENERATED_USERNAME_LEN_V6
    {
        return None;
    }
    let mut parts = username.split(':');
    let ip = BASE64.decode(parts.next()?).ok()?;
    let port = BASE64.decode(parts.next()?).ok()?;

    let ip = match ip.len() {
        4 => IpAddr::V4(Ipv4Addr::from(<[u8; 4]>::try_from(ip).ok()?)),
        16 => IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(ip).ok()?)),
        _ => return None,
    };
    let port = u32::from_be_bytes(<[u8; 4]>::try_from(port).ok()?);

    Some(SocketAddr::new(ip, u16::try_from(port).ok()?))
}

/// Result of [`check_nonce()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NonceCheck {
    /// Nonce was issued by this server and is still fresh.
    Valid,

    /// Nonce was issued by this server, but its lifetime has passed.
    Expired,

    /// Nonce wasn't issued by this server.
    NotValid,
}

/// Returns the current UNIX time.
fn unix_time() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Signs the provided timestamp with the `private_key`.
pub(crate) fn nonce_digest(secs: u64, private_key: &SecretString) -> String {
    let mut md5 = Md5::new();
    md5.update(format!("{secs}:").as_bytes());
    md5.update(private_key.expose_secret().as_bytes());
    hex::encode(md5.finalize())
}

/// Generates a new nonce: `"<unix secs>:" md5hex("<unix secs>:" key)`.
#[must_use]
pub fn generate_nonce(private_key: &SecretString) -> String {
    let secs = unix_time().as_secs();
    format!("{secs}:{}", nonce_digest(secs, private_key))
}

/// Checks the provided `nonce` was generated with the `private_key` no more
/// than `lifetime` ago.
///
/// A `None` lifetime never expires.
#[must_use]
pub fn check_nonce(
    nonce: &str,
    private_key: &SecretString,
    lifetime: Option<Duration>,
) -> NonceCheck {
    let Some((secs, digest)) = nonce.split_once(':') else {
        return NonceCheck::NotValid;
    };
    let Ok(secs) = secs.parse::<u64>() else {
        return NonceCheck::NotValid;
    };
    let expected = nonce_digest(secs, private_key);
    if !bool::from(expected.as_bytes().ct_eq(digest.as_bytes())) {
        return NonceCheck::NotValid;
    }

    match lifetime {
        Some(l) if unix_time().as_secs().saturating_sub(secs) > l.as_secs() => {
            NonceCheck::Expired
        }
        _ => NonceCheck::Valid,
    }
}
