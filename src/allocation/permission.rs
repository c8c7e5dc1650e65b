//! [Allocation] [permission] definitions.
//!
//! [Allocation]: https://datatracker.ietf.org/doc/html/rfc5766#section-2.2
//! [permission]: https://datatracker.ietf.org/doc/html/rfc5766#section-8

use std::net::IpAddr;

use tokio::time::{Duration, Instant};

/// [Lifetime][1] of a [`Permission`].
///
/// > The Permission Lifetime MUST be 300 seconds (= 5 minutes).
///
/// [1]: https://datatracker.ietf.org/doc/html/rfc5766#section-8
pub(crate) const PERMISSION_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Representation of an [allocation] [permission].
///
/// Expiry is checked lazily against [`Instant::now()`], so no task watches
/// a [`Permission`].
///
/// [allocation]: https://datatracker.ietf.org/doc/html/rfc5766#section-2.2
/// [permission]: https://datatracker.ietf.org/doc/html/rfc5766#section-8
#[derive(Clone, Copy, Debug)]
pub(crate) struct Permission {
    /// [`IpAddr`] of this [`Permission`] that is matched with the source IP
    /// address of the datagram received.
    ip: IpAddr,

    /// [`Instant`] this [`Permission`] expires at.
    expires: Instant,
}

impl Permission {
    /// Creates a new [`Permission`] living for [`PERMISSION_LIFETIME`].
    pub(crate) fn new(ip: IpAddr) -> Self {
        Self { ip, expires: Instant::now() + PERMISSION_LIFETIME }
    }

    /// Returns the [`IpAddr`] of this [`Permission`].
    pub(crate) const fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Restarts the lifetime of this [`Permission`].
    ///
    /// Lifetimes never accumulate: a refreshed [`Permission`] always expires
    /// [`PERMISSION_LIFETIME`] after the refresh.
    pub(crate) fn refresh(&mut self) {
        self.expires = Instant::now() + PERMISSION_LIFETIME;
    }

    /// Indicates whether this [`Permission`] has expired.
    pub(crate) fn is_expired(&self) -> bool {
        Instant::now() >= self.expires
    }
}
