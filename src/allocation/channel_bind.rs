//! [Channel] definitions.
//!
//! [Channel]: https://tools.ietf.org/html/rfc5766#section-2.5

use std::net::SocketAddr;

use tokio::time::{Duration, Instant};

/// Representation of a [channel].
///
/// [channel]: https://tools.ietf.org/html/rfc5766#section-2.5
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChannelBind {
    /// Transport address of the peer behind this [`ChannelBind`].
    peer: SocketAddr,

    /// Number of this [`ChannelBind`].
    number: u16,

    /// [`Instant`] this [`ChannelBind`] expires at.
    expires: Instant,

    /// Whether the client confirmed it accepts `ChannelData` on this
    /// [`ChannelBind`].
    confirmed: bool,
}

impl ChannelBind {
    /// Creates a new [`ChannelBind`] living for the provided `lifetime`.
    pub(crate) fn new(
        number: u16,
        peer: SocketAddr,
        lifetime: Duration,
        confirmed: bool,
    ) -> Self {
        Self { peer, number, expires: Instant::now() + lifetime, confirmed }
    }

    /// Returns the [`SocketAddr`] of the peer behind this [`ChannelBind`].
    pub(crate) const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Returns the number of this [`ChannelBind`].
    pub(crate) const fn num(&self) -> u16 {
        self.number
    }

    /// Restarts the `lifetime` of this [`ChannelBind`].
    pub(crate) fn refresh(&mut self, lifetime: Duration) {
        self.expires = Instant::now() + lifetime;
    }

    /// Indicates whether this [`ChannelBind`] has expired.
    pub(crate) fn is_expired(&self) -> bool {
        Instant::now() >= self.expires
    }

    /// Marks the server-to-client direction of this [`ChannelBind`] as
    /// confirmed.
    pub(crate) const fn confirm(&mut self) {
        self.confirmed = true;
    }

    /// Indicates whether `ChannelData` may be sent to the client over this
    /// [`ChannelBind`].
    pub(crate) const fn is_confirmed(&self) -> bool {
        self.confirmed
    }
}

#[cfg(test)]
mod channel_bind_spec {
    use tokio::time;

    use super::*;
    use crate::attr::CHANNEL_NUMBER_MIN;

    #[tokio::test(start_paused = true)]
    async fn expires_and_refreshes() {
        let peer = "127.0.0.1:5000".parse().unwrap();
        let lifetime = Duration::from_secs(600);
        let mut cb = ChannelBind::new(CHANNEL_NUMBER_MIN, peer, lifetime, false);

        assert_eq!(cb.peer(), peer);
        assert_eq!(cb.num(), CHANNEL_NUMBER_MIN);

        time::advance(Duration::from_secs(599)).await;
        assert!(!cb.is_expired(), "channel bind expired too early");

        cb.refresh(lifetime);
        time::advance(Duration::from_secs(599)).await;
        assert!(!cb.is_expired(), "refresh must restart the lifetime");

        time::advance(Duration::from_secs(1)).await;
        assert!(cb.is_expired(), "channel bind must expire");
    }

    #[tokio::test]
    async fn confirms() {
        let peer = "127.0.0.1:5000".parse().unwrap();
        let mut cb = ChannelBind::new(
            CHANNEL_NUMBER_MIN,
            peer,
            Duration::from_secs(600),
            false,
        );
        assert!(!cb.is_confirmed(), "must start unconfirmed");

        cb.confirm();
        assert!(cb.is_confirmed(), "must be confirmed");
    }
}
