//! Pool of relay ports.

use std::collections::{HashMap, HashSet};

use tokio::time::{Duration, Instant};

/// Lifetime of a port reserved by an even/odd pair allocation.
pub(crate) const RESERVATION_LIFETIME: Duration = Duration::from_secs(30);

/// Requested properties of a relay port.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PortProps {
    /// Any free port.
    #[default]
    Any,

    /// Odd port.
    Odd,

    /// Even port.
    Even,

    /// Even port `P` with `P + 1` reserved for a later allocation.
    EvenPair,
}

/// Port reserved for a later allocation.
#[derive(Clone, Copy, Debug)]
struct Reservation {
    /// Reserved port.
    port: u16,

    /// [`Instant`] the reservation is released at.
    expires: Instant,
}

/// Pool of ports in the `[min, max]` range used for relay sockets.
#[derive(Debug)]
pub(crate) struct PortPool {
    /// Lowest port of the pool.
    min: u16,

    /// Highest port of the pool (inclusive).
    max: u16,

    /// Ports used by live allocations.
    in_use: HashSet<u16>,

    /// Ports reserved by pair allocations, by their reservation tokens.
    reservations: HashMap<u64, Reservation>,
}

impl PortPool {
    /// Creates a new [`PortPool`] over the `[min, max]` range.
    pub(crate) fn new(min: u16, max: u16) -> Self {
        if min > max {
            log::warn!("Empty relay port range: [{min}, {max}]");
        }
        Self {
            min,
            max,
            in_use: HashSet::new(),
            reservations: HashMap::new(),
        }
    }

    /// Allocates a port with the provided [`PortProps`].
    ///
    /// Returns the port and, for [`PortProps::EvenPair`], the reservation
    /// token of the paired odd port.
    pub(crate) fn allocate(
        &mut self,
        props: PortProps,
    ) -> Option<(u16, Option<u64>)> {
        match props {
            PortProps::Any => self.allocate_any().map(|p| (p, None)),
            PortProps::Odd => self.allocate_odd().map(|p| (p, None)),
            PortProps::Even => self.allocate_even().map(|p| (p, None)),
            PortProps::EvenPair => {
                self.allocate_even_pair().map(|(p, t)| (p, Some(t)))
            }
        }
    }

    /// Allocates any free port.
    pub(crate) fn allocate_any(&mut self) -> Option<u16> {
        self.take_first(|_| true)
    }

    /// Allocates a free odd port.
    pub(crate) fn allocate_odd(&mut self) -> Option<u16> {
        self.take_first(|p| p % 2 == 1)
    }

    /// Allocates a free even port.
    pub(crate) fn allocate_even(&mut self) -> Option<u16> {
        self.take_first(|p| p % 2 == 0)
    }

    /// Allocates a free even port `P` whose neighbour `P + 1` is free too,
    /// and reserves `P + 1` for [`RESERVATION_LIFETIME`].
    ///
    /// Returns `P` and the reservation token of `P + 1`. Either both ports
    /// are taken or none.
    pub(crate) fn allocate_even_pair(&mut self) -> Option<(u16, u64)> {
        self.prune();
        let port = self.find(|pool, p| {
            p % 2 == 0
                && p.checked_add(1).is_some_and(|next| pool.is_free(next))
        })?;
        let reserved = port.checked_add(1)?;

        _ = self.in_use.insert(port);
        let token = u64::from(reserved);
        _ = self.reservations.insert(
            token,
            Reservation {
                port: reserved,
                expires: Instant::now() + RESERVATION_LIFETIME,
            },
        );
        Some((port, token))
    }

    /// Allocates the exact `port`, if it's in range and free.
    pub(crate) fn allocate_port(&mut self, port: u16) -> bool {
        self.prune();
        if !self.is_free(port) {
            return false;
        }
        self.in_use.insert(port)
    }

    /// Allocates the port reserved under the provided `token`.
    ///
    /// Returns [`None`] if the `token` is unknown or has expired.
    pub(crate) fn allocate_reserved(&mut self, token: u64) -> Option<u16> {
        self.prune();
        let reservation = self.reservations.remove(&token)?;
        _ = self.in_use.insert(reservation.port);
        Some(reservation.port)
    }

    /// Returns the provided `port` back to this [`PortPool`].
    pub(crate) fn release(&mut self, port: u16) {
        if !self.in_use.remove(&port) {
            log::debug!("Released port {port} was not in use");
        }
    }

    /// Takes the first free port matching the `filter`, starting from a
    /// random offset.
    fn take_first(&mut self, filter: impl Fn(u16) -> bool) -> Option<u16> {
        self.prune();
        let port = self.find(|_, p| filter(p))?;
        _ = self.in_use.insert(port);
        Some(port)
    }

    /// Finds a free port matching the `filter`, scanning the whole range
    /// once from a random offset.
    fn find(&self, filter: impl Fn(&Self, u16) -> bool) -> Option<u16> {
        if self.min > self.max {
            return None;
        }
        let span = u32::from(self.max - self.min) + 1;
        let start = rand::random_range(0..span);

        (0..span)
            .filter_map(|i| {
                u16::try_from(u32::from(self.min) + (start + i) % span).ok()
            })
            .find(|&p| self.is_free(p) && filter(self, p))
    }

    /// Indicates whether the `port` is in range, unused and unreserved.
    fn is_free(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
            && !self.in_use.contains(&port)
            && !self.reservations.values().any(|r| r.port == port)
    }

    /// Drops expired reservations.
    fn prune(&mut self) {
        let now = Instant::now();
        self.reservations.retain(|_, r| r.expires > now);
    }
}

#[cfg(test)]
mod port_pool_spec {
    use tokio::time;

    use super::*;

    #[test]
    fn allocates_within_range_until_exhausted() {
        let mut pool = PortPool::new(50000, 50003);

        let mut got = (0..4).map(|_| pool.allocate_any().unwrap()).collect::<Vec<_>>();
        got.sort_unstable();

        assert_eq!(got, [50000, 50001, 50002, 50003]);
        assert_eq!(pool.allocate_any(), None);

        pool.release(50002);
        assert_eq!(pool.allocate_any(), Some(50002));
    }

    #[test]
    fn respects_parity() {
        let mut pool = PortPool::new(50000, 50009);

        for _ in 0..5 {
            assert_eq!(pool.allocate_even().unwrap() % 2, 0);
        }
        assert_eq!(pool.allocate_even(), None);

        for _ in 0..5 {
            assert_eq!(pool.allocate_odd().unwrap() % 2, 1);
        }
        assert_eq!(pool.allocate_odd(), None);
    }

    #[tokio::test]
    async fn reserves_pair() {
        let mut pool = PortPool::new(50000, 50001);

        let (port, token) = pool.allocate_even_pair().unwrap();
        assert_eq!(port, 50000);
        assert_eq!(token, 50001);

        assert!(!pool.allocate_port(50001), "reserved port must not be free");
        assert_eq!(pool.allocate_any(), None);

        assert_eq!(pool.allocate_reserved(token), Some(50001));
        assert_eq!(pool.allocate_reserved(token), None);
    }

    #[test]
    fn pair_is_atomic() {
        let mut pool = PortPool::new(50000, 50003);
        assert!(pool.allocate_port(50001));
        assert!(pool.allocate_port(50003));

        assert_eq!(pool.allocate_even_pair(), None);
        assert!(pool.allocate_port(50000), "even port must stay free");
    }

    #[tokio::test(start_paused = true)]
    async fn reservation_expires() {
        let mut pool = PortPool::new(50000, 50001);
        let (_, token) = pool.allocate_even_pair().unwrap();

        time::advance(RESERVATION_LIFETIME).await;

        assert_eq!(pool.allocate_reserved(token), None);
        assert!(pool.allocate_port(50001), "expired reservation must free");
    }

    #[test]
    fn rejects_out_of_range() {
        let mut pool = PortPool::new(50000, 50001);

        assert!(!pool.allocate_port(49999));
        assert!(pool.allocate_port(50000));
        assert!(!pool.allocate_port(50000), "port must not be taken twice");
    }

    #[test]
    fn maps_props() {
        let mut pool = PortPool::new(50000, 50003);

        let (p, token) = pool.allocate(PortProps::EvenPair).unwrap();
        assert_eq!(token, Some(u64::from(p) + 1));

        let (p, token) = pool.allocate(PortProps::Odd).unwrap();
        assert_eq!(p % 2, 1);
        assert_eq!(token, None);
    }
}
