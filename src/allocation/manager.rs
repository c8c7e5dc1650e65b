//! Storage of [allocation]s.
//!
//! [allocation]: https://tools.ietf.org/html/rfc5766#section-5

use std::{collections::HashMap, net::SocketAddr};

use tokio::{sync::mpsc, time::Duration};

use crate::{Error, relay, transport::Framing};

use super::{
    Allocation, AllocationInfo, AllocationKey, Credentials, Event,
    port_pool::PortPool,
};

/// Configuration parameters of a [`Manager`].
#[derive(Debug)]
pub(crate) struct Config {
    /// [`relay::Allocator`] of relay sockets.
    pub(crate) relay: relay::Allocator,

    /// Sink of [`Event`]s of the managed [`Allocation`]s.
    pub(crate) events_tx: mpsc::Sender<Event>,

    /// [`mpsc::Sender`] for notifying when an [`Allocation`] is closed.
    pub(crate) alloc_close_notify: Option<mpsc::Sender<AllocationInfo>>,
}

/// [`Manager`] holding active [`Allocation`]s.
#[derive(Debug)]
pub(crate) struct Manager {
    /// Stored [`Allocation`]s.
    allocations: HashMap<AllocationKey, Allocation>,

    /// Relay ports.
    ports: PortPool,

    /// [`relay::Allocator`] of relay sockets.
    relay: relay::Allocator,

    /// Generation of the next created [`Allocation`].
    next_generation: u64,

    /// Sink of [`Event`]s of the managed [`Allocation`]s.
    events_tx: mpsc::Sender<Event>,

    /// [`mpsc::Sender`] for notifying when an [`Allocation`] is closed.
    alloc_close_notify: Option<mpsc::Sender<AllocationInfo>>,
}

impl Manager {
    /// Creates a new [`Manager`] out of the provided [`Config`].
    pub(crate) fn new(config: Config) -> Self {
        Self {
            allocations: HashMap::new(),
            ports: PortPool::new(config.relay.min_port, config.relay.max_port),
            relay: config.relay,
            next_generation: 1,
            events_tx: config.events_tx,
            alloc_close_notify: config.alloc_close_notify,
        }
    }

    /// Returns the [`relay::Allocator`] of this [`Manager`].
    pub(crate) const fn relay(&self) -> &relay::Allocator {
        &self.relay
    }

    /// Returns the relay [`PortPool`] of this [`Manager`].
    pub(crate) const fn ports(&mut self) -> &mut PortPool {
        &mut self.ports
    }

    /// Returns the [`Allocation`] matching the provided [`AllocationKey`], if
    /// any.
    pub(crate) fn get(&self, key: &AllocationKey) -> Option<&Allocation> {
        self.allocations.get(key)
    }

    /// Returns the [`Allocation`] matching the provided [`AllocationKey`], if
    /// any.
    pub(crate) fn get_mut(
        &mut self,
        key: &AllocationKey,
    ) -> Option<&mut Allocation> {
        self.allocations.get_mut(key)
    }

    /// Returns the key of the [`Allocation`] owning the provided relayed
    /// transport address, if any.
    pub(crate) fn find_by_relay(
        &self,
        relay_addr: SocketAddr,
    ) -> Option<AllocationKey> {
        self.allocations
            .values()
            .find(|a| a.relay_addr() == relay_addr)
            .map(Allocation::key)
    }

    /// Creates a new [`Allocation`] relaying through the provided `port`,
    /// which must be already taken from the [`PortPool`].
    ///
    /// Returns the relayed transport address of the new [`Allocation`].
    ///
    /// # Errors
    ///
    /// With [`Error::Transport`] if the relay socket fails to bind. The
    /// `port` is released in this case.
    pub(crate) async fn create_allocation(
        &mut self,
        key: AllocationKey,
        credentials: Credentials,
        port: u16,
        lifetime: Duration,
        bandwidth: u32,
    ) -> Result<SocketAddr, Error> {
        let (relay_socket, relay_addr) = match self.relay.bind(port).await {
            Ok(v) => v,
            Err(e) => {
                self.ports.release(port);
                return Err(e);
            }
        };
        let generation = self.take_generation();
        let alloc = Allocation::new(
            key,
            generation,
            credentials,
            relay_socket,
            relay_addr,
            lifetime,
            bandwidth,
            self.events_tx.clone(),
            self.alloc_close_notify.clone(),
        );
        drop(self.allocations.insert(key, alloc));

        Ok(relay_addr)
    }

    /// Moves the relay of the [`Allocation`] under the `old` key into a new
    /// [`Allocation`] under the `new` key.
    ///
    /// Permissions and channel bindings of the old [`Allocation`] are
    /// dropped. Returns the relayed transport address of the new
    /// [`Allocation`].
    ///
    /// # Errors
    ///
    /// With [`Error::NoAllocationFound`] if there is no [`Allocation`] under
    /// the `old` key.
    pub(crate) fn subsume(
        &mut self,
        old: &AllocationKey,
        new: AllocationKey,
        lifetime: Duration,
        bandwidth: u32,
    ) -> Result<SocketAddr, Error> {
        let mut prev =
            self.allocations.remove(old).ok_or(Error::NoAllocationFound)?;
        prev.silence();
        let (relay_socket, relay_addr) = prev.relay();
        let credentials = prev.credentials().clone();
        drop(prev);

        let generation = self.take_generation();
        let alloc = Allocation::new(
            new,
            generation,
            credentials,
            relay_socket,
            relay_addr,
            lifetime,
            bandwidth,
            self.events_tx.clone(),
            self.alloc_close_notify.clone(),
        );
        drop(self.allocations.insert(new, alloc));
        log::debug!("Allocation {old} subsumed by {new}");

        Ok(relay_addr)
    }

    /// Removes the [`Allocation`] matching the provided [`AllocationKey`], if
    /// any, releasing its port.
    pub(crate) fn remove(&mut self, key: &AllocationKey) -> bool {
        let Some(alloc) = self.allocations.remove(key) else {
            return false;
        };
        self.release(&alloc);
        true
    }

    /// Removes all the [`Allocation`]s with the provided `username`, if any.
    pub(crate) fn remove_by_username(&mut self, username: &str) {
        let keys = self
            .allocations
            .values()
            .filter(|a| a.credentials().username.as_deref() == Some(username))
            .map(Allocation::key)
            .collect::<Vec<_>>();
        for key in keys {
            _ = self.remove(&key);
        }
    }

    /// Returns information about all the [`Allocation`]s associated with the
    /// provided [`AllocationKey`]s, or about all of them if [`None`].
    pub(crate) fn infos(
        &self,
        keys: Option<&[AllocationKey]>,
    ) -> HashMap<AllocationKey, AllocationInfo> {
        self.allocations
            .iter()
            .filter(|(key, _)| keys.is_none_or(|keys| keys.contains(key)))
            .map(|(key, alloc)| (*key, alloc.info()))
            .collect()
    }

    /// Handles the expiry timer of an [`Allocation`].
    ///
    /// Stale timers of replaced [`Allocation`]s are ignored, and the timer of
    /// a refreshed [`Allocation`] is re-armed.
    pub(crate) fn handle_expired(&mut self, key: &AllocationKey, generation: u64) {
        let Some(alloc) = self.allocations.get_mut(key) else {
            return;
        };
        if alloc.generation() != generation {
            return;
        }
        if alloc.is_expired() {
            log::debug!("Allocation {key} expired");
            _ = self.remove(key);
        } else {
            alloc.arm_timer();
        }
    }

    /// Handles a datagram received from the `peer` by an [`Allocation`],
    /// returning it encoded for the client.
    pub(crate) fn handle_peer_data(
        &mut self,
        key: &AllocationKey,
        generation: u64,
        peer: SocketAddr,
        data: &[u8],
        framing: Framing,
    ) -> Option<Vec<u8>> {
        self.allocations
            .get_mut(key)
            .filter(|a| a.generation() == generation)?
            .data_to_client(peer, data, framing)
    }

    /// Returns the next [`Allocation`] generation.
    fn take_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Returns the relay port of the removed `alloc` to the [`PortPool`].
    fn release(&mut self, alloc: &Allocation) {
        let port = alloc.relay().0.local_addr().map_or_else(
            |_| alloc.relay_addr().port(),
            |addr| addr.port(),
        );
        self.ports.release(port);
    }
}
