//! TURN server [allocation].
//!
//! [allocation]: https://datatracker.ietf.org/doc/html/rfc5766#section-5

mod channel_bind;
mod manager;
mod permission;
mod port_pool;

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use bytes::Bytes;
use derive_more::with_trait::Display;
use tokio::{
    net::UdpSocket,
    sync::mpsc,
    task::JoinHandle,
    time::{Duration, Instant, sleep_until},
};

use crate::{
    Error,
    integrity::IntegrityKey,
    message::{Class, Method, StunMessage, TransactionId},
    transport::{Framing, INBOUND_MTU, StunTuple},
};

use self::{channel_bind::ChannelBind, permission::Permission};

pub(crate) use self::manager::{Config as ManagerConfig, Manager};
pub use self::port_pool::PortProps;

/// Key of an [`Allocation`]: the client's 5-tuple as seen by the server.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[display("{remote}->{local}")]
pub struct AllocationKey {
    /// Server endpoint the client talks to.
    pub local: StunTuple,

    /// Client endpoint.
    pub remote: StunTuple,
}

impl AllocationKey {
    /// Creates a new [`AllocationKey`].
    #[must_use]
    pub const fn new(local: StunTuple, remote: StunTuple) -> Self {
        Self { local, remote }
    }
}

/// Information about an allocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AllocationInfo {
    /// [`AllocationKey`] of this allocation.
    pub key: AllocationKey,

    /// Username of this allocation, if it was authenticated.
    pub username: Option<String>,

    /// Relayed bytes with this allocation, in both directions.
    pub relayed_bytes: usize,
}

/// Credentials an [`Allocation`] was created with.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Credentials {
    /// Authenticated username.
    pub(crate) username: Option<String>,

    /// Key the client signs its requests with.
    pub(crate) key: Option<IntegrityKey>,
}

/// Event of an [`Allocation`] handled by the server loop.
#[derive(Debug)]
pub(crate) enum Event {
    /// Datagram received from a peer on the relay socket.
    PeerData {
        /// [`AllocationKey`] of the receiving [`Allocation`].
        key: AllocationKey,

        /// Generation of the receiving [`Allocation`].
        generation: u64,

        /// Sender of the datagram.
        peer: SocketAddr,

        /// Payload of the datagram.
        data: Bytes,
    },

    /// Expiry timer of an [`Allocation`] fired.
    Expired {
        /// [`AllocationKey`] of the [`Allocation`].
        key: AllocationKey,

        /// Generation of the [`Allocation`].
        generation: u64,
    },
}

/// Destination of data sent to a peer.
#[derive(Clone, Copy, Debug)]
pub(crate) enum PeerTarget {
    /// Peer bound to the channel with this number.
    Channel(u16),

    /// Peer at this transport address.
    Tuple(SocketAddr),
}

/// TURN server [Allocation].
///
/// [Allocation]: https://datatracker.ietf.org/doc/html/rfc5766#section-5
#[derive(Debug)]
pub(crate) struct Allocation {
    /// [`AllocationKey`] this allocation is created with.
    key: AllocationKey,

    /// Generation distinguishing this allocation object from the previous
    /// ones with the same [`AllocationKey`].
    generation: u64,

    /// [`Credentials`] of the client.
    credentials: Credentials,

    /// Relayed transport address.
    relay_addr: SocketAddr,

    /// Allocated relay socket.
    relay_socket: Arc<UdpSocket>,

    /// [`Instant`] this allocation expires at.
    expires: Instant,

    /// Bandwidth granted to this allocation.
    bandwidth: u32,

    /// [`Permission`]s of this allocation, by peer IP.
    permissions: HashMap<IpAddr, Permission>,

    /// [`ChannelBind`]ings of this allocation, by channel number.
    channel_bindings: HashMap<u16, ChannelBind>,

    /// Total number of relayed bytes.
    relayed_bytes: usize,

    /// Task reading the `relay_socket`.
    reader: JoinHandle<()>,

    /// Single-shot expiry timer.
    timer: JoinHandle<()>,

    /// Sink of this allocation's [`Event`]s.
    events_tx: mpsc::Sender<Event>,

    /// Injected into allocations to notify when allocation is closed.
    alloc_close_notify: Option<mpsc::Sender<AllocationInfo>>,
}

impl Allocation {
    /// Creates a new [`Allocation`] and spawns its relay reader and expiry
    /// timer.
    #[expect(clippy::too_many_arguments, reason = "internal constructor")]
    pub(crate) fn new(
        key: AllocationKey,
        generation: u64,
        credentials: Credentials,
        relay_socket: Arc<UdpSocket>,
        relay_addr: SocketAddr,
        lifetime: Duration,
        bandwidth: u32,
        events_tx: mpsc::Sender<Event>,
        alloc_close_notify: Option<mpsc::Sender<AllocationInfo>>,
    ) -> Self {
        let expires = Instant::now() + lifetime;
        let reader = spawn_reader(
            key,
            generation,
            Arc::clone(&relay_socket),
            events_tx.clone(),
        );
        let timer = spawn_timer(key, generation, expires, events_tx.clone());

        log::debug!(
            "Allocation {key} created: relay={relay_addr} lifetime={}s",
            lifetime.as_secs(),
        );

        Self {
            key,
            generation,
            credentials,
            relay_addr,
            relay_socket,
            expires,
            bandwidth,
            permissions: HashMap::new(),
            channel_bindings: HashMap::new(),
            relayed_bytes: 0,
            reader,
            timer,
            events_tx,
            alloc_close_notify,
        }
    }

    /// Returns the [`AllocationKey`] of this [`Allocation`].
    pub(crate) const fn key(&self) -> AllocationKey {
        self.key
    }

    /// Returns the generation of this [`Allocation`].
    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the [`Credentials`] of this [`Allocation`].
    pub(crate) const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Returns the relayed transport address of this [`Allocation`].
    pub(crate) const fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// Returns the bandwidth granted to this [`Allocation`].
    pub(crate) const fn bandwidth(&self) -> u32 {
        self.bandwidth
    }

    /// Returns the relay socket of this [`Allocation`], along with its
    /// relayed transport address.
    pub(crate) fn relay(&self) -> (Arc<UdpSocket>, SocketAddr) {
        (Arc::clone(&self.relay_socket), self.relay_addr)
    }

    /// Indicates whether the lifetime of this [`Allocation`] has passed.
    pub(crate) fn is_expired(&self) -> bool {
        Instant::now() >= self.expires
    }

    /// Restarts the lifetime of this [`Allocation`].
    pub(crate) fn refresh(&mut self, lifetime: Duration, bandwidth: u32) {
        self.expires = Instant::now() + lifetime;
        self.bandwidth = bandwidth;
        self.arm_timer();
        log::trace!(
            "Allocation {} refreshed: lifetime={}s",
            self.key,
            lifetime.as_secs(),
        );
    }

    /// Re-arms the expiry timer of this [`Allocation`] for its current
    /// expiry [`Instant`].
    pub(crate) fn arm_timer(&mut self) {
        self.timer.abort();
        self.timer = spawn_timer(
            self.key,
            self.generation,
            self.expires,
            self.events_tx.clone(),
        );
    }

    /// Checks whether an active [`Permission`] exists for the `ip`.
    pub(crate) fn has_permission(&self, ip: IpAddr) -> bool {
        self.permissions.get(&ip).is_some_and(|p| !p.is_expired())
    }

    /// Adds a new [`Permission`] to this [`Allocation`], or refreshes the
    /// existing one.
    pub(crate) fn add_permission(&mut self, ip: IpAddr) {
        self.permissions.retain(|_, p| !p.is_expired());
        if let Some(p) = self.permissions.get_mut(&ip) {
            p.refresh();
        } else {
            drop(self.permissions.insert(ip, Permission::new(ip)));
        }
    }

    /// Refreshes the [`Permission`] for the `ip`, if there is an active one.
    pub(crate) fn refresh_permission(&mut self, ip: IpAddr) -> bool {
        match self.permissions.get_mut(&ip) {
            Some(p) if !p.is_expired() => {
                p.refresh();
                true
            }
            _ => false,
        }
    }

    /// Adds a new [`ChannelBind`] to this [`Allocation`], or refreshes the
    /// existing one. Also installs or refreshes the [`Permission`] for the
    /// `peer`.
    ///
    /// `confirmed` [`ChannelBind`]s carry `ChannelData` to the client right
    /// away.
    ///
    /// # Errors
    ///
    /// - [`Error::SameChannelDifferentPeer`] if the channel `number` is bound
    ///   to another peer.
    /// - [`Error::SamePeerDifferentChannel`] if the `peer` is bound to
    ///   another channel.
    pub(crate) fn add_channel_bind(
        &mut self,
        number: u16,
        peer: SocketAddr,
        lifetime: Duration,
        confirmed: bool,
    ) -> Result<(), Error> {
        self.channel_bindings.retain(|_, cb| !cb.is_expired());

        // The channel number is not currently bound to a different transport
        // address (same transport address is OK).
        if self.get_channel_addr(number).is_some_and(|addr| addr != peer) {
            return Err(Error::SameChannelDifferentPeer);
        }

        // The transport address is not currently bound to a different
        // channel number.
        if self.get_channel_number(peer).is_some_and(|n| n != number) {
            return Err(Error::SamePeerDifferentChannel);
        }

        if let Some(cb) = self.channel_bindings.get_mut(&number) {
            cb.refresh(lifetime);
        } else {
            drop(self.channel_bindings.insert(
                number,
                ChannelBind::new(number, peer, lifetime, confirmed),
            ));
        }

        // Channel binds also refresh permissions.
        self.add_permission(peer.ip());
        Ok(())
    }

    /// Marks the server-to-client direction of the `number` channel bound to
    /// the `peer` as confirmed.
    ///
    /// # Errors
    ///
    /// With [`Error::NoSuchChannelBind`] if no such active binding exists.
    pub(crate) fn confirm_channel(
        &mut self,
        number: u16,
        peer: SocketAddr,
    ) -> Result<(), Error> {
        let cb = self
            .channel_bindings
            .get_mut(&number)
            .filter(|cb| cb.peer() == peer && !cb.is_expired())
            .ok_or(Error::NoSuchChannelBind)?;
        cb.confirm();
        Ok(())
    }

    /// Gets the peer address of the active [`ChannelBind`] with the provided
    /// `number`.
    pub(crate) fn get_channel_addr(&self, number: u16) -> Option<SocketAddr> {
        self.channel_bindings
            .get(&number)
            .filter(|cb| !cb.is_expired())
            .map(ChannelBind::peer)
    }

    /// Gets the number of the active [`ChannelBind`] bound to the provided
    /// `peer`.
    pub(crate) fn get_channel_number(&self, peer: SocketAddr) -> Option<u16> {
        self.channel_bindings
            .values()
            .find(|cb| cb.peer() == peer && !cb.is_expired())
            .map(ChannelBind::num)
    }

    /// Sends the provided `data` to a peer via the relay socket.
    ///
    /// Returns `false` if the `target` has no active [`ChannelBind`] or
    /// [`Permission`], or the sending failed, in which case nothing is sent.
    pub(crate) async fn send_data_to_peer(
        &mut self,
        target: PeerTarget,
        data: &[u8],
    ) -> bool {
        let peer = match target {
            PeerTarget::Channel(number) => {
                let Some(peer) = self.get_channel_addr(number) else {
                    log::debug!(
                        "No channel {number:#06X} on allocation {}, dropping \
                         {} bytes",
                        self.key,
                        data.len(),
                    );
                    return false;
                };
                peer
            }
            PeerTarget::Tuple(peer) => {
                if !self.has_permission(peer.ip()) {
                    log::debug!(
                        "No permission for {peer} on allocation {}, dropping \
                         {} bytes",
                        self.key,
                        data.len(),
                    );
                    return false;
                }
                peer
            }
        };

        match self.relay_socket.send_to(data, peer).await {
            Ok(n) => {
                self.relayed_bytes += n;
                true
            }
            Err(e) => {
                log::warn!(
                    "Failed to relay data from allocation {} to {peer}: {e}",
                    self.key,
                );
                false
            }
        }
    }

    /// Encodes the `data` received from the `peer` for delivery to the
    /// client.
    ///
    /// A confirmed [`ChannelBind`] to the `peer` produces a [`ChannelData`]
    /// message, otherwise a `Data` indication is produced. Returns [`None`]
    /// if there is neither an active [`Permission`] for the `peer` nor an
    /// active [`ChannelBind`] to it.
    ///
    /// [`ChannelData`]: crate::chandata::ChannelData
    pub(crate) fn data_to_client(
        &mut self,
        peer: SocketAddr,
        data: &[u8],
        framing: Framing,
    ) -> Option<Vec<u8>> {
        let channel = self
            .channel_bindings
            .values()
            .find(|cb| cb.peer() == peer && !cb.is_expired());
        if channel.is_none() && !self.has_permission(peer.ip()) {
            log::info!(
                "No Permission or Channel exists for {peer} on allocation {}",
                self.relay_addr,
            );
            return None;
        }

        let out = match channel {
            Some(cb) if cb.is_confirmed() => {
                framing.encode_channel_data(data, cb.num())
            }
            _ => {
                log::trace!(
                    "relaying message from {peer} to client at {}",
                    self.key.remote,
                );
                let mut msg = StunMessage::new(
                    Class::Indication,
                    Method::Data,
                    TransactionId::random(),
                );
                msg.xor_peer_addresses.push(peer);
                msg.data = Some(Bytes::copy_from_slice(data));
                msg.fingerprint = Some(0);
                framing.encode_message(&msg)
            }
        };
        self.relayed_bytes += data.len();

        Some(out)
    }

    /// Returns the [`AllocationInfo`] of this [`Allocation`].
    pub(crate) fn info(&self) -> AllocationInfo {
        AllocationInfo {
            key: self.key,
            username: self.credentials.username.clone(),
            relayed_bytes: self.relayed_bytes,
        }
    }

    /// Disables the close notification of this [`Allocation`], so its
    /// relay can be moved into another one.
    pub(crate) fn silence(&mut self) {
        self.alloc_close_notify = None;
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.reader.abort();
        self.timer.abort();

        if let Some(notify_tx) = self.alloc_close_notify.take() {
            if let Err(e) = notify_tx.try_send(self.info()) {
                log::warn!("Failed to notify about closed allocation: {e}");
            }
        }
        log::debug!("Allocation {} closed", self.key);
    }
}

/// Spawns the task forwarding datagrams of the `socket` as
/// [`Event::PeerData`].
fn spawn_reader(
    key: AllocationKey,
    generation: u64,
    socket: Arc<UdpSocket>,
    events_tx: mpsc::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; INBOUND_MTU];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    log::debug!("exit relay read loop of {key} on error: {e}");
                    break;
                }
            };
            let data = Bytes::copy_from_slice(buf.get(..n).unwrap_or(&[]));
            let event = Event::PeerData { key, generation, peer, data };
            if events_tx.send(event).await.is_err() {
                break;
            }
        }
    })
}

/// Spawns the single-shot timer emitting [`Event::Expired`] at the
/// `deadline`.
fn spawn_timer(
    key: AllocationKey,
    generation: u64,
    deadline: Instant,
    events_tx: mpsc::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sleep_until(deadline).await;
        drop(events_tx.send(Event::Expired { key, generation }).await);
    })
}
