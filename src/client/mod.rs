//! Asynchronous [TURN] client.
//!
//! [`TurnAsyncSocket`] drives a single allocation on a [TURN] server over
//! UDP. Every operation is queued to a background task, and its outcome is
//! reported to a [`TurnAsyncSocketHandler`].
//!
//! [TURN]: https://en.wikipedia.org/wiki/TURN

mod transaction;

use std::{
    collections::HashMap,
    mem,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use bytes::Bytes;
use secrecy::{ExposeSecret as _, SecretString};
use tokio::{
    net::UdpSocket,
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep_until},
};

use crate::{
    Error, PortProps,
    attr::{self, CHANNEL_NUMBER_MAX, CHANNEL_NUMBER_MIN, EvenPort},
    chandata::ChannelData,
    integrity::IntegrityKey,
    message::{Class, Method, StunMessage, TransactionId},
    transport::{self, INBOUND_MTU, TransportType},
};

use self::transaction::Transaction;

/// Capacity of the channel delivering commands to the client task.
const COMMANDS_CAPACITY: usize = 64;

/// Outcome of a successful allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AllocationResult {
    /// Server reflexive address of the client.
    pub reflexive: Option<SocketAddr>,

    /// Relayed transport address.
    pub relay: SocketAddr,

    /// Granted lifetime, in seconds.
    pub lifetime: u32,

    /// Granted bandwidth, in kbit/s.
    pub bandwidth: Option<u32>,

    /// Token of the reserved next port, if requested.
    pub reservation_token: Option<u64>,
}

/// Receiver of [`TurnAsyncSocket`] outcomes.
///
/// Called from the client task, so implementations should return quickly.
pub trait TurnAsyncSocketHandler: Send + Sync {
    /// `Binding` request succeeded with the provided reflexive address.
    fn on_bind_success(&self, _reflexive: SocketAddr) {}

    /// `Binding` request failed.
    fn on_bind_failure(&self, _error: &Error) {}

    /// `Allocate` request succeeded.
    fn on_allocation_success(&self, _result: &AllocationResult) {}

    /// `Allocate` request failed.
    fn on_allocation_failure(&self, _error: &Error) {}

    /// `Refresh` request succeeded with the provided lifetime, zero meaning
    /// the allocation is destroyed.
    fn on_refresh_success(&self, _lifetime: u32) {}

    /// `Refresh` request failed.
    fn on_refresh_failure(&self, _error: &Error) {}

    /// Data was sent to the server.
    fn on_send_success(&self) {}

    /// Data couldn't be sent.
    fn on_send_failure(&self, _error: &Error) {}

    /// Data was received from the provided peer.
    fn on_receive_success(&self, _peer: SocketAddr, _data: &[u8]) {}

    /// Received data couldn't be delivered.
    fn on_receive_failure(&self, _error: &Error) {}
}

/// Parameters of an `Allocate` request.
#[derive(Clone, Copy, Debug, Default)]
struct AllocateParams {
    /// Requested lifetime, in seconds.
    lifetime: Option<u32>,

    /// Requested bandwidth, in kbit/s.
    bandwidth: Option<u32>,

    /// Requested relay port properties.
    port_props: PortProps,

    /// Token of a previously reserved port.
    reservation_token: Option<u64>,

    /// Requested relay transport.
    transport: TransportType,
}

/// Operation queued to the client task.
#[derive(Debug)]
enum Command {
    /// Sets the credentials to sign requests with.
    SetCredentials(String, SecretString),

    /// Sends a `Binding` request.
    Bind,

    /// Sends an `Allocate` request.
    Allocate(AllocateParams),

    /// Sends a `Refresh` request with the provided lifetime.
    Refresh(u32),

    /// Sets the peer [`Command::Send`] sends to.
    SetActiveDestination(SocketAddr),

    /// Clears the active destination.
    ClearActiveDestination,

    /// Sends data to the active destination.
    Send(Bytes),

    /// Sends data to the provided peer.
    SendTo(SocketAddr, Bytes),
}

/// Asynchronous [TURN] client socket.
///
/// [TURN]: https://en.wikipedia.org/wiki/TURN
#[derive(Debug)]
pub struct TurnAsyncSocket {
    /// Channel to the client task.
    command_tx: mpsc::Sender<Command>,

    /// Local address of the client socket.
    local_addr: SocketAddr,

    /// Client task.
    task: JoinHandle<()>,
}

impl TurnAsyncSocket {
    /// Binds a local UDP socket and starts talking to the provided [TURN]
    /// `server`.
    ///
    /// # Errors
    ///
    /// With [`Error::Transport`] if the local socket cannot be bound.
    ///
    /// [TURN]: https://en.wikipedia.org/wiki/TURN
    pub async fn connect(
        server: SocketAddr,
        handler: Arc<dyn TurnAsyncSocketHandler>,
    ) -> Result<Self, Error> {
        let bind_addr = if server.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket =
            UdpSocket::bind(bind_addr).await.map_err(transport::Error::from)?;
        let local_addr = socket.local_addr().map_err(transport::Error::from)?;

        let (command_tx, command_rx) = mpsc::channel(COMMANDS_CAPACITY);
        let task = tokio::spawn(Actor::new(socket, server, handler).run(command_rx));

        Ok(Self { command_tx, local_addr, task })
    }

    /// Returns the local address of this [`TurnAsyncSocket`].
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sets the credentials all the following requests are signed with.
    ///
    /// # Errors
    ///
    /// With [`Error::Closed`] if this [`TurnAsyncSocket`] is closed.
    pub async fn set_username_and_password(
        &self,
        username: String,
        password: SecretString,
    ) -> Result<(), Error> {
        self.command(Command::SetCredentials(username, password)).await
    }

    /// Sends a `Binding` request.
    ///
    /// # Errors
    ///
    /// With [`Error::Closed`] if this [`TurnAsyncSocket`] is closed.
    pub async fn bind_request(&self) -> Result<(), Error> {
        self.command(Command::Bind).await
    }

    /// Requests a new allocation.
    ///
    /// # Errors
    ///
    /// With [`Error::Closed`] if this [`TurnAsyncSocket`] is closed.
    pub async fn create_allocation(
        &self,
        lifetime: Option<u32>,
        bandwidth: Option<u32>,
        port_props: PortProps,
        reservation_token: Option<u64>,
        transport: TransportType,
    ) -> Result<(), Error> {
        self.command(Command::Allocate(AllocateParams {
            lifetime,
            bandwidth,
            port_props,
            reservation_token,
            transport,
        }))
        .await
    }

    /// Refreshes the current allocation with the provided `lifetime`, in
    /// seconds.
    ///
    /// # Errors
    ///
    /// With [`Error::Closed`] if this [`TurnAsyncSocket`] is closed.
    pub async fn refresh_allocation(&self, lifetime: u32) -> Result<(), Error> {
        self.command(Command::Refresh(lifetime)).await
    }

    /// Destroys the current allocation.
    ///
    /// # Errors
    ///
    /// With [`Error::Closed`] if this [`TurnAsyncSocket`] is closed.
    pub async fn destroy_allocation(&self) -> Result<(), Error> {
        self.command(Command::Refresh(0)).await
    }

    /// Makes the provided `peer` the destination of [`Self::send()`],
    /// binding a channel to it if there is none yet.
    ///
    /// # Errors
    ///
    /// With [`Error::Closed`] if this [`TurnAsyncSocket`] is closed.
    pub async fn set_active_destination(
        &self,
        peer: SocketAddr,
    ) -> Result<(), Error> {
        self.command(Command::SetActiveDestination(peer)).await
    }

    /// Clears the destination of [`Self::send()`].
    ///
    /// # Errors
    ///
    /// With [`Error::Closed`] if this [`TurnAsyncSocket`] is closed.
    pub async fn clear_active_destination(&self) -> Result<(), Error> {
        self.command(Command::ClearActiveDestination).await
    }

    /// Sends `data` to the active destination.
    ///
    /// # Errors
    ///
    /// With [`Error::Closed`] if this [`TurnAsyncSocket`] is closed.
    pub async fn send(&self, data: Bytes) -> Result<(), Error> {
        self.command(Command::Send(data)).await
    }

    /// Sends `data` to the provided `peer`, binding a channel to it if there
    /// is none yet.
    ///
    /// # Errors
    ///
    /// With [`Error::Closed`] if this [`TurnAsyncSocket`] is closed.
    pub async fn send_to(
        &self,
        peer: SocketAddr,
        data: Bytes,
    ) -> Result<(), Error> {
        self.command(Command::SendTo(peer, data)).await
    }

    /// Stops this [`TurnAsyncSocket`], abandoning outstanding requests.
    pub fn close(&self) {
        self.task.abort();
    }

    /// Queues the provided [`Command`] to the client task.
    async fn command(&self, cmd: Command) -> Result<(), Error> {
        self.command_tx.send(cmd).await.map_err(|_| Error::Closed)
    }
}

impl Drop for TurnAsyncSocket {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// What a client request is for.
#[derive(Clone, Copy, Debug)]
enum Purpose {
    /// `Binding` request.
    Bind,

    /// `Allocate` request.
    Allocate,

    /// `Refresh` request with the provided lifetime.
    Refresh(u32),

    /// `ChannelBind` request for the provided peer.
    ChannelBind(SocketAddr),
}

/// Credentials of the client.
#[derive(Debug)]
struct Credentials {
    /// Username.
    username: String,

    /// Password.
    password: SecretString,

    /// Realm challenged by the server.
    realm: Option<String>,

    /// Nonce challenged by the server.
    nonce: Option<String>,
}

/// Peer the client talks to through a channel.
#[derive(Debug)]
struct Peer {
    /// Channel bound to the peer.
    channel: u16,

    /// Whether the server confirmed the channel binding.
    confirmed: bool,

    /// Data waiting for the channel binding to be confirmed.
    queued: Vec<Bytes>,
}

/// Task owning the state of a [`TurnAsyncSocket`].
struct Actor {
    /// Client socket.
    socket: UdpSocket,

    /// Address of the server.
    server: SocketAddr,

    /// Receiver of outcomes.
    handler: Arc<dyn TurnAsyncSocketHandler>,

    /// Credentials to sign requests with.
    credentials: Option<Credentials>,

    /// Outstanding requests.
    transactions: HashMap<TransactionId, Transaction<Purpose>>,

    /// Current allocation.
    allocation: Option<AllocationResult>,

    /// Peers by their addresses.
    peers: HashMap<SocketAddr, Peer>,

    /// Peer addresses by their channels.
    channels: HashMap<u16, SocketAddr>,

    /// Next channel number to try.
    next_channel: u16,

    /// Destination of [`Command::Send`].
    active_destination: Option<SocketAddr>,
}

impl Actor {
    /// Creates a new [`Actor`].
    fn new(
        socket: UdpSocket,
        server: SocketAddr,
        handler: Arc<dyn TurnAsyncSocketHandler>,
    ) -> Self {
        Self {
            socket,
            server,
            handler,
            credentials: None,
            transactions: HashMap::new(),
            allocation: None,
            peers: HashMap::new(),
            channels: HashMap::new(),
            next_channel: CHANNEL_NUMBER_MIN,
            active_destination: None,
        }
    }

    /// Runs this [`Actor`] until its [`TurnAsyncSocket`] is dropped.
    async fn run(mut self, mut command_rx: mpsc::Receiver<Command>) {
        let mut buf = vec![0; INBOUND_MTU];
        loop {
            let deadline =
                self.transactions.values().map(Transaction::deadline).min();

            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((n, from)) if from == self.server => {
                        self.handle_inbound(&buf[..n]).await;
                    }
                    Ok((_, from)) => {
                        log::debug!("Dropping datagram from stranger {from}");
                    }
                    Err(e) => {
                        log::warn!("Client socket failed: {e}");
                        self.handler.on_receive_failure(
                            &Error::Transport(e.into()),
                        );
                        break;
                    }
                },
                () = sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    self.handle_deadlines().await;
                }
            }
        }
    }

    /// Handles a [`Command`].
    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetCredentials(username, password) => {
                self.credentials = Some(Credentials {
                    username,
                    password,
                    realm: None,
                    nonce: None,
                });
            }
            Command::Bind => {
                self.start(StunMessage::request(Method::Binding), Purpose::Bind)
                    .await;
            }
            Command::Allocate(params) => {
                if self.allocation.is_some() {
                    self.handler.on_allocation_failure(&Error::AlreadyAllocated);
                    return;
                }
                self.start(allocate_request(params), Purpose::Allocate).await;
            }
            Command::Refresh(lifetime) => {
                if self.allocation.is_none() {
                    self.handler.on_refresh_failure(&Error::NoAllocation);
                    return;
                }
                let mut req = StunMessage::request(Method::Refresh);
                req.lifetime = Some(lifetime);
                self.start(req, Purpose::Refresh(lifetime)).await;
            }
            Command::SetActiveDestination(peer) => {
                if self.allocation.is_none() {
                    self.handler.on_send_failure(&Error::NoAllocation);
                    return;
                }
                if !self.peers.contains_key(&peer) {
                    self.bind_channel(peer, Vec::new()).await;
                }
                self.active_destination = Some(peer);
            }
            Command::ClearActiveDestination => {
                self.active_destination = None;
            }
            Command::Send(data) => {
                if let Some(peer) = self.active_destination {
                    self.send_data(peer, data).await;
                } else {
                    self.handler.on_send_failure(&Error::NoActiveDestination);
                }
            }
            Command::SendTo(peer, data) => self.send_data(peer, data).await,
        }
    }

    /// Sends `data` to the `peer` through its channel, queueing it until the
    /// channel is confirmed.
    async fn send_data(&mut self, peer: SocketAddr, data: Bytes) {
        if self.allocation.is_none() {
            self.handler.on_send_failure(&Error::NoAllocation);
            return;
        }
        match self.peers.get_mut(&peer) {
            Some(p) if p.confirmed => {
                let channel = p.channel;
                self.send_channel_data(channel, &data).await;
            }
            Some(p) => p.queued.push(data),
            None => self.bind_channel(peer, vec![data]).await,
        }
    }

    /// Sends a `ChannelBind` request for the `peer`.
    async fn bind_channel(&mut self, peer: SocketAddr, queued: Vec<Bytes>) {
        let Some(channel) = self.free_channel() else {
            self.handler.on_send_failure(&Error::NoSuchChannelBind);
            return;
        };
        drop(self.channels.insert(channel, peer));
        drop(self.peers.insert(peer, Peer { channel, confirmed: false, queued }));

        let mut req = StunMessage::request(Method::ChannelBind);
        req.channel_number = Some(channel);
        req.xor_peer_addresses.push(peer);
        self.start(req, Purpose::ChannelBind(peer)).await;
    }

    /// Picks a channel number not bound to any peer.
    fn free_channel(&mut self) -> Option<u16> {
        for _ in CHANNEL_NUMBER_MIN..=CHANNEL_NUMBER_MAX {
            let channel = self.next_channel;
            self.next_channel = if channel == CHANNEL_NUMBER_MAX {
                CHANNEL_NUMBER_MIN
            } else {
                channel + 1
            };
            if !self.channels.contains_key(&channel) {
                return Some(channel);
            }
        }
        None
    }

    /// Signs and sends the provided request, tracking its [`Transaction`].
    async fn start(&mut self, mut req: StunMessage, purpose: Purpose) {
        self.sign(&mut req);
        let tx = Transaction::new(req, purpose);
        self.send_raw(tx.encoded()).await;
        drop(self.transactions.insert(tx.request.transaction_id, tx));
    }

    /// Adds the current credentials to the provided request.
    fn sign(&self, req: &mut StunMessage) {
        req.fingerprint = Some(0);
        let Some(creds) = &self.credentials else {
            return;
        };

        req.username = Some(creds.username.clone());
        let password = creds.password.expose_secret();
        req.hmac_key = Some(if let (Some(realm), Some(nonce)) =
            (&creds.realm, &creds.nonce)
        {
            req.realm = Some(realm.clone());
            req.nonce = Some(nonce.clone());
            IntegrityKey::long_term(&creds.username, realm, password)
        } else {
            IntegrityKey::short_term(password)
        });
    }

    /// Sends the provided raw bytes to the server.
    async fn send_raw(&self, data: &[u8]) {
        if let Err(e) = self.socket.send_to(data, self.server).await {
            log::warn!("Failed to send to {}: {e}", self.server);
        }
    }

    /// Sends a [`ChannelData`] message to the server.
    async fn send_channel_data(&self, channel: u16, data: &[u8]) {
        let out = ChannelData::encode(data, channel, false);
        match self.socket.send_to(&out, self.server).await {
            Ok(_) => self.handler.on_send_success(),
            Err(e) => self.handler.on_send_failure(&Error::Transport(e.into())),
        }
    }

    /// Handles a datagram received from the server.
    async fn handle_inbound(&mut self, buf: &[u8]) {
        if ChannelData::is_channel_data(buf) {
            match ChannelData::decode(buf) {
                Ok(cd) => {
                    if let Some(&peer) = self.channels.get(&cd.number) {
                        self.handler.on_receive_success(peer, &cd.data);
                    } else {
                        self.handler
                            .on_receive_failure(&Error::NoSuchChannelBind);
                    }
                }
                Err(e) => log::debug!("Dropping malformed ChannelData: {e}"),
            }
            return;
        }

        let msg = match StunMessage::parse(buf) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Dropping malformed message: {e}");
                return;
            }
        };
        match (msg.class, msg.method) {
            (Class::Indication, Method::Data) => {
                if let (Some(&peer), Some(data)) =
                    (msg.xor_peer_addresses.first(), &msg.data)
                {
                    self.handler.on_receive_success(peer, data);
                } else {
                    self.handler.on_receive_failure(&Error::MissingAttributes);
                }
            }
            (Class::SuccessResponse | Class::ErrorResponse, _) => {
                if let Some(tx) = self.transactions.remove(&msg.transaction_id)
                {
                    self.handle_response(tx, msg).await;
                } else {
                    log::debug!("Dropping response to unknown transaction");
                }
            }
            (Class::Request | Class::Indication, method) => {
                log::debug!("Ignoring {} {method} from server", msg.class);
            }
        }
    }

    /// Handles the response to the provided [`Transaction`].
    async fn handle_response(
        &mut self,
        tx: Transaction<Purpose>,
        msg: StunMessage,
    ) {
        if msg.class == Class::ErrorResponse {
            let code = msg.error_code.as_ref().map_or(0, |e| e.code);
            let challenged = matches!(code, 401 | 435 | 438)
                && !tx.auth_retried
                && msg.realm.is_some()
                && msg.nonce.is_some();
            if let (true, Some(creds)) = (challenged, &mut self.credentials) {
                creds.realm = msg.realm;
                creds.nonce = msg.nonce;

                let mut req = tx.request;
                req.transaction_id = TransactionId::random();
                self.sign(&mut req);
                let mut retry = Transaction::new(req, tx.purpose);
                retry.auth_retried = true;
                self.send_raw(retry.encoded()).await;
                drop(self.transactions.insert(retry.request.transaction_id, retry));
                return;
            }

            log::debug!("{} failed with {code}", tx.request.method);
            self.fail(tx.purpose, &Error::ErrorResponse(code));
            return;
        }

        match tx.purpose {
            Purpose::Bind => {
                match msg.xor_mapped_address.or(msg.mapped_address) {
                    Some(addr) => self.handler.on_bind_success(addr),
                    None => {
                        self.handler.on_bind_failure(&Error::MissingAttributes);
                    }
                }
            }
            Purpose::Allocate => {
                let (Some(relay), Some(lifetime)) =
                    (msg.xor_relayed_address, msg.lifetime)
                else {
                    self.handler
                        .on_allocation_failure(&Error::MissingAttributes);
                    return;
                };
                let result = AllocationResult {
                    reflexive: msg.xor_mapped_address,
                    relay,
                    lifetime,
                    bandwidth: msg.bandwidth,
                    reservation_token: msg.reservation_token,
                };
                self.allocation = Some(result);
                self.handler.on_allocation_success(&result);
            }
            Purpose::Refresh(requested) => {
                let lifetime = msg.lifetime.unwrap_or(requested);
                if lifetime == 0 {
                    self.allocation = None;
                    self.peers.clear();
                    self.channels.clear();
                    self.active_destination = None;
                } else if let Some(alloc) = &mut self.allocation {
                    alloc.lifetime = lifetime;
                }
                self.handler.on_refresh_success(lifetime);
            }
            Purpose::ChannelBind(peer) => {
                let Some(p) = self.peers.get_mut(&peer) else {
                    return;
                };
                p.confirmed = true;
                let channel = p.channel;
                let queued = mem::take(&mut p.queued);

                let mut confirm = StunMessage::new(
                    Class::Indication,
                    Method::ChannelBind,
                    TransactionId::random(),
                );
                confirm.channel_number = Some(channel);
                confirm.xor_peer_addresses.push(peer);
                confirm.fingerprint = Some(0);
                self.send_raw(&confirm.encode()).await;

                for data in queued {
                    self.send_channel_data(channel, &data).await;
                }
            }
        }
    }

    /// Retransmits or times out the [`Transaction`]s whose deadline passed.
    async fn handle_deadlines(&mut self) {
        let now = Instant::now();
        let due = self
            .transactions
            .iter()
            .filter(|(_, tx)| tx.deadline() <= now)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in due {
            let Some(tx) = self.transactions.get_mut(&id) else {
                continue;
            };
            if let Some(data) = tx.on_deadline().map(<[u8]>::to_vec) {
                self.send_raw(&data).await;
            } else if let Some(tx) = self.transactions.remove(&id) {
                log::debug!("{} timed out", tx.request.method);
                self.fail(tx.purpose, &Error::ResponseTimeout);
            }
        }
    }

    /// Reports the failure of a request.
    fn fail(&mut self, purpose: Purpose, error: &Error) {
        match purpose {
            Purpose::Bind => self.handler.on_bind_failure(error),
            Purpose::Allocate => self.handler.on_allocation_failure(error),
            Purpose::Refresh(_) => self.handler.on_refresh_failure(error),
            Purpose::ChannelBind(peer) => {
                if let Some(p) = self.peers.remove(&peer) {
                    drop(self.channels.remove(&p.channel));
                }
                if self.active_destination == Some(peer) {
                    self.active_destination = None;
                }
                self.handler.on_send_failure(error);
            }
        }
    }
}

/// Builds an `Allocate` request out of the provided [`AllocateParams`].
fn allocate_request(params: AllocateParams) -> StunMessage {
    let mut req = StunMessage::request(Method::Allocate);
    req.lifetime = params.lifetime;
    req.bandwidth = params.bandwidth;
    req.reservation_token = params.reservation_token;
    req.requested_transport = match params.transport {
        TransportType::Udp => Some(attr::PROTO_UDP),
        TransportType::Tcp | TransportType::Tls => Some(attr::PROTO_TCP),
        TransportType::None => None,
    };
    req.even_port = match params.port_props {
        PortProps::Even => Some(EvenPort { reserve_next: false }),
        PortProps::EvenPair => Some(EvenPort { reserve_next: true }),
        PortProps::Odd => {
            log::warn!("Odd relay port cannot be requested, asking for any");
            None
        }
        PortProps::Any => None,
    };
    req
}

#[cfg(test)]
mod client_spec {
    use std::net::IpAddr;

    use tokio::time::{Duration, timeout};

    use super::*;
    use crate::{
        AuthMode, Config, Server, ServerConfig, StaticAuthHandler, relay,
        transport::{Transport as _, Udp},
    };

    #[derive(Debug, PartialEq)]
    enum Outcome {
        Bound(SocketAddr),
        Allocated(AllocationResult),
        Refreshed(u32),
        Sent,
        Received(SocketAddr, Vec<u8>),
        Failed(&'static str, String),
    }

    struct Recorder(mpsc::UnboundedSender<Outcome>);

    impl Recorder {
        fn record(&self, outcome: Outcome) {
            _ = self.0.send(outcome);
        }
    }

    impl TurnAsyncSocketHandler for Recorder {
        fn on_bind_success(&self, reflexive: SocketAddr) {
            self.record(Outcome::Bound(reflexive));
        }

        fn on_bind_failure(&self, error: &Error) {
            self.record(Outcome::Failed("bind", error.to_string()));
        }

        fn on_allocation_success(&self, result: &AllocationResult) {
            self.record(Outcome::Allocated(*result));
        }

        fn on_allocation_failure(&self, error: &Error) {
            self.record(Outcome::Failed("allocation", error.to_string()));
        }

        fn on_refresh_success(&self, lifetime: u32) {
            self.record(Outcome::Refreshed(lifetime));
        }

        fn on_refresh_failure(&self, error: &Error) {
            self.record(Outcome::Failed("refresh", error.to_string()));
        }

        fn on_send_success(&self) {
            self.record(Outcome::Sent);
        }

        fn on_send_failure(&self, error: &Error) {
            self.record(Outcome::Failed("send", error.to_string()));
        }

        fn on_receive_success(&self, peer: SocketAddr, data: &[u8]) {
            self.record(Outcome::Received(peer, data.to_vec()));
        }
    }

    async fn client(
        server: SocketAddr,
    ) -> (TurnAsyncSocket, mpsc::UnboundedReceiver<Outcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = TurnAsyncSocket::connect(server, Arc::new(Recorder(tx)))
            .await
            .unwrap();
        (client, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    async fn long_term_server() -> (Server, SocketAddr) {
        let conn = Udp::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
            .unwrap();
        let addr = conn.local_addr();
        let server = Server::new(Config {
            connections: vec![Arc::new(conn)],
            relay: relay::Allocator {
                relay_address: IpAddr::from([127, 0, 0, 1]),
                bind_address: IpAddr::from([127, 0, 0, 1]),
                min_port: 49152,
                max_port: 65535,
            },
            auth_handler: Arc::new(StaticAuthHandler::new([(
                String::from("user"),
                SecretString::from(String::from("pass")),
            )])),
            server: ServerConfig {
                auth_mode: AuthMode::LongTerm,
                ..ServerConfig::default()
            },
            alloc_close_notify: None,
        });
        (server, addr)
    }

    #[tokio::test]
    async fn allocates_and_relays_through_channel() {
        let (server, addr) = long_term_server().await;
        let (client, mut outcomes) = client(addr).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        client
            .set_username_and_password(
                String::from("user"),
                SecretString::from(String::from("pass")),
            )
            .await
            .unwrap();

        client.bind_request().await.unwrap();
        let Outcome::Bound(reflexive) = next(&mut outcomes).await else {
            panic!("expected bind success");
        };
        assert_eq!(reflexive.port(), client.local_addr().port());

        client
            .create_allocation(
                Some(60),
                None,
                PortProps::Any,
                None,
                TransportType::Udp,
            )
            .await
            .unwrap();
        let Outcome::Allocated(result) = next(&mut outcomes).await else {
            panic!("expected allocation success");
        };
        assert_eq!(result.lifetime, 60);
        assert_eq!(result.relay.ip(), IpAddr::from([127, 0, 0, 1]));
        assert_eq!(result.reflexive, Some(reflexive));

        client
            .create_allocation(None, None, PortProps::Any, None, TransportType::Udp)
            .await
            .unwrap();
        assert_eq!(
            next(&mut outcomes).await,
            Outcome::Failed("allocation", Error::AlreadyAllocated.to_string()),
        );

        client.set_active_destination(peer_addr).await.unwrap();
        client.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(next(&mut outcomes).await, Outcome::Sent);

        let mut buf = [0; 64];
        let (n, from) = timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, result.relay);

        peer.send_to(b"world", from).await.unwrap();
        assert_eq!(
            next(&mut outcomes).await,
            Outcome::Received(peer_addr, b"world".to_vec()),
        );

        client.destroy_allocation().await.unwrap();
        assert_eq!(next(&mut outcomes).await, Outcome::Refreshed(0));
        assert!(
            server.get_allocations_info(None).await.unwrap().is_empty(),
            "allocation must be destroyed",
        );

        client.send(Bytes::from_static(b"late")).await.unwrap();
        assert_eq!(
            next(&mut outcomes).await,
            Outcome::Failed("send", Error::NoActiveDestination.to_string()),
        );
    }

    #[tokio::test]
    async fn rejects_operations_without_allocation() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (client, mut outcomes) = client(silent.local_addr().unwrap()).await;
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        client.send(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(
            next(&mut outcomes).await,
            Outcome::Failed("send", Error::NoActiveDestination.to_string()),
        );

        client.send_to(peer, Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(
            next(&mut outcomes).await,
            Outcome::Failed("send", Error::NoAllocation.to_string()),
        );

        client.refresh_allocation(60).await.unwrap();
        let Outcome::Failed("refresh", _) = next(&mut outcomes).await else {
            panic!("expected refresh failure");
        };
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_unanswered_requests() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (client, mut outcomes) = client(silent.local_addr().unwrap()).await;

        client.bind_request().await.unwrap();

        assert_eq!(
            outcomes.recv().await.unwrap(),
            Outcome::Failed("bind", Error::ResponseTimeout.to_string()),
        );
        let mut buf = [0; 64];
        let mut received = 0;
        while let Ok(Ok(_)) =
            timeout(Duration::from_secs(1), silent.recv_from(&mut buf)).await
        {
            received += 1;
        }
        assert_eq!(received, 1 + usize::from(transaction::MAX_RETRANSMITS));
    }
}
