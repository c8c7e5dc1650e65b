//! Ingress STUN/TURN messages handlers.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use secrecy::{ExposeSecret as _, SecretString};
use tokio::time::Duration;

use crate::{
    AuthHandler,
    allocation::{
        AllocationInfo, AllocationKey, Credentials, Event, Manager, PeerTarget,
        PortProps,
    },
    attr::{self, AddressFamily, CHANGE_IP, CHANGE_PORT, ErrorCode},
    chandata::ChannelData,
    integrity::{self, IntegrityKey, NonceCheck},
    message::{Class, Header, Method, StunMessage},
    transport::{Framing, StunTuple, TransportType},
};

use super::config::{AuthMode, ServerConfig};

/// Outcome of processing an ingress [`StunMessage`].
///
/// The response carries its destination in [`StunMessage::remote_tuple`].
#[derive(Debug)]
pub(crate) enum ProcessResult {
    /// Send the response from the transport the request was received on.
    RespondFromReceiving(Box<StunMessage>),

    /// Send the response from the alternate IP and the receiving port.
    RespondFromAlternateIp(Box<StunMessage>),

    /// Send the response from the receiving IP and the alternate port.
    RespondFromAlternatePort(Box<StunMessage>),

    /// Send the response from the alternate IP and port.
    RespondFromAlternateIpPort(Box<StunMessage>),

    /// Nothing to send.
    NoResponseToSend,
}

/// Source a response is sent from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Source {
    /// Receiving transport.
    Receiving,

    /// Alternate IP, receiving port.
    AlternateIp,

    /// Receiving IP, alternate port.
    AlternatePort,

    /// Alternate IP and port.
    AlternateIpPort,
}

/// Handler of ingress [`StunMessage`]s and [`ChannelData`], owning the
/// allocations state.
#[derive(Debug)]
pub(crate) struct RequestHandler<A> {
    /// Protocol settings.
    config: ServerConfig,

    /// Resolver of long-term passwords.
    auth_handler: Arc<A>,

    /// Allocations.
    manager: Manager,

    /// Key signing issued nonces.
    nonce_key: SecretString,
}

impl<A> RequestHandler<A>
where
    A: AuthHandler + Send + Sync,
{
    /// Creates a new [`RequestHandler`].
    pub(crate) fn new(
        config: ServerConfig,
        auth_handler: Arc<A>,
        manager: Manager,
    ) -> Self {
        Self {
            config,
            auth_handler,
            manager,
            nonce_key: hex::encode(rand::random::<[u8; 16]>()).into(),
        }
    }

    /// Processes the provided [`StunMessage`], which must have its local and
    /// remote tuples filled in.
    pub(crate) async fn process_stun_message(
        &mut self,
        req: &StunMessage,
    ) -> ProcessResult {
        match req.class {
            Class::SuccessResponse | Class::ErrorResponse => {
                log::debug!(
                    "Ignoring {} {} from {}",
                    req.method,
                    req.class,
                    req.remote_tuple,
                );
                return ProcessResult::NoResponseToSend;
            }
            Class::Indication => {
                self.process_indication(req).await;
                return ProcessResult::NoResponseToSend;
            }
            Class::Request => {}
        }

        let mut resp = StunMessage::response_to(req, Class::SuccessResponse);
        let credentials = if req.method == Method::SharedSecret {
            Credentials::default()
        } else {
            match self.authenticate(req, &mut resp) {
                Ok(c) => c,
                Err(()) => return self.finish(resp, Source::Receiving),
            }
        };

        let source = match req.method {
            Method::Binding => self.process_binding(req, &mut resp),
            Method::SharedSecret => self.process_shared_secret(req, &mut resp),
            Method::Allocate => {
                self.process_allocate(req, &credentials, &mut resp).await
            }
            Method::Refresh => {
                self.process_refresh(req, &credentials, &mut resp)
            }
            Method::CreatePermission => {
                self.process_create_permission(req, &credentials, &mut resp)
            }
            Method::ChannelBind => {
                self.process_channel_bind(req, &credentials, &mut resp)
            }
            Method::Send | Method::Data | Method::Unknown(_) => {
                log::warn!(
                    "Unsupported request method {} from {}",
                    req.method,
                    req.remote_tuple,
                );
                error(&mut resp, 400, "Invalid Request Method")
            }
        };

        self.finish(resp, source)
    }

    /// Builds a `420 Unknown Attribute` response to a request carrying
    /// unknown comprehension-required attributes.
    ///
    /// Returns [`ProcessResult::NoResponseToSend`] for non-requests.
    pub(crate) fn process_unknown_attributes(
        &self,
        header: &Header,
        types: &[u16],
        local: StunTuple,
        remote: StunTuple,
    ) -> ProcessResult {
        if header.class != Class::Request {
            log::debug!(
                "Dropping {} {} with unknown attributes {types:04X?}",
                header.method,
                header.class,
            );
            return ProcessResult::NoResponseToSend;
        }

        let mut resp = StunMessage::new(
            Class::ErrorResponse,
            header.method,
            header.transaction_id,
        );
        resp.legacy_cookie = header.legacy_cookie;
        resp.local_tuple = local;
        resp.remote_tuple = remote;
        resp.unknown_attributes = types.to_vec();
        let source = error(&mut resp, 420, "Unknown Attribute");

        self.finish(resp, source)
    }

    /// Relays the provided [`ChannelData`] received from the client of the
    /// `key` allocation.
    pub(crate) async fn process_channel_data(
        &mut self,
        key: &AllocationKey,
        data: ChannelData,
    ) {
        let Some(alloc) = self.manager.get_mut(key) else {
            log::debug!("ChannelData for non-existing allocation {key}");
            return;
        };
        _ = alloc
            .send_data_to_peer(PeerTarget::Channel(data.number), &data.data)
            .await;
    }

    /// Handles an [`Event`] of an allocation.
    ///
    /// Returns the data to be sent to the client of the allocation, if any.
    pub(crate) fn process_event(
        &mut self,
        event: Event,
        framing: Framing,
    ) -> Option<(AllocationKey, Vec<u8>)> {
        match event {
            Event::PeerData { key, generation, peer, data } => self
                .manager
                .handle_peer_data(&key, generation, peer, &data, framing)
                .map(|out| (key, out)),
            Event::Expired { key, generation } => {
                self.manager.handle_expired(&key, generation);
                None
            }
        }
    }

    /// Removes the allocation of the provided `key`, if any.
    pub(crate) fn remove_allocation(&mut self, key: &AllocationKey) {
        if self.manager.remove(key) {
            log::debug!("Allocation {key} removed on disconnect");
        }
    }

    /// Removes all the allocations of the provided `username`.
    pub(crate) fn delete_allocations_by_username(&mut self, username: &str) {
        self.manager.remove_by_username(username);
    }

    /// Returns information about the allocations of the provided `keys`, or
    /// about all of them if [`None`].
    pub(crate) fn allocations_info(
        &self,
        keys: Option<&[AllocationKey]>,
    ) -> HashMap<AllocationKey, AllocationInfo> {
        self.manager.infos(keys)
    }

    /// Authenticates the provided request.
    ///
    /// On success, `resp` is set up to echo the credentials and be signed
    /// with the same key. On failure, `resp` becomes the error response.
    fn authenticate(
        &self,
        req: &StunMessage,
        resp: &mut StunMessage,
    ) -> Result<Credentials, ()> {
        let mode = self.config.auth_mode;

        if req.message_integrity.is_none() {
            if mode == AuthMode::None {
                return Ok(Credentials::default());
            }
            log::debug!(
                "{} request from {} without MESSAGE-INTEGRITY",
                req.method,
                req.remote_tuple,
            );
            _ = self.auth_error(resp, 401, "Unauthorized");
            return Err(());
        }

        let Some(username) = req.username.as_deref() else {
            log::debug!("MESSAGE-INTEGRITY without USERNAME");
            _ = self.auth_error(resp, 432, "Missing Username");
            return Err(());
        };

        let key = if mode == AuthMode::LongTerm {
            let (Some(realm), Some(nonce)) = (&req.realm, &req.nonce) else {
                _ = self.auth_error(resp, 435, "Missing Realm or Nonce");
                return Err(());
            };

            match integrity::check_nonce(
                nonce,
                &self.nonce_key,
                self.config.nonce_lifetime,
            ) {
                NonceCheck::Valid => {}
                NonceCheck::Expired => {
                    _ = self.auth_error(resp, 438, "Stale Nonce");
                    return Err(());
                }
                NonceCheck::NotValid => {
                    _ = error(resp, 400, "Invalid Nonce");
                    return Err(());
                }
            }

            let Ok(password) = self.auth_handler.auth_handle(
                username,
                realm,
                req.remote_tuple.addr,
            ) else {
                log::warn!("Unknown username: {username}");
                _ = self.auth_error(resp, 436, "Unknown Username");
                return Err(());
            };
            IntegrityKey::long_term(username, realm, password.expose_secret())
        } else {
            self.config.short_term_secrets.key_for(username)
        }
        .with_padding(self.config.hmac_padding);

        if !integrity::check_message_integrity(req, &key) {
            log::warn!("MESSAGE-INTEGRITY mismatch from {}", req.remote_tuple);
            _ = self.auth_error(resp, 431, "Integrity Check Failure");
            return Err(());
        }

        resp.username = Some(username.to_owned());
        if mode == AuthMode::LongTerm {
            resp.realm.clone_from(&req.realm);
        }
        resp.hmac_key = Some(key.clone());

        Ok(Credentials { username: Some(username.to_owned()), key: Some(key) })
    }

    /// Turns `resp` into an authentication error response, carrying the
    /// realm and a fresh nonce in long-term mode.
    fn auth_error(
        &self,
        resp: &mut StunMessage,
        code: u16,
        reason: &str,
    ) -> Source {
        if self.config.auth_mode == AuthMode::LongTerm {
            resp.realm = Some(self.config.realm.clone());
            resp.nonce = Some(integrity::generate_nonce(&self.nonce_key));
        }
        error(resp, code, reason)
    }

    /// Handles an indication.
    async fn process_indication(&mut self, req: &StunMessage) {
        let key = AllocationKey::new(req.local_tuple, req.remote_tuple);
        match req.method {
            Method::Send => {
                let Some(alloc) = self.manager.get_mut(&key) else {
                    log::debug!(
                        "Send indication for non-existing allocation {key}",
                    );
                    return;
                };
                let Some(&peer) = req.xor_peer_addresses.first() else {
                    log::debug!("Send indication without XOR-PEER-ADDRESS");
                    return;
                };
                if let Some(data) = &req.data {
                    _ = alloc
                        .send_data_to_peer(PeerTarget::Tuple(peer), data)
                        .await;
                } else {
                    _ = alloc.refresh_permission(peer.ip());
                }
            }
            Method::ChannelBind => {
                let (Some(number), Some(&peer)) =
                    (req.channel_number, req.xor_peer_addresses.first())
                else {
                    log::debug!("Channel confirmation without attributes");
                    return;
                };
                let res = self
                    .manager
                    .get_mut(&key)
                    .map(|a| a.confirm_channel(number, peer));
                if !matches!(res, Some(Ok(()))) {
                    log::debug!(
                        "Channel confirmation of {number:#06X} to {peer} on \
                         {key} ignored",
                    );
                }
            }
            Method::Binding => {
                log::trace!("Keepalive from {}", req.remote_tuple);
            }
            Method::SharedSecret
            | Method::Allocate
            | Method::Refresh
            | Method::Data
            | Method::CreatePermission
            | Method::Unknown(_) => {
                log::debug!(
                    "Ignoring {} indication from {}",
                    req.method,
                    req.remote_tuple,
                );
            }
        }
    }

    /// Handles a `Binding` request.
    fn process_binding(
        &self,
        req: &StunMessage,
        resp: &mut StunMessage,
    ) -> Source {
        let remote = req.remote_tuple.addr;
        if req.has_magic_cookie() {
            resp.xor_mapped_address = Some(remote);
        } else {
            resp.mapped_address = Some(remote);
        }

        let Some(addrs) = self.config.rfc3489 else {
            return Source::Receiving;
        };
        let local = req.local_tuple.addr;
        let is_dual_socket = [addrs.primary.ip(), addrs.alternate.ip()]
            .contains(&local.ip())
            && [addrs.primary.port(), addrs.alternate.port()]
                .contains(&local.port());
        if !is_dual_socket {
            return Source::Receiving;
        }

        let change = SocketAddr::new(
            if local.ip() == addrs.primary.ip() {
                addrs.alternate.ip()
            } else {
                addrs.primary.ip()
            },
            if local.port() == addrs.primary.port() {
                addrs.alternate.port()
            } else {
                addrs.primary.port()
            },
        );
        let flags = req.change_request.unwrap_or_default();
        let (source, send_from) = match (
            flags & CHANGE_IP != 0,
            flags & CHANGE_PORT != 0,
        ) {
            (true, true) => (Source::AlternateIpPort, change),
            (false, true) => (
                Source::AlternatePort,
                SocketAddr::new(local.ip(), change.port()),
            ),
            (true, false) => (
                Source::AlternateIp,
                SocketAddr::new(change.ip(), local.port()),
            ),
            (false, false) => (Source::Receiving, local),
        };

        resp.mapped_address = Some(remote);
        resp.source_address = Some(send_from);
        resp.changed_address = Some(change);

        if let Some(response_address) = req.response_address {
            resp.remote_tuple.addr = response_address;
            let reflected = req
                .username
                .as_deref()
                .and_then(integrity::tuple_from_username)
                .unwrap_or(remote);
            resp.reflected_from = Some(reflected);
        }

        source
    }

    /// Handles a `SharedSecret` request.
    fn process_shared_secret(
        &self,
        req: &StunMessage,
        resp: &mut StunMessage,
    ) -> Source {
        if req.local_tuple.transport != TransportType::Tls {
            log::warn!(
                "SharedSecret request over {} from {}",
                req.local_tuple.transport,
                req.remote_tuple,
            );
            return error(resp, 433, "Invalid Transport, TLS Required");
        }

        let (username, password) = self
            .config
            .short_term_secrets
            .create_username_and_password(req.remote_tuple.addr);
        resp.username = Some(username);
        resp.password = Some(password.expose_secret().to_owned());

        Source::Receiving
    }

    /// Handles an `Allocate` request.
    #[expect(clippy::too_many_lines, reason = "sequential validation")]
    async fn process_allocate(
        &mut self,
        req: &StunMessage,
        credentials: &Credentials,
        resp: &mut StunMessage,
    ) -> Source {
        resp.xor_mapped_address = Some(req.remote_tuple.addr);

        let key = AllocationKey::new(req.local_tuple, req.remote_tuple);
        log::debug!("Allocate request for {key}");

        if let Some(alloc) = self.manager.get(&key) {
            let existing = alloc.credentials();
            if existing.username != credentials.username {
                return error(resp, 436, "Unknown Username");
            }
            if existing.key != credentials.key {
                return error(resp, 431, "Integrity Check Failure");
            }
        }

        if req.lifetime == Some(0) {
            _ = self.manager.remove(&key);
            resp.lifetime = Some(0);
            return Source::Receiving;
        }
        let lifetime = self.lifetime_of(req);
        let bandwidth = req.bandwidth.unwrap_or(self.config.default_bandwidth);

        if let Some(alloc) = self.manager.get_mut(&key) {
            alloc.refresh(lifetime, bandwidth);
            resp.lifetime = Some(secs(lifetime));
            resp.xor_relayed_address = Some(alloc.relay_addr());
            resp.bandwidth = Some(alloc.bandwidth());
            return Source::Receiving;
        }

        match req.requested_transport {
            None => {
                return error(resp, 400, "Missing REQUESTED-TRANSPORT");
            }
            Some(attr::PROTO_UDP) => {}
            Some(proto) => {
                log::warn!("Unsupported transport requested: {proto}");
                return error(resp, 442, "Unsupported Transport Protocol");
            }
        }

        let mut requested_port = None;
        if let Some(requested) = req.xor_relayed_address {
            let subsumed = self.manager.find_by_relay(requested).filter(|k| {
                k.local == key.local
                    && k.remote != key.remote
                    && self
                        .manager
                        .get(k)
                        .is_some_and(|a| a.credentials() == credentials)
            });
            if let Some(old) = subsumed {
                return match self.manager.subsume(&old, key, lifetime, bandwidth)
                {
                    Ok(relay_addr) => {
                        resp.lifetime = Some(secs(lifetime));
                        resp.xor_relayed_address = Some(relay_addr);
                        resp.bandwidth = Some(bandwidth);
                        Source::Receiving
                    }
                    Err(e) => {
                        log::error!("Failed to subsume {old}: {e}");
                        error(resp, 500, "Server Error")
                    }
                };
            }
            if requested.ip() != self.manager.relay().relay_address {
                return error(resp, 443, "Invalid Requested Address");
            }
            requested_port = Some(requested.port());
        }

        if req.even_port.is_some() && req.reservation_token.is_some() {
            return error(
                resp,
                400,
                "Both EVEN-PORT and RESERVATION-TOKEN present",
            );
        }

        let mut token = None;
        let port = if let Some(t) = req.reservation_token {
            let Some(port) = self.manager.ports().allocate_reserved(t) else {
                return error(resp, 508, "Insufficient Port Capacity");
            };
            port
        } else {
            let props = match req.even_port {
                None => PortProps::Any,
                Some(ep) if ep.reserve_next => PortProps::EvenPair,
                Some(_) => PortProps::Even,
            };
            let exact = requested_port
                .filter(|&p| props == PortProps::Any || p % 2 == 0)
                .filter(|&p| self.manager.ports().allocate_port(p));
            if let Some(p) = exact {
                p
            } else {
                let Some((port, t)) = self.manager.ports().allocate(props)
                else {
                    return error(resp, 444, "Insufficient Capacity");
                };
                token = t;
                port
            }
        };

        match self
            .manager
            .create_allocation(key, credentials.clone(), port, lifetime, bandwidth)
            .await
        {
            Ok(relay_addr) => {
                resp.lifetime = Some(secs(lifetime));
                resp.xor_relayed_address = Some(relay_addr);
                resp.bandwidth = Some(bandwidth);
                resp.reservation_token = token;
                Source::Receiving
            }
            Err(e) => {
                log::error!("Failed to bind relay socket for {key}: {e}");
                if let Some(reserved) =
                    token.and_then(|t| self.manager.ports().allocate_reserved(t))
                {
                    self.manager.ports().release(reserved);
                }
                error(resp, 500, "Server Error")
            }
        }
    }

    /// Handles a `Refresh` request.
    fn process_refresh(
        &mut self,
        req: &StunMessage,
        credentials: &Credentials,
        resp: &mut StunMessage,
    ) -> Source {
        let key = AllocationKey::new(req.local_tuple, req.remote_tuple);
        let Some(alloc) = self.manager.get(&key) else {
            log::warn!("Refresh requested with non-matching allocation {key}");
            return error(resp, 437, "Allocation Mismatch");
        };
        if alloc.credentials() != credentials {
            return error(resp, 441, "Wrong Credentials");
        }

        if req.lifetime == Some(0) {
            _ = self.manager.remove(&key);
            resp.lifetime = Some(0);
            return Source::Receiving;
        }

        let lifetime = self.lifetime_of(req);
        let bandwidth = req.bandwidth.unwrap_or(self.config.default_bandwidth);
        if let Some(alloc) = self.manager.get_mut(&key) {
            alloc.refresh(lifetime, bandwidth);
        }
        resp.lifetime = Some(secs(lifetime));
        resp.bandwidth = Some(bandwidth);

        Source::Receiving
    }

    /// Handles a `CreatePermission` request.
    fn process_create_permission(
        &mut self,
        req: &StunMessage,
        credentials: &Credentials,
        resp: &mut StunMessage,
    ) -> Source {
        let key = AllocationKey::new(req.local_tuple, req.remote_tuple);
        let Some(alloc) = self.manager.get_mut(&key) else {
            return error(resp, 437, "Allocation Mismatch");
        };
        if req.xor_peer_addresses.is_empty() {
            return error(resp, 400, "Missing XOR-PEER-ADDRESS");
        }
        if alloc.credentials() != credentials {
            return error(resp, 441, "Wrong Credentials");
        }
        let family = AddressFamily::of(&alloc.relay_addr());
        if req.xor_peer_addresses.iter().any(|p| AddressFamily::of(p) != family)
        {
            return error(resp, 443, "Peer Address Family Mismatch");
        }

        for peer in &req.xor_peer_addresses {
            alloc.add_permission(peer.ip());
        }

        Source::Receiving
    }

    /// Handles a `ChannelBind` request.
    fn process_channel_bind(
        &mut self,
        req: &StunMessage,
        credentials: &Credentials,
        resp: &mut StunMessage,
    ) -> Source {
        let key = AllocationKey::new(req.local_tuple, req.remote_tuple);
        let confirmed = !self.config.require_channel_confirmation;
        let lifetime = self.config.channel_bind_lifetime;

        let Some(alloc) = self.manager.get_mut(&key) else {
            return error(resp, 437, "Allocation Mismatch");
        };
        let (Some(number), Some(&peer)) =
            (req.channel_number, req.xor_peer_addresses.first())
        else {
            return error(resp, 400, "Missing CHANNEL-NUMBER or Peer Address");
        };
        if !attr::is_valid_channel_number(number) {
            return error(resp, 400, "Invalid Channel Number");
        }
        if alloc.credentials() != credentials {
            return error(resp, 441, "Wrong Credentials");
        }
        if AddressFamily::of(&peer) != AddressFamily::of(&alloc.relay_addr()) {
            return error(resp, 443, "Peer Address Family Mismatch");
        }

        if let Err(e) = alloc.add_channel_bind(number, peer, lifetime, confirmed)
        {
            log::warn!("Channel bind request invalid: {e}");
            return error(resp, 400, "Bad Request");
        }

        Source::Receiving
    }

    /// Calculates the lifetime of an allocation out of the provided request,
    /// ensuring it's not greater than the configured maximum.
    fn lifetime_of(&self, req: &StunMessage) -> Duration {
        req.lifetime.map_or(self.config.default_lifetime, |secs| {
            Duration::from_secs(u64::from(secs)).min(self.config.max_lifetime)
        })
    }

    /// Completes the response: adds `SOFTWARE` and `FINGERPRINT`, and wraps
    /// it into a [`ProcessResult`] according to its [`Source`].
    fn finish(&self, mut resp: StunMessage, source: Source) -> ProcessResult {
        resp.software.clone_from(&self.config.software);
        resp.fingerprint = Some(0);

        let resp = Box::new(resp);
        match source {
            Source::Receiving => ProcessResult::RespondFromReceiving(resp),
            Source::AlternateIp => ProcessResult::RespondFromAlternateIp(resp),
            Source::AlternatePort => {
                ProcessResult::RespondFromAlternatePort(resp)
            }
            Source::AlternateIpPort => {
                ProcessResult::RespondFromAlternateIpPort(resp)
            }
        }
    }
}

/// Turns `resp` into an error response with the provided `code`.
fn error(resp: &mut StunMessage, code: u16, reason: &str) -> Source {
    resp.class = Class::ErrorResponse;
    resp.error_code = Some(ErrorCode::new(code, reason));
    Source::Receiving
}

/// Converts the provided lifetime into seconds of a `LIFETIME` attribute.
fn secs(lifetime: Duration) -> u32 {
    u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod request_spec {
    use std::net::IpAddr;

    use secrecy::SecretString;
    use tokio::{net::UdpSocket, sync::mpsc};

    use super::*;
    use crate::{
        Error,
        allocation::ManagerConfig,
        attr::{CHANNEL_NUMBER_MIN, EvenPort},
        integrity::{GENERATED_USERNAME_LEN_V4, ShortTermSecrets},
        relay,
    };

    const USERNAME: &str = "user";
    const PASSWORD: &str = "pass";
    const REALM: &str = "example.org";

    struct TestAuthHandler;

    impl AuthHandler for TestAuthHandler {
        fn auth_handle(
            &self,
            username: &str,
            _: &str,
            _: SocketAddr,
        ) -> Result<SecretString, Error> {
            if username == USERNAME {
                Ok(SecretString::from(PASSWORD.to_owned()))
            } else {
                Err(Error::NoSuchUser)
            }
        }
    }

    fn secrets() -> ShortTermSecrets {
        ShortTermSecrets {
            username: SecretString::from("username-secret".to_owned()),
            password: SecretString::from("password-secret".to_owned()),
        }
    }

    fn handler(
        mode: AuthMode,
    ) -> (RequestHandler<TestAuthHandler>, mpsc::Receiver<Event>) {
        handler_with_ports(mode, 49152, 65535)
    }

    fn handler_with_ports(
        mode: AuthMode,
        min_port: u16,
        max_port: u16,
    ) -> (RequestHandler<TestAuthHandler>, mpsc::Receiver<Event>) {
        let (events_tx, events_rx) = mpsc::channel(16);
        let manager = Manager::new(ManagerConfig {
            relay: relay::Allocator {
                relay_address: IpAddr::from([127, 0, 0, 1]),
                bind_address: IpAddr::from([127, 0, 0, 1]),
                min_port,
                max_port,
            },
            events_tx,
            alloc_close_notify: None,
        });
        let config = ServerConfig {
            realm: REALM.to_owned(),
            auth_mode: mode,
            short_term_secrets: secrets(),
            ..ServerConfig::default()
        };
        (
            RequestHandler::new(config, Arc::new(TestAuthHandler), manager),
            events_rx,
        )
    }

    fn request(method: Method, remote_port: u16) -> StunMessage {
        let mut req = StunMessage::request(method);
        req.local_tuple = StunTuple::new(
            TransportType::Udp,
            "127.0.0.1:3478".parse().unwrap(),
        );
        req.remote_tuple = StunTuple::new(
            TransportType::Udp,
            SocketAddr::new(IpAddr::from([127, 0, 0, 1]), remote_port),
        );
        req
    }

    /// Signs the `req` with short-term credentials and re-parses it, as if
    /// it was received from the wire.
    fn short_term(mut req: StunMessage) -> StunMessage {
        req.username = Some(USERNAME.to_owned());
        req.hmac_key = Some(secrets().key_for(USERNAME));
        reparse(&req)
    }

    fn reparse(req: &StunMessage) -> StunMessage {
        let mut parsed = StunMessage::parse(&req.encode()).unwrap();
        parsed.local_tuple = req.local_tuple;
        parsed.remote_tuple = req.remote_tuple;
        parsed
    }

    fn allocate(remote_port: u16) -> StunMessage {
        let mut req = request(Method::Allocate, remote_port);
        req.requested_transport = Some(attr::PROTO_UDP);
        req
    }

    fn response(res: ProcessResult) -> StunMessage {
        match res {
            ProcessResult::RespondFromReceiving(m) => *m,
            other => panic!("expected response from receiving, got {other:?}"),
        }
    }

    fn error_code(msg: &StunMessage) -> Option<u16> {
        msg.error_code.as_ref().map(|e| e.code)
    }

    #[tokio::test]
    async fn binds() {
        let (mut h, _events) = handler(AuthMode::None);
        let req = request(Method::Binding, 40000);

        let resp = response(h.process_stun_message(&req).await);

        assert_eq!(resp.class, Class::SuccessResponse);
        assert_eq!(resp.transaction_id, req.transaction_id);
        assert_eq!(resp.xor_mapped_address, Some(req.remote_tuple.addr));
        assert!(resp.software.is_some(), "SOFTWARE must be set");
        assert!(resp.fingerprint.is_some(), "FINGERPRINT must be set");
    }

    #[tokio::test]
    async fn binds_legacy_clients_with_mapped_address() {
        let (mut h, _events) = handler(AuthMode::None);
        let mut req = request(Method::Binding, 40000);
        req.legacy_cookie = Some(0x0102_0304);

        let resp = response(h.process_stun_message(&req).await);

        assert_eq!(resp.mapped_address, Some(req.remote_tuple.addr));
        assert_eq!(resp.xor_mapped_address, None);
        assert!(!resp.has_magic_cookie(), "cookie must be echoed");
    }

    #[tokio::test]
    async fn ignores_responses_and_indications() {
        let (mut h, _events) = handler(AuthMode::LongTerm);

        let mut req = request(Method::Binding, 40000);
        req.class = Class::SuccessResponse;
        assert!(matches!(
            h.process_stun_message(&req).await,
            ProcessResult::NoResponseToSend,
        ));

        req.class = Class::Indication;
        assert!(matches!(
            h.process_stun_message(&req).await,
            ProcessResult::NoResponseToSend,
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_methods() {
        let (mut h, _events) = handler(AuthMode::None);
        let req = request(Method::Unknown(0x0FF), 40000);

        let resp = response(h.process_stun_message(&req).await);

        assert_eq!(resp.class, Class::ErrorResponse);
        assert_eq!(error_code(&resp), Some(400));
    }

    #[tokio::test]
    async fn challenges_long_term_clients() {
        let (mut h, _events) = handler(AuthMode::LongTerm);
        let req = allocate(40000);

        let resp = response(h.process_stun_message(&req).await);

        assert_eq!(error_code(&resp), Some(401));
        assert_eq!(resp.realm.as_deref(), Some(REALM));
        assert!(resp.nonce.is_some(), "401 must carry NONCE");
        assert!(resp.hmac_key.is_none(), "401 must not be signed");
    }

    #[tokio::test]
    async fn authenticates_long_term_clients() {
        let (mut h, _events) = handler(AuthMode::LongTerm);
        let challenge = response(h.process_stun_message(&allocate(40000)).await);

        let mut req = allocate(40000);
        req.username = Some(USERNAME.to_owned());
        req.realm.clone_from(&challenge.realm);
        req.nonce.clone_from(&challenge.nonce);
        req.hmac_key =
            Some(IntegrityKey::long_term(USERNAME, REALM, PASSWORD));
        let resp = response(h.process_stun_message(&reparse(&req)).await);

        assert_eq!(resp.class, Class::SuccessResponse, "{:?}", resp.error_code);
        assert_eq!(resp.username.as_deref(), Some(USERNAME));
        assert_eq!(resp.realm.as_deref(), Some(REALM));
        assert!(resp.hmac_key.is_some(), "response must be signed");

        let key = IntegrityKey::long_term(USERNAME, REALM, PASSWORD);
        let parsed = StunMessage::parse(&resp.encode()).unwrap();
        assert!(integrity::check_message_integrity(&parsed, &key));
        assert!(integrity::check_fingerprint(&parsed));
    }

    #[tokio::test]
    async fn rejects_bad_long_term_credentials() {
        let (mut h, _events) = handler(AuthMode::LongTerm);
        let challenge = response(h.process_stun_message(&allocate(40000)).await);
        let nonce = challenge.nonce.unwrap();

        let mut req = allocate(40000);
        req.username = Some(String::from("stranger"));
        req.realm = Some(REALM.to_owned());
        req.nonce = Some(nonce.clone());
        req.hmac_key =
            Some(IntegrityKey::long_term("stranger", REALM, PASSWORD));
        let resp = response(h.process_stun_message(&reparse(&req)).await);
        assert_eq!(error_code(&resp), Some(436));

        req.username = Some(USERNAME.to_owned());
        req.hmac_key = Some(IntegrityKey::long_term(USERNAME, REALM, "wrong"));
        let resp = response(h.process_stun_message(&reparse(&req)).await);
        assert_eq!(error_code(&resp), Some(431));

        req.nonce = None;
        let resp = response(h.process_stun_message(&reparse(&req)).await);
        assert_eq!(error_code(&resp), Some(435));

        req.nonce = Some(String::from("1:forged"));
        let resp = response(h.process_stun_message(&reparse(&req)).await);
        assert_eq!(error_code(&resp), Some(400));

        req.nonce = Some(nonce);
        req.username = None;
        let resp = response(h.process_stun_message(&reparse(&req)).await);
        assert_eq!(error_code(&resp), Some(432));
    }

    #[tokio::test]
    async fn rejects_stale_nonce() {
        let (mut h, _events) = handler(AuthMode::LongTerm);
        h.config.nonce_lifetime = Some(Duration::from_secs(60));
        let stale = format!("1:{}", integrity::nonce_digest(1, &h.nonce_key));

        let mut req = allocate(40000);
        req.username = Some(USERNAME.to_owned());
        req.realm = Some(REALM.to_owned());
        req.nonce = Some(stale);
        req.hmac_key =
            Some(IntegrityKey::long_term(USERNAME, REALM, PASSWORD));
        let resp = response(h.process_stun_message(&reparse(&req)).await);

        assert_eq!(error_code(&resp), Some(438));
        assert_eq!(resp.realm.as_deref(), Some(REALM));
        assert!(resp.nonce.is_some(), "438 must carry a fresh NONCE");
    }

    #[tokio::test]
    async fn requires_integrity_in_short_term_mode() {
        let (mut h, _events) = handler(AuthMode::ShortTerm);

        let resp =
            response(h.process_stun_message(&request(Method::Binding, 1)).await);
        assert_eq!(error_code(&resp), Some(401));
        assert!(resp.realm.is_none(), "short-term 401 carries no realm");

        let resp = response(
            h.process_stun_message(&short_term(request(Method::Binding, 1)))
                .await,
        );
        assert_eq!(resp.class, Class::SuccessResponse);
    }

    #[tokio::test]
    async fn allocates_and_refreshes_same_allocation() {
        let (mut h, _events) = handler(AuthMode::ShortTerm);
        let mut req = allocate(40000);
        req.lifetime = Some(30);
        let req = short_term(req);

        let first = response(h.process_stun_message(&req).await);
        assert_eq!(first.class, Class::SuccessResponse, "{:?}", first.error_code);
        assert_eq!(first.lifetime, Some(30));
        assert_eq!(first.bandwidth, Some(100));
        assert_eq!(first.xor_mapped_address, Some(req.remote_tuple.addr));
        let relay = first.xor_relayed_address.unwrap();

        let key = AllocationKey::new(req.local_tuple, req.remote_tuple);
        let generation = h.manager.get(&key).unwrap().generation();

        let second = response(h.process_stun_message(&req).await);
        assert_eq!(second.class, Class::SuccessResponse);
        assert_eq!(second.xor_relayed_address, Some(relay));
        assert_eq!(h.manager.get(&key).unwrap().generation(), generation);
    }

    #[tokio::test]
    async fn caps_lifetime() {
        let (mut h, _events) = handler(AuthMode::ShortTerm);
        let mut req = allocate(40000);
        req.lifetime = Some(u32::MAX);

        let resp = response(h.process_stun_message(&short_term(req)).await);

        assert_eq!(resp.lifetime, Some(3600));
    }

    #[tokio::test]
    async fn deletes_on_zero_lifetime() {
        let (mut h, _events) = handler(AuthMode::ShortTerm);
        let req = short_term(allocate(40000));
        let key = AllocationKey::new(req.local_tuple, req.remote_tuple);
        _ = response(h.process_stun_message(&req).await);
        assert!(h.manager.get(&key).is_some(), "allocation must exist");

        let mut refresh = request(Method::Refresh, 40000);
        refresh.lifetime = Some(0);
        let resp =
            response(h.process_stun_message(&short_term(refresh)).await);
        assert_eq!(resp.class, Class::SuccessResponse);
        assert_eq!(resp.lifetime, Some(0));
        assert!(h.manager.get(&key).is_none(), "refresh must delete");

        _ = response(h.process_stun_message(&req).await);
        let mut again = allocate(40000);
        again.lifetime = Some(0);
        let resp = response(h.process_stun_message(&short_term(again)).await);
        assert_eq!(resp.lifetime, Some(0));
        assert!(h.manager.get(&key).is_none(), "allocate must delete");
    }

    #[tokio::test]
    async fn validates_requested_transport() {
        let (mut h, _events) = handler(AuthMode::None);

        let resp = response(
            h.process_stun_message(&request(Method::Allocate, 1)).await,
        );
        assert_eq!(error_code(&resp), Some(400));

        let mut req = allocate(1);
        req.requested_transport = Some(attr::PROTO_TCP);
        let resp = response(h.process_stun_message(&req).await);
        assert_eq!(error_code(&resp), Some(442));
    }

    #[tokio::test]
    async fn rejects_foreign_credentials_on_existing_allocation() {
        let (mut h, _events) = handler(AuthMode::None);
        _ = response(h.process_stun_message(&allocate(40000)).await);

        let mut req = allocate(40000);
        req.username = Some(USERNAME.to_owned());
        req.hmac_key = Some(secrets().key_for(USERNAME));
        let resp = response(h.process_stun_message(&reparse(&req)).await);
        assert_eq!(error_code(&resp), Some(436));

        let mut refresh = request(Method::Refresh, 40000);
        refresh.username = Some(USERNAME.to_owned());
        refresh.hmac_key = Some(secrets().key_for(USERNAME));
        let resp = response(h.process_stun_message(&reparse(&refresh)).await);
        assert_eq!(error_code(&resp), Some(441));
    }

    #[tokio::test]
    async fn reserves_even_port_pair() {
        let (mut h, _events) = handler(AuthMode::None);
        let mut req = allocate(40000);
        req.even_port = Some(EvenPort { reserve_next: true });

        let resp = response(h.process_stun_message(&req).await);

        assert_eq!(resp.class, Class::SuccessResponse, "{:?}", resp.error_code);
        let port = resp.xor_relayed_address.unwrap().port();
        assert_eq!(port % 2, 0, "relay port must be even");
        assert_eq!(resp.reservation_token, Some(u64::from(port) + 1));
        assert!(
            !h.manager.ports().allocate_port(port + 1),
            "odd port must be reserved",
        );

        let mut both = allocate(40001);
        both.even_port = Some(EvenPort { reserve_next: false });
        both.reservation_token = Some(1);
        let resp = response(h.process_stun_message(&both).await);
        assert_eq!(error_code(&resp), Some(400));

        let mut unknown = allocate(40002);
        unknown.reservation_token = Some(1);
        let resp = response(h.process_stun_message(&unknown).await);
        assert_eq!(error_code(&resp), Some(508));
    }

    #[tokio::test]
    async fn reports_exhausted_port_range() {
        let port = {
            let free = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            free.local_addr().unwrap().port()
        };
        let (mut h, _events) = handler_with_ports(AuthMode::None, port, port);

        let first = response(h.process_stun_message(&allocate(40000)).await);
        assert_eq!(first.class, Class::SuccessResponse, "{:?}", first.error_code);
        assert_eq!(first.xor_relayed_address.map(|a| a.port()), Some(port));

        let second = response(h.process_stun_message(&allocate(40001)).await);
        assert_eq!(error_code(&second), Some(444));
    }

    #[tokio::test]
    async fn returns_port_to_pool_on_bind_failure() {
        let busy = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = busy.local_addr().unwrap().port();
        let (mut h, _events) = handler_with_ports(AuthMode::None, port, port);

        let resp = response(h.process_stun_message(&allocate(40000)).await);

        assert_eq!(error_code(&resp), Some(500));
        assert!(
            h.manager.ports().allocate_port(port),
            "port must be released after a failed bind",
        );
        drop(busy);
    }

    #[tokio::test]
    async fn subsumes_allocation_of_moved_client() {
        let (mut h, _events) = handler(AuthMode::ShortTerm);
        let first = response(
            h.process_stun_message(&short_term(allocate(40000))).await,
        );
        let relay = first.xor_relayed_address.unwrap();

        let mut req = allocate(40001);
        req.xor_relayed_address = Some(relay);
        let req = short_term(req);
        let resp = response(h.process_stun_message(&req).await);

        assert_eq!(resp.class, Class::SuccessResponse, "{:?}", resp.error_code);
        assert_eq!(resp.xor_relayed_address, Some(relay));
        assert_eq!(h.manager.infos(None).len(), 1, "old one must be gone");
        let key = AllocationKey::new(req.local_tuple, req.remote_tuple);
        assert!(h.manager.get(&key).is_some(), "new one must exist");
    }

    #[tokio::test]
    async fn rejects_foreign_requested_address() {
        let (mut h, _events) = handler(AuthMode::None);
        let mut req = allocate(40000);
        req.xor_relayed_address = Some("192.0.2.1:50000".parse().unwrap());

        let resp = response(h.process_stun_message(&req).await);

        assert_eq!(error_code(&resp), Some(443));
    }

    #[tokio::test]
    async fn creates_permissions_and_channels() {
        let (mut h, _events) = handler(AuthMode::None);
        let alloc = response(h.process_stun_message(&allocate(40000)).await);
        assert_eq!(alloc.class, Class::SuccessResponse);
        let key = AllocationKey::new(
            request(Method::Binding, 40000).local_tuple,
            request(Method::Binding, 40000).remote_tuple,
        );
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        let resp = response(
            h.process_stun_message(&request(Method::CreatePermission, 40000))
                .await,
        );
        assert_eq!(error_code(&resp), Some(400));

        let mut req = request(Method::CreatePermission, 40000);
        req.xor_peer_addresses.push("[::1]:5000".parse().unwrap());
        let resp = response(h.process_stun_message(&req).await);
        assert_eq!(error_code(&resp), Some(443));

        let mut req = request(Method::CreatePermission, 40000);
        req.xor_peer_addresses.push(peer);
        let resp = response(h.process_stun_message(&req).await);
        assert_eq!(resp.class, Class::SuccessResponse);
        assert!(h.manager.get(&key).unwrap().has_permission(peer.ip()));

        let mut req = request(Method::ChannelBind, 40000);
        req.xor_peer_addresses.push(peer);
        req.channel_number = Some(0x3FFF);
        let resp = response(h.process_stun_message(&req).await);
        assert_eq!(error_code(&resp), Some(400));

        req.channel_number = Some(CHANNEL_NUMBER_MIN);
        let resp = response(h.process_stun_message(&req).await);
        assert_eq!(resp.class, Class::SuccessResponse);
        assert_eq!(
            h.manager.get(&key).unwrap().get_channel_addr(CHANNEL_NUMBER_MIN),
            Some(peer),
        );

        req.channel_number = Some(CHANNEL_NUMBER_MIN + 1);
        let resp = response(h.process_stun_message(&req).await);
        assert_eq!(error_code(&resp), Some(400));

        let other = request(Method::CreatePermission, 40001);
        let resp = response(h.process_stun_message(&other).await);
        assert_eq!(error_code(&resp), Some(437));
    }

    #[tokio::test]
    async fn relays_send_indications_and_channel_data() {
        let (mut h, _events) = handler(AuthMode::None);
        _ = response(h.process_stun_message(&allocate(40000)).await);
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let key = AllocationKey::new(
            request(Method::Binding, 40000).local_tuple,
            request(Method::Binding, 40000).remote_tuple,
        );

        let mut bind = request(Method::ChannelBind, 40000);
        bind.xor_peer_addresses.push(peer_addr);
        bind.channel_number = Some(CHANNEL_NUMBER_MIN);
        _ = response(h.process_stun_message(&bind).await);

        let mut send = request(Method::Send, 40000);
        send.class = Class::Indication;
        send.xor_peer_addresses.push(peer_addr);
        send.data = Some(bytes::Bytes::from_static(b"indication"));
        assert!(matches!(
            h.process_stun_message(&send).await,
            ProcessResult::NoResponseToSend,
        ));

        h.process_channel_data(
            &key,
            ChannelData {
                number: CHANNEL_NUMBER_MIN,
                data: bytes::Bytes::from_static(b"channel"),
            },
        )
        .await;

        let mut buf = [0; 32];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"indication");
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"channel");
    }

    #[tokio::test]
    async fn confirms_channels() {
        let (mut h, _events) = handler(AuthMode::None);
        h.config.require_channel_confirmation = true;
        _ = response(h.process_stun_message(&allocate(40000)).await);
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let key = AllocationKey::new(
            request(Method::Binding, 40000).local_tuple,
            request(Method::Binding, 40000).remote_tuple,
        );

        let mut bind = request(Method::ChannelBind, 40000);
        bind.xor_peer_addresses.push(peer);
        bind.channel_number = Some(CHANNEL_NUMBER_MIN);
        _ = response(h.process_stun_message(&bind).await);

        let generation = h.manager.get(&key).unwrap().generation();
        let data = bytes::Bytes::from_static(b"x");
        let event = || Event::PeerData {
            key,
            generation,
            peer,
            data: data.clone(),
        };

        let (_, out) = h.process_event(event(), Framing::None).unwrap();
        assert!(!ChannelData::is_channel_data(&out), "must be indication");

        bind.class = Class::Indication;
        _ = h.process_stun_message(&bind).await;

        let (_, out) = h.process_event(event(), Framing::None).unwrap();
        assert!(ChannelData::is_channel_data(&out), "must be channel data");
    }

    #[tokio::test]
    async fn answers_unknown_attributes() {
        let (h, _events) = handler(AuthMode::None);
        let req = request(Method::Binding, 40000);

        let resp = response(h.process_unknown_attributes(
            &req.header(),
            &[0x0031],
            req.local_tuple,
            req.remote_tuple,
        ));
        assert_eq!(error_code(&resp), Some(420));
        assert_eq!(resp.unknown_attributes, [0x0031]);

        let mut header = req.header();
        header.class = Class::Indication;
        assert!(matches!(
            h.process_unknown_attributes(
                &header,
                &[0x0031],
                req.local_tuple,
                req.remote_tuple,
            ),
            ProcessResult::NoResponseToSend,
        ));
    }

    #[tokio::test]
    async fn requires_tls_for_shared_secret() {
        let (mut h, _events) = handler(AuthMode::LongTerm);
        let mut req = request(Method::SharedSecret, 40000);

        let resp = response(h.process_stun_message(&req).await);
        assert_eq!(error_code(&resp), Some(433));

        req.local_tuple.transport = TransportType::Tls;
        let resp = response(h.process_stun_message(&req).await);
        assert_eq!(resp.class, Class::SuccessResponse);
        let username = resp.username.unwrap();
        assert_eq!(username.len(), GENERATED_USERNAME_LEN_V4);
        assert_eq!(
            resp.password.unwrap(),
            secrets().password_for(&username),
        );
    }

    #[tokio::test]
    async fn answers_change_requests() {
        let (mut h, _events) = handler(AuthMode::None);
        let primary: SocketAddr = "127.0.0.1:3478".parse().unwrap();
        let alternate: SocketAddr = "127.0.0.2:3479".parse().unwrap();
        h.config.rfc3489 =
            Some(super::super::config::Rfc3489Addresses { primary, alternate });

        let mut req = request(Method::Binding, 40000);
        req.change_request = Some(CHANGE_IP | CHANGE_PORT);
        let ProcessResult::RespondFromAlternateIpPort(resp) =
            h.process_stun_message(&req).await
        else {
            panic!("expected response from alternate IP and port");
        };
        assert_eq!(resp.source_address, Some(alternate));
        assert_eq!(resp.changed_address, Some(alternate));
        assert_eq!(resp.mapped_address, Some(req.remote_tuple.addr));

        req.change_request = Some(CHANGE_PORT);
        let ProcessResult::RespondFromAlternatePort(resp) =
            h.process_stun_message(&req).await
        else {
            panic!("expected response from alternate port");
        };
        assert_eq!(resp.source_address, Some("127.0.0.1:3479".parse().unwrap()));

        req.change_request = Some(CHANGE_IP);
        req.response_address = Some("127.0.0.1:9999".parse().unwrap());
        let ProcessResult::RespondFromAlternateIp(resp) =
            h.process_stun_message(&req).await
        else {
            panic!("expected response from alternate IP");
        };
        assert_eq!(resp.source_address, Some("127.0.0.2:3478".parse().unwrap()));
        assert_eq!(resp.remote_tuple.addr, "127.0.0.1:9999".parse().unwrap());
        assert_eq!(resp.reflected_from, Some(req.remote_tuple.addr));
    }
}
