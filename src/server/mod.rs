//! TURN server implementation.

mod config;
mod request;

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    AllocationInfo, AuthHandler, Error,
    allocation::{AllocationKey, Event, Manager, ManagerConfig},
    message::DecodeError,
    transport::{self, Request, StunTuple, Transport},
};

use self::request::{ProcessResult, RequestHandler};

pub use self::config::{
    AuthMode, Config, DEFAULT_BANDWIDTH, DEFAULT_LIFETIME, MAX_LIFETIME,
    Rfc3489Addresses, ServerConfig,
};

/// Capacity of the channel delivering ingress [`Request`]s to the server
/// loop.
const INBOUND_CAPACITY: usize = 1024;

/// Capacity of the channel delivering allocation [`Event`]s to the server
/// loop.
const EVENTS_CAPACITY: usize = 1024;

/// Shared [`Transport`] of the [`Server`].
type Connection = Arc<dyn Transport + Send + Sync>;

/// Server is an instance of the TURN Server
#[derive(Debug)]
pub struct Server {
    /// Channel to [`Server`]'s internal loop.
    command_tx: mpsc::Sender<Command>,
}

impl Server {
    /// Creates a new TURN server and spawns its loop.
    ///
    /// Must be called within a [`tokio`] runtime.
    #[must_use]
    pub fn new<A>(config: Config<A>) -> Self
    where
        A: AuthHandler + Send + Sync + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENTS_CAPACITY);

        let mut server = config.server;
        if server.channel_bind_lifetime.is_zero() {
            server.channel_bind_lifetime = DEFAULT_LIFETIME;
        }
        let manager = Manager::new(ManagerConfig {
            relay: config.relay,
            events_tx,
            alloc_close_notify: config.alloc_close_notify,
        });
        let handler =
            RequestHandler::new(server, config.auth_handler, manager);

        let readers = config
            .connections
            .iter()
            .enumerate()
            .map(|(idx, conn)| {
                spawn_reader(idx, Arc::clone(conn), inbound_tx.clone())
            })
            .collect();

        drop(tokio::spawn(
            Loop {
                handler,
                connections: config.connections,
                readers,
                command_rx,
                inbound_rx,
                events_rx,
            }
            .run(),
        ));

        Self { command_tx }
    }

    /// Deletes all existing allocations by the provided `username`.
    ///
    /// # Errors
    ///
    /// With [`Error::Closed`] if the [`Server`] was closed already.
    pub async fn delete_allocations_by_username(
        &self,
        username: String,
    ) -> Result<(), Error> {
        let (done_tx, done_rx) = oneshot::channel();
        self.command_tx
            .send(Command::DeleteAllocations(username, done_tx))
            .await
            .map_err(|_| Error::Closed)?;

        done_rx.await.map_err(|_| Error::Closed)
    }

    /// Returns [`AllocationInfo`]s by specified [`AllocationKey`]s.
    ///
    /// If `keys` is:
    /// - [`None`]:               It returns information about the all
    ///   allocations.
    /// - [`Some`] and not empty: It returns information about the allocations
    ///   associated with the specified [`AllocationKey`]s.
    /// - [`Some`], but empty:    It returns an empty [`HashMap`].
    ///
    /// # Errors
    ///
    /// With [`Error::Closed`] if the [`Server`] was closed already.
    pub async fn get_allocations_info(
        &self,
        keys: Option<Vec<AllocationKey>>,
    ) -> Result<HashMap<AllocationKey, AllocationInfo>, Error> {
        if keys.as_ref().is_some_and(Vec::is_empty) {
            return Ok(HashMap::new());
        }

        let (infos_tx, infos_rx) = oneshot::channel();
        self.command_tx
            .send(Command::GetAllocationsInfo(keys, infos_tx))
            .await
            .map_err(|_| Error::Closed)?;

        infos_rx.await.map_err(|_| Error::Closed)
    }

    /// Close stops the TURN Server. It cleans up any associated state and
    /// stops reading from all the connections it is managing.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.command_tx.send(Command::Close(done_tx)).await.is_ok() {
            _ = done_rx.await;
        }
    }
}

/// The protocol to communicate between the [`Server`]'s public methods
/// and its loop.
#[derive(Debug)]
enum Command {
    /// Command to delete allocations by provided `username`.
    DeleteAllocations(String, oneshot::Sender<()>),

    /// Command to get information of allocations by provided
    /// [`AllocationKey`]s.
    GetAllocationsInfo(
        Option<Vec<AllocationKey>>,
        oneshot::Sender<HashMap<AllocationKey, AllocationInfo>>,
    ),

    /// Command to close the [`Server`].
    Close(oneshot::Sender<()>),
}

/// [`Request`] received on a [`Connection`].
#[derive(Debug)]
struct Ingress {
    /// Index of the receiving [`Connection`].
    conn: usize,

    /// Received [`Request`].
    request: Request,

    /// Sender of the [`Request`].
    from: SocketAddr,
}

/// Spawns a task forwarding [`Request`]s of the provided [`Connection`] to
/// the server loop.
fn spawn_reader(
    idx: usize,
    conn: Connection,
    inbound_tx: mpsc::Sender<Ingress>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match conn.recv_from().await {
                Ok((request, from)) => {
                    let ingress = Ingress { conn: idx, request, from };
                    if inbound_tx.send(ingress).await.is_err() {
                        break;
                    }
                }
                Err(
                    e @ (transport::Error::Decode(_)
                    | transport::Error::ChannelData(_)),
                ) => {
                    log::debug!(
                        "Dropping malformed message on {}: {e}",
                        conn.local_tuple(),
                    );
                }
                Err(e) => {
                    log::debug!(
                        "Exit read loop of {} on error: {e}",
                        conn.local_tuple(),
                    );
                    break;
                }
            }
        }
    })
}

/// Loop of a [`Server`], exclusively owning its state.
struct Loop<A> {
    /// Handler of ingress messages.
    handler: RequestHandler<A>,

    /// [`Connection`]s of the [`Server`].
    connections: Vec<Connection>,

    /// Tasks reading the `connections`.
    readers: Vec<JoinHandle<()>>,

    /// Receiver of [`Command`]s.
    command_rx: mpsc::Receiver<Command>,

    /// Receiver of [`Ingress`] messages.
    inbound_rx: mpsc::Receiver<Ingress>,

    /// Receiver of allocation [`Event`]s.
    events_rx: mpsc::Receiver<Event>,
}

impl<A> Loop<A>
where
    A: AuthHandler + Send + Sync,
{
    /// Runs this [`Loop`] until the [`Server`] is closed or dropped.
    async fn run(mut self) {
        let done = loop {
            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(Command::DeleteAllocations(username, done)) => {
                        self.handler.delete_allocations_by_username(&username);
                        _ = done.send(());
                    }
                    Some(Command::GetAllocationsInfo(keys, infos)) => {
                        _ = infos.send(
                            self.handler.allocations_info(keys.as_deref()),
                        );
                    }
                    Some(Command::Close(done)) => break Some(done),
                    None => break None,
                },
                Some(ingress) = self.inbound_rx.recv() => {
                    self.handle_ingress(ingress).await;
                }
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                }
            }
        };

        self.command_rx.close();
        for reader in &self.readers {
            reader.abort();
        }
        drop(self.handler);
        log::debug!("TURN server closed");
        if let Some(done) = done {
            _ = done.send(());
        }
    }

    /// Handles an [`Ingress`] message.
    async fn handle_ingress(&mut self, ingress: Ingress) {
        let Some(conn) = self.connections.get(ingress.conn) else {
            return;
        };
        let local = conn.local_tuple();
        let remote = StunTuple::new(conn.transport_type(), ingress.from);

        let res = match ingress.request {
            Request::Message(mut msg) => {
                msg.local_tuple = local;
                msg.remote_tuple = remote;
                self.handler.process_stun_message(&msg).await
            }
            Request::ChannelData(data) => {
                self.handler
                    .process_channel_data(
                        &AllocationKey::new(local, remote),
                        data,
                    )
                    .await;
                ProcessResult::NoResponseToSend
            }
            Request::Malformed(DecodeError::UnknownAttributes {
                header,
                types,
            }) => self
                .handler
                .process_unknown_attributes(&header, &types, local, remote),
            Request::Malformed(e) => {
                log::debug!("Dropping malformed message from {remote}: {e}");
                ProcessResult::NoResponseToSend
            }
            Request::Disconnected => {
                self.handler.remove_allocation(&AllocationKey::new(local, remote));
                ProcessResult::NoResponseToSend
            }
        };

        self.respond(ingress.conn, res).await;
    }

    /// Sends the response of the provided [`ProcessResult`].
    async fn respond(&self, receiving: usize, res: ProcessResult) {
        let (msg, alternate) = match res {
            ProcessResult::NoResponseToSend => return,
            ProcessResult::RespondFromReceiving(msg) => (msg, false),
            ProcessResult::RespondFromAlternateIp(msg)
            | ProcessResult::RespondFromAlternatePort(msg)
            | ProcessResult::RespondFromAlternateIpPort(msg) => (msg, true),
        };
        let Some(receiving) = self.connections.get(receiving) else {
            return;
        };

        let conn = if alternate {
            self.alternate_connection(receiving, msg.source_address)
        } else {
            receiving
        };
        let data = conn.framing().encode_message(&msg);
        if let Err(e) = conn.send_to(data, msg.remote_tuple.addr).await {
            log::warn!(
                "Failed to send {} {} to {}: {e}",
                msg.method,
                msg.class,
                msg.remote_tuple,
            );
        }
    }

    /// Looks up the [`Connection`] bound to the provided `source` address
    /// with the same transport as the `receiving` one.
    ///
    /// Falls back to the `receiving` [`Connection`] if there is none.
    fn alternate_connection<'a>(
        &'a self,
        receiving: &'a Connection,
        source: Option<SocketAddr>,
    ) -> &'a Connection {
        let found = source.and_then(|addr| {
            self.connections.iter().find(|c| {
                c.local_addr() == addr
                    && c.transport_type() == receiving.transport_type()
            })
        });
        found.unwrap_or_else(|| {
            log::warn!(
                "No connection bound to {source:?}, responding from {}",
                receiving.local_tuple(),
            );
            receiving
        })
    }

    /// Handles an allocation [`Event`].
    async fn handle_event(&mut self, event: Event) {
        let local = match &event {
            Event::PeerData { key, .. } | Event::Expired { key, .. } => {
                key.local
            }
        };
        let Some(conn) =
            self.connections.iter().find(|c| c.local_tuple() == local)
        else {
            log::warn!("No connection for allocation event on {local}");
            return;
        };

        if let Some((key, data)) =
            self.handler.process_event(event, conn.framing())
        {
            if let Err(e) = conn.send_to(data, key.remote.addr).await {
                log::warn!("Failed to relay peer data to {key}: {e}");
            }
        }
    }
}
