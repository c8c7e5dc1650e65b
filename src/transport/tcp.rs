//! [STUN]/[TURN] TCP-based [`Transport`] implementation.
//!
//! [STUN]: https://en.wikipedia.org/wiki/STUN
//! [TURN]: https://en.wikipedia.org/wiki/TURN

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt as _;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, mpsc, mpsc::error::TrySendError},
};
use tokio_util::codec::{Decoder, FramedRead};

use crate::{
    chandata::{CHANNEL_DATA_HEADER_SIZE, ChannelData, nearest_padded_value_length},
    message::{HEADER_LEN, StunMessage},
};

use super::{
    Error, Framing, Request, Transport, TransportType, WriteQueue,
    framing::WRITE_QUEUE_CAPACITY,
};

/// Shortcut for a [`HashMap`] of active TCP sessions.
type TcpWritersMap = Arc<Mutex<HashMap<SocketAddr, WriteQueue>>>;

/// Server implementing [STUN]/[TURN] TCP-based [`Transport`].
///
/// [STUN]: https://en.wikipedia.org/wiki/STUN
/// [TURN]: https://en.wikipedia.org/wiki/TURN
#[derive(Debug)]
pub struct Server {
    /// [`mpsc::Receiver`] of [`Request`]s.
    ingress_rx: Mutex<mpsc::Receiver<(Request, SocketAddr)>>,

    /// Local [`SocketAddr`] of the [`TcpListener`].
    local_addr: SocketAddr,

    /// [`Framing`] used by the connected clients.
    framing: Framing,

    /// Active TCP sessions.
    writers: TcpWritersMap,
}

#[async_trait]
impl Transport for Server {
    async fn recv_from(&self) -> Result<(Request, SocketAddr), Error> {
        if let Some((data, addr)) = self.ingress_rx.lock().await.recv().await {
            Ok((data, addr))
        } else {
            Err(Error::TransportIsDead)
        }
    }

    async fn send_to(
        &self,
        data: Vec<u8>,
        target: SocketAddr,
    ) -> Result<(), Error> {
        let mut writers = self.writers.lock().await;
        let Some(queue) = writers.get(&target) else {
            return Err(Error::TransportIsDead);
        };
        let res = queue.push(data);
        if res.is_err() {
            // Underlying TCP stream is dead.
            drop(writers.remove(&target));
        }
        res
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    fn framing(&self) -> Framing {
        self.framing
    }
}

impl Server {
    /// Creates and [`spawn`]s a new [`Server`] on the provided [`TcpListener`].
    ///
    /// # Errors
    ///
    /// If fails to receive the local [`SocketAddr`] of the provided
    /// [`TcpListener`].
    ///
    /// [`spawn`]: tokio::spawn()
    pub fn new(listener: TcpListener, framing: Framing) -> Result<Self, Error> {
        let local_addr = listener.local_addr()?;
        let (ingress_tx, ingress_rx) = mpsc::channel(256);
        let writers = Arc::new(Mutex::new(HashMap::new()));

        drop(tokio::spawn({
            let writers = Arc::clone(&writers);
            async move {
                loop {
                    tokio::select! {
                        stream = listener.accept() => {
                            match stream {
                                Ok((stream, remote)) => {
                                    Self::spawn_stream_handler(
                                        stream,
                                        local_addr,
                                        remote,
                                        framing,
                                        ingress_tx.clone(),
                                        Arc::clone(&writers),
                                    );
                                },
                                Err(e) => {
                                    log::warn!(
                                        "Failed to accept TCP connection on \
                                         {local_addr}: {e}",
                                    );
                                    break;
                                }
                            }
                        }
                        () = ingress_tx.closed() => {
                            break;
                        }
                    }
                }
                log::debug!("Closing `TcpListener` at {local_addr}");
            }
        }));

        Ok(Self {
            ingress_rx: Mutex::new(ingress_rx),
            local_addr,
            framing,
            writers,
        })
    }

    /// [`spawn`]s a handler for the provided [`TcpStream`].
    ///
    /// [`spawn`]: tokio::spawn()
    fn spawn_stream_handler(
        stream: TcpStream,
        local: SocketAddr,
        remote: SocketAddr,
        framing: Framing,
        ingress_tx: mpsc::Sender<(Request, SocketAddr)>,
        writers: TcpWritersMap,
    ) {
        drop(tokio::spawn(async move {
            log::debug!("Accepted TCP {local} <=> {remote}");

            let (reader, writer) = stream.into_split();
            let (queue, write_task) =
                WriteQueue::spawn(writer, remote, WRITE_QUEUE_CAPACITY);
            drop(writers.lock().await.insert(remote, queue));

            let mut reader = FramedRead::new(reader, Codec::new(framing));
            loop {
                match reader.next().await {
                    Some(Ok(msg)) => match ingress_tx.try_send((msg, remote)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            log::debug!(
                                "Dropped ingress message from TCP \
                                 {local} <=> {remote}",
                            );
                        }
                        Err(TrySendError::Closed(_)) => break,
                    },
                    Some(Err(e)) => {
                        log::debug!(
                            "Malformed frame on TCP {local} <=> {remote}: {e}",
                        );
                        if matches!(e, Error::Io(_)) {
                            break;
                        }
                    }
                    None => break,
                }
            }

            log::debug!("Closing TCP {local} <=> {remote}");
            drop(writers.lock().await.remove(&remote));
            write_task.abort();
            drop(ingress_tx.send((Request::Disconnected, remote)).await);
        }));
    }
}

/// Kind of a [`Request`] frame on a stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RequestKind {
    /// [STUN Message].
    ///
    /// ```ascii
    /// 0                   1                   2                   3
    /// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |0 0|     STUN Message Type     |         Message Length        |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                         Magic Cookie                          |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                                                               |
    /// |                     Transaction ID (96 bits)                  |
    /// |                                                               |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    ///
    /// [STUN Message]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
    Message(usize),

    /// [STUN Message] behind a legacy `0x0000` channel header.
    ///
    /// [STUN Message]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
    FramedMessage(usize),

    /// [TURN ChannelData Message][1].
    ///
    /// ```ascii
    /// 0                   1                   2                   3
    /// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |         Channel Number        |            Length             |
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |                                                               |
    /// /                       Application Data                        |
    /// /                                                               |
    /// |                                                               |
    /// |                               +-------------------------------+
    /// |                               |
    /// +-------------------------------+
    /// ```
    ///
    /// [1]: https://datatracker.ietf.org/doc/html/rfc5766#section-11.4
    ChannelData(usize),
}

impl RequestKind {
    /// Detects a [`RequestKind`] from the provided first 4 bytes of a
    /// [`Request`].
    fn detect_kind(framing: Framing, first_4_bytes: [u8; 4]) -> Self {
        let size = usize::from(u16::from_be_bytes([
            first_4_bytes[2],
            first_4_bytes[3],
        ]));

        match framing {
            Framing::Legacy if first_4_bytes[..2] == [0, 0] => {
                Self::FramedMessage(size + CHANNEL_DATA_HEADER_SIZE)
            }
            Framing::Legacy => Self::ChannelData(size + CHANNEL_DATA_HEADER_SIZE),
            // If the first two bits are zeroes, then this is a STUN method.
            Framing::None | Framing::Rfc5766
                if first_4_bytes[0] & 0b1100_0000 == 0 =>
            {
                Self::Message(size + HEADER_LEN)
            }
            Framing::None | Framing::Rfc5766 => Self::ChannelData(
                nearest_padded_value_length(size + CHANNEL_DATA_HEADER_SIZE),
            ),
        }
    }

    /// Returns the expected length of the [`Request`] frame.
    const fn length(self) -> usize {
        match self {
            Self::Message(l) | Self::FramedMessage(l) | Self::ChannelData(l) => l,
        }
    }
}

/// [`Decoder`] splitting a [STUN]/[TURN] stream into frames.
///
/// [STUN]: https://en.wikipedia.org/wiki/STUN
/// [TURN]: https://en.wikipedia.org/wiki/TURN
#[derive(Debug)]
struct Codec {
    /// [`Framing`] of the stream.
    framing: Framing,

    /// Current [`RequestKind`].
    current: Option<RequestKind>,
}

impl Codec {
    /// Creates a new [`Codec`] for the provided [`Framing`].
    const fn new(framing: Framing) -> Self {
        Self { framing, current: None }
    }
}

impl Decoder for Codec {
    type Item = Request;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.current.is_none() {
                if let Some(hdr) = buf.first_chunk::<4>() {
                    self.current =
                        Some(RequestKind::detect_kind(self.framing, *hdr));
                }
            }

            let Some(current) = self.current else {
                return Ok(None);
            };
            if buf.len() < current.length() {
                buf.reserve(current.length() - buf.len());
                return Ok(None);
            }
            self.current = None;

            let raw = buf.split_to(current.length());
            let req = match current {
                RequestKind::Message(_) => match StunMessage::parse(&raw) {
                    Ok(msg) => Request::Message(Box::new(msg)),
                    Err(e) => Request::Malformed(e),
                },
                RequestKind::FramedMessage(_) => {
                    match StunMessage::parse(&raw[CHANNEL_DATA_HEADER_SIZE..])
                    {
                        Ok(msg) => Request::Message(Box::new(msg)),
                        Err(e) => Request::Malformed(e),
                    }
                }
                // The frame length is known, so the stream stays in sync.
                RequestKind::ChannelData(_) => match ChannelData::decode(&raw)
                {
                    Ok(data) => Request::ChannelData(data),
                    Err(e) => {
                        log::warn!(
                            "Skipping malformed ChannelData frame of {} bytes: \
                             {e}",
                            raw.len(),
                        );
                        continue;
                    }
                },
            };

            return Ok(Some(req));
        }
    }
}

#[cfg(test)]
mod tcp_spec {
    use bytes::BytesMut;
    use tokio::{io::AsyncWriteExt as _, net::TcpStream};
    use tokio_util::codec::Decoder as _;

    use super::*;
    use crate::{attr::CHANNEL_NUMBER_MIN, message::Method};

    #[test]
    fn splits_stream_into_frames() {
        let msg = StunMessage::request(Method::Binding);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&msg.encode());
        buf.extend_from_slice(&ChannelData::encode(
            &[1, 2, 3],
            CHANNEL_NUMBER_MIN,
            true,
        ));
        let mut codec = Codec::new(Framing::Rfc5766);

        let first = codec.decode(&mut buf).unwrap();
        assert!(matches!(first, Some(Request::Message(m)) if m.transaction_id == msg.transaction_id));

        let second = codec.decode(&mut buf).unwrap();
        let Some(Request::ChannelData(data)) = second else {
            panic!("expected ChannelData, got: {second:?}");
        };
        assert_eq!(&data.data[..], &[1, 2, 3]);
        assert!(buf.is_empty(), "padding must be consumed");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn waits_for_partial_frames() {
        let encoded = StunMessage::request(Method::Binding).encode();
        let mut buf = BytesMut::from(&encoded[..10]);
        let mut codec = Codec::new(Framing::Rfc5766);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[10..]);
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Request::Message(_)),
        ));
    }

    #[test]
    fn splits_legacy_frames() {
        let msg = StunMessage::request(Method::Allocate);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&msg.encode_framed(0));
        buf.extend_from_slice(&Framing::Legacy.encode_channel_data(&[9], 0x4001));
        let mut codec = Codec::new(Framing::Legacy);

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Request::Message(m)) if m.method == Method::Allocate,
        ));
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Request::ChannelData(d)) if d.number == 0x4001,
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn skips_invalid_channel_frames() {
        let msg = StunMessage::request(Method::Binding);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&ChannelData::encode(&[1, 2, 3], 0x8000, true));
        buf.extend_from_slice(&msg.encode());
        let mut codec = Codec::new(Framing::Rfc5766);

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Request::Message(m)) if m.transaction_id == msg.transaction_id,
        ));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn keeps_connection_after_invalid_channel_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(listener, Framing::Rfc5766).unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        let client_addr = client.local_addr().unwrap();
        let msg = StunMessage::request(Method::Binding);
        client
            .write_all(&ChannelData::encode(&[7; 5], 0xFFFF, true))
            .await
            .unwrap();
        client.write_all(&msg.encode()).await.unwrap();

        let (req, from) = server.recv_from().await.unwrap();
        assert_eq!(from, client_addr);
        assert!(matches!(
            req,
            Request::Message(m) if m.transaction_id == msg.transaction_id,
        ));
        server.send_to(vec![0; 4], client_addr).await.unwrap();
    }

    #[tokio::test]
    async fn reports_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(listener, Framing::Rfc5766).unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        let client_addr = client.local_addr().unwrap();
        let msg = StunMessage::request(Method::Binding);
        client.write_all(&msg.encode()).await.unwrap();

        let (req, from) = server.recv_from().await.unwrap();
        assert_eq!(from, client_addr);
        assert!(matches!(req, Request::Message(_)));

        server.send_to(vec![0; 4], client_addr).await.unwrap();

        drop(client);
        let (req, from) = server.recv_from().await.unwrap();
        assert_eq!(from, client_addr);
        assert!(matches!(req, Request::Disconnected));
        assert_eq!(
            server.send_to(vec![0; 4], client_addr).await,
            Err(Error::TransportIsDead),
        );
    }
}
