//! Stream framing and ordered egress of [STUN]/[TURN] messages.
//!
//! [STUN]: https://en.wikipedia.org/wiki/STUN
//! [TURN]: https://en.wikipedia.org/wiki/TURN

use std::net::SocketAddr;

use tokio::{
    io::{AsyncWrite, AsyncWriteExt as _},
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use crate::{chandata::ChannelData, message::StunMessage};

use super::Error;

/// Default capacity of a [`WriteQueue`].
pub(crate) const WRITE_QUEUE_CAPACITY: usize = 256;

/// Framing of messages written to a transport.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Framing {
    /// Datagram transport: every message is a datagram of its own.
    #[default]
    None,

    /// [RFC 5766] stream framing: [STUN] messages as-is, `ChannelData`
    /// padded to 4 bytes.
    ///
    /// [RFC 5766]: https://datatracker.ietf.org/doc/html/rfc5766#section-11.5
    /// [STUN]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
    Rfc5766,

    /// Pre-RFC 5766 stream framing: [STUN] messages behind a channel `0`
    /// header, `ChannelData` unpadded.
    ///
    /// [STUN]: https://datatracker.ietf.org/doc/html/rfc5389#section-6
    Legacy,
}

impl Framing {
    /// Encodes the provided [`StunMessage`] according to this [`Framing`].
    #[must_use]
    pub fn encode_message(self, msg: &StunMessage) -> Vec<u8> {
        match self {
            Self::None | Self::Rfc5766 => msg.encode(),
            Self::Legacy => msg.encode_framed(0),
        }
    }

    /// Encodes the provided payload as a [`ChannelData`] message according
    /// to this [`Framing`].
    #[must_use]
    pub fn encode_channel_data(self, data: &[u8], number: u16) -> Vec<u8> {
        ChannelData::encode(data, number, self == Self::Rfc5766)
    }
}

/// FIFO queue of writes to a single stream destination.
///
/// Writes are dispatched one by one by a dedicated task, so callers never
/// wait for a previous write to complete.
#[derive(Clone, Debug)]
pub struct WriteQueue {
    /// Destination of this [`WriteQueue`], for logging.
    remote: SocketAddr,

    /// Pending writes.
    tx: mpsc::Sender<Vec<u8>>,
}

impl WriteQueue {
    /// Spawns a writer task draining a new [`WriteQueue`] into the provided
    /// `writer`.
    ///
    /// The task stops once the `writer` fails or every [`WriteQueue`] handle
    /// is dropped.
    pub fn spawn<W>(
        mut writer: W,
        remote: SocketAddr,
        capacity: usize,
    ) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(capacity);
        let task = tokio::spawn(async move {
            while let Some(buf) = rx.recv().await {
                if let Err(e) = writer.write_all(&buf).await {
                    log::debug!("Failed to write to {remote}: {e}");
                    break;
                }
            }
            drop(writer.shutdown().await);
        });

        (Self { remote, tx }, task)
    }

    /// Appends the provided `data` to this [`WriteQueue`].
    ///
    /// If the queue is full, the `data` is dropped.
    ///
    /// # Errors
    ///
    /// With [`Error::TransportIsDead`] if the writer task has stopped.
    pub fn push(&self, data: Vec<u8>) -> Result<(), Error> {
        match self.tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(data)) => {
                log::warn!(
                    "Write queue to {} is full, dropping {} bytes",
                    self.remote,
                    data.len(),
                );
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(Error::TransportIsDead),
        }
    }
}

#[cfg(test)]
mod write_queue_spec {
    use tokio::io::AsyncReadExt as _;

    use super::*;
    use crate::message::Method;

    #[tokio::test]
    async fn preserves_write_order() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let (queue, task) =
            WriteQueue::spawn(writer, "127.0.0.1:1".parse().unwrap(), 8);

        for chunk in [&b"first,"[..], b"second,", b"third"] {
            queue.push(chunk.to_vec()).unwrap();
        }
        drop(queue);
        task.await.unwrap();

        let mut out = String::new();
        _ = reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "first,second,third");
    }

    #[tokio::test]
    async fn fails_once_writer_is_gone() {
        let (writer, reader) = tokio::io::duplex(64);
        let (queue, task) =
            WriteQueue::spawn(writer, "127.0.0.1:1".parse().unwrap(), 8);
        drop(reader);

        queue.push(vec![1]).unwrap();
        task.await.unwrap();

        assert_eq!(queue.push(vec![2]), Err(Error::TransportIsDead));
    }

    #[test]
    fn frames_by_mode() {
        let msg = StunMessage::request(Method::Binding);

        assert_eq!(Framing::Rfc5766.encode_message(&msg), msg.encode());
        assert_eq!(Framing::Legacy.encode_message(&msg), msg.encode_framed(0));

        assert_eq!(Framing::Rfc5766.encode_channel_data(&[7], 0x4000).len(), 8);
        assert_eq!(Framing::Legacy.encode_channel_data(&[7], 0x4000).len(), 5);
        assert_eq!(Framing::None.encode_channel_data(&[7], 0x4000).len(), 5);
    }
}
