//! Retransmission of client requests.

use tokio::time::{Duration, Instant};

use crate::message::StunMessage;

/// Initial retransmission timeout.
///
/// [RFC 5389 Section 7.2.1](https://tools.ietf.org/html/rfc5389#section-7.2.1)
pub(crate) const RTO: Duration = Duration::from_millis(100);

/// Number of retransmissions before giving up.
pub(crate) const MAX_RETRANSMITS: u8 = 7;

/// Time to wait for a response after the last retransmission.
pub(crate) const FINAL_WAIT: Duration = Duration::from_millis(1600);

/// Outstanding client request awaiting its response.
#[derive(Debug)]
pub(crate) struct Transaction<P> {
    /// Sent request, kept to be re-signed on an authentication retry.
    pub(crate) request: StunMessage,

    /// What the request is for.
    pub(crate) purpose: P,

    /// Whether the request was already retried with fresh credentials.
    pub(crate) auth_retried: bool,

    /// Encoded `request`.
    encoded: Vec<u8>,

    /// Number of retransmissions done.
    retransmits: u8,

    /// Current retransmission timeout.
    rto: Duration,

    /// [`Instant`] of the next retransmission or of giving up.
    deadline: Instant,
}

impl<P> Transaction<P> {
    /// Creates a new [`Transaction`] for the `request` about to be sent.
    pub(crate) fn new(request: StunMessage, purpose: P) -> Self {
        let encoded = request.encode();
        Self {
            request,
            purpose,
            auth_retried: false,
            encoded,
            retransmits: 0,
            rto: RTO,
            deadline: Instant::now() + RTO,
        }
    }

    /// Returns the encoded request.
    pub(crate) fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// Returns the [`Instant`] this [`Transaction`] needs attention at.
    pub(crate) const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Handles the passed deadline.
    ///
    /// Returns the request to be sent again, or [`None`] if this
    /// [`Transaction`] timed out.
    pub(crate) fn on_deadline(&mut self) -> Option<&[u8]> {
        if self.retransmits >= MAX_RETRANSMITS {
            return None;
        }
        self.retransmits += 1;
        self.rto *= 2;
        self.deadline = Instant::now()
            + if self.retransmits == MAX_RETRANSMITS {
                FINAL_WAIT
            } else {
                self.rto
            };
        Some(&self.encoded)
    }
}
