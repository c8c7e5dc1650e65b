//! TURN server configuration.

use std::{fmt, net::SocketAddr, sync::Arc};

use tokio::{sync::mpsc, time::Duration};

use crate::{
    AllocationInfo,
    integrity::{HmacPadding, ShortTermSecrets},
    relay,
    transport::Transport,
};

/// `DEFAULT_LIFETIME` in RFC 5766 is 10 minutes.
///
/// [RFC 5766 Section 2.2](https://www.rfc-editor.org/rfc/rfc5766#section-2.2)
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// It is RECOMMENDED that the server use a maximum allowed lifetime value of
/// no more than 3600 seconds (1 hour).
pub const MAX_LIFETIME: Duration = Duration::from_secs(3600);

/// Bandwidth granted to allocations not requesting any, in kbit/s.
pub const DEFAULT_BANDWIDTH: u32 = 100;

/// Credentials mechanism required from clients.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AuthMode {
    /// Requests are accepted without credentials.
    None,

    /// [Short-term credentials][1] issued by the server.
    ///
    /// [1]: https://datatracker.ietf.org/doc/html/rfc5389#section-10.1
    ShortTerm,

    /// [Long-term credentials][1] resolved by an [`AuthHandler`].
    ///
    /// [`AuthHandler`]: crate::AuthHandler
    /// [1]: https://datatracker.ietf.org/doc/html/rfc5389#section-10.2
    #[default]
    LongTerm,
}

/// Pair of addresses answering [RFC 3489] `CHANGE-REQUEST`s.
///
/// [RFC 3489]: https://datatracker.ietf.org/doc/html/rfc3489#section-11.2.4
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Rfc3489Addresses {
    /// Primary address.
    pub primary: SocketAddr,

    /// Alternate address, differing in both IP and port.
    pub alternate: SocketAddr,
}

/// Immutable protocol settings of a [`Server`].
///
/// [`Server`]: crate::Server
#[derive(Debug)]
pub struct ServerConfig {
    /// Realm of this server.
    pub realm: String,

    /// Credentials mechanism required from clients.
    pub auth_mode: AuthMode,

    /// Lifetime of allocations not requesting one.
    pub default_lifetime: Duration,

    /// Maximum lifetime of allocations.
    pub max_lifetime: Duration,

    /// Bandwidth granted to allocations not requesting any.
    pub default_bandwidth: u32,

    /// Lifetime of channel bindings.
    pub channel_bind_lifetime: Duration,

    /// Lifetime of issued nonces, [`None`] meaning they never expire.
    pub nonce_lifetime: Option<Duration>,

    /// Value of the `SOFTWARE` attribute added to responses.
    pub software: Option<String>,

    /// Addresses answering [RFC 3489] `CHANGE-REQUEST`s, if enabled.
    ///
    /// [RFC 3489]: https://datatracker.ietf.org/doc/html/rfc3489
    pub rfc3489: Option<Rfc3489Addresses>,

    /// Padding of `MESSAGE-INTEGRITY` inputs.
    pub hmac_padding: HmacPadding,

    /// Whether `ChannelData` is sent to clients only after they confirm a
    /// channel binding with a `ChannelBind` indication.
    pub require_channel_confirmation: bool,

    /// Secrets of short-term credentials.
    pub short_term_secrets: ShortTermSecrets,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            realm: String::from("turn-relay"),
            auth_mode: AuthMode::default(),
            default_lifetime: DEFAULT_LIFETIME,
            max_lifetime: MAX_LIFETIME,
            default_bandwidth: DEFAULT_BANDWIDTH,
            channel_bind_lifetime: DEFAULT_LIFETIME,
            nonce_lifetime: None,
            software: Some(format!(
                "{} {}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
            )),
            rfc3489: None,
            hmac_padding: HmacPadding::default(),
            require_channel_confirmation: false,
            short_term_secrets: ShortTermSecrets::random(),
        }
    }
}

/// [`Config`] configures the TURN Server.
pub struct Config<Auth> {
    /// List of all [STUN]/[TURN] transports listening for clients.
    ///
    /// [STUN]: https://en.wikipedia.org/wiki/STUN
    /// [TURN]: https://en.wikipedia.org/wiki/TURN
    pub connections: Vec<Arc<dyn Transport + Send + Sync>>,

    /// Allocator of relay sockets.
    pub relay: relay::Allocator,

    /// Callback used to handle incoming auth requests.
    pub auth_handler: Arc<Auth>,

    /// Protocol settings.
    pub server: ServerConfig,

    /// To receive notify on allocation close event, with metrics data.
    pub alloc_close_notify: Option<mpsc::Sender<AllocationInfo>>,
}

impl<Auth> fmt::Debug for Config<Auth> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field(
                "connections",
                &self
                    .connections
                    .iter()
                    .map(|c| c.local_tuple())
                    .collect::<Vec<_>>(),
            )
            .field("relay", &self.relay)
            .field("server", &self.server)
            .field("alloc_close_notify", &self.alloc_close_notify)
            .field("auth_handler", &"dyn AuthHandler")
            .finish()
    }
}
